//! Chunked upload of build artifacts into object storage

use std::path::Path;

use chrono::{DateTime, Utc};
use tokio::io::AsyncReadExt;

use crate::error::TransferError;
use crate::store::{ObjectLocation, UploadedPart};
use crate::TransferClient;

const MIB: u64 = 1024 * 1024;

/// An artifact stored in the bucket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedObject {
    pub image: String,
    pub object_name: String,
    pub size_bytes: u64,
    pub parts: u32,
}

/// `<name>-YYYYMMDD-HHMMSS.qcow2`
pub fn object_name(image: &str, at: DateTime<Utc>) -> String {
    format!("{}-{}.qcow2", image, at.format("%Y%m%d-%H%M%S"))
}

/// Number of parts for a file; an empty file still takes one.
pub fn part_count(size_bytes: u64, part_size: u64) -> u32 {
    let part_size = part_size.max(1);
    size_bytes.div_ceil(part_size).max(1) as u32
}

/// Percentage reported after `part` of `total`; the final part is always 100.
pub fn part_percent(part: u32, total: u32, size_bytes: u64) -> f64 {
    if part >= total || size_bytes == 0 {
        return 100.0;
    }
    let sent = u64::from(part) * (size_bytes / u64::from(total));
    sent as f64 / size_bytes as f64 * 100.0
}

impl TransferClient {
    /// Upload the artifacts of several images, sharing one timestamp.
    pub async fn upload(&self, images: &[String]) -> Result<Vec<UploadedObject>, TransferError> {
        let at = Utc::now();
        let mut uploaded = Vec::with_capacity(images.len());
        for image in images {
            uploaded.push(self.upload_as(image, object_name(image, at)).await?);
        }
        Ok(uploaded)
    }

    /// Upload `<work dir>/result-<image>/nixos.qcow2` under a fresh object name.
    pub async fn upload_image(&self, image: &str) -> Result<UploadedObject, TransferError> {
        self.upload_as(image, object_name(image, Utc::now())).await
    }

    async fn upload_as(
        &self,
        image: &str,
        object: String,
    ) -> Result<UploadedObject, TransferError> {
        let path = self.artifact_path(image);
        let size_bytes = match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => {
                return Err(TransferError::ArtifactNotFound {
                    image: image.to_string(),
                    path,
                });
            }
        };

        let location = ObjectLocation {
            namespace: self.namespace().await?,
            bucket: self.settings.bucket_name.clone(),
            object: object.clone(),
        };

        self.sink.info(&format!(
            "Uploading {} ({} MB) to bucket '{}'...",
            image,
            size_bytes / MIB,
            location.bucket
        ));
        self.sink.info(&format!("  Object name: {}", object));
        tracing::info!(image, object = %object, size_bytes, "starting upload");

        let multipart = self.store.supports_multipart() && size_bytes > self.settings.part_size;
        let parts = if multipart {
            self.upload_multipart(&location, &path, size_bytes).await
        } else {
            self.upload_single(&location, &path).await
        }
        .map_err(|source| TransferError::UploadFailed {
            object: object.clone(),
            source: Box::new(source),
        })?;

        if multipart {
            self.sink
                .info(&format!("  Upload complete (multipart): {}", object));
        } else {
            self.sink.info(&format!("  Upload complete: {}", object));
        }

        Ok(UploadedObject {
            image: image.to_string(),
            object_name: object,
            size_bytes,
            parts,
        })
    }

    async fn upload_single(
        &self,
        location: &ObjectLocation,
        path: &Path,
    ) -> Result<u32, TransferError> {
        let body = tokio::fs::read(path)
            .await
            .map_err(|source| TransferError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        self.settings
            .retry
            .run("put object", &self.cancel, self.sink.as_ref(), || {
                self.store.put_object(location, &body)
            })
            .await?;
        self.sink.info("  Part 1/1 complete (100.0%)");
        Ok(1)
    }

    async fn upload_multipart(
        &self,
        location: &ObjectLocation,
        path: &Path,
        size_bytes: u64,
    ) -> Result<u32, TransferError> {
        let upload_id = self
            .settings
            .retry
            .run(
                "create multipart upload",
                &self.cancel,
                self.sink.as_ref(),
                || self.store.create_multipart(location),
            )
            .await?;

        let result = match self.send_parts(location, &upload_id, path, size_bytes).await {
            Ok(parts) => self
                .settings
                .retry
                .run(
                    "commit multipart upload",
                    &self.cancel,
                    self.sink.as_ref(),
                    || self.store.commit_multipart(location, &upload_id, &parts),
                )
                .await
                .map(|()| parts.len() as u32),
            Err(err) => Err(err),
        };

        if result.is_err() {
            if let Err(abort_err) = self.store.abort_multipart(location, &upload_id).await {
                tracing::warn!(upload_id = %upload_id, error = %abort_err, "failed to abort multipart upload");
                self.sink.warn(&format!(
                    "  Failed to abort multipart upload {}: {}",
                    upload_id, abort_err
                ));
            }
        }
        result
    }

    async fn send_parts(
        &self,
        location: &ObjectLocation,
        upload_id: &str,
        path: &Path,
        size_bytes: u64,
    ) -> Result<Vec<UploadedPart>, TransferError> {
        let read_err = |source: std::io::Error| TransferError::Read {
            path: path.to_path_buf(),
            source,
        };
        let part_size = self.settings.part_size;
        let total = part_count(size_bytes, part_size);
        let mut file = tokio::fs::File::open(path).await.map_err(read_err)?;
        let mut parts = Vec::with_capacity(total as usize);
        let mut buf = Vec::with_capacity(part_size.min(size_bytes) as usize);

        for part_num in 1..=total {
            buf.clear();
            (&mut file)
                .take(part_size)
                .read_to_end(&mut buf)
                .await
                .map_err(read_err)?;

            let operation = format!("upload part {}/{}", part_num, total);
            let etag = match self
                .settings
                .retry
                .run(&operation, &self.cancel, self.sink.as_ref(), || {
                    self.store.upload_part(location, upload_id, part_num, &buf)
                })
                .await
            {
                Ok(etag) => etag,
                Err(err) => {
                    self.sink
                        .error(&format!("  Part {} error: {}", part_num, err));
                    return Err(err);
                }
            };
            parts.push(UploadedPart { part_num, etag });

            self.sink.info(&format!(
                "  Part {}/{} complete ({:.1}%)",
                part_num,
                total,
                part_percent(part_num, total, size_bytes)
            ));
        }

        Ok(parts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClientError;
    use crate::fakes::{FakeRegistry, FakeStore, settings};
    use chrono::TimeZone;
    use kiln_core::MemorySink;
    use std::sync::Arc;

    fn write_artifact(dir: &Path, image: &str, content: &[u8]) {
        let out = dir.join(format!("result-{}", image));
        std::fs::create_dir_all(&out).unwrap();
        std::fs::write(out.join("nixos.qcow2"), content).unwrap();
    }

    fn client(dir: &Path, store: Arc<FakeStore>, sink: Arc<MemorySink>) -> TransferClient {
        TransferClient::new(
            store,
            Arc::new(FakeRegistry::default()),
            settings(dir.to_path_buf()),
        )
        .with_sink(sink)
    }

    #[test]
    fn object_name_format() {
        let at = Utc.with_ymd_and_hms(2024, 1, 15, 12, 34, 56).unwrap();
        assert_eq!(object_name("headscale", at), "headscale-20240115-123456.qcow2");
    }

    #[test]
    fn percent_forces_last_part_to_full() {
        assert_eq!(part_count(10, 4), 3);
        assert_eq!(part_count(0, 4), 1);
        assert_eq!(part_percent(1, 3, 10), 30.0);
        assert_eq!(part_percent(2, 3, 10), 60.0);
        assert_eq!(part_percent(3, 3, 10), 100.0);
    }

    #[tokio::test]
    async fn missing_artifact_fails_before_any_call() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FakeStore::default());
        let c = client(dir.path(), store.clone(), Arc::new(MemorySink::new()));
        let err = c.upload_image("derp").await.unwrap_err();
        assert!(matches!(err, TransferError::ArtifactNotFound { ref image, .. } if image == "derp"));
        assert!(store.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn multipart_upload_sends_chunks_in_order() {
        let dir = tempfile::tempdir().unwrap();
        write_artifact(dir.path(), "derp", b"0123456789");
        let store = Arc::new(FakeStore::default());
        let sink = Arc::new(MemorySink::new());
        let c = client(dir.path(), store.clone(), sink.clone());

        let uploaded = c.upload_image("derp").await.unwrap();
        assert_eq!(uploaded.size_bytes, 10);
        assert_eq!(uploaded.parts, 3);
        assert!(uploaded.object_name.starts_with("derp-"));
        assert!(uploaded.object_name.ends_with(".qcow2"));

        let parts = store.parts.lock().unwrap().clone();
        assert_eq!(
            parts,
            vec![
                (1, b"0123".to_vec()),
                (2, b"4567".to_vec()),
                (3, b"89".to_vec())
            ]
        );
        assert_eq!(store.committed.lock().unwrap().len(), 3);
        assert_eq!(store.calls_named("abort"), 0);
        assert!(sink.contains("Part 3/3 complete (100.0%)"));
        assert!(sink.contains("Upload complete (multipart)"));
    }

    #[tokio::test]
    async fn small_artifact_uses_single_put() {
        let dir = tempfile::tempdir().unwrap();
        write_artifact(dir.path(), "derp", b"abc");
        let store = Arc::new(FakeStore::default());
        let c = client(dir.path(), store.clone(), Arc::new(MemorySink::new()));

        let uploaded = c.upload_image("derp").await.unwrap();
        assert_eq!(uploaded.parts, 1);
        assert_eq!(store.single_put.lock().unwrap().as_deref(), Some(&b"abc"[..]));
        assert_eq!(store.calls_named("create"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_part_error_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        write_artifact(dir.path(), "derp", b"0123456789");
        let store = Arc::new(FakeStore::default());
        store.fail_part(2, 503, 2);
        let c = client(dir.path(), store.clone(), Arc::new(MemorySink::new()));

        let uploaded = c.upload_image("derp").await.unwrap();
        assert_eq!(uploaded.parts, 3);
        assert_eq!(store.calls_named("part"), 5);
        assert_eq!(store.calls_named("commit"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_final_part_aborts_the_upload() {
        let dir = tempfile::tempdir().unwrap();
        write_artifact(dir.path(), "derp", b"0123456789");
        let store = Arc::new(FakeStore::default());
        store.fail_part(3, 500, u32::MAX);
        let sink = Arc::new(MemorySink::new());
        let c = client(dir.path(), store.clone(), sink.clone());

        let err = c.upload_image("derp").await.unwrap_err();
        match err {
            TransferError::UploadFailed { source, .. } => assert!(matches!(
                *source,
                TransferError::TransientNetwork { attempts: 5, .. }
            )),
            other => panic!("expected UploadFailed, got {:?}", other),
        }
        assert_eq!(store.calls_named("abort"), 1);
        assert_eq!(store.calls_named("commit"), 0);
        assert!(sink.contains("Part 3 error"));
    }

    #[tokio::test]
    async fn permanent_part_error_aborts_without_retry() {
        let dir = tempfile::tempdir().unwrap();
        write_artifact(dir.path(), "derp", b"0123456789");
        let store = Arc::new(FakeStore::default());
        store.fail_part(1, 403, 1);
        let c = client(dir.path(), store.clone(), Arc::new(MemorySink::new()));

        let err = c.upload_image("derp").await.unwrap_err();
        assert!(matches!(
            err,
            TransferError::UploadFailed { ref source, .. }
                if matches!(**source, TransferError::Api { source: ClientError::ApiError { status: 403, .. }, .. })
        ));
        assert_eq!(store.calls_named("part"), 1);
        assert_eq!(store.calls_named("abort"), 1);
    }

    #[tokio::test]
    async fn batch_upload_shares_a_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        write_artifact(dir.path(), "a", b"x");
        write_artifact(dir.path(), "b", b"y");
        let store = Arc::new(FakeStore::default());
        let c = client(dir.path(), store.clone(), Arc::new(MemorySink::new()));

        let uploaded = c.upload(&["a".to_string(), "b".to_string()]).await.unwrap();
        let suffix = |o: &UploadedObject| o.object_name.split_once('-').map(|(_, s)| s.to_string());
        assert_eq!(suffix(&uploaded[0]), suffix(&uploaded[1]));
        assert_eq!(store.calls_named("namespace"), 1);
    }
}

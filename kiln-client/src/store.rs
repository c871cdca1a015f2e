//! Object storage seam and its HTTP implementation

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ClientError, Result};
use crate::http::{self, Endpoint};

/// Where an object lives in the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectLocation {
    pub namespace: String,
    pub bucket: String,
    pub object: String,
}

/// A committed multipart part
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedPart {
    pub part_num: u32,
    pub etag: String,
}

/// Object storage operations the upload protocol needs
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Namespace the buckets of this tenancy live in.
    async fn namespace(&self) -> Result<String>;

    /// Whether chunked uploads are available; a single put is used otherwise.
    fn supports_multipart(&self) -> bool {
        true
    }

    async fn put_object(&self, location: &ObjectLocation, body: &[u8]) -> Result<()>;

    /// Start a multipart upload and return its upload id.
    async fn create_multipart(&self, location: &ObjectLocation) -> Result<String>;

    /// Upload one part (1-based) and return its ETag.
    async fn upload_part(
        &self,
        location: &ObjectLocation,
        upload_id: &str,
        part_num: u32,
        body: &[u8],
    ) -> Result<String>;

    async fn commit_multipart(
        &self,
        location: &ObjectLocation,
        upload_id: &str,
        parts: &[UploadedPart],
    ) -> Result<()>;

    async fn abort_multipart(&self, location: &ObjectLocation, upload_id: &str) -> Result<()>;
}

/// Object storage over the OCI-style REST API
///
/// Paths follow `/n/{namespace}/b/{bucket}/o/{object}` for objects and
/// `/n/{namespace}/b/{bucket}/u` for multipart uploads.
#[derive(Debug, Clone)]
pub struct HttpObjectStore {
    endpoint: Endpoint,
}

#[derive(Serialize)]
struct CreateMultipartBody<'a> {
    object: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MultipartUpload {
    upload_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CommitBody<'a> {
    parts_to_commit: &'a [UploadedPart],
}

impl HttpObjectStore {
    /// Create a store client
    ///
    /// The underlying HTTP client has no overall timeout since a single
    /// 64 MiB part can take minutes on a slow uplink.
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self::with_client(base_url, token, reqwest::Client::new())
    }

    pub fn with_client(
        base_url: impl Into<String>,
        token: Option<String>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            endpoint: Endpoint::new(base_url, token, client),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.endpoint.base_url
    }

    /// `/n/{namespace}/b/{bucket}/{kind}/{object}`
    fn object_url(&self, location: &ObjectLocation, kind: &str) -> Result<reqwest::Url> {
        self.endpoint.url([
            "n",
            location.namespace.as_str(),
            "b",
            location.bucket.as_str(),
            kind,
            location.object.as_str(),
        ])
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn namespace(&self) -> Result<String> {
        let request = self.endpoint.client.get(self.endpoint.url(["n", ""])?);
        let response = self.endpoint.authorize(request).send().await?;
        http::json(response).await
    }

    async fn put_object(&self, location: &ObjectLocation, body: &[u8]) -> Result<()> {
        let url = self.object_url(location, "o")?;
        let request = self.endpoint.client.put(url).body(body.to_vec());
        let response = self.endpoint.authorize(request).send().await?;
        http::check(response).await?;
        Ok(())
    }

    async fn create_multipart(&self, location: &ObjectLocation) -> Result<String> {
        let url = self.endpoint.url([
            "n",
            location.namespace.as_str(),
            "b",
            location.bucket.as_str(),
            "u",
        ])?;
        let request = self.endpoint.client.post(url).json(&CreateMultipartBody {
            object: &location.object,
        });
        let response = self.endpoint.authorize(request).send().await?;
        let upload: MultipartUpload = http::json(response).await?;
        Ok(upload.upload_id)
    }

    async fn upload_part(
        &self,
        location: &ObjectLocation,
        upload_id: &str,
        part_num: u32,
        body: &[u8],
    ) -> Result<String> {
        let url = self.object_url(location, "u")?;
        let request = self
            .endpoint
            .client
            .put(url)
            .query(&[
                ("uploadId", upload_id.to_string()),
                ("uploadPartNum", part_num.to_string()),
            ])
            .body(body.to_vec());
        let response = http::check(self.endpoint.authorize(request).send().await?).await?;
        response
            .headers()
            .get("etag")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string())
            .ok_or_else(|| ClientError::ParseError(format!("part {} has no ETag", part_num)))
    }

    async fn commit_multipart(
        &self,
        location: &ObjectLocation,
        upload_id: &str,
        parts: &[UploadedPart],
    ) -> Result<()> {
        let url = self.object_url(location, "u")?;
        let request = self
            .endpoint
            .client
            .post(url)
            .query(&[("uploadId", upload_id)])
            .json(&CommitBody {
                parts_to_commit: parts,
            });
        let response = self.endpoint.authorize(request).send().await?;
        http::check(response).await?;
        Ok(())
    }

    async fn abort_multipart(&self, location: &ObjectLocation, upload_id: &str) -> Result<()> {
        let url = self.object_url(location, "u")?;
        let request = self
            .endpoint
            .client
            .delete(url)
            .query(&[("uploadId", upload_id)]);
        let response = self.endpoint.authorize(request).send().await?;
        http::check(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn location() -> ObjectLocation {
        ObjectLocation {
            namespace: "tenancy".into(),
            bucket: "images".into(),
            object: "derp-20240115-123456.qcow2".into(),
        }
    }

    #[test]
    fn trims_trailing_slash() {
        let store = HttpObjectStore::new("http://localhost:8080/", None);
        assert_eq!(store.base_url(), "http://localhost:8080");
    }

    #[tokio::test]
    async fn namespace_sends_bearer_token() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/n/")
            .match_header("authorization", "Bearer secret")
            .with_status(200)
            .with_body("\"tenancy\"")
            .create_async()
            .await;

        let store = HttpObjectStore::new(server.url(), Some("secret".into()));
        assert_eq!(store.namespace().await.unwrap(), "tenancy");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn multipart_round() {
        let mut server = mockito::Server::new_async().await;
        let create = server
            .mock("POST", "/n/tenancy/b/images/u")
            .match_body(Matcher::Json(serde_json::json!({"object": "derp-20240115-123456.qcow2"})))
            .with_status(200)
            .with_body(r#"{"uploadId":"up-1","object":"derp-20240115-123456.qcow2"}"#)
            .create_async()
            .await;
        let part = server
            .mock("PUT", "/n/tenancy/b/images/u/derp-20240115-123456.qcow2")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("uploadId".into(), "up-1".into()),
                Matcher::UrlEncoded("uploadPartNum".into(), "1".into()),
            ]))
            .match_body("chunk")
            .with_status(200)
            .with_header("etag", "etag-1")
            .create_async()
            .await;
        let commit = server
            .mock("POST", "/n/tenancy/b/images/u/derp-20240115-123456.qcow2")
            .match_query(Matcher::UrlEncoded("uploadId".into(), "up-1".into()))
            .match_body(Matcher::Json(serde_json::json!({
                "partsToCommit": [{"partNum": 1, "etag": "etag-1"}]
            })))
            .with_status(200)
            .create_async()
            .await;

        let store = HttpObjectStore::new(server.url(), None);
        let loc = location();
        let upload_id = store.create_multipart(&loc).await.unwrap();
        assert_eq!(upload_id, "up-1");
        let etag = store.upload_part(&loc, &upload_id, 1, b"chunk").await.unwrap();
        store
            .commit_multipart(&loc, &upload_id, &[UploadedPart { part_num: 1, etag }])
            .await
            .unwrap();

        create.assert_async().await;
        part.assert_async().await;
        commit.assert_async().await;
    }

    #[tokio::test]
    async fn error_status_carries_body() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("PUT", "/n/tenancy/b/images/o/derp-20240115-123456.qcow2")
            .with_status(503)
            .with_body("try later")
            .create_async()
            .await;

        let store = HttpObjectStore::new(server.url(), None);
        let err = store.put_object(&location(), b"data").await.unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(err, ClientError::ApiError { status: 503, ref message } if message == "try later"));
    }
}

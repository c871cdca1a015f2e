//! In-memory object store and registry used by the unit tests

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{ClientError, Result};
use crate::registry::{CreateImageRequest, ImageRegistry, ImageState, ImageSummary};
use crate::retry::RetryPolicy;
use crate::store::{ObjectLocation, ObjectStore, UploadedPart};
use crate::TransferSettings;

pub fn settings(work_dir: PathBuf) -> TransferSettings {
    TransferSettings {
        compartment_id: "ocid1.compartment.test".into(),
        bucket_name: "images".into(),
        namespace: None,
        work_dir,
        part_size: 4,
        initial_delay: Duration::from_secs(30),
        poll_interval: Duration::from_secs(30),
        max_wait: Duration::from_secs(1800),
        retry: RetryPolicy::new(5, Duration::from_secs(10)),
    }
}

#[derive(Default)]
pub struct FakeStore {
    pub calls: Mutex<Vec<String>>,
    pub parts: Mutex<Vec<(u32, Vec<u8>)>>,
    pub committed: Mutex<Vec<UploadedPart>>,
    pub single_put: Mutex<Option<Vec<u8>>>,
    /// Part number that fails with the given status, and how many times.
    pub failing_part: Mutex<Option<(u32, u16, u32)>>,
    pub no_multipart: bool,
}

impl FakeStore {
    pub fn fail_part(&self, part: u32, status: u16, times: u32) {
        *self.failing_part.lock().unwrap() = Some((part, status, times));
    }

    pub fn calls_named(&self, name: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.as_str() == name)
            .count()
    }

    fn record(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
    }
}

#[async_trait]
impl ObjectStore for FakeStore {
    async fn namespace(&self) -> Result<String> {
        self.record("namespace");
        Ok("tenancy".into())
    }

    fn supports_multipart(&self) -> bool {
        !self.no_multipart
    }

    async fn put_object(&self, _location: &ObjectLocation, body: &[u8]) -> Result<()> {
        self.record("put");
        *self.single_put.lock().unwrap() = Some(body.to_vec());
        Ok(())
    }

    async fn create_multipart(&self, _location: &ObjectLocation) -> Result<String> {
        self.record("create");
        Ok("upload-1".into())
    }

    async fn upload_part(
        &self,
        _location: &ObjectLocation,
        _upload_id: &str,
        part_num: u32,
        body: &[u8],
    ) -> Result<String> {
        self.record("part");
        let mut failing = self.failing_part.lock().unwrap();
        if let Some((part, status, remaining)) = failing.as_mut() {
            if *part == part_num && *remaining > 0 {
                *remaining -= 1;
                return Err(ClientError::api_error(*status, "injected"));
            }
        }
        self.parts.lock().unwrap().push((part_num, body.to_vec()));
        Ok(format!("etag-{}", part_num))
    }

    async fn commit_multipart(
        &self,
        _location: &ObjectLocation,
        _upload_id: &str,
        parts: &[UploadedPart],
    ) -> Result<()> {
        self.record("commit");
        *self.committed.lock().unwrap() = parts.to_vec();
        Ok(())
    }

    async fn abort_multipart(&self, _location: &ObjectLocation, _upload_id: &str) -> Result<()> {
        self.record("abort");
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeRegistry {
    pub created: Mutex<Vec<CreateImageRequest>>,
    /// States returned by successive lookups; the last one repeats.
    pub states: Mutex<VecDeque<ImageState>>,
    pub lookups: Mutex<u32>,
}

impl FakeRegistry {
    pub fn with_states(states: impl IntoIterator<Item = ImageState>) -> Self {
        Self {
            states: Mutex::new(states.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn lookups(&self) -> u32 {
        *self.lookups.lock().unwrap()
    }
}

#[async_trait]
impl ImageRegistry for FakeRegistry {
    async fn create_image(&self, request: &CreateImageRequest) -> Result<String> {
        let mut created = self.created.lock().unwrap();
        created.push(request.clone());
        Ok(format!("ocid1.image.{}", created.len()))
    }

    async fn image_state(&self, _image_id: &str) -> Result<ImageState> {
        *self.lookups.lock().unwrap() += 1;
        let mut states = self.states.lock().unwrap();
        let state = if states.len() > 1 {
            states.pop_front()
        } else {
            states.front().cloned()
        };
        Ok(state.unwrap_or(ImageState::Available))
    }

    async fn list_images(
        &self,
        _compartment_id: &str,
        _prefix: Option<&str>,
    ) -> Result<Vec<ImageSummary>> {
        Ok(Vec::new())
    }
}

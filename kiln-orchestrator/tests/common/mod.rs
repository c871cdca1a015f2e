//! Doubles for the pipeline ports

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use kiln_builder::{BuildError, BuildResult};
use kiln_client::{ImportedImage, TransferError, UploadedObject, artifact_path};
use kiln_core::{Arch, ImageDefinition};
use kiln_orchestrator::{BuildBackend, ImageTransfer, Pipeline, StateStore};

pub const ARTIFACT: &[u8] = b"QFI\xfb qcow2 image bytes";

pub fn catalog() -> Vec<ImageDefinition> {
    let mut b = ImageDefinition::new("b", "oci-b-image", Arch::X86_64);
    b.output_var = Some("b_image".to_string());
    vec![ImageDefinition::new("a", "oci-a-image", Arch::X86_64), b]
}

pub fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

pub fn state_path(dir: &Path) -> PathBuf {
    dir.join("cache").join("state.toml")
}

pub fn pipeline(dir: &Path) -> Pipeline<FakeBackend, FakeTransfer> {
    Pipeline::new(
        FakeBackend::new(dir),
        FakeTransfer::new(dir),
        StateStore::new(state_path(dir)),
        catalog(),
    )
}

/// Reopen the state file the way a restarted process would.
pub fn restarted(dir: &Path) -> Pipeline<FakeBackend, FakeTransfer> {
    Pipeline::new(
        FakeBackend::new(dir),
        FakeTransfer::new(dir),
        StateStore::open(state_path(dir)).unwrap(),
        catalog(),
    )
}

/// Writes `result-<name>/nixos.qcow2` under the work dir.
pub struct FakeBackend {
    work_dir: PathBuf,
    built: Mutex<Vec<String>>,
    fail: Mutex<Option<String>>,
}

impl FakeBackend {
    pub fn new(work_dir: &Path) -> Self {
        Self {
            work_dir: work_dir.to_path_buf(),
            built: Mutex::new(Vec::new()),
            fail: Mutex::new(None),
        }
    }

    pub fn fail_on(&self, image: &str) {
        *self.fail.lock().unwrap() = Some(image.to_string());
    }

    pub fn built(&self) -> Vec<String> {
        self.built.lock().unwrap().clone()
    }
}

#[async_trait]
impl BuildBackend for FakeBackend {
    async fn build_image(&self, image: &ImageDefinition) -> Result<BuildResult, BuildError> {
        if self.fail.lock().unwrap().as_deref() == Some(image.name.as_str()) {
            return Err(BuildError::BuilderNotConfigured {
                image: image.name.clone(),
                arch: image.arch,
            });
        }
        let path = artifact_path(&self.work_dir, &image.name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, ARTIFACT).unwrap();
        self.built.lock().unwrap().push(image.name.clone());
        Ok(BuildResult {
            image_name: image.name.clone(),
            output_path: path,
            size_bytes: ARTIFACT.len() as u64,
        })
    }
}

/// Uploads by checking the artifact exists; images become available at once.
pub struct FakeTransfer {
    work_dir: PathBuf,
    uploaded: Mutex<Vec<String>>,
    imported: Mutex<Vec<String>>,
    waited: Mutex<Vec<String>>,
    fail_wait: Mutex<Option<String>>,
}

impl FakeTransfer {
    pub fn new(work_dir: &Path) -> Self {
        Self {
            work_dir: work_dir.to_path_buf(),
            uploaded: Mutex::new(Vec::new()),
            imported: Mutex::new(Vec::new()),
            waited: Mutex::new(Vec::new()),
            fail_wait: Mutex::new(None),
        }
    }

    pub fn fail_wait_on(&self, image: &str) {
        *self.fail_wait.lock().unwrap() = Some(image.to_string());
    }

    pub fn uploaded(&self) -> Vec<String> {
        self.uploaded.lock().unwrap().clone()
    }

    pub fn imported(&self) -> Vec<String> {
        self.imported.lock().unwrap().clone()
    }

    pub fn waited(&self) -> Vec<String> {
        self.waited.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImageTransfer for FakeTransfer {
    fn artifact_path(&self, image: &str) -> PathBuf {
        artifact_path(&self.work_dir, image)
    }

    async fn upload_image(&self, image: &str) -> Result<UploadedObject, TransferError> {
        let path = self.artifact_path(image);
        let size_bytes = std::fs::metadata(&path)
            .map_err(|_| TransferError::ArtifactNotFound {
                image: image.to_string(),
                path: path.clone(),
            })?
            .len();
        self.uploaded.lock().unwrap().push(image.to_string());
        Ok(UploadedObject {
            image: image.to_string(),
            object_name: format!("{}-20240115-123456.qcow2", image),
            size_bytes,
            parts: 1,
        })
    }

    async fn import_object(
        &self,
        image: &str,
        object_name: &str,
    ) -> Result<ImportedImage, TransferError> {
        self.imported.lock().unwrap().push(image.to_string());
        Ok(ImportedImage {
            image: image.to_string(),
            object_name: object_name.to_string(),
            image_id: format!("ocid1.image.{}", image),
        })
    }

    async fn wait_for_image(&self, image: &str, _image_id: &str) -> Result<(), TransferError> {
        self.waited.lock().unwrap().push(image.to_string());
        if self.fail_wait.lock().unwrap().as_deref() == Some(image) {
            return Err(TransferError::ImportTimeout {
                image: image.to_string(),
                elapsed_secs: 1800,
            });
        }
        Ok(())
    }
}

//! Configuration file
//!
//! The config is a TOML file with a `[storage]` table (object storage and
//! compute registry settings), an optional `[remote_builder]` table for
//! foreign-architecture builds, and an `[[images]]` array.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::image::{Arch, ImageDefinition};

/// File name searched in the working directory and under `scripts/`.
pub const CONFIG_FILE_NAME: &str = "kiln.toml";

pub const DEFAULT_AUTH_TOKEN_ENV: &str = "KILN_AUTH_TOKEN";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found (searched: {}). Run 'kiln init' to create one", display_paths(.searched))]
    NotFound { searched: Vec<PathBuf> },

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("unknown image '{name}' (configured: {})", .known.join(", "))]
    UnknownImage { name: String, known: Vec<String> },

    #[error("config file already exists at {0}")]
    AlreadyExists(PathBuf),

    #[error("cannot determine the user config directory")]
    NoConfigDir,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Object storage and image registry settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub compartment_id: String,
    pub bucket_name: String,
    pub region: String,
    /// Object storage namespace; looked up from the service when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_storage_endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compute_endpoint: Option<String>,
    /// Environment variable holding the bearer token.
    pub auth_token_env: String,
    pub poll_interval_secs: u64,
    pub max_wait_secs: u64,
    pub initial_delay_secs: u64,
    pub part_size_mib: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            compartment_id: String::new(),
            bucket_name: String::new(),
            region: String::new(),
            namespace: None,
            object_storage_endpoint: None,
            compute_endpoint: None,
            auth_token_env: DEFAULT_AUTH_TOKEN_ENV.to_string(),
            poll_interval_secs: 30,
            max_wait_secs: 1800,
            initial_delay_secs: 30,
            part_size_mib: 64,
        }
    }
}

impl StorageConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }

    pub fn part_size_bytes(&self) -> u64 {
        self.part_size_mib * 1024 * 1024
    }

    pub fn object_storage_url(&self) -> String {
        self.object_storage_endpoint.clone().unwrap_or_else(|| {
            format!("https://objectstorage.{}.oraclecloud.com", self.region)
        })
    }

    pub fn compute_url(&self) -> String {
        self.compute_endpoint
            .clone()
            .unwrap_or_else(|| format!("https://iaas.{}.oraclecloud.com", self.region))
    }
}

/// Remote machine used for foreign-architecture builds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteBuilderConfig {
    pub host: String,
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key: Option<String>,
    pub repo_path: String,
    /// The host is a macOS machine that builds inside its Linux builder VM.
    #[serde(default)]
    pub is_macos: bool,
    #[serde(default = "default_vm_port")]
    pub vm_port: u16,
    #[serde(default = "default_vm_user")]
    pub vm_user: String,
    #[serde(default = "default_vm_key_path")]
    pub vm_key_path: String,
}

fn default_vm_port() -> u16 {
    31022
}

fn default_vm_user() -> String {
    "builder".to_string()
}

fn default_vm_key_path() -> String {
    "/etc/nix/builder_ed25519".to_string()
}

impl RemoteBuilderConfig {
    /// `user@host`
    pub fn ssh_target(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Local ssh key with a leading `~` expanded.
    pub fn ssh_key_path(&self) -> Option<PathBuf> {
        self.ssh_key
            .as_deref()
            .filter(|key| !key.is_empty())
            .map(expand_home)
    }
}

/// Expand a leading `~/` against the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ if path == "~" => dirs::home_dir().unwrap_or_else(|| PathBuf::from(path)),
        _ => PathBuf::from(path),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_builder: Option<RemoteBuilderConfig>,
    #[serde(default = "default_images")]
    pub images: Vec<ImageDefinition>,
}

/// Images used when the config declares none.
pub fn default_images() -> Vec<ImageDefinition> {
    [
        ("headscale", "oci-headscale-image", Arch::X86_64),
        ("keycloak", "oci-keycloak-image", Arch::Aarch64),
        ("derp", "oci-derp-east-image", Arch::Aarch64),
    ]
    .into_iter()
    .map(|(name, target, arch)| ImageDefinition {
        output_var: Some(format!("{}_image_ocid", name)),
        ..ImageDefinition::new(name, target, arch)
    })
    .collect()
}

impl Config {
    /// Parse and validate a config document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `explicit`, or from the first existing default location.
    ///
    /// Returns the config together with the path it was read from.
    pub fn load(explicit: Option<&Path>) -> Result<(Self, PathBuf), ConfigError> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => {
                let searched = search_paths();
                searched
                    .iter()
                    .find(|p| p.is_file())
                    .cloned()
                    .ok_or(ConfigError::NotFound { searched })?
            }
        };

        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "loading config");
        let config = Self::from_toml_str(&content)?;
        Ok((config, path))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("storage.compartment_id", &self.storage.compartment_id),
            ("storage.bucket_name", &self.storage.bucket_name),
            ("storage.region", &self.storage.region),
        ];
        for (key, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("{} is required", key)));
            }
        }
        if self.storage.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "storage.poll_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.storage.part_size_mib == 0 {
            return Err(ConfigError::Invalid(
                "storage.part_size_mib must be greater than zero".to_string(),
            ));
        }
        if self.images.is_empty() {
            return Err(ConfigError::Invalid("no images configured".to_string()));
        }

        let mut seen = HashSet::new();
        for image in &self.images {
            if image.name.trim().is_empty() {
                return Err(ConfigError::Invalid("image name cannot be empty".to_string()));
            }
            if image.name.contains('-') {
                return Err(ConfigError::Invalid(format!(
                    "image name '{}' cannot contain '-'",
                    image.name
                )));
            }
            if image.build_target.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "image '{}' has no build_target",
                    image.name
                )));
            }
            if !seen.insert(image.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "image '{}' is defined more than once",
                    image.name
                )));
            }
        }

        let host = Arch::host();
        if self.remote_builder.is_none() && self.images.iter().any(|i| !i.is_native(host)) {
            tracing::warn!(
                "foreign-architecture images are configured but [remote_builder] is not; use --local-only to build them here"
            );
        }
        Ok(())
    }

    pub fn image(&self, name: &str) -> Option<&ImageDefinition> {
        self.images.iter().find(|img| img.name == name)
    }

    pub fn image_names(&self) -> Vec<String> {
        self.images.iter().map(|img| img.name.clone()).collect()
    }

    /// Resolve operator-supplied names; an empty list selects every image.
    pub fn select_images(&self, names: &[String]) -> Result<Vec<ImageDefinition>, ConfigError> {
        if names.is_empty() {
            return Ok(self.images.clone());
        }
        names
            .iter()
            .map(|name| {
                self.image(name)
                    .cloned()
                    .ok_or_else(|| ConfigError::UnknownImage {
                        name: name.clone(),
                        known: self.image_names(),
                    })
            })
            .collect()
    }
}

/// Default search order: `kiln.toml`, `scripts/kiln.toml`, then the user config dir.
pub fn search_paths() -> Vec<PathBuf> {
    let mut paths = vec![
        PathBuf::from(CONFIG_FILE_NAME),
        Path::new("scripts").join(CONFIG_FILE_NAME),
    ];
    if let Some(path) = user_config_path() {
        paths.push(path);
    }
    paths
}

/// `<config dir>/kiln/config.toml`
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("kiln").join("config.toml"))
}

/// Write the commented template to `target` (default: the user config path).
///
/// Never overwrites an existing file.
pub fn init_config_file(target: Option<&Path>) -> Result<PathBuf, ConfigError> {
    let path = match target {
        Some(path) => path.to_path_buf(),
        None => user_config_path().ok_or(ConfigError::NoConfigDir)?,
    };
    if path.exists() {
        return Err(ConfigError::AlreadyExists(path));
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(&path, CONFIG_TEMPLATE)?;
    Ok(path)
}

pub const CONFIG_TEMPLATE: &str = r#"# kiln configuration

[storage]
# Required: compartment the images are registered in
compartment_id = "ocid1.compartment.oc1..example"

# Object storage bucket receiving the uploads
bucket_name = "nixos-images"

# Region (e.g. us-ashburn-1, us-phoenix-1)
region = "us-ashburn-1"

# Optional: object storage namespace, looked up when omitted
# namespace = "mytenancy"

# Environment variable holding the API bearer token
auth_token_env = "KILN_AUTH_TOKEN"

# Import polling
poll_interval_secs = 30
max_wait_secs = 1800
initial_delay_secs = 30

# Multipart upload chunk size
part_size_mib = 64

# Remote builder for foreign-architecture images (omit and use --local-only to build here)
# [remote_builder]
# host = "192.168.1.100"
# user = "builder"
# ssh_key = "~/.ssh/id_ed25519"
# repo_path = "~/image-builds"
# is_macos = false
# vm_port = 31022
# vm_user = "builder"
# vm_key_path = "/etc/nix/builder_ed25519"

[[images]]
name = "headscale"
build_target = "oci-headscale-image"
arch = "x86_64"
output_var = "headscale_image_ocid"

[[images]]
name = "keycloak"
build_target = "oci-keycloak-image"
arch = "aarch64"
output_var = "keycloak_image_ocid"

[[images]]
name = "derp"
build_target = "oci-derp-east-image"
arch = "aarch64"
output_var = "derp_image_ocid"
"#;

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[storage]
compartment_id = "ocid1.compartment.oc1..test"
bucket_name = "images"
region = "eu-frankfurt-1"
"#;

    #[test]
    fn template_parses_and_validates() {
        let config = Config::from_toml_str(CONFIG_TEMPLATE).unwrap();
        assert_eq!(config.image_names(), vec!["headscale", "keycloak", "derp"]);
        assert!(config.remote_builder.is_none());
    }

    #[test]
    fn storage_defaults_apply() {
        let config = Config::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.storage.poll_interval(), Duration::from_secs(30));
        assert_eq!(config.storage.max_wait(), Duration::from_secs(1800));
        assert_eq!(config.storage.initial_delay(), Duration::from_secs(30));
        assert_eq!(config.storage.part_size_bytes(), 64 * 1024 * 1024);
        assert_eq!(config.storage.auth_token_env, DEFAULT_AUTH_TOKEN_ENV);
        assert_eq!(
            config.storage.object_storage_url(),
            "https://objectstorage.eu-frankfurt-1.oraclecloud.com"
        );
    }

    #[test]
    fn missing_images_fall_back_to_defaults() {
        let config = Config::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.images, default_images());
        assert_eq!(
            config.image("derp").map(|i| i.arch),
            Some(Arch::Aarch64)
        );
    }

    #[test]
    fn required_storage_fields_are_enforced() {
        let err = Config::from_toml_str("[storage]\nbucket_name = \"b\"\nregion = \"r\"\n")
            .unwrap_err();
        assert!(err.to_string().contains("storage.compartment_id"));
    }

    #[test]
    fn duplicate_image_names_are_rejected() {
        let doc = format!(
            "{}\n[[images]]\nname = \"a\"\nbuild_target = \"t\"\narch = \"x86_64\"\n\n[[images]]\nname = \"a\"\nbuild_target = \"u\"\narch = \"aarch64\"\n",
            MINIMAL
        );
        let err = Config::from_toml_str(&doc).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("more than once")));
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let doc = MINIMAL.replace(
            "region = \"eu-frankfurt-1\"",
            "region = \"eu-frankfurt-1\"\npoll_interval_secs = 0",
        );
        assert!(Config::from_toml_str(&doc).is_err());
    }

    #[test]
    fn remote_builder_defaults() {
        let doc = format!(
            "{}\n[remote_builder]\nhost = \"mac.local\"\nuser = \"me\"\nrepo_path = \"~/builds\"\nis_macos = true\n",
            MINIMAL
        );
        let config = Config::from_toml_str(&doc).unwrap();
        let builder = config.remote_builder.unwrap();
        assert_eq!(builder.vm_port, 31022);
        assert_eq!(builder.vm_user, "builder");
        assert_eq!(builder.vm_key_path, "/etc/nix/builder_ed25519");
        assert_eq!(builder.ssh_target(), "me@mac.local");
        assert!(builder.ssh_key_path().is_none());
    }

    #[test]
    fn select_images_rejects_unknown_names() {
        let config = Config::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.select_images(&[]).unwrap().len(), 3);
        let picked = config.select_images(&["derp".to_string()]).unwrap();
        assert_eq!(picked[0].build_target, "oci-derp-east-image");
        let err = config.select_images(&["nope".to_string()]).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownImage { name, .. } if name == "nope"));
    }

    #[test]
    fn init_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("kiln.toml");
        let written = init_config_file(Some(&path)).unwrap();
        assert_eq!(written, path);

        let (config, from) = Config::load(Some(&path)).unwrap();
        assert_eq!(from, path);
        assert_eq!(config.images.len(), 3);

        assert!(matches!(
            init_config_file(Some(&path)),
            Err(ConfigError::AlreadyExists(_))
        ));
    }

    #[test]
    fn expand_home_leaves_absolute_paths() {
        assert_eq!(expand_home("/etc/nix/key"), PathBuf::from("/etc/nix/key"));
    }
}

//! Startup configuration for the `methings` binary (spec §1 ambient stack): a TOML
//! file merged over built-in defaults, following the teacher's config-loading shape
//! but scoped to what this crate's gateway actually needs to bind and wire up.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{MethingsError, Result};

/// Resolved on-disk base directory: holds the sqlite database and the sandboxed
/// filesystem-tool user root.
fn default_base_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".methings")
}

fn default_bind_host() -> String {
    "127.0.0.1".to_string()
}

const fn default_bind_port() -> u16 {
    8765
}

fn default_device_api_url() -> String {
    "http://127.0.0.1:8766".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub bind_host: String,
    pub bind_port: u16,
    pub base_dir: PathBuf,
    /// Base URL of the device-API peer app (spec §4.E); not this crate's own gateway.
    pub device_api_url: String,
    /// Base URL of the cloud-request peer app (spec §4.F).
    pub cloud_request_url: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_host: default_bind_host(),
            bind_port: default_bind_port(),
            base_dir: default_base_dir(),
            device_api_url: default_device_api_url(),
            cloud_request_url: default_device_api_url(),
        }
    }
}

impl AppConfig {
    pub fn db_path(&self) -> PathBuf {
        self.base_dir.join("methings.db")
    }

    pub fn user_root(&self) -> PathBuf {
        self.base_dir.join("workspace")
    }

    /// Load the TOML config file at `path` (if it exists) merged over defaults.
    /// A missing file is not an error; it just yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = Self::default();
        if !path.exists() {
            return Ok(config);
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| MethingsError::Config(format!("reading {}: {e}", path.display())))?;
        let file: PartialAppConfig = toml::from_str(&raw)
            .map_err(|e| MethingsError::Config(format!("parsing {}: {e}", path.display())))?;
        file.apply(&mut config);
        Ok(config)
    }

    /// Default config file path: `~/.methings/config.toml`, overridable via
    /// `METHINGS_CONFIG` (spec §1 ambient stack).
    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var("METHINGS_CONFIG") {
            return PathBuf::from(path);
        }
        default_base_dir().join("config.toml")
    }
}

/// Every field optional, so a config file only needs to mention what it overrides.
#[derive(Debug, Default, Deserialize)]
struct PartialAppConfig {
    bind_host: Option<String>,
    bind_port: Option<u16>,
    base_dir: Option<PathBuf>,
    device_api_url: Option<String>,
    cloud_request_url: Option<String>,
}

impl PartialAppConfig {
    fn apply(self, config: &mut AppConfig) {
        if let Some(v) = self.bind_host {
            config.bind_host = v;
        }
        if let Some(v) = self.bind_port {
            config.bind_port = v;
        }
        if let Some(v) = self.base_dir {
            config.base_dir = v;
        }
        if let Some(v) = self.device_api_url {
            config.device_api_url = v;
        }
        if let Some(v) = self.cloud_request_url {
            config.cloud_request_url = v;
        }
    }
}

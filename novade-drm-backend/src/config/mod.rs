// novade-drm-backend/src/config/mod.rs
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

mod mode_request;

pub use mode_request::ModeRequest;

// ANCHOR[id=backend_config_struct]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// DRM card node to drive.
    pub device: PathBuf,
    /// Mode request used for outputs without an override.
    pub mode: ModeRequest,
    /// Upper bound on the synchronous page-flip drain during output teardown.
    pub flip_drain_timeout_ms: u64,
    /// Interval between hotplug scans in the driver binary.
    pub scan_interval_ms: u64,
    /// Per-output overrides, keyed by stable output name (`HDMI-A-1`).
    pub outputs: BTreeMap<String, OutputConfig>,
}

// ANCHOR[id=output_config_struct]
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub mode: Option<ModeRequest>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from("/dev/dri/card0"),
            mode: ModeRequest::Preferred,
            flip_drain_timeout_ms: 1000,
            scan_interval_ms: 2000,
            outputs: BTreeMap::new(),
        }
    }
}

// ANCHOR[id=backend_config_impl]
impl BackendConfig {
    /// Reads and validates a TOML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: BackendConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.flip_drain_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "flip_drain_timeout_ms",
                message: "must be greater than zero".to_string(),
            });
        }
        if self.scan_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "scan_interval_ms",
                message: "must be greater than zero".to_string(),
            });
        }
        if self.device.as_os_str().is_empty() {
            return Err(ConfigError::Invalid {
                field: "device",
                message: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    /// Mode request for the named output, falling back to the global one.
    pub fn mode_for(&self, output_name: &str) -> &ModeRequest {
        self.outputs
            .get(output_name)
            .and_then(|output| output.mode.as_ref())
            .unwrap_or(&self.mode)
    }

    pub fn flip_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.flip_drain_timeout_ms)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }
}

use crate::device::DeviceRoles;
use crate::errors::{DdxError, DdxResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Listener, timeout and framing settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    pub port: u16,
    /// Listen on every interface instead of loopback only
    pub allow_external: bool,
    pub registration_timeout_ms: u64,
    /// Default per-request timeout; 0 disables it
    pub request_timeout_ms: u64,
    /// Longest accepted frame in bytes, terminator included
    pub max_frame_size: usize,
    pub poll_interval_ms: u64,
    /// Refuse plain connections from non-loopback peers
    pub require_encryption: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: 4388,
            allow_external: false,
            registration_timeout_ms: 10_000,
            request_timeout_ms: 10_000,
            max_frame_size: 1024 * 1024,
            poll_interval_ms: 2_000,
            require_encryption: false,
        }
    }
}

impl NetworkConfig {
    pub fn registration_timeout(&self) -> Duration {
        Duration::from_millis(self.registration_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Identity this endpoint asserts during registration
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct DeviceConfig {
    pub name: String,
    pub roles: DeviceRoles,
    pub locale: Option<String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: "ddx-daemon".to_string(),
            roles: DeviceRoles::DAEMON,
            locale: None,
        }
    }
}

/// Certificate material. Servers need `cert_file` and `key_file`, clients `ca_file`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub ca_file: Option<PathBuf>,
    /// Name checked against the daemon certificate; defaults to the host
    pub server_name: Option<String>,
}

/// Top-level configuration file
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(default)]
pub struct DdxConfig {
    pub network: NetworkConfig,
    pub device: DeviceConfig,
    pub tls: TlsConfig,
}

impl DdxConfig {
    /// Loads configuration from a file if it exists, otherwise returns the default config
    pub fn load_from_file(path: &Path) -> DdxResult<Self> {
        if path.exists() {
            let content = fs::read_to_string(path).map_err(|e| {
                DdxError::ConfigError(format!("Failed to read config file: {}", e))
            })?;

            let config: Self = toml::from_str(&content).map_err(|e| {
                DdxError::ConfigError(format!("Failed to parse config file: {}", e))
            })?;

            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Loads the config from the default location
    pub fn load_from_default() -> DdxResult<Self> {
        Self::load_from_file(&get_default_config_file("ddx")?)
    }

    /// Saves configuration to a file
    pub fn save_to_file(&self, path: &Path) -> DdxResult<()> {
        let content = toml::to_string(self)
            .map_err(|e| DdxError::ConfigError(format!("Failed to serialize config: {}", e)))?;

        // Ensure the directory exists
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                DdxError::ConfigError(format!("Failed to create config directory: {}", e))
            })?;
        }

        fs::write(path, content)
            .map_err(|e| DdxError::ConfigError(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Rejects settings the connection engine cannot run with.
    ///
    /// `serving` selects which TLS files are mandatory.
    pub fn validate(&self, serving: bool) -> DdxResult<()> {
        let net = &self.network;
        if net.max_frame_size == 0 {
            return Err(DdxError::ConfigError("max_frame_size must be positive".to_string()));
        }
        if net.registration_timeout_ms == 0 {
            return Err(DdxError::ConfigError(
                "registration_timeout_ms must be positive".to_string(),
            ));
        }
        if net.poll_interval_ms == 0 {
            return Err(DdxError::ConfigError("poll_interval_ms must be positive".to_string()));
        }
        if self.device.name.trim().is_empty() {
            return Err(DdxError::ConfigError("device name must not be empty".to_string()));
        }
        if self.tls.enabled {
            if serving && (self.tls.cert_file.is_none() || self.tls.key_file.is_none()) {
                return Err(DdxError::ConfigError(
                    "TLS is enabled but cert_file or key_file is missing".to_string(),
                ));
            }
            if !serving && self.tls.ca_file.is_none() {
                return Err(DdxError::ConfigError(
                    "TLS is enabled but ca_file is missing".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Helper function to get default config directory
pub fn get_default_config_dir(app_name: &str) -> DdxResult<PathBuf> {
    let home_dir = dirs::home_dir().ok_or_else(|| {
        DdxError::ConfigError("Could not determine home directory".to_string())
    })?;

    let config_dir = home_dir.join(".config").join(app_name);

    Ok(config_dir)
}

/// Helper function to get default config file path
pub fn get_default_config_file(app_name: &str) -> DdxResult<PathBuf> {
    let config_dir = get_default_config_dir(app_name)?;
    Ok(config_dir.join("config.toml"))
}

//! Gateway configuration
//!
//! Loaded from YAML or JSON (picked by file extension). Missing keys take
//! their defaults, so an empty file is a valid configuration.

use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::{ModbusError, ModbusResult};

/// File with the default values of the durable fields
pub const DEFAULT_FIELDS_FILE: &str = "dfltFields.properties";
/// File the durable field values are persisted to
pub const STATE_FIELDS_FILE: &str = "fields.properties";

pub const SERIAL_NUMBER_ENV: &str = "MICA_DEVICE_SERIAL_NO";
pub const HARDWARE_REVISION_ENV: &str = "MICA_DEVICE_HW_REVISION";
pub const BASE_FIRMWARE_ENV: &str = "MICA_FIRMWARE_BASE_VERSION";

/// Identity of the device hosting the reader
///
/// Unset values are taken from the environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceIdentity {
    pub serial_number: Option<String>,
    pub hardware_revision: Option<String>,
    pub base_firmware: Option<String>,
}

fn resolve(value: &Option<String>, var: &str, fallback: &str) -> String {
    value
        .clone()
        .or_else(|| env::var(var).ok())
        .unwrap_or_else(|| fallback.to_string())
}

impl DeviceIdentity {
    /// Decimal serial number, "0" when unknown
    pub fn serial_number(&self) -> String {
        resolve(&self.serial_number, SERIAL_NUMBER_ENV, "0")
    }

    pub fn hardware_revision(&self) -> String {
        resolve(&self.hardware_revision, HARDWARE_REVISION_ENV, "")
    }

    pub fn base_firmware(&self) -> String {
        resolve(&self.base_firmware, BASE_FIRMWARE_ENV, "")
    }
}

fn default_bind_address() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 502))
}

fn default_max_connections() -> usize {
    1
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_config_dir() -> PathBuf {
    PathBuf::from("config")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".")
}

/// Gateway configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: SocketAddr,
    /// Clients served at the same time
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Time a client may take to send the next request
    #[serde(default = "default_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Bound on opening and closing the RF device
    #[serde(default = "default_timeout_ms")]
    pub open_close_timeout_ms: u64,
    /// Directory holding the default field values
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,
    /// Directory the field values are persisted to; must exist
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default)]
    pub device: DeviceIdentity,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            max_connections: default_max_connections(),
            request_timeout_ms: default_timeout_ms(),
            open_close_timeout_ms: default_timeout_ms(),
            config_dir: default_config_dir(),
            state_dir: default_state_dir(),
            device: DeviceIdentity::default(),
        }
    }
}

impl GatewayConfig {
    /// Load a configuration file, YAML unless the extension is `.json`
    pub fn from_file<P: AsRef<Path>>(path: P) -> ModbusResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            ModbusError::configuration(format!("Cannot read {}: {}", path.display(), e))
        })?;
        let config: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            _ => serde_yaml::from_str(&content)?,
        };
        info!("Loaded configuration from {}", path.display());
        debug!("{:?}", config);
        Ok(config)
    }

    /// Check the configuration before the gateway starts
    pub fn validate(&self) -> ModbusResult<()> {
        if self.max_connections == 0 {
            return Err(ModbusError::configuration("max_connections must be at least 1"));
        }
        if self.request_timeout_ms == 0 {
            return Err(ModbusError::configuration("request_timeout_ms must not be 0"));
        }
        if self.open_close_timeout_ms == 0 {
            return Err(ModbusError::configuration("open_close_timeout_ms must not be 0"));
        }
        if !self.state_dir.is_dir() {
            return Err(ModbusError::configuration(format!(
                "Missing state directory {}",
                self.state_dir.display()
            )));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn open_close_timeout(&self) -> Duration {
        Duration::from_millis(self.open_close_timeout_ms)
    }

    pub fn default_fields_path(&self) -> PathBuf {
        self.config_dir.join(DEFAULT_FIELDS_FILE)
    }

    pub fn state_fields_path(&self) -> PathBuf {
        self.state_dir.join(STATE_FIELDS_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: GatewayConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, GatewayConfig::default());
        assert_eq!(config.bind_address.port(), 502);
        assert_eq!(config.open_close_timeout(), Duration::from_secs(5));
        assert_eq!(config.default_fields_path(), PathBuf::from("config/dfltFields.properties"));
    }

    #[test]
    fn test_from_yaml_and_json() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = dir.path().join("gateway.yaml");
        fs::write(&yaml, "bind_address: 127.0.0.1:1502\nmax_connections: 4\ndevice:\n  serial_number: \"42\"\n").unwrap();
        let config = GatewayConfig::from_file(&yaml).unwrap();
        assert_eq!(config.bind_address, "127.0.0.1:1502".parse().unwrap());
        assert_eq!(config.max_connections, 4);
        assert_eq!(config.device.serial_number(), "42");
        assert_eq!(config.request_timeout_ms, 5000);

        let json = dir.path().join("gateway.json");
        fs::write(&json, r#"{"request_timeout_ms": 250, "state_dir": "/var/lib/reader"}"#).unwrap();
        let config = GatewayConfig::from_file(&json).unwrap();
        assert_eq!(config.request_timeout(), Duration::from_millis(250));
        assert_eq!(config.state_fields_path(), PathBuf::from("/var/lib/reader/fields.properties"));

        fs::write(&json, "{").unwrap();
        assert!(matches!(GatewayConfig::from_file(&json), Err(ModbusError::Configuration { .. })));
    }

    #[test]
    fn test_validate() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = GatewayConfig {
            state_dir: dir.path().to_path_buf(),
            ..GatewayConfig::default()
        };
        assert!(config.validate().is_ok());

        config.max_connections = 0;
        assert!(config.validate().is_err());
        config.max_connections = 1;

        config.state_dir = dir.path().join("missing");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_identity_prefers_configured_values() {
        let identity = DeviceIdentity {
            serial_number: Some("7".to_string()),
            hardware_revision: Some("C".to_string()),
            base_firmware: Some("2.0".to_string()),
        };
        assert_eq!(identity.serial_number(), "7");
        assert_eq!(identity.hardware_revision(), "C");
        assert_eq!(identity.base_firmware(), "2.0");
    }
}

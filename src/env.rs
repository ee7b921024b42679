//! Defines logic to grab configuration values from the environment.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Result};
use log::{info, warn};
use serde::Deserialize;

use crate::controller::ControllerConfig;
use crate::identity::DecoderConfig;
use crate::selector::{
    SelectorConfig, DEFAULT_SYSTEM_SHORT_IDS, DEFAULT_TARGET_READ_UUID,
    DEFAULT_TARGET_SERVICE_UUID, DEFAULT_TARGET_WRITE_UUID,
};

/// Environment variable naming an alternative config file.
pub const CONFIG_ENV_VAR: &str = "BLE_ORDER_SCANNER_CONFIG";

/// Config file used when `CONFIG_ENV_VAR` is unset.
const DEFAULT_CONFIG_FP: &str = "ble-order-scanner.json";

/// Default name filter; matches the order terminals this tool was built for.
const DEFAULT_NAME_FILTER: &str = "mcan";

/// Scanner configuration as stored on disk. Every field is optional.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub name_filter: String,
    pub scan_window_secs: u64,
    pub scan_pause_secs: u64,
    pub phone_prefixes: Vec<String>,
    pub target_service_uuid: String,
    pub target_write_uuid: String,
    pub target_read_uuid: String,
    pub system_short_ids: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            name_filter: DEFAULT_NAME_FILTER.to_string(),
            scan_window_secs: 5,
            scan_pause_secs: 1,
            phone_prefixes: DecoderConfig::default().phone_prefixes,
            target_service_uuid: DEFAULT_TARGET_SERVICE_UUID.to_string(),
            target_write_uuid: DEFAULT_TARGET_WRITE_UUID.to_string(),
            target_read_uuid: DEFAULT_TARGET_READ_UUID.to_string(),
            system_short_ids: DEFAULT_SYSTEM_SHORT_IDS
                .iter()
                .map(|id| id.to_string())
                .collect(),
        }
    }
}

impl Config {
    /// Checks the UUIDs and timings and normalises UUIDs to lowercase hyphenated form.
    pub fn validated(mut self) -> Result<Self> {
        for (field, value) in [
            ("target_service_uuid", &mut self.target_service_uuid),
            ("target_write_uuid", &mut self.target_write_uuid),
            ("target_read_uuid", &mut self.target_read_uuid),
        ] {
            let parsed = uuid::Uuid::parse_str(value.as_str())
                .map_err(|e| anyhow!("`{field}` is not a valid UUID (\"{value}\"): {e}"))?;
            *value = parsed.hyphenated().to_string();
        }
        if self.scan_window_secs == 0 {
            return Err(anyhow!("`scan_window_secs` must be at least 1"));
        }
        self.system_short_ids = self
            .system_short_ids
            .iter()
            .map(|id| id.to_lowercase())
            .collect();
        Ok(self)
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            scan_window: Duration::from_secs(self.scan_window_secs),
            scan_pause: Duration::from_secs(self.scan_pause_secs),
            name_filter: self.name_filter.clone(),
            decoder: DecoderConfig {
                phone_prefixes: self.phone_prefixes.clone(),
            },
            selector: SelectorConfig {
                target_service_uuid: self.target_service_uuid.clone(),
                fixed_write_uuid: self.target_write_uuid.clone(),
                fixed_read_uuid: self.target_read_uuid.clone(),
                system_short_ids: self.system_short_ids.clone(),
            },
        }
    }
}

/// Path of the config file: `CONFIG_ENV_VAR` if set, else `DEFAULT_CONFIG_FP`.
pub fn config_path() -> PathBuf {
    std::env::var_os(CONFIG_ENV_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FP))
}

/// Loads the config from [`config_path`].
pub fn get_config() -> Result<Config> {
    load_config(&config_path())
}

/// Loads the config at `path`. A missing file yields the defaults; a malformed one is an error.
pub fn load_config(path: &Path) -> Result<Config> {
    let config_file = match File::open(path) {
        Ok(file) => file,
        _ => {
            warn!(
                "Could not open config file {path:?}; defaulting to built-in configuration"
            );
            return Config::default().validated();
        }
    };
    let config: Config = serde_json::from_reader(&config_file).map_err(|e| {
        anyhow!("contents of {path:?} are not a valid scanner config; ensure it is well formed JSON: {e}")
    })?;
    info!("Loaded config from {path:?}");
    config.validated()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "ble-order-scanner-{}-{name}.json",
            std::process::id()
        ));
        let mut file = File::create(&path).expect("create temp config");
        file.write_all(contents.as_bytes()).expect("write temp config");
        path
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = load_config(Path::new("/nonexistent/ble-order-scanner.json"))
            .expect("defaults");
        assert_eq!(config, Config::default());
        assert_eq!(config.name_filter, "mcan");
        assert_eq!(config.phone_prefixes, vec!["010", "1234"]);
    }

    #[test]
    fn partial_file_overrides_only_given_fields() {
        let path = write_temp(
            "partial",
            r#"{ "name_filter": "", "phone_prefixes": ["999"], "target_write_uuid": "0000FFE1-0000-1000-8000-00805F9B34FB" }"#,
        );
        let config = load_config(&path).expect("valid config");
        std::fs::remove_file(&path).ok();

        assert_eq!(config.name_filter, "");
        assert_eq!(config.phone_prefixes, vec!["999"]);
        assert_eq!(
            config.target_write_uuid,
            "0000ffe1-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(config.scan_window_secs, 5);

        let controller = config.controller_config();
        assert_eq!(controller.scan_window, Duration::from_secs(5));
        assert_eq!(controller.decoder.phone_prefixes, vec!["999"]);
        assert_eq!(
            controller.selector.fixed_write_uuid,
            "0000ffe1-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn malformed_file_is_an_error() {
        let path = write_temp("malformed", "{ not json");
        let result = load_config(&path);
        std::fs::remove_file(&path).ok();
        assert!(result.is_err());
    }

    #[test]
    fn invalid_uuid_is_an_error() {
        let path = write_temp("bad-uuid", r#"{ "target_read_uuid": "fff2" }"#);
        let result = load_config(&path);
        std::fs::remove_file(&path).ok();
        let message = result.expect_err("invalid uuid").to_string();
        assert!(message.contains("target_read_uuid"));
    }
}

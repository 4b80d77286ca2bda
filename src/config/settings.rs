use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::devices::power_meter::PowerMeter;
use crate::devices::profiles::{DeviceProfile, KM_N1_FLK_V2};
use crate::utils::error::ConfigError;

/// A century of readings; anything longer is a typo.
pub const MAX_RETENTION_DAYS: i64 = 36_500;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Connection settings
    pub serial_port: String,
    pub baud_rate: u32,
    pub timeout_ms: u64,
    pub parity: ParityConfig,

    #[serde(default)]
    pub poll: PollConfig,

    pub meters: Vec<MeterConfig>,

    /// Extra register maps; a name here shadows a built-in profile.
    #[serde(default)]
    pub profiles: Vec<DeviceProfile>,

    #[serde(default)]
    pub database: SqliteConfig,

    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    pub interval_ms: u64,
    /// Pause between two meters on the shared line.
    pub device_settle_ms: u64,
    pub cleanup_interval_seconds: u64,
    pub retention_days: i64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            device_settle_ms: 250,
            cleanup_interval_seconds: 3600,
            retention_days: 30,
        }
    }
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn device_settle(&self) -> Duration {
        Duration::from_millis(self.device_settle_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeterConfig {
    pub device_id: String,
    pub address: u8,
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default)]
    pub normalize_polarity: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_profile() -> String {
    KM_N1_FLK_V2.to_string()
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteConfig {
    pub database_path: String,
    pub max_connections: u32,
    pub busy_timeout_ms: u64,
    pub enable_wal: bool,
    pub sync_mode: String,
    /// Page cache in KiB.
    pub cache_size: i32,
    pub write_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            database_path: "data/power.db".to_string(),
            max_connections: 5,
            busy_timeout_ms: 5000,
            enable_wal: true,
            sync_mode: "NORMAL".to_string(),
            cache_size: 2000,
            write_retries: 3,
            retry_delay_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind_address: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "0.0.0.0".to_string(),
            port: 5200,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParityConfig {
    None,
    Even,
    Odd,
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub serial_port: Option<String>,
    pub baud_rate: Option<u32>,
    pub interval_ms: Option<u64>,
    pub database_path: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            serial_port: "/dev/ttyACM0".to_string(),
            baud_rate: 9600,
            timeout_ms: 500,
            parity: ParityConfig::Even,
            poll: PollConfig::default(),
            meters: vec![
                MeterConfig {
                    device_id: "unit01".to_string(),
                    address: 1,
                    profile: default_profile(),
                    normalize_polarity: false,
                    enabled: true,
                },
                // CT on this unit is mounted reversed
                MeterConfig {
                    device_id: "unit02".to_string(),
                    address: 2,
                    profile: default_profile(),
                    normalize_polarity: true,
                    enabled: true,
                },
            ],
            profiles: Vec::new(),
            database: SqliteConfig::default(),
            api: ApiConfig::default(),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Config = toml::from_str(&content)?;
        debug!("Loaded configuration from {}", path.as_ref().display());
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), content)?;
        info!("💾 Configuration written to {}", path.as_ref().display());
        Ok(())
    }

    pub fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(port) = overrides.serial_port {
            self.serial_port = port;
        }
        if let Some(baud) = overrides.baud_rate {
            self.baud_rate = baud;
        }
        if let Some(interval) = overrides.interval_ms {
            self.poll.interval_ms = interval;
        }
        if let Some(path) = overrides.database_path {
            self.database.database_path = path;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll.interval_ms == 0 {
            return Err(ConfigError::Invalid("poll interval must be greater than zero".into()));
        }
        if !(1..=MAX_RETENTION_DAYS).contains(&self.poll.retention_days) {
            return Err(ConfigError::Invalid(format!(
                "retention_days must be between 1 and {}, got {}",
                MAX_RETENTION_DAYS, self.poll.retention_days
            )));
        }
        if self.enabled_meters().next().is_none() {
            return Err(ConfigError::Invalid("no enabled meters configured".into()));
        }

        let mut ids = HashSet::new();
        let mut addresses = HashSet::new();
        for meter in &self.meters {
            if meter.device_id.trim().is_empty() {
                return Err(ConfigError::Invalid("meter device_id must not be empty".into()));
            }
            if !(1..=247).contains(&meter.address) {
                return Err(ConfigError::Invalid(format!(
                    "meter {} address {} outside 1-247",
                    meter.device_id, meter.address
                )));
            }
            if !ids.insert(meter.device_id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate device_id {}", meter.device_id)));
            }
            if !addresses.insert(meter.address) {
                return Err(ConfigError::Invalid(format!("duplicate meter address {}", meter.address)));
            }
            self.resolve_profile(&meter.profile)?;
        }

        for profile in &self.profiles {
            profile
                .validate()
                .map_err(|e| ConfigError::Invalid(format!("profile {}: {}", profile.name, e)))?;
            for (field, spec) in profile.fields() {
                if !spec.scale.is_finite() || spec.scale == 0.0 {
                    return Err(ConfigError::Invalid(format!(
                        "profile {} field {} has unusable scale {}",
                        profile.name, field, spec.scale
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn resolve_profile(&self, name: &str) -> Result<DeviceProfile, ConfigError> {
        self.profiles
            .iter()
            .find(|p| p.name == name)
            .cloned()
            .or_else(|| DeviceProfile::builtin(name))
            .ok_or_else(|| ConfigError::UnknownProfile(name.to_string()))
    }

    pub fn enabled_meters(&self) -> impl Iterator<Item = &MeterConfig> {
        self.meters.iter().filter(|m| m.enabled)
    }

    /// Enabled meters in poll order, with their profiles resolved.
    pub fn power_meters(&self) -> Result<Vec<PowerMeter>, ConfigError> {
        self.enabled_meters()
            .map(|m| {
                Ok(PowerMeter {
                    device_id: m.device_id.clone(),
                    address: m.address,
                    profile: self.resolve_profile(&m.profile)?,
                    normalize_polarity: m.normalize_polarity,
                })
            })
            .collect()
    }

    pub fn meter_by_id(&self, device_id: &str) -> Option<&MeterConfig> {
        self.meters.iter().find(|m| m.device_id == device_id)
    }

    pub fn device_ids(&self) -> Vec<String> {
        self.enabled_meters().map(|m| m.device_id.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::profiles::KM_N1_FLK_V1;
    use crate::devices::register::RegisterSpec;

    #[test]
    fn test_default_installation() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        let meters = config.power_meters().unwrap();
        assert_eq!(meters.len(), 2);
        assert_eq!(meters[0].device_id, "unit01");
        assert!(!meters[0].normalize_polarity);
        assert_eq!(meters[1].address, 2);
        assert!(meters[1].normalize_polarity);
        assert_eq!(config.parity, ParityConfig::Even);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf/power.toml");
        Config::default().save_to_file(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.meters.len(), 2);
        assert_eq!(loaded.poll.interval_ms, 1000);
        assert_eq!(loaded.api.port, 5200);
    }

    #[test]
    fn test_minimal_file_uses_defaults() {
        let toml = r#"
            serial_port = "/dev/ttyUSB0"
            baud_rate = 9600
            timeout_ms = 500
            parity = "Even"

            [[meters]]
            device_id = "unit01"
            address = 1
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.meters[0].profile, KM_N1_FLK_V2);
        assert!(config.meters[0].enabled);
        assert_eq!(config.database.database_path, "data/power.db");
        assert_eq!(config.poll.retention_days, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_duplicate_address() {
        let mut config = Config::default();
        config.meters[1].address = 1;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_duplicate_device_id() {
        let mut config = Config::default();
        config.meters[1].device_id = "unit01".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_unknown_profile() {
        let mut config = Config::default();
        config.meters[0].profile = "mystery".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::UnknownProfile(_))));
    }

    #[test]
    fn test_rejects_zero_interval_and_empty_meters() {
        let mut config = Config::default();
        config.poll.interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.meters.iter_mut().for_each(|m| m.enabled = false);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retention_days_bounds() {
        let mut config = Config::default();
        config.poll.retention_days = MAX_RETENTION_DAYS;
        assert!(config.validate().is_ok());

        for days in [0, MAX_RETENTION_DAYS + 1, 1_000_000_000] {
            config.poll.retention_days = days;
            assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))), "days={}", days);
        }
    }

    #[test]
    fn test_custom_profile_shadows_builtin() {
        let mut config = Config::default();
        let mut custom = DeviceProfile::km_n1_flk_v1();
        custom.energy = RegisterSpec::unsigned(0x0100, 0.01);
        config.profiles.push(custom);
        config.meters[0].profile = KM_N1_FLK_V1.to_string();

        let meters = config.power_meters().unwrap();
        assert_eq!(meters[0].profile.energy.address, 0x0100);
        assert_eq!(meters[1].profile.name, KM_N1_FLK_V2);
    }

    #[test]
    fn test_rejects_zero_scale_in_custom_profile() {
        let mut config = Config::default();
        let mut custom = DeviceProfile::km_n1_flk_v2();
        custom.name = "broken".to_string();
        custom.voltage.scale = 0.0;
        config.profiles.push(custom);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_overrides() {
        let mut config = Config::default();
        config.apply_overrides(ConfigOverrides {
            serial_port: Some("/dev/ttyUSB1".into()),
            baud_rate: None,
            interval_ms: Some(2000),
            database_path: Some("/tmp/x.db".into()),
        });
        assert_eq!(config.serial_port, "/dev/ttyUSB1");
        assert_eq!(config.baud_rate, 9600);
        assert_eq!(config.poll.interval(), Duration::from_secs(2));
        assert_eq!(config.database.database_path, "/tmp/x.db");
    }
}

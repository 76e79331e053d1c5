//! Service configuration (dexopt.toml)
//!
//! Every section is optional and falls back to the values the platform ships with. The
//! `[properties]` table seeds the in-memory system property store, and `[device]` fills in
//! the `ro.product.cpu.abilist*` properties.

use dexopt_core::platform::instruction_set;
use dexopt_core::MemoryProperties;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::compiler_filter;

/// Errors that can occur while loading the configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the config file
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range or inconsistent
    #[error("Invalid config: {0}")]
    Validation(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServiceConfig {
    /// Dex use tracking
    pub dex_use: DexUseConfig,
    /// artd connection cache
    pub artd: ArtdConfig,
    /// Batch dexopt
    pub batch: BatchConfig,
    /// Pre-reboot dexopt job
    pub pre_reboot: PreRebootConfig,
    /// Device ABIs
    pub device: DeviceConfigSection,
    /// Initial system properties
    pub properties: FxHashMap<String, String>,
}

/// `[dex_use]`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DexUseConfig {
    /// Where the dex use log is persisted
    pub file: PathBuf,
    /// Debounce interval for saves
    pub save_interval_ms: u64,
    /// Longest accepted dex path
    pub max_path_length: usize,
    /// Longest accepted class loader context
    pub max_class_loader_context_length: usize,
    /// Cap on secondary dex files recorded per owning package
    pub max_secondary_dex_files_per_owner: usize,
    /// Size of the recently resolved owner cache
    pub recent_owner_cache_size: usize,
}

impl Default for DexUseConfig {
    fn default() -> Self {
        Self {
            file: PathBuf::from("/data/system/package-dex-usage.pb"),
            save_interval_ms: 15_000,
            max_path_length: 4096,
            max_class_loader_context_length: 10_000,
            max_secondary_dex_files_per_owner: 500,
            recent_owner_cache_size: 50,
        }
    }
}

impl DexUseConfig {
    /// Save debounce interval
    pub fn save_interval(&self) -> Duration {
        Duration::from_millis(self.save_interval_ms)
    }
}

/// `[artd]`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ArtdConfig {
    /// How long an unpinned connection stays cached
    pub cache_timeout_ms: u64,
}

impl Default for ArtdConfig {
    fn default() -> Self {
        Self {
            cache_timeout_ms: 60_000,
        }
    }
}

impl ArtdConfig {
    /// Keep-alive for the connection cache
    pub fn cache_timeout(&self) -> Duration {
        Duration::from_millis(self.cache_timeout_ms)
    }
}

/// `[batch]`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BatchConfig {
    /// Free space above the storage-low threshold below which inactive apps are downgraded
    pub downgrade_threshold_above_low_bytes: i64,
    /// Storage-low threshold of the internal volume
    pub storage_low_bytes: i64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            downgrade_threshold_above_low_bytes: 500_000_000,
            storage_low_bytes: 500_000_000,
        }
    }
}

/// `[pre_reboot]`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PreRebootConfig {
    /// Job scheduler id
    pub job_id: i32,
    /// How long to wait for update_engine to map snapshots
    pub update_engine_timeout_ms: u64,
    /// Minimum delay between scheduling and running
    pub min_latency_ms: u64,
    /// Whether update_engine can be asked to map snapshots
    pub update_engine_api: bool,
}

impl Default for PreRebootConfig {
    fn default() -> Self {
        Self {
            job_id: 27_873_781,
            update_engine_timeout_ms: 10_000,
            min_latency_ms: 10 * 60 * 1000,
            update_engine_api: false,
        }
    }
}

impl PreRebootConfig {
    /// update_engine handshake timeout
    pub fn update_engine_timeout(&self) -> Duration {
        Duration::from_millis(self.update_engine_timeout_ms)
    }

    /// Scheduling latency
    pub fn min_latency(&self) -> Duration {
        Duration::from_millis(self.min_latency_ms)
    }
}

/// `[device]`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeviceConfigSection {
    /// Supported ABIs, preferred first
    pub supported_abis: Vec<String>,
}

impl Default for DeviceConfigSection {
    fn default() -> Self {
        Self {
            supported_abis: vec!["arm64-v8a".to_string(), "armeabi-v7a".to_string()],
        }
    }
}

fn is_64_bit_abi(abi: &str) -> bool {
    matches!(abi, "arm64-v8a" | "x86_64" | "riscv64")
}

impl ServiceConfig {
    /// Parse a config from a file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Parse a config from a string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: ServiceConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the config
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device.supported_abis.is_empty() {
            return Err(ConfigError::Validation(
                "device.supported_abis cannot be empty".to_string(),
            ));
        }
        for abi in &self.device.supported_abis {
            if instruction_set(abi).is_none() {
                return Err(ConfigError::Validation(format!("Unknown ABI '{}'", abi)));
            }
        }

        let dex_use = &self.dex_use;
        for (name, value) in [
            ("max_path_length", dex_use.max_path_length),
            (
                "max_class_loader_context_length",
                dex_use.max_class_loader_context_length,
            ),
            (
                "max_secondary_dex_files_per_owner",
                dex_use.max_secondary_dex_files_per_owner,
            ),
            ("recent_owner_cache_size", dex_use.recent_owner_cache_size),
        ] {
            if value == 0 {
                return Err(ConfigError::Validation(format!(
                    "dex_use.{} must be positive",
                    name
                )));
            }
        }
        if dex_use.file.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "dex_use.file cannot be empty".to_string(),
            ));
        }

        if self.pre_reboot.update_engine_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "pre_reboot.update_engine_timeout_ms must be positive".to_string(),
            ));
        }

        for (key, value) in &self.properties {
            let is_filter_key = key
                .strip_prefix("pm.dexopt.")
                .map(|rest| !rest.contains('.') && !rest.contains('_'))
                .unwrap_or(false);
            if is_filter_key && !compiler_filter::is_valid(value) {
                return Err(ConfigError::Validation(format!(
                    "Invalid compiler filter '{}' for property '{}'",
                    value, key
                )));
            }
        }

        Ok(())
    }

    /// Build the system property store: `[properties]` plus the device ABI lists
    pub fn system_properties(&self) -> MemoryProperties {
        let abis = &self.device.supported_abis;
        let join = |list: Vec<&String>| {
            list.into_iter()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(",")
        };
        let abilist64 = join(abis.iter().filter(|abi| is_64_bit_abi(abi)).collect());
        let abilist32 = join(abis.iter().filter(|abi| !is_64_bit_abi(abi)).collect());

        let mut values: Vec<(String, String)> = vec![
            ("ro.product.cpu.abilist".to_string(), join(abis.iter().collect())),
            ("ro.product.cpu.abilist64".to_string(), abilist64),
            ("ro.product.cpu.abilist32".to_string(), abilist32),
        ];
        values.extend(
            self.properties
                .iter()
                .map(|(key, value)| (key.clone(), value.clone())),
        );
        MemoryProperties::with_values(values)
    }
}

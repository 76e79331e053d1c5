//! Platform facilities: system properties, device config, clock, and storage

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::io;
use std::time::{SystemTime, UNIX_EPOCH};

/// Read/write access to system properties
pub trait SystemProperties: Send + Sync {
    /// Raw value, `None` if unset or empty
    fn get(&self, key: &str) -> Option<String>;

    /// Set a property
    fn set(&self, key: &str, value: &str) -> io::Result<()>;

    /// String value with a default for unset properties
    fn get_string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    /// Boolean value using the usual property spellings
    fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key).as_deref() {
            Some("1" | "y" | "yes" | "on" | "true") => true,
            Some("0" | "n" | "no" | "off" | "false") => false,
            _ => default,
        }
    }

    /// Integer value; unparsable values fall back to `default`
    fn get_int(&self, key: &str, default: i64) -> i64 {
        self.get(key)
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(default)
    }
}

/// Server-pushed feature flags
pub trait DeviceConfig: Send + Sync {
    /// Boolean flag in `namespace`
    fn get_bool(&self, namespace: &str, name: &str, default: bool) -> bool;
}

/// Wall clock in milliseconds since the epoch
pub trait Clock: Send + Sync {
    /// Current time
    fn now_ms(&self) -> i64;
}

/// Free-space queries
pub trait StorageManager: Send + Sync {
    /// Bytes that can be allocated on the volume; `None` is internal storage
    fn allocatable_bytes(&self, storage_uuid: Option<&str>) -> io::Result<i64>;
}

/// [`Clock`] backed by the system clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// In-memory property store
#[derive(Debug, Default)]
pub struct MemoryProperties {
    values: RwLock<FxHashMap<String, String>>,
}

impl MemoryProperties {
    /// An empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// A store preloaded with `values`
    pub fn with_values<I, K, V>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: RwLock::new(
                values
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        }
    }

    /// Remove a property
    pub fn remove(&self, key: &str) {
        self.values.write().remove(key);
    }
}

impl SystemProperties for MemoryProperties {
    fn get(&self, key: &str) -> Option<String> {
        self.values
            .read()
            .get(key)
            .filter(|value| !value.is_empty())
            .cloned()
    }

    fn set(&self, key: &str, value: &str) -> io::Result<()> {
        self.values.write().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

impl DeviceConfig for MemoryProperties {
    fn get_bool(&self, namespace: &str, name: &str, default: bool) -> bool {
        SystemProperties::get_bool(self, &format!("{}/{}", namespace, name), default)
    }
}

/// The ABIs the device runs natively, and the ISA translation table for foreign ones
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAbis {
    /// Preferred 64-bit ABI
    pub native_64: Option<String>,
    /// Preferred 32-bit ABI
    pub native_32: Option<String>,
    /// The device's most preferred ABI
    pub preferred: String,
}

impl DeviceAbis {
    /// Read from `ro.product.cpu.abilist*`
    pub fn from_properties(props: &dyn SystemProperties) -> Option<Self> {
        let first = |key: &str| {
            props
                .get(key)
                .and_then(|list| list.split(',').next().map(str::to_string))
                .filter(|abi| !abi.is_empty())
        };
        let native_64 = first("ro.product.cpu.abilist64");
        let native_32 = first("ro.product.cpu.abilist32");
        let preferred = first("ro.product.cpu.abilist")
            .or_else(|| native_64.clone())
            .or_else(|| native_32.clone())?;
        Some(Self {
            native_64,
            native_32,
            preferred,
        })
    }

    /// Whether `abi` is one the device runs natively
    pub fn is_native_abi(&self, abi: &str) -> bool {
        self.native_64.as_deref() == Some(abi) || self.native_32.as_deref() == Some(abi)
    }

    /// ISAs of the native ABIs, 64-bit first
    pub fn native_isas(&self) -> Vec<&'static str> {
        [&self.native_64, &self.native_32]
            .into_iter()
            .flatten()
            .filter_map(|abi| instruction_set(abi))
            .collect()
    }
}

/// The ISA an ABI compiles to
pub fn instruction_set(abi: &str) -> Option<&'static str> {
    match abi {
        "arm64-v8a" => Some("arm64"),
        "armeabi" | "armeabi-v7a" => Some("arm"),
        "x86_64" => Some("x86_64"),
        "x86" => Some("x86"),
        "riscv64" => Some("riscv64"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_property_parsing() {
        let props = MemoryProperties::with_values([
            ("a", "true"),
            ("b", "0"),
            ("c", "garbage"),
            ("n", "42"),
            ("empty", ""),
        ]);
        assert!(SystemProperties::get_bool(&props, "a", false));
        assert!(!SystemProperties::get_bool(&props, "b", true));
        assert!(SystemProperties::get_bool(&props, "c", true));
        assert_eq!(props.get_int("n", 0), 42);
        assert_eq!(props.get_int("a", 7), 7);
        assert_eq!(props.get("empty"), None);
        assert_eq!(props.get_string("missing", "speed"), "speed");
    }

    #[test]
    fn test_device_abis() {
        let props = MemoryProperties::with_values([
            ("ro.product.cpu.abilist", "arm64-v8a,armeabi-v7a,armeabi"),
            ("ro.product.cpu.abilist64", "arm64-v8a"),
            ("ro.product.cpu.abilist32", "armeabi-v7a,armeabi"),
        ]);
        let abis = DeviceAbis::from_properties(&props).unwrap();
        assert_eq!(abis.preferred, "arm64-v8a");
        assert!(abis.is_native_abi("armeabi-v7a"));
        assert!(!abis.is_native_abi("armeabi"));
        assert_eq!(abis.native_isas(), vec!["arm64", "arm"]);
        assert!(DeviceAbis::from_properties(&MemoryProperties::new()).is_none());
    }
}

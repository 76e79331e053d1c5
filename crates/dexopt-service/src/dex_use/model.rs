//! In-memory dex use registry: owner -> dex file -> loader -> record

use serde::{Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Class loader context recorded when the app could not describe its class loader
pub const UNSUPPORTED_CLASS_LOADER_CONTEXT: &str = "=UnsupportedClassLoaderContext=";

/// Aggregated context when loaders disagree; such a file cannot be dexopted
pub const VARYING_CLASS_LOADER_CONTEXTS: &str = "=VaryingClassLoaderContexts=";

/// An entity that loaded a dex file
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DexLoader {
    /// Package that performed the load
    pub loading_package_name: String,
    /// Whether the load happened in an isolated process
    pub isolated_process: bool,
}

impl DexLoader {
    /// Create a loader
    pub fn new(loading_package_name: &str, isolated_process: bool) -> Self {
        Self {
            loading_package_name: loading_package_name.to_string(),
            isolated_process,
        }
    }

    /// Whether this loader counts as another app for a file owned by `owner`.
    ///
    /// Isolated processes only read world-readable files, so the owner's own isolated
    /// processes impose the same requirement as a foreign app.
    pub fn is_other_app(&self, owner: &str) -> bool {
        self.loading_package_name != owner || self.isolated_process
    }
}

impl fmt::Display for DexLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.isolated_process {
            write!(f, "{} (isolated)", self.loading_package_name)
        } else {
            write!(f, "{}", self.loading_package_name)
        }
    }
}

/// Whether any of `loaders` is another app for `owner`
pub fn is_used_by_other_apps<'a, I>(loaders: I, owner: &str) -> bool
where
    I: IntoIterator<Item = &'a DexLoader>,
{
    loaders.into_iter().any(|loader| loader.is_other_app(owner))
}

fn loader_keyed<S, V>(records: &BTreeMap<DexLoader, V>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
    V: Serialize,
{
    serializer.collect_map(records.iter().map(|(loader, record)| (loader.to_string(), record)))
}

/// Use of a primary dex file by one loader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PrimaryDexUseRecord {
    /// Time of the last load
    pub last_used_at_ms: i64,
}

/// Use of a secondary dex file by one loader
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecondaryDexUseRecord {
    /// Context the app reported; only the app knows how it built its class loader
    pub class_loader_context: String,
    /// ABI of the loading process
    pub abi_name: String,
    /// Time of the last load
    pub last_used_at_ms: i64,
}

/// Loaders of one primary dex file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PrimaryDexUse {
    #[serde(serialize_with = "loader_keyed")]
    pub(crate) records: BTreeMap<DexLoader, PrimaryDexUseRecord>,
}

/// Loaders of one secondary dex file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecondaryDexUse {
    pub(crate) user_id: u32,
    #[serde(serialize_with = "loader_keyed")]
    pub(crate) records: BTreeMap<DexLoader, SecondaryDexUseRecord>,
}

impl SecondaryDexUse {
    pub(crate) fn new(user_id: u32) -> Self {
        Self {
            user_id,
            records: BTreeMap::new(),
        }
    }
}

/// Dex files of one owning package
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PackageDexUse {
    pub(crate) primary: BTreeMap<String, PrimaryDexUse>,
    pub(crate) secondary: BTreeMap<String, SecondaryDexUse>,
}

impl PackageDexUse {
    pub(crate) fn is_empty(&self) -> bool {
        self.primary.is_empty() && self.secondary.is_empty()
    }

    pub(crate) fn last_used_at_ms(&self) -> i64 {
        let primary = self
            .primary
            .values()
            .flat_map(|dex_use| dex_use.records.values())
            .map(|record| record.last_used_at_ms);
        let secondary = self
            .secondary
            .values()
            .flat_map(|dex_use| dex_use.records.values())
            .map(|record| record.last_used_at_ms);
        primary.chain(secondary).max().unwrap_or(0)
    }
}

/// The whole registry, keyed by owning package
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DexUse {
    pub(crate) packages: BTreeMap<String, PackageDexUse>,
}

impl DexUse {
    /// All dex paths currently tracked, primary and secondary
    pub(crate) fn dex_paths(&self) -> BTreeSet<String> {
        self.packages
            .values()
            .flat_map(|pkg| pkg.primary.keys().chain(pkg.secondary.keys()))
            .cloned()
            .collect()
    }

    /// Number of individual loader records
    pub fn record_count(&self) -> usize {
        self.packages
            .values()
            .map(|pkg| {
                pkg.primary.values().map(|d| d.records.len()).sum::<usize>()
                    + pkg.secondary.values().map(|d| d.records.len()).sum::<usize>()
            })
            .sum()
    }
}

/// Collapse the contexts of a file's loaders into one: the single distinct supported
/// context, [`UNSUPPORTED_CLASS_LOADER_CONTEXT`] when there is none, or
/// [`VARYING_CLASS_LOADER_CONTEXTS`] when loaders disagree.
pub fn aggregate_class_loader_contexts<'a, I>(contexts: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let distinct: BTreeSet<&str> = contexts
        .into_iter()
        .filter(|clc| *clc != UNSUPPORTED_CLASS_LOADER_CONTEXT)
        .collect();
    let mut iter = distinct.into_iter();
    match (iter.next(), iter.next()) {
        (None, _) => UNSUPPORTED_CLASS_LOADER_CONTEXT.to_string(),
        (Some(clc), None) => clc.to_string(),
        (Some(_), Some(_)) => VARYING_CLASS_LOADER_CONTEXTS.to_string(),
    }
}

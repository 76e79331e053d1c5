//! Installed-package model and the repository that serves snapshots of it

use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Number of uids reserved per Android user
pub const PER_USER_RANGE: u32 = 100_000;
/// First app id assigned to regular apps
pub const FIRST_APPLICATION_UID: i32 = 10_000;
/// First shared gid used for world-readable app artifacts
pub const FIRST_SHARED_APPLICATION_GID: i32 = 50_000;
/// The system uid
pub const SYSTEM_UID: u32 = 1000;

/// Name of the platform package
pub const PLATFORM_PACKAGE_NAME: &str = "android";

/// Identity of the process making a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallerInfo {
    /// Calling uid
    pub uid: u32,
}

impl CallerInfo {
    /// Caller running as `app_id` in `user_id`
    pub fn new(user_id: u32, app_id: u32) -> Self {
        Self {
            uid: user_id * PER_USER_RANGE + app_id,
        }
    }

    /// The Android user the caller runs as
    pub fn user_id(&self) -> u32 {
        self.uid / PER_USER_RANGE
    }

    /// The uid with the user part stripped
    pub fn app_id(&self) -> u32 {
        self.uid % PER_USER_RANGE
    }

    /// Whether the caller is an isolated or app-zygote-spawned sandbox process
    pub fn is_isolated(&self) -> bool {
        let app_id = self.app_id();
        (99_000..=99_999).contains(&app_id) || (90_000..=98_999).contains(&app_id)
    }
}

/// Kind of a shared library
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SharedLibraryKind {
    /// Part of the platform; loaded by everyone
    Builtin,
    /// A dynamic library provided by an installed package
    Dynamic,
    /// A static library compiled into each client
    Static,
    /// An SDK library
    Sdk,
}

/// A shared library an app depends on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedLibrary {
    /// Library name
    pub name: String,
    /// Package that provides it
    pub package_name: String,
    /// Jar or APK path for Java libraries
    pub path: Option<String>,
    /// Library kind
    pub kind: SharedLibraryKind,
    /// Whether it is a native (.so) library
    pub is_native: bool,
    /// Libraries this one depends on
    pub dependencies: Vec<SharedLibrary>,
}

/// One APK of an installed package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split {
    /// `None` for the base APK
    pub name: Option<String>,
    /// Absolute path of the APK
    pub path: String,
    /// Whether the APK contains dex code
    pub has_code: bool,
    /// Class loader context the runtime builds for this split, if known
    pub class_loader_context: Option<String>,
}

/// Parsed contents of an installed package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AndroidPackage {
    /// Base APK first, then splits
    pub splits: Vec<Split>,
    /// Volume uuid; `None` for internal storage
    pub storage_uuid: Option<String>,
    /// `android:vmSafeMode`
    pub is_vm_safe_mode: bool,
    /// `android:debuggable`
    pub is_debuggable: bool,
    /// `android:useEmbeddedDex`
    pub is_use_embedded_dex: bool,
    /// Whether the package declares a shared library
    pub is_shared_library: bool,
    /// The app's target SDK
    pub target_sdk_version: i32,
    /// Human readable version
    pub version_name: String,
    /// Numeric version
    pub long_version_code: i64,
}

impl AndroidPackage {
    /// The base APK
    pub fn base_split(&self) -> Option<&Split> {
        self.splits.first()
    }
}

/// State of an installed package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageState {
    /// Package name
    pub package_name: String,
    /// App id; negative for APEX pseudo-packages
    pub app_id: i32,
    /// Primary native ABI, if the package ships native code
    pub primary_cpu_abi: Option<String>,
    /// Secondary native ABI
    pub secondary_cpu_abi: Option<String>,
    /// SELinux seinfo
    pub seinfo: String,
    /// Whether hidden API checks are disabled for this package
    pub hidden_api_enforcement_disabled: bool,
    /// Shared libraries the package uses
    pub shared_library_dependencies: Vec<SharedLibrary>,
    /// First install time per user id
    pub first_install_time_ms_by_user: FxHashMap<u32, i64>,
    /// Hibernation state
    pub hibernating_globally: bool,
    /// `None` for packages without an APK (APEX)
    pub android_package: Option<AndroidPackage>,
}

impl PackageState {
    /// Whether the package has an APK and is a regular app
    pub fn has_android_package(&self) -> bool {
        self.android_package.is_some()
    }

    /// Latest first-install time across `user_ids`
    pub fn last_first_install_time_ms(&self, user_ids: &[u32]) -> i64 {
        user_ids
            .iter()
            .filter_map(|user| self.first_install_time_ms_by_user.get(user))
            .copied()
            .max()
            .unwrap_or(0)
    }
}

/// An immutable view of installed packages
#[derive(Debug, Clone, Default)]
pub struct PackageSnapshot {
    packages: FxHashMap<String, Arc<PackageState>>,
}

impl PackageSnapshot {
    /// Build from package states
    pub fn new<I>(packages: I) -> Self
    where
        I: IntoIterator<Item = PackageState>,
    {
        Self {
            packages: packages
                .into_iter()
                .map(|pkg| (pkg.package_name.clone(), Arc::new(pkg)))
                .collect(),
        }
    }

    /// Look up a package
    pub fn get(&self, package_name: &str) -> Option<&Arc<PackageState>> {
        self.packages.get(package_name)
    }

    /// Whether a package is installed
    pub fn contains(&self, package_name: &str) -> bool {
        self.packages.contains_key(package_name)
    }

    /// All packages, in no particular order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<PackageState>> {
        self.packages.values()
    }

    /// Number of packages
    pub fn len(&self) -> usize {
        self.packages.len()
    }

    /// Whether there are no packages
    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}

/// Source of package snapshots and per-package platform facts
pub trait PackageRepository: Send + Sync {
    /// All installed packages, ignoring visibility rules
    fn unfiltered_snapshot(&self) -> Arc<PackageSnapshot>;

    /// Installed packages visible to `caller`
    fn filtered_snapshot(&self, caller: CallerInfo) -> Arc<PackageSnapshot>;

    /// Whether `package_name` is the System UI package
    fn is_system_ui_package(&self, package_name: &str) -> bool;

    /// Whether `package_name` holds the home role
    fn is_launcher_package(&self, package_name: &str) -> bool;

    /// Ids of users that exist and are not being removed
    fn user_ids(&self) -> Vec<u32>;

    /// Whether hibernation deletes compiled artifacts
    fn is_oat_artifact_deletion_enabled(&self) -> bool;
}

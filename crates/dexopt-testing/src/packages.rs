//! Package fixtures and an in-memory package repository

use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;

use dexopt_core::{
    AndroidPackage, CallerInfo, PackageRepository, PackageSnapshot, PackageState, SharedLibrary,
    SharedLibraryKind, Split,
};

/// Builder for [`PackageState`] fixtures.
///
/// Defaults to a regular app with a base APK at `/data/app/<name>/base.apk`, installed for
/// user 0, targeting SDK 34.
#[derive(Debug, Clone)]
pub struct PackageBuilder {
    state: PackageState,
}

impl PackageBuilder {
    /// Start a fixture for `package_name`
    pub fn new(package_name: &str) -> Self {
        let mut first_install = FxHashMap::default();
        first_install.insert(0, 1_000);
        Self {
            state: PackageState {
                package_name: package_name.to_string(),
                app_id: 10_001,
                primary_cpu_abi: None,
                secondary_cpu_abi: None,
                seinfo: "default".to_string(),
                hidden_api_enforcement_disabled: false,
                shared_library_dependencies: Vec::new(),
                first_install_time_ms_by_user: first_install,
                hibernating_globally: false,
                android_package: Some(AndroidPackage {
                    splits: vec![Split {
                        name: None,
                        path: format!("/data/app/{}/base.apk", package_name),
                        has_code: true,
                        class_loader_context: Some("PCL[]".to_string()),
                    }],
                    storage_uuid: None,
                    is_vm_safe_mode: false,
                    is_debuggable: false,
                    is_use_embedded_dex: false,
                    is_shared_library: false,
                    target_sdk_version: 34,
                    version_name: "1.0".to_string(),
                    long_version_code: 1,
                }),
            },
        }
    }

    /// Set the app id
    pub fn app_id(mut self, app_id: i32) -> Self {
        self.state.app_id = app_id;
        self
    }

    /// Set the primary and secondary native ABIs
    pub fn abis(mut self, primary: Option<&str>, secondary: Option<&str>) -> Self {
        self.state.primary_cpu_abi = primary.map(str::to_string);
        self.state.secondary_cpu_abi = secondary.map(str::to_string);
        self
    }

    /// Add a split APK next to the base APK
    pub fn split(mut self, name: &str, has_code: bool) -> Self {
        let package_name = self.state.package_name.clone();
        if let Some(pkg) = self.state.android_package.as_mut() {
            pkg.splits.push(Split {
                name: Some(name.to_string()),
                path: format!("/data/app/{}/split_{}.apk", package_name, name),
                has_code,
                class_loader_context: Some("PCL[base.apk]".to_string()),
            });
        }
        self
    }

    /// Replace the base APK path
    pub fn base_path(mut self, path: &str) -> Self {
        if let Some(split) = self
            .state
            .android_package
            .as_mut()
            .and_then(|pkg| pkg.splits.first_mut())
        {
            split.path = path.to_string();
        }
        self
    }

    /// Whether the base APK has code
    pub fn base_has_code(mut self, has_code: bool) -> Self {
        if let Some(split) = self
            .state
            .android_package
            .as_mut()
            .and_then(|pkg| pkg.splits.first_mut())
        {
            split.has_code = has_code;
        }
        self
    }

    /// Class loader context of the base APK
    pub fn base_class_loader_context(mut self, clc: Option<&str>) -> Self {
        if let Some(split) = self
            .state
            .android_package
            .as_mut()
            .and_then(|pkg| pkg.splits.first_mut())
        {
            split.class_loader_context = clc.map(str::to_string);
        }
        self
    }

    /// Depend on a shared library
    pub fn shared_library(mut self, library: SharedLibrary) -> Self {
        self.state.shared_library_dependencies.push(library);
        self
    }

    /// Install on a non-default volume
    pub fn storage_uuid(mut self, uuid: &str) -> Self {
        if let Some(pkg) = self.state.android_package.as_mut() {
            pkg.storage_uuid = Some(uuid.to_string());
        }
        self
    }

    /// Set manifest flags
    pub fn flags(mut self, vm_safe_mode: bool, debuggable: bool, use_embedded_dex: bool) -> Self {
        if let Some(pkg) = self.state.android_package.as_mut() {
            pkg.is_vm_safe_mode = vm_safe_mode;
            pkg.is_debuggable = debuggable;
            pkg.is_use_embedded_dex = use_embedded_dex;
        }
        self
    }

    /// Mark the package as declaring a shared library
    pub fn is_shared_library(mut self, value: bool) -> Self {
        if let Some(pkg) = self.state.android_package.as_mut() {
            pkg.is_shared_library = value;
        }
        self
    }

    /// Set the global hibernation state
    pub fn hibernating(mut self, value: bool) -> Self {
        self.state.hibernating_globally = value;
        self
    }

    /// Set the first install time for `user_id`
    pub fn first_install_time(mut self, user_id: u32, time_ms: i64) -> Self {
        self.state
            .first_install_time_ms_by_user
            .insert(user_id, time_ms);
        self
    }

    /// Drop the APK, as for an APEX pseudo-package
    pub fn without_android_package(mut self) -> Self {
        self.state.android_package = None;
        self
    }

    /// Finish
    pub fn build(self) -> PackageState {
        self.state
    }
}

/// A Java shared library provided by `package_name` at `path`
pub fn shared_library(
    name: &str,
    package_name: &str,
    path: &str,
    kind: SharedLibraryKind,
) -> SharedLibrary {
    SharedLibrary {
        name: name.to_string(),
        package_name: package_name.to_string(),
        path: Some(path.to_string()),
        kind,
        is_native: false,
        dependencies: Vec::new(),
    }
}

/// Mutable state of [`FakePackageRepository`]
#[derive(Debug, Default)]
pub struct RepositoryState {
    /// Installed packages
    pub packages: Vec<PackageState>,
    /// Packages hidden from everyone but themselves in filtered snapshots
    pub hidden: FxHashSet<String>,
    /// The System UI package
    pub system_ui: Option<String>,
    /// Launcher packages
    pub launchers: FxHashSet<String>,
    /// Existing users
    pub user_ids: Vec<u32>,
    /// Whether hibernation deletes artifacts
    pub oat_artifact_deletion_enabled: bool,
}

/// In-memory [`PackageRepository`]
#[derive(Debug)]
pub struct FakePackageRepository {
    /// Contents
    pub state: RwLock<RepositoryState>,
}

impl FakePackageRepository {
    /// A repository with `packages` installed for user 0
    pub fn new(packages: Vec<PackageState>) -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(RepositoryState {
                packages,
                user_ids: vec![0],
                ..RepositoryState::default()
            }),
        })
    }

    /// Install or replace a package
    pub fn install(&self, package: PackageState) {
        let mut state = self.state.write();
        state
            .packages
            .retain(|p| p.package_name != package.package_name);
        state.packages.push(package);
    }

    /// Remove a package
    pub fn uninstall(&self, package_name: &str) {
        self.state
            .write()
            .packages
            .retain(|p| p.package_name != package_name);
    }
}

impl PackageRepository for FakePackageRepository {
    fn unfiltered_snapshot(&self) -> Arc<PackageSnapshot> {
        Arc::new(PackageSnapshot::new(self.state.read().packages.clone()))
    }

    fn filtered_snapshot(&self, caller: CallerInfo) -> Arc<PackageSnapshot> {
        let state = self.state.read();
        let caller_app_id = caller.app_id() as i32;
        Arc::new(PackageSnapshot::new(
            state
                .packages
                .iter()
                .filter(|p| !state.hidden.contains(&p.package_name) || p.app_id == caller_app_id)
                .cloned(),
        ))
    }

    fn is_system_ui_package(&self, package_name: &str) -> bool {
        self.state.read().system_ui.as_deref() == Some(package_name)
    }

    fn is_launcher_package(&self, package_name: &str) -> bool {
        self.state.read().launchers.contains(package_name)
    }

    fn user_ids(&self) -> Vec<u32> {
        self.state.read().user_ids.clone()
    }

    fn is_oat_artifact_deletion_enabled(&self) -> bool {
        self.state.read().oat_artifact_deletion_enabled
    }
}

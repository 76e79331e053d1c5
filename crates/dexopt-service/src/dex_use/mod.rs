//! Dex use tracking
//!
//! Records which packages load which dex files, so that dexopt can tell whether a file is
//! used by other apps and which secondary dex files an app loads at runtime. Reports come
//! from apps and are untrusted: every entry is validated before anything is recorded, and
//! entries whose owner cannot be determined are dropped.
//!
//! The registry is a best-effort cache persisted to a single file. Mutations schedule a
//! debounced save; a failed load starts from an empty registry.

pub mod clc;
pub mod codec;
pub mod locations;
pub mod model;
mod recent;

use dexopt_core::{
    ArtdRefCache, CallerInfo, Clock, DeviceAbis, Debouncer, FileVisibility, PackageRepository,
    PackageSnapshot, PackageState, SharedLibrary, SharedLibraryKind, SystemProperties,
    PLATFORM_PACKAGE_NAME,
};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use crate::config::DexUseConfig;
use crate::error::{DexUseError, DexUseResult};
use crate::utils::{self, AbiResolver};

use locations::SecondaryDexLocations;
use recent::RecentOwners;

pub use codec::CodecError;
pub use model::{
    aggregate_class_loader_contexts, is_used_by_other_apps, DexLoader, DexUse,
    UNSUPPORTED_CLASS_LOADER_CONTEXT, VARYING_CLASS_LOADER_CONTEXTS,
};

use model::{PrimaryDexUseRecord, SecondaryDexUse, SecondaryDexUseRecord};

/// Information about a secondary dex file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecondaryDexInfo {
    /// Absolute path of the file
    pub dex_path: String,
    /// User whose data directory holds the file
    pub user_id: u32,
    /// Aggregated class loader context, possibly one of the sentinels
    pub display_class_loader_context: String,
    /// ABIs of the loading processes
    pub abi_names: BTreeSet<String>,
    /// Entities that loaded the file
    pub loaders: BTreeSet<DexLoader>,
    /// Whether any loader is another app
    pub is_used_by_other_apps: bool,
    /// Visibility of the file on disk; `None` when the file was not checked
    pub file_visibility: Option<FileVisibility>,
}

impl SecondaryDexInfo {
    /// The class loader context to compile with, or `None` for the sentinels
    pub fn class_loader_context(&self) -> Option<&str> {
        let clc = self.display_class_loader_context.as_str();
        if clc == UNSUPPORTED_CLASS_LOADER_CONTEXT || clc == VARYING_CLASS_LOADER_CONTEXTS {
            None
        } else {
            Some(clc)
        }
    }
}

/// Who uses a secondary dex file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DexContainerFileUseInfo {
    /// Absolute path of the file
    pub dex_container_file: String,
    /// User whose data directory holds the file
    pub user_id: u32,
    /// Packages that loaded the file
    pub loading_packages: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Owner {
    Primary(String),
    Secondary(String),
    /// Known, but deliberately not recorded
    DontRecord,
}

struct State {
    dex_use: DexUse,
    loaded: bool,
    revision: u64,
    last_committed_revision: u64,
}

/// The dex use store
pub struct DexUseStore {
    config: DexUseConfig,
    packages: Arc<dyn PackageRepository>,
    artd: Arc<ArtdRefCache>,
    clock: Arc<dyn Clock>,
    props: Arc<dyn SystemProperties>,
    device: DeviceAbis,
    state: Mutex<State>,
    recent_owners: Mutex<RecentOwners>,
    locations: Mutex<SecondaryDexLocations>,
    saver: Debouncer,
    weak_self: Weak<DexUseStore>,
}

impl DexUseStore {
    /// Create an empty, unloaded store
    pub fn new(
        config: DexUseConfig,
        packages: Arc<dyn PackageRepository>,
        artd: Arc<ArtdRefCache>,
        clock: Arc<dyn Clock>,
        props: Arc<dyn SystemProperties>,
        device: DeviceAbis,
    ) -> std::io::Result<Arc<Self>> {
        let saver = Debouncer::new("dex-use-saver")?;
        let recent_capacity = config.recent_owner_cache_size;
        Ok(Arc::new_cyclic(|weak_self| Self {
            config,
            packages,
            artd,
            clock,
            props,
            device,
            state: Mutex::new(State {
                dex_use: DexUse::default(),
                loaded: false,
                revision: 0,
                last_committed_revision: 0,
            }),
            recent_owners: Mutex::new(RecentOwners::new(recent_capacity)),
            locations: Mutex::new(SecondaryDexLocations::default()),
            saver,
            weak_self: weak_self.clone(),
        }))
    }

    /// Path of the persisted log
    pub fn file(&self) -> &Path {
        &self.config.file
    }

    /// Load the persisted log. Must be called exactly once, before anything else.
    ///
    /// A missing or corrupt file is logged and yields an empty registry.
    pub fn load(&self) -> DexUseResult<()> {
        let parsed = match fs::read(&self.config.file) {
            Ok(bytes) => codec::decode(&bytes).map_err(|err| err.to_string()),
            Err(err) => Err(err.to_string()),
        };
        let mut dex_use = match parsed {
            Ok(dex_use) => Some(dex_use),
            Err(err) => {
                log::error!("Failed to load dex use data: {}", err);
                None
            }
        };
        if let Some(dex_use) = dex_use.as_mut() {
            self.drop_invalid_entries(dex_use);
        }

        let mut state = self.state.lock();
        if state.loaded {
            return Err(DexUseError::AlreadyLoaded);
        }
        state.loaded = true;
        state.dex_use = dex_use.unwrap_or_default();
        Ok(())
    }

    /// Skip entries that this version would not have recorded
    fn drop_invalid_entries(&self, dex_use: &mut DexUse) {
        dex_use.packages.retain(|owner, _| !owner.is_empty());
        for pkg in dex_use.packages.values_mut() {
            pkg.primary.retain(|dex_path, primary| {
                primary.records.retain(|loader, record| {
                    !loader.loading_package_name.is_empty() && record.last_used_at_ms > 0
                });
                !dex_path.is_empty() && !primary.records.is_empty()
            });
            pkg.secondary.retain(|dex_path, secondary| {
                if let Err(msg) = clc::validate_dex_path(dex_path) {
                    log::error!("{}", msg);
                    return false;
                }
                secondary.records.retain(|loader, record| {
                    if let Err(msg) =
                        clc::validate_class_loader_context(dex_path, &record.class_loader_context)
                    {
                        log::error!("{}", msg);
                        return false;
                    }
                    if !self.device.is_native_abi(&record.abi_name) {
                        // The native ABI set changed through an OTA since the record was made.
                        log::info!(
                            "Ignoring secondary dex use record with non-native ABI '{}' for '{}'",
                            record.abi_name,
                            dex_path
                        );
                        return false;
                    }
                    !loader.loading_package_name.is_empty() && record.last_used_at_ms > 0
                });
                !secondary.records.is_empty()
            });
        }
        dex_use.packages.retain(|_, pkg| !pkg.is_empty());
    }

    /// Record that `loading_package_name`, running as `caller`, loaded the given dex files.
    ///
    /// All entries are validated first; one bad entry rejects the whole call. Entries whose
    /// owner cannot be found are silently dropped.
    pub fn notify_dex_containers_loaded(
        &self,
        caller: CallerInfo,
        loading_package_name: &str,
        class_loader_context_by_dex_file: &BTreeMap<String, String>,
    ) -> DexUseResult<()> {
        // The platform reports system server loads, which are never dexopted here.
        if loading_package_name == PLATFORM_PACKAGE_NAME {
            return Ok(());
        }

        self.validate_inputs(class_loader_context_by_dex_file)?;

        let snapshot = self.packages.filtered_snapshot(caller);
        let loading_pkg = snapshot
            .get(loading_package_name)
            .cloned()
            .ok_or_else(|| DexUseError::UnknownPackage(loading_package_name.to_string()))?;
        let isolated_process = caller.is_isolated();
        let user_id = caller.user_id();
        let last_used_at_ms = self.clock.now_ms();

        for (dex_path, class_loader_context) in class_loader_context_by_dex_file {
            match self.find_owning_package(&snapshot, &loading_pkg, dex_path, user_id) {
                Some(Owner::Primary(owner)) => self.add_primary_dex_use(
                    &owner,
                    dex_path,
                    DexLoader::new(loading_package_name, isolated_process),
                    last_used_at_ms,
                ),
                Some(Owner::Secondary(owner)) => {
                    // An app is always launched with its primary ABI.
                    let abi = match AbiResolver::new(&self.device, self.props.as_ref())
                        .primary_abi(&loading_pkg)
                    {
                        Ok(abi) => abi,
                        Err(err) => {
                            log::error!(
                                "Failed to resolve the primary ABI of '{}': {}",
                                loading_package_name,
                                err
                            );
                            continue;
                        }
                    };
                    self.add_secondary_dex_use(
                        &owner,
                        dex_path,
                        user_id,
                        DexLoader::new(loading_package_name, isolated_process),
                        SecondaryDexUseRecord {
                            class_loader_context: class_loader_context.clone(),
                            abi_name: abi.name,
                            last_used_at_ms,
                        },
                    );
                }
                Some(Owner::DontRecord) | None => {}
            }
        }
        Ok(())
    }

    fn validate_inputs(&self, entries: &BTreeMap<String, String>) -> DexUseResult<()> {
        if entries.is_empty() {
            return Err(DexUseError::InvalidArgument("Nothing to record".to_string()));
        }

        let mut errors = Vec::new();
        for (dex_path, class_loader_context) in entries {
            if dex_path.len() > self.config.max_path_length {
                errors.push(format!(
                    "Dex path too long - exceeds {} chars",
                    self.config.max_path_length
                ));
                continue;
            }
            if let Err(msg) = clc::validate_dex_path(dex_path) {
                errors.push(msg);
                continue;
            }
            if class_loader_context.is_empty() {
                errors.push(format!("Empty class loader context for '{}'", dex_path));
                continue;
            }
            if class_loader_context.len() > self.config.max_class_loader_context_length {
                errors.push(format!(
                    "Class loader context too long - exceeds {} chars",
                    self.config.max_class_loader_context_length
                ));
                continue;
            }
            if let Err(msg) = clc::validate_class_loader_context(dex_path, class_loader_context)
            {
                errors.push(msg);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(DexUseError::InvalidArgument(errors.join("; ")))
        }
    }

    fn find_owning_package(
        &self,
        snapshot: &PackageSnapshot,
        loading_pkg: &PackageState,
        dex_path: &str,
        user_id: u32,
    ) -> Option<Owner> {
        // Most likely the package is loading its own file.
        if let Some(owner) = self.check_for_package(loading_pkg, dex_path, true, user_id) {
            return Some(owner);
        }

        // The owner comes from the unfiltered snapshot and must be visible to the caller.
        match self.check_for_all_packages(dex_path, user_id) {
            Some(Owner::Primary(owner)) if snapshot.contains(&owner) => Some(Owner::Primary(owner)),
            Some(Owner::Secondary(owner)) if snapshot.contains(&owner) => {
                Some(Owner::Secondary(owner))
            }
            // Expected for files in non-canonical locations or bogus paths.
            _ => None,
        }
    }

    /// Scan all packages for the owner, recently resolved owners first.
    ///
    /// The unfiltered snapshot is used because per-package visibility filtering costs more
    /// than the ownership check itself.
    fn check_for_all_packages(&self, dex_path: &str, user_id: u32) -> Option<Owner> {
        let unfiltered = self.packages.unfiltered_snapshot();
        let mut visited: FxHashSet<String> = FxHashSet::default();

        let mut visit = |package_name: &str| -> Option<Owner> {
            if !visited.insert(package_name.to_string()) {
                return None;
            }
            let Some(pkg) = unfiltered.get(package_name) else {
                self.recent_owners.lock().remove(dex_path);
                return None;
            };
            let owner = self.check_for_package(pkg, dex_path, true, user_id)?;
            self.recent_owners.lock().put(dex_path, package_name);
            Some(owner)
        };

        let cached = self.recent_owners.lock().get(dex_path);
        if let Some(package_name) = cached {
            if let Some(owner) = visit(&package_name) {
                return Some(owner);
            }
        }

        let recent = self.recent_owners.lock().owners_most_recent_first();
        for package_name in &recent {
            if let Some(owner) = visit(package_name) {
                return Some(owner);
            }
        }

        // Shared libraries are not checked here; the scan is O(n) either way.
        for pkg in unfiltered.iter() {
            if visited.contains(&pkg.package_name) {
                continue;
            }
            if let Some(owner) = self.check_for_package(pkg, dex_path, false, user_id) {
                self.recent_owners.lock().put(dex_path, &pkg.package_name);
                return Some(owner);
            }
        }
        None
    }

    fn check_for_package(
        &self,
        pkg: &PackageState,
        dex_path: &str,
        check_shared_libraries: bool,
        user_id: u32,
    ) -> Option<Owner> {
        let android_package = pkg.android_package.as_ref()?;
        if android_package.splits.iter().any(|split| split.path == dex_path) {
            return Some(Owner::Primary(pkg.package_name.clone()));
        }

        if check_shared_libraries {
            if let Some(owner) = check_for_shared_libraries(&pkg.shared_library_dependencies, dex_path)
            {
                return Some(owner);
            }
        }

        {
            let mut locations = self.locations.lock();
            if locations
                .locations(pkg, user_id)
                .iter()
                .any(|location| utils::path_starts_with(dex_path, location))
            {
                return Some(Owner::Secondary(pkg.package_name.clone()));
            }
        }

        let code_dir = android_package
            .base_split()
            .and_then(|base| base.path.rfind('/').map(|pos| &base.path[..=pos]));
        if let Some(code_dir) = code_dir {
            if utils::path_starts_with(dex_path, code_dir) {
                // Secondary dex files inside the package's code directory are not supported.
                return Some(Owner::DontRecord);
            }
        }
        None
    }

    fn add_primary_dex_use(
        &self,
        owner: &str,
        dex_path: &str,
        loader: DexLoader,
        last_used_at_ms: i64,
    ) {
        {
            let mut state = self.state.lock();
            let record = state
                .dex_use
                .packages
                .entry(owner.to_string())
                .or_default()
                .primary
                .entry(dex_path.to_string())
                .or_default()
                .records
                .entry(loader)
                .or_insert(PrimaryDexUseRecord { last_used_at_ms });
            record.last_used_at_ms = last_used_at_ms;
            state.revision += 1;
        }
        self.maybe_save_async();
    }

    fn add_secondary_dex_use(
        &self,
        owner: &str,
        dex_path: &str,
        user_id: u32,
        loader: DexLoader,
        record: SecondaryDexUseRecord,
    ) {
        {
            let mut state = self.state.lock();
            let pkg = state.dex_use.packages.entry(owner.to_string()).or_default();
            if !pkg.secondary.contains_key(dex_path)
                && pkg.secondary.len() >= self.config.max_secondary_dex_files_per_owner
            {
                log::warn!(
                    "Not recording too many secondary dex use entries for {}",
                    owner
                );
                if pkg.is_empty() {
                    state.dex_use.packages.remove(owner);
                }
                return;
            }
            let secondary = pkg
                .secondary
                .entry(dex_path.to_string())
                .or_insert_with(|| SecondaryDexUse::new(user_id));
            secondary.user_id = user_id;
            secondary.records.insert(loader, record);
            state.revision += 1;
        }
        self.maybe_save_async();
    }

    /// Entities that loaded a primary dex file of `package_name`
    pub fn get_primary_dex_loaders(&self, package_name: &str, dex_path: &str) -> BTreeSet<DexLoader> {
        let state = self.state.lock();
        state
            .dex_use
            .packages
            .get(package_name)
            .and_then(|pkg| pkg.primary.get(dex_path))
            .map(|primary| primary.records.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether a primary dex file of `package_name` is loaded by another app or an isolated
    /// process
    pub fn is_primary_dex_used_by_other_apps(&self, package_name: &str, dex_path: &str) -> bool {
        is_used_by_other_apps(
            &self.get_primary_dex_loaders(package_name, dex_path),
            package_name,
        )
    }

    /// Secondary dex files of `package_name` as recorded, without checking the disk.
    /// Only suitable for debugging output.
    pub fn get_secondary_dex_info(&self, package_name: &str) -> Vec<SecondaryDexInfo> {
        let entries = self.secondary_entries(package_name);
        entries
            .into_iter()
            .filter_map(|(dex_path, secondary)| {
                build_secondary_info(package_name, dex_path, &secondary, None, false)
            })
            .collect()
    }

    /// Secondary dex files of `package_name`, with their visibility checked through artd.
    ///
    /// With `exclude_obsolete`, files that are gone are dropped, and for private files only
    /// the owner's own non-isolated loader is kept.
    pub fn get_checked_secondary_dex_info(
        &self,
        package_name: &str,
        exclude_obsolete: bool,
    ) -> Vec<SecondaryDexInfo> {
        let entries = self.secondary_entries(package_name);
        entries
            .into_iter()
            .filter_map(|(dex_path, secondary)| {
                let visibility = self.get_dex_file_visibility(&dex_path);
                if visibility == FileVisibility::NotFound && exclude_obsolete {
                    return None;
                }
                build_secondary_info(
                    package_name,
                    dex_path,
                    &secondary,
                    Some(visibility),
                    exclude_obsolete,
                )
            })
            .collect()
    }

    fn secondary_entries(&self, package_name: &str) -> Vec<(String, SecondaryDexUse)> {
        let state = self.state.lock();
        state
            .dex_use
            .packages
            .get(package_name)
            .map(|pkg| {
                pkg.secondary
                    .iter()
                    .map(|(path, secondary)| (path.clone(), secondary.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Secondary dex files of `package_name` and who loads them
    pub fn get_secondary_dex_container_file_use_info(
        &self,
        package_name: &str,
    ) -> Vec<DexContainerFileUseInfo> {
        self.get_secondary_dex_info(package_name)
            .into_iter()
            .map(|info| DexContainerFileUseInfo {
                dex_container_file: info.dex_path,
                user_id: info.user_id,
                loading_packages: info
                    .loaders
                    .into_iter()
                    .map(|loader| loader.loading_package_name)
                    .collect(),
            })
            .collect()
    }

    /// Last time any dex file of the package was loaded, or 0
    pub fn get_package_last_used_at_ms(&self, package_name: &str) -> i64 {
        let state = self.state.lock();
        state
            .dex_use
            .packages
            .get(package_name)
            .map(|pkg| pkg.last_used_at_ms())
            .unwrap_or(0)
    }

    /// The context `loader` reported for a secondary dex file
    pub fn get_secondary_class_loader_context(
        &self,
        owner: &str,
        dex_path: &str,
        loader: &DexLoader,
    ) -> Option<String> {
        let state = self.state.lock();
        state
            .dex_use
            .packages
            .get(owner)
            .and_then(|pkg| pkg.secondary.get(dex_path))
            .and_then(|secondary| secondary.records.get(loader))
            .map(|record| record.class_loader_context.clone())
    }

    fn get_dex_file_visibility(&self, dex_path: &str) -> FileVisibility {
        let _pin = self.artd.pin();
        let result = self
            .artd
            .artd()
            .and_then(|artd| artd.get_dex_file_visibility(dex_path));
        match result {
            Ok(visibility) => visibility,
            Err(err) => {
                self.artd.notify_error(&err);
                log::error!("Failed to get visibility of {}: {}", dex_path, err);
                FileVisibility::NotFound
            }
        }
    }

    /// Remove records of uninstalled packages, deleted files, and loaders that can no
    /// longer read a file.
    ///
    /// Visibility is resolved without holding the lock. Entries added concurrently after
    /// the first pass are left for the next run.
    pub fn cleanup(&self) {
        let package_names: FxHashSet<String> = self
            .packages
            .unfiltered_snapshot()
            .iter()
            .map(|pkg| pkg.package_name.clone())
            .collect();

        let dex_paths = self.state.lock().dex_use.dex_paths();
        let visibility_by_path: FxHashMap<String, FileVisibility> = dex_paths
            .into_iter()
            .map(|path| {
                let visibility = self.get_dex_file_visibility(&path);
                (path, visibility)
            })
            .collect();

        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let mut removed = 0u64;
            state.dex_use.packages.retain(|owner, pkg| {
                if !package_names.contains(owner) {
                    removed += 1;
                    return false;
                }
                pkg.primary.retain(|dex_path, primary| {
                    retain_dex_file(
                        dex_path,
                        &mut primary.records,
                        &visibility_by_path,
                        &package_names,
                        owner,
                        &mut removed,
                    )
                });
                pkg.secondary.retain(|dex_path, secondary| {
                    retain_dex_file(
                        dex_path,
                        &mut secondary.records,
                        &visibility_by_path,
                        &package_names,
                        owner,
                        &mut removed,
                    )
                });
                if pkg.is_empty() {
                    removed += 1;
                    return false;
                }
                true
            });
            state.revision += removed;
        }

        self.maybe_save_async();
    }

    /// Pretty JSON of the whole registry
    pub fn dump(&self) -> String {
        let state = self.state.lock();
        serde_json::to_string_pretty(&state.dex_use)
            .unwrap_or_else(|err| format!("Failed to dump dex use data: {}", err))
    }

    /// Copy of the registry
    pub fn snapshot(&self) -> DexUse {
        self.state.lock().dex_use.clone()
    }

    /// Mutation counter; grows on every change
    pub fn revision(&self) -> u64 {
        self.state.lock().revision
    }

    /// Save synchronously on the shutdown signal
    pub fn shutdown(&self) {
        self.saver.cancel();
        self.save();
    }

    fn maybe_save_async(&self) {
        if self.saver.has_pending() {
            return;
        }
        let store = self.weak_self.clone();
        self.saver.post(self.config.save_interval(), move || {
            if let Some(store) = store.upgrade() {
                store.save();
            }
        });
    }

    /// Write the registry if it changed since the last commit.
    ///
    /// The data goes to a temporary file in the same directory, which is renamed over the
    /// target only if no newer revision was committed meanwhile.
    pub fn save(&self) {
        let (bytes, this_revision) = {
            let state = self.state.lock();
            if state.revision <= state.last_committed_revision {
                return;
            }
            (codec::encode(&state.dex_use), state.revision)
        };

        let tmp = temp_path_for(&self.config.file);
        let result = write_file(&tmp, &bytes).and_then(|()| {
            let mut state = self.state.lock();
            // Another save may have committed a newer revision since the check above.
            if this_revision > state.last_committed_revision {
                fs::rename(&tmp, &self.config.file)?;
                state.last_committed_revision = this_revision;
            }
            Ok(())
        });
        if let Err(err) = result {
            log::error!("Failed to save dex use data: {}", err);
        }
        if tmp.exists() {
            let _ = fs::remove_file(&tmp);
        }
    }
}

fn check_for_shared_libraries(libraries: &[SharedLibrary], dex_path: &str) -> Option<Owner> {
    for library in libraries {
        if library.is_native {
            continue;
        }
        if library.path.as_deref() == Some(dex_path) {
            // Builtin libraries are used by other apps anyway.
            if library.kind == SharedLibraryKind::Builtin {
                return Some(Owner::DontRecord);
            }
            return Some(Owner::Primary(library.package_name.clone()));
        }
        if let Some(owner) = check_for_shared_libraries(&library.dependencies, dex_path) {
            return Some(owner);
        }
    }
    None
}

fn build_secondary_info(
    owner: &str,
    dex_path: String,
    secondary: &SecondaryDexUse,
    visibility: Option<FileVisibility>,
    exclude_obsolete: bool,
) -> Option<SecondaryDexInfo> {
    let private = visibility.map_or(false, |v| v != FileVisibility::OtherReadable);
    let records: Vec<(&DexLoader, &SecondaryDexUseRecord)> = if private && exclude_obsolete {
        let same_app = DexLoader::new(owner, false);
        secondary
            .records
            .iter()
            .filter(|(loader, _)| **loader == same_app)
            .collect()
    } else {
        secondary.records.iter().collect()
    };
    if records.is_empty() {
        return None;
    }

    let display_class_loader_context = aggregate_class_loader_contexts(
        records
            .iter()
            .map(|(_, record)| record.class_loader_context.as_str()),
    );
    // Loaders with unsupported contexts still count: the vdex file is usable to them.
    let abi_names = records
        .iter()
        .map(|(_, record)| record.abi_name.clone())
        .collect();
    let loaders: BTreeSet<DexLoader> = records.iter().map(|(loader, _)| (*loader).clone()).collect();
    let is_used_by_other_apps = is_used_by_other_apps(&loaders, owner);
    Some(SecondaryDexInfo {
        dex_path,
        user_id: secondary.user_id,
        display_class_loader_context,
        abi_names,
        loaders,
        is_used_by_other_apps,
        file_visibility: visibility,
    })
}

/// Second-pass decision for one dex file; returns whether the file entry survives
fn retain_dex_file<R>(
    dex_path: &str,
    records: &mut BTreeMap<DexLoader, R>,
    visibility_by_path: &FxHashMap<String, FileVisibility>,
    package_names: &FxHashSet<String>,
    owner: &str,
    removed: &mut u64,
) -> bool {
    let Some(&visibility) = visibility_by_path.get(dex_path) else {
        // Added after the first pass.
        return true;
    };
    if visibility == FileVisibility::NotFound {
        *removed += 1;
        return false;
    }

    let before = records.len();
    records.retain(|loader, _| {
        if !package_names.contains(&loader.loading_package_name) {
            return false;
        }
        // The file became private since the load; other apps cannot read it anymore.
        !(visibility == FileVisibility::NotOtherReadable && loader.is_other_app(owner))
    });
    *removed += (before - records.len()) as u64;

    if records.is_empty() {
        *removed += 1;
        return false;
    }
    true
}

fn temp_path_for(file: &Path) -> PathBuf {
    let name = file
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "dex-use".to_string());
    file.with_file_name(format!("{}.{:08x}.tmp", name, rand::random::<u32>()))
}

fn write_file(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use dexopt_core::{MemoryProperties, SystemClock};
    use dexopt_testing::{FakeArtd, FakeArtdConnector, FakePackageRepository, PackageBuilder};
    use std::time::Duration;

    fn store_in(dir: &Path) -> Arc<DexUseStore> {
        let packages = FakePackageRepository::new(vec![
            PackageBuilder::new("com.owner").app_id(10_001).build(),
            PackageBuilder::new("com.loader").app_id(10_002).build(),
        ]);
        let artd = FakeArtd::new();
        let cache =
            ArtdRefCache::new(FakeArtdConnector::new(artd), Duration::from_secs(60)).unwrap();
        let config = DexUseConfig {
            file: dir.join("dex-use.pb"),
            max_secondary_dex_files_per_owner: 2,
            ..DexUseConfig::default()
        };
        let props = MemoryProperties::new();
        let device = DeviceAbis {
            native_64: Some("arm64-v8a".to_string()),
            native_32: Some("armeabi-v7a".to_string()),
            preferred: "arm64-v8a".to_string(),
        };
        DexUseStore::new(
            config,
            packages,
            cache,
            Arc::new(SystemClock),
            Arc::new(props),
            device,
        )
        .unwrap()
    }

    fn entries(items: &[(&str, &str)]) -> BTreeMap<String, String> {
        items
            .iter()
            .map(|(path, clc)| (path.to_string(), clc.to_string()))
            .collect()
    }

    #[test]
    fn test_load_twice_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store.load().unwrap();
        assert_eq!(store.load(), Err(DexUseError::AlreadyLoaded));
    }

    #[test]
    fn test_secondary_cap_per_owner() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store.load().unwrap();
        let caller = CallerInfo::new(0, 10_001);
        for name in ["a", "b", "c"] {
            let path = format!("/data/user/0/com.owner/{}.jar", name);
            store
                .notify_dex_containers_loaded(caller, "com.owner", &entries(&[(&path, "PCL[]")]))
                .unwrap();
        }
        assert_eq!(store.get_secondary_dex_info("com.owner").len(), 2);
    }

    #[test]
    fn test_code_dir_files_are_not_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store.load().unwrap();
        let caller = CallerInfo::new(0, 10_001);
        store
            .notify_dex_containers_loaded(
                caller,
                "com.owner",
                &entries(&[("/data/app/com.owner/extra.jar", "PCL[]")]),
            )
            .unwrap();
        assert_eq!(store.snapshot(), DexUse::default());
        assert_eq!(store.revision(), 0);
    }

    #[test]
    fn test_platform_package_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store.load().unwrap();
        store
            .notify_dex_containers_loaded(
                CallerInfo::new(0, 1000),
                PLATFORM_PACKAGE_NAME,
                &entries(&[("/system/framework/services.jar", "PCL[]")]),
            )
            .unwrap();
        assert_eq!(store.revision(), 0);
    }

    #[test]
    fn test_dump_is_json() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store.load().unwrap();
        store
            .notify_dex_containers_loaded(
                CallerInfo::new(0, 10_002),
                "com.loader",
                &entries(&[("/data/app/com.owner/base.apk", "PCL[]")]),
            )
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&store.dump()).unwrap();
        assert!(value["packages"]["com.owner"]["primary"]["/data/app/com.owner/base.apk"]
            ["records"]["com.loader"]
            .is_object());
    }
}

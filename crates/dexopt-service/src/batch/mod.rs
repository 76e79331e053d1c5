//! Batch dexopt and package-level artifact management
//!
//! [`ArtManager`] is the entry point the rest of the system talks to. It selects packages
//! for a batch run, drives the downgrade, main and supplementary passes, and keeps
//! [`cleanup`](ArtManager::cleanup) from running while any package is being compiled.

pub mod file_manager;
mod helper;

use dexopt_core::packages::SYSTEM_UID;
use dexopt_core::{
    log_artd_error, ArtdError, ArtifactStore, CancellationSignal, CleanupKeepLists, FsPermission,
    MergeProfileOptions, OutputProfile, PackageSnapshot, PackageState, ProfilePath,
    TmpProfilePath, WritableProfilePath,
};
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use crate::callbacks::Callbacks;
use crate::config::BatchConfig;
use crate::dexopter::primary::{
    dex_metadata_info, primary_cur_profiles, primary_dex_info, primary_external_profiles,
    primary_ref_profile,
};
use crate::dexopter::result::DexoptOutcome;
use crate::dexopter::DexoptContext;
use crate::error::{check, DexoptError, DexoptResult};
use crate::params::{BatchDexoptParams, DexoptFlags, DexoptParams};
use crate::pre_reboot::PreRebootJob;
use crate::reason;
use crate::utils;

use file_manager::{ArtFileManager, DetailedDexInfo, FileOptions};
use helper::DexoptHelper;

pub use helper::{OperationProgress, ProgressCallback};

/// Days of inactivity after which an app counts as inactive
pub const DOWNGRADE_AFTER_INACTIVE_DAYS_PROPERTY: &str = "pm.dexopt.downgrade_after_inactive_days";

const MS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

/// Passes of a batch dexopt run, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BatchDexoptPass {
    /// Downgrade inactive apps to free space
    Downgrade,
    /// Dexopt the selected packages
    Main,
    /// Re-dexopt packages whose profiles changed during the main pass
    Supplementary,
}

/// Bytes freed by [`ArtManager::delete_dexopt_artifacts`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeleteResult {
    /// Total size of the deleted files
    pub freed_bytes: i64,
}

/// Dexopt state of one dex container file for one ABI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DexContainerFileDexoptStatus {
    /// Absolute path of the file
    pub dex_container_file: String,
    /// Whether it is an APK
    pub is_primary_dex: bool,
    /// Whether `abi` is the app's primary ABI
    pub is_primary_abi: bool,
    /// ABI name
    pub abi: String,
    /// Filter of the existing artifacts, or "error"
    pub compiler_filter: String,
    /// Reason recorded with the artifacts, or "error"
    pub compilation_reason: String,
    /// Where the artifacts were looked up, or the error message
    pub location_debug_string: String,
}

impl DexContainerFileDexoptStatus {
    fn error(dex: &DetailedDexInfo, abi: &utils::Abi, message: String) -> Self {
        Self {
            dex_container_file: dex.dex_path().to_string(),
            is_primary_dex: dex.is_primary(),
            is_primary_abi: abi.is_primary,
            abi: abi.name.clone(),
            compiler_filter: "error".to_string(),
            compilation_reason: "error".to_string(),
            location_debug_string: message,
        }
    }
}

/// Dexopt state of a package
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PackageDexoptStatus {
    /// One entry per (file, ABI)
    pub dex_container_file_dexopt_statuses: Vec<DexContainerFileDexoptStatus>,
}

/// Package-level dexopt operations
pub struct ArtManager {
    ctx: DexoptContext,
    config: BatchConfig,
    cleanup_lock: RwLock<()>,
    pre_reboot: OnceCell<Arc<PreRebootJob>>,
}

impl ArtManager {
    /// Create a manager
    pub fn new(ctx: DexoptContext, config: BatchConfig) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            config,
            cleanup_lock: RwLock::new(()),
            pre_reboot: OnceCell::new(),
        })
    }

    /// Attach the pre-reboot job. Only the first call has an effect.
    pub fn set_pre_reboot_job(&self, job: Arc<PreRebootJob>) {
        if self.pre_reboot.set(job).is_err() {
            log::warn!("Pre-reboot job already set");
        }
    }

    /// Shared collaborators
    pub fn context(&self) -> &DexoptContext {
        &self.ctx
    }

    /// Registered hooks
    pub fn callbacks(&self) -> &Callbacks {
        &self.ctx.callbacks
    }

    fn artd(&self) -> DexoptResult<Arc<dyn ArtifactStore>> {
        Ok(self.ctx.artd.artd()?)
    }

    fn log_artd(&self, err: &ArtdError) {
        self.ctx.artd.notify_error(err);
        log_artd_error(err);
    }

    /// Dexopt a single package
    pub fn dexopt_package(
        &self,
        snapshot: &PackageSnapshot,
        package_name: &str,
        params: &DexoptParams,
        cancellation: &CancellationSignal,
    ) -> DexoptResult<DexoptOutcome> {
        let _pin = self.ctx.artd.pin();
        DexoptHelper::new(&self.ctx, &self.cleanup_lock).dexopt(
            snapshot,
            &[package_name.to_string()],
            params,
            cancellation,
            1,
            None,
        )
    }

    /// Run a batch dexopt for `reason` and return the result of every pass that ran
    pub fn dexopt_packages(
        &self,
        snapshot: &PackageSnapshot,
        reason: &str,
        cancellation: &CancellationSignal,
        progress: Option<&FxHashMap<BatchDexoptPass, ProgressCallback>>,
    ) -> DexoptResult<BTreeMap<BatchDexoptPass, DexoptOutcome>> {
        if !reason::BATCH_DEXOPT_REASONS.contains(&reason) {
            return Err(DexoptError::InvalidArgument(format!(
                "Invalid batch dexopt reason '{}'",
                reason
            )));
        }

        let batch = self.batch_params(snapshot, reason, cancellation)?;
        self.run_batch(snapshot, reason, &batch, cancellation, progress)
    }

    /// Run the passes of a batch with params from [`batch_params`](Self::batch_params)
    pub(crate) fn run_batch(
        &self,
        snapshot: &PackageSnapshot,
        reason: &str,
        batch: &BatchDexoptParams,
        cancellation: &CancellationSignal,
        progress: Option<&FxHashMap<BatchDexoptPass, ProgressCallback>>,
    ) -> DexoptResult<BTreeMap<BatchDexoptPass, DexoptOutcome>> {
        let concurrency = reason::concurrency_for_reason(self.ctx.props.as_ref(), reason);
        let progress_for = |pass: BatchDexoptPass| progress.and_then(|map| map.get(&pass));
        let helper = DexoptHelper::new(&self.ctx, &self.cleanup_lock);
        let _pin = self.ctx.artd.pin();

        let mut results = BTreeMap::new();

        if reason == reason::BG_DEXOPT {
            if let Some(outcome) = self.maybe_downgrade(
                &helper,
                snapshot,
                &batch.packages,
                cancellation,
                concurrency,
                progress_for(BatchDexoptPass::Downgrade),
            )? {
                results.insert(BatchDexoptPass::Downgrade, outcome);
            }
        }

        log::info!(
            "Dexopting {} packages with reason={}",
            batch.packages.len(),
            reason
        );
        let main = helper.dexopt(
            snapshot,
            &batch.packages,
            &batch.dexopt_params,
            cancellation,
            concurrency,
            progress_for(BatchDexoptPass::Main),
        )?;

        // Profiles may have changed while the main pass was running. Packages that were
        // skipped with a profile-guided filter get another chance.
        let supplementary = if reason == reason::BG_DEXOPT
            && !batch
                .dexopt_params
                .flags()
                .contains(DexoptFlags::FORCE_MERGE_PROFILE)
        {
            let packages: Vec<String> = main
                .package_dexopt_results
                .iter()
                .filter(|result| result.skipped_with_profile_guided_filter())
                .map(|result| result.package_name.clone())
                .collect();
            Some(packages)
        } else {
            None
        };
        results.insert(BatchDexoptPass::Main, main);

        if let Some(packages) = supplementary {
            let params = batch
                .dexopt_params
                .to_builder()
                .flags(
                    DexoptFlags::FORCE_MERGE_PROFILE,
                    DexoptFlags::FORCE_MERGE_PROFILE,
                )
                .build(self.ctx.props.as_ref())?;
            log::info!(
                "Dexopting {} packages with reason={} (supplementary pass)",
                packages.len(),
                reason
            );
            let outcome = helper.dexopt(
                snapshot,
                &packages,
                &params,
                cancellation,
                concurrency,
                progress_for(BatchDexoptPass::Supplementary),
            )?;
            results.insert(BatchDexoptPass::Supplementary, outcome);
        }

        Ok(results)
    }

    /// Packages and params for a batch run, after the batch start callback had its say
    pub(crate) fn batch_params(
        &self,
        snapshot: &PackageSnapshot,
        reason: &str,
        cancellation: &CancellationSignal,
    ) -> DexoptResult<BatchDexoptParams> {
        let props = self.ctx.props.as_ref();
        let default_packages = self.default_packages(snapshot, reason);
        let mut batch = BatchDexoptParams {
            packages: default_packages.clone(),
            dexopt_params: DexoptParams::builder(reason).build(props)?,
        };

        if let Some(callback) = self.ctx.callbacks.batch_dexopt_start() {
            callback(snapshot, reason, &default_packages, &mut batch, cancellation);
            check(batch.dexopt_params.reason() == reason, || {
                format!(
                    "Changing the reason from '{}' to '{}' is not allowed",
                    reason,
                    batch.dexopt_params.reason()
                )
            })?;
        }

        if batch.dexopt_params.split_name().is_some() {
            log::warn!("Batch dexopt does not support a split name. It is ignored");
            batch.dexopt_params = batch
                .dexopt_params
                .to_builder()
                .split_name(None)
                .flags(DexoptFlags::empty(), DexoptFlags::FOR_SINGLE_SPLIT)
                .build(props)?;
        }

        Ok(batch)
    }

    fn maybe_downgrade(
        &self,
        helper: &DexoptHelper<'_>,
        snapshot: &PackageSnapshot,
        excluded: &[String],
        cancellation: &CancellationSignal,
        concurrency: usize,
        progress: Option<&ProgressCallback>,
    ) -> DexoptResult<Option<DexoptOutcome>> {
        if !self.should_downgrade() {
            return Ok(None);
        }

        let packages: Vec<String> = self
            .default_packages(snapshot, reason::INACTIVE)
            .into_iter()
            .filter(|name| !excluded.contains(name))
            .collect();
        if packages.is_empty() {
            log::info!("Storage is low, but downgrading is disabled or there's nothing to downgrade");
            return Ok(None);
        }

        log::info!("Storage is low. Downgrading {} inactive packages", packages.len());
        let params = DexoptParams::builder(reason::INACTIVE).build(self.ctx.props.as_ref())?;
        helper
            .dexopt(snapshot, &packages, &params, cancellation, concurrency, progress)
            .map(Some)
    }

    fn should_downgrade(&self) -> bool {
        match self.ctx.storage.allocatable_bytes(None) {
            Ok(bytes) => {
                bytes
                    < self
                        .config
                        .storage_low_bytes
                        .saturating_add(self.config.downgrade_threshold_above_low_bytes)
            }
            Err(err) => {
                log::error!("Failed to check storage. Assuming storage not low: {}", err);
                false
            }
        }
    }

    /// Packages a batch run for `reason` covers when no callback overrides them
    pub fn default_packages(&self, snapshot: &PackageSnapshot, reason: &str) -> Vec<String> {
        let user_ids = self.ctx.packages.user_ids();
        let mut candidates: Vec<(&Arc<PackageState>, i64)> = snapshot
            .iter()
            .filter(|pkg| utils::can_dexopt_package(pkg, self.ctx.packages.as_ref()))
            .map(|pkg| {
                let last_active =
                    utils::package_last_active_time_ms(pkg, &self.ctx.dex_use, &user_ids);
                (pkg, last_active)
            })
            .collect();

        match reason {
            reason::FIRST_BOOT => {}
            reason::BOOT_AFTER_MAINLINE_UPDATE => {
                candidates.retain(|(pkg, _)| {
                    self.ctx.packages.is_system_ui_package(&pkg.package_name)
                        || self.ctx.packages.is_launcher_package(&pkg.package_name)
                });
            }
            reason::INACTIVE => {
                let threshold = self.inactive_threshold_ms();
                candidates.retain(|(_, last_active)| *last_active <= threshold);
                candidates.sort_by(|(a, a_time), (b, b_time)| {
                    a_time.cmp(b_time).then_with(|| a.package_name.cmp(&b.package_name))
                });
            }
            _ => {
                let threshold = self.inactive_threshold_ms();
                candidates.retain(|(_, last_active)| *last_active > threshold);
                candidates.sort_by(|(a, a_time), (b, b_time)| {
                    b_time.cmp(a_time).then_with(|| a.package_name.cmp(&b.package_name))
                });
            }
        }

        candidates
            .into_iter()
            .map(|(pkg, _)| pkg.package_name.clone())
            .collect()
    }

    fn inactive_threshold_ms(&self) -> i64 {
        let days = self
            .ctx
            .props
            .get_int(DOWNGRADE_AFTER_INACTIVE_DAYS_PROPERTY, i32::MAX as i64);
        self.ctx
            .clock
            .now_ms()
            .saturating_sub(days.saturating_mul(MS_PER_DAY))
    }

    fn package_with_apk(
        snapshot: &PackageSnapshot,
        package_name: &str,
    ) -> DexoptResult<(Arc<PackageState>, dexopt_core::AndroidPackage)> {
        let pkg = utils::package_state_or_err(snapshot, package_name)?;
        let android_package = pkg.android_package.clone().ok_or_else(|| {
            DexoptError::IllegalState(format!("Unable to get package '{}'", package_name))
        })?;
        Ok((pkg, android_package))
    }

    /// Delete the compiled artifacts of a package, including runtime images and secure
    /// dex metadata companions
    pub fn delete_dexopt_artifacts(
        &self,
        snapshot: &PackageSnapshot,
        package_name: &str,
    ) -> DexoptResult<DeleteResult> {
        let (pkg, android_package) = Self::package_with_apk(snapshot, package_name)?;
        let _pin = self.ctx.artd.pin();

        let freed = (|| -> DexoptResult<i64> {
            let artd = self.artd()?;
            let lists = ArtFileManager::new(&self.ctx, artd.as_ref()).writable_artifacts(
                &pkg,
                &android_package,
                FileOptions::all(),
            )?;
            let mut freed_bytes = 0;
            for artifacts in &lists.artifacts {
                freed_bytes += artd.delete_artifacts(artifacts)?;
            }
            for runtime in &lists.runtime_artifacts {
                freed_bytes += artd.delete_runtime_artifacts(runtime)?;
            }
            for sdm_sdc in &lists.sdm_sdc_files {
                freed_bytes += artd.delete_sdm_sdc_files(sdm_sdc)?;
            }
            Ok(freed_bytes)
        })();

        match freed {
            Ok(freed_bytes) => Ok(DeleteResult { freed_bytes }),
            Err(DexoptError::Artd(err)) => {
                self.log_artd(&err);
                Ok(DeleteResult::default())
            }
            Err(err) => Err(err),
        }
    }

    /// Dexopt state of every (file, ABI) of a package selected by `flags`
    pub fn get_dexopt_status(
        &self,
        snapshot: &PackageSnapshot,
        package_name: &str,
        flags: DexoptFlags,
    ) -> DexoptResult<PackageDexoptStatus> {
        if !flags.intersects(DexoptFlags::FOR_PRIMARY_DEX | DexoptFlags::FOR_SECONDARY_DEX) {
            return Err(DexoptError::InvalidArgument(
                "Nothing to check: neither primary nor secondary dex files are selected"
                    .to_string(),
            ));
        }
        let (pkg, android_package) = Self::package_with_apk(snapshot, package_name)?;
        let _pin = self.ctx.artd.pin();
        let artd = match self.artd() {
            Ok(artd) => artd,
            Err(DexoptError::Artd(err)) => {
                self.log_artd(&err);
                return Ok(PackageDexoptStatus::default());
            }
            Err(err) => return Err(err),
        };

        let options = FileOptions {
            for_primary_dex: flags.contains(DexoptFlags::FOR_PRIMARY_DEX),
            for_secondary_dex: flags.contains(DexoptFlags::FOR_SECONDARY_DEX),
            exclude_obsolete: true,
        };
        let pairs = ArtFileManager::new(&self.ctx, artd.as_ref()).dex_and_abis(
            &pkg,
            &android_package,
            options,
        )?;

        let mut statuses = Vec::with_capacity(pairs.len());
        for (dex, abi) in &pairs {
            match artd.get_dexopt_status(dex.dex_path(), &abi.isa, dex.class_loader_context()) {
                Ok(status) => statuses.push(DexContainerFileDexoptStatus {
                    dex_container_file: dex.dex_path().to_string(),
                    is_primary_dex: dex.is_primary(),
                    is_primary_abi: abi.is_primary,
                    abi: abi.name.clone(),
                    compiler_filter: status.compiler_filter,
                    compilation_reason: status.compilation_reason,
                    location_debug_string: status.location_debug_string,
                }),
                Err(err) if err.is_service_specific() => {
                    statuses.push(DexContainerFileDexoptStatus::error(
                        dex,
                        abi,
                        err.message().to_string(),
                    ));
                }
                Err(err) => {
                    self.log_artd(&err);
                    let message = err.to_string();
                    statuses = pairs
                        .iter()
                        .map(|(dex, abi)| {
                            DexContainerFileDexoptStatus::error(dex, abi, message.clone())
                        })
                        .collect();
                    break;
                }
            }
        }

        Ok(PackageDexoptStatus {
            dex_container_file_dexopt_statuses: statuses,
        })
    }

    /// Delete the reference and current profiles of a package
    pub fn clear_app_profiles(
        &self,
        snapshot: &PackageSnapshot,
        package_name: &str,
    ) -> DexoptResult<()> {
        let (pkg, android_package) = Self::package_with_apk(snapshot, package_name)?;
        let _pin = self.ctx.artd.pin();

        let cleared = (|| -> DexoptResult<()> {
            let artd = self.artd()?;
            let profiles = ArtFileManager::new(&self.ctx, artd.as_ref()).profiles(
                &pkg,
                &android_package,
                FileOptions::all(),
            );
            for profile in profiles.all_profiles() {
                artd.delete_profile(&profile)?;
            }
            Ok(())
        })();

        match cleared {
            Err(DexoptError::Artd(err)) => {
                self.log_artd(&err);
                Ok(())
            }
            other => other,
        }
    }

    /// Delete artifacts and profiles, then dexopt the package as if it were just installed
    pub fn reset_dexopt_status(
        &self,
        snapshot: &PackageSnapshot,
        package_name: &str,
        cancellation: &CancellationSignal,
    ) -> DexoptResult<DexoptOutcome> {
        self.delete_dexopt_artifacts(snapshot, package_name)?;
        self.clear_app_profiles(snapshot, package_name)?;

        let all = DexoptFlags::FOR_PRIMARY_DEX | DexoptFlags::FOR_SECONDARY_DEX;
        let params = DexoptParams::builder(reason::INSTALL)
            .flags(all, all)
            .build(self.ctx.props.as_ref())?;
        self.dexopt_package(snapshot, package_name, &params, cancellation)
    }

    /// Delete every file artd manages that no installed package can use. Returns the bytes
    /// freed. Blocks until no package is being dexopted.
    pub fn cleanup(&self, snapshot: &PackageSnapshot) -> DexoptResult<i64> {
        let _cleanup_guard = self.cleanup_lock.write();
        let _pin = self.ctx.artd.pin();

        self.ctx.dex_use.cleanup();

        let freed = (|| -> DexoptResult<i64> {
            let artd = self.artd()?;
            let file_manager = ArtFileManager::new(&self.ctx, artd.as_ref());
            let mut keep = CleanupKeepLists::default();

            for pkg in snapshot.iter() {
                let Some(android_package) = pkg.android_package.as_ref() else {
                    continue;
                };
                if !utils::is_dexoptable(pkg) {
                    continue;
                }

                let profiles = file_manager.profiles(
                    pkg,
                    android_package,
                    FileOptions {
                        exclude_obsolete: true,
                        ..FileOptions::all()
                    },
                );
                keep.profiles.extend(profiles.all_profiles());

                // Artifacts of hibernating apps are deleted when hibernation deletes them.
                if !utils::can_dexopt_package(pkg, self.ctx.packages.as_ref()) {
                    continue;
                }
                let usable = file_manager.usable_artifacts(pkg, android_package)?;
                keep.artifacts.extend(usable.artifacts);
                keep.vdex_files.extend(usable.vdex_files);
                keep.sdm_sdc_files.extend(usable.sdm_sdc_files);
                keep.runtime_artifacts.extend(usable.runtime_artifacts);
            }

            keep.keep_pre_reboot_staged_files = self
                .pre_reboot
                .get()
                .map(|job| job.has_started())
                .unwrap_or(false);
            Ok(artd.cleanup(&keep)?)
        })();

        match freed {
            Err(DexoptError::Artd(err)) => {
                self.log_artd(&err);
                Ok(0)
            }
            other => other,
        }
    }

    /// Promote staged pre-reboot outputs of every dexoptable package
    pub fn commit_pre_reboot_staged_files(&self, snapshot: &PackageSnapshot, for_secondary: bool) {
        let _pin = self.ctx.artd.pin();
        let artd = match self.ctx.artd.artd() {
            Ok(artd) => artd,
            Err(err) => {
                self.log_artd(&err);
                return;
            }
        };
        let file_manager = ArtFileManager::new(&self.ctx, artd.as_ref());
        let options = FileOptions {
            for_primary_dex: !for_secondary,
            for_secondary_dex: for_secondary,
            exclude_obsolete: false,
        };

        for pkg in snapshot.iter() {
            let Some(android_package) = pkg.android_package.as_ref() else {
                continue;
            };
            if !utils::can_dexopt_package(pkg, self.ctx.packages.as_ref()) {
                continue;
            }

            let committed = (|| -> DexoptResult<bool> {
                let artifacts = file_manager
                    .writable_artifacts(pkg, android_package, options)?
                    .artifacts;
                let profiles: Vec<WritableProfilePath> = file_manager
                    .profiles(pkg, android_package, options)
                    .ref_profiles
                    .into_iter()
                    .filter_map(writable_ref_profile)
                    .collect();
                Ok(artd.commit_pre_reboot_staged_files(&artifacts, &profiles)?)
            })();

            match committed {
                Ok(true) => log::info!(
                    "Committed Pre-reboot staged files for package '{}'",
                    pkg.package_name
                ),
                Ok(false) => {}
                Err(DexoptError::Artd(err)) if err.is_service_specific() => log::error!(
                    "Failed to commit Pre-reboot staged files for package '{}': {}",
                    pkg.package_name,
                    err
                ),
                Err(DexoptError::Artd(err)) => {
                    self.log_artd(&err);
                    return;
                }
                Err(err) => log::error!(
                    "Failed to commit Pre-reboot staged files for package '{}': {}",
                    pkg.package_name,
                    err
                ),
            }
        }
    }

    /// Boot-time dexopt. After an OTA or a Mainline update, the primary dex files staged by
    /// pre-reboot dexopt are committed first.
    pub fn on_boot(
        &self,
        snapshot: &PackageSnapshot,
        boot_reason: &str,
        progress: Option<ProgressCallback>,
    ) -> DexoptResult<BTreeMap<BatchDexoptPass, DexoptOutcome>> {
        if boot_reason == reason::BOOT_AFTER_OTA
            || boot_reason == reason::BOOT_AFTER_MAINLINE_UPDATE
        {
            self.commit_pre_reboot_staged_files(snapshot, false);
        }
        let progress = progress.map(|callback| {
            let mut map = FxHashMap::default();
            map.insert(BatchDexoptPass::Main, callback);
            map
        });
        self.dexopt_packages(
            snapshot,
            boot_reason,
            &CancellationSignal::new(),
            progress.as_ref(),
        )
    }

    /// Commit the secondary dex files staged by pre-reboot dexopt; their owners' data
    /// directories are only available once boot has completed
    pub fn on_boot_completed(&self, snapshot: &PackageSnapshot) {
        self.commit_pre_reboot_staged_files(snapshot, true);
    }

    /// A Mainline update was staged; start pre-reboot dexopt for it
    pub fn on_apex_staged(&self) {
        match self.pre_reboot.get() {
            Some(job) => job.on_update_ready(None),
            None => log::warn!("Pre-reboot job is not set up; ignoring staged APEX"),
        }
    }

    /// Merge the reference and current profiles of a split into a temporary profile.
    ///
    /// Returns `None` when the merged profile would be empty. The caller owns the returned
    /// file and releases it with [`release_profile`](Self::release_profile).
    pub fn snapshot_app_profile(
        &self,
        snapshot: &PackageSnapshot,
        package_name: &str,
        split_name: Option<&str>,
    ) -> DexoptResult<Option<TmpProfilePath>> {
        let options = MergeProfileOptions {
            force_merge: true,
            ..MergeProfileOptions::default()
        };
        self.merge_app_profile(snapshot, package_name, split_name, options)
    }

    /// Like [`snapshot_app_profile`](Self::snapshot_app_profile) but produces a text dump
    pub fn dump_app_profile(
        &self,
        snapshot: &PackageSnapshot,
        package_name: &str,
        split_name: Option<&str>,
        dump_classes_and_methods: bool,
    ) -> DexoptResult<Option<TmpProfilePath>> {
        let options = MergeProfileOptions {
            dump_only: !dump_classes_and_methods,
            dump_classes_and_methods,
            ..MergeProfileOptions::default()
        };
        self.merge_app_profile(snapshot, package_name, split_name, options)
    }

    /// Delete a profile returned by a snapshot or dump
    pub fn release_profile(&self, profile: TmpProfilePath) -> DexoptResult<()> {
        let _pin = self.ctx.artd.pin();
        Ok(self.artd()?.delete_profile(&ProfilePath::Tmp(profile))?)
    }

    fn merge_app_profile(
        &self,
        snapshot: &PackageSnapshot,
        package_name: &str,
        split_name: Option<&str>,
        options: MergeProfileOptions,
    ) -> DexoptResult<Option<TmpProfilePath>> {
        let (pkg, android_package) = Self::package_with_apk(snapshot, package_name)?;
        let info = primary_dex_info(&android_package)
            .into_iter()
            .find(|info| info.split_name.as_deref() == split_name)
            .ok_or_else(|| {
                DexoptError::InvalidArgument(format!(
                    "Split '{}' not found",
                    split_name.unwrap_or("base")
                ))
            })?;

        let _pin = self.ctx.artd.pin();
        let artd = self.artd()?;
        let output_for = || OutputProfile {
            profile_path: TmpProfilePath {
                final_path: WritableProfilePath::PrimaryRef {
                    package_name: pkg.package_name.clone(),
                    profile_name: info.profile_name(),
                    is_pre_reboot: false,
                },
                id: String::new(),
            },
            fs_permission: FsPermission {
                uid: SYSTEM_UID,
                gid: SYSTEM_UID,
                is_other_readable: false,
                is_other_executable: false,
            },
        };

        let dm_info = dex_metadata_info(artd.as_ref(), &info.dex_path)
            .map_err(|err| self.snapshot_error(err))?;
        let mut init_output = output_for();
        let init = utils::get_or_init_reference_profile(
            artd.as_ref(),
            &info.dex_path,
            &primary_ref_profile(&pkg.package_name, &info.profile_name()),
            &primary_external_profiles(&info.dex_path),
            dm_info.config.enable_embedded_profile,
            &mut init_output,
        )
        .map_err(|err| self.snapshot_error(err))?;
        if !init.external_profile_errors.is_empty() {
            log::error!(
                "Error occurred when initializing from external profiles: {:?}",
                init.external_profile_errors
            );
        }

        let mut profiles: Vec<ProfilePath> = init.profile.iter().cloned().collect();
        profiles.extend(primary_cur_profiles(
            &pkg.package_name,
            &info.profile_name(),
            &self.ctx.packages.user_ids(),
        ));

        let mut output = output_for();
        let merged = artd.merge_profiles(
            &profiles,
            None,
            &mut output,
            std::slice::from_ref(&info.dex_path),
            options,
        );

        if let Some(tmp) = init.profile.as_ref().filter(|profile| profile.is_tmp()) {
            if let Err(err) = artd.delete_profile(tmp) {
                log::error!("Failed to delete temporary profile {}: {}", tmp, err);
            }
        }

        match merged {
            Ok(true) => Ok(Some(output.profile_path)),
            Ok(false) => Ok(None),
            Err(err) => Err(self.snapshot_error(err)),
        }
    }

    fn snapshot_error(&self, err: ArtdError) -> DexoptError {
        if err.is_communication() {
            self.log_artd(&err);
        }
        DexoptError::SnapshotProfile(err.to_string())
    }

    /// Human readable dexopt state of a package
    pub fn dump_package(&self, snapshot: &PackageSnapshot, package_name: &str) -> DexoptResult<String> {
        let pkg = utils::package_state_or_err(snapshot, package_name)?;
        let mut out = String::new();
        self.dump_package_into(snapshot, &pkg, &mut out)?;
        Ok(out)
    }

    /// Human readable dexopt state of every dexoptable package, sorted by name
    pub fn dump(&self, snapshot: &PackageSnapshot) -> DexoptResult<String> {
        let mut packages: Vec<&Arc<PackageState>> = snapshot
            .iter()
            .filter(|pkg| utils::is_dexoptable(pkg))
            .collect();
        packages.sort_by(|a, b| a.package_name.cmp(&b.package_name));

        let mut out = String::new();
        for pkg in packages {
            self.dump_package_into(snapshot, pkg, &mut out)?;
        }
        Ok(out)
    }

    fn dump_package_into(
        &self,
        snapshot: &PackageSnapshot,
        pkg: &PackageState,
        out: &mut String,
    ) -> DexoptResult<()> {
        let flags = DexoptFlags::FOR_PRIMARY_DEX | DexoptFlags::FOR_SECONDARY_DEX;
        let status = self.get_dexopt_status(snapshot, &pkg.package_name, flags)?;

        let _ = writeln!(out, "[{}]", pkg.package_name);
        let mut current_file: Option<&str> = None;
        for entry in &status.dex_container_file_dexopt_statuses {
            if current_file != Some(entry.dex_container_file.as_str()) {
                current_file = Some(entry.dex_container_file.as_str());
                let kind = if entry.is_primary_dex { "path" } else { "secondary" };
                let _ = writeln!(out, "  {}: {}", kind, entry.dex_container_file);
                self.dump_loaders(pkg, entry, out);
            }
            let isa = dexopt_core::platform::instruction_set(&entry.abi).unwrap_or("?");
            let _ = writeln!(
                out,
                "    {}: [status={}] [reason={}]{}",
                isa,
                entry.compiler_filter,
                entry.compilation_reason,
                if entry.is_primary_abi { " [primary-abi]" } else { "" }
            );
            let _ = writeln!(out, "      [location is {}]", entry.location_debug_string);
        }
        Ok(())
    }

    fn dump_loaders(&self, pkg: &PackageState, entry: &DexContainerFileDexoptStatus, out: &mut String) {
        let dex_use = &self.ctx.dex_use;
        let loaders: Vec<String> = if entry.is_primary_dex {
            dex_use
                .get_primary_dex_loaders(&pkg.package_name, &entry.dex_container_file)
                .into_iter()
                .filter(|loader| loader.loading_package_name != pkg.package_name)
                .map(|loader| loader.to_string())
                .collect()
        } else {
            dex_use
                .get_secondary_dex_info(&pkg.package_name)
                .into_iter()
                .filter(|info| info.dex_path == entry.dex_container_file)
                .flat_map(|info| info.loaders.into_iter())
                .filter(|loader| loader.loading_package_name != pkg.package_name)
                .map(|loader| loader.to_string())
                .collect()
        };
        if !loaders.is_empty() {
            let _ = writeln!(out, "    used by other apps: [{}]", loaders.join(", "));
        }
    }
}

/// The writable form of a reference profile, for committing staged files
fn writable_ref_profile(profile: ProfilePath) -> Option<WritableProfilePath> {
    match profile {
        ProfilePath::PrimaryRef {
            package_name,
            profile_name,
        } => Some(WritableProfilePath::PrimaryRef {
            package_name,
            profile_name,
            is_pre_reboot: false,
        }),
        ProfilePath::SecondaryRef { dex_path } => Some(WritableProfilePath::SecondaryRef {
            dex_path,
            is_pre_reboot: false,
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pass_order() {
        let mut passes = vec![
            BatchDexoptPass::Supplementary,
            BatchDexoptPass::Main,
            BatchDexoptPass::Downgrade,
        ];
        passes.sort();
        assert_eq!(
            passes,
            vec![
                BatchDexoptPass::Downgrade,
                BatchDexoptPass::Main,
                BatchDexoptPass::Supplementary
            ]
        );
    }

    #[test]
    fn test_writable_ref_profile() {
        assert_eq!(
            writable_ref_profile(ProfilePath::SecondaryRef {
                dex_path: "/data/user/0/foo/a.jar".to_string()
            }),
            Some(WritableProfilePath::SecondaryRef {
                dex_path: "/data/user/0/foo/a.jar".to_string(),
                is_pre_reboot: false,
            })
        );
        assert_eq!(
            writable_ref_profile(ProfilePath::Prebuilt {
                dex_path: "/data/app/foo/base.apk".to_string()
            }),
            None
        );
    }
}

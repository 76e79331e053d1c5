//! Per-package dexopt
//!
//! A [`Dexopter`] walks the dex container files of one package and, for each file and
//! ABI, decides the compiler filter, prepares the profile, asks artd whether a compile is
//! needed, and runs it. The control flow is shared; what differs between primary dex files
//! (APKs) and secondary dex files (loaded by the app at runtime) is supplied by a
//! [`DexInfoProvider`].
//!
//! Failures of a single (file, ABI) are recorded as [`DexoptStatus::Failed`] and the loop
//! goes on. An artd communication fault aborts the whole run.

pub mod filter;
pub mod primary;
pub mod result;
pub mod secondary;
pub mod trigger;

use dexopt_core::{
    AndroidPackage, ArtdDexoptResult, ArtdRefCache, ArtifactStore, ArtifactsLocation,
    ArtifactsPath, CancellationSignal, Clock, DeviceAbis, DexMetadataConfig, DexMetadataPath,
    DexoptOptions, DexoptRequest, FileVisibility, GetDexoptNeededResult, MergeProfileOptions,
    OutputArtifacts, OutputProfile, PackageRepository, PackageState, PermissionSettings,
    ProfilePath, RuntimeArtifactsPath, StorageManager, SystemProperties,
};
use std::sync::Arc;

use crate::callbacks::Callbacks;
use crate::compiler_filter;
use crate::dex_use::DexUseStore;
use crate::error::{check, DexoptError, DexoptResult};
use crate::params::{DexoptFlags, DexoptParams};
use crate::reason;
use crate::utils::{self, Abi, InitProfileResult};

use filter::{DowngradeConditions, UpgradeInputs};
use result::{Dex2OatResult, DexContainerFileDexoptResult, DexoptStatus, ExtendedStatusFlags};

pub use primary::PrimaryDexInfoProvider;
pub use secondary::SecondaryDexInfoProvider;

/// Property that turns dexopt off entirely
pub const DISABLE_DEXOPT_PROPERTY: &str = "dalvik.vm.disable-art-service-dexopt";

/// Collaborators shared by every dexopt run
#[derive(Clone)]
pub struct DexoptContext {
    /// Connection cache to artd
    pub artd: Arc<ArtdRefCache>,
    /// Installed packages
    pub packages: Arc<dyn PackageRepository>,
    /// Dex use registry
    pub dex_use: Arc<DexUseStore>,
    /// System properties
    pub props: Arc<dyn SystemProperties>,
    /// Free-space queries
    pub storage: Arc<dyn StorageManager>,
    /// Wall clock
    pub clock: Arc<dyn Clock>,
    /// Native ABIs of the device
    pub device: DeviceAbis,
    /// Registered hooks
    pub callbacks: Arc<Callbacks>,
    /// Whether outputs go to the pre-reboot staging area
    pub is_pre_reboot: bool,
    /// Runtime module version, recorded in the artifacts
    pub art_version: i64,
}

impl DexoptContext {
    /// The same collaborators, writing to the pre-reboot staging area
    pub fn for_pre_reboot(&self) -> Self {
        Self {
            is_pre_reboot: true,
            ..self.clone()
        }
    }

    pub(crate) fn abi_resolver(&self) -> utils::AbiResolver<'_> {
        utils::AbiResolver::new(&self.device, self.props.as_ref())
    }
}

/// Everything one run over one package needs
pub struct Session<'a> {
    /// Shared collaborators
    pub ctx: &'a DexoptContext,
    /// Pinned artd connection
    pub artd: Arc<dyn ArtifactStore>,
    /// The package
    pub pkg: &'a PackageState,
    /// Its parsed APK data
    pub android_package: &'a AndroidPackage,
    /// What was requested
    pub params: &'a DexoptParams,
    /// Caller's cancellation token
    pub cancellation: &'a CancellationSignal,
}

impl<'a> Session<'a> {
    /// Create a session. Fails for packages without an APK.
    pub fn new(
        ctx: &'a DexoptContext,
        artd: Arc<dyn ArtifactStore>,
        pkg: &'a PackageState,
        params: &'a DexoptParams,
        cancellation: &'a CancellationSignal,
    ) -> DexoptResult<Self> {
        let android_package = pkg.android_package.as_ref().ok_or_else(|| {
            DexoptError::IllegalState(format!(
                "Unable to get package '{}'",
                pkg.package_name
            ))
        })?;
        Ok(Self {
            ctx,
            artd,
            pkg,
            android_package,
            params,
            cancellation,
        })
    }

    fn package_name(&self) -> &str {
        &self.pkg.package_name
    }
}

/// A dex container file as seen by a [`DexInfoProvider`]
pub trait DexInfo {
    /// Absolute path of the file
    fn dex_path(&self) -> &str;

    /// Class loader context, or `None` when it is unknown or ambiguous
    fn class_loader_context(&self) -> Option<&str>;
}

/// The unit of a single compile decision
#[derive(Debug, Clone)]
pub struct DexoptTarget<'d, D> {
    /// The file
    pub dex_info: &'d D,
    /// Instruction set
    pub isa: String,
    /// Whether artifacts live in dalvik-cache
    pub is_in_dalvik_cache: bool,
    /// Adjusted compiler filter
    pub compiler_filter: String,
    /// Dex metadata file to pass to the compiler
    pub dm_path: Option<DexMetadataPath>,
}

/// The dex metadata file of a dex file, if any, and what it configures
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DexMetadataInfo {
    /// The file, when it exists
    pub path: Option<DexMetadataPath>,
    /// Its config, or the defaults
    pub config: DexMetadataConfig,
}

impl DexMetadataInfo {
    /// No dex metadata file
    pub fn none() -> Self {
        Self::default()
    }
}

/// What distinguishes primary from secondary dexopt
pub trait DexInfoProvider {
    /// Description of one dex container file
    type Info: DexInfo;

    /// Whether artifacts go to dalvik-cache
    fn is_in_dalvik_cache(&self, session: &Session<'_>) -> DexoptResult<bool>;

    /// Files to consider, in processing order
    fn dex_info_list(&self, session: &Session<'_>) -> Vec<Self::Info>;

    /// Whether `info` is in scope of this run
    fn is_dexoptable(&self, session: &Session<'_>, info: &Self::Info) -> bool;

    /// Whether artifacts must be usable by other apps. Implies [`Self::is_dex_file_public`].
    fn needs_to_be_shared(&self, session: &Session<'_>, info: &Self::Info) -> bool;

    /// Whether the dex file itself is readable by others
    fn is_dex_file_public(&self, session: &Session<'_>, info: &Self::Info) -> bool;

    /// Whether the dex file exists
    fn is_dex_file_found(&self, session: &Session<'_>, info: &Self::Info) -> DexoptResult<bool>;

    /// Profiles the reference profile can be initialized from, in order of preference
    fn external_profiles(&self, session: &Session<'_>, info: &Self::Info) -> Vec<ProfilePath>;

    /// Ownership and mode of the artifacts
    fn permission_settings(
        &self,
        session: &Session<'_>,
        info: &Self::Info,
        can_be_public: bool,
    ) -> PermissionSettings;

    /// ABIs to compile for, primary first
    fn all_abis(&self, session: &Session<'_>, info: &Self::Info) -> DexoptResult<Vec<Abi>>;

    /// Reference profile as an input
    fn ref_profile_path(&self, session: &Session<'_>, info: &Self::Info) -> ProfilePath;

    /// Temporary output for a new reference profile
    fn output_profile(
        &self,
        session: &Session<'_>,
        info: &Self::Info,
        is_public: bool,
    ) -> OutputProfile;

    /// Current profiles to merge
    fn cur_profiles(&self, session: &Session<'_>, info: &Self::Info) -> Vec<ProfilePath>;

    /// Dex metadata file next to the dex file and its config
    fn dex_metadata_info(
        &self,
        session: &Session<'_>,
        info: &Self::Info,
    ) -> DexoptResult<DexMetadataInfo>;

    /// Hook run before a file is processed, even when its filter turns out to be a no-op
    fn on_dexopt_start(
        &self,
        _session: &Session<'_>,
        _info: &Self::Info,
        _is_in_dalvik_cache: bool,
    ) -> DexoptResult<()> {
        Ok(())
    }

    /// Hook run after each (file, ABI) result is recorded
    fn on_target_result(
        &self,
        _session: &Session<'_>,
        _target: &DexoptTarget<'_, Self::Info>,
        _status: DexoptStatus,
    ) -> DexoptResult<()> {
        Ok(())
    }
}

enum Flow {
    Continue,
    Cancelled,
}

/// Profile state of one dex file after preparation
struct PreparedProfile {
    profile_merged: bool,
    is_other_readable: bool,
    external_profile_errors: Vec<String>,
}

/// Fields of one (file, ABI) result that the compile fills in
struct AbiRecord {
    status: DexoptStatus,
    flags: ExtendedStatusFlags,
    artd_result: Option<ArtdDexoptResult>,
    dex2oat_result: Dex2OatResult,
}

impl AbiRecord {
    fn skipped() -> Self {
        Self {
            status: DexoptStatus::Skipped,
            flags: ExtendedStatusFlags::empty(),
            artd_result: None,
            dex2oat_result: Dex2OatResult::not_run(),
        }
    }
}

/// Per-file state shared by every ABI of that file
struct FileInputs<'p> {
    profile: Option<&'p ProfilePath>,
    profile_merged: bool,
    needs_to_be_shared: bool,
    permission_settings: PermissionSettings,
    options: DexoptOptions,
}

/// Dexopt over the files supplied by `P`
pub struct Dexopter<'a, P: DexInfoProvider> {
    session: Session<'a>,
    provider: P,
}

impl<'a, P: DexInfoProvider> Dexopter<'a, P> {
    /// Create a dexopter
    pub fn new(session: Session<'a>, provider: P) -> Self {
        Self { session, provider }
    }

    /// Run. Results are in (file, ABI) order; a cancelled run returns what it has so far.
    pub fn dexopt(&self) -> DexoptResult<Vec<DexContainerFileDexoptResult>> {
        let s = &self.session;
        if s.ctx.props.get_bool(DISABLE_DEXOPT_PROPERTY, false) {
            log::info!("Dexopt skipped because it's disabled by system property");
            return Ok(Vec::new());
        }

        let mut results = Vec::new();
        let is_in_dalvik_cache = self.provider.is_in_dalvik_cache(s)?;

        for info in self.provider.dex_info_list(s) {
            let mut profile: Option<ProfilePath> = None;
            let flow = self.dexopt_dex_file(&info, is_in_dalvik_cache, &mut profile, &mut results);

            if let Some(tmp) = profile.as_ref().filter(|profile| profile.is_tmp()) {
                if let Err(err) = s.artd.delete_profile(tmp) {
                    if flow.is_ok() && err.is_communication() {
                        return Err(err.into());
                    }
                    log::error!("Failed to delete temporary profile {}: {}", tmp, err);
                }
            }

            match flow? {
                Flow::Continue => {}
                Flow::Cancelled => return Ok(results),
            }
        }

        Ok(results)
    }

    fn dexopt_dex_file(
        &self,
        info: &P::Info,
        is_in_dalvik_cache: bool,
        profile: &mut Option<ProfilePath>,
        results: &mut Vec<DexContainerFileDexoptResult>,
    ) -> DexoptResult<Flow> {
        let s = &self.session;
        if !self.provider.is_dexoptable(s, info) {
            return Ok(Flow::Continue);
        }

        self.provider.on_dexopt_start(s, info, is_in_dalvik_cache)?;

        let mut compiler_filter = self.adjust_compiler_filter(info)?;
        let dm_info = self.provider.dex_metadata_info(s, info)?;
        if compiler_filter == compiler_filter::NOOP {
            for abi in self.provider.all_abis(s, info)? {
                let mut record = AbiRecord::skipped();
                record.flags |= ExtendedStatusFlags::SKIPPED_NO_DEX_CODE;
                results.push(file_result(info.dex_path(), &abi, &compiler_filter, record, Vec::new()));
            }
            return Ok(Flow::Continue);
        }

        if s.ctx.is_pre_reboot && !self.provider.is_dex_file_found(s, info)? {
            // Dex files may be removed in the new image. Unlike artd, we cannot check that
            // before the reboot.
            log::info!("Skipping '{}' because it is not found", info.dex_path());
            return Ok(Flow::Continue);
        }

        let needs_to_be_shared = self.provider.needs_to_be_shared(s, info);
        let prepared = if compiler_filter::is_profile_guided(&compiler_filter) {
            let enable_embedded_profile = dm_info.config.enable_embedded_profile;
            if !enable_embedded_profile {
                if let Some(dm) = &dm_info.path {
                    log::info!(
                        "Embedded profile disabled by config in the dm file of '{}'",
                        dm.dex_path
                    );
                }
            }
            let prepared =
                self.prepare_profile(info, needs_to_be_shared, enable_embedded_profile, profile)?;
            if profile.is_none() {
                // Profile-guided compilation without a profile is the same as verification.
                let fallback = if needs_to_be_shared {
                    reason::compiler_filter_for_shared(s.ctx.props.as_ref())?
                } else {
                    "verify".to_string()
                };
                let because = if needs_to_be_shared {
                    "there is no valid profile and the package needs to be shared"
                } else {
                    "there is no valid profile"
                };
                compiler_filter =
                    filter::log_adjustment(s.package_name(), &compiler_filter, &fallback, because);
            }
            prepared
        } else {
            PreparedProfile {
                profile_merged: false,
                is_other_readable: true,
                external_profile_errors: Vec::new(),
            }
        };

        let is_profile_guided = compiler_filter::is_profile_guided(&compiler_filter);
        check(is_profile_guided == profile.is_some(), || {
            format!(
                "Profile presence does not match compiler filter '{}' for '{}'",
                compiler_filter,
                info.dex_path()
            )
        })?;

        let can_be_public = (!is_profile_guided || prepared.is_other_readable)
            && self.provider.is_dex_file_public(s, info);
        check(!needs_to_be_shared || can_be_public, || {
            format!("Artifacts of '{}' must be public to be shared", info.dex_path())
        })?;

        let inputs = FileInputs {
            profile: profile.as_ref(),
            profile_merged: prepared.profile_merged,
            needs_to_be_shared,
            permission_settings: self.provider.permission_settings(s, info, can_be_public),
            options: self.dexopt_options(is_profile_guided),
        };

        let mut succeeded = true;
        for abi in self.provider.all_abis(s, info)? {
            let target = DexoptTarget {
                dex_info: info,
                isa: abi.isa.clone(),
                is_in_dalvik_cache,
                compiler_filter: compiler_filter.clone(),
                dm_path: dm_info.path.clone(),
            };

            let mut record = AbiRecord::skipped();
            let attempt = self.dexopt_target(&target, &inputs, &mut record);
            s.cancellation.clear_on_cancel_listener();
            let mut fault = None;
            match attempt {
                Ok(()) => {}
                Err(DexoptError::Artd(err)) if err.is_service_specific() => {
                    log::error!(
                        "Failed to dexopt [packageName = {}, dexPath = {}, isa = {}, \
                         classLoaderContext = {}]: {}",
                        s.package_name(),
                        info.dex_path(),
                        abi.isa,
                        info.class_loader_context().unwrap_or("null"),
                        err
                    );
                    record.status = DexoptStatus::Failed;
                    if let Some(parsed) = Dex2OatResult::parse(err.message()) {
                        record.dex2oat_result = parsed;
                    }
                }
                // Propagated after the result is recorded.
                Err(err) => fault = Some(err),
            }

            if !prepared.external_profile_errors.is_empty() {
                record.flags |= ExtendedStatusFlags::BAD_EXTERNAL_PROFILE;
            }
            let status = record.status;
            let result = file_result(
                info.dex_path(),
                &abi,
                &compiler_filter,
                record,
                prepared.external_profile_errors.clone(),
            );
            log::info!("Dexopt result: [packageName = {}] {}", s.package_name(), result);
            results.push(result);

            let hook = self.provider.on_target_result(s, &target, status);
            if let Some(err) = fault {
                return Err(err);
            }
            hook?;

            match status {
                DexoptStatus::Skipped | DexoptStatus::Performed => {}
                DexoptStatus::Cancelled => return Ok(Flow::Cancelled),
                DexoptStatus::Failed => succeeded = false,
            }
        }

        if succeeded {
            self.finish_profile(info, profile, prepared.profile_merged)?;
        }
        Ok(Flow::Continue)
    }

    fn prepare_profile(
        &self,
        info: &P::Info,
        needs_to_be_shared: bool,
        enable_embedded_profile: bool,
        profile: &mut Option<ProfilePath>,
    ) -> DexoptResult<PreparedProfile> {
        let s = &self.session;
        let artd = s.artd.as_ref();
        let mut init_output = self.provider.output_profile(s, info, true);
        let external_profiles = self.provider.external_profiles(s, info);

        // A shared artifact must not carry profile data private to this app.
        let init: InitProfileResult = if needs_to_be_shared {
            utils::init_reference_profile(
                artd,
                info.dex_path(),
                &external_profiles,
                enable_embedded_profile,
                &mut init_output,
            )?
        } else {
            utils::get_or_init_reference_profile(
                artd,
                info.dex_path(),
                &self.provider.ref_profile_path(s, info),
                &external_profiles,
                enable_embedded_profile,
                &mut init_output,
            )?
        };

        *profile = init.profile;
        let mut prepared = PreparedProfile {
            profile_merged: false,
            is_other_readable: init.is_other_readable,
            external_profile_errors: init.external_profile_errors,
        };
        if needs_to_be_shared {
            return Ok(prepared);
        }

        if let Some(merged) = self.merge_profiles(info, profile.as_ref())? {
            if let Some(initialized) = profile.as_ref().filter(|profile| profile.is_tmp()) {
                artd.delete_profile(initialized)?;
            }
            *profile = Some(merged);
            prepared.is_other_readable = false;
            prepared.profile_merged = true;
        }
        Ok(prepared)
    }

    fn merge_profiles(
        &self,
        info: &P::Info,
        reference: Option<&ProfilePath>,
    ) -> DexoptResult<Option<ProfilePath>> {
        let s = &self.session;
        let mut output = self.provider.output_profile(s, info, false);
        let options = MergeProfileOptions {
            force_merge: s.params.flags().contains(DexoptFlags::FORCE_MERGE_PROFILE),
            ..Default::default()
        };
        let result = s.artd.merge_profiles(
            &self.provider.cur_profiles(s, info),
            reference,
            &mut output,
            &[info.dex_path().to_string()],
            options,
        );
        match result {
            Ok(true) => Ok(Some(ProfilePath::Tmp(output.profile_path))),
            Ok(false) => Ok(None),
            Err(err) if err.is_service_specific() => {
                log::error!(
                    "Failed to merge profiles {:?}: {}",
                    output.profile_path.final_path,
                    err
                );
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn finish_profile(
        &self,
        info: &P::Info,
        profile: &mut Option<ProfilePath>,
        profile_merged: bool,
    ) -> DexoptResult<()> {
        let s = &self.session;
        if profile.is_none() {
            return Ok(());
        }
        if let Some(tmp) = profile.as_ref().and_then(ProfilePath::as_tmp) {
            match s.artd.commit_tmp_profile(tmp) {
                Ok(()) => *profile = None,
                Err(err) if err.is_service_specific() => log::error!(
                    "Failed to commit profile changes {:?}: {}",
                    tmp.final_path,
                    err
                ),
                Err(err) => return Err(err.into()),
            }
        }
        // Current profiles stay in the pre-reboot case so that background dexopt merges them
        // again after the reboot.
        if profile_merged && !s.ctx.is_pre_reboot {
            for cur in self.provider.cur_profiles(s, info) {
                s.artd.delete_profile(&cur)?;
            }
        }
        Ok(())
    }

    fn dexopt_target(
        &self,
        target: &DexoptTarget<'_, P::Info>,
        inputs: &FileInputs<'_>,
        record: &mut AbiRecord,
    ) -> DexoptResult<()> {
        let s = &self.session;
        let dex_path = target.dex_info.dex_path();

        if s.ctx.is_pre_reboot {
            // artd does not look at staged artifacts. Staged files that exist are assumed to be
            // up to date because the job deletes stale ones before it starts over.
            let staged =
                ArtifactsPath::pre_reboot(dex_path, &target.isa, target.is_in_dalvik_cache);
            if s.artd.get_artifacts_visibility(&staged)? != FileVisibility::NotFound {
                record.flags |= ExtendedStatusFlags::SKIPPED_PRE_REBOOT_ALREADY_EXIST;
                return Ok(());
            }
        }

        let needed = self.get_dexopt_needed(target, inputs)?;
        if !needed.has_dex_code {
            record.flags |= ExtendedStatusFlags::SKIPPED_NO_DEX_CODE;
        }
        if !needed.is_dexopt_needed {
            return Ok(());
        }

        if s.params.flags().contains(DexoptFlags::SKIP_IF_STORAGE_LOW) {
            match s
                .ctx
                .storage
                .allocatable_bytes(s.android_package.storage_uuid.as_deref())
            {
                Ok(bytes) if bytes <= 0 => {
                    record.flags |= ExtendedStatusFlags::SKIPPED_STORAGE_LOW;
                    return Ok(());
                }
                Ok(_) => {}
                Err(err) => log::error!("Failed to check storage. Assuming storage not low: {}", err),
            }
        }

        if s.cancellation.is_canceled() {
            record.status = DexoptStatus::Cancelled;
            record.dex2oat_result = Dex2OatResult::cancelled();
            return Ok(());
        }

        let artd_signal = s.artd.create_cancellation_signal()?;
        let listener_signal = artd_signal.clone();
        s.cancellation.set_on_cancel_listener(move || {
            if let Err(err) = listener_signal.cancel() {
                log::error!("An error occurred when sending a cancellation signal: {}", err);
            }
        });

        let input_vdex = input_vdex(&needed, dex_path, &target.isa);
        let mut options = inputs.options.clone();
        if target.dm_path.is_some() && reason::is_install_reason(&options.compilation_reason) {
            // Tells the installer that a dex metadata file was passed at install time.
            options.compilation_reason.push_str("-dm");
        }

        let artifacts_path = if s.ctx.is_pre_reboot {
            ArtifactsPath::pre_reboot(dex_path, &target.isa, target.is_in_dalvik_cache)
        } else {
            ArtifactsPath::new(dex_path, &target.isa, target.is_in_dalvik_cache)
        };
        let request = DexoptRequest {
            output: OutputArtifacts {
                artifacts_path,
                permission_settings: inputs.permission_settings.clone(),
            },
            dex_path: dex_path.to_string(),
            isa: target.isa.clone(),
            class_loader_context: target.dex_info.class_loader_context().map(str::to_string),
            compiler_filter: target.compiler_filter.clone(),
            profile: inputs.profile.cloned(),
            input_vdex,
            dm_file: target.dm_path.clone(),
            priority_class: s.params.priority_class(),
            options,
            cancellation: artd_signal,
        };
        let result = s.artd.dexopt(&request)?;

        // Runtime images are still needed before the reboot.
        if !result.cancelled && !s.ctx.is_pre_reboot {
            s.artd.delete_runtime_artifacts(&RuntimeArtifactsPath {
                package_name: s.package_name().to_string(),
                dex_path: dex_path.to_string(),
                isa: target.isa.clone(),
            })?;
        }

        if result.cancelled {
            record.status = DexoptStatus::Cancelled;
            record.dex2oat_result = Dex2OatResult::cancelled();
        } else {
            record.status = DexoptStatus::Performed;
            record.dex2oat_result = Dex2OatResult::exited_successfully();
        }
        record.artd_result = Some(result);
        Ok(())
    }

    fn get_dexopt_needed(
        &self,
        target: &DexoptTarget<'_, P::Info>,
        inputs: &FileInputs<'_>,
    ) -> DexoptResult<GetDexoptNeededResult> {
        let s = &self.session;
        let dex_path = target.dex_info.dex_path();
        let trigger = trigger::dexopt_trigger(
            s.params.flags(),
            inputs.profile_merged,
            inputs.needs_to_be_shared,
            || {
                s.artd.get_artifacts_visibility(&ArtifactsPath::new(
                    dex_path,
                    &target.isa,
                    target.is_in_dalvik_cache,
                ))
            },
        )?;
        // A missing class loader context tells artd to skip the context check; the filter is
        // at most "verify" in that case.
        Ok(s.artd.get_dexopt_needed(
            dex_path,
            &target.isa,
            target.dex_info.class_loader_context(),
            &target.compiler_filter,
            trigger,
        )?)
    }

    fn adjust_compiler_filter(&self, info: &P::Info) -> DexoptResult<String> {
        let s = &self.session;
        let flags = s.params.flags();
        let mut filter = s.params.compiler_filter().to_string();

        if !flags.contains(DexoptFlags::FORCE_COMPILER_FILTER) {
            let inputs = UpgradeInputs {
                package_name: s.package_name(),
                reason: s.params.reason(),
                is_system_ui: s.ctx.packages.is_system_ui_package(s.package_name()),
                is_launcher: s.ctx.packages.is_launcher_package(s.package_name()),
                system_ui_filter: s
                    .ctx
                    .props
                    .get_string(filter::SYSTEM_UI_FILTER_PROPERTY, ""),
                callback: s.ctx.callbacks.adjust_compiler_filter(),
            };
            filter = filter::upgrade(&filter, &inputs)?;
        }

        let conditions = DowngradeConditions {
            vm_safe_mode: s.android_package.is_vm_safe_mode,
            debuggable: s.android_package.is_debuggable,
            has_class_loader_context: info.class_loader_context().is_some(),
            use_embedded_dex: s.android_package.is_use_embedded_dex,
            ignore_profile: flags.contains(DexoptFlags::IGNORE_PROFILE),
        };
        Ok(filter::downgrade(s.package_name(), &filter, conditions))
    }

    fn dexopt_options(&self, is_profile_guided: bool) -> DexoptOptions {
        let s = &self.session;
        let props = s.ctx.props.as_ref();
        let android_package = s.android_package;
        DexoptOptions {
            compilation_reason: s.params.reason().to_string(),
            target_sdk_version: android_package.target_sdk_version,
            debuggable: android_package.is_debuggable
                || props.get_bool("dalvik.vm.always_debuggable", false),
            // Without a profile the app image would be nearly empty.
            generate_app_image: is_profile_guided
                && !props.get_string("dalvik.vm.appimageformat", "").is_empty(),
            hidden_api_policy_enabled: !s.pkg.hidden_api_enforcement_disabled,
            comments: format!(
                "app-name:{},app-version-name:{},app-version-code:{},art-version:{}",
                s.package_name(),
                android_package.version_name,
                android_package.long_version_code,
                s.ctx.art_version
            ),
        }
    }
}

fn file_result(
    dex_path: &str,
    abi: &Abi,
    compiler_filter: &str,
    record: AbiRecord,
    external_profile_errors: Vec<String>,
) -> DexContainerFileDexoptResult {
    let artd_result = record.artd_result.unwrap_or_default();
    DexContainerFileDexoptResult {
        dex_container_file: dex_path.to_string(),
        is_primary_abi: abi.is_primary,
        abi: abi.name.clone(),
        actual_compiler_filter: compiler_filter.to_string(),
        status: record.status,
        dex2oat_wall_time_ms: artd_result.wall_time_ms,
        dex2oat_cpu_time_ms: artd_result.cpu_time_ms,
        size_bytes: artd_result.size_bytes,
        size_before_bytes: artd_result.size_before_bytes,
        extended_status_flags: record.flags,
        external_profile_errors,
        dex2oat_result: record.dex2oat_result,
    }
}

fn input_vdex(needed: &GetDexoptNeededResult, dex_path: &str, isa: &str) -> Option<ArtifactsPath> {
    if !needed.is_vdex_usable {
        return None;
    }
    match needed.artifacts_location {
        ArtifactsLocation::DalvikCache => Some(ArtifactsPath::new(dex_path, isa, true)),
        ArtifactsLocation::NextToDex => Some(ArtifactsPath::new(dex_path, isa, false)),
        // The vdex is inside the dm file, which is passed separately.
        ArtifactsLocation::Dm
        | ArtifactsLocation::SdmDalvikCache
        | ArtifactsLocation::SdmNextToDex
        | ArtifactsLocation::NoneOrError => None,
    }
}

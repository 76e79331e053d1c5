//! Single-package dexopt against the in-memory artd

mod common;

use common::Fixture;
use dexopt_core::{
    ArtdDexoptResult, ArtdError, ArtifactsLocation, ArtifactsPath, CancellationSignal,
    CopyAndRewriteProfileResult, DexMetadataConfig, DexMetadataPath, DexoptRequest,
    DexoptTrigger, FileVisibility, GetDexoptNeededResult, OutputProfile, PackageRepository,
    PermissionSettings, ProfilePath, SystemProperties,
};
use dexopt_service::compiler_filter;
use dexopt_service::config::BatchConfig;
use dexopt_service::dexopter::filter::{downgrade, DowngradeConditions};
use dexopt_service::dexopter::primary::PrimaryDexInfo;
use dexopt_service::dexopter::result::ExtendedStatusFlags;
use dexopt_service::dexopter::trigger::dexopt_trigger;
use dexopt_service::dexopter::{
    DexInfoProvider, DexMetadataInfo, DexoptTarget, Session, DISABLE_DEXOPT_PROPERTY,
};
use dexopt_service::utils::Abi;
use dexopt_service::{
    reason, ArtManager, DexoptError, DexoptFlags, DexoptOutcome, DexoptParams, DexoptResult,
    DexoptStatus, Dexopter, PrimaryDexInfoProvider,
};
use dexopt_testing::PackageBuilder;
use parking_lot::Mutex;
use std::sync::Arc;

const PKG: &str = "com.example.app";
const BASE: &str = "/data/app/com.example.app/base.apk";

fn fixture() -> Fixture {
    Fixture::new(vec![PackageBuilder::new(PKG).build()])
}

fn run(f: &Fixture, manager: &ArtManager, params: &DexoptParams) -> DexoptOutcome {
    let snapshot = f.packages.unfiltered_snapshot();
    manager
        .dexopt_package(&snapshot, PKG, params, &CancellationSignal::new())
        .unwrap()
}

fn params(f: &Fixture, compilation_reason: &str) -> DexoptParams {
    DexoptParams::builder(compilation_reason)
        .build(f.props.as_ref())
        .unwrap()
}

#[test]
fn test_install_without_profile_compiles_verify() {
    let f = fixture();
    let outcome = run(&f, &f.manager(), &params(&f, reason::INSTALL));

    assert_eq!(outcome.requested_compiler_filter, "speed-profile");
    assert_eq!(outcome.reason, reason::INSTALL);
    assert_eq!(outcome.package_dexopt_results.len(), 1);
    let pkg_result = &outcome.package_dexopt_results[0];
    assert_eq!(pkg_result.status(), DexoptStatus::Performed);
    assert_eq!(pkg_result.dex_container_file_dexopt_results.len(), 1);

    let file_result = &pkg_result.dex_container_file_dexopt_results[0];
    assert_eq!(file_result.dex_container_file, BASE);
    assert_eq!(file_result.abi, "arm64-v8a");
    assert!(file_result.is_primary_abi);
    assert_eq!(file_result.actual_compiler_filter, "verify");
    assert_eq!(file_result.status, DexoptStatus::Performed);
    assert_eq!(file_result.size_bytes, 4096);

    let calls = f.artd.calls.lock();
    assert_eq!(calls.dexopt_needed.len(), 1);
    let needed = &calls.dexopt_needed[0];
    assert_eq!(needed.compiler_filter, "verify");
    assert_eq!(needed.isa, "arm64");
    assert_eq!(needed.class_loader_context.as_deref(), Some("PCL[]"));
    assert!(needed.trigger.contains(DexoptTrigger::COMPILER_FILTER_IS_BETTER));
    assert!(!needed.trigger.contains(DexoptTrigger::COMPILER_FILTER_IS_WORSE));

    assert_eq!(calls.dexopt.len(), 1);
    let request = &calls.dexopt[0];
    assert_eq!(request.compiler_filter, "verify");
    assert!(request.profile.is_none());
    assert_eq!(request.output.artifacts_path, ArtifactsPath::new(BASE, "arm64", false));
    assert_eq!(request.options.compilation_reason, reason::INSTALL);
    // Runtime images are invalidated by the new artifacts.
    assert_eq!(calls.deleted_runtime_artifacts.len(), 1);
}

#[test]
fn test_up_to_date_artifacts_are_skipped() {
    let f = fixture();
    f.artd.config.lock().default_dexopt_needed = GetDexoptNeededResult {
        is_dexopt_needed: false,
        is_vdex_usable: true,
        has_dex_code: true,
        artifacts_location: ArtifactsLocation::NextToDex,
    };

    let outcome = run(&f, &f.manager(), &params(&f, reason::INSTALL));
    let pkg_result = &outcome.package_dexopt_results[0];
    assert_eq!(pkg_result.status(), DexoptStatus::Skipped);
    assert_eq!(
        pkg_result.dex_container_file_dexopt_results[0].status,
        DexoptStatus::Skipped
    );
    assert!(pkg_result.dex_container_file_dexopt_results[0]
        .extended_status_flags
        .is_empty());
    assert_eq!(f.artd.dexopt_count(), 0);
    assert!(!outcome.package_dexopt_results[0].has_updated_artifacts());
    assert!(outcome.only_updates().package_dexopt_results.is_empty());
}

#[test]
fn test_used_by_other_apps_compiles_shared_filter() {
    let f = Fixture::new(vec![
        PackageBuilder::new(PKG).build(),
        PackageBuilder::new("com.example.client").app_id(10_002).build(),
    ]);
    f.report_loads(10_002, "com.example.client", &[(BASE, "PCL[]")])
        .unwrap();

    let outcome = run(&f, &f.manager(), &params(&f, reason::INSTALL));
    let file_result = &outcome.package_dexopt_results[0].dex_container_file_dexopt_results[0];
    assert_eq!(file_result.actual_compiler_filter, "speed");

    let calls = f.artd.calls.lock();
    let request = &calls.dexopt[0];
    assert!(request.output.permission_settings.file_fs_permission.is_other_readable);
}

#[test]
fn test_debuggable_package_is_capped_at_verify() {
    let f = Fixture::new(vec![PackageBuilder::new(PKG).flags(false, true, false).build()]);
    let params = DexoptParams::builder(reason::CMDLINE)
        .compiler_filter("speed")
        .build(f.props.as_ref())
        .unwrap();

    let outcome = run(&f, &f.manager(), &params);
    let file_result = &outcome.package_dexopt_results[0].dex_container_file_dexopt_results[0];
    assert_eq!(file_result.actual_compiler_filter, "verify");
    assert!(f.artd.calls.lock().dexopt[0].options.debuggable);
}

#[test]
fn test_force_recompiles_with_every_trigger() {
    let f = fixture();
    let params = DexoptParams::builder(reason::CMDLINE)
        .compiler_filter("speed")
        .flags(DexoptFlags::FORCE, DexoptFlags::FORCE)
        .build(f.props.as_ref())
        .unwrap();

    run(&f, &f.manager(), &params);
    let calls = f.artd.calls.lock();
    assert_eq!(calls.dexopt_needed[0].trigger, DexoptTrigger::all());
    assert_eq!(calls.dexopt_needed[0].compiler_filter, "speed");
}

#[test]
fn test_storage_low_skips_compile() {
    let f = fixture();
    f.storage.set_internal(0);

    let outcome = run(&f, &f.manager(), &params(&f, reason::BG_DEXOPT));
    let results = &outcome.package_dexopt_results[0].dex_container_file_dexopt_results;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, DexoptStatus::Skipped);
    assert!(results[0]
        .extended_status_flags
        .contains(ExtendedStatusFlags::SKIPPED_STORAGE_LOW));
    assert_eq!(f.artd.dexopt_count(), 0);
}

#[test]
fn test_compile_failure_is_recorded() {
    let f = fixture();
    f.artd.config.lock().dexopt_errors.insert(
        BASE.to_string(),
        ArtdError::service_specific("dex2oat failed [status=1,exit_code=2,signal=0]"),
    );

    let outcome = run(&f, &f.manager(), &params(&f, reason::INSTALL));
    let pkg_result = &outcome.package_dexopt_results[0];
    assert_eq!(pkg_result.status(), DexoptStatus::Failed);
    assert_eq!(pkg_result.package_level_status, None);
    let file_result = &pkg_result.dex_container_file_dexopt_results[0];
    assert_eq!(file_result.status, DexoptStatus::Failed);
    assert_eq!(file_result.dex2oat_result.exit_code, 2);
    assert_eq!(outcome.final_status(), DexoptStatus::Failed);
}

#[test]
fn test_artd_death_fails_the_package() {
    let f = fixture();
    f.artd.config.lock().fail_all = Some(ArtdError::DeadObject("artd died".to_string()));

    let manager = f.manager();
    let outcome = run(&f, &manager, &params(&f, reason::INSTALL));
    let pkg_result = &outcome.package_dexopt_results[0];
    assert_eq!(pkg_result.package_level_status, Some(DexoptStatus::Failed));
    assert!(pkg_result.dex_container_file_dexopt_results.is_empty());
    assert!(!f.artd_cache.is_cached());

    // artd came back: the next run opens a new connection.
    let connects = f.connector.connect_count();
    f.artd.config.lock().fail_all = None;
    let outcome = run(&f, &manager, &params(&f, reason::INSTALL));
    assert_eq!(outcome.package_dexopt_results[0].status(), DexoptStatus::Performed);
    assert_eq!(f.connector.connect_count(), connects + 1);
}

/// Delegates to the primary provider and records every (ABI, status) it is told about
struct RecordingProvider {
    seen: Arc<Mutex<Vec<(String, DexoptStatus)>>>,
}

impl DexInfoProvider for RecordingProvider {
    type Info = PrimaryDexInfo;

    fn is_in_dalvik_cache(&self, session: &Session<'_>) -> DexoptResult<bool> {
        PrimaryDexInfoProvider.is_in_dalvik_cache(session)
    }

    fn dex_info_list(&self, session: &Session<'_>) -> Vec<PrimaryDexInfo> {
        PrimaryDexInfoProvider.dex_info_list(session)
    }

    fn is_dexoptable(&self, session: &Session<'_>, info: &PrimaryDexInfo) -> bool {
        PrimaryDexInfoProvider.is_dexoptable(session, info)
    }

    fn needs_to_be_shared(&self, session: &Session<'_>, info: &PrimaryDexInfo) -> bool {
        PrimaryDexInfoProvider.needs_to_be_shared(session, info)
    }

    fn is_dex_file_public(&self, session: &Session<'_>, info: &PrimaryDexInfo) -> bool {
        PrimaryDexInfoProvider.is_dex_file_public(session, info)
    }

    fn is_dex_file_found(&self, session: &Session<'_>, info: &PrimaryDexInfo) -> DexoptResult<bool> {
        PrimaryDexInfoProvider.is_dex_file_found(session, info)
    }

    fn external_profiles(&self, session: &Session<'_>, info: &PrimaryDexInfo) -> Vec<ProfilePath> {
        PrimaryDexInfoProvider.external_profiles(session, info)
    }

    fn permission_settings(
        &self,
        session: &Session<'_>,
        info: &PrimaryDexInfo,
        can_be_public: bool,
    ) -> PermissionSettings {
        PrimaryDexInfoProvider.permission_settings(session, info, can_be_public)
    }

    fn all_abis(&self, session: &Session<'_>, info: &PrimaryDexInfo) -> DexoptResult<Vec<Abi>> {
        PrimaryDexInfoProvider.all_abis(session, info)
    }

    fn ref_profile_path(&self, session: &Session<'_>, info: &PrimaryDexInfo) -> ProfilePath {
        PrimaryDexInfoProvider.ref_profile_path(session, info)
    }

    fn output_profile(
        &self,
        session: &Session<'_>,
        info: &PrimaryDexInfo,
        is_public: bool,
    ) -> OutputProfile {
        PrimaryDexInfoProvider.output_profile(session, info, is_public)
    }

    fn cur_profiles(&self, session: &Session<'_>, info: &PrimaryDexInfo) -> Vec<ProfilePath> {
        PrimaryDexInfoProvider.cur_profiles(session, info)
    }

    fn dex_metadata_info(
        &self,
        session: &Session<'_>,
        info: &PrimaryDexInfo,
    ) -> DexoptResult<DexMetadataInfo> {
        PrimaryDexInfoProvider.dex_metadata_info(session, info)
    }

    fn on_target_result(
        &self,
        session: &Session<'_>,
        target: &DexoptTarget<'_, PrimaryDexInfo>,
        status: DexoptStatus,
    ) -> DexoptResult<()> {
        self.seen.lock().push((target.isa.clone(), status));
        PrimaryDexInfoProvider.on_target_result(session, target, status)
    }
}

#[test]
fn test_target_result_is_recorded_before_artd_fault_propagates() {
    let f = fixture();
    f.artd
        .config
        .lock()
        .dexopt_errors
        .insert(BASE.to_string(), ArtdError::DeadObject("artd died".to_string()));
    let ctx = f.context();
    let snapshot = f.packages.unfiltered_snapshot();
    let pkg = snapshot.get(PKG).unwrap();
    let params = params(&f, reason::INSTALL);
    let cancellation = CancellationSignal::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let provider = RecordingProvider { seen: seen.clone() };
    let session =
        Session::new(&ctx, f.artd_cache.artd().unwrap(), pkg, &params, &cancellation).unwrap();

    let err = Dexopter::new(session, provider).dexopt().unwrap_err();

    assert!(matches!(err, DexoptError::Artd(ArtdError::DeadObject(_))));
    assert_eq!(
        *seen.lock(),
        vec![("arm64".to_string(), DexoptStatus::Skipped)]
    );
}

#[test]
fn test_dm_config_can_disable_embedded_profile() {
    let f = fixture();
    {
        let mut config = f.artd.config.lock();
        config.dm_files.insert(BASE.to_string());
        config.embedded_copy_result = CopyAndRewriteProfileResult::success();
        config.dm_configs.insert(
            BASE.to_string(),
            DexMetadataConfig {
                enable_embedded_profile: false,
            },
        );
    }

    let outcome = run(&f, &f.manager(), &params(&f, reason::INSTALL));
    let file_result = &outcome.package_dexopt_results[0].dex_container_file_dexopt_results[0];
    assert_eq!(file_result.actual_compiler_filter, "verify");

    let calls = f.artd.calls.lock();
    assert!(calls.dexopt[0].profile.is_none());
    assert_eq!(
        calls.dexopt[0].dm_file,
        Some(DexMetadataPath {
            dex_path: BASE.to_string(),
        })
    );
}

#[test]
fn test_embedded_profile_used_when_dm_config_allows_it() {
    let f = fixture();
    {
        let mut config = f.artd.config.lock();
        config.dm_files.insert(BASE.to_string());
        config.embedded_copy_result = CopyAndRewriteProfileResult::success();
    }

    let outcome = run(&f, &f.manager(), &params(&f, reason::INSTALL));
    let file_result = &outcome.package_dexopt_results[0].dex_container_file_dexopt_results[0];
    assert_eq!(file_result.actual_compiler_filter, "speed-profile");
    assert!(f.artd.calls.lock().dexopt[0].profile.is_some());
}

#[test]
fn test_unknown_package() {
    let f = fixture();
    let snapshot = f.packages.unfiltered_snapshot();
    let err = f
        .manager()
        .dexopt_package(
            &snapshot,
            "com.example.missing",
            &params(&f, reason::INSTALL),
            &CancellationSignal::new(),
        )
        .unwrap_err();
    assert!(matches!(err, DexoptError::UnknownPackage(_)));
}

#[test]
fn test_disabled_by_property() {
    let f = fixture();
    f.props.set(DISABLE_DEXOPT_PROPERTY, "true").unwrap();

    let outcome = run(&f, &f.manager(), &params(&f, reason::INSTALL));
    assert!(outcome.package_dexopt_results[0]
        .dex_container_file_dexopt_results
        .is_empty());
    assert!(f.artd.calls.lock().dexopt_needed.is_empty());
}

#[test]
fn test_cancelled_before_start() {
    let f = fixture();
    let signal = CancellationSignal::new();
    signal.cancel();

    let snapshot = f.packages.unfiltered_snapshot();
    let outcome = f
        .manager()
        .dexopt_package(&snapshot, PKG, &params(&f, reason::INSTALL), &signal)
        .unwrap();
    assert_eq!(
        outcome.package_dexopt_results[0].status(),
        DexoptStatus::Cancelled
    );
    assert_eq!(f.artd.dexopt_count(), 0);
}

#[test]
fn test_cancel_during_compile_reaches_artd() {
    let f = fixture();
    let signal = CancellationSignal::new();
    let hook_signal = signal.clone();
    f.artd.config.lock().dexopt_hook = Some(Arc::new(move |_request: &DexoptRequest| {
        hook_signal.cancel();
        Ok(ArtdDexoptResult {
            cancelled: true,
            ..ArtdDexoptResult::default()
        })
    }));

    let snapshot = f.packages.unfiltered_snapshot();
    let outcome = f
        .manager()
        .dexopt_package(&snapshot, PKG, &params(&f, reason::INSTALL), &signal)
        .unwrap();
    let file_result = &outcome.package_dexopt_results[0].dex_container_file_dexopt_results[0];
    assert_eq!(file_result.status, DexoptStatus::Cancelled);

    let calls = f.artd.calls.lock();
    assert_eq!(calls.signals.len(), 1);
    assert!(calls.signals[0].is_canceled());
    // A cancelled compile leaves runtime images alone.
    assert!(calls.deleted_runtime_artifacts.is_empty());
}

#[test]
fn test_secondary_dex_files() {
    let f = fixture();
    let dex = "/data/user/0/com.example.app/code/plugin.jar";
    f.report_loads(10_001, PKG, &[(dex, "PCL[]")]).unwrap();

    let params = DexoptParams::builder(reason::CMDLINE)
        .compiler_filter("verify")
        .flags(
            DexoptFlags::FOR_SECONDARY_DEX,
            DexoptFlags::FOR_PRIMARY_DEX | DexoptFlags::FOR_SECONDARY_DEX,
        )
        .build(f.props.as_ref())
        .unwrap();
    let outcome = run(&f, &f.manager(), &params);
    let results = &outcome.package_dexopt_results[0].dex_container_file_dexopt_results;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].dex_container_file, dex);
    assert_eq!(results[0].status, DexoptStatus::Performed);

    let calls = f.artd.calls.lock();
    assert_eq!(calls.dexopt.len(), 1);
    assert_eq!(calls.dexopt[0].dex_path, dex);
    assert_eq!(calls.dexopt[0].class_loader_context.as_deref(), Some("PCL[]"));
    assert_eq!(
        calls.dexopt[0].output.artifacts_path,
        ArtifactsPath::new(dex, "arm64", false)
    );
}

#[test]
fn test_secondary_dex_loaded_by_other_apps_stays_private() {
    let f = Fixture::new(vec![
        PackageBuilder::new(PKG).build(),
        PackageBuilder::new("com.example.client").app_id(10_002).build(),
    ]);
    let dex = "/data/user/0/com.example.app/code/plugin.jar";
    f.report_loads(10_001, PKG, &[(dex, "PCL[]")]).unwrap();
    f.report_loads(10_002, "com.example.client", &[(dex, "PCL[]")])
        .unwrap();
    {
        let ref_profile = ProfilePath::SecondaryRef {
            dex_path: dex.to_string(),
        };
        let mut config = f.artd.config.lock();
        config.usable_profiles.insert(ref_profile.clone());
        config
            .profile_visibility
            .insert(ref_profile, FileVisibility::OtherReadable);
        config.artifacts_visibility.insert(
            ArtifactsPath::new(dex, "arm64", false),
            FileVisibility::NotOtherReadable,
        );
    }

    let params = DexoptParams::builder(reason::CMDLINE)
        .compiler_filter("speed-profile")
        .flags(
            DexoptFlags::FOR_SECONDARY_DEX,
            DexoptFlags::FOR_PRIMARY_DEX | DexoptFlags::FOR_SECONDARY_DEX,
        )
        .build(f.props.as_ref())
        .unwrap();
    let outcome = run(&f, &f.manager(), &params);
    let results = &outcome.package_dexopt_results[0].dex_container_file_dexopt_results;
    assert_eq!(results.len(), 1);
    // Not replaced by the filter for shared code.
    assert_eq!(results[0].actual_compiler_filter, "speed-profile");

    let calls = f.artd.calls.lock();
    assert_eq!(calls.dexopt.len(), 1);
    let permissions = &calls.dexopt[0].output.permission_settings;
    assert!(!permissions.file_fs_permission.is_other_readable);
    assert!(!permissions.dir_fs_permission.is_other_readable);
    // Private existing artifacts are not a reason to recompile.
    assert!(!calls.dexopt_needed[0]
        .trigger
        .contains(DexoptTrigger::COMPILER_FILTER_IS_WORSE));
}

#[test]
fn test_deleted_secondary_dex_file_is_ignored() {
    let f = fixture();
    let dex = "/data/user/0/com.example.app/code/gone.jar";
    f.report_loads(10_001, PKG, &[(dex, "PCL[]")]).unwrap();
    f.artd
        .config
        .lock()
        .dex_visibility
        .insert(dex.to_string(), FileVisibility::NotFound);

    let params = DexoptParams::builder(reason::BG_DEXOPT)
        .build(f.props.as_ref())
        .unwrap();
    let outcome = run(&f, &f.manager(), &params);
    assert!(outcome.package_dexopt_results[0]
        .dex_container_file_dexopt_results
        .iter()
        .all(|result| result.dex_container_file != dex));
}

#[test]
fn test_pre_reboot_skips_existing_staged_artifacts() {
    let f = fixture();
    f.artd.config.lock().artifacts_visibility.insert(
        ArtifactsPath::pre_reboot(BASE, "arm64", false),
        FileVisibility::OtherReadable,
    );
    let manager = ArtManager::new(f.context().for_pre_reboot(), BatchConfig::default());

    let outcome = run(&f, &manager, &params(&f, reason::PRE_REBOOT_DEXOPT));
    let file_result = &outcome.package_dexopt_results[0].dex_container_file_dexopt_results[0];
    assert_eq!(file_result.status, DexoptStatus::Skipped);
    assert!(file_result
        .extended_status_flags
        .contains(ExtendedStatusFlags::SKIPPED_PRE_REBOOT_ALREADY_EXIST));
    let calls = f.artd.calls.lock();
    assert!(calls.dexopt_needed.is_empty());
    assert!(calls.dexopt.is_empty());
}

#[test]
fn test_pre_reboot_writes_to_staging_area() {
    let f = fixture();
    let manager = ArtManager::new(f.context().for_pre_reboot(), BatchConfig::default());

    let outcome = run(&f, &manager, &params(&f, reason::PRE_REBOOT_DEXOPT));
    assert_eq!(
        outcome.package_dexopt_results[0].status(),
        DexoptStatus::Performed
    );
    let calls = f.artd.calls.lock();
    assert_eq!(
        calls.dexopt[0].output.artifacts_path,
        ArtifactsPath::pre_reboot(BASE, "arm64", false)
    );
    // Runtime images are still needed until the reboot.
    assert!(calls.deleted_runtime_artifacts.is_empty());
}

#[test]
fn test_trigger_keeps_base_unless_downgrading() {
    let optional = [
        DexoptFlags::FORCE,
        DexoptFlags::SHOULD_DOWNGRADE,
        DexoptFlags::FORCE_MERGE_PROFILE,
        DexoptFlags::IGNORE_PROFILE,
        DexoptFlags::SKIP_IF_STORAGE_LOW,
    ];
    let base = DexoptTrigger::COMPILER_FILTER_IS_BETTER
        | DexoptTrigger::PRIMARY_BOOT_IMAGE_BECOMES_USABLE
        | DexoptTrigger::NEED_EXTRACTION;

    for mask in 0..(1u32 << optional.len()) {
        let mut flags = DexoptFlags::FOR_PRIMARY_DEX;
        for (bit, flag) in optional.iter().enumerate() {
            if mask & (1 << bit) != 0 {
                flags |= *flag;
            }
        }
        for profile_merged in [false, true] {
            for needs_to_be_public in [false, true] {
                for visibility in [
                    FileVisibility::NotFound,
                    FileVisibility::NotOtherReadable,
                    FileVisibility::OtherReadable,
                ] {
                    let trigger =
                        dexopt_trigger(flags, profile_merged, needs_to_be_public, || {
                            Ok(visibility)
                        })
                        .unwrap();
                    if flags.contains(DexoptFlags::FORCE) {
                        assert_eq!(trigger, DexoptTrigger::all());
                    } else if flags.contains(DexoptFlags::SHOULD_DOWNGRADE) {
                        assert_eq!(trigger, DexoptTrigger::COMPILER_FILTER_IS_WORSE);
                    } else {
                        assert!(trigger.contains(base), "{:?}", flags);
                    }
                }
            }
        }
    }
}

#[test]
fn test_downgrade_never_raises_the_filter() {
    let filters = [
        "assume-verified",
        "extract",
        "verify",
        "space-profile",
        "space",
        "speed-profile",
        "speed",
        "everything-profile",
        "everything",
        compiler_filter::NOOP,
    ];
    for mask in 0..32u32 {
        let conditions = DowngradeConditions {
            vm_safe_mode: mask & 1 != 0,
            debuggable: mask & 2 != 0,
            has_class_loader_context: mask & 4 != 0,
            use_embedded_dex: mask & 8 != 0,
            ignore_profile: mask & 16 != 0,
        };
        for filter in filters {
            let adjusted = downgrade(PKG, filter, conditions);
            assert!(
                !compiler_filter::is_better(&adjusted, filter),
                "{} -> {} with {:?}",
                filter,
                adjusted,
                conditions
            );
            assert!(compiler_filter::is_valid(&adjusted));
        }
    }
}

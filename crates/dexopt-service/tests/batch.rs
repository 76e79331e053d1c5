//! Batch dexopt passes, package selection, cleanup and staged file commits

mod common;

use common::{Fixture, START_MS};
use dexopt_core::{
    ArtdDexoptResult, ArtifactsLocation, ArtifactsPath, CancellationSignal, CleanupKeepLists,
    DexoptRequest, GetDexoptNeededResult, GetDexoptStatusResult, PackageRepository, PackageState,
    ProfilePath, SystemProperties,
};
use dexopt_service::batch::DOWNGRADE_AFTER_INACTIVE_DAYS_PROPERTY;
use dexopt_service::{
    reason, BatchDexoptPass, DexoptError, DexoptOutcome, DexoptParams, DexoptStatus,
    OperationProgress, ProgressCallback,
};
use dexopt_testing::PackageBuilder;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

fn base(package_name: &str) -> String {
    format!("/data/app/{}/base.apk", package_name)
}

fn package(name: &str, app_id: i32, installed_at_ms: i64) -> PackageState {
    PackageBuilder::new(name)
        .app_id(app_id)
        .first_install_time(0, installed_at_ms)
        .build()
}

fn names(outcome: &DexoptOutcome) -> Vec<&str> {
    outcome
        .package_dexopt_results
        .iter()
        .map(|result| result.package_name.as_str())
        .collect()
}

#[test]
fn test_default_packages_sorted_by_last_active_time() {
    let f = Fixture::new(vec![
        package("pkg.a", 10_001, 3_000),
        package("pkg.b", 10_002, 5_000),
        package("pkg.c", 10_003, 5_000),
        PackageBuilder::new("pkg.apex").without_android_package().build(),
    ]);
    let manager = f.manager();
    let snapshot = f.packages.unfiltered_snapshot();

    assert_eq!(
        manager.default_packages(&snapshot, reason::BG_DEXOPT),
        vec!["pkg.b", "pkg.c", "pkg.a"]
    );

    // Loading its own APK makes pkg.a the most recently active.
    f.report_loads(10_001, "pkg.a", &[(base("pkg.a").as_str(), "PCL[]")])
        .unwrap();
    assert_eq!(
        manager.default_packages(&snapshot, reason::BG_DEXOPT),
        vec!["pkg.a", "pkg.b", "pkg.c"]
    );
}

#[test]
fn test_default_packages_skip_inactive_and_hibernating() {
    let f = Fixture::new(vec![
        package("pkg.old", 10_001, START_MS - 30 * DAY_MS),
        package("pkg.new", 10_002, START_MS - DAY_MS),
        PackageBuilder::new("pkg.sleeping")
            .app_id(10_003)
            .first_install_time(0, START_MS)
            .hibernating(true)
            .build(),
    ]);
    f.props
        .set(DOWNGRADE_AFTER_INACTIVE_DAYS_PROPERTY, "10")
        .unwrap();
    let manager = f.manager();
    let snapshot = f.packages.unfiltered_snapshot();

    // Hibernating apps are still dexopted while hibernation keeps their artifacts.
    assert_eq!(
        manager.default_packages(&snapshot, reason::BG_DEXOPT),
        vec!["pkg.sleeping", "pkg.new"]
    );
    assert_eq!(manager.default_packages(&snapshot, reason::INACTIVE), vec!["pkg.old"]);

    f.packages.state.write().oat_artifact_deletion_enabled = true;
    assert_eq!(manager.default_packages(&snapshot, reason::BG_DEXOPT), vec!["pkg.new"]);
    // Every dexoptable package is a candidate on first boot, however old.
    assert_eq!(
        manager.default_packages(&snapshot, reason::FIRST_BOOT).len(),
        2
    );
}

#[test]
fn test_mainline_update_only_covers_system_ui_and_launchers() {
    let f = Fixture::new(vec![
        package("pkg.systemui", 10_001, 1_000),
        package("pkg.launcher", 10_002, 1_000),
        package("pkg.other", 10_003, 1_000),
    ]);
    {
        let mut state = f.packages.state.write();
        state.system_ui = Some("pkg.systemui".to_string());
        state.launchers.insert("pkg.launcher".to_string());
    }
    let manager = f.manager();
    let snapshot = f.packages.unfiltered_snapshot();

    let mut selected = manager.default_packages(&snapshot, reason::BOOT_AFTER_MAINLINE_UPDATE);
    selected.sort();
    assert_eq!(selected, vec!["pkg.launcher", "pkg.systemui"]);
}

#[test]
fn test_invalid_batch_reason() {
    let f = Fixture::new(vec![package("pkg.a", 10_001, 1_000)]);
    let snapshot = f.packages.unfiltered_snapshot();
    let result = f.manager().dexopt_packages(
        &snapshot,
        reason::INSTALL,
        &CancellationSignal::new(),
        None,
    );
    assert!(matches!(result, Err(DexoptError::InvalidArgument(_))));
    assert_eq!(f.artd.dexopt_count(), 0);
}

#[test]
fn test_bg_dexopt_runs_empty_supplementary_pass_when_nothing_to_retry() {
    let f = Fixture::new(vec![
        package("pkg.a", 10_001, 1_000),
        package("pkg.b", 10_002, 2_000),
    ]);
    let snapshot = f.packages.unfiltered_snapshot();
    let results = f
        .manager()
        .dexopt_packages(&snapshot, reason::BG_DEXOPT, &CancellationSignal::new(), None)
        .unwrap();

    assert_eq!(
        results.keys().copied().collect::<Vec<_>>(),
        vec![BatchDexoptPass::Main, BatchDexoptPass::Supplementary]
    );
    let supplementary = &results[&BatchDexoptPass::Supplementary];
    assert!(supplementary.package_dexopt_results.is_empty());
    assert_eq!(supplementary.reason, reason::BG_DEXOPT);
    let main = &results[&BatchDexoptPass::Main];
    assert_eq!(main.reason, reason::BG_DEXOPT);
    assert_eq!(names(main), vec!["pkg.b", "pkg.a"]);
    assert!(main
        .package_dexopt_results
        .iter()
        .all(|result| result.status() == DexoptStatus::Performed));
}

#[test]
fn test_supplementary_pass_retries_profile_guided_skips() {
    let f = Fixture::new(vec![package("pkg.a", 10_001, 1_000)]);
    {
        let mut config = f.artd.config.lock();
        config.usable_profiles.insert(ProfilePath::PrimaryRef {
            package_name: "pkg.a".to_string(),
            profile_name: "primary".to_string(),
        });
        config.default_dexopt_needed = GetDexoptNeededResult {
            is_dexopt_needed: false,
            is_vdex_usable: false,
            has_dex_code: true,
            artifacts_location: ArtifactsLocation::NextToDex,
        };
    }
    let snapshot = f.packages.unfiltered_snapshot();
    let results = f
        .manager()
        .dexopt_packages(&snapshot, reason::BG_DEXOPT, &CancellationSignal::new(), None)
        .unwrap();

    assert_eq!(
        results.keys().copied().collect::<Vec<_>>(),
        vec![BatchDexoptPass::Main, BatchDexoptPass::Supplementary]
    );
    let main = &results[&BatchDexoptPass::Main].package_dexopt_results[0];
    assert_eq!(main.status(), DexoptStatus::Skipped);
    assert_eq!(
        main.dex_container_file_dexopt_results[0].actual_compiler_filter,
        "speed-profile"
    );
    assert_eq!(names(&results[&BatchDexoptPass::Supplementary]), vec!["pkg.a"]);

    let calls = f.artd.calls.lock();
    assert_eq!(calls.merged_profiles.len(), 2);
    assert!(!calls.merged_profiles[0].1.force_merge);
    assert!(calls.merged_profiles[1].1.force_merge);
}

#[test]
fn test_low_storage_downgrades_inactive_packages_first() {
    let f = Fixture::new(vec![
        package("pkg.old", 10_001, START_MS - 30 * DAY_MS),
        package("pkg.new", 10_002, START_MS - DAY_MS),
    ]);
    f.props
        .set(DOWNGRADE_AFTER_INACTIVE_DAYS_PROPERTY, "10")
        .unwrap();
    f.storage.set_internal(0);
    let snapshot = f.packages.unfiltered_snapshot();

    let results = f
        .manager()
        .dexopt_packages(&snapshot, reason::BG_DEXOPT, &CancellationSignal::new(), None)
        .unwrap();

    let downgrade = &results[&BatchDexoptPass::Downgrade];
    assert_eq!(downgrade.reason, reason::INACTIVE);
    assert_eq!(names(downgrade), vec!["pkg.old"]);
    assert_eq!(downgrade.package_dexopt_results[0].status(), DexoptStatus::Performed);

    // The main pass is still out of space.
    let main = &results[&BatchDexoptPass::Main];
    assert_eq!(names(main), vec!["pkg.new"]);
    assert_eq!(main.package_dexopt_results[0].status(), DexoptStatus::Skipped);

    let calls = f.artd.calls.lock();
    assert_eq!(calls.dexopt.len(), 1);
    assert_eq!(calls.dexopt[0].dex_path, base("pkg.old"));
    assert_eq!(calls.dexopt[0].compiler_filter, "verify");
}

#[test]
fn test_batch_start_callback_overrides_packages_and_filter() {
    let f = Fixture::new(vec![
        package("pkg.a", 10_001, 1_000),
        package("pkg.b", 10_002, 2_000),
    ]);
    let seen_defaults = Arc::new(Mutex::new(Vec::new()));
    let sink = seen_defaults.clone();
    let props = f.props.clone();
    f.callbacks.set_batch_dexopt_start_callback(Arc::new(
        move |_snapshot, batch_reason, defaults, batch, _signal| {
            sink.lock().extend(defaults.iter().cloned());
            batch.packages = vec!["pkg.a".to_string()];
            batch.dexopt_params = DexoptParams::builder(batch_reason)
                .compiler_filter("speed")
                .build(props.as_ref())
                .unwrap();
        },
    ));
    let snapshot = f.packages.unfiltered_snapshot();

    let results = f
        .manager()
        .dexopt_packages(&snapshot, reason::BG_DEXOPT, &CancellationSignal::new(), None)
        .unwrap();

    assert_eq!(*seen_defaults.lock(), vec!["pkg.b", "pkg.a"]);
    let main = &results[&BatchDexoptPass::Main];
    assert_eq!(main.requested_compiler_filter, "speed");
    assert_eq!(names(main), vec!["pkg.a"]);
    assert_eq!(f.artd.calls.lock().dexopt[0].compiler_filter, "speed");
}

#[test]
fn test_batch_start_callback_cannot_change_reason() {
    let f = Fixture::new(vec![package("pkg.a", 10_001, 1_000)]);
    let props = f.props.clone();
    f.callbacks.set_batch_dexopt_start_callback(Arc::new(
        move |_snapshot, _reason, _defaults, batch, _signal| {
            batch.dexopt_params = DexoptParams::builder(reason::CMDLINE)
                .build(props.as_ref())
                .unwrap();
        },
    ));
    let snapshot = f.packages.unfiltered_snapshot();

    let result = f.manager().dexopt_packages(
        &snapshot,
        reason::BG_DEXOPT,
        &CancellationSignal::new(),
        None,
    );
    assert!(result.is_err());
    assert_eq!(f.artd.dexopt_count(), 0);
}

#[test]
fn test_progress_reported_per_package() {
    let f = Fixture::new(vec![
        package("pkg.a", 10_001, 1_000),
        package("pkg.b", 10_002, 2_000),
        package("pkg.c", 10_003, 3_000),
    ]);
    let seen: Arc<Mutex<Vec<OperationProgress>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let callback: ProgressCallback = Arc::new(move |progress| sink.lock().push(progress));
    let mut progress = FxHashMap::default();
    progress.insert(BatchDexoptPass::Main, callback);
    let snapshot = f.packages.unfiltered_snapshot();

    f.manager()
        .dexopt_packages(
            &snapshot,
            reason::BG_DEXOPT,
            &CancellationSignal::new(),
            Some(&progress),
        )
        .unwrap();

    let seen = seen.lock();
    assert_eq!(seen.len(), 4);
    assert_eq!(seen[0].current, 0);
    assert_eq!(seen[3].current, 3);
    assert!(seen.iter().all(|progress| progress.total == 3));
    assert_eq!(seen[3].percentage(), 100);
}

#[test]
fn test_cleanup_waits_for_running_dexopt() {
    let f = Fixture::new(vec![
        package("pkg.a", 10_001, 1_000),
        package("pkg.b", 10_002, 2_000),
        package("pkg.c", 10_003, 3_000),
    ]);
    let active = Arc::new(AtomicUsize::new(0));
    let overlapped = Arc::new(AtomicBool::new(false));
    let started = Arc::new(AtomicBool::new(false));
    {
        let mut config = f.artd.config.lock();
        {
            let (active, started) = (active.clone(), started.clone());
            config.dexopt_hook = Some(Arc::new(move |_request: &DexoptRequest| {
                active.fetch_add(1, Ordering::SeqCst);
                started.store(true, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(30));
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(ArtdDexoptResult::default())
            }));
        }
        let (active, overlapped) = (active.clone(), overlapped.clone());
        config.cleanup_hook = Some(Arc::new(move |_keep: &CleanupKeepLists| {
            if active.load(Ordering::SeqCst) != 0 {
                overlapped.store(true, Ordering::SeqCst);
            }
        }));
    }
    f.props.set("pm.dexopt.bg-dexopt.concurrency", "2").unwrap();
    let manager = f.manager();
    let snapshot = f.packages.unfiltered_snapshot();

    thread::scope(|scope| {
        let batch = scope.spawn(|| {
            manager
                .dexopt_packages(&snapshot, reason::BG_DEXOPT, &CancellationSignal::new(), None)
                .unwrap()
        });
        while !started.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(1));
        }
        manager.cleanup(&snapshot).unwrap();
        batch.join().unwrap();
    });

    assert!(!overlapped.load(Ordering::SeqCst));
    assert_eq!(f.artd.dexopt_count(), 3);
    assert_eq!(f.artd.calls.lock().cleanups.len(), 1);
}

#[test]
fn test_cleanup_keeps_files_of_installed_packages() {
    let f = Fixture::new(vec![
        package("pkg.a", 10_001, 1_000),
        PackageBuilder::new("pkg.sleeping")
            .app_id(10_002)
            .hibernating(true)
            .build(),
    ]);
    f.packages.state.write().oat_artifact_deletion_enabled = true;
    {
        let mut config = f.artd.config.lock();
        config.cleanup_freed_bytes = 8192;
        for name in ["pkg.a", "pkg.sleeping"] {
            config.dexopt_status.insert(
                base(name),
                GetDexoptStatusResult {
                    compiler_filter: "speed-profile".to_string(),
                    compilation_reason: reason::BG_DEXOPT.to_string(),
                    location_debug_string: base(name),
                    artifacts_location: ArtifactsLocation::NextToDex,
                },
            );
        }
    }
    let snapshot = f.packages.unfiltered_snapshot();

    assert_eq!(f.manager().cleanup(&snapshot).unwrap(), 8192);

    let calls = f.artd.calls.lock();
    let keep = &calls.cleanups[0];
    assert!(!keep.keep_pre_reboot_staged_files);
    assert!(keep.profiles.contains(&ProfilePath::PrimaryRef {
        package_name: "pkg.a".to_string(),
        profile_name: "primary".to_string(),
    }));
    // Profiles of hibernating apps are kept, their artifacts are not.
    assert!(keep.profiles.contains(&ProfilePath::PrimaryRef {
        package_name: "pkg.sleeping".to_string(),
        profile_name: "primary".to_string(),
    }));
    assert_eq!(
        keep.artifacts,
        vec![ArtifactsPath::new(&base("pkg.a"), "arm64", false)]
    );
}

#[test]
fn test_boot_after_ota_commits_staged_primary_files() {
    let f = Fixture::new(vec![
        package("pkg.a", 10_001, 1_000),
        PackageBuilder::new("pkg.apex").without_android_package().build(),
    ]);
    let manager = f.manager();
    let snapshot = f.packages.unfiltered_snapshot();

    let results = manager.on_boot(&snapshot, reason::BOOT_AFTER_OTA, None).unwrap();
    assert_eq!(names(&results[&BatchDexoptPass::Main]), vec!["pkg.a"]);

    {
        let calls = f.artd.calls.lock();
        assert_eq!(calls.staged_commits.len(), 1);
        let (artifacts, profiles) = &calls.staged_commits[0];
        assert_eq!(artifacts, &vec![ArtifactsPath::new(&base("pkg.a"), "arm64", false)]);
        assert_eq!(profiles.len(), 1);
    }

    // Regular boots have nothing staged.
    manager.on_boot(&snapshot, reason::FIRST_BOOT, None).unwrap();
    assert_eq!(f.artd.calls.lock().staged_commits.len(), 1);
}

#[test]
fn test_boot_completed_commits_staged_secondary_files() {
    let f = Fixture::new(vec![package("pkg.a", 10_001, 1_000)]);
    let secondary = "/data/user/0/pkg.a/code/plugin.jar";
    f.report_loads(10_001, "pkg.a", &[(secondary, "PCL[]")]).unwrap();
    let snapshot = f.packages.unfiltered_snapshot();

    f.manager().on_boot_completed(&snapshot);

    let calls = f.artd.calls.lock();
    assert_eq!(calls.staged_commits.len(), 1);
    let (artifacts, _) = &calls.staged_commits[0];
    assert_eq!(artifacts, &vec![ArtifactsPath::new(secondary, "arm64", false)]);
}

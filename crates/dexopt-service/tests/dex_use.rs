//! Dex use tracking through the public store API
//!
//! Covers how loads are attributed to owners, what survives cleanup, and persistence
//! across restarts.

mod common;

use common::{Fixture, START_MS};
use dexopt_core::FileVisibility;
use dexopt_service::dex_use::{UNSUPPORTED_CLASS_LOADER_CONTEXT, VARYING_CLASS_LOADER_CONTEXTS};
use dexopt_service::{DexLoader, DexUseError};
use dexopt_testing::PackageBuilder;

const OWNER: &str = "com.example.owner";
const LOADER: &str = "com.example.loader";
const OWNER_APP_ID: u32 = 10_001;
const LOADER_APP_ID: u32 = 10_002;

fn owner_base() -> String {
    format!("/data/app/{}/base.apk", OWNER)
}

fn owner_secondary(name: &str) -> String {
    format!("/data/user/0/{}/{}", OWNER, name)
}

fn fixture() -> Fixture {
    Fixture::new(vec![
        PackageBuilder::new(OWNER).app_id(OWNER_APP_ID as i32).build(),
        PackageBuilder::new(LOADER).app_id(LOADER_APP_ID as i32).build(),
    ])
}

#[test]
fn test_repeated_report_only_moves_timestamp() {
    let f = fixture();
    let base = owner_base();
    let dex = owner_secondary("plugin.jar");

    f.report_loads(
        OWNER_APP_ID,
        OWNER,
        &[(base.as_str(), "PCL[]"), (dex.as_str(), "PCL[]")],
    )
    .unwrap();
    let first = f.dex_use.snapshot();
    let first_info = f.dex_use.get_secondary_dex_info(OWNER);
    assert_eq!(f.dex_use.get_package_last_used_at_ms(OWNER), START_MS);

    f.clock.advance(5_000);
    f.report_loads(
        OWNER_APP_ID,
        OWNER,
        &[(base.as_str(), "PCL[]"), (dex.as_str(), "PCL[]")],
    )
    .unwrap();
    let second = f.dex_use.snapshot();

    assert_eq!(first.record_count(), 2);
    assert_eq!(second.record_count(), 2);
    assert_ne!(first, second);
    assert_eq!(f.dex_use.get_package_last_used_at_ms(OWNER), START_MS + 5_000);
    assert_eq!(f.dex_use.get_secondary_dex_info(OWNER), first_info);
    assert_eq!(f.dex_use.get_primary_dex_loaders(OWNER, &base).len(), 1);
}

#[test]
fn test_primary_use_by_other_apps() {
    let f = fixture();
    let base = owner_base();

    f.report_loads(OWNER_APP_ID, OWNER, &[(base.as_str(), "PCL[]")]).unwrap();
    assert!(!f.dex_use.is_primary_dex_used_by_other_apps(OWNER, &base));

    // The owner's own isolated process counts as another app.
    f.dex_use
        .notify_dex_containers_loaded(
            dexopt_core::CallerInfo::new(0, 99_000),
            OWNER,
            &[(base.clone(), "PCL[]".to_string())].into_iter().collect(),
        )
        .unwrap();
    let loaders = f.dex_use.get_primary_dex_loaders(OWNER, &base);
    assert!(loaders.contains(&DexLoader::new(OWNER, true)));
    assert!(f.dex_use.is_primary_dex_used_by_other_apps(OWNER, &base));
}

#[test]
fn test_primary_use_by_foreign_package() {
    let f = fixture();
    let base = owner_base();

    f.report_loads(LOADER_APP_ID, LOADER, &[(base.as_str(), "PCL[]")]).unwrap();
    assert_eq!(
        f.dex_use
            .get_primary_dex_loaders(OWNER, &base)
            .into_iter()
            .collect::<Vec<_>>(),
        vec![DexLoader::new(LOADER, false)]
    );
    assert!(f.dex_use.is_primary_dex_used_by_other_apps(OWNER, &base));
    // The loader itself owns nothing.
    assert_eq!(f.dex_use.get_package_last_used_at_ms(LOADER), 0);
}

#[test]
fn test_secondary_contexts_aggregate() {
    let f = fixture();
    let dex = owner_secondary("plugin.jar");

    f.report_loads(OWNER_APP_ID, OWNER, &[(dex.as_str(), "PCL[]")]).unwrap();
    f.report_loads(LOADER_APP_ID, LOADER, &[(dex.as_str(), UNSUPPORTED_CLASS_LOADER_CONTEXT)])
        .unwrap();
    let info = f.dex_use.get_secondary_dex_info(OWNER);
    assert_eq!(info.len(), 1);
    assert_eq!(info[0].display_class_loader_context, "PCL[]");
    assert_eq!(info[0].class_loader_context(), Some("PCL[]"));
    assert!(info[0].is_used_by_other_apps);
    assert_eq!(info[0].user_id, 0);
    assert!(info[0].abi_names.contains("arm64-v8a"));

    f.report_loads(LOADER_APP_ID, LOADER, &[(dex.as_str(), "DLC[]")]).unwrap();
    let info = f.dex_use.get_secondary_dex_info(OWNER);
    assert_eq!(info[0].display_class_loader_context, VARYING_CLASS_LOADER_CONTEXTS);
    assert_eq!(info[0].class_loader_context(), None);

    let use_info = f.dex_use.get_secondary_dex_container_file_use_info(OWNER);
    assert_eq!(use_info.len(), 1);
    assert_eq!(
        use_info[0].loading_packages.iter().cloned().collect::<Vec<_>>(),
        vec![LOADER.to_string(), OWNER.to_string()]
    );
    assert_eq!(
        f.dex_use
            .get_secondary_class_loader_context(OWNER, &dex, &DexLoader::new(LOADER, false))
            .as_deref(),
        Some("DLC[]")
    );
}

#[test]
fn test_only_unsupported_contexts() {
    let f = fixture();
    let dex = owner_secondary("plugin.jar");

    f.report_loads(OWNER_APP_ID, OWNER, &[(dex.as_str(), UNSUPPORTED_CLASS_LOADER_CONTEXT)])
        .unwrap();
    let info = f.dex_use.get_secondary_dex_info(OWNER);
    assert_eq!(info[0].display_class_loader_context, UNSUPPORTED_CLASS_LOADER_CONTEXT);
    assert_eq!(info[0].class_loader_context(), None);
}

#[test]
fn test_checked_info_filters_private_and_missing_files() {
    let f = fixture();
    let private = owner_secondary("private.jar");
    let missing = owner_secondary("missing.jar");
    f.report_loads(
        OWNER_APP_ID,
        OWNER,
        &[(private.as_str(), "PCL[]"), (missing.as_str(), "PCL[]")],
    )
    .unwrap();
    f.report_loads(LOADER_APP_ID, LOADER, &[(private.as_str(), "PCL[]")]).unwrap();
    {
        let mut config = f.artd.config.lock();
        config
            .dex_visibility
            .insert(private.clone(), FileVisibility::NotOtherReadable);
        config
            .dex_visibility
            .insert(missing.clone(), FileVisibility::NotFound);
    }

    let all = f.dex_use.get_checked_secondary_dex_info(OWNER, false);
    assert_eq!(all.len(), 2);

    let current = f.dex_use.get_checked_secondary_dex_info(OWNER, true);
    assert_eq!(current.len(), 1);
    assert_eq!(current[0].dex_path, private);
    assert_eq!(
        current[0].loaders.iter().cloned().collect::<Vec<_>>(),
        vec![DexLoader::new(OWNER, false)]
    );
    assert!(!current[0].is_used_by_other_apps);
    assert_eq!(current[0].file_visibility, Some(FileVisibility::NotOtherReadable));
}

#[test]
fn test_cleanup_only_removes() {
    let f = fixture();
    let base = owner_base();
    let kept = owner_secondary("kept.jar");
    let deleted = owner_secondary("deleted.jar");
    let private = owner_secondary("private.jar");

    f.report_loads(
        OWNER_APP_ID,
        OWNER,
        &[
            (base.as_str(), "PCL[]"),
            (kept.as_str(), "PCL[]"),
            (deleted.as_str(), "PCL[]"),
        ],
    )
    .unwrap();
    f.report_loads(
        LOADER_APP_ID,
        LOADER,
        &[(base.as_str(), "PCL[]"), (private.as_str(), "PCL[]")],
    )
    .unwrap();
    assert_eq!(f.dex_use.snapshot().record_count(), 5);

    {
        let mut config = f.artd.config.lock();
        config
            .dex_visibility
            .insert(deleted.clone(), FileVisibility::NotFound);
        config
            .dex_visibility
            .insert(private.clone(), FileVisibility::NotOtherReadable);
    }
    let before = f.dex_use.snapshot();
    f.dex_use.cleanup();

    // The deleted file is gone, and so is the foreign loader of the now private file.
    assert_eq!(f.dex_use.snapshot().record_count(), 3);
    let secondary: Vec<String> = f
        .dex_use
        .get_secondary_dex_info(OWNER)
        .into_iter()
        .map(|info| info.dex_path)
        .collect();
    assert_eq!(secondary, vec![kept.clone()]);
    assert!(before.record_count() > f.dex_use.snapshot().record_count());

    f.packages.uninstall(LOADER);
    f.dex_use.cleanup();
    assert_eq!(f.dex_use.snapshot().record_count(), 2);
    assert_eq!(
        f.dex_use
            .get_primary_dex_loaders(OWNER, &base)
            .into_iter()
            .collect::<Vec<_>>(),
        vec![DexLoader::new(OWNER, false)]
    );

    f.packages.uninstall(OWNER);
    f.dex_use.cleanup();
    assert_eq!(f.dex_use.snapshot().record_count(), 0);
}

#[test]
fn test_invalid_report_rejected_as_a_whole() {
    let f = fixture();
    let dex = owner_secondary("plugin.jar");

    let err = f
        .report_loads(
            OWNER_APP_ID,
            OWNER,
            &[(dex.as_str(), "PCL[]"), ("relative/path.jar", "PCL[]")],
        )
        .unwrap_err();
    assert!(matches!(err, DexUseError::InvalidArgument(_)));

    let err = f
        .report_loads(OWNER_APP_ID, OWNER, &[(dex.as_str(), "not a context")])
        .unwrap_err();
    assert!(matches!(err, DexUseError::InvalidArgument(_)));

    let err = f.report_loads(OWNER_APP_ID, OWNER, &[]).unwrap_err();
    assert!(matches!(err, DexUseError::InvalidArgument(_)));

    assert_eq!(f.dex_use.snapshot().record_count(), 0);
}

#[test]
fn test_unknown_loading_package() {
    let f = fixture();
    let err = f
        .report_loads(10_050, "com.example.unknown", &[(owner_base().as_str(), "PCL[]")])
        .unwrap_err();
    assert!(matches!(err, DexUseError::UnknownPackage(_)));
}

#[test]
fn test_files_of_invisible_owner_are_dropped() {
    let f = Fixture::new(vec![
        PackageBuilder::new(LOADER).app_id(LOADER_APP_ID as i32).build(),
        PackageBuilder::new("pkg.B").app_id(10_003).build(),
    ]);

    // The owner is not installed at all.
    f.report_loads(LOADER_APP_ID, LOADER, &[("/data/user/0/pkg.A/foo.jar", "PCL[]")])
        .unwrap();
    assert_eq!(f.dex_use.snapshot().record_count(), 0);

    // The owner is installed but hidden from the caller.
    f.packages.state.write().hidden.insert("pkg.B".to_string());
    f.report_loads(LOADER_APP_ID, LOADER, &[("/data/user/0/pkg.B/foo.jar", "PCL[]")])
        .unwrap();
    assert_eq!(f.dex_use.snapshot().record_count(), 0);
    assert!(f.dex_use.get_secondary_dex_info("pkg.B").is_empty());
}

#[test]
fn test_persisted_across_restart() {
    let f = fixture();
    let base = owner_base();
    let dex = owner_secondary("plugin.jar");
    f.report_loads(
        OWNER_APP_ID,
        OWNER,
        &[(base.as_str(), "PCL[]"), (dex.as_str(), "PCL[]")],
    )
    .unwrap();
    f.report_loads(LOADER_APP_ID, LOADER, &[(dex.as_str(), "DLC[]")]).unwrap();

    // Left behind by an interrupted save; never read back.
    let stray = f.dir.path().join("package-dex-usage.pb.0badf00d.tmp");
    std::fs::write(&stray, b"partial").unwrap();

    f.dex_use.shutdown();
    assert!(f.dex_use_file().exists());

    let reopened = f.reopen_dex_use();
    assert_eq!(reopened.snapshot(), f.dex_use.snapshot());
    assert_eq!(reopened.dump(), f.dex_use.dump());
    assert_eq!(
        reopened.get_secondary_dex_info(OWNER),
        f.dex_use.get_secondary_dex_info(OWNER)
    );

    let leftovers: Vec<_> = std::fs::read_dir(f.dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".tmp") && name != "package-dex-usage.pb.0badf00d.tmp")
        .collect();
    assert!(leftovers.is_empty(), "{:?}", leftovers);
}

#[test]
fn test_save_without_changes_writes_nothing() {
    let f = fixture();
    f.dex_use.save();
    assert!(!f.dex_use_file().exists());
}

#[test]
fn test_corrupt_file_yields_empty_registry() {
    let f = fixture();
    std::fs::write(f.dex_use_file(), b"definitely not a dex use log").unwrap();
    let reopened = f.reopen_dex_use();
    assert_eq!(reopened.snapshot().record_count(), 0);

    // The store is usable and the next save replaces the corrupt file.
    reopened
        .notify_dex_containers_loaded(
            dexopt_core::CallerInfo::new(0, OWNER_APP_ID),
            OWNER,
            &[(owner_base(), "PCL[]".to_string())].into_iter().collect(),
        )
        .unwrap();
    reopened.save();
    assert_eq!(f.reopen_dex_use().snapshot().record_count(), 1);
}

//! Loading dexopt.toml and wiring its sections into the service

mod common;

use common::{Fixture, START_MS};
use dexopt_core::{CancellationSignal, DeviceAbis, PackageRepository, SystemProperties};
use dexopt_service::batch::DOWNGRADE_AFTER_INACTIVE_DAYS_PROPERTY;
use dexopt_service::{reason, ArtManager, BatchDexoptPass, ConfigError, DexoptParams, ServiceConfig};
use dexopt_testing::PackageBuilder;
use std::fs;

const CONFIG: &str = r#"
[batch]
storage_low_bytes = 20000000000

[pre_reboot]
update_engine_api = true
update_engine_timeout_ms = 2500

[device]
supported_abis = ["arm64-v8a"]

[properties]
"pm.dexopt.bg-dexopt" = "verify"
"pm.dexopt.downgrade_after_inactive_days" = "10"
"#;

#[test]
fn test_load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dexopt.toml");
    fs::write(&path, CONFIG).unwrap();

    let config = ServiceConfig::from_file(&path).unwrap();
    assert!(config.pre_reboot.update_engine_api);
    assert_eq!(config.pre_reboot.update_engine_timeout().as_millis(), 2500);
    assert_eq!(config.batch.storage_low_bytes, 20_000_000_000);

    let props = config.system_properties();
    let abis = DeviceAbis::from_properties(&props).unwrap();
    assert_eq!(abis.preferred, "arm64-v8a");
    assert!(abis.native_32.is_none());

    let params = DexoptParams::builder(reason::BG_DEXOPT).build(&props).unwrap();
    assert_eq!(params.compiler_filter(), "verify");
}

#[test]
fn test_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let err = ServiceConfig::from_file(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, ConfigError::Io(_)));
}

#[test]
fn test_batch_thresholds_drive_downgrade() {
    let config = ServiceConfig::from_str(CONFIG).unwrap();
    let f = Fixture::new(vec![
        PackageBuilder::new("pkg.old")
            .first_install_time(0, START_MS - 30 * 24 * 60 * 60 * 1000)
            .build(),
    ]);
    for (key, value) in &config.properties {
        f.props.set(key, value).unwrap();
    }
    assert_eq!(f.props.get_int(DOWNGRADE_AFTER_INACTIVE_DAYS_PROPERTY, 0), 10);
    let snapshot = f.packages.unfiltered_snapshot();

    // The fixture has 10 GB free, which the configured threshold counts as low.
    let manager = ArtManager::new(f.context(), config.batch.clone());
    let results = manager
        .dexopt_packages(&snapshot, reason::BG_DEXOPT, &CancellationSignal::new(), None)
        .unwrap();
    assert!(results.contains_key(&BatchDexoptPass::Downgrade));

    let relaxed = ArtManager::new(f.context(), Default::default());
    let results = relaxed
        .dexopt_packages(&snapshot, reason::BG_DEXOPT, &CancellationSignal::new(), None)
        .unwrap();
    assert!(!results.contains_key(&BatchDexoptPass::Downgrade));
}

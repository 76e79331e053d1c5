//! Shared fixture for the integration tests
//!
//! Wires a [`DexoptContext`] out of the in-memory fakes from `dexopt-testing`. Every test
//! gets its own scratch directory for the dex use file.

#![allow(dead_code)]

use dexopt_core::{ArtdRefCache, CallerInfo, DeviceAbis, MemoryProperties, PackageState};
use dexopt_service::config::{BatchConfig, DexUseConfig};
use dexopt_service::{ArtManager, Callbacks, DexUseStore, DexoptContext};
use dexopt_testing::{FakeArtd, FakeArtdConnector, FakePackageRepository, FakeStorage, ManualClock};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Time the fixture clock starts at
pub const START_MS: i64 = 1_700_000_000_000;

pub struct Fixture {
    pub dir: TempDir,
    pub artd: Arc<FakeArtd>,
    pub connector: Arc<FakeArtdConnector>,
    pub artd_cache: Arc<ArtdRefCache>,
    pub packages: Arc<FakePackageRepository>,
    pub props: Arc<MemoryProperties>,
    pub storage: Arc<FakeStorage>,
    pub clock: Arc<ManualClock>,
    pub callbacks: Arc<Callbacks>,
    pub device: DeviceAbis,
    pub dex_use: Arc<DexUseStore>,
}

impl Fixture {
    pub fn new(packages: Vec<PackageState>) -> Self {
        Self::with_dex_use_config(packages, |_| {})
    }

    /// Build with a tweaked dex use config. The file always lives in the scratch directory.
    pub fn with_dex_use_config(
        packages: Vec<PackageState>,
        tweak: impl FnOnce(&mut DexUseConfig),
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let artd = FakeArtd::new();
        let connector = FakeArtdConnector::new(artd.clone());
        let artd_cache = ArtdRefCache::new(connector.clone(), Duration::from_secs(60)).unwrap();
        let packages = FakePackageRepository::new(packages);
        let props = Arc::new(MemoryProperties::new());
        let storage = FakeStorage::with_internal(10_000_000_000);
        let clock = ManualClock::new(START_MS);
        let device = DeviceAbis {
            native_64: Some("arm64-v8a".to_string()),
            native_32: Some("armeabi-v7a".to_string()),
            preferred: "arm64-v8a".to_string(),
        };

        let mut config = DexUseConfig {
            file: dir.path().join("package-dex-usage.pb"),
            ..DexUseConfig::default()
        };
        tweak(&mut config);
        config.file = dir.path().join("package-dex-usage.pb");

        let dex_use = DexUseStore::new(
            config,
            packages.clone(),
            artd_cache.clone(),
            clock.clone(),
            props.clone(),
            device.clone(),
        )
        .unwrap();
        dex_use.load().unwrap();

        Self {
            dir,
            artd,
            connector,
            artd_cache,
            packages,
            props,
            storage,
            clock,
            callbacks: Callbacks::new(),
            device,
            dex_use,
        }
    }

    pub fn dex_use_file(&self) -> PathBuf {
        self.dex_use.file().to_path_buf()
    }

    /// A second store over the same file, as after a restart
    pub fn reopen_dex_use(&self) -> Arc<DexUseStore> {
        let config = DexUseConfig {
            file: self.dex_use_file(),
            ..DexUseConfig::default()
        };
        let store = DexUseStore::new(
            config,
            self.packages.clone(),
            self.artd_cache.clone(),
            self.clock.clone(),
            self.props.clone(),
            self.device.clone(),
        )
        .unwrap();
        store.load().unwrap();
        store
    }

    pub fn context(&self) -> DexoptContext {
        DexoptContext {
            artd: self.artd_cache.clone(),
            packages: self.packages.clone(),
            dex_use: self.dex_use.clone(),
            props: self.props.clone(),
            storage: self.storage.clone(),
            clock: self.clock.clone(),
            device: self.device.clone(),
            callbacks: self.callbacks.clone(),
            is_pre_reboot: false,
            art_version: 350_000_000,
        }
    }

    pub fn manager(&self) -> Arc<ArtManager> {
        ArtManager::new(self.context(), BatchConfig::default())
    }

    /// Report loads by `loading_package` running as `app_id` for user 0
    pub fn report_loads(
        &self,
        app_id: u32,
        loading_package: &str,
        entries: &[(&str, &str)],
    ) -> dexopt_service::error::DexUseResult<()> {
        self.dex_use.notify_dex_containers_loaded(
            CallerInfo::new(0, app_id),
            loading_package,
            &entries
                .iter()
                .map(|(path, clc)| (path.to_string(), clc.to_string()))
                .collect::<BTreeMap<_, _>>(),
        )
    }
}

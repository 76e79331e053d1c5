//! In-memory artd

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use dexopt_core::{
    ArtdCancellationSignal, ArtdConnector, ArtdDexoptResult, ArtdError, ArtdResult,
    ArtifactStore, ArtifactsLocation, ArtifactsPath, CleanupKeepLists,
    CopyAndRewriteProfileResult, DexMetadataConfig, DexMetadataPath, DexoptRequest, DexoptTrigger,
    FileVisibility,
    GetDexoptNeededResult, GetDexoptStatusResult, MergeProfileOptions, OutputProfile,
    OutputSecureDexMetadataCompanion, ProfilePath, RuntimeArtifactsPath, SdmSdcPaths,
    TmpProfilePath, WritableProfilePath,
};

type DexoptHook = Arc<dyn Fn(&DexoptRequest) -> ArtdResult<ArtdDexoptResult> + Send + Sync>;
type CleanupHook = Arc<dyn Fn(&CleanupKeepLists) + Send + Sync>;

/// Cancellation token that records whether it was cancelled
#[derive(Debug, Default)]
pub struct FakeArtdCancellationSignal {
    canceled: AtomicBool,
}

impl FakeArtdCancellationSignal {
    /// Whether `cancel` was called
    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }
}

impl ArtdCancellationSignal for FakeArtdCancellationSignal {
    fn cancel(&self) -> ArtdResult<()> {
        self.canceled.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn get_child_process_pids(&self) -> ArtdResult<Vec<i32>> {
        Ok(Vec::new())
    }
}

/// Answers returned by [`FakeArtd`]. Everything defaults to "nothing on disk".
pub struct FakeArtdConfig {
    /// Answer for `get_dexopt_needed`, keyed by (dex path, isa)
    pub dexopt_needed: FxHashMap<(String, String), GetDexoptNeededResult>,
    /// Fallback answer for `get_dexopt_needed`
    pub default_dexopt_needed: GetDexoptNeededResult,
    /// Per-dex-path errors for `get_dexopt_needed`
    pub dexopt_needed_errors: FxHashMap<String, ArtdError>,
    /// Answer for `get_dexopt_status`, keyed by dex path
    pub dexopt_status: FxHashMap<String, GetDexoptStatusResult>,
    /// Per-dex-path errors for `dexopt`
    pub dexopt_errors: FxHashMap<String, ArtdError>,
    /// Replaces the default `dexopt` behavior
    pub dexopt_hook: Option<DexoptHook>,
    /// Runs at the start of `cleanup`
    pub cleanup_hook: Option<CleanupHook>,
    /// Dex file visibility; unknown files are other-readable
    pub dex_visibility: FxHashMap<String, FileVisibility>,
    /// Visibility of existing artifacts; unknown artifacts are not found
    pub artifacts_visibility: FxHashMap<ArtifactsPath, FileVisibility>,
    /// Profile visibility; unknown profiles are not found
    pub profile_visibility: FxHashMap<ProfilePath, FileVisibility>,
    /// Dex paths that have a dex metadata file next to them
    pub dm_files: FxHashSet<String>,
    /// Config of those dex metadata files; absent entries use the defaults
    pub dm_configs: FxHashMap<String, DexMetadataConfig>,
    /// Profiles considered usable
    pub usable_profiles: FxHashSet<ProfilePath>,
    /// Result of `merge_profiles`
    pub merge_result: bool,
    /// Result of `copy_and_rewrite_profile`, keyed by source
    pub copy_results: FxHashMap<ProfilePath, CopyAndRewriteProfileResult>,
    /// Result of `copy_and_rewrite_embedded_profile`
    pub embedded_copy_result: CopyAndRewriteProfileResult,
    /// Dex paths whose artifacts go to dalvik-cache
    pub dalvik_cache_dex_paths: FxHashSet<String>,
    /// Result of `check_pre_reboot_system_requirements`
    pub system_requirements_met: bool,
    /// When set, every call fails with this error
    pub fail_all: Option<ArtdError>,
    /// Bytes reported freed by `cleanup`
    pub cleanup_freed_bytes: i64,
}

impl Default for FakeArtdConfig {
    fn default() -> Self {
        Self {
            dexopt_needed: FxHashMap::default(),
            default_dexopt_needed: GetDexoptNeededResult {
                is_dexopt_needed: true,
                is_vdex_usable: false,
                has_dex_code: true,
                artifacts_location: ArtifactsLocation::NoneOrError,
            },
            dexopt_needed_errors: FxHashMap::default(),
            dexopt_status: FxHashMap::default(),
            dexopt_errors: FxHashMap::default(),
            dexopt_hook: None,
            cleanup_hook: None,
            dex_visibility: FxHashMap::default(),
            artifacts_visibility: FxHashMap::default(),
            profile_visibility: FxHashMap::default(),
            dm_files: FxHashSet::default(),
            dm_configs: FxHashMap::default(),
            usable_profiles: FxHashSet::default(),
            merge_result: false,
            copy_results: FxHashMap::default(),
            embedded_copy_result: CopyAndRewriteProfileResult::no_profile(),
            dalvik_cache_dex_paths: FxHashSet::default(),
            system_requirements_met: true,
            fail_all: None,
            cleanup_freed_bytes: 0,
        }
    }
}

/// A `get_dexopt_needed` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DexoptNeededCall {
    /// Dex path
    pub dex_path: String,
    /// ISA
    pub isa: String,
    /// Class loader context
    pub class_loader_context: Option<String>,
    /// Requested filter
    pub compiler_filter: String,
    /// Trigger mask
    pub trigger: DexoptTrigger,
}

/// Calls observed by [`FakeArtd`]
#[derive(Debug, Default)]
pub struct ArtdCalls {
    /// `get_dexopt_needed`
    pub dexopt_needed: Vec<DexoptNeededCall>,
    /// `dexopt`
    pub dexopt: Vec<DexoptRequest>,
    /// `delete_artifacts`
    pub deleted_artifacts: Vec<ArtifactsPath>,
    /// `delete_runtime_artifacts`
    pub deleted_runtime_artifacts: Vec<RuntimeArtifactsPath>,
    /// `delete_sdm_sdc_files`
    pub deleted_sdm_sdc_files: Vec<SdmSdcPaths>,
    /// `maybe_create_sdc`
    pub created_sdc: Vec<SdmSdcPaths>,
    /// `merge_profiles` (inputs, options)
    pub merged_profiles: Vec<(Vec<ProfilePath>, MergeProfileOptions)>,
    /// `commit_tmp_profile`
    pub committed_profiles: Vec<TmpProfilePath>,
    /// `delete_profile`
    pub deleted_profiles: Vec<ProfilePath>,
    /// `cleanup`
    pub cleanups: Vec<CleanupKeepLists>,
    /// `commit_pre_reboot_staged_files`
    pub staged_commits: Vec<(Vec<ArtifactsPath>, Vec<WritableProfilePath>)>,
    /// `clean_up_pre_reboot_staged_files`
    pub staged_cleanups: usize,
    /// Cancellation tokens handed out
    pub signals: Vec<Arc<FakeArtdCancellationSignal>>,
}

/// In-memory [`ArtifactStore`]
#[derive(Default)]
pub struct FakeArtd {
    /// Answers
    pub config: Mutex<FakeArtdConfig>,
    /// Observed calls
    pub calls: Mutex<ArtdCalls>,
    next_tmp_id: AtomicUsize,
}

impl FakeArtd {
    /// A fresh fake behind an `Arc`
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of compiles so far
    pub fn dexopt_count(&self) -> usize {
        self.calls.lock().dexopt.len()
    }

    fn check_alive(&self) -> ArtdResult<()> {
        match &self.config.lock().fail_all {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn assign_tmp_id(&self, output: &mut OutputProfile) {
        let id = self.next_tmp_id.fetch_add(1, Ordering::SeqCst);
        output.profile_path.id = format!("tmp{}", id);
    }
}

impl ArtifactStore for FakeArtd {
    fn get_dexopt_status(
        &self,
        dex_path: &str,
        _isa: &str,
        _class_loader_context: Option<&str>,
    ) -> ArtdResult<GetDexoptStatusResult> {
        self.check_alive()?;
        Ok(self
            .config
            .lock()
            .dexopt_status
            .get(dex_path)
            .cloned()
            .unwrap_or_else(|| GetDexoptStatusResult {
                compiler_filter: "run-from-apk".to_string(),
                compilation_reason: "unknown".to_string(),
                location_debug_string: dex_path.to_string(),
                artifacts_location: ArtifactsLocation::NoneOrError,
            }))
    }

    fn get_dexopt_needed(
        &self,
        dex_path: &str,
        isa: &str,
        class_loader_context: Option<&str>,
        compiler_filter: &str,
        trigger: DexoptTrigger,
    ) -> ArtdResult<GetDexoptNeededResult> {
        self.check_alive()?;
        self.calls.lock().dexopt_needed.push(DexoptNeededCall {
            dex_path: dex_path.to_string(),
            isa: isa.to_string(),
            class_loader_context: class_loader_context.map(str::to_string),
            compiler_filter: compiler_filter.to_string(),
            trigger,
        });
        let config = self.config.lock();
        if let Some(err) = config.dexopt_needed_errors.get(dex_path) {
            return Err(err.clone());
        }
        Ok(config
            .dexopt_needed
            .get(&(dex_path.to_string(), isa.to_string()))
            .copied()
            .unwrap_or(config.default_dexopt_needed))
    }

    fn dexopt(&self, request: &DexoptRequest) -> ArtdResult<ArtdDexoptResult> {
        self.check_alive()?;
        self.calls.lock().dexopt.push(request.clone());
        let hook = self.config.lock().dexopt_hook.clone();
        if let Some(hook) = hook {
            return hook(request);
        }
        if let Some(err) = self.config.lock().dexopt_errors.get(&request.dex_path) {
            return Err(err.clone());
        }
        Ok(ArtdDexoptResult {
            cancelled: false,
            wall_time_ms: 100,
            cpu_time_ms: 80,
            size_bytes: 4096,
            size_before_bytes: 0,
        })
    }

    fn create_cancellation_signal(&self) -> ArtdResult<Arc<dyn ArtdCancellationSignal>> {
        self.check_alive()?;
        let signal = Arc::new(FakeArtdCancellationSignal::default());
        self.calls.lock().signals.push(Arc::clone(&signal));
        Ok(signal)
    }

    fn delete_artifacts(&self, artifacts_path: &ArtifactsPath) -> ArtdResult<i64> {
        self.check_alive()?;
        self.calls
            .lock()
            .deleted_artifacts
            .push(artifacts_path.clone());
        Ok(1024)
    }

    fn delete_runtime_artifacts(&self, path: &RuntimeArtifactsPath) -> ArtdResult<i64> {
        self.check_alive()?;
        self.calls
            .lock()
            .deleted_runtime_artifacts
            .push(path.clone());
        Ok(0)
    }

    fn delete_sdm_sdc_files(&self, path: &SdmSdcPaths) -> ArtdResult<i64> {
        self.check_alive()?;
        self.calls.lock().deleted_sdm_sdc_files.push(path.clone());
        Ok(0)
    }

    fn maybe_create_sdc(&self, output: &OutputSecureDexMetadataCompanion) -> ArtdResult<()> {
        self.check_alive()?;
        self.calls.lock().created_sdc.push(output.sdc_path.clone());
        Ok(())
    }

    fn get_artifacts_visibility(&self, artifacts_path: &ArtifactsPath) -> ArtdResult<FileVisibility> {
        self.check_alive()?;
        Ok(self
            .config
            .lock()
            .artifacts_visibility
            .get(artifacts_path)
            .copied()
            .unwrap_or(FileVisibility::NotFound))
    }

    fn get_dex_file_visibility(&self, dex_path: &str) -> ArtdResult<FileVisibility> {
        self.check_alive()?;
        Ok(self
            .config
            .lock()
            .dex_visibility
            .get(dex_path)
            .copied()
            .unwrap_or(FileVisibility::OtherReadable))
    }

    fn get_profile_visibility(&self, profile: &ProfilePath) -> ArtdResult<FileVisibility> {
        self.check_alive()?;
        Ok(self
            .config
            .lock()
            .profile_visibility
            .get(profile)
            .copied()
            .unwrap_or(FileVisibility::NotFound))
    }

    fn get_dm_file_visibility(&self, dm: &DexMetadataPath) -> ArtdResult<FileVisibility> {
        self.check_alive()?;
        Ok(if self.config.lock().dm_files.contains(&dm.dex_path) {
            FileVisibility::OtherReadable
        } else {
            FileVisibility::NotFound
        })
    }

    fn get_dm_config(&self, dm: &DexMetadataPath) -> ArtdResult<DexMetadataConfig> {
        self.check_alive()?;
        let config = self.config.lock();
        if !config.dm_files.contains(&dm.dex_path) {
            return Err(ArtdError::service_specific(format!(
                "No dex metadata file for '{}'",
                dm.dex_path
            )));
        }
        Ok(config.dm_configs.get(&dm.dex_path).copied().unwrap_or_default())
    }

    fn is_profile_usable(&self, profile: &ProfilePath, _dex_path: &str) -> ArtdResult<bool> {
        self.check_alive()?;
        Ok(self.config.lock().usable_profiles.contains(profile))
    }

    fn merge_profiles(
        &self,
        profiles: &[ProfilePath],
        _reference: Option<&ProfilePath>,
        output: &mut OutputProfile,
        _dex_paths: &[String],
        options: MergeProfileOptions,
    ) -> ArtdResult<bool> {
        self.check_alive()?;
        self.calls
            .lock()
            .merged_profiles
            .push((profiles.to_vec(), options));
        let merged = self.config.lock().merge_result;
        if merged {
            self.assign_tmp_id(output);
        }
        Ok(merged)
    }

    fn copy_and_rewrite_profile(
        &self,
        src: &ProfilePath,
        dst: &mut OutputProfile,
        _dex_path: &str,
    ) -> ArtdResult<CopyAndRewriteProfileResult> {
        self.check_alive()?;
        let result = self
            .config
            .lock()
            .copy_results
            .get(src)
            .cloned()
            .unwrap_or_else(CopyAndRewriteProfileResult::no_profile);
        if result == CopyAndRewriteProfileResult::success() {
            self.assign_tmp_id(dst);
        }
        Ok(result)
    }

    fn copy_and_rewrite_embedded_profile(
        &self,
        dst: &mut OutputProfile,
        _dex_path: &str,
    ) -> ArtdResult<CopyAndRewriteProfileResult> {
        self.check_alive()?;
        let result = self.config.lock().embedded_copy_result.clone();
        if result == CopyAndRewriteProfileResult::success() {
            self.assign_tmp_id(dst);
        }
        Ok(result)
    }

    fn commit_tmp_profile(&self, profile: &TmpProfilePath) -> ArtdResult<()> {
        self.check_alive()?;
        self.calls.lock().committed_profiles.push(profile.clone());
        Ok(())
    }

    fn delete_profile(&self, profile: &ProfilePath) -> ArtdResult<()> {
        self.check_alive()?;
        self.calls.lock().deleted_profiles.push(profile.clone());
        Ok(())
    }

    fn cleanup(&self, keep: &CleanupKeepLists) -> ArtdResult<i64> {
        self.check_alive()?;
        let hook = self.config.lock().cleanup_hook.clone();
        if let Some(hook) = hook {
            hook(keep);
        }
        self.calls.lock().cleanups.push(keep.clone());
        Ok(self.config.lock().cleanup_freed_bytes)
    }

    fn commit_pre_reboot_staged_files(
        &self,
        artifacts: &[ArtifactsPath],
        profiles: &[WritableProfilePath],
    ) -> ArtdResult<bool> {
        self.check_alive()?;
        self.calls
            .lock()
            .staged_commits
            .push((artifacts.to_vec(), profiles.to_vec()));
        Ok(!artifacts.is_empty() || !profiles.is_empty())
    }

    fn clean_up_pre_reboot_staged_files(&self) -> ArtdResult<()> {
        self.check_alive()?;
        self.calls.lock().staged_cleanups += 1;
        Ok(())
    }

    fn check_pre_reboot_system_requirements(&self, _chroot_dir: &str) -> ArtdResult<bool> {
        self.check_alive()?;
        Ok(self.config.lock().system_requirements_met)
    }

    fn is_in_dalvik_cache(&self, dex_path: &str) -> ArtdResult<bool> {
        self.check_alive()?;
        Ok(self.config.lock().dalvik_cache_dex_paths.contains(dex_path))
    }
}

/// Connector that always hands out the same [`FakeArtd`]
pub struct FakeArtdConnector {
    artd: Arc<FakeArtd>,
    connects: AtomicUsize,
}

impl FakeArtdConnector {
    /// Wrap `artd`
    pub fn new(artd: Arc<FakeArtd>) -> Arc<Self> {
        Arc::new(Self {
            artd,
            connects: AtomicUsize::new(0),
        })
    }

    /// Number of connections opened
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl ArtdConnector for FakeArtdConnector {
    fn connect(&self) -> ArtdResult<Arc<dyn ArtifactStore>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(self.artd.clone())
    }
}

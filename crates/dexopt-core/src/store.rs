//! The artifact store: the privileged service (artd) that owns compiled artifacts and
//! profiles on disk and runs the compiler.
//!
//! Every call may fail with a communication fault ([`ArtdError::DeadObject`] or
//! [`ArtdError::Remote`]) or with a per-item [`ArtdError::ServiceSpecific`] fault.

use std::sync::Arc;

use crate::artifacts::{
    ArtdDexoptResult, ArtifactsPath, CleanupKeepLists, CopyAndRewriteProfileResult,
    DexMetadataConfig, DexMetadataPath, DexoptRequest, DexoptTrigger, FileVisibility,
    GetDexoptNeededResult, GetDexoptStatusResult, MergeProfileOptions, OutputProfile,
    OutputSecureDexMetadataCompanion, ProfilePath, RuntimeArtifactsPath, SdmSdcPaths,
    TmpProfilePath, WritableProfilePath,
};
use crate::error::ArtdResult;

/// artd-side cancellation token for one compile
pub trait ArtdCancellationSignal: Send + Sync {
    /// Interrupt the compile this token was passed to. Idempotent.
    fn cancel(&self) -> ArtdResult<()>;

    /// Process ids of compiler children currently running under this token
    fn get_child_process_pids(&self) -> ArtdResult<Vec<i32>>;
}

/// Operations offered by artd
pub trait ArtifactStore: Send + Sync {
    /// Describe the artifacts of a dex file as they exist on disk
    fn get_dexopt_status(
        &self,
        dex_path: &str,
        isa: &str,
        class_loader_context: Option<&str>,
    ) -> ArtdResult<GetDexoptStatusResult>;

    /// Decide whether a compile is needed given `trigger`
    fn get_dexopt_needed(
        &self,
        dex_path: &str,
        isa: &str,
        class_loader_context: Option<&str>,
        compiler_filter: &str,
        trigger: DexoptTrigger,
    ) -> ArtdResult<GetDexoptNeededResult>;

    /// Run the compiler
    fn dexopt(&self, request: &DexoptRequest) -> ArtdResult<ArtdDexoptResult>;

    /// Create a fresh cancellation token
    fn create_cancellation_signal(&self) -> ArtdResult<Arc<dyn ArtdCancellationSignal>>;

    /// Delete compiled artifacts; returns bytes freed
    fn delete_artifacts(&self, artifacts_path: &ArtifactsPath) -> ArtdResult<i64>;

    /// Delete runtime images; returns bytes freed
    fn delete_runtime_artifacts(&self, path: &RuntimeArtifactsPath) -> ArtdResult<i64>;

    /// Delete a secure dex metadata companion; returns bytes freed
    fn delete_sdm_sdc_files(&self, path: &SdmSdcPaths) -> ArtdResult<i64>;

    /// Create the secure dex metadata companion if the SDM file exists
    fn maybe_create_sdc(&self, output: &OutputSecureDexMetadataCompanion) -> ArtdResult<()>;

    /// Visibility of the artifacts of a dex file
    fn get_artifacts_visibility(&self, artifacts_path: &ArtifactsPath) -> ArtdResult<FileVisibility>;

    /// Visibility of a dex file
    fn get_dex_file_visibility(&self, dex_path: &str) -> ArtdResult<FileVisibility>;

    /// Visibility of a profile
    fn get_profile_visibility(&self, profile: &ProfilePath) -> ArtdResult<FileVisibility>;

    /// Visibility of a dex metadata file
    fn get_dm_file_visibility(&self, dm: &DexMetadataPath) -> ArtdResult<FileVisibility>;

    /// Config of an existing dex metadata file. A file without a config yields the defaults.
    fn get_dm_config(&self, dm: &DexMetadataPath) -> ArtdResult<DexMetadataConfig>;

    /// Whether a profile exists and matches `dex_path`
    fn is_profile_usable(&self, profile: &ProfilePath, dex_path: &str) -> ArtdResult<bool>;

    /// Merge `profiles` on top of `reference` into `output`.
    ///
    /// Returns `false` when there was nothing new to merge. On `true`, `output.profile_path.id`
    /// has been filled in.
    fn merge_profiles(
        &self,
        profiles: &[ProfilePath],
        reference: Option<&ProfilePath>,
        output: &mut OutputProfile,
        dex_paths: &[String],
        options: MergeProfileOptions,
    ) -> ArtdResult<bool>;

    /// Copy `src` into `dst`, rewriting checksums for `dex_path`
    fn copy_and_rewrite_profile(
        &self,
        src: &ProfilePath,
        dst: &mut OutputProfile,
        dex_path: &str,
    ) -> ArtdResult<CopyAndRewriteProfileResult>;

    /// Copy the profile embedded in the APK into `dst`
    fn copy_and_rewrite_embedded_profile(
        &self,
        dst: &mut OutputProfile,
        dex_path: &str,
    ) -> ArtdResult<CopyAndRewriteProfileResult>;

    /// Atomically move a temporary profile to its final path
    fn commit_tmp_profile(&self, profile: &TmpProfilePath) -> ArtdResult<()>;

    /// Delete a profile if it exists
    fn delete_profile(&self, profile: &ProfilePath) -> ArtdResult<()>;

    /// Delete every managed file not in `keep`; returns bytes freed
    fn cleanup(&self, keep: &CleanupKeepLists) -> ArtdResult<i64>;

    /// Promote staged pre-reboot outputs; returns whether anything was committed
    fn commit_pre_reboot_staged_files(
        &self,
        artifacts: &[ArtifactsPath],
        profiles: &[WritableProfilePath],
    ) -> ArtdResult<bool>;

    /// Remove everything in the pre-reboot staging area
    fn clean_up_pre_reboot_staged_files(&self) -> ArtdResult<()>;

    /// Whether the new system image in `chroot_dir` is compatible with this service
    fn check_pre_reboot_system_requirements(&self, chroot_dir: &str) -> ArtdResult<bool>;

    /// Whether artifacts for `dex_path` belong in dalvik-cache
    fn is_in_dalvik_cache(&self, dex_path: &str) -> ArtdResult<bool>;
}

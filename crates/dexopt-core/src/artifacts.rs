//! Value types exchanged with artd
//!
//! These mirror the artd wire surface: paths describing where compiled artifacts and
//! profiles live, permission settings for outputs, and per-call options and results.

use bitflags::bitflags;
use std::fmt;
use std::sync::Arc;

use crate::store::ArtdCancellationSignal;

/// Filesystem visibility of a file as seen by artd
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FileVisibility {
    /// The file does not exist
    NotFound,
    /// The file exists but lacks the S_IROTH bit
    NotOtherReadable,
    /// The file is readable by everyone
    OtherReadable,
}

/// Where the usable artifacts of a dex file were found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactsLocation {
    /// No usable artifacts, or the lookup failed
    NoneOrError,
    /// In the global dalvik-cache directory
    DalvikCache,
    /// In the `oat` directory next to the dex file
    NextToDex,
    /// Inside the dex metadata file (vdex only)
    Dm,
    /// Secure dex metadata, dalvik-cache companion
    SdmDalvikCache,
    /// Secure dex metadata, next to the dex file
    SdmNextToDex,
}

/// Location of the oat/vdex/art triple for one (dex file, ISA)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArtifactsPath {
    /// Absolute path of the dex container file
    pub dex_path: String,
    /// Instruction set, e.g. "arm64"
    pub isa: String,
    /// Whether the artifacts live in dalvik-cache
    pub is_in_dalvik_cache: bool,
    /// Whether this points at the pre-reboot staging area
    pub is_pre_reboot: bool,
}

impl ArtifactsPath {
    /// Path of committed artifacts
    pub fn new(dex_path: &str, isa: &str, is_in_dalvik_cache: bool) -> Self {
        Self {
            dex_path: dex_path.to_string(),
            isa: isa.to_string(),
            is_in_dalvik_cache,
            is_pre_reboot: false,
        }
    }

    /// Path of staged pre-reboot artifacts
    pub fn pre_reboot(dex_path: &str, isa: &str, is_in_dalvik_cache: bool) -> Self {
        Self {
            is_pre_reboot: true,
            ..Self::new(dex_path, isa, is_in_dalvik_cache)
        }
    }
}

impl fmt::Display for ArtifactsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ArtifactsPath[dexPath = {}, isa = {}, isInDalvikCache = {}]",
            self.dex_path, self.isa, self.is_in_dalvik_cache
        )
    }
}

/// Location of runtime-generated images for a primary dex file
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuntimeArtifactsPath {
    /// Owning package
    pub package_name: String,
    /// Absolute path of the dex container file
    pub dex_path: String,
    /// Instruction set
    pub isa: String,
}

/// Location of a secure dex metadata file and its companion
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SdmSdcPaths {
    /// Absolute path of the dex container file
    pub dex_path: String,
    /// Instruction set
    pub isa: String,
    /// Whether the companion lives in dalvik-cache
    pub is_in_dalvik_cache: bool,
}

/// A dex metadata (`.dm`) file, identified by the dex file it sits next to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DexMetadataPath {
    /// Absolute path of the dex container file
    pub dex_path: String,
}

/// Settings stored in the `config.pb` entry of a dex metadata file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DexMetadataConfig {
    /// Whether the profile embedded in the APK may seed the reference profile
    pub enable_embedded_profile: bool,
}

impl Default for DexMetadataConfig {
    fn default() -> Self {
        Self {
            enable_embedded_profile: true,
        }
    }
}

/// A profile location that can be written through a temporary file
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WritableProfilePath {
    /// Reference profile of a primary dex file
    PrimaryRef {
        /// Owning package
        package_name: String,
        /// "primary" for the base APK, "<split>.split" for splits
        profile_name: String,
        /// Whether this is the staged pre-reboot copy
        is_pre_reboot: bool,
    },
    /// Reference profile of a secondary dex file
    SecondaryRef {
        /// Absolute path of the secondary dex file
        dex_path: String,
        /// Whether this is the staged pre-reboot copy
        is_pre_reboot: bool,
    },
}

/// A temporary profile that becomes `final_path` once committed
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TmpProfilePath {
    /// Where the profile lands on commit
    pub final_path: WritableProfilePath,
    /// Unique suffix, assigned by artd when the file is created
    pub id: String,
}

/// Any profile artd can read
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProfilePath {
    /// Reference profile of a primary dex file
    PrimaryRef {
        /// Owning package
        package_name: String,
        /// Profile name
        profile_name: String,
    },
    /// A profile shipped next to the APK (`<apk>.prof`)
    Prebuilt {
        /// Absolute path of the dex container file
        dex_path: String,
    },
    /// Per-user current profile of a primary dex file
    PrimaryCur {
        /// Android user id
        user_id: u32,
        /// Owning package
        package_name: String,
        /// Profile name
        profile_name: String,
    },
    /// Reference profile of a secondary dex file
    SecondaryRef {
        /// Absolute path of the secondary dex file
        dex_path: String,
    },
    /// Current profile of a secondary dex file
    SecondaryCur {
        /// Absolute path of the secondary dex file
        dex_path: String,
    },
    /// A temporary profile produced by a merge or a copy
    Tmp(TmpProfilePath),
    /// The profile embedded in a dex metadata file
    DexMetadata(DexMetadataPath),
}

impl ProfilePath {
    /// The temporary profile, if this is one
    pub fn as_tmp(&self) -> Option<&TmpProfilePath> {
        match self {
            ProfilePath::Tmp(tmp) => Some(tmp),
            _ => None,
        }
    }

    /// Whether this is a temporary profile
    pub fn is_tmp(&self) -> bool {
        self.as_tmp().is_some()
    }
}

impl fmt::Display for ProfilePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProfilePath::PrimaryRef {
                package_name,
                profile_name,
            } => write!(f, "PrimaryRefProfilePath[{}/{}]", package_name, profile_name),
            ProfilePath::Prebuilt { dex_path } => write!(f, "PrebuiltProfilePath[{}]", dex_path),
            ProfilePath::PrimaryCur {
                user_id,
                package_name,
                profile_name,
            } => write!(
                f,
                "PrimaryCurProfilePath[{}/{}/{}]",
                user_id, package_name, profile_name
            ),
            ProfilePath::SecondaryRef { dex_path } => {
                write!(f, "SecondaryRefProfilePath[{}]", dex_path)
            }
            ProfilePath::SecondaryCur { dex_path } => {
                write!(f, "SecondaryCurProfilePath[{}]", dex_path)
            }
            ProfilePath::Tmp(tmp) => write!(f, "TmpProfilePath[{:?}, id = {}]", tmp.final_path, tmp.id),
            ProfilePath::DexMetadata(dm) => write!(f, "DexMetadataPath[{}]", dm.dex_path),
        }
    }
}

/// Ownership and mode bits for created files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FsPermission {
    /// Owner uid
    pub uid: u32,
    /// Owner gid
    pub gid: u32,
    /// S_IROTH
    pub is_other_readable: bool,
    /// S_IXOTH
    pub is_other_executable: bool,
}

/// SELinux context to apply to secondary dex outputs
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SeContext {
    /// The package's seinfo
    pub seinfo: String,
    /// The app uid
    pub uid: u32,
}

/// Permissions for an output directory and the files in it
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PermissionSettings {
    /// Permission of the containing directory
    pub dir_fs_permission: FsPermission,
    /// Permission of each artifact file
    pub file_fs_permission: FsPermission,
    /// SELinux context, if any
    pub se_context: Option<SeContext>,
}

/// Where and how artd writes artifacts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputArtifacts {
    /// Target location
    pub artifacts_path: ArtifactsPath,
    /// Permissions of the outputs
    pub permission_settings: PermissionSettings,
}

/// Where and how artd writes a temporary profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputProfile {
    /// Temporary path; `id` is filled in by artd
    pub profile_path: TmpProfilePath,
    /// Permission of the profile file
    pub fs_permission: FsPermission,
}

/// Where and how artd writes a secure dex metadata companion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSecureDexMetadataCompanion {
    /// Companion location
    pub sdc_path: SdmSdcPaths,
    /// Permissions of the companion
    pub permission_settings: PermissionSettings,
}

bitflags! {
    /// Conditions under which artd reports that dexopt is needed
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DexoptTrigger: u32 {
        /// The requested filter is better than the existing one
        const COMPILER_FILTER_IS_BETTER = 1 << 0;
        /// The requested filter equals the existing one
        const COMPILER_FILTER_IS_SAME = 1 << 1;
        /// The requested filter is worse than the existing one
        const COMPILER_FILTER_IS_WORSE = 1 << 2;
        /// The primary boot image became usable since the last compile
        const PRIMARY_BOOT_IMAGE_BECOMES_USABLE = 1 << 3;
        /// The dex code must be extracted from the APK
        const NEED_EXTRACTION = 1 << 4;
    }
}

/// Scheduling priority passed to the compiler process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PriorityClass(pub i32);

impl PriorityClass {
    /// Use the reason's default
    pub const NONE: PriorityClass = PriorityClass(-1);
    /// Boot-time compilation
    pub const BOOT: PriorityClass = PriorityClass(100);
    /// Install with a user waiting and a tight deadline
    pub const INTERACTIVE_FAST: PriorityClass = PriorityClass(80);
    /// Install or command-line compilation
    pub const INTERACTIVE: PriorityClass = PriorityClass(60);
    /// Background jobs
    pub const BACKGROUND: PriorityClass = PriorityClass(40);

    /// Whether this is `NONE` or within `[0, 100]`
    pub fn is_valid(self) -> bool {
        self == Self::NONE || (0..=100).contains(&self.0)
    }
}

/// Per-compile options
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DexoptOptions {
    /// Compilation reason recorded in the oat header
    pub compilation_reason: String,
    /// The app's target SDK
    pub target_sdk_version: i32,
    /// Compile as debuggable
    pub debuggable: bool,
    /// Produce an app image
    pub generate_app_image: bool,
    /// Enforce hidden API restrictions
    pub hidden_api_policy_enabled: bool,
    /// Free-form metadata stored with the artifacts
    pub comments: String,
}

/// Answer to `get_dexopt_needed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetDexoptNeededResult {
    /// Whether a compile should run
    pub is_dexopt_needed: bool,
    /// Whether an existing vdex can be reused as input
    pub is_vdex_usable: bool,
    /// Whether the dex container has any code at all
    pub has_dex_code: bool,
    /// Where the reusable artifacts were found
    pub artifacts_location: ArtifactsLocation,
}

/// Outcome of a compile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArtdDexoptResult {
    /// The compile was interrupted by a cancellation signal
    pub cancelled: bool,
    /// Wall time of the compiler process
    pub wall_time_ms: i64,
    /// CPU time of the compiler process
    pub cpu_time_ms: i64,
    /// Total size of the new artifacts
    pub size_bytes: i64,
    /// Total size of the artifacts that were replaced
    pub size_before_bytes: i64,
}

/// Status of a profile copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyAndRewriteStatus {
    /// The output profile was written
    Success,
    /// The source does not exist or is empty
    NoProfile,
    /// The source exists but is malformed
    BadProfile,
}

/// Outcome of `copy_and_rewrite_profile`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyAndRewriteProfileResult {
    /// What happened
    pub status: CopyAndRewriteStatus,
    /// Details for `BadProfile`
    pub error_msg: String,
}

impl CopyAndRewriteProfileResult {
    /// A successful copy
    pub fn success() -> Self {
        Self {
            status: CopyAndRewriteStatus::Success,
            error_msg: String::new(),
        }
    }

    /// Nothing to copy
    pub fn no_profile() -> Self {
        Self {
            status: CopyAndRewriteStatus::NoProfile,
            error_msg: String::new(),
        }
    }

    /// A malformed source
    pub fn bad_profile(error_msg: impl Into<String>) -> Self {
        Self {
            status: CopyAndRewriteStatus::BadProfile,
            error_msg: error_msg.into(),
        }
    }
}

/// Options for `merge_profiles`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MergeProfileOptions {
    /// Merge even if nothing changed since the last merge
    pub force_merge: bool,
    /// Produce a textual dump instead of a profile
    pub dump_only: bool,
    /// With `dump_only`, dump classes and methods only
    pub dump_classes_and_methods: bool,
    /// The output is for the boot image
    pub for_boot_image: bool,
}

/// Answer to `get_dexopt_status`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetDexoptStatusResult {
    /// Filter of the existing artifacts, or a status word such as "run-from-apk"
    pub compiler_filter: String,
    /// Reason recorded with the existing artifacts
    pub compilation_reason: String,
    /// Where the artifacts were looked up, for humans
    pub location_debug_string: String,
    /// Where usable artifacts were found
    pub artifacts_location: ArtifactsLocation,
}

/// Files that `cleanup` must not delete
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupKeepLists {
    /// Reference and current profiles
    pub profiles: Vec<ProfilePath>,
    /// Full artifacts
    pub artifacts: Vec<ArtifactsPath>,
    /// Artifacts of which only the vdex is usable
    pub vdex_files: Vec<ArtifactsPath>,
    /// Secure dex metadata companions
    pub sdm_sdc_files: Vec<SdmSdcPaths>,
    /// Runtime images
    pub runtime_artifacts: Vec<RuntimeArtifactsPath>,
    /// Keep everything in the pre-reboot staging area
    pub keep_pre_reboot_staged_files: bool,
}

/// A compile request
#[derive(Clone)]
pub struct DexoptRequest {
    /// Output location and permissions
    pub output: OutputArtifacts,
    /// Dex container to compile
    pub dex_path: String,
    /// Target instruction set
    pub isa: String,
    /// Class loader context; `None` skips the context check (verify only)
    pub class_loader_context: Option<String>,
    /// Compiler filter
    pub compiler_filter: String,
    /// Profile to guide compilation
    pub profile: Option<ProfilePath>,
    /// Existing vdex to reuse
    pub input_vdex: Option<ArtifactsPath>,
    /// Dex metadata file to pass along
    pub dm_file: Option<DexMetadataPath>,
    /// Process priority
    pub priority_class: PriorityClass,
    /// Compile options
    pub options: DexoptOptions,
    /// artd-side cancellation token for this compile
    pub cancellation: Arc<dyn ArtdCancellationSignal>,
}

impl fmt::Debug for DexoptRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DexoptRequest")
            .field("output", &self.output)
            .field("dex_path", &self.dex_path)
            .field("isa", &self.isa)
            .field("class_loader_context", &self.class_loader_context)
            .field("compiler_filter", &self.compiler_filter)
            .field("profile", &self.profile)
            .field("input_vdex", &self.input_vdex)
            .field("dm_file", &self.dm_file)
            .field("priority_class", &self.priority_class)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

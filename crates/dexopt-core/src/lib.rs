//! Dexopt Core Library
//!
//! Collaborator contracts and shared primitives for the dexopt service:
//! - The artifact store (artd) interface and its value types
//! - Reference-counted, debounced caching of the artd connection
//! - The installed-package model and repository interface
//! - Platform facilities (system properties, clock, storage, job scheduler)
//! - Cancellation tokens, a trailing debouncer, and a serialized executor

#![warn(missing_docs)]

pub mod artifacts;
pub mod cancel;
pub mod debouncer;
pub mod error;
pub mod executor;
pub mod jobs;
pub mod packages;
pub mod platform;
pub mod ref_cache;
pub mod store;

pub use artifacts::{
    ArtdDexoptResult, ArtifactsLocation, ArtifactsPath, CleanupKeepLists,
    CopyAndRewriteProfileResult, CopyAndRewriteStatus, DexMetadataConfig, DexMetadataPath,
    DexoptOptions, DexoptRequest, DexoptTrigger, FileVisibility, FsPermission,
    GetDexoptNeededResult, GetDexoptStatusResult, MergeProfileOptions, OutputArtifacts,
    OutputProfile, OutputSecureDexMetadataCompanion, PermissionSettings, PriorityClass,
    ProfilePath, RuntimeArtifactsPath, SdmSdcPaths, SeContext, TmpProfilePath,
    WritableProfilePath,
};
pub use cancel::CancellationSignal;
pub use debouncer::Debouncer;
pub use error::{log_artd_error, ArtdError, ArtdResult};
pub use executor::SerializedExecutor;
pub use jobs::{
    ChrootSetup, JobFinishedNotifier, JobInfo, JobParameters, JobScheduler, UpdateEngine,
    CHROOT_DIR,
};
pub use packages::{
    AndroidPackage, CallerInfo, PackageRepository, PackageSnapshot, PackageState, SharedLibrary,
    SharedLibraryKind, Split, PLATFORM_PACKAGE_NAME,
};
pub use platform::{
    Clock, DeviceAbis, DeviceConfig, MemoryProperties, StorageManager, SystemClock,
    SystemProperties,
};
pub use ref_cache::{ArtdConnector, ArtdPin, ArtdRefCache};
pub use store::{ArtdCancellationSignal, ArtifactStore};

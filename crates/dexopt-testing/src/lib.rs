//! Dexopt test support
//!
//! In-memory fakes of every collaborator the dexopt service talks to, plus fixture builders
//! for installed packages. The fakes record the calls they receive so tests can assert on
//! them.

#![warn(missing_docs)]

pub mod artd;
pub mod packages;
pub mod platform;

pub use artd::{
    ArtdCalls, DexoptNeededCall, FakeArtd, FakeArtdCancellationSignal, FakeArtdConfig,
    FakeArtdConnector,
};
pub use packages::{shared_library, FakePackageRepository, PackageBuilder, RepositoryState};
pub use platform::{
    FakeChrootSetup, FakeJobScheduler, FakeStorage, FakeUpdateEngine, ManualClock,
    RecordingJobFinished,
};

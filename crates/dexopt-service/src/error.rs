//! Service-wide error types

use dexopt_core::ArtdError;
use thiserror::Error;

/// Errors reported by the dex use store
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DexUseError {
    /// The caller passed malformed input; nothing was recorded
    #[error("{0}")]
    InvalidArgument(String),

    /// The named package is not installed or not visible
    #[error("Package '{0}' is not found")]
    UnknownPackage(String),

    /// `load` was called more than once
    #[error("Load has already been attempted")]
    AlreadyLoaded,
}

/// Errors reported by dexopt and batch operations
#[derive(Debug, Error)]
pub enum DexoptError {
    /// Bad arguments or flag combinations
    #[error("{0}")]
    InvalidArgument(String),

    /// The named package is not installed or not visible
    #[error("Package '{0}' is not found")]
    UnknownPackage(String),

    /// An internal invariant was violated
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// artd call failed
    #[error(transparent)]
    Artd(#[from] ArtdError),

    /// Dex use lookup failed
    #[error(transparent)]
    DexUse(#[from] DexUseError),

    /// A profile could not be merged for a snapshot or dump
    #[error("Failed to snapshot profile: {0}")]
    SnapshotProfile(String),
}

impl DexoptError {
    /// Whether this wraps an artd communication fault
    pub fn is_artd_communication(&self) -> bool {
        matches!(self, DexoptError::Artd(err) if err.is_communication())
    }
}

/// Errors reported by the pre-reboot dexopt job
#[derive(Debug, Error)]
pub enum PreRebootError {
    /// update_engine could not map the OTA snapshots
    #[error("update_engine: {0}")]
    UpdateEngine(String),

    /// The new system image cannot be dexopted from the running system
    #[error("System requirement check failed: {0}")]
    SystemRequirement(String),

    /// artd or the chroot setup service failed
    #[error(transparent)]
    Artd(#[from] ArtdError),

    /// The chroot could not be torn down
    #[error("{0}")]
    Chroot(String),

    /// A job was started while another one was running, or similar
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// The batch dexopt itself failed
    #[error(transparent)]
    Dexopt(DexoptError),
}

impl From<DexoptError> for PreRebootError {
    fn from(err: DexoptError) -> Self {
        match err {
            DexoptError::Artd(err) => PreRebootError::Artd(err),
            other => PreRebootError::Dexopt(other),
        }
    }
}

/// Result type for dexopt operations
pub type DexoptResult<T> = Result<T, DexoptError>;

/// Result type for dex use operations
pub type DexUseResult<T> = Result<T, DexUseError>;

/// Return `IllegalState` with `message` unless `cond` holds
pub(crate) fn check(cond: bool, message: impl FnOnce() -> String) -> DexoptResult<()> {
    if cond {
        Ok(())
    } else {
        Err(DexoptError::IllegalState(message()))
    }
}

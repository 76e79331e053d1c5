//! Errors reported by the artifact store (artd)

use thiserror::Error;

/// Errors that can occur when calling artd
///
/// `DeadObject` and `Remote` are communication faults: the connection is gone or the
/// call never reached the service. `ServiceSpecific` is reported by artd itself about
/// one item (a dex file, a profile) and is recoverable by skipping that item.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArtdError {
    /// The artd process died or the connection was dropped
    #[error("artd connection lost: {0}")]
    DeadObject(String),

    /// Any other transport failure
    #[error("artd remote error: {0}")]
    Remote(String),

    /// A per-item failure reported by artd
    #[error("artd service error {code}: {message}")]
    ServiceSpecific {
        /// Service-defined error code
        code: i32,
        /// Human readable description
        message: String,
    },
}

impl ArtdError {
    /// Build a service-specific error with code `-1`
    pub fn service_specific(message: impl Into<String>) -> Self {
        ArtdError::ServiceSpecific {
            code: -1,
            message: message.into(),
        }
    }

    /// Whether this is a per-item fault
    pub fn is_service_specific(&self) -> bool {
        matches!(self, ArtdError::ServiceSpecific { .. })
    }

    /// Whether this is a connection-level fault
    pub fn is_communication(&self) -> bool {
        !self.is_service_specific()
    }

    /// The message carried by the error, without the kind prefix
    pub fn message(&self) -> &str {
        match self {
            ArtdError::DeadObject(msg) | ArtdError::Remote(msg) => msg,
            ArtdError::ServiceSpecific { message, .. } => message,
        }
    }
}

/// Result type for artd calls
pub type ArtdResult<T> = Result<T, ArtdError>;

/// Log a communication fault.
///
/// A dead object is expected when artd crashes (it logs its own stack) or when it is killed
/// before us during shutdown, so only a short line is written. Anything else is unexpected.
pub fn log_artd_error(error: &ArtdError) {
    let message = "An error occurred when calling artd";
    match error {
        ArtdError::DeadObject(_) => log::error!("{}", message),
        other => log::error!("{}: unexpected failure: {}", message, other),
    }
}

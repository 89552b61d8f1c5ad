//! Errors surfaced to bus callers.

/// The error kinds of the `net.reactivated.Fprint.Error` namespace.
///
/// Every method handler reports failures through one of these so that
/// clients see stable error names rather than generic bus failures.
#[derive(Debug, zbus::DBusError)]
#[zbus(prefix = "net.reactivated.Fprint.Error")]
pub enum Error {
    #[zbus(error)]
    ZBus(zbus::Error),
    /// Device must be claimed before use.
    ClaimDevice(String),
    /// Device is claimed by someone else, or an operation is in flight.
    AlreadyInUse(String),
    Internal(String),
    PermissionDenied(String),
    NoEnrolledPrints(String),
    FingerAlreadyEnrolled(String),
    NoActionInProgress(String),
    InvalidFingername(String),
    NoSuchDevice(String),
    PrintsNotDeleted(String),
    PrintsNotDeletedFromDevice(String),
}

pub type Result<T> = std::result::Result<T, Error>;

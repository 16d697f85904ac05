use thiserror::Error;

/// Error taxonomy for the whole crate (spec §7/§6 `Error enum`).
///
/// `Overflow` is not really an error: `mon_poll` returns it as a normal
/// `Ok` variant so callers can skip a sample without losing the group, but
/// it lives in the same enum because every other crate boundary (back-end
/// I/O, parameter checks, the init latch) reports through `RdtError`.
#[derive(Debug, Error)]
pub enum RdtError {
    /// Caller contract violation: null/empty argument, value out of range,
    /// wrong interface for the operation.
    #[error("invalid parameter: {0}")]
    Param(String),

    /// The platform, kernel or current configuration cannot satisfy the
    /// request (feature absent, CDP format mismatch, no free COS, PID
    /// vanished).
    #[error("unsupported or exhausted resource: {0}")]
    Resource(String),

    /// Back-end read/write failed unexpectedly.
    #[error("backend I/O failure: {0}")]
    Internal(#[from] std::io::Error),

    /// Operation requires `init` to have run, or was called after `fini`.
    #[error("library not initialised")]
    NotInitialized,

    /// `init` called while already initialised.
    #[error("library already initialised")]
    AlreadyInitialized,

    /// The process-exclusive lock is held by another process.
    #[error("another process holds the configuration lock")]
    Busy,

    /// Caller lacks permission for the requested back-end operation.
    #[error("permission denied: {0}")]
    Perm(String),

    /// A monitoring counter's delta implied a bandwidth above the
    /// platform-maximum threshold; the caller should discard the sample.
    #[error("counter overflow detected")]
    Overflow,
}

pub type Result<T> = std::result::Result<T, RdtError>;

impl RdtError {
    pub fn param(msg: impl Into<String>) -> Self {
        RdtError::Param(msg.into())
    }

    pub fn resource(msg: impl Into<String>) -> Self {
        RdtError::Resource(msg.into())
    }

    pub fn perm(msg: impl Into<String>) -> Self {
        RdtError::Perm(msg.into())
    }
}

//! Runtime error codes.

/// Convenience alias for results returned by runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by runtime operations.
///
/// Operations never unwind; every fallible entry point reports one of
/// these codes.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Resource exhaustion, e.g. a carrier thread could not be spawned
    #[error("out of resources: {0}")]
    Mem(String),

    /// Operation on an unusable scheduler (terminated or already freed)
    #[error("invalid scheduler")]
    InvalidSched,

    /// A pool access-mode constraint rejected the operation
    #[error("pool access mode violation")]
    InvalidPoolAccess,

    /// The calling OS thread is not attached to an execution stream
    #[error("caller is not attached to an execution stream")]
    InvalidXstream,

    /// Structural scheduler error (double association, out-of-range
    /// pool slice, ...)
    #[error("scheduler error: {0}")]
    Sched(&'static str),

    /// The requested predefined scheduler does not exist
    #[error("unknown predefined scheduler")]
    InvalidSchedPredef,
}

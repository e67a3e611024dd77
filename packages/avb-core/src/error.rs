//! Centralized error type for the AVB stream handler core.
//!
//! Unifies what used to be two separate error families (a generic result
//! and an AVB-specific result) into one [`Error`] enum. Configuration-time
//! errors are returned to the caller; hot-path errors (TX enqueue failures,
//! RX parse failures) are counted in per-stream/per-sequencer diagnostics and
//! never surfaced through this type.

use thiserror::Error;

/// Application-wide result alias for control-API and setup-time operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy for the AVB stream handler core.
#[derive(Debug, Error)]
pub enum Error {
    /// Unspecified failure not covered by a more specific variant.
    #[error("generic failure: {0}")]
    Generic(String),

    /// The target object has already been initialized.
    #[error("already initialized")]
    AlreadyInitialized,

    /// The target object has not been initialized yet.
    #[error("not initialized")]
    NotInitialized,

    /// One or more arguments failed validation.
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    /// A fixed-size allocation (packet pool, etc.) is exhausted.
    #[error("out of memory")]
    OutOfMemory,

    /// The referenced stream, clock domain, or queue does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The requested operation is not supported by this build/configuration.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// The operation is transient; retry later.
    #[error("try again")]
    TryAgain,

    /// A resource that only accepts a single owner already has one
    /// (e.g. a second event listener registration).
    #[error("already in use: {0}")]
    AlreadyInUse(String),

    /// Adding this would exceed a class's reserved bandwidth, or a fixed
    /// pool/queue is full.
    #[error("no space left")]
    NoSpaceLeft,

    /// Worker or engine initialization failed.
    #[error("initialization failed: {0}")]
    InitializationFailed(String),

    /// A required pointer-like handle was null/absent.
    #[error("null pointer")]
    NullPointer,

    /// A realtime worker thread failed to start.
    #[error("thread start failed: {0}")]
    ThreadStartFailed(String),

    /// A realtime worker thread failed to stop cleanly.
    #[error("thread stop failed: {0}")]
    ThreadStopFailed(String),

    /// Carries an OS-provided errno for I/O failures (socket, NIC ioctl).
    #[error("OS error (errno {0})")]
    Errno(i32),
}

impl Error {
    /// Builds an [`Error::Errno`] from the current value of `errno`.
    #[must_use]
    pub fn from_io(err: &std::io::Error) -> Self {
        match err.raw_os_error() {
            Some(code) => Self::Errno(code),
            None => Self::Generic(err.to_string()),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::from_io(&err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_carries_raw_os_code() {
        let io_err = std::io::Error::from_raw_os_error(11); // EAGAIN
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Errno(11)));
    }

    #[test]
    fn display_is_non_empty_for_every_variant() {
        let variants = [
            Error::Generic("x".into()),
            Error::AlreadyInitialized,
            Error::NotInitialized,
            Error::InvalidParam("x".into()),
            Error::OutOfMemory,
            Error::NotFound("x".into()),
            Error::NotSupported("x".into()),
            Error::TryAgain,
            Error::AlreadyInUse("x".into()),
            Error::NoSpaceLeft,
            Error::InitializationFailed("x".into()),
            Error::NullPointer,
            Error::ThreadStartFailed("x".into()),
            Error::ThreadStopFailed("x".into()),
            Error::Errno(5),
        ];
        for v in variants {
            assert!(!v.to_string().is_empty());
        }
    }
}

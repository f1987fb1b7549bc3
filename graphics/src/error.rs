//! Errors raised while creating GPU objects or driving the frame loop.

use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphicsError {
    /// Instance, device or frame slot creation failed.
    InitializationFailed(String),
    /// A native object could not be created.
    ResourceCreationFailed(String),
    FeatureNotSupported(String),
    OutOfMemory,
    DeviceLost,
    /// A handle, size or description the device rejected.
    InvalidParameter(String),
    Internal(String),
    /// A fence did not signal within the given bound.
    Timeout(Duration),
}

impl GraphicsError {
    /// The device can no longer make progress; every later call fails too.
    pub fn is_device_failure(&self) -> bool {
        matches!(self, Self::DeviceLost | Self::Timeout(_))
    }
}

impl fmt::Display for GraphicsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InitializationFailed(msg) => write!(f, "initialization failed: {msg}"),
            Self::ResourceCreationFailed(msg) => write!(f, "could not create resource: {msg}"),
            Self::FeatureNotSupported(msg) => write!(f, "unsupported feature: {msg}"),
            Self::OutOfMemory => f.write_str("device out of memory"),
            Self::DeviceLost => f.write_str("device lost"),
            Self::InvalidParameter(msg) => write!(f, "invalid parameter: {msg}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
            Self::Timeout(after) => write!(f, "fence not signaled after {after:?}"),
        }
    }
}

impl std::error::Error for GraphicsError {}

/// Abort the frame loop on an unrecoverable backend failure.
///
/// Per-frame failures have no recovery path short of recreating the device,
/// so they end the process with a diagnostic instead of propagating.
#[track_caller]
pub(crate) fn fatal(what: &str, error: impl fmt::Display) -> ! {
    log::error!("Fatal graphics error while trying to {what}: {error}");
    panic!("fatal graphics error while trying to {what}: {error}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(GraphicsError::OutOfMemory.to_string(), "device out of memory");
        assert_eq!(
            GraphicsError::InitializationFailed("no GPU found".to_string()).to_string(),
            "initialization failed: no GPU found"
        );
        assert_eq!(
            GraphicsError::Timeout(Duration::from_millis(5)).to_string(),
            "fence not signaled after 5ms"
        );
    }

    #[test]
    fn test_device_failures() {
        assert!(GraphicsError::DeviceLost.is_device_failure());
        assert!(GraphicsError::Timeout(Duration::ZERO).is_device_failure());
        assert!(!GraphicsError::InvalidParameter("size".into()).is_device_failure());
    }

    #[test]
    #[should_panic(expected = "fatal graphics error while trying to wait for the frame fence")]
    fn test_fatal_panics_with_context() {
        fatal("wait for the frame fence", GraphicsError::DeviceLost);
    }
}

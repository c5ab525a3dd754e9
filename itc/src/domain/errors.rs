//! Structured error types for itc
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! Every variant maps onto the errno a device reader would have received
//! (see [`ItcError::errno`]).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ItcError {
    #[error("Device already in use: another reader holds the idle hook")]
    AlreadyInUse,

    #[error("No idle mechanism available: {0}")]
    NoIdleMechanism(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Failed to copy snapshot to reader: {0}")]
    CopyFault(#[source] std::io::Error),

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("Wake barrier timed out: {acknowledged} of {expected} CPUs acknowledged")]
    WakeTimeout { acknowledged: usize, expected: usize },

    #[error("Failed to load eBPF program: {0}")]
    EbpfLoadFailed(String),

    #[error("Failed to attach {program} to {tracepoint}: {error}")]
    AttachFailed { program: String, tracepoint: String, error: String },

    #[error("Failed to read CPU topology: {0}")]
    Topology(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ItcError {
    /// Errno equivalent of this error, as returned by the device operations
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            ItcError::AlreadyInUse => libc::EALREADY,
            ItcError::NoIdleMechanism(_) | ItcError::EbpfLoadFailed(_) => libc::ENODEV,
            ItcError::InvalidArgument(_) => libc::EINVAL,
            ItcError::CopyFault(_) => libc::EFAULT,
            ItcError::NotSupported(_) => libc::ENOTTY,
            ItcError::WakeTimeout { .. } => libc::ETIMEDOUT,
            ItcError::AttachFailed { .. } | ItcError::Topology(_) => libc::EIO,
            ItcError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_already_in_use_display() {
        let err = ItcError::AlreadyInUse;
        assert!(err.to_string().contains("already in use"));
        assert_eq!(err.errno(), libc::EALREADY);
    }

    #[test]
    fn test_attach_error() {
        let err = ItcError::AttachFailed {
            program: "cpu_idle_hook".to_string(),
            tracepoint: "power/cpu_idle".to_string(),
            error: "tracepoint not found".to_string(),
        };
        assert!(err.to_string().contains("cpu_idle_hook"));
        assert!(err.to_string().contains("power/cpu_idle"));
        assert_eq!(err.errno(), libc::EIO);
    }

    #[test]
    fn test_errno_mapping() {
        assert_eq!(ItcError::InvalidArgument("short".into()).errno(), libc::EINVAL);
        assert_eq!(ItcError::NoIdleMechanism("none".into()).errno(), libc::ENODEV);
        assert_eq!(ItcError::NotSupported("ioctl".into()).errno(), libc::ENOTTY);

        let copy = ItcError::CopyFault(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        assert_eq!(copy.errno(), libc::EFAULT);

        let io = ItcError::Io(std::io::Error::from_raw_os_error(libc::EACCES));
        assert_eq!(io.errno(), libc::EACCES);
    }
}

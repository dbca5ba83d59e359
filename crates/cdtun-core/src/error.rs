//! Error types for cdtun-core.

use std::io;

use thiserror::Error;

/// Main error type for tunnel operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from underlying system calls.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The OS refused a device open or command execution.
    #[error("permission denied: {message}")]
    PermissionDenied { message: String },

    /// Kernel module missing, no free unit, or driver library not found.
    #[error("device unavailable: {message}")]
    DeviceUnavailable { message: String },

    /// Host OS is none of Linux, Darwin, Windows.
    #[error("platform does not support TUN devices")]
    PlatformUnsupported,

    /// Caller-supplied argument failed validation.
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Operation on a handle or session after close().
    #[error("already closed")]
    AlreadyClosed,

    /// Handshake bytes malformed.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Handshake exceeded its deadline.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// Address/route/MTU command failed for a non-idempotent reason.
    #[error("configuration failed: {message}")]
    ConfigurationFailed { message: String },

    /// Required administrative command not present on the host.
    #[error("required tool not found: {tool}")]
    ToolingMissing { tool: String },

    /// Interface statistics output missing or unparseable.
    #[error("interface statistics unavailable")]
    StatsUnavailable,

    /// Fatal failure while bringing up the tunnel interface.
    #[error("tunnel setup failed: {message}")]
    Setup { message: String },
}

impl Error {
    /// Build an `InvalidArgument` error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Error::InvalidArgument {
            message: message.into(),
        }
    }

    /// Build a `Protocol` error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol {
            message: message.into(),
        }
    }

    /// Build a `ConfigurationFailed` error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Error::ConfigurationFailed {
            message: message.into(),
        }
    }

    /// Classify an I/O error from a device open or syscall.
    ///
    /// `EPERM`/`EACCES` become [`Error::PermissionDenied`]; a missing device
    /// node or kernel module becomes [`Error::DeviceUnavailable`]; everything
    /// else stays an [`Error::Io`].
    pub fn from_device_io(err: io::Error, context: &str) -> Self {
        match err.kind() {
            io::ErrorKind::PermissionDenied => Error::PermissionDenied {
                message: format!("{context}: {err}"),
            },
            io::ErrorKind::NotFound => Error::DeviceUnavailable {
                message: format!("{context}: {err}"),
            },
            _ => Error::Io(err),
        }
    }

    /// Returns true if this error terminates the tunnel rather than a single
    /// packet.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::AlreadyClosed
                | Error::Protocol { .. }
                | Error::HandshakeTimeout
                | Error::Setup { .. }
                | Error::PlatformUnsupported
        )
    }
}

/// Convenience result type for tunnel operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_protocol() {
        let err = Error::protocol("bad magic");
        assert_eq!(err.to_string(), "protocol error: bad magic");
    }

    #[test]
    fn error_display_tooling() {
        let err = Error::ToolingMissing { tool: "ip".into() };
        assert_eq!(err.to_string(), "required tool not found: ip");
    }

    #[test]
    fn io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::BrokenPipe, "pipe");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn device_io_classification() {
        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert!(matches!(
            Error::from_device_io(denied, "open /dev/net/tun"),
            Error::PermissionDenied { .. }
        ));

        let missing = io::Error::new(io::ErrorKind::NotFound, "no such file");
        assert!(matches!(
            Error::from_device_io(missing, "open /dev/net/tun"),
            Error::DeviceUnavailable { .. }
        ));

        let other = io::Error::new(io::ErrorKind::Interrupted, "intr");
        assert!(matches!(
            Error::from_device_io(other, "read"),
            Error::Io(_)
        ));
    }

    #[test]
    fn fatal_errors() {
        assert!(Error::AlreadyClosed.is_fatal());
        assert!(Error::HandshakeTimeout.is_fatal());
        assert!(Error::protocol("x").is_fatal());

        assert!(!Error::StatsUnavailable.is_fatal());
        assert!(!Error::configuration("route add failed").is_fatal());
        assert!(!Error::Io(io::Error::other("transient")).is_fatal());
    }
}

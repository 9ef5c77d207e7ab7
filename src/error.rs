use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Status code returned by the image component when it rejects a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HardwareStatus(pub u32);

impl HardwareStatus {
    /// Generic component failure
    pub const UNDEFINED: Self = Self(0x8000_1001);
    /// The component does not accept the request in its current state
    pub const INCORRECT_STATE: Self = Self(0x8000_1018);
    /// A parameter was rejected
    pub const BAD_PARAMETER: Self = Self(0x8000_1005);
}

impl fmt::Display for HardwareStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Invalid argument: {details}")]
    InvalidArgument { details: String },

    #[error("Hardware rejected {operation}: status {status}")]
    HardwareRejected {
        operation: String,
        status: HardwareStatus,
    },

    #[error("Timed out after {waited:?} waiting for {event}")]
    Timeout { event: String, waited: Duration },

    #[error("Resource exhausted: {details}")]
    ResourceExhausted { details: String },

    #[error("Not ready: {details}")]
    NotReady { details: String },

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] toml::ser::Error),
}

impl CaptureError {
    pub fn invalid_argument<S: Into<String>>(details: S) -> Self {
        Self::InvalidArgument {
            details: details.into(),
        }
    }

    pub fn hardware<S: Into<String>>(operation: S, status: HardwareStatus) -> Self {
        Self::HardwareRejected {
            operation: operation.into(),
            status,
        }
    }

    pub fn timeout<S: Into<String>>(event: S, waited: Duration) -> Self {
        Self::Timeout {
            event: event.into(),
            waited,
        }
    }

    pub fn not_ready<S: Into<String>>(details: S) -> Self {
        Self::NotReady {
            details: details.into(),
        }
    }

    /// Soft failures leave the capture state consistent; the operation
    /// continued past the missing event before reporting it.
    pub fn is_soft(&self) -> bool {
        matches!(self, CaptureError::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, CaptureError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_formats_as_hex() {
        assert_eq!(HardwareStatus(0x1a).to_string(), "0x1a");
        let err = CaptureError::hardware("set capture mode", HardwareStatus::BAD_PARAMETER);
        assert!(err.to_string().contains("0x80001005"));
    }

    #[test]
    fn test_only_timeouts_are_soft() {
        assert!(CaptureError::timeout("port enable", Duration::from_millis(10)).is_soft());
        assert!(!CaptureError::invalid_argument("null").is_soft());
        assert!(!CaptureError::hardware("fill", HardwareStatus::UNDEFINED).is_soft());
    }
}

//! Error types shared by the controller, the enumeration service and the drivers.

use std::fmt;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced synchronously to callers of the public API.
///
/// Per-frame delivery problems never show up here: they are logged by the
/// observer and counted in its telemetry.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("failed to load configuration: {0}")]
    ConfigSource(#[from] config::ConfigError),
}

/// A lifecycle precondition did not hold.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("cannot start acquisition on camera {camera}: acquisition is already active")]
    AlreadyAcquiring { camera: String },

    #[error("cannot start the driver system: it is already running in this process")]
    SystemAlreadyStarted,

    #[error("cannot open camera {camera}: no such camera is attached")]
    UnknownCamera { camera: String },
}

/// A driver call failed with the given status code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{operation} failed: {status} (status {code})", code = .status.code())]
pub struct DriverError {
    pub operation: &'static str,
    pub status: DriverStatus,
}

impl DriverError {
    pub fn new(operation: &'static str, status: DriverStatus) -> Self {
        Self { operation, status }
    }
}

/// Status codes reported by a camera driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverStatus {
    Success,
    InternalFault,
    ApiNotStarted,
    NotFound,
    BadHandle,
    DeviceNotOpen,
    InvalidAccess,
    BadParameter,
    StructSize,
    MoreData,
    WrongType,
    InvalidValue,
    Timeout,
    Other,
    Resources,
    InvalidCall,
    NoTransportLayer,
    NotImplemented,
    NotSupported,
    Incomplete,
    Io,
    Unknown(i32),
}

impl DriverStatus {
    pub fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::InternalFault => -1,
            Self::ApiNotStarted => -2,
            Self::NotFound => -3,
            Self::BadHandle => -4,
            Self::DeviceNotOpen => -5,
            Self::InvalidAccess => -6,
            Self::BadParameter => -7,
            Self::StructSize => -8,
            Self::MoreData => -9,
            Self::WrongType => -10,
            Self::InvalidValue => -11,
            Self::Timeout => -12,
            Self::Other => -13,
            Self::Resources => -14,
            Self::InvalidCall => -15,
            Self::NoTransportLayer => -16,
            Self::NotImplemented => -17,
            Self::NotSupported => -18,
            Self::Incomplete => -19,
            Self::Io => -20,
            Self::Unknown(code) => code,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Success,
            -1 => Self::InternalFault,
            -2 => Self::ApiNotStarted,
            -3 => Self::NotFound,
            -4 => Self::BadHandle,
            -5 => Self::DeviceNotOpen,
            -6 => Self::InvalidAccess,
            -7 => Self::BadParameter,
            -8 => Self::StructSize,
            -9 => Self::MoreData,
            -10 => Self::WrongType,
            -11 => Self::InvalidValue,
            -12 => Self::Timeout,
            -13 => Self::Other,
            -14 => Self::Resources,
            -15 => Self::InvalidCall,
            -16 => Self::NoTransportLayer,
            -17 => Self::NotImplemented,
            -18 => Self::NotSupported,
            -19 => Self::Incomplete,
            -20 => Self::Io,
            other => Self::Unknown(other),
        }
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }

    pub fn message(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::InternalFault => "unexpected fault in the driver",
            Self::ApiNotStarted => "driver API was not started",
            Self::NotFound => "the requested item was not found",
            Self::BadHandle => "the handle is not valid",
            Self::DeviceNotOpen => "the device was not opened",
            Self::InvalidAccess => "operation is invalid with the current access mode",
            Self::BadParameter => "one of the parameters is invalid",
            Self::StructSize => "the given struct size is not valid for this driver version",
            Self::MoreData => "more data is available than fits in the provided buffer",
            Self::WrongType => "wrong feature type for this access function",
            Self::InvalidValue => {
                "the value is not valid: out of bounds or not an increment of the minimum"
            }
            Self::Timeout => "timeout during wait",
            Self::Other => "other error",
            Self::Resources => "resources not available (e.g. memory)",
            Self::InvalidCall => {
                "call is invalid in the current context (e.g. inside a frame callback)"
            }
            Self::NoTransportLayer => "no transport layers were found",
            Self::NotImplemented => "API feature is not implemented",
            Self::NotSupported => "API feature is not supported",
            Self::Incomplete => "a multiple-register read or write was partially completed",
            Self::Io => "low level I/O error",
            Self::Unknown(_) => "unknown driver status",
        }
    }
}

impl fmt::Display for DriverStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

impl From<std::io::Error> for DriverStatus {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        match err.kind() {
            ErrorKind::NotFound => Self::NotFound,
            ErrorKind::PermissionDenied => Self::InvalidAccess,
            ErrorKind::InvalidInput => Self::BadParameter,
            ErrorKind::TimedOut | ErrorKind::WouldBlock => Self::Timeout,
            ErrorKind::OutOfMemory => Self::Resources,
            ErrorKind::Unsupported => Self::NotSupported,
            _ => Self::Io,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_survive_conversion() {
        for code in -20..=0 {
            assert_eq!(DriverStatus::from_code(code).code(), code);
        }
        assert_eq!(DriverStatus::from_code(-42), DriverStatus::Unknown(-42));
        assert_eq!(DriverStatus::Unknown(-42).code(), -42);
    }

    #[test]
    fn driver_error_reports_status_code() {
        let err = DriverError::new("feature lookup", DriverStatus::NotFound);
        let text = err.to_string();
        assert!(text.contains("feature lookup"));
        assert!(text.contains("(status -3)"));
    }

    #[test]
    fn lifecycle_error_names_the_precondition() {
        let err = Error::from(LifecycleError::AlreadyAcquiring {
            camera: "DEV_1".into(),
        });
        assert!(err.to_string().contains("already active"));
        assert!(err.to_string().contains("DEV_1"));
    }
}

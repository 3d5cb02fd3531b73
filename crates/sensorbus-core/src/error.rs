//! Error types for sensorbus-core.
//!
//! Two layers of errors exist:
//!
//! - [`TransportError`] is what the Bluetooth stack (or the mock transport)
//!   reports for a single bus-level call. Timeouts are a distinct variant so
//!   that "too slow" is never confused with "asked to stop".
//! - [`Error`] is what callers of the session see. It wraps transport
//!   failures and adds the lifecycle errors of the session itself.
//!
//! # Propagation
//!
//! | Error | Scope | Notes |
//! |-------|-------|-------|
//! | [`Error::UnmanagedDevice`] | caller | No connection task for the address |
//! | [`Error::IllegalState`] | caller | Session lifecycle misuse |
//! | [`Error::Read`] | caller | Transport or decode failure, not retried |
//! | [`Error::Configuration`] | caller | Config or interval write rejected |
//! | [`Error::Cancelled`] | caller | Device disconnected or session stopped |
//! | connection task failure | session | Stops the whole session |
//!
//! Teardown (`disable`, session shutdown) never returns an error; failures
//! there are logged.

use std::time::Duration;

use thiserror::Error;

use sensorbus_types::{DecodeError, DeviceAddress};
use uuid::Uuid;

use crate::transport::CharacteristicPath;

/// Errors reported by a [`Transport`](crate::transport::Transport).
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    /// Operation timed out.
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The timeout duration.
        duration: Duration,
    },

    /// Bluetooth Low Energy error.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// No usable Bluetooth adapter.
    #[error("No Bluetooth adapter available")]
    AdapterUnavailable,

    /// The peripheral is not known to the adapter.
    #[error("Device not found: {0}")]
    DeviceNotFound(DeviceAddress),

    /// Operation attempted while not connected to the device.
    #[error("Not connected to device {0}")]
    NotConnected(DeviceAddress),

    /// The device does not expose the characteristic, or it is not resolved.
    #[error("Characteristic {uuid} not found on {address}")]
    CharacteristicNotFound {
        /// The device that was searched.
        address: DeviceAddress,
        /// The characteristic that was not found.
        uuid: Uuid,
    },

    /// Two devices resolved to the same characteristic path.
    #[error("Path {path} of {address} is already owned by {owner}")]
    PathAliased {
        /// The aliased path.
        path: CharacteristicPath,
        /// The device whose discovery produced the path.
        address: DeviceAddress,
        /// The device that already owns the path.
        owner: DeviceAddress,
    },

    /// Any other transport failure.
    #[error("{0}")]
    Failed(String),
}

impl TransportError {
    /// Create a timeout error with operation context.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create a generic failure.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Whether this is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Whether retrying the operation later may succeed.
    ///
    /// Timeouts, generic Bluetooth errors, missing devices and lost
    /// connections are recoverable. Missing characteristics, aliased paths,
    /// a missing adapter and other failures are not.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::Bluetooth(_)
                | Self::DeviceNotFound(_)
                | Self::NotConnected(_)
        )
    }
}

/// Cause of a failed read.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReadFailure {
    /// The transport call failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The payload could not be decoded.
    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),
}

/// Errors returned by the session and device operations.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The address has no registered connection task.
    #[error("Device {0} is not managed by this session")]
    UnmanagedDevice(DeviceAddress),

    /// Session lifecycle misuse.
    #[error("Illegal session state: {0}")]
    IllegalState(String),

    /// Bus-level failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Reading data from a device failed.
    #[error("Read from {address} failed: {source}")]
    Read {
        /// The device that was read.
        address: DeviceAddress,
        /// The underlying failure.
        #[source]
        source: ReadFailure,
    },

    /// Configuring a device failed.
    #[error("Configuration of {address} failed: {message}")]
    Configuration {
        /// The device being configured.
        address: DeviceAddress,
        /// What was rejected.
        message: String,
        /// The write failure, if a write was attempted.
        #[source]
        source: Option<TransportError>,
    },

    /// The operation was cancelled cooperatively.
    #[error("Operation cancelled: {reason}")]
    Cancelled {
        /// Why it was cancelled.
        reason: String,
    },

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// An operation task ended abnormally.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an illegal state error.
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState(message.into())
    }

    /// Create a cancellation error.
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    /// Create a read error.
    pub fn read(address: &DeviceAddress, source: impl Into<ReadFailure>) -> Self {
        Self::Read {
            address: address.clone(),
            source: source.into(),
        }
    }

    /// Create a configuration error without an underlying write failure.
    pub fn configuration(address: &DeviceAddress, message: impl Into<String>) -> Self {
        Self::Configuration {
            address: address.clone(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a configuration error wrapping a failed write.
    pub fn configuration_write(
        address: &DeviceAddress,
        message: impl Into<String>,
        source: TransportError,
    ) -> Self {
        Self::Configuration {
            address: address.clone(),
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Whether this is a cooperative cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Whether the underlying cause is a transport timeout.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout(),
            Self::Read {
                source: ReadFailure::Transport(e),
                ..
            } => e.is_timeout(),
            Self::Configuration { source: Some(e), .. } => e.is_timeout(),
            _ => false,
        }
    }
}

impl From<btleplug::Error> for Error {
    fn from(err: btleplug::Error) -> Self {
        Self::Transport(TransportError::Bluetooth(err))
    }
}

/// Result type alias for transport calls.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Result type alias using sensorbus-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let addr = DeviceAddress::new("aa:bb:cc:dd:ee:ff");

        let err = Error::UnmanagedDevice(addr.clone());
        assert!(err.to_string().contains("AA:BB:CC:DD:EE:FF"));

        let err = Error::from(TransportError::timeout("read /x", Duration::from_secs(5)));
        assert!(err.to_string().contains("read /x"));
        assert!(err.to_string().contains("5s"));

        let err = Error::configuration(&addr, "interval 3s out of range");
        assert!(err.to_string().contains("interval 3s out of range"));

        let err = Error::cancelled("session stopped");
        assert_eq!(err.to_string(), "Operation cancelled: session stopped");
    }

    #[test]
    fn test_timeout_is_distinct_from_cancellation() {
        let addr = DeviceAddress::new("aa:bb:cc:dd:ee:ff");
        let err = Error::read(&addr, TransportError::timeout("read", Duration::from_secs(1)));
        assert!(err.is_timeout());
        assert!(!err.is_cancelled());

        let err = Error::cancelled("device disconnected");
        assert!(err.is_cancelled());
        assert!(!err.is_timeout());
    }

    #[test]
    fn test_recoverable_classification() {
        let addr = DeviceAddress::new("aa:bb:cc:dd:ee:ff");
        assert!(TransportError::timeout("connect", Duration::ZERO).is_recoverable());
        assert!(TransportError::NotConnected(addr.clone()).is_recoverable());
        assert!(TransportError::DeviceNotFound(addr.clone()).is_recoverable());
        assert!(!TransportError::failed("rejected").is_recoverable());
        assert!(!TransportError::AdapterUnavailable.is_recoverable());
        assert!(
            !TransportError::CharacteristicNotFound {
                address: addr,
                uuid: Uuid::nil(),
            }
            .is_recoverable()
        );
    }

    #[test]
    fn test_decode_failure_source() {
        use std::error::Error as _;

        let addr = DeviceAddress::new("aa:bb:cc:dd:ee:ff");
        let err = Error::read(
            &addr,
            DecodeError::InsufficientBytes {
                expected: 2,
                actual: 0,
            },
        );
        assert!(matches!(
            err,
            Error::Read {
                source: ReadFailure::Decode(_),
                ..
            }
        ));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_btleplug_error_conversion() {
        fn _assert_from_impl<T: From<btleplug::Error>>() {}
        _assert_from_impl::<Error>();
        _assert_from_impl::<TransportError>();
    }
}

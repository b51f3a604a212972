//! Crate-level error taxonomy.
//!
//! Capacity and transport failures are returned synchronously from the entry
//! points that can detect them; protocol errors and timeouts always arrive
//! asynchronously through the per-operation callbacks, tagged with the
//! original request id.

use thiserror::Error;

use crate::att::AttErrorCode;
use crate::transport::{Transport, TransportError};

/// Failures of connection lifecycle operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("maximum number of {0:?} connections reached")]
    MaxConnections(Transport),

    #[error("{0:?} transport is disabled")]
    TransportDisabled(Transport),

    #[error("device is not registered")]
    UnknownDevice,

    #[error("operation not valid in the device's current state")]
    InvalidState,

    #[error("connection priority can only be requested on a connected LE link")]
    PriorityNotApplicable,

    #[error("observer slots exhausted")]
    ObserverSlotsFull,

    #[error("internal transport failure: {0}")]
    Internal(#[from] TransportError),
}

/// Typed outcome of a GATT operation, delivered through the per-operation
/// callback (or synchronously where failure is detectable before any
/// asynchronous step).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GattError {
    #[error("no connection with that handle")]
    NotConnected,

    #[error("invalid attribute handle")]
    InvalidHandle,

    #[error("read not permitted")]
    ReadNotPermitted,

    #[error("write not permitted")]
    WriteNotPermitted,

    #[error("insufficient authentication")]
    InsufficientAuthentication,

    #[error("insufficient authorization")]
    InsufficientAuthorization,

    #[error("insufficient encryption")]
    InsufficientEncryption,

    #[error("insufficient encryption key size")]
    InsufficientEncryptionKeySize,

    #[error("invalid offset")]
    InvalidOffset,

    #[error("prepare write queue full")]
    PrepareQueueFull,

    #[error("value exceeds the allowed length")]
    ValueTooLong,

    #[error("peer rejected the request")]
    RequestRejected,

    #[error("no response within the transaction window")]
    Timeout,

    #[error("another indication is awaiting confirmation")]
    IndicationPending,

    #[error("peer reported application error 0x{0:02X}")]
    Application(u8),

    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
}

impl GattError {
    /// Maps an ATT error-response code onto the typed outcome delivered to
    /// callers. `AttributeNotFound` is intentionally absent: the engines
    /// treat it as end-of-data, never as a failure surfaced here.
    pub fn from_error_code(code: AttErrorCode) -> GattError {
        match code {
            AttErrorCode::InvalidHandle => GattError::InvalidHandle,
            AttErrorCode::ReadNotPermitted => GattError::ReadNotPermitted,
            AttErrorCode::WriteNotPermitted => GattError::WriteNotPermitted,
            AttErrorCode::InsufficientAuthentication => GattError::InsufficientAuthentication,
            AttErrorCode::InsufficientAuthorization => GattError::InsufficientAuthorization,
            AttErrorCode::InsufficientEncryption => GattError::InsufficientEncryption,
            AttErrorCode::InsufficientEncryptionKeySize => {
                GattError::InsufficientEncryptionKeySize
            }
            AttErrorCode::InvalidOffset => GattError::InvalidOffset,
            AttErrorCode::PrepareQueueFull => GattError::PrepareQueueFull,
            AttErrorCode::InvalidAttributeValueLength => GattError::ValueTooLong,
            AttErrorCode::ApplicationError(raw) => GattError::Application(raw),
            _ => GattError::RequestRejected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_codes_map_to_typed_outcomes() {
        assert_eq!(
            GattError::from_error_code(AttErrorCode::ReadNotPermitted),
            GattError::ReadNotPermitted
        );
        assert_eq!(
            GattError::from_error_code(AttErrorCode::ApplicationError(0x91)),
            GattError::Application(0x91)
        );
        assert_eq!(
            GattError::from_error_code(AttErrorCode::Unlikely),
            GattError::RequestRejected
        );
    }
}

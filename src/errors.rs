use std::io;
use thiserror::Error;

use crate::serial::hex;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("bluetooth error: {0}")]
    Bluetooth(#[from] BluetoothError),
    #[error("dock error: {0}")]
    Dock(#[from] DockError),
    /// The blocking read was cancelled. This is the expected shutdown path.
    #[error("read aborted")]
    ReadAborted,
    #[error("unexpected response code: expected {}, got {}", hex(.expected), hex(.actual))]
    UnexpectedResponseCode { expected: Vec<u8>, actual: Vec<u8> },
    #[error("argument too long: {0} bytes (max 255)")]
    ArgumentTooLong(usize),
    #[error("value {value} does not fit into {size} byte field")]
    ValueOutOfRange { value: i64, size: usize },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("CRC validation failed")]
    ChecksumMismatch,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("device not initialized: call initialize() first")]
    NotInitialized,
    #[error("connection broken: {0}")]
    ConnectionBroken(String),
    #[error("request released before the device answered")]
    RequestReleased,
}

#[cfg_attr(not(feature = "bluez"), allow(dead_code))]
#[derive(Debug, Error)]
pub enum BluetoothError {
    #[error("device not found during scan: {mac}")]
    NotFound { mac: String },
    #[error("pairing failed: {0}")]
    Pairing(String),
    #[error("connection not established: {0}")]
    NotConnected(String),
    #[error("rfcomm connection failed: {0}")]
    Connection(String),
}

/// Failures reported by (or detected on) the dock UART.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DockError {
    #[error("unknown start character: {0:#04x}")]
    BadStart(u8),
    #[error("command failed: bad argument")]
    BadArgument,
    #[error("command failed: unknown command")]
    UnknownCommand,
    #[error("command failed: CRC error")]
    BadCrc,
    #[error("wrong response type: expected {expected:#04x}, got {actual:#04x}")]
    WrongResponseType { expected: u8, actual: u8 },
    #[error("unexpected component in response: expected {expected:#04x}, got {actual:#04x}")]
    WrongComponent { expected: u8, actual: u8 },
    #[error("unexpected property in response: expected {expected:#04x}, got {actual:#04x}")]
    WrongProperty { expected: u8, actual: u8 },
}

impl DriverError {
    /// Copy of this error suitable for handing to a blocked waiter while the
    /// original keeps propagating. Errors that cannot be cloned are reported as
    /// a broken connection carrying their message.
    pub(crate) fn for_waiter(&self) -> DriverError {
        match self {
            DriverError::UnexpectedResponseCode { expected, actual } => {
                DriverError::UnexpectedResponseCode {
                    expected: expected.clone(),
                    actual: actual.clone(),
                }
            }
            DriverError::Protocol(msg) => DriverError::Protocol(msg.clone()),
            DriverError::ReadAborted => DriverError::RequestReleased,
            other => DriverError::ConnectionBroken(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_code_message_is_hex() {
        let err = DriverError::UnexpectedResponseCode {
            expected: vec![0x7A],
            actual: vec![0xFE],
        };
        assert_eq!(
            err.to_string(),
            "unexpected response code: expected 7a, got fe"
        );
    }

    #[test]
    fn waiter_copy_keeps_protocol_errors() {
        let err = DriverError::UnexpectedResponseCode {
            expected: vec![0x8A, 0x71],
            actual: vec![0x8A, 0x70],
        };
        assert!(matches!(
            err.for_waiter(),
            DriverError::UnexpectedResponseCode { .. }
        ));

        let io = DriverError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert!(matches!(io.for_waiter(), DriverError::ConnectionBroken(_)));
    }
}

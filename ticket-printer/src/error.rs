//! Error types for the printer library
//!
//! Errors are split by layer so callers can tell a broken link (connect /
//! write) from a misbehaving device (protocol / device fault).

use thiserror::Error;

use crate::channel::DeviceIdentity;

/// Errors raised by a channel backend (serial port, in-memory double, ...)
#[derive(Debug, Error)]
pub enum ChannelError {
    /// No device matches the requested identity
    #[error("Device not found: {0}")]
    NotFound(String),

    /// The host refused access to the device
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// The device is already held open by another handle or process
    #[error("Device busy: {0}")]
    Busy(String),

    /// The driver rejected the serial configuration
    #[error("Configuration rejected: {0}")]
    ConfigRejected(String),

    /// No data arrived within the read deadline
    #[error("Read timed out")]
    Timeout,

    /// The channel was already closed
    #[error("Channel closed")]
    Closed,

    /// IO error on the underlying link
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ChannelResult<T> = Result<T, ChannelError>;

/// Failure to open a printer connection
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Printer not found: {0}")]
    NotFound(String),

    #[error("Access to printer not granted: {0}")]
    AccessDenied(String),

    #[error("Printer already open elsewhere: {0}")]
    AlreadyOpen(String),

    #[error("Serial configuration rejected: {0}")]
    ConfigRejected(String),

    #[error("Connection failed: {0}")]
    Io(String),
}

impl From<ChannelError> for ConnectError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::NotFound(msg) => ConnectError::NotFound(msg),
            ChannelError::AccessDenied(msg) => ConnectError::AccessDenied(msg),
            ChannelError::Busy(msg) => ConnectError::AlreadyOpen(msg),
            ChannelError::ConfigRejected(msg) => ConnectError::ConfigRejected(msg),
            other => ConnectError::Io(other.to_string()),
        }
    }
}

/// Failure to hand bytes to an open channel
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("Printer not connected: {0}")]
    NotOpen(DeviceIdentity),

    #[error("Write to {identity} failed: {reason}")]
    Failed {
        identity: DeviceIdentity,
        reason: String,
    },
}

/// Failure while waiting for a device response
#[derive(Debug, Error)]
pub enum ReadError {
    /// Advisory: the device may still have executed the command
    #[error("No response within the read timeout")]
    Timeout,

    #[error("Printer not connected: {0}")]
    NotOpen(DeviceIdentity),

    #[error("Read from {identity} failed: {reason}")]
    Failed {
        identity: DeviceIdentity,
        reason: String,
    },
}

/// Structural problems in a fiscal frame
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Frame too short: {0} bytes")]
    TooShort(usize),

    #[error("Frame does not start with the preamble")]
    MissingPreamble,

    #[error("Frame has no postamble")]
    MissingPostamble,

    #[error("Status block truncated: {0} of 6 bytes")]
    TruncatedStatus(usize),

    #[error("Checksum mismatch: expected {expected:04X}, got {actual:04X}")]
    ChecksumMismatch { expected: u16, actual: u16 },

    #[error("Payload too long for one frame: {0} bytes")]
    PayloadTooLong(usize),

    #[error("Device answered NAK")]
    Nak,

    #[error("Invalid frame: {0}")]
    Invalid(String),
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Actionable condition reported by the device status block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeviceFault {
    #[error("Printer is out of paper")]
    PaperOut,

    #[error("Printer cover is open")]
    CoverOpen,

    #[error("A fiscal receipt is still open")]
    FiscalReceiptOpen,

    #[error("A non-fiscal receipt is still open")]
    NonFiscalReceiptOpen,

    #[error("Printer rejected the command")]
    CommandRejected,

    #[error("Printer reported a general error")]
    GeneralError,
}

/// Errors surfaced by the print orchestrator
#[derive(Debug, Error)]
pub enum PrintError {
    #[error("No default printer configured")]
    NoDefaultPrinter,

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Printer fault: {}", format_faults(.0))]
    DeviceFault(Vec<DeviceFault>),

    /// The device did not answer a query in time
    #[error("No response from printer within {0:?}")]
    NoResponse(std::time::Duration),

    #[error("Known printer store error: {0}")]
    Store(#[from] StoreError),
}

fn format_faults(faults: &[DeviceFault]) -> String {
    faults
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type for printer operations
pub type PrintResult<T> = Result<T, PrintError>;

/// Known-printer persistence errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("Storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_error_maps_to_connect_error() {
        let err: ConnectError = ChannelError::Busy("COM3".into()).into();
        assert!(matches!(err, ConnectError::AlreadyOpen(_)));

        let err: ConnectError = ChannelError::Timeout.into();
        assert!(matches!(err, ConnectError::Io(_)));
    }

    #[test]
    fn test_device_fault_message() {
        let err = PrintError::DeviceFault(vec![DeviceFault::PaperOut, DeviceFault::CoverOpen]);
        assert_eq!(
            err.to_string(),
            "Printer fault: Printer is out of paper; Printer cover is open"
        );
    }
}

//! # Gateway Error Handling
//!
//! This module provides error handling for the RFID reader gateway, covering the
//! Modbus TCP transport, the address-space mapping engine, the backend RF device
//! adapter and the persisted field store.
//!
//! ## Error Categories
//!
//! ### Transport Errors
//! - **I/O Errors**: Socket and file system failures
//! - **Timeout Errors**: Operation timeouts with specific context
//!
//! ### Protocol Errors
//! - **Protocol / Frame Errors**: Malformed MBAP headers or PDUs
//! - **Exception Responses**: Standard Modbus exception codes
//! - **Invalid Address**: Requests outside the live register banks
//! - **Data Type Mismatch**: A backend value that does not match its field
//!
//! ### Backend Errors
//! - **Module Errors**: RF device faults classified into [`RfErrorCode`]
//! - **Stale Cursor**: A resume cursor taken from an older address layout
//!
//! ### System Errors
//! - **Configuration / Store Errors**: Gateway configuration and field files
//! - **Internal Errors**: Poisoned locks and other unexpected states
//!
//! ## Error Classification
//!
//! Every error can be classified into the reader error taxonomy, which is what a
//! Modbus master sees when it reads the `LAST_ERROR` field, and into the Modbus
//! exception code a transport sends back:
//!
//! ```rust
//! use voltage_modbus_reader::{ModbusError, RfErrorCode};
//!
//! let err = ModbusError::module("Inventory failed", RfErrorCode::TagsInFieldExceeded);
//! assert_eq!(err.error_code(), RfErrorCode::TagsInFieldExceeded);
//! assert_eq!(err.exception_code(), 0x04);
//!
//! let err = ModbusError::invalid_address(100, 10, 64);
//! assert_eq!(err.error_code(), RfErrorCode::NonSpecificReaderError);
//! assert_eq!(err.exception_code(), 0x02);
//! ```

use thiserror::Error;

use crate::rf::constants::RfErrorCode;

/// Result type alias for gateway operations
///
/// This is a convenience type alias that uses `ModbusError` as the error type
/// for all gateway operations, providing consistent error handling throughout
/// the codebase.
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Gateway error types
///
/// This enumeration covers the error conditions of the gateway, from transport
/// issues over address-space lookups to faults reported by the RF device.
#[derive(Error, Debug, Clone)]
pub enum ModbusError {
    /// I/O related errors (network, field files)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Timeout errors
    ///
    /// Occurs when operations exceed their configured timeout limits, e.g. a
    /// client request that does not arrive in time or a backend open/close that
    /// exceeds the open/close timeout.
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Protocol-level errors
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Invalid function code
    #[error("Invalid function code: {code}")]
    InvalidFunction { code: u8 },

    /// Invalid address range
    ///
    /// The address/quantity combination exceeds the size of the addressed
    /// register bank. Accesses are never clamped.
    ///
    /// # Examples
    /// - Reading 10 holding registers at 60 while the bank holds 64
    /// - Encoding a field whose quantity runs past the end of its bank
    #[error("Invalid address: start={start}, count={count}, bank size={size}")]
    InvalidAddress { start: u32, count: u32, size: u32 },

    /// Invalid data value
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// Backend value does not have the data type declared for its field
    #[error("Data type mismatch for field {field}: expected {expected}, got {actual}")]
    DataTypeMismatch { field: u16, expected: String, actual: String },

    /// Modbus exception response
    ///
    /// # Standard Exception Codes
    /// - 0x01: Illegal Function
    /// - 0x02: Illegal Data Address
    /// - 0x03: Illegal Data Value
    /// - 0x04: Server Device Failure
    #[error("Modbus exception: function={function:02X}, code={code:02X} ({message})")]
    Exception { function: u8, code: u8, message: String },

    /// Frame parsing errors
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// RF module fault
    ///
    /// Raised by the backend adapter. The code is what subsequent reads of
    /// the `LAST_ERROR` field report.
    #[error("Module error ({code}): {message}")]
    Module { code: RfErrorCode, message: String },

    /// A resume cursor was used against a layout it was not taken from
    #[error("Stale cursor: taken from layout version {cursor_version}, current version is {layout_version}")]
    StaleCursor { cursor_version: u64, layout_version: u64 },

    /// The session has no live mapping
    #[error("Not connected: {message}")]
    NotConnected { message: String },

    /// Configuration errors
    ///
    /// # Examples
    /// - Missing state directory
    /// - Malformed configuration file
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Field store errors (malformed `fields.properties` entries)
    #[error("Field store error: {message}")]
    Store { message: String },

    /// Internal errors (should not occur in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ModbusError {
    /// Create a new I/O error
    ///
    /// # Arguments
    ///
    /// * `message` - Descriptive error message
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io { message: message.into() }
    }

    /// Create a timeout error
    ///
    /// # Arguments
    ///
    /// * `operation` - Description of the operation that timed out
    /// * `timeout_ms` - Timeout duration in milliseconds
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol { message: message.into() }
    }

    pub fn invalid_function(code: u8) -> Self {
        Self::InvalidFunction { code }
    }

    /// Create an address range error
    ///
    /// # Arguments
    ///
    /// * `start` - Starting address
    /// * `count` - Number of addressed units
    /// * `size` - Size of the addressed bank
    pub fn invalid_address(start: u32, count: u32, size: u32) -> Self {
        Self::InvalidAddress { start, count, size }
    }

    pub fn invalid_data<S: Into<String>>(message: S) -> Self {
        Self::InvalidData { message: message.into() }
    }

    pub fn data_type_mismatch<E: Into<String>, A: Into<String>>(field: u16, expected: E, actual: A) -> Self {
        Self::DataTypeMismatch {
            field,
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Automatically maps standard exception codes to human-readable messages.
    ///
    /// # Arguments
    ///
    /// * `function` - Function code of the failed request
    /// * `code` - Modbus exception code
    pub fn exception(function: u8, code: u8) -> Self {
        let message = match code {
            0x01 => "Illegal Function",
            0x02 => "Illegal Data Address",
            0x03 => "Illegal Data Value",
            0x04 => "Server Device Failure",
            0x05 => "Acknowledge",
            0x06 => "Server Device Busy",
            _ => "Unknown Exception",
        }.to_string();

        Self::Exception { function, code, message }
    }

    pub fn frame<S: Into<String>>(message: S) -> Self {
        Self::Frame { message: message.into() }
    }

    /// Create an RF module fault
    ///
    /// # Arguments
    ///
    /// * `message` - Descriptive error message
    /// * `code` - Taxonomy code reported through `LAST_ERROR`
    pub fn module<S: Into<String>>(message: S, code: RfErrorCode) -> Self {
        Self::Module { code, message: message.into() }
    }

    pub fn stale_cursor(cursor_version: u64, layout_version: u64) -> Self {
        Self::StaleCursor { cursor_version, layout_version }
    }

    pub fn not_connected<S: Into<String>>(message: S) -> Self {
        Self::NotConnected { message: message.into() }
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    pub fn store<S: Into<String>>(message: S) -> Self {
        Self::Store { message: message.into() }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Classify the error into the reader error taxonomy
    ///
    /// Module faults keep the code they were raised with; anything else that
    /// escapes a backend call is a non-specific reader error.
    pub fn error_code(&self) -> RfErrorCode {
        match self {
            Self::Module { code, .. } => *code,
            _ => RfErrorCode::NonSpecificReaderError,
        }
    }

    /// Modbus exception code a transport replies with for this error
    ///
    /// # Returns
    ///
    /// * `0x01` for unsupported function codes
    /// * `0x02` for address range faults
    /// * `0x03` for malformed request data
    /// * `0x04` (server device failure) for everything else, including
    ///   backend faults and data type mismatches
    pub fn exception_code(&self) -> u8 {
        match self {
            Self::InvalidFunction { .. } => 0x01,
            Self::InvalidAddress { .. } => 0x02,
            Self::InvalidData { .. } => 0x03,
            Self::Exception { code, .. } => *code,
            _ => 0x04,
        }
    }

    /// Check if the error is a network/transport issue
    pub fn is_transport_error(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::Timeout { .. })
    }

    /// Check if the error is a protocol issue
    ///
    /// Address range and data type faults are protocol faults: they are always
    /// surfaced to the caller and never coerced.
    pub fn is_protocol_error(&self) -> bool {
        matches!(self,
            Self::Protocol { .. } |
            Self::InvalidFunction { .. } |
            Self::InvalidAddress { .. } |
            Self::DataTypeMismatch { .. } |
            Self::Exception { .. } |
            Self::Frame { .. }
        )
    }
}

/// Convert from std::io::Error
///
/// Automatically converts standard I/O errors to `ModbusError::Io`,
/// preserving the original error message for debugging.
impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

/// Convert from tokio timeout errors
impl From<tokio::time::error::Elapsed> for ModbusError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::timeout("Operation timeout", 0)
    }
}

/// Convert from serde JSON errors
impl From<serde_json::Error> for ModbusError {
    fn from(err: serde_json::Error) -> Self {
        Self::configuration(format!("JSON error: {}", err))
    }
}

/// Convert from serde YAML errors
impl From<serde_yaml::Error> for ModbusError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::configuration(format!("YAML error: {}", err))
    }
}

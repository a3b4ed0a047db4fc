//! Error types for etx
//!
//! Defines a unified error type for the transaction manager and the redo stores.
//! Each variant belongs to one error class, which tells the caller how to react.

use std::fmt;
use std::io;

use crate::etx::OpId;

/// Broad class of an error, as seen by a caller of the transaction manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Missing or inconsistent setup, e.g. an unregistered resource manager.
    /// Fatal to recovery.
    Configuration,
    /// A stored payload could not be encoded or decoded
    Data,
    /// `end` was called with an unknown or already ended operation
    Protocol,
    /// The redo store failed
    Store,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Configuration => "configuration",
            ErrorClass::Data => "data",
            ErrorClass::Protocol => "protocol",
            ErrorClass::Store => "store",
        }
    }
}

/// Unified error type for etx operations
#[derive(Debug)]
pub enum EtxError {
    /// I/O error from a file-backed store
    Io(io::Error),
    /// Operation payload failed to encode or decode as JSON
    Json(String),
    /// Redo file frame failed to encode or decode
    Codec(String),
    /// Store rejected a request (duplicate id, missing record, ...)
    Store(String),
    /// Text that is not a transaction code
    BadCode(String),
    /// A redo record names a resource manager that was not registered
    UnknownManager(String),
    /// The operation id does not belong to an active operation
    InvalidOperation(OpId),
    /// `end` was called twice for the same operation
    AlreadyEnded(OpId),
    /// Generic internal error
    Internal(String),
}

impl EtxError {
    /// Create a store error for an insert that would overwrite an existing record
    pub fn duplicate_record(id: i64) -> Self {
        EtxError::Store(format!("redo record {} already exists", id))
    }

    /// Create a store error for an update of a record that doesn't exist
    pub fn missing_record(id: i64) -> Self {
        EtxError::Store(format!("redo record {} does not exist", id))
    }

    /// Get the class of this error
    pub fn class(&self) -> ErrorClass {
        match self {
            EtxError::UnknownManager(_) | EtxError::Internal(_) => ErrorClass::Configuration,
            EtxError::Json(_) | EtxError::BadCode(_) => ErrorClass::Data,
            EtxError::InvalidOperation(_) | EtxError::AlreadyEnded(_) => ErrorClass::Protocol,
            EtxError::Io(_) | EtxError::Codec(_) | EtxError::Store(_) => ErrorClass::Store,
        }
    }
}

impl fmt::Display for EtxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EtxError::Io(e) => write!(f, "etx: {}", e),
            EtxError::Json(msg) => write!(f, "etx: bad operation data: {}", msg),
            EtxError::Codec(msg) => write!(f, "etx: bad redo frame: {}", msg),
            EtxError::Store(msg) => write!(f, "etx: {}", msg),
            EtxError::BadCode(code) => write!(f, "etx: bad transaction code '{}'", code),
            EtxError::UnknownManager(name) => write!(f, "etx: missing resource manager '{}'", name),
            EtxError::InvalidOperation(id) => write!(f, "etx: invalid operation id {}", id),
            EtxError::AlreadyEnded(id) => write!(f, "etx: operation {} already ended", id),
            EtxError::Internal(msg) => write!(f, "etx: {}", msg),
        }
    }
}

impl std::error::Error for EtxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EtxError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for EtxError {
    fn from(e: io::Error) -> Self {
        EtxError::Io(e)
    }
}

impl From<serde_json::Error> for EtxError {
    fn from(e: serde_json::Error) -> Self {
        EtxError::Json(e.to_string())
    }
}

impl From<bincode::Error> for EtxError {
    fn from(e: bincode::Error) -> Self {
        EtxError::Codec(e.to_string())
    }
}

impl From<tempfile::PersistError> for EtxError {
    fn from(e: tempfile::PersistError) -> Self {
        EtxError::Io(e.error)
    }
}

/// Result type alias for etx operations
pub type Result<T> = std::result::Result<T, EtxError>;

//! # Error Types
//!
//! Error handling for the transport core.
//!
//! This module defines every error variant surfaced synchronously by the crate,
//! from low-level I/O errors to codec and capacity failures.
//!
//! ## Error Categories
//! - **Codec Errors**: unknown type ids or names, malformed bytes, fallback serialization
//! - **Capacity Errors**: a full send queue, returned to the caller of `send`
//! - **Connection Errors**: closed or unknown connections, illegal status transitions
//! - **Setup Errors**: type registration and configuration problems
//! - **Helper Errors**: blocking helpers that time out or run on the reactor thread
//!
//! Connection faults observed by the reactor are *not* errors: they become a
//! [`CloseReason`](crate::transport::connection::CloseReason) and are reported
//! through the connection listeners.
//!
//! ## Example Usage
//! ```rust
//! use msgwire::error::{ProtocolError, Result};
//!
//! fn checked_len(len: i32) -> Result<usize> {
//!     usize::try_from(len).map_err(|_| ProtocolError::Malformed(format!("negative length {len}")))
//! }
//!
//! assert!(checked_len(-1).is_err());
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Registry errors
    pub const ERR_ID_SPACE_EXHAUSTED: &str = "No unused type id left";
    pub const ERR_EMPTY_TYPE_NAME: &str = "Type name cannot be empty";

    /// Dispatcher errors
    pub const ERR_DISPATCHER_WRITE_LOCK: &str = "Failed to acquire write lock on dispatcher";
    pub const ERR_DISPATCHER_READ_LOCK: &str = "Failed to acquire read lock on dispatcher";

    /// Codec errors
    pub const ERR_INVALID_LENGTH_TAG: &str = "Invalid variable-width length tag";
    pub const ERR_NEGATIVE_LENGTH: &str = "Negative length";
    pub const ERR_INVALID_UTF8: &str = "String is not valid UTF-8";
    pub const ERR_INVALID_NULL_MARKER: &str = "Invalid null marker";
    pub const ERR_INVALID_CHAR: &str = "Invalid char scalar value";
    pub const ERR_TRAILING_BYTES: &str = "Trailing bytes after message";

    /// Connection errors
    pub const ERR_REACTOR_THREAD: &str = "Blocking helper invoked from the reactor thread";
    pub const ERR_CONNECTION_LIMIT: &str = "Connection limit reached";
}

/// ProtocolError is the primary error type for all transport operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Unknown type id: {0}")]
    UnknownTypeId(i16),

    #[error("Unknown type name: {0}")]
    UnknownTypeName(String),

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Buffer underflow: needed {needed} bytes, {remaining} remaining")]
    BufferUnderflow { needed: usize, remaining: usize },

    #[error("Type registration failed: {0}")]
    Registration(String),

    #[error("Send queue is full (capacity {0})")]
    QueueFull(usize),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Unknown connection: {0}")]
    UnknownConnection(u32),

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: &'static str, to: &'static str },

    #[error("Message of {0} bytes does not fit into a frame buffer")]
    OversizedMessage(usize),

    #[error("Timeout occurred")]
    Timeout,

    #[error("Blocking helper invoked from the reactor thread")]
    ReactorThread,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("No handler registered for message type: {0}")]
    UnhandledMessage(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// Whether the error stems from undecodable or unresolvable bytes
    pub fn is_codec_error(&self) -> bool {
        matches!(
            self,
            ProtocolError::Serialization(_)
                | ProtocolError::UnknownTypeId(_)
                | ProtocolError::UnknownTypeName(_)
                | ProtocolError::Malformed(_)
                | ProtocolError::BufferUnderflow { .. }
        )
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;

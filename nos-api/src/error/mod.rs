//! Error handling module for the NOS virtual memory stack

use core::fmt;

use alloc::format;
use alloc::string::{String, ToString};

use crate::core::types::KernelError;

/// Common error type shared by the VM subsystem and its collaborators
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Kernel error
    Kernel(KernelError),
    /// Invalid argument
    InvalidArgument(String),
    /// Invalid state
    InvalidState(String),
    /// Resource not found
    NotFound(String),
    /// Out of memory
    OutOfMemory,
    /// I/O error
    IoError(String),
    /// Configuration error
    ConfigError(String),
    /// System error
    SystemError(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Kernel(err) => write!(f, "Kernel error: {}", err),
            Error::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::NotFound(msg) => write!(f, "Not found: {}", msg),
            Error::OutOfMemory => write!(f, "Out of memory"),
            Error::IoError(msg) => write!(f, "I/O error: {}", msg),
            Error::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            Error::SystemError(msg) => write!(f, "System error: {}", msg),
        }
    }
}

impl From<KernelError> for Error {
    fn from(err: KernelError) -> Self {
        Error::Kernel(err)
    }
}

/// Result type for operations that can fail
pub type Result<T> = core::result::Result<T, Error>;

/// Error context trait for adding context to errors
pub trait ErrorContext<T> {
    /// Adds context to the error
    fn context(self, context: &str) -> Result<T>;
}

impl<T> ErrorContext<T> for Result<T> {
    fn context(self, context: &str) -> Result<T> {
        match self {
            Ok(value) => Ok(value),
            // Keep the variant so callers can still match on I/O failures.
            Err(Error::IoError(msg)) => Err(Error::IoError(format!("{}: {}", context, msg))),
            Err(error) => Err(Error::SystemError(format!("{}: {}", context, error))),
        }
    }
}

/// Creates a new invalid argument error
pub fn invalid_argument(msg: &str) -> Error {
    Error::InvalidArgument(msg.to_string())
}

/// Creates a new IO error
pub fn io_error(msg: &str) -> Error {
    Error::IoError(msg.to_string())
}

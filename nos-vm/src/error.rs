//! Virtual memory error types

use core::fmt;

use alloc::string::ToString;

use nos_api::{Error, KernelError, VirtAddr};

/// Errors reported by VM operations to their immediate caller.
///
/// Protocol errors (`AlreadyExists`, `AlreadyMapped`) mean the caller must not
/// proceed; resource errors are fatal to the process that triggered them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmError {
    /// A page already exists at this address
    AlreadyExists(VirtAddr),
    /// The page already holds a frame
    AlreadyMapped(VirtAddr),
    /// No page at this address
    NotFound(VirtAddr),
    /// The page holds no frame
    NotResident(VirtAddr),
    /// Rejected mmap / segment arguments
    InvalidMapping(&'static str),
    /// No frame could be obtained, even by eviction
    OutOfMemory,
    /// The swap device has no free slot
    OutOfSwap,
    /// The hardware mapping could not be installed
    MapFailed(VirtAddr),
    /// Inconsistent configuration
    Config(&'static str),
    /// Backing store failure
    Io(Error),
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::AlreadyExists(va) => write!(f, "page already exists at {}", va),
            VmError::AlreadyMapped(va) => write!(f, "page at {} is already mapped", va),
            VmError::NotFound(va) => write!(f, "no page at {}", va),
            VmError::NotResident(va) => write!(f, "page at {} is not resident", va),
            VmError::InvalidMapping(msg) => write!(f, "invalid mapping: {}", msg),
            VmError::OutOfMemory => write!(f, "out of physical frames"),
            VmError::OutOfSwap => write!(f, "out of swap slots"),
            VmError::MapFailed(va) => write!(f, "failed to map {}", va),
            VmError::Config(msg) => write!(f, "bad vm configuration: {}", msg),
            VmError::Io(err) => write!(f, "backing store: {}", err),
        }
    }
}

impl From<Error> for VmError {
    fn from(err: Error) -> Self {
        match err {
            Error::OutOfMemory => VmError::OutOfMemory,
            other => VmError::Io(other),
        }
    }
}

impl From<VmError> for Error {
    fn from(err: VmError) -> Self {
        match err {
            VmError::AlreadyExists(_) | VmError::AlreadyMapped(_) => {
                Error::InvalidState(err.to_string())
            }
            VmError::NotFound(_) | VmError::NotResident(_) => Error::NotFound(err.to_string()),
            VmError::InvalidMapping(msg) => Error::InvalidArgument(msg.to_string()),
            VmError::OutOfMemory => Error::OutOfMemory,
            VmError::OutOfSwap => Error::Kernel(KernelError::OutOfSpace),
            VmError::MapFailed(_) => Error::SystemError(err.to_string()),
            VmError::Config(msg) => Error::ConfigError(msg.to_string()),
            VmError::Io(inner) => inner,
        }
    }
}

/// Result type for VM operations
pub type VmResult<T> = core::result::Result<T, VmError>;

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::format;

    #[test]
    fn test_round_trip_through_api_error() {
        let api: Error = VmError::OutOfSwap.into();
        assert_eq!(api, Error::Kernel(KernelError::OutOfSpace));

        let vm: VmError = nos_api::error::io_error("disk gone").into();
        assert_eq!(vm, VmError::Io(Error::IoError("disk gone".into())));
        assert_eq!(VmError::from(Error::OutOfMemory), VmError::OutOfMemory);
    }

    #[test]
    fn test_display_names_address() {
        let msg = format!("{}", VmError::AlreadyExists(VirtAddr::new(0x1000)));
        assert_eq!(msg, "page already exists at 0x1000");
    }
}

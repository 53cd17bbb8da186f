//! NOS API - Core interfaces and types for the NOS virtual memory stack
//!
//! This crate provides the types and abstractions shared between the virtual
//! memory subsystem and the kernel components it consumes.
//!
//! # Architecture
//!
//! - **Core**: Address types, page constants and kernel error codes
//! - **Error**: Common error type and handling helpers
//! - **Memory**: Collaborator interfaces (MMU, frame allocator, swap, files)
//!
//! # Usage
//!
//! ```rust
//! use nos_api::{VirtAddr, PAGE_SIZE};
//!
//! let va = VirtAddr::new(PAGE_SIZE + 12);
//! assert_eq!(va.page_round_down(), VirtAddr::new(PAGE_SIZE));
//! ```

#![no_std]

extern crate alloc;

// Core modules
pub mod core;
pub mod error;
pub mod memory;

// Re-export commonly used types
pub use crate::core::types::*;
pub use crate::error::{Error, ErrorContext, Result};
pub use crate::memory::interface::{
    BackingFile, BlockDevice, FileHandle, FrameAllocator, PageMapper, SwapDevice, SwapSlot,
    SECTOR_SIZE,
};

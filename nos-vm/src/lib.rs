//! NOS VM - demand-paged virtual memory
//!
//! This crate maps each process's address space lazily onto physical memory
//! and reclaims memory under pressure by evicting pages to their backing
//! store.
//!
//! # Architecture
//!
//! - **Page** ([`page`]): per-page metadata with an uninitialized, anonymous
//!   or file-backed content source
//! - **Supplemental page table** ([`spt`]): per-process page directory
//! - **Frame table** ([`frame`]): leased physical frames and clock eviction
//! - **Fault resolver** ([`fault`]): fatal / grow-stack / claim decisions
//! - **Address space** ([`address_space`]): claim pipeline,
//!   mmap, fork copy, teardown, user buffer checks
//! - **Swap** ([`swap`]): slot allocation over a block device
//!
//! Hardware, disks and files are reached only through the collaborator
//! traits of [`nos_api`].

#![no_std]
#![warn(clippy::all)]

extern crate alloc;

pub mod address_space;
pub mod config;
pub mod error;
pub mod fault;
pub mod frame;
pub mod page;
pub mod spt;
pub mod stats;
pub mod swap;
mod validate;
pub mod vm;

pub use address_space::{AddressSpace, MmapRegion};
pub use config::VmConfig;
pub use error::{VmError, VmResult};
pub use fault::{FatalFault, FaultFlags, FaultResolution, PageFault};
pub use frame::{FrameId, FrameTable};
pub use page::{
    AnonPage, FileMapping, FilePage, InitTarget, LazyLoader, Page, PageContent, PageKind, PageRef,
    SegmentLoader, UninitPage,
};
pub use spt::SupplementalPageTable;
pub use stats::{VmStats, VmStatsSnapshot};
pub use swap::{SECTORS_PER_SLOT, SwapArea};
pub use vm::Vm;

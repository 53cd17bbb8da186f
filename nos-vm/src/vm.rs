//! Virtual memory subsystem root
//!
//! One [`Vm`] exists per kernel. It owns the frame table and the swap
//! device shared by every process, and hands out [`AddressSpace`]s.

use alloc::sync::Arc;

use nos_api::{FrameAllocator, PageMapper, SwapDevice};

use crate::address_space::AddressSpace;
use crate::config::VmConfig;
use crate::error::VmResult;
use crate::frame::FrameTable;
use crate::stats::VmStats;

/// Shared virtual memory state
pub struct Vm {
    config: VmConfig,
    frames: FrameTable,
    swap: Arc<dyn SwapDevice>,
    stats: VmStats,
}

impl Vm {
    /// Initializes the subsystem over the user frame pool and swap device
    pub fn new(
        config: VmConfig,
        allocator: Arc<dyn FrameAllocator>,
        swap: Arc<dyn SwapDevice>,
    ) -> VmResult<Arc<Self>> {
        config.validate()?;
        log::info!(
            "[vm] initialized: user {:#x}..{:#x}, stack top {:#x}, stack limit {} KiB",
            config.user_base,
            config.user_max,
            config.user_stack_top,
            config.stack_limit / 1024
        );
        Ok(Arc::new(Self {
            frames: FrameTable::new(allocator, config.eviction_attempts),
            config,
            swap,
            stats: VmStats::new(),
        }))
    }

    /// Creates the address space of a new process. Fails when its page
    /// table cannot be allocated; the process cannot run without one.
    pub fn create_address_space(
        self: &Arc<Self>,
        mmu: Arc<dyn PageMapper>,
    ) -> VmResult<AddressSpace> {
        AddressSpace::new(self.clone(), mmu)
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    pub fn swap(&self) -> &dyn SwapDevice {
        &*self.swap
    }

    pub fn stats(&self) -> &VmStats {
        &self.stats
    }
}

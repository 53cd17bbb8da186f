//! User address space layout and paging policy configuration
//!
//! A [`VmConfig`] describes where user space lives, where the stack starts
//! and how far it may grow, and how hard the frame table tries to find a
//! victim before giving up on a fault.
//!
//! ## Layout
//!
//! ```text
//! user_max        +------------------+  kernel space starts here
//!                 |       ...        |
//! user_stack_top  +------------------+
//!                 |   user stack     |  grows down, at most `stack_limit`
//! stack floor     +------------------+
//!                 |  mmap / segments |
//! user_base       +------------------+
//!                 |  unmapped (NULL) |
//! 0               +------------------+
//! ```

use nos_api::{PAGE_SIZE, VirtAddr};

use crate::error::{VmError, VmResult};

/// Default maximum stack size (1MB)
pub const DEFAULT_STACK_LIMIT: usize = 1 << 20;

/// Default distance below the stack pointer that still counts as a stack
/// access (covers `push` and `pusha`-style pre-decrement stores).
pub const DEFAULT_STACK_GROWTH_MARGIN: usize = 32;

/// Default number of victim selection rounds before a fault gives up
pub const DEFAULT_EVICTION_ATTEMPTS: usize = 64;

/// Virtual memory configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// Lowest valid user address
    pub user_base: usize,

    /// Maximum user address (exclusive, kernel space starts here)
    pub user_max: usize,

    /// User stack top address (exclusive)
    pub user_stack_top: usize,

    /// Maximum size the stack may grow to (bytes)
    pub stack_limit: usize,

    /// How far below the stack pointer a fault may land and still grow the stack
    pub stack_growth_margin: usize,

    /// Victim selection rounds before `get_frame` reports exhaustion
    pub eviction_attempts: usize,
}

impl VmConfig {
    /// x86-64 layout of the teaching kernel: user code at 4MB, stack
    /// below `0x4748_0000`, kernel from `0x80_0400_0000`.
    pub const fn x86_64() -> Self {
        Self {
            user_base: 0x0040_0000,
            user_max: 0x0080_0400_0000,
            user_stack_top: 0x4748_0000,
            stack_limit: DEFAULT_STACK_LIMIT,
            stack_growth_margin: DEFAULT_STACK_GROWTH_MARGIN,
            eviction_attempts: DEFAULT_EVICTION_ATTEMPTS,
        }
    }

    /// Sets the maximum stack size
    pub const fn with_stack_limit(mut self, bytes: usize) -> Self {
        self.stack_limit = bytes;
        self
    }

    /// Sets the stack growth margin below the stack pointer
    pub const fn with_stack_growth_margin(mut self, bytes: usize) -> Self {
        self.stack_growth_margin = bytes;
        self
    }

    /// Sets the number of eviction rounds
    pub const fn with_eviction_attempts(mut self, attempts: usize) -> Self {
        self.eviction_attempts = attempts;
        self
    }

    /// Check if an address is in user space
    #[inline]
    pub fn is_user_address(&self, addr: VirtAddr) -> bool {
        addr.as_usize() >= self.user_base && addr.as_usize() < self.user_max
    }

    /// Check if an address is in kernel space
    #[inline]
    pub fn is_kernel_address(&self, addr: VirtAddr) -> bool {
        addr.as_usize() >= self.user_max
    }

    /// Lowest address the stack may grow down to
    #[inline]
    pub fn stack_floor(&self) -> VirtAddr {
        VirtAddr::new(self.user_stack_top.saturating_sub(self.stack_limit))
    }

    /// Address of the first stack page
    #[inline]
    pub fn initial_stack_page(&self) -> VirtAddr {
        VirtAddr::new(self.user_stack_top - PAGE_SIZE)
    }

    /// Whether a fault at `addr` with stack pointer `sp` is a stack access
    /// that may allocate a new stack page.
    pub fn is_stack_growth(&self, addr: VirtAddr, sp: VirtAddr) -> bool {
        addr >= sp.saturating_sub(self.stack_growth_margin)
            && addr >= self.stack_floor()
            && addr.as_usize() < self.user_stack_top
    }

    /// Verify that the layout is usable
    pub fn validate(&self) -> VmResult<()> {
        if self.user_base == 0 || self.user_base % PAGE_SIZE != 0 {
            return Err(VmError::Config("user base must be a non-zero page boundary"));
        }
        if self.user_stack_top % PAGE_SIZE != 0 || self.user_max % PAGE_SIZE != 0 {
            return Err(VmError::Config("stack top and user max must be page aligned"));
        }
        if self.user_stack_top > self.user_max || self.user_stack_top <= self.user_base {
            return Err(VmError::Config("stack top must lie inside user space"));
        }
        if self.stack_limit < PAGE_SIZE
            || self.user_stack_top.saturating_sub(self.stack_limit) < self.user_base
        {
            return Err(VmError::Config("stack limit must fit between user base and stack top"));
        }
        if self.eviction_attempts == 0 {
            return Err(VmError::Config("eviction attempts must be non-zero"));
        }
        Ok(())
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self::x86_64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout_is_valid() {
        assert!(VmConfig::default().validate().is_ok());
    }

    #[test]
    fn test_stack_growth_window() {
        let cfg = VmConfig::x86_64();
        let sp = VirtAddr::new(cfg.user_stack_top - 3 * PAGE_SIZE);

        assert!(cfg.is_stack_growth(sp.saturating_sub(8), sp));
        assert!(cfg.is_stack_growth(sp.saturating_sub(32), sp));
        assert!(!cfg.is_stack_growth(sp.saturating_sub(33), sp));
        // Above the stack pointer is fine as long as it is below the top.
        assert!(cfg.is_stack_growth(VirtAddr::new(cfg.user_stack_top - 1), sp));
        assert!(!cfg.is_stack_growth(VirtAddr::new(cfg.user_stack_top), sp));
    }

    #[test]
    fn test_stack_floor_is_enforced() {
        let cfg = VmConfig::x86_64();
        let below_floor = cfg.stack_floor().saturating_sub(PAGE_SIZE);
        assert!(!cfg.is_stack_growth(below_floor, below_floor));
        assert!(cfg.is_stack_growth(cfg.stack_floor(), cfg.stack_floor()));
    }

    #[test]
    fn test_invalid_layouts_rejected() {
        assert!(VmConfig::x86_64().with_eviction_attempts(0).validate().is_err());
        assert!(VmConfig::x86_64().with_stack_limit(0).validate().is_err());
        assert!(VmConfig::x86_64().with_stack_limit(usize::MAX).validate().is_err());

        let mut cfg = VmConfig::x86_64();
        cfg.user_base = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_address_classes() {
        let cfg = VmConfig::x86_64();
        assert!(!cfg.is_user_address(VirtAddr::new(0)));
        assert!(cfg.is_user_address(VirtAddr::new(cfg.user_base)));
        assert!(cfg.is_kernel_address(VirtAddr::new(cfg.user_max)));
        assert!(!cfg.is_user_address(VirtAddr::new(cfg.user_max)));
    }
}

//! Core types used throughout the NOS virtual memory stack

use core::fmt;

use static_assertions::const_assert;

/// Size type
pub type Size = usize;

/// Page size (4KB)
pub const PAGE_SIZE: usize = 4096;
/// Page shift (log2 of PAGE_SIZE)
pub const PAGE_SHIFT: usize = 12;

const_assert!(PAGE_SIZE.is_power_of_two());
const_assert!(1 << PAGE_SHIFT == PAGE_SIZE);

/// Align address down to page boundary
#[inline]
pub const fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Align address up to page boundary
///
/// Saturates to the last page boundary instead of wrapping.
#[inline]
pub const fn page_round_up(addr: usize) -> usize {
    match addr.checked_add(PAGE_SIZE - 1) {
        Some(end) => end & !(PAGE_SIZE - 1),
        None => usize::MAX & !(PAGE_SIZE - 1),
    }
}

/// A virtual address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct VirtAddr(pub usize);

impl VirtAddr {
    /// Creates a new virtual address from a raw usize value.
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Returns the virtual address as a raw usize value.
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Returns true for the null address.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Returns the offset within the current page.
    pub const fn page_offset(self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }

    /// Returns the page number for this virtual address.
    pub const fn page_number(self) -> usize {
        self.0 >> PAGE_SHIFT
    }

    /// Checks if the virtual address is page-aligned.
    pub const fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }

    /// Rounds up the virtual address to the next page boundary.
    pub const fn page_round_up(self) -> Self {
        Self(page_round_up(self.0))
    }

    /// Rounds down the virtual address to the previous page boundary.
    pub const fn page_round_down(self) -> Self {
        Self(page_round_down(self.0))
    }

    /// Adds `bytes`, returning `None` on overflow.
    pub const fn checked_add(self, bytes: usize) -> Option<Self> {
        match self.0.checked_add(bytes) {
            Some(addr) => Some(Self(addr)),
            None => None,
        }
    }

    /// Subtracts `bytes`, clamping at zero.
    pub const fn saturating_sub(self, bytes: usize) -> Self {
        Self(self.0.saturating_sub(bytes))
    }

    /// Address of the page `count` pages above this one.
    pub const fn add_pages(self, count: usize) -> Self {
        Self(self.0 + count * PAGE_SIZE)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A physical address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(pub usize);

impl PhysAddr {
    /// Creates a new physical address from a raw usize value.
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Returns the physical address as a raw usize value.
    pub const fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Kernel error code surfaced to system call callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// No space left on device
    OutOfSpace,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::OutOfSpace => write!(f, "Out of space"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_virt_addr_rounding() {
        let va = VirtAddr::new(0x1234);
        assert_eq!(va.page_round_down(), VirtAddr::new(0x1000));
        assert_eq!(va.page_round_up(), VirtAddr::new(0x2000));
        assert_eq!(va.page_offset(), 0x234);
        assert_eq!(va.page_number(), 1);
        assert!(!va.is_page_aligned());
        assert!(VirtAddr::new(0x3000).is_page_aligned());
    }

    #[test]
    fn test_round_up_saturates() {
        assert_eq!(page_round_up(usize::MAX), usize::MAX & !(PAGE_SIZE - 1));
        assert_eq!(VirtAddr::new(usize::MAX).checked_add(1), None);
    }
}

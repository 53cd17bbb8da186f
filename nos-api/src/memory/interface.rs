//! Memory management collaborator interfaces
//!
//! The virtual memory subsystem never touches hardware, disks or the file
//! system directly. Everything it consumes goes through the traits below, so
//! the kernel can plug in the real MMU and drivers while tests plug in fakes.
//!
//! All methods take `&self`: implementations are shared between threads and
//! synchronize internally.

use alloc::sync::Arc;
use core::ptr::NonNull;

use crate::core::types::{PhysAddr, Size, VirtAddr};
use crate::error::Result;

/// Size of one block device sector in bytes
pub const SECTOR_SIZE: usize = 512;

/// Hardware address translation for one address space.
pub trait PageMapper: Send + Sync {
    /// Installs `va -> pa`. Returns false when the mapping could not be
    /// installed (e.g. no memory for an intermediate table).
    fn map(&self, va: VirtAddr, pa: PhysAddr, writable: bool) -> bool;

    /// Removes the mapping for `va`, if any.
    fn unmap(&self, va: VirtAddr);

    /// Returns the physical address `va` is mapped to.
    fn probe(&self, va: VirtAddr) -> Option<PhysAddr>;

    /// Returns the hardware dirty bit of the mapping for `va`.
    fn is_dirty(&self, va: VirtAddr) -> bool;

    /// Sets or clears the hardware dirty bit of the mapping for `va`.
    fn set_dirty(&self, va: VirtAddr, dirty: bool);

    /// Returns the hardware accessed bit of the mapping for `va`.
    fn is_accessed(&self, va: VirtAddr) -> bool;

    /// Sets or clears the hardware accessed bit of the mapping for `va`.
    fn set_accessed(&self, va: VirtAddr, accessed: bool);
}

/// Physical page allocator for the user pool.
pub trait FrameAllocator: Send + Sync {
    /// Obtains a zeroed physical page, or `None` when the pool is exhausted.
    fn acquire_zeroed_frame(&self) -> Option<PhysAddr>;

    /// Returns a page obtained from [`FrameAllocator::acquire_zeroed_frame`].
    fn release_frame(&self, pa: PhysAddr);

    /// Kernel direct-map pointer to the first byte of the frame at `pa`.
    ///
    /// The pointer is valid for `PAGE_SIZE` bytes while the frame is leased.
    fn kernel_ptr(&self, pa: PhysAddr) -> NonNull<u8>;
}

/// Sector-addressed block device.
pub trait BlockDevice: Send + Sync {
    /// Number of sectors on the device
    fn sector_count(&self) -> u32;

    /// Reads one sector into `buf` (`SECTOR_SIZE` bytes)
    fn read_sector(&self, sector: u32, buf: &mut [u8]) -> Result<()>;

    /// Writes one sector from `buf` (`SECTOR_SIZE` bytes)
    fn write_sector(&self, sector: u32, buf: &[u8]) -> Result<()>;
}

/// Identifier of a page-sized slot on the swap device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SwapSlot(pub u32);

impl SwapSlot {
    /// Returns the slot index
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Page-granular swap storage.
pub trait SwapDevice: Send + Sync {
    /// Reserves a free slot
    fn allocate_slot(&self) -> Option<SwapSlot>;

    /// Reads the slot into `dest` (`PAGE_SIZE` bytes)
    fn read(&self, slot: SwapSlot, dest: &mut [u8]) -> Result<()>;

    /// Writes `src` (`PAGE_SIZE` bytes) into the slot
    fn write(&self, slot: SwapSlot, src: &[u8]) -> Result<()>;

    /// Releases a slot obtained from [`SwapDevice::allocate_slot`]
    fn free_slot(&self, slot: SwapSlot);
}

/// Open file used as the backing store of mapped pages.
pub trait BackingFile: Send + Sync {
    /// Reads up to `dest.len()` bytes at `offset`; returns the bytes read.
    fn read_at(&self, offset: Size, dest: &mut [u8]) -> Result<Size>;

    /// Writes `src` at `offset`; returns the bytes written.
    fn write_at(&self, offset: Size, src: &[u8]) -> Result<Size>;

    /// Current length of the file in bytes
    fn length(&self) -> Size;

    /// Opens an independent handle to the same file.
    fn reopen(&self) -> Result<FileHandle>;
}

/// Shared handle to an open backing file
pub type FileHandle = Arc<dyn BackingFile>;

//! Swap area
//!
//! A [`SwapArea`] carves a block device into page-sized slots and hands them
//! out through a bitmap. Slot `n` covers sectors
//! `n * SECTORS_PER_SLOT .. (n + 1) * SECTORS_PER_SLOT`; a trailing partial
//! slot is never used.

use alloc::vec;
use alloc::vec::Vec;

use nos_api::error::invalid_argument;
use nos_api::{BlockDevice, ErrorContext, PAGE_SIZE, Result, SECTOR_SIZE, SwapDevice, SwapSlot};
use spin::Mutex;
use static_assertions::const_assert;

/// Sectors backing one swap slot
pub const SECTORS_PER_SLOT: usize = PAGE_SIZE / SECTOR_SIZE;

const_assert!(PAGE_SIZE % SECTOR_SIZE == 0);
const_assert!(SECTORS_PER_SLOT > 0);

const BITS_PER_WORD: usize = u64::BITS as usize;

/// Slot allocation bitmap, one bit per slot, set when in use
struct SlotBitmap {
    words: Vec<u64>,
    capacity: usize,
    used: usize,
}

impl SlotBitmap {
    fn new(capacity: usize) -> Self {
        Self {
            words: vec![0; capacity.div_ceil(BITS_PER_WORD)],
            capacity,
            used: 0,
        }
    }

    fn allocate(&mut self) -> Option<usize> {
        for (w, word) in self.words.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = (!*word).trailing_zeros() as usize;
            let index = w * BITS_PER_WORD + bit;
            if index >= self.capacity {
                return None;
            }
            *word |= 1 << bit;
            self.used += 1;
            return Some(index);
        }
        None
    }

    fn is_set(&self, index: usize) -> bool {
        index < self.capacity && self.words[index / BITS_PER_WORD] & (1 << (index % BITS_PER_WORD)) != 0
    }

    /// Clears the bit; returns false if it was not set
    fn free(&mut self, index: usize) -> bool {
        if !self.is_set(index) {
            return false;
        }
        self.words[index / BITS_PER_WORD] &= !(1 << (index % BITS_PER_WORD));
        self.used -= 1;
        true
    }
}

/// Page-granular swap storage on top of a block device
pub struct SwapArea<B> {
    device: B,
    bitmap: Mutex<SlotBitmap>,
}

impl<B: BlockDevice> SwapArea<B> {
    pub fn new(device: B) -> Self {
        let capacity = device.sector_count() as usize / SECTORS_PER_SLOT;
        log::info!(
            "[vm] swap area with {} slots ({} KiB)",
            capacity,
            capacity * PAGE_SIZE / 1024
        );
        Self {
            device,
            bitmap: Mutex::new(SlotBitmap::new(capacity)),
        }
    }

    /// Total number of slots
    pub fn capacity(&self) -> usize {
        self.bitmap.lock().capacity
    }

    /// Slots currently allocated
    pub fn used(&self) -> usize {
        self.bitmap.lock().used
    }

    pub fn device(&self) -> &B {
        &self.device
    }

    fn check(&self, slot: SwapSlot, len: usize) -> Result<u32> {
        if len < PAGE_SIZE {
            return Err(invalid_argument("swap buffer smaller than a page"));
        }
        if !self.bitmap.lock().is_set(slot.index()) {
            return Err(invalid_argument("swap slot not allocated"));
        }
        Ok((slot.index() * SECTORS_PER_SLOT) as u32)
    }
}

impl<B: BlockDevice> SwapDevice for SwapArea<B> {
    fn allocate_slot(&self) -> Option<SwapSlot> {
        let slot = self.bitmap.lock().allocate().map(|index| SwapSlot(index as u32));
        if slot.is_none() {
            log::warn!("[vm] swap area exhausted");
        }
        slot
    }

    fn read(&self, slot: SwapSlot, dest: &mut [u8]) -> Result<()> {
        let first = self.check(slot, dest.len())?;
        for (i, chunk) in dest[..PAGE_SIZE].chunks_exact_mut(SECTOR_SIZE).enumerate() {
            self.device
                .read_sector(first + i as u32, chunk)
                .context("swap read")?;
        }
        Ok(())
    }

    fn write(&self, slot: SwapSlot, src: &[u8]) -> Result<()> {
        let first = self.check(slot, src.len())?;
        for (i, chunk) in src[..PAGE_SIZE].chunks_exact(SECTOR_SIZE).enumerate() {
            self.device
                .write_sector(first + i as u32, chunk)
                .context("swap write")?;
        }
        Ok(())
    }

    fn free_slot(&self, slot: SwapSlot) {
        if !self.bitmap.lock().free(slot.index()) {
            log::warn!("[vm] freeing unallocated swap slot {}", slot.index());
        }
    }
}

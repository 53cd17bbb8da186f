//! Anonymous pages
//!
//! Anonymous memory has no file behind it. A fresh page is zero-filled; once
//! evicted its bytes live in a swap slot until the next fault reads them back
//! and frees the slot.

use alloc::vec;

use nos_api::{PAGE_SIZE, SwapDevice, SwapSlot};

use crate::error::{VmError, VmResult};

/// Content source of an anonymous page
#[derive(Debug, Default, PartialEq, Eq)]
pub struct AnonPage {
    /// Swap slot holding the page while it is evicted
    slot: Option<SwapSlot>,
}

impl AnonPage {
    /// Creates an anonymous page that has never been evicted
    pub const fn new() -> Self {
        Self { slot: None }
    }

    /// Swap slot currently holding this page's content
    pub fn swap_slot(&self) -> Option<SwapSlot> {
        self.slot
    }

    pub(crate) fn swap_in(&mut self, frame: &mut [u8], swap: &dyn SwapDevice) -> VmResult<()> {
        match self.slot {
            Some(slot) => {
                swap.read(slot, frame)?;
                swap.free_slot(slot);
                self.slot = None;
            }
            None => frame.fill(0),
        }
        Ok(())
    }

    pub(crate) fn swap_out(&mut self, frame: &[u8], swap: &dyn SwapDevice) -> VmResult<()> {
        if let Some(stale) = self.slot.take() {
            swap.free_slot(stale);
        }
        self.slot = Some(store(frame, swap)?);
        Ok(())
    }

    pub(crate) fn destroy(&mut self, swap: &dyn SwapDevice) {
        if let Some(slot) = self.slot.take() {
            swap.free_slot(slot);
        }
    }

    /// Copy of this page for another address space. Content that is resident
    /// (`frame`) or swapped out goes to a new slot owned by the copy.
    pub(crate) fn duplicate(&self, frame: Option<&[u8]>, swap: &dyn SwapDevice) -> VmResult<Self> {
        let slot = match (frame, self.slot) {
            (Some(bytes), _) => Some(store(bytes, swap)?),
            (None, Some(slot)) => {
                let mut buf = vec![0u8; PAGE_SIZE];
                swap.read(slot, &mut buf)?;
                Some(store(&buf, swap)?)
            }
            (None, None) => None,
        };
        Ok(Self { slot })
    }
}

fn store(bytes: &[u8], swap: &dyn SwapDevice) -> VmResult<SwapSlot> {
    let slot = swap.allocate_slot().ok_or(VmError::OutOfSwap)?;
    if let Err(err) = swap.write(slot, bytes) {
        swap.free_slot(slot);
        return Err(err.into());
    }
    Ok(slot)
}

//! Frame table
//!
//! Tracks every physical frame leased from the user pool and the page that
//! currently owns it. When the pool runs dry, a victim is chosen with the
//! clock (second chance) algorithm over the hardware accessed bits and its
//! content is moved out to the page's backing store.
//!
//! ## Frame identity
//!
//! A [`FrameId`] carries a generation number. Every time an entry is
//! vacated or handed to a new owner the generation changes, so an id held by
//! a page that has since lost its frame no longer resolves.
//!
//! ## Locking
//!
//! The table lock is never held while a page lock is taken. Eviction pins the
//! victim under the table lock, drops it, and then only *tries* the victim
//! page's lock: a busy page is unpinned and another victim is chosen.
//! A pinned frame is never chosen as a victim.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::ptr::NonNull;
use core::slice;

use nos_api::{FrameAllocator, PAGE_SIZE, PageMapper, PhysAddr, SwapDevice, VirtAddr};
use spin::Mutex;

use crate::error::{VmError, VmResult};
use crate::page::{Page, PageIo};
use crate::stats::VmStats;

/// Handle to a frame-table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId {
    slot: u32,
    generation: u32,
}

impl FrameId {
    /// Index of the entry in the table
    pub fn index(self) -> usize {
        self.slot as usize
    }
}

/// Back-link from a frame to the page that holds it
#[derive(Clone)]
pub(crate) struct FrameOwner {
    pub page: Weak<Mutex<Page>>,
    pub mmu: Arc<dyn PageMapper>,
    pub va: VirtAddr,
}

struct FrameEntry {
    pa: PhysAddr,
    owner: Option<FrameOwner>,
    /// Being filled, drained or otherwise worked on; not evictable
    pinned: bool,
}

#[derive(Default)]
struct Slot {
    generation: u32,
    entry: Option<FrameEntry>,
}

struct FrameTableInner {
    slots: Vec<Slot>,
    vacant: Vec<u32>,
    /// Clock hand
    hand: usize,
    leased: usize,
}

impl FrameTableInner {
    fn id(&self, slot: u32) -> FrameId {
        FrameId {
            slot,
            generation: self.slots[slot as usize].generation,
        }
    }

    fn entry_mut(&mut self, id: FrameId) -> Option<&mut FrameEntry> {
        let slot = self.slots.get_mut(id.index())?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_mut()
    }

    fn entry(&self, id: FrameId) -> Option<&FrameEntry> {
        let slot = self.slots.get(id.index())?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    fn install(&mut self, pa: PhysAddr) -> FrameId {
        let entry = FrameEntry {
            pa,
            owner: None,
            pinned: true,
        };
        let slot = match self.vacant.pop() {
            Some(slot) => slot,
            None => {
                self.slots.push(Slot::default());
                (self.slots.len() - 1) as u32
            }
        };
        self.slots[slot as usize].entry = Some(entry);
        self.leased += 1;
        self.id(slot)
    }

    /// Clock sweep. Frames with the accessed bit set get a second chance;
    /// two full turns are enough to find a victim if any unpinned owned
    /// frame exists.
    fn select_victim(&mut self) -> Option<(FrameId, FrameOwner)> {
        let len = self.slots.len();
        if len == 0 {
            return None;
        }

        for _ in 0..2 * len {
            let slot = self.hand % len;
            self.hand = (slot + 1) % len;

            let Some(entry) = self.slots[slot].entry.as_mut() else {
                continue;
            };
            if entry.pinned {
                continue;
            }
            let Some(owner) = entry.owner.as_ref() else {
                continue;
            };
            if owner.mmu.is_accessed(owner.va) {
                owner.mmu.set_accessed(owner.va, false);
                continue;
            }

            let owner = owner.clone();
            entry.pinned = true;
            return Some((self.id(slot as u32), owner));
        }
        None
    }
}

/// Table of leased user frames
pub struct FrameTable {
    allocator: Arc<dyn FrameAllocator>,
    inner: Mutex<FrameTableInner>,
    eviction_attempts: usize,
}

impl FrameTable {
    pub fn new(allocator: Arc<dyn FrameAllocator>, eviction_attempts: usize) -> Self {
        Self {
            allocator,
            inner: Mutex::new(FrameTableInner {
                slots: Vec::new(),
                vacant: Vec::new(),
                hand: 0,
                leased: 0,
            }),
            eviction_attempts,
        }
    }

    /// Number of frames currently leased from the allocator
    pub fn leased(&self) -> usize {
        self.inner.lock().leased
    }

    /// Physical address of a live entry
    pub fn phys_addr(&self, id: FrameId) -> Option<PhysAddr> {
        self.inner.lock().entry(id).map(|entry| entry.pa)
    }

    /// User address of the page owning a live entry
    pub fn owner_of(&self, id: FrameId) -> Option<VirtAddr> {
        self.inner
            .lock()
            .entry(id)
            .and_then(|entry| entry.owner.as_ref().map(|owner| owner.va))
    }

    pub fn is_pinned(&self, id: FrameId) -> bool {
        self.inner.lock().entry(id).is_some_and(|entry| entry.pinned)
    }

    /// Obtains a zeroed, pinned frame with no owner.
    ///
    /// Takes a fresh frame from the allocator when one is available,
    /// otherwise evicts a resident page. Fails with `OutOfMemory` only after
    /// `eviction_attempts` rounds found nothing to reclaim.
    pub(crate) fn get_frame(&self, swap: &dyn SwapDevice, stats: &VmStats) -> VmResult<FrameId> {
        for _ in 0..self.eviction_attempts {
            if let Some(pa) = self.allocator.acquire_zeroed_frame() {
                return Ok(self.inner.lock().install(pa));
            }

            let victim = self.inner.lock().select_victim();
            match victim {
                Some((id, owner)) => {
                    if let Some(fresh) = self.evict(id, owner, swap)? {
                        stats.record_eviction();
                        return Ok(fresh);
                    }
                }
                None => core::hint::spin_loop(),
            }
        }

        log::warn!("[vm] no frame available after {} rounds", self.eviction_attempts);
        Err(VmError::OutOfMemory)
    }

    /// Moves the victim page out of its frame. Returns the recycled frame, or
    /// `None` when the victim changed hands or is busy and another round
    /// should be tried.
    fn evict(
        &self,
        id: FrameId,
        owner: FrameOwner,
        swap: &dyn SwapDevice,
    ) -> VmResult<Option<FrameId>> {
        let Some(page_ref) = owner.page.upgrade() else {
            // The page went away without releasing its frame.
            if let Some(pa) = self.phys_addr(id) {
                if owner.mmu.probe(owner.va) == Some(pa) {
                    owner.mmu.unmap(owner.va);
                }
            }
            log::debug!("[vm] reclaiming orphaned frame {}", id.index());
            return Ok(self.recycle(id));
        };
        let Some(mut page) = page_ref.try_lock() else {
            self.unpin(id);
            return Ok(None);
        };
        if page.frame() != Some(id) {
            self.unpin(id);
            return Ok(None);
        }

        let io = PageIo {
            mmu: &*owner.mmu,
            swap,
        };
        let saved = self.with_frame(id, |bytes| page.swap_out(bytes, io));
        match saved {
            Some(Ok(())) => {}
            Some(Err(err)) => {
                self.unpin(id);
                return Err(err);
            }
            None => return Ok(None),
        }
        page.set_frame(None);
        log::debug!("[vm] evicted {} from frame {}", owner.va, id.index());
        drop(page);

        Ok(self.recycle(id))
    }

    /// Zeroes a pinned frame and hands it out under a new generation with no
    /// owner.
    fn recycle(&self, id: FrameId) -> Option<FrameId> {
        self.with_frame(id, |bytes| bytes.fill(0))?;
        let mut inner = self.inner.lock();
        let slot = inner.slots.get_mut(id.index())?;
        if slot.generation != id.generation {
            return None;
        }
        slot.generation = slot.generation.wrapping_add(1);
        if let Some(entry) = slot.entry.as_mut() {
            entry.owner = None;
        }
        Some(inner.id(id.slot))
    }

    /// Links a frame to the page that now holds it
    pub(crate) fn assign(&self, id: FrameId, owner: FrameOwner) -> bool {
        match self.inner.lock().entry_mut(id) {
            Some(entry) => {
                entry.owner = Some(owner);
                true
            }
            None => false,
        }
    }

    /// Makes a frame eligible for eviction again
    pub(crate) fn unpin(&self, id: FrameId) {
        if let Some(entry) = self.inner.lock().entry_mut(id) {
            entry.pinned = false;
        }
    }

    /// Drops the entry and returns its frame to the allocator
    pub(crate) fn release(&self, id: FrameId) {
        let pa = {
            let mut inner = self.inner.lock();
            let slot = match inner.slots.get_mut(id.index()) {
                Some(slot) if slot.generation == id.generation => slot,
                _ => return,
            };
            let Some(entry) = slot.entry.take() else {
                return;
            };
            slot.generation = slot.generation.wrapping_add(1);
            inner.vacant.push(id.slot);
            inner.leased -= 1;
            entry.pa
        };
        self.allocator.release_frame(pa);
    }

    /// Runs `f` over the bytes of a live frame.
    ///
    /// Callers hold the lock of the page that owns the frame (or the frame is
    /// pinned and unowned), which gives them exclusive use of its bytes.
    pub(crate) fn with_frame<R>(&self, id: FrameId, f: impl FnOnce(&mut [u8]) -> R) -> Option<R> {
        let pa = self.phys_addr(id)?;
        let ptr = self.allocator.kernel_ptr(pa);
        // SAFETY: the allocator guarantees PAGE_SIZE valid bytes behind the
        // pointer while the frame is leased, and the caller has exclusive
        // access to the frame as documented above.
        let bytes = unsafe { frame_slice(ptr) };
        Some(f(bytes))
    }
}

/// # Safety
///
/// `ptr` must point to `PAGE_SIZE` bytes that stay valid and unaliased for `'a`.
unsafe fn frame_slice<'a>(ptr: NonNull<u8>) -> &'a mut [u8] {
    // SAFETY: upheld by the caller.
    unsafe { slice::from_raw_parts_mut(ptr.as_ptr(), PAGE_SIZE) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use alloc::vec;
    use nos_api::{Result, SwapSlot};

    struct Pool {
        base: NonNull<u8>,
        free: Mutex<Vec<usize>>,
    }

    // SAFETY: frame bytes are only reached through `kernel_ptr`.
    unsafe impl Send for Pool {}
    unsafe impl Sync for Pool {}

    impl Pool {
        fn new(frames: usize) -> Arc<Self> {
            let mem = Box::leak(vec![0u8; frames * PAGE_SIZE].into_boxed_slice());
            Arc::new(Self {
                base: NonNull::new(mem.as_mut_ptr()).unwrap(),
                free: Mutex::new((0..frames).rev().collect()),
            })
        }
    }

    impl FrameAllocator for Pool {
        fn acquire_zeroed_frame(&self) -> Option<PhysAddr> {
            let index = self.free.lock().pop()?;
            Some(PhysAddr::new((index + 1) * PAGE_SIZE))
        }

        fn release_frame(&self, pa: PhysAddr) {
            self.free.lock().push(pa.as_usize() / PAGE_SIZE - 1);
        }

        fn kernel_ptr(&self, pa: PhysAddr) -> NonNull<u8> {
            // SAFETY: every leased address lies inside the leaked buffer.
            unsafe { self.base.add(pa.as_usize() - PAGE_SIZE) }
        }
    }

    struct NoSwap;

    impl SwapDevice for NoSwap {
        fn allocate_slot(&self) -> Option<SwapSlot> {
            None
        }

        fn read(&self, _slot: SwapSlot, _dest: &mut [u8]) -> Result<()> {
            Err(nos_api::error::io_error("no swap"))
        }

        fn write(&self, _slot: SwapSlot, _src: &[u8]) -> Result<()> {
            Err(nos_api::error::io_error("no swap"))
        }

        fn free_slot(&self, _slot: SwapSlot) {}
    }

    #[test]
    fn test_released_id_goes_stale() {
        let table = FrameTable::new(Pool::new(1), 4);
        let stats = VmStats::new();

        let first = table.get_frame(&NoSwap, &stats).unwrap();
        assert!(table.is_pinned(first));
        assert!(table.phys_addr(first).is_some());
        table.release(first);
        assert!(table.phys_addr(first).is_none());
        assert_eq!(table.leased(), 0);

        let second = table.get_frame(&NoSwap, &stats).unwrap();
        assert_eq!(second.index(), first.index());
        assert_ne!(second, first);

        table.unpin(first);
        table.release(first);
        assert!(table.is_pinned(second));
        assert_eq!(table.leased(), 1);
    }

    #[test]
    fn test_pinned_frames_are_never_victims() {
        let table = FrameTable::new(Pool::new(1), 4);
        let stats = VmStats::new();

        let _held = table.get_frame(&NoSwap, &stats).unwrap();
        assert_eq!(table.get_frame(&NoSwap, &stats), Err(VmError::OutOfMemory));
        assert_eq!(stats.snapshot().evictions, 0);
    }

    #[derive(Default)]
    struct SingleMapping {
        pte: Mutex<Option<(VirtAddr, PhysAddr)>>,
    }

    impl PageMapper for SingleMapping {
        fn map(&self, va: VirtAddr, pa: PhysAddr, _writable: bool) -> bool {
            *self.pte.lock() = Some((va, pa));
            true
        }

        fn unmap(&self, va: VirtAddr) {
            let mut pte = self.pte.lock();
            if pte.is_some_and(|(mapped, _)| mapped == va) {
                *pte = None;
            }
        }

        fn probe(&self, va: VirtAddr) -> Option<PhysAddr> {
            self.pte.lock().filter(|(mapped, _)| *mapped == va).map(|(_, pa)| pa)
        }

        fn is_dirty(&self, _va: VirtAddr) -> bool {
            false
        }

        fn set_dirty(&self, _va: VirtAddr, _dirty: bool) {}

        fn is_accessed(&self, _va: VirtAddr) -> bool {
            false
        }

        fn set_accessed(&self, _va: VirtAddr, _accessed: bool) {}
    }

    #[test]
    fn test_frame_of_dropped_page_is_reclaimed() {
        let table = FrameTable::new(Pool::new(1), 4);
        let stats = VmStats::new();
        let mmu = Arc::new(SingleMapping::default());
        let va = VirtAddr::new(0x40_0000);
        let page = Arc::new(Mutex::new(Page::new_anon(va, true)));

        let id = table.get_frame(&NoSwap, &stats).unwrap();
        let pa = table.phys_addr(id).unwrap();
        page.lock().set_frame(Some(id));
        assert!(table.assign(
            id,
            FrameOwner {
                page: Arc::downgrade(&page),
                mmu: mmu.clone(),
                va,
            },
        ));
        assert!(mmu.map(va, pa, true));
        table.with_frame(id, |bytes| bytes.fill(0xaa));
        table.unpin(id);
        drop(page);

        let fresh = table.get_frame(&NoSwap, &stats).unwrap();
        assert_eq!(fresh.index(), id.index());
        assert_ne!(fresh, id);
        assert_eq!(table.leased(), 1);
        assert!(table.owner_of(fresh).is_none());
        assert_eq!(mmu.probe(va), None);
        assert_eq!(
            table.with_frame(fresh, |bytes| bytes.iter().all(|&b| b == 0)),
            Some(true)
        );
    }

    #[test]
    fn test_with_frame_sees_frame_bytes() {
        let table = FrameTable::new(Pool::new(2), 4);
        let stats = VmStats::new();
        let id = table.get_frame(&NoSwap, &stats).unwrap();

        table.with_frame(id, |bytes| bytes[..3].copy_from_slice(b"abc"));
        let head = table.with_frame(id, |bytes| [bytes[0], bytes[1], bytes[2]]);
        assert_eq!(head, Some(*b"abc"));
    }
}

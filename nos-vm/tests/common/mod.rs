//! Common test utilities
//!
//! In-memory stand-ins for the collaborators of the VM subsystem: a page
//! table with dirty/accessed bits, a frame pool backed by real buffers, a
//! RAM disk for swap, and a shared in-memory file.

#![allow(dead_code)]

use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use hashbrown::HashMap;
use nos_api::{
    BackingFile, BlockDevice, Error, FileHandle, FrameAllocator, PAGE_SIZE, PageMapper, PhysAddr,
    Result, SECTOR_SIZE, SwapDevice, VirtAddr,
};
use nos_vm::{AddressSpace, SECTORS_PER_SLOT, SwapArea, Vm, VmConfig};
use spin::Mutex;

/// Hardware page table entry as seen by the fake MMU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pte {
    pub pa: PhysAddr,
    pub writable: bool,
    pub dirty: bool,
    pub accessed: bool,
}

/// Page table of one process
#[derive(Default)]
pub struct FakeMmu {
    ptes: Mutex<HashMap<VirtAddr, Pte>>,
    fail_next_map: AtomicBool,
}

impl FakeMmu {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes the next `map` call report failure
    pub fn fail_next_map(&self) {
        self.fail_next_map.store(true, Ordering::SeqCst);
    }

    pub fn pte(&self, va: VirtAddr) -> Option<Pte> {
        self.ptes.lock().get(&va.page_round_down()).copied()
    }

    pub fn mapped_count(&self) -> usize {
        self.ptes.lock().len()
    }
}

impl PageMapper for FakeMmu {
    fn map(&self, va: VirtAddr, pa: PhysAddr, writable: bool) -> bool {
        if self.fail_next_map.swap(false, Ordering::SeqCst) {
            return false;
        }
        self.ptes.lock().insert(
            va,
            Pte {
                pa,
                writable,
                dirty: false,
                accessed: false,
            },
        );
        true
    }

    fn unmap(&self, va: VirtAddr) {
        self.ptes.lock().remove(&va);
    }

    fn probe(&self, va: VirtAddr) -> Option<PhysAddr> {
        self.pte(va).map(|pte| pte.pa)
    }

    fn is_dirty(&self, va: VirtAddr) -> bool {
        self.pte(va).is_some_and(|pte| pte.dirty)
    }

    fn set_dirty(&self, va: VirtAddr, dirty: bool) {
        if let Some(pte) = self.ptes.lock().get_mut(&va) {
            pte.dirty = dirty;
        }
    }

    fn is_accessed(&self, va: VirtAddr) -> bool {
        self.pte(va).is_some_and(|pte| pte.accessed)
    }

    fn set_accessed(&self, va: VirtAddr, accessed: bool) {
        if let Some(pte) = self.ptes.lock().get_mut(&va) {
            pte.accessed = accessed;
        }
    }
}

/// Fixed pool of page-sized buffers. Frame `i` has physical address
/// `(i + 1) * PAGE_SIZE` so that no frame sits at zero.
pub struct FakeFrameAllocator {
    frames: Box<[UnsafeCell<[u8; PAGE_SIZE]>]>,
    free: Mutex<Vec<usize>>,
}

// SAFETY: frame bytes are only touched through pointers handed out by
// `kernel_ptr`, whose users serialize access per frame.
unsafe impl Sync for FakeFrameAllocator {}

impl FakeFrameAllocator {
    pub fn new(count: usize) -> Arc<Self> {
        Arc::new(Self {
            frames: (0..count).map(|_| UnsafeCell::new([0; PAGE_SIZE])).collect(),
            free: Mutex::new((0..count).rev().collect()),
        })
    }

    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    /// Frames currently handed out
    pub fn in_use(&self) -> usize {
        self.capacity() - self.free.lock().len()
    }

    fn index(pa: PhysAddr) -> usize {
        pa.as_usize() / PAGE_SIZE - 1
    }

    /// Copy of the bytes of the frame at `pa`
    pub fn read_frame(&self, pa: PhysAddr) -> Vec<u8> {
        // SAFETY: tests only inspect frames while no VM operation runs.
        unsafe { (*self.frames[Self::index(pa)].get()).to_vec() }
    }
}

impl FrameAllocator for FakeFrameAllocator {
    fn acquire_zeroed_frame(&self) -> Option<PhysAddr> {
        let index = self.free.lock().pop()?;
        // SAFETY: the frame was free, nobody holds a pointer into it.
        unsafe { (*self.frames[index].get()).fill(0) };
        Some(PhysAddr::new((index + 1) * PAGE_SIZE))
    }

    fn release_frame(&self, pa: PhysAddr) {
        let index = Self::index(pa);
        let mut free = self.free.lock();
        assert!(!free.contains(&index), "double release of frame {}", pa);
        free.push(index);
    }

    fn kernel_ptr(&self, pa: PhysAddr) -> NonNull<u8> {
        NonNull::new(self.frames[Self::index(pa)].get().cast::<u8>()).expect("frame pointer")
    }
}

/// Sector store in memory
pub struct RamDisk {
    sectors: Mutex<Vec<[u8; SECTOR_SIZE]>>,
}

impl RamDisk {
    pub fn with_slots(slots: usize) -> Self {
        Self {
            sectors: Mutex::new(vec![[0; SECTOR_SIZE]; slots * SECTORS_PER_SLOT]),
        }
    }
}

impl BlockDevice for RamDisk {
    fn sector_count(&self) -> u32 {
        self.sectors.lock().len() as u32
    }

    fn read_sector(&self, sector: u32, buf: &mut [u8]) -> Result<()> {
        let sectors = self.sectors.lock();
        let data = sectors
            .get(sector as usize)
            .ok_or_else(|| Error::IoError("sector out of range".into()))?;
        buf.copy_from_slice(data);
        Ok(())
    }

    fn write_sector(&self, sector: u32, buf: &[u8]) -> Result<()> {
        let mut sectors = self.sectors.lock();
        let data = sectors
            .get_mut(sector as usize)
            .ok_or_else(|| Error::IoError("sector out of range".into()))?;
        data.copy_from_slice(buf);
        Ok(())
    }
}

/// In-memory file. Reopened handles share data and counters.
pub struct MemFile {
    data: Arc<Mutex<Vec<u8>>>,
    reads: Arc<AtomicUsize>,
    writes: Arc<AtomicUsize>,
}

impl MemFile {
    pub fn new(bytes: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            data: Arc::new(Mutex::new(bytes)),
            reads: Arc::new(AtomicUsize::new(0)),
            writes: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn handle(self: &Arc<Self>) -> FileHandle {
        self.clone()
    }
}

impl BackingFile for MemFile {
    fn read_at(&self, offset: usize, dest: &mut [u8]) -> Result<usize> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let data = self.data.lock();
        if offset >= data.len() {
            return Ok(0);
        }
        let n = dest.len().min(data.len() - offset);
        dest[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn write_at(&self, offset: usize, src: &[u8]) -> Result<usize> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut data = self.data.lock();
        if data.len() < offset + src.len() {
            data.resize(offset + src.len(), 0);
        }
        data[offset..offset + src.len()].copy_from_slice(src);
        Ok(src.len())
    }

    fn length(&self) -> usize {
        self.data.lock().len()
    }

    fn reopen(&self) -> Result<FileHandle> {
        Ok(Arc::new(MemFile {
            data: self.data.clone(),
            reads: self.reads.clone(),
            writes: self.writes.clone(),
        }))
    }
}

/// A VM instance over fake hardware
pub struct Harness {
    pub vm: Arc<Vm>,
    pub frames: Arc<FakeFrameAllocator>,
    pub swap: Arc<SwapArea<RamDisk>>,
}

impl Harness {
    /// A fresh process and its page table
    pub fn process(&self) -> (AddressSpace, Arc<FakeMmu>) {
        let mmu = FakeMmu::new();
        let space = self
            .vm
            .create_address_space(mmu.clone())
            .expect("address space");
        (space, mmu)
    }

    pub fn config(&self) -> &VmConfig {
        self.vm.config()
    }
}

pub fn harness(frames: usize, swap_slots: usize) -> Harness {
    let allocator = FakeFrameAllocator::new(frames);
    let swap = Arc::new(SwapArea::new(RamDisk::with_slots(swap_slots)));
    let vm = Vm::new(
        VmConfig::x86_64(),
        allocator.clone(),
        swap.clone() as Arc<dyn SwapDevice>,
    )
    .expect("vm");
    Harness {
        vm,
        frames: allocator,
        swap,
    }
}

/// Address of the `index`-th page of user space
pub fn user_page(index: usize) -> VirtAddr {
    VirtAddr::new(VmConfig::x86_64().user_base).add_pages(index)
}

/// A stack pointer that never makes a fault look like a stack access
pub fn far_sp() -> VirtAddr {
    VirtAddr::new(VmConfig::x86_64().user_stack_top)
}

/// A page filled with `byte`
pub fn page_of(byte: u8) -> Vec<u8> {
    vec![byte; PAGE_SIZE]
}

//! Per-process address space
//!
//! An [`AddressSpace`] ties a process's supplemental page table to its
//! hardware page table and to the shared frame table. It implements the
//! claim pipeline, fault handling, lazy segment and stack setup, file
//! mappings, and the process lifecycle hooks (copy on fork, teardown on
//! exit).
//!
//! ## Claim
//!
//! Claiming a page runs with the page locked:
//!
//! 1. obtain a pinned frame (possibly by evicting another page)
//! 2. link frame and page in both directions
//! 3. install the hardware mapping, honoring the page's writable flag
//! 4. fill the frame through the page's `swap_in`
//! 5. unpin the frame
//!
//! A failure in step 3 or 4 unlinks the page and returns the frame before
//! the error is reported.

use alloc::sync::Arc;
use alloc::vec::Vec;

use hashbrown::HashMap;
use nos_api::{FileHandle, PAGE_SIZE, PageMapper, VirtAddr, page_round_up};
use spin::Mutex;

use crate::config::VmConfig;
use crate::error::{VmError, VmResult};
use crate::fault::{self, FatalFault, FaultAction, FaultResolution, PageFault};
use crate::frame::FrameOwner;
use crate::page::{
    FileMapping, InitTarget, LazyLoader, Page, PageIo, PageKind, PageRef, SegmentLoader,
};
use crate::spt::SupplementalPageTable;
use crate::vm::Vm;

/// A file mapping created by [`AddressSpace::mmap`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmapRegion {
    /// First mapped page
    pub start: VirtAddr,
    /// Number of pages in the mapping
    pub pages: usize,
}

impl MmapRegion {
    /// One past the last mapped byte
    pub fn end(&self) -> VirtAddr {
        self.start.add_pages(self.pages)
    }
}

/// Virtual memory state of one process
pub struct AddressSpace {
    pub(crate) vm: Arc<Vm>,
    pub(crate) mmu: Arc<dyn PageMapper>,
    pub(crate) spt: SupplementalPageTable,
    mmaps: Mutex<HashMap<VirtAddr, MmapRegion>>,
}

impl AddressSpace {
    pub(crate) fn new(vm: Arc<Vm>, mmu: Arc<dyn PageMapper>) -> VmResult<Self> {
        Ok(Self {
            vm,
            mmu,
            spt: SupplementalPageTable::new()?,
            mmaps: Mutex::new(HashMap::new()),
        })
    }

    pub fn spt(&self) -> &SupplementalPageTable {
        &self.spt
    }

    pub fn mmu(&self) -> &Arc<dyn PageMapper> {
        &self.mmu
    }

    pub fn config(&self) -> &VmConfig {
        self.vm.config()
    }

    pub fn page_count(&self) -> usize {
        self.spt.len()
    }

    /// Page containing `va`
    pub fn find_page(&self, va: VirtAddr) -> Option<PageRef> {
        self.spt.find(va)
    }

    /// Whether `va` has a page that currently holds a frame
    pub fn is_mapped(&self, va: VirtAddr) -> bool {
        self.spt
            .find(va)
            .is_some_and(|page| page.lock().is_resident())
    }

    /// Effective kind of the page at `va`
    pub fn page_kind(&self, va: VirtAddr) -> Option<PageKind> {
        self.spt.find(va).map(|page| page.lock().kind())
    }

    pub(crate) fn io(&self) -> PageIo<'_> {
        PageIo {
            mmu: &*self.mmu,
            swap: self.vm.swap(),
        }
    }

    /// Registers a lazily initialized anonymous page
    pub fn alloc_page(&self, va: VirtAddr, writable: bool) -> VmResult<PageRef> {
        self.alloc_page_with_initializer(InitTarget::Anon, va, writable, None)
    }

    /// Registers a page that becomes `target` on first fault, with `loader`
    /// filling its first frame.
    pub fn alloc_page_with_initializer(
        &self,
        target: InitTarget,
        va: VirtAddr,
        writable: bool,
        loader: Option<Arc<dyn LazyLoader>>,
    ) -> VmResult<PageRef> {
        if va.is_null() || !self.config().is_user_address(va) {
            return Err(VmError::InvalidMapping("page outside user space"));
        }
        self.spt
            .insert(Page::new_uninit(va, writable, target, loader))
    }

    /// Registers an executable segment for lazy loading: `read_bytes` from
    /// `file` at `offset` followed by `zero_bytes` of zeroes, starting at
    /// `upage`. Each page reads its share of the file on first fault.
    pub fn load_segment(
        &self,
        file: &FileHandle,
        offset: usize,
        upage: VirtAddr,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> VmResult<()> {
        if !upage.is_page_aligned() || offset % PAGE_SIZE != 0 {
            return Err(VmError::InvalidMapping("segment must start on a page boundary"));
        }
        let total = read_bytes
            .checked_add(zero_bytes)
            .ok_or(VmError::InvalidMapping("segment size overflows"))?;
        if total % PAGE_SIZE != 0 {
            return Err(VmError::InvalidMapping("segment size must be whole pages"));
        }

        let mut upage = upage;
        let mut offset = offset;
        let mut read_bytes = read_bytes;
        for _ in 0..total / PAGE_SIZE {
            let page_read = read_bytes.min(PAGE_SIZE);
            let loader: Arc<dyn LazyLoader> =
                Arc::new(SegmentLoader::new(file.clone(), offset, page_read));
            self.alloc_page_with_initializer(InitTarget::Anon, upage, writable, Some(loader))?;

            read_bytes -= page_read;
            offset += page_read;
            upage = upage.add_pages(1);
        }
        log::debug!("[vm] segment of {} pages registered", total / PAGE_SIZE);
        Ok(())
    }

    /// Creates and claims the first stack page. Returns the initial stack
    /// pointer.
    pub fn setup_stack(&self) -> VmResult<VirtAddr> {
        let va = self.config().initial_stack_page();
        let page = self.spt.insert(Page::new_anon(va, true))?;
        self.claim(&page)?;
        Ok(VirtAddr::new(self.config().user_stack_top))
    }

    /// Brings the page at `va` into a frame
    pub fn claim_page(&self, va: VirtAddr) -> VmResult<()> {
        let page = self.spt.find(va).ok_or(VmError::NotFound(va.page_round_down()))?;
        self.claim(&page)
    }

    pub(crate) fn claim(&self, page: &PageRef) -> VmResult<()> {
        let mut guard = page.lock();
        let va = guard.va();
        if guard.is_resident() {
            return Err(VmError::AlreadyMapped(va));
        }

        let frames = self.vm.frames();
        let id = frames.get_frame(self.vm.swap(), self.vm.stats())?;
        frames.assign(
            id,
            FrameOwner {
                page: Arc::downgrade(page),
                mmu: self.mmu.clone(),
                va,
            },
        );
        guard.set_frame(Some(id));

        let mapped = match frames.phys_addr(id) {
            Some(pa) => self.mmu.map(va, pa, guard.writable()),
            None => false,
        };
        if !mapped {
            guard.set_frame(None);
            frames.release(id);
            log::warn!("[vm] cannot install mapping for {}", va);
            return Err(VmError::MapFailed(va));
        }

        let io = self.io();
        let filled = frames
            .with_frame(id, |bytes| guard.swap_in(bytes, io))
            .unwrap_or(Err(VmError::NotResident(va)));
        if let Err(err) = filled {
            self.mmu.unmap(va);
            guard.set_frame(None);
            frames.release(id);
            log::warn!("[vm] cannot fill {}: {}", va, err);
            return Err(err);
        }

        // The faulting access is about to be retried.
        self.mmu.set_accessed(va, true);
        frames.unpin(id);
        self.vm.stats().record_claim();
        log::debug!("[vm] claimed {} into frame {}", va, id.index());
        Ok(())
    }

    /// Claims a page, accepting that another thread got there first
    pub(crate) fn claim_resolving(&self, page: &PageRef) -> VmResult<()> {
        match self.claim(page) {
            Err(VmError::AlreadyMapped(_)) => Ok(()),
            other => other,
        }
    }

    pub(crate) fn grow_stack(&self, va: VirtAddr) -> VmResult<()> {
        let page = match self.spt.insert(Page::new_anon(va, true)) {
            Ok(page) => page,
            Err(VmError::AlreadyExists(_)) => {
                self.spt.find(va).ok_or(VmError::NotFound(va))?
            }
            Err(err) => return Err(err),
        };
        self.claim_resolving(&page)?;
        self.vm.stats().record_stack_growth();
        log::debug!("[vm] stack grown to {}", va);
        Ok(())
    }

    /// Resolves a page fault taken on behalf of this address space
    pub fn handle_fault(&self, fault: &PageFault) -> FaultResolution {
        self.vm.stats().record_fault();

        let result = match fault::classify(self.config(), &self.spt, fault) {
            FaultAction::Resolved => Ok(()),
            FaultAction::GrowStack(va) => self.grow_stack(va).map_err(|error| {
                FatalFault::ClaimFailed {
                    addr: fault.addr,
                    error,
                }
            }),
            FaultAction::Claim(page) => self.claim_resolving(&page).map_err(|error| {
                FatalFault::ClaimFailed {
                    addr: fault.addr,
                    error,
                }
            }),
            FaultAction::Fatal(fatal) => Err(fatal),
        };

        match result {
            Ok(()) => FaultResolution::Handled,
            Err(fatal) => {
                self.vm.stats().record_fatal_fault();
                log::warn!(
                    "[vm] fatal {} fault: {}",
                    if fault.is_user() { "user" } else { "kernel" },
                    fatal
                );
                FaultResolution::Terminate(fatal)
            }
        }
    }

    /// Removes the page at `va` and tears it down
    pub fn remove_page(&self, va: VirtAddr) -> VmResult<()> {
        let page = self
            .spt
            .remove(va)
            .ok_or(VmError::NotFound(va.page_round_down()))?;
        self.teardown(&page)
    }

    /// Writes back dirty file content, unmaps, and releases the frame and
    /// swap slot of a page that is no longer in the table.
    fn teardown(&self, page: &PageRef) -> VmResult<()> {
        let mut guard = page.lock();
        let io = self.io();
        let mut result = Ok(());

        if let Some(id) = guard.frame() {
            let frames = self.vm.frames();
            if let Some(Err(err)) = frames.with_frame(id, |bytes| guard.write_back(bytes, io)) {
                log::warn!("[vm] write-back of {} failed: {}", guard.va(), err);
                result = Err(err);
            }
            self.mmu.unmap(guard.va());
            guard.set_frame(None);
            frames.release(id);
        }
        guard.destroy(io);
        result
    }

    /// Maps `length` bytes of `file` starting at `offset` at `addr`. Pages
    /// are read lazily; bytes past the end of the file read as zero.
    pub fn mmap(
        &self,
        addr: VirtAddr,
        length: usize,
        writable: bool,
        file: &FileHandle,
        offset: usize,
    ) -> VmResult<VirtAddr> {
        if addr.is_null() || !addr.is_page_aligned() {
            return Err(VmError::InvalidMapping("address must be a non-null page boundary"));
        }
        if length == 0 {
            return Err(VmError::InvalidMapping("zero-length mapping"));
        }
        if offset % PAGE_SIZE != 0 {
            return Err(VmError::InvalidMapping("offset must be page aligned"));
        }
        let file_len = file.length();
        if file_len == 0 {
            return Err(VmError::InvalidMapping("cannot map an empty file"));
        }
        let end = addr
            .checked_add(length)
            .ok_or(VmError::InvalidMapping("mapping wraps around"))?;
        if !self.config().is_user_address(addr) || end.as_usize() > self.config().user_max {
            return Err(VmError::InvalidMapping("mapping outside user space"));
        }

        let pages = page_round_up(length) / PAGE_SIZE;
        if offset.checked_add(pages * PAGE_SIZE).is_none() {
            return Err(VmError::InvalidMapping("offset overflows"));
        }
        if (0..pages).any(|i| self.spt.contains(addr.add_pages(i))) {
            return Err(VmError::InvalidMapping("mapping overlaps existing pages"));
        }

        let file = file.reopen()?;
        let mut remaining = file_len.saturating_sub(offset).min(length);
        for i in 0..pages {
            let page_read = remaining.min(PAGE_SIZE);
            let mapping = FileMapping::new(file.clone(), offset + i * PAGE_SIZE, page_read);
            let va = addr.add_pages(i);
            if let Err(err) =
                self.alloc_page_with_initializer(InitTarget::File(mapping), va, writable, None)
            {
                for done in 0..i {
                    if let Some(page) = self.spt.remove(addr.add_pages(done)) {
                        if let Err(err) = self.teardown(&page) {
                            log::warn!(
                                "[vm] mmap rollback at {} failed: {}",
                                addr.add_pages(done),
                                err
                            );
                        }
                    }
                }
                return Err(err);
            }
            remaining -= page_read;
        }

        self.mmaps.lock().insert(addr, MmapRegion { start: addr, pages });
        log::debug!("[vm] mmap {} pages at {}", pages, addr);
        Ok(addr)
    }

    /// Removes the mapping starting at `addr`, writing modified pages back
    /// to the file.
    pub fn munmap(&self, addr: VirtAddr) -> VmResult<()> {
        let region = self
            .mmaps
            .lock()
            .remove(&addr)
            .ok_or(VmError::NotFound(addr))?;

        let mut result = Ok(());
        for i in 0..region.pages {
            if let Some(page) = self.spt.remove(region.start.add_pages(i)) {
                if let Err(err) = self.teardown(&page) {
                    result = Err(err);
                }
            }
        }
        log::debug!("[vm] munmap {} pages at {}", region.pages, addr);
        result
    }

    /// Active file mappings, ordered by address
    pub fn mappings(&self) -> Vec<MmapRegion> {
        let mut regions: Vec<MmapRegion> = self.mmaps.lock().values().copied().collect();
        regions.sort_unstable_by_key(|region| region.start);
        regions
    }

    /// Copies every page of `src` into this (fresh) address space, the way
    /// fork does. Content is duplicated but frames are not: the child faults
    /// its pages in on first use.
    ///
    /// On failure this space holds only fully copied pages and can be
    /// killed safely.
    pub fn copy_from(&self, src: &AddressSpace) -> VmResult<()> {
        if !Arc::ptr_eq(&self.vm, &src.vm) {
            return Err(VmError::InvalidMapping("address spaces of different VM instances"));
        }

        let frames = self.vm.frames();
        for page in src.spt.pages() {
            let mut parent = page.lock();
            let io = src.io();
            let copied = match parent
                .frame()
                .and_then(|id| frames.with_frame(id, |bytes| parent.duplicate(Some(bytes), io)))
            {
                Some(result) => result,
                None => parent.duplicate(None, io),
            };
            drop(parent);

            if let Err((err, mut rejected)) = self.spt.try_insert(copied?) {
                rejected.destroy(self.io());
                return Err(err);
            }
        }

        let regions: Vec<MmapRegion> = src.mmaps.lock().values().copied().collect();
        let mut mmaps = self.mmaps.lock();
        for region in regions {
            mmaps.insert(region.start, region);
        }
        log::debug!("[vm] copied {} pages", self.spt.len());
        Ok(())
    }

    /// Destroys every page: dirty file content is written back, frames and
    /// swap slots are released. Safe to call more than once.
    pub fn kill(&self) {
        self.mmaps.lock().clear();
        let pages = self.spt.drain();
        let count = pages.len();
        for page in pages {
            if let Err(err) = self.teardown(&page) {
                log::warn!("[vm] teardown error ignored: {}", err);
            }
        }
        if count > 0 {
            log::debug!("[vm] address space destroyed ({} pages)", count);
        }
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        self.kill();
    }
}

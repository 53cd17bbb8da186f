//! User buffer validation and access
//!
//! System calls that take user pointers check the whole buffer up front
//! with [`AddressSpace::validate_buffer`]; a violation terminates the
//! process before the call has any effect. The copy helpers move bytes
//! between kernel and user memory the way the CPU would, faulting pages in
//! as needed.

use nos_api::{PAGE_SIZE, VirtAddr};

use crate::address_space::AddressSpace;
use crate::error::VmError;
use crate::fault::{FatalFault, FaultResolution, PageFault};

impl AddressSpace {
    /// Checks that every page of `[ptr, ptr + len)` is user memory backed by
    /// a page, writable if `must_be_writable`. Pages just below the stack
    /// pointer grow the stack, and pages that are not resident are brought
    /// in so the system call does not fault on them.
    ///
    /// An empty buffer is always valid.
    pub fn validate_buffer(
        &self,
        ptr: VirtAddr,
        len: usize,
        stack_pointer: VirtAddr,
        must_be_writable: bool,
    ) -> Result<(), FatalFault> {
        if len == 0 {
            return Ok(());
        }
        let result = self.check_buffer(ptr, len, stack_pointer, must_be_writable);
        if let Err(fatal) = &result {
            self.vm.stats().record_fatal_fault();
            log::warn!("[vm] rejected user buffer {} (+{:#x}): {}", ptr, len, fatal);
        }
        result
    }

    fn check_buffer(
        &self,
        ptr: VirtAddr,
        len: usize,
        stack_pointer: VirtAddr,
        must_be_writable: bool,
    ) -> Result<(), FatalFault> {
        let last = ptr
            .checked_add(len - 1)
            .ok_or(FatalFault::BadAddress(ptr))?;
        let config = self.config();
        if ptr.is_null() || !config.is_user_address(ptr) || !config.is_user_address(last) {
            return Err(FatalFault::BadAddress(ptr));
        }

        let first_page = ptr.page_round_down();
        let last_page = last.page_round_down();
        if first_page == last_page {
            return self.check_page(ptr, stack_pointer, must_be_writable);
        }

        let mut addr = ptr;
        loop {
            self.check_page(addr, stack_pointer, must_be_writable)?;
            let page = addr.page_round_down();
            if page == last_page {
                return Ok(());
            }
            addr = page.add_pages(1);
        }
    }

    /// `addr` is the lowest buffer address inside its page
    fn check_page(
        &self,
        addr: VirtAddr,
        stack_pointer: VirtAddr,
        must_be_writable: bool,
    ) -> Result<(), FatalFault> {
        let claim_failed = |error: VmError| FatalFault::ClaimFailed { addr, error };

        let Some(page) = self.spt.find(addr) else {
            if self.config().is_stack_growth(addr, stack_pointer) {
                return self.grow_stack(addr.page_round_down()).map_err(claim_failed);
            }
            return Err(FatalFault::Unmapped(addr));
        };

        let (writable, resident) = {
            let page = page.lock();
            (page.writable(), page.is_resident())
        };
        if must_be_writable && !writable {
            return Err(FatalFault::WriteToReadOnly(addr));
        }
        if !resident {
            self.claim_resolving(&page).map_err(claim_failed)?;
        }
        Ok(())
    }

    /// Copies user memory at `addr` into `dst`
    pub fn read_user(
        &self,
        addr: VirtAddr,
        dst: &mut [u8],
        stack_pointer: VirtAddr,
    ) -> Result<(), FatalFault> {
        let mut done = 0;
        while done < dst.len() {
            let va = addr.checked_add(done).ok_or(FatalFault::BadAddress(addr))?;
            let offset = va.page_offset();
            let chunk = (PAGE_SIZE - offset).min(dst.len() - done);
            let out = &mut dst[done..done + chunk];
            self.with_user_page(va, stack_pointer, false, |frame| {
                out.copy_from_slice(&frame[offset..offset + chunk]);
            })?;
            done += chunk;
        }
        Ok(())
    }

    /// Copies `src` into user memory at `addr`
    pub fn write_user(
        &self,
        addr: VirtAddr,
        src: &[u8],
        stack_pointer: VirtAddr,
    ) -> Result<(), FatalFault> {
        let mut done = 0;
        while done < src.len() {
            let va = addr.checked_add(done).ok_or(FatalFault::BadAddress(addr))?;
            let offset = va.page_offset();
            let chunk = (PAGE_SIZE - offset).min(src.len() - done);
            let input = &src[done..done + chunk];
            self.with_user_page(va, stack_pointer, true, |frame| {
                frame[offset..offset + chunk].copy_from_slice(input);
            })?;
            done += chunk;
        }
        Ok(())
    }

    /// Runs `f` over the frame holding `va`, faulting the page in first if
    /// needed. The access sets the accessed bit, and the dirty bit for
    /// writes.
    fn with_user_page<R>(
        &self,
        va: VirtAddr,
        stack_pointer: VirtAddr,
        write: bool,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, FatalFault> {
        let fault = PageFault::new(va, true, write, false, stack_pointer);

        for _ in 0..self.config().eviction_attempts {
            if let Some(page) = self.spt.find(va) {
                let page = page.lock();
                if let (Some(id), true) = (page.frame(), page.writable() || !write) {
                    let page_va = page.va();
                    let result = self
                        .vm
                        .frames()
                        .with_frame(id, f)
                        .ok_or(FatalFault::ClaimFailed {
                            addr: va,
                            error: VmError::NotResident(page_va),
                        })?;
                    self.mmu.set_accessed(page_va, true);
                    if write {
                        self.mmu.set_dirty(page_va, true);
                    }
                    return Ok(result);
                }
            }

            // Evicted again before we got to it, or never resident.
            if let FaultResolution::Terminate(fatal) = self.handle_fault(&fault) {
                return Err(fatal);
            }
        }

        Err(FatalFault::ClaimFailed {
            addr: va,
            error: VmError::OutOfMemory,
        })
    }
}

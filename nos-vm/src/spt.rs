//! Supplemental page table
//!
//! Per-process directory of [`Page`]s keyed by page-aligned user address,
//! independent of the hardware page table. The table owns its pages; other
//! holders (an in-flight fault, the frame table's weak back-link) only borrow
//! them.
//!
//! The lock protects the map only. It is never held across a page lock or
//! any I/O.

use alloc::sync::Arc;
use alloc::vec::Vec;

use hashbrown::HashMap;
use nos_api::VirtAddr;
use spin::Mutex;

use crate::error::{VmError, VmResult};
use crate::page::{Page, PageRef};

/// Initial bucket reservation for a new table
const INITIAL_CAPACITY: usize = 32;

/// Per-process page directory
pub struct SupplementalPageTable {
    pages: Mutex<HashMap<VirtAddr, PageRef>>,
}

impl SupplementalPageTable {
    /// Creates an empty table, failing if the map cannot be allocated
    pub fn new() -> VmResult<Self> {
        let mut pages = HashMap::new();
        pages
            .try_reserve(INITIAL_CAPACITY)
            .map_err(|_| VmError::OutOfMemory)?;
        Ok(Self {
            pages: Mutex::new(pages),
        })
    }

    /// Page containing `va`
    pub fn find(&self, va: VirtAddr) -> Option<PageRef> {
        self.pages.lock().get(&va.page_round_down()).cloned()
    }

    pub fn contains(&self, va: VirtAddr) -> bool {
        self.pages.lock().contains_key(&va.page_round_down())
    }

    /// Adds a page. The first page at an address wins; a duplicate leaves
    /// the table unchanged.
    pub fn insert(&self, page: Page) -> VmResult<PageRef> {
        self.try_insert(page).map_err(|(err, _)| err)
    }

    /// Like [`insert`](Self::insert), but hands a rejected page back so the
    /// caller can release what it holds.
    pub(crate) fn try_insert(&self, page: Page) -> Result<PageRef, (VmError, Page)> {
        let va = page.va();
        let mut pages = self.pages.lock();
        if pages.contains_key(&va) {
            return Err((VmError::AlreadyExists(va), page));
        }
        if pages.try_reserve(1).is_err() {
            return Err((VmError::OutOfMemory, page));
        }
        let page = Arc::new(Mutex::new(page));
        pages.insert(va, page.clone());
        Ok(page)
    }

    /// Unlinks the page containing `va` without tearing it down. Callers
    /// own the teardown; see `AddressSpace::remove_page`.
    pub(crate) fn remove(&self, va: VirtAddr) -> Option<PageRef> {
        self.pages.lock().remove(&va.page_round_down())
    }

    pub fn len(&self) -> usize {
        self.pages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.lock().is_empty()
    }

    /// Snapshot of every page, ordered by address
    pub fn pages(&self) -> Vec<PageRef> {
        let pages = self.pages.lock();
        let mut entries: Vec<(VirtAddr, PageRef)> =
            pages.iter().map(|(va, page)| (*va, page.clone())).collect();
        drop(pages);
        entries.sort_unstable_by_key(|(va, _)| *va);
        entries.into_iter().map(|(_, page)| page).collect()
    }

    /// Removes and returns every page
    pub(crate) fn drain(&self) -> Vec<PageRef> {
        let mut pages = self.pages.lock();
        pages.drain().map(|(_, page)| page).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nos_api::PAGE_SIZE;

    #[test]
    fn test_find_rounds_down() {
        let spt = SupplementalPageTable::new().unwrap();
        let page = spt.insert(Page::new_anon(VirtAddr::new(0x40_1000), true)).unwrap();

        let found = spt.find(VirtAddr::new(0x40_1abc)).unwrap();
        assert!(Arc::ptr_eq(&page, &found));
        assert!(spt.find(VirtAddr::new(0x40_2000)).is_none());
    }

    #[test]
    fn test_duplicate_insert_keeps_first() {
        let spt = SupplementalPageTable::new().unwrap();
        let first = spt.insert(Page::new_anon(VirtAddr::new(0x40_0000), true)).unwrap();

        let dup = spt.insert(Page::new_anon(VirtAddr::new(0x40_0010), false));
        assert_eq!(dup.unwrap_err(), VmError::AlreadyExists(VirtAddr::new(0x40_0000)));
        assert_eq!(spt.len(), 1);

        let found = spt.find(VirtAddr::new(0x40_0000)).unwrap();
        assert!(Arc::ptr_eq(&first, &found));
        assert!(found.lock().writable());
    }

    #[test]
    fn test_pages_sorted_and_drain_empties() {
        let spt = SupplementalPageTable::new().unwrap();
        for i in [3usize, 1, 2] {
            spt.insert(Page::new_anon(VirtAddr::new(0x40_0000 + i * PAGE_SIZE), true))
                .unwrap();
        }
        let vas: Vec<usize> = spt.pages().iter().map(|p| p.lock().va().as_usize()).collect();
        assert_eq!(vas, [0x40_1000, 0x40_2000, 0x40_3000]);

        assert_eq!(spt.drain().len(), 3);
        assert!(spt.is_empty());
    }
}

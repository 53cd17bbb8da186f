//! Virtual pages
//!
//! A [`Page`] is the supplemental page table's record of one user page. Its
//! content source changes over its life: every page starts either
//! uninitialized (lazy) or anonymous, and the first fault turns an
//! uninitialized page into its target kind. Pages of the same kind behave
//! identically no matter how they were created.
//!
//! A page and the frame that holds it link to each other: `Page::frame`
//! names the frame-table entry, and that entry names the page as its owner.
//! Both links are established by a claim and removed together by eviction
//! or destruction.
//!
//! All methods here expect the caller to hold the page's lock.

pub mod anon;
pub mod file;
pub mod uninit;

use alloc::sync::Arc;
use core::fmt;

use nos_api::{PageMapper, SwapDevice, SwapSlot, VirtAddr};
use spin::Mutex;

pub use anon::AnonPage;
pub use file::{FileMapping, FilePage};
pub use uninit::{InitTarget, LazyLoader, SegmentLoader, UninitPage};

use crate::error::{VmError, VmResult};
use crate::frame::FrameId;

/// Shared, lockable page record
pub type PageRef = Arc<Mutex<Page>>;

/// Kind of a page as observed from outside
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageKind {
    /// Zero-filled, swap-backed
    Anon,
    /// Backed by a file region
    File,
}

/// Where a page's bytes come from
#[derive(Debug)]
pub enum PageContent {
    Uninit(UninitPage),
    Anon(AnonPage),
    File(FilePage),
}

/// Collaborators page operations need while moving bytes
#[derive(Clone, Copy)]
pub(crate) struct PageIo<'a> {
    pub mmu: &'a dyn PageMapper,
    pub swap: &'a dyn SwapDevice,
}

/// One user page
pub struct Page {
    /// Page-aligned user virtual address
    va: VirtAddr,
    /// Whether user code may write the page
    writable: bool,
    /// Frame currently holding the page
    frame: Option<FrameId>,
    content: PageContent,
}

impl Page {
    /// Creates a page that will become `target` on first fault
    pub fn new_uninit(
        va: VirtAddr,
        writable: bool,
        target: InitTarget,
        loader: Option<Arc<dyn LazyLoader>>,
    ) -> Self {
        Self {
            va: va.page_round_down(),
            writable,
            frame: None,
            content: PageContent::Uninit(UninitPage::new(target, loader)),
        }
    }

    /// Creates an anonymous page that will be zero-filled on first fault
    pub fn new_anon(va: VirtAddr, writable: bool) -> Self {
        Self {
            va: va.page_round_down(),
            writable,
            frame: None,
            content: PageContent::Anon(AnonPage::new()),
        }
    }

    pub fn va(&self) -> VirtAddr {
        self.va
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn frame(&self) -> Option<FrameId> {
        self.frame
    }

    pub fn is_resident(&self) -> bool {
        self.frame.is_some()
    }

    /// Effective kind: an uninitialized page reports what it will become
    pub fn kind(&self) -> PageKind {
        match &self.content {
            PageContent::Uninit(uninit) => uninit.target().kind(),
            PageContent::Anon(_) => PageKind::Anon,
            PageContent::File(_) => PageKind::File,
        }
    }

    /// Whether the page has been through its first fault
    pub fn is_initialized(&self) -> bool {
        !matches!(self.content, PageContent::Uninit(_))
    }

    pub fn content(&self) -> &PageContent {
        &self.content
    }

    /// Swap slot holding the page, for evicted anonymous pages
    pub fn swap_slot(&self) -> Option<SwapSlot> {
        match &self.content {
            PageContent::Anon(anon) => anon.swap_slot(),
            _ => None,
        }
    }

    /// Records a kernel-side write so the page is written back on eviction
    pub fn mark_dirty(&mut self) {
        if let PageContent::File(file) = &mut self.content {
            file.mark_dirty();
        }
    }

    pub(crate) fn set_frame(&mut self, frame: Option<FrameId>) {
        self.frame = frame;
    }

    /// Fills `frame` with the page's content. The page must already be
    /// linked to that frame.
    pub(crate) fn swap_in(&mut self, frame: &mut [u8], io: PageIo<'_>) -> VmResult<()> {
        if self.frame.is_none() {
            return Err(VmError::NotResident(self.va));
        }

        if let PageContent::Uninit(uninit) = &self.content {
            // A failed loader leaves the page uninitialized for the next fault.
            let (concrete, loader) = uninit.clone().initialize();
            if let Some(loader) = loader {
                log::debug!("[vm] running lazy loader for {}", self.va);
                loader.load(self.va, frame)?;
                self.content = concrete;
                return Ok(());
            }
            self.content = concrete;
        }

        match &mut self.content {
            PageContent::Anon(anon) => anon.swap_in(frame, io.swap),
            PageContent::File(file) => file.swap_in(frame),
            // initialize() never yields an uninit page
            PageContent::Uninit(_) => Ok(()),
        }
    }

    /// Removes the hardware mapping and saves the frame's content to the
    /// backing store. A page without a frame is left untouched.
    ///
    /// The mapping goes first so no store can land in the frame after its
    /// bytes were saved. If saving fails the mapping is put back.
    pub(crate) fn swap_out(&mut self, frame: &[u8], io: PageIo<'_>) -> VmResult<()> {
        if self.frame.is_none() {
            return Ok(());
        }

        let va = self.va;
        let mapped = io.mmu.probe(va);
        let hw_dirty = io.mmu.is_dirty(va);
        io.mmu.unmap(va);

        let saved = match &mut self.content {
            PageContent::Anon(anon) => anon.swap_out(frame, io.swap),
            PageContent::File(file) if file.is_marked_dirty() || hw_dirty => {
                file.write_back(frame).map(|()| file.clear_dirty())
            }
            _ => Ok(()),
        };

        if let Err(err) = saved {
            if let Some(pa) = mapped {
                if io.mmu.map(va, pa, self.writable) {
                    io.mmu.set_dirty(va, hw_dirty);
                } else {
                    log::warn!("[vm] could not restore mapping of {}", va);
                }
            }
            return Err(err);
        }
        Ok(())
    }

    /// Writes a modified file-backed page back to its file and clears both
    /// dirty flags. Returns whether anything was written.
    pub(crate) fn write_back(&mut self, frame: &[u8], io: PageIo<'_>) -> VmResult<bool> {
        let va = self.va;
        let PageContent::File(file) = &mut self.content else {
            return Ok(false);
        };
        if !file.is_marked_dirty() && !io.mmu.is_dirty(va) {
            return Ok(false);
        }

        file.write_back(frame)?;
        file.clear_dirty();
        io.mmu.set_dirty(va, false);
        Ok(true)
    }

    /// Releases the backing-store resources owned by the page. The frame, if
    /// any, is released separately by the frame table.
    pub(crate) fn destroy(&mut self, io: PageIo<'_>) {
        if let PageContent::Anon(anon) = &mut self.content {
            anon.destroy(io.swap);
        }
    }

    /// Builds the child's copy of this page. `frame` is the page's current
    /// content when it is resident.
    ///
    /// Dirty file-backed content is written back first so the child reads
    /// the parent's latest bytes from the file.
    pub(crate) fn duplicate(&mut self, frame: Option<&[u8]>, io: PageIo<'_>) -> VmResult<Page> {
        if let Some(bytes) = frame {
            self.write_back(bytes, io)?;
        }

        let content = match &self.content {
            PageContent::Uninit(uninit) => PageContent::Uninit(uninit.clone()),
            PageContent::Anon(anon) => PageContent::Anon(anon.duplicate(frame, io.swap)?),
            PageContent::File(file) => PageContent::File(FilePage::new(file.mapping().clone())),
        };

        Ok(Page {
            va: self.va,
            writable: self.writable,
            frame: None,
            content,
        })
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("va", &self.va)
            .field("writable", &self.writable)
            .field("frame", &self.frame)
            .field("content", &self.content)
            .finish()
    }
}

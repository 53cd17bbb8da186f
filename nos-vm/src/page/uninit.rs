//! Lazily initialized pages
//!
//! An uninitialized page records what it will become and, optionally, a
//! loader that fills its first frame. Nothing is read or allocated until the
//! first fault; at that point the page turns into its target kind and the
//! loader runs exactly once.

use alloc::sync::Arc;
use core::fmt;

use nos_api::{FileHandle, VirtAddr};

use super::anon::AnonPage;
use super::file::{FileMapping, FilePage};
use super::{PageContent, PageKind};
use crate::error::{VmError, VmResult};

/// Fills a freshly claimed frame with a page's initial content.
///
/// `frame` is zeroed and exactly one page long.
pub trait LazyLoader: Send + Sync {
    fn load(&self, va: VirtAddr, frame: &mut [u8]) -> VmResult<()>;
}

/// Kind an uninitialized page turns into on first fault
#[derive(Debug, Clone)]
pub enum InitTarget {
    Anon,
    File(FileMapping),
}

impl InitTarget {
    pub fn kind(&self) -> PageKind {
        match self {
            InitTarget::Anon => PageKind::Anon,
            InitTarget::File(_) => PageKind::File,
        }
    }
}

/// Content source of a page that has not been touched yet
#[derive(Clone)]
pub struct UninitPage {
    target: InitTarget,
    loader: Option<Arc<dyn LazyLoader>>,
}

impl UninitPage {
    pub fn new(target: InitTarget, loader: Option<Arc<dyn LazyLoader>>) -> Self {
        Self { target, loader }
    }

    /// What the page becomes
    pub fn target(&self) -> &InitTarget {
        &self.target
    }

    /// Whether a custom loader will fill the first frame
    pub fn has_loader(&self) -> bool {
        self.loader.is_some()
    }

    /// Consumes the descriptor, yielding the concrete content and the loader
    /// that must run against the frame.
    pub(crate) fn initialize(self) -> (PageContent, Option<Arc<dyn LazyLoader>>) {
        let content = match self.target {
            InitTarget::Anon => PageContent::Anon(AnonPage::new()),
            InitTarget::File(mapping) => PageContent::File(FilePage::new(mapping)),
        };
        (content, self.loader)
    }
}

impl fmt::Debug for UninitPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UninitPage")
            .field("target", &self.target)
            .field("has_loader", &self.has_loader())
            .finish()
    }
}

/// Loads one page of an executable segment: `read_bytes` from the file at
/// `offset`, followed by zeroes.
pub struct SegmentLoader {
    file: FileHandle,
    offset: usize,
    read_bytes: usize,
}

impl SegmentLoader {
    pub fn new(file: FileHandle, offset: usize, read_bytes: usize) -> Self {
        Self {
            file,
            offset,
            read_bytes,
        }
    }

    pub fn read_bytes(&self) -> usize {
        self.read_bytes
    }
}

impl LazyLoader for SegmentLoader {
    fn load(&self, va: VirtAddr, frame: &mut [u8]) -> VmResult<()> {
        let want = self.read_bytes.min(frame.len());
        let got = self.file.read_at(self.offset, &mut frame[..want])?;
        if got != want {
            log::warn!(
                "[vm] segment page {} short read: {} of {} bytes at offset {:#x}",
                va,
                got,
                want,
                self.offset
            );
            return Err(VmError::Io(nos_api::error::io_error("short segment read")));
        }
        frame[want..].fill(0);
        Ok(())
    }
}

//! File-backed pages
//!
//! A file-backed page mirrors `length` bytes of a file starting at `offset`;
//! the rest of the page reads as zeroes. Eviction writes the bytes back to
//! the file only when the page was modified, then drops the frame. The next
//! fault simply reads the file again.

use core::fmt;

use nos_api::{FileHandle, PAGE_SIZE};

use crate::error::VmResult;

/// Where a file-backed page gets its bytes from
#[derive(Clone)]
pub struct FileMapping {
    /// Backing file
    pub file: FileHandle,
    /// Offset of the page's first byte in the file
    pub offset: usize,
    /// Bytes taken from the file; the remainder of the page is zero
    pub length: usize,
}

impl FileMapping {
    /// Creates a mapping of `length` bytes at `offset` (clamped to a page)
    pub fn new(file: FileHandle, offset: usize, length: usize) -> Self {
        Self {
            file,
            offset,
            length: length.min(PAGE_SIZE),
        }
    }
}

impl fmt::Debug for FileMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileMapping")
            .field("offset", &self.offset)
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

/// Content source of a file-backed page
#[derive(Debug)]
pub struct FilePage {
    mapping: FileMapping,
    /// Set by the kernel when it writes through the page itself
    dirty: bool,
}

impl FilePage {
    /// Creates a clean file-backed page
    pub fn new(mapping: FileMapping) -> Self {
        Self {
            mapping,
            dirty: false,
        }
    }

    /// Backing file region
    pub fn mapping(&self) -> &FileMapping {
        &self.mapping
    }

    /// Software dirty flag (the hardware bit is tracked by the MMU)
    pub fn is_marked_dirty(&self) -> bool {
        self.dirty
    }

    /// Marks the page as modified
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub(crate) fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    pub(crate) fn swap_in(&self, frame: &mut [u8]) -> VmResult<()> {
        let len = self.mapping.length;
        let read = self
            .mapping
            .file
            .read_at(self.mapping.offset, &mut frame[..len])?;
        frame[read.min(len)..].fill(0);
        Ok(())
    }

    pub(crate) fn write_back(&self, frame: &[u8]) -> VmResult<()> {
        let len = self.mapping.length;
        let written = self.mapping.file.write_at(self.mapping.offset, &frame[..len])?;
        if written != len {
            log::warn!(
                "[vm] short write-back at file offset {:#x}: {} of {} bytes",
                self.mapping.offset,
                written,
                len
            );
        }
        Ok(())
    }
}

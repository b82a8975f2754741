//! Placement of files on data pages.
//!
//! New files are bump-allocated at the frontier, the page past the highest span handed out.
//! Only when the frontier runs into the end of the device does the allocator fall back to a
//! first-fit scan of the bitmap below the frontier. Freeing the span that ends at the frontier
//! pulls the frontier back; holes anywhere else are only found again by the scan.

use crate::bitmap::PageBitmap;
use crate::config::Geometry;
use crate::error::{FsError, Result};
use crate::PageDevice;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageAllocator {
    frontier: u16,
    free_pages: u16,
}

impl PageAllocator {
    /// Allocator state of a freshly erased filesystem.
    pub fn empty(geometry: &Geometry) -> Self {
        Self {
            frontier: geometry.data_start(),
            free_pages: geometry.data_pages(),
        }
    }

    /// Rebuilds the allocator from the bitmap and the number of pages used by live files.
    pub fn recover<D: PageDevice + ?Sized>(
        bitmap: &mut PageBitmap<'_, D>,
        geometry: &Geometry,
        used_pages: u32,
    ) -> Result<Self> {
        let frontier = match bitmap.last_allocated()? {
            Some(page) => (page + 1).max(geometry.data_start()),
            None => geometry.data_start(),
        };
        let free_pages = (geometry.data_pages() as u32).saturating_sub(used_pages) as u16;
        Ok(Self { frontier, free_pages })
    }

    pub fn frontier(&self) -> u16 {
        self.frontier
    }

    pub fn free_pages(&self) -> u16 {
        self.free_pages
    }

    /// Finds room for `len` contiguous pages and marks them allocated.
    /// Returns the first page of the span. Nothing changes on failure.
    pub fn allocate<D: PageDevice + ?Sized>(
        &mut self,
        bitmap: &mut PageBitmap<'_, D>,
        geometry: &Geometry,
        len: u16,
    ) -> Result<u16> {
        if len == 0 {
            return Err(FsError::EmptyFile);
        }

        let start = if self.frontier as u32 + len as u32 <= geometry.page_count as u32 {
            log::trace!("fast allocation of {} pages at {}", len, self.frontier);
            self.frontier
        } else if self.free_pages >= len {
            // Everything at or past the frontier is known to be free but too short,
            // so only the region below it is scanned.
            let found = bitmap.find_free_run(geometry.data_start(), self.frontier, len)?;
            log::trace!("slow allocation of {} pages: {:?}", len, found);
            found.ok_or(FsError::OutOfSpace)?
        } else {
            return Err(FsError::OutOfSpace);
        };

        bitmap.set_range(start, len, true)?;
        if start == self.frontier {
            self.frontier += len;
        }
        self.free_pages -= len;
        Ok(start)
    }

    /// Frees the span [start, start + len).
    pub fn release<D: PageDevice + ?Sized>(
        &mut self,
        bitmap: &mut PageBitmap<'_, D>,
        start: u16,
        len: u16,
    ) -> Result<()> {
        bitmap.set_range(start, len, false)?;
        if start as u32 + len as u32 == self.frontier as u32 {
            self.frontier -= len;
        }
        self.free_pages = self.free_pages.saturating_add(len);
        Ok(())
    }
}

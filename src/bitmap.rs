//! Management of the page allocation bitmap.
//! One bit per EFS page, header and bitmap pages included. A set bit means the page is allocated.
//! The bitmap lives on the device; `PageBitmap` keeps a single bitmap page in memory at a time.

use crate::config::*;
use crate::storage::{read_span, write_span};
use crate::{PageDevice, Result};

pub struct PageBitmap<'a, D: PageDevice + ?Sized> {
    device: &'a D,
    geometry: &'a Geometry,
    buf: Vec<u8>,
    loaded: Option<u16>, // Bitmap page currently held in `buf`
}

impl<'a, D: PageDevice + ?Sized> PageBitmap<'a, D> {
    pub fn new(device: &'a D, geometry: &'a Geometry) -> Self {
        Self {
            device,
            geometry,
            buf: vec![0u8; geometry.page_size as usize],
            loaded: None,
        }
    }

    fn bits_per_page(&self) -> u32 {
        self.geometry.page_size as u32 * 8
    }

    /// Splits a page index into (bitmap page, byte in that page, bit in that byte).
    fn locate(&self, page: u32) -> (u16, usize, u32) {
        let bitmap_page = page / self.bits_per_page();
        let byte = (page % self.bits_per_page()) / 8;
        (bitmap_page as u16, byte as usize, page % 8)
    }

    fn address_of(&self, bitmap_page: u16) -> u32 {
        self.geometry.page_address(self.geometry.header_pages + bitmap_page)
    }

    fn load(&mut self, bitmap_page: u16) -> Result<()> {
        if self.loaded != Some(bitmap_page) {
            // Drop the stale copy first so a failed read never leaves it marked as loaded.
            self.loaded = None;
            read_span(self.device, self.address_of(bitmap_page), &mut self.buf, 0)?;
            self.loaded = Some(bitmap_page);
        }
        Ok(())
    }

    fn store(&mut self, bitmap_page: u16) -> Result<()> {
        write_span(self.device, self.address_of(bitmap_page), &self.buf)?;
        Ok(())
    }

    /// Sets or clears the bits of pages [from, to) in the loaded bitmap page.
    fn apply(&mut self, from: u32, to: u32, allocated: bool) {
        let mut page = from;
        while page < to {
            let (_, byte, bit) = self.locate(page);
            if bit == 0 && page + 8 <= to {
                self.buf[byte] = if allocated { 0xFF } else { 0x00 };
                page += 8;
                continue;
            }
            if allocated {
                self.buf[byte] |= 1 << bit;
            } else {
                self.buf[byte] &= !(1 << bit);
            }
            page += 1;
        }
    }

    #[cfg(test)]
    pub fn is_allocated(&mut self, page: u16) -> Result<bool> {
        let (bitmap_page, byte, bit) = self.locate(page as u32);
        self.load(bitmap_page)?;
        Ok(self.buf[byte] & (1 << bit) != 0)
    }

    /// Returns the first page in [from, end) whose bit equals `allocated`, or `end`.
    fn find_next(&mut self, from: u32, end: u32, allocated: bool) -> Result<u32> {
        // A byte with this value holds no page we are looking for.
        let skip = if allocated { 0x00 } else { 0xFF };
        let mut page = from;

        while page < end {
            let (bitmap_page, byte, bit) = self.locate(page);
            self.load(bitmap_page)?;
            let value = self.buf[byte];
            if bit == 0 && value == skip {
                page += 8;
                continue;
            }
            if (value & (1 << bit) != 0) == allocated {
                return Ok(page);
            }
            page += 1;
        }

        Ok(end)
    }

    /// Leftmost free page in [from, end), or `end`.
    pub fn find_next_free(&mut self, from: u16, end: u16) -> Result<u16> {
        Ok(self.find_next(from as u32, end as u32, false)? as u16)
    }

    /// Leftmost allocated page in [from, end), or `end`.
    pub fn find_next_allocated(&mut self, from: u16, end: u16) -> Result<u16> {
        Ok(self.find_next(from as u32, end as u32, true)? as u16)
    }

    /// First fit for `len` contiguous free pages inside [begin, end).
    /// After a failed window the search resumes at the allocated page that broke it.
    pub fn find_free_run(&mut self, begin: u16, end: u16, len: u16) -> Result<Option<u16>> {
        let mut itr = begin;

        while itr < end {
            // Skip allocated pages.
            itr = self.find_next_free(itr, end)?;
            if itr as u32 + len as u32 > end as u32 {
                return Ok(None);
            }

            let conflict = self.find_next_allocated(itr, itr + len)?;
            if conflict == itr + len {
                return Ok(Some(itr));
            }
            itr = conflict;
        }

        Ok(None)
    }

    /// Highest allocated page of the whole region.
    pub fn last_allocated(&mut self) -> Result<Option<u16>> {
        let mut page = self.geometry.page_count as i64 - 1;

        while page >= 0 {
            let (bitmap_page, byte, bit) = self.locate(page as u32);
            self.load(bitmap_page)?;
            let value = self.buf[byte];
            if bit == 7 && value == 0x00 {
                page -= 8;
                continue;
            }
            if value & (1 << bit) != 0 {
                return Ok(Some(page as u16));
            }
            page -= 1;
        }

        Ok(None)
    }

    /// Marks `len` pages from `start` as allocated or free, writing each touched bitmap page once.
    pub fn set_range(&mut self, start: u16, len: u16, allocated: bool) -> Result<()> {
        let end = start as u32 + len as u32;
        let mut page = start as u32;

        while page < end {
            let (bitmap_page, _, _) = self.locate(page);
            let page_end = end.min((bitmap_page as u32 + 1) * self.bits_per_page());
            self.load(bitmap_page)?;
            self.apply(page, page_end, allocated);
            self.store(bitmap_page)?;
            page = page_end;
        }

        Ok(())
    }

    /// Rewrites the whole bitmap: everything free except the header and bitmap pages.
    pub fn format(&mut self) -> Result<()> {
        let reserved = self.geometry.data_start() as u32;

        for bitmap_page in 0..self.geometry.bitmap_pages() {
            let first = bitmap_page as u32 * self.bits_per_page();
            self.buf.fill(0);
            self.loaded = Some(bitmap_page);
            if first < reserved {
                let last = reserved.min(first + self.bits_per_page());
                self.apply(first, last, true);
            }
            self.store(bitmap_page)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RamDevice;

    fn device() -> RamDevice {
        RamDevice::new(64 * 1024, 256)
    }

    #[test]
    fn format_reserves_metadata_pages() {
        let dev = device();
        let geo = Geometry::DEFAULT;
        let mut bitmap = PageBitmap::new(&dev, &geo);
        bitmap.format().unwrap();

        assert!(bitmap.is_allocated(0).unwrap());
        assert!(bitmap.is_allocated(1).unwrap());
        assert!(!bitmap.is_allocated(2).unwrap());
        assert_eq!(bitmap.last_allocated().unwrap(), Some(1));
        assert_eq!(bitmap.find_next_free(0, 256).unwrap(), 2);
    }

    #[test]
    fn set_range_across_bytes() {
        let dev = device();
        let geo = Geometry::DEFAULT;
        let mut bitmap = PageBitmap::new(&dev, &geo);
        bitmap.format().unwrap();

        bitmap.set_range(5, 20, true).unwrap();
        assert!(!bitmap.is_allocated(4).unwrap());
        assert!(bitmap.is_allocated(5).unwrap());
        assert!(bitmap.is_allocated(24).unwrap());
        assert!(!bitmap.is_allocated(25).unwrap());
        assert_eq!(bitmap.last_allocated().unwrap(), Some(24));

        bitmap.set_range(8, 8, false).unwrap();
        assert_eq!(bitmap.find_next_free(5, 256).unwrap(), 8);
        assert_eq!(bitmap.find_next_allocated(8, 256).unwrap(), 16);
    }

    #[test]
    fn free_run_restarts_at_conflict() {
        let dev = device();
        let geo = Geometry::DEFAULT;
        let mut bitmap = PageBitmap::new(&dev, &geo);
        bitmap.format().unwrap();

        // Layout from page 2: free x3, used, free x2, used, free x4.
        bitmap.set_range(5, 1, true).unwrap();
        bitmap.set_range(8, 1, true).unwrap();
        bitmap.set_range(13, 243, true).unwrap();

        assert_eq!(bitmap.find_free_run(2, 256, 3).unwrap(), Some(2));
        assert_eq!(bitmap.find_free_run(2, 256, 4).unwrap(), Some(9));
        assert_eq!(bitmap.find_free_run(2, 256, 5).unwrap(), None);
        assert_eq!(bitmap.find_free_run(2, 12, 4).unwrap(), None);
    }

    #[test]
    fn pages_after_first_bitmap_page() {
        let dev = RamDevice::new(64 * 1024, 64);
        // 16-byte pages: one bitmap page covers 128 pages, so 4096 pages need 32 of them.
        let geo = Geometry { page_size: 16, page_count: 4096, base_address: 0, header_pages: 1 };
        assert_eq!(geo.bitmap_pages(), 32);
        let mut bitmap = PageBitmap::new(&dev, &geo);
        bitmap.format().unwrap();

        assert_eq!(bitmap.find_next_free(0, 4096).unwrap(), geo.data_start());
        bitmap.set_range(120, 20, true).unwrap();
        assert!(bitmap.is_allocated(127).unwrap());
        assert!(bitmap.is_allocated(128).unwrap());
        assert!(bitmap.is_allocated(139).unwrap());
        assert_eq!(bitmap.last_allocated().unwrap(), Some(139));
    }
}

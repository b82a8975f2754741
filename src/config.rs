use crate::{Error, Result};

pub const MAGIC: [u8; 3] = *b"EFS";
pub const VERSION: u8 = 0;

pub const HEADER_SIZE: usize = 16; // Filesystem header at the front of header page 0
pub const RECORD_SIZE: usize = 6; // id + attr + start + length
pub const MAX_FILE_IDS: usize = 256; // One ownership bit per possible id

/// Number of file records kept for external (host) callers.
/// At least 1 so programming a file from the host does not rescan the directory per packet.
pub const EXTERNAL_CACHE_SIZE: usize = 2;

/// A handle read gives the bus back after this many bytes so other bus users are not starved.
/// 0 disables the chunking.
pub const READ_YIELD_BYTES: usize = 64;

/// Layout of the EFS region on the storage device.
/// The header written at format time must match this exactly, otherwise `init` erases the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub page_size: u16,    // Bytes per EFS page
    pub page_count: u16,   // Total EFS pages, header and bitmap pages included
    pub base_address: u32, // Device address of EFS page 0
    pub header_pages: u16, // Pages holding the header and the directory
}

impl Geometry {
    pub const DEFAULT: Self = Self {
        page_size: 256,
        page_count: 256,
        base_address: 0,
        header_pages: 1,
    };

    /// Pages holding the allocation bitmap, one bit per EFS page.
    pub const fn bitmap_pages(&self) -> u16 {
        let bits_per_page = self.page_size as u32 * 8;
        (1 + (self.page_count as u32 - 1) / bits_per_page) as u16
    }

    /// First page that can hold file data.
    pub const fn data_start(&self) -> u16 {
        self.header_pages + self.bitmap_pages()
    }

    pub const fn data_pages(&self) -> u16 {
        self.page_count - self.data_start()
    }

    /// Directory slots available in a header page; page 0 shares its space with the header.
    pub const fn records_in_page(&self, header_page: u16) -> usize {
        if header_page == 0 {
            (self.page_size as usize - HEADER_SIZE) / RECORD_SIZE
        } else {
            self.page_size as usize / RECORD_SIZE
        }
    }

    /// Byte offset of the first record slot in a header page.
    pub const fn records_offset(&self, header_page: u16) -> usize {
        if header_page == 0 { HEADER_SIZE } else { 0 }
    }

    pub const fn max_files(&self) -> u16 {
        if self.header_pages == 0 {
            return 0;
        }
        (self.records_in_page(0) + (self.header_pages as usize - 1) * self.records_in_page(1)) as u16
    }

    /// Device address of an EFS page.
    pub const fn page_address(&self, page: u16) -> u32 {
        self.base_address + page as u32 * self.page_size as u32
    }

    /// Bytes covered by the whole EFS region.
    pub const fn region_len(&self) -> u32 {
        self.page_count as u32 * self.page_size as u32
    }

    /// Checks the geometry against a device of `device_size` bytes.
    pub fn validate(&self, device_size: u32) -> Result<()> {
        if self.header_pages == 0 || self.page_count == 0 {
            return Err(Error::InvalidGeometry);
        }
        if (self.page_size as usize) < HEADER_SIZE + RECORD_SIZE {
            return Err(Error::InvalidGeometry);
        }
        if self.data_start() >= self.page_count {
            return Err(Error::InvalidGeometry);
        }
        let end = self.base_address as u64 + self.region_len() as u64;
        if end > device_size as u64 {
            return Err(Error::InvalidGeometry);
        }
        Ok(())
    }
}

impl Default for Geometry {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout() {
        let geo = Geometry::DEFAULT;
        assert_eq!(geo.bitmap_pages(), 1);
        assert_eq!(geo.data_start(), 2);
        assert_eq!(geo.data_pages(), 254);
        assert_eq!(geo.max_files(), 40);
        assert!(geo.validate(64 * 1024).is_ok());
    }

    #[test]
    fn extra_header_pages_hold_full_pages_of_records() {
        let geo = Geometry { header_pages: 3, ..Geometry::DEFAULT };
        assert_eq!(geo.max_files(), 40 + 2 * 42);
        assert_eq!(geo.data_start(), 4);
    }

    #[test]
    fn rejects_region_past_device_end() {
        let geo = Geometry { base_address: 1024, ..Geometry::DEFAULT };
        assert_eq!(geo.validate(64 * 1024), Err(Error::InvalidGeometry));
        assert!(geo.validate(65 * 1024).is_ok());
    }
}

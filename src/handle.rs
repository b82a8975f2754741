//! Exclusive access to the contents of one file.

use crate::config::READ_YIELD_BYTES;
use crate::bitmap::PageBitmap;
use crate::directory::{dir_lookup, dir_remove};
use crate::file_cache::CacheKey;
use crate::fs::{Efs, FsState};
use crate::storage::{read_span, write_span};
use crate::{Attributes, Error, FileId, FileRecord, PageDevice, Result, Tier};

/// What closing a handle gives back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Release {
    /// The handle owns the file itself.
    Ownership,
    /// The file is owned by a file cache that lent out this handle.
    ReturnToCache(CacheKey),
}

/// An open file. At most one valid handle exists per file id.
///
/// The handle closes itself when dropped. It can be moved but not copied.
pub struct Handle<D: PageDevice> {
    fs: Efs<D>,
    record: FileRecord,
    tier: Tier,
    open: bool,
    release: Release,
}

impl<D: PageDevice> Handle<D> {
    pub(crate) fn new(fs: Efs<D>, record: FileRecord, tier: Tier, release: Release) -> Self {
        Self { fs, record, tier, open: true, release }
    }

    pub(crate) fn invalid(fs: Efs<D>, tier: Tier) -> Self {
        Self {
            fs,
            record: FileRecord::ERASED,
            tier,
            open: false,
            release: Release::Ownership,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.open
    }

    pub fn can_read(&self) -> bool {
        self.open && self.tier.can_read(self.record.attr)
    }

    pub fn can_write(&self) -> bool {
        self.open && self.tier.can_write(self.record.attr)
    }

    pub fn can_delete(&self) -> bool {
        self.open && self.tier.can_delete(self.record.attr)
    }

    pub fn id(&self) -> FileId {
        self.record.id
    }

    pub fn attributes(&self) -> Attributes {
        self.record.attr
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    /// Pages spanned by the file.
    pub fn page_length(&self) -> u16 {
        self.record.length
    }

    /// Size of the file in bytes.
    pub fn size(&self) -> u32 {
        self.record.length as u32 * self.fs.geometry().page_size as u32
    }

    pub fn record(&self) -> &FileRecord {
        &self.record
    }

    /// Device address and length of the part of [offset, offset + len) inside the file.
    fn span(&self, offset: u32, len: usize) -> Option<(u32, usize)> {
        let size = self.size();
        if offset >= size || len == 0 {
            return None;
        }
        let len = len.min((size - offset) as usize);
        let address = self.fs.geometry().page_address(self.record.start) + offset;
        Some((address, len))
    }

    /// Reads from `offset` into `buf`, stopping at the end of the file.
    /// Returns the number of bytes read, 0 when `offset` is past the end.
    pub fn read(&self, offset: u32, buf: &mut [u8]) -> Result<usize> {
        if !self.open {
            return Err(Error::InvalidHandle);
        }
        if !self.can_read() {
            return Err(Error::PermissionDenied);
        }
        let Some((address, len)) = self.span(offset, buf.len()) else {
            return Ok(0);
        };
        // Bus is released every READ_YIELD_BYTES bytes.
        read_span(&*self.fs.shared.device, address, &mut buf[..len], READ_YIELD_BYTES)
    }

    /// Writes `data` at `offset`, stopping at the end of the file.
    /// Returns the number of bytes written, 0 when `offset` is past the end.
    pub fn write(&self, offset: u32, data: &[u8]) -> Result<usize> {
        if !self.open {
            return Err(Error::InvalidHandle);
        }
        if !self.can_write() {
            return Err(Error::PermissionDenied);
        }
        let Some((address, len)) = self.span(offset, data.len()) else {
            return Ok(0);
        };
        write_span(&*self.fs.shared.device, address, &data[..len])
    }

    /// Deletes the file and closes the handle.
    /// On error the handle stays open and the file may be partially removed.
    pub fn delete(&mut self) -> Result<()> {
        if !self.open {
            return Err(Error::InvalidHandle);
        }
        if !self.can_delete() {
            return Err(Error::PermissionDenied);
        }

        let fs = self.fs.clone();
        let mut state = fs.lock();
        let device = &*fs.shared.device;
        let geometry = fs.geometry();
        let id = self.record.id;

        // Record goes before the pages: an interrupted delete may only leak pages.
        if let Some((slot, record)) = dir_lookup(device, geometry, id)? {
            dir_remove(device, geometry, slot, &record)?;
        }
        let mut bitmap = PageBitmap::new(device, geometry);
        state.allocator.release(&mut bitmap, self.record.start, self.record.length)?;
        state.free_files += 1;

        self.release_locked(&mut state);
        state.forget_file(id);
        drop(state);
        fs.notify();

        log::debug!("deleted file {:#04x}", id.0);
        Ok(())
    }

    /// Gives up the handle. Closing twice is a no-op.
    pub fn close(&mut self) {
        if !self.open {
            return;
        }
        let fs = self.fs.clone();
        let mut state = fs.lock();
        self.release_locked(&mut state);
        drop(state);
        fs.notify();
    }

    fn release_locked(&mut self, state: &mut FsState) {
        let id = self.record.id;
        match self.release {
            Release::Ownership => state.owned.release(id),
            Release::ReturnToCache(key) => {
                // The lending cache is gone, so the ownership it held dies with this handle.
                if !state.caches.return_handle(key) {
                    state.owned.release(id);
                }
            }
        }
        self.open = false;
        log::trace!("closed file {:#04x}", id.0);
    }
}

impl<D: PageDevice> Drop for Handle<D> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<D: PageDevice> core::fmt::Debug for Handle<D> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Handle")
            .field("record", &self.record)
            .field("tier", &self.tier)
            .field("open", &self.open)
            .finish()
    }
}

//! Interface to the raw storage driver.
//! EFS never talks to hardware itself: the driver provides byte-addressed reads, page-atomic writes
//! and the bus lock that serializes every transfer on the shared bus.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::FsError;
use crate::Result;

pub trait PageDevice: Send + Sync {
    /// Returns the size of the device in bytes.
    fn size(&self) -> u32;

    /// Returns the size of a physical page, the unit the device commits atomically.
    fn page_size(&self) -> usize;

    /// Reads `buf.len()` bytes starting at `address`.
    /// Called with the bus lock held.
    fn read(&self, address: u32, buf: &mut [u8]) -> Result<()>;

    /// Writes `buf` starting at `address`.
    /// The range never crosses a physical page boundary.
    /// Called with the bus lock held.
    fn write_page(&self, address: u32, buf: &[u8]) -> Result<()>;

    /// The lock arbitrating the bus this device sits on.
    fn bus(&self) -> &BusLock;
}

/// Bus arbitration lock owned by the storage driver.
#[derive(Debug, Default)]
pub struct BusLock {
    inner: Mutex<()>,
}

/// Holds the bus until dropped.
pub struct BusGuard<'a> {
    _guard: MutexGuard<'a, ()>,
}

impl BusLock {
    pub const fn new() -> Self {
        Self { inner: Mutex::new(()) }
    }

    pub fn lock(&self) -> BusGuard<'_> {
        BusGuard {
            _guard: self.inner.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }
}

/// Reads a byte range under the bus lock.
/// With a non-zero `yield_bytes` the bus is released and taken again after every chunk of that size.
pub(crate) fn read_span<D: PageDevice + ?Sized>(
    device: &D,
    address: u32,
    buf: &mut [u8],
    yield_bytes: usize,
) -> Result<usize> {
    let chunk_len = if yield_bytes == 0 { buf.len().max(1) } else { yield_bytes };
    let mut done = 0;
    for chunk in buf.chunks_mut(chunk_len) {
        let _bus = device.bus().lock();
        device.read(address + done as u32, chunk)?;
        done += chunk.len();
    }
    Ok(done)
}

/// Writes a byte range, issuing one device write per physical page touched.
/// The first chunk runs up to the next page boundary, middle chunks are whole pages.
pub(crate) fn write_span<D: PageDevice + ?Sized>(device: &D, address: u32, data: &[u8]) -> Result<usize> {
    let page_size = device.page_size() as u32;
    let mut written = 0;
    let mut current_address = address;

    while written < data.len() {
        let room_on_page = (page_size - current_address % page_size) as usize;
        let bytes_to_write = room_on_page.min(data.len() - written);
        {
            let _bus = device.bus().lock();
            device.write_page(current_address, &data[written..written + bytes_to_write])?;
        }
        log::trace!("wrote {} bytes at {:#x}", bytes_to_write, current_address);
        written += bytes_to_write;
        current_address += bytes_to_write as u32;
    }

    Ok(written)
}

/// Volatile device backed by memory, erased to 0xFF like an EEPROM.
pub struct RamDevice {
    inner: Mutex<Vec<u8>>,
    page_size: usize,
    page_writes: AtomicUsize,
    bus: BusLock,
}

impl RamDevice {
    /// Creates a device of `size` bytes with physical pages of `page_size` bytes.
    pub fn new(size: usize, page_size: usize) -> Self {
        RamDevice {
            inner: Mutex::new(vec![0xFF; size]),
            page_size,
            page_writes: AtomicUsize::new(0),
            bus: BusLock::new(),
        }
    }

    /// Number of `write_page` calls served so far.
    pub fn page_writes(&self) -> usize {
        self.page_writes.load(Ordering::Relaxed)
    }

    /// Copy of the raw device contents.
    pub fn snapshot(&self) -> Vec<u8> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn range(&self, address: u32, len: usize) -> Result<core::ops::Range<usize>> {
        let start = address as usize;
        let end = start.checked_add(len).ok_or(FsError::OutOfBounds)?;
        let size = self.inner.lock().unwrap_or_else(PoisonError::into_inner).len();
        if end > size {
            return Err(FsError::OutOfBounds);
        }
        Ok(start..end)
    }
}

impl PageDevice for RamDevice {
    fn size(&self) -> u32 {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len() as u32
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn read(&self, address: u32, buf: &mut [u8]) -> Result<()> {
        let range = self.range(address, buf.len())?;
        let data = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        buf.copy_from_slice(&data[range]);
        Ok(())
    }

    fn write_page(&self, address: u32, buf: &[u8]) -> Result<()> {
        let range = self.range(address, buf.len())?;
        if !buf.is_empty() && range.start / self.page_size != (range.end - 1) / self.page_size {
            return Err(FsError::OutOfBounds);
        }
        let mut data = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        data[range].copy_from_slice(buf);
        self.page_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn bus(&self) -> &BusLock {
        &self.bus
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_span_splits_on_physical_pages() {
        let dev = RamDevice::new(1024, 64);
        let data = [0xA5u8; 150];
        assert_eq!(write_span(&dev, 60, &data).unwrap(), 150);
        // 4 bytes to the boundary, 64 + 64, then 18 bytes.
        assert_eq!(dev.page_writes(), 4);

        let mut back = [0u8; 150];
        assert_eq!(read_span(&dev, 60, &mut back, 7).unwrap(), 150);
        assert_eq!(back, data);
    }

    #[test]
    fn ram_device_rejects_page_crossing_write() {
        let dev = RamDevice::new(256, 64);
        assert_eq!(dev.write_page(60, &[0; 8]), Err(FsError::OutOfBounds));
        assert_eq!(dev.read(250, &mut [0; 8]), Err(FsError::OutOfBounds));
    }
}

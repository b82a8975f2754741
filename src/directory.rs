//! The directory: a fixed table of file records packed into the header pages.
//! Header page 0 starts with the filesystem header, so it holds fewer records than the others.

use core::ops::ControlFlow;

use crate::config::*;
use crate::error::{FsError, Result};
use crate::storage::{read_span, write_span};
use crate::structs::*;
use crate::PageDevice;

/// Location of a record in the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub header_page: u16,
    pub index: usize, // Record index within the header page
}

impl Slot {
    pub fn address(&self, geometry: &Geometry) -> u32 {
        geometry.page_address(self.header_page)
            + (geometry.records_offset(self.header_page) + self.index * RECORD_SIZE) as u32
    }
}

/// Visits every slot in directory order, reading each header page once.
fn dir_scan<D, F>(device: &D, geometry: &Geometry, mut visit: F) -> Result<()>
where
    D: PageDevice + ?Sized,
    F: FnMut(Slot, FileRecord) -> ControlFlow<()>,
{
    let mut page_buf = vec![0u8; geometry.page_size as usize];

    for header_page in 0..geometry.header_pages {
        read_span(device, geometry.page_address(header_page), &mut page_buf, 0)?;
        let offset = geometry.records_offset(header_page);

        for index in 0..geometry.records_in_page(header_page) {
            let start = offset + index * RECORD_SIZE;
            let bytes: &[u8; RECORD_SIZE] = page_buf[start..start + RECORD_SIZE]
                .try_into()
                .map_err(|_| FsError::OutOfBounds)?;
            let record = FileRecord::from_bytes(bytes);
            if visit(Slot { header_page, index }, record).is_break() {
                return Ok(());
            }
        }
    }

    Ok(())
}

/// Finds the live record of `id`.
pub fn dir_lookup<D: PageDevice + ?Sized>(
    device: &D,
    geometry: &Geometry,
    id: FileId,
) -> Result<Option<(Slot, FileRecord)>> {
    let mut found = None;
    dir_scan(device, geometry, |slot, record| {
        if record.is_allocated() && record.id == id {
            found = Some((slot, record));
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    })?;
    Ok(found)
}

/// Finds the first free slot for a new file `id`.
/// The whole directory is scanned since `id` may live past the first free slot.
pub fn dir_free_slot<D: PageDevice + ?Sized>(device: &D, geometry: &Geometry, id: FileId) -> Result<Slot> {
    let mut free = None;
    let mut exists = false;
    dir_scan(device, geometry, |slot, record| {
        if record.is_allocated() {
            if record.id == id {
                exists = true;
                return ControlFlow::Break(());
            }
        } else if free.is_none() {
            free = Some(slot);
        }
        ControlFlow::Continue(())
    })?;

    if exists {
        return Err(FsError::AlreadyExists);
    }
    free.ok_or(FsError::DirectoryFull)
}

/// Counts live files and the pages they occupy.
pub fn dir_usage<D: PageDevice + ?Sized>(device: &D, geometry: &Geometry) -> Result<(u16, u32)> {
    let mut files = 0u16;
    let mut pages = 0u32;
    dir_scan(device, geometry, |_, record| {
        if record.is_allocated() {
            files += 1;
            pages += record.length as u32;
        }
        ControlFlow::Continue(())
    })?;
    Ok((files, pages))
}

pub fn dir_write<D: PageDevice + ?Sized>(
    device: &D,
    geometry: &Geometry,
    slot: Slot,
    record: &FileRecord,
) -> Result<()> {
    write_span(device, slot.address(geometry), &record.to_bytes())?;
    Ok(())
}

/// Tombstones the record in `slot`. Only the attribute byte is rewritten.
pub fn dir_remove<D: PageDevice + ?Sized>(
    device: &D,
    geometry: &Geometry,
    slot: Slot,
    record: &FileRecord,
) -> Result<()> {
    let attr = record.attr | Attributes::NOT_ALLOCATED;
    write_span(device, slot.address(geometry) + 1, &[attr.bits()])?;
    Ok(())
}

/// Rewrites every header page: a fresh header followed by erased (tombstoned) slots.
pub fn dir_format<D: PageDevice + ?Sized>(device: &D, geometry: &Geometry) -> Result<()> {
    let mut page_buf = vec![0xFFu8; geometry.page_size as usize];

    for header_page in 0..geometry.header_pages {
        if header_page == 0 {
            page_buf[..HEADER_SIZE].copy_from_slice(&Header::from_geometry(geometry).to_bytes());
        } else {
            page_buf[..HEADER_SIZE].fill(0xFF);
        }
        write_span(device, geometry.page_address(header_page), &page_buf)?;
    }

    Ok(())
}

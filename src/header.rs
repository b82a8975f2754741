use crate::config::*;
use crate::storage::read_span;
use crate::{Header, PageDevice, Result};

pub fn read_header<D: PageDevice + ?Sized>(device: &D, geometry: &Geometry) -> Result<Header> {
    let mut buf = [0u8; HEADER_SIZE];
    read_span(device, geometry.base_address, &mut buf, 0)?;
    Ok(Header::from_bytes(&buf))
}

/// Reads the header and reports whether it was formatted for `geometry`.
/// A blank device, another version or any geometry change is a mismatch.
pub fn header_matches<D: PageDevice + ?Sized>(device: &D, geometry: &Geometry) -> Result<bool> {
    let header = read_header(device, geometry)?;
    if !header.matches(geometry) {
        log::warn!(
            "EFS header mismatch (found {:?} v{}, {} pages of {} bytes at {:#x}, {} header pages)",
            header.identifier,
            header.version,
            header.page_count,
            header.page_size,
            header.base_address,
            header.header_pages,
        );
        return Ok(false);
    }
    Ok(true)
}

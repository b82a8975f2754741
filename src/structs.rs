use bitflags::bitflags;

use crate::config::*;

/// Kind encoded in the top 3 bits of a file identifier.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Lut = 0b011,
    User = 0b110,
}

impl TryFrom<u8> for FileKind {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0b011 => Ok(FileKind::Lut),
            0b110 => Ok(FileKind::User),
            other => Err(other),
        }
    }
}

/// One-byte file identifier: `(kind << 5) | seq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(pub u8);

impl FileId {
    pub const KIND_MASK: u8 = 0b1110_0000;
    pub const SEQ_MASK: u8 = 0b0001_1111;

    pub const fn new(kind: FileKind, seq: u8) -> Self {
        FileId(((kind as u8) << 5) | (seq & Self::SEQ_MASK))
    }

    /// Raw 3-bit kind field.
    pub const fn kind_bits(&self) -> u8 {
        (self.0 & Self::KIND_MASK) >> 5
    }

    pub fn kind(&self) -> Option<FileKind> {
        FileKind::try_from(self.kind_bits()).ok()
    }

    pub const fn seq(&self) -> u8 {
        self.0 & Self::SEQ_MASK
    }
}

impl From<u8> for FileId {
    fn from(raw: u8) -> Self {
        FileId(raw)
    }
}

impl From<FileId> for u8 {
    fn from(id: FileId) -> Self {
        id.0
    }
}

bitflags! {
    /// Permission bits of a file, fixed at creation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Attributes: u8 {
        const EXTERNAL_READ = 0b0000_0001;
        const EXTERNAL_WRITE = 0b0000_0010;
        const EXTERNAL_DELETE = 0b0000_0100;
        const FIRMWARE_READ = 0b0000_1000;
        const FIRMWARE_WRITE = 0b0001_0000;
        const FIRMWARE_DELETE = 0b0010_0000;
        // Bit 6 is unused.
        const NOT_ALLOCATED = 0b1000_0000;

        const EXTERNAL_FULL_ACCESS = Self::EXTERNAL_READ.bits()
            | Self::EXTERNAL_WRITE.bits()
            | Self::EXTERNAL_DELETE.bits();
        const FIRMWARE_FULL_ACCESS = Self::FIRMWARE_READ.bits()
            | Self::FIRMWARE_WRITE.bits()
            | Self::FIRMWARE_DELETE.bits();
        const DEFAULT = Self::EXTERNAL_FULL_ACCESS.bits() | Self::FIRMWARE_FULL_ACCESS.bits();
    }
}

impl Default for Attributes {
    fn default() -> Self {
        Attributes::DEFAULT
    }
}

/// Who is asking for a handle. Decides which attribute bits gate the handle.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Super = 0x00,
    Firmware = 0x01,
    External = 0x80,
}

impl Tier {
    pub fn can_read(self, attr: Attributes) -> bool {
        match self {
            Tier::Super => true,
            Tier::Firmware => attr.contains(Attributes::FIRMWARE_READ),
            Tier::External => attr.contains(Attributes::EXTERNAL_READ),
        }
    }

    pub fn can_write(self, attr: Attributes) -> bool {
        match self {
            Tier::Super => true,
            Tier::Firmware => attr.contains(Attributes::FIRMWARE_WRITE),
            Tier::External => attr.contains(Attributes::EXTERNAL_WRITE),
        }
    }

    pub fn can_delete(self, attr: Attributes) -> bool {
        match self {
            Tier::Super => true,
            Tier::Firmware => attr.contains(Attributes::FIRMWARE_DELETE),
            Tier::External => attr.contains(Attributes::EXTERNAL_DELETE),
        }
    }
}

/// Directory record of one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileRecord {
    pub id: FileId,
    pub attr: Attributes,
    pub start: u16,  // First EFS page of the file
    pub length: u16, // Pages spanned by the file
}

impl FileRecord {
    /// Record of a slot that has never been written (erased device).
    pub const ERASED: Self = Self {
        id: FileId(0xFF),
        attr: Attributes::from_bits_retain(0xFF),
        start: 0xFFFF,
        length: 0xFFFF,
    };

    pub const fn new(id: FileId, attr: Attributes, start: u16, length: u16) -> Self {
        Self { id, attr, start, length }
    }

    pub fn is_allocated(&self) -> bool {
        !self.attr.contains(Attributes::NOT_ALLOCATED)
    }

    /// One past the last page of the file.
    pub fn end(&self) -> u32 {
        self.start as u32 + self.length as u32
    }

    pub fn to_bytes(&self) -> [u8; RECORD_SIZE] {
        let mut buf = [0u8; RECORD_SIZE];
        buf[0] = self.id.0;
        buf[1] = self.attr.bits();
        buf[2..4].copy_from_slice(&self.start.to_le_bytes());
        buf[4..6].copy_from_slice(&self.length.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; RECORD_SIZE]) -> Self {
        Self {
            id: FileId(buf[0]),
            attr: Attributes::from_bits_retain(buf[1]),
            start: u16::from_le_bytes([buf[2], buf[3]]),
            length: u16::from_le_bytes([buf[4], buf[5]]),
        }
    }
}

/// Identity and geometry of the filesystem, stored at the front of header page 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub identifier: [u8; 3],
    pub version: u8,
    pub page_size: u16,
    pub page_count: u16,
    pub base_address: u32,
    pub header_pages: u16,
    pub reserved: u16,
}

impl Header {
    pub const fn from_geometry(geometry: &Geometry) -> Self {
        Self {
            identifier: MAGIC,
            version: VERSION,
            page_size: geometry.page_size,
            page_count: geometry.page_count,
            base_address: geometry.base_address,
            header_pages: geometry.header_pages,
            reserved: 0,
        }
    }

    /// True when the header was written by this version for exactly this geometry.
    /// The reserved field is ignored.
    pub fn matches(&self, geometry: &Geometry) -> bool {
        self.identifier == MAGIC
            && self.version == VERSION
            && self.page_size == geometry.page_size
            && self.page_count == geometry.page_count
            && self.base_address == geometry.base_address
            && self.header_pages == geometry.header_pages
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..3].copy_from_slice(&self.identifier);
        buf[3] = self.version;
        buf[4..6].copy_from_slice(&self.page_size.to_le_bytes());
        buf[6..8].copy_from_slice(&self.page_count.to_le_bytes());
        buf[8..12].copy_from_slice(&self.base_address.to_le_bytes());
        buf[12..14].copy_from_slice(&self.header_pages.to_le_bytes());
        buf[14..16].copy_from_slice(&self.reserved.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; HEADER_SIZE]) -> Self {
        Self {
            identifier: [buf[0], buf[1], buf[2]],
            version: buf[3],
            page_size: u16::from_le_bytes([buf[4], buf[5]]),
            page_count: u16::from_le_bytes([buf[6], buf[7]]),
            base_address: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            header_pages: u16::from_le_bytes([buf[12], buf[13]]),
            reserved: u16::from_le_bytes([buf[14], buf[15]]),
        }
    }
}

//! In-memory record of which files are checked out.
//! Nothing here is persisted: every filesystem instance starts with all files free.

use crate::config::MAX_FILE_IDS;
use crate::FileId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnershipTable {
    owned: [u8; MAX_FILE_IDS / 8],
}

impl OwnershipTable {
    pub const fn new() -> Self {
        Self { owned: [0; MAX_FILE_IDS / 8] }
    }

    fn locate(id: FileId) -> (usize, u8) {
        ((id.0 / 8) as usize, 1 << (id.0 % 8))
    }

    /// Marks `id` as owned. Returns false when somebody already owns it.
    pub fn take(&mut self, id: FileId) -> bool {
        let (byte, mask) = Self::locate(id);
        let free = self.owned[byte] & mask == 0;
        self.owned[byte] |= mask;
        free
    }

    pub fn release(&mut self, id: FileId) {
        let (byte, mask) = Self::locate(id);
        self.owned[byte] &= !mask;
    }

    pub fn count(&self) -> usize {
        self.owned.iter().map(|byte| byte.count_ones() as usize).sum()
    }
}

impl Default for OwnershipTable {
    fn default() -> Self {
        Self::new()
    }
}

//! Caching of file records so hot files can be opened without scanning the directory.
//! Validity of a cached record is kept in its tombstone bit.

use crate::{Attributes, FileId, FileRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataCache {
    record: FileRecord,
}

impl MetadataCache {
    /// Caches `record` and marks it valid.
    pub fn cache(&mut self, record: FileRecord) {
        self.record = record;
        self.record.attr.remove(Attributes::NOT_ALLOCATED);
    }

    /// Caches `record` as invalid. Keeps the id around when the record itself is not available.
    pub fn invalid_cache(&mut self, record: FileRecord) {
        self.record = record;
        self.record.attr.insert(Attributes::NOT_ALLOCATED);
    }

    pub fn invalidate(&mut self) {
        self.record.attr.insert(Attributes::NOT_ALLOCATED);
    }

    pub fn is_valid(&self) -> bool {
        self.record.is_allocated()
    }

    pub fn record(&self) -> &FileRecord {
        &self.record
    }

    pub fn id(&self) -> FileId {
        self.record.id
    }
}

impl Default for MetadataCache {
    fn default() -> Self {
        Self {
            record: FileRecord::new(FileId(0), Attributes::NOT_ALLOCATED, 0, 0),
        }
    }
}

/// Fixed set of cached records.
/// `add` always overwrites the oldest slot, however recently that slot was read.
#[derive(Debug, Clone)]
pub struct MetadataCachePool<const N: usize> {
    oldest: usize,
    slots: [MetadataCache; N],
}

impl<const N: usize> MetadataCachePool<N> {
    pub fn new() -> Self {
        Self {
            oldest: 0,
            slots: [MetadataCache::default(); N],
        }
    }

    pub fn add(&mut self, record: FileRecord) {
        if N == 0 {
            return;
        }
        self.slots[self.oldest].cache(record);
        self.oldest = (self.oldest + 1) % N;
    }

    pub fn remove(&mut self, id: FileId) {
        // The same id can sit in more than one slot when it was added twice.
        self.slots
            .iter_mut()
            .filter(|slot| slot.id() == id)
            .for_each(MetadataCache::invalidate);
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(MetadataCache::invalidate);
    }

    pub fn get(&self, id: FileId) -> Option<FileRecord> {
        self.slots
            .iter()
            .find(|slot| slot.is_valid() && slot.id() == id)
            .map(|slot| *slot.record())
    }
}

impl<const N: usize> Default for MetadataCachePool<N> {
    fn default() -> Self {
        Self::new()
    }
}

//! Per-file caches that remember where a file lives and can keep it checked out.
//!
//! A file cache skips the directory scan when opening a hot file. A cache that owns its file
//! lends out handles instead of giving up ownership, so no other user can open the file between
//! two uses. Caches register with the filesystem so that create, delete, erase and init keep
//! them coherent.

use crate::cache::MetadataCache;
use crate::config::Geometry;
use crate::directory::dir_lookup;
use crate::fs::{Efs, FsState};
use crate::handle::{Handle, Release};
use crate::{Attributes, FileId, FileRecord, PageDevice, Result, Tier};

/// Identifies a registered cache. Stale keys of dropped caches never match a reused slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CacheKey {
    index: usize,
    generation: u32,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct CacheEntry {
    pub cache: MetadataCache,
    pub owns_file: bool,  // The cache holds the ownership bit of its file
    pub has_handle: bool, // A handle lent out by this cache is still open
    pub synced: bool,     // The record has been looked up at least once
}

impl CacheEntry {
    fn sync<D: PageDevice + ?Sized>(&mut self, device: &D, geometry: &Geometry) -> Result<()> {
        let id = self.cache.id();
        match dir_lookup(device, geometry, id)? {
            Some((_, record)) => self.cache.cache(record),
            None => self.cache.invalid_cache(FileRecord::new(id, Attributes::NOT_ALLOCATED, 0, 0)),
        }
        self.synced = true;
        Ok(())
    }
}

/// Every live file cache of a filesystem.
#[derive(Debug, Default)]
pub(crate) struct CacheRegistry {
    slots: Vec<(u32, Option<CacheEntry>)>,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    pub fn register(&mut self, entry: CacheEntry) -> CacheKey {
        if let Some(index) = self.slots.iter().position(|(_, entry)| entry.is_none()) {
            let (generation, slot) = &mut self.slots[index];
            *generation = generation.wrapping_add(1);
            *slot = Some(entry);
            return CacheKey { index, generation: *generation };
        }
        self.slots.push((0, Some(entry)));
        CacheKey { index: self.slots.len() - 1, generation: 0 }
    }

    pub fn unregister(&mut self, key: CacheKey) -> Option<CacheEntry> {
        match self.slots.get_mut(key.index) {
            Some((generation, entry)) if *generation == key.generation => entry.take(),
            _ => None,
        }
    }

    pub fn get(&self, key: CacheKey) -> Option<&CacheEntry> {
        match self.slots.get(key.index) {
            Some((generation, entry)) if *generation == key.generation => entry.as_ref(),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, key: CacheKey) -> Option<&mut CacheEntry> {
        match self.slots.get_mut(key.index) {
            Some((generation, entry)) if *generation == key.generation => entry.as_mut(),
            _ => None,
        }
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut CacheEntry> {
        self.slots.iter_mut().filter_map(|(_, entry)| entry.as_mut())
    }

    /// Points every cache of `record.id` at the newly created file.
    pub fn update(&mut self, record: &FileRecord) {
        for entry in self.iter_mut().filter(|entry| entry.cache.id() == record.id) {
            entry.cache.cache(*record);
            entry.synced = true;
        }
    }

    /// Looks up the record of every cache again.
    pub fn refresh<D: PageDevice + ?Sized>(&mut self, device: &D, geometry: &Geometry) -> Result<()> {
        for entry in self.iter_mut() {
            entry.sync(device, geometry)?;
        }
        Ok(())
    }

    /// Takes back a handle lent by the cache behind `key`.
    /// Returns false when that cache no longer holds the file.
    pub fn return_handle(&mut self, key: CacheKey) -> bool {
        match self.get_mut(key) {
            Some(entry) if entry.owns_file => {
                entry.has_handle = false;
                true
            }
            _ => false,
        }
    }
}

/// Cached location of one file, bound to a filesystem.
pub struct FileCache<D: PageDevice> {
    fs: Efs<D>,
    key: CacheKey,
    id: FileId,
}

impl<D: PageDevice> FileCache<D> {
    /// Registers a cache for `id` and looks the file up right away.
    pub fn new(fs: &Efs<D>, id: FileId) -> Self {
        let cache = Self::lazy(fs, id);
        {
            let mut state = fs.lock();
            cache.sync_locked(&mut state);
        }
        cache
    }

    /// Registers a cache for `id` without touching the device.
    /// The record is looked up by `init`, `try_sync`, or the first `get_handle`.
    pub fn lazy(fs: &Efs<D>, id: FileId) -> Self {
        let mut cache = MetadataCache::default();
        cache.invalid_cache(FileRecord::new(id, Attributes::NOT_ALLOCATED, 0, 0));
        let entry = CacheEntry {
            cache,
            owns_file: false,
            has_handle: false,
            synced: false,
        };
        let key = fs.lock().caches.register(entry);
        Self { fs: fs.clone(), key, id }
    }

    /// Looks the record up only if the filesystem lock is free right now.
    /// Safe to call from contexts that must not block. Returns whether the lookup ran.
    pub fn try_sync(&self) -> bool {
        let Some(mut state) = self.fs.try_lock() else {
            return false;
        };
        self.sync_locked(&mut state)
    }

    fn sync_locked(&self, state: &mut FsState) -> bool {
        let lockdown = state.lockdown;
        let Some(entry) = state.caches.get_mut(self.key) else {
            return false;
        };
        // Nothing trustworthy to read while the filesystem is not initialised.
        if lockdown {
            return false;
        }
        match entry.sync(&*self.fs.shared.device, self.fs.geometry()) {
            Ok(()) => true,
            Err(e) => {
                log::error!("sync of cache for {:#04x} failed: {}", self.id.0, e);
                false
            }
        }
    }

    pub fn id(&self) -> FileId {
        self.id
    }

    pub fn is_valid(&self) -> bool {
        self.record().is_some()
    }

    /// Cached record, if the file is known to exist.
    pub fn record(&self) -> Option<FileRecord> {
        let state = self.fs.lock();
        state
            .caches
            .get(self.key)
            .filter(|entry| entry.cache.is_valid())
            .map(|entry| *entry.cache.record())
    }

    pub fn has_ownership(&self) -> bool {
        let state = self.fs.lock();
        state.caches.get(self.key).is_some_and(|entry| entry.owns_file)
    }

    /// Checks the file out for this cache so that nobody else can open it.
    /// Returns false when the file is owned elsewhere.
    ///
    /// Works before `init`, so a file can be reserved before anybody else may open it.
    pub fn take_ownership(&self) -> bool {
        let mut state = self.fs.lock();
        let FsState { owned, caches, .. } = &mut *state;
        let Some(entry) = caches.get_mut(self.key) else {
            return false;
        };
        if !entry.owns_file {
            entry.owns_file = owned.take(self.id);
            log::debug!("cache took file {:#04x}: {}", self.id.0, entry.owns_file);
        }
        entry.owns_file
    }

    /// Gives the file back. Waits for a lent handle to be closed first.
    pub fn release_ownership(&self) {
        let mut state = self.fs.lock();
        loop {
            let (owns_file, has_handle) = match state.caches.get(self.key) {
                Some(entry) => (entry.owns_file, entry.has_handle),
                None => return,
            };
            if !owns_file {
                return;
            }
            if !has_handle {
                break;
            }
            state = self.fs.wait(state);
        }
        let FsState { owned, caches, .. } = &mut *state;
        if let Some(entry) = caches.get_mut(self.key) {
            entry.owns_file = false;
            owned.release(self.id);
            log::debug!("cache released file {:#04x}", self.id.0);
        }
        drop(state);
        self.fs.notify();
    }

    /// Opens the cached file without scanning the directory.
    ///
    /// An owning cache lends out a handle and waits while a previous one is still open.
    /// A cache without ownership hands out a handle that owns the file, if the file is free.
    /// With `wait_until_valid` the call blocks until the file exists.
    pub fn get_handle(&self, wait_until_valid: bool, tier: Tier) -> Handle<D> {
        let mut state = self.fs.lock();

        let needs_sync = state.caches.get(self.key).is_some_and(|entry| !entry.synced);
        if needs_sync {
            self.sync_locked(&mut state);
        }

        loop {
            let Some(entry) = state.caches.get(self.key) else {
                return Handle::invalid(self.fs.clone(), tier);
            };
            let busy = entry.owns_file && entry.has_handle;
            let missing = wait_until_valid && !entry.cache.is_valid();
            if !busy && !missing {
                break;
            }
            state = self.fs.wait(state);
        }

        if state.lockdown {
            return Handle::invalid(self.fs.clone(), tier);
        }

        let FsState { owned, caches, .. } = &mut *state;
        let Some(entry) = caches.get_mut(self.key) else {
            return Handle::invalid(self.fs.clone(), tier);
        };
        if !entry.cache.is_valid() {
            return Handle::invalid(self.fs.clone(), tier);
        }
        let record = *entry.cache.record();

        if entry.owns_file {
            entry.has_handle = true;
            Handle::new(self.fs.clone(), record, tier, Release::ReturnToCache(self.key))
        } else if owned.take(self.id) {
            Handle::new(self.fs.clone(), record, tier, Release::Ownership)
        } else {
            Handle::invalid(self.fs.clone(), tier)
        }
    }
}

impl<D: PageDevice> Drop for FileCache<D> {
    fn drop(&mut self) {
        let mut state = self.fs.lock();
        if let Some(entry) = state.caches.unregister(self.key) {
            // A lent handle still open releases the ownership when it closes.
            if entry.owns_file && !entry.has_handle {
                state.owned.release(self.id);
            }
        }
        drop(state);
        self.fs.notify();
    }
}

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread;
use std::time::Duration;

use crate::allocator::PageAllocator;
use crate::bitmap::PageBitmap;
use crate::cache::MetadataCachePool;
use crate::config::*;
use crate::directory::{dir_format, dir_free_slot, dir_lookup, dir_usage, dir_write};
use crate::file_cache::CacheRegistry;
use crate::handle::{Handle, Release};
use crate::header::header_matches;
use crate::ownership::OwnershipTable;
use crate::structs::*;
use crate::wait::Deadline;
use crate::{Error, PageDevice, Result};

/// Everything guarded by the filesystem lock.
pub(crate) struct FsState {
    pub lockdown: bool, // No handle is issued and no file created while set
    pub free_files: u16,
    pub allocator: PageAllocator,
    pub owned: OwnershipTable,
    pub external: MetadataCachePool<EXTERNAL_CACHE_SIZE>,
    pub caches: CacheRegistry,
}

impl FsState {
    /// Drops every cached copy of `id` and takes back ownership held by idle file caches.
    pub fn forget_file(&mut self, id: FileId) {
        self.external.remove(id);
        for entry in self.caches.iter_mut().filter(|entry| entry.cache.id() == id) {
            entry.cache.invalidate();
            if entry.owns_file && !entry.has_handle {
                self.owned.release(id);
                entry.owns_file = false;
            }
        }
    }
}

pub(crate) struct Shared<D: PageDevice> {
    pub device: Arc<D>,
    pub geometry: Geometry,
    pub state: Mutex<FsState>,
    pub changed: Condvar, // Ownership released, cache handle returned, file created or erase done
}

/// Embedded file system on top of a page device.
/// Cloning is cheap and every clone refers to the same filesystem.
pub struct Efs<D: PageDevice> {
    pub(crate) shared: Arc<Shared<D>>,
}

impl<D: PageDevice> Clone for Efs<D> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<D: PageDevice> Efs<D> {
    /// Binds a filesystem to `device` without touching it.
    /// The filesystem stays in lockdown until `init` succeeds.
    pub fn new(device: Arc<D>, geometry: Geometry) -> Result<Self> {
        geometry.validate(device.size())?;
        let state = FsState {
            lockdown: true,
            free_files: 0,
            allocator: PageAllocator::empty(&geometry),
            owned: OwnershipTable::new(),
            external: MetadataCachePool::new(),
            caches: CacheRegistry::new(),
        };
        Ok(Self {
            shared: Arc::new(Shared {
                device,
                geometry,
                state: Mutex::new(state),
                changed: Condvar::new(),
            }),
        })
    }

    /// Loads the filesystem from the device.
    /// A header that does not match the geometry erases the whole filesystem.
    pub fn init(&self) -> Result<()> {
        let mut state = self.lock();
        state.lockdown = true;

        let device = &*self.shared.device;
        let geometry = &self.shared.geometry;

        if !header_matches(device, geometry)? {
            log::warn!("formatting EFS, all files are lost");
            // Files reserved by caches before init stay reserved across the format.
            state = self.erase_locked(state, false)?;
        }

        let (files, used_pages) = dir_usage(device, geometry)?;
        let mut bitmap = PageBitmap::new(device, geometry);
        state.allocator = PageAllocator::recover(&mut bitmap, geometry, used_pages)?;
        state.free_files = geometry.max_files().saturating_sub(files);

        // Lazy caches created before the filesystem was ready get their records now.
        state.caches.refresh(device, geometry)?;
        state.external.clear();
        state.lockdown = false;

        log::info!(
            "EFS ready: {} files, {} free pages, frontier at page {}",
            files,
            state.allocator.free_pages(),
            state.allocator.frontier()
        );
        drop(state);
        self.notify();
        Ok(())
    }

    /// Frees every file and data page.
    /// Blocks until every open handle has been closed; no new handle is issued meanwhile.
    pub fn erase(&self) -> Result<()> {
        let state = self.lock();
        let mut state = self.erase_locked(state, true)?;
        state.lockdown = false;
        drop(state);
        self.notify();
        Ok(())
    }

    /// Waits for all ownership to drain, then formats the device. Leaves lockdown set.
    /// Without `reclaim_cache_ownership`, idle file caches keep the files they own.
    fn erase_locked<'a>(
        &'a self,
        mut state: MutexGuard<'a, FsState>,
        reclaim_cache_ownership: bool,
    ) -> Result<MutexGuard<'a, FsState>> {
        state.lockdown = true;

        loop {
            let FsState { owned, external, caches, .. } = &mut *state;
            external.clear();
            let mut kept = 0;
            for entry in caches.iter_mut() {
                entry.cache.invalidate();
                if entry.owns_file && !entry.has_handle {
                    if reclaim_cache_ownership {
                        owned.release(entry.cache.id());
                        entry.owns_file = false;
                    } else {
                        kept += 1;
                    }
                }
            }
            if owned.count() == kept {
                break;
            }
            log::debug!("erase waiting for {} open files", owned.count());
            state = self.shared.changed.wait(state).unwrap_or_else(PoisonError::into_inner);
        }

        let device = &*self.shared.device;
        let geometry = &self.shared.geometry;
        dir_format(device, geometry)?;
        PageBitmap::new(device, geometry).format()?;

        state.allocator = PageAllocator::empty(geometry);
        state.free_files = geometry.max_files();
        log::info!(
            "EFS erased: {} file slots, {} data pages",
            state.free_files,
            state.allocator.free_pages()
        );
        Ok(state)
    }

    /// Creates a file spanning `pages` contiguous pages.
    pub fn create(
        &self,
        id: FileId,
        pages: u16,
        attributes: Attributes,
        timeout: Option<Duration>,
    ) -> Result<FileRecord> {
        let mut state = self.lock_until(Deadline::after(timeout)).ok_or(Error::Timeout)?;
        if state.lockdown {
            return Err(Error::Lockdown);
        }
        if pages == 0 {
            return Err(Error::EmptyFile);
        }

        let device = &*self.shared.device;
        let geometry = &self.shared.geometry;

        let slot = dir_free_slot(device, geometry, id)?;
        let mut bitmap = PageBitmap::new(device, geometry);
        let start = state.allocator.allocate(&mut bitmap, geometry, pages)?;

        let record = FileRecord::new(id, attributes - Attributes::NOT_ALLOCATED, start, pages);
        if let Err(e) = dir_write(device, geometry, slot, &record) {
            state.allocator.release(&mut bitmap, start, pages)?;
            return Err(e);
        }
        state.free_files = state.free_files.saturating_sub(1);
        state.caches.update(&record);

        log::debug!("created file {:#04x}: pages [{}, {})", id.0, start, record.end());
        drop(state);
        self.notify();
        Ok(record)
    }

    /// Scans the directory for `id`. Never cached, so keep it off hot paths.
    pub fn exists(&self, id: FileId, timeout: Option<Duration>) -> bool {
        self.file_record(id, timeout).is_some()
    }

    /// Directory record of `id`, if the file exists and the lock was taken in time.
    pub fn file_record(&self, id: FileId, timeout: Option<Duration>) -> Option<FileRecord> {
        let _state = self.lock_until(Deadline::after(timeout))?;
        match dir_lookup(&*self.shared.device, &self.shared.geometry, id) {
            Ok(found) => found.map(|(_, record)| record),
            Err(e) => {
                log::error!("directory lookup of {:#04x} failed: {}", id.0, e);
                None
            }
        }
    }

    /// Opens a handle to an existing file.
    /// Returns an invalid handle on lockdown, a missing file, or when ownership was not obtained in time.
    pub fn open(&self, id: FileId, timeout: Option<Duration>, tier: Tier) -> Handle<D> {
        let deadline = Deadline::after(timeout);
        let Some(mut state) = self.lock_until(deadline) else {
            return Handle::invalid(self.clone(), tier);
        };
        if state.lockdown {
            return Handle::invalid(self.clone(), tier);
        }

        let Some(mut record) = self.resolve(&state, id, tier) else {
            return Handle::invalid(self.clone(), tier);
        };

        let mut waited = false;
        while !state.owned.take(id) {
            if deadline.expired() {
                return Handle::invalid(self.clone(), tier);
            }
            state = self.wait_until(state, deadline).0;
            waited = true;
            if state.lockdown {
                return Handle::invalid(self.clone(), tier);
            }
        }

        // The previous owner may have deleted the file while we were waiting.
        if waited {
            match self.resolve(&state, id, tier) {
                Some(current) => record = current,
                None => {
                    state.owned.release(id);
                    drop(state);
                    self.notify();
                    return Handle::invalid(self.clone(), tier);
                }
            }
        }

        log::trace!("opened file {:#04x} as {:?}", id.0, tier);
        Handle::new(self.clone(), record, tier, Release::Ownership)
    }

    fn resolve(&self, state: &FsState, id: FileId, tier: Tier) -> Option<FileRecord> {
        if tier == Tier::External {
            if let Some(record) = state.external.get(id) {
                return Some(record);
            }
        }
        match dir_lookup(&*self.shared.device, &self.shared.geometry, id) {
            Ok(found) => found.map(|(_, record)| record),
            Err(e) => {
                log::error!("directory lookup of {:#04x} failed: {}", id.0, e);
                None
            }
        }
    }

    /// Puts the record of `id` in the cache consulted by external-tier opens.
    pub fn add_to_external_cache(&self, id: FileId, timeout: Option<Duration>) -> bool {
        let Some(mut state) = self.lock_until(Deadline::after(timeout)) else {
            return false;
        };
        match dir_lookup(&*self.shared.device, &self.shared.geometry, id) {
            Ok(Some((_, record))) => {
                state.external.add(record);
                true
            }
            Ok(None) => false,
            Err(e) => {
                log::error!("directory lookup of {:#04x} failed: {}", id.0, e);
                false
            }
        }
    }

    pub fn max_files(&self) -> u16 {
        self.shared.geometry.max_files()
    }

    pub fn free_files(&self) -> u16 {
        self.lock().free_files
    }

    pub fn free_pages(&self) -> u16 {
        self.lock().allocator.free_pages()
    }

    pub fn is_locked_down(&self) -> bool {
        self.lock().lockdown
    }

    /// Header describing the configured filesystem.
    pub fn header_info(&self) -> Header {
        Header::from_geometry(&self.shared.geometry)
    }

    pub fn geometry(&self) -> &Geometry {
        &self.shared.geometry
    }

    pub fn device(&self) -> Arc<D> {
        Arc::clone(&self.shared.device)
    }

    // Following methods implement the locking protocol shared by handles and caches.

    pub(crate) fn lock(&self) -> MutexGuard<'_, FsState> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Single lock attempt, never blocks.
    pub(crate) fn try_lock(&self) -> Option<MutexGuard<'_, FsState>> {
        match self.shared.state.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    /// Polls the lock, yielding between attempts, until `deadline`.
    pub(crate) fn lock_until(&self, deadline: Deadline) -> Option<MutexGuard<'_, FsState>> {
        if deadline == Deadline::Never {
            return Some(self.lock());
        }
        loop {
            if let Some(guard) = self.try_lock() {
                return Some(guard);
            }
            if deadline.expired() {
                return None;
            }
            thread::yield_now();
        }
    }

    /// Sleeps until the state changes or `deadline` passes. The flag tells whether time ran out.
    pub(crate) fn wait_until<'a>(
        &'a self,
        state: MutexGuard<'a, FsState>,
        deadline: Deadline,
    ) -> (MutexGuard<'a, FsState>, bool) {
        match deadline.remaining() {
            None => (self.wait(state), false),
            Some(remaining) if remaining.is_zero() => (state, true),
            Some(remaining) => {
                let (state, result) = self
                    .shared
                    .changed
                    .wait_timeout(state, remaining)
                    .unwrap_or_else(PoisonError::into_inner);
                (state, result.timed_out())
            }
        }
    }

    pub(crate) fn wait<'a>(&'a self, state: MutexGuard<'a, FsState>) -> MutexGuard<'a, FsState> {
        self.shared.changed.wait(state).unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn notify(&self) {
        self.shared.changed.notify_all();
    }
}

#![allow(unused)]

use std::sync::Arc;
use std::thread;
use std::time::Duration;

mod common;

use common::{init_logger, ram_fs, DEVICE_SIZE, WAIT};
use efs::*;

fn record(id: u8) -> FileRecord {
    FileRecord::new(FileId(id), Attributes::DEFAULT, 2 + id as u16, 1)
}

#[test]
fn test_single_cache() {
    let mut cache = MetadataCache::default();
    assert!(!cache.is_valid());

    cache.cache(record(4));
    assert!(cache.is_valid());
    assert_eq!(cache.id(), FileId(4));
    assert_eq!(cache.record().start, 6);

    cache.invalidate();
    assert!(!cache.is_valid());
    assert_eq!(cache.id(), FileId(4));

    cache.invalid_cache(record(9));
    assert!(!cache.is_valid());
    assert_eq!(cache.id(), FileId(9));
}

#[test]
fn test_cache_pool() {
    let mut pool = MetadataCachePool::<2>::new();
    pool.add(record(0));
    pool.add(record(1));
    assert_eq!(pool.get(FileId(0)), Some(record(0)));
    assert_eq!(pool.get(FileId(1)), Some(record(1)));

    // The oldest entry goes first.
    pool.add(record(0xFF));
    assert_eq!(pool.get(FileId(0)), None);
    assert_eq!(pool.get(FileId(1)), Some(record(1)));
    assert_eq!(pool.get(FileId(0xFF)), Some(record(0xFF)));

    pool.remove(FileId(1));
    assert_eq!(pool.get(FileId(1)), None);
    assert_eq!(pool.get(FileId(0xFF)), Some(record(0xFF)));

    pool.clear();
    assert_eq!(pool.get(FileId(0xFF)), None);
}

#[test]
fn test_file_cache() {
    let (_, fs) = ram_fs(256);
    let id = FileId(10);
    let created = fs.create(id, 3, Attributes::DEFAULT, WAIT).unwrap();

    let cache = FileCache::new(&fs, id);
    assert_eq!(cache.id(), id);
    assert!(cache.is_valid());
    assert_eq!(cache.record(), Some(created));
    assert!(!cache.has_ownership());

    let handle = cache.get_handle(false, Tier::Firmware);
    assert!(handle.is_valid());
    assert_eq!(handle.record(), &created);
    assert!(!fs.open(id, Some(Duration::ZERO), Tier::Super).is_valid());
    drop(handle);
    assert!(fs.open(id, Some(Duration::ZERO), Tier::Super).is_valid());

    // Without ownership the cache cannot hand out a handle to a file somebody else holds.
    let held = fs.open(id, WAIT, Tier::Super);
    assert!(!cache.get_handle(false, Tier::Super).is_valid());
}

#[test]
fn test_file_cache_follows_create_and_delete() {
    let (_, fs) = ram_fs(256);
    let id = FileId(11);
    let cache = FileCache::new(&fs, id);
    assert!(!cache.is_valid());
    assert!(!cache.get_handle(false, Tier::Super).is_valid());

    let created = fs.create(id, 2, Attributes::DEFAULT, WAIT).unwrap();
    assert_eq!(cache.record(), Some(created));

    let mut handle = cache.get_handle(false, Tier::Super);
    assert!(handle.is_valid());
    handle.delete().unwrap();
    assert!(!cache.is_valid());
    assert!(!fs.open(id, WAIT, Tier::Super).is_valid());
}

#[test]
fn test_lazy_cache() {
    let (dev, fs) = ram_fs(256);
    let id = FileId(12);
    let created = fs.create(id, 1, Attributes::DEFAULT, WAIT).unwrap();
    drop(fs);

    // Caches set up before init are filled in by init.
    let fs = Efs::new(dev.clone(), Geometry::DEFAULT).unwrap();
    let early = FileCache::lazy(&fs, id);
    assert!(!early.is_valid());
    assert!(!early.try_sync());
    fs.init().unwrap();
    assert_eq!(early.record(), Some(created));

    let late = FileCache::lazy(&fs, id);
    assert!(!late.is_valid());
    assert!(late.try_sync());
    assert_eq!(late.record(), Some(created));

    // The first handle request looks the record up when nobody synced the cache.
    let unsynced = FileCache::lazy(&fs, id);
    let handle = unsynced.get_handle(false, Tier::Super);
    assert!(handle.is_valid());
    assert_eq!(handle.record(), &created);
}

#[test]
fn test_cache_reserves_file_before_init() {
    let (dev, fs) = ram_fs(256);
    let id = FileId(21);
    let created = fs.create(id, 2, Attributes::DEFAULT, WAIT).unwrap();
    drop(fs);

    let fs = Efs::new(dev.clone(), Geometry::DEFAULT).unwrap();
    let cache = FileCache::lazy(&fs, id);
    assert!(cache.take_ownership());
    fs.init().unwrap();

    assert!(cache.has_ownership());
    assert!(!fs.open(id, Some(Duration::ZERO), Tier::Super).is_valid());
    let handle = cache.get_handle(false, Tier::Super);
    assert!(handle.is_valid());
    assert_eq!(handle.record(), &created);
}

#[test]
fn test_reservation_survives_format_on_init() {
    init_logger();
    let dev = Arc::new(RamDevice::new(DEVICE_SIZE, 256));
    let fs = Efs::new(dev, Geometry::DEFAULT).unwrap();
    let id = FileId(22);
    let cache = FileCache::lazy(&fs, id);
    assert!(cache.take_ownership());

    // A blank device is formatted by init.
    fs.init().unwrap();
    assert!(cache.has_ownership());
    assert!(!cache.is_valid());

    fs.create(id, 1, Attributes::DEFAULT, WAIT).unwrap();
    assert!(!fs.open(id, Some(Duration::ZERO), Tier::Super).is_valid());
    assert!(cache.get_handle(false, Tier::Super).is_valid());
}

#[test]
fn test_cache_ownership() {
    let (_, fs) = ram_fs(256);
    let id = FileId(13);
    fs.create(id, 1, Attributes::DEFAULT, WAIT).unwrap();
    let cache = FileCache::new(&fs, id);

    assert!(cache.take_ownership());
    assert!(cache.take_ownership());
    assert!(cache.has_ownership());
    assert!(!fs.open(id, Some(Duration::ZERO), Tier::Super).is_valid());

    let handle = cache.get_handle(false, Tier::Super);
    assert!(handle.is_valid());
    assert_eq!(handle.write(0, &[1, 2, 3]).unwrap(), 3);
    drop(handle);

    // Returning the handle keeps the file checked out for the cache.
    assert!(!fs.open(id, Some(Duration::ZERO), Tier::Super).is_valid());
    let handle = cache.get_handle(false, Tier::Super);
    let mut buf = [0u8; 3];
    assert_eq!(handle.read(0, &mut buf).unwrap(), 3);
    assert_eq!(buf, [1, 2, 3]);
    drop(handle);

    cache.release_ownership();
    assert!(!cache.has_ownership());
    assert!(fs.open(id, Some(Duration::ZERO), Tier::Super).is_valid());
}

#[test]
fn test_take_ownership_fails_while_open() {
    let (_, fs) = ram_fs(256);
    let id = FileId(14);
    fs.create(id, 1, Attributes::DEFAULT, WAIT).unwrap();
    let cache = FileCache::new(&fs, id);

    let handle = fs.open(id, WAIT, Tier::Super);
    assert!(!cache.take_ownership());
    assert!(!cache.has_ownership());
    drop(handle);
    assert!(cache.take_ownership());
}

#[test]
fn test_release_waits_for_lent_handle() {
    let (_, fs) = ram_fs(256);
    let id = FileId(15);
    fs.create(id, 1, Attributes::DEFAULT, WAIT).unwrap();
    let cache = FileCache::new(&fs, id);
    assert!(cache.take_ownership());
    let handle = cache.get_handle(false, Tier::Super);

    thread::scope(|s| {
        let releaser = s.spawn(|| cache.release_ownership());
        thread::sleep(Duration::from_millis(50));
        assert!(cache.has_ownership());
        drop(handle);
        releaser.join().unwrap();
    });
    assert!(!cache.has_ownership());
    assert!(fs.open(id, Some(Duration::ZERO), Tier::Super).is_valid());
}

#[test]
fn test_lent_handle_blocks_next_request() {
    let (_, fs) = ram_fs(256);
    let id = FileId(16);
    fs.create(id, 1, Attributes::DEFAULT, WAIT).unwrap();
    let cache = FileCache::new(&fs, id);
    assert!(cache.take_ownership());
    let handle = cache.get_handle(false, Tier::Super);

    thread::scope(|s| {
        let next = s.spawn(|| cache.get_handle(false, Tier::Firmware).is_valid());
        thread::sleep(Duration::from_millis(50));
        assert!(!next.is_finished());
        drop(handle);
        assert!(next.join().unwrap());
    });
}

#[test]
fn test_get_handle_waits_until_valid() {
    let (_, fs) = ram_fs(256);
    let id = FileId(17);
    let cache = FileCache::new(&fs, id);

    thread::scope(|s| {
        let waiter = s.spawn(|| cache.get_handle(true, Tier::Super).page_length());
        thread::sleep(Duration::from_millis(50));
        fs.create(id, 5, Attributes::DEFAULT, WAIT).unwrap();
        assert_eq!(waiter.join().unwrap(), 5);
    });
}

#[test]
fn test_dropped_cache_gives_file_back() {
    let (_, fs) = ram_fs(256);
    let id = FileId(18);
    fs.create(id, 1, Attributes::DEFAULT, WAIT).unwrap();

    let cache = FileCache::new(&fs, id);
    assert!(cache.take_ownership());
    drop(cache);
    assert!(fs.open(id, Some(Duration::ZERO), Tier::Super).is_valid());

    // A handle outliving its cache keeps the file until it is closed.
    let cache = FileCache::new(&fs, id);
    assert!(cache.take_ownership());
    let handle = cache.get_handle(false, Tier::Super);
    drop(cache);
    assert!(handle.is_valid());
    assert!(!fs.open(id, Some(Duration::ZERO), Tier::Super).is_valid());
    drop(handle);
    assert!(fs.open(id, Some(Duration::ZERO), Tier::Super).is_valid());
}

#[test]
fn test_erase_invalidates_caches() {
    let (_, fs) = ram_fs(256);
    let id = FileId(19);
    fs.create(id, 1, Attributes::DEFAULT, WAIT).unwrap();
    let owning = FileCache::new(&fs, id);
    let other = FileCache::new(&fs, FileId(20));
    assert!(owning.take_ownership());

    fs.erase().unwrap();
    assert!(!owning.is_valid());
    assert!(!owning.has_ownership());
    assert!(!other.is_valid());

    fs.create(id, 1, Attributes::DEFAULT, WAIT).unwrap();
    assert!(owning.is_valid());
    assert!(owning.take_ownership());
}

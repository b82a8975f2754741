//! EFS is a small flat file system for the EEPROM of a motion controller.
//! Files are identified by an 8-bit id, live in one contiguous run of pages and never grow.
//!
//! EFS's linear layout (in EFS pages, from `Geometry::base_address`):
//! - Header pages: filesystem header, then the file directory
//! - Bitmap pages: one bit per EFS page, set when the page is in use
//! - Data pages
//!
//! EFS's layers (from bottom to top):
//! 1. Page Device: Abstraction for the EEPROM and its bus lock.     Bus synchronization        | User implemented (hardware-specific)
//! 2. Header/Directory/Bitmap: On-device metadata.                  Filesystem lock            | Fs implemented
//! 3. Allocator/Ownership: Page placement and exclusive access.     Filesystem lock            | Fs implemented
//! 4. Handle: Data access to one open file.                         Ownership                  | Fs implemented
//! 5. Caches: Record caches so hot files open without a scan.       Filesystem lock            | Fs implemented
//! 6. Efs: The main file system interface for users.                                           | User implemented (tasks, comms, etc.)

mod config;
mod storage;
mod structs;
mod header;
mod directory;
mod bitmap;
mod allocator;
mod ownership;
mod wait;
mod cache;
mod file_cache;
mod handle;
mod fs;
mod error;

pub use storage::{BusGuard, BusLock, PageDevice, RamDevice};
pub use config::*;
pub use structs::*;
pub use header::read_header;
pub use cache::{MetadataCache, MetadataCachePool};
pub use file_cache::FileCache;
pub use handle::Handle;
pub use fs::Efs;
pub use error::FsError as Error;
pub use error::Result;

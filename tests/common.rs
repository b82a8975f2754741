//! Common utilities for tests
#![allow(unused)]

use std::sync::Arc;
use std::time::Duration;

use efs::{Efs, Geometry, RamDevice};

pub const ORANGE: &str = "\x1b[38;5;214m";
pub const RESET: &str = "\x1b[0m";

/// Size of the simulated EEPROM, enough for the default geometry.
pub const DEVICE_SIZE: usize = 64 * 1024;

/// Generous bound for calls that are expected to succeed.
pub const WAIT: Option<Duration> = Some(Duration::from_secs(2));

/// Provides a macro for logging messages during tests.
/// e.g. log!("placeholder") -> println!("[test] placeholder");
#[macro_export]
macro_rules! log {
    ($msg:expr, $($arg:tt)*) => {
        println!("{}[test] {}{}", crate::common::ORANGE, format!($msg, $($arg)*), crate::common::RESET)
    };
}

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Initialised filesystem with the default geometry on a RAM device with `phys_page` byte pages.
pub fn ram_fs(phys_page: usize) -> (Arc<RamDevice>, Efs<RamDevice>) {
    init_logger();
    let dev = Arc::new(RamDevice::new(DEVICE_SIZE, phys_page));
    let fs = Efs::new(dev.clone(), Geometry::DEFAULT).unwrap();
    fs.init().unwrap();
    (dev, fs)
}

/// Recognisable test data: `seed`, `seed + 1`, ... wrapping at 256.
pub fn cycler(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_add(seed)).collect()
}

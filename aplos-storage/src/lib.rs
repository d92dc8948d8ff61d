pub mod buffer_pool;
pub mod config;
pub mod engine;
mod error;
pub mod page;
pub mod pager;
pub mod stats;
pub mod tree;
pub mod wal;

pub use crate::config::Options;
pub use crate::engine::Engine;
pub use crate::error::{Error, Result};

/// `b"APLS"` read as a little-endian u32.
pub const SUPERBLOCK_MAGIC: u32 = 0x4150_4C53;
pub const FORMAT_VERSION: u16 = 1;

pub const MIN_PAGE_SIZE: usize = 4096;
/// Largest page size representable in the superblock's u16 field.
pub const MAX_PAGE_SIZE: usize = 32768;
pub const DEFAULT_PAGE_SIZE: usize = 8192;

/// Fixed file names inside the caller-provided directory.
pub const DATA_FILE_NAME: &str = "aplos.db";
pub const WAL_FILE_NAME: &str = "aplos.wal";

pub(crate) fn crc32(bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

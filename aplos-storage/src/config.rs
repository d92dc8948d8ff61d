use crate::{DEFAULT_PAGE_SIZE, Error, MAX_PAGE_SIZE, MIN_PAGE_SIZE, Result};
use serde::{Deserialize, Serialize};

/// Engine configuration. All configuration is passed to
/// [`Engine::open`](crate::Engine::open); there is no ambient state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Options {
    /// Page size in bytes. Power of two in `4096..=32768`. Written into the
    /// superblock on create and must match on every subsequent open.
    pub page_size: usize,
    /// Buffer pool capacity, in frames (one page-sized buffer each).
    pub max_cached_pages: usize,
    /// Verify the page checksum on every read. Disable only for benchmarks.
    pub validate_checksums_on_read: bool,
    /// Fsync the WAL on every commit. Disabling weakens durability but
    /// leaves interface semantics unchanged.
    pub fsync_on_commit: bool,
    /// Committed page images since the last checkpoint that trigger an
    /// automatic WAL checkpoint.
    pub checkpoint_threshold: u64,
    /// Buffered logical writes before an automatic batch flush. At the
    /// default of 1 every put commits before returning.
    pub write_queue_capacity: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            max_cached_pages: 256,
            validate_checksums_on_read: true,
            fsync_on_commit: true,
            checkpoint_threshold: 1024,
            write_queue_capacity: 1,
        }
    }
}

impl Options {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.page_size < MIN_PAGE_SIZE
            || self.page_size > MAX_PAGE_SIZE
            || !self.page_size.is_power_of_two()
        {
            return Err(Error::InvalidPageSize(self.page_size));
        }
        if self.max_cached_pages == 0 {
            return Err(Error::InvalidCacheSize(self.max_cached_pages));
        }
        Ok(())
    }
}

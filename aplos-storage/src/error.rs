use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid page size {0}: must be a power of two in 4096..=32768")]
    InvalidPageSize(usize),

    #[error("invalid cache size {0}: must hold at least one page")]
    InvalidCacheSize(usize),

    #[error("data file too small: {0} bytes")]
    FileTooSmall(u64),

    #[error("data file length {0} is not a multiple of the page size")]
    FileLengthMisaligned(u64),

    #[error("invalid file magic")]
    InvalidMagic,

    #[error("unsupported format version {0}")]
    UnsupportedVersion(u16),

    #[error("page size mismatch: file has {on_disk}, engine opened with {configured}")]
    PageSizeMismatch { on_disk: u16, configured: u16 },

    #[error("superblock checksum mismatch")]
    SuperblockChecksum,

    #[error("page {0} checksum mismatch")]
    PageChecksum(u64),

    #[error("page id {0} out of range")]
    PageIdOutOfRange(u64),

    #[error("record too large: key {key_len} bytes, value {value_len} bytes")]
    RecordTooLarge { key_len: usize, value_len: usize },

    #[error("wal protocol error: {0}")]
    WalProtocol(&'static str),

    #[error("storage corrupted: {0}")]
    StorageCorrupted(&'static str),

    #[error("engine is closed")]
    Closed,

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
}

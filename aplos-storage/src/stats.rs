use serde::Serialize;

/// Buffer pool counters, cumulative since open.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Point-in-time engine snapshot for diagnostics.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct EngineStats {
    pub cache: CacheStats,
    pub commits: u64,
    pub page_images_logged: u64,
    pub checkpoints: u64,
    pub generation: u64,
    pub entry_count: u64,
}

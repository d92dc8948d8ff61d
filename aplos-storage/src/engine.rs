//! Engine façade: composes the pager, buffer pool, tree navigator, and WAL.
//!
//! Single writer, many readers. Writers serialise on one lock covering the
//! tree mutation, WAL append, data-file writes, and superblock update.
//! Readers snapshot the root pointer and generation at operation start and
//! walk only pages reachable from that snapshot.
//!
//! Commit order, per logical batch: every dirty page image to the WAL, one
//! commit record, WAL fsync, then the images through the page manager, cache
//! invalidation, and finally the superblock. A crash after the commit record
//! is recovered by WAL replay; a crash before it loses only the in-flight
//! batch.

use crate::buffer_pool::BufferPool;
use crate::config::Options;
use crate::page::Page;
use crate::pager::{PageId, Pager, Superblock};
use crate::stats::EngineStats;
use crate::tree::{self, PageSource, WriteTree};
use crate::wal::Wal;
use crate::{DATA_FILE_NAME, Error, Result, WAL_FILE_NAME};
use aplos_api::KvStore;
use log::{debug, info, warn};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

/// Root pointer, generation, and entry count, snapshotted together so a
/// reader never observes a partially-applied commit.
#[derive(Debug, Clone, Copy)]
struct TreeState {
    root: u64,
    generation: u64,
    entry_count: u64,
}

enum PendingOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

struct WriteState {
    pending: Vec<PendingOp>,
    images_since_checkpoint: u64,
}

pub struct Engine {
    data_path: PathBuf,
    wal_path: PathBuf,
    opts: Options,

    pager: RwLock<Pager>,
    wal: Mutex<Wal>,
    cache: BufferPool,
    state: RwLock<TreeState>,
    writer: Mutex<WriteState>,
    closed: AtomicBool,

    commits: AtomicU64,
    images_logged: AtomicU64,
    checkpoints: AtomicU64,
}

struct Reader<'a> {
    pager: &'a RwLock<Pager>,
    cache: &'a BufferPool,
}

impl PageSource for Reader<'_> {
    // The pager read lock is held across the miss fill so a concurrent
    // writer's invalidation cannot interleave with a stale install.
    fn read_page(&self, page_id: u64) -> Result<Vec<u8>> {
        let pager = self.pager.read().unwrap();
        let mut buf = vec![0u8; pager.page_size()];
        if self.cache.try_get(page_id, &mut buf) {
            return Ok(buf);
        }
        pager.read_page(PageId::new(page_id), &mut buf)?;
        self.cache.put(page_id, &buf);
        Ok(buf)
    }
}

struct RawSource<'a>(&'a Pager);

impl PageSource for RawSource<'_> {
    fn read_page(&self, page_id: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.0.page_size()];
        self.0.read_page(PageId::new(page_id), &mut buf)?;
        Ok(buf)
    }
}

impl Engine {
    /// Open (creating if necessary) the engine in `dir`, which must already
    /// exist. Runs WAL recovery before returning.
    pub fn open(dir: impl AsRef<Path>, opts: Options) -> Result<Self> {
        opts.validate()?;
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("engine directory does not exist: {}", dir.display()),
            )));
        }

        let data_path = dir.join(DATA_FILE_NAME);
        let wal_path = dir.join(WAL_FILE_NAME);

        let mut pager = Pager::open(&data_path, opts.page_size, opts.validate_checksums_on_read)?;
        let mut wal = Wal::open(&wal_path)?;

        let replay = wal.recover(&mut pager)?;
        if replay.commits_applied > 0 || replay.bytes_discarded > 0 {
            info!(
                "wal recovery: {} commits applied, {} pages, {} bytes discarded",
                replay.commits_applied, replay.pages_applied, replay.bytes_discarded
            );
        }

        let sb = pager.read_superblock()?;
        if sb.root_page_id < 0 || sb.root_page_id as u64 >= pager.page_count() {
            return Err(Error::StorageCorrupted("root page id out of range"));
        }
        let root = sb.root_page_id as u64;

        // Older files may lack a usable cached count; rebuild it from the
        // leaf chain once and persist the repair.
        let entry_count = if sb.entry_count >= 0 {
            sb.entry_count as u64
        } else {
            let counted = tree::count_entries(&RawSource(&pager), root)?;
            pager.write_superblock(&Superblock {
                entry_count: counted as i64,
                ..sb
            })?;
            info!("repaired cached entry count: {counted}");
            counted
        };

        info!(
            "opened engine at {} (root={root}, generation={}, entries={entry_count})",
            dir.display(),
            sb.generation
        );

        let cache = BufferPool::new(opts.max_cached_pages, opts.page_size);
        Ok(Self {
            data_path,
            wal_path,
            opts,
            pager: RwLock::new(pager),
            wal: Mutex::new(wal),
            cache,
            state: RwLock::new(TreeState {
                root,
                generation: sb.generation as u64,
                entry_count,
            }),
            writer: Mutex::new(WriteState {
                pending: Vec::new(),
                images_since_checkpoint: 0,
            }),
            closed: AtomicBool::new(false),
            commits: AtomicU64::new(0),
            images_logged: AtomicU64::new(0),
            checkpoints: AtomicU64::new(0),
        })
    }

    #[inline]
    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    #[inline]
    pub fn wal_path(&self) -> &Path {
        &self.wal_path
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn reader(&self) -> Reader<'_> {
        Reader {
            pager: &self.pager,
            cache: &self.cache,
        }
    }

    /// Insert or replace one pair. With the default queue capacity of 1 the
    /// write is durable when this returns; larger capacities batch commits.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.ensure_open()?;
        tree::check_record_size(self.opts.page_size, key, value)?;

        let mut ws = self.writer.lock().unwrap();
        ws.pending.push(PendingOp::Put {
            key: key.to_vec(),
            value: value.to_vec(),
        });
        if ws.pending.len() >= self.opts.write_queue_capacity.max(1) {
            self.flush_locked(&mut ws)?;
        }
        Ok(())
    }

    /// Remove `key` if present. Flushes the pending batch (the delete rides
    /// in the same commit) so the result reflects earlier buffered puts.
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        self.ensure_open()?;
        let mut ws = self.writer.lock().unwrap();
        ws.pending.push(PendingOp::Delete { key: key.to_vec() });
        let results = self.flush_locked(&mut ws)?;
        Ok(*results.last().unwrap_or(&false))
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.ensure_open()?;
        self.flush_pending()?;
        let root = self.state.read().unwrap().root;
        tree::search(&self.reader(), root, key)
    }

    /// Live entry count, O(1) from the cached counter.
    pub fn count(&self) -> Result<u64> {
        self.ensure_open()?;
        self.flush_pending()?;
        Ok(self.state.read().unwrap().entry_count)
    }

    /// Lazy ordered iteration over the whole snapshot.
    pub fn scan(&self) -> Result<Scan<'_>> {
        self.ensure_open()?;
        self.flush_pending()?;
        let root = self.state.read().unwrap().root;
        let leaf = tree::leftmost_leaf(&self.reader(), root)?;
        Ok(Scan {
            reader: self.reader(),
            leaf,
            slot: 0,
            end: None,
            done: false,
        })
    }

    /// Lazy ordered iteration over `start..=end`.
    pub fn range(&self, start: &[u8], end: &[u8]) -> Result<Scan<'_>> {
        self.ensure_open()?;
        self.flush_pending()?;
        let root = self.state.read().unwrap().root;

        let mut leaf = tree::leaf_for_key(&self.reader(), root, start)?;
        let mut slot = 0;
        if let Some(buf) = &mut leaf {
            let (idx, _) = Page::new(buf).leaf_lower_bound(start)?;
            slot = idx;
        }
        Ok(Scan {
            reader: self.reader(),
            leaf,
            slot,
            end: Some(end.to_vec()),
            done: false,
        })
    }

    /// Manual WAL checkpoint: flush pending writes, then truncate the log.
    pub fn checkpoint(&self) -> Result<()> {
        self.ensure_open()?;
        let mut ws = self.writer.lock().unwrap();
        self.flush_locked(&mut ws)?;
        self.checkpoint_locked(&mut ws)
    }

    /// Force the pending write batch through a commit.
    pub fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        self.flush_pending()
    }

    /// Flush pending work and make subsequent operations fail with
    /// [`Error::Closed`].
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut ws = self.writer.lock().unwrap();
        self.flush_locked(&mut ws)?;
        self.checkpoint_locked(&mut ws)?;
        self.pager.write().unwrap().sync()?;
        debug!("engine closed");
        Ok(())
    }

    pub fn stats(&self) -> EngineStats {
        let state = self.state.read().unwrap();
        EngineStats {
            cache: self.cache.stats(),
            commits: self.commits.load(Ordering::Relaxed),
            page_images_logged: self.images_logged.load(Ordering::Relaxed),
            checkpoints: self.checkpoints.load(Ordering::Relaxed),
            generation: state.generation,
            entry_count: state.entry_count,
        }
    }

    /// Walk the whole tree checking structural invariants and the cached
    /// entry count. Diagnostic surface; reads every page.
    pub fn verify_integrity(&self) -> Result<()> {
        self.ensure_open()?;
        self.flush_pending()?;
        let state = *self.state.read().unwrap();
        tree::verify(&self.reader(), state.root, state.entry_count)
    }

    fn flush_pending(&self) -> Result<()> {
        let mut ws = self.writer.lock().unwrap();
        self.flush_locked(&mut ws)?;
        Ok(())
    }

    /// Run the pending batch as one logical WAL commit. Per-op results are
    /// returned in order (put: new key added; delete: key removed).
    fn flush_locked(&self, ws: &mut WriteState) -> Result<Vec<bool>> {
        if ws.pending.is_empty() {
            return Ok(Vec::new());
        }
        let ops = std::mem::take(&mut ws.pending);

        let state = *self.state.read().unwrap();
        let mut pager = self.pager.write().unwrap();

        let mut tree = WriteTree::new(&mut *pager, &self.cache, state.root);
        let mut entry_count = state.entry_count;
        let mut results = Vec::with_capacity(ops.len());
        for op in &ops {
            let changed = match op {
                PendingOp::Put { key, value } => {
                    let added = tree.insert(key, value)?;
                    if added {
                        entry_count += 1;
                    }
                    added
                }
                PendingOp::Delete { key } => {
                    let removed = tree.delete(key)?;
                    if removed {
                        entry_count -= 1;
                    }
                    removed
                }
            };
            results.push(changed);
        }

        let new_root = tree.root();
        let dirty = tree.into_dirty();
        if dirty.is_empty() && new_root == state.root {
            // Nothing changed (e.g. deletes of absent keys): no commit.
            return Ok(results);
        }

        let generation = state.generation + 1;
        {
            let mut wal = self.wal.lock().unwrap();
            for (page_id, buf) in &dirty {
                wal.append_page_image(PageId::new(*page_id), buf)?;
            }
            wal.append_commit(new_root, generation, entry_count)?;
            if self.opts.fsync_on_commit {
                wal.fsync()?;
            }
        }

        for (page_id, buf) in &dirty {
            pager.write_page(PageId::new(*page_id), buf)?;
            self.cache.invalidate(*page_id);
        }
        pager.write_superblock(&Superblock {
            entry_count: entry_count as i64,
            root_page_id: new_root as i64,
            generation: generation as i64,
            free_list_head: 0,
        })?;

        *self.state.write().unwrap() = TreeState {
            root: new_root,
            generation,
            entry_count,
        };

        self.commits.fetch_add(1, Ordering::Relaxed);
        self.images_logged.fetch_add(dirty.len() as u64, Ordering::Relaxed);
        ws.images_since_checkpoint += dirty.len() as u64;

        drop(pager);
        if ws.images_since_checkpoint > self.opts.checkpoint_threshold {
            self.checkpoint_locked(ws)?;
        }
        Ok(results)
    }

    /// Normal commits push every image to the data file before returning, so
    /// the log is advisory once quiescent and can simply be dropped.
    fn checkpoint_locked(&self, ws: &mut WriteState) -> Result<()> {
        debug_assert!(ws.pending.is_empty());
        self.wal.lock().unwrap().truncate()?;
        ws.images_since_checkpoint = 0;
        self.checkpoints.fetch_add(1, Ordering::Relaxed);
        debug!("wal checkpoint");
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            if let Err(e) = Engine::close(self) {
                warn!("close on drop failed: {e}");
            }
        }
    }
}

/// Lazy ordered iterator over the leaf chain of one root snapshot.
pub struct Scan<'a> {
    reader: Reader<'a>,
    leaf: Option<Vec<u8>>,
    slot: usize,
    end: Option<Vec<u8>>,
    done: bool,
}

impl Iterator for Scan<'_> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let Some(buf) = self.leaf.as_mut() else {
                self.done = true;
                return None;
            };
            let page = Page::new(buf);

            if self.slot < page.item_count() {
                match page.leaf_entry(self.slot) {
                    Ok((key, value)) => {
                        if let Some(end) = &self.end {
                            if key > end.as_slice() {
                                self.done = true;
                                return None;
                            }
                        }
                        let item = (key.to_vec(), value.to_vec());
                        self.slot += 1;
                        return Some(Ok(item));
                    }
                    Err(e) => {
                        self.done = true;
                        return Some(Err(e));
                    }
                }
            }

            let next = page.right_sibling();
            if next == 0 {
                self.done = true;
                return None;
            }
            match self.reader.read_page(next) {
                Ok(next_buf) => {
                    self.leaf = Some(next_buf);
                    self.slot = 0;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

impl KvStore for Engine {
    type Error = Error;

    type Entries<'a> = Scan<'a>;

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        Engine::put(self, key, value)
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Engine::get(self, key)
    }

    fn delete(&self, key: &[u8]) -> Result<bool> {
        Engine::delete(self, key)
    }

    fn scan(&self) -> Result<Scan<'_>> {
        Engine::scan(self)
    }

    fn range(&self, start: &[u8], end: &[u8]) -> Result<Scan<'_>> {
        Engine::range(self, start, end)
    }

    fn count(&self) -> Result<u64> {
        Engine::count(self)
    }

    fn checkpoint(&self) -> Result<()> {
        Engine::checkpoint(self)
    }

    fn close(self) -> Result<()> {
        Engine::close(&self)
    }
}

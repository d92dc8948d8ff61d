//! B+Tree navigator.
//!
//! Walks root-to-leaf through the buffer pool, mutating pages as an in-memory
//! dirty-set overlay. The engine owns the commit sequence: it logs the dirty
//! images to the WAL, writes them through the page manager, and invalidates
//! them in the buffer pool. Page ids 0 mean "none" throughout; page 0 itself
//! is the superblock and never a tree page.

use crate::buffer_pool::BufferPool;
use crate::page::{self, Page, PageType, SLOT_SIZE};
use crate::pager::{PageId, Pager};
use crate::{Error, Result};
use std::collections::BTreeMap;

/// Read access to committed pages. The engine implements this over the pager
/// and buffer pool; the write path layers its dirty overlay on top.
pub trait PageSource {
    fn read_page(&self, page_id: u64) -> Result<Vec<u8>>;
}

/// Reject records the slotted layout cannot rebalance: a record (and the
/// separator it may become) must fit in half a page so splits always succeed.
pub(crate) fn check_record_size(page_size: usize, key: &[u8], value: &[u8]) -> Result<()> {
    let leaf_max = page::max_leaf_record(page_size);
    let internal_max = page::max_internal_record(page_size);
    if page::leaf_record_len(key, value) > leaf_max || page::internal_record_len(key) > internal_max
    {
        return Err(Error::RecordTooLarge {
            key_len: key.len(),
            value_len: value.len(),
        });
    }
    Ok(())
}

/// Point lookup from a root snapshot.
pub fn search<S: PageSource>(src: &S, root: u64, key: &[u8]) -> Result<Option<Vec<u8>>> {
    if root == 0 {
        return Ok(None);
    }
    let mut cur = root;
    loop {
        let mut buf = src.read_page(cur)?;
        let page = Page::new(&mut buf);
        match page.page_type()? {
            PageType::Internal => {
                let pos = page.child_position(key)?;
                cur = page.child_at(pos)?;
                if cur == 0 {
                    return Err(Error::StorageCorrupted("zero child pointer"));
                }
            }
            PageType::Leaf => {
                let (idx, exact) = page.leaf_lower_bound(key)?;
                if exact {
                    let (_, value) = page.leaf_entry(idx)?;
                    return Ok(Some(value.to_vec()));
                }
                return Ok(None);
            }
        }
    }
}

/// Leftmost leaf of the tree, for full scans.
pub fn leftmost_leaf<S: PageSource>(src: &S, root: u64) -> Result<Option<Vec<u8>>> {
    if root == 0 {
        return Ok(None);
    }
    let mut cur = root;
    loop {
        let mut buf = src.read_page(cur)?;
        let page = Page::new(&mut buf);
        match page.page_type()? {
            PageType::Internal => {
                cur = page.leftmost_child();
                if cur == 0 {
                    return Err(Error::StorageCorrupted("zero leftmost child"));
                }
            }
            PageType::Leaf => return Ok(Some(buf)),
        }
    }
}

/// The leaf that would contain `key`, for range scans.
pub fn leaf_for_key<S: PageSource>(src: &S, root: u64, key: &[u8]) -> Result<Option<Vec<u8>>> {
    if root == 0 {
        return Ok(None);
    }
    let mut cur = root;
    loop {
        let mut buf = src.read_page(cur)?;
        let page = Page::new(&mut buf);
        match page.page_type()? {
            PageType::Internal => {
                let pos = page.child_position(key)?;
                cur = page.child_at(pos)?;
                if cur == 0 {
                    return Err(Error::StorageCorrupted("zero child pointer"));
                }
            }
            PageType::Leaf => return Ok(Some(buf)),
        }
    }
}

/// Live entries counted by walking the leaf chain. Used to repair a missing
/// cached count, never on the hot path.
pub fn count_entries<S: PageSource>(src: &S, root: u64) -> Result<u64> {
    let Some(mut buf) = leftmost_leaf(src, root)? else {
        return Ok(0);
    };
    let mut total = 0u64;
    loop {
        let page = Page::new(&mut buf);
        total += page.item_count() as u64;
        let next = page.right_sibling();
        if next == 0 {
            return Ok(total);
        }
        buf = src.read_page(next)?;
    }
}

enum InsertOutcome {
    Done,
    Split { sep: Vec<u8>, right: u64 },
}

/// One logical mutation against the tree: accumulates every modified page
/// image; nothing is visible until the engine commits the dirty set.
pub struct WriteTree<'a> {
    pager: &'a mut Pager,
    cache: &'a BufferPool,
    dirty: BTreeMap<u64, Vec<u8>>,
    root: u64,
}

impl<'a> WriteTree<'a> {
    pub fn new(pager: &'a mut Pager, cache: &'a BufferPool, root: u64) -> Self {
        Self {
            pager,
            cache,
            dirty: BTreeMap::new(),
            root,
        }
    }

    pub fn root(&self) -> u64 {
        self.root
    }

    /// The modified page images, checksums finalised, ready for the WAL.
    pub fn into_dirty(self) -> BTreeMap<u64, Vec<u8>> {
        let mut dirty = self.dirty;
        for buf in dirty.values_mut() {
            page::set_checksum(buf);
        }
        dirty
    }

    fn page_size(&self) -> usize {
        self.pager.page_size()
    }

    fn read_page(&self, page_id: u64) -> Result<Vec<u8>> {
        if let Some(buf) = self.dirty.get(&page_id) {
            return Ok(buf.clone());
        }
        let mut buf = vec![0u8; self.page_size()];
        if self.cache.try_get(page_id, &mut buf) {
            return Ok(buf);
        }
        self.pager.read_page(PageId::new(page_id), &mut buf)?;
        self.cache.put(page_id, &buf);
        Ok(buf)
    }

    fn write_page(&mut self, page_id: u64, buf: Vec<u8>) {
        self.dirty.insert(page_id, buf);
    }

    fn allocate(&mut self) -> Result<u64> {
        Ok(self.pager.allocate_page()?.as_u64())
    }

    /// Insert or replace. Returns whether a new key was added.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<bool> {
        check_record_size(self.page_size(), key, value)?;

        if self.root == 0 {
            let id = self.allocate()?;
            let mut buf = vec![0u8; self.page_size()];
            Page::init_leaf(&mut buf);
            Page::new(&mut buf).leaf_insert_at(0, key, value);
            self.write_page(id, buf);
            self.root = id;
            return Ok(true);
        }

        let (outcome, added) = self.insert_rec(self.root, key, value)?;
        if let InsertOutcome::Split { sep, right } = outcome {
            let level = {
                let mut old = self.read_page(self.root)?;
                Page::new(&mut old).level() + 1
            };
            let id = self.allocate()?;
            let mut buf = vec![0u8; self.page_size()];
            Page::init_internal(&mut buf, level, self.root);
            Page::new(&mut buf).internal_insert_at(0, &sep, right);
            self.write_page(id, buf);
            self.root = id;
        }
        Ok(added)
    }

    fn insert_rec(&mut self, page_id: u64, key: &[u8], value: &[u8]) -> Result<(InsertOutcome, bool)> {
        let mut buf = self.read_page(page_id)?;
        match Page::new(&mut buf).page_type()? {
            PageType::Leaf => self.leaf_insert(page_id, buf, key, value),
            PageType::Internal => {
                let (pos, child) = {
                    let page = Page::new(&mut buf);
                    let pos = page.child_position(key)?;
                    (pos, page.child_at(pos)?)
                };
                if child == 0 {
                    return Err(Error::StorageCorrupted("zero child pointer"));
                }

                let (outcome, added) = self.insert_rec(child, key, value)?;
                match outcome {
                    InsertOutcome::Done => Ok((InsertOutcome::Done, added)),
                    InsertOutcome::Split { sep, right } => {
                        // The descent only dirtied the subtree below; `buf`
                        // is still current for this page.
                        let outcome = self.internal_insert(page_id, buf, pos, sep, right)?;
                        Ok((outcome, added))
                    }
                }
            }
        }
    }

    fn leaf_insert(
        &mut self,
        page_id: u64,
        mut buf: Vec<u8>,
        key: &[u8],
        value: &[u8],
    ) -> Result<(InsertOutcome, bool)> {
        let (idx, exact) = Page::new(&mut buf).leaf_lower_bound(key)?;

        if exact {
            // Replacement rewrites the record even at equal length, keeping a
            // single path for checksum recomputation.
            let (mut entries, right_sibling) = {
                let page = Page::new(&mut buf);
                (page.leaf_entries()?, page.right_sibling())
            };
            entries[idx].1 = value.to_vec();

            let usable = self.page_size() - page::LEAF_SLOTS_OFF;
            if page::leaf_bytes(&entries) <= usable {
                Page::rebuild_leaf(&mut buf, right_sibling, &entries);
                self.write_page(page_id, buf);
                Ok((InsertOutcome::Done, false))
            } else {
                let outcome = self.split_leaf(page_id, buf, right_sibling, entries)?;
                Ok((outcome, false))
            }
        } else if Page::new(&mut buf).leaf_has_room(key, value) {
            Page::new(&mut buf).leaf_insert_at(idx, key, value);
            self.write_page(page_id, buf);
            Ok((InsertOutcome::Done, true))
        } else {
            let (mut entries, right_sibling) = {
                let page = Page::new(&mut buf);
                (page.leaf_entries()?, page.right_sibling())
            };
            entries.insert(idx, (key.to_vec(), value.to_vec()));
            let outcome = self.split_leaf(page_id, buf, right_sibling, entries)?;
            Ok((outcome, true))
        }
    }

    fn split_leaf(
        &mut self,
        page_id: u64,
        mut buf: Vec<u8>,
        old_right_sibling: u64,
        entries: Vec<(Vec<u8>, Vec<u8>)>,
    ) -> Result<InsertOutcome> {
        let usable = self.page_size() - page::LEAF_SLOTS_OFF;
        let sizes: Vec<usize> = entries
            .iter()
            .map(|(k, v)| page::leaf_record_len(k, v) + SLOT_SIZE)
            .collect();
        let mid = split_index(&sizes, usable);

        let right_id = self.allocate()?;
        let mut right_buf = vec![0u8; self.page_size()];
        Page::rebuild_leaf(&mut right_buf, old_right_sibling, &entries[mid..]);
        Page::rebuild_leaf(&mut buf, right_id, &entries[..mid]);

        let sep = entries[mid].0.clone();
        self.write_page(page_id, buf);
        self.write_page(right_id, right_buf);
        Ok(InsertOutcome::Split { sep, right: right_id })
    }

    fn internal_insert(
        &mut self,
        page_id: u64,
        mut buf: Vec<u8>,
        pos: usize,
        sep: Vec<u8>,
        right_child: u64,
    ) -> Result<InsertOutcome> {
        if Page::new(&mut buf).internal_has_room(&sep) {
            Page::new(&mut buf).internal_insert_at(pos, &sep, right_child);
            self.write_page(page_id, buf);
            return Ok(InsertOutcome::Done);
        }

        // Split: the median separator is promoted, its child becomes the new
        // right node's leftmost child.
        let (level, leftmost, mut entries) = {
            let page = Page::new(&mut buf);
            (page.level(), page.leftmost_child(), page.internal_entries()?)
        };
        entries.insert(pos, (sep, right_child));

        let usable = self.page_size() - page::INTERNAL_SLOTS_OFF;
        let sizes: Vec<usize> = entries
            .iter()
            .map(|(k, _)| page::internal_record_len(k) + SLOT_SIZE)
            .collect();
        let mid = promote_index(&sizes, usable);

        let right_id = self.allocate()?;
        let mut right_buf = vec![0u8; self.page_size()];
        Page::rebuild_internal(&mut right_buf, level, entries[mid].1, &entries[mid + 1..]);
        Page::rebuild_internal(&mut buf, level, leftmost, &entries[..mid]);

        let promote = entries[mid].0.clone();
        self.write_page(page_id, buf);
        self.write_page(right_id, right_buf);
        Ok(InsertOutcome::Split {
            sep: promote,
            right: right_id,
        })
    }

    /// Remove `key`. Returns false without mutating anything when absent.
    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        if self.root == 0 {
            return Ok(false);
        }
        if !self.delete_rec(self.root, key)? {
            return Ok(false);
        }

        // Root collapse: an internal root with no separators hands the root
        // to its leftmost child; an empty root leaf empties the tree.
        loop {
            let mut buf = self.read_page(self.root)?;
            let page = Page::new(&mut buf);
            match page.page_type()? {
                PageType::Internal if page.item_count() == 0 => {
                    self.root = page.leftmost_child();
                    if self.root == 0 {
                        return Err(Error::StorageCorrupted("zero leftmost child"));
                    }
                }
                PageType::Leaf if page.item_count() == 0 => {
                    self.root = 0;
                    break;
                }
                _ => break,
            }
        }
        Ok(true)
    }

    fn delete_rec(&mut self, page_id: u64, key: &[u8]) -> Result<bool> {
        let mut buf = self.read_page(page_id)?;
        match Page::new(&mut buf).page_type()? {
            PageType::Leaf => {
                let (idx, exact) = Page::new(&mut buf).leaf_lower_bound(key)?;
                if !exact {
                    return Ok(false);
                }
                let (mut entries, right_sibling) = {
                    let page = Page::new(&mut buf);
                    (page.leaf_entries()?, page.right_sibling())
                };
                entries.remove(idx);
                Page::rebuild_leaf(&mut buf, right_sibling, &entries);
                self.write_page(page_id, buf);
                Ok(true)
            }
            PageType::Internal => {
                let (pos, child) = {
                    let page = Page::new(&mut buf);
                    let pos = page.child_position(key)?;
                    (pos, page.child_at(pos)?)
                };
                if child == 0 {
                    return Err(Error::StorageCorrupted("zero child pointer"));
                }

                if !self.delete_rec(child, key)? {
                    return Ok(false);
                }

                let mut child_buf = self.read_page(child)?;
                if Page::new(&mut child_buf).is_underfull() {
                    self.rebalance_child(page_id, pos)?;
                }
                Ok(true)
            }
        }
    }

    /// Merge the underfull child at `pos` with a sibling, or redistribute
    /// when the combined content no longer fits one page. Prefers the right
    /// sibling.
    fn rebalance_child(&mut self, parent_id: u64, pos: usize) -> Result<()> {
        let mut pbuf = self.read_page(parent_id)?;
        let sep_count = Page::new(&mut pbuf).item_count();
        if sep_count == 0 {
            // Lone child: nothing to borrow from. Root collapse will absorb
            // this node if it is the root.
            return Ok(());
        }

        let (left_pos, right_pos) = if pos < sep_count {
            (pos, pos + 1)
        } else {
            (pos - 1, pos)
        };
        let sep_idx = left_pos;

        let (left_id, right_id, sep_key, mut parent_entries, parent_level, parent_leftmost) = {
            let page = Page::new(&mut pbuf);
            (
                page.child_at(left_pos)?,
                page.child_at(right_pos)?,
                page.internal_entry(sep_idx)?.0.to_vec(),
                page.internal_entries()?,
                page.level(),
                page.leftmost_child(),
            )
        };

        let mut left_buf = self.read_page(left_id)?;
        let mut right_buf = self.read_page(right_id)?;
        let usable_internal = self.page_size() - page::INTERNAL_SLOTS_OFF;

        // A redistribution swaps the parent separator for the new right
        // page's first key, which may be longer. The parent must still fit;
        // when it would not, the child is left underfull rather than risking
        // an overflowing parent rebuild.
        let parent_fits = |entries: &[(Vec<u8>, u64)]| page::internal_bytes(entries) <= usable_internal;

        match { Page::new(&mut left_buf).page_type()? } {
            PageType::Leaf => {
                let mut combined = { Page::new(&mut left_buf).leaf_entries()? };
                combined.extend({ Page::new(&mut right_buf).leaf_entries()? });
                let chain_next = Page::new(&mut right_buf).right_sibling();

                let usable = self.page_size() - page::LEAF_SLOTS_OFF;
                if page::leaf_bytes(&combined) <= usable {
                    // Merge into the left page; the right page is dropped.
                    Page::rebuild_leaf(&mut left_buf, chain_next, &combined);
                    self.write_page(left_id, left_buf);
                    parent_entries.remove(sep_idx);
                } else {
                    let sizes: Vec<usize> = combined
                        .iter()
                        .map(|(k, v)| page::leaf_record_len(k, v) + SLOT_SIZE)
                        .collect();
                    let mid = split_index(&sizes, usable);
                    parent_entries[sep_idx] = (combined[mid].0.clone(), right_id);
                    if !parent_fits(&parent_entries) {
                        return Ok(());
                    }
                    Page::rebuild_leaf(&mut right_buf, chain_next, &combined[mid..]);
                    Page::rebuild_leaf(&mut left_buf, right_id, &combined[..mid]);
                    self.write_page(left_id, left_buf);
                    self.write_page(right_id, right_buf);
                }
            }
            PageType::Internal => {
                let (level, left_leftmost, mut combined) = {
                    let p = Page::new(&mut left_buf);
                    (p.level(), p.leftmost_child(), p.internal_entries()?)
                };
                // The parent separator comes down between the two halves,
                // pointing at the right node's leftmost child.
                {
                    let p = Page::new(&mut right_buf);
                    combined.push((sep_key, p.leftmost_child()));
                    combined.extend(p.internal_entries()?);
                }

                if page::internal_bytes(&combined) <= usable_internal {
                    Page::rebuild_internal(&mut left_buf, level, left_leftmost, &combined);
                    self.write_page(left_id, left_buf);
                    parent_entries.remove(sep_idx);
                } else {
                    let sizes: Vec<usize> = combined
                        .iter()
                        .map(|(k, _)| page::internal_record_len(k) + SLOT_SIZE)
                        .collect();
                    let mid = promote_index(&sizes, usable_internal);
                    parent_entries[sep_idx] = (combined[mid].0.clone(), right_id);
                    if !parent_fits(&parent_entries) {
                        return Ok(());
                    }
                    Page::rebuild_internal(&mut right_buf, level, combined[mid].1, &combined[mid + 1..]);
                    Page::rebuild_internal(&mut left_buf, level, left_leftmost, &combined[..mid]);
                    self.write_page(left_id, left_buf);
                    self.write_page(right_id, right_buf);
                }
            }
        }

        Page::rebuild_internal(&mut pbuf, parent_level, parent_leftmost, &parent_entries);
        self.write_page(parent_id, pbuf);
        Ok(())
    }
}

/// Split index for a sorted run of record sizes: median by count, with the
/// left side taking the smaller half on odd counts. Falls back to the
/// largest left prefix that fits when the median would overflow a side;
/// record-size caps guarantee the fallback leaves both sides fitting.
fn split_index(sizes: &[usize], usable: usize) -> usize {
    let n = sizes.len();
    debug_assert!(n >= 2);
    let total: usize = sizes.iter().sum();
    let left_bytes = |m: usize| sizes[..m].iter().sum::<usize>();

    let mid = (n / 2).max(1);
    if left_bytes(mid) <= usable && total - left_bytes(mid) <= usable {
        return mid;
    }

    // Largest left prefix that fits; the record-size cap keeps the
    // remainder within one page too.
    let mut best = 1;
    let mut acc = sizes[0];
    for (i, size) in sizes.iter().enumerate().skip(1) {
        if i >= n - 1 || acc + size > usable {
            break;
        }
        acc += size;
        best = i + 1;
    }
    best
}

/// Promotion index for an overflowing internal node: the median separator
/// leaves the page entirely, so both sides shed its bytes. Nudged off the
/// median only when a side would still overflow.
fn promote_index(sizes: &[usize], usable: usize) -> usize {
    let n = sizes.len();
    debug_assert!(n >= 3);
    let total: usize = sizes.iter().sum();
    let left_bytes = |m: usize| sizes[..m].iter().sum::<usize>();
    let fits = |m: usize| left_bytes(m) <= usable && total - left_bytes(m + 1) <= usable;

    let mid = n / 2;
    if fits(mid) {
        return mid;
    }
    for delta in 1..n {
        let lo = mid.saturating_sub(delta);
        if lo >= 1 && fits(lo) {
            return lo;
        }
        let hi = mid + delta;
        if hi <= n - 2 && fits(hi) {
            return hi;
        }
    }
    mid
}

/// Walk the whole tree verifying structural invariants: separator bounds,
/// in-leaf and cross-leaf ordering, level consistency, the sibling chain
/// visiting every leaf exactly once, and the cached entry count.
pub fn verify<S: PageSource>(src: &S, root: u64, expected_count: u64) -> Result<()> {
    if root == 0 {
        if expected_count != 0 {
            return Err(Error::StorageCorrupted("empty tree with nonzero count"));
        }
        return Ok(());
    }

    let mut leaves = Vec::new();
    let mut count = 0u64;
    verify_node(src, root, None, None, None, &mut leaves, &mut count)?;

    if count != expected_count {
        return Err(Error::StorageCorrupted("entry count mismatch"));
    }

    // The chain from the leftmost leaf must visit every leaf in key order.
    let mut chain = Vec::with_capacity(leaves.len());
    let mut cur = leaves[0];
    loop {
        chain.push(cur);
        let mut buf = src.read_page(cur)?;
        let next = Page::new(&mut buf).right_sibling();
        if next == 0 {
            break;
        }
        cur = next;
    }
    if chain != leaves {
        return Err(Error::StorageCorrupted("leaf chain does not match key order"));
    }
    Ok(())
}

fn verify_node<S: PageSource>(
    src: &S,
    page_id: u64,
    lower: Option<&[u8]>,
    upper: Option<&[u8]>,
    expect_level: Option<u8>,
    leaves: &mut Vec<u64>,
    count: &mut u64,
) -> Result<()> {
    let mut buf = src.read_page(page_id)?;
    let page = Page::new(&mut buf);
    if let Some(level) = expect_level {
        if page.level() != level {
            return Err(Error::StorageCorrupted("level mismatch"));
        }
    }

    match page.page_type()? {
        PageType::Leaf => {
            if page.level() != 0 {
                return Err(Error::StorageCorrupted("leaf with nonzero level"));
            }
            let mut prev: Option<Vec<u8>> = None;
            for i in 0..page.item_count() {
                let (key, _) = page.leaf_entry(i)?;
                if let Some(p) = &prev {
                    if key <= p.as_slice() {
                        return Err(Error::StorageCorrupted("leaf keys out of order"));
                    }
                }
                if let Some(lo) = lower {
                    if key < lo {
                        return Err(Error::StorageCorrupted("leaf key below separator"));
                    }
                }
                if let Some(hi) = upper {
                    if key >= hi {
                        return Err(Error::StorageCorrupted("leaf key above separator"));
                    }
                }
                prev = Some(key.to_vec());
            }
            *count += page.item_count() as u64;
            leaves.push(page_id);
            Ok(())
        }
        PageType::Internal => {
            if page.level() == 0 {
                return Err(Error::StorageCorrupted("internal node at level zero"));
            }
            let n = page.item_count();
            if n == 0 {
                return Err(Error::StorageCorrupted("internal node without separators"));
            }
            let entries = page.internal_entries()?;
            for w in entries.windows(2) {
                if w[1].0 <= w[0].0 {
                    return Err(Error::StorageCorrupted("separators out of order"));
                }
            }
            let child_level = page.level() - 1;
            let leftmost = page.leftmost_child();
            drop(page);

            verify_node(
                src,
                leftmost,
                lower,
                Some(entries[0].0.as_slice()),
                Some(child_level),
                leaves,
                count,
            )?;
            for i in 0..entries.len() {
                let hi = if i + 1 < entries.len() {
                    Some(entries[i + 1].0.as_slice())
                } else {
                    upper
                };
                verify_node(
                    src,
                    entries[i].1,
                    Some(entries[i].0.as_slice()),
                    hi,
                    Some(child_level),
                    leaves,
                    count,
                )?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const PS: usize = 4096;

    struct Fixture {
        pager: Pager,
        cache: BufferPool,
        root: u64,
        count: u64,
        _dir: tempfile::TempDir,
    }

    struct RawSource<'a> {
        pager: &'a Pager,
    }

    impl PageSource for RawSource<'_> {
        fn read_page(&self, page_id: u64) -> Result<Vec<u8>> {
            let mut buf = vec![0u8; self.pager.page_size()];
            self.pager.read_page(PageId::new(page_id), &mut buf)?;
            Ok(buf)
        }
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            let pager = Pager::open(dir.path().join("tree.db"), PS, true).unwrap();
            Self {
                pager,
                cache: BufferPool::new(64, PS),
                root: 0,
                count: 0,
                _dir: dir,
            }
        }

        // Mirrors the engine's commit: checksum, write through, invalidate.
        fn apply(&mut self, op: impl FnOnce(&mut WriteTree<'_>) -> Result<bool>) -> bool {
            let mut tree = WriteTree::new(&mut self.pager, &self.cache, self.root);
            let changed = op(&mut tree).unwrap();
            let root = tree.root();
            let dirty = tree.into_dirty();
            for (id, buf) in dirty {
                self.pager.write_page(PageId::new(id), &buf).unwrap();
                self.cache.invalidate(id);
            }
            self.root = root;
            changed
        }

        fn put(&mut self, key: &[u8], value: &[u8]) {
            if self.apply(|t| t.insert(key, value)) {
                self.count += 1;
            }
        }

        fn del(&mut self, key: &[u8]) -> bool {
            let removed = self.apply(|t| t.delete(key));
            if removed {
                self.count -= 1;
            }
            removed
        }

        fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
            search(&RawSource { pager: &self.pager }, self.root, key).unwrap()
        }

        fn check(&self) {
            verify(&RawSource { pager: &self.pager }, self.root, self.count).unwrap();
        }

        fn scan_keys(&self) -> Vec<Vec<u8>> {
            let src = RawSource { pager: &self.pager };
            let Some(mut buf) = leftmost_leaf(&src, self.root).unwrap() else {
                return Vec::new();
            };
            let mut out = Vec::new();
            loop {
                let page = Page::new(&mut buf);
                for i in 0..page.item_count() {
                    out.push(page.leaf_entry(i).unwrap().0.to_vec());
                }
                let next = page.right_sibling();
                if next == 0 {
                    return out;
                }
                buf = src.read_page(next).unwrap();
            }
        }
    }

    fn key(i: usize) -> Vec<u8> {
        format!("key-{i:05}").into_bytes()
    }

    #[test]
    fn empty_tree_finds_nothing() {
        let fx = Fixture::new();
        assert_eq!(fx.get(b"anything"), None);
        fx.check();
    }

    #[test]
    fn single_leaf_insert_get_replace() {
        let mut fx = Fixture::new();
        fx.put(b"b", b"2");
        fx.put(b"a", b"1");
        fx.put(b"c", b"3");
        assert_eq!(fx.get(b"a").as_deref(), Some(b"1".as_slice()));
        assert_eq!(fx.get(b"b").as_deref(), Some(b"2".as_slice()));
        assert_eq!(fx.get(b"d"), None);

        fx.put(b"b", b"two");
        assert_eq!(fx.get(b"b").as_deref(), Some(b"two".as_slice()));
        assert_eq!(fx.count, 3);
        fx.check();
    }

    #[test]
    fn splits_preserve_order_and_invariants() {
        let mut fx = Fixture::new();
        // Values large enough to force leaf and internal splits quickly.
        for i in 0..400 {
            fx.put(&key(i), &vec![b'v'; 64]);
        }
        assert_eq!(fx.count, 400);
        fx.check();

        for i in 0..400 {
            assert_eq!(fx.get(&key(i)).unwrap(), vec![b'v'; 64]);
        }

        let keys = fx.scan_keys();
        assert_eq!(keys.len(), 400);
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn out_of_order_inserts_converge() {
        let mut fx = Fixture::new();
        for i in (0..300).rev() {
            fx.put(&key(i), b"x");
            fx.check();
        }
        let keys = fx.scan_keys();
        assert_eq!(keys, (0..300).map(key).collect::<Vec<_>>());
    }

    #[test]
    fn delete_merges_back_to_single_page() {
        let mut fx = Fixture::new();
        for i in 0..300 {
            fx.put(&key(i), &vec![b'v'; 20]);
        }
        fx.check();

        // Delete 90%: keep every 10th key.
        for i in 0..300 {
            if i % 10 != 0 {
                assert!(fx.del(&key(i)));
            }
        }
        assert_eq!(fx.count, 30);
        fx.check();

        let keys = fx.scan_keys();
        assert_eq!(keys, (0..300).step_by(10).map(key).collect::<Vec<_>>());

        for i in 0..300 {
            let expect = i % 10 == 0;
            assert_eq!(fx.get(&key(i)).is_some(), expect);
        }
    }

    #[test]
    fn delete_everything_empties_the_tree() {
        let mut fx = Fixture::new();
        for i in 0..150 {
            fx.put(&key(i), &vec![b'v'; 40]);
        }
        for i in 0..150 {
            assert!(fx.del(&key(i)));
            fx.check();
        }
        assert_eq!(fx.root, 0);
        assert_eq!(fx.get(&key(0)), None);

        // The tree is reusable after emptying.
        fx.put(b"again", b"1");
        assert_eq!(fx.get(b"again").as_deref(), Some(b"1".as_slice()));
        fx.check();
    }

    #[test]
    fn delete_absent_key_is_a_clean_miss() {
        let mut fx = Fixture::new();
        fx.put(b"here", b"1");
        assert!(!fx.del(b"missing"));
        assert_eq!(fx.count, 1);
        fx.check();
    }

    #[test]
    fn rejects_oversized_records() {
        let mut fx = Fixture::new();
        let mut tree = WriteTree::new(&mut fx.pager, &fx.cache, 0);
        let huge = vec![0u8; PS];
        assert!(matches!(
            tree.insert(b"k", &huge),
            Err(Error::RecordTooLarge { .. })
        ));
        let long_key = vec![b'k'; PS / 2];
        assert!(matches!(
            tree.insert(&long_key, b"v"),
            Err(Error::RecordTooLarge { .. })
        ));
    }

    #[test]
    fn randomized_churn_holds_invariants() {
        use rand::{Rng, SeedableRng, rngs::StdRng};

        let mut fx = Fixture::new();
        let mut rng = StdRng::seed_from_u64(0xA91D5);
        let mut live = std::collections::BTreeMap::new();

        for _ in 0..2000 {
            let k = key(rng.gen_range(0..500));
            if rng.gen_bool(0.6) {
                let v = vec![rng.r#gen::<u8>(); rng.gen_range(1..200)];
                fx.put(&k, &v);
                live.insert(k, v);
            } else {
                let removed = fx.del(&k);
                assert_eq!(removed, live.remove(&k).is_some());
            }
        }
        fx.check();

        for (k, v) in &live {
            assert_eq!(fx.get(k).as_deref(), Some(v.as_slice()));
        }
        assert_eq!(fx.scan_keys().len(), live.len());
    }

    #[test]
    fn count_entries_walks_the_chain() {
        let mut fx = Fixture::new();
        for i in 0..250 {
            fx.put(&key(i), &vec![b'v'; 50]);
        }
        let src = RawSource { pager: &fx.pager };
        assert_eq!(count_entries(&src, fx.root).unwrap(), 250);
        assert_eq!(count_entries(&src, 0).unwrap(), 0);
    }
}

//! Slotted tree-page layout.
//!
//! Every tree page carries a 22-byte header, a slot array growing up, and
//! records growing down from the page end; free space lies in between. The
//! page checksum lives in the header and is computed over the whole page with
//! the checksum field itself excluded from the input.

use crate::{Error, Result};

pub(crate) const PAGE_HEADER_SIZE: usize = 22;

// Header offsets.
const OFF_PAGE_TYPE: usize = 0; // u8, 1=internal 2=leaf
const OFF_LEVEL: usize = 1; // u8, 0 for leaves
const OFF_FLAGS: usize = 2; // u16, reserved
const OFF_ITEM_COUNT: usize = 4; // u16
const OFF_FREE_START: usize = 6; // u16, first free byte after the slot array
const OFF_FREE_END: usize = 8; // u16, first used record byte
const OFF_RIGHT_SIBLING: usize = 10; // i64, leaves only
const OFF_PAGE_CRC: usize = 18; // u32

pub(crate) const LEAF_SLOTS_OFF: usize = PAGE_HEADER_SIZE;
const OFF_LEFTMOST_CHILD: usize = PAGE_HEADER_SIZE; // i64, internal only
pub(crate) const INTERNAL_SLOTS_OFF: usize = OFF_LEFTMOST_CHILD + 8;

pub(crate) const SLOT_SIZE: usize = 4; // offset u16 + length u16

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageType {
    Internal = 1,
    Leaf = 2,
}

fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes(buf[off..off + 2].try_into().unwrap())
}

fn write_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

fn read_i64(buf: &[u8], off: usize) -> i64 {
    i64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
}

fn write_i64(buf: &mut [u8], off: usize, v: i64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

/// Page checksum: CRC-32 over the page with the checksum field excluded.
pub fn checksum(buf: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&buf[..OFF_PAGE_CRC]);
    hasher.update(&buf[OFF_PAGE_CRC + 4..]);
    hasher.finalize()
}

pub fn stored_checksum(buf: &[u8]) -> u32 {
    read_u32(buf, OFF_PAGE_CRC)
}

pub fn set_checksum(buf: &mut [u8]) {
    let crc = checksum(buf);
    buf[OFF_PAGE_CRC..OFF_PAGE_CRC + 4].copy_from_slice(&crc.to_le_bytes());
}

/// Largest leaf record the engine accepts: record plus slot must fit in half
/// the usable space, so a count-median split can always place both halves.
pub(crate) fn max_leaf_record(page_size: usize) -> usize {
    (page_size - LEAF_SLOTS_OFF) / 2 - SLOT_SIZE
}

/// Same bound for internal records, which caps separator key length.
pub(crate) fn max_internal_record(page_size: usize) -> usize {
    (page_size - INTERNAL_SLOTS_OFF) / 2 - SLOT_SIZE
}

pub(crate) fn leaf_record_len(key: &[u8], value: &[u8]) -> usize {
    2 + key.len() + 4 + value.len()
}

pub(crate) fn internal_record_len(key: &[u8]) -> usize {
    2 + key.len() + 8
}

/// Borrowed view over one page-sized buffer.
pub struct Page<'a> {
    buf: &'a mut [u8],
}

impl<'a> Page<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf }
    }

    pub fn init_leaf(buf: &mut [u8]) {
        buf.fill(0);
        buf[OFF_PAGE_TYPE] = PageType::Leaf as u8;
        buf[OFF_LEVEL] = 0;
        write_u16(buf, OFF_FLAGS, 0);
        write_u16(buf, OFF_ITEM_COUNT, 0);
        write_u16(buf, OFF_FREE_START, LEAF_SLOTS_OFF as u16);
        write_u16(buf, OFF_FREE_END, buf.len() as u16);
        write_i64(buf, OFF_RIGHT_SIBLING, 0);
    }

    pub fn init_internal(buf: &mut [u8], level: u8, leftmost_child: u64) {
        buf.fill(0);
        buf[OFF_PAGE_TYPE] = PageType::Internal as u8;
        buf[OFF_LEVEL] = level;
        write_u16(buf, OFF_FLAGS, 0);
        write_u16(buf, OFF_ITEM_COUNT, 0);
        write_u16(buf, OFF_FREE_START, INTERNAL_SLOTS_OFF as u16);
        write_u16(buf, OFF_FREE_END, buf.len() as u16);
        write_i64(buf, OFF_RIGHT_SIBLING, 0);
        write_i64(buf, OFF_LEFTMOST_CHILD, leftmost_child as i64);
    }

    pub fn page_type(&self) -> Result<PageType> {
        match self.buf[OFF_PAGE_TYPE] {
            1 => Ok(PageType::Internal),
            2 => Ok(PageType::Leaf),
            _ => Err(Error::StorageCorrupted("bad page type")),
        }
    }

    pub fn level(&self) -> u8 {
        self.buf[OFF_LEVEL]
    }

    pub fn item_count(&self) -> usize {
        read_u16(self.buf, OFF_ITEM_COUNT) as usize
    }

    fn free_start(&self) -> usize {
        read_u16(self.buf, OFF_FREE_START) as usize
    }

    fn free_end(&self) -> usize {
        read_u16(self.buf, OFF_FREE_END) as usize
    }

    fn set_free_start(&mut self, v: usize) {
        write_u16(self.buf, OFF_FREE_START, v as u16);
    }

    fn set_free_end(&mut self, v: usize) {
        write_u16(self.buf, OFF_FREE_END, v as u16);
    }

    fn set_item_count(&mut self, v: usize) {
        write_u16(self.buf, OFF_ITEM_COUNT, v as u16);
    }

    pub fn right_sibling(&self) -> u64 {
        read_i64(self.buf, OFF_RIGHT_SIBLING) as u64
    }

    pub fn set_right_sibling(&mut self, id: u64) {
        write_i64(self.buf, OFF_RIGHT_SIBLING, id as i64);
    }

    pub fn leftmost_child(&self) -> u64 {
        read_i64(self.buf, OFF_LEFTMOST_CHILD) as u64
    }

    fn is_leaf(&self) -> bool {
        self.buf[OFF_PAGE_TYPE] == PageType::Leaf as u8
    }

    fn slots_off(&self) -> usize {
        if self.is_leaf() {
            LEAF_SLOTS_OFF
        } else {
            INTERNAL_SLOTS_OFF
        }
    }

    fn slot(&self, idx: usize) -> (usize, usize) {
        let off = self.slots_off() + idx * SLOT_SIZE;
        (
            read_u16(self.buf, off) as usize,
            read_u16(self.buf, off + 2) as usize,
        )
    }

    fn set_slot(&mut self, idx: usize, rec_off: usize, rec_len: usize) {
        let off = self.slots_off() + idx * SLOT_SIZE;
        write_u16(self.buf, off, rec_off as u16);
        write_u16(self.buf, off + 2, rec_len as u16);
    }

    fn record(&self, idx: usize) -> Result<&[u8]> {
        if idx >= self.item_count() {
            return Err(Error::StorageCorrupted("slot index out of bounds"));
        }
        let (off, len) = self.slot(idx);
        if off < self.slots_off() || off + len > self.buf.len() {
            return Err(Error::StorageCorrupted("record out of range"));
        }
        Ok(&self.buf[off..off + len])
    }

    pub fn leaf_entry(&self, idx: usize) -> Result<(&[u8], &[u8])> {
        let rec = self.record(idx)?;
        if rec.len() < 6 {
            return Err(Error::StorageCorrupted("leaf record truncated"));
        }
        let key_len = u16::from_le_bytes(rec[0..2].try_into().unwrap()) as usize;
        if 2 + key_len + 4 > rec.len() {
            return Err(Error::StorageCorrupted("leaf key out of range"));
        }
        let value_len =
            u32::from_le_bytes(rec[2 + key_len..2 + key_len + 4].try_into().unwrap()) as usize;
        if 2 + key_len + 4 + value_len != rec.len() {
            return Err(Error::StorageCorrupted("leaf value out of range"));
        }
        let key = &rec[2..2 + key_len];
        let value = &rec[2 + key_len + 4..];
        Ok((key, value))
    }

    pub fn internal_entry(&self, idx: usize) -> Result<(&[u8], u64)> {
        let rec = self.record(idx)?;
        if rec.len() < 10 {
            return Err(Error::StorageCorrupted("internal record truncated"));
        }
        let key_len = u16::from_le_bytes(rec[0..2].try_into().unwrap()) as usize;
        if 2 + key_len + 8 != rec.len() {
            return Err(Error::StorageCorrupted("internal key out of range"));
        }
        let key = &rec[2..2 + key_len];
        let child = i64::from_le_bytes(rec[2 + key_len..].try_into().unwrap()) as u64;
        Ok((key, child))
    }

    pub fn free_space(&self) -> usize {
        self.free_end().saturating_sub(self.free_start())
    }

    /// Slot-array plus record bytes currently in use.
    pub fn used_bytes(&self) -> usize {
        (self.free_start() - self.slots_off()) + (self.buf.len() - self.free_end())
    }

    /// Space available to slots and records on an empty page of this type.
    pub fn usable_space(&self) -> usize {
        self.buf.len() - self.slots_off()
    }

    /// Underfull when used bytes drop below 40% of usable space. An empty
    /// page is always underfull.
    pub fn is_underfull(&self) -> bool {
        (self.used_bytes() as u64) * 100 < (self.usable_space() as u64) * 40
    }

    /// First slot whose key is >= `key`, and whether it is an exact match.
    pub fn leaf_lower_bound(&self, key: &[u8]) -> Result<(usize, bool)> {
        let mut lo = 0usize;
        let mut hi = self.item_count();
        while lo < hi {
            let mid = (lo + hi) / 2;
            let (k, _) = self.leaf_entry(mid)?;
            if k < key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo < self.item_count() {
            let (k, _) = self.leaf_entry(lo)?;
            Ok((lo, k == key))
        } else {
            Ok((lo, false))
        }
    }

    /// Child position for `key`: 0 routes to the leftmost child, `i >= 1`
    /// to separator `i - 1`'s child. Picks the largest separator <= key.
    pub fn child_position(&self, key: &[u8]) -> Result<usize> {
        let mut lo = 0usize;
        let mut hi = self.item_count();
        while lo < hi {
            let mid = (lo + hi) / 2;
            let (k, _) = self.internal_entry(mid)?;
            if k <= key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    pub fn child_at(&self, position: usize) -> Result<u64> {
        if position == 0 {
            Ok(self.leftmost_child())
        } else {
            let (_, child) = self.internal_entry(position - 1)?;
            Ok(child)
        }
    }

    pub fn leaf_has_room(&self, key: &[u8], value: &[u8]) -> bool {
        self.free_space() >= leaf_record_len(key, value) + SLOT_SIZE
    }

    pub fn internal_has_room(&self, key: &[u8]) -> bool {
        self.free_space() >= internal_record_len(key) + SLOT_SIZE
    }

    fn insert_slot(&mut self, idx: usize, rec_off: usize, rec_len: usize) {
        let count = self.item_count();
        debug_assert!(idx <= count);
        let slots = self.slots_off();
        let src = slots + idx * SLOT_SIZE;
        let len = (count - idx) * SLOT_SIZE;
        if len > 0 {
            self.buf.copy_within(src..src + len, src + SLOT_SIZE);
        }
        self.set_slot(idx, rec_off, rec_len);
        self.set_item_count(count + 1);
        self.set_free_start(slots + (count + 1) * SLOT_SIZE);
    }

    /// Write the record into free space and splice a slot in at `idx`.
    /// Callers check [`Page::leaf_has_room`] first.
    pub fn leaf_insert_at(&mut self, idx: usize, key: &[u8], value: &[u8]) {
        let rec_len = leaf_record_len(key, value);
        debug_assert!(self.free_space() >= rec_len + SLOT_SIZE);

        let rec_off = self.free_end() - rec_len;
        self.buf[rec_off..rec_off + 2].copy_from_slice(&(key.len() as u16).to_le_bytes());
        self.buf[rec_off + 2..rec_off + 2 + key.len()].copy_from_slice(key);
        self.buf[rec_off + 2 + key.len()..rec_off + 2 + key.len() + 4]
            .copy_from_slice(&(value.len() as u32).to_le_bytes());
        self.buf[rec_off + 2 + key.len() + 4..rec_off + rec_len].copy_from_slice(value);
        self.set_free_end(rec_off);

        self.insert_slot(idx, rec_off, rec_len);
    }

    pub fn internal_insert_at(&mut self, idx: usize, key: &[u8], child: u64) {
        let rec_len = internal_record_len(key);
        debug_assert!(self.free_space() >= rec_len + SLOT_SIZE);

        let rec_off = self.free_end() - rec_len;
        self.buf[rec_off..rec_off + 2].copy_from_slice(&(key.len() as u16).to_le_bytes());
        self.buf[rec_off + 2..rec_off + 2 + key.len()].copy_from_slice(key);
        self.buf[rec_off + 2 + key.len()..rec_off + rec_len]
            .copy_from_slice(&(child as i64).to_le_bytes());
        self.set_free_end(rec_off);

        self.insert_slot(idx, rec_off, rec_len);
    }

    pub fn leaf_entries(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        (0..self.item_count())
            .map(|i| {
                let (k, v) = self.leaf_entry(i)?;
                Ok((k.to_vec(), v.to_vec()))
            })
            .collect()
    }

    pub fn internal_entries(&self) -> Result<Vec<(Vec<u8>, u64)>> {
        (0..self.item_count())
            .map(|i| {
                let (k, c) = self.internal_entry(i)?;
                Ok((k.to_vec(), c))
            })
            .collect()
    }

    /// Rewrite the page from scratch with the given entries, reclaiming all
    /// dead space.
    pub fn rebuild_leaf(buf: &'a mut [u8], right_sibling: u64, entries: &[(Vec<u8>, Vec<u8>)]) {
        Self::init_leaf(buf);
        let mut page = Self::new(buf);
        page.set_right_sibling(right_sibling);
        for (i, (k, v)) in entries.iter().enumerate() {
            page.leaf_insert_at(i, k, v);
        }
    }

    pub fn rebuild_internal(
        buf: &'a mut [u8],
        level: u8,
        leftmost_child: u64,
        entries: &[(Vec<u8>, u64)],
    ) {
        Self::init_internal(buf, level, leftmost_child);
        let mut page = Self::new(buf);
        for (i, (k, c)) in entries.iter().enumerate() {
            page.internal_insert_at(i, k, *c);
        }
    }
}

/// Bytes `entries` would occupy in a rebuilt leaf, slots included.
pub(crate) fn leaf_bytes(entries: &[(Vec<u8>, Vec<u8>)]) -> usize {
    entries
        .iter()
        .map(|(k, v)| leaf_record_len(k, v) + SLOT_SIZE)
        .sum()
}

pub(crate) fn internal_bytes(entries: &[(Vec<u8>, u64)]) -> usize {
    entries
        .iter()
        .map(|(k, _)| internal_record_len(k) + SLOT_SIZE)
        .sum()
}

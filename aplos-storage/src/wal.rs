//! Write-ahead log of page images and commit records.
//!
//! Every page mutation is logged before it becomes committed state. A commit
//! record carries the new root, generation, and entry count; recovery replays
//! images commit-by-commit and discards any torn tail.

use crate::pager::{PageId, Pager, Superblock};
use crate::{Error, Result, crc32};
use log::{debug, warn};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const REC_PAGE_IMAGE: u8 = 1;
const REC_COMMIT: u8 = 2;

// Commit record body: type + root + generation + entry count.
const COMMIT_CRC_RANGE: usize = 1 + 8 + 8 + 8;

#[derive(Debug)]
pub struct Wal {
    path: PathBuf,
    file: File,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplayStats {
    pub records: u64,
    pub commits_applied: u64,
    pub pages_applied: u64,
    pub bytes_discarded: u64,
}

impl Wal {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        Ok(Self { path, file })
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Append one page image. Not flushed until the commit record lands.
    pub fn append_page_image(&mut self, page_id: PageId, data: &[u8]) -> Result<()> {
        let mut body = Vec::with_capacity(1 + 8 + 4 + data.len() + 4);
        body.push(REC_PAGE_IMAGE);
        body.extend_from_slice(&(page_id.as_u64() as i64).to_le_bytes());
        body.extend_from_slice(&(data.len() as i32).to_le_bytes());
        body.extend_from_slice(data);
        let crc = crc32(&body);
        body.extend_from_slice(&crc.to_le_bytes());

        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&body)?;
        Ok(())
    }

    /// Append the commit record that makes the preceding images durable.
    /// The caller decides whether to fsync afterwards.
    pub fn append_commit(&mut self, root: u64, generation: u64, entry_count: u64) -> Result<()> {
        let mut body = Vec::with_capacity(COMMIT_CRC_RANGE + 4);
        body.push(REC_COMMIT);
        body.extend_from_slice(&(root as i64).to_le_bytes());
        body.extend_from_slice(&(generation as i64).to_le_bytes());
        body.extend_from_slice(&(entry_count as i64).to_le_bytes());
        let crc = crc32(&body);
        body.extend_from_slice(&crc.to_le_bytes());

        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&body)?;
        Ok(())
    }

    pub fn fsync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Discard the log. Safe once every committed image has reached the data
    /// file.
    pub fn truncate(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Replay the log into the data file. Images accumulate until a valid
    /// commit record applies them; the first torn or checksum-bad record ends
    /// the scan and the remainder is dropped as uncommitted garbage. The log
    /// is truncated afterwards.
    pub fn recover(&mut self, pager: &mut Pager) -> Result<ReplayStats> {
        let total = self.size()?;
        let mut reader = WalReader::open(&self.path)?;
        let mut stats = ReplayStats::default();
        let mut pending: Vec<(PageId, Vec<u8>)> = Vec::new();
        let mut consumed = 0u64;

        while let Some(record) = reader.next_record(pager.page_size())? {
            stats.records += 1;
            match record {
                Record::PageImage { page_id, data } => {
                    pending.push((PageId::new(page_id as u64), data));
                }
                Record::Commit {
                    root,
                    generation,
                    entry_count,
                } => {
                    for (pid, data) in pending.drain(..) {
                        pager.write_page(pid, &data)?;
                        stats.pages_applied += 1;
                    }
                    pager.sync()?;
                    pager.write_superblock(&Superblock {
                        entry_count,
                        root_page_id: root,
                        generation,
                        free_list_head: 0,
                    })?;
                    stats.commits_applied += 1;
                    consumed = reader.offset;
                }
            }
        }

        stats.bytes_discarded = total.saturating_sub(consumed);
        if stats.bytes_discarded > 0 {
            warn!(
                "discarding {} uncommitted wal bytes at offset {}",
                stats.bytes_discarded, consumed
            );
        }
        debug!(
            "wal replay: {} records, {} commits, {} pages",
            stats.records, stats.commits_applied, stats.pages_applied
        );

        self.truncate()?;
        Ok(stats)
    }
}

enum Record {
    PageImage { page_id: i64, data: Vec<u8> },
    Commit {
        root: i64,
        generation: i64,
        entry_count: i64,
    },
}

struct WalReader {
    file: File,
    offset: u64,
}

impl WalReader {
    fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        Ok(Self { file, offset: 0 })
    }

    /// Next fully-valid record, or `None` at the first truncated, unknown,
    /// or checksum-bad record (treated as end of log).
    fn next_record(&mut self, page_size: usize) -> Result<Option<Record>> {
        let mut ty = [0u8; 1];
        if !self.try_read_exact(&mut ty)? {
            return Ok(None);
        }

        match ty[0] {
            REC_PAGE_IMAGE => {
                let mut head = [0u8; 12];
                if !self.try_read_exact(&mut head)? {
                    return Ok(None);
                }
                let page_id = i64::from_le_bytes(head[0..8].try_into().unwrap());
                let data_len = i32::from_le_bytes(head[8..12].try_into().unwrap());
                if data_len as usize != page_size {
                    return Ok(None);
                }

                let mut data = vec![0u8; page_size];
                if !self.try_read_exact(&mut data)? {
                    return Ok(None);
                }
                let mut crc_buf = [0u8; 4];
                if !self.try_read_exact(&mut crc_buf)? {
                    return Ok(None);
                }

                let mut hasher = crc32fast::Hasher::new();
                hasher.update(&ty);
                hasher.update(&head);
                hasher.update(&data);
                if hasher.finalize() != u32::from_le_bytes(crc_buf) {
                    return Ok(None);
                }

                self.offset += 1 + 12 + page_size as u64 + 4;
                Ok(Some(Record::PageImage { page_id, data }))
            }
            REC_COMMIT => {
                let mut body = [0u8; 24];
                if !self.try_read_exact(&mut body)? {
                    return Ok(None);
                }
                let mut crc_buf = [0u8; 4];
                if !self.try_read_exact(&mut crc_buf)? {
                    return Ok(None);
                }

                let mut hasher = crc32fast::Hasher::new();
                hasher.update(&ty);
                hasher.update(&body);
                if hasher.finalize() != u32::from_le_bytes(crc_buf) {
                    return Ok(None);
                }

                self.offset += COMMIT_CRC_RANGE as u64 + 4;
                Ok(Some(Record::Commit {
                    root: i64::from_le_bytes(body[0..8].try_into().unwrap()),
                    generation: i64::from_le_bytes(body[8..16].try_into().unwrap()),
                    entry_count: i64::from_le_bytes(body[16..24].try_into().unwrap()),
                }))
            }
            _ => Ok(None),
        }
    }

    fn try_read_exact(&mut self, buf: &mut [u8]) -> Result<bool> {
        match self.file.read_exact(buf) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{self, Page};
    use tempfile::tempdir;

    const PS: usize = 4096;

    fn tree_page(fill: u8) -> Vec<u8> {
        let mut buf = vec![0u8; PS];
        Page::init_leaf(&mut buf);
        buf[PS - 1] = fill;
        page::set_checksum(&mut buf);
        buf
    }

    #[test]
    fn recover_applies_committed_images_and_superblock() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("test.db");
        let wal_path = dir.path().join("test.wal");

        {
            let _pager = Pager::open(&db, PS, true).unwrap();
            let mut wal = Wal::open(&wal_path).unwrap();
            wal.append_page_image(PageId::new(1), &tree_page(0x11)).unwrap();
            wal.append_page_image(PageId::new(2), &tree_page(0x22)).unwrap();
            wal.append_commit(1, 5, 2).unwrap();
            wal.fsync().unwrap();
        }

        let mut pager = Pager::open(&db, PS, true).unwrap();
        let mut wal = Wal::open(&wal_path).unwrap();
        let stats = wal.recover(&mut pager).unwrap();
        assert_eq!(stats.commits_applied, 1);
        assert_eq!(stats.pages_applied, 2);
        assert_eq!(stats.bytes_discarded, 0);

        let sb = pager.read_superblock().unwrap();
        assert_eq!((sb.root_page_id, sb.generation, sb.entry_count), (1, 5, 2));

        let mut buf = vec![0u8; PS];
        pager.read_page(PageId::new(2), &mut buf).unwrap();
        assert_eq!(buf[PS - 1], 0x22);

        assert_eq!(wal.size().unwrap(), 0);
    }

    #[test]
    fn recover_drops_images_without_commit() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("test.db");
        let wal_path = dir.path().join("test.wal");

        {
            let _pager = Pager::open(&db, PS, true).unwrap();
            let mut wal = Wal::open(&wal_path).unwrap();
            wal.append_page_image(PageId::new(1), &tree_page(0xAA)).unwrap();
            wal.fsync().unwrap();
        }

        let mut pager = Pager::open(&db, PS, true).unwrap();
        let mut wal = Wal::open(&wal_path).unwrap();
        let stats = wal.recover(&mut pager).unwrap();
        assert_eq!(stats.commits_applied, 0);
        assert_eq!(stats.pages_applied, 0);
        assert!(stats.bytes_discarded > 0);

        let mut buf = vec![0u8; PS];
        assert!(pager.read_page(PageId::new(1), &mut buf).is_err());
    }

    #[test]
    fn recover_ignores_garbage_tail_after_commit() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("test.db");
        let wal_path = dir.path().join("test.wal");

        {
            let _pager = Pager::open(&db, PS, true).unwrap();
            let mut wal = Wal::open(&wal_path).unwrap();
            wal.append_page_image(PageId::new(1), &tree_page(0x7F)).unwrap();
            wal.append_commit(1, 1, 1).unwrap();
            wal.fsync().unwrap();

            // A partial page-image record: type byte plus a few random bytes.
            let mut file = OpenOptions::new().append(true).open(&wal_path).unwrap();
            file.write_all(&[REC_PAGE_IMAGE, 0x13, 0x37, 0x42]).unwrap();
        }

        let mut pager = Pager::open(&db, PS, true).unwrap();
        let mut wal = Wal::open(&wal_path).unwrap();
        let stats = wal.recover(&mut pager).unwrap();
        assert_eq!(stats.commits_applied, 1);
        assert_eq!(stats.bytes_discarded, 4);

        let mut buf = vec![0u8; PS];
        pager.read_page(PageId::new(1), &mut buf).unwrap();
        assert_eq!(buf[PS - 1], 0x7F);
    }

    #[test]
    fn recover_stops_at_corruption_mid_log() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("test.db");
        let wal_path = dir.path().join("test.wal");

        let commit_offset;
        {
            let _pager = Pager::open(&db, PS, true).unwrap();
            let mut wal = Wal::open(&wal_path).unwrap();
            wal.append_page_image(PageId::new(1), &tree_page(0x01)).unwrap();
            wal.append_commit(1, 1, 1).unwrap();

            commit_offset = wal.size().unwrap();
            wal.append_page_image(PageId::new(2), &tree_page(0x02)).unwrap();
            wal.append_commit(2, 2, 2).unwrap();
            wal.fsync().unwrap();
        }

        // Corrupt the second batch's page image body.
        {
            let mut file = OpenOptions::new().write(true).open(&wal_path).unwrap();
            file.seek(SeekFrom::Start(commit_offset + 13 + 100)).unwrap();
            file.write_all(&[0xFF]).unwrap();
        }

        let mut pager = Pager::open(&db, PS, true).unwrap();
        let mut wal = Wal::open(&wal_path).unwrap();
        let stats = wal.recover(&mut pager).unwrap();
        assert_eq!(stats.commits_applied, 1);

        let sb = pager.read_superblock().unwrap();
        assert_eq!(sb.generation, 1);

        let mut buf = vec![0u8; PS];
        assert!(pager.read_page(PageId::new(2), &mut buf).is_err());
    }
}

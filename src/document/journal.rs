//! Append-only journal of committed document writes.
//!
//! Every commit of a durable [`LocalDocumentStore`](super::LocalDocumentStore)
//! is appended here before it becomes visible. On open the journal is read
//! back and replayed to rebuild the collections.
//!
//! Layout: a 5-byte header (magic + version) followed by frames of
//! `len: u32 | payload: [u8; len] | crc32(payload): u32`, little-endian,
//! with MessagePack payloads.

use crate::error::{Result, StoreError};
use crate::types::{DocumentId, Timestamp, Version};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};

use super::operations::FieldUpdate;

/// Magic bytes for the journal file.
const JOURNAL_MAGIC: &[u8; 4] = b"FJL\0";

/// Current journal format version.
const JOURNAL_VERSION: u8 = 1;

/// Header size (magic + version).
const HEADER_SIZE: u64 = 5;

/// Upper bound on a single frame, guards against reading garbage lengths.
const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// A committed write.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Store version produced by this commit.
    pub version: Version,
    /// Commit timestamp; server timestamps in the updates resolve to it.
    pub timestamp: Timestamp,
    pub collection: String,
    pub id: DocumentId,
    pub operation: JournalOperation,
}

/// What a journal entry did.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum JournalOperation {
    /// Document created from updates applied to an empty document.
    Create { updates: Vec<FieldUpdate> },
    /// Updates applied to an existing document.
    Update { updates: Vec<FieldUpdate> },
}

/// Append-only journal file.
pub struct Journal {
    path: PathBuf,
    state: Mutex<JournalState>,
    /// Sync every N writes (1 = sync every write).
    sync_interval: u64,
}

struct JournalState {
    file: File,
    writes_since_sync: u64,
    /// Set when a failed append could not be undone.
    poisoned: bool,
    /// Write only this many bytes of the next frame, then fail.
    #[cfg(test)]
    fail_after: Option<usize>,
}

impl JournalState {
    fn write_frame(&mut self, frame: &[u8], sync_interval: u64) -> io::Result<()> {
        #[cfg(test)]
        {
            if let Some(limit) = self.fail_after.take() {
                self.file.write_all(&frame[..limit.min(frame.len())])?;
                return Err(io::Error::new(ErrorKind::Other, "injected write failure"));
            }
        }

        self.file.write_all(frame)?;

        self.writes_since_sync += 1;
        if self.writes_since_sync >= sync_interval {
            self.file.sync_data()?;
            self.writes_since_sync = 0;
        }
        Ok(())
    }

    /// Cut the file back to `len` and continue appending from there.
    fn rollback(&mut self, len: u64) -> io::Result<()> {
        self.file.set_len(len)?;
        self.file.seek(SeekFrom::Start(len))?;
        self.file.sync_data()
    }
}

impl Journal {
    /// Open or create a journal, returning it with every intact entry.
    ///
    /// A torn frame at the tail (from a crash mid-append) is cut off. A
    /// checksum mismatch anywhere else is reported as corruption.
    pub fn open(path: impl AsRef<Path>, sync_interval: u64) -> Result<(Self, Vec<JournalEntry>)> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let entries = if file.metadata()?.len() == 0 {
            file.write_all(JOURNAL_MAGIC)?;
            file.write_all(&[JOURNAL_VERSION])?;
            file.sync_all()?;
            Vec::new()
        } else {
            let (entries, valid_len) = Self::read_entries(&mut file)?;
            let file_len = file.metadata()?.len();
            if valid_len < file_len {
                warn!(
                    path = %path.display(),
                    valid_len,
                    file_len,
                    "truncating torn journal tail"
                );
                file.set_len(valid_len)?;
                file.sync_all()?;
            }
            entries
        };

        file.seek(SeekFrom::End(0))?;
        debug!(path = %path.display(), entries = entries.len(), "journal opened");

        Ok((
            Self {
                path,
                state: Mutex::new(JournalState {
                    file,
                    writes_since_sync: 0,
                    poisoned: false,
                    #[cfg(test)]
                    fail_after: None,
                }),
                sync_interval: sync_interval.max(1),
            },
            entries,
        ))
    }

    /// Append an entry.
    ///
    /// Frames larger than the reader accepts are refused before anything is
    /// written. If the write or sync fails, the file is cut back to its
    /// length before the append, so an entry reported as failed is never
    /// replayed.
    pub fn append(&self, entry: &JournalEntry) -> Result<()> {
        let payload = rmp_serde::to_vec(entry)?;
        if payload.len() > MAX_FRAME_SIZE {
            return Err(StoreError::InvalidOperation(format!(
                "Journal entry of {} bytes exceeds the {} byte frame limit",
                payload.len(),
                MAX_FRAME_SIZE
            )));
        }
        let len = u32::try_from(payload.len()).map_err(|_| {
            StoreError::InvalidOperation(format!(
                "Journal entry of {} bytes does not fit a frame",
                payload.len()
            ))
        })?;
        let checksum = crc32fast::hash(&payload);

        let mut frame = Vec::with_capacity(payload.len() + 8);
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&payload);
        frame.extend_from_slice(&checksum.to_le_bytes());

        let mut state = self.state.lock();
        if state.poisoned {
            return Err(StoreError::InvalidOperation(
                "Journal is unusable after a failed rollback".into(),
            ));
        }

        let start = state.file.seek(SeekFrom::End(0))?;
        if let Err(err) = state.write_frame(&frame, self.sync_interval) {
            if let Err(rollback) = state.rollback(start) {
                state.poisoned = true;
                error!(
                    path = %self.path.display(),
                    %err,
                    %rollback,
                    "journal rollback failed"
                );
                return Err(rollback.into());
            }
            warn!(path = %self.path.display(), %err, "journal append rolled back");
            return Err(err.into());
        }

        Ok(())
    }

    /// Force pending writes to disk.
    pub fn sync(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.file.sync_all()?;
        state.writes_since_sync = 0;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read all frames after the header. Returns the entries and the byte
    /// length of the intact prefix.
    fn read_entries(file: &mut File) -> Result<(Vec<JournalEntry>, u64)> {
        file.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != JOURNAL_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid journal magic".into()));
        }

        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != JOURNAL_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported journal version: {}",
                version[0]
            )));
        }

        let mut entries = Vec::new();
        let mut offset = HEADER_SIZE;

        loop {
            let mut len_bytes = [0u8; 4];
            match reader.read_exact(&mut len_bytes) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }

            let len = u32::from_le_bytes(len_bytes) as usize;
            if len > MAX_FRAME_SIZE {
                return Err(StoreError::InvalidFormat(format!(
                    "Journal frame at offset {} is too large ({} bytes)",
                    offset, len
                )));
            }

            let mut payload = vec![0u8; len];
            let mut checksum_bytes = [0u8; 4];
            let frame_read = reader
                .read_exact(&mut payload)
                .and_then(|_| reader.read_exact(&mut checksum_bytes));
            match frame_read {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }

            let stored = u32::from_le_bytes(checksum_bytes);
            let computed = crc32fast::hash(&payload);
            if stored != computed {
                return Err(StoreError::ChecksumMismatch {
                    expected: stored,
                    got: computed,
                });
            }

            entries.push(rmp_serde::from_slice(&payload)?);
            offset += 4 + len as u64 + 4;
        }

        Ok((entries, offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn entry(version: u64) -> JournalEntry {
        JournalEntry {
            version: Version(version),
            timestamp: Timestamp(1_000 + version as i64),
            collection: "posts".to_string(),
            id: DocumentId::from("p1"),
            operation: JournalOperation::Update {
                updates: vec![
                    FieldUpdate::array_union("likes", vec![json!("u1")]),
                    FieldUpdate::increment("shareCount", 1),
                ],
            },
        }
    }

    #[test]
    fn test_append_and_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.log");

        {
            let (journal, entries) = Journal::open(&path, 1).unwrap();
            assert!(entries.is_empty());
            journal.append(&entry(1)).unwrap();
            journal.append(&entry(2)).unwrap();
        }

        let (_journal, entries) = Journal::open(&path, 1).unwrap();
        assert_eq!(entries, vec![entry(1), entry(2)]);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.log");

        {
            let (journal, _) = Journal::open(&path, 1).unwrap();
            journal.append(&entry(1)).unwrap();
        }
        let intact_len = std::fs::metadata(&path).unwrap().len();

        // Simulate a crash halfway through the next frame
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&100u32.to_le_bytes()).unwrap();
            file.write_all(&[1, 2, 3]).unwrap();
        }

        let (journal, entries) = Journal::open(&path, 1).unwrap();
        assert_eq!(entries, vec![entry(1)]);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), intact_len);

        // Appends continue cleanly after the cut
        journal.append(&entry(2)).unwrap();
        drop(journal);
        let (_journal, entries) = Journal::open(&path, 1).unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn test_checksum_mismatch_detected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.log");

        {
            let (journal, _) = Journal::open(&path, 1).unwrap();
            journal.append(&entry(1)).unwrap();
        }

        // Flip a payload byte
        let mut bytes = std::fs::read(&path).unwrap();
        let idx = HEADER_SIZE as usize + 4;
        bytes[idx] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        let result = Journal::open(&path, 1);
        assert!(matches!(result, Err(StoreError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_failed_write_is_rolled_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.log");

        let (journal, _) = Journal::open(&path, 1).unwrap();
        journal.append(&entry(1)).unwrap();
        let intact_len = std::fs::metadata(&path).unwrap().len();

        // Torn write: only part of the frame reaches the file
        journal.state.lock().fail_after = Some(6);
        assert!(matches!(journal.append(&entry(2)), Err(StoreError::Io(_))));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), intact_len);

        journal.append(&entry(3)).unwrap();
        drop(journal);

        let (_journal, entries) = Journal::open(&path, 1).unwrap();
        assert_eq!(entries, vec![entry(1), entry(3)]);
    }

    #[test]
    fn test_failed_sync_is_rolled_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.log");

        let (journal, _) = Journal::open(&path, 1).unwrap();
        journal.append(&entry(1)).unwrap();

        // The whole frame is written, then the append still fails
        journal.state.lock().fail_after = Some(usize::MAX);
        assert!(journal.append(&entry(2)).is_err());
        drop(journal);

        let (_journal, entries) = Journal::open(&path, 1).unwrap();
        assert_eq!(entries, vec![entry(1)]);
    }

    #[test]
    fn test_oversized_entry_refused() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.log");

        let (journal, _) = Journal::open(&path, 1).unwrap();
        let mut big = entry(1);
        big.operation = JournalOperation::Create {
            updates: vec![FieldUpdate::set("text", "x".repeat(MAX_FRAME_SIZE))],
        };

        assert!(matches!(
            journal.append(&big),
            Err(StoreError::InvalidOperation(_))
        ));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), HEADER_SIZE);

        journal.append(&entry(2)).unwrap();
        drop(journal);
        let (_journal, entries) = Journal::open(&path, 1).unwrap();
        assert_eq!(entries, vec![entry(2)]);
    }

    #[test]
    fn test_invalid_magic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.log");
        std::fs::write(&path, b"NOPE\x01").unwrap();

        let result = Journal::open(&path, 1);
        assert!(matches!(result, Err(StoreError::InvalidFormat(_))));
    }
}

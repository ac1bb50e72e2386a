//! Write-ahead log of whole store batches.
//!
//! Each entry is one complete logical write (a per-source replace, a merged
//! table replace, a delete, a metadata put). Entries are validated against
//! the in-memory tables before they are appended, so replay never meets an
//! entry that fails to apply.
//!
//! Sequence numbers keep increasing across truncation; the snapshot records
//! the last sequence it covers and replay skips everything up to it.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Result as IoResult, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::gene::GeneRecord;
use crate::merged::MergedConcept;
use crate::source::{SourceMeta, SourceName};

use super::codec::{self, FileKind, HEADER_LEN};

/// A single entry in the write-ahead log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    /// Monotonically increasing sequence number.
    pub sequence: u64,
    /// When this entry was written.
    pub timestamp: DateTime<Utc>,
    /// The batch being logged.
    pub kind: WalEntryKind,
}

/// One logical store write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalEntryKind {
    InitializeSchema,
    DropSchema,
    ReplaceSource {
        source: SourceName,
        records: Vec<GeneRecord>,
        #[serde(default)]
        meta: Option<SourceMeta>,
    },
    ReplaceMerged {
        concepts: Vec<MergedConcept>,
        #[serde(default)]
        expected_generation: Option<u64>,
    },
    PutMetadata {
        source: SourceName,
        meta: SourceMeta,
    },
    DeleteSource {
        source: SourceName,
    },
    DeleteMerged,
}

impl WalEntryKind {
    /// Short name for logging.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::InitializeSchema => "initialize_schema",
            Self::DropSchema => "drop_schema",
            Self::ReplaceSource { .. } => "replace_source",
            Self::ReplaceMerged { .. } => "replace_merged",
            Self::PutMetadata { .. } => "put_metadata",
            Self::DeleteSource { .. } => "delete_source",
            Self::DeleteMerged => "delete_merged",
        }
    }
}

fn poisoned(context: &'static str) -> std::io::Error {
    std::io::Error::other(format!("poisoned lock: {context}"))
}

/// Append-only log, thread-safe via internal mutexes.
pub struct WriteAheadLog {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
    current_sequence: Mutex<u64>,
    sync_on_write: bool,
}

impl WriteAheadLog {
    /// Opens or creates the log.
    ///
    /// The next entry gets a sequence above both `base_sequence` and every
    /// readable entry already in the file.
    pub fn open(path: &Path, sync_on_write: bool, base_sequence: u64) -> IoResult<Self> {
        let exists = path.exists();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let last_in_file = if exists && file.metadata()?.len() >= HEADER_LEN {
            Self::find_last_sequence(path)?
        } else {
            let mut file = file;
            file.set_len(0)?;
            codec::write_header(&mut file, FileKind::Wal)?;
            if sync_on_write {
                file.sync_all()?;
            }
            0
        };

        let file = OpenOptions::new().append(true).open(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(BufWriter::new(file)),
            current_sequence: Mutex::new(last_in_file.max(base_sequence)),
            sync_on_write,
        })
    }

    /// Appends an entry and returns its sequence number.
    ///
    /// A failed append cuts the file back to where it was, so a torn frame
    /// never hides entries appended after it.
    pub fn append(&self, kind: WalEntryKind) -> IoResult<u64> {
        let mut writer = self.writer.lock().map_err(|_| poisoned("wal.writer"))?;
        let mut sequence = self.current_sequence.lock().map_err(|_| poisoned("wal.sequence"))?;

        let candidate = *sequence + 1;
        let entry = WalEntry {
            sequence: candidate,
            timestamp: Utc::now(),
            kind,
        };

        let encoded = codec::encode(&entry)?;
        let start = writer.get_ref().metadata()?.len();
        if let Err(e) = write_frame(&mut writer, &encoded, self.sync_on_write) {
            if let Err(cleanup) = self.discard_tail(&mut writer, start) {
                tracing::error!(error = %cleanup, len = start, "failed to discard torn WAL frame");
            }
            return Err(e);
        }

        *sequence = candidate;
        Ok(candidate)
    }

    /// Cuts the file back to `len` bytes and drops anything still buffered.
    fn discard_tail(&self, writer: &mut BufWriter<File>, len: u64) -> IoResult<()> {
        let fresh = OpenOptions::new().append(true).open(&self.path)?;
        // into_parts hands back the buffer instead of flushing it
        let (torn, _unwritten) = std::mem::replace(writer, BufWriter::new(fresh)).into_parts();
        drop(torn);
        writer.get_ref().set_len(len)?;
        if self.sync_on_write {
            writer.get_ref().sync_all()?;
        }
        Ok(())
    }

    /// Iterates over every readable entry.
    pub fn iter(&self) -> IoResult<WalIterator> {
        WalIterator::new(&self.path)
    }

    /// The last sequence number handed out.
    pub fn current_sequence(&self) -> IoResult<u64> {
        Ok(*self.current_sequence.lock().map_err(|_| poisoned("wal.sequence"))?)
    }

    /// WAL file size in bytes.
    pub fn size_bytes(&self) -> IoResult<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    /// Whether the log holds anything beyond its header.
    pub fn has_entries(&self) -> IoResult<bool> {
        Ok(self.size_bytes()? > HEADER_LEN)
    }

    /// Drops every entry. Only call after a snapshot covering them is durable.
    pub fn truncate(&self) -> IoResult<()> {
        let mut writer = self.writer.lock().map_err(|_| poisoned("wal.writer"))?;
        writer.flush()?;

        let mut file = OpenOptions::new().write(true).truncate(true).open(&self.path)?;
        codec::write_header(&mut file, FileKind::Wal)?;
        if self.sync_on_write {
            file.sync_all()?;
        }
        drop(file);

        let file = OpenOptions::new().append(true).open(&self.path)?;
        *writer = BufWriter::new(file);
        Ok(())
    }

    fn find_last_sequence(path: &Path) -> IoResult<u64> {
        let mut last = 0;
        for entry in WalIterator::new(path)? {
            match entry {
                Ok(entry) => last = entry.sequence,
                Err(e) => {
                    tracing::warn!(after_sequence = last, error = %e, "WAL corruption detected");
                    break;
                }
            }
        }
        Ok(last)
    }
}

fn write_frame(writer: &mut BufWriter<File>, frame: &[u8], sync: bool) -> IoResult<()> {
    writer.write_all(frame)?;
    writer.flush()?;
    if sync {
        writer.get_ref().sync_all()?;
    }
    Ok(())
}

/// Reads the log at `path` without opening it for writing.
pub fn read_only_iter(path: &Path) -> IoResult<WalIterator> {
    WalIterator::new(path)
}

/// Iterator over WAL entries. A torn final frame ends iteration.
pub struct WalIterator {
    reader: BufReader<File>,
    file_size: u64,
}

impl WalIterator {
    fn new(path: &Path) -> IoResult<Self> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        codec::read_header(&mut reader, FileKind::Wal)?;
        Ok(Self { reader, file_size })
    }
}

impl Iterator for WalIterator {
    type Item = IoResult<WalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.reader.stream_position() {
            Ok(pos) if pos >= self.file_size => return None,
            Ok(_) => {}
            Err(e) => return Some(Err(e)),
        }

        match codec::decode(&mut self.reader) {
            Ok(entry) => Some(Ok(entry)),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => None,
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn batch() -> WalEntryKind {
        let record = GeneRecord::builder(SourceName::Hgnc, "hgnc:1097", "BRAF")
            .build()
            .unwrap();
        WalEntryKind::ReplaceSource {
            source: SourceName::Hgnc,
            records: vec![record],
            meta: None,
        }
    }

    #[test]
    fn test_append_and_iterate_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.wal");

        {
            let wal = WriteAheadLog::open(&path, true, 0).unwrap();
            wal.append(WalEntryKind::InitializeSchema).unwrap();
            wal.append(batch()).unwrap();
            assert_eq!(wal.current_sequence().unwrap(), 2);
        }

        let wal = WriteAheadLog::open(&path, true, 0).unwrap();
        assert_eq!(wal.current_sequence().unwrap(), 2);
        let entries: Vec<_> = wal.iter().unwrap().collect::<IoResult<_>>().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(matches!(entries[0].kind, WalEntryKind::InitializeSchema));
        assert!(matches!(entries[1].kind, WalEntryKind::ReplaceSource { .. }));
    }

    #[test]
    fn test_truncate_keeps_sequence_monotonic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.wal");

        let wal = WriteAheadLog::open(&path, false, 0).unwrap();
        wal.append(batch()).unwrap();
        wal.append(WalEntryKind::DeleteMerged).unwrap();
        wal.truncate().unwrap();

        assert!(!wal.has_entries().unwrap());
        assert_eq!(wal.append(WalEntryKind::DeleteMerged).unwrap(), 3);
    }

    #[test]
    fn test_base_sequence_from_snapshot() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.wal");

        let wal = WriteAheadLog::open(&path, false, 41).unwrap();
        assert_eq!(wal.append(WalEntryKind::InitializeSchema).unwrap(), 42);
    }

    #[test]
    fn test_torn_tail_is_ignored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.wal");

        {
            let wal = WriteAheadLog::open(&path, true, 0).unwrap();
            wal.append(WalEntryKind::InitializeSchema).unwrap();
            wal.append(batch()).unwrap();
        }
        let len = std::fs::metadata(&path).unwrap().len();
        OpenOptions::new().write(true).open(&path).unwrap().set_len(len - 5).unwrap();

        let wal = WriteAheadLog::open(&path, true, 0).unwrap();
        assert_eq!(wal.current_sequence().unwrap(), 1);
        assert_eq!(wal.iter().unwrap().count(), 1);
    }

    #[test]
    fn test_discarded_tail_keeps_later_appends_readable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.wal");

        let wal = WriteAheadLog::open(&path, false, 0).unwrap();
        wal.append(batch()).unwrap();
        let len = wal.size_bytes().unwrap();
        {
            let mut writer = wal.writer.lock().unwrap();
            // half a frame reached the file, the rest was still buffered
            writer.write_all(b"half a frame").unwrap();
            writer.flush().unwrap();
            writer.write_all(b"still buffered").unwrap();
            wal.discard_tail(&mut writer, len).unwrap();
        }
        assert_eq!(wal.size_bytes().unwrap(), len);

        wal.append(WalEntryKind::DeleteMerged).unwrap();
        drop(wal);

        let wal = WriteAheadLog::open(&path, false, 0).unwrap();
        let entries: Vec<_> = wal.iter().unwrap().collect::<IoResult<_>>().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(wal.current_sequence().unwrap(), 2);
        assert!(matches!(entries[1].kind, WalEntryKind::DeleteMerged));
    }
}

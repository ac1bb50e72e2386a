//! Compacted snapshot of the key-value tables.
//!
//! A snapshot is written to a temporary file, fsynced, then renamed over the
//! previous one, so a crash leaves either the old snapshot or the new one.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Result as IoResult, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::gene::GeneRecord;
use crate::merged::MergedConcept;
use crate::source::{SourceMeta, SourceName};

use super::codec::{self, FileKind};

const SNAPSHOT_FILE: &str = "tables.snapshot";
const TEMP_EXTENSION: &str = "tmp";

/// Snapshot header, decoded before the data frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotHeader {
    /// Last WAL sequence folded into this snapshot.
    pub up_to_sequence: u64,
    pub record_count: usize,
    pub merged_count: usize,
    pub created_at: DateTime<Utc>,
}

/// Table contents as persisted. Lookup entries are rebuilt on load.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotData {
    pub schema_initialized: bool,
    #[serde(default)]
    pub records_generation: u64,
    pub records: Vec<GeneRecord>,
    pub merged: Vec<MergedConcept>,
    pub metadata: BTreeMap<SourceName, SourceMeta>,
}

/// Location of the snapshot file in a store directory.
#[must_use]
pub fn snapshot_path(dir: &Path) -> PathBuf {
    dir.join(SNAPSHOT_FILE)
}

/// Reads the snapshot in `dir`, if one has been written.
pub fn read(dir: &Path) -> IoResult<Option<(SnapshotHeader, SnapshotData)>> {
    let file = match File::open(snapshot_path(dir)) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let mut reader = BufReader::new(file);
    codec::read_header(&mut reader, FileKind::Snapshot)?;
    let header: SnapshotHeader = codec::decode(&mut reader)?;
    let data: SnapshotData = codec::decode(&mut reader)?;
    Ok(Some((header, data)))
}

/// Reads only the header of the snapshot in `dir`.
pub fn read_header(dir: &Path) -> IoResult<Option<SnapshotHeader>> {
    let file = match File::open(snapshot_path(dir)) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let mut reader = BufReader::new(file);
    codec::read_header(&mut reader, FileKind::Snapshot)?;
    codec::decode(&mut reader).map(Some)
}

/// Durably replaces the snapshot in `dir`.
pub fn write(dir: &Path, up_to_sequence: u64, data: &SnapshotData) -> IoResult<PathBuf> {
    let final_path = snapshot_path(dir);
    let temp_path = dir.join(format!("{SNAPSHOT_FILE}.{}.{TEMP_EXTENSION}", Uuid::new_v4()));

    let result = write_to(&temp_path, up_to_sequence, data)
        .and_then(|()| fs::rename(&temp_path, &final_path));
    if result.is_err() && temp_path.exists() {
        let _ = fs::remove_file(&temp_path);
    }
    result?;

    if let Ok(dir_handle) = File::open(dir) {
        // Persist the rename itself; not supported on every platform.
        let _ = dir_handle.sync_all();
    }
    Ok(final_path)
}

fn write_to(path: &Path, up_to_sequence: u64, data: &SnapshotData) -> IoResult<()> {
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    let mut writer = BufWriter::new(file);

    codec::write_header(&mut writer, FileKind::Snapshot)?;
    let header = SnapshotHeader {
        up_to_sequence,
        record_count: data.records.len(),
        merged_count: data.merged.len(),
        created_at: Utc::now(),
    };
    writer.write_all(&codec::encode(&header)?)?;
    writer.write_all(&codec::encode(data)?)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}

/// Removes temporary files left behind by an interrupted snapshot write.
pub fn remove_stale_temp_files(dir: &Path) -> IoResult<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_temp = path.extension().is_some_and(|e| e == TEMP_EXTENSION)
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(SNAPSHOT_FILE));
        if is_temp {
            fs::remove_file(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}

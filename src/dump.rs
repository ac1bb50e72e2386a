//! Whole-store export and restore.
//!
//! A [`StoreDump`] is every record, every merged concept and every source's
//! metadata as one JSON document. Dumps move data between backends or
//! machines; restoring one replays it through the ordinary write path, so
//! the target enforces the same batch checks as a fresh load.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{NormalizerError, NormalizerResult};
use crate::gene::GeneRecord;
use crate::merged::MergedConcept;
use crate::source::{SourceMeta, SourceName};
use crate::storage::RecordStore;

/// Complete contents of a store at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreDump {
    /// When the dump was taken.
    pub exported_at: DateTime<Utc>,
    /// Metadata of every source that has any.
    pub metadata: BTreeMap<SourceName, SourceMeta>,
    /// Every stored record, `merge_ref` included.
    pub records: Vec<GeneRecord>,
    /// Every merged concept, in concept ID order.
    pub merged: Vec<MergedConcept>,
}

impl StoreDump {
    /// Reads everything `store` holds.
    ///
    /// The reads are separate calls; take the dump while nothing is loading
    /// or merging.
    ///
    /// # Errors
    /// `Storage` if the store has no schema or a read fails.
    pub fn capture(store: &dyn RecordStore) -> NormalizerResult<Self> {
        let mut metadata = BTreeMap::new();
        for source in SourceName::ALL {
            if let Some(meta) = store.get_source_metadata(source)? {
                metadata.insert(source, meta);
            }
        }
        Ok(Self {
            exported_at: Utc::now(),
            metadata,
            records: store.scan_records()?,
            merged: store.scan_merged()?,
        })
    }

    /// Writes the dump as JSON to `path`, replacing any existing file only
    /// once the new one is complete.
    ///
    /// # Errors
    /// `Io` if the file cannot be written.
    pub fn write_to(&self, path: &Path) -> NormalizerResult<()> {
        let temp = path.with_file_name(format!(
            "{}.{}.tmp",
            path.file_name().map_or_else(|| "dump".into(), |n| n.to_string_lossy()),
            Uuid::new_v4()
        ));
        let result = self.write_file(&temp).and_then(|()| fs::rename(&temp, path));
        if let Err(e) = result {
            if temp.exists() {
                let _ = fs::remove_file(&temp);
            }
            return Err(NormalizerError::io(path, &e));
        }
        tracing::info!(
            path = %path.display(),
            records = self.records.len(),
            merged = self.merged.len(),
            "store exported"
        );
        Ok(())
    }

    fn write_file(&self, path: &Path) -> std::io::Result<()> {
        let file = OpenOptions::new().write(true).create_new(true).open(path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Reads a dump written by [`StoreDump::write_to`].
    ///
    /// # Errors
    /// `Io` if the file cannot be read or is not a dump.
    pub fn read_from(path: &Path) -> NormalizerResult<Self> {
        let file = File::open(path).map_err(|e| NormalizerError::io(path, &e))?;
        serde_json::from_reader(BufReader::new(file)).map_err(|e| NormalizerError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// Loads the dump into `store`, replacing every source it covers and
    /// then the merged table.
    ///
    /// Sources absent from the dump are left alone.
    ///
    /// # Errors
    /// `Storage` if a batch is rejected; sources restored before it stay
    /// restored.
    pub fn restore(self, store: &dyn RecordStore) -> NormalizerResult<()> {
        let mut by_source: BTreeMap<SourceName, Vec<GeneRecord>> = BTreeMap::new();
        for record in self.records {
            by_source.entry(record.source).or_default().push(record);
        }
        let mut metadata = self.metadata;

        for source in SourceName::ALL {
            let records = by_source.remove(&source).unwrap_or_default();
            match metadata.remove(&source) {
                Some(meta) => store.put_source(source, records, meta)?,
                None if !records.is_empty() => store.put_records(source, records)?,
                None => {}
            }
        }
        let merged = self.merged.len();
        store.put_merged(self.merged)?;
        tracing::info!(merged, "store restored");
        Ok(())
    }
}

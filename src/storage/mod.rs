//! Storage backends for gene records and merged concepts.
//!
//! [`RecordStore`] is the contract. Two implementations ship:
//! - [`KvStore`]: item-keyed tables published by snapshot-and-swap, with an
//!   optional WAL plus snapshot on disk.
//! - [`SqliteStore`]: a normalized relational schema on SQLite.

mod file_lock;
mod kv;
mod sqlite;
mod traits;

pub(crate) use file_lock::FileLock;
pub use kv::{KvConfig, KvStore};
pub use sqlite::{SqliteConfig, SqliteStore};
pub use traits::{BackendKind, JobGuard, JobSlot, LookupField, RecordStore, StorageError};

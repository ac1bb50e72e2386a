//! Connection setup and the reader set for file-backed databases.
//!
//! File databases run in WAL journal mode: readers never wait on the single
//! writer and always see the last committed transaction.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use rusqlite::{Connection, OpenFlags};

use crate::storage::traits::StorageError;

use super::sql_err;

/// What a connection is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Writer,
    Reader,
}

/// Applies the pragmas for `role`.
pub fn configure(conn: &Connection, role: Role, busy_timeout_ms: u32) -> Result<(), StorageError> {
    let pragmas = match role {
        Role::Writer => format!(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = {busy_timeout_ms};"
        ),
        Role::Reader => format!(
            "PRAGMA query_only = ON;
             PRAGMA busy_timeout = {busy_timeout_ms};"
        ),
    };
    conn.execute_batch(&pragmas)
        .map_err(|e| sql_err("configure connection", e))
}

/// Read-only connections to one database file.
pub struct Readers {
    slots: Vec<Mutex<Connection>>,
    cursor: AtomicUsize,
}

impl Readers {
    /// Opens `count` read-only connections to `path`.
    pub fn open(path: &Path, count: usize, busy_timeout_ms: u32) -> Result<Self, StorageError> {
        if count == 0 {
            return Err(StorageError::Backend("reader set needs at least one connection".to_string()));
        }
        let slots = (0..count)
            .map(|_| {
                let conn = Connection::open_with_flags(
                    path,
                    OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
                )
                .map_err(|e| sql_err("open read connection", e))?;
                configure(&conn, Role::Reader, busy_timeout_ms)?;
                Ok(Mutex::new(conn))
            })
            .collect::<Result<Vec<_>, StorageError>>()?;
        Ok(Self {
            slots,
            cursor: AtomicUsize::new(0),
        })
    }

    /// Runs `f` on an idle reader, waiting for the next one in turn only
    /// when every reader is busy.
    pub fn read<F, T>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&Connection) -> Result<T, StorageError>,
    {
        let n = self.slots.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        for offset in 0..n {
            if let Ok(conn) = self.slots[(start + offset) % n].try_lock() {
                return f(&conn);
            }
        }
        let conn = self.slots[start % n]
            .lock()
            .map_err(|_| StorageError::Backend("poisoned lock: sqlite.readers".to_string()))?;
        f(&conn)
    }

    pub fn count(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn writer(path: &Path) -> Connection {
        let conn = Connection::open(path).unwrap();
        configure(&conn, Role::Writer, 1000).unwrap();
        conn.execute_batch("CREATE TABLE t (x INTEGER); INSERT INTO t (x) VALUES (7);")
            .unwrap();
        conn
    }

    #[test]
    fn test_readers_cannot_write() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("genes.db");
        let _writer = writer(&path);

        let readers = Readers::open(&path, 2, 1000).unwrap();
        let result = readers.read(|conn| {
            conn.execute("INSERT INTO t (x) VALUES (1)", [])
                .map_err(|e| sql_err("insert", e))
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_busy_reader_is_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("genes.db");
        let _writer = writer(&path);

        let readers = Readers::open(&path, 2, 1000).unwrap();
        let _busy = readers.slots[0].lock().unwrap();
        let x: i64 = readers
            .read(|conn| {
                conn.query_row("SELECT x FROM t", [], |row| row.get(0))
                    .map_err(|e| sql_err("select", e))
            })
            .unwrap();
        assert_eq!(x, 7);
    }

    #[test]
    fn test_empty_reader_set_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("genes.db");
        let _writer = writer(&path);
        assert!(Readers::open(&path, 0, 1000).is_err());
    }

    #[test]
    fn test_writer_uses_wal_journal() {
        let dir = tempdir().unwrap();
        let conn = writer(&dir.path().join("genes.db"));

        let mode: String = conn
            .pragma_query_value(None, "journal_mode", |row| row.get(0))
            .unwrap();
        assert!(mode.eq_ignore_ascii_case("wal"));
    }
}

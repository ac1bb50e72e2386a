//! Operator-facing store health check.

use std::fmt;

use crate::storage::{BackendKind, RecordStore, StorageError};

/// Outcome of [`check_health`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthReport {
    /// Which backend was checked.
    pub backend: BackendKind,
    /// Whether every table exists.
    pub schema_initialized: bool,
    /// Whether every table holds data.
    pub tables_populated: bool,
}

impl HealthReport {
    /// True when both checks passed.
    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        self.schema_initialized && self.tables_populated
    }

    /// Conventional process exit code: 0 when healthy, 1 otherwise.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        if self.is_healthy() {
            0
        } else {
            1
        }
    }
}

impl fmt::Display for HealthReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.schema_initialized {
            write!(f, "{:?} store: schema is not initialized", self.backend)
        } else if !self.tables_populated {
            write!(f, "{:?} store: tables are not fully populated", self.backend)
        } else {
            write!(f, "{:?} store: healthy", self.backend)
        }
    }
}

/// Runs both store checks. Population is only checked on an initialized schema.
///
/// # Errors
/// Returns the backend's error if it cannot be queried at all.
pub fn check_health(store: &dyn RecordStore) -> Result<HealthReport, StorageError> {
    let schema_initialized = store.check_schema_initialized()?;
    let tables_populated = schema_initialized && store.check_tables_populated()?;
    let report = HealthReport {
        backend: store.backend(),
        schema_initialized,
        tables_populated,
    };
    tracing::info!(
        backend = ?report.backend,
        schema_initialized,
        tables_populated,
        "health check"
    );
    Ok(report)
}

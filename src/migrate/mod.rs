//! Row migration between two backends: read every entity table from the
//! source store in dependency order and upsert into the target store.

mod runner;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::EntityKind;
use crate::AppError;

pub use runner::run_migration;

/// Rows are processed in batches; the failure threshold for a table is
/// evaluated only when a batch completes.
pub const ROW_BATCH_SIZE: usize = 100;

/// Concurrent upsert workers within one batch.
pub const ROW_WORKERS: usize = 4;

const MAX_ERROR_SAMPLES: usize = 8;

#[derive(Debug, Clone, Copy)]
pub struct MigrationOptions {
    pub batch_size: usize,
    pub workers: usize,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            batch_size: ROW_BATCH_SIZE,
            workers: ROW_WORKERS,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableStats {
    pub rows_read: u64,
    pub rows_written: u64,
    pub rows_skipped: u64,
    pub error_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableReport {
    pub entity: EntityKind,
    #[serde(flatten)]
    pub stats: TableStats,
    pub aborted: bool,
    /// First few row failure messages; the full set goes to the log.
    pub error_samples: Vec<String>,
    pub duration_ms: u64,
}

impl TableReport {
    fn new(entity: EntityKind) -> Self {
        Self {
            entity,
            stats: TableStats::default(),
            aborted: false,
            error_samples: Vec::new(),
            duration_ms: 0,
        }
    }

    fn sample_error(&mut self, message: String) {
        if self.error_samples.len() < MAX_ERROR_SAMPLES {
            self.error_samples.push(message);
        }
    }

    /// More than ten percent of the rows seen so far have failed.
    fn over_failure_threshold(&self) -> bool {
        self.stats.error_count * 10 > self.stats.rows_read
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationReport {
    pub tables: Vec<TableReport>,
}

impl MigrationReport {
    pub fn totals(&self) -> TableStats {
        let mut totals = TableStats::default();
        for table in &self.tables {
            totals.rows_read += table.stats.rows_read;
            totals.rows_written += table.stats.rows_written;
            totals.rows_skipped += table.stats.rows_skipped;
            totals.error_count += table.stats.error_count;
        }
        totals
    }

    pub fn aborted_tables(&self) -> Vec<EntityKind> {
        self.tables
            .iter()
            .filter(|table| table.aborted)
            .map(|table| table.entity)
            .collect()
    }

    pub fn has_row_failures(&self) -> bool {
        self.tables.iter().any(|table| table.stats.error_count > 0)
    }

    pub fn table(&self, entity: EntityKind) -> Option<&TableReport> {
        self.tables.iter().find(|table| table.entity == entity)
    }
}

/// Store-level failures that stop the whole migration. Row-level failures
/// never surface here; they are counted in the table report instead.
#[derive(Debug, Error)]
pub enum MigrationFatal {
    #[error("source store failed while reading {entity}")]
    Source {
        entity: EntityKind,
        #[source]
        source: AppError,
    },
    #[error("target store failed while writing {entity}")]
    Target {
        entity: EntityKind,
        #[source]
        source: AppError,
    },
}

impl From<MigrationFatal> for AppError {
    fn from(err: MigrationFatal) -> Self {
        match err {
            MigrationFatal::Source { entity, source } => AppError::new(
                "MIGRATE/SOURCE_UNAVAILABLE",
                "The source store failed while reading rows; migration stopped.",
            )
            .with_context("entity", entity.table())
            .with_cause(source),
            MigrationFatal::Target { entity, source } => AppError::new(
                "MIGRATE/TARGET_UNAVAILABLE",
                "The target store failed while writing rows; migration stopped.",
            )
            .with_context("entity", entity.table())
            .with_cause(source),
        }
    }
}

use std::time::Instant;

use futures::{stream, StreamExt};

use super::{MigrationFatal, MigrationOptions, MigrationReport, TableReport};
use crate::store::{EntityKind, EntityRecord, EntityStore, UpsertOutcome, WriteError};

/// Copy every entity table from `source` into `target`. Tables run in
/// dependency order so natural-key references resolve by the time the
/// referencing rows arrive. Row-level failures are counted and logged;
/// only store-level failures stop the run.
pub async fn run_migration(
    source: &dyn EntityStore,
    target: &dyn EntityStore,
    options: &MigrationOptions,
) -> Result<MigrationReport, MigrationFatal> {
    tracing::info!(
        target: "switchboard",
        event = "migration_started",
        source = %source.profile(),
        dest = %target.profile()
    );

    let mut tables = Vec::with_capacity(EntityKind::ALL.len());
    for entity in EntityKind::ALL {
        tables.push(migrate_table(source, target, entity, options).await?);
    }

    let report = MigrationReport { tables };
    let totals = report.totals();
    tracing::info!(
        target: "switchboard",
        event = "migration_complete",
        rows_read = totals.rows_read,
        rows_written = totals.rows_written,
        rows_skipped = totals.rows_skipped,
        errors = totals.error_count,
        aborted_tables = report.aborted_tables().len()
    );
    Ok(report)
}

enum RowOutcome {
    Written,
    Unchanged,
    Rejected(String),
    Fatal(crate::AppError),
}

async fn migrate_row(
    target: &dyn EntityStore,
    entity: EntityKind,
    row: &Result<EntityRecord, String>,
) -> RowOutcome {
    match row {
        Ok(record) => match target.upsert(record).await {
            Ok(UpsertOutcome::Inserted) | Ok(UpsertOutcome::Updated) => RowOutcome::Written,
            Ok(UpsertOutcome::Unchanged) => RowOutcome::Unchanged,
            Err(WriteError::Row(message)) => {
                tracing::warn!(
                    target: "switchboard",
                    event = "migrate_row_rejected",
                    entity = %entity,
                    key = %record.key_display(),
                    error = %message
                );
                RowOutcome::Rejected(message)
            }
            Err(WriteError::Fatal(err)) => RowOutcome::Fatal(err),
        },
        Err(message) => {
            tracing::warn!(
                target: "switchboard",
                event = "migrate_row_unreadable",
                entity = %entity,
                error = %message
            );
            RowOutcome::Rejected(message.clone())
        }
    }
}

async fn migrate_table(
    source: &dyn EntityStore,
    target: &dyn EntityStore,
    entity: EntityKind,
    options: &MigrationOptions,
) -> Result<TableReport, MigrationFatal> {
    let started = Instant::now();
    let mut report = TableReport::new(entity);

    let rows = source
        .read_all(entity)
        .await
        .map_err(|err| MigrationFatal::Source {
            entity,
            source: err,
        })?;

    let batch_size = options.batch_size.max(1);
    let workers = options.workers.max(1);
    'table: for batch in rows.chunks(batch_size) {
        // Natural-key upserts make row order within a table immaterial, so
        // the rows of one batch fan out over concurrent workers. Counters
        // are folded in afterwards; the abort threshold is only checked
        // once every in-flight row of the batch has completed.
        let outcomes: Vec<RowOutcome> = stream::iter(batch)
            .map(|row| migrate_row(target, entity, row))
            .buffer_unordered(workers)
            .collect()
            .await;

        let mut fatal = None;
        for outcome in outcomes {
            report.stats.rows_read += 1;
            match outcome {
                RowOutcome::Written => report.stats.rows_written += 1,
                RowOutcome::Unchanged => report.stats.rows_skipped += 1,
                RowOutcome::Rejected(message) => {
                    report.stats.error_count += 1;
                    report.sample_error(message);
                }
                RowOutcome::Fatal(err) => {
                    fatal.get_or_insert(err);
                }
            }
        }
        if let Some(source) = fatal {
            return Err(MigrationFatal::Target { entity, source });
        }

        if report.over_failure_threshold() {
            report.aborted = true;
            tracing::warn!(
                target: "switchboard",
                event = "migrate_table_aborted",
                entity = %entity,
                rows_read = report.stats.rows_read,
                errors = report.stats.error_count
            );
            break 'table;
        }
    }

    report.duration_ms = started.elapsed().as_millis() as u64;
    tracing::info!(
        target: "switchboard",
        event = "migrate_table_complete",
        entity = %entity,
        rows_read = report.stats.rows_read,
        rows_written = report.stats.rows_written,
        rows_skipped = report.stats.rows_skipped,
        errors = report.stats.error_count,
        aborted = report.aborted,
        duration_ms = report.duration_ms
    );
    Ok(report)
}

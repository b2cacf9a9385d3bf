//! Switch orchestrator: drives one backend switch through its status
//! machine and unwinds to the source profile when a step fails.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use crate::active::{get_active_profile, set_active_profile, ActiveHandle};
use crate::config;
use crate::migrate::{self, MigrationOptions, MigrationReport};
use crate::probe::{self, ProbeOptions, ProbeReport};
use crate::profile::{get_profile, ProfileId};
use crate::settings::SettingsMap;
use crate::store::{DefaultStoreFactory, SchemaPresence, StoreFactory};
use crate::swap;
use crate::txn::{SwitchLock, SwitchStatus, SwitchTransaction, TxnJournal};
use crate::{fsops, paths, AppError, AppResult};

pub type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;
pub type SwitchObserver = Arc<dyn Fn(SwitchEvent) + Send + Sync + 'static>;

/// Everything a switch needs from the outside world. Tests swap in their
/// own factory, lookup and directories; production uses `from_system`.
#[derive(Clone)]
pub struct SwitchEnvironment {
    pub data_dir: PathBuf,
    pub app_root: PathBuf,
    pub active: ActiveHandle,
    pub factory: Arc<dyn StoreFactory>,
    pub probe: ProbeOptions,
    pub migration: MigrationOptions,
    pub env_lookup: EnvLookup,
}

impl SwitchEnvironment {
    pub fn from_system() -> AppResult<Self> {
        let data_dir = paths::data_dir()?;
        let app_root = paths::app_root(&data_dir);
        Ok(Self {
            active: ActiveHandle::file(paths::active_profile_file(&data_dir)),
            factory: Arc::new(DefaultStoreFactory),
            probe: ProbeOptions::from_env(),
            migration: MigrationOptions::default(),
            env_lookup: Arc::new(|key| std::env::var(key).ok()),
            data_dir,
            app_root,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SwitchRequest {
    pub target: ProfileId,
    pub overrides: SettingsMap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchStep {
    Config,
    SourceProbe,
    Backup,
    Swap,
    TargetProbe,
    Migrate,
    Commit,
    Rollback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchStepState {
    Pending,
    Running,
    Success,
    Warning,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct SwitchStepReport {
    pub step: SwitchStep,
    pub status: SwitchStepState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchSummary {
    pub txn_id: String,
    pub source_profile: ProfileId,
    pub target_profile: ProfileId,
    pub final_status: SwitchStatus,
    pub success: bool,
    pub steps: Vec<SwitchStepReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<AppError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub migration: Option<MigrationReport>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SwitchEvent {
    Step {
        step: SwitchStep,
        status: SwitchStepState,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

const SWITCH_STEPS: [SwitchStep; 8] = [
    SwitchStep::Config,
    SwitchStep::SourceProbe,
    SwitchStep::Backup,
    SwitchStep::Swap,
    SwitchStep::TargetProbe,
    SwitchStep::Migrate,
    SwitchStep::Commit,
    SwitchStep::Rollback,
];

impl SwitchSummary {
    fn new(txn: &SwitchTransaction) -> Self {
        let steps = SWITCH_STEPS
            .iter()
            .copied()
            .map(|step| SwitchStepReport {
                step,
                status: SwitchStepState::Pending,
                message: None,
            })
            .collect();
        Self {
            txn_id: txn.id.clone(),
            source_profile: txn.source_profile,
            target_profile: txn.target_profile,
            final_status: txn.status,
            success: false,
            steps,
            error: None,
            migration: None,
            duration_ms: 0,
        }
    }

    fn update_step(&mut self, step: SwitchStep, status: SwitchStepState, message: Option<String>) {
        if let Some(report) = self.steps.iter_mut().find(|report| report.step == step) {
            report.status = status;
            report.message = message;
        }
    }

    pub fn step(&self, step: SwitchStep) -> Option<&SwitchStepReport> {
        self.steps.iter().find(|report| report.step == step)
    }
}

fn emit_step(
    summary: &mut SwitchSummary,
    observer: &Option<SwitchObserver>,
    step: SwitchStep,
    status: SwitchStepState,
    message: Option<String>,
) {
    summary.update_step(step, status, message.clone());
    if let Some(callback) = observer {
        callback(SwitchEvent::Step {
            step,
            status,
            message,
        });
    }
}

/// Run a full switch to `request.target`. Failures inside the switch do
/// not surface as `Err`; they come back in the summary after the unwind
/// has run. `Err` means the switch could not start at all.
pub async fn run_switch(
    env: &SwitchEnvironment,
    request: &SwitchRequest,
    observer: Option<SwitchObserver>,
) -> AppResult<SwitchSummary> {
    let start = Instant::now();
    let _lock = SwitchLock::acquire(&env.data_dir)?;
    let journal = TxnJournal::new(&env.data_dir);
    let source_id = get_active_profile(&env.active)?.profile;

    let mut txn = journal.begin(source_id, request.target)?;
    let mut summary = SwitchSummary::new(&txn);

    match drive(env, request, &journal, &mut txn, &mut summary, &observer).await {
        Ok(()) => {
            summary.success = true;
            summary.final_status = SwitchStatus::Committed;
            emit_step(
                &mut summary,
                &observer,
                SwitchStep::Rollback,
                SwitchStepState::Skipped,
                None,
            );
        }
        Err((step, err)) => {
            emit_step(
                &mut summary,
                &observer,
                step,
                SwitchStepState::Failed,
                Some(err.message().to_string()),
            );
            if let Err(journal_err) = journal.record_error(&mut txn, &err) {
                tracing::warn!(
                    target: "switchboard",
                    event = "txn_journal_lag",
                    txn_id = %txn.id,
                    error = %journal_err
                );
            }

            emit_step(
                &mut summary,
                &observer,
                SwitchStep::Rollback,
                SwitchStepState::Running,
                Some(format!("Restoring {source_id} after {}", err.code())),
            );
            match unwind_transaction(env, &mut txn).await {
                Ok(()) => {
                    if let Err(journal_err) = journal.advance(&mut txn, SwitchStatus::RolledBack) {
                        tracing::warn!(
                            target: "switchboard",
                            event = "txn_journal_lag",
                            txn_id = %txn.id,
                            error = %journal_err
                        );
                    }
                    summary.final_status = SwitchStatus::RolledBack;
                    summary.error = Some(err);
                    emit_step(
                        &mut summary,
                        &observer,
                        SwitchStep::Rollback,
                        SwitchStepState::Success,
                        Some(format!("{source_id} restored")),
                    );
                }
                Err(rollback_err) => {
                    let rollback_err =
                        rollback_err.with_context("initial_error", err.code().to_string());
                    let _ = journal.record_error(&mut txn, &rollback_err);
                    let _ = journal.advance(&mut txn, SwitchStatus::Failed);
                    summary.final_status = SwitchStatus::Failed;
                    emit_step(
                        &mut summary,
                        &observer,
                        SwitchStep::Rollback,
                        SwitchStepState::Failed,
                        Some(rollback_err.message().to_string()),
                    );
                    summary.error = Some(rollback_err);
                }
            }
        }
    }

    summary.duration_ms = start.elapsed().as_millis() as u64;
    tracing::info!(
        target: "switchboard",
        event = "switch_finished",
        txn_id = %summary.txn_id,
        status = %summary.final_status,
        duration_ms = summary.duration_ms
    );
    Ok(summary)
}

type StepResult<T> = Result<T, (SwitchStep, AppError)>;

fn step_err(step: SwitchStep) -> impl FnOnce(AppError) -> (SwitchStep, AppError) {
    move |err| (step, err)
}

async fn drive(
    env: &SwitchEnvironment,
    request: &SwitchRequest,
    journal: &TxnJournal,
    txn: &mut SwitchTransaction,
    summary: &mut SwitchSummary,
    observer: &Option<SwitchObserver>,
) -> StepResult<()> {
    let source_id = txn.source_profile;
    let target_id = txn.target_profile;
    let target_def = get_profile(target_id);
    let lookup = |key: &str| (env.env_lookup)(key);

    // Step 1: resolve and materialize the target configuration.
    emit_step(
        summary,
        observer,
        SwitchStep::Config,
        SwitchStepState::Running,
        Some(format!("Resolving settings for {target_id}")),
    );
    let config_path = paths::config_file(&env.data_dir);
    let prior = config::read_config_at(&config_path).map_err(step_err(SwitchStep::Config))?;
    let fallback = prior.map(|artifact| artifact.settings);
    let target_settings =
        config::gather_with_env(target_def, &request.overrides, &lookup, fallback.as_ref())
            .map_err(step_err(SwitchStep::Config))?;
    let materialized = config::materialize_at(&config_path, target_def, &target_settings)
        .map_err(step_err(SwitchStep::Config))?;
    journal
        .attach_prior_config(txn, materialized.prior_copy.as_deref())
        .map_err(step_err(SwitchStep::Config))?;
    journal
        .advance(txn, SwitchStatus::ConfigWritten)
        .map_err(step_err(SwitchStep::Config))?;
    emit_step(
        summary,
        observer,
        SwitchStep::Config,
        SwitchStepState::Success,
        Some(format!("Wrote {}", materialized.path.display())),
    );

    // Step 2: the source backend must answer before anything is touched.
    emit_step(
        summary,
        observer,
        SwitchStep::SourceProbe,
        SwitchStepState::Running,
        Some(format!("Checking connectivity to {source_id}")),
    );
    let source_settings = if source_id == target_id {
        target_settings.clone()
    } else {
        config::gather_with_env(
            get_profile(source_id),
            &SettingsMap::new(),
            &lookup,
            fallback.as_ref(),
        )
        .map_err(step_err(SwitchStep::SourceProbe))?
    };
    let source_report =
        probe::probe_backend(env.factory.as_ref(), source_id, &source_settings, &env.probe).await;
    if let Some(err) = source_report.connectivity_error() {
        return Err((SwitchStep::SourceProbe, err));
    }
    journal
        .advance(txn, SwitchStatus::ValidatedSource)
        .map_err(step_err(SwitchStep::SourceProbe))?;
    if source_report.schema_present() {
        emit_step(
            summary,
            observer,
            SwitchStep::SourceProbe,
            SwitchStepState::Success,
            Some(format!(
                "Reachable after {} attempt(s)",
                source_report.attempts
            )),
        );
    } else {
        emit_step(
            summary,
            observer,
            SwitchStep::SourceProbe,
            SwitchStepState::Warning,
            Some("Reachable, but the schema is missing; tables will read as empty".to_string()),
        );
    }

    // Step 3: capture entry file backups.
    emit_step(
        summary,
        observer,
        SwitchStep::Backup,
        SwitchStepState::Running,
        Some("Backing up entry files".to_string()),
    );
    let plan = swap::plan_swap(&env.app_root, target_def, source_id, &txn.id);
    let manifest = swap::backup_entry_files(&plan, &txn.id, source_id, target_id)
        .await
        .map_err(step_err(SwitchStep::Backup))?;
    journal
        .attach_manifest(txn, manifest.clone())
        .map_err(step_err(SwitchStep::Backup))?;
    journal
        .advance(txn, SwitchStatus::BackedUp)
        .map_err(step_err(SwitchStep::Backup))?;
    emit_step(
        summary,
        observer,
        SwitchStep::Backup,
        SwitchStepState::Success,
        Some(format!("{} files captured", manifest.entries.len())),
    );

    // Step 4: install the target profile's entry files.
    emit_step(
        summary,
        observer,
        SwitchStep::Swap,
        SwitchStepState::Running,
        Some(format!("Installing {target_id} entry files")),
    );
    swap::swap_entry_files(&plan, &manifest)
        .await
        .map_err(step_err(SwitchStep::Swap))?;
    journal
        .advance(txn, SwitchStatus::Swapped)
        .map_err(step_err(SwitchStep::Swap))?;
    emit_step(
        summary,
        observer,
        SwitchStep::Swap,
        SwitchStepState::Success,
        Some(format!("{} files installed", plan.entries.len())),
    );

    // Step 5: the target backend must answer, with its schema in place.
    emit_step(
        summary,
        observer,
        SwitchStep::TargetProbe,
        SwitchStepState::Running,
        Some(format!("Checking connectivity to {target_id}")),
    );
    let target_report =
        probe::probe_backend(env.factory.as_ref(), target_id, &target_settings, &env.probe).await;
    if let Some(err) = target_report.connectivity_error() {
        return Err((SwitchStep::TargetProbe, err));
    }
    let mut target_note = format!("Reachable after {} attempt(s)", target_report.attempts);
    if !target_report.schema_present() {
        let store = env
            .factory
            .open(target_id, &target_settings)
            .await
            .map_err(step_err(SwitchStep::TargetProbe))?;
        store
            .apply_schema()
            .await
            .map_err(step_err(SwitchStep::TargetProbe))?;
        // The DDL is applied once; only a confirming re-probe lets the
        // switch continue.
        match store
            .schema_presence()
            .await
            .map_err(step_err(SwitchStep::TargetProbe))?
        {
            SchemaPresence::Present => {
                target_note = "Reachable; schema applied".to_string();
            }
            SchemaPresence::Absent { missing } => {
                return Err((
                    SwitchStep::TargetProbe,
                    AppError::new(
                        "PROBE/SCHEMA_MISSING",
                        "The target schema is still missing after it was applied.",
                    )
                    .with_context("profile", target_id.to_string())
                    .with_context("missing", missing.join(", ")),
                ));
            }
        }
    }
    journal
        .advance(txn, SwitchStatus::ValidatedTarget)
        .map_err(step_err(SwitchStep::TargetProbe))?;
    emit_step(
        summary,
        observer,
        SwitchStep::TargetProbe,
        SwitchStepState::Success,
        Some(target_note),
    );

    // Step 6: move the rows.
    if source_id == target_id {
        journal
            .advance(txn, SwitchStatus::Migrated)
            .map_err(step_err(SwitchStep::Migrate))?;
        emit_step(
            summary,
            observer,
            SwitchStep::Migrate,
            SwitchStepState::Skipped,
            Some("Source and target are the same profile".to_string()),
        );
    } else {
        emit_step(
            summary,
            observer,
            SwitchStep::Migrate,
            SwitchStepState::Running,
            Some(format!("Migrating rows from {source_id} to {target_id}")),
        );
        let source_store = env
            .factory
            .open(source_id, &source_settings)
            .await
            .map_err(step_err(SwitchStep::Migrate))?;
        let target_store = env
            .factory
            .open(target_id, &target_settings)
            .await
            .map_err(step_err(SwitchStep::Migrate))?;
        let report = migrate::run_migration(
            source_store.as_ref(),
            target_store.as_ref(),
            &env.migration,
        )
        .await
        .map_err(|fatal| (SwitchStep::Migrate, AppError::from(fatal)))?;
        journal
            .attach_migration(txn, report.clone())
            .map_err(step_err(SwitchStep::Migrate))?;
        journal
            .advance(txn, SwitchStatus::Migrated)
            .map_err(step_err(SwitchStep::Migrate))?;

        let totals = report.totals();
        let aborted = report.aborted_tables();
        let state = if aborted.is_empty() && totals.error_count == 0 {
            SwitchStepState::Success
        } else {
            SwitchStepState::Warning
        };
        let mut message = format!(
            "{} rows written, {} unchanged",
            totals.rows_written, totals.rows_skipped
        );
        if totals.error_count > 0 {
            message.push_str(&format!(", {} row errors", totals.error_count));
        }
        if !aborted.is_empty() {
            let names: Vec<&str> = aborted.iter().map(|kind| kind.table()).collect();
            message.push_str(&format!("; aborted: {}", names.join(", ")));
        }
        summary.migration = Some(report);
        emit_step(summary, observer, SwitchStep::Migrate, state, Some(message));
    }

    // Step 7: flip the active profile.
    emit_step(
        summary,
        observer,
        SwitchStep::Commit,
        SwitchStepState::Running,
        Some("Committing".to_string()),
    );
    set_active_profile(&env.active, target_id, Some(txn.id.clone()))
        .map_err(step_err(SwitchStep::Commit))?;
    // The switch is complete once the active profile flips; a journal
    // write failure past this point is reported, not unwound.
    if let Err(journal_err) = journal.advance(txn, SwitchStatus::Committed) {
        tracing::warn!(
            target: "switchboard",
            event = "txn_journal_lag",
            txn_id = %txn.id,
            error = %journal_err
        );
    }
    emit_step(
        summary,
        observer,
        SwitchStep::Commit,
        SwitchStepState::Success,
        Some(format!("Active profile is now {target_id}")),
    );
    Ok(())
}

fn reached(txn: &SwitchTransaction, status: SwitchStatus) -> bool {
    txn.history.iter().any(|entry| entry.status == status)
}

/// Undo a switch's file changes: entry files from the journaled manifest,
/// then the configuration artifact. Config restore is best effort; a
/// failed entry file restore is the fatal case.
async fn unwind_transaction(env: &SwitchEnvironment, txn: &mut SwitchTransaction) -> AppResult<()> {
    if let Some(manifest) = txn.manifest.clone() {
        swap::restore_entry_files(&manifest).await?;
    }
    restore_prior_config(env, txn);
    Ok(())
}

fn restore_prior_config(env: &SwitchEnvironment, txn: &SwitchTransaction) {
    let config_path = paths::config_file(&env.data_dir);
    match txn.prior_config.as_deref() {
        Some(copy) => match fs::read(copy) {
            Ok(bytes) => {
                if let Err(err) = fsops::write_atomic(&config_path, &bytes) {
                    tracing::warn!(
                        target: "switchboard",
                        event = "config_restore_failed",
                        path = %config_path.display(),
                        error = %err
                    );
                } else {
                    tracing::info!(
                        target: "switchboard",
                        event = "config_restored",
                        path = %config_path.display(),
                        from = %copy
                    );
                }
            }
            Err(err) => {
                tracing::warn!(
                    target: "switchboard",
                    event = "config_restore_failed",
                    path = %copy,
                    error = %err
                );
            }
        },
        None => {
            if reached(txn, SwitchStatus::ConfigWritten) {
                match fs::remove_file(&config_path) {
                    Ok(()) => {
                        tracing::info!(
                            target: "switchboard",
                            event = "config_removed",
                            path = %config_path.display()
                        );
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => {
                        tracing::warn!(
                            target: "switchboard",
                            event = "config_restore_failed",
                            path = %config_path.display(),
                            error = %err
                        );
                    }
                }
            }
        }
    }
}

/// Unwind a journaled transaction by id, or the most recent one. Used for
/// crash recovery and operator-driven rollbacks; terminal transactions
/// are refused.
pub async fn run_rollback(
    env: &SwitchEnvironment,
    txn_id: Option<&str>,
) -> AppResult<SwitchTransaction> {
    let _lock = SwitchLock::acquire(&env.data_dir)?;
    let journal = TxnJournal::new(&env.data_dir);
    let mut txn = match txn_id {
        Some(id) => journal.load(id)?,
        None => journal.latest()?.ok_or_else(|| {
            AppError::new("TXN/UNKNOWN", "No switch transactions have been recorded.")
        })?,
    };
    if txn.status.is_terminal() {
        return Err(AppError::new(
            "TXN/TERMINAL",
            "The switch transaction has already finished; nothing to roll back.",
        )
        .with_context("txn_id", txn.id.clone())
        .with_context("status", txn.status.as_str()));
    }

    match unwind_transaction(env, &mut txn).await {
        Ok(()) => {
            journal.advance(&mut txn, SwitchStatus::RolledBack)?;
            Ok(txn)
        }
        Err(err) => {
            let _ = journal.record_error(&mut txn, &err);
            let _ = journal.advance(&mut txn, SwitchStatus::Failed);
            Err(err)
        }
    }
}

/// Probe one profile with fully resolved settings, without touching any
/// switch state.
pub async fn validate_profile(
    env: &SwitchEnvironment,
    profile_id: ProfileId,
    overrides: &SettingsMap,
) -> AppResult<ProbeReport> {
    let profile = get_profile(profile_id);
    let lookup = |key: &str| (env.env_lookup)(key);
    let config_path = paths::config_file(&env.data_dir);
    let fallback = config::read_config_at(&config_path)?.map(|artifact| artifact.settings);
    let settings = config::gather_with_env(profile, overrides, &lookup, fallback.as_ref())?;
    Ok(probe::probe_backend(env.factory.as_ref(), profile_id, &settings, &env.probe).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{MYSQL_DATABASE, SQLITE_PATH};
    use crate::store::sqlite::SqliteStore;
    use crate::store::{EntityKind, EntityStore, PingError, UpsertOutcome, WriteError};
    use crate::store::record::{BookRecord, CategoryRecord, EntityRecord, UserRecord};
    use crate::swap::engine;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::path::Path;
    use tempfile::TempDir;

    struct TestFactory {
        root: PathBuf,
        mysql_up: bool,
    }

    #[async_trait]
    impl StoreFactory for TestFactory {
        async fn open(
            &self,
            profile: ProfileId,
            settings: &SettingsMap,
        ) -> AppResult<Box<dyn EntityStore>> {
            match profile {
                ProfileId::Sqlite => Ok(Box::new(SqliteStore::open(settings).await?)),
                ProfileId::Mysql => {
                    if !self.mysql_up {
                        return Err(AppError::new(
                            "SQLX/CONNECT",
                            "connection refused (os error 111)",
                        ));
                    }
                    let database = settings.get(MYSQL_DATABASE).cloned().unwrap_or_default();
                    let mut map = SettingsMap::new();
                    map.insert(
                        SQLITE_PATH.to_string(),
                        self.root
                            .join(format!("{database}.sqlite3"))
                            .display()
                            .to_string(),
                    );
                    Ok(Box::new(SqliteStore::open(&map).await?))
                }
                ProfileId::Firebase => Err(AppError::new(
                    "PROBE/UNREACHABLE",
                    "firebase is not backed in this fixture",
                )),
            }
        }
    }

    fn seed_app_root(root: &Path) {
        std::fs::create_dir_all(root.join("pages")).unwrap();
        std::fs::write(root.join("main.entry"), b"sqlite main").unwrap();
        std::fs::write(root.join("pages/books.entry"), b"sqlite books").unwrap();
        std::fs::write(root.join("pages/videos.entry"), b"sqlite videos").unwrap();
        for profile in ["sqlite", "mysql", "firebase"] {
            let payload = root.join("profiles").join(profile);
            std::fs::create_dir_all(&payload).unwrap();
            std::fs::write(payload.join("main.entry"), format!("{profile} main")).unwrap();
            std::fs::write(payload.join("books.entry"), format!("{profile} books")).unwrap();
            std::fs::write(payload.join("videos.entry"), format!("{profile} videos")).unwrap();
        }
    }

    fn test_env(dir: &Path, mysql_up: bool) -> SwitchEnvironment {
        let data_dir = dir.join("data");
        let app_root = dir.join("app");
        seed_app_root(&app_root);

        let mut vars: HashMap<String, String> = HashMap::new();
        vars.insert(
            SQLITE_PATH.to_string(),
            dir.join("source.sqlite3").display().to_string(),
        );
        vars.insert("MYSQL_HOST".to_string(), "127.0.0.1:3306".to_string());
        vars.insert("MYSQL_USER".to_string(), "switchboard".to_string());
        vars.insert("MYSQL_PASSWORD".to_string(), "secret".to_string());
        vars.insert(MYSQL_DATABASE.to_string(), "content".to_string());

        SwitchEnvironment {
            active: ActiveHandle::file(paths::active_profile_file(&data_dir)),
            factory: Arc::new(TestFactory {
                root: dir.to_path_buf(),
                mysql_up,
            }),
            probe: ProbeOptions {
                timeout: std::time::Duration::from_millis(500),
                attempts: 2,
                backoff_base: std::time::Duration::from_millis(1),
            },
            migration: MigrationOptions::default(),
            env_lookup: Arc::new(move |key| vars.get(key).cloned()),
            data_dir,
            app_root,
        }
    }

    async fn seed_source_store(dir: &Path) -> SqliteStore {
        let mut settings = SettingsMap::new();
        settings.insert(
            SQLITE_PATH.to_string(),
            dir.join("source.sqlite3").display().to_string(),
        );
        let store = SqliteStore::open(&settings).await.unwrap();
        store.apply_schema().await.unwrap();

        for name in ["Fiction", "Reference"] {
            store
                .upsert(&EntityRecord::Category(CategoryRecord {
                    name: name.to_string(),
                    created_at_ms: 1_000,
                }))
                .await
                .unwrap();
        }
        for n in 0..3 {
            store
                .upsert(&EntityRecord::User(UserRecord {
                    email: format!("reader-{n}@example.com"),
                    display_name: format!("Reader {n}"),
                    created_at_ms: 1_000,
                }))
                .await
                .unwrap();
        }
        for n in 0..5 {
            store
                .upsert(&EntityRecord::Book(BookRecord {
                    title: format!("Book {n}"),
                    author: "Author".to_string(),
                    category: Some("Fiction".to_string()),
                    price_cents: 999,
                    created_at_ms: 1_000,
                }))
                .await
                .unwrap();
        }
        store
    }

    fn request(target: ProfileId) -> SwitchRequest {
        SwitchRequest {
            target,
            overrides: SettingsMap::new(),
        }
    }

    #[tokio::test]
    async fn switch_to_mysql_commits_and_migrates_everything() {
        let dir = TempDir::new().unwrap();
        let env = test_env(dir.path(), true);
        seed_source_store(dir.path()).await;

        let summary = run_switch(&env, &request(ProfileId::Mysql), None)
            .await
            .unwrap();

        assert!(summary.success, "error: {:?}", summary.error);
        assert_eq!(summary.final_status, SwitchStatus::Committed);

        let migration = summary.migration.as_ref().unwrap();
        let per_table = |kind| migration.table(kind).unwrap().stats.rows_written;
        assert_eq!(per_table(EntityKind::Categories), 2);
        assert_eq!(per_table(EntityKind::Users), 3);
        assert_eq!(per_table(EntityKind::Books), 5);

        let active = get_active_profile(&env.active).unwrap();
        assert_eq!(active.profile, ProfileId::Mysql);
        assert_eq!(active.txn_id.as_deref(), Some(summary.txn_id.as_str()));

        assert_eq!(
            std::fs::read(env.app_root.join("main.entry")).unwrap(),
            b"mysql main"
        );

        let artifact = config::read_config_at(&paths::config_file(&env.data_dir))
            .unwrap()
            .unwrap();
        assert_eq!(artifact.profile, ProfileId::Mysql);
        assert!(artifact.settings.contains_key(MYSQL_DATABASE));

        let journal = TxnJournal::new(&env.data_dir);
        let txn = journal.load(&summary.txn_id).unwrap();
        assert_eq!(txn.status, SwitchStatus::Committed);
        let manifest = txn.manifest.unwrap();
        for entry in &manifest.entries {
            assert!(
                Path::new(&entry.backup_path).is_file(),
                "backups are retained after commit"
            );
        }

        let target = env
            .factory
            .open(
                ProfileId::Mysql,
                &config::gather_with_env(
                    get_profile(ProfileId::Mysql),
                    &SettingsMap::new(),
                    &|key| (env.env_lookup)(key),
                    None,
                )
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(target.count(EntityKind::Books).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn unreachable_target_rolls_back_cleanly() {
        let dir = TempDir::new().unwrap();
        let env = test_env(dir.path(), false);
        seed_source_store(dir.path()).await;

        let summary = run_switch(&env, &request(ProfileId::Mysql), None)
            .await
            .unwrap();

        assert!(!summary.success);
        assert_eq!(summary.final_status, SwitchStatus::RolledBack);
        let err = summary.error.as_ref().unwrap();
        assert_eq!(err.code(), "PROBE/UNREACHABLE");

        assert_eq!(
            summary.step(SwitchStep::TargetProbe).unwrap().status,
            SwitchStepState::Failed
        );
        assert_eq!(
            summary.step(SwitchStep::Migrate).unwrap().status,
            SwitchStepState::Pending
        );
        assert_eq!(
            summary.step(SwitchStep::Rollback).unwrap().status,
            SwitchStepState::Success
        );

        assert_eq!(
            std::fs::read(env.app_root.join("main.entry")).unwrap(),
            b"sqlite main"
        );
        assert_eq!(
            std::fs::read(env.app_root.join("pages/books.entry")).unwrap(),
            b"sqlite books"
        );

        let active = get_active_profile(&env.active).unwrap();
        assert_eq!(active.profile, ProfileId::Sqlite);

        // No artifact existed before the switch, so none should remain.
        assert!(config::read_config_at(&paths::config_file(&env.data_dir))
            .unwrap()
            .is_none());

        let journal = TxnJournal::new(&env.data_dir);
        let txn = journal.load(&summary.txn_id).unwrap();
        assert_eq!(txn.status, SwitchStatus::RolledBack);
    }

    #[tokio::test]
    async fn invalid_config_fails_before_touching_files() {
        let dir = TempDir::new().unwrap();
        let mut env = test_env(dir.path(), true);
        seed_source_store(dir.path()).await;
        // Drop the MySQL password from the environment.
        let vars: HashMap<String, String> = [
            (
                SQLITE_PATH.to_string(),
                dir.path().join("source.sqlite3").display().to_string(),
            ),
            ("MYSQL_HOST".to_string(), "127.0.0.1:3306".to_string()),
            ("MYSQL_USER".to_string(), "switchboard".to_string()),
            (MYSQL_DATABASE.to_string(), "content".to_string()),
        ]
        .into_iter()
        .collect();
        env.env_lookup = Arc::new(move |key| vars.get(key).cloned());

        let summary = run_switch(&env, &request(ProfileId::Mysql), None)
            .await
            .unwrap();

        assert!(!summary.success);
        assert_eq!(summary.final_status, SwitchStatus::RolledBack);
        let err = summary.error.as_ref().unwrap();
        assert_eq!(err.code(), "CONFIG/MISSING_SETTING");
        assert!(err
            .context()
            .get("keys")
            .is_some_and(|keys| keys.contains("MYSQL_PASSWORD")));

        assert_eq!(
            std::fs::read(env.app_root.join("main.entry")).unwrap(),
            b"sqlite main"
        );
        let backups: Vec<String> = std::fs::read_dir(&env.app_root)
            .unwrap()
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| name.contains(".bak-"))
            .collect();
        assert!(backups.is_empty(), "no backups expected: {backups:?}");
    }

    #[tokio::test]
    async fn same_profile_switch_skips_migration() {
        let dir = TempDir::new().unwrap();
        let env = test_env(dir.path(), true);
        seed_source_store(dir.path()).await;

        let summary = run_switch(&env, &request(ProfileId::Sqlite), None)
            .await
            .unwrap();

        assert!(summary.success, "error: {:?}", summary.error);
        assert_eq!(
            summary.step(SwitchStep::Migrate).unwrap().status,
            SwitchStepState::Skipped
        );
        assert!(summary.migration.is_none());
        let active = get_active_profile(&env.active).unwrap();
        assert_eq!(active.profile, ProfileId::Sqlite);
        assert_eq!(active.txn_id.as_deref(), Some(summary.txn_id.as_str()));
    }

    #[tokio::test]
    async fn held_lock_refuses_a_second_switch() {
        let dir = TempDir::new().unwrap();
        let env = test_env(dir.path(), true);
        seed_source_store(dir.path()).await;

        let _guard = SwitchLock::acquire(&env.data_dir).unwrap();
        let err = run_switch(&env, &request(ProfileId::Mysql), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "TXN/SWITCH_IN_PROGRESS");
    }

    #[tokio::test]
    async fn rollback_command_unwinds_an_interrupted_switch() {
        let dir = TempDir::new().unwrap();
        let env = test_env(dir.path(), true);

        // Simulate a switch that stopped after the swap step.
        let journal = TxnJournal::new(&env.data_dir);
        let mut txn = journal.begin(ProfileId::Sqlite, ProfileId::Mysql).unwrap();
        let plan = swap::plan_swap(
            &env.app_root,
            get_profile(ProfileId::Mysql),
            ProfileId::Sqlite,
            &txn.id,
        );
        let manifest = engine::backup_entry_files_sync(
            &plan,
            &txn.id,
            ProfileId::Sqlite,
            ProfileId::Mysql,
        )
        .unwrap();
        journal.attach_manifest(&mut txn, manifest.clone()).unwrap();
        journal
            .advance(&mut txn, SwitchStatus::ConfigWritten)
            .unwrap();
        journal
            .advance(&mut txn, SwitchStatus::ValidatedSource)
            .unwrap();
        journal.advance(&mut txn, SwitchStatus::BackedUp).unwrap();
        engine::swap_entry_files_sync(&plan, &manifest).unwrap();
        journal.advance(&mut txn, SwitchStatus::Swapped).unwrap();
        assert_eq!(
            std::fs::read(env.app_root.join("main.entry")).unwrap(),
            b"mysql main"
        );

        let rolled = run_rollback(&env, Some(&txn.id)).await.unwrap();
        assert_eq!(rolled.status, SwitchStatus::RolledBack);
        assert_eq!(
            std::fs::read(env.app_root.join("main.entry")).unwrap(),
            b"sqlite main"
        );

        let err = run_rollback(&env, Some(&txn.id)).await.unwrap_err();
        assert_eq!(err.code(), "TXN/TERMINAL");
    }

    /// Store whose DDL application silently does nothing, so the schema
    /// stays absent no matter how often it is applied.
    struct InertDdl(Box<dyn EntityStore>);

    #[async_trait]
    impl EntityStore for InertDdl {
        fn profile(&self) -> ProfileId {
            self.0.profile()
        }

        async fn ping(&self) -> Result<(), PingError> {
            self.0.ping().await
        }

        async fn schema_presence(&self) -> AppResult<SchemaPresence> {
            self.0.schema_presence().await
        }

        async fn apply_schema(&self) -> AppResult<()> {
            Ok(())
        }

        async fn read_all(
            &self,
            entity: EntityKind,
        ) -> AppResult<Vec<Result<EntityRecord, String>>> {
            self.0.read_all(entity).await
        }

        async fn upsert(&self, record: &EntityRecord) -> Result<UpsertOutcome, WriteError> {
            self.0.upsert(record).await
        }

        async fn count(&self, entity: EntityKind) -> AppResult<i64> {
            self.0.count(entity).await
        }
    }

    struct InertDdlFactory {
        inner: TestFactory,
    }

    #[async_trait]
    impl StoreFactory for InertDdlFactory {
        async fn open(
            &self,
            profile: ProfileId,
            settings: &SettingsMap,
        ) -> AppResult<Box<dyn EntityStore>> {
            let store = self.inner.open(profile, settings).await?;
            Ok(if profile == ProfileId::Mysql {
                Box::new(InertDdl(store))
            } else {
                store
            })
        }
    }

    #[tokio::test]
    async fn schema_still_absent_after_apply_rolls_back() {
        let dir = TempDir::new().unwrap();
        let mut env = test_env(dir.path(), true);
        env.factory = Arc::new(InertDdlFactory {
            inner: TestFactory {
                root: dir.path().to_path_buf(),
                mysql_up: true,
            },
        });
        seed_source_store(dir.path()).await;

        let summary = run_switch(&env, &request(ProfileId::Mysql), None)
            .await
            .unwrap();

        assert!(!summary.success);
        assert_eq!(summary.final_status, SwitchStatus::RolledBack);
        let err = summary.error.as_ref().unwrap();
        assert_eq!(err.code(), "PROBE/SCHEMA_MISSING");
        assert_eq!(
            summary.step(SwitchStep::TargetProbe).unwrap().status,
            SwitchStepState::Failed
        );
        assert_eq!(
            std::fs::read(env.app_root.join("main.entry")).unwrap(),
            b"sqlite main"
        );
    }
}

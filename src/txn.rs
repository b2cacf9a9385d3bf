//! Switch transactions: a status machine journaled to disk, plus the
//! exclusive lock that serializes switches across processes.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::migrate::MigrationReport;
use crate::profile::ProfileId;
use crate::swap::BackupManifest;
use crate::{fsops, paths, AppError, AppResult};

const JOURNAL_EXT: &str = "json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SwitchStatus {
    Initiated,
    ConfigWritten,
    ValidatedSource,
    BackedUp,
    Swapped,
    ValidatedTarget,
    Migrated,
    Committed,
    RolledBack,
    Failed,
}

impl SwitchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SwitchStatus::Initiated => "initiated",
            SwitchStatus::ConfigWritten => "config-written",
            SwitchStatus::ValidatedSource => "validated-source",
            SwitchStatus::BackedUp => "backed-up",
            SwitchStatus::Swapped => "swapped",
            SwitchStatus::ValidatedTarget => "validated-target",
            SwitchStatus::Migrated => "migrated",
            SwitchStatus::Committed => "committed",
            SwitchStatus::RolledBack => "rolled-back",
            SwitchStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SwitchStatus::Committed | SwitchStatus::RolledBack | SwitchStatus::Failed
        )
    }

    fn next_forward(&self) -> Option<SwitchStatus> {
        match self {
            SwitchStatus::Initiated => Some(SwitchStatus::ConfigWritten),
            SwitchStatus::ConfigWritten => Some(SwitchStatus::ValidatedSource),
            SwitchStatus::ValidatedSource => Some(SwitchStatus::BackedUp),
            SwitchStatus::BackedUp => Some(SwitchStatus::Swapped),
            SwitchStatus::Swapped => Some(SwitchStatus::ValidatedTarget),
            SwitchStatus::ValidatedTarget => Some(SwitchStatus::Migrated),
            SwitchStatus::Migrated => Some(SwitchStatus::Committed),
            SwitchStatus::Committed | SwitchStatus::RolledBack | SwitchStatus::Failed => None,
        }
    }

    /// Forward moves follow the fixed order; any live transaction may
    /// unwind to rolled-back, or to failed when the unwind itself breaks.
    pub fn can_advance_to(&self, next: SwitchStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if matches!(next, SwitchStatus::RolledBack | SwitchStatus::Failed) {
            return true;
        }
        self.next_forward() == Some(next)
    }
}

impl std::fmt::Display for SwitchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEntry {
    pub status: SwitchStatus,
    pub at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorNote {
    pub code: String,
    pub message: String,
}

impl From<&AppError> for ErrorNote {
    fn from(err: &AppError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.message().to_string(),
        }
    }
}

/// Everything a later process needs to inspect or unwind a switch. The
/// backup manifest travels inside the journal so rollback works without
/// the process that started the switch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchTransaction {
    pub id: String,
    pub source_profile: ProfileId,
    pub target_profile: ProfileId,
    pub status: SwitchStatus,
    pub started_at: String,
    pub updated_at: String,
    pub history: Vec<StatusEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest: Option<BackupManifest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub migration: Option<MigrationReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prior_config: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorNote>,
}

fn now_stamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub struct TxnJournal {
    dir: PathBuf,
}

impl TxnJournal {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            dir: paths::transactions_dir(data_dir),
        }
    }

    fn journal_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.{JOURNAL_EXT}"))
    }

    pub fn begin(
        &self,
        source_profile: ProfileId,
        target_profile: ProfileId,
    ) -> AppResult<SwitchTransaction> {
        let stamp = now_stamp();
        let txn = SwitchTransaction {
            id: Uuid::new_v4().to_string(),
            source_profile,
            target_profile,
            status: SwitchStatus::Initiated,
            started_at: stamp.clone(),
            updated_at: stamp.clone(),
            history: vec![StatusEntry {
                status: SwitchStatus::Initiated,
                at: stamp,
            }],
            manifest: None,
            migration: None,
            prior_config: None,
            error: None,
        };
        self.persist(&txn)?;
        tracing::info!(
            target: "switchboard",
            event = "txn_started",
            txn_id = %txn.id,
            source = %source_profile,
            dest = %target_profile
        );
        Ok(txn)
    }

    pub fn advance(&self, txn: &mut SwitchTransaction, next: SwitchStatus) -> AppResult<()> {
        if txn.status.is_terminal() {
            return Err(AppError::new(
                "TXN/TERMINAL",
                "The switch transaction has already finished and cannot change.",
            )
            .with_context("txn_id", txn.id.clone())
            .with_context("status", txn.status.as_str()));
        }
        if !txn.status.can_advance_to(next) {
            return Err(AppError::new(
                "TXN/INVALID_TRANSITION",
                "The switch transaction cannot move to the requested status.",
            )
            .with_context("txn_id", txn.id.clone())
            .with_context("from", txn.status.as_str())
            .with_context("to", next.as_str()));
        }

        let stamp = now_stamp();
        txn.status = next;
        txn.updated_at = stamp.clone();
        txn.history.push(StatusEntry { status: next, at: stamp });
        self.persist(txn)?;
        tracing::info!(
            target: "switchboard",
            event = "txn_status",
            txn_id = %txn.id,
            status = %next
        );
        Ok(())
    }

    pub fn attach_manifest(
        &self,
        txn: &mut SwitchTransaction,
        manifest: BackupManifest,
    ) -> AppResult<()> {
        txn.manifest = Some(manifest);
        txn.updated_at = now_stamp();
        self.persist(txn)
    }

    pub fn attach_migration(
        &self,
        txn: &mut SwitchTransaction,
        report: MigrationReport,
    ) -> AppResult<()> {
        txn.migration = Some(report);
        txn.updated_at = now_stamp();
        self.persist(txn)
    }

    pub fn attach_prior_config(
        &self,
        txn: &mut SwitchTransaction,
        path: Option<&Path>,
    ) -> AppResult<()> {
        txn.prior_config = path.map(|p| p.display().to_string());
        txn.updated_at = now_stamp();
        self.persist(txn)
    }

    pub fn record_error(&self, txn: &mut SwitchTransaction, err: &AppError) -> AppResult<()> {
        txn.error = Some(ErrorNote::from(err));
        txn.updated_at = now_stamp();
        self.persist(txn)
    }

    fn persist(&self, txn: &SwitchTransaction) -> AppResult<()> {
        fs::create_dir_all(&self.dir).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "create_transactions_dir")
                .with_context("path", self.dir.display().to_string())
        })?;
        let bytes = serde_json::to_vec_pretty(txn)?;
        let path = self.journal_path(&txn.id);
        fsops::write_atomic(&path, &bytes).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "write_txn_journal")
                .with_context("path", path.display().to_string())
        })
    }

    pub fn load(&self, id: &str) -> AppResult<SwitchTransaction> {
        let path = self.journal_path(id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(AppError::new(
                    "TXN/UNKNOWN",
                    "No switch transaction with that id was found.",
                )
                .with_context("txn_id", id.to_string()));
            }
            Err(err) => {
                return Err(AppError::from(err)
                    .with_context("operation", "read_txn_journal")
                    .with_context("path", path.display().to_string()));
            }
        };
        let txn = serde_json::from_slice(&bytes)?;
        Ok(txn)
    }

    /// All journaled transactions, newest first.
    pub fn list(&self) -> AppResult<Vec<SwitchTransaction>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(AppError::from(err)
                    .with_context("operation", "list_txn_journals")
                    .with_context("path", self.dir.display().to_string()));
            }
        };

        let mut txns = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| {
                AppError::from(err).with_context("operation", "list_txn_journals")
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(JOURNAL_EXT) {
                continue;
            }
            let bytes = fs::read(&path).map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "read_txn_journal")
                    .with_context("path", path.display().to_string())
            })?;
            match serde_json::from_slice::<SwitchTransaction>(&bytes) {
                Ok(txn) => txns.push(txn),
                Err(err) => {
                    tracing::warn!(
                        target: "switchboard",
                        event = "txn_journal_unreadable",
                        path = %path.display(),
                        error = %err
                    );
                }
            }
        }
        txns.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(txns)
    }

    pub fn latest(&self) -> AppResult<Option<SwitchTransaction>> {
        Ok(self.list()?.into_iter().next())
    }

    /// Transactions that never reached a terminal status, newest first.
    pub fn unfinished(&self) -> AppResult<Vec<SwitchTransaction>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|txn| !txn.status.is_terminal())
            .collect())
    }
}

/// Held for the duration of a switch. The lock file lives in the data
/// directory, so two processes pointed at the same data cannot switch at
/// the same time.
#[derive(Debug)]
pub struct SwitchLock {
    file: File,
    path: PathBuf,
}

impl SwitchLock {
    pub fn acquire(data_dir: &Path) -> AppResult<Self> {
        let path = paths::lock_file(data_dir);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "create_lock_dir")
                    .with_context("path", parent.display().to_string())
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "open_switch_lock")
                    .with_context("path", path.display().to_string())
            })?;
        file.try_lock_exclusive().map_err(|err| {
            if err.kind() == fs2::lock_contended_error().kind() {
                AppError::new(
                    "TXN/SWITCH_IN_PROGRESS",
                    "Another switch is already in progress.",
                )
                .with_context("lock_path", path.display().to_string())
            } else {
                AppError::from(err)
                    .with_context("operation", "acquire_switch_lock")
                    .with_context("path", path.display().to_string())
            }
        })?;
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SwitchLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn status_serializes_kebab_case() {
        let json = serde_json::to_string(&SwitchStatus::ValidatedSource).unwrap();
        assert_eq!(json, "\"validated-source\"");
        let json = serde_json::to_string(&SwitchStatus::RolledBack).unwrap();
        assert_eq!(json, "\"rolled-back\"");
        let back: SwitchStatus = serde_json::from_str("\"backed-up\"").unwrap();
        assert_eq!(back, SwitchStatus::BackedUp);
    }

    #[test]
    fn full_forward_walk_reaches_committed() {
        let dir = TempDir::new().unwrap();
        let journal = TxnJournal::new(dir.path());
        let mut txn = journal.begin(ProfileId::Sqlite, ProfileId::Mysql).unwrap();

        for next in [
            SwitchStatus::ConfigWritten,
            SwitchStatus::ValidatedSource,
            SwitchStatus::BackedUp,
            SwitchStatus::Swapped,
            SwitchStatus::ValidatedTarget,
            SwitchStatus::Migrated,
            SwitchStatus::Committed,
        ] {
            journal.advance(&mut txn, next).unwrap();
        }
        assert_eq!(txn.status, SwitchStatus::Committed);
        assert_eq!(txn.history.len(), 8);

        let loaded = journal.load(&txn.id).unwrap();
        assert_eq!(loaded.status, SwitchStatus::Committed);
        assert_eq!(loaded.history.len(), 8);
    }

    #[test]
    fn forward_skips_are_rejected() {
        let dir = TempDir::new().unwrap();
        let journal = TxnJournal::new(dir.path());
        let mut txn = journal.begin(ProfileId::Sqlite, ProfileId::Mysql).unwrap();

        let err = journal
            .advance(&mut txn, SwitchStatus::Swapped)
            .unwrap_err();
        assert_eq!(err.code(), "TXN/INVALID_TRANSITION");
        assert_eq!(
            err.context().get("from").map(String::as_str),
            Some("initiated")
        );
        assert_eq!(txn.status, SwitchStatus::Initiated);
    }

    #[test]
    fn any_live_status_may_roll_back() {
        let dir = TempDir::new().unwrap();
        let journal = TxnJournal::new(dir.path());
        let mut txn = journal.begin(ProfileId::Firebase, ProfileId::Sqlite).unwrap();
        journal
            .advance(&mut txn, SwitchStatus::ConfigWritten)
            .unwrap();
        journal
            .advance(&mut txn, SwitchStatus::ValidatedSource)
            .unwrap();
        journal
            .advance(&mut txn, SwitchStatus::RolledBack)
            .unwrap();
        assert_eq!(txn.status, SwitchStatus::RolledBack);
    }

    #[test]
    fn terminal_transactions_are_immutable() {
        let dir = TempDir::new().unwrap();
        let journal = TxnJournal::new(dir.path());
        let mut txn = journal.begin(ProfileId::Sqlite, ProfileId::Mysql).unwrap();
        journal
            .advance(&mut txn, SwitchStatus::RolledBack)
            .unwrap();

        let err = journal
            .advance(&mut txn, SwitchStatus::Committed)
            .unwrap_err();
        assert_eq!(err.code(), "TXN/TERMINAL");

        let err = journal.advance(&mut txn, SwitchStatus::Failed).unwrap_err();
        assert_eq!(err.code(), "TXN/TERMINAL");
    }

    #[test]
    fn unknown_transaction_id_is_reported() {
        let dir = TempDir::new().unwrap();
        let journal = TxnJournal::new(dir.path());
        let err = journal.load("nope").unwrap_err();
        assert_eq!(err.code(), "TXN/UNKNOWN");
    }

    #[test]
    fn latest_and_unfinished_sort_newest_first() {
        let dir = TempDir::new().unwrap();
        let journal = TxnJournal::new(dir.path());

        let mut first = journal.begin(ProfileId::Sqlite, ProfileId::Mysql).unwrap();
        journal
            .advance(&mut first, SwitchStatus::RolledBack)
            .unwrap();
        // Journal stamps have millisecond precision.
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = journal.begin(ProfileId::Mysql, ProfileId::Firebase).unwrap();

        let latest = journal.latest().unwrap().unwrap();
        assert_eq!(latest.id, second.id);

        let unfinished = journal.unfinished().unwrap();
        assert_eq!(unfinished.len(), 1);
        assert_eq!(unfinished[0].id, second.id);
    }

    #[test]
    fn lock_is_exclusive_per_data_dir() {
        let dir = TempDir::new().unwrap();
        let held = SwitchLock::acquire(dir.path()).unwrap();
        let err = SwitchLock::acquire(dir.path()).unwrap_err();
        assert_eq!(err.code(), "TXN/SWITCH_IN_PROGRESS");
        drop(held);
        SwitchLock::acquire(dir.path()).unwrap();
    }

    #[test]
    fn journal_round_trips_manifest_and_error() {
        let dir = TempDir::new().unwrap();
        let journal = TxnJournal::new(dir.path());
        let mut txn = journal.begin(ProfileId::Sqlite, ProfileId::Mysql).unwrap();

        let manifest = BackupManifest::new(
            txn.id.clone(),
            ProfileId::Sqlite,
            ProfileId::Mysql,
            Vec::new(),
        );
        journal.attach_manifest(&mut txn, manifest).unwrap();
        journal
            .record_error(&mut txn, &AppError::new("PROBE/UNREACHABLE", "no route"))
            .unwrap();

        let loaded = journal.load(&txn.id).unwrap();
        assert!(loaded.manifest.is_some());
        let note = loaded.error.unwrap();
        assert_eq!(note.code, "PROBE/UNREACHABLE");
    }
}

use std::fs;
use std::path::{Path, PathBuf};

use fs2::available_space;

use crate::fsops;
use crate::profile::{BackendProfile, ProfileId};
use crate::swap::manifest::{file_sha256, BackupManifest, EntryBackup};
use crate::{AppError, AppResult};

pub const FAKE_FREE_BYTES_ENV: &str = "SWITCHBOARD_FAKE_FREE_BYTES";

const REQUIRED_SPACE_MARGIN: f64 = 1.2;
const PARTIAL_SUFFIX: &str = ".partial";

/// One entry file in a planned swap. All three paths share the canonical
/// file's parent directory, so every rename stays on one filesystem.
#[derive(Debug, Clone)]
pub struct PlannedEntry {
    pub canonical: PathBuf,
    pub payload: PathBuf,
    pub backup: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SwapPlan {
    pub app_root: PathBuf,
    pub entries: Vec<PlannedEntry>,
}

fn short_txn(txn_id: &str) -> &str {
    txn_id.get(..8).unwrap_or(txn_id)
}

fn stage_path(path: &Path) -> PathBuf {
    PathBuf::from(format!("{}{}", path.display(), PARTIAL_SUFFIX))
}

/// Resolve the target profile's entry files against the app root. Backups
/// are named after the transaction so copies from earlier switches are
/// never touched.
pub fn plan_swap(
    app_root: &Path,
    target: &'static BackendProfile,
    source: ProfileId,
    txn_id: &str,
) -> SwapPlan {
    let entries = target
        .entry_files
        .iter()
        .map(|spec| {
            let canonical = app_root.join(spec.canonical);
            let file_name = canonical
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| spec.canonical.to_string());
            let backup = canonical.with_file_name(format!(
                "{file_name}.bak-{}-{}",
                short_txn(txn_id),
                source.as_str()
            ));
            PlannedEntry {
                canonical,
                payload: app_root.join(spec.source),
                backup,
            }
        })
        .collect();
    SwapPlan {
        app_root: app_root.to_path_buf(),
        entries,
    }
}

fn free_disk_space(path: &Path) -> AppResult<u64> {
    if let Ok(fake) = std::env::var(FAKE_FREE_BYTES_ENV) {
        if let Ok(bytes) = fake.parse::<u64>() {
            return Ok(bytes);
        }
    }
    available_space(path).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "free_disk_space")
            .with_context("path", path.display().to_string())
    })
}

fn capture_one(entry: &PlannedEntry) -> AppResult<EntryBackup> {
    let stage = stage_path(&entry.backup);
    fs::copy(&entry.canonical, &stage).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "copy_entry_backup")
            .with_context("path", entry.canonical.display().to_string())
    })?;
    fsops::sync_file(&stage)?;

    let original_checksum = file_sha256(&entry.canonical)?;
    let staged_checksum = file_sha256(&stage)?;
    if staged_checksum != original_checksum {
        return Err(AppError::new(
            "SWAP/BACKUP_INCOMPLETE",
            "A backup copy does not match its original.",
        )
        .with_context("path", entry.canonical.display().to_string()));
    }

    fs::rename(&stage, &entry.backup).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "finalize_entry_backup")
            .with_context("path", entry.backup.display().to_string())
    })?;
    if let Some(parent) = entry.backup.parent() {
        fsops::sync_dir(parent)?;
    }

    Ok(EntryBackup {
        original_path: entry.canonical.display().to_string(),
        backup_path: entry.backup.display().to_string(),
        content_checksum: original_checksum,
    })
}

pub fn backup_entry_files_sync(
    plan: &SwapPlan,
    txn_id: &str,
    source: ProfileId,
    target: ProfileId,
) -> AppResult<BackupManifest> {
    let mut total_bytes = 0_u64;
    for entry in &plan.entries {
        let meta = fs::metadata(&entry.canonical).map_err(|err| {
            AppError::new(
                "SWAP/BACKUP_INCOMPLETE",
                "An entry file could not be captured; nothing was swapped.",
            )
            .with_context("path", entry.canonical.display().to_string())
            .with_cause(AppError::from(err).with_context("operation", "stat_entry_file"))
        })?;
        total_bytes += meta.len();
    }

    let required = (total_bytes as f64 * REQUIRED_SPACE_MARGIN).ceil() as u64;
    let free = free_disk_space(&plan.app_root)?;
    if free < required {
        return Err(AppError::new(
            "SWAP/LOW_DISK",
            "Not enough free disk space to capture entry file backups.",
        )
        .with_context("required_bytes", required.to_string())
        .with_context("available_bytes", free.to_string()));
    }

    let mut entries = Vec::with_capacity(plan.entries.len());
    for entry in &plan.entries {
        match capture_one(entry) {
            Ok(record) => entries.push(record),
            Err(err) => {
                // Only the failing entry's stage file is cleaned up.
                // Finished backups stay where they are: they never shadow
                // a canonical file, and a later switch names new ones.
                let _ = fs::remove_file(stage_path(&entry.backup));
                tracing::warn!(
                    target: "switchboard",
                    event = "swap_backup_failed",
                    txn_id = %txn_id,
                    path = %entry.canonical.display(),
                    captured = entries.len()
                );
                return Err(if err.code() == "SWAP/BACKUP_INCOMPLETE" {
                    err
                } else {
                    AppError::new(
                        "SWAP/BACKUP_INCOMPLETE",
                        "An entry file could not be captured; nothing was swapped.",
                    )
                    .with_cause(err)
                });
            }
        }
    }

    tracing::info!(
        target: "switchboard",
        event = "swap_backup_complete",
        txn_id = %txn_id,
        files = entries.len()
    );
    Ok(BackupManifest::new(txn_id, source, target, entries))
}

/// Replace each canonical entry file with the target profile's payload.
/// Every original is re-hashed against the manifest first, so a file that
/// changed after backup aborts the swap before anything is overwritten.
pub fn swap_entry_files_sync(plan: &SwapPlan, manifest: &BackupManifest) -> AppResult<()> {
    for entry in &plan.entries {
        if !entry.payload.is_file() {
            return Err(AppError::new(
                "SWAP/PRECONDITION",
                "A target payload file is missing; swap aborted.",
            )
            .with_context("path", entry.payload.display().to_string()));
        }
    }

    for record in &manifest.entries {
        let original = Path::new(&record.original_path);
        let checksum = file_sha256(original)?;
        if checksum != record.content_checksum {
            return Err(AppError::new(
                "SWAP/PRECONDITION",
                "An entry file changed after it was backed up; swap aborted.",
            )
            .with_context("path", record.original_path.clone()));
        }
    }

    for entry in &plan.entries {
        let stage = stage_path(&entry.canonical);
        let staged = (|| -> AppResult<()> {
            fs::copy(&entry.payload, &stage).map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "stage_entry_payload")
                    .with_context("path", entry.payload.display().to_string())
            })?;
            fsops::sync_file(&stage)?;
            fs::rename(&stage, &entry.canonical).map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "promote_entry_payload")
                    .with_context("path", entry.canonical.display().to_string())
            })?;
            if let Some(parent) = entry.canonical.parent() {
                fsops::sync_dir(parent)?;
            }
            Ok(())
        })();
        if let Err(err) = staged {
            let _ = fs::remove_file(&stage);
            return Err(err);
        }
    }

    tracing::info!(
        target: "switchboard",
        event = "swap_complete",
        txn_id = %manifest.txn_id,
        files = plan.entries.len()
    );
    Ok(())
}

/// Put every entry file back from its backup. All entries are attempted
/// even when one fails; a partial restore is reported as fatal because the
/// entry set is no longer coherent and needs an operator.
pub fn restore_entry_files_sync(manifest: &BackupManifest) -> AppResult<()> {
    let mut failed: Vec<String> = Vec::new();
    for record in &manifest.entries {
        let outcome = (|| -> AppResult<()> {
            let backup = Path::new(&record.backup_path);
            let original = Path::new(&record.original_path);
            let checksum = file_sha256(backup)?;
            if checksum != record.content_checksum {
                return Err(AppError::new(
                    "SWAP/PRECONDITION",
                    "A backup file does not match its recorded checksum.",
                )
                .with_context("path", record.backup_path.clone()));
            }
            let stage = stage_path(original);
            fs::copy(backup, &stage).map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "stage_entry_restore")
                    .with_context("path", record.backup_path.clone())
            })?;
            fsops::sync_file(&stage)?;
            fs::rename(&stage, original).map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "promote_entry_restore")
                    .with_context("path", record.original_path.clone())
            })?;
            if let Some(parent) = original.parent() {
                fsops::sync_dir(parent)?;
            }
            Ok(())
        })();
        if let Err(err) = outcome {
            tracing::warn!(
                target: "switchboard",
                event = "swap_restore_failed",
                path = %record.original_path,
                code = %err.code(),
                error = %err
            );
            failed.push(record.original_path.clone());
        }
    }

    if failed.is_empty() {
        tracing::info!(
            target: "switchboard",
            event = "swap_restored",
            txn_id = %manifest.txn_id,
            files = manifest.entries.len()
        );
        Ok(())
    } else {
        Err(AppError::new(
            "SWAP/ROLLBACK_INCOMPLETE",
            "Some entry files could not be restored from backup; manual recovery is required.",
        )
        .with_context("files", failed.join(", "))
        .with_context("failed_count", failed.len().to_string()))
    }
}

pub async fn backup_entry_files(
    plan: &SwapPlan,
    txn_id: &str,
    source: ProfileId,
    target: ProfileId,
) -> AppResult<BackupManifest> {
    let plan = plan.clone();
    let txn_id = txn_id.to_string();
    fsops::run_blocking(move || backup_entry_files_sync(&plan, &txn_id, source, target)).await
}

pub async fn swap_entry_files(plan: &SwapPlan, manifest: &BackupManifest) -> AppResult<()> {
    let plan = plan.clone();
    let manifest = manifest.clone();
    fsops::run_blocking(move || swap_entry_files_sync(&plan, &manifest)).await
}

pub async fn restore_entry_files(manifest: &BackupManifest) -> AppResult<()> {
    let manifest = manifest.clone();
    fsops::run_blocking(move || restore_entry_files_sync(&manifest)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::get_profile;
    use std::fs;
    use tempfile::TempDir;

    const TXN: &str = "0a1b2c3d-0000-4000-8000-000000000000";

    fn seed_app_root() -> TempDir {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("pages")).unwrap();
        fs::write(root.join("main.entry"), b"sqlite main").unwrap();
        fs::write(root.join("pages/books.entry"), b"sqlite books").unwrap();
        fs::write(root.join("pages/videos.entry"), b"sqlite videos").unwrap();
        for profile in ["sqlite", "mysql", "firebase"] {
            let payload = root.join("profiles").join(profile);
            fs::create_dir_all(&payload).unwrap();
            fs::write(payload.join("main.entry"), format!("{profile} main")).unwrap();
            fs::write(payload.join("books.entry"), format!("{profile} books")).unwrap();
            fs::write(payload.join("videos.entry"), format!("{profile} videos")).unwrap();
        }
        dir
    }

    fn mysql_plan(root: &Path) -> SwapPlan {
        plan_swap(root, get_profile(ProfileId::Mysql), ProfileId::Sqlite, TXN)
    }

    #[test]
    fn backup_swap_restore_roundtrip() {
        let dir = seed_app_root();
        let root = dir.path();
        let plan = mysql_plan(root);

        let manifest =
            backup_entry_files_sync(&plan, TXN, ProfileId::Sqlite, ProfileId::Mysql).unwrap();
        assert_eq!(manifest.entries.len(), 3);
        let backup_main = root.join("main.entry.bak-0a1b2c3d-sqlite");
        assert_eq!(fs::read(&backup_main).unwrap(), b"sqlite main");

        swap_entry_files_sync(&plan, &manifest).unwrap();
        assert_eq!(fs::read(root.join("main.entry")).unwrap(), b"mysql main");
        assert_eq!(
            fs::read(root.join("pages/books.entry")).unwrap(),
            b"mysql books"
        );

        restore_entry_files_sync(&manifest).unwrap();
        assert_eq!(fs::read(root.join("main.entry")).unwrap(), b"sqlite main");
        assert_eq!(
            fs::read(root.join("pages/videos.entry")).unwrap(),
            b"sqlite videos"
        );
        assert!(backup_main.is_file(), "backups are retained after restore");
    }

    #[test]
    fn backup_fails_before_copying_when_an_entry_is_missing() {
        let dir = seed_app_root();
        let root = dir.path();
        fs::remove_file(root.join("pages/videos.entry")).unwrap();
        let plan = mysql_plan(root);

        let err = backup_entry_files_sync(&plan, TXN, ProfileId::Sqlite, ProfileId::Mysql)
            .unwrap_err();
        assert_eq!(err.code(), "SWAP/BACKUP_INCOMPLETE");
        // The stat pass rejects the set before anything is copied.
        assert!(!root.join("main.entry.bak-0a1b2c3d-sqlite").exists());
        assert!(!root.join("pages/books.entry.bak-0a1b2c3d-sqlite").exists());
    }

    #[test]
    fn failed_backup_keeps_the_copies_already_finished() {
        let dir = seed_app_root();
        let root = dir.path();
        // Passes the stat check but fails the copy, after the first two
        // entries have already been captured.
        fs::remove_file(root.join("pages/videos.entry")).unwrap();
        fs::create_dir(root.join("pages/videos.entry")).unwrap();
        let plan = mysql_plan(root);

        let err = backup_entry_files_sync(&plan, TXN, ProfileId::Sqlite, ProfileId::Mysql)
            .unwrap_err();
        assert_eq!(err.code(), "SWAP/BACKUP_INCOMPLETE");

        assert_eq!(
            fs::read(root.join("main.entry.bak-0a1b2c3d-sqlite")).unwrap(),
            b"sqlite main",
            "finished backups are left in place"
        );
        assert_eq!(
            fs::read(root.join("pages/books.entry.bak-0a1b2c3d-sqlite")).unwrap(),
            b"sqlite books"
        );
        assert!(
            !root
                .join("pages/videos.entry.bak-0a1b2c3d-sqlite.partial")
                .exists(),
            "the failing entry's stage file is removed"
        );
    }

    #[test]
    fn swap_refuses_when_original_drifted() {
        let dir = seed_app_root();
        let root = dir.path();
        let plan = mysql_plan(root);
        let manifest =
            backup_entry_files_sync(&plan, TXN, ProfileId::Sqlite, ProfileId::Mysql).unwrap();

        fs::write(root.join("pages/books.entry"), b"edited behind our back").unwrap();

        let err = swap_entry_files_sync(&plan, &manifest).unwrap_err();
        assert_eq!(err.code(), "SWAP/PRECONDITION");
        assert_eq!(fs::read(root.join("main.entry")).unwrap(), b"sqlite main");
    }

    #[test]
    fn swap_refuses_when_payload_missing() {
        let dir = seed_app_root();
        let root = dir.path();
        fs::remove_file(root.join("profiles/mysql/videos.entry")).unwrap();
        let plan = mysql_plan(root);
        let manifest =
            backup_entry_files_sync(&plan, TXN, ProfileId::Sqlite, ProfileId::Mysql).unwrap();

        let err = swap_entry_files_sync(&plan, &manifest).unwrap_err();
        assert_eq!(err.code(), "SWAP/PRECONDITION");
        assert_eq!(fs::read(root.join("main.entry")).unwrap(), b"sqlite main");
    }

    #[test]
    fn restore_reports_missing_backups_as_fatal() {
        let dir = seed_app_root();
        let root = dir.path();
        let plan = mysql_plan(root);
        let manifest =
            backup_entry_files_sync(&plan, TXN, ProfileId::Sqlite, ProfileId::Mysql).unwrap();
        swap_entry_files_sync(&plan, &manifest).unwrap();

        fs::remove_file(root.join("pages/books.entry.bak-0a1b2c3d-sqlite")).unwrap();

        let err = restore_entry_files_sync(&manifest).unwrap_err();
        assert_eq!(err.code(), "SWAP/ROLLBACK_INCOMPLETE");
        let files = err.context().get("files").cloned().unwrap_or_default();
        assert!(files.contains("books.entry"), "{files}");
        assert_eq!(
            fs::read(root.join("main.entry")).unwrap(),
            b"sqlite main",
            "entries with intact backups are still restored"
        );
    }

    #[test]
    fn backup_names_carry_txn_and_source() {
        let dir = seed_app_root();
        let plan = mysql_plan(dir.path());
        let names: Vec<String> = plan
            .entries
            .iter()
            .map(|entry| {
                entry
                    .backup
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default()
            })
            .collect();
        assert!(names.contains(&"main.entry.bak-0a1b2c3d-sqlite".to_string()));
        assert!(names.contains(&"books.entry.bak-0a1b2c3d-sqlite".to_string()));
    }
}

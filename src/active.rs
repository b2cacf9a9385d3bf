//! Which backend profile the platform is currently serving from. The
//! record only changes when a switch commits, so readers can trust it
//! even while a switch is mid-flight.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::fsops::write_atomic;
use crate::profile::ProfileId;
use crate::{AppError, AppResult};

/// Profile used when no record exists yet: the embedded store works
/// without any remote configuration.
pub const DEFAULT_PROFILE: ProfileId = ProfileId::Sqlite;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveRecord {
    pub profile: ProfileId,
    pub committed_at_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub txn_id: Option<String>,
}

impl ActiveRecord {
    pub fn new(profile: ProfileId, txn_id: Option<String>) -> Self {
        Self {
            profile,
            committed_at_ms: chrono::Utc::now().timestamp_millis(),
            txn_id,
        }
    }
}

trait ActiveStore: Send + Sync {
    fn load(&self) -> AppResult<Option<ActiveRecord>>;
    fn store(&self, record: &ActiveRecord) -> AppResult<()>;
}

struct FileStore {
    path: PathBuf,
}

impl ActiveStore for FileStore {
    fn load(&self) -> AppResult<Option<ActiveRecord>> {
        match std::fs::read(&self.path) {
            // An unreadable record is treated like a missing one: the
            // caller falls back to the default and rewrites the file.
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(record) => Ok(Some(record)),
                Err(err) => {
                    warn!(
                        target: "switchboard",
                        event = "active_profile_unreadable",
                        path = %self.path.display(),
                        error = %err
                    );
                    Ok(None)
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => {
                Err(AppError::from(err).with_context("path", self.path.display().to_string()))
            }
        }
    }

    fn store(&self, record: &ActiveRecord) -> AppResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AppError::from(e).with_context("path", parent.display().to_string()))?;
        }
        let bytes = serde_json::to_vec_pretty(record)?;
        write_atomic(&self.path, &bytes)
            .map_err(|e| AppError::from(e).with_context("path", self.path.display().to_string()))?;
        Ok(())
    }
}

#[derive(Default)]
struct MemoryStore {
    data: Mutex<Option<ActiveRecord>>,
}

impl ActiveStore for MemoryStore {
    fn load(&self) -> AppResult<Option<ActiveRecord>> {
        Ok(self
            .data
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default())
    }

    fn store(&self, record: &ActiveRecord) -> AppResult<()> {
        if let Ok(mut guard) = self.data.lock() {
            *guard = Some(record.clone());
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct ActiveHandle {
    inner: Arc<dyn ActiveStore>,
}

impl ActiveHandle {
    pub fn file(path: PathBuf) -> Self {
        Self {
            inner: Arc::new(FileStore { path }),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(MemoryStore::default()),
        }
    }

    pub fn snapshot(&self) -> AppResult<Option<ActiveRecord>> {
        self.inner.load()
    }
}

/// Current active profile. A missing record falls back to the default and
/// persists it, so every later reader sees the same answer.
pub fn get_active_profile(handle: &ActiveHandle) -> AppResult<ActiveRecord> {
    if let Some(record) = handle.inner.load()? {
        return Ok(record);
    }
    let fallback = ActiveRecord::new(DEFAULT_PROFILE, None);
    if let Err(err) = handle.inner.store(&fallback) {
        warn!(
            target: "switchboard",
            event = "active_profile_persist_failed",
            error = %err
        );
    }
    info!(
        target: "switchboard",
        event = "active_profile_fallback",
        chosen = %fallback.profile
    );
    Ok(fallback)
}

pub fn set_active_profile(
    handle: &ActiveHandle,
    profile: ProfileId,
    txn_id: Option<String>,
) -> AppResult<ActiveRecord> {
    let record = ActiveRecord::new(profile, txn_id);
    handle.inner.store(&record)?;
    info!(
        target: "switchboard",
        event = "active_profile_set",
        profile = %profile,
        txn_id = record.txn_id.as_deref()
    );
    Ok(record)
}

use std::fs::File;
use std::io::Read;
use std::path::Path;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::profile::ProfileId;
use crate::{AppError, AppResult};

/// One entry file captured before a swap: where it lives, where its copy
/// went, and the checksum of the content at capture time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryBackup {
    pub original_path: String,
    pub backup_path: String,
    pub content_checksum: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupManifest {
    pub app_version: String,
    pub txn_id: String,
    pub source_profile: ProfileId,
    pub target_profile: ProfileId,
    pub created_at: String,
    pub entries: Vec<EntryBackup>,
}

impl BackupManifest {
    pub fn new(
        txn_id: impl Into<String>,
        source_profile: ProfileId,
        target_profile: ProfileId,
        entries: Vec<EntryBackup>,
    ) -> Self {
        Self {
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            txn_id: txn_id.into(),
            source_profile,
            target_profile,
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            entries,
        }
    }
}

pub fn file_sha256(path: &Path) -> AppResult<String> {
    let mut file = File::open(path).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "open_file_for_hashing")
            .with_context("path", path.display().to_string())
    })?;
    let mut hasher = Sha256::new();
    let mut buf = [0_u8; 8192];
    loop {
        let read = file.read(&mut buf).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "read_file_for_hashing")
                .with_context("path", path.display().to_string())
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

use std::env;
use std::path::{Path, PathBuf};

use crate::{AppError, AppResult};

/// Overrides the resolved data directory (tests point this at a tempdir).
pub const DATA_DIR_ENV: &str = "SWITCHBOARD_DATA_DIR";
/// Overrides the application root that holds the entry files.
pub const APP_ROOT_ENV: &str = "SWITCHBOARD_APP_ROOT";

const DATA_DIR_NAME: &str = "switchboard";
const CONFIG_DIR_NAME: &str = "config";
const CONFIG_FILE_NAME: &str = "backend.env";
const APP_DIR_NAME: &str = "app";
const PROFILE_PAYLOAD_DIR_NAME: &str = "profiles";
const TRANSACTIONS_DIR_NAME: &str = "transactions";
const ACTIVE_PROFILE_FILE_NAME: &str = "active_profile.json";
const LOCK_FILE_NAME: &str = "switch.lock";

/// Resolve the switchboard data directory.
pub fn data_dir() -> AppResult<PathBuf> {
    if let Ok(dir) = env::var(DATA_DIR_ENV) {
        return Ok(PathBuf::from(dir));
    }

    let base = dirs::data_dir()
        .or_else(|| env::current_dir().ok())
        .ok_or_else(|| {
            AppError::new(
                "PATHS/NO_DATA_DIR",
                "Failed to resolve application data directory",
            )
        })?;
    Ok(base.join(DATA_DIR_NAME))
}

/// The single configuration artifact read by the application at startup.
pub fn config_file(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME)
}

/// Root directory of the application entry files.
pub fn app_root(data_dir: &Path) -> PathBuf {
    if let Ok(root) = env::var(APP_ROOT_ENV) {
        return PathBuf::from(root);
    }
    data_dir.join(APP_DIR_NAME)
}

/// Directory holding the per-profile entry-file payloads.
pub fn profile_payload_root(app_root: &Path) -> PathBuf {
    app_root.join(PROFILE_PAYLOAD_DIR_NAME)
}

pub fn transactions_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(TRANSACTIONS_DIR_NAME)
}

pub fn active_profile_file(data_dir: &Path) -> PathBuf {
    data_dir.join(ACTIVE_PROFILE_FILE_NAME)
}

pub fn lock_file(data_dir: &Path) -> PathBuf {
    data_dir.join(LOCK_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_paths_hang_off_the_data_dir() {
        let root = Path::new("/tmp/sb");
        assert_eq!(
            config_file(root),
            Path::new("/tmp/sb/config/backend.env")
        );
        assert_eq!(
            transactions_dir(root),
            Path::new("/tmp/sb/transactions")
        );
        assert_eq!(
            active_profile_file(root),
            Path::new("/tmp/sb/active_profile.json")
        );
        assert_eq!(lock_file(root), Path::new("/tmp/sb/switch.lock"));
    }
}

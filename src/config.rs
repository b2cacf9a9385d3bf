//! Configuration materializer. Renders the active backend's settings into
//! a `key=value` artifact, keeping a timestamped copy of whatever was
//! there before. Validation is all-or-nothing: nothing touches disk until
//! every required setting is present and well formed.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::fsops::{self, write_atomic};
use crate::paths;
use crate::profile::{BackendProfile, ProfileId};
use crate::settings::SettingsMap;
use crate::{AppError, AppResult};

/// First line of every artifact; names the profile the settings belong to.
pub const PROFILE_KEY: &str = "SWITCHBOARD_PROFILE";

/// How many prior-artifact copies to keep, clamped to 1..=50.
pub const CONFIG_KEEP_ENV: &str = "SWITCHBOARD_CONFIG_KEEP";
const DEFAULT_KEEP: usize = 5;
const MAX_KEEP: usize = 50;

const ARTIFACT_HEADER: &str =
    "# Managed by switchboard. Do not edit while a switch is in progress.";

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigArtifact {
    pub profile: ProfileId,
    pub settings: SettingsMap,
}

#[derive(Debug, Clone)]
pub struct Materialized {
    pub profile: ProfileId,
    pub path: PathBuf,
    /// Where the previous artifact was copied, when one existed.
    pub prior_copy: Option<PathBuf>,
}

/// Check every required setting against its profile's rules. Missing keys
/// and invalid values are each reported in one error that lists all
/// offenders, so an operator fixes the config in one pass.
pub fn validate_settings(profile: &BackendProfile, settings: &SettingsMap) -> AppResult<()> {
    let mut missing = Vec::new();
    let mut invalid = Vec::new();
    for spec in profile.required_settings {
        match settings.get(spec.key) {
            None => missing.push(spec.key),
            Some(value) => {
                if let Err(reason) = spec.check.validate(value) {
                    invalid.push(format!("{}: {reason}", spec.key));
                }
            }
        }
    }
    if !missing.is_empty() {
        return Err(AppError::new(
            "CONFIG/MISSING_SETTING",
            format!("Missing settings for profile {}", profile.id),
        )
        .with_context("profile", profile.id.to_string())
        .with_context("keys", missing.join(", ")));
    }
    if !invalid.is_empty() {
        return Err(AppError::new(
            "CONFIG/INVALID_SETTING",
            format!("Invalid settings for profile {}", profile.id),
        )
        .with_context("profile", profile.id.to_string())
        .with_context("problems", invalid.join("; ")));
    }
    Ok(())
}

/// Resolve the value of every required setting. Precedence, highest
/// first: explicit overrides, process environment, the fallback map
/// (settings recovered from a prior artifact), registry defaults.
pub fn gather_settings(
    profile: &BackendProfile,
    overrides: &SettingsMap,
    fallback: Option<&SettingsMap>,
) -> AppResult<SettingsMap> {
    gather_with_env(profile, overrides, &|key| std::env::var(key).ok(), fallback)
}

pub fn gather_with_env(
    profile: &BackendProfile,
    overrides: &SettingsMap,
    env: &dyn Fn(&str) -> Option<String>,
    fallback: Option<&SettingsMap>,
) -> AppResult<SettingsMap> {
    let mut resolved = SettingsMap::new();
    for spec in profile.required_settings {
        let value = overrides
            .get(spec.key)
            .cloned()
            .or_else(|| env(spec.key))
            .or_else(|| fallback.and_then(|f| f.get(spec.key)).cloned())
            .or_else(|| default_value(profile.id, spec.key));
        if let Some(value) = value {
            resolved.insert(spec.key.to_string(), value);
        }
    }
    validate_settings(profile, &resolved)?;
    Ok(resolved)
}

/// Built-in fallbacks for settings that have an obvious local answer.
fn default_value(profile: ProfileId, key: &str) -> Option<String> {
    match (profile, key) {
        (ProfileId::Sqlite, crate::profile::SQLITE_PATH) => paths::data_dir()
            .ok()
            .map(|dir| dir.join("switchboard.sqlite3").display().to_string()),
        _ => None,
    }
}

/// Keys render in the profile's declared order so the artifact reads the
/// way the registry documents it; unknown extras follow alphabetically.
pub fn render_artifact(profile: &BackendProfile, settings: &SettingsMap) -> String {
    let mut out = String::new();
    out.push_str(ARTIFACT_HEADER);
    out.push('\n');
    out.push_str(&format!("{PROFILE_KEY}={}\n", profile.id));
    for spec in profile.required_settings {
        if let Some(value) = settings.get(spec.key) {
            out.push_str(&format!("{}={value}\n", spec.key));
        }
    }
    for (key, value) in settings {
        if profile.required_settings.iter().any(|spec| spec.key == key) {
            continue;
        }
        out.push_str(&format!("{key}={value}\n"));
    }
    out
}

pub fn parse_artifact(content: &str) -> AppResult<ConfigArtifact> {
    let mut profile = None;
    let mut settings = SettingsMap::new();
    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(
                AppError::new("CONFIG/INVALID_SETTING", "Malformed line in config artifact")
                    .with_context("line", (index + 1).to_string()),
            );
        };
        let key = key.trim();
        if key == PROFILE_KEY {
            profile = Some(value.trim().parse::<ProfileId>()?);
        } else {
            settings.insert(key.to_string(), value.to_string());
        }
    }
    let Some(profile) = profile else {
        return Err(AppError::new(
            "CONFIG/INVALID_SETTING",
            format!("Config artifact does not name a profile ({PROFILE_KEY} missing)"),
        ));
    };
    Ok(ConfigArtifact { profile, settings })
}

/// Write the artifact for `profile`, preserving a timestamped copy of the
/// previous one. Settings must already have passed validation.
pub fn materialize_at(
    config_path: &Path,
    profile: &BackendProfile,
    settings: &SettingsMap,
) -> AppResult<Materialized> {
    validate_settings(profile, settings)?;

    let parent = config_path.parent().ok_or_else(|| {
        AppError::new("PATHS/NO_DATA_DIR", "Config path has no parent directory")
            .with_context("path", config_path.display().to_string())
    })?;
    fs::create_dir_all(parent)
        .map_err(|e| AppError::from(e).with_context("path", parent.display().to_string()))?;

    let prior_copy = match fs::read(config_path) {
        Ok(existing) => {
            let copy_path = prior_copy_path(config_path)?;
            write_atomic(&copy_path, &existing)
                .map_err(|e| AppError::from(e).with_context("path", copy_path.display().to_string()))?;
            Some(copy_path)
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
        Err(err) => {
            return Err(AppError::from(err)
                .with_context("path", config_path.display().to_string()))
        }
    };

    let content = render_artifact(profile, settings);
    write_atomic(config_path, content.as_bytes())
        .map_err(|e| AppError::from(e).with_context("path", config_path.display().to_string()))?;

    prune_prior_copies(config_path, keep_limit());

    tracing::info!(
        target: "switchboard",
        event = "config_materialized",
        profile = %profile.id,
        path = %config_path.display(),
        prior_copy = prior_copy.as_ref().map(|p| p.display().to_string())
    );

    Ok(Materialized {
        profile: profile.id,
        path: config_path.to_path_buf(),
        prior_copy,
    })
}

pub async fn materialize(
    profile: &'static BackendProfile,
    settings: SettingsMap,
) -> AppResult<Materialized> {
    let data_dir = paths::data_dir()?;
    let config_path = paths::config_file(&data_dir);
    fsops::run_blocking(move || materialize_at(&config_path, profile, &settings)).await
}

pub fn read_config_at(path: &Path) -> AppResult<Option<ConfigArtifact>> {
    match fs::read_to_string(path) {
        Ok(content) => parse_artifact(&content).map(Some),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(AppError::from(err).with_context("path", path.display().to_string())),
    }
}

pub async fn read_config() -> AppResult<Option<ConfigArtifact>> {
    let data_dir = paths::data_dir()?;
    let path = paths::config_file(&data_dir);
    fsops::run_blocking(move || read_config_at(&path)).await
}

/// `backend.env.<utc timestamp>`, suffixed `-NN` when a copy from the same
/// second already exists.
fn prior_copy_path(config_path: &Path) -> AppResult<PathBuf> {
    let stamp = Utc::now().format("%Y%m%d-%H%M%S").to_string();
    let base = config_path.display().to_string();
    for attempt in 0..100 {
        let candidate = if attempt == 0 {
            PathBuf::from(format!("{base}.{stamp}"))
        } else {
            PathBuf::from(format!("{base}.{stamp}-{attempt:02}"))
        };
        if !candidate.exists() {
            return Ok(candidate);
        }
    }
    Err(
        AppError::new("CONFIG/COPY_EXHAUSTED", "Could not find a free prior-copy name")
            .with_context("base", base),
    )
}

fn keep_limit() -> usize {
    match std::env::var(CONFIG_KEEP_ENV) {
        Ok(raw) => match raw.parse::<usize>() {
            Ok(n) if (1..=MAX_KEEP).contains(&n) => n,
            _ => {
                tracing::warn!(
                    target: "switchboard",
                    event = "config_keep_invalid",
                    value = %raw,
                    fallback = DEFAULT_KEEP
                );
                DEFAULT_KEEP
            }
        },
        Err(_) => DEFAULT_KEEP,
    }
}

/// Drop the oldest prior copies beyond `keep`. Failures only log: losing
/// an old copy must never fail a switch.
fn prune_prior_copies(config_path: &Path, keep: usize) {
    let Some(parent) = config_path.parent() else {
        return;
    };
    let Some(file_name) = config_path.file_name().and_then(|n| n.to_str()) else {
        return;
    };
    let prefix = format!("{file_name}.");
    let mut copies: Vec<PathBuf> = match fs::read_dir(parent) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(&prefix))
            })
            .collect(),
        Err(err) => {
            tracing::warn!(
                target: "switchboard",
                event = "config_prune_list_failed",
                error = %err
            );
            return;
        }
    };
    // Timestamped names sort chronologically.
    copies.sort();
    if copies.len() <= keep {
        return;
    }
    let excess = copies.len() - keep;
    for path in copies.into_iter().take(excess) {
        match fs::remove_file(&path) {
            Ok(()) => {
                tracing::info!(
                    target: "switchboard",
                    event = "config_copy_pruned",
                    path = %path.display()
                );
            }
            Err(err) => {
                tracing::warn!(
                    target: "switchboard",
                    event = "config_prune_failed",
                    path = %path.display(),
                    error = %err
                );
            }
        }
    }
}

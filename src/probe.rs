//! Connection validation: open a backend, ping it, and report whether it
//! is reachable and carries the expected schema.

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::profile::ProfileId;
use crate::store::{EntityStore, PingError, SchemaPresence, SettingsMap, StoreFactory};
use crate::AppError;

pub const PROBE_TIMEOUT_ENV: &str = "SWITCHBOARD_PROBE_TIMEOUT_MS";
const DEFAULT_TIMEOUT_MS: u64 = 5_000;
const MIN_TIMEOUT_MS: u64 = 100;
const MAX_TIMEOUT_MS: u64 = 60_000;

const DEFAULT_ATTEMPTS: u32 = 3;
const DEFAULT_BACKOFF_MS: u64 = 200;

#[derive(Debug, Clone, Copy)]
pub struct ProbeOptions {
    pub timeout: Duration,
    pub attempts: u32,
    pub backoff_base: Duration,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            attempts: DEFAULT_ATTEMPTS,
            backoff_base: Duration::from_millis(DEFAULT_BACKOFF_MS),
        }
    }
}

impl ProbeOptions {
    /// Defaults, with the timeout overridable through
    /// `SWITCHBOARD_PROBE_TIMEOUT_MS` (clamped to 100..=60000).
    pub fn from_env() -> Self {
        let mut options = Self::default();
        if let Ok(raw) = std::env::var(PROBE_TIMEOUT_ENV) {
            match raw.parse::<u64>() {
                Ok(ms) if (MIN_TIMEOUT_MS..=MAX_TIMEOUT_MS).contains(&ms) => {
                    options.timeout = Duration::from_millis(ms);
                }
                _ => {
                    tracing::warn!(
                        target: "switchboard",
                        event = "probe_timeout_invalid",
                        value = %raw,
                        fallback_ms = DEFAULT_TIMEOUT_MS
                    );
                }
            }
        }
        options
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum SchemaReport {
    Present,
    Absent { missing: Vec<String> },
}

impl From<SchemaPresence> for SchemaReport {
    fn from(presence: SchemaPresence) -> Self {
        match presence {
            SchemaPresence::Present => SchemaReport::Present,
            SchemaPresence::Absent { missing } => SchemaReport::Absent { missing },
        }
    }
}

/// What the validator observed. Never an `Err`: unreachable backends are
/// an answer, not a failure of the probe itself.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeReport {
    pub profile: ProfileId,
    pub reachable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<SchemaReport>,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProbeReport {
    fn unresolved(profile: ProfileId) -> Self {
        Self {
            profile,
            reachable: false,
            latency_ms: None,
            schema: None,
            attempts: 0,
            error_code: None,
            error: None,
        }
    }

    pub fn schema_present(&self) -> bool {
        matches!(self.schema, Some(SchemaReport::Present))
    }

    /// The failure as an error value, when the backend never answered.
    pub fn connectivity_error(&self) -> Option<AppError> {
        if self.reachable {
            return None;
        }
        let code = self
            .error_code
            .clone()
            .unwrap_or_else(|| "PROBE/UNREACHABLE".to_string());
        let message = self
            .error
            .clone()
            .unwrap_or_else(|| "Backend did not respond".to_string());
        Some(
            AppError::new(code, message)
                .with_context("profile", self.profile.to_string())
                .with_context("attempts", self.attempts.to_string()),
        )
    }
}

/// Opens and pings a backend with retry. Transient failures back off
/// exponentially; an auth rejection stops immediately so a bad password
/// is not hammered into a lockout.
pub async fn probe_backend(
    factory: &dyn StoreFactory,
    profile: ProfileId,
    settings: &SettingsMap,
    options: &ProbeOptions,
) -> ProbeReport {
    let mut report = ProbeReport::unresolved(profile);

    for attempt in 1..=options.attempts.max(1) {
        report.attempts = attempt;
        let started = Instant::now();
        match attempt_once(factory, profile, settings, options.timeout).await {
            Ok(store) => {
                report.reachable = true;
                report.latency_ms = Some(started.elapsed().as_millis() as u64);
                report.error = None;
                report.error_code = None;
                match store.schema_presence().await {
                    Ok(presence) => report.schema = Some(presence.into()),
                    Err(err) => {
                        tracing::warn!(
                            target: "switchboard",
                            event = "probe_schema_check_failed",
                            profile = %profile,
                            error = %err
                        );
                        report.error_code = Some(err.code().to_string());
                        report.error = Some(err.message().to_string());
                    }
                }
                break;
            }
            Err(PingError::Auth(err)) => {
                report.error_code = Some("PROBE/AUTH_REJECTED".to_string());
                report.error = Some(err.message().to_string());
                tracing::warn!(
                    target: "switchboard",
                    event = "probe_auth_rejected",
                    profile = %profile,
                    attempt,
                    error = %err
                );
                break;
            }
            Err(PingError::Transient(err)) => {
                let code = if err.code() == "PROBE/TIMEOUT" {
                    "PROBE/TIMEOUT"
                } else {
                    "PROBE/UNREACHABLE"
                };
                report.error_code = Some(code.to_string());
                report.error = Some(err.message().to_string());
                tracing::warn!(
                    target: "switchboard",
                    event = "probe_attempt_failed",
                    profile = %profile,
                    attempt,
                    error = %err
                );
                if attempt < options.attempts {
                    let backoff = options.backoff_base * 2u32.saturating_pow(attempt - 1);
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    tracing::info!(
        target: "switchboard",
        event = "probe_finished",
        profile = %profile,
        reachable = report.reachable,
        attempts = report.attempts,
        latency_ms = report.latency_ms,
        schema_present = report.schema_present()
    );
    report
}

async fn attempt_once(
    factory: &dyn StoreFactory,
    profile: ProfileId,
    settings: &SettingsMap,
    timeout: Duration,
) -> Result<Box<dyn EntityStore>, PingError> {
    let store = factory
        .open(profile, settings)
        .await
        .map_err(PingError::Transient)?;
    match tokio::time::timeout(timeout, store.ping()).await {
        Ok(Ok(())) => Ok(store),
        Ok(Err(err)) => Err(err),
        Err(_) => Err(PingError::Transient(
            AppError::new(
                "PROBE/TIMEOUT",
                format!("No response within {}ms", timeout.as_millis()),
            )
            .with_context("profile", profile.to_string()),
        )),
    }
}

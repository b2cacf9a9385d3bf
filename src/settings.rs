use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::{AppError, AppResult};

/// Validated profile settings, keyed by setting name. Ordered so the
/// rendered artifact and log output stay deterministic.
pub type SettingsMap = BTreeMap<String, String>;

/// One named configuration key a backend profile requires, together with the
/// predicate its value must satisfy.
#[derive(Debug, Clone, Copy)]
pub struct SettingSpec {
    pub key: &'static str,
    pub check: SettingCheck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingCheck {
    /// Any non-empty value.
    NonEmpty,
    /// `host:port` with a port in 1..=65535.
    HostPort,
    /// Letters, digits, underscores and dashes.
    Identifier,
    /// A filesystem path (non-empty, no NUL, no newline).
    PathLike,
}

static HOST_PORT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9.-]*:(\d{1,5})$").expect("host:port regex"));
static IDENTIFIER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("identifier regex"));

impl SettingCheck {
    /// Validate a value, returning the reason on failure.
    pub fn validate(&self, value: &str) -> Result<(), String> {
        match self {
            SettingCheck::NonEmpty => {
                if value.trim().is_empty() {
                    Err("value must not be empty".to_string())
                } else {
                    Ok(())
                }
            }
            SettingCheck::HostPort => {
                let caps = HOST_PORT_RE
                    .captures(value)
                    .ok_or_else(|| "expected host:port".to_string())?;
                let port: u32 = caps[1]
                    .parse()
                    .map_err(|_| "port is not a number".to_string())?;
                if (1..=65_535).contains(&port) {
                    Ok(())
                } else {
                    Err(format!("port {port} outside 1..=65535"))
                }
            }
            SettingCheck::Identifier => {
                if IDENTIFIER_RE.is_match(value) {
                    Ok(())
                } else {
                    Err("only letters, digits, '_' and '-' are allowed".to_string())
                }
            }
            SettingCheck::PathLike => {
                if value.trim().is_empty() {
                    Err("path must not be empty".to_string())
                } else if value.contains('\0') || value.contains('\n') {
                    Err("path contains forbidden characters".to_string())
                } else {
                    Ok(())
                }
            }
        }
    }
}

/// Split a `host:port` value that already passed [`SettingCheck::HostPort`].
pub fn split_host_port(value: &str) -> AppResult<(String, u16)> {
    let (host, port) = value.rsplit_once(':').ok_or_else(|| {
        AppError::new("CONFIG/INVALID_SETTING", "Expected host:port")
            .with_context("value", value.to_string())
    })?;
    let port: u16 = port.parse().map_err(|_| {
        AppError::new("CONFIG/INVALID_SETTING", "Port is not a number")
            .with_context("value", value.to_string())
    })?;
    Ok((host.to_string(), port))
}

/// Fetch a required key out of a materialized settings map.
pub fn require<'a>(values: &'a SettingsMap, key: &str) -> AppResult<&'a str> {
    values.get(key).map(String::as_str).ok_or_else(|| {
        AppError::new("CONFIG/MISSING_SETTING", format!("Missing setting {key}"))
            .with_context("key", key.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_empty_rejects_whitespace() {
        assert!(SettingCheck::NonEmpty.validate("  ").is_err());
        assert!(SettingCheck::NonEmpty.validate("x").is_ok());
    }

    #[test]
    fn host_port_accepts_hostname_and_ip() {
        assert!(SettingCheck::HostPort.validate("db.example.com:3306").is_ok());
        assert!(SettingCheck::HostPort.validate("10.0.0.5:3306").is_ok());
        assert!(SettingCheck::HostPort.validate("localhost:3306").is_ok());
    }

    #[test]
    fn host_port_rejects_bad_shapes() {
        assert!(SettingCheck::HostPort.validate("no-port").is_err());
        assert!(SettingCheck::HostPort.validate(":3306").is_err());
        assert!(SettingCheck::HostPort.validate("host:0").is_err());
        assert!(SettingCheck::HostPort.validate("host:70000").is_err());
        assert!(SettingCheck::HostPort.validate("host:port").is_err());
    }

    #[test]
    fn identifier_rejects_spaces_and_slashes() {
        assert!(SettingCheck::Identifier.validate("my-project_1").is_ok());
        assert!(SettingCheck::Identifier.validate("has space").is_err());
        assert!(SettingCheck::Identifier.validate("a/b").is_err());
    }

    #[test]
    fn split_host_port_returns_parts() {
        let (host, port) = split_host_port("db.example.com:3306").unwrap();
        assert_eq!(host, "db.example.com");
        assert_eq!(port, 3306);
    }
}

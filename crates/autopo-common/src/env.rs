//! Environment variable helpers used by the configuration loaders

use std::str::FromStr;

use crate::error::{AutopoError, Result};

/// Read `key` and parse it, falling back to `default` when unset or unparsable
pub fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}

/// Read `key` and parse it, failing loudly on a malformed value
///
/// Unset variables yield `Ok(None)`.
pub fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| AutopoError::InvalidSetting {
                key: key.to_string(),
                value: raw.clone(),
                reason: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

/// Read a variable that must be present and non-empty
pub fn env_required(key: &str) -> Result<String> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(AutopoError::Config(format!("{} must be set", key))),
    }
}

//! Settings loading with deep merge and environment variable overrides.
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::WagateSettings;

/// `~/.wagate/settings.json`.
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".wagate").join("settings.json")
}

pub fn load_settings() -> Result<WagateSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path, then apply `.env` and process env
/// overrides. A missing file yields defaults; invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<WagateSettings> {
    match dotenvy::dotenv() {
        Ok(env_path) => debug!(path = %env_path.display(), "loaded .env"),
        Err(e) if e.not_found() => {}
        Err(e) => tracing::warn!(error = %e, "ignoring unreadable .env"),
    }

    let mut settings = load_file(path)?;
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    settings.validate()?;
    Ok(settings)
}

fn load_file(path: &Path) -> Result<WagateSettings> {
    let defaults = serde_json::to_value(WagateSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply overrides read through `lookup`. Invalid values are ignored with a
/// warning and the file/default value stays in place.
pub fn apply_env_overrides<F>(settings: &mut WagateSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    if let Some(v) = env.u16("PORT", 1, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = env.string("WAGATE_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.string("WAGATE_ADMIN_TOKEN") {
        settings.server.admin_token = Some(v);
    }
    if let Some(v) = env.string("WAGATE_DB_PATH") {
        settings.storage.db_path = v;
    }
    if let Some(v) = env.string("WAGATE_LOG_DB_PATH") {
        settings.storage.log_db_path = v;
    }
    if let Some(v) = env.u64("WAGATE_KEEPALIVE_SECS", 1, 3600) {
        settings.lifecycle.keepalive_interval_secs = v;
    }
    if let Some(v) = env.u64("WAGATE_WEBHOOK_TIMEOUT_SECS", 1, 300) {
        settings.webhook.timeout_secs = v;
    }
    if let Some(v) = env.string("WHISPER_URL") {
        settings.transcription.base_url = v;
    }
    if let Some(v) = env.string("WAGATE_TRANSCRIBE_LANGUAGE") {
        settings.transcription.language = v;
    }
    if let Some(v) = env.string("WAGATE_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("WAGATE_LOG_JSON") {
        settings.logging.json = v;
    }
}

/// Accepts (case-insensitive) `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = self.string(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = self.string(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "out-of-range env var, ignoring");
        }
        result
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        self.u64(name, u64::from(min), u64::from(max))
            .and_then(|v| u16::try_from(v).ok())
    }
}

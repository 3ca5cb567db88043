//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`EaselSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `EASEL_*` environment variable overrides (highest priority)
//! 4. Validate cross-field limits

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::EaselSettings;

/// Resolve the default settings file path (`~/.easel/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".easel").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<EaselSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON or out-of-range values are
/// errors.
pub fn load_settings_from_path(path: &Path) -> Result<EaselSettings> {
    let defaults = serde_json::to_value(EaselSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: EaselSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment variable overrides to loaded settings.
///
/// Invalid values are ignored with a warning (file/default value stays).
pub fn apply_env_overrides(settings: &mut EaselSettings) {
    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = read_env_string("EASEL_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read_env_u16("EASEL_PORT", 1, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = read_env_u16("EASEL_HEALTH_PORT", 1, 65535) {
        settings.server.health_port = v;
    }

    // ── Limits ──────────────────────────────────────────────────────
    if let Some(v) = read_env_usize("EASEL_USER_LIMIT", 1, 255) {
        settings.limits.user_limit = v;
    }
    if let Some(v) = read_env_usize("EASEL_SESSION_LIMIT", 1, 255) {
        settings.limits.session_limit = v;
    }
    if let Some(v) = read_env_usize("EASEL_SUBSCRIPTION_LIMIT", 1, 255) {
        settings.limits.subscription_limit = v;
    }
    if let Some(v) = read_env_u64("EASEL_IDLE_TIMEOUT_SECS", 1, 86_400) {
        settings.limits.idle_timeout_secs = v;
    }
    if let Some(v) = read_env_usize("EASEL_MAX_QUEUED_MESSAGES", 1, 1 << 20) {
        settings.limits.max_queued_messages = v;
    }

    // ── Permissions ─────────────────────────────────────────────────
    if let Some(v) = read_env_bool("EASEL_ALLOW_DRAW") {
        settings.permissions.allow_draw = v;
    }
    if let Some(v) = read_env_bool("EASEL_ALLOW_CHAT") {
        settings.permissions.allow_chat = v;
    }
    if let Some(v) = read_env_bool("EASEL_ALLOW_DUPLICATE_CONNECTIONS") {
        settings.permissions.allow_duplicate_connections = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = read_env_string("EASEL_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_env_bool("EASEL_LOG_JSON") {
        settings.logging.json = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers ─────────────────────────────────────────────────────────

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let result = parse_bool(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_env_u16(name: &str, min: u16, max: u16) -> Option<u16> {
    let val = std::env::var(name).ok()?;
    let result = parse_u16_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u16 env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}

fn read_env_usize(name: &str, min: usize, max: usize) -> Option<usize> {
    let val = std::env::var(name).ok()?;
    let result = parse_usize_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid usize env var, ignoring");
    }
    result
}

//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`DelioSettings::default()`]
//! 2. If `~/.delio/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `DELIO_*` environment variable overrides (highest priority)
//! 4. Validate the result
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::DelioSettings;

/// Resolve the path to the settings file (`~/.delio/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".delio").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<DelioSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON or an invalid merged value
/// is an error.
pub fn load_settings_from_path(path: &Path) -> Result<DelioSettings> {
    load_with_env(path, |key| std::env::var(key).ok())
}

fn load_with_env(path: &Path, env: impl Fn(&str) -> Option<String>) -> Result<DelioSettings> {
    let defaults = serde_json::to_value(DelioSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: DelioSettings = serde_json::from_value(merged)?;
    apply_overrides(&mut settings, &EnvReader(&env));
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
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

/// Apply process environment overrides to loaded settings.
pub fn apply_env_overrides(settings: &mut DelioSettings) {
    let env = |key: &str| std::env::var(key).ok();
    apply_overrides(settings, &EnvReader(&env));
}

fn apply_overrides(settings: &mut DelioSettings, env: &EnvReader<'_>) {
    // ── Guard ──────────────────────────
    if let Some(v) = env.usize("DELIO_MAX_TRACKED_USERS", 1, 10_000_000) {
        settings.guard.max_tracked_users = v;
    }
    if let Some(v) = env.u64("DELIO_TRANSITION_LOCK_TIMEOUT_MS", 1, 600_000) {
        settings.guard.transition_lock_timeout_ms = v;
    }
    if let Some(v) = env.u64("DELIO_NOTIFY_LOCK_TIMEOUT_MS", 1, 60_000) {
        settings.guard.notify_lock_timeout_ms = v;
    }
    if let Some(v) = env.u64("DELIO_IDLE_EVICTION_SECS", 1, 31_536_000) {
        settings.guard.idle_eviction_secs = v;
    }

    // ── Cycle ──────────────────────────
    if let Some(v) = env.u64("DELIO_CYCLE_TIMEOUT_MS", 100, 3_600_000) {
        settings.cycle.timeout_ms = v;
    }
    if let Some(v) = env.u64("DELIO_MAX_TRANSITIONS", 1, 10_000) {
        settings.cycle.max_transitions = v as u32;
    }
    if let Some(v) = env.u64("DELIO_ERROR_UNWIND_TIMEOUT_MS", 1, 600_000) {
        settings.cycle.error_unwind_timeout_ms = v;
    }

    // ── Heartbeat ─────────────────────────
    if let Some(v) = env.bool("DELIO_HEARTBEAT_ENABLED") {
        settings.heartbeat.enabled = v;
    }
    if let Some(v) = env.u64("DELIO_HEARTBEAT_INTERVAL_SECS", 1, 86_400) {
        settings.heartbeat.interval_secs = v;
    }

    // ── Delivery ─────────────────────────
    if let Some(v) = env.usize("DELIO_MAX_MESSAGE_CHARS", 1, 1_000_000) {
        settings.delivery.max_message_chars = v;
    }
    if let Some(v) = env.i64("DELIO_ADMIN_USER_ID") {
        settings.delivery.admin_user_id = Some(v);
    }

    // ── Planning ─────────────────────────
    if let Some(v) = env.bool("DELIO_CRITIC_ENABLED") {
        settings.planning.critic_enabled = v;
    }
    if let Some(v) = env.bool("DELIO_REFLECTION_ENABLED") {
        settings.planning.reflection_enabled = v;
    }

    // ── Logging ──────────────────────────
    if let Some(v) = env.string("DELIO_LOG_LEVEL") {
        settings.logging.level = v;
    }
}

// ── Pure parsing functions (testable without env vars) ─────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers (thin wrappers) ───────────────────

struct EnvReader<'a>(&'a dyn Fn(&str) -> Option<String>);

impl EnvReader<'_> {
    fn string(&self, name: &str) -> Option<String> {
        (self.0)(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = (self.0)(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = (self.0)(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
        }
        result
    }

    fn usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        let val = (self.0)(name)?;
        let result = parse_usize_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid usize env var, ignoring");
        }
        result
    }

    fn i64(&self, name: &str) -> Option<i64> {
        let val = (self.0)(name)?;
        let result = val.trim().parse().ok();
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid i64 env var, ignoring");
        }
        result
    }
}

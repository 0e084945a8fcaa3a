//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`ParleySettings::default()`]
//! 2. If the settings file exists, deep-merge user values over defaults
//! 3. Apply `PARLEY_*` environment variable overrides (highest priority)
//! 4. Validate ranges; out-of-range values are an error

use std::path::{Path, PathBuf};

use parley_core::security::ApiKey;
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::ParleySettings;

/// Upper bound for every configurable timeout, in seconds.
const MAX_TIMEOUT_SECS: u64 = 3600;

/// `~/.parley`, falling back to `/tmp/.parley` when `HOME` is unset.
pub fn parley_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".parley")
}

/// Resolve the path to the settings file (`~/.parley/settings.json`).
pub fn settings_path() -> PathBuf {
    parley_home().join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<ParleySettings> {
    load_settings_from_path(&settings_path())
}

/// An environment override that was present but unusable, so the
/// file/default value was kept.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IgnoredEnvVar {
    pub key: &'static str,
    pub value: String,
    pub expected: &'static str,
}

/// Loaded settings plus the overrides that were ignored.
///
/// Startup loads settings before a subscriber exists, so the ignored
/// overrides are handed back for logging once one does.
#[derive(Clone, Debug)]
pub struct LoadedSettings {
    pub settings: ParleySettings,
    pub ignored_env: Vec<IgnoredEnvVar>,
}

impl LoadedSettings {
    pub fn log_ignored(&self) {
        for ignored in &self.ignored_env {
            warn!(
                key = ignored.key,
                value = %ignored.value,
                expected = ignored.expected,
                "invalid env var, ignoring"
            );
        }
    }
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON or an out-of-range value is
/// an error.
pub fn load_settings_from_path(path: &Path) -> Result<ParleySettings> {
    let loaded = load_settings_with_report(path)?;
    loaded.log_ignored();
    Ok(loaded.settings)
}

/// Like [`load_settings_from_path`], but returns ignored overrides instead
/// of logging them.
pub fn load_settings_with_report(path: &Path) -> Result<LoadedSettings> {
    let defaults = serde_json::to_value(ParleySettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: ParleySettings = serde_json::from_value(merged)?;
    let ignored_env = apply_env_overrides(&mut settings);
    validate(&settings)?;
    Ok(LoadedSettings { settings, ignored_env })
}

/// Reject values the server cannot run with.
pub fn validate(settings: &ParleySettings) -> Result<()> {
    let server = &settings.server;
    let llm = &settings.llm;

    check(server.port >= 1, "server.port must be between 1 and 65535")?;
    check(server.default_owner_id >= 1, "server.defaultOwnerId must be positive")?;
    check(
        (1..=MAX_TIMEOUT_SECS).contains(&server.stream_timeout_secs),
        "server.streamTimeoutSecs must be between 1 and 3600",
    )?;
    check(
        server.stream_channel_capacity >= 1,
        "server.streamChannelCapacity must be at least 1",
    )?;
    check(
        (1..=MAX_TIMEOUT_SECS).contains(&llm.request_timeout_secs),
        "llm.requestTimeoutSecs must be between 1 and 3600",
    )?;
    check(
        (1..=MAX_TIMEOUT_SECS).contains(&llm.connect_timeout_secs),
        "llm.connectTimeoutSecs must be between 1 and 3600",
    )?;
    check(!llm.base_url.trim().is_empty(), "llm.baseUrl must not be blank")?;
    check(!llm.model.trim().is_empty(), "llm.model must not be blank")?;
    Ok(())
}

fn check(ok: bool, message: &str) -> Result<()> {
    if ok {
        Ok(())
    } else {
        Err(SettingsError::InvalidValue(message.to_string()))
    }
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
/// Invalid values fall back to file/default and are returned.
pub fn apply_env_overrides(settings: &mut ParleySettings) -> Vec<IgnoredEnvVar> {
    let mut ignored = Vec::new();

    if let Some(v) = read_env_string("PARLEY_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read_env_u16(&mut ignored, "PARLEY_PORT", 1, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = read_env_u64(&mut ignored, "PARLEY_DEFAULT_OWNER", 1, i64::MAX as u64) {
        settings.server.default_owner_id = v as i64;
    }
    if let Some(v) = read_env_u64(&mut ignored, "PARLEY_STREAM_TIMEOUT_SECS", 1, MAX_TIMEOUT_SECS) {
        settings.server.stream_timeout_secs = v;
    }

    if let Some(v) = read_env_string("PARLEY_LLM_BASE_URL") {
        settings.llm.base_url = v;
    }
    if let Some(v) = read_env_string("PARLEY_LLM_MODEL") {
        settings.llm.model = v;
    }
    if let Some(v) = read_env_string("PARLEY_LLM_API_KEY") {
        settings.llm.api_key = Some(ApiKey::new(v));
    }

    if let Some(v) = read_env_string("PARLEY_DATABASE_PATH") {
        settings.storage.database_path = PathBuf::from(v);
    }

    if let Some(v) = read_env_string("PARLEY_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_env_bool(&mut ignored, "PARLEY_LOG_JSON") {
        settings.logging.json = v;
    }

    ignored
}

/// Startup check: refuse to run without an upstream API key.
pub fn require_api_key(settings: &ParleySettings) -> Result<ApiKey> {
    match &settings.llm.api_key {
        Some(key) if !key.is_blank() => Ok(key.clone()),
        _ => Err(SettingsError::MissingApiKey),
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

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_bool(ignored: &mut Vec<IgnoredEnvVar>, key: &'static str) -> Option<bool> {
    let val = std::env::var(key).ok()?;
    let result = parse_bool(&val);
    if result.is_none() {
        ignored.push(IgnoredEnvVar { key, value: val, expected: "boolean" });
    }
    result
}

fn read_env_u16(ignored: &mut Vec<IgnoredEnvVar>, key: &'static str, min: u16, max: u16) -> Option<u16> {
    let val = std::env::var(key).ok()?;
    let result = parse_u16_range(&val, min, max);
    if result.is_none() {
        ignored.push(IgnoredEnvVar { key, value: val, expected: "u16 in range" });
    }
    result
}

fn read_env_u64(ignored: &mut Vec<IgnoredEnvVar>, key: &'static str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(key).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        ignored.push(IgnoredEnvVar { key, value: val, expected: "u64 in range" });
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_settings_file(contents: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("parley-settings-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("settings.json");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"server": {"port": 8080, "host": "localhost"}});
        let source = serde_json::json!({"server": {"port": 9090}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["server"]["port"], 9090);
        assert_eq!(merged["server"]["host"], "localhost");
    }

    #[test]
    fn merge_null_preserves_target() {
        let merged = deep_merge(serde_json::json!({"a": 1}), serde_json::json!({"a": null}));
        assert_eq!(merged["a"], 1);
    }

    #[test]
    fn merge_array_replace() {
        let merged = deep_merge(
            serde_json::json!({"items": [1, 2, 3]}),
            serde_json::json!({"items": [4]}),
        );
        assert_eq!(merged["items"], serde_json::json!([4]));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let path = std::env::temp_dir().join("parley-definitely-missing/settings.json");
        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.llm.model, ParleySettings::default().llm.model);
    }

    #[test]
    fn file_values_merge_over_defaults() {
        let path = temp_settings_file(r#"{"llm": {"model": "qwen-plus"}, "logging": {"json": false}}"#);
        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.llm.model, "qwen-plus");
        assert!(!settings.logging.json);
        assert_eq!(settings.llm.base_url, "https://api.deepseek.com");
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn invalid_json_is_an_error() {
        let path = temp_settings_file("{not json");
        let result = load_settings_from_path(&path);
        assert!(matches!(result, Err(SettingsError::Json(_))));
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn zero_timeouts_in_file_are_rejected() {
        for body in [
            r#"{"server": {"streamTimeoutSecs": 0}}"#,
            r#"{"llm": {"requestTimeoutSecs": 0}}"#,
            r#"{"server": {"port": 0}}"#,
        ] {
            let path = temp_settings_file(body);
            let result = load_settings_from_path(&path);
            assert!(matches!(result, Err(SettingsError::InvalidValue(_))), "{body}: {result:?}");
            let _ = std::fs::remove_dir_all(path.parent().unwrap());
        }
    }

    #[test]
    fn validate_accepts_defaults_and_names_the_bad_field() {
        let mut settings = ParleySettings::default();
        assert!(validate(&settings).is_ok());

        settings.server.stream_channel_capacity = 0;
        let err = validate(&settings).unwrap_err();
        assert!(err.to_string().contains("streamChannelCapacity"), "got: {err}");

        settings = ParleySettings::default();
        settings.llm.model = "  ".into();
        assert!(matches!(validate(&settings), Err(SettingsError::InvalidValue(_))));
    }

    #[test]
    fn unusable_env_override_is_reported_not_applied() {
        std::env::set_var("PARLEY_LOG_JSON", "sometimes");
        let path = std::env::temp_dir().join("parley-definitely-missing/settings.json");
        let loaded = load_settings_with_report(&path);
        std::env::remove_var("PARLEY_LOG_JSON");

        let loaded = loaded.unwrap();
        assert_eq!(loaded.settings.logging.json, ParleySettings::default().logging.json);
        let ignored = loaded
            .ignored_env
            .iter()
            .find(|i| i.key == "PARLEY_LOG_JSON")
            .expect("override reported");
        assert_eq!(ignored.value, "sometimes");
        assert_eq!(ignored.expected, "boolean");
    }

    #[test]
    fn require_api_key_rejects_missing_and_blank() {
        let mut settings = ParleySettings::default();
        assert!(matches!(require_api_key(&settings), Err(SettingsError::MissingApiKey)));

        settings.llm.api_key = Some(ApiKey::new("   "));
        assert!(matches!(require_api_key(&settings), Err(SettingsError::MissingApiKey)));

        settings.llm.api_key = Some(ApiKey::new("sk-test"));
        assert!(require_api_key(&settings).is_ok());
    }

    #[test]
    fn parse_bool_variants() {
        assert_eq!(parse_bool("YES"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn parse_ranges() {
        assert_eq!(parse_u16_range("8080", 1, 65535), Some(8080));
        assert_eq!(parse_u16_range("0", 1, 65535), None);
        assert_eq!(parse_u64_range("90", 1, 3600), Some(90));
        assert_eq!(parse_u64_range("-1", 1, 3600), None);
    }
}

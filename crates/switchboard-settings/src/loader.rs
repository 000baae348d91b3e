//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`SwitchboardSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over defaults
//! 3. Apply `SWITCHBOARD_*` environment overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::{BrokerKind, SwitchboardSettings};

/// Resolve the default settings file (`~/.switchboard/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".switchboard").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<SwitchboardSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; a file with invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<SwitchboardSettings> {
    let mut settings = read_settings_file(path)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

fn read_settings_file(path: &Path) -> Result<SwitchboardSettings> {
    let defaults = serde_json::to_value(SwitchboardSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
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

/// Apply `SWITCHBOARD_*` overrides from the process environment.
pub fn apply_env_overrides(settings: &mut SwitchboardSettings) {
    apply_overrides(settings, |key| std::env::var(key).ok());
}

/// Apply overrides from an arbitrary key lookup.
///
/// Values that fail to parse or fall outside their range are logged and
/// ignored, leaving the file/default value in place.
pub fn apply_overrides(settings: &mut SwitchboardSettings, lookup: impl Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup };

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env.string("SWITCHBOARD_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u16("SWITCHBOARD_PORT", 0, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = env.string("SWITCHBOARD_NODE_ID") {
        settings.server.node_id = Some(v);
    }
    if let Some(v) = env.usize("SWITCHBOARD_SEND_QUEUE", 1, 1_000_000) {
        settings.server.send_queue = v;
    }
    if let Some(v) = env.u64("SWITCHBOARD_PONG_TIMEOUT_SECS", 1, 86_400) {
        settings.server.pong_timeout_secs = v;
    }
    if let Some(v) = env.u64("SWITCHBOARD_SSE_MAX_LIFETIME_SECS", 0, 604_800) {
        settings.server.sse_max_lifetime_secs = v;
    }

    // ── Delivery ────────────────────────────────────────────────────
    if let Some(v) = env.u64("SWITCHBOARD_SEND_TIMEOUT_MS", 1, 600_000) {
        settings.delivery.send_timeout_ms = v;
    }
    if let Some(v) = env.usize("SWITCHBOARD_DELIVERY_CONCURRENCY", 1, 4_096) {
        settings.delivery.concurrency = v;
    }

    // ── Heartbeat ───────────────────────────────────────────────────
    if let Some(v) = env.bool("SWITCHBOARD_HEARTBEAT_ENABLED") {
        settings.heartbeat.enabled = v;
    }
    if let Some(v) = env.u64("SWITCHBOARD_HEARTBEAT_INTERVAL_SECS", 1, 3_600) {
        settings.heartbeat.interval_secs = v;
    }

    // ── Broker ──────────────────────────────────────────────────────
    if let Some(raw) = env.string("SWITCHBOARD_BROKER") {
        match BrokerKind::parse(&raw) {
            Some(kind) => settings.broker.kind = kind,
            None => tracing::warn!(key = "SWITCHBOARD_BROKER", value = %raw, "unknown broker kind, ignoring"),
        }
    }
    if let Some(v) = env.string("SWITCHBOARD_TOPIC") {
        settings.broker.topic = v;
    }
    if let Some(v) = env.string("SWITCHBOARD_RELAY_URL") {
        settings.broker.relay_url = Some(v);
    }
    if let Some(v) = env.bool("SWITCHBOARD_HOST_RELAY") {
        settings.broker.host_relay = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("SWITCHBOARD_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("SWITCHBOARD_LOG_JSON") {
        settings.logging.json = v;
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

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

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = (self.lookup)(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        let val = (self.lookup)(name)?;
        let result = parse_u16_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u16 env var, ignoring");
        }
        result
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = (self.lookup)(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
        }
        result
    }

    fn usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        let val = (self.lookup)(name)?;
        let result = parse_usize_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid usize env var, ignoring");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"server": {"port": 9300, "host": "0.0.0.0"}});
        let source = serde_json::json!({"server": {"port": 9400}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["server"]["port"], 9400);
        assert_eq!(merged["server"]["host"], "0.0.0.0");
    }

    #[test]
    fn merge_null_preserves_target() {
        let target = serde_json::json!({"a": 1, "b": 2});
        let source = serde_json::json!({"a": null});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"], 2);
    }

    #[test]
    fn merge_array_replace() {
        let target = serde_json::json!({"items": [1, 2, 3]});
        let source = serde_json::json!({"items": [4]});
        assert_eq!(deep_merge(target, source)["items"], serde_json::json!([4]));
    }

    #[test]
    fn merge_primitive_replaces_object() {
        let target = serde_json::json!({"a": {"nested": true}});
        let source = serde_json::json!({"a": 42});
        assert_eq!(deep_merge(target, source)["a"], 42);
    }

    // ── file loading ────────────────────────────────────────────────

    #[test]
    fn missing_file_returns_defaults() {
        let settings = read_settings_file(Path::new("/nonexistent/settings.json")).unwrap();
        assert_eq!(settings.server.port, 9300);
    }

    #[test]
    fn partial_file_overrides_only_named_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"broker": {"kind": "relay", "relayUrl": "ws://hub:9300/relay"}, "delivery": {"concurrency": 1}}"#,
        )
        .unwrap();

        let settings = read_settings_file(&path).unwrap();
        assert_eq!(settings.broker.kind, BrokerKind::Relay);
        assert_eq!(settings.broker.relay_url.as_deref(), Some("ws://hub:9300/relay"));
        assert_eq!(settings.broker.topic, "switchboard.fanout");
        assert_eq!(settings.delivery.concurrency, 1);
        assert_eq!(settings.delivery.send_timeout_ms, 5_000);
    }

    #[test]
    fn invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not valid json").unwrap();
        assert!(matches!(
            read_settings_file(&path),
            Err(SettingsError::Json(_))
        ));
    }

    #[test]
    fn unreadable_file_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        match read_settings_file(dir.path()) {
            Err(SettingsError::Read { path, .. }) => assert_eq!(path, dir.path()),
            other => panic!("expected read error, got {other:?}"),
        }
    }

    #[test]
    fn unknown_broker_kind_in_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"broker": {"kind": "carrier-pigeon"}}"#).unwrap();
        assert!(read_settings_file(&path).is_err());
    }

    // ── overrides ───────────────────────────────────────────────────

    #[test]
    fn overrides_apply_over_defaults() {
        let mut settings = SwitchboardSettings::default();
        apply_overrides(
            &mut settings,
            lookup_from(&[
                ("SWITCHBOARD_PORT", "0"),
                ("SWITCHBOARD_NODE_ID", "node_a"),
                ("SWITCHBOARD_BROKER", "relay"),
                ("SWITCHBOARD_HOST_RELAY", "yes"),
                ("SWITCHBOARD_HEARTBEAT_INTERVAL_SECS", "5"),
                ("SWITCHBOARD_DELIVERY_CONCURRENCY", "1"),
                ("SWITCHBOARD_LOG_JSON", "on"),
            ]),
        );
        assert_eq!(settings.server.port, 0);
        assert_eq!(settings.server.node_id.as_deref(), Some("node_a"));
        assert_eq!(settings.broker.kind, BrokerKind::Relay);
        assert!(settings.broker.host_relay);
        assert_eq!(settings.heartbeat.interval_secs, 5);
        assert_eq!(settings.delivery.concurrency, 1);
        assert!(settings.logging.json);
    }

    #[test]
    fn invalid_overrides_are_ignored() {
        let mut settings = SwitchboardSettings::default();
        apply_overrides(
            &mut settings,
            lookup_from(&[
                ("SWITCHBOARD_PORT", "99999"),
                ("SWITCHBOARD_BROKER", "redis"),
                ("SWITCHBOARD_DELIVERY_CONCURRENCY", "0"),
                ("SWITCHBOARD_HEARTBEAT_ENABLED", "maybe"),
                ("SWITCHBOARD_TOPIC", ""),
            ]),
        );
        assert_eq!(settings.server.port, 9300);
        assert_eq!(settings.broker.kind, BrokerKind::Local);
        assert_eq!(settings.delivery.concurrency, 16);
        assert!(settings.heartbeat.enabled);
        assert_eq!(settings.broker.topic, "switchboard.fanout");
    }

    #[test]
    fn parse_bool_variants() {
        for val in ["true", "1", "yes", "on", "TRUE"] {
            assert_eq!(parse_bool(val), Some(true), "failed for {val}");
        }
        for val in ["false", "0", "no", "off", "Off"] {
            assert_eq!(parse_bool(val), Some(false), "failed for {val}");
        }
        assert_eq!(parse_bool("2"), None);
    }

    #[test]
    fn parse_ranges() {
        assert_eq!(parse_u16_range("9300", 1, 65535), Some(9300));
        assert_eq!(parse_u16_range("0", 1, 65535), None);
        assert_eq!(parse_u64_range("abc", 0, 10), None);
        assert_eq!(parse_usize_range("10", 1, 10), Some(10));
        assert_eq!(parse_usize_range("11", 1, 10), None);
    }
}

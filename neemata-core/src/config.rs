//! Runtime configuration loading.
//!
//! Load order mirrors `r2e_core::config::R2eConfig::load`: a base YAML
//! file, an optional profile-specific YAML overlay, a `.env` file loaded
//! via `dotenvy`, and finally an environment-variable overlay (`NEEMATA__`
//! prefixed, double-underscore nested) applied last so it always wins.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

#[derive(Debug)]
pub enum ConfigError {
    Io { path: PathBuf, message: String },
    Parse { path: PathBuf, message: String },
    MissingKey(String),
    InvalidValue { key: String, message: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io { path, message } => write!(f, "{}: {message}", path.display()),
            ConfigError::Parse { path, message } => write!(f, "{}: {message}", path.display()),
            ConfigError::MissingKey(key) => write!(f, "missing config key: {key}"),
            ConfigError::InvalidValue { key, message } => write!(f, "invalid value for {key}: {message}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Runtime-tunable knobs. Everything has a default so a freshly-built
/// `RuntimeConfig::default()` is already a valid, runnable configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    pub api_workers: usize,
    pub task_workers: usize,
    pub call_timeout_ms: u64,
    pub task_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub stream_window_bytes: u32,
    pub stream_chunk_bytes: u32,
    pub subscription_queue_len: usize,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        RuntimeSettings {
            api_workers: 1,
            task_workers: 1,
            call_timeout_ms: 30_000,
            task_timeout_ms: 60_000,
            shutdown_timeout_ms: 10_000,
            stream_window_bytes: 64 * 1024,
            stream_chunk_bytes: 16 * 1024,
            subscription_queue_len: 256,
        }
    }
}

impl RuntimeSettings {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// A loaded configuration document. Wraps the deserialized settings plus
/// the raw merged map, mirroring `R2eConfig<T>`'s `Deref<Target = T>` so
/// callers mostly just use it as `&RuntimeSettings`.
pub struct RuntimeConfig<T = RuntimeSettings> {
    inner: T,
    raw: HashMap<String, serde_json::Value>,
}

impl<T> std::ops::Deref for RuntimeConfig<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T: DeserializeOwned + Serialize + Default> RuntimeConfig<T> {
    /// Load `base` (e.g. `neemata.yaml`), optionally overlay
    /// `neemata-{profile}.yaml` next to it if `profile` is set and the
    /// file exists, then apply a dotenv file (if present) followed by
    /// `NEEMATA__`-prefixed environment variables, each overlay taking
    /// precedence over the last.
    pub fn load(base: impl AsRef<Path>, profile: Option<&str>) -> Result<Self, ConfigError> {
        let base = base.as_ref();
        let mut merged = serde_json::to_value(T::default()).unwrap_or(serde_json::json!({}));

        if base.exists() {
            merge_yaml_file(&mut merged, base)?;
        }

        if let Some(profile) = profile {
            let profile_path = profile_path_for(base, profile);
            if profile_path.exists() {
                merge_yaml_file(&mut merged, &profile_path)?;
            }
        }

        let _ = dotenvy::dotenv();

        apply_env_overlay(&mut merged, "NEEMATA__");

        let inner: T = serde_json::from_value(merged.clone())
            .map_err(|e| ConfigError::Parse { path: base.to_path_buf(), message: e.to_string() })?;

        let raw = match merged {
            serde_json::Value::Object(map) => map.into_iter().collect(),
            _ => HashMap::new(),
        };

        Ok(RuntimeConfig { inner, raw })
    }

    /// Build a config directly from in-memory settings, skipping file IO
    /// entirely — used by tests and by embedders that assemble config
    /// programmatically.
    pub fn from_settings(settings: T) -> Self {
        let raw = match serde_json::to_value(&settings) {
            Ok(serde_json::Value::Object(map)) => map.into_iter().collect(),
            _ => HashMap::new(),
        };
        RuntimeConfig { inner: settings, raw }
    }

    pub fn get<V: DeserializeOwned>(&self, key: &str) -> Result<V, ConfigError> {
        self.raw
            .get(key)
            .cloned()
            .ok_or_else(|| ConfigError::MissingKey(key.to_string()))
            .and_then(|v| {
                serde_json::from_value(v)
                    .map_err(|e| ConfigError::InvalidValue { key: key.to_string(), message: e.to_string() })
            })
    }

    pub fn get_or<V: DeserializeOwned>(&self, key: &str, default: V) -> V {
        self.get(key).unwrap_or(default)
    }

    pub fn settings(&self) -> &T {
        &self.inner
    }
}

fn profile_path_for(base: &Path, profile: &str) -> PathBuf {
    let stem = base.file_stem().and_then(|s| s.to_str()).unwrap_or("neemata");
    let ext = base.extension().and_then(|s| s.to_str()).unwrap_or("yaml");
    base.with_file_name(format!("{stem}-{profile}.{ext}"))
}

fn merge_yaml_file(target: &mut serde_json::Value, path: &Path) -> Result<(), ConfigError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io { path: path.to_path_buf(), message: e.to_string() })?;
    let parsed: serde_json::Value = serde_yaml::from_str(&text)
        .map_err(|e| ConfigError::Parse { path: path.to_path_buf(), message: e.to_string() })?;
    merge_json(target, parsed);
    Ok(())
}

fn merge_json(base: &mut serde_json::Value, overlay: serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(overlay_map)) => {
            for (k, v) in overlay_map {
                merge_json(base_map.entry(k).or_insert(serde_json::Value::Null), v);
            }
        }
        (base_slot, overlay_value) => *base_slot = overlay_value,
    }
}

/// Overlay environment variables shaped `NEEMATA__API_WORKERS=4` onto
/// `merged.api_workers`, `NEEMATA__STREAM__WINDOW_BYTES` onto a nested
/// `stream.window_bytes`, etc. Double underscore is the nesting
/// separator; keys are lower-cased to match serde's default field naming.
fn apply_env_overlay(merged: &mut serde_json::Value, prefix: &str) {
    for (key, value) in std::env::vars() {
        let Some(rest) = key.strip_prefix(prefix) else { continue };
        let path: Vec<String> = rest.split("__").map(|s| s.to_lowercase()).collect();
        if path.is_empty() || path.iter().any(|p| p.is_empty()) {
            continue;
        }
        set_path(merged, &path, coerce_env_value(&value));
    }
}

fn set_path(target: &mut serde_json::Value, path: &[String], value: serde_json::Value) {
    if !target.is_object() {
        *target = serde_json::json!({});
    }
    let obj = target.as_object_mut().unwrap();
    if path.len() == 1 {
        obj.insert(path[0].clone(), value);
        return;
    }
    let entry = obj.entry(path[0].clone()).or_insert(serde_json::json!({}));
    set_path(entry, &path[1..], value);
}

fn coerce_env_value(raw: &str) -> serde_json::Value {
    if let Ok(b) = raw.parse::<bool>() {
        return serde_json::Value::Bool(b);
    }
    if let Ok(i) = raw.parse::<i64>() {
        return serde_json::Value::Number(i.into());
    }
    if let Ok(f) = raw.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return serde_json::Value::Number(n);
        }
    }
    serde_json::Value::String(raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn defaults_are_sane() {
        let settings = RuntimeSettings::default();
        assert!(settings.api_workers >= 1);
        assert!(settings.call_timeout_ms > 0);
    }

    #[test]
    fn merge_json_overlays_nested_objects() {
        let mut base = serde_json::json!({ "a": 1, "nested": { "x": 1, "y": 2 } });
        merge_json(&mut base, serde_json::json!({ "nested": { "y": 9 } }));
        assert_eq!(base, serde_json::json!({ "a": 1, "nested": { "x": 1, "y": 9 } }));
    }

    #[test]
    #[serial]
    fn env_overlay_applies_with_precedence() {
        std::env::set_var("NEEMATA__API_WORKERS", "7");
        let mut merged = serde_json::to_value(RuntimeSettings::default()).unwrap();
        apply_env_overlay(&mut merged, "NEEMATA__");
        assert_eq!(merged["api_workers"], serde_json::json!(7));
        std::env::remove_var("NEEMATA__API_WORKERS");
    }

    #[test]
    fn load_from_settings_exposes_get() {
        let cfg = RuntimeConfig::from_settings(RuntimeSettings::default());
        let workers: usize = cfg.get("api_workers").unwrap();
        assert_eq!(workers, 1);
    }

    #[test]
    fn missing_key_is_reported() {
        let cfg = RuntimeConfig::from_settings(RuntimeSettings::default());
        let err = cfg.get::<usize>("does_not_exist").unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey(_)));
    }
}

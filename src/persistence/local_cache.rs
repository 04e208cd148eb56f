//! Flat key/value cache on disk
//!
//! A single JSON object of string keys to JSON-encoded string values, the
//! same shape the browser dashboard kept in local storage. Reads never fail
//! on bad data: unparsable values are logged and treated as missing.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Default)]
pub struct LocalCache {
    /// None = memory only (used when the data dir is unusable, and in tests)
    path: Option<PathBuf>,
    entries: BTreeMap<String, String>,
    dirty: bool,
}

impl LocalCache {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load the cache file; a missing file is an empty cache, a corrupt one
    /// is moved aside and replaced with an empty cache
    pub fn load(path: &Path) -> Result<Self> {
        let mut cache = Self {
            path: Some(path.to_path_buf()),
            ..Self::default()
        };

        if !path.exists() {
            tracing::debug!("No local cache at {:?}, starting fresh", path);
            return Ok(cache);
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read local cache {:?}", path))?;
        match serde_json::from_str::<BTreeMap<String, String>>(&content) {
            Ok(entries) => {
                tracing::info!("Local cache loaded from {:?} ({} keys)", path, entries.len());
                cache.entries = entries;
            }
            Err(e) => {
                let quarantine = path.with_extension("json.corrupt");
                tracing::warn!(
                    "Local cache {:?} is unreadable ({}), moving it to {:?}",
                    path,
                    e,
                    quarantine
                );
                fs::rename(path, &quarantine)
                    .with_context(|| format!("Failed to move corrupt cache {:?}", path))?;
            }
        }

        Ok(cache)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Decode a JSON-encoded value; malformed values read as missing
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.entries.get(key)?;
        match serde_json::from_str(raw) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!("Ignoring malformed cache value for {}: {}", key, e);
                None
            }
        }
    }

    pub fn set(&mut self, key: &str, value: String) {
        if self.entries.get(key) != Some(&value) {
            self.entries.insert(key.to_string(), value);
            self.dirty = true;
        }
    }

    pub fn set_json<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> Result<()> {
        let encoded = serde_json::to_string(value)
            .with_context(|| format!("Failed to encode cache value for {}", key))?;
        self.set(key, encoded);
        Ok(())
    }

    pub fn remove(&mut self, key: &str) {
        if self.entries.remove(key).is_some() {
            self.dirty = true;
        }
    }

    pub fn keys_with_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .keys()
            .filter(move |k| k.starts_with(prefix))
            .map(String::as_str)
    }

    /// Write through to disk if anything changed (temp file + rename)
    pub fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let Some(path) = &self.path else {
            self.dirty = false;
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create cache directory {:?}", parent))?;
        }

        let json = serde_json::to_string_pretty(&self.entries).context("Failed to encode cache")?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).with_context(|| format!("Failed to write {:?}", tmp))?;
        fs::rename(&tmp, path).with_context(|| format!("Failed to replace {:?}", path))?;

        self.dirty = false;
        tracing::debug!("Local cache saved to {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_is_empty_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::load(&dir.path().join("cache.json")).unwrap();
        assert!(cache.get("anything").is_none());
    }

    #[test]
    fn test_flush_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cache.json");

        let mut cache = LocalCache::load(&path).unwrap();
        cache.set_json("ha_dashboard_entities", &vec!["sensor.a"]).unwrap();
        cache.set("ha_dashboard_scale", "1.5".to_string());
        cache.flush().unwrap();

        let reloaded = LocalCache::load(&path).unwrap();
        assert_eq!(
            reloaded.get_json::<Vec<String>>("ha_dashboard_entities"),
            Some(vec!["sensor.a".to_string()])
        );
        assert_eq!(reloaded.get_json::<f64>("ha_dashboard_scale"), Some(1.5));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_corrupt_file_is_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        fs::write(&path, "{not json").unwrap();

        let cache = LocalCache::load(&path).unwrap();
        assert!(cache.get("ha_dashboard_entities").is_none());
        assert!(path.with_extension("json.corrupt").exists());
    }

    #[test]
    fn test_malformed_value_reads_as_missing() {
        let mut cache = LocalCache::in_memory();
        cache.set("ha_dashboard_positions", "{broken".to_string());
        assert!(cache
            .get_json::<BTreeMap<String, String>>("ha_dashboard_positions")
            .is_none());
        // Memory-only caches flush as a no-op
        cache.flush().unwrap();
    }

    #[test]
    fn test_prefix_scan() {
        let mut cache = LocalCache::in_memory();
        cache.set("ha_dashboard_widget_label_visible_a.b", "false".to_string());
        cache.set("ha_dashboard_entities", "[]".to_string());
        let keys: Vec<&str> = cache
            .keys_with_prefix("ha_dashboard_widget_label_visible_")
            .collect();
        assert_eq!(keys, vec!["ha_dashboard_widget_label_visible_a.b"]);
    }
}

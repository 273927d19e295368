use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Content-addressed on-disk cache for expensive upstream responses.
///
/// Keys are the SHA-256 of a stable string built from the request parameters.
/// Entries expire by file mtime. Reads are safe from any number of workers;
/// writes go through a temp file + rename so concurrent writers never leave a
/// torn entry behind.
pub struct DiskCache {
    root: PathBuf,
    ttl: Duration,
}

impl DiskCache {
    pub fn new(root: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            root: root.into(),
            ttl,
        }
    }

    pub fn key(prefix: &str, params: &impl Serialize) -> String {
        let canonical = serde_json::to_string(params).unwrap_or_default();
        let digest = Sha256::digest(format!("{prefix}:{canonical}").as_bytes());
        let mut out = String::with_capacity(16);
        for byte in digest.iter().take(8) {
            use std::fmt::Write;
            let _ = write!(&mut out, "{byte:02x}");
        }
        out
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.json"))
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let path = self.path_for(key);
        if self.expired(&path) {
            let _ = std::fs::remove_file(&path);
            return None;
        }
        let raw = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(_) => {
                // Torn or stale-format entry: drop it and refetch.
                let _ = std::fs::remove_file(&path);
                None
            }
        }
    }

    pub fn put<T: Serialize>(&self, key: &str, value: &T) {
        if let Err(err) = self.try_put(key, value) {
            tracing::warn!(key, error = %err, "cache write failed");
        }
    }

    fn try_put<T: Serialize>(&self, key: &str, value: &T) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        let raw = serde_json::to_vec(value).map_err(std::io::Error::other)?;
        let tmp = self.root.join(format!(".{key}.tmp"));
        std::fs::write(&tmp, raw)?;
        std::fs::rename(&tmp, self.path_for(key))
    }

    fn expired(&self, path: &Path) -> bool {
        let Ok(meta) = std::fs::metadata(path) else {
            return true;
        };
        let Ok(modified) = meta.modified() else {
            return true;
        };
        match SystemTime::now().duration_since(modified) {
            Ok(age) => age > self.ttl,
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_json_values() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path(), Duration::from_secs(60));
        let key = DiskCache::key("identify", &serde_json::json!({"lat": 35.2, "lng": -81.1}));

        assert!(cache.get::<serde_json::Value>(&key).is_none());
        cache.put(&key, &serde_json::json!({"ndvi": 0.42}));
        let hit: serde_json::Value = cache.get(&key).unwrap();
        assert_eq!(hit["ndvi"], 0.42);
    }

    #[test]
    fn expired_entries_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path(), Duration::ZERO);
        let key = DiskCache::key("identify", &serde_json::json!({"lat": 1.0}));
        cache.put(&key, &serde_json::json!({"x": 1}));
        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.get::<serde_json::Value>(&key).is_none());
    }

    #[test]
    fn keys_are_stable_and_distinct() {
        let a = DiskCache::key("identify", &serde_json::json!({"lat": 35.2}));
        let b = DiskCache::key("identify", &serde_json::json!({"lat": 35.2}));
        let c = DiskCache::key("identify", &serde_json::json!({"lat": 35.3}));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}

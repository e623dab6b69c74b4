//! Payload-type cache persisted as a small JSON document.
//!
//! ```json
//! {
//!   "239.1.1.1:5000": { "payload_type": 96, "timestamp": 1718440200.5 }
//! }
//! ```
//!
//! The cache is advisory: an unreadable or corrupt file reads as empty and
//! a failed write only costs a future re-detection, so no method here
//! returns an error.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::endpoint::StreamEndpoint;

/// One cached detection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PayloadTypeEntry {
    pub payload_type: u8,
    /// Seconds since the Unix epoch when the type was detected.
    #[serde(rename = "timestamp")]
    pub detected_at: f64,
}

impl PayloadTypeEntry {
    fn now(payload_type: u8) -> Self {
        Self {
            payload_type,
            detected_at: unix_now(),
        }
    }

    /// Seconds elapsed since detection.
    pub fn age_secs(&self) -> f64 {
        (unix_now() - self.detected_at).max(0.0)
    }
}

type CacheStore = BTreeMap<String, PayloadTypeEntry>;

/// File-backed `address:port` → payload type map.
///
/// Each operation re-reads the file, so edits by other processes are seen.
/// The mutex only serialises read-modify-write cycles inside this process;
/// across processes the last writer for a key wins.
#[derive(Debug)]
pub struct PayloadCache {
    path: PathBuf,
    lock: Mutex<()>,
}

impl PayloadCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Cached payload type for `endpoint`, unless `force_refresh` is set.
    pub fn lookup(&self, endpoint: &StreamEndpoint, force_refresh: bool) -> Option<u8> {
        if force_refresh {
            return None;
        }
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let entry = *load_store(&self.path).get(&endpoint.cache_key())?;
        if entry.payload_type > 0x7F {
            warn!(
                "Ignoring cached payload type {} for {endpoint}: not a 7-bit value",
                entry.payload_type
            );
            return None;
        }
        info!(
            "Using cached payload type {} for {endpoint} (cached {:.1}s ago)",
            entry.payload_type,
            entry.age_secs()
        );
        Some(entry.payload_type)
    }

    /// Record a fresh detection and persist it immediately.
    pub fn store(&self, endpoint: &StreamEndpoint, payload_type: u8) {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut store = load_store(&self.path);
        store.insert(endpoint.cache_key(), PayloadTypeEntry::now(payload_type));
        if save_store(&self.path, &store) {
            info!("Cached payload type {payload_type} for {endpoint}");
        }
    }

    /// Drop the entry for `endpoint`, if any.
    pub fn invalidate(&self, endpoint: &StreamEndpoint) {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut store = load_store(&self.path);
        if store.remove(&endpoint.cache_key()).is_some() && save_store(&self.path, &store) {
            info!("Invalidated cached payload type for {endpoint}");
        }
    }

    /// Raw entry for `endpoint`, bypassing logging and validation.
    pub fn entry(&self, endpoint: &StreamEndpoint) -> Option<PayloadTypeEntry> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        load_store(&self.path).get(&endpoint.cache_key()).copied()
    }
}

fn load_store(path: &Path) -> CacheStore {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return CacheStore::new(),
        Err(e) => {
            warn!("Cannot read payload cache {}: {e}", path.display());
            return CacheStore::new();
        }
    };
    let raw: BTreeMap<String, serde_json::Value> = match serde_json::from_str(&text) {
        Ok(raw) => raw,
        Err(e) => {
            warn!("Corrupt payload cache {}: {e}", path.display());
            return CacheStore::new();
        }
    };
    // A bad entry costs only that endpoint, not the whole document.
    raw.into_iter()
        .filter_map(|(key, value)| match serde_json::from_value::<PayloadTypeEntry>(value) {
            Ok(entry) => Some((key, entry)),
            Err(e) => {
                warn!("Skipping cache entry {key} in {}: {e}", path.display());
                None
            }
        })
        .collect()
}

/// Write the whole document. Returns `false` (after logging) on failure.
fn save_store(path: &Path, store: &CacheStore) -> bool {
    let json = match serde_json::to_string_pretty(store) {
        Ok(j) => j,
        Err(e) => {
            warn!("Cannot serialise payload cache: {e}");
            return false;
        }
    };
    // Write a sibling file and rename so readers never see half a document.
    let tmp = path.with_extension("json.tmp");
    let result = std::fs::write(&tmp, json).and_then(|()| std::fs::rename(&tmp, path));
    match result {
        Ok(()) => {
            debug!("Saved payload cache ({} entries)", store.len());
            true
        }
        Err(e) => {
            warn!("Cannot save payload cache {}: {e}", path.display());
            false
        }
    }
}

fn unix_now() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn endpoint(port: u16) -> StreamEndpoint {
        StreamEndpoint::new(Ipv4Addr::new(239, 1, 1, 1), port).unwrap()
    }

    fn temp_cache(name: &str) -> PayloadCache {
        let dir = std::env::temp_dir().join("mcast_mjpeg_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("{name}-{}.json", std::process::id()));
        let _ = std::fs::remove_file(&path);
        PayloadCache::new(path)
    }

    #[test]
    fn test_store_then_lookup() {
        let cache = temp_cache("store_lookup");
        let ep = endpoint(5000);
        assert_eq!(cache.lookup(&ep, false), None);

        cache.store(&ep, 96);
        assert_eq!(cache.lookup(&ep, false), Some(96));
        assert_eq!(cache.lookup(&ep, true), None);
        assert_eq!(cache.lookup(&endpoint(5002), false), None);
    }

    #[test]
    fn test_store_overwrites_and_persists() {
        let cache = temp_cache("overwrite");
        let ep = endpoint(5000);
        cache.store(&ep, 96);
        cache.store(&ep, 33);

        let reopened = PayloadCache::new(cache.path());
        assert_eq!(reopened.lookup(&ep, false), Some(33));

        let text = std::fs::read_to_string(cache.path()).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(doc["239.1.1.1:5000"]["payload_type"], 33);
        assert!(doc["239.1.1.1:5000"]["timestamp"].as_f64().unwrap() > 0.0);
    }

    #[test]
    fn test_invalidate() {
        let cache = temp_cache("invalidate");
        let ep = endpoint(5000);
        cache.store(&ep, 96);
        cache.store(&endpoint(6000), 103);

        cache.invalidate(&ep);
        assert_eq!(cache.lookup(&ep, false), None);
        assert_eq!(cache.lookup(&endpoint(6000), false), Some(103));

        // Invalidating a missing key is a no-op.
        cache.invalidate(&ep);
    }

    #[test]
    fn test_corrupt_file_reads_as_empty() {
        let cache = temp_cache("corrupt");
        std::fs::write(cache.path(), "{ not json").unwrap();
        let ep = endpoint(5000);
        assert_eq!(cache.lookup(&ep, false), None);

        // The next store replaces the corrupt document with a valid one.
        cache.store(&ep, 96);
        assert_eq!(cache.lookup(&ep, false), Some(96));
    }

    #[test]
    fn test_reads_legacy_document() {
        let cache = temp_cache("legacy");
        std::fs::write(
            cache.path(),
            r#"{"239.1.1.1:5000": {"payload_type": 103, "timestamp": 1718440200.25}}"#,
        )
        .unwrap();
        let entry = cache.entry(&endpoint(5000)).unwrap();
        assert_eq!(entry.payload_type, 103);
        assert!(entry.age_secs() > 0.0);
    }

    #[test]
    fn test_bad_entry_does_not_poison_document() {
        let cache = temp_cache("bad_entry");
        std::fs::write(
            cache.path(),
            r#"{
                "239.1.1.1:5000": {"payload_type": 96, "timestamp": 1718440200.0},
                "239.1.1.1:5002": {"payload_type": 300, "timestamp": 1718440200.0},
                "239.1.1.1:5004": {"payload_type": -1, "timestamp": 1718440200.0}
            }"#,
        )
        .unwrap();
        assert_eq!(cache.lookup(&endpoint(5000), false), Some(96));
        assert_eq!(cache.lookup(&endpoint(5002), false), None);

        cache.store(&endpoint(6000), 33);
        assert_eq!(cache.lookup(&endpoint(5000), false), Some(96));
        assert_eq!(cache.lookup(&endpoint(6000), false), Some(33));
    }

    #[test]
    fn test_unwritable_path_is_swallowed() {
        let cache = PayloadCache::new("/nonexistent/mcast-mjpeg/cache.json");
        let ep = endpoint(5000);
        cache.store(&ep, 96);
        assert_eq!(cache.lookup(&ep, false), None);
    }
}

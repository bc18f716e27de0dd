//! Two-tier session cache
//!
//! Fast tier: a bounded in-process map of the most recently used sessions.
//! Persistent tier: one directory per session under the cache root with a
//! `manifest.json` (the authoritative existence check) plus one JSON data
//! file per feed. Both tiers evict least-recently-used entries when their
//! independent capacity bounds are exceeded.
//!
//! Writes are atomic: the whole session directory is assembled under a
//! temporary name and renamed into place, so a reader never observes a
//! partially written entry. An unreadable persisted entry is purged and
//! reported as a miss.

use crate::config::Config;
use crate::error::PipelineError;
use crate::types::{
    CacheStats, CanonicalSession, Driver, SessionId, SessionManifest, SessionMeta, SessionSummary,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const MANIFEST_FILE: &str = "manifest.json";

/// Feed data files within one session directory.
const DATA_FILES: [&str; 6] = [
    "positions.json",
    "car_data.json",
    "laps.json",
    "weather.json",
    "race_control.json",
    "track_status.json",
];

/// On-disk manifest: summary metadata plus what is needed to rebuild the
/// session without re-reading the provider (roster and time range).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredManifest {
    summary: SessionManifest,
    meta: SessionMeta,
    drivers: Vec<Driver>,
}

/// Bounded in-process tier with logical-clock LRU.
struct MemoryTier {
    capacity: usize,
    clock: u64,
    entries: HashMap<SessionId, (CanonicalSession, u64)>,
}

impl MemoryTier {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            clock: 0,
            entries: HashMap::new(),
        }
    }

    fn get(&mut self, id: &str) -> Option<CanonicalSession> {
        self.clock += 1;
        let clock = self.clock;
        let (session, access) = self.entries.get_mut(id)?;
        *access = clock;
        Some(session.clone())
    }

    fn put(&mut self, id: &str, session: CanonicalSession) {
        self.clock += 1;
        if !self.entries.contains_key(id) && self.entries.len() >= self.capacity {
            self.evict_lru();
        }
        self.entries.insert(id.to_string(), (session, self.clock));
    }

    fn evict_lru(&mut self) {
        let victim = self
            .entries
            .iter()
            .min_by_key(|(_, (_, access))| *access)
            .map(|(id, _)| id.clone());
        if let Some(id) = victim {
            log::debug!("Memory tier evicting LRU session {}", id);
            self.entries.remove(&id);
        }
    }
}

/// Persistent cache of canonical sessions with an LRU bound.
pub struct CacheStore {
    root: PathBuf,
    disk_capacity: usize,
    memory: Mutex<MemoryTier>,
    /// Serializes persistent-tier mutations (save, purge, touch).
    disk_lock: Mutex<()>,
    now_fn: Box<dyn Fn() -> i64 + Send + Sync>,
}

impl CacheStore {
    pub fn new(config: &Config) -> Result<Self, PipelineError> {
        Self::with_clock(
            config,
            Box::new(|| chrono::Utc::now().timestamp_millis()),
        )
    }

    /// Construct with an injected clock for deterministic recency tests.
    pub fn with_clock(
        config: &Config,
        now_fn: Box<dyn Fn() -> i64 + Send + Sync>,
    ) -> Result<Self, PipelineError> {
        let root = PathBuf::from(&config.cache_dir);
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            disk_capacity: config.disk_capacity,
            memory: Mutex::new(MemoryTier::new(config.memory_capacity)),
            disk_lock: Mutex::new(()),
            now_fn,
        })
    }

    /// The manifest is the authoritative existence check: a directory
    /// without one (interrupted write) does not count.
    pub fn exists(&self, id: &str) -> bool {
        if self.memory.lock().unwrap().entries.contains_key(id) {
            return true;
        }
        self.session_dir(id).join(MANIFEST_FILE).exists()
    }

    /// Load a session, memory tier first. A hit on either tier updates
    /// its recency; a persistent hit is promoted to the memory tier.
    /// Corrupt persisted entries are purged and reported as a miss.
    pub fn load(&self, id: &str) -> Option<CanonicalSession> {
        if let Some(session) = self.memory.lock().unwrap().get(id) {
            // Keep persistent-tier recency in sync with fast-tier hits so
            // hot sessions are not the ones evicted from disk
            self.touch_disk(id);
            return Some(session);
        }

        // The whole persistent read happens under the disk lock so a
        // concurrent save's replace-by-rename is never mistaken for
        // corruption; only genuine parse failures reach the purge
        let loaded = {
            let _guard = self.disk_lock.lock().unwrap();
            match self.load_from_disk(id) {
                Ok(found) => found,
                Err(e) => {
                    log::warn!("🗑️  Purging corrupt cache entry {}: {}", id, e);
                    let _ = fs::remove_dir_all(self.session_dir(id));
                    None
                }
            }
        };

        let session = loaded?;
        self.memory.lock().unwrap().put(id, session.clone());
        Some(session)
    }

    /// Persist a session, atomically replacing any existing entry.
    /// Idempotent: saving the same session twice produces an identical
    /// retrievable result.
    pub fn save(&self, id: &str, session: &CanonicalSession) -> Result<(), PipelineError> {
        {
            let _guard = self.disk_lock.lock().unwrap();
            self.write_session_dir(id, session)?;
            self.evict_disk_lru(id)?;
        }
        self.memory.lock().unwrap().put(id, session.clone());
        log::info!("💾 Cached session {}", id);
        Ok(())
    }

    /// Manifests of all persisted sessions.
    pub fn list_sessions(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self
            .read_manifests()
            .into_iter()
            .map(|(m, _)| SessionSummary {
                session_id: m.summary.session_id,
                name: m.summary.name,
                circuit: m.summary.circuit,
                year: m.summary.year,
                session_type: m.summary.session_type,
                cached: true,
            })
            .collect();
        summaries.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        summaries
    }

    pub fn stats(&self) -> CacheStats {
        let manifests = self.read_manifests();
        let total_bytes: u64 = manifests.iter().map(|(m, _)| m.summary.size_bytes).sum();
        CacheStats {
            total_sessions: manifests.len(),
            total_size_mb: total_bytes as f64 / (1024.0 * 1024.0),
            max_sessions: self.disk_capacity,
        }
    }

    // ---- persistent tier internals ----

    fn session_dir(&self, id: &str) -> PathBuf {
        self.root.join(encode_id(id))
    }

    fn write_session_dir(&self, id: &str, session: &CanonicalSession) -> Result<(), PipelineError> {
        let final_dir = self.session_dir(id);
        let tmp_dir = self.root.join(format!(".tmp-{}", encode_id(id)));

        if tmp_dir.exists() {
            fs::remove_dir_all(&tmp_dir)?;
        }
        fs::create_dir_all(&tmp_dir)?;

        write_json(&tmp_dir.join("positions.json"), &session.positions)?;
        write_json(&tmp_dir.join("car_data.json"), &session.car_data)?;
        write_json(&tmp_dir.join("laps.json"), &session.laps)?;
        write_json(&tmp_dir.join("weather.json"), &session.weather)?;
        write_json(&tmp_dir.join("race_control.json"), &session.race_control)?;
        write_json(&tmp_dir.join("track_status.json"), &session.track_status)?;

        let mut size_bytes = 0u64;
        for file in DATA_FILES {
            size_bytes += fs::metadata(tmp_dir.join(file))?.len();
        }

        let manifest = StoredManifest {
            summary: SessionManifest {
                session_id: id.to_string(),
                name: session.meta.name.clone(),
                circuit: session.meta.circuit.clone(),
                year: session.meta.year,
                session_type: session.meta.session_type.clone(),
                size_bytes,
                last_access_ms: (self.now_fn)(),
            },
            meta: session.meta.clone(),
            drivers: session.drivers.clone(),
        };
        // Manifest last: a directory without one is an unfinished write
        write_json(&tmp_dir.join(MANIFEST_FILE), &manifest)?;

        if final_dir.exists() {
            fs::remove_dir_all(&final_dir)?;
        }
        fs::rename(&tmp_dir, &final_dir)?;
        Ok(())
    }

    /// Caller must hold `disk_lock`.
    fn load_from_disk(&self, id: &str) -> Result<Option<CanonicalSession>, PipelineError> {
        let dir = self.session_dir(id);
        let manifest_path = dir.join(MANIFEST_FILE);
        if !manifest_path.exists() {
            return Ok(None);
        }

        let corrupt = |reason: String| PipelineError::CacheCorruption {
            session_id: id.to_string(),
            reason,
        };

        let mut manifest: StoredManifest = serde_json::from_str(
            &fs::read_to_string(&manifest_path).map_err(|e| corrupt(e.to_string()))?,
        )
        .map_err(|e| corrupt(format!("manifest: {}", e)))?;

        let session = CanonicalSession {
            meta: manifest.meta.clone(),
            drivers: manifest.drivers.clone(),
            positions: read_json(&dir.join("positions.json")).map_err(&corrupt)?,
            car_data: read_json(&dir.join("car_data.json")).map_err(&corrupt)?,
            laps: read_json(&dir.join("laps.json")).map_err(&corrupt)?,
            weather: read_json(&dir.join("weather.json")).map_err(&corrupt)?,
            race_control: read_json(&dir.join("race_control.json")).map_err(&corrupt)?,
            track_status: read_json(&dir.join("track_status.json")).map_err(&corrupt)?,
        };

        // Touch recency; best effort, a failed touch is not a miss
        manifest.summary.last_access_ms = (self.now_fn)();
        if let Err(e) = write_json(&manifest_path, &manifest) {
            log::debug!("Failed to update last-access for {}: {}", id, e);
        }

        Ok(Some(session))
    }

    /// Best-effort last-access bump on the persisted manifest.
    fn touch_disk(&self, id: &str) {
        let manifest_path = self.session_dir(id).join(MANIFEST_FILE);
        let _guard = self.disk_lock.lock().unwrap();
        let Ok(raw) = fs::read_to_string(&manifest_path) else {
            return;
        };
        let Ok(mut manifest) = serde_json::from_str::<StoredManifest>(&raw) else {
            return;
        };
        manifest.summary.last_access_ms = (self.now_fn)();
        if let Err(e) = write_json(&manifest_path, &manifest) {
            log::debug!("Failed to update last-access for {}: {}", id, e);
        }
    }

    /// Enforce the persistent-tier bound after an insert. The entry just
    /// written is never the victim, so an incoming session is never
    /// dropped or truncated to make room.
    fn evict_disk_lru(&self, just_saved: &str) -> Result<(), PipelineError> {
        loop {
            let manifests = self.read_manifests();
            if manifests.len() <= self.disk_capacity {
                return Ok(());
            }

            let victim = manifests
                .into_iter()
                .filter(|(m, _)| m.summary.session_id != just_saved)
                .min_by_key(|(m, _)| m.summary.last_access_ms);

            match victim {
                Some((m, dir)) => {
                    log::info!(
                        "🗑️  Persistent tier at capacity, evicting LRU session {}",
                        m.summary.session_id
                    );
                    fs::remove_dir_all(dir)?;
                }
                None => return Ok(()),
            }
        }
    }

    fn read_manifests(&self) -> Vec<(StoredManifest, PathBuf)> {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return Vec::new();
        };

        entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter(|e| !e.file_name().to_string_lossy().starts_with(".tmp-"))
            .filter_map(|e| {
                let path = e.path();
                let raw = fs::read_to_string(path.join(MANIFEST_FILE)).ok()?;
                let manifest: StoredManifest = serde_json::from_str(&raw).ok()?;
                Some((manifest, path))
            })
            .collect()
    }
}

/// Filesystem-safe encoding of a session id.
fn encode_id(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), PipelineError> {
    let json = serde_json::to_string(value)?;
    fs::write(path, json)?;
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, String> {
    let raw = fs::read_to_string(path).map_err(|e| format!("{}: {}", path.display(), e))?;
    serde_json::from_str(&raw).map_err(|e| format!("{}: {}", path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SampleValues, TelemetrySample};
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn make_session(id: &str, year: i32) -> CanonicalSession {
        CanonicalSession {
            meta: SessionMeta {
                session_id: id.to_string(),
                name: format!("Test GP {}", id),
                circuit: "Test Ring".to_string(),
                year,
                session_type: "Race".to_string(),
                start_ms: 1_000_000,
                end_ms: 2_000_000,
            },
            drivers: vec![Driver {
                number: 44,
                tla: "HAM".to_string(),
                name: "L HAMILTON".to_string(),
                team: "Mercedes".to_string(),
            }],
            positions: vec![TelemetrySample {
                driver_number: 44,
                timestamp_ms: 1_000_100,
                values: SampleValues::Position {
                    x: 1.0,
                    y: 2.0,
                    z: 0.0,
                },
            }],
            car_data: Vec::new(),
            laps: Vec::new(),
            weather: Vec::new(),
            race_control: Vec::new(),
            track_status: Vec::new(),
        }
    }

    /// Store with a monotonically increasing injected clock.
    fn make_store(dir: &TempDir, memory_cap: usize, disk_cap: usize) -> CacheStore {
        let mut config = Config::from_env();
        config.cache_dir = dir.path().to_string_lossy().to_string();
        config.memory_capacity = memory_cap;
        config.disk_capacity = disk_cap;

        let tick = Arc::new(AtomicI64::new(0));
        CacheStore::with_clock(
            &config,
            Box::new(move || tick.fetch_add(1, Ordering::SeqCst)),
        )
        .unwrap()
    }

    #[test]
    fn test_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = make_store(&dir, 5, 3);
        let session = make_session("2024/test/race", 2024);

        store.save("2024/test/race", &session).unwrap();
        let loaded = store.load("2024/test/race").unwrap();
        assert_eq!(loaded, session);
    }

    #[test]
    fn test_exists_uses_manifest() {
        let dir = TempDir::new().unwrap();
        let store = make_store(&dir, 5, 3);

        assert!(!store.exists("2024/test/race"));
        store
            .save("2024/test/race", &make_session("2024/test/race", 2024))
            .unwrap();
        assert!(store.exists("2024/test/race"));

        // A directory without a manifest does not count as cached
        let orphan = dir.path().join("orphan-session");
        fs::create_dir_all(&orphan).unwrap();
        assert!(!store.exists("orphan-session"));
    }

    #[test]
    fn test_save_is_idempotent_overwrite() {
        let dir = TempDir::new().unwrap();
        let store = make_store(&dir, 5, 3);
        let session = make_session("2024/test/race", 2024);

        store.save("2024/test/race", &session).unwrap();
        store.save("2024/test/race", &session).unwrap();

        assert_eq!(store.stats().total_sessions, 1);
        assert_eq!(store.load("2024/test/race").unwrap(), session);
    }

    #[test]
    fn test_disk_eviction_exactly_lru() {
        let dir = TempDir::new().unwrap();
        let store = make_store(&dir, 10, 3);

        for id in ["a", "b", "c"] {
            store.save(id, &make_session(id, 2024)).unwrap();
        }
        // Touch "a" so "b" becomes the LRU
        store.load("a").unwrap();

        store.save("d", &make_session("d", 2024)).unwrap();

        assert!(store.exists("a"));
        assert!(!store.exists("b"));
        assert!(store.exists("c"));
        assert!(store.exists("d"));
        assert_eq!(store.stats().total_sessions, 3);
    }

    #[test]
    fn test_memory_eviction_exactly_lru() {
        let dir = TempDir::new().unwrap();
        let store = make_store(&dir, 2, 10);

        store.save("a", &make_session("a", 2024)).unwrap();
        store.save("b", &make_session("b", 2024)).unwrap();
        // Access "a": "b" is now the memory LRU
        store.load("a");
        store.save("c", &make_session("c", 2024)).unwrap();

        let memory = store.memory.lock().unwrap();
        assert!(memory.entries.contains_key("a"));
        assert!(!memory.entries.contains_key("b"));
        assert!(memory.entries.contains_key("c"));
    }

    #[test]
    fn test_disk_hit_promotes_to_memory() {
        let dir = TempDir::new().unwrap();
        let store = make_store(&dir, 5, 3);
        let session = make_session("a", 2024);
        store.save("a", &session).unwrap();

        // Drop the memory tier entry, then load from disk
        store.memory.lock().unwrap().entries.clear();
        assert_eq!(store.load("a").unwrap(), session);
        assert!(store.memory.lock().unwrap().entries.contains_key("a"));
    }

    #[test]
    fn test_corrupt_entry_purged_and_miss() {
        let dir = TempDir::new().unwrap();
        let store = make_store(&dir, 5, 3);
        store.save("a", &make_session("a", 2024)).unwrap();
        store.memory.lock().unwrap().entries.clear();

        // Corrupt a data file
        let data = dir.path().join(encode_id("a")).join("positions.json");
        fs::write(&data, "{ not json").unwrap();

        assert!(store.load("a").is_none());
        // Entry was purged entirely
        assert!(!store.exists("a"));
    }

    #[test]
    fn test_concurrent_save_and_load_never_purge_valid_entry() {
        let dir = TempDir::new().unwrap();
        let store = make_store(&dir, 5, 3);
        let session = make_session("a", 2024);
        store.save("a", &session).unwrap();

        // A disk read racing a replace-by-rename save of the same id must
        // see either the old or the new complete entry, never corruption
        std::thread::scope(|scope| {
            scope.spawn(|| {
                for _ in 0..50 {
                    store.save("a", &session).unwrap();
                }
            });
            scope.spawn(|| {
                for _ in 0..50 {
                    // Force the persistent-tier path
                    store.memory.lock().unwrap().entries.clear();
                    assert!(store.load("a").is_some());
                }
            });
        });

        assert!(store.exists("a"));
        assert_eq!(store.load("a").unwrap(), session);
    }

    #[test]
    fn test_survives_restart() {
        let dir = TempDir::new().unwrap();
        let session = make_session("a", 2023);
        {
            let store = make_store(&dir, 5, 3);
            store.save("a", &session).unwrap();
        }

        // New store over the same directory: memory tier is empty but
        // the persistent tier still serves the session
        let store = make_store(&dir, 5, 3);
        assert!(store.exists("a"));
        assert_eq!(store.load("a").unwrap(), session);
    }

    #[test]
    fn test_list_sessions_and_stats() {
        let dir = TempDir::new().unwrap();
        let store = make_store(&dir, 5, 3);
        store.save("b", &make_session("b", 2023)).unwrap();
        store.save("a", &make_session("a", 2024)).unwrap();

        let listed = store.list_sessions();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].session_id, "a");
        assert_eq!(listed[0].year, 2024);
        assert!(listed.iter().all(|s| s.cached));

        let stats = store.stats();
        assert_eq!(stats.total_sessions, 2);
        assert_eq!(stats.max_sessions, 3);
        assert!(stats.total_size_mb > 0.0);
    }

    #[test]
    fn test_encode_id_sanitizes_paths() {
        assert_eq!(
            encode_id("2024/2024-05-26_Monaco/Race"),
            "2024_2024-05-26_Monaco_Race"
        );
    }
}

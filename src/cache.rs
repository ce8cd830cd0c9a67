use chrono::Utc;
use rusqlite::{Connection, ErrorCode, ToSql, params, params_from_iter};
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::CacheError;
use crate::models::AudioFeatures;

/// Audio features never change, so they are kept for a week
pub const AUDIO_FEATURES_TTL: Duration = Duration::from_secs(60 * 60 * 24 * 7);
const AUDIO_FEATURES_PREFIX: &str = "audio_features:";

/// Keys bound per `SELECT ... IN` statement
const MGET_CHUNK: usize = 500;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS cache_entries (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        expires_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_cache_entries_expires_at ON cache_entries (expires_at);
";

/// A key-value store with per-entry expiry
pub trait CacheStore: Send + Sync {
    /// Live values in key order, `None` for missing or expired keys
    fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, CacheError>;

    /// Upsert every entry with the same time-to-live
    fn set_many_with_ttl(
        &self,
        entries: &[(String, String)],
        ttl: Duration,
    ) -> Result<(), CacheError>;

    fn delete(&self, keys: &[String]) -> Result<(), CacheError>;

    /// Remove every key starting with `prefix`, returning how many were removed
    fn delete_prefix(&self, prefix: &str) -> Result<usize, CacheError>;

    fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        Ok(self.mget(&[key.to_string()])?.pop().flatten())
    }

    fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        self.set_many_with_ttl(&[(key.to_string(), value.to_string())], ttl)
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

fn is_corrupt(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::NotADatabase | ErrorCode::DatabaseCorrupt)
    )
}

/// `path` with `suffix` appended to the file name
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Persistent store backed by a SQLite database.
///
/// Entries live in one keyed table with an `expires_at` column (unix millis).
/// Expired rows are skipped by reads and purged when the store is opened. A
/// file that is not a readable database is moved aside to `<path>.corrupt`
/// and replaced by an empty one.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = match Self::connect(path) {
            Ok(conn) => conn,
            Err(e) if is_corrupt(&e) => {
                let aside = sibling(path, ".corrupt");
                warn!(
                    path = %path.display(),
                    moved_to = %aside.display(),
                    error = %e,
                    "cache database unreadable, starting with an empty one"
                );
                std::fs::rename(path, &aside)?;
                for suffix in ["-wal", "-shm"] {
                    let sidecar = sibling(path, suffix);
                    if sidecar.exists() {
                        std::fs::remove_file(sidecar)?;
                    }
                }
                Self::connect(path)?
            }
            Err(e) => return Err(e.into()),
        };

        let purged = conn.execute(
            "DELETE FROM cache_entries WHERE expires_at <= ?1",
            params![now_millis()],
        )?;
        info!(path = %path.display(), purged, "cache store ready");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    #[cfg(test)]
    pub fn in_memory() -> Result<Self, CacheError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn connect(path: &Path) -> rusqlite::Result<Connection> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(SCHEMA)?;
        Ok(conn)
    }
}

impl CacheStore for SqliteStore {
    fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, CacheError> {
        let now = now_millis();
        let conn = lock(&self.conn);
        let mut found: HashMap<String, String> = HashMap::with_capacity(keys.len());

        for chunk in keys.chunks(MGET_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT key, value FROM cache_entries \
                 WHERE expires_at > ? AND key IN ({placeholders})"
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            let bound = std::iter::once(&now as &dyn ToSql)
                .chain(chunk.iter().map(|key| key as &dyn ToSql));
            let rows = stmt.query_map(params_from_iter(bound), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                let (key, value) = row?;
                found.insert(key, value);
            }
        }

        Ok(keys.iter().map(|key| found.remove(key)).collect())
    }

    fn set_many_with_ttl(
        &self,
        entries: &[(String, String)],
        ttl: Duration,
    ) -> Result<(), CacheError> {
        if entries.is_empty() {
            return Ok(());
        }
        let expires_at = now_millis().saturating_add(ttl_millis(ttl));
        let mut conn = lock(&self.conn);
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO cache_entries (key, value, expires_at)
                 VALUES (?1, ?2, ?3)",
            )?;
            for (key, value) in entries {
                stmt.execute(params![key, value, expires_at])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn delete(&self, keys: &[String]) -> Result<(), CacheError> {
        let mut conn = lock(&self.conn);
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached("DELETE FROM cache_entries WHERE key = ?1")?;
            for key in keys {
                stmt.execute(params![key])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn delete_prefix(&self, prefix: &str) -> Result<usize, CacheError> {
        // substr instead of LIKE: '_' in prefixes is a LIKE wildcard
        let removed = lock(&self.conn).execute(
            "DELETE FROM cache_entries WHERE substr(key, 1, length(?1)) = ?1",
            params![prefix],
        )?;
        Ok(removed)
    }
}

/// Result of a cache lookup, split by tier
#[derive(Debug, Default)]
pub struct CacheLookup {
    pub found: HashMap<String, AudioFeatures>,
    pub memory_hits: usize,
    pub store_hits: usize,
}

/// Two-tier audio-feature cache: a fast in-memory map in front of an optional
/// persistent TTL store. Shared across concurrent requests; every store error
/// is logged and treated as a miss.
pub struct FeatureCache {
    memory: Mutex<HashMap<String, AudioFeatures>>,
    store: Option<Arc<dyn CacheStore>>,
}

impl FeatureCache {
    pub fn memory_only() -> Self {
        Self {
            memory: Mutex::new(HashMap::new()),
            store: None,
        }
    }

    pub fn with_store(store: Arc<dyn CacheStore>) -> Self {
        Self {
            memory: Mutex::new(HashMap::new()),
            store: Some(store),
        }
    }

    fn key(track_id: &str) -> String {
        format!("{AUDIO_FEATURES_PREFIX}{track_id}")
    }

    /// Look up every id, memory first, then the persistent store for the rest
    pub fn lookup(&self, track_ids: &[String]) -> CacheLookup {
        let mut lookup = CacheLookup::default();
        {
            let memory = lock(&self.memory);
            for id in track_ids {
                if let Some(features) = memory.get(id) {
                    lookup.found.insert(id.clone(), *features);
                }
            }
        }
        lookup.memory_hits = lookup.found.len();

        let Some(store) = &self.store else {
            return lookup;
        };
        let uncached: Vec<&String> = track_ids
            .iter()
            .filter(|id| !lookup.found.contains_key(*id))
            .collect();
        if uncached.is_empty() {
            return lookup;
        }

        let keys: Vec<String> = uncached.iter().map(|id| Self::key(id)).collect();
        let values = match store.mget(&keys) {
            Ok(values) => values,
            Err(e) => {
                warn!(error = %e, "feature store read failed, using memory cache only");
                return lookup;
            }
        };

        let mut promoted = Vec::new();
        let mut undecodable = Vec::new();
        for ((id, key), value) in uncached.into_iter().zip(&keys).zip(values) {
            let Some(raw) = value else { continue };
            match serde_json::from_str::<AudioFeatures>(&raw) {
                Ok(features) => {
                    lookup.found.insert(id.clone(), features);
                    promoted.push((id.clone(), features));
                    lookup.store_hits += 1;
                }
                Err(e) => {
                    warn!(track_id = %id, error = %e, "discarding undecodable cached features");
                    undecodable.push(key.clone());
                }
            }
        }
        if !undecodable.is_empty() {
            if let Err(e) = store.delete(&undecodable) {
                debug!(error = %e, "could not remove undecodable entries");
            }
        }

        lock(&self.memory).extend(promoted);
        debug!(
            store_hits = lookup.store_hits,
            requested = keys.len(),
            "feature store lookup"
        );
        lookup
    }

    /// Write features into both tiers. Store failures only log.
    pub fn insert_all(&self, features: &HashMap<String, AudioFeatures>) {
        if features.is_empty() {
            return;
        }
        lock(&self.memory).extend(features.iter().map(|(id, f)| (id.clone(), *f)));

        let Some(store) = &self.store else {
            return;
        };
        let entries: Vec<(String, String)> = features
            .iter()
            .filter_map(|(id, f)| match serde_json::to_string(f) {
                Ok(raw) => Some((Self::key(id), raw)),
                Err(e) => {
                    debug!(track_id = %id, error = %e, "features not serializable");
                    None
                }
            })
            .collect();
        if let Err(e) = store.set_many_with_ttl(&entries, AUDIO_FEATURES_TTL) {
            warn!(
                error = %e,
                total = features.len(),
                "feature store write failed, cached in memory only"
            );
        }
    }

    /// Drop the given ids from both tiers, or every cached feature when `None`.
    /// Returns how many persistent entries were removed.
    pub fn clear(&self, track_ids: Option<&[String]>) -> usize {
        match track_ids {
            Some(ids) => {
                {
                    let mut memory = lock(&self.memory);
                    for id in ids {
                        memory.remove(id);
                    }
                }
                let mut removed = 0;
                if let Some(store) = &self.store {
                    let keys: Vec<String> = ids.iter().map(|id| Self::key(id)).collect();
                    match store.delete(&keys) {
                        Ok(()) => removed = keys.len(),
                        Err(e) => warn!(error = %e, "feature store delete failed"),
                    }
                }
                info!(count = ids.len(), "cleared cached features");
                removed
            }
            None => {
                lock(&self.memory).clear();
                let removed = match &self.store {
                    Some(store) => store.delete_prefix(AUDIO_FEATURES_PREFIX).unwrap_or_else(|e| {
                        warn!(error = %e, "feature store clear failed");
                        0
                    }),
                    None => 0,
                };
                info!(removed, "cleared all cached features");
                removed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A store that is never reachable
    struct DownStore;

    fn refused() -> CacheError {
        std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "connection refused").into()
    }

    impl CacheStore for DownStore {
        fn mget(&self, _keys: &[String]) -> Result<Vec<Option<String>>, CacheError> {
            Err(refused())
        }
        fn set_many_with_ttl(&self, _: &[(String, String)], _: Duration) -> Result<(), CacheError> {
            Err(refused())
        }
        fn delete(&self, _keys: &[String]) -> Result<(), CacheError> {
            Err(refused())
        }
        fn delete_prefix(&self, _prefix: &str) -> Result<usize, CacheError> {
            Err(refused())
        }
    }

    fn features(energy: f64) -> AudioFeatures {
        AudioFeatures {
            energy,
            ..Default::default()
        }
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn store_in(dir: &tempfile::TempDir) -> SqliteStore {
        SqliteStore::open(dir.path().join("cache.db")).unwrap()
    }

    #[test]
    fn test_store_expires_entries() {
        let store = SqliteStore::in_memory().unwrap();
        store.set_with_ttl("a", "1", Duration::from_secs(60)).unwrap();
        store.set_with_ttl("b", "2", Duration::ZERO).unwrap();

        assert_eq!(store.get("a").unwrap(), Some("1".to_string()));
        assert_eq!(store.get("b").unwrap(), None);
        assert_eq!(
            store.mget(&ids(&["a", "b", "c"])).unwrap(),
            vec![Some("1".to_string()), None, None]
        );
    }

    #[test]
    fn test_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();

        let store = store_in(&dir);
        store.set_with_ttl("k", "v", Duration::from_secs(3600)).unwrap();
        store.set_with_ttl("gone", "v", Duration::ZERO).unwrap();
        drop(store);

        let reopened = store_in(&dir);
        assert_eq!(reopened.get("k").unwrap(), Some("v".to_string()));
        assert_eq!(reopened.get("gone").unwrap(), None);

        reopened.delete(&ids(&["k"])).unwrap();
        drop(reopened);
        assert_eq!(store_in(&dir).get("k").unwrap(), None);
    }

    #[test]
    fn test_batch_upsert_and_lookup_beyond_one_chunk() {
        let store = SqliteStore::in_memory().unwrap();
        let entries: Vec<(String, String)> = (0..1200)
            .map(|i| (format!("k{i}"), format!("v{i}")))
            .collect();
        store.set_many_with_ttl(&entries, Duration::from_secs(60)).unwrap();
        store
            .set_many_with_ttl(&[("k7".to_string(), "new".to_string())], Duration::from_secs(60))
            .unwrap();

        let mut keys: Vec<String> = (0..1200).map(|i| format!("k{i}")).collect();
        keys.push("missing".to_string());
        let values = store.mget(&keys).unwrap();

        assert_eq!(values.len(), 1201);
        assert_eq!(values[0].as_deref(), Some("v0"));
        assert_eq!(values[7].as_deref(), Some("new"));
        assert_eq!(values[1199].as_deref(), Some("v1199"));
        assert_eq!(values[1200], None);
    }

    #[test]
    fn test_corrupt_database_is_moved_aside() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        let garbage = "this was never a database, just leftover text\n".repeat(40);
        std::fs::write(&path, &garbage).unwrap();

        let store = SqliteStore::open(&path).unwrap();
        store.set_with_ttl("k", "v", Duration::from_secs(60)).unwrap();
        assert_eq!(store.get("k").unwrap(), Some("v".to_string()));

        let aside = dir.path().join("cache.db.corrupt");
        assert_eq!(std::fs::read_to_string(aside).unwrap(), garbage);
    }

    #[test]
    fn test_delete_prefix_is_literal() {
        let store = SqliteStore::in_memory().unwrap();
        let keys = [
            "audio_features:a",
            "audio_features:b",
            "audioXfeatures:c",
            "token",
        ];
        let entries: Vec<(String, String)> = keys
            .iter()
            .map(|key| (key.to_string(), "v".to_string()))
            .collect();
        store.set_many_with_ttl(&entries, Duration::from_secs(60)).unwrap();

        assert_eq!(store.delete_prefix(AUDIO_FEATURES_PREFIX).unwrap(), 2);
        assert!(store.get("audioXfeatures:c").unwrap().is_some());
        assert!(store.get("token").unwrap().is_some());
    }

    #[test]
    fn test_lookup_promotes_store_hits_into_memory() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        store
            .set_with_ttl(
                "audio_features:t1",
                &serde_json::to_string(&features(0.9)).unwrap(),
                AUDIO_FEATURES_TTL,
            )
            .unwrap();
        let cache = FeatureCache::with_store(store.clone());

        let first = cache.lookup(&ids(&["t1", "t2"]));
        assert_eq!(first.store_hits, 1);
        assert_eq!(first.memory_hits, 0);
        assert_eq!(first.found["t1"].energy, 0.9);
        assert!(!first.found.contains_key("t2"));

        store.delete(&ids(&["audio_features:t1"])).unwrap();
        let second = cache.lookup(&ids(&["t1"]));
        assert_eq!(second.memory_hits, 1);
        assert_eq!(second.store_hits, 0);
    }

    #[test]
    fn test_undecodable_entries_are_dropped_from_store() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        store
            .set_with_ttl("audio_features:t1", "{\"energy\":", AUDIO_FEATURES_TTL)
            .unwrap();
        let cache = FeatureCache::with_store(store.clone());

        let lookup = cache.lookup(&ids(&["t1"]));

        assert!(lookup.found.is_empty());
        assert!(store.get("audio_features:t1").unwrap().is_none());
    }

    #[test]
    fn test_unreachable_store_degrades_to_memory() {
        let cache = FeatureCache::with_store(Arc::new(DownStore));
        let mut fresh = HashMap::new();
        fresh.insert("t1".to_string(), features(0.3));

        cache.insert_all(&fresh);
        let lookup = cache.lookup(&ids(&["t1", "t2"]));

        assert_eq!(lookup.memory_hits, 1);
        assert_eq!(lookup.found.len(), 1);
        assert_eq!(cache.clear(None), 0);
    }

    #[test]
    fn test_clear_removes_from_both_tiers() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let cache = FeatureCache::with_store(store.clone());
        let mut fresh = HashMap::new();
        fresh.insert("t1".to_string(), features(0.3));
        fresh.insert("t2".to_string(), features(0.4));
        cache.insert_all(&fresh);

        assert_eq!(cache.clear(Some(&ids(&["t1"]))), 1);

        assert!(store.get("audio_features:t1").unwrap().is_none());
        assert!(store.get("audio_features:t2").unwrap().is_some());
        let lookup = cache.lookup(&ids(&["t1", "t2"]));
        assert_eq!(lookup.found.len(), 1);
    }

    #[test]
    fn test_clear_all_keeps_other_entries() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        store.set_with_ttl("spotify_token", "abc", Duration::from_secs(60)).unwrap();
        let cache = FeatureCache::with_store(store.clone());
        cache.insert_all(&HashMap::from([
            ("t1".to_string(), features(0.3)),
            ("t2".to_string(), features(0.4)),
        ]));

        assert_eq!(cache.clear(None), 2);

        assert!(cache.lookup(&ids(&["t1", "t2"])).found.is_empty());
        assert_eq!(store.get("spotify_token").unwrap(), Some("abc".to_string()));
    }
}

//! Metadata store
//!
//! Stores, per space:
//! - `chunks`: one versioned chunk map per namespace
//! - `zones`: zone ranges per namespace
//! - `shards`: the shard registry
//! - `locks`: migration locks and leases
//! - `balancer`: balancer settings, chunk health and round reports
//!
//! Every mutation of routing metadata goes through `compare_and_swap`, so a
//! lost race is detected instead of silently overwriting a concurrent write.

use crate::common::{timestamp_now_millis, Error, Result};
use rocksdb::{Options, DB};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

pub const SPACE_CHUNKS: &str = "chunks";
pub const SPACE_ZONES: &str = "zones";
pub const SPACE_SHARDS: &str = "shards";
pub const SPACE_LOCKS: &str = "locks";
pub const SPACE_BALANCER: &str = "balancer";

pub const ALL_SPACES: [&str; 5] = [
    SPACE_CHUNKS,
    SPACE_ZONES,
    SPACE_SHARDS,
    SPACE_LOCKS,
    SPACE_BALANCER,
];

/// Attempts of a read-modify-CAS cycle before giving up
const MAX_CAS_ATTEMPTS: usize = 32;

/// Time-bounded exclusive lease (leader election primitive)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub holder: String,
    pub expires_at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseStatus {
    Acquired,
    Renewed,
    HeldBy(String),
}

impl LeaseStatus {
    pub fn is_held(&self) -> bool {
        !matches!(self, LeaseStatus::HeldBy(_))
    }
}

/// Durable key/value store with compare-and-swap
pub trait MetadataStore: Send + Sync {
    fn get(&self, space: &str, key: &str) -> Result<Option<Vec<u8>>>;

    fn put(&self, space: &str, key: &str, value: &[u8]) -> Result<()>;

    fn delete(&self, space: &str, key: &str) -> Result<()>;

    /// All entries of a space, ordered by key
    fn list(&self, space: &str) -> Result<Vec<(String, Vec<u8>)>>;

    /// Atomically replace the value at `key` if it still equals `expected`
    /// (`None` = absent). `new = None` deletes. Returns false on mismatch.
    fn compare_and_swap(
        &self,
        space: &str,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> Result<bool>;

    /// Acquire or renew the named lease for `holder`
    fn try_acquire_lease(&self, name: &str, holder: &str, ttl: Duration) -> Result<LeaseStatus> {
        let key = format!("lease/{}", name);
        let now = timestamp_now_millis();
        let lease = Lease {
            holder: holder.to_string(),
            expires_at_ms: now + ttl.as_millis() as u64,
        };
        let encoded = bincode::serialize(&lease)?;

        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.get(SPACE_LOCKS, &key)?;
            let status = match &current {
                None => LeaseStatus::Acquired,
                Some(bytes) => {
                    let existing: Lease = bincode::deserialize(bytes)?;
                    if existing.holder == holder {
                        LeaseStatus::Renewed
                    } else if existing.expires_at_ms <= now {
                        LeaseStatus::Acquired
                    } else {
                        return Ok(LeaseStatus::HeldBy(existing.holder));
                    }
                }
            };
            if self.compare_and_swap(SPACE_LOCKS, &key, current.as_deref(), Some(&encoded))? {
                return Ok(status);
            }
        }
        Err(Error::CasConflict(key))
    }

    /// Release the lease if `holder` owns it
    fn release_lease(&self, name: &str, holder: &str) -> Result<()> {
        let key = format!("lease/{}", name);
        if let Some(bytes) = self.get(SPACE_LOCKS, &key)? {
            let existing: Lease = bincode::deserialize(&bytes)?;
            if existing.holder == holder {
                self.compare_and_swap(SPACE_LOCKS, &key, Some(&bytes), None)?;
            }
        }
        Ok(())
    }
}

/// Typed read of a bincode record
pub fn read_record<T: DeserializeOwned>(
    store: &dyn MetadataStore,
    space: &str,
    key: &str,
) -> Result<Option<T>> {
    match store.get(space, key)? {
        Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
        None => Ok(None),
    }
}

/// Typed write of a bincode record (no concurrency guard)
pub fn write_record<T: Serialize>(
    store: &dyn MetadataStore,
    space: &str,
    key: &str,
    value: &T,
) -> Result<()> {
    store.put(space, key, &bincode::serialize(value)?)
}

/// Read-modify-CAS loop over one bincode record.
///
/// `f` sees the current value and returns the value to store (`None`
/// deletes) plus a result. It may run several times when racing other
/// writers, so it must not have side effects; an `Err` aborts without
/// writing anything.
pub fn update_record<T, R, F>(store: &dyn MetadataStore, space: &str, key: &str, mut f: F) -> Result<R>
where
    T: Serialize + DeserializeOwned,
    F: FnMut(Option<T>) -> Result<(Option<T>, R)>,
{
    for _ in 0..MAX_CAS_ATTEMPTS {
        let current = store.get(space, key)?;
        let decoded = match &current {
            Some(bytes) => Some(bincode::deserialize::<T>(bytes)?),
            None => None,
        };
        let (next, result) = f(decoded)?;
        let encoded = match &next {
            Some(value) => Some(bincode::serialize(value)?),
            None => None,
        };
        if store.compare_and_swap(space, key, current.as_deref(), encoded.as_deref())? {
            return Ok(result);
        }
        tracing::debug!("CAS conflict on {}/{}, retrying", space, key);
    }
    Err(Error::CasConflict(format!("{}/{}", space, key)))
}

/// In-memory metadata store for tests and embedded clusters
pub struct MemoryMetadataStore {
    spaces: Mutex<HashMap<String, BTreeMap<String, Vec<u8>>>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self {
            spaces: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, BTreeMap<String, Vec<u8>>>> {
        self.spaces
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MemoryMetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataStore for MemoryMetadataStore {
    fn get(&self, space: &str, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .lock()
            .get(space)
            .and_then(|s| s.get(key))
            .cloned())
    }

    fn put(&self, space: &str, key: &str, value: &[u8]) -> Result<()> {
        self.lock()
            .entry(space.to_string())
            .or_default()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, space: &str, key: &str) -> Result<()> {
        if let Some(s) = self.lock().get_mut(space) {
            s.remove(key);
        }
        Ok(())
    }

    fn list(&self, space: &str) -> Result<Vec<(String, Vec<u8>)>> {
        Ok(self
            .lock()
            .get(space)
            .map(|s| s.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    fn compare_and_swap(
        &self,
        space: &str,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> Result<bool> {
        let mut spaces = self.lock();
        let entries = spaces.entry(space.to_string()).or_default();
        if entries.get(key).map(|v| v.as_slice()) != expected {
            return Ok(false);
        }
        match new {
            Some(value) => {
                entries.insert(key.to_string(), value.to_vec());
            }
            None => {
                entries.remove(key);
            }
        }
        Ok(true)
    }
}

/// RocksDB-backed metadata store, one column family per space
pub struct RocksMetadataStore {
    db: DB,
    /// Serializes compare-and-swap against other writers in this process
    cas_lock: Mutex<()>,
}

impl RocksMetadataStore {
    /// Open or create metadata store
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let db = DB::open_cf(&opts, path, ALL_SPACES)?;

        Ok(Self {
            db,
            cas_lock: Mutex::new(()),
        })
    }

    fn cf(&self, space: &str) -> Result<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(space)
            .ok_or_else(|| Error::MetadataCorrupted(format!("unknown metadata space {}", space)))
    }

    /// Flush to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl MetadataStore for RocksMetadataStore {
    fn get(&self, space: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let cf = self.cf(space)?;
        Ok(self.db.get_cf(cf, key.as_bytes())?)
    }

    fn put(&self, space: &str, key: &str, value: &[u8]) -> Result<()> {
        let cf = self.cf(space)?;
        let _guard = self.cas_lock.lock().unwrap_or_else(|p| p.into_inner());
        self.db.put_cf(cf, key.as_bytes(), value)?;
        Ok(())
    }

    fn delete(&self, space: &str, key: &str) -> Result<()> {
        let cf = self.cf(space)?;
        let _guard = self.cas_lock.lock().unwrap_or_else(|p| p.into_inner());
        self.db.delete_cf(cf, key.as_bytes())?;
        Ok(())
    }

    fn list(&self, space: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let cf = self.cf(space)?;
        let iter = self.db.iterator_cf(cf, rocksdb::IteratorMode::Start);

        let mut entries = Vec::new();
        for item in iter {
            let (key_bytes, value_bytes) = item?;
            let key = String::from_utf8(key_bytes.to_vec())
                .map_err(|_| Error::MetadataCorrupted("Invalid UTF-8 key".into()))?;
            entries.push((key, value_bytes.to_vec()));
        }

        Ok(entries)
    }

    fn compare_and_swap(
        &self,
        space: &str,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> Result<bool> {
        let cf = self.cf(space)?;
        let _guard = self.cas_lock.lock().unwrap_or_else(|p| p.into_inner());
        let current = self.db.get_cf(cf, key.as_bytes())?;
        if current.as_deref() != expected {
            return Ok(false);
        }
        match new {
            Some(value) => self.db.put_cf(cf, key.as_bytes(), value)?,
            None => self.db.delete_cf(cf, key.as_bytes())?,
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn exercise_cas(store: &dyn MetadataStore) {
        assert!(store
            .compare_and_swap(SPACE_CHUNKS, "app.users", None, Some(b"v1"))
            .unwrap());
        // Second insert-if-absent loses
        assert!(!store
            .compare_and_swap(SPACE_CHUNKS, "app.users", None, Some(b"v2"))
            .unwrap());
        assert!(store
            .compare_and_swap(SPACE_CHUNKS, "app.users", Some(b"v1"), Some(b"v2"))
            .unwrap());
        assert_eq!(
            store.get(SPACE_CHUNKS, "app.users").unwrap(),
            Some(b"v2".to_vec())
        );
        assert!(store
            .compare_and_swap(SPACE_CHUNKS, "app.users", Some(b"v2"), None)
            .unwrap());
        assert!(store.get(SPACE_CHUNKS, "app.users").unwrap().is_none());
    }

    #[test]
    fn test_memory_cas() {
        exercise_cas(&MemoryMetadataStore::new());
    }

    #[test]
    fn test_rocks_cas_and_list() {
        let dir = tempdir().unwrap();
        let store = RocksMetadataStore::open(dir.path().join("meta.db")).unwrap();
        exercise_cas(&store);

        store.put(SPACE_ZONES, "b", b"2").unwrap();
        store.put(SPACE_ZONES, "a", b"1").unwrap();
        let entries = store.list(SPACE_ZONES).unwrap();
        assert_eq!(entries[0].0, "a");
        assert_eq!(entries.len(), 2);

        assert!(store.get("nope", "a").is_err());
    }

    #[test]
    fn test_rocks_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("meta.db");
        {
            let store = RocksMetadataStore::open(&path).unwrap();
            write_record(&store, SPACE_SHARDS, "registry", &vec![1u32, 2, 3]).unwrap();
            store.flush().unwrap();
        }
        let store = RocksMetadataStore::open(&path).unwrap();
        let value: Option<Vec<u32>> = read_record(&store, SPACE_SHARDS, "registry").unwrap();
        assert_eq!(value, Some(vec![1, 2, 3]));
    }

    #[test]
    fn test_update_record_aborts_on_error() {
        let store = MemoryMetadataStore::new();
        write_record(&store, SPACE_BALANCER, "n", &1u64).unwrap();

        let res: Result<()> = update_record(&store, SPACE_BALANCER, "n", |_: Option<u64>| {
            Err(Error::Internal("nope".into()))
        });
        assert!(res.is_err());

        let doubled = update_record(&store, SPACE_BALANCER, "n", |v: Option<u64>| {
            let next = v.unwrap_or(0) * 2;
            Ok((Some(next), next))
        })
        .unwrap();
        assert_eq!(doubled, 2);
    }

    #[test]
    fn test_lease() {
        let store = MemoryMetadataStore::new();
        let ttl = Duration::from_secs(60);

        assert_eq!(
            store.try_acquire_lease("balancer", "coord-1", ttl).unwrap(),
            LeaseStatus::Acquired
        );
        assert_eq!(
            store.try_acquire_lease("balancer", "coord-1", ttl).unwrap(),
            LeaseStatus::Renewed
        );
        assert_eq!(
            store.try_acquire_lease("balancer", "coord-2", ttl).unwrap(),
            LeaseStatus::HeldBy("coord-1".into())
        );

        store.release_lease("balancer", "coord-1").unwrap();
        assert!(store
            .try_acquire_lease("balancer", "coord-2", ttl)
            .unwrap()
            .is_held());
    }

    #[test]
    fn test_expired_lease_is_taken_over() {
        let store = MemoryMetadataStore::new();
        store
            .try_acquire_lease("balancer", "coord-1", Duration::ZERO)
            .unwrap();
        assert_eq!(
            store
                .try_acquire_lease("balancer", "coord-2", Duration::from_secs(5))
                .unwrap(),
            LeaseStatus::Acquired
        );
    }
}

//! Shard registry and connection pool

use crate::common::{timestamp_now, Error, Result};
use crate::coordinator::chunk_map::ShardId;
use crate::coordinator::metadata::{read_record, update_record, MetadataStore, SPACE_SHARDS};
use crate::shard::ShardBackend;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

const REGISTRY_KEY: &str = "registry";

/// Shard lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardState {
    /// Can receive chunks
    Active,
    /// Being emptied before removal; only donates chunks
    Draining,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardRecord {
    pub id: ShardId,
    pub endpoint: String,
    pub zone_tags: BTreeSet<String>,
    pub capacity_weight: f64,
    pub state: ShardState,
    pub joined_at: u64,
}

impl ShardRecord {
    pub fn is_active(&self) -> bool {
        self.state == ShardState::Active
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Registry {
    next_id: u64,
    shards: BTreeMap<ShardId, ShardRecord>,
}

/// Durable set of registered shards
pub struct ShardRegistry {
    store: Arc<dyn MetadataStore>,
}

impl ShardRegistry {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self { store }
    }

    /// Allocate an id for `endpoint` and record it as active
    pub fn register(
        &self,
        endpoint: &str,
        zone_tags: BTreeSet<String>,
        capacity_weight: f64,
    ) -> Result<ShardRecord> {
        if !(capacity_weight.is_finite() && capacity_weight > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "capacity weight must be positive, got {}",
                capacity_weight
            )));
        }
        update_record(
            self.store.as_ref(),
            SPACE_SHARDS,
            REGISTRY_KEY,
            |current: Option<Registry>| {
                let mut registry = current.unwrap_or_default();
                if registry.shards.values().any(|s| s.endpoint == endpoint) {
                    return Err(Error::DuplicateShard(endpoint.to_string()));
                }
                let id = format!("shard-{}", registry.next_id);
                registry.next_id += 1;
                let record = ShardRecord {
                    id: id.clone(),
                    endpoint: endpoint.to_string(),
                    zone_tags: zone_tags.clone(),
                    capacity_weight,
                    state: ShardState::Active,
                    joined_at: timestamp_now(),
                };
                registry.shards.insert(id, record.clone());
                Ok((Some(registry), record))
            },
        )
    }

    fn modify<F>(&self, id: &str, mut f: F) -> Result<ShardRecord>
    where
        F: FnMut(&mut ShardRecord),
    {
        update_record(
            self.store.as_ref(),
            SPACE_SHARDS,
            REGISTRY_KEY,
            |current: Option<Registry>| {
                let mut registry = current.unwrap_or_default();
                let record = registry
                    .shards
                    .get_mut(id)
                    .ok_or_else(|| Error::ShardNotFound(id.to_string()))?;
                f(record);
                let updated = record.clone();
                Ok((Some(registry), updated))
            },
        )
    }

    pub fn set_state(&self, id: &str, state: ShardState) -> Result<ShardRecord> {
        self.modify(id, |record| record.state = state)
    }

    pub fn set_zone_tags(&self, id: &str, tags: BTreeSet<String>) -> Result<ShardRecord> {
        self.modify(id, |record| record.zone_tags = tags.clone())
    }

    pub fn deregister(&self, id: &str) -> Result<ShardRecord> {
        update_record(
            self.store.as_ref(),
            SPACE_SHARDS,
            REGISTRY_KEY,
            |current: Option<Registry>| {
                let mut registry = current.unwrap_or_default();
                let removed = registry
                    .shards
                    .remove(id)
                    .ok_or_else(|| Error::ShardNotFound(id.to_string()))?;
                Ok((Some(registry), removed))
            },
        )
    }

    pub fn get(&self, id: &str) -> Result<ShardRecord> {
        self.list()?
            .into_iter()
            .find(|s| s.id == id)
            .ok_or_else(|| Error::ShardNotFound(id.to_string()))
    }

    pub fn list(&self) -> Result<Vec<ShardRecord>> {
        let registry: Registry =
            read_record(self.store.as_ref(), SPACE_SHARDS, REGISTRY_KEY)?.unwrap_or_default();
        Ok(registry.shards.into_values().collect())
    }
}

/// Live backends by shard id
#[derive(Default)]
pub struct ShardPool {
    backends: RwLock<HashMap<ShardId, Arc<dyn ShardBackend>>>,
}

impl ShardPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: &str, backend: Arc<dyn ShardBackend>) {
        self.backends
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id.to_string(), backend);
    }

    pub fn remove(&self, id: &str) {
        self.backends
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(id);
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn ShardBackend>> {
        self.backends
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| Error::ShardNotFound(id.to_string()))
    }

    pub fn ids(&self) -> Vec<ShardId> {
        let mut ids: Vec<ShardId> = self
            .backends
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::metadata::MemoryMetadataStore;

    fn tags(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_register_and_duplicate() {
        let registry = ShardRegistry::new(Arc::new(MemoryMetadataStore::new()));
        let a = registry.register("mem://a", tags(&["eu"]), 1.0).unwrap();
        let b = registry.register("mem://b", tags(&[]), 2.0).unwrap();
        assert_eq!(a.id, "shard-0");
        assert_eq!(b.id, "shard-1");
        assert!(matches!(
            registry.register("mem://a", tags(&[]), 1.0),
            Err(Error::DuplicateShard(_))
        ));
        assert!(registry.register("mem://c", tags(&[]), 0.0).is_err());
        assert_eq!(registry.list().unwrap().len(), 2);
    }

    #[test]
    fn test_state_and_tags() {
        let registry = ShardRegistry::new(Arc::new(MemoryMetadataStore::new()));
        let a = registry.register("mem://a", tags(&[]), 1.0).unwrap();
        registry.set_state(&a.id, ShardState::Draining).unwrap();
        registry.set_zone_tags(&a.id, tags(&["us"])).unwrap();

        let a = registry.get(&a.id).unwrap();
        assert!(!a.is_active());
        assert!(a.zone_tags.contains("us"));

        registry.deregister(&a.id).unwrap();
        assert!(matches!(registry.get(&a.id), Err(Error::ShardNotFound(_))));
        // Ids are never reused
        let c = registry.register("mem://c", tags(&[]), 1.0).unwrap();
        assert_eq!(c.id, "shard-1");
    }
}

//! Operator-facing control plane
//!
//! Everything an operator can do to a sharded deployment goes through
//! [`Admin`]: sharding a namespace, adding and draining shards, zone
//! ranges, balancer controls and manual chunk operations. The HTTP API in
//! `http.rs` is a thin JSON layer over these methods.

use crate::common::keys::{KeyRange, ShardKey, ShardKeySpec};
use crate::common::{ChunkVersion, CoordinatorConfig, Error, Result};
use crate::coordinator::balancer::{Balancer, BalancerStatus};
use crate::coordinator::chunk_map::{ChunkId, ChunkMap, ChunkMapSnapshot, InitialChunks, ShardId};
use crate::coordinator::migration::{MigrationCoordinator, MigrationOutcome};
use crate::coordinator::shards::{ShardPool, ShardRecord, ShardRegistry, ShardState};
use crate::coordinator::zones::{classify, shard_allowed, ZoneRange, ZoneRegistry};
use crate::shard::ShardConnector;
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Chunk placement summary of one namespace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkDistribution {
    pub namespace: String,
    pub version: ChunkVersion,
    pub total_chunks: usize,
    /// Chunk count per registered shard, zero included
    pub shards: BTreeMap<ShardId, usize>,
    pub jumbo: Vec<ChunkId>,
    pub needs_attention: Vec<ChunkId>,
    pub zones: Vec<ZoneRange>,
}

/// Result of one drain check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalProgress {
    /// Chunks (or running migrations) still reference the shard
    Draining { remaining: usize },
    Removed,
}

pub struct Admin {
    config: CoordinatorConfig,
    chunk_map: Arc<ChunkMap>,
    zones: Arc<ZoneRegistry>,
    registry: Arc<ShardRegistry>,
    pool: Arc<ShardPool>,
    connector: Arc<dyn ShardConnector>,
    migrations: Arc<MigrationCoordinator>,
    balancer: Arc<Balancer>,
}

impl Admin {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: CoordinatorConfig,
        chunk_map: Arc<ChunkMap>,
        zones: Arc<ZoneRegistry>,
        registry: Arc<ShardRegistry>,
        pool: Arc<ShardPool>,
        connector: Arc<dyn ShardConnector>,
        migrations: Arc<MigrationCoordinator>,
        balancer: Arc<Balancer>,
    ) -> Self {
        Self {
            config,
            chunk_map,
            zones,
            registry,
            pool,
            connector,
            migrations,
            balancer,
        }
    }

    // ---- namespaces ----

    /// Shard `ns` by `key_spec`. Every initial chunk starts on the active
    /// shard holding the fewest chunks; the balancer spreads them later.
    pub fn shard_collection(
        &self,
        ns: &str,
        key_spec: ShardKeySpec,
        initial: InitialChunks,
    ) -> Result<Arc<ChunkMapSnapshot>> {
        key_spec.validate()?;
        if self.chunk_map.is_sharded(ns)? {
            return Err(Error::AlreadySharded(ns.to_string()));
        }
        let seed = self.seed_shard()?;
        let snapshot = self.chunk_map.initialize(ns, key_spec, initial, &seed)?;
        self.push_routing(&snapshot, &seed);
        Ok(snapshot)
    }

    fn seed_shard(&self) -> Result<ShardId> {
        let mut totals: BTreeMap<ShardId, usize> = BTreeMap::new();
        for shard in self.registry.list()? {
            if !shard.is_active() {
                continue;
            }
            match self.pool.get(&shard.id).and_then(|b| b.ping()) {
                Ok(()) => {
                    totals.insert(shard.id, 0);
                }
                Err(e) => tracing::debug!("Skipping {} as seed: {}", shard.id, e),
            }
        }
        for ns in self.chunk_map.namespaces()? {
            let snapshot = self.chunk_map.snapshot(&ns)?;
            for (shard, count) in snapshot.counts_by_shard() {
                if let Some(total) = totals.get_mut(&shard) {
                    *total += count;
                }
            }
        }
        totals
            .into_iter()
            .min_by_key(|(id, total)| (*total, id.clone()))
            .map(|(id, _)| id)
            .ok_or_else(|| Error::InvalidConfig("no reachable active shard".into()))
    }

    fn push_routing(&self, snapshot: &ChunkMapSnapshot, shard: &str) {
        match self.pool.get(shard).and_then(|b| b.install_routing(snapshot)) {
            Ok(()) => {}
            Err(e) => tracing::warn!(
                "Routing push of {} to {} failed: {}",
                snapshot.namespace,
                shard,
                e
            ),
        }
    }

    pub fn get_chunk_distribution(&self, ns: &str) -> Result<ChunkDistribution> {
        let snapshot = self.chunk_map.snapshot(ns)?;
        let mut shards: BTreeMap<ShardId, usize> = self
            .registry
            .list()?
            .into_iter()
            .map(|s| (s.id, 0))
            .collect();
        shards.extend(snapshot.counts_by_shard());
        Ok(ChunkDistribution {
            namespace: ns.to_string(),
            version: snapshot.version,
            total_chunks: snapshot.chunks.len(),
            shards,
            jumbo: snapshot
                .chunks
                .iter()
                .filter(|c| c.jumbo)
                .map(|c| c.id)
                .collect(),
            needs_attention: self.balancer.needs_attention(ns)?,
            zones: self.zones.ranges(ns)?,
        })
    }

    // ---- shards ----

    /// Connect to a new shard, register it and make it routable
    pub fn add_shard(
        &self,
        endpoint: &str,
        zone_tags: BTreeSet<String>,
        capacity_weight: f64,
    ) -> Result<ShardRecord> {
        let backend = self.connector.connect(endpoint)?;
        backend.ping()?;
        let record = self.registry.register(endpoint, zone_tags, capacity_weight)?;
        if let Err(e) = backend.join(&record.id) {
            self.registry.deregister(&record.id)?;
            return Err(e);
        }
        self.pool.insert(&record.id, backend.clone());
        // Registered and pooled from here on; a shard that misses a push
        // catches up with the next routing change it takes part in
        for ns in self.chunk_map.namespaces()? {
            let pushed = self
                .chunk_map
                .snapshot(&ns)
                .and_then(|snapshot| backend.install_routing(&snapshot));
            if let Err(e) = pushed {
                tracing::warn!("Routing push of {} to new shard {} failed: {}", ns, record.id, e);
            }
        }
        tracing::info!(
            "Added shard {} at {} (weight {}, zones {:?})",
            record.id,
            endpoint,
            capacity_weight,
            record.zone_tags
        );
        Ok(record)
    }

    pub fn list_shards(&self) -> Result<Vec<ShardRecord>> {
        self.registry.list()
    }

    pub fn set_shard_zones(&self, id: &str, zone_tags: BTreeSet<String>) -> Result<ShardRecord> {
        let record = self.registry.set_zone_tags(id, zone_tags)?;
        tracing::info!("Shard {} zones set to {:?}", id, record.zone_tags);
        Ok(record)
    }

    /// Mark the shard draining and deregister it once it owns nothing.
    ///
    /// Chunks are moved off by the balancer; this only checks progress.
    pub fn remove_shard_step(&self, id: &str) -> Result<RemovalProgress> {
        let record = self.registry.get(id)?;
        if record.is_active() {
            let receivers = self
                .registry
                .list()?
                .into_iter()
                .filter(|s| s.id != id && s.is_active())
                .count();
            let owned = self.owned_chunks(id)?;
            if owned > 0 && receivers == 0 {
                return Err(Error::InvalidConfig(format!(
                    "{} owns {} chunk(s) and no other active shard can take them",
                    id, owned
                )));
            }
            self.registry.set_state(id, ShardState::Draining)?;
            tracing::info!("Draining shard {} ({} chunk(s))", id, owned);
        }

        let remaining = self.owned_chunks(id)?
            + self
                .migrations
                .active_tickets()
                .iter()
                .filter(|t| t.from == id || t.to == id)
                .count();
        if remaining > 0 {
            return Ok(RemovalProgress::Draining { remaining });
        }
        self.registry.deregister(id)?;
        self.pool.remove(id);
        tracing::info!("Removed shard {}", id);
        Ok(RemovalProgress::Removed)
    }

    /// Drain and remove a shard, waiting for the balancer to empty it
    pub async fn remove_shard(&self, id: &str) -> Result<()> {
        loop {
            match self.remove_shard_step(id)? {
                RemovalProgress::Removed => return Ok(()),
                RemovalProgress::Draining { remaining } => {
                    tracing::debug!("Shard {} still has {} chunk(s) to move", id, remaining);
                    tokio::time::sleep(self.config.drain_poll()).await;
                }
            }
        }
    }

    fn owned_chunks(&self, id: &str) -> Result<usize> {
        let mut owned = 0;
        for ns in self.chunk_map.namespaces()? {
            owned += self.chunk_map.snapshot(&ns)?.chunks_on(id).count();
        }
        Ok(owned)
    }

    // ---- zones ----

    pub fn assign_zone_range(&self, ns: &str, range: KeyRange, zone: &str) -> Result<()> {
        let snapshot = self.chunk_map.snapshot(ns)?;
        check_width(&snapshot.key_spec, &range)?;
        self.zones.assign_zone(ns, range, zone)
    }

    pub fn remove_zone_range(&self, ns: &str, range: &KeyRange) -> Result<String> {
        self.zones.remove_zone(ns, range)
    }

    // ---- balancer ----

    pub fn set_balancer_window(&self, start: NaiveTime, stop: NaiveTime) -> Result<()> {
        self.balancer.set_window(start, stop)
    }

    pub fn clear_balancer_window(&self) -> Result<()> {
        self.balancer.clear_window()
    }

    pub fn pause_balancer(&self) -> Result<()> {
        self.balancer.pause()
    }

    pub fn resume_balancer(&self) -> Result<()> {
        self.balancer.resume()
    }

    pub fn balancer_status(&self) -> Result<BalancerStatus> {
        self.balancer.status()
    }

    pub fn clear_needs_attention(&self, ns: &str, chunk_id: ChunkId) -> Result<bool> {
        self.chunk_map
            .snapshot(ns)?
            .chunk(chunk_id)
            .ok_or(Error::ChunkNotFound(chunk_id))?;
        self.balancer.clear_needs_attention(ns, chunk_id)
    }

    // ---- chunks ----

    /// Split at explicit points, or at the owner's median key when `points`
    /// is `None`
    pub fn split_chunk(
        &self,
        ns: &str,
        chunk_id: ChunkId,
        points: Option<Vec<ShardKey>>,
    ) -> Result<Arc<ChunkMapSnapshot>> {
        if self.migrations.is_active(ns, chunk_id) {
            return Err(Error::MigrationInProgress(chunk_id));
        }
        let snapshot = self.chunk_map.snapshot(ns)?;
        let owner = snapshot
            .chunk(chunk_id)
            .ok_or(Error::ChunkNotFound(chunk_id))?
            .shard
            .clone();
        let updated = match points {
            Some(points) => self.chunk_map.split(ns, chunk_id, &points)?,
            None => {
                let backend = self.pool.get(&owner)?;
                self.chunk_map.split_at_data(ns, chunk_id, backend.as_ref())?
            }
        };
        self.push_routing(&updated, &owner);
        Ok(updated)
    }

    /// Merge the adjacent same-shard chunks exactly covering `range`
    pub fn merge_chunks(&self, ns: &str, range: &KeyRange) -> Result<Arc<ChunkMapSnapshot>> {
        let snapshot = self.chunk_map.snapshot(ns)?;
        if let Some(busy) = snapshot
            .chunks
            .iter()
            .filter(|c| range.contains_range(&c.range))
            .find(|c| self.migrations.is_active(ns, c.id))
        {
            return Err(Error::MigrationInProgress(busy.id));
        }
        let updated = self.chunk_map.merge_chunks(ns, range)?;
        if let Some(owner) = updated.find(&range.min).map(|c| c.shard.clone()) {
            self.push_routing(&updated, &owner);
        }
        Ok(updated)
    }

    /// Move one chunk now and wait for the outcome
    pub async fn move_chunk(&self, ns: &str, chunk_id: ChunkId, to: &str) -> Result<MigrationOutcome> {
        let recipient = self.registry.get(to)?;
        if !recipient.is_active() {
            return Err(Error::InvalidConfig(format!("{} is draining", to)));
        }
        let snapshot = self.chunk_map.snapshot(ns)?;
        let chunk = snapshot.chunk(chunk_id).ok_or(Error::ChunkNotFound(chunk_id))?;
        let placement = classify(&self.zones.ranges(ns)?, &chunk.range);
        if !shard_allowed(&placement, &recipient) {
            return Err(Error::ZoneConflict(format!(
                "chunk {} may not be placed on {}",
                chunk_id, to
            )));
        }
        let outcome = self.migrations.migrate(ns, chunk_id, to).await?;
        match &outcome.error {
            None => Ok(outcome),
            Some(e) => Err(Error::MigrationAborted(e.clone())),
        }
    }
}

fn check_width(spec: &ShardKeySpec, range: &KeyRange) -> Result<()> {
    if range.min.width() != spec.width() || range.max.width() != spec.width() {
        return Err(Error::InvalidRange(format!(
            "range bounds must have {} field(s)",
            spec.width()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::keys::KeyPart;
    use crate::coordinator::cluster::Cluster;

    fn add(cluster: &Cluster, endpoint: &str) -> Result<ShardRecord> {
        cluster.admin.add_shard(endpoint, BTreeSet::new(), 1.0)
    }

    fn key(s: &str) -> ShardKey {
        ShardKey(vec![KeyPart::Str(s.to_string())])
    }

    #[test]
    fn test_shard_collection_needs_a_shard() {
        let (cluster, _) = Cluster::in_memory();
        let spec = ShardKeySpec::ranged(&["tenant"]).unwrap();
        assert!(matches!(
            cluster.admin.shard_collection("db.users", spec, InitialChunks::Count(1)),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_shard_collection_and_distribution() {
        let (cluster, _) = Cluster::in_memory();
        let a = add(&cluster, "mem://a").unwrap();
        let b = add(&cluster, "mem://b").unwrap();
        let spec = ShardKeySpec::ranged(&["tenant"]).unwrap();

        let snapshot = cluster
            .admin
            .shard_collection(
                "db.users",
                spec.clone(),
                InitialChunks::SplitPoints(vec![key("m")]),
            )
            .unwrap();
        assert_eq!(snapshot.chunks.len(), 2);
        assert!(matches!(
            cluster
                .admin
                .shard_collection("db.users", spec, InitialChunks::Count(1)),
            Err(Error::AlreadySharded(_))
        ));

        let dist = cluster.admin.get_chunk_distribution("db.users").unwrap();
        assert_eq!(dist.total_chunks, 2);
        assert_eq!(dist.shards[&a.id], 2);
        assert_eq!(dist.shards[&b.id], 0);
        assert!(dist.jumbo.is_empty());
        assert!(dist.needs_attention.is_empty());
    }

    #[test]
    fn test_second_namespace_seeds_emptier_shard() {
        let (cluster, _) = Cluster::in_memory();
        let a = add(&cluster, "mem://a").unwrap();
        let b = add(&cluster, "mem://b").unwrap();
        let spec = ShardKeySpec::hashed("user_id").unwrap();

        let first = cluster
            .admin
            .shard_collection("db.a", spec.clone(), InitialChunks::Count(4))
            .unwrap();
        let second = cluster
            .admin
            .shard_collection("db.b", spec, InitialChunks::Count(4))
            .unwrap();
        assert!(first.chunks.iter().all(|c| c.shard == a.id));
        assert!(second.chunks.iter().all(|c| c.shard == b.id));
    }

    #[test]
    fn test_add_shard_duplicate_and_unreachable() {
        let (cluster, shards) = Cluster::in_memory();
        add(&cluster, "mem://a").unwrap();
        assert!(matches!(
            add(&cluster, "mem://a"),
            Err(Error::DuplicateShard(_))
        ));

        cluster.connector.connect("mem://down").unwrap();
        shards.shard("mem://down").unwrap().set_reachable(false);
        assert!(cluster
            .admin
            .add_shard("mem://down", BTreeSet::new(), 1.0)
            .is_err());
        assert_eq!(cluster.admin.list_shards().unwrap().len(), 1);
    }

    #[test]
    fn test_remove_last_shard_with_chunks_is_refused() {
        let (cluster, _) = Cluster::in_memory();
        let a = add(&cluster, "mem://a").unwrap();
        cluster
            .admin
            .shard_collection(
                "db.users",
                ShardKeySpec::ranged(&["tenant"]).unwrap(),
                InitialChunks::Count(1),
            )
            .unwrap();
        assert!(matches!(
            cluster.admin.remove_shard_step(&a.id),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_remove_empty_shard() {
        let (cluster, _) = Cluster::in_memory();
        add(&cluster, "mem://a").unwrap();
        let b = add(&cluster, "mem://b").unwrap();
        assert_eq!(
            cluster.admin.remove_shard_step(&b.id).unwrap(),
            RemovalProgress::Removed
        );
        assert!(cluster.pool.get(&b.id).is_err());
        assert!(matches!(
            cluster.admin.remove_shard_step(&b.id),
            Err(Error::ShardNotFound(_))
        ));
    }

    #[test]
    fn test_zone_range_width_checked() {
        let (cluster, _) = Cluster::in_memory();
        add(&cluster, "mem://a").unwrap();
        cluster
            .admin
            .shard_collection(
                "db.users",
                ShardKeySpec::ranged(&["tenant", "user"]).unwrap(),
                InitialChunks::Count(1),
            )
            .unwrap();

        let narrow = KeyRange::new(key("a"), key("m")).unwrap();
        assert!(matches!(
            cluster.admin.assign_zone_range("db.users", narrow, "eu"),
            Err(Error::InvalidRange(_))
        ));
        assert!(matches!(
            cluster.admin.assign_zone_range(
                "db.missing",
                KeyRange::new(key("a"), key("m")).unwrap(),
                "eu"
            ),
            Err(Error::NamespaceNotFound(_))
        ));
    }

    #[test]
    fn test_split_then_merge() {
        let (cluster, _) = Cluster::in_memory();
        add(&cluster, "mem://a").unwrap();
        let spec = ShardKeySpec::ranged(&["tenant"]).unwrap();
        let before = cluster
            .admin
            .shard_collection("db.users", spec.clone(), InitialChunks::Count(1))
            .unwrap();

        let split = cluster
            .admin
            .split_chunk("db.users", 1, Some(vec![key("g"), key("p")]))
            .unwrap();
        assert_eq!(split.chunks.len(), 3);

        let merged = cluster
            .admin
            .merge_chunks("db.users", &spec.full_range())
            .unwrap();
        assert_eq!(merged.chunks.len(), 1);
        assert_eq!(merged.chunks[0].range, before.chunks[0].range);
        assert_eq!(merged.chunks[0].shard, before.chunks[0].shard);
        assert!(merged.version > before.version);
    }
}

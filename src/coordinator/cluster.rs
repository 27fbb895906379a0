//! Wiring of the coordinator components

use crate::common::{Config, MetricsRegistry, Result, METRICS};
use crate::coordinator::admin::Admin;
use crate::coordinator::balancer::Balancer;
use crate::coordinator::chunk_map::ChunkMap;
use crate::coordinator::metadata::{MemoryMetadataStore, MetadataStore};
use crate::coordinator::migration::MigrationCoordinator;
use crate::coordinator::router::Router;
use crate::coordinator::shards::{ShardPool, ShardRegistry};
use crate::coordinator::zones::ZoneRegistry;
use crate::shard::{MemoryConnector, ShardConnector};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// One coordinator's view of the deployment, sharing a metadata store
pub struct Cluster {
    pub config: Config,
    pub store: Arc<dyn MetadataStore>,
    pub metrics: Arc<MetricsRegistry>,
    pub chunk_map: Arc<ChunkMap>,
    pub zones: Arc<ZoneRegistry>,
    pub registry: Arc<ShardRegistry>,
    pub pool: Arc<ShardPool>,
    pub connector: Arc<dyn ShardConnector>,
    pub router: Arc<Router>,
    pub migrations: Arc<MigrationCoordinator>,
    pub balancer: Arc<Balancer>,
    pub admin: Arc<Admin>,
}

impl Cluster {
    /// Build the components and reconnect every registered shard. Metrics
    /// go to the process-wide registry.
    pub fn new(
        config: Config,
        store: Arc<dyn MetadataStore>,
        connector: Arc<dyn ShardConnector>,
    ) -> Result<Self> {
        let cluster = Self::assemble(config, store, connector, METRICS.clone());
        cluster.reconnect_shards()?;
        Ok(cluster)
    }

    fn assemble(
        config: Config,
        store: Arc<dyn MetadataStore>,
        connector: Arc<dyn ShardConnector>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let node_id = config.coordinator.node_id.clone();
        let chunk_map = Arc::new(ChunkMap::new(store.clone()));
        let zones = Arc::new(ZoneRegistry::new(store.clone()));
        let registry = Arc::new(ShardRegistry::new(store.clone()));
        let pool = Arc::new(ShardPool::new());
        let router = Arc::new(Router::new(chunk_map.clone(), pool.clone(), metrics.clone()));
        let migrations = Arc::new(MigrationCoordinator::new(
            chunk_map.clone(),
            pool.clone(),
            store.clone(),
            config.migration.clone(),
            metrics.clone(),
            &node_id,
        ));
        let balancer = Arc::new(Balancer::new(
            config.balancer.clone(),
            &node_id,
            store.clone(),
            chunk_map.clone(),
            zones.clone(),
            registry.clone(),
            pool.clone(),
            migrations.clone(),
            metrics.clone(),
        ));
        let admin = Arc::new(Admin::new(
            config.coordinator.clone(),
            chunk_map.clone(),
            zones.clone(),
            registry.clone(),
            pool.clone(),
            connector.clone(),
            migrations.clone(),
            balancer.clone(),
        ));

        Self {
            config,
            store,
            metrics,
            chunk_map,
            zones,
            registry,
            pool,
            connector,
            router,
            migrations,
            balancer,
            admin,
        }
    }

    /// Memory metadata and memory shards, for tests and embedded use
    pub fn in_memory() -> (Self, Arc<MemoryConnector>) {
        Self::in_memory_with(Config::default())
    }

    pub fn in_memory_with(config: Config) -> (Self, Arc<MemoryConnector>) {
        let connector = Arc::new(MemoryConnector::new());
        let cluster = Self::assemble(
            config,
            Arc::new(MemoryMetadataStore::new()),
            connector.clone(),
            Arc::new(MetricsRegistry::new()),
        );
        (cluster, connector)
    }

    /// Re-open the backends of registered shards; failures leave the shard
    /// out of the pool, where the balancer treats it as unreachable
    fn reconnect_shards(&self) -> Result<()> {
        let namespaces = self.chunk_map.namespaces()?;
        for record in self.registry.list()? {
            let backend = match self.connector.connect(&record.endpoint) {
                Ok(backend) => backend,
                Err(e) => {
                    tracing::warn!("Cannot reconnect {} at {}: {}", record.id, record.endpoint, e);
                    continue;
                }
            };
            if let Err(e) = backend.join(&record.id) {
                tracing::warn!("Shard {} refused to rejoin: {}", record.id, e);
                continue;
            }
            for ns in &namespaces {
                let snapshot = self.chunk_map.snapshot(ns)?;
                if let Err(e) = backend.install_routing(&snapshot) {
                    tracing::warn!("Routing push of {} to {} failed: {}", ns, record.id, e);
                }
            }
            self.pool.insert(&record.id, backend);
        }
        if !self.pool.ids().is_empty() {
            tracing::info!("Reconnected shards: {:?}", self.pool.ids());
        }
        Ok(())
    }

    /// Start the balancer loop on the current runtime
    pub fn spawn_balancer(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.balancer.clone().run(shutdown))
    }
}

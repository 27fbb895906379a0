//! Coordinator server

use crate::common::{Config, Result};
use crate::coordinator::cluster::Cluster;
use crate::coordinator::http::{create_router, CoordState};
use crate::coordinator::metadata::RocksMetadataStore;
use crate::shard::MemoryConnector;
use std::sync::Arc;
use tokio::sync::watch;

pub struct Coordinator {
    config: Config,
}

impl Coordinator {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub async fn serve(self) -> Result<()> {
        let coord = &self.config.coordinator;
        tracing::info!("Starting coordinator: {}", coord.node_id);
        tracing::info!("  HTTP API: {}", coord.bind_addr);
        tracing::info!("  DB path: {}", coord.db_path.display());
        tracing::info!(
            "  Balancer: threshold {}, {} concurrent migration(s), round every {:?}",
            self.config.balancer.imbalance_threshold,
            self.config.balancer.max_concurrent_migrations,
            self.config.balancer.round_interval()
        );

        // Initialize metadata store
        let store = Arc::new(RocksMetadataStore::open(&coord.db_path)?);

        // Shards live in-process; their endpoints are only names
        let connector = Arc::new(MemoryConnector::new());
        let cluster = Arc::new(Cluster::new(self.config.clone(), store.clone(), connector)?);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let balancer = cluster.spawn_balancer(shutdown_rx);

        let http_router = create_router(CoordState {
            cluster: cluster.clone(),
        });
        let http_listener = tokio::net::TcpListener::bind(coord.bind_addr).await?;
        let http_server = axum::serve(http_listener, http_router);

        tracing::info!("✓ Coordinator ready");

        tokio::select! {
            res = http_server => {
                if let Err(e) = res {
                    tracing::error!("HTTP server error: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown requested");
            }
        }

        let _ = shutdown_tx.send(true);
        if let Err(e) = balancer.await {
            tracing::warn!("Balancer task ended abnormally: {}", e);
        }
        cluster.migrations.cancel_before_steady_state();
        cluster.migrations.wait_idle().await;
        store.flush()?;
        tracing::info!("Coordinator stopped");
        Ok(())
    }
}

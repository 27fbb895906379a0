//! Chunk balancer
//!
//! One round:
//! 1. take or renew the balancer lease (other instances skip)
//! 2. harvest finished tickets: commits clear a chunk's abort history,
//!    aborts back it off and eventually flag it needs-attention
//! 3. stop if paused, or outside the window (cancelling tickets that have
//!    not reached steady state)
//! 4. probe shards; unreachable ones take no part
//! 5. per namespace: split chunks straddling zone edges, move chunks off
//!    draining shards and out of the wrong zone, then even out load
//! 6. persist the round report
//!
//! Chunk health and the round counter are updated by one CAS at the start
//! of a round and never written back afterwards.
//!
//! Tickets are submitted without waiting; their outcomes are harvested by
//! later rounds. Running two balancers at once is wasteful but safe:
//! every move goes through `MigrationCoordinator::try_acquire` and the
//! chunk-version guarded commit.

use crate::common::{BalancerConfig, Error, MetricsRegistry, Result};
use crate::coordinator::chunk_map::{Chunk, ChunkId, ChunkMap, ChunkMapSnapshot, ShardId};
use crate::coordinator::metadata::{
    read_record, update_record, write_record, LeaseStatus, MetadataStore, SPACE_BALANCER,
};
use crate::coordinator::migration::{MigrationCoordinator, MigrationOutcome, MigrationTicket};
use crate::coordinator::shards::{ShardPool, ShardRecord, ShardRegistry};
use crate::coordinator::zones::{classify, shard_allowed, ZonePlacement, ZoneRange, ZoneRegistry};
use chrono::{NaiveTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const LEASE_NAME: &str = "balancer";
const SETTINGS_KEY: &str = "settings";
const STATE_KEY: &str = "state";
const ROUND_PREFIX: &str = "round/";

/// Daily UTC time window in which the balancer may run; may wrap midnight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalancerWindow {
    pub start: NaiveTime,
    pub stop: NaiveTime,
}

impl BalancerWindow {
    pub fn contains(&self, now: NaiveTime) -> bool {
        if self.start <= self.stop {
            self.start <= now && now < self.stop
        } else {
            now >= self.start || now < self.stop
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalancerSettings {
    pub paused: bool,
    pub window: Option<BalancerWindow>,
}

/// Abort history of one chunk
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkHealth {
    pub consecutive_aborts: u32,
    pub needs_attention: bool,
    /// Not selected again before this round
    pub retry_after_round: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct BalancerState {
    round: u64,
    health: BTreeMap<String, BTreeMap<ChunkId, ChunkHealth>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRef {
    pub namespace: String,
    pub chunk_id: ChunkId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveReason {
    Draining,
    ZoneViolation,
    Balance,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedMove {
    pub namespace: String,
    pub chunk_id: ChunkId,
    pub from: ShardId,
    pub to: ShardId,
    pub reason: MoveReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortedMove {
    pub namespace: String,
    pub chunk_id: ChunkId,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundOutcome {
    Ran,
    NotLeader(String),
    Paused,
    OutsideWindow,
}

/// Observable record of one round
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundReport {
    pub round: u64,
    pub started_at_ms: u64,
    pub outcome: RoundOutcome,
    pub committed: Vec<ChunkRef>,
    pub aborted: Vec<AbortedMove>,
    pub cancelled: usize,
    pub splits: u32,
    pub submitted: Vec<PlannedMove>,
    pub skipped_jumbo: u32,
    pub unreachable: Vec<ShardId>,
    /// `max - min` shard load per namespace before this round's moves
    pub imbalance: BTreeMap<String, f64>,
    pub needs_attention: Vec<ChunkRef>,
}

impl RoundReport {
    fn new(round: u64, outcome: RoundOutcome) -> Self {
        Self {
            round,
            started_at_ms: crate::common::timestamp_now_millis(),
            outcome,
            committed: Vec::new(),
            aborted: Vec::new(),
            cancelled: 0,
            splits: 0,
            submitted: Vec::new(),
            skipped_jumbo: 0,
            unreachable: Vec::new(),
            imbalance: BTreeMap::new(),
            needs_attention: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancerStatus {
    pub settings: BalancerSettings,
    pub round: u64,
    pub active: Vec<MigrationTicket>,
    pub needs_attention: Vec<ChunkRef>,
    pub last_report: Option<RoundReport>,
}

/// Per-round scheduling limits shared by all namespaces
struct RoundBudget {
    remaining: usize,
    busy: HashSet<ShardId>,
}

pub struct Balancer {
    config: BalancerConfig,
    node_id: String,
    store: Arc<dyn MetadataStore>,
    chunk_map: Arc<ChunkMap>,
    zones: Arc<ZoneRegistry>,
    registry: Arc<ShardRegistry>,
    pool: Arc<ShardPool>,
    migrations: Arc<MigrationCoordinator>,
    metrics: Arc<MetricsRegistry>,
}

impl Balancer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: BalancerConfig,
        node_id: &str,
        store: Arc<dyn MetadataStore>,
        chunk_map: Arc<ChunkMap>,
        zones: Arc<ZoneRegistry>,
        registry: Arc<ShardRegistry>,
        pool: Arc<ShardPool>,
        migrations: Arc<MigrationCoordinator>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            config,
            node_id: node_id.to_string(),
            store,
            chunk_map,
            zones,
            registry,
            pool,
            migrations,
            metrics,
        }
    }

    // ---- settings ----

    pub fn settings(&self) -> Result<BalancerSettings> {
        Ok(read_record(self.store.as_ref(), SPACE_BALANCER, SETTINGS_KEY)?.unwrap_or_default())
    }

    fn update_settings<F>(&self, mut f: F) -> Result<BalancerSettings>
    where
        F: FnMut(&mut BalancerSettings),
    {
        update_record(
            self.store.as_ref(),
            SPACE_BALANCER,
            SETTINGS_KEY,
            |current: Option<BalancerSettings>| {
                let mut settings = current.unwrap_or_default();
                f(&mut settings);
                Ok((Some(settings.clone()), settings))
            },
        )
    }

    pub fn set_window(&self, start: NaiveTime, stop: NaiveTime) -> Result<()> {
        if start == stop {
            return Err(Error::InvalidConfig(
                "balancer window start and stop must differ".into(),
            ));
        }
        self.update_settings(|s| s.window = Some(BalancerWindow { start, stop }))?;
        tracing::info!("Balancer window set to {} - {} UTC", start, stop);
        Ok(())
    }

    pub fn clear_window(&self) -> Result<()> {
        self.update_settings(|s| s.window = None)?;
        tracing::info!("Balancer window cleared");
        Ok(())
    }

    pub fn pause(&self) -> Result<()> {
        self.update_settings(|s| s.paused = true)?;
        tracing::info!("Balancer paused");
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        self.update_settings(|s| s.paused = false)?;
        tracing::info!("Balancer resumed");
        Ok(())
    }

    // ---- chunk health ----

    fn state(&self) -> Result<BalancerState> {
        Ok(read_record(self.store.as_ref(), SPACE_BALANCER, STATE_KEY)?.unwrap_or_default())
    }

    /// Chunks of `ns` excluded from automatic moves until cleared
    pub fn needs_attention(&self, ns: &str) -> Result<Vec<ChunkId>> {
        Ok(self
            .state()?
            .health
            .get(ns)
            .map(|chunks| {
                chunks
                    .iter()
                    .filter(|(_, h)| h.needs_attention)
                    .map(|(id, _)| *id)
                    .collect()
            })
            .unwrap_or_default())
    }

    pub fn chunk_health(&self, ns: &str, chunk_id: ChunkId) -> Result<Option<ChunkHealth>> {
        Ok(self
            .state()?
            .health
            .get(ns)
            .and_then(|chunks| chunks.get(&chunk_id).cloned()))
    }

    /// Forget a chunk's abort history; returns whether it was flagged
    pub fn clear_needs_attention(&self, ns: &str, chunk_id: ChunkId) -> Result<bool> {
        let was_flagged = update_record(
            self.store.as_ref(),
            SPACE_BALANCER,
            STATE_KEY,
            |current: Option<BalancerState>| {
                let mut state = current.unwrap_or_default();
                let removed = state
                    .health
                    .get_mut(ns)
                    .and_then(|chunks| chunks.remove(&chunk_id));
                Ok((Some(state), removed.map_or(false, |h| h.needs_attention)))
            },
        )?;
        if was_flagged {
            tracing::info!("Cleared needs-attention on chunk {} of {}", chunk_id, ns);
        }
        Ok(was_flagged)
    }

    // ---- reports ----

    /// Most recent round reports, newest first
    pub fn reports(&self, limit: usize) -> Result<Vec<RoundReport>> {
        let mut entries = self.store.list(SPACE_BALANCER)?;
        entries.retain(|(key, _)| key.starts_with(ROUND_PREFIX));
        entries
            .iter()
            .rev()
            .take(limit)
            .map(|(_, bytes)| Ok(bincode::deserialize(bytes)?))
            .collect()
    }

    pub fn status(&self) -> Result<BalancerStatus> {
        let state = self.state()?;
        Ok(BalancerStatus {
            settings: self.settings()?,
            round: state.round,
            active: self.migrations.active_tickets(),
            needs_attention: flagged(&state),
            last_report: self.reports(1)?.into_iter().next(),
        })
    }

    fn persist(&self, report: &RoundReport) -> Result<()> {
        let key = format!("{}{:020}", ROUND_PREFIX, report.round);
        write_record(self.store.as_ref(), SPACE_BALANCER, &key, report)?;

        let rounds: Vec<String> = self
            .store
            .list(SPACE_BALANCER)?
            .into_iter()
            .map(|(key, _)| key)
            .filter(|key| key.starts_with(ROUND_PREFIX))
            .collect();
        if rounds.len() > self.config.max_history {
            for key in &rounds[..rounds.len() - self.config.max_history] {
                self.store.delete(SPACE_BALANCER, key)?;
            }
        }
        Ok(())
    }

    // ---- rounds ----

    /// Run one round now. Must be called within a tokio runtime, since
    /// tickets are spawned onto it.
    pub fn run_round(&self) -> Result<RoundReport> {
        self.run_round_at(Utc::now().time())
    }

    pub fn run_round_at(&self, now: NaiveTime) -> Result<RoundReport> {
        if let Some(holder) = self.take_lease()? {
            self.metrics.balancer_rounds_skipped.inc();
            tracing::debug!("Balancer lease held by {}, skipping round", holder);
            return Ok(RoundReport::new(0, RoundOutcome::NotLeader(holder)));
        }

        let finished = self.migrations.take_finished();
        let live = self.live_chunks()?;
        let (state, newly_flagged) = update_record(
            self.store.as_ref(),
            SPACE_BALANCER,
            STATE_KEY,
            |current: Option<BalancerState>| {
                let mut state = current.unwrap_or_default();
                state.round += 1;
                let marked = self.apply_outcomes(&mut state, &finished);
                prune_retired(&mut state, &live);
                Ok((Some(state.clone()), (state, marked)))
            },
        )?;
        self.metrics.balancer_rounds.inc();
        for chunk in &newly_flagged {
            tracing::warn!(
                "Chunk {} of {} needs attention after {} aborted migrations",
                chunk.chunk_id,
                chunk.namespace,
                self.config.abort_limit
            );
        }
        let mut report = RoundReport::new(state.round, RoundOutcome::Ran);
        record_outcomes(&finished, &mut report);

        let settings = self.settings()?;
        if settings.paused {
            report.outcome = RoundOutcome::Paused;
        } else if let Some(window) = settings.window.filter(|w| !w.contains(now)) {
            report.cancelled = self.migrations.cancel_before_steady_state();
            report.outcome = RoundOutcome::OutsideWindow;
            if report.cancelled > 0 {
                tracing::info!(
                    "Outside balancer window {} - {}: cancelled {} ticket(s)",
                    window.start,
                    window.stop,
                    report.cancelled
                );
            }
        }
        if report.outcome != RoundOutcome::Ran {
            self.metrics.balancer_rounds_skipped.inc();
            report.needs_attention = flagged(&self.state()?);
            self.persist(&report)?;
            return Ok(report);
        }

        let shards = self.live_shards(&mut report)?;
        let mut budget = RoundBudget {
            remaining: self
                .config
                .max_concurrent_migrations
                .saturating_sub(self.migrations.active_count()),
            busy: self
                .migrations
                .active_tickets()
                .into_iter()
                .flat_map(|t| [t.from, t.to])
                .collect(),
        };

        for ns in self.chunk_map.namespaces()? {
            if let Err(e) = self.balance_namespace(&ns, &shards, &state, &mut budget, &mut report) {
                tracing::warn!("Balancing {} failed: {}", ns, e);
            }
        }

        // Re-read: operators may have cleared flags while the round ran
        report.needs_attention = flagged(&self.state()?);
        self.persist(&report)?;
        if !report.submitted.is_empty() || report.splits > 0 {
            tracing::info!(
                "Balancer round {}: {} split(s), {} move(s) submitted",
                report.round,
                report.splits,
                report.submitted.len()
            );
        }
        Ok(report)
    }

    /// `None` if this node holds the lease, otherwise the holder
    fn take_lease(&self) -> Result<Option<String>> {
        let status = self
            .store
            .try_acquire_lease(LEASE_NAME, &self.node_id, self.config.lease_ttl())?;
        Ok(match status {
            LeaseStatus::HeldBy(holder) => Some(holder),
            LeaseStatus::Acquired | LeaseStatus::Renewed => None,
        })
    }

    /// Fold finished tickets into `state`: commits clear a chunk's history,
    /// aborts back it off. Returns chunks flagged by this call. Runs inside
    /// a CAS loop, so it only touches `state`.
    fn apply_outcomes(&self, state: &mut BalancerState, finished: &[MigrationOutcome]) -> Vec<ChunkRef> {
        let mut newly_flagged = Vec::new();
        for outcome in finished {
            let ticket = &outcome.ticket;
            let chunks = state.health.entry(ticket.namespace.clone()).or_default();
            if outcome.committed() {
                chunks.remove(&ticket.chunk_id);
                continue;
            }
            if outcome.cancelled {
                continue;
            }

            let health = chunks.entry(ticket.chunk_id).or_default();
            health.consecutive_aborts += 1;
            let shift = (health.consecutive_aborts - 1).min(32);
            let backoff = self
                .config
                .backoff_rounds
                .saturating_mul(1u64 << shift)
                .min(self.config.max_backoff_rounds);
            health.retry_after_round = state.round + backoff;
            if health.consecutive_aborts >= self.config.abort_limit && !health.needs_attention {
                health.needs_attention = true;
                newly_flagged.push(ChunkRef {
                    namespace: ticket.namespace.clone(),
                    chunk_id: ticket.chunk_id,
                });
            }
        }
        newly_flagged
    }

    /// Current chunk ids per sharded namespace
    fn live_chunks(&self) -> Result<HashMap<String, HashSet<ChunkId>>> {
        let mut live = HashMap::new();
        for ns in self.chunk_map.namespaces()? {
            let snapshot = self.chunk_map.snapshot(&ns)?;
            live.insert(ns, snapshot.chunks.iter().map(|c| c.id).collect());
        }
        Ok(live)
    }

    /// Registered shards answering the liveness probe
    fn live_shards(&self, report: &mut RoundReport) -> Result<Vec<ShardRecord>> {
        let mut live = Vec::new();
        for shard in self.registry.list()? {
            match self.pool.get(&shard.id).and_then(|b| b.ping()) {
                Ok(()) => live.push(shard),
                Err(e) => {
                    tracing::warn!("Shard {} excluded from balancing: {}", shard.id, e);
                    report.unreachable.push(shard.id.clone());
                }
            }
        }
        Ok(live)
    }

    fn balance_namespace(
        &self,
        ns: &str,
        shards: &[ShardRecord],
        state: &BalancerState,
        budget: &mut RoundBudget,
        report: &mut RoundReport,
    ) -> Result<()> {
        let zones = self.zones.ranges(ns)?;
        let mut snapshot = self.chunk_map.snapshot(ns)?;

        // Zone edges first: a straddling chunk cannot be placed anywhere
        let straddling: Vec<(Chunk, Vec<_>)> = snapshot
            .chunks
            .iter()
            .filter_map(|c| match classify(&zones, &c.range) {
                ZonePlacement::Straddles(points) => Some((c.clone(), points)),
                _ => None,
            })
            .collect();
        for (chunk, points) in straddling {
            if chunk.jumbo || self.migrations.is_active(ns, chunk.id) {
                continue;
            }
            snapshot = self.chunk_map.split(ns, chunk.id, &points)?;
            report.splits += 1;
            self.metrics.chunk_splits.inc();
            if let Ok(owner) = self.pool.get(&chunk.shard) {
                if let Err(e) = owner.install_routing(&snapshot) {
                    tracing::debug!("Routing push to {} failed: {}", chunk.shard, e);
                }
            }
        }

        report.skipped_jumbo += snapshot.chunks.iter().filter(|c| c.jumbo).count() as u32;

        let health = state.health.get(ns);
        let blocked = |chunk: &Chunk| {
            health
                .and_then(|h| h.get(&chunk.id))
                .map_or(false, |h| h.needs_attention || h.retry_after_round > state.round)
        };
        let by_id: HashMap<&str, &ShardRecord> = shards.iter().map(|s| (s.id.as_str(), s)).collect();
        let sizes = self.chunk_sizes(ns, &snapshot, &by_id);
        let mut loads = self.loads(&snapshot, shards, &sizes);
        report.imbalance.insert(ns.to_string(), imbalance(&loads, shards));

        // Forced moves: draining donors and zone violations
        for chunk in &snapshot.chunks {
            if budget.remaining == 0 {
                return Ok(());
            }
            let Some(owner) = by_id.get(chunk.shard.as_str()) else {
                continue;
            };
            let placement = classify(&zones, &chunk.range);
            let reason = if !owner.is_active() {
                MoveReason::Draining
            } else if !shard_allowed(&placement, owner) && !matches!(placement, ZonePlacement::Straddles(_)) {
                MoveReason::ZoneViolation
            } else {
                continue;
            };
            if budget.busy.contains(&chunk.shard) || chunk.jumbo {
                continue;
            }
            if blocked(chunk) || self.migrations.is_active(ns, chunk.id) {
                continue;
            }
            let recipient = shards
                .iter()
                .filter(|s| s.is_active() && s.id != chunk.shard && !budget.busy.contains(&s.id))
                .filter(|s| shard_allowed(&placement, s))
                .min_by(|a, b| load_of(&loads, &a.id).total_cmp(&load_of(&loads, &b.id)));
            if let Some(recipient) = recipient {
                let to = recipient.id.clone();
                self.submit(ns, chunk, &to, reason, budget, report, &mut loads, &sizes, &by_id);
            }
        }

        // Even out load between active shards
        while budget.remaining > 0 {
            if imbalance(&loads, shards) <= self.config.imbalance_threshold {
                break;
            }
            let Some(planned) = self.pick_balance_move(&snapshot, &zones, shards, &loads, &sizes, budget, &blocked) else {
                break;
            };
            let (chunk, to) = planned;
            self.submit(ns, &chunk, &to, MoveReason::Balance, budget, report, &mut loads, &sizes, &by_id);
        }
        Ok(())
    }

    /// Donor = most loaded active shard with a movable chunk; recipient =
    /// least loaded shard that may hold it, as long as the move does not
    /// overshoot
    #[allow(clippy::too_many_arguments)]
    fn pick_balance_move(
        &self,
        snapshot: &ChunkMapSnapshot,
        zones: &[ZoneRange],
        shards: &[ShardRecord],
        loads: &HashMap<ShardId, f64>,
        sizes: &HashMap<ChunkId, u64>,
        budget: &RoundBudget,
        blocked: &dyn Fn(&Chunk) -> bool,
    ) -> Option<(Chunk, ShardId)> {
        let mut donors: Vec<&ShardRecord> = shards
            .iter()
            .filter(|s| s.is_active() && !budget.busy.contains(&s.id))
            .collect();
        donors.sort_by(|a, b| load_of(loads, &b.id).total_cmp(&load_of(loads, &a.id)));

        let mut recipients = donors.clone();
        recipients.reverse();

        for donor in &donors {
            let mut candidates: Vec<(usize, &Chunk)> = snapshot
                .chunks
                .iter()
                .enumerate()
                .filter(|(_, c)| c.shard == donor.id)
                .filter(|(_, c)| {
                    !c.jumbo && !blocked(c) && !self.migrations.is_active(&snapshot.namespace, c.id)
                })
                .collect();
            // Smallest first, then chunks at the edge of the donor's ranges
            candidates.sort_by_key(|(pos, c)| {
                let at_edge = *pos == 0
                    || *pos + 1 == snapshot.chunks.len()
                    || snapshot.chunks[pos - 1].shard != donor.id
                    || snapshot.chunks[pos + 1].shard != donor.id;
                (sizes.get(&c.id).copied().unwrap_or(0), !at_edge, *pos)
            });

            for (_, chunk) in candidates {
                let placement = classify(zones, &chunk.range);
                for recipient in &recipients {
                    if recipient.id == donor.id || !shard_allowed(&placement, recipient) {
                        continue;
                    }
                    let unit = self.chunk_weight(chunk, sizes);
                    let donor_after = load_of(loads, &donor.id) - unit / donor.capacity_weight;
                    let recipient_after = load_of(loads, &recipient.id) + unit / recipient.capacity_weight;
                    if donor_after >= recipient_after {
                        return Some((chunk.clone(), recipient.id.clone()));
                    }
                }
            }
        }
        None
    }

    #[allow(clippy::too_many_arguments)]
    fn submit(
        &self,
        ns: &str,
        chunk: &Chunk,
        to: &str,
        reason: MoveReason,
        budget: &mut RoundBudget,
        report: &mut RoundReport,
        loads: &mut HashMap<ShardId, f64>,
        sizes: &HashMap<ChunkId, u64>,
        shards: &HashMap<&str, &ShardRecord>,
    ) {
        // Both shards sit out the rest of the round whatever happens
        budget.busy.insert(chunk.shard.clone());
        budget.busy.insert(to.to_string());

        match self.migrations.propose(ns, chunk.id, to) {
            Ok(ticket) => {
                let _handle = self.migrations.submit(ticket);
                budget.remaining -= 1;
                let unit = self.chunk_weight(chunk, sizes);
                if let Some(from) = shards.get(chunk.shard.as_str()) {
                    *loads.entry(chunk.shard.clone()).or_default() -= unit / from.capacity_weight;
                }
                if let Some(recipient) = shards.get(to) {
                    *loads.entry(to.to_string()).or_default() += unit / recipient.capacity_weight;
                }
                report.submitted.push(PlannedMove {
                    namespace: ns.to_string(),
                    chunk_id: chunk.id,
                    from: chunk.shard.clone(),
                    to: to.to_string(),
                    reason,
                });
            }
            Err(Error::MigrationInProgress(_)) => {}
            Err(e) => tracing::warn!("Could not propose chunk {} of {}: {}", chunk.id, ns, e),
        }
    }

    /// Estimated bytes of every chunk held by a live shard
    fn chunk_sizes(
        &self,
        ns: &str,
        snapshot: &ChunkMapSnapshot,
        shards: &HashMap<&str, &ShardRecord>,
    ) -> HashMap<ChunkId, u64> {
        let mut sizes = HashMap::with_capacity(snapshot.chunks.len());
        for chunk in &snapshot.chunks {
            if !shards.contains_key(chunk.shard.as_str()) {
                continue;
            }
            let bytes = self
                .pool
                .get(&chunk.shard)
                .and_then(|b| b.range_stats(ns, &chunk.range))
                .map(|s| s.bytes)
                .unwrap_or(u64::MAX);
            sizes.insert(chunk.id, bytes);
        }
        sizes
    }

    fn chunk_weight(&self, chunk: &Chunk, sizes: &HashMap<ChunkId, u64>) -> f64 {
        if self.config.weigh_by_bytes {
            sizes.get(&chunk.id).copied().unwrap_or(0) as f64
        } else {
            1.0
        }
    }

    /// Load per live shard: chunk count (or bytes) over capacity weight
    fn loads(
        &self,
        snapshot: &ChunkMapSnapshot,
        shards: &[ShardRecord],
        sizes: &HashMap<ChunkId, u64>,
    ) -> HashMap<ShardId, f64> {
        let mut loads: HashMap<ShardId, f64> = shards.iter().map(|s| (s.id.clone(), 0.0)).collect();
        for shard in shards {
            let total: f64 = snapshot
                .chunks_on(&shard.id)
                .map(|c| self.chunk_weight(c, sizes))
                .sum();
            loads.insert(shard.id.clone(), total / shard.capacity_weight);
        }
        loads
    }

    /// Background loop; runs until `shutdown` flips to true
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = self.config.round_interval();
        tracing::info!("Balancer started (round every {:?})", interval);
        loop {
            let jitter_ms = rand::thread_rng().gen_range(0..=self.config.round_interval_ms / 10);
            tokio::select! {
                _ = tokio::time::sleep(interval + Duration::from_millis(jitter_ms)) => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }
            match self.run_round() {
                Ok(report) => tracing::debug!("Balancer round {} finished: {:?}", report.round, report.outcome),
                Err(e) => tracing::warn!("Balancer round failed: {}", e),
            }
        }
        if let Err(e) = self.store.release_lease(LEASE_NAME, &self.node_id) {
            tracing::warn!("Failed to release balancer lease: {}", e);
        }
        tracing::info!("Balancer stopped");
    }
}

fn load_of(loads: &HashMap<ShardId, f64>, shard: &str) -> f64 {
    loads.get(shard).copied().unwrap_or(0.0)
}

/// `max - min` load over active shards
fn imbalance(loads: &HashMap<ShardId, f64>, shards: &[ShardRecord]) -> f64 {
    let active: Vec<f64> = shards
        .iter()
        .filter(|s| s.is_active())
        .map(|s| load_of(loads, &s.id))
        .collect();
    let max = active.iter().copied().fold(f64::MIN, f64::max);
    let min = active.iter().copied().fold(f64::MAX, f64::min);
    if active.is_empty() {
        0.0
    } else {
        max - min
    }
}

fn record_outcomes(finished: &[MigrationOutcome], report: &mut RoundReport) {
    for outcome in finished {
        let ticket = &outcome.ticket;
        if outcome.committed() {
            report.committed.push(ChunkRef {
                namespace: ticket.namespace.clone(),
                chunk_id: ticket.chunk_id,
            });
        } else {
            report.aborted.push(AbortedMove {
                namespace: ticket.namespace.clone(),
                chunk_id: ticket.chunk_id,
                error: outcome.error.clone().unwrap_or_default(),
            });
        }
    }
}

/// Drop health entries of chunks retired by splits and merges
fn prune_retired(state: &mut BalancerState, live: &HashMap<String, HashSet<ChunkId>>) {
    state.health.retain(|ns, chunks| {
        match live.get(ns) {
            Some(ids) => chunks.retain(|id, _| ids.contains(id)),
            None => chunks.clear(),
        }
        !chunks.is_empty()
    });
}

fn flagged(state: &BalancerState) -> Vec<ChunkRef> {
    state
        .health
        .iter()
        .flat_map(|(ns, chunks)| {
            chunks
                .iter()
                .filter(|(_, h)| h.needs_attention)
                .map(move |(id, _)| ChunkRef {
                    namespace: ns.clone(),
                    chunk_id: *id,
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_window_contains() {
        let day = BalancerWindow {
            start: t(9, 0),
            stop: t(17, 0),
        };
        assert!(day.contains(t(9, 0)));
        assert!(day.contains(t(12, 30)));
        assert!(!day.contains(t(17, 0)));
        assert!(!day.contains(t(3, 0)));

        let night = BalancerWindow {
            start: t(22, 0),
            stop: t(4, 0),
        };
        assert!(night.contains(t(23, 0)));
        assert!(night.contains(t(1, 0)));
        assert!(!night.contains(t(12, 0)));
    }

    #[test]
    fn test_imbalance() {
        let shard = |id: &str, state| ShardRecord {
            id: id.to_string(),
            endpoint: format!("mem://{}", id),
            zone_tags: Default::default(),
            capacity_weight: 1.0,
            state,
            joined_at: 0,
        };
        use crate::coordinator::shards::ShardState;
        let shards = vec![
            shard("a", ShardState::Active),
            shard("b", ShardState::Active),
            shard("c", ShardState::Draining),
        ];
        let loads: HashMap<ShardId, f64> = [("a".to_string(), 7.0), ("b".to_string(), 2.0), ("c".to_string(), 40.0)]
            .into_iter()
            .collect();
        assert_eq!(imbalance(&loads, &shards), 5.0);
        assert_eq!(imbalance(&HashMap::new(), &[]), 0.0);
    }
}

//! Chunk migration
//!
//! A ticket moves one chunk from a donor to a recipient:
//!
//! `Proposed -> CloningData -> CatchingUpLog -> SteadyState -> CommitPending -> Committed | Aborted`
//!
//! The donor keeps serving the range until `SteadyState`, where writes to
//! exactly that range are frozen while the last captured writes are flushed
//! and both copies are compared by digest. Ownership flips only through
//! `ChunkMap::commit_migration`. Every failure before that point aborts
//! without touching the donor's data; a retry is always a new ticket.

use crate::common::keys::KeyRange;
use crate::common::{
    generate_ticket_id, timestamp_now, timestamp_now_millis, ChunkVersion, Error,
    MetricsRegistry, MigrationConfig, Result,
};
use crate::coordinator::chunk_map::{ChunkId, ChunkMap, ShardId};
use crate::coordinator::metadata::{MetadataStore, SPACE_LOCKS};
use crate::coordinator::shards::ShardPool;
use crate::shard::CaptureId;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Finished outcomes kept until the balancer harvests them
const MAX_UNHARVESTED: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MigrationState {
    Proposed,
    CloningData,
    CatchingUpLog,
    SteadyState,
    CommitPending,
    Committed,
    Aborted,
}

impl MigrationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MigrationState::Committed | MigrationState::Aborted)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationTicket {
    pub id: String,
    pub namespace: String,
    pub chunk_id: ChunkId,
    pub range: KeyRange,
    /// Version of the chunk when the ticket was planned; the commit is
    /// rejected if it changed
    pub chunk_version: ChunkVersion,
    pub from: ShardId,
    pub to: ShardId,
    pub state: MigrationState,
    pub created_at: u64,
    pub estimated_bytes: u64,
}

/// Final report of a ticket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationOutcome {
    pub ticket: MigrationTicket,
    pub error: Option<String>,
    /// Aborted on request rather than by a failure
    pub cancelled: bool,
    pub duration_ms: u64,
}

impl MigrationOutcome {
    pub fn committed(&self) -> bool {
        self.ticket.state == MigrationState::Committed
    }
}

/// Lock record guarding a chunk across coordinator instances
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MigrationLock {
    holder: String,
    acquired_at_ms: u64,
}

struct Slot {
    ticket: Option<MigrationTicket>,
    cancel: Arc<AtomicBool>,
}

/// What a running ticket has done to the shards, for cleanup on abort
#[derive(Default)]
struct Progress {
    capture: Option<CaptureId>,
    frozen: bool,
}

pub struct MigrationCoordinator {
    chunk_map: Arc<ChunkMap>,
    pool: Arc<ShardPool>,
    store: Arc<dyn MetadataStore>,
    config: MigrationConfig,
    metrics: Arc<MetricsRegistry>,
    /// Lock-record holder name (the coordinator's node id)
    holder: String,
    active: Mutex<HashMap<(String, ChunkId), Slot>>,
    finished: Mutex<VecDeque<MigrationOutcome>>,
    idle: Notify,
}

fn lock_key(ns: &str, chunk_id: ChunkId) -> String {
    format!("migration/{}/{}", ns, chunk_id)
}

impl MigrationCoordinator {
    pub fn new(
        chunk_map: Arc<ChunkMap>,
        pool: Arc<ShardPool>,
        store: Arc<dyn MetadataStore>,
        config: MigrationConfig,
        metrics: Arc<MetricsRegistry>,
        holder: &str,
    ) -> Self {
        Self {
            chunk_map,
            pool,
            store,
            config,
            metrics,
            holder: holder.to_string(),
            active: Mutex::new(HashMap::new()),
            finished: Mutex::new(VecDeque::new()),
            idle: Notify::new(),
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<(String, ChunkId), Slot>> {
        self.active.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Reserve `chunk_id` for a new ticket.
    ///
    /// Returns false if a ticket of this coordinator, or a live lock record
    /// of another one, already owns the chunk.
    pub fn try_acquire(&self, ns: &str, chunk_id: ChunkId) -> Result<bool> {
        let mut slots = self.slots();
        let key = (ns.to_string(), chunk_id);
        if slots.contains_key(&key) {
            return Ok(false);
        }

        let record_key = lock_key(ns, chunk_id);
        let now = timestamp_now_millis();
        let current = self.store.get(SPACE_LOCKS, &record_key)?;
        if let Some(bytes) = &current {
            let existing: MigrationLock = bincode::deserialize(bytes)?;
            if existing.acquired_at_ms + self.config.lock_ttl_ms > now {
                tracing::debug!(
                    "Chunk {} of {} locked by {}",
                    chunk_id,
                    ns,
                    existing.holder
                );
                return Ok(false);
            }
            tracing::warn!(
                "Taking over expired migration lock on chunk {} of {} from {}",
                chunk_id,
                ns,
                existing.holder
            );
        }
        let lock = bincode::serialize(&MigrationLock {
            holder: self.holder.clone(),
            acquired_at_ms: now,
        })?;
        if !self
            .store
            .compare_and_swap(SPACE_LOCKS, &record_key, current.as_deref(), Some(&lock))?
        {
            return Ok(false);
        }

        slots.insert(
            key,
            Slot {
                ticket: None,
                cancel: Arc::new(AtomicBool::new(false)),
            },
        );
        Ok(true)
    }

    /// Give up a reservation
    pub fn release(&self, ns: &str, chunk_id: ChunkId) {
        let removed = self.slots().remove(&(ns.to_string(), chunk_id));
        if removed.is_none() {
            return;
        }
        let record_key = lock_key(ns, chunk_id);
        let result = self.store.get(SPACE_LOCKS, &record_key).and_then(|current| {
            let Some(bytes) = current else {
                return Ok(());
            };
            let existing: MigrationLock = bincode::deserialize(&bytes)?;
            if existing.holder == self.holder {
                self.store
                    .compare_and_swap(SPACE_LOCKS, &record_key, Some(&bytes), None)?;
            }
            Ok(())
        });
        if let Err(e) = result {
            tracing::warn!("Failed to release migration lock {}: {}", record_key, e);
        }
        if self.active_count() == 0 {
            self.idle.notify_waiters();
        }
    }

    /// Plan a move of `chunk_id` to `to` and reserve the chunk
    pub fn propose(&self, ns: &str, chunk_id: ChunkId, to: &str) -> Result<MigrationTicket> {
        let snapshot = self.chunk_map.snapshot(ns)?;
        let chunk = snapshot
            .chunk(chunk_id)
            .ok_or(Error::ChunkNotFound(chunk_id))?
            .clone();
        if chunk.jumbo {
            return Err(Error::JumboChunk {
                namespace: ns.to_string(),
                chunk_id,
            });
        }
        if chunk.shard == to {
            return Err(Error::InvalidConfig(format!(
                "chunk {} already lives on {}",
                chunk_id, to
            )));
        }
        let donor = self.pool.get(&chunk.shard)?;
        self.pool.get(to)?;

        if !self.try_acquire(ns, chunk_id)? {
            return Err(Error::MigrationInProgress(chunk_id));
        }
        let stats = match donor.range_stats(ns, &chunk.range) {
            Ok(stats) => stats,
            Err(e) => {
                self.release(ns, chunk_id);
                return Err(e);
            }
        };

        let ticket = MigrationTicket {
            id: generate_ticket_id(),
            namespace: ns.to_string(),
            chunk_id,
            range: chunk.range.clone(),
            chunk_version: chunk.version,
            from: chunk.shard.clone(),
            to: to.to_string(),
            state: MigrationState::Proposed,
            created_at: timestamp_now(),
            estimated_bytes: stats.bytes,
        };
        if let Some(slot) = self.slots().get_mut(&(ns.to_string(), chunk_id)) {
            slot.ticket = Some(ticket.clone());
        }
        tracing::info!(
            "Proposed {}: chunk {} of {} {} -> {} (~{} bytes)",
            ticket.id,
            chunk_id,
            ns,
            ticket.from,
            ticket.to,
            ticket.estimated_bytes
        );
        Ok(ticket)
    }

    /// Run a proposed ticket in the background
    pub fn submit(self: &Arc<Self>, ticket: MigrationTicket) -> JoinHandle<MigrationOutcome> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run(ticket).await })
    }

    /// Propose and run to completion
    pub async fn migrate(&self, ns: &str, chunk_id: ChunkId, to: &str) -> Result<MigrationOutcome> {
        let ticket = self.propose(ns, chunk_id, to)?;
        Ok(self.run(ticket).await)
    }

    /// Drive a proposed ticket to a terminal state
    pub async fn run(&self, mut ticket: MigrationTicket) -> MigrationOutcome {
        let started = Instant::now();
        let cancel = self
            .slots()
            .get(&(ticket.namespace.clone(), ticket.chunk_id))
            .map(|slot| slot.cancel.clone())
            .unwrap_or_default();
        self.metrics.migrations_started.inc();
        self.metrics.active_migrations.inc();

        let mut progress = Progress::default();
        let error = match self.drive(&mut ticket, &cancel, &mut progress).await {
            Ok(()) => {
                self.set_state(&mut ticket, MigrationState::Committed);
                self.metrics.migrations_committed.inc();
                None
            }
            Err(e) => {
                tracing::warn!(
                    "Migration {} of chunk {} aborted in {:?}: {}",
                    ticket.id,
                    ticket.chunk_id,
                    ticket.state,
                    e
                );
                self.discard(&ticket, &progress);
                self.set_state(&mut ticket, MigrationState::Aborted);
                self.metrics.migrations_aborted.inc();
                Some(e.to_string())
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        self.metrics.migration_duration.observe_ms(duration_ms);
        self.metrics.active_migrations.dec();

        let outcome = MigrationOutcome {
            cancelled: error.is_some() && cancel.load(Ordering::SeqCst),
            ticket,
            error,
            duration_ms,
        };
        {
            let mut finished = self.finished.lock().unwrap_or_else(|p| p.into_inner());
            if finished.len() >= MAX_UNHARVESTED {
                finished.pop_front();
            }
            finished.push_back(outcome.clone());
        }
        self.release(&outcome.ticket.namespace, outcome.ticket.chunk_id);
        outcome
    }

    async fn drive(
        &self,
        ticket: &mut MigrationTicket,
        cancel: &AtomicBool,
        progress: &mut Progress,
    ) -> Result<()> {
        let donor = self.pool.get(&ticket.from)?;
        let recipient = self.pool.get(&ticket.to)?;
        let ns = ticket.namespace.clone();
        let range = ticket.range.clone();

        // Bulk copy while the donor keeps serving
        self.advance(ticket, MigrationState::CloningData, cancel)?;
        let deadline = Instant::now() + self.config.clone_timeout();
        let capture = donor.start_capture(&ns, &range)?;
        progress.capture = Some(capture);
        recipient.delete_range(&ns, &range)?;
        let documents = donor.snapshot_range(&ns, &range)?;
        recipient.install_documents(&ns, &documents)?;
        if Instant::now() > deadline {
            return Err(Error::Timeout(format!("cloning chunk {}", ticket.chunk_id)));
        }
        tracing::debug!("{} cloned {} document(s)", ticket.id, documents.len());
        tokio::task::yield_now().await;

        // Replay captured writes until the backlog is small
        self.advance(ticket, MigrationState::CatchingUpLog, cancel)?;
        let deadline = Instant::now() + self.config.catch_up_timeout();
        loop {
            let batch = donor.drain_capture(capture, usize::MAX)?;
            recipient.apply_log(&ns, &batch)?;
            if batch.len() <= self.config.max_catch_up_lag {
                break;
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "catching up chunk {} ({} writes behind)",
                    ticket.chunk_id,
                    batch.len()
                )));
            }
            if cancel.load(Ordering::SeqCst) {
                return Err(Error::MigrationAborted("cancelled".into()));
            }
            tokio::time::sleep(self.config.catch_up_pause()).await;
        }

        // Freeze the range and flush the tail
        self.advance(ticket, MigrationState::SteadyState, cancel)?;
        donor.freeze_range(&ns, &range)?;
        progress.frozen = true;
        let tail = donor.drain_capture(capture, usize::MAX)?;
        recipient.apply_log(&ns, &tail)?;
        let expected = donor.range_digest(&ns, &range)?;
        let actual = recipient.range_digest(&ns, &range)?;
        if expected != actual {
            return Err(Error::MigrationAborted(format!(
                "digest mismatch for chunk {}: donor {} recipient {}",
                ticket.chunk_id, expected, actual
            )));
        }

        // Last point where cancellation is honoured
        self.advance(ticket, MigrationState::CommitPending, cancel)?;
        let snapshot = self.chunk_map.commit_migration(
            &ns,
            ticket.chunk_id,
            &ticket.from,
            &ticket.to,
            ticket.chunk_version,
        )?;

        // Committed: the rest is cleanup on shards that may lag behind
        if let Err(e) = recipient.install_routing(&snapshot) {
            tracing::warn!("{}: routing push to {} failed: {}", ticket.id, ticket.to, e);
        }
        match donor.install_routing(&snapshot) {
            Ok(()) => {
                let removed = donor
                    .unfreeze_range(&ns, &range)
                    .and_then(|_| donor.delete_range(&ns, &range));
                match removed {
                    Ok(n) => tracing::debug!("{} removed {} document(s) from donor", ticket.id, n),
                    Err(e) => tracing::warn!("{}: donor cleanup failed: {}", ticket.id, e),
                }
            }
            // The range stays frozen on a donor that does not know it lost it
            Err(e) => tracing::warn!("{}: routing push to {} failed: {}", ticket.id, ticket.from, e),
        }
        if let Err(e) = donor.end_capture(capture) {
            tracing::debug!("{}: end capture failed: {}", ticket.id, e);
        }
        Ok(())
    }

    /// Enter `next`, unless the ticket was cancelled first. The check and
    /// the state change happen under the slots lock `cancel` takes.
    fn advance(
        &self,
        ticket: &mut MigrationTicket,
        next: MigrationState,
        cancel: &AtomicBool,
    ) -> Result<()> {
        let mut slots = self.slots();
        if next <= MigrationState::CommitPending && cancel.load(Ordering::SeqCst) {
            return Err(Error::MigrationAborted(format!(
                "cancelled before {:?}",
                next
            )));
        }
        tracing::debug!("{}: {:?} -> {:?}", ticket.id, ticket.state, next);
        ticket.state = next;
        if let Some(slot) = slots.get_mut(&(ticket.namespace.clone(), ticket.chunk_id)) {
            slot.ticket = Some(ticket.clone());
        }
        Ok(())
    }

    fn set_state(&self, ticket: &mut MigrationTicket, state: MigrationState) {
        tracing::debug!("{}: {:?} -> {:?}", ticket.id, ticket.state, state);
        ticket.state = state;
        if let Some(slot) = self
            .slots()
            .get_mut(&(ticket.namespace.clone(), ticket.chunk_id))
        {
            slot.ticket = Some(ticket.clone());
        }
    }

    /// Undo an aborted ticket's effects: the recipient's copy goes, the
    /// donor resumes writes
    fn discard(&self, ticket: &MigrationTicket, progress: &Progress) {
        let ns = &ticket.namespace;
        let range = &ticket.range;
        if let Ok(donor) = self.pool.get(&ticket.from) {
            if let Some(capture) = progress.capture {
                if let Err(e) = donor.end_capture(capture) {
                    tracing::warn!("{}: end capture on {} failed: {}", ticket.id, ticket.from, e);
                }
            }
            if progress.frozen {
                if let Err(e) = donor.unfreeze_range(ns, range) {
                    tracing::warn!("{}: unfreeze on {} failed: {}", ticket.id, ticket.from, e);
                }
            }
        }
        if let Ok(recipient) = self.pool.get(&ticket.to) {
            if let Err(e) = recipient.delete_range(ns, range) {
                tracing::warn!("{}: discarding copy on {} failed: {}", ticket.id, ticket.to, e);
            }
        }
    }

    /// Request cancellation; refused once the ticket reached `CommitPending`
    pub fn cancel(&self, ns: &str, chunk_id: ChunkId) -> bool {
        match self.slots().get(&(ns.to_string(), chunk_id)) {
            Some(slot) => {
                let state = slot
                    .ticket
                    .as_ref()
                    .map_or(MigrationState::Proposed, |t| t.state);
                if state >= MigrationState::CommitPending {
                    return false;
                }
                slot.cancel.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Cancel every ticket that has not reached `SteadyState`; returns how many
    pub fn cancel_before_steady_state(&self) -> usize {
        let slots = self.slots();
        let mut cancelled = 0;
        for slot in slots.values() {
            let state = slot
                .ticket
                .as_ref()
                .map_or(MigrationState::Proposed, |t| t.state);
            if state < MigrationState::SteadyState && !slot.cancel.swap(true, Ordering::SeqCst) {
                cancelled += 1;
            }
        }
        cancelled
    }

    pub fn is_active(&self, ns: &str, chunk_id: ChunkId) -> bool {
        self.slots().contains_key(&(ns.to_string(), chunk_id))
    }

    pub fn active_count(&self) -> usize {
        self.slots().len()
    }

    /// Tickets currently running, sorted by id
    pub fn active_tickets(&self) -> Vec<MigrationTicket> {
        let mut tickets: Vec<MigrationTicket> = self
            .slots()
            .values()
            .filter_map(|slot| slot.ticket.clone())
            .collect();
        tickets.sort_by(|a, b| a.id.cmp(&b.id));
        tickets
    }

    /// Outcomes finished since the last call
    pub fn take_finished(&self) -> Vec<MigrationOutcome> {
        self.finished
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
            .collect()
    }

    /// Wait until no ticket is active
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.active_count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::keys::{KeyPart, ShardKey, ShardKeySpec};
    use crate::common::{Operation, Predicate};
    use crate::coordinator::chunk_map::InitialChunks;
    use crate::coordinator::metadata::MemoryMetadataStore;
    use crate::shard::MemoryShard;
    use serde_json::json;

    struct Fixture {
        chunk_map: Arc<ChunkMap>,
        coordinator: Arc<MigrationCoordinator>,
        donor: Arc<MemoryShard>,
        recipient: Arc<MemoryShard>,
    }

    fn fixture() -> Fixture {
        let store: Arc<dyn MetadataStore> = Arc::new(MemoryMetadataStore::new());
        let chunk_map = Arc::new(ChunkMap::new(store.clone()));
        let pool = Arc::new(ShardPool::new());
        let donor = Arc::new(MemoryShard::new("mem://a"));
        let recipient = Arc::new(MemoryShard::new("mem://b"));
        donor.join("shard-a").unwrap();
        recipient.join("shard-b").unwrap();
        pool.insert("shard-a", donor.clone());
        pool.insert("shard-b", recipient.clone());

        let snap = chunk_map
            .initialize(
                "app.items",
                ShardKeySpec::ranged(&["n"]).unwrap(),
                InitialChunks::SplitPoints(vec![ShardKey(vec![KeyPart::Int(50)])]),
                "shard-a",
            )
            .unwrap();
        donor.install_routing(&snap).unwrap();
        recipient.install_routing(&snap).unwrap();
        let v = snap.shard_version("shard-a");
        for n in 0..100 {
            donor
                .execute(&Operation::insert("app.items", json!({"n": n})), v)
                .unwrap();
        }

        let coordinator = Arc::new(MigrationCoordinator::new(
            chunk_map.clone(),
            pool,
            store,
            MigrationConfig::default(),
            Arc::new(MetricsRegistry::new()),
            "coord-test",
        ));
        Fixture {
            chunk_map,
            coordinator,
            donor,
            recipient,
        }
    }

    #[tokio::test]
    async fn test_migration_commits_and_moves_data() {
        let f = fixture();
        let outcome = f.coordinator.migrate("app.items", 1, "shard-b").await.unwrap();
        assert!(outcome.committed(), "{:?}", outcome.error);

        let snap = f.chunk_map.snapshot("app.items").unwrap();
        assert_eq!(snap.chunk(1).unwrap().shard, "shard-b");
        assert_eq!(f.donor.document_count("app.items"), 50);
        assert_eq!(f.recipient.document_count("app.items"), 50);
        assert_eq!(f.coordinator.active_count(), 0);

        // Recipient serves the moved range at the new version
        let v = snap.shard_version("shard-b");
        let found = f
            .recipient
            .execute(&Operation::find("app.items", Predicate::all()), v)
            .unwrap();
        assert_eq!(found.documents.len(), 50);
    }

    #[tokio::test]
    async fn test_failed_clone_aborts_without_touching_donor() {
        let f = fixture();
        let before = f.donor.all_documents("app.items");
        f.recipient.fail_next_installs(1);

        let outcome = f.coordinator.migrate("app.items", 1, "shard-b").await.unwrap();
        assert_eq!(outcome.ticket.state, MigrationState::Aborted);
        assert!(outcome.error.is_some());

        assert_eq!(f.donor.all_documents("app.items"), before);
        assert_eq!(f.recipient.document_count("app.items"), 0);
        let snap = f.chunk_map.snapshot("app.items").unwrap();
        assert_eq!(snap.chunk(1).unwrap().shard, "shard-a");
        // The chunk is free for a fresh ticket
        assert!(f.coordinator.try_acquire("app.items", 1).unwrap());
    }

    #[tokio::test]
    async fn test_one_ticket_per_chunk() {
        let f = fixture();
        let ticket = f.coordinator.propose("app.items", 1, "shard-b").unwrap();
        assert!(matches!(
            f.coordinator.propose("app.items", 1, "shard-b"),
            Err(Error::MigrationInProgress(1))
        ));
        assert!(!f.coordinator.try_acquire("app.items", 1).unwrap());

        f.coordinator.run(ticket).await;
        assert!(!f.coordinator.is_active("app.items", 1));
    }

    #[tokio::test]
    async fn test_lock_record_blocks_second_coordinator() {
        let f = fixture();
        assert!(f.coordinator.try_acquire("app.items", 2).unwrap());

        let other = MigrationCoordinator::new(
            f.chunk_map.clone(),
            Arc::new(ShardPool::new()),
            f.coordinator.store.clone(),
            MigrationConfig::default(),
            Arc::new(MetricsRegistry::new()),
            "coord-other",
        );
        assert!(!other.try_acquire("app.items", 2).unwrap());
        f.coordinator.release("app.items", 2);
        assert!(other.try_acquire("app.items", 2).unwrap());
    }

    #[tokio::test]
    async fn test_cancelled_ticket_aborts() {
        let f = fixture();
        let ticket = f.coordinator.propose("app.items", 1, "shard-b").unwrap();
        assert_eq!(f.coordinator.cancel_before_steady_state(), 1);

        let outcome = f.coordinator.run(ticket).await;
        assert_eq!(outcome.ticket.state, MigrationState::Aborted);
        assert!(outcome.cancelled);
        let snap = f.chunk_map.snapshot("app.items").unwrap();
        assert_eq!(snap.chunk(1).unwrap().shard, "shard-a");
    }

    #[tokio::test]
    async fn test_stale_commit_aborts() {
        let f = fixture();
        let ticket = f.coordinator.propose("app.items", 1, "shard-b").unwrap();
        // The chunk is split after the ticket was planned
        f.chunk_map
            .split("app.items", 1, &[ShardKey(vec![KeyPart::Int(10)])])
            .unwrap();

        let outcome = f.coordinator.run(ticket).await;
        assert_eq!(outcome.ticket.state, MigrationState::Aborted);
        assert!(outcome.error.unwrap().contains("Stale version"));
        assert_eq!(f.recipient.document_count("app.items"), 0);
        assert_eq!(f.donor.document_count("app.items"), 100);
    }

    #[tokio::test]
    async fn test_outcomes_are_harvested_once() {
        let f = fixture();
        let ticket = f.coordinator.propose("app.items", 2, "shard-b").unwrap();
        let handle = f.coordinator.submit(ticket);
        let outcome = handle.await.unwrap();
        assert!(outcome.committed());
        f.coordinator.wait_idle().await;

        let harvested = f.coordinator.take_finished();
        assert_eq!(harvested.len(), 1);
        assert!(f.coordinator.take_finished().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_is_refused_once_commit_pending() {
        let f = fixture();
        let mut ticket = f.coordinator.propose("app.items", 1, "shard-b").unwrap();
        let flag = f.coordinator.slots()[&("app.items".to_string(), 1)].cancel.clone();

        f.coordinator
            .advance(&mut ticket, MigrationState::CommitPending, &flag)
            .unwrap();
        assert!(!f.coordinator.cancel("app.items", 1));
        assert!(!flag.load(Ordering::SeqCst));

        let mut other = f.coordinator.propose("app.items", 2, "shard-b").unwrap();
        let flag = f.coordinator.slots()[&("app.items".to_string(), 2)].cancel.clone();
        assert!(f.coordinator.cancel("app.items", 2));
        assert!(f
            .coordinator
            .advance(&mut other, MigrationState::CommitPending, &flag)
            .is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_granted_cancel_never_commits() {
        for _ in 0..50 {
            let f = fixture();
            let ticket = f.coordinator.propose("app.items", 1, "shard-b").unwrap();
            let coordinator = f.coordinator.clone();
            let canceller = std::thread::spawn(move || loop {
                if coordinator.cancel("app.items", 1) {
                    return true;
                }
                if !coordinator.is_active("app.items", 1) {
                    return false;
                }
                std::hint::spin_loop();
            });
            let outcome = f.coordinator.submit(ticket).await.unwrap();
            let granted = canceller.join().unwrap();
            if granted {
                assert!(!outcome.committed(), "cancel granted but ticket committed");
            }
        }
    }
}

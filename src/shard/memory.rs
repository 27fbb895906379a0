//! In-memory shard backend
//!
//! Documents live in per-namespace ordered maps keyed by encoded shard key,
//! so range scans, snapshots and digests walk keys in order. Every method
//! first checks the reachability switch, which tests flip to simulate an
//! unavailable shard.

use crate::common::hash::RangeDigest;
use crate::common::keys::{KeyRange, ShardKey, ShardKeySpec};
use crate::common::{ChunkVersion, Error, OpResult, Operation, OperationKind, Predicate, Result};
use crate::coordinator::chunk_map::ChunkMapSnapshot;
use crate::shard::{
    CaptureId, LogEntry, LogOp, RangeStats, ShardBackend, ShardConnector, StoredDocument,
};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

type Documents = BTreeMap<ShardKey, BTreeMap<String, Value>>;

/// What this shard believes about one namespace
struct Routing {
    key_spec: ShardKeySpec,
    map_version: ChunkVersion,
    shard_version: ChunkVersion,
    owned: Vec<KeyRange>,
}

impl Routing {
    fn owns(&self, key: &ShardKey) -> bool {
        let idx = self.owned.partition_point(|r| r.max <= *key);
        self.owned.get(idx).map_or(false, |r| r.contains(key))
    }
}

struct Capture {
    namespace: String,
    range: KeyRange,
    entries: VecDeque<LogEntry>,
}

#[derive(Default)]
struct State {
    shard_id: Option<String>,
    collections: HashMap<String, Documents>,
    routing: HashMap<String, Routing>,
    captures: HashMap<CaptureId, Capture>,
    frozen: HashMap<String, Vec<KeyRange>>,
    next_capture: CaptureId,
    next_seq: u64,
}

impl State {
    fn is_frozen(&self, ns: &str, key: &ShardKey) -> bool {
        self.frozen
            .get(ns)
            .map_or(false, |ranges| ranges.iter().any(|r| r.contains(key)))
    }

    /// Append a write to every capture session covering `key`
    fn capture(&mut self, ns: &str, key: &ShardKey, id: &str, op: LogOp) {
        let mut seq = self.next_seq;
        for capture in self.captures.values_mut() {
            if capture.namespace == ns && capture.range.contains(key) {
                seq += 1;
                capture.entries.push_back(LogEntry {
                    seq,
                    key: key.clone(),
                    id: id.to_string(),
                    op: op.clone(),
                });
            }
        }
        self.next_seq = seq;
    }
}

/// Shard backed by process memory
pub struct MemoryShard {
    endpoint: String,
    state: Mutex<State>,
    reachable: AtomicBool,
    failing_installs: AtomicU32,
    failing_routing: AtomicU32,
}

impl MemoryShard {
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            state: Mutex::new(State::default()),
            reachable: AtomicBool::new(true),
            failing_installs: AtomicU32::new(0),
            failing_routing: AtomicU32::new(0),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn shard_id(&self) -> Option<String> {
        self.lock().shard_id.clone()
    }

    /// Simulate the shard going away or coming back
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Make the next `n` bulk installs fail (recipient-side clone failures)
    pub fn fail_next_installs(&self, n: u32) {
        self.failing_installs.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` routing pushes fail
    pub fn fail_next_routing_pushes(&self, n: u32) {
        self.failing_routing.store(n, Ordering::SeqCst);
    }

    /// Every stored document of `ns`, owned or not, in key order
    pub fn all_documents(&self, ns: &str) -> Vec<StoredDocument> {
        let state = self.lock();
        state
            .collections
            .get(ns)
            .map(|docs| flatten(docs.iter()))
            .unwrap_or_default()
    }

    pub fn document_count(&self, ns: &str) -> usize {
        self.lock()
            .collections
            .get(ns)
            .map_or(0, |docs| docs.values().map(|ids| ids.len()).sum())
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn check_reachable(&self) -> Result<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::ShardUnreachable(self.endpoint.clone()))
        }
    }

    fn name(&self, state: &State) -> String {
        state
            .shard_id
            .clone()
            .unwrap_or_else(|| self.endpoint.clone())
    }

    fn rejected(&self, state: &State, reason: impl Into<String>) -> Error {
        Error::ShardRejected {
            shard: self.name(state),
            reason: reason.into(),
        }
    }
}

fn flatten<'a>(
    entries: impl Iterator<Item = (&'a ShardKey, &'a BTreeMap<String, Value>)>,
) -> Vec<StoredDocument> {
    let mut out = Vec::new();
    for (key, ids) in entries {
        for (id, doc) in ids {
            out.push(StoredDocument {
                key: key.clone(),
                id: id.clone(),
                doc: doc.clone(),
            });
        }
    }
    out
}

fn in_range<'a>(
    docs: &'a Documents,
    range: &KeyRange,
) -> impl Iterator<Item = (&'a ShardKey, &'a BTreeMap<String, Value>)> {
    docs.range(range.min.clone()..range.max.clone())
}

/// `_id` of a document, generated if absent
fn document_id(doc: &mut Map<String, Value>) -> String {
    match doc.get("_id") {
        Some(Value::String(s)) => s.clone(),
        Some(other) if !other.is_null() => other.to_string(),
        _ => {
            let id = uuid::Uuid::new_v4().simple().to_string();
            doc.insert("_id".to_string(), Value::String(id.clone()));
            id
        }
    }
}

/// Matching documents of `ns` within the ranges this shard owns
fn matching(docs: &Documents, routing: &Routing, filter: &Predicate) -> Vec<(ShardKey, String)> {
    let mut out = Vec::new();
    for (key, ids) in docs {
        if !routing.owns(key) {
            continue;
        }
        for (id, doc) in ids {
            if filter.matches(doc) {
                out.push((key.clone(), id.clone()));
            }
        }
    }
    out
}

impl ShardBackend for MemoryShard {
    fn ping(&self) -> Result<()> {
        self.check_reachable()
    }

    fn join(&self, shard_id: &str) -> Result<()> {
        self.check_reachable()?;
        let mut state = self.lock();
        if let Some(existing) = state.shard_id.clone() {
            if existing != shard_id {
                return Err(self.rejected(&state, format!("already joined as {}", existing)));
            }
        }
        state.shard_id = Some(shard_id.to_string());
        Ok(())
    }

    fn install_routing(&self, snapshot: &ChunkMapSnapshot) -> Result<()> {
        self.check_reachable()?;
        let mut state = self.lock();
        let pending = self.failing_routing.load(Ordering::SeqCst);
        if pending > 0 {
            self.failing_routing.store(pending - 1, Ordering::SeqCst);
            return Err(self.rejected(&state, "routing push failed"));
        }
        let id = state
            .shard_id
            .clone()
            .ok_or_else(|| self.rejected(&state, "shard has not joined"))?;

        if let Some(current) = state.routing.get(&snapshot.namespace) {
            if current.map_version.same_epoch(&snapshot.version)
                && current.map_version > snapshot.version
            {
                return Ok(());
            }
        }
        let routing = Routing {
            key_spec: snapshot.key_spec.clone(),
            map_version: snapshot.version,
            shard_version: snapshot.shard_version(&id),
            owned: snapshot.owned_ranges(&id),
        };
        tracing::debug!(
            "{} installed routing for {} at {} ({} owned range(s))",
            id,
            snapshot.namespace,
            routing.shard_version,
            routing.owned.len()
        );
        state.routing.insert(snapshot.namespace.clone(), routing);
        Ok(())
    }

    fn execute(&self, op: &Operation, version: ChunkVersion) -> Result<OpResult> {
        self.check_reachable()?;
        let mut guard = self.lock();
        let state = &mut *guard;
        let ns = op.namespace.as_str();

        let have = state
            .routing
            .get(ns)
            .map_or(ChunkVersion::UNSHARDED, |r| r.shard_version);
        if have != version {
            return Err(Error::StaleVersion {
                namespace: ns.to_string(),
                wanted: version,
                have,
            });
        }
        let routing = match state.routing.get(ns) {
            Some(routing) => routing,
            None => return Err(self.rejected(state, format!("{} is not sharded here", ns))),
        };

        match &op.kind {
            OperationKind::Find(filter) => {
                let docs = state.collections.get(ns);
                let documents = docs
                    .map(|docs| {
                        matching(docs, routing, filter)
                            .into_iter()
                            .filter_map(|(key, id)| docs.get(&key)?.get(&id).cloned())
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(OpResult {
                    documents,
                    affected: 0,
                })
            }
            OperationKind::Insert(doc) => {
                let mut doc = match doc {
                    Value::Object(map) => map.clone(),
                    _ => return Err(self.rejected(state, "documents must be JSON objects")),
                };
                let key = routing.key_spec.extract(&Value::Object(doc.clone()))?;
                if !routing.owns(&key) {
                    return Err(self.rejected(state, format!("key {} is not owned here", key)));
                }
                if state.is_frozen(ns, &key) {
                    return Err(Error::RangeFrozen(self.name(state)));
                }
                let id = document_id(&mut doc);
                let doc = Value::Object(doc);
                state
                    .collections
                    .entry(ns.to_string())
                    .or_default()
                    .entry(key.clone())
                    .or_default()
                    .insert(id.clone(), doc.clone());
                state.capture(ns, &key, &id, LogOp::Upsert(doc));
                Ok(OpResult {
                    documents: Vec::new(),
                    affected: 1,
                })
            }
            OperationKind::Update { filter, set } => {
                for field in &routing.key_spec.fields {
                    let top = field.path.split('.').next().unwrap_or_default();
                    if set.contains_key(top) || set.contains_key(&field.path) {
                        return Err(self.rejected(
                            state,
                            format!("shard key field {} cannot be updated", field.path),
                        ));
                    }
                }
                let targets = match state.collections.get(ns) {
                    Some(docs) => matching(docs, routing, filter),
                    None => Vec::new(),
                };
                if targets.iter().any(|(key, _)| state.is_frozen(ns, key)) {
                    return Err(Error::RangeFrozen(self.name(state)));
                }
                let mut updated = Vec::with_capacity(targets.len());
                if let Some(docs) = state.collections.get_mut(ns) {
                    for (key, id) in &targets {
                        let stored = docs.get_mut(key).and_then(|ids| ids.get_mut(id));
                        if let Some(Value::Object(doc)) = stored {
                            for (field, value) in set {
                                doc.insert(field.clone(), value.clone());
                            }
                            updated.push((key.clone(), id.clone(), Value::Object(doc.clone())));
                        }
                    }
                }
                let affected = updated.len() as u64;
                for (key, id, doc) in updated {
                    state.capture(ns, &key, &id, LogOp::Upsert(doc));
                }
                Ok(OpResult {
                    documents: Vec::new(),
                    affected,
                })
            }
            OperationKind::Delete(filter) => {
                let targets = match state.collections.get(ns) {
                    Some(docs) => matching(docs, routing, filter),
                    None => Vec::new(),
                };
                if targets.iter().any(|(key, _)| state.is_frozen(ns, key)) {
                    return Err(Error::RangeFrozen(self.name(state)));
                }
                if let Some(docs) = state.collections.get_mut(ns) {
                    for (key, id) in &targets {
                        if let Some(ids) = docs.get_mut(key) {
                            ids.remove(id);
                            if ids.is_empty() {
                                docs.remove(key);
                            }
                        }
                    }
                }
                let affected = targets.len() as u64;
                for (key, id) in targets {
                    state.capture(ns, &key, &id, LogOp::Delete);
                }
                Ok(OpResult {
                    documents: Vec::new(),
                    affected,
                })
            }
        }
    }

    fn range_stats(&self, ns: &str, range: &KeyRange) -> Result<RangeStats> {
        self.check_reachable()?;
        let state = self.lock();
        let mut stats = RangeStats::default();
        if let Some(docs) = state.collections.get(ns) {
            for (_, ids) in in_range(docs, range) {
                for doc in ids.values() {
                    stats.documents += 1;
                    stats.bytes += serde_json::to_vec(doc)?.len() as u64;
                }
            }
        }
        Ok(stats)
    }

    fn split_point(&self, ns: &str, range: &KeyRange) -> Result<Option<ShardKey>> {
        self.check_reachable()?;
        let state = self.lock();
        let Some(docs) = state.collections.get(ns) else {
            return Ok(None);
        };
        let keys: Vec<(&ShardKey, usize)> = in_range(docs, range)
            .map(|(key, ids)| (key, ids.len()))
            .collect();
        if keys.len() < 2 {
            return Ok(None);
        }
        let total: usize = keys.iter().map(|(_, n)| n).sum();
        let mut below = keys[0].1;
        for (key, n) in &keys[1..] {
            if below * 2 >= total {
                return Ok(Some((*key).clone()));
            }
            below += n;
        }
        Ok(keys.last().map(|(key, _)| (*key).clone()))
    }

    fn start_capture(&self, ns: &str, range: &KeyRange) -> Result<CaptureId> {
        self.check_reachable()?;
        let mut state = self.lock();
        state.next_capture += 1;
        let id = state.next_capture;
        state.captures.insert(
            id,
            Capture {
                namespace: ns.to_string(),
                range: range.clone(),
                entries: VecDeque::new(),
            },
        );
        Ok(id)
    }

    fn drain_capture(&self, capture: CaptureId, max: usize) -> Result<Vec<LogEntry>> {
        self.check_reachable()?;
        let mut state = self.lock();
        if !state.captures.contains_key(&capture) {
            return Err(self.rejected(&state, format!("no capture session {}", capture)));
        }
        let entries = state
            .captures
            .get_mut(&capture)
            .map(|session| {
                let n = max.min(session.entries.len());
                session.entries.drain(..n).collect()
            })
            .unwrap_or_default();
        Ok(entries)
    }

    fn end_capture(&self, capture: CaptureId) -> Result<()> {
        self.check_reachable()?;
        self.lock().captures.remove(&capture);
        Ok(())
    }

    fn snapshot_range(&self, ns: &str, range: &KeyRange) -> Result<Vec<StoredDocument>> {
        self.check_reachable()?;
        let state = self.lock();
        Ok(state
            .collections
            .get(ns)
            .map(|docs| flatten(in_range(docs, range)))
            .unwrap_or_default())
    }

    fn install_documents(&self, ns: &str, docs: &[StoredDocument]) -> Result<()> {
        self.check_reachable()?;
        let mut state = self.lock();
        let pending = self.failing_installs.load(Ordering::SeqCst);
        if pending > 0 {
            self.failing_installs.store(pending - 1, Ordering::SeqCst);
            return Err(self.rejected(&state, "bulk install failed"));
        }
        let collection = state.collections.entry(ns.to_string()).or_default();
        for stored in docs {
            collection
                .entry(stored.key.clone())
                .or_default()
                .insert(stored.id.clone(), stored.doc.clone());
        }
        Ok(())
    }

    fn apply_log(&self, ns: &str, entries: &[LogEntry]) -> Result<()> {
        self.check_reachable()?;
        let mut state = self.lock();
        let collection = state.collections.entry(ns.to_string()).or_default();
        for entry in entries {
            match &entry.op {
                LogOp::Upsert(doc) => {
                    collection
                        .entry(entry.key.clone())
                        .or_default()
                        .insert(entry.id.clone(), doc.clone());
                }
                LogOp::Delete => {
                    if let Some(ids) = collection.get_mut(&entry.key) {
                        ids.remove(&entry.id);
                        if ids.is_empty() {
                            collection.remove(&entry.key);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn freeze_range(&self, ns: &str, range: &KeyRange) -> Result<()> {
        self.check_reachable()?;
        let mut state = self.lock();
        let frozen = state.frozen.entry(ns.to_string()).or_default();
        if !frozen.contains(range) {
            frozen.push(range.clone());
        }
        Ok(())
    }

    fn unfreeze_range(&self, ns: &str, range: &KeyRange) -> Result<()> {
        self.check_reachable()?;
        let mut state = self.lock();
        if let Some(frozen) = state.frozen.get_mut(ns) {
            frozen.retain(|r| r != range);
        }
        Ok(())
    }

    fn range_digest(&self, ns: &str, range: &KeyRange) -> Result<String> {
        self.check_reachable()?;
        let state = self.lock();
        let mut digest = RangeDigest::new();
        if let Some(docs) = state.collections.get(ns) {
            for (key, ids) in in_range(docs, range) {
                let key = key.to_string();
                for (id, doc) in ids {
                    digest.add_document(&key, id, &serde_json::to_vec(doc)?);
                }
            }
        }
        Ok(digest.finish())
    }

    fn delete_range(&self, ns: &str, range: &KeyRange) -> Result<u64> {
        self.check_reachable()?;
        let mut state = self.lock();
        let Some(docs) = state.collections.get_mut(ns) else {
            return Ok(0);
        };
        let keys: Vec<ShardKey> = in_range(docs, range).map(|(k, _)| k.clone()).collect();
        let mut removed = 0u64;
        for key in keys {
            if let Some(ids) = docs.remove(&key) {
                removed += ids.len() as u64;
            }
        }
        Ok(removed)
    }
}

/// Hands out [`MemoryShard`]s by endpoint, creating them on first use
#[derive(Default)]
pub struct MemoryConnector {
    shards: Mutex<HashMap<String, Arc<MemoryShard>>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// The concrete shard behind `endpoint`, if one was created
    pub fn shard(&self, endpoint: &str) -> Option<Arc<MemoryShard>> {
        self.shards
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(endpoint)
            .cloned()
    }

    fn open(&self, endpoint: &str) -> Arc<MemoryShard> {
        self.shards
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(endpoint.to_string())
            .or_insert_with(|| Arc::new(MemoryShard::new(endpoint)))
            .clone()
    }
}

impl ShardConnector for MemoryConnector {
    fn connect(&self, endpoint: &str) -> Result<Arc<dyn ShardBackend>> {
        if endpoint.trim().is_empty() {
            return Err(Error::InvalidConfig("shard endpoint must not be empty".into()));
        }
        Ok(self.open(endpoint))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::keys::KeyPart;
    use crate::coordinator::chunk_map::{ChunkMap, InitialChunks};
    use crate::coordinator::metadata::MemoryMetadataStore;
    use serde_json::json;

    fn k(i: i64) -> ShardKey {
        ShardKey(vec![KeyPart::Int(i)])
    }

    /// One shard owning every chunk of `app.items` keyed on `n`
    fn seeded() -> (MemoryShard, Arc<ChunkMapSnapshot>) {
        let map = ChunkMap::new(Arc::new(MemoryMetadataStore::new()));
        let snap = map
            .initialize(
                "app.items",
                ShardKeySpec::ranged(&["n"]).unwrap(),
                InitialChunks::SplitPoints(vec![k(100)]),
                "shard-0",
            )
            .unwrap();
        let shard = MemoryShard::new("mem://0");
        shard.join("shard-0").unwrap();
        shard.install_routing(&snap).unwrap();
        (shard, snap)
    }

    fn insert(shard: &MemoryShard, version: ChunkVersion, n: i64) -> Result<OpResult> {
        shard.execute(
            &Operation::insert("app.items", json!({"n": n, "v": n * 10})),
            version,
        )
    }

    #[test]
    fn test_insert_find_and_version_check() {
        let (shard, snap) = seeded();
        let v = snap.shard_version("shard-0");
        for n in 0..10 {
            insert(&shard, v, n).unwrap();
        }
        let found = shard
            .execute(&Operation::find("app.items", Predicate::all().eq("n", json!(3))), v)
            .unwrap();
        assert_eq!(found.documents.len(), 1);
        assert_eq!(found.documents[0]["v"], json!(30));
        assert!(found.documents[0]["_id"].is_string());

        let stale = ChunkVersion::new(v.epoch, v.counter - 1);
        assert!(matches!(
            insert(&shard, stale, 1),
            Err(Error::StaleVersion { .. })
        ));
    }

    #[test]
    fn test_capture_records_writes_in_range() {
        let (shard, snap) = seeded();
        let v = snap.shard_version("shard-0");
        let range = KeyRange::new(k(0), k(5)).unwrap();
        let capture = shard.start_capture("app.items", &range).unwrap();

        insert(&shard, v, 1).unwrap();
        insert(&shard, v, 7).unwrap();
        shard
            .execute(
                &Operation::delete("app.items", Predicate::all().eq("n", json!(1))),
                v,
            )
            .unwrap();

        let log = shard.drain_capture(capture, 100).unwrap();
        assert_eq!(log.len(), 2);
        assert!(matches!(log[0].op, LogOp::Upsert(_)));
        assert!(matches!(log[1].op, LogOp::Delete));
        assert!(log[0].seq < log[1].seq);
        shard.end_capture(capture).unwrap();
    }

    #[test]
    fn test_frozen_range_rejects_writes_only() {
        let (shard, snap) = seeded();
        let v = snap.shard_version("shard-0");
        insert(&shard, v, 2).unwrap();
        let range = KeyRange::new(k(0), k(5)).unwrap();
        shard.freeze_range("app.items", &range).unwrap();

        assert!(matches!(insert(&shard, v, 3), Err(Error::RangeFrozen(_))));
        assert!(insert(&shard, v, 50).is_ok());
        let read = shard
            .execute(&Operation::find("app.items", Predicate::all()), v)
            .unwrap();
        assert_eq!(read.documents.len(), 2);

        shard.unfreeze_range("app.items", &range).unwrap();
        assert!(insert(&shard, v, 3).is_ok());
    }

    #[test]
    fn test_split_point_and_jumbo() {
        let (shard, snap) = seeded();
        let v = snap.shard_version("shard-0");
        let range = KeyRange::new(k(0), k(100)).unwrap();
        for _ in 0..5 {
            insert(&shard, v, 7).unwrap();
        }
        assert_eq!(shard.split_point("app.items", &range).unwrap(), None);

        for n in 20..25 {
            insert(&shard, v, n).unwrap();
        }
        let point = shard.split_point("app.items", &range).unwrap().unwrap();
        assert!(point > k(7) && point < k(100));
    }

    #[test]
    fn test_snapshot_install_digest() {
        let (donor, snap) = seeded();
        let v = snap.shard_version("shard-0");
        for n in 0..20 {
            insert(&donor, v, n).unwrap();
        }
        let range = KeyRange::new(k(5), k(15)).unwrap();
        let docs = donor.snapshot_range("app.items", &range).unwrap();
        assert_eq!(docs.len(), 10);

        let recipient = MemoryShard::new("mem://1");
        recipient.join("shard-1").unwrap();
        recipient.install_documents("app.items", &docs).unwrap();
        assert_eq!(
            donor.range_digest("app.items", &range).unwrap(),
            recipient.range_digest("app.items", &range).unwrap()
        );

        assert_eq!(donor.delete_range("app.items", &range).unwrap(), 10);
        assert_eq!(donor.document_count("app.items"), 10);
    }

    #[test]
    fn test_unreachable_and_failing_installs() {
        let shard = MemoryShard::new("mem://x");
        shard.set_reachable(false);
        assert!(matches!(shard.ping(), Err(Error::ShardUnreachable(_))));
        shard.set_reachable(true);
        assert!(shard.ping().is_ok());

        shard.fail_next_installs(1);
        assert!(shard.install_documents("app.items", &[]).is_err());
        assert!(shard.install_documents("app.items", &[]).is_ok());
    }

    #[test]
    fn test_failing_routing_push() {
        let (shard, snap) = seeded();
        shard.fail_next_routing_pushes(1);
        assert!(shard.install_routing(&snap).is_err());
        assert!(shard.install_routing(&snap).is_ok());
    }

    #[test]
    fn test_update_cannot_touch_shard_key() {
        let (shard, snap) = seeded();
        let v = snap.shard_version("shard-0");
        insert(&shard, v, 1).unwrap();
        let mut set = Map::new();
        set.insert("n".into(), json!(99));
        let err = shard
            .execute(&Operation::update("app.items", Predicate::all(), set), v)
            .unwrap_err();
        assert!(matches!(err, Error::ShardRejected { .. }));
    }
}

//! Operation router
//!
//! Routing is a pure function of an operation and a chunk map snapshot:
//! the shard-key predicate is turned into a point, a key interval, or
//! nothing, and the snapshot's ordered chunk list is binary-searched for the
//! owners. [`Router`] adds the dispatch side: it caches snapshots, sends the
//! operation with each shard's expected version, merges results and retries
//! once after a stale-version rejection.

use crate::common::keys::{KeyMode, KeyPart, ShardKey, ShardKeySpec};
use crate::common::query::{FieldPredicate, Predicate};
use crate::common::{
    ChunkVersion, Error, MetricsRegistry, OpResult, Operation, OperationKind, Result, RoutingMode,
};
use crate::coordinator::chunk_map::{ChunkMap, ChunkMapSnapshot, ShardId};
use crate::coordinator::shards::ShardPool;
use std::collections::{BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::{Arc, RwLock};

/// Keys an operation can touch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyTarget {
    /// Full equality on the shard key
    Point(ShardKey),
    /// Every key in `[lo, hi]`, or `[lo, hi)` when `hi_inclusive` is false
    Interval {
        lo: ShardKey,
        hi: ShardKey,
        hi_inclusive: bool,
    },
    /// Unconstrained
    Everything,
}

/// Where an operation goes under one snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePlan {
    pub mode: RoutingMode,
    pub shards: Vec<ShardId>,
    pub version: ChunkVersion,
}

/// Result of a dispatched operation
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatched {
    pub mode: RoutingMode,
    pub shards: Vec<ShardId>,
    pub result: OpResult,
    /// Whether a stale-version rejection forced a refresh and retry
    pub retried: bool,
}

fn encode_bound(spec: &ShardKeySpec, idx: usize, bound: &Bound<serde_json::Value>) -> Result<Option<KeyPart>> {
    match bound {
        Bound::Unbounded => Ok(None),
        Bound::Included(v) | Bound::Excluded(v) => spec.encode_field(idx, v).map(Some),
    }
}

fn padded(mut prefix: Vec<KeyPart>, width: usize, fill: KeyPart) -> ShardKey {
    prefix.resize(width, fill);
    ShardKey(prefix)
}

/// Reduce a predicate to the key interval it can match
pub fn key_target(spec: &ShardKeySpec, filter: &Predicate) -> Result<KeyTarget> {
    let width = spec.width();
    let mut prefix: Vec<KeyPart> = Vec::with_capacity(width);

    for (idx, field) in spec.fields.iter().enumerate() {
        match filter.get(&field.path) {
            Some(FieldPredicate::Eq(value)) => prefix.push(spec.encode_field(idx, value)?),
            Some(FieldPredicate::Range { lower, upper }) if field.mode == KeyMode::Ranged => {
                let mut lo = prefix.clone();
                let lo_fill = match (encode_bound(spec, idx, lower)?, lower) {
                    (Some(part), Bound::Excluded(_)) => {
                        lo.push(part);
                        KeyPart::MaxKey
                    }
                    (Some(part), _) => {
                        lo.push(part);
                        KeyPart::MinKey
                    }
                    (None, _) => KeyPart::MinKey,
                };
                let mut hi = prefix;
                let (hi_fill, hi_inclusive) = match (encode_bound(spec, idx, upper)?, upper) {
                    (Some(part), Bound::Excluded(_)) => {
                        hi.push(part);
                        (KeyPart::MinKey, false)
                    }
                    (Some(part), _) => {
                        hi.push(part);
                        (KeyPart::MaxKey, true)
                    }
                    (None, _) => (KeyPart::MaxKey, true),
                };
                return Ok(KeyTarget::Interval {
                    lo: padded(lo, width, lo_fill),
                    hi: padded(hi, width, hi_fill),
                    hi_inclusive,
                });
            }
            // No usable constraint on this field (or a range over hash space)
            _ => {
                if idx == 0 {
                    return Ok(KeyTarget::Everything);
                }
                return Ok(KeyTarget::Interval {
                    lo: padded(prefix.clone(), width, KeyPart::MinKey),
                    hi: padded(prefix, width, KeyPart::MaxKey),
                    hi_inclusive: true,
                });
            }
        }
    }
    Ok(KeyTarget::Point(ShardKey(prefix)))
}

/// Target keys of an operation
pub fn operation_target(spec: &ShardKeySpec, op: &Operation) -> Result<KeyTarget> {
    match &op.kind {
        OperationKind::Insert(doc) => {
            if !doc.is_object() {
                return Err(Error::InvalidShardKey("documents must be JSON objects".into()));
            }
            Ok(KeyTarget::Point(spec.extract(doc)?))
        }
        OperationKind::Find(filter)
        | OperationKind::Delete(filter)
        | OperationKind::Update { filter, .. } => key_target(spec, filter),
    }
}

/// Shards owning chunks that intersect `target`, ascending
pub fn target_shards(snapshot: &ChunkMapSnapshot, target: &KeyTarget) -> Vec<ShardId> {
    let owners: BTreeSet<ShardId> = match target {
        KeyTarget::Point(key) => snapshot.find(key).map(|c| c.shard.clone()).into_iter().collect(),
        KeyTarget::Interval {
            lo,
            hi,
            hi_inclusive,
        } => snapshot
            .chunks_between(lo, hi, *hi_inclusive)
            .iter()
            .map(|c| c.shard.clone())
            .collect(),
        KeyTarget::Everything => snapshot.shards(),
    };
    owners.into_iter().collect()
}

/// Route an operation against a snapshot
pub fn route(snapshot: &ChunkMapSnapshot, op: &Operation) -> Result<RoutePlan> {
    let target = operation_target(&snapshot.key_spec, op)?;
    let mode = match target {
        KeyTarget::Point(_) => RoutingMode::TargetedSingle,
        KeyTarget::Interval { .. } => RoutingMode::TargetedMulti,
        KeyTarget::Everything => RoutingMode::Scatter,
    };
    Ok(RoutePlan {
        mode,
        shards: target_shards(snapshot, &target),
        version: snapshot.version,
    })
}

/// Stateless router with a snapshot cache
pub struct Router {
    chunk_map: Arc<ChunkMap>,
    pool: Arc<ShardPool>,
    metrics: Arc<MetricsRegistry>,
    cache: RwLock<HashMap<String, Arc<ChunkMapSnapshot>>>,
}

impl Router {
    pub fn new(chunk_map: Arc<ChunkMap>, pool: Arc<ShardPool>, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            chunk_map,
            pool,
            metrics,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Cached snapshot of `ns`, loaded on first use
    pub fn snapshot(&self, ns: &str) -> Result<Arc<ChunkMapSnapshot>> {
        if let Some(snapshot) = self
            .cache
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(ns)
        {
            return Ok(snapshot.clone());
        }
        self.refresh(ns)
    }

    /// Reload `ns` from the chunk map
    pub fn refresh(&self, ns: &str) -> Result<Arc<ChunkMapSnapshot>> {
        let snapshot = self.chunk_map.snapshot(ns)?;
        self.cache
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(ns.to_string(), snapshot.clone());
        Ok(snapshot)
    }

    /// Plan without dispatching
    pub fn plan(&self, op: &Operation) -> Result<RoutePlan> {
        route(&self.snapshot(&op.namespace)?, op)
    }

    /// Route, send and merge; one refresh-and-retry on a stale version
    pub fn dispatch(&self, op: &Operation) -> Result<Dispatched> {
        let ns = op.namespace.as_str();
        let snapshot = self.snapshot(ns)?;
        let plan = route(&snapshot, op)?;
        self.metrics.record_route(ns, plan.mode);

        match self.send(&snapshot, &plan, op) {
            Err(Error::StaleVersion { wanted, have, .. }) => {
                tracing::debug!(
                    "Stale version on {} (sent {}, shard at {}), refreshing",
                    ns,
                    wanted,
                    have
                );
                self.metrics.namespace(ns).stale_retries.inc();

                let fresh = self.refresh(ns)?;
                let plan = route(&fresh, op)?;
                // Shards that missed a routing push catch up before the retry
                for shard in &plan.shards {
                    if let Err(e) = self.pool.get(shard).and_then(|b| b.install_routing(&fresh)) {
                        tracing::debug!("Routing push to {} failed: {}", shard, e);
                    }
                }
                let result = self.send(&fresh, &plan, op).map_err(|e| self.failed(e))?;
                Ok(Dispatched {
                    mode: plan.mode,
                    shards: plan.shards,
                    result,
                    retried: true,
                })
            }
            Err(e) => Err(self.failed(e)),
            Ok(result) => Ok(Dispatched {
                mode: plan.mode,
                shards: plan.shards,
                result,
                retried: false,
            }),
        }
    }

    fn send(&self, snapshot: &ChunkMapSnapshot, plan: &RoutePlan, op: &Operation) -> Result<OpResult> {
        let mut merged = OpResult::default();
        for shard in &plan.shards {
            let backend = self.pool.get(shard)?;
            let version = snapshot.shard_version(shard);
            merged.merge(backend.execute(op, version)?);
        }
        Ok(merged)
    }

    fn failed(&self, e: Error) -> Error {
        self.metrics.dispatch_errors.inc();
        if matches!(e, Error::ShardUnreachable(_)) {
            self.metrics.shard_unreachable.inc();
        }
        tracing::warn!("Dispatch failed: {}", e);
        e
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::keys::KeyField;
    use serde_json::json;

    fn compound() -> ShardKeySpec {
        ShardKeySpec::ranged(&["tenant", "ts"]).unwrap()
    }

    #[test]
    fn test_full_equality_is_point() {
        let spec = compound();
        let filter = Predicate::all().eq("tenant", json!("acme")).eq("ts", json!(5));
        assert_eq!(
            key_target(&spec, &filter).unwrap(),
            KeyTarget::Point(ShardKey(vec![KeyPart::Str("acme".into()), KeyPart::Int(5)]))
        );
    }

    #[test]
    fn test_prefix_equality_is_interval() {
        let spec = compound();
        let filter = Predicate::all().eq("tenant", json!("acme"));
        match key_target(&spec, &filter).unwrap() {
            KeyTarget::Interval {
                lo,
                hi,
                hi_inclusive,
            } => {
                assert_eq!(lo.parts()[1], KeyPart::MinKey);
                assert_eq!(hi.parts()[1], KeyPart::MaxKey);
                assert!(hi_inclusive);
            }
            other => panic!("expected interval, got {:?}", other),
        }
    }

    #[test]
    fn test_range_bounds() {
        let spec = ShardKeySpec::ranged(&["n"]).unwrap();
        let filter = Predicate::all().range("n", Bound::Excluded(json!(3)), Bound::Excluded(json!(9)));
        assert_eq!(
            key_target(&spec, &filter).unwrap(),
            KeyTarget::Interval {
                lo: ShardKey(vec![KeyPart::Int(3)]),
                hi: ShardKey(vec![KeyPart::Int(9)]),
                hi_inclusive: false,
            }
        );
    }

    #[test]
    fn test_scatter_cases() {
        let hashed = ShardKeySpec::hashed("user").unwrap();
        let range = Predicate::all().range("user", Bound::Included(json!(1)), Bound::Unbounded);
        assert_eq!(key_target(&hashed, &range).unwrap(), KeyTarget::Everything);

        let spec = compound();
        let other = Predicate::all().eq("name", json!("x"));
        assert_eq!(key_target(&spec, &other).unwrap(), KeyTarget::Everything);
        // A range on the second field with no prefix is not targetable either
        let ts_only = Predicate::all().range("ts", Bound::Included(json!(1)), Bound::Unbounded);
        assert_eq!(key_target(&spec, &ts_only).unwrap(), KeyTarget::Everything);
    }

    #[test]
    fn test_hashed_equality_is_point() {
        let spec = ShardKeySpec::new(vec![KeyField::hashed("user")]).unwrap();
        let filter = Predicate::all().eq("user", json!("alice"));
        let expected = spec.extract(&json!({"user": "alice"})).unwrap();
        assert_eq!(key_target(&spec, &filter).unwrap(), KeyTarget::Point(expected));
    }

    #[test]
    fn test_insert_targets_document_key() {
        let spec = compound();
        let op = Operation::insert("app.events", json!({"tenant": "acme", "ts": 7, "body": "x"}));
        assert_eq!(
            operation_target(&spec, &op).unwrap(),
            KeyTarget::Point(ShardKey(vec![KeyPart::Str("acme".into()), KeyPart::Int(7)]))
        );
        let bad = Operation::insert("app.events", json!([1, 2]));
        assert!(operation_target(&spec, &bad).is_err());
    }
}

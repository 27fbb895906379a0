//! Operations routed to shards and their key predicates

use crate::common::keys::{lookup_path, KeyPart};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::ops::Bound;

/// Constraint on a single document field
#[derive(Debug, Clone, PartialEq)]
pub enum FieldPredicate {
    Eq(Value),
    Range { lower: Bound<Value>, upper: Bound<Value> },
}

impl FieldPredicate {
    pub fn matches(&self, value: &Value) -> bool {
        let Ok(actual) = KeyPart::from_json(value) else {
            return false;
        };
        match self {
            FieldPredicate::Eq(expected) => {
                KeyPart::from_json(expected).map_or(false, |e| e == actual)
            }
            FieldPredicate::Range { lower, upper } => {
                let lower_ok = match lower {
                    Bound::Unbounded => true,
                    Bound::Included(v) => KeyPart::from_json(v).map_or(false, |b| actual >= b),
                    Bound::Excluded(v) => KeyPart::from_json(v).map_or(false, |b| actual > b),
                };
                let upper_ok = match upper {
                    Bound::Unbounded => true,
                    Bound::Included(v) => KeyPart::from_json(v).map_or(false, |b| actual <= b),
                    Bound::Excluded(v) => KeyPart::from_json(v).map_or(false, |b| actual < b),
                };
                lower_ok && upper_ok
            }
        }
    }
}

/// Conjunction of field constraints
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Predicate {
    pub fields: BTreeMap<String, FieldPredicate>,
}

impl Predicate {
    /// Matches every document
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(mut self, path: &str, value: Value) -> Self {
        self.fields
            .insert(path.to_string(), FieldPredicate::Eq(value));
        self
    }

    pub fn range(mut self, path: &str, lower: Bound<Value>, upper: Bound<Value>) -> Self {
        self.fields
            .insert(path.to_string(), FieldPredicate::Range { lower, upper });
        self
    }

    pub fn get(&self, path: &str) -> Option<&FieldPredicate> {
        self.fields.get(path)
    }

    pub fn matches(&self, doc: &Value) -> bool {
        self.fields.iter().all(|(path, pred)| {
            let value = lookup_path(doc, path).unwrap_or(&Value::Null);
            pred.matches(value)
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OperationKind {
    Find(Predicate),
    Insert(Value),
    /// Sets top-level fields on every matching document
    Update { filter: Predicate, set: Map<String, Value> },
    Delete(Predicate),
}

/// A client request against one namespace
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub namespace: String,
    pub kind: OperationKind,
}

impl Operation {
    pub fn find(namespace: &str, filter: Predicate) -> Self {
        Self {
            namespace: namespace.to_string(),
            kind: OperationKind::Find(filter),
        }
    }

    pub fn insert(namespace: &str, doc: Value) -> Self {
        Self {
            namespace: namespace.to_string(),
            kind: OperationKind::Insert(doc),
        }
    }

    pub fn update(namespace: &str, filter: Predicate, set: Map<String, Value>) -> Self {
        Self {
            namespace: namespace.to_string(),
            kind: OperationKind::Update { filter, set },
        }
    }

    pub fn delete(namespace: &str, filter: Predicate) -> Self {
        Self {
            namespace: namespace.to_string(),
            kind: OperationKind::Delete(filter),
        }
    }

    pub fn is_write(&self) -> bool {
        !matches!(self.kind, OperationKind::Find(_))
    }
}

/// How the router dispatched an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMode {
    /// Full equality on the shard key: exactly one chunk
    TargetedSingle,
    /// Key interval: the shards owning chunks in that interval
    TargetedMulti,
    /// No usable shard-key predicate: every shard of the namespace
    Scatter,
}

impl RoutingMode {
    pub fn is_targeted(&self) -> bool {
        !matches!(self, RoutingMode::Scatter)
    }
}

/// Merged result of an operation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpResult {
    pub documents: Vec<Value>,
    pub affected: u64,
}

impl OpResult {
    pub fn merge(&mut self, other: OpResult) {
        self.documents.extend(other.documents);
        self.affected += other.affected;
    }
}

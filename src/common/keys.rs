//! Shard-key encoding and ordering (the key range codec)
//!
//! Documents are JSON objects. A [`ShardKeySpec`] names the fields that form
//! the shard key; extracting a key from a document yields a [`ShardKey`], a
//! compound value compared lexicographically field by field.
//!
//! Type order inside a field: `MinKey < Hashed < Null < Int < Str < Bool < MaxKey`.
//! Hashed fields are encoded by their 64-bit hash, so neighbours in hash space
//! are unrelated in raw-value space and range predicates on them cannot be
//! turned into key intervals.

use crate::common::hash::hash_key_value;
use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;

/// One encoded field of a shard key
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum KeyPart {
    MinKey,
    Hashed(u64),
    Null,
    Int(i64),
    Str(String),
    Bool(bool),
    MaxKey,
}

impl KeyPart {
    /// Encode a raw JSON value (ranged encoding)
    pub fn from_json(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(KeyPart::Null),
            Value::Bool(b) => Ok(KeyPart::Bool(*b)),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    return Ok(KeyPart::Int(i));
                }
                match n.as_f64() {
                    Some(f)
                        if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 =>
                    {
                        Ok(KeyPart::Int(f as i64))
                    }
                    _ => Err(Error::InvalidShardKey(format!(
                        "unsupported numeric value {}",
                        n
                    ))),
                }
            }
            Value::String(s) => Ok(KeyPart::Str(s.clone())),
            Value::Array(_) | Value::Object(_) => Err(Error::InvalidShardKey(
                "arrays and objects cannot be shard key values".into(),
            )),
        }
    }

    /// Encode a boundary value supplied by an operator.
    ///
    /// `{"$minKey": 1}` and `{"$maxKey": 1}` name the sentinels; on a hashed
    /// field a boundary is a position in hash space and must be an unsigned
    /// integer.
    pub fn from_bound_json(value: &Value, mode: KeyMode) -> Result<Self> {
        if let Value::Object(map) = value {
            if map.contains_key("$minKey") {
                return Ok(KeyPart::MinKey);
            }
            if map.contains_key("$maxKey") {
                return Ok(KeyPart::MaxKey);
            }
        }
        match mode {
            KeyMode::Ranged => Self::from_json(value),
            KeyMode::Hashed => value.as_u64().map(KeyPart::Hashed).ok_or_else(|| {
                Error::InvalidShardKey(format!("hashed boundary must be a u64, got {}", value))
            }),
        }
    }
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPart::MinKey => write!(f, "MinKey"),
            KeyPart::Hashed(h) => write!(f, "#{}", h),
            KeyPart::Null => write!(f, "null"),
            KeyPart::Int(i) => write!(f, "{}", i),
            KeyPart::Str(s) => write!(f, "{:?}", s),
            KeyPart::Bool(b) => write!(f, "{}", b),
            KeyPart::MaxKey => write!(f, "MaxKey"),
        }
    }
}

/// A full-width encoded shard key
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShardKey(pub Vec<KeyPart>);

impl ShardKey {
    pub fn new(parts: Vec<KeyPart>) -> Self {
        Self(parts)
    }

    pub fn parts(&self) -> &[KeyPart] {
        &self.0
    }

    pub fn width(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", part)?;
        }
        write!(f, "}}")
    }
}

/// Total order over encoded keys
pub fn compare(a: &ShardKey, b: &ShardKey) -> Ordering {
    a.cmp(b)
}

/// Half-open key interval `[min, max)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    pub min: ShardKey,
    pub max: ShardKey,
}

impl KeyRange {
    pub fn new(min: ShardKey, max: ShardKey) -> Result<Self> {
        if min >= max {
            return Err(Error::InvalidRange(format!(
                "min {} must be below max {}",
                min, max
            )));
        }
        Ok(Self { min, max })
    }

    pub fn contains(&self, key: &ShardKey) -> bool {
        &self.min <= key && key < &self.max
    }

    pub fn overlaps(&self, other: &KeyRange) -> bool {
        self.min < other.max && other.min < self.max
    }

    pub fn contains_range(&self, other: &KeyRange) -> bool {
        self.min <= other.min && other.max <= self.max
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.min, self.max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyMode {
    Ranged,
    Hashed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyField {
    pub path: String,
    pub mode: KeyMode,
}

impl KeyField {
    pub fn ranged(path: &str) -> Self {
        Self {
            path: path.to_string(),
            mode: KeyMode::Ranged,
        }
    }

    pub fn hashed(path: &str) -> Self {
        Self {
            path: path.to_string(),
            mode: KeyMode::Hashed,
        }
    }
}

/// Ordered shard-key declaration of a collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardKeySpec {
    pub fields: Vec<KeyField>,
}

impl ShardKeySpec {
    pub fn new(fields: Vec<KeyField>) -> Result<Self> {
        let spec = Self { fields };
        spec.validate()?;
        Ok(spec)
    }

    /// All-ranged compound key over `paths`
    pub fn ranged(paths: &[&str]) -> Result<Self> {
        Self::new(paths.iter().map(|p| KeyField::ranged(p)).collect())
    }

    /// Single hashed field
    pub fn hashed(path: &str) -> Result<Self> {
        Self::new(vec![KeyField::hashed(path)])
    }

    pub fn validate(&self) -> Result<()> {
        if self.fields.is_empty() {
            return Err(Error::InvalidKeySpec("shard key needs at least one field".into()));
        }
        let mut seen = HashSet::new();
        for field in &self.fields {
            if field.path.is_empty() || field.path.split('.').any(|s| s.is_empty()) {
                return Err(Error::InvalidKeySpec(format!(
                    "invalid field path {:?}",
                    field.path
                )));
            }
            if !seen.insert(field.path.as_str()) {
                return Err(Error::InvalidKeySpec(format!(
                    "duplicate field {:?}",
                    field.path
                )));
            }
        }
        let hashed = self
            .fields
            .iter()
            .filter(|f| f.mode == KeyMode::Hashed)
            .count();
        if hashed > 1 {
            return Err(Error::InvalidKeySpec(
                "at most one hashed field is allowed".into(),
            ));
        }
        Ok(())
    }

    pub fn width(&self) -> usize {
        self.fields.len()
    }

    pub fn min_key(&self) -> ShardKey {
        ShardKey(vec![KeyPart::MinKey; self.width()])
    }

    pub fn max_key(&self) -> ShardKey {
        ShardKey(vec![KeyPart::MaxKey; self.width()])
    }

    pub fn full_range(&self) -> KeyRange {
        KeyRange {
            min: self.min_key(),
            max: self.max_key(),
        }
    }

    pub fn leading_mode(&self) -> KeyMode {
        self.fields[0].mode
    }

    pub fn field_index(&self, path: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.path == path)
    }

    /// Encode a raw value for field `idx`, hashing it if the field is hashed
    pub fn encode_field(&self, idx: usize, value: &Value) -> Result<KeyPart> {
        let part = KeyPart::from_json(value)?;
        match self.fields[idx].mode {
            KeyMode::Ranged => Ok(part),
            KeyMode::Hashed => Ok(KeyPart::Hashed(hash_key_value(&part))),
        }
    }

    /// Extract the shard key of a document; missing fields encode as null
    pub fn extract(&self, doc: &Value) -> Result<ShardKey> {
        let mut parts = Vec::with_capacity(self.width());
        for (idx, field) in self.fields.iter().enumerate() {
            let value = lookup_path(doc, &field.path).unwrap_or(&Value::Null);
            parts.push(self.encode_field(idx, value)?);
        }
        Ok(ShardKey(parts))
    }

    /// Pad a key prefix to full width with `MinKey`
    pub fn pad(&self, mut prefix: Vec<KeyPart>) -> Result<ShardKey> {
        if prefix.len() > self.width() {
            return Err(Error::InvalidShardKey(format!(
                "key has {} fields, shard key has {}",
                prefix.len(),
                self.width()
            )));
        }
        prefix.resize(self.width(), KeyPart::MinKey);
        Ok(ShardKey(prefix))
    }

    /// Parse a boundary such as `{"tenant": "acme"}`.
    ///
    /// Fields must form a prefix of the shard key; the rest is `MinKey`.
    pub fn key_from_json(&self, value: &Value) -> Result<ShardKey> {
        let map = value.as_object().ok_or_else(|| {
            Error::InvalidShardKey(format!("boundary must be an object, got {}", value))
        })?;
        for name in map.keys() {
            if self.field_index(name).is_none() {
                return Err(Error::InvalidShardKey(format!(
                    "{:?} is not a shard key field",
                    name
                )));
            }
        }
        let mut parts = Vec::new();
        for field in &self.fields {
            match map.get(&field.path) {
                Some(v) => parts.push(KeyPart::from_bound_json(v, field.mode)?),
                None => break,
            }
        }
        if parts.len() != map.len() {
            return Err(Error::InvalidShardKey(
                "boundary fields must form a prefix of the shard key".into(),
            ));
        }
        self.pad(parts)
    }

    /// `count - 1` evenly spaced boundaries over the hash space of a
    /// leading hashed field
    pub fn uniform_split_points(&self, count: u32) -> Result<Vec<ShardKey>> {
        if count == 0 {
            return Err(Error::InvalidConfig("initial chunk count must be > 0".into()));
        }
        if count > 1 && self.leading_mode() != KeyMode::Hashed {
            return Err(Error::InvalidKeySpec(
                "uniform pre-splitting needs a leading hashed field; pass split points".into(),
            ));
        }
        let step = u64::MAX / count as u64;
        (1..count as u64)
            .map(|i| self.pad(vec![KeyPart::Hashed(i * step)]))
            .collect()
    }
}

/// Resolve a dotted path (`a.b.c`) inside a JSON document
pub fn lookup_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_type_order() {
        assert!(KeyPart::MinKey < KeyPart::Null);
        assert!(KeyPart::Null < KeyPart::Int(i64::MIN));
        assert!(KeyPart::Int(i64::MAX) < KeyPart::Str(String::new()));
        assert!(KeyPart::Str("zzz".into()) < KeyPart::Bool(false));
        assert!(KeyPart::Bool(true) < KeyPart::MaxKey);
    }

    #[test]
    fn test_compound_is_lexicographic() {
        let a = ShardKey(vec![KeyPart::Str("a".into()), KeyPart::Int(9)]);
        let b = ShardKey(vec![KeyPart::Str("b".into()), KeyPart::Int(1)]);
        assert_eq!(compare(&a, &b), Ordering::Less);
        assert_eq!(compare(&b, &a), Ordering::Greater);
        assert_eq!(compare(&a, &a.clone()), Ordering::Equal);
    }

    #[test]
    fn test_extract_nested_and_missing() {
        let spec = ShardKeySpec::ranged(&["tenant.id", "region"]).unwrap();
        let key = spec
            .extract(&json!({"tenant": {"id": 42}, "name": "x"}))
            .unwrap();
        assert_eq!(key, ShardKey(vec![KeyPart::Int(42), KeyPart::Null]));
    }

    #[test]
    fn test_hashed_extract_uses_hash() {
        let spec = ShardKeySpec::hashed("user").unwrap();
        let k1 = spec.extract(&json!({"user": "alice"})).unwrap();
        let k2 = spec.extract(&json!({"user": "alice"})).unwrap();
        assert_eq!(k1, k2);
        assert!(matches!(k1.parts()[0], KeyPart::Hashed(_)));
    }

    #[test]
    fn test_rejects_unsupported_values() {
        let spec = ShardKeySpec::ranged(&["a"]).unwrap();
        assert!(spec.extract(&json!({"a": [1, 2]})).is_err());
        assert!(spec.extract(&json!({"a": 1.5})).is_err());
        assert_eq!(
            spec.extract(&json!({"a": 3.0})).unwrap(),
            ShardKey(vec![KeyPart::Int(3)])
        );
    }

    #[test]
    fn test_spec_validation() {
        assert!(ShardKeySpec::new(vec![]).is_err());
        assert!(ShardKeySpec::ranged(&["a", "a"]).is_err());
        assert!(ShardKeySpec::ranged(&["a..b"]).is_err());
        assert!(
            ShardKeySpec::new(vec![KeyField::hashed("a"), KeyField::hashed("b")]).is_err()
        );
        assert!(ShardKeySpec::new(vec![KeyField::ranged("a"), KeyField::hashed("b")]).is_ok());
    }

    #[test]
    fn test_key_from_json_prefix() {
        let spec = ShardKeySpec::ranged(&["tenant", "ts"]).unwrap();
        let key = spec.key_from_json(&json!({"tenant": "acme"})).unwrap();
        assert_eq!(
            key,
            ShardKey(vec![KeyPart::Str("acme".into()), KeyPart::MinKey])
        );
        assert!(spec.key_from_json(&json!({"ts": 5})).is_err());
        assert!(spec.key_from_json(&json!({"other": 5})).is_err());

        let max = spec
            .key_from_json(&json!({"tenant": {"$maxKey": 1}, "ts": {"$maxKey": 1}}))
            .unwrap();
        assert_eq!(max, spec.max_key());
    }

    #[test]
    fn test_uniform_split_points() {
        let spec = ShardKeySpec::hashed("id").unwrap();
        let points = spec.uniform_split_points(4).unwrap();
        assert_eq!(points.len(), 3);
        assert!(points.windows(2).all(|w| w[0] < w[1]));

        let ranged = ShardKeySpec::ranged(&["id"]).unwrap();
        assert!(ranged.uniform_split_points(4).is_err());
        assert!(ranged.uniform_split_points(1).unwrap().is_empty());
    }

    #[test]
    fn test_key_range() {
        let spec = ShardKeySpec::ranged(&["a"]).unwrap();
        let k = |i: i64| ShardKey(vec![KeyPart::Int(i)]);
        let r = KeyRange::new(k(1), k(5)).unwrap();
        assert!(r.contains(&k(1)));
        assert!(!r.contains(&k(5)));
        assert!(r.overlaps(&KeyRange::new(k(4), k(9)).unwrap()));
        assert!(!r.overlaps(&KeyRange::new(k(5), k(9)).unwrap()));
        assert!(spec.full_range().contains_range(&r));
        assert!(KeyRange::new(k(5), k(5)).is_err());
    }
}

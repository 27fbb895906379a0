//! Zone registry
//!
//! A zone binds a key range of a namespace to the shards tagged with the
//! zone's name. Ranges of one namespace never overlap; a chunk either lies
//! outside every zone, inside exactly one, or straddles a zone boundary.

use crate::common::keys::{KeyRange, ShardKey};
use crate::common::{validate_namespace, Error, Result};
use crate::coordinator::metadata::{read_record, update_record, MetadataStore, SPACE_ZONES};
use crate::coordinator::shards::ShardRecord;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneRange {
    pub namespace: String,
    pub range: KeyRange,
    pub zone: String,
}

/// Where a chunk sits relative to the zones of its namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZonePlacement {
    /// Touches no zone range
    Free,
    /// Entirely inside the named zone
    Contained(String),
    /// Crosses zone boundaries; the interior boundaries, ascending
    Straddles(Vec<ShardKey>),
}

pub struct ZoneRegistry {
    store: Arc<dyn MetadataStore>,
}

impl ZoneRegistry {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self { store }
    }

    /// Bind `range` of `ns` to `zone`
    pub fn assign_zone(&self, ns: &str, range: KeyRange, zone: &str) -> Result<()> {
        validate_namespace(ns)?;
        if zone.trim().is_empty() {
            return Err(Error::InvalidConfig("zone name must not be empty".into()));
        }
        if range.min >= range.max {
            return Err(Error::InvalidRange(format!("{} is empty", range)));
        }

        let entry = ZoneRange {
            namespace: ns.to_string(),
            range: range.clone(),
            zone: zone.to_string(),
        };
        update_record(
            self.store.as_ref(),
            SPACE_ZONES,
            ns,
            |current: Option<Vec<ZoneRange>>| {
                let mut ranges = current.unwrap_or_default();
                if let Some(existing) = ranges.iter().find(|z| z.range.overlaps(&range)) {
                    return Err(Error::ZoneConflict(format!(
                        "{} overlaps {} assigned to zone {}",
                        range, existing.range, existing.zone
                    )));
                }
                ranges.push(entry.clone());
                ranges.sort_by(|a, b| a.range.min.cmp(&b.range.min));
                Ok((Some(ranges), ()))
            },
        )?;

        tracing::info!("Assigned {} of {} to zone {}", range, ns, zone);
        Ok(())
    }

    /// Drop the assignment of exactly `range`; returns the zone it had
    pub fn remove_zone(&self, ns: &str, range: &KeyRange) -> Result<String> {
        let zone = update_record(
            self.store.as_ref(),
            SPACE_ZONES,
            ns,
            |current: Option<Vec<ZoneRange>>| {
                let mut ranges = current.unwrap_or_default();
                let pos = ranges
                    .iter()
                    .position(|z| &z.range == range)
                    .ok_or_else(|| Error::InvalidRange(format!("no zone assigned to {}", range)))?;
                let removed = ranges.remove(pos);
                let next = if ranges.is_empty() { None } else { Some(ranges) };
                Ok((next, removed.zone))
            },
        )?;
        tracing::info!("Removed zone {} from {} of {}", zone, range, ns);
        Ok(zone)
    }

    /// Zone ranges of `ns`, ordered by min key
    pub fn ranges(&self, ns: &str) -> Result<Vec<ZoneRange>> {
        Ok(read_record(self.store.as_ref(), SPACE_ZONES, ns)?.unwrap_or_default())
    }
}

/// Classify `range` against sorted, non-overlapping zone ranges
pub fn classify(zones: &[ZoneRange], range: &KeyRange) -> ZonePlacement {
    let touching: Vec<&ZoneRange> = zones.iter().filter(|z| z.range.overlaps(range)).collect();
    match touching.as_slice() {
        [] => ZonePlacement::Free,
        [only] if only.range.contains_range(range) => ZonePlacement::Contained(only.zone.clone()),
        _ => {
            let mut cuts = Vec::new();
            for z in touching {
                for edge in [&z.range.min, &z.range.max] {
                    if range.min < *edge && *edge < range.max && !cuts.contains(edge) {
                        cuts.push(edge.clone());
                    }
                }
            }
            cuts.sort();
            ZonePlacement::Straddles(cuts)
        }
    }
}

/// May a chunk with this placement live on `shard`?
pub fn shard_allowed(placement: &ZonePlacement, shard: &ShardRecord) -> bool {
    match placement {
        ZonePlacement::Free => true,
        ZonePlacement::Contained(zone) => shard.zone_tags.contains(zone),
        ZonePlacement::Straddles(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::keys::KeyPart;
    use crate::coordinator::metadata::MemoryMetadataStore;

    fn k(i: i64) -> ShardKey {
        ShardKey(vec![KeyPart::Int(i)])
    }

    fn r(a: i64, b: i64) -> KeyRange {
        KeyRange::new(k(a), k(b)).unwrap()
    }

    #[test]
    fn test_assign_and_conflict() {
        let zones = ZoneRegistry::new(Arc::new(MemoryMetadataStore::new()));
        zones.assign_zone("app.users", r(0, 10), "eu").unwrap();
        zones.assign_zone("app.users", r(10, 20), "us").unwrap();

        let err = zones.assign_zone("app.users", r(5, 15), "ap").unwrap_err();
        assert!(matches!(err, Error::ZoneConflict(_)));
        assert!(err.is_configuration_error());

        // Other namespaces are independent
        zones.assign_zone("app.orders", r(5, 15), "ap").unwrap();

        let ranges = zones.ranges("app.users").unwrap();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].zone, "eu");
    }

    #[test]
    fn test_remove_zone() {
        let zones = ZoneRegistry::new(Arc::new(MemoryMetadataStore::new()));
        zones.assign_zone("app.users", r(0, 10), "eu").unwrap();
        assert_eq!(zones.remove_zone("app.users", &r(0, 10)).unwrap(), "eu");
        assert!(zones.ranges("app.users").unwrap().is_empty());
        assert!(zones.remove_zone("app.users", &r(0, 10)).is_err());
    }

    #[test]
    fn test_classify() {
        let zones = vec![
            ZoneRange {
                namespace: "app.users".into(),
                range: r(10, 20),
                zone: "eu".into(),
            },
            ZoneRange {
                namespace: "app.users".into(),
                range: r(20, 30),
                zone: "us".into(),
            },
        ];
        assert_eq!(classify(&zones, &r(0, 10)), ZonePlacement::Free);
        assert_eq!(
            classify(&zones, &r(12, 18)),
            ZonePlacement::Contained("eu".into())
        );
        assert_eq!(
            classify(&zones, &r(5, 15)),
            ZonePlacement::Straddles(vec![k(10)])
        );
        assert_eq!(
            classify(&zones, &r(15, 35)),
            ZonePlacement::Straddles(vec![k(20), k(30)])
        );
    }
}

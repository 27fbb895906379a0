//! Utility functions for minishard

use std::time::{SystemTime, UNIX_EPOCH};

/// Get current Unix timestamp (seconds)
pub fn timestamp_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Get current Unix timestamp (milliseconds)
pub fn timestamp_now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Generate a unique migration ticket ID
pub fn generate_ticket_id() -> String {
    format!("mig-{}", uuid::Uuid::new_v4().simple())
}

/// Validate a `db.collection` namespace
pub fn validate_namespace(ns: &str) -> crate::Result<()> {
    let valid = match ns.split_once('.') {
        Some((db, coll)) => !db.is_empty() && !coll.is_empty(),
        None => false,
    };
    if !valid || ns.chars().any(|c| c.is_control() || c == '/') {
        return Err(crate::Error::InvalidConfig(format!(
            "namespace must look like db.collection, got {:?}",
            ns
        )));
    }
    Ok(())
}

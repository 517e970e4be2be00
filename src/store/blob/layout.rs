//! Container and blob path layout.
//!
//! A "container" is a path prefix within one configured `ObjectStore`
//! rather than a server-side bucket — `object_store` has no
//! notion of buckets created on demand, so "ensure container" is a no-op:
//! writing a blob under a new prefix is itself the act of creating it.

use chrono::{DateTime, NaiveDate, Utc};
use object_store::path::Path;

use crate::model::EntityId;

/// `<prefix>-YYYY-MM-DD`, bucketed by the entity id's embedded creation
/// time — the id's v7 timestamp is the system's sole time oracle.
pub fn container_for(prefix: &str, ts: DateTime<Utc>) -> String {
    format!("{prefix}-{}", ts.format("%Y-%m-%d"))
}

pub fn container_for_id(prefix: &str, id: EntityId) -> String {
    container_for(prefix, id.timestamp())
}

/// Candidate container names for today back `retention_days - 1` days, most
/// recent first — the set `search`/`list` scan.
pub fn candidate_containers(prefix: &str, today: NaiveDate, retention_days: u32) -> Vec<String> {
    (0..retention_days.max(1))
        .map(|back| {
            let date = today - chrono::Duration::days(back as i64);
            format!("{prefix}-{}", date.format("%Y-%m-%d"))
        })
        .collect()
}

pub fn plan_entry_path(container: &str, plan_id: EntityId) -> Path {
    Path::from(format!("{container}/plans/{plan_id}-entry.json"))
}

pub fn plan_object_path(container: &str, plan_id: EntityId) -> Path {
    Path::from(format!("{container}/plans/{plan_id}-object.json"))
}

pub fn block_path(container: &str, plan_id: EntityId, block_id: EntityId) -> Path {
    Path::from(format!("{container}/blocks/{plan_id}/{block_id}.json"))
}

pub fn sequence_path(container: &str, plan_id: EntityId, seq_id: EntityId) -> Path {
    Path::from(format!("{container}/sequences/{plan_id}/{seq_id}.json"))
}

pub fn checks_path(container: &str, plan_id: EntityId, checks_id: EntityId) -> Path {
    Path::from(format!("{container}/checks/{plan_id}/{checks_id}.json"))
}

pub fn action_path(container: &str, plan_id: EntityId, action_id: EntityId) -> Path {
    Path::from(format!("{container}/actions/{plan_id}/{action_id}.json"))
}

/// Prefix under which every `plans/*-entry.json` blob of a container lives,
/// used by `search`/`list`/recovery to enumerate entries.
pub fn plans_prefix(container: &str) -> Path {
    Path::from(format!("{container}/plans/"))
}

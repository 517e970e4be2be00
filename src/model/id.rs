//! Entity identifiers
//!
//! Every entity in a plan tree is addressed by a v7 UUID. The time embedded
//! in a v7 UUID is authoritative: it is the system's sole time oracle for
//! container selection and retention (see `store::blob`).

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A stable, time-ordered identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(Uuid);

impl EntityId {
    /// Generate a new v7 identifier stamped with the current time.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Wrap an existing UUID without checking its version.
    ///
    /// Used when reconstructing entities from storage, where the version
    /// has already been validated at write time.
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Whether this id is a non-nil v7 UUID.
    pub fn is_valid_v7(&self) -> bool {
        !self.0.is_nil() && self.0.get_version_num() == 7
    }

    /// The creation time embedded in this id's v7 timestamp.
    ///
    /// Panics if called on a non-v7 id; callers validate with
    /// [`EntityId::is_valid_v7`] at system boundaries (store reads, plan
    /// submission) before relying on this.
    pub fn timestamp(&self) -> DateTime<Utc> {
        let (secs, subsec_nanos) = self
            .0
            .get_timestamp()
            .expect("EntityId::timestamp called on a non-v7 id")
            .to_unix();
        Utc.timestamp_opt(secs as i64, subsec_nanos)
            .single()
            .expect("uuid v7 timestamp out of range")
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EntityId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

//! Cluster-wide identifier and data placement types.

use std::fmt;

use get_size::GetSize;

use serde::{Deserialize, Serialize};

/// Log-unique segment identifier (64-bit, unique within one master's log).
pub type SegmentId = u64;

/// Replication epoch number type.
pub type Epoch = u64;

/// Cluster-unique identifier of one recovery attempt.
pub type RecoveryId = u64;

/// Recovery partition identifier type.
pub type PartitionId = u32;

/// Replication group identifier type.
pub type GroupId = u64;

/// Identifier of a server process in the cluster. The `generation` part is
/// bumped by the coordinator whenever a numeric id gets reused, so a
/// restarted process never impersonates its former incarnation.
#[derive(
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    GetSize,
)]
pub struct ServerId {
    pub id: u64,
    pub generation: u32,
}

impl ServerId {
    /// The invalid placeholder id, used e.g. by backup selection to signal
    /// that no eligible server exists right now.
    pub const INVALID: ServerId = ServerId {
        id: u64::MAX,
        generation: 0,
    };

    /// Creates a first-generation server id.
    pub fn new(id: u64) -> Self {
        ServerId { id, generation: 0 }
    }

    /// Creates a server id of a specific generation.
    pub fn gen(id: u64, generation: u32) -> Self {
        ServerId { id, generation }
    }

    /// True if this id refers to an actual server.
    pub fn is_valid(&self) -> bool {
        self.id != u64::MAX
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.id, self.generation)
    }
}

/// Membership status of a server as last heard from the cluster tracker.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum ServerStatus {
    Up,
    Crashed,
    Down,
}

/// One tablet: a contiguous key-hash range of a table, assigned to a
/// recovery partition when its owning master crashes.
#[derive(
    Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize, GetSize,
)]
pub struct Tablet {
    pub table_id: u64,
    pub start_key_hash: u64,
    pub end_key_hash: u64,
    pub partition_id: PartitionId,
}

impl Tablet {
    /// True if the given object coordinate falls inside this tablet.
    pub fn covers(&self, table_id: u64, key_hash: u64) -> bool {
        self.table_id == table_id
            && self.start_key_hash <= key_hash
            && key_hash <= self.end_key_hash
    }
}

/// Finds which partition an object coordinate belongs to, if any.
pub fn partition_for(
    tablets: &[Tablet],
    table_id: u64,
    key_hash: u64,
) -> Option<PartitionId> {
    tablets
        .iter()
        .find(|t| t.covers(table_id, key_hash))
        .map(|t| t.partition_id)
}

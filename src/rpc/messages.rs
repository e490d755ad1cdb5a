//! Replication RPC wire message types.
//!
//! Every message here crosses a process boundary in a real deployment and
//! is therefore MessagePack-encodable. The transport itself is a separate
//! concern; see the hub module for the master-side seam.

use std::fmt;

use crate::ids::{
    Epoch, GroupId, PartitionId, RecoveryId, SegmentId, ServerId, Tablet,
};
use crate::segment::Certificate;
use crate::utils::SeglineError;

use get_size::GetSize;

use serde::{Deserialize, Serialize};

/// Master -> backup: buffer a byte range of a segment replica.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize, GetSize)]
pub struct WriteSegmentRequest {
    pub master_id: ServerId,
    pub segment_id: SegmentId,
    pub epoch: Epoch,
    pub offset: u32,
    pub data: Vec<u8>,
    /// Present only when the received prefix becomes attestable after this
    /// write; absent on partial writes and on atomic re-replication opens.
    pub certificate: Option<Certificate>,
    pub open: bool,
    pub close: bool,
    pub primary: bool,
    pub atomic: bool,
}

/// Master -> backup: drop the replica of a segment.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize, GetSize)]
pub struct FreeSegmentRequest {
    pub master_id: ServerId,
    pub segment_id: SegmentId,
}

/// Requests a master sends to a backup through the replication RPC hub.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize, GetSize)]
pub enum BackupRequest {
    Write(WriteSegmentRequest),
    Free(FreeSegmentRequest),
}

/// Coordinator -> backup: report replicas of a crashed master and begin
/// building recovery segments for the given partitions.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize, GetSize)]
pub struct StartReadingDataRequest {
    pub recovery_id: RecoveryId,
    pub master_id: ServerId,
    pub partitions: Vec<Tablet>,
}

/// One replica a backup holds for a crashed master.
#[derive(
    Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize, GetSize,
)]
pub struct ReplicaInfo {
    pub segment_id: SegmentId,
    pub length: u32,
    pub primary: bool,
    pub closed: bool,
    pub epoch: Epoch,
}

/// A log digest extracted from the certified prefix of one replica.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize, GetSize)]
pub struct DigestInfo {
    pub segment_id: SegmentId,
    pub length: u32,
    pub segment_ids: Vec<SegmentId>,
}

/// Backup -> coordinator: reply to `StartReadingData`.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize, GetSize)]
pub struct StartReadingDataResponse {
    pub replicas: Vec<ReplicaInfo>,
    pub digests: Vec<DigestInfo>,
}

/// Recovery master -> backup: fetch one filtered recovery segment.
#[derive(
    Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize, GetSize,
)]
pub struct GetRecoveryDataRequest {
    pub recovery_id: RecoveryId,
    pub master_id: ServerId,
    pub segment_id: SegmentId,
    pub partition_id: PartitionId,
}

/// Backup -> recovery master: one recovery segment plus its certificate.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize, GetSize)]
pub struct GetRecoveryDataResponse {
    pub certificate: Certificate,
    pub data: Vec<u8>,
}

/// Coordinator -> backup: advertise the backup's replication group.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize, GetSize)]
pub struct AssignGroupRequest {
    pub group_id: GroupId,
    pub backup_ids: Vec<ServerId>,
}

/// Backup -> master: is this replica still needed, or has recovery moved
/// durably past it?
#[derive(
    Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize, GetSize,
)]
pub struct IsReplicaNeededRequest {
    pub master_id: ServerId,
    pub segment_id: SegmentId,
}

/// Master -> coordinator: raise the replication epoch of a segment so stale
/// open replicas can never be chosen during a recovery.
#[derive(
    Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize, GetSize,
)]
pub struct UpdateReplicationEpochRequest {
    pub master_id: ServerId,
    pub segment_id: SegmentId,
    pub epoch: Epoch,
}

/// Behavior-typed errors a backup returns on its RPC surface. These cross
/// the wire as statuses and drive the master's per-replica decision tree.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize, GetSize)]
pub enum BackupError {
    /// Write to a frame that is not open here (never opened, already
    /// closed, or already freed).
    BadSegmentId {
        master_id: ServerId,
        segment_id: SegmentId,
    },

    /// Write outside the frame's capacity bounds.
    SegmentOverflow {
        offset: u32,
        length: u32,
        capacity: u32,
    },

    /// Open refused: all frames in use, or this backup already holds a
    /// conflicting replica of the segment found on storage after a prior
    /// crash of the same master.
    OpenRejected,

    /// Backup-local storage failure; surfaced to the caller as a plain
    /// error and retried like any other transient fault.
    StorageError { detail: String },
}

impl fmt::Display for BackupError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BackupError::BadSegmentId {
                master_id,
                segment_id,
            } => {
                write!(f, "bad segment id <{},{}>", master_id, segment_id)
            }
            BackupError::SegmentOverflow {
                offset,
                length,
                capacity,
            } => write!(
                f,
                "write [{}, {}) overflows frame capacity {}",
                offset,
                offset + length,
                capacity
            ),
            BackupError::OpenRejected => write!(f, "open rejected"),
            BackupError::StorageError { detail } => {
                write!(f, "backup storage error: {}", detail)
            }
        }
    }
}

impl From<BackupError> for SeglineError {
    fn from(e: BackupError) -> Self {
        SeglineError(e.to_string())
    }
}

/// Completion of a write RPC as observed by the master's decision tree.
/// Failures are tagged outcomes, not unwound errors.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum WriteOutcome {
    /// Write durably buffered; the backup's current replication group rides
    /// back on every write response.
    Ok { group: Vec<ServerId> },

    /// Transport says the backup is unreachable; a failure notification
    /// will follow from the membership monitor.
    BackupDown,

    /// The backup refused to open a replica; pick a different backup.
    OpenRejected,

    /// Unexpected backup-side error; logged and retried.
    Failed(String),
}

/// Completion of a free RPC.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum FreeOutcome {
    Ok,
    /// The backup is already out of the cluster; its garbage collector owns
    /// the replica now, so the master's job is done either way.
    BackupDown,
}

/// Completion of any backup RPC, tagged by request kind.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum RpcOutcome {
    Write(WriteOutcome),
    Free(FreeOutcome),
}

//! Replication RPC surface: wire message types and the master-side hub.

mod hub;
mod messages;

pub use hub::{BackupRpcHub, BackupWire, RpcId};
pub use messages::{
    AssignGroupRequest, BackupError, BackupRequest, DigestInfo, FreeOutcome,
    FreeSegmentRequest, GetRecoveryDataRequest, GetRecoveryDataResponse,
    IsReplicaNeededRequest, ReplicaInfo, RpcOutcome, StartReadingDataRequest,
    StartReadingDataResponse, UpdateReplicationEpochRequest,
    WriteOutcome, WriteSegmentRequest,
};

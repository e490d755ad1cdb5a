//! Public interface to the Segline replication core library: the
//! master-side replicated-segment engine, the backup-side replica store
//! and recovery read path, and the coordinator-side recovery planner of a
//! log-structured in-memory distributed key-value store.

#![allow(clippy::uninlined_format_args)]

#[macro_use]
mod utils;

mod backup;
mod coordinator;
mod ids;
mod master;
mod rpc;
mod segment;

pub use utils::SeglineError;

pub use ids::{
    partition_for, Epoch, GroupId, PartitionId, RecoveryId, SegmentId,
    ServerId, ServerStatus, Tablet,
};

pub use segment::{
    find_digest, iter_entries, push_encoded_entry, Certificate, EntryIter,
    LogEntry, Segment,
};

pub use rpc::{
    AssignGroupRequest, BackupError, BackupRequest, BackupRpcHub,
    BackupWire, DigestInfo, FreeOutcome, FreeSegmentRequest,
    GetRecoveryDataRequest, GetRecoveryDataResponse, IsReplicaNeededRequest,
    ReplicaInfo, RpcId, RpcOutcome, StartReadingDataRequest,
    StartReadingDataResponse, UpdateReplicationEpochRequest, WriteOutcome,
    WriteSegmentRequest,
};

pub use master::{
    BackupSelector, EpochWire, Progress, ReplicaManager,
    ReplicaManagerConfig, ReplicationEpochTask, MAX_WRITE_RPCS_IN_FLIGHT,
};

pub use backup::{
    BackupConfig, BackupService, FrameId, FrameMetadata, FrameStore,
    MasterQueryWire, Superblock,
};

pub use coordinator::{
    build_replay_plan, BackupListing, CoordinatorEpochs, PlanEntry,
    Recovery, ReplayPlan,
};

//! Coordinator-side recovery bookkeeping: the replication epoch arbiter,
//! the replay planner, and the per-crashed-master recovery driver.

mod planner;
mod recovery;

pub use planner::{
    build_replay_plan, BackupListing, PlanEntry, ReplayPlan,
};
pub use recovery::Recovery;

use std::collections::HashMap;

use crate::ids::{Epoch, SegmentId};
use crate::rpc::UpdateReplicationEpochRequest;

/// The authoritative (segment id -> replication epoch) table. Masters
/// raise entries after losing open replicas; recovery planning ignores
/// open replicas whose stamped epoch is below the entry here.
#[derive(Debug, Default)]
pub struct CoordinatorEpochs {
    epochs: HashMap<SegmentId, Epoch>,
}

impl CoordinatorEpochs {
    pub fn new() -> Self {
        CoordinatorEpochs {
            epochs: HashMap::new(),
        }
    }

    /// Current minimum epoch required of open replicas of a segment.
    pub fn epoch(&self, segment_id: SegmentId) -> Epoch {
        self.epochs.get(&segment_id).copied().unwrap_or(0)
    }

    /// Durably records that open replicas below `epoch` are dead to any
    /// future recovery. Only the highest value ever wins.
    pub fn update_to_at_least(
        &mut self,
        segment_id: SegmentId,
        epoch: Epoch,
    ) {
        let entry = self.epochs.entry(segment_id).or_insert(0);
        if *entry < epoch {
            pf_debug!(
                "replication epoch of segment {} raised to {}",
                segment_id,
                epoch
            );
            *entry = epoch;
        }
    }

    /// Applies a master's update request and returns the confirmation to
    /// send back on its epoch wire.
    pub fn apply(
        &mut self,
        req: UpdateReplicationEpochRequest,
    ) -> (SegmentId, Epoch) {
        self.update_to_at_least(req.segment_id, req.epoch);
        (req.segment_id, self.epoch(req.segment_id))
    }
}

//! Master-side replication engine: the ReplicaManager owns every
//! ReplicatedSegment of this master's log and drives them through a
//! cooperative task queue toward the invariant "data is durably buffered on
//! N distinct backups".

mod epoch;
mod failures;
mod replica;
mod segment;
mod selector;
mod writes;

pub use epoch::{EpochWire, ReplicationEpochTask};
pub use replica::{Progress, Replica, WriteRpc};
pub use selector::BackupSelector;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::ids::{Epoch, SegmentId, ServerId};
use crate::rpc::{BackupRpcHub, BackupWire, RpcId, RpcOutcome};
use crate::segment::Segment;
use crate::utils::SeglineError;

use segment::ReplicatedSegment;

use serde::Deserialize;

use tokio::sync::mpsc;
use tokio::time::{self, Duration};

/// Maximum number of write RPCs outstanding across all segments of one
/// master. Caps the memory pinned by in-flight payloads and keeps backups
/// responsive to recovery reads.
pub const MAX_WRITE_RPCS_IN_FLIGHT: u32 = 4;

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicaManagerConfig {
    /// Number of replicas maintained per segment.
    pub num_replicas: usize,

    /// Maximum bytes sent in a single write RPC. Splitting large syncs into
    /// several writes unclogs backups a bit for concurrent recovery reads.
    pub max_bytes_per_write_rpc: u32,
}

#[allow(clippy::derivable_impls)]
impl Default for ReplicaManagerConfig {
    fn default() -> Self {
        ReplicaManagerConfig {
            num_replicas: 3,
            max_bytes_per_write_rpc: 1 << 20,
        }
    }
}

/// Master-side replication engine module.
pub struct ReplicaManager {
    /// The server id of the master whose log is being replicated.
    master_id: ServerId,

    /// Configuration parameters struct.
    config: ReplicaManagerConfig,

    /// Every live ReplicatedSegment, exclusively owned. A segment leaves
    /// this map only once all of its replicas have been freed.
    segments: HashMap<SegmentId, ReplicatedSegment>,

    /// Ids of segments scheduled for a `perform_task` pass.
    task_queue: VecDeque<SegmentId>,

    /// The most recently opened normal log segment (the log head), used to
    /// chain consecutive heads together.
    head_segment: Option<SegmentId>,

    /// Write RPCs currently outstanding across all segments.
    writes_in_flight: u32,

    /// BackupRpcHub module.
    rpc_hub: BackupRpcHub,

    /// BackupSelector module.
    selector: BackupSelector,

    /// Shared coordinator epoch task.
    replication_epoch: ReplicationEpochTask,

    /// Outstanding RPC id -> (segment, replica slot) owning it.
    inflight: HashMap<RpcId, (SegmentId, usize)>,

    /// Completions drained off the hub, awaiting consumption by their
    /// replica's decision tree.
    ready: HashMap<RpcId, RpcOutcome>,

    /// Receiver side of the failure notification channel.
    rx_failure: mpsc::UnboundedReceiver<ServerId>,

    /// Sender side of the failure notification channel, cloned out to the
    /// membership monitor.
    tx_failure: mpsc::UnboundedSender<ServerId>,
}

impl ReplicaManager {
    /// Creates a new replica manager. Returns the manager along with the
    /// transport-side wire handles for backup RPCs and coordinator epoch
    /// updates.
    pub fn new_and_setup(
        master_id: ServerId,
        config_str: Option<&str>,
    ) -> Result<(Self, BackupWire, EpochWire), SeglineError> {
        let config = parsed_config!(config_str => ReplicaManagerConfig;
                                    num_replicas, max_bytes_per_write_rpc)?;
        if config.max_bytes_per_write_rpc == 0 {
            return logged_err!(
                "invalid config.max_bytes_per_write_rpc '{}'",
                config.max_bytes_per_write_rpc
            );
        }

        let (rpc_hub, backup_wire) = BackupRpcHub::new_and_setup();
        let (replication_epoch, epoch_wire) =
            ReplicationEpochTask::new_and_setup(master_id);
        let (tx_failure, rx_failure) = mpsc::unbounded_channel();

        Ok((
            ReplicaManager {
                master_id,
                config,
                segments: HashMap::new(),
                task_queue: VecDeque::new(),
                head_segment: None,
                writes_in_flight: 0,
                rpc_hub,
                selector: BackupSelector::new(),
                replication_epoch,
                inflight: HashMap::new(),
                ready: HashMap::new(),
                rx_failure,
                tx_failure,
            },
            backup_wire,
            epoch_wire,
        ))
    }

    /// My master server id.
    pub fn master_id(&self) -> ServerId {
        self.master_id
    }

    /// Registers a backup as a replication target.
    pub fn note_backup(&mut self, backup_id: ServerId) {
        self.selector.note_backup(backup_id);
    }

    /// Hands out a sender the membership monitor uses to push backup
    /// failure notifications; they are drained at every scheduling pass, so
    /// a blocked `sync` observes mid-sync failures.
    pub fn failure_notifier(&self) -> mpsc::UnboundedSender<ServerId> {
        self.tx_failure.clone()
    }

    /// Begins replication of a freshly opened segment. The segment's
    /// current appended prefix becomes the opening write. A normal log
    /// segment is chained after the previous head: it cannot open until the
    /// predecessor is durably open, and the predecessor cannot close until
    /// this segment is durably open.
    pub fn open_segment(
        &mut self,
        segment_id: SegmentId,
        segment: Arc<Segment>,
        normal_log_segment: bool,
    ) -> Result<(), SeglineError> {
        if self.segments.contains_key(&segment_id) {
            return logged_err!(
                "segment {} already under replication",
                segment_id
            );
        }

        let mut new_segment = ReplicatedSegment::new(
            segment_id,
            segment,
            normal_log_segment,
            self.config.num_replicas,
        );

        if new_segment.normal_log_segment {
            if let Some(head_id) = self.head_segment {
                if let Some(head) = self.segments.get_mut(&head_id) {
                    head.following_segment = Some(segment_id);
                    let head_committed = head.get_committed();
                    new_segment.preceding_open_committed =
                        head_committed.open;
                    new_segment.preceding_close_committed =
                        head_committed.close;
                }
            }
            self.head_segment = Some(segment_id);
        }

        pf_debug!(
            "opening segment {} (normal {}, open length {})",
            segment_id,
            normal_log_segment,
            new_segment.open_len
        );
        new_segment.schedule();
        self.segments.insert(segment_id, new_segment);
        self.enqueue(segment_id);
        Ok(())
    }

    /// Requests the eventual close of a segment's replicas. One-shot: once
    /// closed the only valid operation left is `free_segment`. The final
    /// appended length and certificate are read here, so no `append` may
    /// race past this call.
    pub fn close_segment(
        &mut self,
        segment_id: SegmentId,
    ) -> Result<(), SeglineError> {
        let Some(seg) = self.segments.get_mut(&segment_id) else {
            return logged_err!("closing unknown segment {}", segment_id);
        };
        if seg.queued.close {
            return logged_err!("segment {} closed twice", segment_id);
        }

        // queued.bytes must cover the final appended length here, since the
        // segment counts as fully replicated when queued.close is set and
        // committed catches queued.
        let (appended, certificate) = seg.segment.appended_len();
        seg.queued.close = true;
        seg.queued.bytes = appended;
        seg.queued_certificate = certificate;
        seg.schedule();
        self.enqueue(segment_id);

        pf_debug!(
            "segment {} closed (length {})",
            segment_id,
            appended
        );
        Ok(())
    }

    /// Waits until a certificate covering `min(offset, queued.bytes)` bytes
    /// of the segment is durable on all replicas; with `offset = None`,
    /// waits until the segment's close is durable. Either form also waits
    /// out any in-progress lost-open-replica recovery. Blocks
    /// cooperatively: scheduling passes keep running while waiting, and
    /// progress is logged every second if stuck. Never returns failure
    /// short of a torn-down transport; durability may simply take as long
    /// as it takes.
    pub async fn sync(
        &mut self,
        segment_id: SegmentId,
        offset: Option<u32>,
    ) -> Result<(), SeglineError> {
        let Some(seg) = self.segments.get_mut(&segment_id) else {
            return logged_err!("syncing unknown segment {}", segment_id);
        };

        // stretch the queued target to cover everything appended so far
        let (appended, certificate) = seg.segment.appended_len();
        if appended > seg.queued.bytes {
            debug_assert!(!seg.queued.close);
            seg.queued.bytes = appended;
            seg.queued_certificate = certificate;
            seg.schedule();
            self.enqueue(segment_id);
        }
        let target =
            offset.map(|o| o.min(self.segments[&segment_id].queued.bytes));

        if self.sync_target_met(segment_id, target) {
            return Ok(());
        }
        self.schedule(segment_id);

        let mut stuck_secs = 0u64;
        loop {
            // one full rotation of the task queue
            for _ in 0..self.task_queue.len().max(1) {
                self.proceed()?;
            }
            if self.sync_target_met(segment_id, target) {
                return Ok(());
            }

            // nothing more to do until some event arrives
            let mut completion = None;
            let mut failure = None;
            let mut stuck = false;
            tokio::select! {
                result = self.rpc_hub.get_result() => {
                    completion = Some(result?);
                }
                result = self.replication_epoch.recv_confirmation() => {
                    result?;
                }
                failed = self.rx_failure.recv() => {
                    failure = failed;
                }
                _ = time::sleep(Duration::from_secs(1)) => {
                    stuck = true;
                }
            }
            if let Some((rpc_id, outcome)) = completion {
                self.note_completion(rpc_id, outcome);
            }
            if let Some(failed_id) = failure {
                self.handle_backup_failure(failed_id);
            }
            if stuck {
                stuck_secs += 1;
                pf_warn!(
                    "sync of segment {} has taken over {}s; seems stuck",
                    segment_id,
                    stuck_secs
                );
                if let Some(seg) = self.segments.get(&segment_id) {
                    pf_debug!("\n{}", seg.dump_progress());
                }
            }
        }
    }

    /// Requests the eventual freeing of all replicas of a segment; the
    /// segment must have been closed. Syncs first so that anything other
    /// segments were waiting on from this one has happened, then cancels
    /// any write RPCs raced in by failure handling (safe: backups verify
    /// certificates, so garbage bytes are never replayed) and queues the
    /// frees. The segment is destroyed once every replica is freed.
    pub async fn free_segment(
        &mut self,
        segment_id: SegmentId,
    ) -> Result<(), SeglineError> {
        pf_debug!("freeing segment {}", segment_id);
        self.sync(segment_id, None).await?;

        let Some(mut seg) = self.segments.remove(&segment_id) else {
            return logged_err!("freeing unknown segment {}", segment_id);
        };
        if !seg.queued.close {
            self.segments.insert(segment_id, seg);
            return logged_err!(
                "freeing segment {} which was never closed",
                segment_id
            );
        }
        debug_assert!(seg.get_committed().close);
        debug_assert!(seg.following_segment.is_none());

        // cancel writes started since the sync above released control;
        // freeing must not wait on them and no new ones may start
        for replica in seg.replicas.iter_mut() {
            if let Some(write_rpc) = replica.write_rpc.take() {
                self.inflight.remove(&write_rpc.rpc_id);
                self.ready.remove(&write_rpc.rpc_id);
                self.writes_in_flight -= 1;
                replica.sent = replica.acked;
            }
        }
        seg.free_queued = true;
        seg.schedule();
        self.segments.insert(segment_id, seg);
        self.enqueue(segment_id);
        Ok(())
    }

    /// True if no further work is needed for this segment's durability.
    pub fn is_synced(&self, segment_id: SegmentId) -> bool {
        self.segments
            .get(&segment_id)
            .map(|seg| seg.is_synced())
            .unwrap_or(false)
    }

    /// Durable progress of a segment (componentwise min across replicas).
    pub fn committed(&self, segment_id: SegmentId) -> Option<Progress> {
        self.segments.get(&segment_id).map(|seg| seg.get_committed())
    }

    /// True iff the coordinator has confirmed the given replication epoch.
    pub fn epoch_is_at_least(
        &self,
        segment_id: SegmentId,
        epoch: Epoch,
    ) -> bool {
        self.replication_epoch.is_at_least(segment_id, epoch)
    }

    /// Does one scheduling pass: drains failure notifications, RPC
    /// completions, and epoch confirmations, then performs one queued task.
    pub fn proceed(&mut self) -> Result<(), SeglineError> {
        self.drain_events()?;
        self.perform_next_task()
    }

    /// Halts scheduling and drops all replication state. Outstanding RPCs
    /// are abandoned; intended for teardown only.
    pub fn halt_and_cleanup(&mut self) {
        pf_warn!(
            "halting replica manager with {} live segments",
            self.segments.len()
        );
        self.task_queue.clear();
        self.segments.clear();
        self.inflight.clear();
        self.ready.clear();
        self.writes_in_flight = 0;
        self.head_segment = None;
    }

    /// Checks a sync target against current durable progress.
    fn sync_target_met(
        &self,
        segment_id: SegmentId,
        target: Option<u32>,
    ) -> bool {
        let Some(seg) = self.segments.get(&segment_id) else {
            return false;
        };
        if seg.recovering_from_lost_open_replicas {
            return false;
        }
        match target {
            None => seg.get_committed().close,
            Some(t) => seg.get_committed().bytes >= t,
        }
    }

    /// Drains all pending external events into manager state.
    fn drain_events(&mut self) -> Result<(), SeglineError> {
        while let Ok(failed_id) = self.rx_failure.try_recv() {
            self.handle_backup_failure(failed_id);
        }
        while let Some((rpc_id, outcome)) = self.rpc_hub.try_get_result()? {
            self.note_completion(rpc_id, outcome);
        }
        self.replication_epoch.drain_confirmations()
    }

    /// Records a completed RPC and wakes the segment that owns it.
    /// Completions of cancelled RPCs are dropped on the floor.
    fn note_completion(&mut self, rpc_id: RpcId, outcome: RpcOutcome) {
        if let Some(&(segment_id, _slot)) = self.inflight.get(&rpc_id) {
            self.ready.insert(rpc_id, outcome);
            self.schedule(segment_id);
        }
    }

    /// Schedules a segment for a future `perform_task` pass.
    fn schedule(&mut self, segment_id: SegmentId) {
        if let Some(seg) = self.segments.get_mut(&segment_id) {
            if !seg.scheduled {
                seg.schedule();
                self.enqueue(segment_id);
            }
        }
    }

    /// Puts a segment id in the task queue (the caller has set its
    /// scheduled flag).
    fn enqueue(&mut self, segment_id: SegmentId) {
        if !self.task_queue.contains(&segment_id) {
            self.task_queue.push_back(segment_id);
        }
    }

    /// Performs the task at the head of the queue, if any.
    fn perform_next_task(&mut self) -> Result<(), SeglineError> {
        while let Some(segment_id) = self.task_queue.pop_front() {
            if self.segments.contains_key(&segment_id) {
                return self.perform_task(segment_id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests.rs"]
mod master_tests;

//! Per-segment replication state: the ReplicatedSegment owned by the
//! ReplicaManager, driving N replica slots toward durability.

use std::fmt::Write as _;
use std::sync::Arc;

use crate::ids::SegmentId;
use crate::master::replica::{Progress, Replica};
use crate::segment::{Certificate, Segment};

/// Replication state machine for one log segment. All mutation happens
/// under the owning ReplicaManager; this struct only carries state and the
/// few observers that need no manager context.
pub(crate) struct ReplicatedSegment {
    /// Log-unique id of the segment being replicated.
    pub segment_id: SegmentId,

    /// Source bytes. The log writer appends concurrently; replication reads
    /// the appended length when syncing.
    pub segment: Arc<Segment>,

    /// True if this segment was opened as a head of the log (it carries a
    /// log digest and is actively appended to); false for cleaner output.
    pub normal_log_segment: bool,

    /// Bytes covered by the opening write.
    pub open_len: u32,

    /// Certificate attesting to exactly the opening write's bytes.
    pub opening_write_certificate: Certificate,

    /// The progress target every replica is driven toward.
    pub queued: Progress,

    /// Certificate attesting to exactly `queued.bytes`.
    pub queued_certificate: Certificate,

    /// Set once free() has been called; no new write RPCs after this.
    pub free_queued: bool,

    /// The next log head, while its open is not yet known durable here.
    pub following_segment: Option<SegmentId>,

    /// Gates this segment's opening write until the preceding segment's
    /// open is committed, so a recovery always finds the log head chain in
    /// order.
    pub preceding_open_committed: bool,

    /// Gates this segment's data writes until the preceding segment's close
    /// is committed, so these bytes cannot be undetectably lost while the
    /// predecessor might still pose as the head.
    pub preceding_close_committed: bool,

    /// Set while a lost open replica is being shot down via the
    /// replication epoch; cleared only once re-replication is complete and
    /// the coordinator has confirmed the new epoch.
    pub recovering_from_lost_open_replicas: bool,

    /// Whether this segment is in (or wants back into) the task queue.
    pub scheduled: bool,

    /// Replica slots, one per desired copy. Slot 0 is the primary.
    pub replicas: Vec<Replica>,
}

impl ReplicatedSegment {
    /// Creates the replication state for a freshly opened segment, seeding
    /// the queued target with the segment's current appended prefix (the
    /// opening write).
    pub fn new(
        segment_id: SegmentId,
        segment: Arc<Segment>,
        normal_log_segment: bool,
        num_replicas: usize,
    ) -> Self {
        let (open_len, opening_write_certificate) = segment.appended_len();
        let mut replicas = Vec::with_capacity(num_replicas);
        replicas.resize_with(num_replicas, Replica::default);
        ReplicatedSegment {
            segment_id,
            segment,
            normal_log_segment,
            open_len,
            opening_write_certificate,
            queued: Progress {
                open: true,
                bytes: open_len,
                close: false,
                epoch: 0,
            },
            queued_certificate: opening_write_certificate,
            free_queued: false,
            following_segment: None,
            preceding_open_committed: true,
            preceding_close_committed: true,
            recovering_from_lost_open_replicas: false,
            scheduled: false,
            replicas,
        }
    }

    /// Durable progress of the segment as a whole: the componentwise
    /// minimum of `committed` across all replica slots. An inactive slot
    /// contributes zero progress.
    pub fn get_committed(&self) -> Progress {
        let mut committed = Progress {
            open: true,
            bytes: u32::MAX,
            close: true,
            epoch: u64::MAX,
        };
        if self.replicas.is_empty() {
            return Progress::default();
        }
        for replica in &self.replicas {
            committed = committed.min_with(&replica.committed);
        }
        committed
    }

    /// True once every replica carries an epoch stamp current enough that
    /// stale lost replicas can be told apart from it at recovery. Replicas
    /// committed closed are epoch-immune: a sealed certificate makes them
    /// unambiguous on their own.
    pub fn epochs_settled(&self) -> bool {
        self.replicas.iter().all(|r| {
            r.is_active
                && (r.committed.close || r.committed.epoch >= self.queued.epoch)
        })
    }

    /// True if no further actions are needed to durably replicate this
    /// segment. This can flip back as backup failures are learned about.
    pub fn is_synced(&self) -> bool {
        let (appended, _) = self.segment.appended_len();
        if self.queued.bytes != appended {
            return false;
        }
        !self.recovering_from_lost_open_replicas
            && self.get_committed() == self.queued
    }

    /// Marks this segment as wanting future attention from the scheduler.
    pub fn schedule(&mut self) {
        self.scheduled = true;
    }

    /// Renders internal replication state, for diagnosing why a segment's
    /// sync is stuck.
    pub fn dump_progress(&self) -> String {
        let mut info = String::new();
        let committed = self.get_committed();
        let _ = writeln!(
            info,
            "segment {}: queued (open {}, bytes {}, close {}, epoch {}) \
             committed (open {}, bytes {}, close {})",
            self.segment_id,
            self.queued.open,
            self.queued.bytes,
            self.queued.close,
            self.queued.epoch,
            committed.open,
            committed.bytes,
            committed.close,
        );
        for (slot, replica) in self.replicas.iter().enumerate() {
            let _ = writeln!(
                info,
                "  replica {} on backup {}: sent (open {}, bytes {}, \
                 close {}) acked (open {}, bytes {}, close {}) committed \
                 (open {}, bytes {}, close {}, epoch {}) write rpc \
                 outstanding: {}",
                slot,
                if replica.is_active {
                    replica.backup_id.to_string()
                } else {
                    "<none>".into()
                },
                replica.sent.open,
                replica.sent.bytes,
                replica.sent.close,
                replica.acked.open,
                replica.acked.bytes,
                replica.acked.close,
                replica.committed.open,
                replica.committed.bytes,
                replica.committed.close,
                replica.committed.epoch,
                replica.write_rpc.is_some(),
            );
        }
        info
    }
}

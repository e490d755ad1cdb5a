//! ReplicaManager reaction to backup failures, including the lost-open-
//! replica shoot-down protocol.

use super::*;

// ReplicaManager failure handling implementation
impl ReplicaManager {
    /// Responds to a cluster membership change by scheduling whatever work
    /// restores durability guarantees. Every active replica on the failed
    /// backup is reset; if one of them was lost while open (and not already
    /// replicating atomically), its segment cannot prove the lost bytes
    /// were never certified, so the segment bumps its replication epoch and
    /// enters lost-open recovery.
    pub fn handle_backup_failure(&mut self, failed_id: ServerId) {
        self.selector.remove_backup(failed_id);

        let segment_ids: Vec<SegmentId> =
            self.segments.keys().copied().collect();
        for segment_id in segment_ids {
            let Some(mut seg) = self.segments.remove(&segment_id) else {
                continue;
            };
            let mut some_open_replica_lost = false;
            let mut needs_schedule = false;
            for replica in seg.replicas.iter_mut() {
                if !replica.is_active || replica.backup_id != failed_id {
                    continue;
                }
                pf_debug!(
                    "segment {} recovering from lost replica which was on \
                     backup {}",
                    segment_id,
                    failed_id
                );

                if !replica.committed.close && !replica.replicate_atomically
                {
                    some_open_replica_lost = true;
                    pf_debug!(
                        "lost replica for segment {} while open due to \
                         crash of backup {}",
                        segment_id,
                        failed_id
                    );
                }

                // outstanding rpcs to the dead backup are abandoned; their
                // completions, if any, get dropped on the floor
                if let Some(write_rpc) = replica.write_rpc.take() {
                    self.inflight.remove(&write_rpc.rpc_id);
                    self.ready.remove(&write_rpc.rpc_id);
                    self.writes_in_flight -= 1;
                }
                if let Some(free_rpc) = replica.free_rpc.take() {
                    self.inflight.remove(&free_rpc);
                    self.ready.remove(&free_rpc);
                }
                replica.reset();
                needs_schedule = true;
            }
            if needs_schedule {
                seg.schedule();
            }

            if some_open_replica_lost {
                seg.queued.epoch += 1;
                seg.recovering_from_lost_open_replicas = true;
                pf_debug!(
                    "segment {} lost an open replica; bumping replication \
                     epoch to {}",
                    segment_id,
                    seg.queued.epoch
                );
                seg.schedule();
            }

            let reschedule = seg.scheduled;
            self.segments.insert(segment_id, seg);
            if reschedule {
                self.enqueue(segment_id);
            }
        }
    }
}

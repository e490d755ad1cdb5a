//! ReplicaManager write-path task logic: the per-segment state machine
//! driven by the cooperative scheduler.

use super::*;

use crate::rpc::{
    BackupRequest, FreeOutcome, FreeSegmentRequest, WriteOutcome,
    WriteSegmentRequest,
};

// ReplicaManager cooperative task implementation
impl ReplicaManager {
    /// Checks replication state of one segment and makes progress in
    /// restoring its invariants. Runs when the scheduler pops the segment
    /// off the task queue; a segment with remaining work reschedules
    /// itself.
    pub(super) fn perform_task(
        &mut self,
        segment_id: SegmentId,
    ) -> Result<(), SeglineError> {
        let Some(mut seg) = self.segments.remove(&segment_id) else {
            return Ok(());
        };
        seg.scheduled = false;

        if seg.free_queued && !seg.recovering_from_lost_open_replicas {
            for slot in 0..seg.replicas.len() {
                self.perform_free(&mut seg, slot)?;
            }
        } else if !seg.free_queued {
            for slot in 0..seg.replicas.len() {
                self.perform_write(&mut seg, slot)?;
            }
        }

        // These steps run even if a free has been queued, otherwise lost
        // open replicas could still be detected as the head of the log
        // during a recovery.
        if seg.recovering_from_lost_open_replicas {
            if seg.get_committed() == seg.queued {
                if !seg.epochs_settled() {
                    // epoch stamp writes still in flight to survivors
                    seg.schedule();
                } else if self
                    .replication_epoch
                    .is_at_least(seg.segment_id, seg.queued.epoch)
                {
                    pf_debug!(
                        "replication epoch ok, lost open replica recovery \
                         complete on segment {}",
                        seg.segment_id
                    );
                    seg.recovering_from_lost_open_replicas = false;
                } else {
                    // Re-replication is done; now make sure replicas with
                    // old epochs can never appear as an open segment in the
                    // log again, even if a lost one comes back from the
                    // grave. Mind queued.epoch here, not the committed
                    // epoch: committed may still carry a stale epoch from a
                    // closed survivor.
                    pf_debug!(
                        "updating replication epoch to ({},{}) on \
                         coordinator to fence lost replicas",
                        seg.segment_id,
                        seg.queued.epoch
                    );
                    self.replication_epoch
                        .update_to_at_least(seg.segment_id, seg.queued.epoch)?;
                    seg.schedule();
                }
            } else {
                // not re-replicated yet; stay scheduled so the epilogue
                // keeps running even when no write work is possible
                seg.schedule();
            }
        }

        let destroy = seg.free_queued
            && !seg.recovering_from_lost_open_replicas
            && !seg.scheduled
            && seg.replicas.iter().all(|r| !r.is_active);
        if destroy {
            pf_debug!("segment {} fully freed, destroying", segment_id);
            if self.head_segment == Some(segment_id) {
                self.head_segment = None;
            }
        } else {
            let reschedule = seg.scheduled;
            self.segments.insert(segment_id, seg);
            if reschedule {
                self.enqueue(segment_id);
            }
        }
        Ok(())
    }

    /// A replica needs no further work once its committed progress matches
    /// the queued target and its epoch stamp is current. A committed-closed
    /// replica is epoch-immune: its sealed certificate disambiguates it at
    /// recovery on its own.
    fn replica_done(replica: &Replica, queued: &Progress) -> bool {
        replica.is_active
            && replica.committed == *queued
            && (replica.committed.close
                || replica.committed.epoch >= queued.epoch)
    }

    /// Makes progress, if possible, in durably writing segment data to one
    /// replica. Repeatedly splits the replica's state into two cases until
    /// exactly one is executed; every path that leaves work behind
    /// reschedules the segment.
    fn perform_write(
        &mut self,
        seg: &mut segment::ReplicatedSegment,
        slot: usize,
    ) -> Result<(), SeglineError> {
        debug_assert!(!seg.free_queued);
        debug_assert!(seg.replicas[slot].free_rpc.is_none());
        let primary = slot == 0;

        if Self::replica_done(&seg.replicas[slot], &seg.queued) {
            return Ok(());
        }

        if !seg.replicas[slot].is_active {
            // Choose a backup for this slot. Selection is separate from the
            // open send below: failures of the open rpc must retry on the
            // same backup unless that backup is discovered failed, else a
            // lost open replica could go unaccounted for.
            let constraints: Vec<ServerId> = seg
                .replicas
                .iter()
                .filter(|r| r.is_active)
                .map(|r| r.backup_id)
                .collect();
            let backup_id = if primary {
                self.selector.select_primary(&constraints)
            } else {
                self.selector.select_secondary(&constraints)
            };
            if !backup_id.is_valid() {
                seg.schedule();
                return Ok(());
            }
            pf_debug!(
                "starting replication of segment {} slot {} on backup {}",
                seg.segment_id,
                slot,
                backup_id
            );
            // a replica placed after a loss, or after the segment already
            // closed, catches up atomically so it cannot be read half-built
            let atomically = seg.recovering_from_lost_open_replicas
                || seg.queued.close;
            seg.replicas[slot].start(backup_id, atomically);
            // fall through to send its opening write
        }

        if let Some(write_rpc) = seg.replicas[slot].write_rpc {
            let Some(outcome) = self.ready.remove(&write_rpc.rpc_id) else {
                // rpc not yet finished, stay scheduled to wait on it
                seg.schedule();
                return Ok(());
            };
            self.inflight.remove(&write_rpc.rpc_id);
            self.writes_in_flight -= 1;
            seg.replicas[slot].write_rpc = None;

            let RpcOutcome::Write(outcome) = outcome else {
                return logged_err!(
                    "free completion arrived for write rpc {}",
                    write_rpc.rpc_id
                );
            };
            match outcome {
                WriteOutcome::Ok { group } => {
                    // the assigned-group hint is advisory; selection here
                    // balances on placement counts instead
                    let _ = group;
                    let replica = &mut seg.replicas[slot];
                    replica.acked = replica.sent;
                    if write_rpc.carried_certificate {
                        // committed advances only when the backup holds a
                        // certificate attesting to what it acked
                        replica.committed = replica.acked;
                    }
                    let committed = seg.get_committed();
                    if let Some(following_id) = seg.following_segment {
                        if committed.open {
                            self.mark_preceding_open_committed(following_id);
                        }
                        if committed.close {
                            self.mark_preceding_close_committed(following_id);
                            // don't poke at potentially freed segments later
                            seg.following_segment = None;
                        }
                    }
                }
                WriteOutcome::BackupDown => {
                    // roll back and wait for the failure notification to
                    // reset this slot
                    pf_warn!(
                        "couldn't write to backup {}; server is down",
                        seg.replicas[slot].backup_id
                    );
                    let replica = &mut seg.replicas[slot];
                    replica.sent = replica.acked;
                }
                WriteOutcome::OpenRejected => {
                    pf_warn!(
                        "couldn't open replica on backup {}; server may be \
                         overloaded or may already hold a replica of this \
                         segment found on storage after a crash; will \
                         choose another backup",
                        seg.replicas[slot].backup_id
                    );
                    seg.replicas[slot].reset();
                }
                WriteOutcome::Failed(err) => {
                    pf_error!(
                        "write to backup {} for segment {} failed: {}",
                        seg.replicas[slot].backup_id,
                        seg.segment_id,
                        err
                    );
                    let replica = &mut seg.replicas[slot];
                    replica.sent = replica.acked;
                }
            }
            if !Self::replica_done(&seg.replicas[slot], &seg.queued)
                || seg.recovering_from_lost_open_replicas
            {
                seg.schedule();
            }
            return Ok(());
        }

        if !seg.replicas[slot].acked.open {
            // No outstanding write, opening write not yet acknowledged.
            if !seg.preceding_open_committed {
                pf_trace!(
                    "cannot open segment {} until preceding segment is \
                     durably open",
                    seg.segment_id
                );
                seg.schedule();
                return Ok(());
            }
            if self.writes_in_flight >= MAX_WRITE_RPCS_IN_FLIGHT {
                seg.schedule();
                return Ok(());
            }

            let replica = &seg.replicas[slot];
            // an atomic re-replication open carries no certificate, so the
            // replica cannot be read until fully caught up
            let certificate = if replica.replicate_atomically {
                None
            } else {
                Some(seg.opening_write_certificate)
            };
            pf_trace!("sending open to backup {}", replica.backup_id);
            let data = seg.segment.read_range(0, seg.open_len)?;
            let rpc_id = self.rpc_hub.submit(
                replica.backup_id,
                BackupRequest::Write(WriteSegmentRequest {
                    master_id: self.master_id,
                    segment_id: seg.segment_id,
                    epoch: seg.queued.epoch,
                    offset: 0,
                    data: data.to_vec(),
                    certificate,
                    open: true,
                    close: false,
                    primary,
                    atomic: replica.replicate_atomically,
                }),
            )?;
            self.inflight.insert(rpc_id, (seg.segment_id, slot));
            self.writes_in_flight += 1;
            let replica = &mut seg.replicas[slot];
            replica.write_rpc = Some(WriteRpc {
                rpc_id,
                carried_certificate: certificate.is_some(),
            });
            replica.sent.open = true;
            replica.sent.bytes = seg.open_len;
            replica.sent.epoch = seg.queued.epoch;
            seg.schedule();
            return Ok(());
        }

        if seg.replicas[slot].sent < seg.queued {
            // Some part of the queued data has not been sent yet.
            if !seg.preceding_close_committed {
                // Gated until the preceding segment in the log is durably
                // closed, so these bytes cannot be undetectably lost while
                // the predecessor might still pose as the head.
                pf_trace!(
                    "cannot write segment {} until preceding segment is \
                     durably closed",
                    seg.segment_id
                );
                seg.schedule();
                return Ok(());
            }

            let offset = seg.replicas[slot].sent.bytes;
            let mut length = seg.queued.bytes - offset;
            let mut certificate = Some(seg.queued_certificate);
            // Splitting breaks entry atomicity, which can happen anyway if
            // a segment is partially written to storage. The certificate
            // goes out only with the chunk consuming the last queued byte.
            if length > self.config.max_bytes_per_write_rpc {
                length = self.config.max_bytes_per_write_rpc;
                certificate = None;
            }

            let send_close =
                seg.queued.close && (offset + length) == seg.queued.bytes;
            if send_close {
                if let Some(following_id) = seg.following_segment {
                    let follower_open = self
                        .segments
                        .get(&following_id)
                        .map(|f| f.get_committed().open)
                        .unwrap_or(true);
                    if !follower_open {
                        // A recovery must find an open segment after this
                        // one, which tells the coordinator the whole log
                        // was found; defer the close until then.
                        pf_trace!(
                            "cannot close segment {} until following \
                             segment is durably open",
                            seg.segment_id
                        );
                        seg.schedule();
                        return Ok(());
                    }
                }
            }

            if self.writes_in_flight >= MAX_WRITE_RPCS_IN_FLIGHT {
                pf_trace!(
                    "cannot write segment {}, too many writes in flight",
                    seg.segment_id
                );
                seg.schedule();
                return Ok(());
            }

            let data = seg.segment.read_range(offset, length)?;
            pf_trace!(
                "sending write to backup {}",
                seg.replicas[slot].backup_id
            );
            let atomic = seg.replicas[slot].replicate_atomically;
            let rpc_id = self.rpc_hub.submit(
                seg.replicas[slot].backup_id,
                BackupRequest::Write(WriteSegmentRequest {
                    master_id: self.master_id,
                    segment_id: seg.segment_id,
                    epoch: seg.queued.epoch,
                    offset,
                    data: data.to_vec(),
                    certificate,
                    open: false,
                    close: send_close,
                    primary,
                    atomic,
                }),
            )?;
            self.inflight.insert(rpc_id, (seg.segment_id, slot));
            self.writes_in_flight += 1;
            let replica = &mut seg.replicas[slot];
            replica.write_rpc = Some(WriteRpc {
                rpc_id,
                carried_certificate: certificate.is_some(),
            });
            replica.sent.bytes += length;
            replica.sent.close = send_close;
            replica.sent.epoch = seg.queued.epoch;
            seg.schedule();
            return Ok(());
        }

        // Everything queued has been sent, but the replica is still not
        // done: its last write carried no certificate (atomic catch-up), or
        // its epoch stamp is behind after a lost-open bump. A zero-length
        // certified write refreshes both.
        if self.writes_in_flight >= MAX_WRITE_RPCS_IN_FLIGHT {
            seg.schedule();
            return Ok(());
        }
        debug_assert!(!seg.replicas[slot].sent.close);
        let certificate = Some(seg.queued_certificate);
        pf_trace!(
            "sending certificate refresh to backup {}",
            seg.replicas[slot].backup_id
        );
        let atomic = seg.replicas[slot].replicate_atomically;
        let rpc_id = self.rpc_hub.submit(
            seg.replicas[slot].backup_id,
            BackupRequest::Write(WriteSegmentRequest {
                master_id: self.master_id,
                segment_id: seg.segment_id,
                epoch: seg.queued.epoch,
                offset: seg.queued.bytes,
                data: vec![],
                certificate,
                open: false,
                close: false,
                primary,
                atomic,
            }),
        )?;
        self.inflight.insert(rpc_id, (seg.segment_id, slot));
        self.writes_in_flight += 1;
        let replica = &mut seg.replicas[slot];
        replica.write_rpc = Some(WriteRpc {
            rpc_id,
            carried_certificate: true,
        });
        replica.sent.epoch = seg.queued.epoch;
        seg.schedule();
        Ok(())
    }

    /// Makes progress, if possible, in freeing one replica regardless of
    /// its local or remote state. Only runs with `free_queued` set.
    fn perform_free(
        &mut self,
        seg: &mut segment::ReplicatedSegment,
        slot: usize,
    ) -> Result<(), SeglineError> {
        if !seg.replicas[slot].is_active {
            // no replica here, no need to reschedule
            return Ok(());
        }

        if let Some(rpc_id) = seg.replicas[slot].free_rpc {
            let Some(outcome) = self.ready.remove(&rpc_id) else {
                // request not yet finished, stay scheduled to wait on it
                seg.schedule();
                return Ok(());
            };
            self.inflight.remove(&rpc_id);
            match outcome {
                RpcOutcome::Free(FreeOutcome::Ok) => {}
                RpcOutcome::Free(FreeOutcome::BackupDown) => {
                    // The backup is already out of the cluster, so this
                    // master's job is done. If the replica resurfaces on
                    // storage after a restart, that backup's replica
                    // garbage collector frees it.
                    pf_debug!(
                        "backup {} already down while freeing segment {}",
                        seg.replicas[slot].backup_id,
                        seg.segment_id
                    );
                }
                RpcOutcome::Write(_) => {
                    return logged_err!(
                        "write completion arrived for free rpc {}",
                        rpc_id
                    );
                }
            }
            seg.replicas[slot].reset();
            return Ok(());
        }

        // No free rpc outstanding; issue one and wait on it. Write rpcs
        // were all cancelled in free_segment() before free_queued was set.
        debug_assert!(seg.replicas[slot].write_rpc.is_none());
        let rpc_id = self.rpc_hub.submit(
            seg.replicas[slot].backup_id,
            BackupRequest::Free(FreeSegmentRequest {
                master_id: self.master_id,
                segment_id: seg.segment_id,
            }),
        )?;
        self.inflight.insert(rpc_id, (seg.segment_id, slot));
        seg.replicas[slot].free_rpc = Some(rpc_id);
        seg.schedule();
        Ok(())
    }

    /// Latches the follower's "preceding segment durably open" gate.
    fn mark_preceding_open_committed(&mut self, segment_id: SegmentId) {
        let mut wake = false;
        if let Some(follower) = self.segments.get_mut(&segment_id) {
            if !follower.preceding_open_committed {
                follower.preceding_open_committed = true;
                wake = true;
            }
        }
        if wake {
            self.schedule(segment_id);
        }
    }

    /// Latches the follower's "preceding segment durably closed" gate.
    fn mark_preceding_close_committed(&mut self, segment_id: SegmentId) {
        let mut wake = false;
        if let Some(follower) = self.segments.get_mut(&segment_id) {
            if !follower.preceding_close_committed {
                follower.preceding_close_committed = true;
                wake = true;
            }
        }
        if wake {
            self.schedule(segment_id);
        }
    }
}

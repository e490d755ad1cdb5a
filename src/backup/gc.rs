//! Background replica garbage collection: reclaiming frames of down
//! masters and probing whether restart-recovered replicas are still
//! needed.

use super::*;

/// State of one `GcFoundOnStorage` task: the restart-recovered replicas of
/// one master, probed one segment at a time.
pub(crate) struct GcReplicasTask {
    pub master_id: ServerId,
    pub segment_ids: VecDeque<SegmentId>,
    pub rpc: Option<RpcId>,
}

impl GcReplicasTask {
    pub fn new(master_id: ServerId, mut segment_ids: Vec<SegmentId>) -> Self {
        segment_ids.sort_unstable();
        GcReplicasTask {
            master_id,
            segment_ids: segment_ids.into(),
            rpc: None,
        }
    }
}

// BackupService garbage collection task implementation
impl BackupService {
    /// Drops a frame and its index entries.
    fn reclaim_frame(&mut self, master_id: ServerId, segment_id: SegmentId) {
        let key = (master_id, segment_id);
        if let Some(frame) = self.frames.remove(&key) {
            self.frame_states.remove(&frame);
            self.storage.free(frame);
        }
    }

    /// A master is permanently gone: free every replica belonging to it
    /// and dispose any in-flight recovery state. Idempotent.
    pub(super) async fn gc_down_server(
        &mut self,
        master_id: ServerId,
    ) -> Result<(), SeglineError> {
        if !self.config.gc {
            return Ok(());
        }
        let segment_ids: Vec<SegmentId> = self
            .frames
            .keys()
            .filter(|(m, _)| *m == master_id)
            .map(|(_, s)| *s)
            .collect();
        if !segment_ids.is_empty() {
            pf_debug!(
                "freeing {} replicas of down master {}",
                segment_ids.len(),
                master_id
            );
        }
        for segment_id in segment_ids {
            self.reclaim_frame(master_id, segment_id);
        }
        if let Some(recovery) = self.recoveries.get_mut(&master_id) {
            recovery.disposed = true;
        }
        self.dispose_recovery(master_id).await
    }

    /// Probes, one segment at a time, whether replicas found on storage at
    /// restart are still needed by the replacement of their master; frees
    /// the ones that are not. While the master is marked crashed, the task
    /// waits for the cluster to recover its failure before asking; once it
    /// is marked down, the replicas are freed outright. Idempotent.
    pub(super) async fn gc_found_on_storage(
        &mut self,
        mut task: GcReplicasTask,
    ) -> Result<(), SeglineError> {
        if !self.config.gc {
            return Ok(());
        }
        let Some(&segment_id) = task.segment_ids.front() else {
            // nothing left to probe, the task cleans itself up
            return Ok(());
        };

        if !self.has_replica(task.master_id, segment_id) {
            // freed in the meantime (e.g. by its master), nothing to probe
            task.segment_ids.pop_front();
            self.task_queue.push_back(BackupTask::GcFoundOnStorage(task));
            return Ok(());
        }

        if let Some(rpc_id) = task.rpc {
            if let Some(needed) = self.query_ready.remove(&rpc_id) {
                task.rpc = None;
                if needed {
                    pf_debug!(
                        "server has not recovered from lost replica; \
                         retaining replica for <{},{}>; will probe replica \
                         status again later",
                        task.master_id,
                        segment_id
                    );
                    task.segment_ids.rotate_left(1);
                } else {
                    pf_debug!(
                        "server has recovered from lost replica; freeing \
                         replica for <{},{}>",
                        task.master_id,
                        segment_id
                    );
                    self.reclaim_frame(task.master_id, segment_id);
                    task.segment_ids.pop_front();
                }
            }
            // reply still pending otherwise; check again next pass
            self.task_queue.push_back(BackupTask::GcFoundOnStorage(task));
            return Ok(());
        }

        match self.server_statuses.get(&task.master_id).copied() {
            Some(ServerStatus::Crashed) => {
                pf_debug!(
                    "server {} marked crashed; waiting for cluster to \
                     recover from its failure before freeing <{},{}>",
                    task.master_id,
                    task.master_id,
                    segment_id
                );
            }
            Some(ServerStatus::Down) => {
                pf_debug!(
                    "server {} marked down; cluster has recovered from its \
                     failure; freeing replica for <{},{}>",
                    task.master_id,
                    task.master_id,
                    segment_id
                );
                self.reclaim_frame(task.master_id, segment_id);
                task.segment_ids.pop_front();
            }
            _ => {
                // ask the (replacement) master whether it still needs it
                let rpc_id = self.next_query_id;
                self.next_query_id += 1;
                let sent = self.tx_query.send((
                    rpc_id,
                    task.master_id,
                    IsReplicaNeededRequest {
                        master_id: task.master_id,
                        segment_id,
                    },
                ));
                match sent {
                    Ok(()) => task.rpc = Some(rpc_id),
                    Err(e) => {
                        pf_warn!(
                            "replica-needed query channel closed: {}",
                            e
                        );
                    }
                }
            }
        }
        self.task_queue.push_back(BackupTask::GcFoundOnStorage(task));
        Ok(())
    }
}

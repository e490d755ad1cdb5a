//! Backup-side replica store: the per-backup frame index and its RPC
//! surface, restart discipline, the recovery read path, and the cooperative
//! tasks for recovery-segment builds and replica garbage collection.

mod gc;
mod recovery;
mod storage;

pub use storage::{
    FrameId, FrameMetadata, FrameStore, Superblock, METADATA_RESERVE,
};

use std::collections::{HashMap, VecDeque};
use std::path::Path;

use crate::ids::{Epoch, GroupId, SegmentId, ServerId, ServerStatus};
use crate::rpc::{
    AssignGroupRequest, BackupError, DigestInfo, GetRecoveryDataRequest,
    GetRecoveryDataResponse, IsReplicaNeededRequest, ReplicaInfo, RpcId,
    StartReadingDataRequest, StartReadingDataResponse, WriteSegmentRequest,
};
use crate::segment::{find_digest, Certificate};
use crate::utils::SeglineError;

use recovery::MasterRecovery;

use serde::Deserialize;

use tokio::sync::mpsc;

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct BackupConfig {
    /// Cluster name this backup stores replicas under. Replicas found on
    /// storage with a different cluster name are scribbled at startup.
    pub cluster_name: String,

    /// Capacity of each replica frame in bytes (the segment size).
    pub frame_capacity: u32,

    /// Number of replica frames.
    pub num_frames: usize,

    /// Path to the backing storage file; empty means volatile in-memory
    /// storage that does not survive restarts.
    pub storage_path: String,

    /// Whether background replica garbage collection is enabled.
    pub gc: bool,
}

#[allow(clippy::derivable_impls)]
impl Default for BackupConfig {
    fn default() -> Self {
        BackupConfig {
            cluster_name: "__unnamed__".into(),
            frame_capacity: 1 << 20,
            num_frames: 16,
            storage_path: "".into(),
            gc: true,
        }
    }
}

/// Runtime state of one in-use frame.
#[derive(Debug, Clone)]
pub(crate) struct FrameState {
    pub master_id: ServerId,
    pub segment_id: SegmentId,

    /// High-water mark of bytes written by the current process.
    pub appended_len: u32,

    /// Latest certificate received; replica bytes are replayable only up
    /// to the length it attests.
    pub certificate: Certificate,

    pub closed: bool,
    pub primary: bool,
    pub epoch: Epoch,

    /// Set while the master is re-replicating this frame atomically; such
    /// a half-built replica is never treated as a potential log head.
    pub atomic: bool,

    /// Replica adopted from storage at restart rather than written by this
    /// process; it can be read for recovery but never re-opened or
    /// appended to.
    pub recovered_from_storage: bool,

    /// Free was requested while a recovery reads this frame; reclaimed
    /// once the recovery is disposed.
    pub free_pending: bool,
}

/// Cooperative work items on the backup's task queue.
pub(crate) enum BackupTask {
    /// Load and filter a crashed master's replicas into recovery segments.
    BuildRecovery(ServerId),

    /// Reclaim everything belonging to a permanently-down master.
    GcDownServer(ServerId),

    /// Probe whether replicas found on storage at restart are still
    /// needed, freeing the ones that are not.
    GcFoundOnStorage(gc::GcReplicasTask),
}

/// The master-facing side of the backup's replica-needed query channel,
/// handed out at setup. Whatever services it (real transport or a test
/// harness) resolves each query to "needed" or not.
pub struct MasterQueryWire {
    /// Receiver side of the query channel.
    pub rx_query:
        mpsc::UnboundedReceiver<(RpcId, ServerId, IsReplicaNeededRequest)>,

    /// Sender side of the reply channel.
    pub tx_reply: mpsc::UnboundedSender<(RpcId, bool)>,
}

/// Backup service module: one per backup process.
pub struct BackupService {
    /// My backup server id.
    id: ServerId,

    /// Configuration parameters struct.
    config: BackupConfig,

    /// FrameStore module.
    storage: FrameStore,

    /// Replica index: (master, segment) -> storage frame.
    frames: HashMap<(ServerId, SegmentId), FrameId>,

    /// Runtime state per in-use frame.
    frame_states: HashMap<FrameId, FrameState>,

    /// In-flight recovery state per crashed master.
    recoveries: HashMap<ServerId, MasterRecovery>,

    /// Replication group advertised on write responses.
    replication_group_id: GroupId,
    replication_group: Vec<ServerId>,

    /// Server id of this backup's prior incarnation if its storage was
    /// found intact at startup; the process enlists as a replacement for
    /// it to reclaim the old id.
    former_server_id: Option<ServerId>,

    /// Cooperative task queue.
    task_queue: VecDeque<BackupTask>,

    /// Last known cluster status per server, fed by the membership
    /// tracker; consulted by the garbage collectors.
    server_statuses: HashMap<ServerId, ServerStatus>,

    /// Next replica-needed query id.
    next_query_id: RpcId,

    /// Sender side of the query channel.
    tx_query:
        mpsc::UnboundedSender<(RpcId, ServerId, IsReplicaNeededRequest)>,

    /// Receiver side of the reply channel.
    rx_reply: mpsc::UnboundedReceiver<(RpcId, bool)>,

    /// Replies drained off the channel, awaiting their task.
    query_ready: HashMap<RpcId, bool>,
}

fn storage_err(e: SeglineError) -> BackupError {
    BackupError::StorageError {
        detail: e.to_string(),
    }
}

impl BackupService {
    /// Creates a new backup service: opens (or creates) its storage,
    /// applies the restart discipline to whatever replicas are found
    /// there, and records the prior incarnation to enlist as a replacement
    /// for. Returns the service plus its master query wire handles.
    pub async fn new_and_setup(
        id: ServerId,
        config_str: Option<&str>,
    ) -> Result<(Self, MasterQueryWire), SeglineError> {
        let config = parsed_config!(config_str => BackupConfig;
                                    cluster_name, frame_capacity,
                                    num_frames, storage_path, gc)?;
        if config.frame_capacity == 0 || config.num_frames == 0 {
            return logged_err!(
                "invalid backup storage geometry: {} frames of {} bytes",
                config.num_frames,
                config.frame_capacity
            );
        }

        let (tx_query, rx_query) = mpsc::unbounded_channel();
        let (tx_reply, rx_reply) = mpsc::unbounded_channel();
        let mut service = BackupService {
            id,
            config,
            storage: FrameStore::new_memory(0, 0),
            frames: HashMap::new(),
            frame_states: HashMap::new(),
            recoveries: HashMap::new(),
            replication_group_id: 0,
            replication_group: vec![],
            former_server_id: None,
            task_queue: VecDeque::new(),
            server_statuses: HashMap::new(),
            next_query_id: 0,
            tx_query,
            rx_reply,
            query_ready: HashMap::new(),
        };

        if service.config.storage_path.is_empty() {
            pf_info!(
                "backup {} using volatile storage; replicas will not \
                 survive restarts",
                id
            );
            service.storage = FrameStore::new_memory(
                service.config.frame_capacity,
                service.config.num_frames,
            );
        } else {
            let (store, superblock) = FrameStore::open_file(
                Path::new(&service.config.storage_path),
                service.config.frame_capacity,
                service.config.num_frames,
            )
            .await?;
            service.storage = store;
            service.restart_from_storage(superblock).await?;
            service
                .storage
                .write_superblock(&service.config.cluster_name, id)
                .await?;
        }

        pf_info!(
            "backup {} will store replicas under cluster name '{}'",
            id,
            service.config.cluster_name
        );
        Ok((
            service,
            MasterQueryWire { rx_query, tx_reply },
        ))
    }

    /// Applies the restart discipline: reuse valid frames of our own
    /// cluster, scribble everything else so stale replicas from another
    /// deployment can never be reused.
    async fn restart_from_storage(
        &mut self,
        superblock: Option<Superblock>,
    ) -> Result<(), SeglineError> {
        let reuse = match &superblock {
            Some(sb) if sb.cluster_name == self.config.cluster_name => {
                pf_info!(
                    "replicas stored on disk have matching cluster name \
                     '{}'; scanning storage to make them available to \
                     recoveries",
                    sb.cluster_name
                );
                true
            }
            Some(sb) => {
                pf_info!(
                    "replicas stored on disk have a different cluster name \
                     ('{}'); scribbling storage so stale replicas left by \
                     old backups are never reused",
                    sb.cluster_name
                );
                false
            }
            None => {
                pf_info!(
                    "no prior owner recorded on backup storage; ignoring \
                     any existing replicas"
                );
                false
            }
        };

        let found = self.storage.scan().await?;
        if !reuse {
            for (frame, _) in found {
                self.storage.scribble(frame).await?;
                self.storage.free(frame);
            }
            return Ok(());
        }

        let mut masters: Vec<ServerId> = vec![];
        for (frame, metadata) in found {
            if metadata.cluster_name != self.config.cluster_name {
                self.storage.scribble(frame).await?;
                self.storage.free(frame);
                continue;
            }
            pf_info!(
                "found stored replica <{},{}> on backup storage in frame \
                 which was {}",
                metadata.master_id,
                metadata.segment_id,
                if metadata.closed { "closed" } else { "open" }
            );
            self.frames
                .insert((metadata.master_id, metadata.segment_id), frame);
            self.frame_states.insert(
                frame,
                FrameState {
                    master_id: metadata.master_id,
                    segment_id: metadata.segment_id,
                    appended_len: metadata.capacity,
                    certificate: metadata.certificate,
                    closed: metadata.closed,
                    primary: metadata.primary,
                    epoch: metadata.epoch,
                    atomic: false,
                    recovered_from_storage: true,
                    free_pending: false,
                },
            );
            if !masters.contains(&metadata.master_id) {
                masters.push(metadata.master_id);
            }
        }

        for master_id in masters {
            let segment_ids: Vec<SegmentId> = self
                .frames
                .keys()
                .filter(|(m, _)| *m == master_id)
                .map(|(_, s)| *s)
                .collect();
            self.task_queue.push_back(BackupTask::GcFoundOnStorage(
                gc::GcReplicasTask::new(master_id, segment_ids),
            ));
        }

        if let Some(sb) = superblock {
            if sb.cluster_name == self.config.cluster_name {
                pf_info!(
                    "will enlist as a replacement for formerly crashed \
                     server {} which left replicas behind on disk",
                    sb.server_id
                );
                self.former_server_id = Some(sb.server_id);
            }
        }
        Ok(())
    }

    /// My backup server id.
    pub fn server_id(&self) -> ServerId {
        self.id
    }

    /// Prior incarnation of this backup, if its storage was found intact.
    pub fn former_server_id(&self) -> Option<ServerId> {
        self.former_server_id
    }

    /// Currently advertised replication group.
    pub fn replication_group(&self) -> (GroupId, &[ServerId]) {
        (self.replication_group_id, &self.replication_group)
    }

    /// True if this backup currently indexes a replica of the segment.
    pub fn has_replica(
        &self,
        master_id: ServerId,
        segment_id: SegmentId,
    ) -> bool {
        self.frames.contains_key(&(master_id, segment_id))
    }

    /// Number of free storage frames.
    pub fn num_free_frames(&self) -> usize {
        self.storage.num_free()
    }

    /// Buffers a byte range of a segment replica. See the request type for
    /// flag semantics; every response carries the backup's current
    /// replication group as a placement hint.
    pub async fn write_segment(
        &mut self,
        req: WriteSegmentRequest,
    ) -> Result<Vec<ServerId>, BackupError> {
        let key = (req.master_id, req.segment_id);
        let frame = if req.open {
            match self.frames.get(&key) {
                Some(&frame) => {
                    let state = &self.frame_states[&frame];
                    if state.recovered_from_storage {
                        // a replica of this segment survived a prior crash
                        // of the same master; handing the frame back could
                        // resurrect stale data under a live segment id
                        pf_warn!(
                            "rejecting open of <{},{}>: conflicting \
                             replica found on storage from a prior crash",
                            req.master_id,
                            req.segment_id
                        );
                        return Err(BackupError::OpenRejected);
                    }
                    if state.closed {
                        return Err(BackupError::BadSegmentId {
                            master_id: req.master_id,
                            segment_id: req.segment_id,
                        });
                    }
                    // idempotent re-open: same frame, metadata unchanged
                    frame
                }
                None => {
                    let Some(frame) = self.storage.allocate() else {
                        pf_warn!(
                            "out of storage frames; rejecting open of \
                             <{},{}>",
                            req.master_id,
                            req.segment_id
                        );
                        return Err(BackupError::OpenRejected);
                    };
                    self.frame_states.insert(
                        frame,
                        FrameState {
                            master_id: req.master_id,
                            segment_id: req.segment_id,
                            appended_len: 0,
                            certificate: Certificate::default(),
                            closed: false,
                            primary: req.primary,
                            epoch: req.epoch,
                            atomic: req.atomic,
                            recovered_from_storage: false,
                            free_pending: false,
                        },
                    );
                    self.frames.insert(key, frame);
                    frame
                }
            }
        } else {
            let Some(&frame) = self.frames.get(&key) else {
                return Err(BackupError::BadSegmentId {
                    master_id: req.master_id,
                    segment_id: req.segment_id,
                });
            };
            let state = &self.frame_states[&frame];
            if state.closed
                || state.recovered_from_storage
                || state.free_pending
            {
                // Writes to a closed frame fail even when they carry the
                // close flag again: a retried closing write that actually
                // reached us the first time is answered on that first
                // request, so a fresh request here means something is off.
                return Err(BackupError::BadSegmentId {
                    master_id: req.master_id,
                    segment_id: req.segment_id,
                });
            }
            frame
        };

        let capacity = self.storage.frame_capacity();
        let length = req.data.len() as u32;
        if req.offset as u64 + length as u64 > capacity as u64 {
            return Err(BackupError::SegmentOverflow {
                offset: req.offset,
                length,
                capacity,
            });
        }

        if !req.data.is_empty() {
            self.storage
                .write_bytes(frame, req.offset, &req.data)
                .await
                .map_err(storage_err)?;
        }

        {
            let Some(state) = self.frame_states.get_mut(&frame) else {
                return Err(storage_err(SeglineError::msg(
                    "frame state missing",
                )));
            };
            state.appended_len = state.appended_len.max(req.offset + length);
            state.epoch = state.epoch.max(req.epoch);
            if let Some(certificate) = req.certificate {
                state.certificate = certificate;
            }
            if certificate_overruns(state) {
                return Err(storage_err(SeglineError::msg(format!(
                    "certificate attests {} bytes but only {} were written",
                    state.certificate.segment_len, state.appended_len,
                ))));
            }
        }

        if req.close {
            // sealing requires that the received writes form a prefix the
            // certificate actually attests
            let state = self.frame_states[&frame].clone();
            let bytes = self
                .storage
                .load_bytes(frame)
                .await
                .map_err(storage_err)?;
            if !state.certificate.verify(&bytes) {
                return Err(storage_err(SeglineError::msg(format!(
                    "closing write of <{},{}> does not form a certified \
                     prefix",
                    req.master_id, req.segment_id,
                ))));
            }
            if let Some(state) = self.frame_states.get_mut(&frame) {
                state.closed = true;
            }
            pf_debug!(
                "replica <{},{}> sealed at {} bytes",
                req.master_id,
                req.segment_id,
                state.certificate.segment_len
            );
        }

        let state = self.frame_states[&frame].clone();
        let metadata = FrameMetadata {
            master_id: state.master_id,
            segment_id: state.segment_id,
            capacity,
            certificate: state.certificate,
            closed: state.closed,
            primary: state.primary,
            epoch: state.epoch,
            cluster_name: self.config.cluster_name.clone(),
            checksum: 0,
        }
        .seal()
        .map_err(storage_err)?;
        self.storage
            .put_metadata(frame, &metadata)
            .await
            .map_err(storage_err)?;

        Ok(self.replication_group.clone())
    }

    /// Drops the replica of a segment. Idempotent; a replica currently
    /// being read by a recovery is reclaimed once that recovery is
    /// disposed instead.
    pub async fn free_segment(
        &mut self,
        master_id: ServerId,
        segment_id: SegmentId,
    ) -> Result<(), SeglineError> {
        let key = (master_id, segment_id);
        let Some(&frame) = self.frames.get(&key) else {
            return Ok(());
        };

        let pinned = self
            .recoveries
            .get(&master_id)
            .map(|r| !r.disposed && r.segments.contains(&segment_id))
            .unwrap_or(false);
        if pinned {
            pf_debug!(
                "replica <{},{}> is being read by a recovery; deferring \
                 its free",
                master_id,
                segment_id
            );
            if let Some(state) = self.frame_states.get_mut(&frame) {
                state.free_pending = true;
            }
            return Ok(());
        }

        pf_debug!(
            "freeing replica for master {} segment {}",
            master_id,
            segment_id
        );
        self.frames.remove(&key);
        self.frame_states.remove(&frame);
        self.storage.free(frame);
        Ok(())
    }

    /// Replaces the advertised replication group.
    pub fn assign_group(&mut self, req: AssignGroupRequest) {
        self.replication_group_id = req.group_id;
        self.replication_group = req.backup_ids;
    }

    /// Reports every replica held for a crashed master and kicks off
    /// asynchronous recovery-segment construction. A retry with the same
    /// recovery id is idempotent; a different id supersedes and disposes
    /// the previous recovery for that master.
    pub async fn start_reading_data(
        &mut self,
        req: StartReadingDataRequest,
    ) -> Result<StartReadingDataResponse, SeglineError> {
        let supersede = match self.recoveries.get_mut(&req.master_id) {
            Some(existing) if existing.recovery_id == req.recovery_id => {
                false
            }
            Some(existing) => {
                pf_info!(
                    "got start reading data for recovery {} for crashed \
                     master {}; abandoning existing recovery {} for that \
                     master and starting anew",
                    req.recovery_id,
                    req.master_id,
                    existing.recovery_id
                );
                existing.disposed = true;
                true
            }
            None => true,
        };
        if supersede {
            self.dispose_recovery(req.master_id).await?;

            let mut segment_ids: Vec<SegmentId> = self
                .frames
                .keys()
                .filter(|(m, _)| *m == req.master_id)
                .map(|(_, s)| *s)
                .collect();
            segment_ids.sort_unstable();
            self.recoveries.insert(
                req.master_id,
                MasterRecovery::new(
                    req.recovery_id,
                    req.master_id,
                    req.partitions.clone(),
                    segment_ids,
                ),
            );
            self.task_queue
                .push_back(BackupTask::BuildRecovery(req.master_id));
            pf_debug!(
                "kicked off building recovery segments for master {}",
                req.master_id
            );
        }

        self.build_start_response(req.master_id).await
    }

    /// Builds the `start_reading_data` listing: every replica with its
    /// stored epoch (primaries first, newest first within each class),
    /// plus every log digest extractable from a certified prefix.
    async fn build_start_response(
        &mut self,
        master_id: ServerId,
    ) -> Result<StartReadingDataResponse, SeglineError> {
        let mut infos: Vec<ReplicaInfo> = vec![];
        let mut frames_of_master: Vec<(FrameId, FrameState)> = vec![];
        for (&(m, _), &frame) in self.frames.iter() {
            if m != master_id {
                continue;
            }
            if let Some(state) = self.frame_states.get(&frame) {
                frames_of_master.push((frame, state.clone()));
            }
        }

        for (_, state) in &frames_of_master {
            infos.push(ReplicaInfo {
                segment_id: state.segment_id,
                length: state.certificate.segment_len,
                primary: state.primary,
                closed: state.closed,
                epoch: state.epoch,
            });
            pf_debug!(
                "crashed master {} had segment {} ({}) with len {}",
                master_id,
                state.segment_id,
                if state.primary { "primary" } else { "secondary" },
                state.certificate.segment_len
            );
        }
        // primaries load first during recovery; report newest first within
        // each class so the head is located as early as possible
        infos.sort_by_key(|info| {
            (!info.primary, std::cmp::Reverse(info.segment_id))
        });

        let mut digests: Vec<DigestInfo> = vec![];
        for (frame, state) in &frames_of_master {
            if state.atomic {
                // a half-built atomic re-replication never poses as a head
                continue;
            }
            let certified = state.certificate.segment_len as usize;
            if certified == 0 {
                continue;
            }
            let bytes = self.storage.load_bytes(*frame).await?;
            if bytes.len() < certified {
                continue;
            }
            if let Some(segment_ids) = find_digest(&bytes[..certified]) {
                digests.push(DigestInfo {
                    segment_id: state.segment_id,
                    length: state.certificate.segment_len,
                    segment_ids,
                });
            }
        }

        pf_debug!(
            "sending {} segment ids for master {} ({} primary)",
            infos.len(),
            master_id,
            infos.iter().filter(|info| info.primary).count()
        );
        Ok(StartReadingDataResponse {
            replicas: infos,
            digests,
        })
    }

    /// Returns one filtered recovery segment, blocking cooperatively (by
    /// driving this backup's own task queue) until it has been built.
    pub async fn get_recovery_data(
        &mut self,
        req: GetRecoveryDataRequest,
    ) -> Result<GetRecoveryDataResponse, BackupError> {
        let bad_segment_id = BackupError::BadSegmentId {
            master_id: req.master_id,
            segment_id: req.segment_id,
        };
        {
            let Some(recovery) = self.recoveries.get(&req.master_id) else {
                return Err(bad_segment_id);
            };
            if recovery.recovery_id != req.recovery_id
                || !recovery.segments.contains(&req.segment_id)
                || !recovery.knows_partition(req.partition_id)
            {
                return Err(bad_segment_id);
            }
        }

        loop {
            let Some(recovery) = self.recoveries.get(&req.master_id) else {
                // disposed while we were driving the task queue
                return Err(bad_segment_id);
            };
            if recovery.recovery_id != req.recovery_id {
                return Err(bad_segment_id);
            }
            if recovery.is_built() {
                break;
            }
            if self.task_queue.is_empty() {
                self.task_queue
                    .push_back(BackupTask::BuildRecovery(req.master_id));
            }
            self.perform_task().await.map_err(storage_err)?;
        }

        let Some(recovery) = self.recoveries.get(&req.master_id) else {
            return Err(bad_segment_id);
        };
        match recovery.built_segment(req.segment_id, req.partition_id) {
            Some(built) => {
                pf_debug!(
                    "get recovery data for master {} segment {} partition \
                     {} complete ({} bytes)",
                    req.master_id,
                    req.segment_id,
                    req.partition_id,
                    built.data.len()
                );
                Ok(GetRecoveryDataResponse {
                    certificate: built.certificate,
                    data: built.data.clone(),
                })
            }
            // the replica failed to load or filter; only this segment is
            // lost to the recovery
            None => Err(bad_segment_id),
        }
    }

    /// Feeds a cluster membership status change. A server going down gets
    /// its replicas reclaimed by the garbage collector.
    pub fn note_server_status(
        &mut self,
        server_id: ServerId,
        status: ServerStatus,
    ) {
        self.server_statuses.insert(server_id, status);
        if status == ServerStatus::Down {
            pf_debug!(
                "server {} marked down; scheduling replica reclamation",
                server_id
            );
            self.task_queue
                .push_back(BackupTask::GcDownServer(server_id));
        }
    }

    /// Performs one task off the cooperative task queue.
    pub async fn perform_task(&mut self) -> Result<(), SeglineError> {
        while let Ok((rpc_id, needed)) = self.rx_reply.try_recv() {
            self.query_ready.insert(rpc_id, needed);
        }
        let Some(task) = self.task_queue.pop_front() else {
            return Ok(());
        };
        match task {
            BackupTask::BuildRecovery(master_id) => {
                self.build_recovery(master_id).await
            }
            BackupTask::GcDownServer(master_id) => {
                self.gc_down_server(master_id).await
            }
            BackupTask::GcFoundOnStorage(task) => {
                self.gc_found_on_storage(task).await
            }
        }
    }

    /// Number of tasks waiting on the cooperative queue.
    pub fn outstanding_tasks(&self) -> usize {
        self.task_queue.len()
    }

    /// Loads and filters every replica of a recovering master.
    async fn build_recovery(
        &mut self,
        master_id: ServerId,
    ) -> Result<(), SeglineError> {
        let pending: Vec<(SegmentId, FrameId, u32)> = match self
            .recoveries
            .get(&master_id)
        {
            Some(recovery) if !recovery.disposed => recovery
                .segments
                .iter()
                .filter(|id| !recovery.built.contains_key(*id))
                .filter_map(|&segment_id| {
                    self.frames.get(&(master_id, segment_id)).map(|&frame| {
                        let certified = self
                            .frame_states
                            .get(&frame)
                            .map(|s| s.certificate.segment_len)
                            .unwrap_or(0);
                        (segment_id, frame, certified)
                    })
                })
                .collect(),
            Some(_) => {
                self.dispose_recovery(master_id).await?;
                return Ok(());
            }
            None => return Ok(()),
        };

        for (segment_id, frame, certified) in pending {
            let outcome = self.storage.load_bytes(frame).await;
            let Some(recovery) = self.recoveries.get_mut(&master_id) else {
                return Ok(());
            };
            match outcome {
                Ok(bytes) if bytes.len() >= certified as usize => {
                    recovery
                        .build_segment(segment_id, &bytes[..certified as usize]);
                }
                Ok(_) => {
                    recovery.built.insert(
                        segment_id,
                        Err("replica shorter than its certificate".into()),
                    );
                }
                Err(e) => {
                    recovery.built.insert(segment_id, Err(e.to_string()));
                }
            }
        }
        Ok(())
    }

    /// Frees deferred frames of a disposed/removed recovery and drops its
    /// state.
    async fn dispose_recovery(
        &mut self,
        master_id: ServerId,
    ) -> Result<(), SeglineError> {
        let Some(recovery) = self.recoveries.remove(&master_id) else {
            return Ok(());
        };
        for segment_id in &recovery.segments {
            let key = (master_id, *segment_id);
            let Some(&frame) = self.frames.get(&key) else {
                continue;
            };
            let deferred = self
                .frame_states
                .get(&frame)
                .map(|s| s.free_pending)
                .unwrap_or(false);
            if deferred {
                self.frames.remove(&key);
                self.frame_states.remove(&frame);
                self.storage.free(frame);
            }
        }
        pf_debug!(
            "state for recovery {} for crashed master {} freed on backup",
            recovery.recovery_id,
            master_id
        );
        Ok(())
    }
}

/// True when a frame's certificate claims more bytes than were written by
/// this process (recovered frames are exempt: their high-water mark is
/// unknown and their certificate is trusted from the metadata checksum).
fn certificate_overruns(state: &FrameState) -> bool {
    !state.recovered_from_storage
        && state.certificate.segment_len > state.appended_len
}

#[cfg(test)]
#[path = "tests.rs"]
mod backup_tests;

//! Backup-side recovery bookkeeping for one crashed master: loading its
//! replicas and filtering them into per-partition recovery segments.

use std::collections::HashMap;

use crate::ids::{
    partition_for, PartitionId, RecoveryId, SegmentId, ServerId, Tablet,
};
use crate::segment::{iter_entries, push_encoded_entry, Certificate, LogEntry};
use crate::utils::SeglineError;

/// One filtered recovery segment: the entries of a replica that fall into
/// a single recovery partition, plus a certificate over the filtered bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RecoverySegment {
    pub certificate: Certificate,
    pub data: Vec<u8>,
}

/// In-flight recovery state for one crashed master on this backup.
pub(crate) struct MasterRecovery {
    /// Identifier of this recovery attempt; requests with a different id
    /// are rejected so readers can never mix two attempts.
    pub recovery_id: RecoveryId,

    /// The crashed master whose replicas are being read.
    pub master_id: ServerId,

    /// Tablet -> partition mapping supplied by the coordinator.
    pub partitions: Vec<Tablet>,

    /// Segments this backup holds for the crashed master.
    pub segments: Vec<SegmentId>,

    /// Recovery segments built so far. Load or filter failures surface
    /// per-segment, so one bad replica does not sink the whole recovery.
    pub built: HashMap<
        SegmentId,
        Result<HashMap<PartitionId, RecoverySegment>, String>,
    >,

    /// Set when a newer recovery superseded this one; cleanup happens at
    /// the next task pass.
    pub disposed: bool,
}

impl MasterRecovery {
    pub fn new(
        recovery_id: RecoveryId,
        master_id: ServerId,
        partitions: Vec<Tablet>,
        segments: Vec<SegmentId>,
    ) -> Self {
        pf_info!(
            "recovery {} building {} recovery segments per replica for \
             crashed master {}",
            recovery_id,
            partitions
                .iter()
                .map(|t| t.partition_id)
                .collect::<std::collections::HashSet<_>>()
                .len(),
            master_id
        );
        MasterRecovery {
            recovery_id,
            master_id,
            partitions,
            segments,
            built: HashMap::new(),
            disposed: false,
        }
    }

    /// True once every held segment has a build outcome.
    pub fn is_built(&self) -> bool {
        self.segments.iter().all(|id| self.built.contains_key(id))
    }

    /// Filters one replica's certified prefix into per-partition recovery
    /// segments and records the outcome.
    pub fn build_segment(&mut self, segment_id: SegmentId, bytes: &[u8]) {
        let outcome = filter_into_partitions(&self.partitions, bytes)
            .map_err(|e| e.to_string());
        if let Err(e) = &outcome {
            pf_warn!(
                "recovery {} could not build segment {} of master {}: {}",
                self.recovery_id,
                segment_id,
                self.master_id,
                e
            );
        }
        self.built.insert(segment_id, outcome);
    }

    /// Looks up a finished recovery segment.
    pub fn built_segment(
        &self,
        segment_id: SegmentId,
        partition_id: PartitionId,
    ) -> Option<&RecoverySegment> {
        match self.built.get(&segment_id) {
            Some(Ok(by_partition)) => by_partition.get(&partition_id),
            _ => None,
        }
    }

    /// True if the given partition id appears in the tablet mapping at all.
    pub fn knows_partition(&self, partition_id: PartitionId) -> bool {
        self.partitions
            .iter()
            .any(|t| t.partition_id == partition_id)
    }
}

/// Walks the certified entries of a replica and splits its objects by the
/// partition their tablet belongs to. Digest entries carry no user data and
/// are dropped. Objects covered by no recovering tablet are dropped too
/// (their tablet is not part of this recovery).
fn filter_into_partitions(
    partitions: &[Tablet],
    bytes: &[u8],
) -> Result<HashMap<PartitionId, RecoverySegment>, SeglineError> {
    let mut buffers: HashMap<PartitionId, Vec<u8>> = HashMap::new();
    for tablet in partitions {
        buffers.entry(tablet.partition_id).or_default();
    }

    for entry in iter_entries(bytes) {
        match entry? {
            LogEntry::Object {
                table_id,
                key_hash,
                value,
            } => {
                if let Some(partition_id) =
                    partition_for(partitions, table_id, key_hash)
                {
                    let buf = buffers.entry(partition_id).or_default();
                    push_encoded_entry(
                        buf,
                        &LogEntry::Object {
                            table_id,
                            key_hash,
                            value,
                        },
                    )?;
                }
            }
            LogEntry::Digest { .. } => {}
        }
    }

    Ok(buffers
        .into_iter()
        .map(|(partition_id, data)| {
            let certificate = Certificate::compute(&data);
            (partition_id, RecoverySegment { certificate, data })
        })
        .collect())
}

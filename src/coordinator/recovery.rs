//! Coordinator-driven recovery of one crashed master: plan the replay,
//! check replacement capacity, and hand partitions to replacement masters.

use crate::coordinator::planner::{
    build_replay_plan, BackupListing, PlanEntry, ReplayPlan,
};
use crate::coordinator::CoordinatorEpochs;
use crate::ids::{PartitionId, RecoveryId, ServerId, Tablet};
use crate::utils::SeglineError;

/// One recovery attempt for one crashed master. The coordinator is the
/// single leader of a recovery; a new attempt gets a fresh id.
pub struct Recovery {
    pub recovery_id: RecoveryId,
    pub crashed_master: ServerId,

    /// The crashed master's tablets, already split into partitions.
    pub tablets: Vec<Tablet>,

    /// The consolidated replay plan over all backup listings.
    pub plan: ReplayPlan,
}

impl Recovery {
    /// Plans a recovery from the backups' replica listings. Fails when the
    /// log head cannot be located or the log is incomplete; nothing is
    /// streamed in that case.
    pub fn new(
        recovery_id: RecoveryId,
        crashed_master: ServerId,
        tablets: Vec<Tablet>,
        listings: &[BackupListing],
        epochs: &CoordinatorEpochs,
    ) -> Result<Self, SeglineError> {
        let plan = build_replay_plan(listings, epochs)?;
        let recovery = Recovery {
            recovery_id,
            crashed_master,
            tablets,
            plan,
        };
        pf_info!(
            "starting recovery {} for crashed master {}: {} partitions, \
             {} plan entries",
            recovery_id,
            crashed_master,
            recovery.partition_ids().len(),
            recovery.plan.entries.len()
        );
        Ok(recovery)
    }

    /// Distinct partitions needing recovery data, in ascending order.
    pub fn partition_ids(&self) -> Vec<PartitionId> {
        let mut ids: Vec<PartitionId> =
            self.tablets.iter().map(|t| t.partition_id).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Assigns each partition to one replacement master. Fatal when fewer
    /// masters are available than partitions need recovering; this is
    /// checked before any data movement starts.
    pub fn assign_partitions(
        &self,
        masters: &[ServerId],
    ) -> Result<Vec<(PartitionId, ServerId)>, SeglineError> {
        let partitions = self.partition_ids();
        if partitions.len() > masters.len() {
            return logged_err!(
                "not enough replacement masters for recovery {}: {} \
                 partitions to recover but only {} masters available",
                self.recovery_id,
                partitions.len(),
                masters.len()
            );
        }
        Ok(partitions
            .into_iter()
            .zip(masters.iter().copied())
            .collect())
    }

    /// The replay plan with duplicate segments collapsed: the first listed
    /// replica of each segment is the one to read; the full plan retains
    /// the fallbacks for when a read fails.
    pub fn replay_sources(&self) -> Vec<PlanEntry> {
        let mut seen = std::collections::HashSet::new();
        self.plan
            .entries
            .iter()
            .filter(|entry| seen.insert(entry.segment_id))
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod recovery_tests {
    use super::*;
    use crate::backup::BackupService;
    use crate::ids::SegmentId;
    use crate::rpc::{
        GetRecoveryDataRequest, StartReadingDataRequest,
        WriteSegmentRequest,
    };
    use crate::segment::{
        iter_entries, push_encoded_entry, Certificate, LogEntry,
    };
    use std::collections::HashMap;

    fn tablets() -> Vec<Tablet> {
        vec![
            Tablet {
                table_id: 123,
                start_key_hash: 0,
                end_key_hash: 9,
                partition_id: 0,
            },
            Tablet {
                table_id: 123,
                start_key_hash: 20,
                end_key_hash: 29,
                partition_id: 0,
            },
            Tablet {
                table_id: 123,
                start_key_hash: 10,
                end_key_hash: 19,
                partition_id: 1,
            },
        ]
    }

    async fn backup_with(
        id: u64,
        replicas: &[(SegmentId, Vec<LogEntry>, bool)],
    ) -> BackupService {
        let (mut backup, _wire) = BackupService::new_and_setup(
            ServerId::new(id),
            Some("frame_capacity = 4096\nnum_frames = 4"),
        )
        .await
        .unwrap();
        for (segment_id, entries, closed) in replicas {
            let mut data = vec![];
            for entry in entries {
                push_encoded_entry(&mut data, entry).unwrap();
            }
            let certificate = Certificate::compute(&data);
            backup
                .write_segment(WriteSegmentRequest {
                    master_id: ServerId::new(99),
                    segment_id: *segment_id,
                    epoch: 0,
                    offset: 0,
                    data,
                    certificate: Some(certificate),
                    open: true,
                    close: *closed,
                    primary: true,
                    atomic: false,
                })
                .await
                .unwrap();
        }
        backup
    }

    fn object(key_hash: u64, value: &str) -> LogEntry {
        LogEntry::Object {
            table_id: 123,
            key_hash,
            value: value.as_bytes().to_vec(),
        }
    }

    async fn collect_listings(
        backups: &mut HashMap<ServerId, BackupService>,
        recovery_id: RecoveryId,
    ) -> Vec<BackupListing> {
        let mut listings = vec![];
        let mut backup_ids: Vec<ServerId> =
            backups.keys().copied().collect();
        backup_ids.sort();
        for backup_id in backup_ids {
            let response = backups
                .get_mut(&backup_id)
                .unwrap()
                .start_reading_data(StartReadingDataRequest {
                    recovery_id,
                    master_id: ServerId::new(99),
                    partitions: tablets(),
                })
                .await
                .unwrap();
            listings.push(BackupListing {
                backup_id,
                response,
            });
        }
        listings
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn recovers_partitions_from_real_backups() {
        let mut backups = HashMap::new();
        backups.insert(
            ServerId::new(1),
            backup_with(
                1,
                &[
                    (
                        88,
                        vec![
                            LogEntry::Digest { segment_ids: vec![88] },
                            object(5, "old-head"),
                        ],
                        true,
                    ),
                    (
                        89,
                        vec![
                            LogEntry::Digest {
                                segment_ids: vec![88, 89],
                            },
                            object(15, "new-head"),
                        ],
                        false,
                    ),
                ],
            )
            .await,
        );
        backups.insert(
            ServerId::new(2),
            backup_with(
                2,
                &[(
                    88,
                    vec![
                        LogEntry::Digest { segment_ids: vec![88] },
                        object(5, "old-head"),
                    ],
                    true,
                )],
            )
            .await,
        );
        backups
            .insert(ServerId::new(3), backup_with(3, &[]).await);

        let listings = collect_listings(&mut backups, 456).await;
        let epochs = CoordinatorEpochs::new();
        let recovery = Recovery::new(
            456,
            ServerId::new(99),
            tablets(),
            &listings,
            &epochs,
        )
        .unwrap();

        assert_eq!(recovery.plan.head_segment_id, 89);
        assert_eq!(recovery.partition_ids(), vec![0, 1]);

        // plan: newest head from backup1 first, then 88 from backup2,
        // then the duplicate of 88 on backup1 as a fallback
        let sources = recovery.replay_sources();
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].segment_id, 89);
        assert_eq!(sources[0].backup_id, ServerId::new(1));
        assert_eq!(sources[1].segment_id, 88);
        assert_eq!(sources[1].backup_id, ServerId::new(2));
        assert_eq!(recovery.plan.entries.len(), 3);

        // two replacement masters suffice for two partitions
        let masters = [ServerId::new(201), ServerId::new(202)];
        let assignments = recovery.assign_partitions(&masters).unwrap();
        assert_eq!(assignments.len(), 2);

        // stream every partition's recovery segments in plan order
        let mut recovered: HashMap<PartitionId, Vec<LogEntry>> =
            HashMap::new();
        for (partition_id, _master) in assignments {
            for entry in recovery.replay_sources() {
                let response = backups
                    .get_mut(&entry.backup_id)
                    .unwrap()
                    .get_recovery_data(GetRecoveryDataRequest {
                        recovery_id: 456,
                        master_id: ServerId::new(99),
                        segment_id: entry.segment_id,
                        partition_id,
                    })
                    .await
                    .unwrap();
                assert!(response.certificate.verify(&response.data));
                recovered.entry(partition_id).or_default().extend(
                    iter_entries(&response.data)
                        .collect::<Result<Vec<_>, _>>()
                        .unwrap(),
                );
            }
        }
        assert_eq!(recovered[&0], vec![object(5, "old-head")]);
        assert_eq!(recovered[&1], vec![object(15, "new-head")]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn not_enough_masters_aborts_recovery() {
        let mut backups = HashMap::new();
        backups.insert(
            ServerId::new(1),
            backup_with(
                1,
                &[(
                    88,
                    vec![LogEntry::Digest { segment_ids: vec![88] }],
                    true,
                )],
            )
            .await,
        );

        // three partitions but only two masters available
        let mut three_partitions = tablets();
        three_partitions.push(Tablet {
            table_id: 123,
            start_key_hash: 30,
            end_key_hash: 39,
            partition_id: 2,
        });
        let listings = collect_listings(&mut backups, 456).await;
        let epochs = CoordinatorEpochs::new();
        let recovery = Recovery::new(
            456,
            ServerId::new(99),
            three_partitions,
            &listings,
            &epochs,
        )
        .unwrap();

        let masters = [ServerId::new(201), ServerId::new(202)];
        assert!(recovery.assign_partitions(&masters).is_err());
        assert_eq!(recovery.partition_ids(), vec![0, 1, 2]);
    }
}

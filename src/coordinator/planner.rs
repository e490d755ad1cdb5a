//! Recovery planning: consolidating per-backup replica listings of a
//! crashed master into one ordered replay plan.

use std::collections::{HashMap, HashSet};

use crate::coordinator::CoordinatorEpochs;
use crate::ids::{SegmentId, ServerId};
use crate::rpc::{ReplicaInfo, StartReadingDataResponse};
use crate::utils::SeglineError;

/// One backup's `start_reading_data` response, tagged with who sent it.
/// The order of listings (and of replicas within one) is preserved by the
/// planner.
#[derive(Debug, Clone)]
pub struct BackupListing {
    pub backup_id: ServerId,
    pub response: StartReadingDataResponse,
}

/// One step of the replay plan: read this segment from this backup.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct PlanEntry {
    pub backup_id: ServerId,
    pub segment_id: SegmentId,
    pub primary: bool,
}

/// The consolidated plan for replaying a crashed master's log.
#[derive(Debug, Clone)]
pub struct ReplayPlan {
    /// The segment chosen as the log head (newest digest, longest on
    /// ties); its digest names the complete log.
    pub head_segment_id: SegmentId,

    /// Every segment id constituting the log, per the chosen digest.
    pub log_segment_ids: Vec<SegmentId>,

    /// Ordered replay entries. No secondary appears before any primary;
    /// within each class, entries keep the order backups reported them,
    /// taken round-robin across backups to spread the read load.
    pub entries: Vec<PlanEntry>,
}

/// A replica is usable iff it is closed (its sealed certificate speaks for
/// itself) or its epoch stamp clears the coordinator's bar for that
/// segment, which rules out open replicas a master lost track of.
fn usable(info: &ReplicaInfo, epochs: &CoordinatorEpochs) -> bool {
    info.closed || info.epoch >= epochs.epoch(info.segment_id)
}

/// Builds the replay plan for one crashed master.
///
/// Fails when no log digest can be found among the usable replicas (the
/// head is unlocatable) or when the chosen digest names a segment no
/// backup can supply (the log is incomplete); recovery of this master is
/// impossible either way.
pub fn build_replay_plan(
    listings: &[BackupListing],
    epochs: &CoordinatorEpochs,
) -> Result<ReplayPlan, SeglineError> {
    // every segment some backup can actually supply
    let mut available: HashSet<SegmentId> = HashSet::new();
    for listing in listings {
        for info in &listing.response.replicas {
            if usable(info, epochs) {
                available.insert(info.segment_id);
            }
        }
    }

    // the head is the newest digest-carrying replica, longest on ties;
    // digests of unusable replicas are as dead as the replicas themselves
    let mut head: Option<(SegmentId, u32, &Vec<SegmentId>)> = None;
    for listing in listings {
        let by_segment: HashMap<SegmentId, &ReplicaInfo> = listing
            .response
            .replicas
            .iter()
            .map(|info| (info.segment_id, info))
            .collect();
        for digest in &listing.response.digests {
            let alive = by_segment
                .get(&digest.segment_id)
                .map(|info| usable(info, epochs))
                .unwrap_or(false);
            if !alive {
                continue;
            }
            let candidate =
                (digest.segment_id, digest.length, &digest.segment_ids);
            if head
                .map(|(id, len, _)| (candidate.0, candidate.1) > (id, len))
                .unwrap_or(true)
            {
                head = Some(candidate);
            }
        }
    }
    let Some((head_segment_id, head_length, log_segment_ids)) = head else {
        return logged_err!(
            "no log digest found among usable replicas; cannot locate the \
             log head"
        );
    };
    pf_info!(
        "segment {} of length {} bytes is the head of the log",
        head_segment_id,
        head_length
    );

    // the digest names the whole log; every named segment must be there
    let mut missing = 0;
    for segment_id in log_segment_ids {
        if !available.contains(segment_id) {
            pf_error!("segment {} is missing!", segment_id);
            missing += 1;
        }
    }
    if missing > 0 {
        return logged_err!(
            "{} segments in the digest, but not obtained from backups; \
             log is incomplete",
            missing
        );
    }

    // primaries phase, then secondaries; round-robin across listings in
    // report order within each phase
    let log_set: HashSet<SegmentId> =
        log_segment_ids.iter().copied().collect();
    let mut entries = vec![];
    for primary_phase in [true, false] {
        let per_backup: Vec<Vec<PlanEntry>> = listings
            .iter()
            .map(|listing| {
                listing
                    .response
                    .replicas
                    .iter()
                    .filter(|info| {
                        info.primary == primary_phase
                            && usable(info, epochs)
                            && log_set.contains(&info.segment_id)
                    })
                    .map(|info| PlanEntry {
                        backup_id: listing.backup_id,
                        segment_id: info.segment_id,
                        primary: info.primary,
                    })
                    .collect()
            })
            .collect();
        let longest =
            per_backup.iter().map(|v| v.len()).max().unwrap_or(0);
        for position in 0..longest {
            for backup_entries in &per_backup {
                if let Some(entry) = backup_entries.get(position) {
                    entries.push(*entry);
                }
            }
        }
    }

    Ok(ReplayPlan {
        head_segment_id,
        log_segment_ids: log_segment_ids.clone(),
        entries,
    })
}

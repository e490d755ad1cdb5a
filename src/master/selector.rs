//! Backup selection for new replicas.

use crate::ids::ServerId;

use rand::prelude::*;

use std::collections::HashMap;

/// Picks backups for new primary/secondary replicas, honoring a constraint
/// set of servers that already hold (or held) a replica of the segment.
///
/// Primary placement balances load by counting primaries handed out so far;
/// secondary placement is uniformly random. Either returns
/// `ServerId::INVALID` when no eligible backup exists, in which case the
/// asking segment reschedules itself and retries later.
pub struct BackupSelector {
    /// Candidate backups currently believed alive.
    candidates: Vec<ServerId>,

    /// How many primaries each candidate has been handed.
    primaries_placed: HashMap<ServerId, u64>,
}

impl BackupSelector {
    /// Creates an empty selector; candidates arrive via `note_backup` as
    /// the membership tracker learns about them.
    pub fn new() -> Self {
        BackupSelector {
            candidates: vec![],
            primaries_placed: HashMap::new(),
        }
    }

    /// Registers a backup as selectable.
    pub fn note_backup(&mut self, backup_id: ServerId) {
        if !self.candidates.contains(&backup_id) {
            self.candidates.push(backup_id);
        }
    }

    /// Removes a failed backup from consideration.
    pub fn remove_backup(&mut self, backup_id: ServerId) {
        self.candidates.retain(|id| *id != backup_id);
        self.primaries_placed.remove(&backup_id);
    }

    /// Chooses a backup for a primary replica: the least-loaded eligible
    /// candidate, ties broken by registration order.
    pub fn select_primary(&mut self, constraints: &[ServerId]) -> ServerId {
        let chosen = self
            .candidates
            .iter()
            .filter(|id| !constraints.contains(id))
            .min_by_key(|id| {
                self.primaries_placed.get(*id).copied().unwrap_or(0)
            })
            .copied();
        match chosen {
            Some(id) => {
                *self.primaries_placed.entry(id).or_insert(0) += 1;
                id
            }
            None => ServerId::INVALID,
        }
    }

    /// Chooses a backup for a secondary replica uniformly at random among
    /// eligible candidates.
    pub fn select_secondary(&mut self, constraints: &[ServerId]) -> ServerId {
        let eligible: Vec<ServerId> = self
            .candidates
            .iter()
            .filter(|id| !constraints.contains(id))
            .copied()
            .collect();
        match eligible.choose(&mut rand::thread_rng()) {
            Some(id) => *id,
            None => ServerId::INVALID,
        }
    }
}

impl Default for BackupSelector {
    fn default() -> Self {
        Self::new()
    }
}

//! Per-(segment, backup) replica record: what was sent, acked, committed,
//! and the RPC currently outstanding for it.

use crate::ids::{Epoch, ServerId};
use crate::rpc::RpcId;

/// Replication progress of one replica through its segment's queued work.
/// Ordered lexicographically on `(open, bytes, close)`; `epoch` rides along
/// and is compared independently, because a fully buffered replica can
/// still be behind on its epoch stamp without being "less replicated".
#[derive(Debug, Default, Clone, Copy)]
pub struct Progress {
    pub open: bool,
    pub bytes: u32,
    pub close: bool,
    pub epoch: Epoch,
}

impl PartialEq for Progress {
    fn eq(&self, other: &Self) -> bool {
        self.open == other.open
            && self.bytes == other.bytes
            && self.close == other.close
    }
}

impl Eq for Progress {}

impl PartialOrd for Progress {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Progress {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.open, self.bytes, self.close).cmp(&(
            other.open,
            other.bytes,
            other.close,
        ))
    }
}

impl Progress {
    /// Componentwise minimum, used to derive a segment's committed progress
    /// across all of its replicas.
    pub fn min_with(&self, other: &Progress) -> Progress {
        Progress {
            open: self.open && other.open,
            bytes: self.bytes.min(other.bytes),
            close: self.close && other.close,
            epoch: self.epoch.min(other.epoch),
        }
    }
}

/// A write RPC outstanding to one replica's backup. Whether it carried a
/// certificate decides if its acknowledgement advances `committed`.
#[derive(Debug, Clone, Copy)]
pub struct WriteRpc {
    pub rpc_id: RpcId,
    pub carried_certificate: bool,
}

/// One replica slot of a ReplicatedSegment. Created inactive; activated by
/// `start` once a backup has been selected; reset whenever that backup
/// fails or rejects the open.
#[derive(Debug, Default)]
pub struct Replica {
    /// Which backup holds this replica; meaningless unless `is_active`.
    pub backup_id: ServerId,

    /// Whether this slot currently points at a live backup.
    pub is_active: bool,

    /// Whether certificates are withheld until this replica has caught up
    /// with all queued data, so it cannot be read mid-catch-up.
    pub replicate_atomically: bool,

    /// Progress sent out in write RPCs (including the one in flight).
    pub sent: Progress,

    /// Progress acknowledged by the backup.
    pub acked: Progress,

    /// Progress the backup can durably attest with a certificate.
    pub committed: Progress,

    /// Outstanding write RPC, at most one at a time.
    pub write_rpc: Option<WriteRpc>,

    /// Outstanding free RPC.
    pub free_rpc: Option<RpcId>,
}

impl Replica {
    /// Activates this slot against the chosen backup.
    pub fn start(&mut self, backup_id: ServerId, atomically: bool) {
        debug_assert!(!self.is_active);
        *self = Replica {
            backup_id,
            is_active: true,
            replicate_atomically: atomically,
            ..Default::default()
        };
    }

    /// Returns the slot to its inactive default, dropping any notion of
    /// outstanding RPCs (the caller reconciles the in-flight accounting).
    pub fn reset(&mut self) {
        *self = Replica::default();
    }
}

#[cfg(test)]
mod replica_tests {
    use super::*;

    #[test]
    fn progress_ordering() {
        let p = |open, bytes, close| Progress {
            open,
            bytes,
            close,
            epoch: 0,
        };
        assert!(p(false, 0, false) < p(true, 0, false));
        assert!(p(true, 10, false) < p(true, 20, false));
        assert!(p(true, 20, false) < p(true, 20, true));
        assert!(p(true, 20, true) > p(true, 10, true));
        assert_eq!(p(true, 20, false), p(true, 20, false));
    }

    #[test]
    fn progress_epoch_compared_independently() {
        let mut a = Progress {
            open: true,
            bytes: 64,
            close: false,
            epoch: 0,
        };
        let b = Progress {
            epoch: 1,
            ..a
        };
        assert_eq!(a, b);
        assert!(a >= b && a <= b);
        a.bytes = 63;
        assert!(a < b);
    }

    #[test]
    fn progress_min() {
        let a = Progress {
            open: true,
            bytes: 30,
            close: true,
            epoch: 2,
        };
        let b = Progress {
            open: true,
            bytes: 50,
            close: false,
            epoch: 1,
        };
        let m = a.min_with(&b);
        assert!(m.open);
        assert_eq!(m.bytes, 30);
        assert!(!m.close);
        assert_eq!(m.epoch, 1);
    }

    #[test]
    fn replica_start_and_reset() {
        let mut replica = Replica::default();
        assert!(!replica.is_active);
        replica.start(ServerId::new(5), true);
        assert!(replica.is_active);
        assert!(replica.replicate_atomically);
        assert_eq!(replica.backup_id, ServerId::new(5));
        replica.reset();
        assert!(!replica.is_active);
        assert!(!replica.replicate_atomically);
    }
}

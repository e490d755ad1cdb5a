//! Shared task advancing (segment id, epoch) tuples at the coordinator, to
//! logically shoot down stale open replicas after a lost-open event.

use std::collections::HashMap;

use crate::ids::{Epoch, SegmentId, ServerId};
use crate::rpc::UpdateReplicationEpochRequest;
use crate::utils::SeglineError;

use tokio::sync::mpsc;

/// The coordinator-facing side of the epoch task, handed out at setup.
pub struct EpochWire {
    /// Receiver side of the update channel.
    pub rx_update: mpsc::UnboundedReceiver<UpdateReplicationEpochRequest>,

    /// Sender side of the confirm channel.
    pub tx_confirm: mpsc::UnboundedSender<(SegmentId, Epoch)>,
}

/// Tracks, per segment id, the epoch this master wants recorded at the
/// coordinator and the highest epoch the coordinator has confirmed durable.
/// Shared by all ReplicatedSegments of one master. All operations are
/// idempotent; only the highest epoch ever wins.
pub struct ReplicationEpochTask {
    /// My server id, stamped into update requests.
    master_id: ServerId,

    /// Highest epoch requested from the coordinator so far (the desired
    /// minimum); used to avoid duplicate update RPCs on the wire.
    requested: HashMap<SegmentId, Epoch>,

    /// Latest confirmed-durable epoch at the coordinator.
    confirmed: HashMap<SegmentId, Epoch>,

    /// Sender side of the update channel.
    tx_update: mpsc::UnboundedSender<UpdateReplicationEpochRequest>,

    /// Receiver side of the confirm channel.
    rx_confirm: mpsc::UnboundedReceiver<(SegmentId, Epoch)>,
}

impl ReplicationEpochTask {
    /// Creates the epoch task along with its coordinator wire handles.
    pub fn new_and_setup(master_id: ServerId) -> (Self, EpochWire) {
        let (tx_update, rx_update) = mpsc::unbounded_channel();
        let (tx_confirm, rx_confirm) = mpsc::unbounded_channel();
        (
            ReplicationEpochTask {
                master_id,
                requested: HashMap::new(),
                confirmed: HashMap::new(),
                tx_update,
                rx_confirm,
            },
            EpochWire {
                rx_update,
                tx_confirm,
            },
        )
    }

    /// True iff the coordinator has confirmed an epoch at least as high as
    /// `epoch` for this segment.
    pub fn is_at_least(&self, segment_id: SegmentId, epoch: Epoch) -> bool {
        self.confirmed
            .get(&segment_id)
            .map(|confirmed| *confirmed >= epoch)
            .unwrap_or(epoch == 0)
    }

    /// Raises the desired epoch for a segment and sends an update to the
    /// coordinator if one for this epoch is not already on the wire.
    pub fn update_to_at_least(
        &mut self,
        segment_id: SegmentId,
        epoch: Epoch,
    ) -> Result<(), SeglineError> {
        let requested = self.requested.entry(segment_id).or_insert(0);
        if *requested >= epoch {
            return Ok(());
        }
        *requested = epoch;
        pf_debug!(
            "requesting replication epoch ({},{}) at coordinator",
            segment_id,
            epoch
        );
        self.tx_update
            .send(UpdateReplicationEpochRequest {
                master_id: self.master_id,
                segment_id,
                epoch,
            })
            .map_err(|e| SeglineError(e.to_string()))
    }

    /// Drains any ready confirmations without blocking.
    pub fn drain_confirmations(&mut self) -> Result<(), SeglineError> {
        loop {
            match self.rx_confirm.try_recv() {
                Ok((segment_id, epoch)) => {
                    self.note_confirmed(segment_id, epoch)
                }
                Err(mpsc::error::TryRecvError::Empty) => return Ok(()),
                Err(e) => return Err(SeglineError(e.to_string())),
            }
        }
    }

    /// Waits for the next confirmation from the coordinator.
    pub async fn recv_confirmation(
        &mut self,
    ) -> Result<(SegmentId, Epoch), SeglineError> {
        match self.rx_confirm.recv().await {
            Some((segment_id, epoch)) => {
                self.note_confirmed(segment_id, epoch);
                Ok((segment_id, epoch))
            }
            None => logged_err!("epoch confirm channel has been closed"),
        }
    }

    fn note_confirmed(&mut self, segment_id: SegmentId, epoch: Epoch) {
        let confirmed = self.confirmed.entry(segment_id).or_insert(0);
        if *confirmed < epoch {
            *confirmed = epoch;
        }
    }
}

#[cfg(test)]
mod epoch_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn update_and_confirm() -> Result<(), SeglineError> {
        let (mut task, mut wire) =
            ReplicationEpochTask::new_and_setup(ServerId::new(7));
        assert!(task.is_at_least(88, 0));
        assert!(!task.is_at_least(88, 1));

        task.update_to_at_least(88, 1)?;
        let req = wire.rx_update.recv().await.unwrap();
        assert_eq!(req.segment_id, 88);
        assert_eq!(req.epoch, 1);
        assert!(!task.is_at_least(88, 1));

        wire.tx_confirm.send((88, 1)).unwrap();
        task.drain_confirmations()?;
        assert!(task.is_at_least(88, 1));
        assert!(!task.is_at_least(88, 2));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn duplicate_updates_not_resent() -> Result<(), SeglineError> {
        let (mut task, mut wire) =
            ReplicationEpochTask::new_and_setup(ServerId::new(7));
        task.update_to_at_least(88, 2)?;
        task.update_to_at_least(88, 2)?;
        task.update_to_at_least(88, 1)?;
        let _ = wire.rx_update.recv().await.unwrap();
        assert!(wire.rx_update.try_recv().is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn highest_confirmation_wins() -> Result<(), SeglineError> {
        let (mut task, wire) =
            ReplicationEpochTask::new_and_setup(ServerId::new(7));
        wire.tx_confirm.send((88, 3)).unwrap();
        wire.tx_confirm.send((88, 2)).unwrap();
        task.drain_confirmations()?;
        assert!(task.is_at_least(88, 3));
        drop(wire);
        Ok(())
    }
}

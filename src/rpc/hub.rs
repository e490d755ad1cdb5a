//! Master-side backup RPC hub.
//!
//! NOTE: The actual transport (connection management, encoding, retransmit)
//! is an external collaborator. The hub only fixes the seam: requests go
//! out on the req channel tagged with an RPC id, completions come back on
//! the ack channel as tagged outcomes. Whatever services the wire decides
//! what "the backup is down" means; the hub never interprets payloads.

use crate::ids::ServerId;
use crate::rpc::{BackupRequest, RpcOutcome};
use crate::utils::SeglineError;

use tokio::sync::mpsc;

/// RPC id type, unique per hub for the lifetime of the master.
pub type RpcId = u64;

/// The transport-facing side of the hub, handed out at setup.
pub struct BackupWire {
    /// Receiver side of the req channel.
    pub rx_req: mpsc::UnboundedReceiver<(RpcId, ServerId, BackupRequest)>,

    /// Sender side of the ack channel.
    pub tx_ack: mpsc::UnboundedSender<(RpcId, RpcOutcome)>,
}

/// Master-side backup RPC hub.
pub struct BackupRpcHub {
    /// Sender side of the req channel.
    tx_req: mpsc::UnboundedSender<(RpcId, ServerId, BackupRequest)>,

    /// Receiver side of the ack channel.
    rx_ack: mpsc::UnboundedReceiver<(RpcId, RpcOutcome)>,

    /// Next RPC id to assign.
    next_rpc_id: RpcId,
}

impl BackupRpcHub {
    /// Creates a new backup RPC hub. Returns the hub along with its wire
    /// handles for the transport side.
    pub fn new_and_setup() -> (Self, BackupWire) {
        let (tx_req, rx_req) = mpsc::unbounded_channel();
        let (tx_ack, rx_ack) = mpsc::unbounded_channel();
        (
            BackupRpcHub {
                tx_req,
                rx_ack,
                next_rpc_id: 0,
            },
            BackupWire { rx_req, tx_ack },
        )
    }

    /// Submits a request to a backup. Returns the assigned RPC id whose
    /// completion will eventually arrive on the ack channel.
    pub fn submit(
        &mut self,
        backup_id: ServerId,
        request: BackupRequest,
    ) -> Result<RpcId, SeglineError> {
        let rpc_id = self.next_rpc_id;
        self.next_rpc_id += 1;
        self.tx_req
            .send((rpc_id, backup_id, request))
            .map_err(|e| SeglineError(e.to_string()))?;
        Ok(rpc_id)
    }

    /// Tries to get the next ready completion without blocking. Returns
    /// `Ok(None)` if no completion is ready right now.
    pub fn try_get_result(
        &mut self,
    ) -> Result<Option<(RpcId, RpcOutcome)>, SeglineError> {
        match self.rx_ack.try_recv() {
            Ok((id, outcome)) => Ok(Some((id, outcome))),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(e) => Err(SeglineError(e.to_string())),
        }
    }

    /// Waits for the next completion by receiving from the ack channel.
    pub async fn get_result(
        &mut self,
    ) -> Result<(RpcId, RpcOutcome), SeglineError> {
        match self.rx_ack.recv().await {
            Some((id, outcome)) => Ok((id, outcome)),
            None => logged_err!("backup rpc ack channel has been closed"),
        }
    }
}

#[cfg(test)]
mod hub_tests {
    use super::*;
    use crate::ids::SegmentId;
    use crate::rpc::{FreeOutcome, FreeSegmentRequest};

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn submit_and_ack() -> Result<(), SeglineError> {
        let (mut hub, mut wire) = BackupRpcHub::new_and_setup();
        let backup = ServerId::new(5);
        let rpc_id = hub.submit(
            backup,
            BackupRequest::Free(FreeSegmentRequest {
                master_id: ServerId::new(99),
                segment_id: 88 as SegmentId,
            }),
        )?;
        assert_eq!(hub.try_get_result()?, None);

        let (got_id, got_backup, _req) = wire.rx_req.recv().await.unwrap();
        assert_eq!(got_id, rpc_id);
        assert_eq!(got_backup, backup);
        wire.tx_ack
            .send((rpc_id, RpcOutcome::Free(FreeOutcome::Ok)))
            .unwrap();

        let (id, outcome) = hub.get_result().await?;
        assert_eq!(id, rpc_id);
        assert_eq!(outcome, RpcOutcome::Free(FreeOutcome::Ok));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn rpc_ids_unique() -> Result<(), SeglineError> {
        let (mut hub, _wire) = BackupRpcHub::new_and_setup();
        let req = BackupRequest::Free(FreeSegmentRequest {
            master_id: ServerId::new(1),
            segment_id: 2,
        });
        let a = hub.submit(ServerId::new(5), req.clone())?;
        let b = hub.submit(ServerId::new(6), req)?;
        assert_ne!(a, b);
        Ok(())
    }
}

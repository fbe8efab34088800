//! Executors for queued provider jobs. Each executor kicks off the work
//! against the local storage node, signals the queue's completion board
//! under the job's natural key, and reports the outcome over the link.

use async_trait::async_trait;
use pinfleet_core::{
    CompletionBoard, ContractAckPayload, Job, JobExecutor, JobSpec, PinAckPayload,
    PinFailedPayload, Result, StorageNodeClient, WireMessage,
};
use std::sync::Arc;
use tokio::sync::mpsc;

pub struct LocalJobExecutor {
    client: Arc<dyn StorageNodeClient>,
    node_address: String,
    outbound: mpsc::UnboundedSender<WireMessage>,
    board: CompletionBoard,
}

impl LocalJobExecutor {
    pub fn new(
        client: Arc<dyn StorageNodeClient>,
        node_address: String,
        outbound: mpsc::UnboundedSender<WireMessage>,
        board: CompletionBoard,
    ) -> Self {
        Self {
            client,
            node_address,
            outbound,
            board,
        }
    }
}

#[async_trait]
impl JobExecutor for LocalJobExecutor {
    async fn start(&self, job: &Job) -> Result<()> {
        let client = self.client.clone();
        let address = self.node_address.clone();
        let outbound = self.outbound.clone();
        let board = self.board.clone();
        let spec = job.spec.clone();

        tokio::spawn(async move {
            match spec {
                JobSpec::Pin { cid } => match client.pin(&address, &cid).await {
                    Ok(()) => {
                        let _ = outbound.send(WireMessage::PinConfirmed(PinAckPayload {
                            cid: cid.clone(),
                        }));
                        board.complete(&cid, Ok(()));
                    }
                    Err(error) => {
                        let _ = outbound.send(WireMessage::PinFailed(PinFailedPayload {
                            cid: cid.clone(),
                            reason: error.to_string(),
                        }));
                        board.complete(&cid, Err(error.to_string()));
                    }
                },
                JobSpec::Unpin { cid } => match client.unpin(&address, &cid).await {
                    Ok(()) => {
                        let _ = outbound.send(WireMessage::UnpinConfirmed(PinAckPayload {
                            cid: cid.clone(),
                        }));
                        board.complete(&cid, Ok(()));
                    }
                    Err(error) => {
                        board.complete(&cid, Err(error.to_string()));
                    }
                },
                JobSpec::AcceptContract { contract_id } => {
                    // Acceptance is an acknowledgement back to the backend;
                    // the storage work itself arrives as a separate pin job.
                    let _ = outbound.send(WireMessage::ContractAccepted(ContractAckPayload {
                        contract_id: contract_id.clone(),
                    }));
                    board.complete(&contract_id, Ok(()));
                }
            }
        });

        Ok(())
    }
}

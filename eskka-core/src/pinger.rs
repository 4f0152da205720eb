use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::membership::Gossip;
use crate::transport::{Envelope, PingOutcome, Transport};

/// One reachability probe delegated to this node by a remote voter.
#[derive(Debug, Clone)]
pub struct PingTask {
    /// Correlation id assigned by the requesting evaluation.
    pub req_id: u64,
    /// Where the verdict must be sent.
    pub reply_to: SocketAddr,
    /// Node to probe.
    pub target: SocketAddr,
    /// Window for the probe.
    pub timeout: Duration,
}

/// Answers distributed reachability probes.
///
/// For every task the pinger runs its own probe of the target and always
/// replies with an affirmative verdict, success or timeout. The requester
/// relies on the difference between a reported timeout and no reply at all:
/// only the former is evidence about the target rather than about the path
/// to this voter.
pub struct Pinger {
    gossip: Arc<Gossip>,
    transport: Arc<dyn Transport>,
}

impl Pinger {
    /// Creates the responder.
    #[must_use]
    pub fn new(gossip: Arc<Gossip>, transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new(Self { gossip, transport })
    }

    /// Starts the task loop; probes run concurrently.
    pub fn spawn(
        self: &Arc<Self>,
        mut tasks: mpsc::UnboundedReceiver<PingTask>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let pinger = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    task = tasks.recv() => match task {
                        Some(task) => {
                            let pinger = Arc::clone(&pinger);
                            tokio::spawn(async move { pinger.answer(task).await });
                        }
                        None => break,
                    }
                }
            }
        })
    }

    async fn answer(&self, task: PingTask) {
        trace!(target = %task.target, req_id = task.req_id, "probing on behalf of a voter");
        let outcome = if self.gossip.probe(task.target, task.timeout).await {
            PingOutcome::Ok
        } else {
            PingOutcome::Timeout
        };
        let response = Envelope::PingResponse {
            req_id: task.req_id,
            voter: self.gossip.self_addr(),
            outcome,
        };
        if let Err(err) = self.transport.send(task.reply_to, &response).await {
            debug!(reply_to = %task.reply_to, "ping response send failed: {err}");
        }
    }
}

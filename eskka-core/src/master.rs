use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use crate::follower::FollowerMsg;
use crate::member::NodeId;
use crate::membership::Gossip;
use crate::state::{ClusterState, StateCodec};
use crate::store::{ClusterStateStore, Priority};
use crate::transport::{Envelope, Transport};

/// Receives one outcome per non-master recipient of a publish.
pub trait AckListener: Send + Sync {
    /// Called exactly once per expected recipient: `None` on success, the
    /// failure or timeout message otherwise.
    fn node_ack(&self, node: &NodeId, error: Option<&str>);
}

impl<F> AckListener for F
where
    F: Fn(&NodeId, Option<&str>) + Send + Sync,
{
    fn node_ack(&self, node: &NodeId, error: Option<&str>) {
        self(node, error);
    }
}

/// Mailbox of the master task.
pub enum MasterMsg {
    /// Host-initiated publication of a new cluster state.
    Publish {
        /// Proposed snapshot; its version must exceed the applied one.
        state: ClusterState,
        /// Listener observing one outcome per recipient.
        acks: Arc<dyn AckListener>,
    },
    /// A follower asking for the current state after regaining quorum.
    PleasePublish {
        /// Address to republish to.
        requester: SocketAddr,
    },
    /// Routed follower acknowledgement.
    Ack {
        /// Version the follower acknowledged.
        version: u64,
        /// Acknowledging node.
        node: NodeId,
        /// `None` on success.
        error: Option<String>,
    },
    /// Self-message: the ack deadline of a publish passed.
    PublishExpired {
        /// Version whose round expires.
        version: u64,
    },
}

/// Tracks acknowledgements for one in-flight publish.
///
/// `Pending` until every expected responder has been heard from or the
/// deadline passes, then `Done`; acknowledgements arriving after that are
/// dropped on the floor.
struct PublishRound {
    expected: BTreeSet<NodeId>,
    acks: Arc<dyn AckListener>,
}

impl PublishRound {
    fn new(expected: BTreeSet<NodeId>, acks: Arc<dyn AckListener>) -> Self {
        Self { expected, acks }
    }

    /// Records one acknowledgement; repeats and strangers are ignored.
    fn ack(&mut self, node: &NodeId, error: Option<&str>) {
        if self.expected.remove(node) {
            self.acks.node_ack(node, error);
        }
    }

    fn is_done(&self) -> bool {
        self.expected.is_empty()
    }

    /// Fails every responder still outstanding at the deadline.
    fn expire(self) {
        for node in &self.expected {
            self.acks.node_ack(node, Some("publish timed out"));
        }
    }
}

/// The elected leader's publication pipeline.
///
/// Exactly one master runs per cluster in the steady state, on the oldest
/// master-eligible member. Brief overlap during failover is tolerated: the
/// version monotonicity of every node's state store arbitrates, not the
/// master itself.
pub struct Master {
    gossip: Arc<Gossip>,
    store: Arc<ClusterStateStore>,
    codec: Arc<dyn StateCodec>,
    transport: Arc<dyn Transport>,
    follower_tx: mpsc::UnboundedSender<FollowerMsg>,
    tx: mpsc::UnboundedSender<MasterMsg>,
    publish_timeout: Duration,
}

impl Master {
    /// Creates the master and its mailbox.
    pub fn new(
        gossip: Arc<Gossip>,
        store: Arc<ClusterStateStore>,
        codec: Arc<dyn StateCodec>,
        transport: Arc<dyn Transport>,
        follower_tx: mpsc::UnboundedSender<FollowerMsg>,
        publish_timeout: Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<MasterMsg>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let master = Arc::new(Self {
            gossip,
            store,
            codec,
            transport,
            follower_tx,
            tx,
            publish_timeout,
        });
        (master, rx)
    }

    /// Handle for routing publishes and acknowledgements.
    #[must_use]
    pub fn sender(&self) -> mpsc::UnboundedSender<MasterMsg> {
        self.tx.clone()
    }

    /// Starts the master loop.
    pub fn spawn(
        self: &Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<MasterMsg>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let master = Arc::clone(self);
        tokio::spawn(async move {
            let mut rounds: HashMap<u64, PublishRound> = HashMap::new();
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    msg = rx.recv() => match msg {
                        None => break,
                        Some(MasterMsg::Publish { state, acks }) => {
                            master.handle_publish(state, acks, &mut rounds).await;
                        }
                        Some(MasterMsg::PleasePublish { requester }) => {
                            master.republish_to(requester).await;
                        }
                        Some(MasterMsg::Ack { version, node, error }) => {
                            if let Some(round) = rounds.get_mut(&version) {
                                round.ack(&node, error.as_deref());
                                if round.is_done() {
                                    rounds.remove(&version);
                                }
                            }
                        }
                        Some(MasterMsg::PublishExpired { version }) => {
                            if let Some(round) = rounds.remove(&version) {
                                debug!(version, "publish deadline passed");
                                round.expire();
                            }
                        }
                    }
                }
            }
            // Whatever is still in flight fails cleanly on the way out.
            for (_, round) in rounds.drain() {
                round.expire();
            }
        })
    }

    async fn handle_publish(
        &self,
        state: ClusterState,
        acks: Arc<dyn AckListener>,
        rounds: &mut HashMap<u64, PublishRound>,
    ) {
        let version = state.version;
        let local_id = self.gossip.self_member().id;
        let recipients: Vec<_> = state
            .nodes
            .values()
            .filter(|node| node.id != local_id)
            .map(|node| (node.id.clone(), node.addr))
            .collect();

        let bytes = match self.codec.encode(&state) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(version, "failed to encode state for publication: {err}");
                let message = err.to_string();
                for (id, _) in &recipients {
                    acks.node_ack(id, Some(&message));
                }
                return;
            }
        };

        info!(version, recipients = recipients.len(), "publishing cluster state");
        for (_, addr) in &recipients {
            let envelope = Envelope::Publish { version, bytes: bytes.clone() };
            if let Err(err) = self.transport.send(*addr, &envelope).await {
                debug!(recipient = %addr, version, "publish send failed: {err}");
            }
        }

        if !recipients.is_empty() {
            if let Some(stale) = rounds.insert(
                version,
                PublishRound::new(recipients.iter().map(|(id, _)| id.clone()).collect(), acks),
            ) {
                warn!(version, "replacing an in-flight publish round of the same version");
                stale.expire();
            }
            let tx = self.tx.clone();
            let deadline = self.publish_timeout;
            tokio::spawn(async move {
                time::sleep(deadline).await;
                let _ = tx.send(MasterMsg::PublishExpired { version });
            });
        }

        self.apply_locally(state).await;
    }

    async fn apply_locally(&self, state: ClusterState) {
        let version = state.version;
        let result = self
            .store
            .submit("master{local-publish}", Priority::Urgent, move |cur| {
                if state.version <= cur.version {
                    return Ok(Arc::clone(cur));
                }
                Ok(Arc::new(state))
            })
            .await;
        match result {
            Ok(transition) => {
                let _ = self
                    .follower_tx
                    .send(FollowerMsg::MasterPublished(transition));
            }
            Err(err) => warn!(version, "local application of published state failed: {err}"),
        }
    }

    /// Republishes the applied state to a single follower that asked for it,
    /// typically after the follower regained its quorum.
    async fn republish_to(&self, requester: SocketAddr) {
        if requester == self.gossip.self_addr() {
            return;
        }
        let current = self.store.current();
        if current.master_node_id.as_ref() != Some(&self.gossip.self_member().id) {
            // Nothing of ours to offer yet.
            return;
        }
        match self.codec.encode(&current) {
            Ok(bytes) => {
                debug!(requester = %requester, version = current.version, "republishing state");
                let envelope = Envelope::Publish { version: current.version, bytes };
                if let Err(err) = self.transport.send(requester, &envelope).await {
                    debug!(requester = %requester, "republish send failed: {err}");
                }
            }
            Err(err) => warn!("failed to encode state for republish: {err}"),
        }
    }
}

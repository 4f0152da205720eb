use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::DiscoveryError;
use crate::membership::Gossip;
use crate::state::{ClusterState, StateCodec, Transition};
use crate::store::{ClusterStateStore, Priority};
use crate::transport::{Envelope, Transport};
use crate::voting::VotingMembers;

/// Cadence of the local quorum check.
pub(crate) const QUORUM_CHECK_INTERVAL: Duration = Duration::from_millis(250);
/// Retry delay after a failed clear-state submission.
const RETRY_CLEAR_STATE_DELAY: Duration = Duration::from_secs(1);

/// Mailbox of the follower task.
#[derive(Debug)]
pub enum FollowerMsg {
    /// A master delivered an encoded snapshot.
    Publish {
        /// Version of the encoded snapshot.
        version: u64,
        /// Codec payload.
        bytes: Vec<u8>,
        /// Address to acknowledge to.
        master: SocketAddr,
    },
    /// The co-located master applied a state locally.
    MasterPublished(Transition),
    /// Self-message: drop all cluster-derived state while without quorum.
    ClearState,
}

/// Accepts master publishes and guards them behind the seed quorum.
///
/// While the node observes a quorum of up seed voters, publishes are decoded
/// and applied through the local store. The moment quorum is lost, the
/// follower clears its state down to a blocked single-node view and rejects
/// every publish until quorum returns, at which point it asks the master to
/// republish.
pub struct Follower {
    gossip: Arc<Gossip>,
    voting: Arc<VotingMembers>,
    store: Arc<ClusterStateStore>,
    codec: Arc<dyn StateCodec>,
    transport: Arc<dyn Transport>,
    tx: mpsc::UnboundedSender<FollowerMsg>,
    first_submit_tx: watch::Sender<bool>,
}

impl Follower {
    /// Creates the follower and its mailbox.
    pub fn new(
        gossip: Arc<Gossip>,
        voting: Arc<VotingMembers>,
        store: Arc<ClusterStateStore>,
        codec: Arc<dyn StateCodec>,
        transport: Arc<dyn Transport>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<FollowerMsg>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (first_submit_tx, _) = watch::channel(false);
        let follower = Arc::new(Self {
            gossip,
            voting,
            store,
            codec,
            transport,
            tx,
            first_submit_tx,
        });
        (follower, rx)
    }

    /// Handle for routing inbound publishes and notifications.
    #[must_use]
    pub fn sender(&self) -> mpsc::UnboundedSender<FollowerMsg> {
        self.tx.clone()
    }

    /// One-shot latch that flips after the first successful state
    /// application on this node.
    #[must_use]
    pub fn first_submit(&self) -> watch::Receiver<bool> {
        self.first_submit_tx.subscribe()
    }

    /// Starts the follower loop.
    pub fn spawn(
        self: &Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<FollowerMsg>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let follower = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = time::interval(QUORUM_CHECK_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // Assume quorum until the first check so a publish racing startup
            // is not spuriously rejected.
            let mut quorum_last = true;
            let mut pending_publish_request = false;

            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        follower
                            .quorum_check(&mut quorum_last, &mut pending_publish_request)
                            .await;
                    }
                    msg = rx.recv() => match msg {
                        None => break,
                        Some(FollowerMsg::Publish { version, bytes, master }) => {
                            follower
                                .handle_publish(version, bytes, master, quorum_last, &mut pending_publish_request)
                                .await;
                        }
                        Some(FollowerMsg::MasterPublished(transition)) => {
                            debug!(version = transition.new.version, "local master applied a state");
                            follower.latch_first_submit();
                            pending_publish_request = false;
                        }
                        Some(FollowerMsg::ClearState) => follower.clear_state().await,
                    }
                }
            }
        })
    }

    async fn handle_publish(
        &self,
        version: u64,
        bytes: Vec<u8>,
        master: SocketAddr,
        quorum_last: bool,
        pending_publish_request: &mut bool,
    ) {
        if !quorum_last {
            let view = self.gossip.quorum_view();
            let err = DiscoveryError::QuorumUnavailable {
                up: self.voting.up_voters(&view),
                seeds: self.voting.len(),
                needed: self.voting.quorum_size(),
            };
            self.ack(master, version, Some(err.to_string())).await;
            return;
        }

        let incoming = match self.codec.decode(&bytes) {
            Ok(state) => state,
            Err(err) => {
                warn!(version, "failed to decode published state: {err}");
                self.ack(master, version, Some(err.to_string())).await;
                return;
            }
        };
        if incoming.master_node_id.as_ref() == Some(&self.gossip.self_member().id) {
            warn!(version, "refusing a publish that names this node as its master");
            self.ack(
                master,
                version,
                Some("publish names the receiving node as master".to_string()),
            )
            .await;
            return;
        }

        let result = self
            .store
            .submit("follower{master-publish}", Priority::Urgent, move |cur| {
                if incoming.version <= cur.version {
                    // Stale replay from a superseded master; keep what we have.
                    return Ok(Arc::clone(cur));
                }
                Ok(Arc::new(ClusterState::merge_incoming(cur, incoming)))
            })
            .await;

        match result {
            Ok(transition) => {
                debug!(
                    version,
                    changed = transition.changed(),
                    "accepted master publish"
                );
                self.latch_first_submit();
                *pending_publish_request = false;
                self.ack(master, version, None).await;
            }
            Err(err) => {
                warn!(version, "state application failed: {err}");
                self.ack(master, version, Some(err.to_string())).await;
            }
        }
    }

    async fn quorum_check(&self, quorum_last: &mut bool, pending_publish_request: &mut bool) {
        let cur = self.voting.quorum_available(&self.gossip.quorum_view());
        if cur != *quorum_last {
            if cur {
                info!("quorum of seed voters regained");
                *pending_publish_request = true;
            } else {
                warn!("quorum of seed voters lost; clearing cluster state");
                let _ = self.tx.send(FollowerMsg::ClearState);
            }
        }
        if *pending_publish_request {
            self.request_publish().await;
        }
        *quorum_last = cur;
    }

    /// Asks the current master to republish; harmless to repeat, and dropped
    /// outright when no master is known or reachable.
    async fn request_publish(&self) {
        let Some(master) = self.gossip.oldest_master_eligible() else { return };
        if master.addr == self.gossip.self_addr() {
            return;
        }
        let envelope = Envelope::PleasePublish { requester: self.gossip.self_addr() };
        if let Err(err) = self.transport.send(master.addr, &envelope).await {
            debug!(master = %master.addr, "publish request send failed: {err}");
        }
    }

    async fn clear_state(&self) {
        if self.voting.quorum_available(&self.gossip.quorum_view()) {
            return;
        }
        let me = self.gossip.self_member();
        let result = self
            .store
            .submit("follower{clear-state}", Priority::Urgent, move |cur| {
                Ok(Arc::new(ClusterState::cleared(
                    cur,
                    me.addr,
                    me.roles.master_eligible,
                )))
            })
            .await;
        match result {
            Ok(transition) => {
                info!(version = transition.new.version, "cleared cluster state");
                self.latch_first_submit();
            }
            Err(err) => {
                warn!("clear-state failed, retrying: {err}");
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    time::sleep(RETRY_CLEAR_STATE_DELAY).await;
                    let _ = tx.send(FollowerMsg::ClearState);
                });
            }
        }
    }

    async fn ack(&self, master: SocketAddr, version: u64, error: Option<String>) {
        let envelope = Envelope::PublishAck {
            version,
            node: self.gossip.self_member().id,
            error,
        };
        if let Err(err) = self.transport.send(master, &envelope).await {
            debug!(master = %master, "publish ack send failed: {err}");
        }
    }

    fn latch_first_submit(&self) {
        self.first_submit_tx.send_replace(true);
    }
}

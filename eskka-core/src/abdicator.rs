use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{info, warn};

use crate::follower::QUORUM_CHECK_INTERVAL;
use crate::membership::Gossip;
use crate::voting::VotingMembers;

/// Why the local discovery instance is being torn down for a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    /// The node held a quorum of seed voters and lost it for longer than the
    /// observation window.
    QuorumLoss,
    /// The cluster marked the local node down; the identity is spent.
    Evicted,
}

/// Watches for sustained quorum loss and triggers a whole-instance restart,
/// the only supported recovery from persistent quorum loss.
///
/// Only the edge from quorum to no-quorum arms the timer; a node that never
/// saw a quorum (e.g. the first seed waiting for its peers) keeps waiting
/// instead.
pub struct Abdicator {
    gossip: Arc<Gossip>,
    voting: Arc<VotingMembers>,
    window: Duration,
    restart_tx: mpsc::UnboundedSender<RestartReason>,
}

impl Abdicator {
    /// Creates the watcher; `window` is how long quorum loss must persist.
    #[must_use]
    pub fn new(
        gossip: Arc<Gossip>,
        voting: Arc<VotingMembers>,
        window: Duration,
        restart_tx: mpsc::UnboundedSender<RestartReason>,
    ) -> Arc<Self> {
        Arc::new(Self { gossip, voting, window, restart_tx })
    }

    /// Starts the watcher loop.
    pub fn spawn(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let abdicator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = time::interval(QUORUM_CHECK_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut had_quorum = false;
            let mut lost_since: Option<Instant> = None;

            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = ticker.tick() => {}
                }
                let available = abdicator
                    .voting
                    .quorum_available(&abdicator.gossip.quorum_view());
                if available {
                    had_quorum = true;
                    lost_since = None;
                    continue;
                }
                if !had_quorum {
                    continue;
                }
                match lost_since {
                    None => {
                        info!(window = ?abdicator.window, "quorum lost; observing before abdication");
                        lost_since = Some(Instant::now());
                    }
                    Some(since) if since.elapsed() >= abdicator.window => {
                        warn!("sustained quorum loss; abdicating and restarting discovery");
                        let _ = abdicator.restart_tx.send(RestartReason::QuorumLoss);
                        return;
                    }
                    Some(_) => {}
                }
            }
        })
    }
}

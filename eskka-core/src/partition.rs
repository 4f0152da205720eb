use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::member::{MemberEvent, MemberStatus};
use crate::membership::Gossip;
use crate::transport::{Envelope, PingOutcome, Transport};
use crate::voting::VotingMembers;

/// Slack multiplier on the ping window to allow for response receipt.
const PING_RECEIPT_FUDGE: f64 = 1.25;

/// Routes inbound ping responses to the evaluation that requested them.
pub struct ResponseCollectors {
    seq: AtomicU64,
    routes: DashMap<u64, mpsc::UnboundedSender<(SocketAddr, PingOutcome)>>,
}

impl ResponseCollectors {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self { seq: AtomicU64::new(0), routes: DashMap::new() })
    }

    fn register(&self) -> (u64, mpsc::UnboundedReceiver<(SocketAddr, PingOutcome)>) {
        let req_id = self.seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.insert(req_id, tx);
        (req_id, rx)
    }

    fn unregister(&self, req_id: u64) {
        self.routes.remove(&req_id);
    }

    /// Delivers one voter verdict; verdicts for finished evaluations are
    /// dropped.
    pub fn route(&self, req_id: u64, voter: SocketAddr, outcome: PingOutcome) {
        if let Some(tx) = self.routes.get(&req_id) {
            let _ = tx.send((voter, outcome));
        }
    }
}

enum MonitorMsg {
    Enroll(SocketAddr),
    Registered(SocketAddr),
    Evaluate(SocketAddr),
    Evaluated {
        target: SocketAddr,
        timeouts: Vec<SocketAddr>,
        responses: usize,
    },
}

struct PendingEval {
    handle: JoinHandle<()>,
    req_id: Option<u64>,
}

/// Quorum-ping partition monitor; runs on voter nodes only.
///
/// A member is downed only on the conjunction of two observations: the local
/// failure detector lost it, and a quorum of seed voters each ran their own
/// probe and affirmatively reported a timeout. Voter silence never counts as
/// a timeout, so a partition that merely cuts this node off from its fellow
/// voters can never manufacture a downing decision.
pub struct PartitionMonitor {
    gossip: Arc<Gossip>,
    voting: Arc<VotingMembers>,
    transport: Arc<dyn Transport>,
    collectors: Arc<ResponseCollectors>,
    eval_delay: Duration,
    ping_timeout: Duration,
    tx: mpsc::UnboundedSender<MonitorMsg>,
    rx_seed: Mutex<Option<mpsc::UnboundedReceiver<MonitorMsg>>>,
}

impl PartitionMonitor {
    /// Creates the monitor.
    #[must_use]
    pub fn new(
        gossip: Arc<Gossip>,
        voting: Arc<VotingMembers>,
        transport: Arc<dyn Transport>,
        collectors: Arc<ResponseCollectors>,
        eval_delay: Duration,
        ping_timeout: Duration,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            gossip,
            voting,
            transport,
            collectors,
            eval_delay,
            ping_timeout,
            tx,
            rx_seed: Mutex::new(Some(rx)),
        })
    }

    /// Starts the monitor loop.
    pub fn spawn(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        let mut rx = monitor
            .rx_seed
            .lock()
            .take()
            .expect("monitor spawned once");
        tokio::spawn(async move {
            let (snapshot, mut events) = monitor.gossip.subscribe();
            let mut state = MonitorState::default();
            for member in snapshot {
                monitor.on_event(&mut state, MemberEvent::Up(member));
            }
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    event = events.recv() => match event {
                        Ok(event) => monitor.on_event(&mut state, event),
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    msg = rx.recv() => match msg {
                        Some(msg) => monitor.on_msg(&mut state, msg).await,
                        None => break,
                    }
                }
            }
            for (_, pending) in state.pending.drain() {
                pending.handle.abort();
                if let Some(req_id) = pending.req_id {
                    monitor.collectors.unregister(req_id);
                }
            }
        })
    }

    fn on_event(&self, state: &mut MonitorState, event: MemberEvent) {
        match event {
            MemberEvent::Up(member) => {
                if self.voting.contains(&member.addr) && state.franchised.insert(member.addr) {
                    debug!(voter = %member.addr, "seed voter up; resolving its pinger");
                    let _ = self.tx.send(MonitorMsg::Enroll(member.addr));
                }
            }
            MemberEvent::Exited(member) | MemberEvent::Removed(member) => {
                state.franchised.remove(&member.addr);
                state.registered.remove(&member.addr);
                state.unreachable.remove(&member.addr);
                self.cancel_pending(state, member.addr);
            }
            MemberEvent::Unreachable(member) => {
                if member.addr == self.gossip.self_addr()
                    || matches!(member.status, MemberStatus::Down | MemberStatus::Exiting)
                {
                    return;
                }
                if state.unreachable.insert(member.addr) {
                    info!(member = %member.addr, delay = ?self.eval_delay, "scheduling partition evaluation");
                }
                if !state.pending.contains_key(&member.addr) {
                    state
                        .pending
                        .insert(member.addr, self.schedule_evaluate(member.addr));
                }
            }
            MemberEvent::Reachable(member) => {
                if state.unreachable.remove(&member.addr) {
                    debug!(member = %member.addr, "member recovered before evaluation");
                }
                self.cancel_pending(state, member.addr);
            }
        }
    }

    async fn on_msg(&self, state: &mut MonitorState, msg: MonitorMsg) {
        match msg {
            MonitorMsg::Enroll(addr) => {
                if !state.franchised.contains(&addr) || state.registered.contains(&addr) {
                    return;
                }
                self.resolve_voter(addr);
            }
            MonitorMsg::Registered(addr) => {
                if state.franchised.contains(&addr) {
                    debug!(voter = %addr, "voter pinger registered");
                    state.registered.insert(addr);
                }
            }
            MonitorMsg::Evaluate(target) => self.evaluate(state, target),
            MonitorMsg::Evaluated { target, timeouts, responses } => {
                state.pending.remove(&target);
                state.unreachable.remove(&target);
                if timeouts.len() >= self.voting.quorum_size() {
                    warn!(
                        member = %target,
                        voters = ?timeouts,
                        "quorum of voters timed out probing member; downing it"
                    );
                    self.gossip.down(target).await;
                } else if self.still_evaluable(target) {
                    debug!(
                        member = %target,
                        timeouts = timeouts.len(),
                        responses,
                        needed = self.voting.quorum_size(),
                        "no quorum of timeouts; re-evaluating"
                    );
                    state.unreachable.insert(target);
                    state.pending.insert(target, self.schedule_evaluate(target));
                }
            }
        }
    }

    /// A voter is only registered once an identity probe confirms its pinger
    /// answers; until then it cannot contribute votes.
    fn resolve_voter(&self, addr: SocketAddr) {
        let gossip = Arc::clone(&self.gossip);
        let tx = self.tx.clone();
        let ping_timeout = self.ping_timeout;
        let retry = self.eval_delay;
        tokio::spawn(async move {
            if gossip.probe(addr, ping_timeout).await {
                let _ = tx.send(MonitorMsg::Registered(addr));
            } else {
                debug!(voter = %addr, "voter pinger not answering; retrying");
                time::sleep(retry).await;
                let _ = tx.send(MonitorMsg::Enroll(addr));
            }
        });
    }

    fn schedule_evaluate(&self, target: SocketAddr) -> PendingEval {
        let tx = self.tx.clone();
        let delay = self.eval_delay;
        let handle = tokio::spawn(async move {
            time::sleep(delay).await;
            let _ = tx.send(MonitorMsg::Evaluate(target));
        });
        PendingEval { handle, req_id: None }
    }

    fn evaluate(&self, state: &mut MonitorState, target: SocketAddr) {
        if !state.unreachable.contains(&target) || !self.still_evaluable(target) {
            state.pending.remove(&target);
            return;
        }
        let voters: Vec<_> = state.registered.iter().copied().collect();
        let (req_id, rx) = self.collectors.register();
        info!(
            member = %target,
            voters = voters.len(),
            "evaluating unreachable member with the registered voters"
        );
        let handle = self.spawn_collector(req_id, rx, voters, target);
        state.pending.insert(target, PendingEval { handle, req_id: Some(req_id) });
    }

    fn spawn_collector(
        &self,
        req_id: u64,
        mut rx: mpsc::UnboundedReceiver<(SocketAddr, PingOutcome)>,
        voters: Vec<SocketAddr>,
        target: SocketAddr,
    ) -> JoinHandle<()> {
        let transport = Arc::clone(&self.transport);
        let collectors = Arc::clone(&self.collectors);
        let tx = self.tx.clone();
        let reply_to = self.gossip.self_addr();
        let ping_timeout = self.ping_timeout;
        tokio::spawn(async move {
            for voter in &voters {
                let request = Envelope::PingRequest {
                    req_id,
                    reply_to,
                    target,
                    timeout: ping_timeout,
                };
                if let Err(err) = transport.send(*voter, &request).await {
                    debug!(voter = %voter, "ping request send failed: {err}");
                }
            }

            let deadline = Instant::now() + ping_timeout.mul_f64(PING_RECEIPT_FUDGE);
            let mut answered = HashSet::new();
            let mut timeouts = Vec::new();
            loop {
                tokio::select! {
                    _ = time::sleep_until(deadline) => break,
                    response = rx.recv() => match response {
                        Some((voter, outcome)) => {
                            if answered.insert(voter) && outcome == PingOutcome::Timeout {
                                timeouts.push(voter);
                            }
                            if answered.len() >= voters.len() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
            collectors.unregister(req_id);
            let _ = tx.send(MonitorMsg::Evaluated {
                target,
                timeouts,
                responses: answered.len(),
            });
        })
    }

    fn still_evaluable(&self, target: SocketAddr) -> bool {
        self.gossip.is_unreachable(target)
            && self
                .gossip
                .member_at(target)
                .is_some_and(|m| !m.status.is_terminal())
    }

    fn cancel_pending(&self, state: &mut MonitorState, addr: SocketAddr) {
        if let Some(pending) = state.pending.remove(&addr) {
            pending.handle.abort();
            if let Some(req_id) = pending.req_id {
                self.collectors.unregister(req_id);
            }
        }
    }
}

#[derive(Default)]
struct MonitorState {
    franchised: HashSet<SocketAddr>,
    registered: BTreeSet<SocketAddr>,
    unreachable: HashSet<SocketAddr>,
    pending: HashMap<SocketAddr, PendingEval>,
}

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::abdicator::{Abdicator, RestartReason};
use crate::config::DiscoveryConfig;
use crate::error::DiscoveryError;
use crate::follower::{Follower, FollowerMsg, QUORUM_CHECK_INTERVAL};
use crate::master::{AckListener, Master, MasterMsg};
use crate::member::{Member, MemberStatus, NodeId};
use crate::membership::Gossip;
use crate::partition::{PartitionMonitor, ResponseCollectors};
use crate::pinger::{PingTask, Pinger};
use crate::state::{ClusterState, StateCodec};
use crate::store::ClusterStateStore;
use crate::transport::{Envelope, Transport, UdpTransport};
use crate::voting::VotingMembers;

const LEAVE_TIMEOUT: Duration = Duration::from_secs(4);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Callback fired once with the first successfully applied cluster state.
pub type InitialStateListener = Box<dyn FnOnce(Arc<ClusterState>) + Send>;

type MasterSlot = Arc<RwLock<Option<mpsc::UnboundedSender<MasterMsg>>>>;

/// The discovery subsystem as the embedding host sees it.
///
/// One instance corresponds to one cluster join with one fresh node
/// identity. After an abdication or eviction the instance tears itself down;
/// [`Supervisor`] (or a host-supplied restart hook) builds a new one.
pub struct Discovery {
    config: DiscoveryConfig,
    store: Arc<ClusterStateStore>,
    codec: Arc<dyn StateCodec>,
    initial_listeners: Arc<Mutex<Vec<InitialStateListener>>>,
    restart_hook: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
    runtime: RwLock<Option<NodeRuntime>>,
    started_tx: watch::Sender<bool>,
}

struct NodeRuntime {
    gossip: Arc<Gossip>,
    master_slot: MasterSlot,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Discovery {
    /// Creates an unstarted instance around the host's store and codec.
    #[must_use]
    pub fn new(
        config: DiscoveryConfig,
        store: Arc<ClusterStateStore>,
        codec: Arc<dyn StateCodec>,
    ) -> Arc<Self> {
        let (started_tx, _) = watch::channel(false);
        Arc::new(Self {
            config,
            store,
            codec,
            initial_listeners: Arc::new(Mutex::new(Vec::new())),
            restart_hook: Mutex::new(None),
            runtime: RwLock::new(None),
            started_tx,
        })
    }

    /// Registers a callback for the first successful state application.
    /// Must be called before [`Discovery::start`].
    pub fn add_initial_state_listener(
        &self,
        listener: impl FnOnce(Arc<ClusterState>) + Send + 'static,
    ) -> Result<(), DiscoveryError> {
        if *self.started_tx.borrow() {
            return Err(DiscoveryError::Configuration(
                "initial-state listeners must be registered before start".to_string(),
            ));
        }
        self.initial_listeners.lock().push(Box::new(listener));
        Ok(())
    }

    /// Installs the hook invoked after the instance tears itself down
    /// (sustained quorum loss, eviction, or startup timeout).
    pub fn set_restart_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.restart_hook.lock() = Some(Arc::new(hook));
    }

    /// Binds the configured UDP endpoint and joins the cluster.
    pub async fn start(self: &Arc<Self>) -> Result<(), DiscoveryError> {
        let bind = self.config.bind_addr()?;
        let transport: Arc<dyn Transport> = Arc::new(UdpTransport::bind(bind).await?);
        self.start_with_transport(transport).await
    }

    /// Joins the cluster over the provided transport.
    pub async fn start_with_transport(
        self: &Arc<Self>,
        transport: Arc<dyn Transport>,
    ) -> Result<(), DiscoveryError> {
        if *self.started_tx.borrow() {
            return Ok(());
        }
        let seeds = self.config.seeds()?;
        let voting = Arc::new(VotingMembers::new(seeds.iter().copied()));
        let advertised = self.config.advertised(transport.local_addr());
        let roles = self.config.roles(advertised, &voting);
        let local = Member {
            addr: advertised,
            id: NodeId::generate(),
            roles,
            status: MemberStatus::Joining,
            joined_at_millis: unix_millis(),
        };
        info!(
            addr = %advertised,
            id = %local.id,
            master_eligible = roles.master_eligible,
            voter = roles.voter,
            "starting discovery"
        );

        let gossip = Gossip::new(
            local,
            seeds,
            self.config.heartbeat_interval,
            self.config.acceptable_heartbeat_pause,
            Arc::clone(&transport),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let collectors = ResponseCollectors::new();
        let master_slot: MasterSlot = Arc::new(RwLock::new(None));

        let (follower, follower_rx) = Follower::new(
            Arc::clone(&gossip),
            Arc::clone(&voting),
            Arc::clone(&self.store),
            Arc::clone(&self.codec),
            Arc::clone(&transport),
        );
        let pinger = Pinger::new(Arc::clone(&gossip), Arc::clone(&transport));
        let (pinger_tx, pinger_rx) = mpsc::unbounded_channel();

        let mut tasks = gossip.spawn(shutdown_rx.clone());
        tasks.push(spawn_router(
            Arc::clone(&transport),
            Arc::clone(&gossip),
            follower.sender(),
            pinger_tx,
            Arc::clone(&master_slot),
            Arc::clone(&collectors),
            shutdown_rx.clone(),
        ));
        tasks.push(follower.spawn(follower_rx, shutdown_rx.clone()));
        tasks.push(pinger.spawn(pinger_rx, shutdown_rx.clone()));

        let mut status_rx = gossip.self_status();
        let startup_deadline = jittered(self.config.startup_timeout);
        let joined = time::timeout(
            startup_deadline,
            status_rx.wait_for(|status| *status == MemberStatus::Up),
        )
        .await;
        if !matches!(joined, Ok(Ok(_))) {
            warn!(deadline = ?startup_deadline, "failed to join before the startup deadline");
            let _ = shutdown_tx.send(true);
            for task in tasks {
                task.abort();
            }
            self.fire_restart_hook();
            return Err(DiscoveryError::StartupTimeout);
        }

        let (restart_tx, mut restart_rx) = mpsc::unbounded_channel();

        if roles.voter {
            let monitor = PartitionMonitor::new(
                Arc::clone(&gossip),
                Arc::clone(&voting),
                Arc::clone(&transport),
                Arc::clone(&collectors),
                self.config.partition.eval_delay,
                self.config.partition.ping_timeout,
            );
            tasks.push(monitor.spawn(shutdown_rx.clone()));
        }

        let abdicator = Abdicator::new(
            Arc::clone(&gossip),
            Arc::clone(&voting),
            self.config.partition.eval_delay,
            restart_tx.clone(),
        );
        tasks.push(abdicator.spawn(shutdown_rx.clone()));

        {
            // Learning of our own eviction is as fatal as quorum loss: the
            // identity is spent and only a restart mints a new one.
            let restart_tx = restart_tx.clone();
            let mut status_rx = gossip.self_status();
            let mut shutdown = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown.changed() => {}
                    result = status_rx.wait_for(|status| *status == MemberStatus::Down) => {
                        if result.is_ok() {
                            let _ = restart_tx.send(RestartReason::Evicted);
                        }
                    }
                }
            }));
        }

        tasks.push(spawn_leader_watch(
            Arc::clone(&gossip),
            Arc::clone(&self.store),
            Arc::clone(&self.codec),
            Arc::clone(&transport),
            follower.sender(),
            Arc::clone(&master_slot),
            self.config.publish_timeout(),
            shutdown_rx.clone(),
        ));

        {
            let listeners = Arc::clone(&self.initial_listeners);
            let store = Arc::clone(&self.store);
            let mut first_submit = follower.first_submit();
            let mut shutdown = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown.changed() => {}
                    result = first_submit.wait_for(|done| *done) => {
                        if result.is_ok() {
                            let pending = std::mem::take(&mut *listeners.lock());
                            let state = store.current();
                            debug!(listeners = pending.len(), "initial cluster state is live");
                            for listener in pending {
                                listener(Arc::clone(&state));
                            }
                        }
                    }
                }
            }));
        }

        {
            let discovery = Arc::clone(self);
            let mut shutdown = shutdown_rx;
            tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown.changed() => {}
                    reason = restart_rx.recv() => {
                        if let Some(reason) = reason {
                            discovery.restart(reason).await;
                        }
                    }
                }
            });
        }

        *self.runtime.write() = Some(NodeRuntime { gossip, master_slot, shutdown_tx, tasks });
        self.started_tx.send_replace(true);
        Ok(())
    }

    /// Live flag: true from successful join until teardown.
    #[must_use]
    pub fn is_started(&self) -> bool {
        *self.started_tx.borrow()
    }

    /// Watchable version of the live flag.
    #[must_use]
    pub fn started_watch(&self) -> watch::Receiver<bool> {
        self.started_tx.subscribe()
    }

    /// Whether the local node currently runs the elected master.
    #[must_use]
    pub fn is_master(&self) -> bool {
        self.runtime
            .read()
            .as_ref()
            .is_some_and(|runtime| runtime.master_slot.read().is_some())
    }

    /// The local member, once joined.
    #[must_use]
    pub fn local_member(&self) -> Option<Member> {
        self.runtime
            .read()
            .as_ref()
            .map(|runtime| runtime.gossip.self_member())
    }

    /// The current membership view.
    #[must_use]
    pub fn members(&self) -> Vec<Member> {
        self.runtime
            .read()
            .as_ref()
            .map(|runtime| runtime.gossip.members())
            .unwrap_or_default()
    }

    /// The member the oldest-ordering currently elects.
    #[must_use]
    pub fn current_master(&self) -> Option<Member> {
        self.runtime
            .read()
            .as_ref()
            .and_then(|runtime| runtime.gossip.oldest_master_eligible())
    }

    /// Forwards a publish request to the locally running master.
    pub fn publish(
        &self,
        state: ClusterState,
        acks: Arc<dyn AckListener>,
    ) -> Result<(), DiscoveryError> {
        let runtime = self.runtime.read();
        let Some(runtime) = runtime.as_ref() else {
            return Err(DiscoveryError::NotStarted);
        };
        let slot = runtime.master_slot.read();
        let Some(tx) = slot.as_ref() else {
            return Err(DiscoveryError::NotMaster);
        };
        tx.send(MasterMsg::Publish { state, acks })
            .map_err(|_| DiscoveryError::NotMaster)
    }

    /// Gracefully leaves the cluster. Idempotent; a missed confirmation is
    /// logged and swallowed.
    pub async fn leave(&self) {
        let gossip = self
            .runtime
            .read()
            .as_ref()
            .map(|runtime| Arc::clone(&runtime.gossip));
        let Some(gossip) = gossip else { return };
        let mut status = gossip.self_status();
        gossip.leave().await;
        match time::timeout(
            LEAVE_TIMEOUT,
            status.wait_for(|s| *s == MemberStatus::Removed),
        )
        .await
        {
            Ok(_) => info!("left the cluster"),
            Err(_) => debug!("timed out awaiting removal confirmation"),
        }
    }

    /// Stops all tasks. Idempotent; slow tasks are aborted after a short
    /// grace period.
    pub async fn shutdown(&self) {
        self.stop_runtime().await;
    }

    /// Graceful leave followed by termination.
    pub async fn close(&self) {
        self.leave().await;
        self.shutdown().await;
    }

    async fn restart(&self, reason: RestartReason) {
        warn!(?reason, "discovery restarting");
        self.stop_runtime().await;
        self.fire_restart_hook();
    }

    async fn stop_runtime(&self) {
        let runtime = self.runtime.write().take();
        let Some(runtime) = runtime else { return };
        let _ = runtime.shutdown_tx.send(true);
        let deadline = time::Instant::now() + SHUTDOWN_TIMEOUT;
        for mut task in runtime.tasks {
            if time::timeout_at(deadline, &mut task).await.is_err() {
                task.abort();
            }
        }
        self.started_tx.send_replace(false);
        debug!("discovery tasks stopped");
    }

    fn fire_restart_hook(&self) {
        let hook = self.restart_hook.lock().clone();
        if let Some(hook) = hook {
            hook();
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_router(
    transport: Arc<dyn Transport>,
    gossip: Arc<Gossip>,
    follower_tx: mpsc::UnboundedSender<FollowerMsg>,
    pinger_tx: mpsc::UnboundedSender<PingTask>,
    master_slot: MasterSlot,
    collectors: Arc<ResponseCollectors>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                received = transport.recv() => match received {
                    Ok((envelope, from)) => match envelope {
                        Envelope::Gossip(message) => gossip.handle(message, from).await,
                        Envelope::Publish { version, bytes } => {
                            let _ = follower_tx.send(FollowerMsg::Publish { version, bytes, master: from });
                        }
                        Envelope::PublishAck { version, node, error } => {
                            let tx = master_slot.read().clone();
                            if let Some(tx) = tx {
                                let _ = tx.send(MasterMsg::Ack { version, node, error });
                            }
                        }
                        Envelope::PleasePublish { requester } => {
                            let tx = master_slot.read().clone();
                            if let Some(tx) = tx {
                                let _ = tx.send(MasterMsg::PleasePublish { requester });
                            }
                        }
                        Envelope::PingRequest { req_id, reply_to, target, timeout } => {
                            let _ = pinger_tx.send(PingTask { req_id, reply_to, target, timeout });
                        }
                        Envelope::PingResponse { req_id, voter, outcome } => {
                            collectors.route(req_id, voter, outcome);
                        }
                    },
                    Err(err) => debug!("transport receive failed: {err}"),
                }
            }
        }
    })
}

/// Runs the master singleton while the local node is the oldest
/// master-eligible member, and stops it the moment it is not. Overlap with
/// another node's master during failover is tolerated by design.
#[allow(clippy::too_many_arguments)]
fn spawn_leader_watch(
    gossip: Arc<Gossip>,
    store: Arc<ClusterStateStore>,
    codec: Arc<dyn StateCodec>,
    transport: Arc<dyn Transport>,
    follower_tx: mpsc::UnboundedSender<FollowerMsg>,
    master_slot: MasterSlot,
    publish_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let (_, mut events) = gossip.subscribe();
        let mut ticker = time::interval(QUORUM_CHECK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut master_stop: Option<watch::Sender<bool>> = None;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
                event = events.recv() => match event {
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            let me = gossip.self_member();
            let leading = me.roles.master_eligible
                && me.status == MemberStatus::Up
                && gossip
                    .oldest_master_eligible()
                    .is_some_and(|leader| leader.id == me.id);
            if leading && master_stop.is_none() {
                info!("oldest master-eligible member; running the master");
                let (master, master_rx) = Master::new(
                    Arc::clone(&gossip),
                    Arc::clone(&store),
                    Arc::clone(&codec),
                    Arc::clone(&transport),
                    follower_tx.clone(),
                    publish_timeout,
                );
                let (stop_tx, stop_rx) = watch::channel(false);
                master.spawn(master_rx, stop_rx);
                *master_slot.write() = Some(master.sender());
                master_stop = Some(stop_tx);
            } else if !leading && master_stop.is_some() {
                info!("no longer the oldest master-eligible member; stepping down");
                *master_slot.write() = None;
                if let Some(stop) = master_stop.take() {
                    let _ = stop.send(true);
                }
            }
        }
        *master_slot.write() = None;
        if let Some(stop) = master_stop.take() {
            let _ = stop.send(true);
        }
    })
}

/// Rebuilds the discovery instance after every termination, with bounded
/// exponential backoff between attempts.
pub struct Supervisor {
    config: DiscoveryConfig,
    store: Arc<ClusterStateStore>,
    codec: Arc<dyn StateCodec>,
}

impl Supervisor {
    /// Creates the restart loop around shared host collaborators.
    #[must_use]
    pub fn new(
        config: DiscoveryConfig,
        store: Arc<ClusterStateStore>,
        codec: Arc<dyn StateCodec>,
    ) -> Self {
        Self { config, store, codec }
    }

    /// Runs until the shutdown signal fires. Every termination of the
    /// current instance (abdication, eviction, startup timeout) leads to a
    /// fresh instance with a fresh node identity.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = RestartBackoff::default();
        loop {
            let discovery = Discovery::new(
                self.config.clone(),
                Arc::clone(&self.store),
                Arc::clone(&self.codec),
            );
            match discovery.start().await {
                Ok(()) => {
                    backoff.reset();
                    let mut started = discovery.started_watch();
                    tokio::select! {
                        _ = shutdown.changed() => {
                            discovery.close().await;
                            return;
                        }
                        _ = started.wait_for(|live| !*live) => {}
                    }
                }
                Err(err) => warn!("discovery failed to start: {err}"),
            }
            let delay = backoff.next_delay();
            info!(delay = ?delay, "restarting discovery after backoff");
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = time::sleep(delay) => {}
            }
        }
    }
}

#[derive(Default)]
struct RestartBackoff {
    attempt: u32,
}

impl RestartBackoff {
    /// Doubles from the base up to the cap, with ±50% jitter on top.
    fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt.min(8));
        let raw = BACKOFF_BASE.saturating_mul(factor).min(BACKOFF_CAP);
        self.attempt = self.attempt.saturating_add(1);
        jittered(raw)
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }
}

fn jittered(base: Duration) -> Duration {
    let mut rng = SmallRng::from_entropy();
    base.mul_f64(rng.gen_range(0.5..1.5))
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |since| u64::try_from(since.as_millis()).unwrap_or(u64::MAX))
}

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::member::{Member, MemberEvent, MemberStatus};
use crate::transport::{Envelope, Transport};

/// Phi score above which a member is declared unreachable.
const PHI_THRESHOLD: f64 = 8.0;
/// Heartbeat arrival samples kept per member.
const PHI_WINDOW: usize = 32;
/// Samples required before the phi estimate is trusted.
const PHI_MIN_SAMPLES: usize = 3;
/// Floor on the interval standard deviation, in milliseconds.
const PHI_MIN_STD_DEV_MS: f64 = 100.0;
/// Rumors piggybacked per heartbeat.
const GOSSIP_BATCH: usize = 16;
/// Join rounds the first listed seed tries against the other seeds before
/// bootstrapping the cluster by itself.
const SEED_SELF_JOIN_ATTEMPTS: u32 = 3;

/// Gossip traffic exchanged between membership engines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GossipMessage {
    /// A joining node announcing itself to a seed.
    Join {
        /// The joiner, in `Joining` status with its join stamp set.
        member: Member,
    },
    /// A seed admitting a joiner: the full membership as rumors.
    JoinReply {
        /// Every known member including the admitted joiner.
        members: Vec<MemberRumor>,
    },
    /// Periodic liveness beacon carrying membership rumors.
    Heartbeat {
        /// Rumor batch, always led by the sender's own entry.
        rumors: Vec<MemberRumor>,
    },
    /// Application-level reachability probe.
    Probe {
        /// Correlation id.
        probe_id: u64,
    },
    /// Answer to a [`GossipMessage::Probe`].
    ProbeAck {
        /// Correlation id of the probe being answered.
        probe_id: u64,
    },
}

/// One gossiped membership fact: a member at an incarnation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberRumor {
    /// Member snapshot.
    pub member: Member,
    /// Incarnation the fact belongs to; higher wins, status progression
    /// breaks ties.
    pub incarnation: u64,
}

/// Phi-accrual failure detector over heartbeat inter-arrival times.
///
/// Keeps a window of observed intervals and scores the time since the last
/// heartbeat against a normal distribution fitted to them, shifted by the
/// acceptable pause. Until enough samples exist, falls back to a plain
/// deadline of one interval plus the pause.
#[derive(Debug)]
struct PhiAccrual {
    intervals_ms: Vec<f64>,
    next_slot: usize,
    last_arrival: Instant,
    expected_interval: Duration,
    acceptable_pause: Duration,
}

impl PhiAccrual {
    fn new(now: Instant, expected_interval: Duration, acceptable_pause: Duration) -> Self {
        Self {
            intervals_ms: Vec::with_capacity(PHI_WINDOW),
            next_slot: 0,
            last_arrival: now,
            expected_interval,
            acceptable_pause,
        }
    }

    fn record_heartbeat(&mut self, now: Instant) {
        let interval_ms = now.duration_since(self.last_arrival).as_secs_f64() * 1_000.0;
        self.last_arrival = now;
        if self.intervals_ms.len() < PHI_WINDOW {
            self.intervals_ms.push(interval_ms);
        } else {
            self.intervals_ms[self.next_slot] = interval_ms;
            self.next_slot = (self.next_slot + 1) % PHI_WINDOW;
        }
    }

    fn phi(&self, now: Instant) -> f64 {
        let elapsed = now.duration_since(self.last_arrival);
        if self.intervals_ms.len() < PHI_MIN_SAMPLES {
            let deadline = self.expected_interval + self.acceptable_pause;
            return if elapsed > deadline { PHI_THRESHOLD + 1.0 } else { 0.0 };
        }

        let n = self.intervals_ms.len() as f64;
        let mean = self.intervals_ms.iter().sum::<f64>() / n;
        let variance = self
            .intervals_ms
            .iter()
            .map(|v| (v - mean) * (v - mean))
            .sum::<f64>()
            / n;
        let std_dev = variance.sqrt().max(PHI_MIN_STD_DEV_MS);
        let shifted_mean = mean + self.acceptable_pause.as_secs_f64() * 1_000.0;

        let elapsed_ms = elapsed.as_secs_f64() * 1_000.0;
        let tail = 1.0 - normal_cdf((elapsed_ms - shifted_mean) / std_dev);
        -tail.max(1e-12).log10()
    }
}

/// Standard normal CDF via the Abramowitz-Stegun erf approximation.
fn normal_cdf(z: f64) -> f64 {
    let x = z / std::f64::consts::SQRT_2;
    let t = 1.0 / (1.0 + 0.327_591_1 * x.abs());
    let poly = t
        * (0.254_829_592
            + t * (-0.284_496_736 + t * (1.421_413_741 + t * (-1.453_152_027 + t * 1.061_405_429))));
    let erf = 1.0 - poly * (-x * x).exp();
    let erf = if x < 0.0 { -erf } else { erf };
    0.5 * (1.0 + erf)
}

struct MemberRecord {
    member: Member,
    incarnation: u64,
    reachable: bool,
    detector: PhiAccrual,
    last_update: Instant,
}

/// Gossip membership engine.
///
/// Owns the cluster view: who is in, at what status, and whether the local
/// failure detector can currently reach them. Mutation from the outside is
/// limited to [`Gossip::down`] and [`Gossip::leave`]; everything else flows
/// in through gossip.
pub struct Gossip {
    local: RwLock<Member>,
    local_incarnation: AtomicU64,
    members: DashMap<SocketAddr, MemberRecord>,
    seeds: Vec<SocketAddr>,
    heartbeat_interval: Duration,
    acceptable_pause: Duration,
    transport: Arc<dyn Transport>,
    events_tx: broadcast::Sender<MemberEvent>,
    self_status_tx: watch::Sender<MemberStatus>,
    pending_probes: DashMap<u64, oneshot::Sender<()>>,
    probe_seq: AtomicU64,
}

impl Gossip {
    /// Creates the engine for `local`, which must be in `Joining` status.
    #[must_use]
    pub fn new(
        local: Member,
        seeds: Vec<SocketAddr>,
        heartbeat_interval: Duration,
        acceptable_pause: Duration,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(256);
        let (self_status_tx, _) = watch::channel(local.status);
        Arc::new(Self {
            local: RwLock::new(local),
            local_incarnation: AtomicU64::new(0),
            members: DashMap::new(),
            seeds,
            heartbeat_interval,
            acceptable_pause,
            transport,
            events_tx,
            self_status_tx,
            pending_probes: DashMap::new(),
            probe_seq: AtomicU64::new(0),
        })
    }

    /// Starts the join and heartbeat loops.
    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(Arc::clone(self).join_loop(shutdown.clone())),
            tokio::spawn(Arc::clone(self).heartbeat_loop(shutdown)),
        ]
    }

    /// The address peers reach this node at.
    #[must_use]
    pub fn self_addr(&self) -> SocketAddr {
        self.local.read().addr
    }

    /// Snapshot of the local member.
    #[must_use]
    pub fn self_member(&self) -> Member {
        self.local.read().clone()
    }

    /// Watches the local member's own status (`Joining` until admitted, then
    /// `Up`; `Down` if the cluster evicted us; `Removed` after leaving).
    #[must_use]
    pub fn self_status(&self) -> watch::Receiver<MemberStatus> {
        self.self_status_tx.subscribe()
    }

    /// Subscribes to membership events. The returned snapshot holds the
    /// members currently up and must be processed before the live stream, as
    /// if each had just been delivered as [`MemberEvent::Up`].
    #[must_use]
    pub fn subscribe(&self) -> (Vec<Member>, broadcast::Receiver<MemberEvent>) {
        let rx = self.events_tx.subscribe();
        let up = self
            .members_internal()
            .into_iter()
            .filter(|m| m.status == MemberStatus::Up)
            .collect();
        (up, rx)
    }

    /// Current membership view, including the local member, excluding
    /// removed tombstones.
    #[must_use]
    pub fn members(&self) -> Vec<Member> {
        self.members_internal()
    }

    /// The view restricted to members the local failure detector can reach.
    /// This is the view quorum checks run against: a seed that is nominally
    /// `Up` but unreachable cannot be counted on for anything.
    #[must_use]
    pub fn quorum_view(&self) -> Vec<Member> {
        let mut view = Vec::with_capacity(self.members.len() + 1);
        let local = self.local.read().clone();
        if local.status != MemberStatus::Removed {
            view.push(local);
        }
        view.extend(self.members.iter().filter_map(|entry| {
            let record = entry.value();
            (record.reachable && record.member.status != MemberStatus::Removed)
                .then(|| record.member.clone())
        }));
        view
    }

    /// Looks up a member by address; removed tombstones are not part of the
    /// view.
    #[must_use]
    pub fn member_at(&self, addr: SocketAddr) -> Option<Member> {
        if addr == self.self_addr() {
            return Some(self.self_member());
        }
        self.members
            .get(&addr)
            .filter(|entry| entry.member.status != MemberStatus::Removed)
            .map(|entry| entry.member.clone())
    }

    /// Whether the local failure detector currently considers `addr` lost.
    #[must_use]
    pub fn is_unreachable(&self, addr: SocketAddr) -> bool {
        self.members
            .get(&addr)
            .is_some_and(|entry| !entry.reachable)
    }

    /// The deterministic leader: the oldest up, master-eligible member.
    #[must_use]
    pub fn oldest_master_eligible(&self) -> Option<Member> {
        self.members_internal()
            .into_iter()
            .filter(|m| m.status == MemberStatus::Up && m.roles.master_eligible)
            .min_by_key(Member::age_key)
    }

    /// Unilaterally marks a member down. Absorbing: the identity can never
    /// come back; the process behind it must restart to rejoin.
    pub async fn down(&self, addr: SocketAddr) {
        if addr == self.self_addr() {
            let mut local = self.local.write();
            if !local.status.is_terminal() {
                local.status = MemberStatus::Down;
                drop(local);
                let _ = self.self_status_tx.send(MemberStatus::Down);
            }
            return;
        }
        let changed = {
            let Some(mut entry) = self.members.get_mut(&addr) else { return };
            let record = entry.value_mut();
            if record.member.status.is_terminal() {
                false
            } else {
                record.member.status = MemberStatus::Down;
                record.incarnation += 1;
                record.last_update = Instant::now();
                true
            }
        };
        if changed {
            info!(member = %addr, "marked member down");
            self.broadcast_rumors().await;
        }
    }

    /// Gracefully departs the cluster: `Leaving`, `Exiting`, `Removed`, each
    /// step gossiped so peers retire this identity without suspecting it.
    pub async fn leave(&self) {
        {
            let mut local = self.local.write();
            if local.status.is_terminal() {
                return;
            }
            local.status = MemberStatus::Leaving;
        }
        self.broadcast_rumors().await;

        self.local.write().status = MemberStatus::Exiting;
        self.emit(MemberEvent::Exited(self.self_member()));
        self.broadcast_rumors().await;

        self.local.write().status = MemberStatus::Removed;
        let _ = self.self_status_tx.send(MemberStatus::Removed);
        self.emit(MemberEvent::Removed(self.self_member()));
        self.broadcast_rumors().await;
    }

    /// Probes `target` and reports whether it answered within `timeout`.
    pub async fn probe(&self, target: SocketAddr, timeout: Duration) -> bool {
        let probe_id = self.probe_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending_probes.insert(probe_id, tx);
        let envelope = Envelope::Gossip(GossipMessage::Probe { probe_id });
        if let Err(err) = self.transport.send(target, &envelope).await {
            debug!(target = %target, "probe send failed: {err}");
            self.pending_probes.remove(&probe_id);
            return false;
        }
        match time::timeout(timeout, rx).await {
            Ok(Ok(())) => true,
            _ => {
                self.pending_probes.remove(&probe_id);
                false
            }
        }
    }

    /// Handles one inbound gossip message.
    pub async fn handle(&self, message: GossipMessage, from: SocketAddr) {
        match message {
            GossipMessage::Join { member } => self.handle_join(member).await,
            GossipMessage::JoinReply { members } => self.apply_rumors(members),
            GossipMessage::Heartbeat { rumors } => {
                self.record_heartbeat_from(from);
                self.apply_rumors(rumors);
            }
            GossipMessage::Probe { probe_id } => {
                let ack = Envelope::Gossip(GossipMessage::ProbeAck { probe_id });
                if let Err(err) = self.transport.send(from, &ack).await {
                    debug!(peer = %from, "probe ack send failed: {err}");
                }
            }
            GossipMessage::ProbeAck { probe_id } => {
                if let Some((_, tx)) = self.pending_probes.remove(&probe_id) {
                    let _ = tx.send(());
                }
            }
        }
    }

    async fn handle_join(&self, member: Member) {
        if self.local.read().status != MemberStatus::Up {
            // Not yet admitted ourselves; the joiner will retry.
            return;
        }
        if member.addr == self.self_addr() {
            return;
        }
        trace!(joiner = %member.addr, "admitting joiner");
        let addr = member.addr;
        let mut admitted = member;
        admitted.status = MemberStatus::Up;
        self.merge_rumor(
            MemberRumor { member: admitted, incarnation: 0 },
            Instant::now(),
        );

        let mut members = vec![self.local_rumor()];
        members.extend(self.members.iter().filter_map(|entry| {
            let record = entry.value();
            (record.member.status != MemberStatus::Removed).then(|| MemberRumor {
                member: record.member.clone(),
                incarnation: record.incarnation,
            })
        }));
        let reply = Envelope::Gossip(GossipMessage::JoinReply { members });
        if let Err(err) = self.transport.send(addr, &reply).await {
            debug!(joiner = %addr, "join reply send failed: {err}");
        }
    }

    fn record_heartbeat_from(&self, from: SocketAddr) {
        let now = Instant::now();
        let reachable_again = {
            let Some(mut entry) = self.members.get_mut(&from) else { return };
            let record = entry.value_mut();
            if record.member.status.is_terminal() {
                return;
            }
            record.detector.record_heartbeat(now);
            if record.reachable {
                None
            } else {
                record.reachable = true;
                Some(record.member.clone())
            }
        };
        if let Some(member) = reachable_again {
            info!(member = %member.addr, "member reachable again");
            self.emit(MemberEvent::Reachable(member));
        }
    }

    fn apply_rumors(&self, rumors: Vec<MemberRumor>) {
        let now = Instant::now();
        for rumor in rumors {
            self.merge_rumor(rumor, now);
        }
    }

    fn merge_rumor(&self, rumor: MemberRumor, now: Instant) {
        if rumor.member.addr == self.self_addr() {
            self.merge_self_rumor(&rumor);
            return;
        }

        let mut events = Vec::new();
        match self.members.entry(rumor.member.addr) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                let record = occupied.get_mut();
                if record.member.id != rumor.member.id {
                    // A different process behind the same address. A newer
                    // join stamp means a restart; accept the fresh identity.
                    if rumor.member.joined_at_millis > record.member.joined_at_millis {
                        let status = rumor.member.status;
                        *record = self.new_record(rumor, now);
                        if status == MemberStatus::Up {
                            events.push(MemberEvent::Up(record.member.clone()));
                        }
                    }
                } else if record.member.status.is_terminal() {
                    if record.member.status == MemberStatus::Down
                        && rumor.member.status == MemberStatus::Removed
                    {
                        record.member.status = MemberStatus::Removed;
                        record.last_update = now;
                        events.push(MemberEvent::Removed(record.member.clone()));
                    }
                } else if rumor.incarnation > record.incarnation
                    || (rumor.incarnation == record.incarnation
                        && rumor.member.status.rank() > record.member.status.rank())
                {
                    let old_status = record.member.status;
                    record.member.status = rumor.member.status;
                    record.incarnation = rumor.incarnation;
                    record.last_update = now;
                    match record.member.status {
                        MemberStatus::Up if old_status != MemberStatus::Up => {
                            events.push(MemberEvent::Up(record.member.clone()));
                        }
                        MemberStatus::Exiting => {
                            events.push(MemberEvent::Exited(record.member.clone()));
                        }
                        MemberStatus::Removed => {
                            events.push(MemberEvent::Removed(record.member.clone()));
                        }
                        _ => {}
                    }
                }
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let status = rumor.member.status;
                let record = self.new_record(rumor, now);
                if status == MemberStatus::Up {
                    events.push(MemberEvent::Up(record.member.clone()));
                }
                vacant.insert(record);
            }
        }
        for event in events {
            self.emit(event);
        }
    }

    fn merge_self_rumor(&self, rumor: &MemberRumor) {
        if rumor.member.id != self.local.read().id {
            // Tombstone of a previous process at our address; our own rumors
            // re-assert the fresh identity.
            return;
        }
        let mut promoted = None;
        {
            let mut local = self.local.write();
            if rumor.member.status.is_terminal() && !local.status.is_terminal() {
                warn!(status = %rumor.member.status, "cluster marked the local node {}", rumor.member.status);
                local.status = rumor.member.status;
                drop(local);
                let _ = self.self_status_tx.send(rumor.member.status);
                return;
            }
            if rumor.member.status == MemberStatus::Up && local.status == MemberStatus::Joining {
                local.status = MemberStatus::Up;
                promoted = Some(local.clone());
            }
        }
        if let Some(member) = promoted {
            info!(addr = %member.addr, "joined the cluster");
            let _ = self.self_status_tx.send(MemberStatus::Up);
            self.emit(MemberEvent::Up(member));
        } else if rumor.incarnation >= self.local_incarnation.load(Ordering::Acquire) {
            self.local_incarnation
                .store(rumor.incarnation + 1, Ordering::Release);
        }
    }

    fn new_record(&self, rumor: MemberRumor, now: Instant) -> MemberRecord {
        MemberRecord {
            member: rumor.member,
            incarnation: rumor.incarnation,
            reachable: true,
            detector: PhiAccrual::new(now, self.heartbeat_interval, self.acceptable_pause),
            last_update: now,
        }
    }

    fn members_internal(&self) -> Vec<Member> {
        let mut view = Vec::with_capacity(self.members.len() + 1);
        let local = self.local.read().clone();
        if local.status != MemberStatus::Removed {
            view.push(local);
        }
        view.extend(self.members.iter().filter_map(|entry| {
            (entry.member.status != MemberStatus::Removed).then(|| entry.member.clone())
        }));
        view
    }

    fn local_rumor(&self) -> MemberRumor {
        MemberRumor {
            member: self.local.read().clone(),
            incarnation: self.local_incarnation.load(Ordering::Acquire),
        }
    }

    fn rumor_batch(&self) -> Vec<MemberRumor> {
        let mut recent: Vec<_> = self
            .members
            .iter()
            .map(|entry| {
                let record = entry.value();
                (
                    record.last_update,
                    MemberRumor {
                        member: record.member.clone(),
                        incarnation: record.incarnation,
                    },
                )
            })
            .collect();
        recent.sort_unstable_by(|a, b| b.0.cmp(&a.0));

        let mut batch = vec![self.local_rumor()];
        batch.extend(recent.into_iter().take(GOSSIP_BATCH).map(|(_, rumor)| rumor));
        batch
    }

    async fn broadcast_rumors(&self) {
        let targets: Vec<_> = self
            .members
            .iter()
            .filter_map(|entry| {
                (!entry.member.status.is_terminal()).then_some(entry.member.addr)
            })
            .collect();
        let envelope = Envelope::Gossip(GossipMessage::Heartbeat { rumors: self.rumor_batch() });
        for target in targets {
            if let Err(err) = self.transport.send(target, &envelope).await {
                debug!(peer = %target, "rumor send failed: {err}");
            }
        }
    }

    async fn join_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let self_addr = self.self_addr();
        let first_seed = self.seeds.first() == Some(&self_addr);
        let others: Vec<_> = self
            .seeds
            .iter()
            .copied()
            .filter(|addr| *addr != self_addr)
            .collect();

        if first_seed && others.is_empty() {
            self.promote_self();
            return;
        }

        let mut ticker = time::interval(self.heartbeat_interval);
        let mut attempts = 0u32;
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => {}
            }
            if self.local.read().status != MemberStatus::Joining {
                return;
            }
            let join = Envelope::Gossip(GossipMessage::Join { member: self.self_member() });
            for seed in &others {
                if let Err(err) = self.transport.send(*seed, &join).await {
                    debug!(seed = %seed, "join send failed: {err}");
                }
            }
            attempts += 1;
            if first_seed && attempts >= SEED_SELF_JOIN_ATTEMPTS {
                // No other seed answered; bootstrap the cluster here.
                self.promote_self();
                return;
            }
        }
    }

    fn promote_self(&self) {
        let member = {
            let mut local = self.local.write();
            if local.status != MemberStatus::Joining {
                return;
            }
            local.status = MemberStatus::Up;
            local.clone()
        };
        info!(addr = %member.addr, "bootstrapped cluster as first seed");
        let _ = self.self_status_tx.send(MemberStatus::Up);
        self.emit(MemberEvent::Up(member));
    }

    async fn heartbeat_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = time::interval(self.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => {}
            }
            let status = self.local.read().status;
            if status.is_terminal() {
                return;
            }
            if status == MemberStatus::Joining {
                continue;
            }
            self.broadcast_rumors().await;
            self.scan_reachability();
            self.prune_tombstones();
        }
    }

    fn scan_reachability(&self) {
        let now = Instant::now();
        let mut lost = Vec::new();
        for mut entry in self.members.iter_mut() {
            let record = entry.value_mut();
            if !record.member.status.is_monitored() || !record.reachable {
                continue;
            }
            if record.detector.phi(now) > PHI_THRESHOLD {
                record.reachable = false;
                lost.push(record.member.clone());
            }
        }
        for member in lost {
            warn!(member = %member.addr, "member unreachable");
            self.emit(MemberEvent::Unreachable(member));
        }
    }

    /// Downed members become removed tombstones once the cluster has had
    /// time to converge on the eviction; exiting members that went silent
    /// are completed the same way.
    fn prune_tombstones(&self) {
        let after = 2 * (self.heartbeat_interval + self.acceptable_pause);
        let now = Instant::now();
        let mut removed = Vec::new();
        for mut entry in self.members.iter_mut() {
            let record = entry.value_mut();
            let stale = now.duration_since(record.last_update) > after;
            if stale
                && matches!(record.member.status, MemberStatus::Down | MemberStatus::Exiting)
            {
                record.member.status = MemberStatus::Removed;
                record.last_update = now;
                removed.push(record.member.clone());
            }
        }
        for member in removed {
            self.emit(MemberEvent::Removed(member));
        }
    }

    fn emit(&self, event: MemberEvent) {
        let _ = self.events_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::member::{NodeId, Roles};
    use crate::transport::testing::NullTransport;

    fn test_member(port: u16, joined_at: u64, status: MemberStatus) -> Member {
        Member {
            addr: format!("127.0.0.1:{port}").parse().unwrap(),
            id: NodeId::generate(),
            roles: Roles { master_eligible: true, voter: true },
            status,
            joined_at_millis: joined_at,
        }
    }

    fn test_gossip(port: u16) -> Arc<Gossip> {
        let local = test_member(port, 10, MemberStatus::Joining);
        let addr = local.addr;
        Gossip::new(
            local,
            vec![addr],
            Duration::from_millis(50),
            Duration::from_millis(150),
            NullTransport::new(addr),
        )
    }

    fn rumor(member: &Member, incarnation: u64) -> MemberRumor {
        MemberRumor { member: member.clone(), incarnation }
    }

    #[tokio::test]
    async fn up_rumor_introduces_member_and_emits() {
        let gossip = test_gossip(9400);
        let (_, mut events) = gossip.subscribe();

        let peer = test_member(9401, 20, MemberStatus::Up);
        gossip.apply_rumors(vec![rumor(&peer, 0)]);

        assert_eq!(gossip.member_at(peer.addr).unwrap().status, MemberStatus::Up);
        assert!(matches!(events.try_recv(), Ok(MemberEvent::Up(m)) if m.addr == peer.addr));
    }

    #[tokio::test]
    async fn down_is_absorbing_against_later_rumors() {
        let gossip = test_gossip(9400);
        let peer = test_member(9401, 20, MemberStatus::Up);
        gossip.apply_rumors(vec![rumor(&peer, 0)]);

        gossip.down(peer.addr).await;
        assert_eq!(gossip.member_at(peer.addr).unwrap().status, MemberStatus::Down);

        // Not even a much newer incarnation of the same identity comes back.
        let mut revived = peer.clone();
        revived.status = MemberStatus::Up;
        gossip.apply_rumors(vec![rumor(&revived, 99)]);
        assert_eq!(gossip.member_at(peer.addr).unwrap().status, MemberStatus::Down);
    }

    #[tokio::test]
    async fn removed_supersedes_down() {
        let gossip = test_gossip(9400);
        let peer = test_member(9401, 20, MemberStatus::Up);
        gossip.apply_rumors(vec![rumor(&peer, 0)]);
        gossip.down(peer.addr).await;

        let mut gone = peer.clone();
        gone.status = MemberStatus::Removed;
        gossip.apply_rumors(vec![rumor(&gone, 0)]);
        assert!(gossip.member_at(peer.addr).is_none());
    }

    #[tokio::test]
    async fn restarted_process_replaces_downed_identity() {
        let gossip = test_gossip(9400);
        let peer = test_member(9401, 20, MemberStatus::Up);
        gossip.apply_rumors(vec![rumor(&peer, 0)]);
        gossip.down(peer.addr).await;

        let fresh = test_member(9401, 30, MemberStatus::Up);
        gossip.apply_rumors(vec![rumor(&fresh, 0)]);
        let seen = gossip.member_at(peer.addr).unwrap();
        assert_eq!(seen.id, fresh.id);
        assert_eq!(seen.status, MemberStatus::Up);
    }

    #[tokio::test]
    async fn oldest_master_eligible_is_deterministic() {
        let gossip = test_gossip(9400);
        // Local node is still joining, so it does not take part.
        let older = test_member(9401, 5, MemberStatus::Up);
        let newer = test_member(9402, 8, MemberStatus::Up);
        let mut data_only = test_member(9403, 1, MemberStatus::Up);
        data_only.roles.master_eligible = false;
        gossip.apply_rumors(vec![rumor(&older, 0), rumor(&newer, 0), rumor(&data_only, 0)]);

        assert_eq!(gossip.oldest_master_eligible().unwrap().addr, older.addr);
    }

    #[tokio::test]
    async fn self_up_rumor_promotes_joining_node() {
        let gossip = test_gossip(9400);
        let mut status = gossip.self_status();
        assert_eq!(*status.borrow(), MemberStatus::Joining);

        let mut admitted = gossip.self_member();
        admitted.status = MemberStatus::Up;
        gossip.apply_rumors(vec![rumor(&admitted, 0)]);

        assert!(status.has_changed().unwrap());
        assert_eq!(*status.borrow_and_update(), MemberStatus::Up);
        assert_eq!(gossip.self_member().status, MemberStatus::Up);
    }

    #[tokio::test]
    async fn self_down_rumor_flags_eviction() {
        let gossip = test_gossip(9400);
        let mut admitted = gossip.self_member();
        admitted.status = MemberStatus::Up;
        gossip.apply_rumors(vec![rumor(&admitted, 0)]);

        let mut evicted = gossip.self_member();
        evicted.status = MemberStatus::Down;
        gossip.apply_rumors(vec![rumor(&evicted, 5)]);
        assert_eq!(*gossip.self_status().borrow(), MemberStatus::Down);
    }

    #[tokio::test]
    async fn subscribe_replays_current_up_members() {
        let gossip = test_gossip(9400);
        let peer = test_member(9401, 20, MemberStatus::Up);
        gossip.apply_rumors(vec![rumor(&peer, 0)]);

        let (snapshot, _) = gossip.subscribe();
        assert!(snapshot.iter().any(|m| m.addr == peer.addr));
    }

    #[test]
    fn phi_stays_low_under_regular_heartbeats() {
        let start = Instant::now();
        let mut detector =
            PhiAccrual::new(start, Duration::from_millis(100), Duration::from_millis(300));
        let mut now = start;
        for _ in 0..20 {
            now += Duration::from_millis(100);
            detector.record_heartbeat(now);
        }
        assert!(detector.phi(now + Duration::from_millis(100)) < PHI_THRESHOLD);
        assert!(detector.phi(now + Duration::from_secs(10)) > PHI_THRESHOLD);
    }

    #[test]
    fn phi_falls_back_to_deadline_during_warmup() {
        let start = Instant::now();
        let detector =
            PhiAccrual::new(start, Duration::from_millis(100), Duration::from_millis(300));
        assert!(detector.phi(start + Duration::from_millis(200)) < PHI_THRESHOLD);
        assert!(detector.phi(start + Duration::from_millis(500)) > PHI_THRESHOLD);
    }

    #[test]
    fn normal_cdf_is_sane() {
        assert!((normal_cdf(0.0) - 0.5).abs() < 1e-6);
        assert!(normal_cdf(3.0) > 0.99);
        assert!(normal_cdf(-3.0) < 0.01);
    }
}

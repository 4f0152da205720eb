//! Cluster membership and partition resolution for an external search-index
//! cluster manager.
//!
//! Nodes bootstrap from a static seed list, gossip membership amongst
//! themselves, elect the oldest master-eligible member as the leader, and
//! fan cluster-state snapshots out from that leader to every follower.
//! Network partitions are resolved by downing members that a quorum of seed
//! voters affirmatively report as unreachable; a node that itself loses the
//! quorum clears its state and eventually restarts with a fresh identity.

/// Quorum-loss watcher that triggers whole-instance restarts.
pub mod abdicator;
/// Declarative configuration schema (`discovery.eskka.*`).
pub mod config;
/// Error types surfaced by the discovery subsystem.
pub mod error;
/// Quorum-gated acceptance of master publishes.
pub mod follower;
/// Host-facing lifecycle: startup, publication, teardown, restart loop.
pub mod lifecycle;
/// Elected leader's publication pipeline.
pub mod master;
/// Member, role, status, and event data model.
pub mod member;
/// Gossip membership engine with a phi-accrual failure detector.
pub mod membership;
/// Quorum-ping partition monitor that downs unreachable members.
pub mod partition;
/// Responder for distributed reachability probes.
pub mod pinger;
/// Versioned cluster-state snapshots and their codec.
pub mod state;
/// Single-writer prioritized cluster-state store.
pub mod store;
/// Wire envelopes and the UDP transport.
pub mod transport;
/// Seed set and quorum arithmetic.
pub mod voting;

pub use abdicator::RestartReason;
pub use config::{DEFAULT_PORT, DiscoveryConfig, NodeFlags, PartitionConfig};
pub use error::DiscoveryError;
pub use lifecycle::{Discovery, InitialStateListener, Supervisor};
pub use master::AckListener;
pub use member::{Member, MemberEvent, MemberStatus, NodeId, Roles};
pub use membership::{Gossip, GossipMessage, MemberRumor};
pub use partition::{PartitionMonitor, ResponseCollectors};
pub use pinger::{PingTask, Pinger};
pub use state::{
    Block, BincodeCodec, ClusterState, DiscoveryNode, IndexMetaData, IndexRouting, MetaData,
    NO_MASTER_BLOCK_ID, RoutingTable, STATE_NOT_RECOVERED_BLOCK_ID, StateCodec, Transition,
};
pub use store::{ClusterStateStore, Priority};
pub use transport::{Envelope, PingOutcome, Transport, UdpTransport};
pub use voting::VotingMembers;

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable logical node identifier. Regenerated on every process start, so a
/// restarted node always rejoins as a fresh identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    /// Generates a fresh identifier for this process.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Cluster roles assigned to a node at join time; stable afterwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roles {
    /// Eligible to run the elected master.
    pub master_eligible: bool,
    /// Listed in the seed set; participates in downing votes.
    pub voter: bool,
}

/// Lifecycle state of a member inside the gossip protocol.
///
/// `Down` and `Removed` are absorbing: once either is recorded for a node
/// identity, no rumor can resurrect it. Re-entry requires a process restart
/// with a fresh [`NodeId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberStatus {
    /// Contacted a seed; not yet admitted.
    Joining,
    /// Full cluster member.
    Up,
    /// Graceful departure requested.
    Leaving,
    /// Graceful departure in progress; no longer counted for anything.
    Exiting,
    /// Forcibly evicted by a quorum downing decision.
    Down,
    /// Gone for good.
    Removed,
}

impl MemberStatus {
    /// Terminal statuses absorb every later rumor for the same identity.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Down | Self::Removed)
    }

    /// Statuses the failure detector keeps monitoring.
    #[must_use]
    pub const fn is_monitored(self) -> bool {
        matches!(self, Self::Joining | Self::Up | Self::Leaving)
    }

    /// Position in the one-way status progression; ties between rumors with
    /// equal incarnation are broken toward the later status.
    #[must_use]
    pub(crate) const fn rank(self) -> u8 {
        match self {
            Self::Joining => 0,
            Self::Up => 1,
            Self::Leaving => 2,
            Self::Exiting => 3,
            Self::Down => 4,
            Self::Removed => 5,
        }
    }
}

impl fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Joining => "joining",
            Self::Up => "up",
            Self::Leaving => "leaving",
            Self::Exiting => "exiting",
            Self::Down => "down",
            Self::Removed => "removed",
        };
        f.write_str(label)
    }
}

/// A cluster member as seen through the gossip view.
///
/// Addresses are canonical socket addresses; hostnames are resolved once at
/// configuration load, so address equality is host + port equality.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Gossip endpoint, also the member's identity for seed membership.
    pub addr: SocketAddr,
    /// Process-lifetime identifier.
    pub id: NodeId,
    /// Roles assigned at join.
    pub roles: Roles,
    /// Current lifecycle status.
    pub status: MemberStatus,
    /// Wall-clock millis stamped once by the joining process and gossiped
    /// immutably; the basis of the deterministic oldest ordering.
    pub joined_at_millis: u64,
}

impl Member {
    /// Ordering key for the "oldest member" rule. Lexicographic on the join
    /// stamp with the address as tiebreak, so every node derives the same
    /// leader from the same view.
    #[must_use]
    pub fn age_key(&self) -> (u64, SocketAddr) {
        (self.joined_at_millis, self.addr)
    }

    /// True when this member precedes `other` in the oldest ordering.
    #[must_use]
    pub fn is_older_than(&self, other: &Self) -> bool {
        self.age_key() < other.age_key()
    }
}

/// Membership and reachability events delivered to subscribers.
///
/// Each subscriber first receives the current up members replayed as
/// [`MemberEvent::Up`] before any live event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberEvent {
    /// Member admitted to the cluster.
    Up(Member),
    /// Member started a graceful departure.
    Exited(Member),
    /// Member is gone (graceful completion or downing follow-up).
    Removed(Member),
    /// Local failure detector lost the member.
    Unreachable(Member),
    /// Local failure detector regained the member.
    Reachable(Member),
}

impl MemberEvent {
    /// The member this event concerns.
    #[must_use]
    pub fn member(&self) -> &Member {
        match self {
            Self::Up(m) | Self::Exited(m) | Self::Removed(m) | Self::Unreachable(m) | Self::Reachable(m) => m,
        }
    }
}

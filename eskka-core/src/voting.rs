use std::collections::BTreeSet;
use std::net::SocketAddr;

use tracing::warn;

use crate::member::{Member, MemberStatus};

/// The statically configured seed set and its quorum arithmetic.
///
/// The set is immutable for the process lifetime: quorum size depends only on
/// the configured seeds, never on current membership, so a shrinking cluster
/// can lose quorum but can never lower the bar for downing decisions.
#[derive(Debug, Clone)]
pub struct VotingMembers {
    seeds: BTreeSet<SocketAddr>,
}

impl VotingMembers {
    /// Builds the voting set from the configured seed addresses.
    #[must_use]
    pub fn new(seeds: impl IntoIterator<Item = SocketAddr>) -> Self {
        let seeds: BTreeSet<_> = seeds.into_iter().collect();
        if seeds.len() < 3 {
            warn!(
                seeds = seeds.len(),
                "fewer than 3 seed nodes configured; partition resolution will be degenerate"
            );
        }
        Self { seeds }
    }

    /// True when `addr` is a configured seed (and its holder a voter).
    #[must_use]
    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.seeds.contains(addr)
    }

    /// Number of configured seeds.
    #[must_use]
    pub fn len(&self) -> usize {
        self.seeds.len()
    }

    /// True when no seeds are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seeds.is_empty()
    }

    /// Iterates the configured seed addresses in stable order.
    pub fn iter(&self) -> impl Iterator<Item = &SocketAddr> {
        self.seeds.iter()
    }

    /// Voters required for any cluster-wide decision: a strict majority of
    /// the configured seed set.
    #[must_use]
    pub fn quorum_size(&self) -> usize {
        self.seeds.len() / 2 + 1
    }

    /// Number of seed members observed `Up` in the provided view.
    #[must_use]
    pub fn up_voters<'a>(&self, view: impl IntoIterator<Item = &'a Member>) -> usize {
        view.into_iter()
            .filter(|m| m.status == MemberStatus::Up && self.seeds.contains(&m.addr))
            .count()
    }

    /// Whether the view contains a quorum of up seed members.
    #[must_use]
    pub fn quorum_available<'a>(&self, view: impl IntoIterator<Item = &'a Member>) -> bool {
        self.up_voters(view) >= self.quorum_size()
    }
}

use thiserror::Error;

/// Errors surfaced by the discovery subsystem.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Underlying network I/O failure.
    #[error("discovery transport error: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization or deserialization failure for wire payloads.
    #[error("discovery serialization error: {0}")]
    Serialization(String),
    /// Payload exceeded the configured datagram budget.
    #[error("discovery message too large: {0} bytes")]
    MessageTooLarge(usize),
    /// Configuration issue preventing startup.
    #[error("discovery configuration error: {0}")]
    Configuration(String),
    /// Too few seed voters are up to make cluster-wide decisions.
    #[error("quorum of seed voters unavailable ({up} up of {seeds}, need {needed})")]
    QuorumUnavailable {
        /// Seed members currently observed up.
        up: usize,
        /// Total configured seed addresses.
        seeds: usize,
        /// Voters required for a quorum.
        needed: usize,
    },
    /// The subsystem has not been started (or has been stopped).
    #[error("discovery subsystem not started")]
    NotStarted,
    /// The local node is not the elected master and cannot publish.
    #[error("local node is not the elected master")]
    NotMaster,
    /// A cluster-state update function failed.
    #[error("cluster state update failed: {0}")]
    StateApplication(String),
    /// An update proposed a version at or below the currently applied one.
    #[error("stale cluster state (current version {current}, proposed {proposed})")]
    StaleState {
        /// Version of the currently applied snapshot.
        current: u64,
        /// Version the rejected update proposed.
        proposed: u64,
    },
    /// The local node failed to join the cluster before its startup deadline.
    #[error("node failed to join the cluster before the startup deadline")]
    StartupTimeout,
}

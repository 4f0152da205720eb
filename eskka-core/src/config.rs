use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::DiscoveryError;
use crate::member::Roles;
use crate::voting::VotingMembers;

/// Default gossip/control port, used for binding and for seed entries that
/// omit a port.
pub const DEFAULT_PORT: u16 = 9400;

/// Hard upper bound on the publish acknowledgement deadline.
pub const PUBLISH_TIMEOUT_CAP: Duration = Duration::from_secs(60);

/// Top-level discovery configuration (`discovery.eskka.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// `host[:port]` endpoints used both for bootstrap and as the quorum
    /// denominator. Entries without a port get [`DEFAULT_PORT`].
    pub seed_nodes: Vec<String>,
    /// Bind host for gossip and control traffic.
    pub host: String,
    /// Bind port. Defaults to `0` (ephemeral) for client nodes and
    /// [`DEFAULT_PORT`] otherwise.
    pub port: Option<u16>,
    /// Externally reachable address advertised to peers; falls back to the
    /// bound address.
    pub advertise_addr: Option<SocketAddr>,
    /// Node role flags.
    pub node: NodeFlags,
    /// Partition evaluation tuning.
    pub partition: PartitionConfig,
    /// Failure detector heartbeat cadence.
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    /// Failure detector slack on top of the expected heartbeat arrival.
    #[serde(with = "humantime_serde")]
    pub acceptable_heartbeat_pause: Duration,
    /// Deadline for collecting publish acknowledgements, capped at
    /// [`PUBLISH_TIMEOUT_CAP`].
    #[serde(with = "humantime_serde")]
    pub publish_timeout: Duration,
    /// Base deadline for the initial join; jittered ±50% at startup.
    #[serde(with = "humantime_serde")]
    pub startup_timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            seed_nodes: Vec::new(),
            host: "0.0.0.0".to_string(),
            port: None,
            advertise_addr: None,
            node: NodeFlags::default(),
            partition: PartitionConfig::default(),
            heartbeat_interval: Duration::from_secs(1),
            acceptable_heartbeat_pause: Duration::from_secs(3),
            publish_timeout: PUBLISH_TIMEOUT_CAP,
            startup_timeout: Duration::from_secs(30),
        }
    }
}

/// Node role flags (`node.client`, `node.master`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeFlags {
    /// Client nodes hold no data and bind an ephemeral port by default.
    pub client: bool,
    /// Master eligibility; defaults to `!client`.
    pub master: Option<bool>,
}

/// Tuning for the quorum-ping partition monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionConfig {
    /// Delay between an unreachability observation and its evaluation.
    #[serde(with = "humantime_serde")]
    pub eval_delay: Duration,
    /// Window each voter has to complete its own probe and reply.
    #[serde(with = "humantime_serde")]
    pub ping_timeout: Duration,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            eval_delay: Duration::from_secs(5),
            ping_timeout: Duration::from_secs(2),
        }
    }
}

impl DiscoveryConfig {
    /// Resolves the configured seed entries to canonical socket addresses.
    ///
    /// Literal addresses are taken as-is; hostnames are resolved through the
    /// system resolver, taking the first answer.
    pub fn seeds(&self) -> Result<Vec<SocketAddr>, DiscoveryError> {
        if self.seed_nodes.is_empty() {
            return Err(DiscoveryError::Configuration(
                "seed_nodes must list at least one endpoint".to_string(),
            ));
        }
        let mut seeds = Vec::with_capacity(self.seed_nodes.len());
        for entry in &self.seed_nodes {
            seeds.push(resolve_endpoint(entry)?);
        }
        Ok(seeds)
    }

    /// The port to bind, honoring the client-node ephemeral default.
    #[must_use]
    pub fn effective_port(&self) -> u16 {
        self.port
            .unwrap_or(if self.node.client { 0 } else { DEFAULT_PORT })
    }

    /// The address to bind gossip and control traffic on.
    pub fn bind_addr(&self) -> Result<SocketAddr, DiscoveryError> {
        resolve_endpoint(&format!("{}:{}", self.host, self.effective_port()))
    }

    /// The address advertised to peers once `bound` is known.
    #[must_use]
    pub fn advertised(&self, bound: SocketAddr) -> SocketAddr {
        self.advertise_addr.unwrap_or(bound)
    }

    /// Roles derived from the flags and the seed set.
    #[must_use]
    pub fn roles(&self, advertised: SocketAddr, voting: &VotingMembers) -> Roles {
        Roles {
            master_eligible: self.node.master.unwrap_or(!self.node.client),
            voter: voting.contains(&advertised),
        }
    }

    /// The publish deadline, clamped to the hard cap.
    #[must_use]
    pub fn publish_timeout(&self) -> Duration {
        self.publish_timeout.min(PUBLISH_TIMEOUT_CAP)
    }
}

fn resolve_endpoint(entry: &str) -> Result<SocketAddr, DiscoveryError> {
    let candidate = if entry.contains(':') {
        entry.to_string()
    } else {
        format!("{entry}:{DEFAULT_PORT}")
    };
    if let Ok(parsed) = SocketAddr::from_str(&candidate) {
        return Ok(parsed);
    }
    candidate
        .to_socket_addrs()
        .map_err(|err| {
            DiscoveryError::Configuration(format!("failed to resolve '{entry}': {err}"))
        })?
        .next()
        .ok_or_else(|| {
            DiscoveryError::Configuration(format!("'{entry}' resolved to no addresses"))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = DiscoveryConfig::default();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(config.acceptable_heartbeat_pause, Duration::from_secs(3));
        assert_eq!(config.partition.eval_delay, Duration::from_secs(5));
        assert_eq!(config.partition.ping_timeout, Duration::from_secs(2));
        assert_eq!(config.effective_port(), DEFAULT_PORT);
    }

    #[test]
    fn client_nodes_default_to_ephemeral_port() {
        let config = DiscoveryConfig {
            node: NodeFlags { client: true, master: None },
            ..DiscoveryConfig::default()
        };
        assert_eq!(config.effective_port(), 0);
    }

    #[test]
    fn master_eligibility_defaults_to_non_client() {
        let voting = VotingMembers::new(["127.0.0.1:9400".parse().unwrap()]);
        let bound: SocketAddr = "127.0.0.1:9400".parse().unwrap();

        let data = DiscoveryConfig::default();
        assert!(data.roles(bound, &voting).master_eligible);
        assert!(data.roles(bound, &voting).voter);

        let client = DiscoveryConfig {
            node: NodeFlags { client: true, master: None },
            ..DiscoveryConfig::default()
        };
        assert!(!client.roles(bound, &voting).master_eligible);
    }

    #[test]
    fn seed_entries_get_default_port() {
        let config = DiscoveryConfig {
            seed_nodes: vec!["127.0.0.1".to_string(), "127.0.0.2:9500".to_string()],
            ..DiscoveryConfig::default()
        };
        let seeds = config.seeds().expect("resolve seeds");
        assert_eq!(seeds[0].port(), DEFAULT_PORT);
        assert_eq!(seeds[1].port(), 9500);
    }

    #[test]
    fn seed_hostnames_are_resolved() {
        let config = DiscoveryConfig {
            seed_nodes: vec!["localhost:9400".to_string()],
            ..DiscoveryConfig::default()
        };
        let seeds = config.seeds().expect("resolve seeds");
        assert!(seeds.iter().any(|addr| addr.port() == 9400));
    }

    #[test]
    fn empty_seed_list_is_rejected() {
        let config = DiscoveryConfig::default();
        assert!(matches!(
            config.seeds(),
            Err(DiscoveryError::Configuration(_))
        ));
    }

    #[test]
    fn publish_timeout_is_capped() {
        let config = DiscoveryConfig {
            publish_timeout: Duration::from_secs(600),
            ..DiscoveryConfig::default()
        };
        assert_eq!(config.publish_timeout(), PUBLISH_TIMEOUT_CAP);
    }

    #[test]
    fn durations_parse_from_humantime() {
        let parsed: DiscoveryConfig = serde_json::from_str(
            r#"{"seed_nodes":["127.0.0.1"],"partition":{"eval_delay":"2s 500ms","ping_timeout":"750ms"},"heartbeat_interval":"1s"}"#,
        )
        .expect("parse config");
        assert_eq!(parsed.partition.eval_delay, Duration::from_millis(2_500));
        assert_eq!(parsed.partition.ping_timeout, Duration::from_millis(750));
    }
}

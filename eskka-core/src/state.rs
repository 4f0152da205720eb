use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::DiscoveryError;
use crate::member::NodeId;

/// Global block set while the node has not recovered (or has cleared) its
/// cluster state.
pub const STATE_NOT_RECOVERED_BLOCK_ID: u32 = 1;
/// Global block set while no master is known.
pub const NO_MASTER_BLOCK_ID: u32 = 2;

/// A cluster-level operation block carried in the state's global block set.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Block {
    /// Stable block identifier.
    pub id: u32,
    /// Human-readable reason.
    pub reason: String,
}

impl Block {
    /// Block applied while cluster state has not been recovered.
    #[must_use]
    pub fn state_not_recovered() -> Self {
        Self {
            id: STATE_NOT_RECOVERED_BLOCK_ID,
            reason: "state not recovered / initialized".to_string(),
        }
    }

    /// Block applied while no master is elected.
    #[must_use]
    pub fn no_master() -> Self {
        Self {
            id: NO_MASTER_BLOCK_ID,
            reason: "no master".to_string(),
        }
    }
}

/// Routing entry for one index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRouting {
    /// Shard count.
    pub shards: u32,
    /// Whether all primaries are assigned.
    pub primaries_active: bool,
}

/// Shard routing for the whole cluster; replaced wholesale on version change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingTable {
    /// Monotonic routing version.
    pub version: u64,
    /// Per-index routing entries.
    pub indices: BTreeMap<String, IndexRouting>,
}

/// Settings and mappings for one index, versioned independently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMetaData {
    /// Per-index metadata version.
    pub version: u64,
    /// Opaque index settings.
    pub settings: BTreeMap<String, String>,
}

/// Cluster metadata; the top-level version gates wholesale reuse while
/// per-index entries are reused individually when unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaData {
    /// Top-level metadata version.
    pub version: u64,
    /// Per-index metadata.
    pub indices: BTreeMap<String, IndexMetaData>,
}

/// A node entry inside a cluster-state snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryNode {
    /// Node identifier.
    pub id: NodeId,
    /// Gossip/control endpoint.
    pub addr: SocketAddr,
    /// Whether the node may be elected master.
    pub master_eligible: bool,
}

/// An immutable, versioned cluster-state snapshot.
///
/// Snapshots are shared as `Arc<ClusterState>`; updates always produce a new
/// snapshot with a strictly higher version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterState {
    /// Monotonic state version.
    pub version: u64,
    /// Identifier of the node holding this snapshot.
    pub local_node_id: NodeId,
    /// The elected master, if any.
    pub master_node_id: Option<NodeId>,
    /// All nodes in the cluster as of this snapshot.
    pub nodes: BTreeMap<NodeId, DiscoveryNode>,
    /// Shard routing.
    pub routing_table: RoutingTable,
    /// Cluster metadata.
    pub metadata: MetaData,
    /// Global operation blocks.
    pub blocks: BTreeSet<Block>,
}

impl ClusterState {
    /// The state a node boots with: empty, blocked, knowing only itself.
    #[must_use]
    pub fn initial(local: NodeId) -> Self {
        Self {
            version: 0,
            local_node_id: local,
            master_node_id: None,
            nodes: BTreeMap::new(),
            routing_table: RoutingTable::default(),
            metadata: MetaData::default(),
            blocks: BTreeSet::from([Block::no_master(), Block::state_not_recovered()]),
        }
    }

    /// True when the block with `id` is set.
    #[must_use]
    pub fn has_block(&self, id: u32) -> bool {
        self.blocks.iter().any(|b| b.id == id)
    }

    /// Merges a master-published snapshot into the local view.
    ///
    /// Sub-structures whose version is unchanged are taken from `current`
    /// rather than the incoming copy: the whole routing table and the whole
    /// metadata on an equal top-level version, and individual index metadata
    /// entries on an equal per-index version otherwise.
    #[must_use]
    pub fn merge_incoming(current: &Self, incoming: Self) -> Self {
        let routing_table = if incoming.routing_table.version == current.routing_table.version {
            current.routing_table.clone()
        } else {
            incoming.routing_table
        };

        let metadata = if incoming.metadata.version == current.metadata.version {
            current.metadata.clone()
        } else {
            let mut merged = MetaData {
                version: incoming.metadata.version,
                indices: BTreeMap::new(),
            };
            for (index, meta) in incoming.metadata.indices {
                let kept = current
                    .metadata
                    .indices
                    .get(&index)
                    .filter(|existing| existing.version == meta.version)
                    .cloned();
                merged.indices.insert(index, kept.unwrap_or(meta));
            }
            merged
        };

        Self {
            version: incoming.version,
            local_node_id: current.local_node_id.clone(),
            master_node_id: incoming.master_node_id,
            nodes: incoming.nodes,
            routing_table,
            metadata,
            blocks: incoming.blocks,
        }
    }

    /// The state a node falls back to when it loses its quorum of seed
    /// voters: everything cluster-derived is dropped and writes are blocked
    /// until a master republishes.
    #[must_use]
    pub fn cleared(current: &Self, local_addr: SocketAddr, master_eligible: bool) -> Self {
        let local = DiscoveryNode {
            id: current.local_node_id.clone(),
            addr: local_addr,
            master_eligible,
        };
        let mut blocks = current.blocks.clone();
        blocks.insert(Block::no_master());
        blocks.insert(Block::state_not_recovered());
        Self {
            version: current.version + 1,
            local_node_id: current.local_node_id.clone(),
            master_node_id: None,
            nodes: BTreeMap::from([(local.id.clone(), local)]),
            routing_table: RoutingTable::default(),
            metadata: MetaData::default(),
            blocks,
        }
    }
}

/// The outcome of an accepted state update.
#[derive(Debug, Clone)]
pub struct Transition {
    /// Label of the component that submitted the update.
    pub source: String,
    /// Snapshot before the update.
    pub old: Arc<ClusterState>,
    /// Snapshot after the update; identical to `old` for no-op updates.
    pub new: Arc<ClusterState>,
}

impl Transition {
    /// True when the update actually replaced the snapshot.
    #[must_use]
    pub fn changed(&self) -> bool {
        !Arc::ptr_eq(&self.old, &self.new)
    }
}

/// Serializes cluster-state snapshots for publication.
pub trait StateCodec: Send + Sync {
    /// Encodes a snapshot to bytes.
    fn encode(&self, state: &ClusterState) -> Result<Vec<u8>, DiscoveryError>;
    /// Decodes a snapshot, accepting any supported format version.
    fn decode(&self, bytes: &[u8]) -> Result<ClusterState, DiscoveryError>;
}

const CODEC_FORMAT_VERSION: u8 = 1;

/// Default codec: a format-version byte followed by a bincode payload.
#[derive(Debug, Default, Clone, Copy)]
pub struct BincodeCodec;

impl StateCodec for BincodeCodec {
    fn encode(&self, state: &ClusterState) -> Result<Vec<u8>, DiscoveryError> {
        let mut bytes = vec![CODEC_FORMAT_VERSION];
        let payload = bincode::serialize(state)
            .map_err(|err| DiscoveryError::Serialization(err.to_string()))?;
        bytes.extend_from_slice(&payload);
        Ok(bytes)
    }

    fn decode(&self, bytes: &[u8]) -> Result<ClusterState, DiscoveryError> {
        match bytes.split_first() {
            Some((&CODEC_FORMAT_VERSION, payload)) => bincode::deserialize(payload)
                .map_err(|err| DiscoveryError::Serialization(err.to_string())),
            Some((&version, _)) => Err(DiscoveryError::Serialization(format!(
                "unsupported state format version {version}"
            ))),
            None => Err(DiscoveryError::Serialization("empty state payload".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, port: u16) -> DiscoveryNode {
        DiscoveryNode {
            id: NodeId::from(id),
            addr: format!("127.0.0.1:{port}").parse().unwrap(),
            master_eligible: true,
        }
    }

    fn sample_state(version: u64) -> ClusterState {
        let master = node("master", 9401);
        let local = node("local", 9402);
        ClusterState {
            version,
            local_node_id: local.id.clone(),
            master_node_id: Some(master.id.clone()),
            nodes: BTreeMap::from([
                (master.id.clone(), master),
                (local.id.clone(), local),
            ]),
            routing_table: RoutingTable {
                version: 3,
                indices: BTreeMap::from([(
                    "logs".to_string(),
                    IndexRouting { shards: 2, primaries_active: true },
                )]),
            },
            metadata: MetaData {
                version: 7,
                indices: BTreeMap::from([(
                    "logs".to_string(),
                    IndexMetaData { version: 4, settings: BTreeMap::new() },
                )]),
            },
            blocks: BTreeSet::new(),
        }
    }

    #[test]
    fn initial_state_is_blocked() {
        let state = ClusterState::initial(NodeId::from("n1"));
        assert!(state.has_block(NO_MASTER_BLOCK_ID));
        assert!(state.has_block(STATE_NOT_RECOVERED_BLOCK_ID));
        assert_eq!(state.version, 0);
        assert!(state.master_node_id.is_none());
    }

    #[test]
    fn merge_keeps_routing_table_on_equal_version() {
        let current = sample_state(10);
        let mut incoming = sample_state(11);
        incoming
            .routing_table
            .indices
            .insert("ghost".to_string(), IndexRouting { shards: 1, primaries_active: false });

        let merged = ClusterState::merge_incoming(&current, incoming);
        // Equal routing version: the incoming copy is discarded.
        assert_eq!(merged.routing_table, current.routing_table);
        assert_eq!(merged.version, 11);
    }

    #[test]
    fn merge_replaces_routing_table_on_version_change() {
        let current = sample_state(10);
        let mut incoming = sample_state(11);
        incoming.routing_table.version = 4;
        incoming.routing_table.indices.clear();

        let merged = ClusterState::merge_incoming(&current, incoming);
        assert_eq!(merged.routing_table.version, 4);
        assert!(merged.routing_table.indices.is_empty());
    }

    #[test]
    fn merge_reuses_unchanged_index_metadata() {
        let current = sample_state(10);
        let mut incoming = sample_state(11);
        incoming.metadata.version = 8;
        incoming
            .metadata
            .indices
            .insert("fresh".to_string(), IndexMetaData { version: 1, settings: BTreeMap::new() });

        let merged = ClusterState::merge_incoming(&current, incoming);
        assert_eq!(merged.metadata.version, 8);
        // "logs" is unchanged at version 4 and must be the current entry.
        assert_eq!(
            merged.metadata.indices.get("logs"),
            current.metadata.indices.get("logs")
        );
        assert!(merged.metadata.indices.contains_key("fresh"));
    }

    #[test]
    fn merge_preserves_local_node_id() {
        let current = sample_state(10);
        let mut incoming = sample_state(11);
        incoming.local_node_id = NodeId::from("someone-else");

        let merged = ClusterState::merge_incoming(&current, incoming);
        assert_eq!(merged.local_node_id, current.local_node_id);
    }

    #[test]
    fn cleared_state_drops_everything_and_blocks() {
        let current = sample_state(10);
        let cleared = ClusterState::cleared(&current, "127.0.0.1:9402".parse().unwrap(), true);
        assert_eq!(cleared.version, 11);
        assert!(cleared.master_node_id.is_none());
        assert_eq!(cleared.nodes.len(), 1);
        assert!(cleared.nodes.contains_key(&current.local_node_id));
        assert!(cleared.routing_table.indices.is_empty());
        assert!(cleared.metadata.indices.is_empty());
        assert!(cleared.has_block(NO_MASTER_BLOCK_ID));
        assert!(cleared.has_block(STATE_NOT_RECOVERED_BLOCK_ID));
    }

    #[test]
    fn codec_rejects_unknown_format_version() {
        let codec = BincodeCodec;
        let mut bytes = codec.encode(&sample_state(1)).expect("encode");
        assert_eq!(codec.decode(&bytes).expect("decode").version, 1);

        bytes[0] = 99;
        assert!(matches!(
            codec.decode(&bytes),
            Err(DiscoveryError::Serialization(_))
        ));
        assert!(codec.decode(&[]).is_err());
    }
}

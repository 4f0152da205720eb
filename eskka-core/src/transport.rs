use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;

use crate::error::DiscoveryError;
use crate::member::NodeId;
use crate::membership::GossipMessage;

const DEFAULT_MAX_DATAGRAM: usize = 60 * 1024;

/// One wire message between two nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Envelope {
    /// Membership traffic handled by the gossip engine.
    Gossip(GossipMessage),
    /// Master-to-follower delivery of an encoded cluster-state snapshot.
    Publish {
        /// Version of the encoded snapshot.
        version: u64,
        /// Codec output.
        bytes: Vec<u8>,
    },
    /// Follower acknowledgement of a publish.
    PublishAck {
        /// Version being acknowledged.
        version: u64,
        /// Acknowledging node.
        node: NodeId,
        /// `None` on success.
        error: Option<String>,
    },
    /// Follower asking the master to republish the current state to it.
    PleasePublish {
        /// Address the republish should go to.
        requester: SocketAddr,
    },
    /// Ask a voter to probe `target` and report back affirmatively.
    PingRequest {
        /// Correlates responses with one evaluation.
        req_id: u64,
        /// Where the response must be sent.
        reply_to: SocketAddr,
        /// Node under evaluation.
        target: SocketAddr,
        /// Probe window the voter must respect.
        timeout: Duration,
    },
    /// A voter's verdict on a ping request. Always sent: silence is never a
    /// verdict.
    PingResponse {
        /// The request this answers.
        req_id: u64,
        /// The responding voter.
        voter: SocketAddr,
        /// Probe outcome.
        outcome: PingOutcome,
    },
}

/// The two affirmative verdicts a voter can reach about a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PingOutcome {
    /// The voter's own probe of the target completed.
    Ok,
    /// The voter's own probe timer expired.
    Timeout,
}

/// Point-to-point message delivery between nodes.
///
/// Delivery is best-effort: sends to partitioned or dead peers are silently
/// lost, and every protocol built on top tolerates that.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// The address peers reach this node at.
    fn local_addr(&self) -> SocketAddr;
    /// Sends one envelope to a peer.
    async fn send(&self, to: SocketAddr, envelope: &Envelope) -> Result<(), DiscoveryError>;
    /// Receives the next envelope and its sender address.
    async fn recv(&self) -> Result<(Envelope, SocketAddr), DiscoveryError>;
}

/// Production transport: bincode-framed envelopes over UDP.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    max_datagram: usize,
}

impl UdpTransport {
    /// Binds a UDP socket for discovery traffic.
    pub async fn bind(bind_addr: SocketAddr) -> Result<Self, DiscoveryError> {
        let socket = UdpSocket::bind(bind_addr).await?;
        Ok(Self {
            socket: Arc::new(socket),
            max_datagram: DEFAULT_MAX_DATAGRAM,
        })
    }

    /// Overrides the datagram budget.
    #[must_use]
    pub fn with_max_datagram(mut self, max_datagram: usize) -> Self {
        self.max_datagram = max_datagram;
        self
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn local_addr(&self) -> SocketAddr {
        self.socket
            .local_addr()
            .expect("bound socket has a local address")
    }

    async fn send(&self, to: SocketAddr, envelope: &Envelope) -> Result<(), DiscoveryError> {
        let payload = bincode::serialize(envelope)
            .map_err(|err| DiscoveryError::Serialization(err.to_string()))?;
        if payload.len() > self.max_datagram {
            return Err(DiscoveryError::MessageTooLarge(payload.len()));
        }
        self.socket.send_to(&payload, to).await?;
        Ok(())
    }

    async fn recv(&self) -> Result<(Envelope, SocketAddr), DiscoveryError> {
        let mut buf = vec![0u8; self.max_datagram];
        let (len, from) = self.socket.recv_from(&mut buf).await?;
        let envelope = bincode::deserialize(&buf[..len])
            .map_err(|err| DiscoveryError::Serialization(err.to_string()))?;
        Ok((envelope, from))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn udp_round_trip() {
        let a = UdpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .expect("bind a");
        let b = UdpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .expect("bind b");

        let envelope = Envelope::PleasePublish { requester: a.local_addr() };
        a.send(b.local_addr(), &envelope).await.expect("send");

        let (received, from) = b.recv().await.expect("recv");
        assert_eq!(from, a.local_addr());
        assert!(matches!(
            received,
            Envelope::PleasePublish { requester } if requester == a.local_addr()
        ));
    }

    #[tokio::test]
    async fn oversized_payloads_are_rejected() {
        let a = UdpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .expect("bind")
            .with_max_datagram(64);
        let envelope = Envelope::Publish { version: 1, bytes: vec![0u8; 1024] };
        assert!(matches!(
            a.send(a.local_addr(), &envelope).await,
            Err(DiscoveryError::MessageTooLarge(_))
        ));
    }
}

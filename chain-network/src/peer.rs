//! Connected peers and the messages exchanged with them

use crate::conn::{SecretReader, SecretWriter};
use crate::{NetAddress, NetworkError, NetworkResult, NodeId};
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Upper bound on an encoded [`NodeInfo`]
pub const MAX_NODE_INFO_SIZE: usize = 10 * 1024;

const MAX_MONIKER_LEN: usize = 64;
const MAX_NUM_CHANNELS: usize = 16;

/// Channel id plus big-endian payload length
const PACKET_HEADER_SIZE: usize = 5;

/// Self-description sent by each side right after the secret handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct NodeInfo {
    pub id: NodeId,
    /// `ip:port` the node accepts connections on
    pub listen_addr: String,
    pub network: String,
    pub version: String,
    pub channels: Vec<u8>,
    pub moniker: String,
}

impl NodeInfo {
    /// The address other nodes should dial to reach this one
    pub fn net_address(&self) -> NetworkResult<NetAddress> {
        let socket_addr: SocketAddr = self.listen_addr.parse().map_err(|e| {
            NetworkError::InvalidAddress(format!("listen address {}: {}", self.listen_addr, e))
        })?;
        Ok(NetAddress::new(self.id, socket_addr))
    }

    /// Structural checks only. Whether the listen address is dialable is
    /// left to the address book.
    pub fn validate(&self) -> NetworkResult<()> {
        self.net_address()?;

        if self.network.is_empty() {
            return Err(NetworkError::RejectedPeer("empty network name".to_string()));
        }
        if self.moniker.len() > MAX_MONIKER_LEN {
            return Err(NetworkError::RejectedPeer(format!(
                "moniker longer than {} bytes",
                MAX_MONIKER_LEN
            )));
        }
        if self.channels.len() > MAX_NUM_CHANNELS {
            return Err(NetworkError::RejectedPeer(format!(
                "{} channels exceed {}",
                self.channels.len(),
                MAX_NUM_CHANNELS
            )));
        }
        let mut seen = [false; 256];
        for &ch in &self.channels {
            if std::mem::replace(&mut seen[ch as usize], true) {
                return Err(NetworkError::RejectedPeer(format!("duplicate channel {:#04x}", ch)));
            }
        }
        Ok(())
    }

    /// Both nodes must be on the same network and share a channel
    pub fn compatible_with(&self, other: &NodeInfo) -> NetworkResult<()> {
        if self.network != other.network {
            return Err(NetworkError::RejectedPeer(format!(
                "peer is on network {}, we are on {}",
                other.network, self.network
            )));
        }
        if !self.channels.is_empty() && !self.channels.iter().any(|ch| other.channels.contains(ch)) {
            return Err(NetworkError::RejectedPeer("no common channels".to_string()));
        }
        Ok(())
    }

    pub fn encode(&self) -> NetworkResult<Vec<u8>> {
        Ok(bincode::encode_to_vec(self, bincode::config::standard())?)
    }

    pub fn decode(bytes: &[u8]) -> NetworkResult<Self> {
        let config = bincode::config::standard().with_limit::<MAX_NODE_INFO_SIZE>();
        let (info, read): (Self, usize) = bincode::decode_from_slice(bytes, config)?;
        if read != bytes.len() {
            return Err(NetworkError::Protocol("trailing bytes after node info".to_string()));
        }
        Ok(info)
    }
}

/// A message on one logical channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub channel: u8,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(channel: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            channel,
            payload: payload.into(),
        }
    }
}

/// Write one packet as channel, length and payload
pub async fn write_packet<W: AsyncWrite + Unpin>(
    writer: &mut SecretWriter<W>,
    packet: &Packet,
) -> NetworkResult<()> {
    let mut buf = Vec::with_capacity(PACKET_HEADER_SIZE + packet.payload.len());
    buf.push(packet.channel);
    buf.extend_from_slice(&(packet.payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&packet.payload);
    writer.write_all(&buf).await
}

/// Read one packet, refusing payloads larger than `max_payload`
pub async fn read_packet<R: AsyncRead + Unpin>(
    reader: &mut SecretReader<R>,
    max_payload: usize,
) -> NetworkResult<Packet> {
    let mut header = [0u8; PACKET_HEADER_SIZE];
    reader.read_exact(&mut header).await?;

    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&header[1..]);
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > max_payload {
        return Err(NetworkError::Protocol(format!(
            "packet payload of {} bytes exceeds {}",
            len, max_payload
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Packet::new(header[0], payload))
}

/// A live connection to another node. The switch owns the socket; a `Peer`
/// only queues outgoing packets and reports connection metadata.
pub struct Peer {
    node_info: NodeInfo,
    outbound: bool,
    persistent: bool,
    socket_addr: SocketAddr,
    connected_at: Instant,
    send_tx: mpsc::Sender<Packet>,
    cancel: CancellationToken,
}

impl Peer {
    pub(crate) fn new(
        node_info: NodeInfo,
        outbound: bool,
        persistent: bool,
        socket_addr: SocketAddr,
        send_tx: mpsc::Sender<Packet>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            node_info,
            outbound,
            persistent,
            socket_addr,
            connected_at: Instant::now(),
            send_tx,
            cancel,
        }
    }

    pub fn id(&self) -> NodeId {
        self.node_info.id
    }

    pub fn node_info(&self) -> &NodeInfo {
        &self.node_info
    }

    /// We dialed this peer
    pub fn is_outbound(&self) -> bool {
        self.outbound
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    /// Remote end of the TCP connection
    pub fn socket_addr(&self) -> SocketAddr {
        self.socket_addr
    }

    /// The address the peer says it listens on
    pub fn listen_address(&self) -> NetworkResult<NetAddress> {
        self.node_info.net_address()
    }

    pub fn connected_for(&self) -> Duration {
        self.connected_at.elapsed()
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Queue a message without waiting. Returns false if the queue is full
    /// or the peer is stopping.
    pub fn try_send(&self, channel: u8, payload: impl Into<Bytes>) -> bool {
        if !self.is_running() {
            return false;
        }
        self.send_tx.try_send(Packet::new(channel, payload)).is_ok()
    }

    /// Queue a message, waiting for room in the queue
    pub async fn send(&self, channel: u8, payload: impl Into<Bytes>) -> bool {
        if !self.is_running() {
            return false;
        }
        self.send_tx.send(Packet::new(channel, payload)).await.is_ok()
    }

    pub(crate) fn stop(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    #[cfg(test)]
    pub(crate) fn mock(node_info: NodeInfo, outbound: bool) -> (Arc<Self>, mpsc::Receiver<Packet>) {
        let (tx, rx) = mpsc::channel(16);
        let socket_addr = node_info
            .listen_addr
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 26656)));
        let peer = Self::new(node_info, outbound, false, socket_addr, tx, CancellationToken::new());
        (Arc::new(peer), rx)
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.node_info.id)
            .field("socket_addr", &self.socket_addr)
            .field("outbound", &self.outbound)
            .field("persistent", &self.persistent)
            .finish()
    }
}

/// Connected peers indexed by node id
#[derive(Debug, Default)]
pub struct PeerSet {
    peers: DashMap<NodeId, Arc<Peer>>,
}

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert unless a peer with the same id is already present
    pub fn add(&self, peer: Arc<Peer>) -> NetworkResult<()> {
        match self.peers.entry(peer.id()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(NetworkError::DuplicatePeer(peer.id())),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(peer);
                Ok(())
            }
        }
    }

    pub fn has(&self, id: &NodeId) -> bool {
        self.peers.contains_key(id)
    }

    pub fn get(&self, id: &NodeId) -> Option<Arc<Peer>> {
        self.peers.get(id).map(|p| Arc::clone(p.value()))
    }

    pub fn remove(&self, id: &NodeId) -> Option<Arc<Peer>> {
        self.peers.remove(id).map(|(_, p)| p)
    }

    /// Remove `peer` only if it is still the connection registered under its id
    pub fn remove_exact(&self, peer: &Arc<Peer>) -> bool {
        self.peers
            .remove_if(&peer.id(), |_, current| Arc::ptr_eq(current, peer))
            .is_some()
    }

    pub fn list(&self) -> Vec<Arc<Peer>> {
        self.peers.iter().map(|p| Arc::clone(p.value())).collect()
    }

    pub fn size(&self) -> usize {
        self.peers.len()
    }

    /// Counts of (outbound, inbound) peers
    pub fn count_by_direction(&self) -> (usize, usize) {
        self.peers.iter().fold((0, 0), |(out, inb), p| {
            if p.is_outbound() {
                (out + 1, inb)
            } else {
                (out, inb + 1)
            }
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::conn::SecretConnection;
    use crate::NodeKey;

    pub(crate) fn node_info(network: &str, listen_addr: &str) -> NodeInfo {
        NodeInfo {
            id: NodeKey::generate().id(),
            listen_addr: listen_addr.to_string(),
            network: network.to_string(),
            version: "0.1.0".to_string(),
            channels: vec![0x00],
            moniker: "test".to_string(),
        }
    }

    #[test]
    fn test_node_info_validation() {
        let info = node_info("testnet", "1.2.3.4:26656");
        assert!(info.validate().is_ok());
        assert_eq!(info.net_address().unwrap().port, 26656);

        let mut bad = info.clone();
        bad.listen_addr = "not an address".to_string();
        assert!(bad.validate().is_err());

        let mut bad = info.clone();
        bad.channels = vec![1, 2, 1];
        assert!(bad.validate().is_err());

        let mut bad = info;
        bad.moniker = "x".repeat(MAX_MONIKER_LEN + 1);
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_node_info_compatibility() {
        let ours = node_info("testnet", "1.2.3.4:26656");
        let theirs = node_info("testnet", "5.6.7.8:26656");
        assert!(ours.compatible_with(&theirs).is_ok());

        let other_net = node_info("mainnet", "5.6.7.8:26656");
        assert!(ours.compatible_with(&other_net).is_err());

        let mut no_shared = theirs;
        no_shared.channels = vec![0x20];
        assert!(ours.compatible_with(&no_shared).is_err());
    }

    #[test]
    fn test_node_info_codec() {
        let info = node_info("testnet", "1.2.3.4:26656");
        let mut bytes = info.encode().unwrap();
        assert_eq!(NodeInfo::decode(&bytes).unwrap(), info);

        bytes.push(1);
        assert!(NodeInfo::decode(&bytes).is_err());
    }

    #[tokio::test]
    async fn test_packet_framing() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (ka, kb) = (NodeKey::generate(), NodeKey::generate());
        let (ca, cb) = tokio::try_join!(
            SecretConnection::handshake(a, &ka),
            SecretConnection::handshake(b, &kb)
        )
        .unwrap();
        let (_, mut writer) = ca.into_split();
        let (mut reader, _w) = cb.into_split();

        let big = Packet::new(0x20, vec![7u8; 5000]);
        write_packet(&mut writer, &Packet::new(0x00, &b"hi"[..])).await.unwrap();
        write_packet(&mut writer, &big).await.unwrap();

        let first = read_packet(&mut reader, 8192).await.unwrap();
        assert_eq!(first.channel, 0x00);
        assert_eq!(&first.payload[..], b"hi");
        assert_eq!(read_packet(&mut reader, 8192).await.unwrap(), big);

        write_packet(&mut writer, &big).await.unwrap();
        let err = read_packet(&mut reader, 1024).await.unwrap_err();
        assert!(err.is_protocol_violation());
    }

    #[tokio::test]
    async fn test_peer_send_queue() {
        let (peer, mut rx) = Peer::mock(node_info("testnet", "1.2.3.4:26656"), true);
        assert!(peer.try_send(0x00, &b"one"[..]));
        assert!(peer.send(0x00, &b"two"[..]).await);
        assert_eq!(&rx.recv().await.unwrap().payload[..], b"one");
        assert_eq!(&rx.recv().await.unwrap().payload[..], b"two");

        peer.stop();
        assert!(!peer.is_running());
        assert!(!peer.try_send(0x00, &b"three"[..]));
    }

    #[test]
    fn test_peer_set() {
        let set = PeerSet::new();
        let (out, _rx1) = Peer::mock(node_info("testnet", "1.2.3.4:26656"), true);
        let (inb, _rx2) = Peer::mock(node_info("testnet", "5.6.7.8:26656"), false);

        set.add(out.clone()).unwrap();
        set.add(inb.clone()).unwrap();
        assert!(matches!(set.add(out.clone()), Err(NetworkError::DuplicatePeer(_))));
        assert_eq!(set.size(), 2);
        assert_eq!(set.count_by_direction(), (1, 1));
        assert!(set.has(&inb.id()));

        let (impostor, _rx3) = Peer::mock(inb.node_info().clone(), false);
        assert!(!set.remove_exact(&impostor));
        assert!(set.remove_exact(&inb));
        assert!(set.add(inb.clone()).is_ok());

        assert!(set.remove(&out.id()).is_some());
        assert!(set.get(&out.id()).is_none());
        assert_eq!(set.list().len(), 1);
    }
}

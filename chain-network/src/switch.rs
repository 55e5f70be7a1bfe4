//! Connection management and message routing
//!
//! The [`Switch`] accepts and dials TCP connections, upgrades them to
//! [`SecretConnection`]s, exchanges [`NodeInfo`] and then routes packets
//! between peers and the [`Reactor`]s registered for each channel.

use crate::conn::{SecretConnection, SecretReader, SecretWriter};
use crate::peer::{read_packet, write_packet, NodeInfo, Packet, Peer, PeerSet, MAX_NODE_INFO_SIZE};
use crate::trust::TrustMetricStore;
use crate::{NetAddress, NetworkError, NetworkResult, NodeId, NodeKey, P2pConfig};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashSet;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type ConnReader = SecretReader<ReadHalf<TcpStream>>;
type ConnWriter = SecretWriter<WriteHalf<TcpStream>>;

const RECONNECT_ATTEMPTS: u32 = 20;
const RECONNECT_MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Time allowed to flush queued packets when a peer is stopped
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// A protocol running on top of the switch. Each reactor owns one or more
/// channels and sees every peer that connects.
#[async_trait]
pub trait Reactor: Send + Sync {
    fn name(&self) -> &'static str;

    fn channels(&self) -> Vec<u8>;

    async fn add_peer(&self, peer: Arc<Peer>);

    /// `reason` is set when the peer was stopped because of an error
    async fn remove_peer(&self, peer: Arc<Peer>, reason: Option<&str>);

    async fn receive(&self, channel: u8, peer: Arc<Peer>, msg: Bytes);
}

/// What a reactor may ask of the switch it runs on
#[async_trait]
pub trait PeerSwitch: Send + Sync {
    fn peers(&self) -> Vec<Arc<Peer>>;

    fn get_peer(&self, id: &NodeId) -> Option<Arc<Peer>>;

    /// Counts of (outbound, inbound, dialing) connections
    fn num_peers(&self) -> (usize, usize, usize);

    fn max_num_outbound_peers(&self) -> usize;

    fn is_dialing_or_existing(&self, addr: &NetAddress) -> bool;

    fn is_peer_persistent(&self, addr: &NetAddress) -> bool;

    /// Dial, handshake and register an outbound peer
    async fn dial_peer(&self, addr: &NetAddress) -> NetworkResult<()>;

    async fn stop_peer_for_error(&self, peer: &Arc<Peer>, reason: String);

    async fn stop_peer_gracefully(&self, peer: &Arc<Peer>);
}

pub struct Switch {
    config: P2pConfig,
    node_key: NodeKey,
    node_info: RwLock<NodeInfo>,
    reactors: RwLock<Vec<Arc<dyn Reactor>>>,
    reactors_by_channel: RwLock<HashMap<u8, Arc<dyn Reactor>>>,
    peers: PeerSet,
    dialing: DashSet<NodeId>,
    reconnecting: DashSet<NodeId>,
    persistent_addrs: RwLock<Vec<NetAddress>>,
    trust_store: Option<Arc<TrustMetricStore>>,
    local_addr: RwLock<Option<SocketAddr>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    self_ref: Weak<Switch>,
}

impl Switch {
    pub fn new(
        config: P2pConfig,
        node_key: NodeKey,
        trust_store: Option<Arc<TrustMetricStore>>,
    ) -> Arc<Self> {
        let listen_addr = if config.external_address.is_empty() {
            config.listen_address.clone()
        } else {
            config.external_address.clone()
        };
        let node_info = NodeInfo {
            id: node_key.id(),
            listen_addr,
            network: config.network.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            channels: Vec::new(),
            moniker: config.moniker.clone(),
        };

        Arc::new_cyclic(|self_ref| Self {
            config,
            node_key,
            node_info: RwLock::new(node_info),
            reactors: RwLock::new(Vec::new()),
            reactors_by_channel: RwLock::new(HashMap::new()),
            peers: PeerSet::new(),
            dialing: DashSet::new(),
            reconnecting: DashSet::new(),
            persistent_addrs: RwLock::new(Vec::new()),
            trust_store,
            local_addr: RwLock::new(None),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            self_ref: self_ref.clone(),
        })
    }

    /// Register a reactor. Must be called before [`Switch::start`].
    pub fn add_reactor(&self, reactor: Arc<dyn Reactor>) -> NetworkResult<()> {
        let mut by_channel = self.reactors_by_channel.write();
        let channels = reactor.channels();
        for ch in &channels {
            if let Some(existing) = by_channel.get(ch) {
                return Err(NetworkError::Config(format!(
                    "channel {:#04x} of {} already claimed by {}",
                    ch,
                    reactor.name(),
                    existing.name()
                )));
            }
        }
        for ch in &channels {
            by_channel.insert(*ch, Arc::clone(&reactor));
        }
        self.node_info.write().channels.extend(channels);
        self.reactors.write().push(reactor);
        Ok(())
    }

    pub fn node_id(&self) -> NodeId {
        self.node_key.id()
    }

    pub fn node_info(&self) -> NodeInfo {
        self.node_info.read().clone()
    }

    /// Bound listen address once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read()
    }

    /// Bind the listener, start accepting and connect persistent peers
    pub async fn start(&self) -> NetworkResult<()> {
        let this = self.arc()?;

        let mut persistent = Vec::with_capacity(self.config.persistent_peers.len());
        for peer in &self.config.persistent_peers {
            let addr = NetAddress::resolve(peer)
                .await
                .map_err(|e| NetworkError::Config(format!("persistent peer {}: {}", peer, e)))?;
            persistent.push(addr);
        }
        *self.persistent_addrs.write() = persistent.clone();

        let listener = TcpListener::bind(&self.config.listen_address).await?;
        let local = listener.local_addr()?;
        *self.local_addr.write() = Some(local);
        if self.config.external_address.is_empty() {
            self.node_info.write().listen_addr = local.to_string();
        }
        info!("P2P switch listening on {} as {}", local, self.node_id());

        let accept = tokio::spawn(Arc::clone(&this).accept_routine(listener));
        self.tasks.lock().push(accept);

        for addr in persistent {
            tokio::spawn(Arc::clone(&this).reconnect_to_peer(addr));
        }
        Ok(())
    }

    /// Stop accepting, disconnect every peer and wait for the accept loop
    pub async fn stop(&self) {
        self.cancel.cancel();
        for peer in self.peers.list() {
            self.remove_peer(&peer, None, false).await;
        }
        let handles: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Switch task failed: {}", e);
            }
        }
        info!("P2P switch stopped");
    }

    fn arc(&self) -> NetworkResult<Arc<Self>> {
        self.self_ref.upgrade().ok_or(NetworkError::Stopped)
    }

    fn reactors(&self) -> Vec<Arc<dyn Reactor>> {
        self.reactors.read().clone()
    }

    fn is_persistent_id(&self, id: &NodeId) -> bool {
        self.persistent_addrs.read().iter().any(|a| a.id == *id)
    }

    async fn accept_routine(self: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => break,
                res = listener.accept() => res,
            };
            let (stream, remote) = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    continue;
                }
            };

            let (_, inbound) = self.peers.count_by_direction();
            if inbound >= self.config.max_num_inbound_peers {
                debug!("Rejecting {}: {} inbound peers connected", remote, inbound);
                continue;
            }

            let switch = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = switch.accept_peer(stream, remote).await {
                    debug!("Inbound connection from {} failed: {}", remote, e);
                }
            });
        }
        debug!("Accept loop stopped");
    }

    async fn accept_peer(&self, stream: TcpStream, remote: SocketAddr) -> NetworkResult<()> {
        let (reader, writer, info) =
            tokio::time::timeout(self.config.handshake_timeout(), self.upgrade(stream)).await??;

        let (_, inbound) = self.peers.count_by_direction();
        if inbound >= self.config.max_num_inbound_peers {
            return Err(NetworkError::RejectedPeer("too many inbound peers".to_string()));
        }

        if self.config.min_inbound_trust_score > 0 {
            if let Some(trust) = &self.trust_store {
                let score = trust.trust_score(&info.id.to_string());
                if score < self.config.min_inbound_trust_score {
                    return Err(NetworkError::RejectedPeer(format!(
                        "{} has trust score {}",
                        info.id, score
                    )));
                }
            }
        }

        self.add_peer(reader, writer, info, false, remote).await?;
        Ok(())
    }

    /// Secret handshake followed by a concurrent exchange of node infos
    async fn upgrade(&self, stream: TcpStream) -> NetworkResult<(ConnReader, ConnWriter, NodeInfo)> {
        let conn = SecretConnection::handshake(stream, &self.node_key).await?;
        let remote_id = conn.remote_id();
        let (mut reader, mut writer) = conn.into_split();

        let ours = self.node_info();
        let encoded = ours.encode()?;
        let mut msg = Vec::with_capacity(4 + encoded.len());
        msg.extend_from_slice(&(encoded.len() as u32).to_be_bytes());
        msg.extend_from_slice(&encoded);

        let send = writer.write_all(&msg);
        let recv = async {
            let mut len_bytes = [0u8; 4];
            reader.read_exact(&mut len_bytes).await?;
            let len = u32::from_be_bytes(len_bytes) as usize;
            if len > MAX_NODE_INFO_SIZE {
                return Err(NetworkError::Protocol(format!("node info of {} bytes", len)));
            }
            let mut buf = vec![0u8; len];
            reader.read_exact(&mut buf).await?;
            NodeInfo::decode(&buf)
        };
        let ((), theirs) = tokio::try_join!(send, recv)?;

        if theirs.id != remote_id {
            return Err(NetworkError::AuthenticationFailure(format!(
                "node info claims {} but the connection is authenticated as {}",
                theirs.id, remote_id
            )));
        }
        theirs.validate()?;
        ours.compatible_with(&theirs)?;

        Ok((reader, writer, theirs))
    }

    async fn add_peer(
        &self,
        reader: ConnReader,
        writer: ConnWriter,
        info: NodeInfo,
        outbound: bool,
        socket_addr: SocketAddr,
    ) -> NetworkResult<Arc<Peer>> {
        let this = self.arc()?;
        if info.id == self.node_id() {
            return Err(NetworkError::SelfDial);
        }

        let (tx, rx) = mpsc::channel(self.config.send_queue_capacity);
        let persistent = self.is_persistent_id(&info.id);
        let peer = Arc::new(Peer::new(
            info,
            outbound,
            persistent,
            socket_addr,
            tx,
            self.cancel.child_token(),
        ));
        self.peers.add(Arc::clone(&peer))?;

        tokio::spawn(Arc::clone(&this).send_routine(writer, rx, Arc::clone(&peer)));
        for reactor in self.reactors() {
            reactor.add_peer(Arc::clone(&peer)).await;
        }
        tokio::spawn(this.recv_routine(reader, Arc::clone(&peer)));

        info!(
            "Added {} peer {} at {}",
            if outbound { "outbound" } else { "inbound" },
            peer.id(),
            socket_addr
        );
        Ok(peer)
    }

    async fn send_routine(self: Arc<Self>, mut writer: ConnWriter, mut rx: mpsc::Receiver<Packet>, peer: Arc<Peer>) {
        let cancel = peer.cancel_token();
        loop {
            let packet = tokio::select! {
                _ = cancel.cancelled() => break,
                packet = rx.recv() => packet,
            };
            let Some(packet) = packet else { break };
            if let Err(e) = write_packet(&mut writer, &packet).await {
                self.stop_peer_for_error(&peer, format!("send failed: {}", e)).await;
                return;
            }
        }

        // Deliver what was queued before the stop, e.g. a final PEX response
        let flush = async {
            while let Ok(packet) = rx.try_recv() {
                write_packet(&mut writer, &packet).await?;
            }
            writer.shutdown().await
        };
        match tokio::time::timeout(FLUSH_TIMEOUT, flush).await {
            Ok(Err(e)) => debug!("Flushing {} failed: {}", peer.id(), e),
            Err(_) => debug!("Flushing {} timed out", peer.id()),
            Ok(Ok(())) => {}
        }
    }

    async fn recv_routine(self: Arc<Self>, mut reader: ConnReader, peer: Arc<Peer>) {
        let cancel = peer.cancel_token();
        let max_payload = self.config.max_packet_msg_payload_size;
        loop {
            let res = tokio::select! {
                _ = cancel.cancelled() => return,
                res = read_packet(&mut reader, max_payload) => res,
            };
            let packet = match res {
                Ok(packet) => packet,
                Err(NetworkError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    self.remove_peer(&peer, Some("connection closed".to_string()), false).await;
                    return;
                }
                Err(e) => {
                    self.stop_peer_for_error(&peer, e.to_string()).await;
                    return;
                }
            };

            let reactor = self.reactors_by_channel.read().get(&packet.channel).cloned();
            let Some(reactor) = reactor else {
                let reason = format!("message on unknown channel {:#04x}", packet.channel);
                self.stop_peer_for_error(&peer, reason).await;
                return;
            };
            if let Some(trust) = &self.trust_store {
                trust.good_events(&peer.id().to_string(), 1);
            }
            reactor.receive(packet.channel, Arc::clone(&peer), packet.payload).await;
        }
    }

    /// Tear a peer down once. Peers stopped with a reason count against
    /// their trust when `penalize` is set, and persistent ones are redialed.
    async fn remove_peer(&self, peer: &Arc<Peer>, reason: Option<String>, penalize: bool) {
        if !self.peers.remove_exact(peer) {
            return;
        }
        peer.stop();

        for reactor in self.reactors() {
            reactor.remove_peer(Arc::clone(peer), reason.as_deref()).await;
        }

        if let Some(trust) = &self.trust_store {
            let key = peer.id().to_string();
            if penalize {
                trust.bad_events(&key, 1);
            }
            trust.peer_disconnected(&key);
        }

        if reason.is_some() && peer.is_persistent() && !self.cancel.is_cancelled() {
            let addr = self
                .persistent_addrs
                .read()
                .iter()
                .find(|a| a.id == peer.id())
                .copied();
            if let (Some(addr), Ok(this)) = (addr, self.arc()) {
                tokio::spawn(this.reconnect_to_peer(addr));
            }
        }
    }

    fn reconnect_to_peer(self: Arc<Self>, addr: NetAddress) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(async move {
            if !self.reconnecting.insert(addr.id) {
                return;
            }

            let mut connected = false;
            for attempt in 0..RECONNECT_ATTEMPTS {
                if attempt > 0 {
                    let jitter = Duration::from_millis(rand::rng().random_range(0..1000));
                    let backoff = Duration::from_secs(1u64 << attempt.min(16)).min(RECONNECT_MAX_BACKOFF) + jitter;
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
                if self.cancel.is_cancelled() {
                    break;
                }

                match self.dial_peer_with_address(&addr).await {
                    Ok(()) | Err(NetworkError::DuplicatePeer(_)) | Err(NetworkError::AlreadyDialing(_)) => {
                        connected = true;
                        break;
                    }
                    Err(e) => debug!("Reconnect to {} failed (attempt {}): {}", addr, attempt + 1, e),
                }
            }

            self.reconnecting.remove(&addr.id);
            if !connected && !self.cancel.is_cancelled() {
                error!("Giving up on persistent peer {} after {} attempts", addr, RECONNECT_ATTEMPTS);
            }
        })
    }

    async fn dial_peer_with_address(&self, addr: &NetAddress) -> NetworkResult<()> {
        if addr.id == self.node_id() {
            return Err(NetworkError::SelfDial);
        }
        if self.peers.has(&addr.id) {
            return Err(NetworkError::DuplicatePeer(addr.id));
        }
        if !self.dialing.insert(addr.id) {
            return Err(NetworkError::AlreadyDialing(addr.to_string()));
        }

        let result = self.dial(addr).await;
        self.dialing.remove(&addr.id);
        if let Err(e) = &result {
            debug!("Dialing {} failed: {}", addr, e);
        }
        result
    }

    async fn dial(&self, addr: &NetAddress) -> NetworkResult<()> {
        let stream =
            tokio::time::timeout(self.config.dial_timeout(), TcpStream::connect(addr.socket_addr()))
                .await??;
        let socket_addr = stream.peer_addr()?;
        let (reader, writer, info) =
            tokio::time::timeout(self.config.handshake_timeout(), self.upgrade(stream)).await??;

        if info.id != addr.id {
            return Err(NetworkError::AuthenticationFailure(format!(
                "dialed {} but reached {}",
                addr.id, info.id
            )));
        }
        self.add_peer(reader, writer, info, true, socket_addr).await?;
        Ok(())
    }
}

#[async_trait]
impl PeerSwitch for Switch {
    fn peers(&self) -> Vec<Arc<Peer>> {
        self.peers.list()
    }

    fn get_peer(&self, id: &NodeId) -> Option<Arc<Peer>> {
        self.peers.get(id)
    }

    fn num_peers(&self) -> (usize, usize, usize) {
        let (outbound, inbound) = self.peers.count_by_direction();
        (outbound, inbound, self.dialing.len())
    }

    fn max_num_outbound_peers(&self) -> usize {
        self.config.max_num_outbound_peers
    }

    fn is_dialing_or_existing(&self, addr: &NetAddress) -> bool {
        self.dialing.contains(&addr.id) || self.peers.has(&addr.id)
    }

    fn is_peer_persistent(&self, addr: &NetAddress) -> bool {
        self.is_persistent_id(&addr.id)
    }

    async fn dial_peer(&self, addr: &NetAddress) -> NetworkResult<()> {
        self.dial_peer_with_address(addr).await
    }

    async fn stop_peer_for_error(&self, peer: &Arc<Peer>, reason: String) {
        warn!("Stopping peer {} for error: {}", peer.id(), reason);
        self.remove_peer(peer, Some(reason), true).await;
    }

    async fn stop_peer_gracefully(&self, peer: &Arc<Peer>) {
        debug!("Stopping peer {}", peer.id());
        self.remove_peer(peer, None, false).await;
    }
}

impl std::fmt::Debug for Switch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Switch")
            .field("node_id", &self.node_id())
            .field("local_addr", &self.local_addr())
            .field("peers", &self.peers.size())
            .finish()
    }
}

//! Peer exchange reactor
//!
//! In normal mode the reactor keeps the node at its outbound peer target by
//! dialing addresses from the [`AddrBook`] and asks peers for more addresses
//! when the book runs low. In seed mode it crawls the network instead:
//! dial, ask for addresses, hang up.

use super::message::{PexMessage, MAX_ADDRESSES, PEX_CHANNEL};
use crate::addrbook::AddrBook;
use crate::peer::Peer;
use crate::switch::{PeerSwitch, Reactor};
use crate::{NetAddress, NetworkError, NetworkResult, NodeId};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use parking_lot::{Mutex, RwLock};
use rand::seq::{IndexedRandom, SliceRandom};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Bias toward new addresses when answering a request
pub const BIAS_TO_SELECT_NEW_PEERS: u8 = 30;

/// Crawl records older than this belong to addresses gone from the book
const CRAWL_INFO_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PexConfig {
    pub enabled: bool,

    /// Crawl the network instead of keeping a stable peer set
    pub seed_mode: bool,

    /// `id@host:port` nodes asked for addresses when the book is empty
    pub seeds: Vec<String>,

    pub ensure_peers_period_secs: u64,
    pub crawl_peer_period_secs: u64,
    pub min_time_between_crawls_secs: u64,

    /// Seed mode drops peers connected for longer than this
    pub seed_disconnect_wait_secs: u64,

    /// Failed dials tolerated before an address is marked bad
    pub max_dial_attempts: u32,
}

impl Default for PexConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            seed_mode: false,
            seeds: Vec::new(),
            ensure_peers_period_secs: 30,
            crawl_peer_period_secs: 30,
            min_time_between_crawls_secs: 120,
            seed_disconnect_wait_secs: 3 * 60 * 60,
            max_dial_attempts: 16,
        }
    }
}

impl PexConfig {
    pub fn with_seeds(mut self, seeds: Vec<String>) -> Self {
        self.seeds = seeds;
        self
    }

    pub fn with_seed_mode(mut self, seed_mode: bool) -> Self {
        self.seed_mode = seed_mode;
        self
    }

    pub fn ensure_peers_period(&self) -> Duration {
        Duration::from_secs(self.ensure_peers_period_secs)
    }

    pub fn crawl_peer_period(&self) -> Duration {
        Duration::from_secs(self.crawl_peer_period_secs)
    }

    pub fn min_time_between_crawls(&self) -> Duration {
        Duration::from_secs(self.min_time_between_crawls_secs)
    }

    pub fn seed_disconnect_wait(&self) -> Duration {
        Duration::from_secs(self.seed_disconnect_wait_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.ensure_peers_period_secs == 0 || self.crawl_peer_period_secs == 0 {
            return Err("PEX periods must be greater than 0".to_string());
        }
        if self.max_dial_attempts == 0 {
            return Err("Max dial attempts must be greater than 0".to_string());
        }
        for seed in &self.seeds {
            parse_seed(seed)?;
        }
        Ok(())
    }
}

/// Checks the `id@host:port` shape without resolving the host
fn parse_seed(seed: &str) -> Result<(), String> {
    let (id, host_port) = seed
        .split_once('@')
        .ok_or_else(|| format!("Seed {} must be id@host:port", seed))?;
    id.parse::<NodeId>()
        .map_err(|e| format!("Seed {}: {}", seed, e))?;
    let (host, port) = host_port
        .rsplit_once(':')
        .ok_or_else(|| format!("Seed {} is missing a port", seed))?;
    if host.is_empty() || port.parse::<u16>().map_or(true, |p| p == 0) {
        return Err(format!("Seed {} has an invalid host or port", seed));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
struct DialAttempt {
    number: u32,
    last_dialed: Instant,
}

pub struct PexReactor {
    book: Arc<AddrBook>,
    config: PexConfig,
    ensure_peers_period: Duration,
    switch: OnceLock<Weak<dyn PeerSwitch>>,
    seed_addrs: RwLock<Vec<NetAddress>>,

    /// Peers we asked for addresses and have not answered yet
    requests_sent: DashSet<NodeId>,
    last_received_requests: DashMap<NodeId, Instant>,
    attempts_to_dial: DashMap<NodeId, DialAttempt>,
    last_crawled: DashMap<NodeId, Instant>,

    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    self_ref: Weak<PexReactor>,
}

impl PexReactor {
    pub fn new(book: Arc<AddrBook>, config: PexConfig) -> Arc<Self> {
        let period = config.ensure_peers_period();
        Self::with_ensure_peers_period(book, config, period)
    }

    /// Like [`PexReactor::new`] with a finer-grained ensure-peers period
    pub fn with_ensure_peers_period(
        book: Arc<AddrBook>,
        config: PexConfig,
        ensure_peers_period: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            book,
            config,
            ensure_peers_period,
            switch: OnceLock::new(),
            seed_addrs: RwLock::new(Vec::new()),
            requests_sent: DashSet::new(),
            last_received_requests: DashMap::new(),
            attempts_to_dial: DashMap::new(),
            last_crawled: DashMap::new(),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
            self_ref: self_ref.clone(),
        })
    }

    /// Attach the switch this reactor runs on. Only the first call has an effect.
    pub fn set_switch(&self, switch: Weak<dyn PeerSwitch>) {
        if self.switch.set(switch).is_err() {
            warn!("PEX reactor switch already set");
        }
    }

    pub fn book(&self) -> &Arc<AddrBook> {
        &self.book
    }

    fn switch(&self) -> Option<Arc<dyn PeerSwitch>> {
        self.switch.get().and_then(Weak::upgrade)
    }

    /// Requests arriving faster than this are abuse
    fn min_receive_request_interval(&self) -> Duration {
        self.ensure_peers_period / 3
    }

    /// Resolve the seeds and start the ensure-peers or crawl loop
    pub async fn start(&self) -> NetworkResult<()> {
        let (online, seeds) = self.check_seeds().await?;
        if online == 0 && !self.config.seeds.is_empty() && self.book.is_empty() {
            return Err(NetworkError::Config(
                "address book is empty and no seed could be resolved".to_string(),
            ));
        }
        *self.seed_addrs.write() = seeds;

        let this = self.self_ref.upgrade().ok_or(NetworkError::Stopped)?;
        let handle = if self.config.seed_mode {
            info!("Starting PEX in seed mode");
            tokio::spawn(this.crawl_peers_routine())
        } else {
            tokio::spawn(this.ensure_peers_routine())
        };
        *self.task.lock() = Some(handle);
        Ok(())
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("PEX task failed: {}", e);
            }
        }
    }

    async fn check_seeds(&self) -> NetworkResult<(usize, Vec<NetAddress>)> {
        let mut resolved = Vec::with_capacity(self.config.seeds.len());
        for seed in &self.config.seeds {
            parse_seed(seed).map_err(NetworkError::Config)?;
            match NetAddress::resolve(seed).await {
                Ok(addr) => resolved.push(addr),
                Err(e) => warn!("Seed {} is offline: {}", seed, e),
            }
        }
        Ok((resolved.len(), resolved))
    }

    fn node_has_some_peers_or_dialing(&self, switch: &dyn PeerSwitch) -> bool {
        let (out, inbound, dialing) = switch.num_peers();
        out + inbound + dialing > 0
    }

    async fn ensure_peers_routine(self: Arc<Self>) {
        let period = self.ensure_peers_period;
        if let Some(switch) = self.switch() {
            if self.node_has_some_peers_or_dialing(switch.as_ref()) {
                let jitter = period.mul_f64(rand::rng().random::<f64>());
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    _ = tokio::time::sleep(jitter) => {}
                }
            }
        }

        self.ensure_peers().await;

        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => self.ensure_peers().await,
            }
        }
        debug!("Ensure peers loop stopped");
    }

    /// Dial enough addresses to reach the outbound target, then ask for
    /// more addresses if the book is running low
    pub async fn ensure_peers(&self) {
        let Some(switch) = self.switch() else {
            return;
        };
        let (out, inbound, dialing) = switch.num_peers();
        let num_to_dial = switch.max_num_outbound_peers().saturating_sub(out + dialing);
        debug!(
            "Ensure peers: {} outbound, {} inbound, {} dialing, {} to dial",
            out, inbound, dialing, num_to_dial
        );
        if num_to_dial == 0 {
            return;
        }

        let bias = new_bias(out);
        let mut to_dial: HashMap<NodeId, NetAddress> = HashMap::new();
        for _ in 0..num_to_dial * 3 {
            if to_dial.len() >= num_to_dial {
                break;
            }
            let Some(addr) = self.book.pick_address(bias) else {
                continue;
            };
            if to_dial.contains_key(&addr.id) || switch.is_dialing_or_existing(&addr) {
                continue;
            }
            debug!("Will dial {}", addr);
            to_dial.insert(addr.id, addr);
        }

        if let Some(this) = self.self_ref.upgrade() {
            for addr in to_dial.values().copied() {
                let reactor = Arc::clone(&this);
                tokio::spawn(async move {
                    if let Err(e) = reactor.dial_peer(&addr).await {
                        log_dial_error(&addr, &e);
                    }
                });
            }
        }

        if self.book.need_more_addrs() {
            let peers = switch.peers();
            if let Some(peer) = peers.choose(&mut rand::rng()) {
                info!("Need more addresses, asking {}", peer.id());
                self.request_addrs(peer);
            }
        }

        // Seeds are only for a node with nothing else to go on
        if out + inbound + dialing + to_dial.len() == 0 {
            info!("No peers and no addresses to dial, falling back to seeds");
            self.dial_seeds().await;
        }
    }

    /// Dial with exponential backoff per address. Authentication failures
    /// and exhausted attempts remove the address from the book.
    pub async fn dial_peer(&self, addr: &NetAddress) -> NetworkResult<()> {
        if self.cancel.is_cancelled() {
            return Err(NetworkError::Stopped);
        }
        let switch = self.switch().ok_or(NetworkError::Stopped)?;

        let previous = self.attempts_to_dial.get(&addr.id).map(|a| *a);
        let attempts = previous.map_or(0, |a| a.number);

        if !switch.is_peer_persistent(addr) && attempts > self.config.max_dial_attempts {
            self.book.mark_bad(addr);
            self.attempts_to_dial.remove(&addr.id);
            return Err(NetworkError::MaxAttemptsToDial(attempts));
        }

        if let Some(previous) = previous {
            let jitter = Duration::from_secs_f64(rand::rng().random::<f64>());
            let backoff = jitter + Duration::from_secs(1u64 << attempts.min(32));
            let since_last = previous.last_dialed.elapsed();
            if since_last < backoff {
                return Err(NetworkError::TooEarlyToDial { backoff, since_last });
            }
        }

        let result = switch.dial_peer(addr).await;
        // The book may already be saved and cleared
        if self.cancel.is_cancelled() {
            return result.and(Err(NetworkError::Stopped));
        }
        match result {
            Ok(()) => {
                self.attempts_to_dial.remove(&addr.id);
                self.book.mark_good(&addr.id);
                Ok(())
            }
            Err(e @ (NetworkError::DuplicatePeer(_) | NetworkError::AlreadyDialing(_))) => Err(e),
            Err(e) if e.is_auth_failure() => {
                self.book.mark_bad(addr);
                self.attempts_to_dial.remove(&addr.id);
                Err(e)
            }
            Err(e) => {
                self.book.mark_attempt(addr);
                self.attempts_to_dial.insert(
                    addr.id,
                    DialAttempt {
                        number: attempts + 1,
                        last_dialed: Instant::now(),
                    },
                );
                Err(e)
            }
        }
    }

    async fn dial_seeds(&self) {
        let Some(switch) = self.switch() else {
            return;
        };
        let mut seeds = self.seed_addrs.read().clone();
        seeds.shuffle(&mut rand::rng());

        for seed in &seeds {
            match switch.dial_peer(seed).await {
                Ok(()) | Err(NetworkError::DuplicatePeer(_)) | Err(NetworkError::AlreadyDialing(_)) => {
                    return
                }
                Err(e) => warn!("Error dialing seed {}: {}", seed, e),
            }
        }
        if !seeds.is_empty() {
            error!("Couldn't connect to any seeds");
        }
    }

    /// Ask `peer` for addresses unless a request is already outstanding
    pub fn request_addrs(&self, peer: &Arc<Peer>) {
        let id = peer.id();
        if !self.requests_sent.insert(id) {
            return;
        }
        debug!("Requesting addresses from {}", id);
        match PexMessage::RequestAddrs.encode() {
            Ok(bytes) => {
                if !peer.try_send(PEX_CHANNEL, bytes) {
                    self.requests_sent.remove(&id);
                    debug!("Could not queue address request to {}", id);
                }
            }
            Err(e) => {
                self.requests_sent.remove(&id);
                error!("Failed to encode address request: {}", e);
            }
        }
    }

    fn send_addrs(&self, peer: &Arc<Peer>, mut addrs: Vec<NetAddress>) {
        addrs.truncate(MAX_ADDRESSES);
        let count = addrs.len();
        match PexMessage::Addrs(addrs).encode() {
            Ok(bytes) => {
                if !peer.try_send(PEX_CHANNEL, bytes) {
                    debug!("Could not queue {} addresses to {}", count, peer.id());
                }
            }
            Err(e) => error!("Failed to encode addresses: {}", e),
        }
    }

    /// Rate limit incoming requests. The first one from a peer is always
    /// allowed.
    fn receive_request(&self, peer: &Peer) -> NetworkResult<()> {
        let now = Instant::now();
        let min_interval = self.min_receive_request_interval();
        if let Some(last) = self.last_received_requests.get(&peer.id()).map(|v| *v) {
            let since = now.duration_since(last);
            if since < min_interval {
                return Err(NetworkError::Protocol(format!(
                    "PEX request {:?} after the previous one, minimum is {:?}",
                    since, min_interval
                )));
            }
        }
        self.last_received_requests.insert(peer.id(), now);
        Ok(())
    }

    /// Absorb a response. The whole message is checked before the book is
    /// touched.
    fn receive_addrs(&self, addrs: Vec<NetAddress>, peer: &Peer) -> NetworkResult<()> {
        if self.requests_sent.remove(&peer.id()).is_none() {
            return Err(NetworkError::Protocol("unsolicited PEX response".to_string()));
        }
        for addr in &addrs {
            addr.validate()
                .map_err(|e| NetworkError::Protocol(format!("bad address in PEX response: {}", e)))?;
        }

        let src = peer.listen_address()?;
        let src_is_seed = self.seed_addrs.read().iter().any(|seed| seed.id == src.id);

        let mut added = 0;
        for addr in addrs {
            if let Err(e) = self.book.add_address(&addr, &src) {
                debug!("Not adding {} from {}: {}", addr, src.id, e);
                continue;
            }
            added += 1;

            if src_is_seed {
                if let Some(this) = self.self_ref.upgrade() {
                    tokio::spawn(async move {
                        if let Err(e) = this.dial_peer(&addr).await {
                            log_dial_error(&addr, &e);
                        }
                    });
                }
            }
        }
        debug!("Added {} addresses from {}", added, src.id);
        Ok(())
    }

    async fn crawl_peers_routine(self: Arc<Self>) {
        let no_seeds = self.seed_addrs.read().is_empty();
        if no_seeds {
            self.crawl_peers().await;
        } else {
            self.dial_seeds().await;
        }

        let period = self.config.crawl_peer_period();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.attempt_disconnects().await;
                    self.crawl_peers().await;
                    self.cleanup_crawl_infos();
                }
            }
        }
        debug!("Crawl loop stopped");
    }

    /// Visit known addresses, least recently attempted first, and ask each
    /// for its addresses
    pub async fn crawl_peers(&self) {
        let Some(switch) = self.switch() else {
            return;
        };
        let mut known = self.book.list_of_known_addresses();
        known.sort_by_key(|ka| ka.last_attempt);

        let min_between = self.config.min_time_between_crawls();
        for ka in known {
            if self.cancel.is_cancelled() {
                return;
            }
            let addr = ka.addr;
            let now = Instant::now();
            let recently = self
                .last_crawled
                .get(&addr.id)
                .is_some_and(|last| now.duration_since(*last) < min_between);
            if recently {
                continue;
            }
            self.last_crawled.insert(addr.id, now);

            if let Err(e) = self.dial_peer(&addr).await {
                log_dial_error(&addr, &e);
                continue;
            }
            if let Some(peer) = switch.get_peer(&addr.id) {
                self.request_addrs(&peer);
            }
        }
    }

    /// Seed mode: drop non-persistent peers we have held long enough
    pub async fn attempt_disconnects(&self) {
        let Some(switch) = self.switch() else {
            return;
        };
        let wait = self.config.seed_disconnect_wait();
        for peer in switch.peers() {
            if peer.connected_for() < wait || peer.is_persistent() {
                continue;
            }
            debug!("Disconnecting {} after {:?}", peer.id(), peer.connected_for());
            switch.stop_peer_gracefully(&peer).await;
        }
    }

    fn cleanup_crawl_infos(&self) {
        self.last_crawled.retain(|_, last| last.elapsed() <= CRAWL_INFO_TTL);
    }
}

/// Few connections favour vetted addresses; the bias toward new ones grows
/// with each outbound peer, up to 90
fn new_bias(num_outbound: usize) -> u8 {
    (num_outbound.min(8) * 10 + 10) as u8
}

fn log_dial_error(addr: &NetAddress, err: &NetworkError) {
    match err {
        NetworkError::TooEarlyToDial { .. }
        | NetworkError::MaxAttemptsToDial(_)
        | NetworkError::DuplicatePeer(_)
        | NetworkError::AlreadyDialing(_) => debug!("Not dialing {}: {}", addr, err),
        _ => warn!("Dialing {} failed: {}", addr, err),
    }
}

#[async_trait]
impl Reactor for PexReactor {
    fn name(&self) -> &'static str {
        "pex"
    }

    fn channels(&self) -> Vec<u8> {
        vec![PEX_CHANNEL]
    }

    async fn add_peer(&self, peer: Arc<Peer>) {
        if peer.is_outbound() {
            // Already in the book; ask for more if needed
            if self.book.need_more_addrs() {
                self.request_addrs(&peer);
            }
            return;
        }

        // An inbound peer is its own source
        match peer.listen_address() {
            Ok(addr) => {
                if let Err(e) = self.book.add_address(&addr, &addr) {
                    debug!("Not adding inbound peer {}: {}", addr, e);
                }
            }
            Err(e) => warn!("Inbound peer {} has no usable address: {}", peer.id(), e),
        }
    }

    async fn remove_peer(&self, peer: Arc<Peer>, _reason: Option<&str>) {
        let id = peer.id();
        self.requests_sent.remove(&id);
        self.last_received_requests.remove(&id);
    }

    async fn receive(&self, _channel: u8, peer: Arc<Peer>, msg: Bytes) {
        let Some(switch) = self.switch() else {
            return;
        };
        let msg = match PexMessage::decode(&msg) {
            Ok(msg) => msg,
            Err(e) => {
                switch.stop_peer_for_error(&peer, e.to_string()).await;
                return;
            }
        };

        match msg {
            PexMessage::RequestAddrs => {
                if self.config.seed_mode && !peer.is_outbound() {
                    // Answer once, then hang up
                    if self.last_received_requests.contains_key(&peer.id()) {
                        return;
                    }
                    self.last_received_requests.insert(peer.id(), Instant::now());
                    self.send_addrs(&peer, self.book.get_selection_with_bias(BIAS_TO_SELECT_NEW_PEERS));
                    switch.stop_peer_gracefully(&peer).await;
                    return;
                }

                if let Err(e) = self.receive_request(&peer) {
                    switch.stop_peer_for_error(&peer, e.to_string()).await;
                    return;
                }
                self.send_addrs(&peer, self.book.get_selection_with_bias(BIAS_TO_SELECT_NEW_PEERS));
            }
            PexMessage::Addrs(addrs) => {
                if let Err(e) = self.receive_addrs(addrs, &peer) {
                    switch.stop_peer_for_error(&peer, e.to_string()).await;
                    return;
                }
                if self.config.seed_mode && peer.is_outbound() && !peer.is_persistent() {
                    switch.stop_peer_gracefully(&peer).await;
                }
            }
        }
    }
}

impl std::fmt::Debug for PexReactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PexReactor")
            .field("seed_mode", &self.config.seed_mode)
            .field("ensure_peers_period", &self.ensure_peers_period)
            .field("dial_attempts", &self.attempts_to_dial.len())
            .finish()
    }
}

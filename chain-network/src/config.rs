//! Network configuration

use crate::addrbook::AddrBookConfig;
use crate::pex::{self, PexConfig};
use crate::trust::TrustMetricConfig;
use crate::{NetworkError, NetworkResult, NodeId};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct P2pConfig {
    /// Address the switch listens on
    pub listen_address: String,

    /// Address advertised to peers, defaults to the bound listen address
    pub external_address: String,

    /// Peers on other networks are rejected
    pub network: String,

    /// Human readable node name
    pub moniker: String,

    /// `id@host:port` peers kept connected at all times
    pub persistent_peers: Vec<String>,

    /// Node IDs never stored in the address book or gossiped
    pub private_peer_ids: Vec<String>,

    /// Maximum number of peer connections
    pub max_num_inbound_peers: usize,
    pub max_num_outbound_peers: usize,

    /// Connection timeouts
    pub dial_timeout_ms: u64,
    pub handshake_timeout_ms: u64,

    /// Maximum payload of a single channel message
    pub max_packet_msg_payload_size: usize,

    /// Outgoing messages buffered per peer
    pub send_queue_capacity: usize,

    /// Inbound peers scoring below this are refused, 0 disables the check
    pub min_inbound_trust_score: u8,

    pub trust_store_save_interval_secs: u64,

    pub pex: PexConfig,
    pub addr_book: AddrBookConfig,
    pub trust_metric: TrustMetricConfig,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:26656".to_string(),
            external_address: String::new(),
            network: "chain-local".to_string(),
            moniker: "chain-node".to_string(),
            persistent_peers: Vec::new(),
            private_peer_ids: Vec::new(),
            max_num_inbound_peers: 40,
            max_num_outbound_peers: 10,
            dial_timeout_ms: 3_000,
            handshake_timeout_ms: 20_000,
            max_packet_msg_payload_size: 128 * 1024, // 128 KB
            send_queue_capacity: 64,
            min_inbound_trust_score: 10,
            trust_store_save_interval_secs: 60,
            pex: PexConfig::default(),
            addr_book: AddrBookConfig::default(),
            trust_metric: TrustMetricConfig::default(),
        }
    }
}

impl P2pConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_listen_address(mut self, address: impl Into<String>) -> Self {
        self.listen_address = address.into();
        self
    }

    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = network.into();
        self
    }

    pub fn with_moniker(mut self, moniker: impl Into<String>) -> Self {
        self.moniker = moniker.into();
        self
    }

    pub fn with_persistent_peers(mut self, peers: Vec<String>) -> Self {
        self.persistent_peers = peers;
        self
    }

    pub fn with_max_peers(mut self, outbound: usize, inbound: usize) -> Self {
        self.max_num_outbound_peers = outbound;
        self.max_num_inbound_peers = inbound;
        self
    }

    pub fn with_pex(mut self, pex: PexConfig) -> Self {
        self.pex = pex;
        self
    }

    pub fn with_addr_book(mut self, addr_book: AddrBookConfig) -> Self {
        self.addr_book = addr_book;
        self
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn trust_store_save_interval(&self) -> Duration {
        Duration::from_secs(self.trust_store_save_interval_secs)
    }

    pub fn parse_private_peer_ids(&self) -> NetworkResult<Vec<NodeId>> {
        self.private_peer_ids.iter().map(|id| id.parse()).collect()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        self.listen_address
            .parse::<SocketAddr>()
            .map_err(|e| format!("Invalid listen address {}: {}", self.listen_address, e))?;

        if !self.external_address.is_empty() {
            self.external_address
                .parse::<SocketAddr>()
                .map_err(|e| format!("Invalid external address {}: {}", self.external_address, e))?;
        }

        if self.network.is_empty() {
            return Err("Network name must be set".to_string());
        }

        if self.max_num_outbound_peers == 0 {
            return Err("Maximum outbound peers must be greater than 0".to_string());
        }

        if self.dial_timeout_ms == 0 || self.handshake_timeout_ms == 0 {
            return Err("Dial and handshake timeouts must be greater than 0".to_string());
        }

        if self.send_queue_capacity == 0 {
            return Err("Send queue capacity must be greater than 0".to_string());
        }

        if self.pex.enabled && self.max_packet_msg_payload_size < pex::MAX_MSG_SIZE {
            return Err(format!(
                "Maximum packet payload must be at least {} bytes for PEX",
                pex::MAX_MSG_SIZE
            ));
        }

        if self.trust_store_save_interval_secs == 0 {
            return Err("Trust store save interval must be greater than 0".to_string());
        }

        for peer in &self.persistent_peers {
            if !peer.contains('@') {
                return Err(format!("Persistent peer {} must be id@host:port", peer));
            }
        }

        self.parse_private_peer_ids().map_err(|e: NetworkError| e.to_string())?;

        self.pex.validate()?;
        self.addr_book.validate()?;
        self.trust_metric.validate()?;

        Ok(())
    }
}

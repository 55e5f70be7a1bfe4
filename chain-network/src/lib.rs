//! Peer-to-peer networking layer
//!
//! This crate provides the node's P2P stack: node identities and addresses,
//! an address book resistant to eclipse attacks, authenticated encrypted
//! connections, per-peer trust scoring, and the peer exchange protocol that
//! keeps the node connected.

pub mod addrbook;
pub mod config;
pub mod conn;
pub mod error;
pub mod key;
pub mod netaddress;
pub mod peer;
pub mod pex;
pub mod switch;
pub mod trust;

pub use addrbook::{AddrBook, AddrBookConfig, AddrBookError, KnownAddress};
pub use config::P2pConfig;
pub use conn::SecretConnection;
pub use error::{NetworkError, NetworkResult};
pub use key::{NodeId, NodeKey};
pub use netaddress::NetAddress;
pub use peer::{NodeInfo, Peer};
pub use pex::{PexConfig, PexMessage, PexReactor};
pub use switch::{PeerSwitch, Reactor, Switch};
pub use trust::{TrustMetric, TrustMetricConfig, TrustMetricStore};

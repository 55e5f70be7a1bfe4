//! Peer exchange wire messages

use crate::{NetAddress, NetworkError, NetworkResult};

/// Logical channel reserved for peer exchange
pub const PEX_CHANNEL: u8 = 0x00;

/// Addresses carried by a single response
pub const MAX_ADDRESSES: usize = 250;

/// Upper bound on one encoded address
pub const MAX_ADDRESS_SIZE: usize = 256;

pub const MAX_MSG_SIZE: usize = MAX_ADDRESS_SIZE * MAX_ADDRESSES;

#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub enum PexMessage {
    /// Ask the peer for addresses it knows
    RequestAddrs,
    /// Answer to a request
    Addrs(Vec<NetAddress>),
}

impl PexMessage {
    pub fn encode(&self) -> NetworkResult<Vec<u8>> {
        if let PexMessage::Addrs(addrs) = self {
            if addrs.len() > MAX_ADDRESSES {
                return Err(NetworkError::Encoding(format!(
                    "{} addresses exceed the limit of {}",
                    addrs.len(),
                    MAX_ADDRESSES
                )));
            }
        }
        Ok(bincode::encode_to_vec(self, bincode::config::standard())?)
    }

    /// Decode a message from a peer. Oversized, malformed or trailing input
    /// is a protocol violation.
    pub fn decode(bytes: &[u8]) -> NetworkResult<Self> {
        if bytes.len() > MAX_MSG_SIZE {
            return Err(NetworkError::Protocol(format!(
                "PEX message of {} bytes exceeds {}",
                bytes.len(),
                MAX_MSG_SIZE
            )));
        }

        let config = bincode::config::standard().with_limit::<MAX_MSG_SIZE>();
        let (msg, read): (Self, usize) = bincode::decode_from_slice(bytes, config)?;
        if read != bytes.len() {
            return Err(NetworkError::Protocol(format!(
                "{} trailing bytes after PEX message",
                bytes.len() - read
            )));
        }

        if let PexMessage::Addrs(addrs) = &msg {
            if addrs.len() > MAX_ADDRESSES {
                return Err(NetworkError::Protocol(format!(
                    "PEX response with {} addresses exceeds {}",
                    addrs.len(),
                    MAX_ADDRESSES
                )));
            }
        }
        Ok(msg)
    }
}

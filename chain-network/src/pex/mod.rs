//! Peer exchange protocol

mod message;
mod reactor;

pub use message::{PexMessage, MAX_ADDRESSES, MAX_ADDRESS_SIZE, MAX_MSG_SIZE, PEX_CHANNEL};
pub use reactor::{PexConfig, PexReactor, BIAS_TO_SELECT_NEW_PEERS};

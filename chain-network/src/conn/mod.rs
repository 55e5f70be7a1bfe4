//! Authenticated, encrypted transport between two nodes

mod secret_connection;

pub use secret_connection::{
    SecretConnection, SecretReader, SecretWriter, AEAD_TAG_SIZE, DATA_LEN_SIZE, DATA_MAX_SIZE,
    SEALED_FRAME_SIZE, TOTAL_FRAME_SIZE,
};

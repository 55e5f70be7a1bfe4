//! Node identity and key management

use crate::{NetworkError, NetworkResult};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

/// Number of bytes in a node ID
pub const ID_BYTE_LENGTH: usize = 20;

/// Identity of a node: a truncated BLAKE3 digest of its Ed25519 public key
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, bincode::Encode, bincode::Decode)]
pub struct NodeId([u8; ID_BYTE_LENGTH]);

impl NodeId {
    pub fn new(bytes: [u8; ID_BYTE_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Derive the ID from a public key
    pub fn from_public_key(key: &VerifyingKey) -> Self {
        let hash = blake3::hash(key.as_bytes());
        let mut id = [0u8; ID_BYTE_LENGTH];
        id.copy_from_slice(&hash.as_bytes()[..ID_BYTE_LENGTH]);
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; ID_BYTE_LENGTH] {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self)
    }
}

impl FromStr for NodeId {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != ID_BYTE_LENGTH * 2 {
            return Err(NetworkError::InvalidNodeId(format!(
                "{} has length {}, want {}",
                s,
                s.len(),
                ID_BYTE_LENGTH * 2
            )));
        }
        let bytes = hex::decode(s)
            .map_err(|e| NetworkError::InvalidNodeId(format!("{}: {}", s, e)))?;
        let mut id = [0u8; ID_BYTE_LENGTH];
        id.copy_from_slice(&bytes);
        Ok(Self(id))
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// On-disk form of a node key
#[derive(Serialize, Deserialize)]
struct NodeKeyFile {
    priv_key: String,
}

/// Long-term Ed25519 identity key of this node
#[derive(Clone)]
pub struct NodeKey {
    signing_key: SigningKey,
}

impl NodeKey {
    /// Generate a new random key
    pub fn generate() -> Self {
        let mut secret = [0u8; 32];
        rand::rng().fill_bytes(&mut secret);
        Self::from_secret_bytes(&secret)
    }

    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(secret),
        }
    }

    /// Load key from file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> NetworkResult<Self> {
        let data = fs::read(path.as_ref())?;
        let file: NodeKeyFile = serde_json::from_slice(&data)?;

        let bytes = hex::decode(&file.priv_key)
            .map_err(|e| NetworkError::Config(format!("Failed to decode node key: {}", e)))?;
        let secret: [u8; 32] = bytes
            .try_into()
            .map_err(|_| NetworkError::Config("Node key must be 32 bytes".to_string()))?;

        Ok(Self::from_secret_bytes(&secret))
    }

    /// Save key to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> NetworkResult<()> {
        // Create directory if it doesn't exist
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let file = NodeKeyFile {
            priv_key: hex::encode(self.signing_key.to_bytes()),
        };
        fs::write(path.as_ref(), serde_json::to_vec_pretty(&file)?)?;
        Ok(())
    }

    /// Load key from path, generating and saving a fresh one if none exists
    pub fn load_or_generate<P: AsRef<Path>>(path: P) -> NetworkResult<Self> {
        if path.as_ref().exists() {
            let key = Self::load_from_file(&path)?;
            tracing::info!("Loaded existing node key: {}", key.id());
            return Ok(key);
        }

        tracing::info!("Generating new node key");
        let key = Self::generate();
        key.save_to_file(&path)?;
        tracing::info!("Saved new node key: {}", key.id());
        Ok(key)
    }

    pub fn id(&self) -> NodeId {
        NodeId::from_public_key(&self.public_key())
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }
}

impl fmt::Debug for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeKey").field("id", &self.id()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::Verifier;
    use tempfile::tempdir;

    #[test]
    fn test_node_id_from_key() {
        let key = NodeKey::generate();
        let id = key.id();

        assert_eq!(id, NodeId::from_public_key(&key.public_key()));
        assert_eq!(id.to_string().len(), ID_BYTE_LENGTH * 2);
    }

    #[test]
    fn test_node_id_parse() {
        let key = NodeKey::generate();
        let id = key.id();

        let parsed: NodeId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);

        assert!("abcd".parse::<NodeId>().is_err());
        assert!("zz".repeat(ID_BYTE_LENGTH).parse::<NodeId>().is_err());
    }

    #[test]
    fn test_node_id_json() {
        let id = NodeKey::generate().id();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));

        let back: NodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_sign_and_verify() {
        let key = NodeKey::generate();
        let sig = key.sign(b"challenge");
        assert!(key.public_key().verify(b"challenge", &sig).is_ok());
        assert!(key.public_key().verify(b"other", &sig).is_err());
    }

    #[test]
    fn test_save_and_load_key() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("config").join("node_key.json");

        let original = NodeKey::generate();
        original.save_to_file(&path).unwrap();

        let loaded = NodeKey::load_from_file(&path).unwrap();
        assert_eq!(original.id(), loaded.id());
    }

    #[test]
    fn test_load_or_generate() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("node_key.json");

        // First call should generate new key
        let key1 = NodeKey::load_or_generate(&path).unwrap();
        assert!(path.exists());

        // Second call should load existing key
        let key2 = NodeKey::load_or_generate(&path).unwrap();
        assert_eq!(key1.id(), key2.id());
    }

    #[test]
    fn test_corrupt_key_file() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("node_key.json");
        fs::write(&path, br#"{"priv_key":"0102"}"#).unwrap();

        assert!(matches!(
            NodeKey::load_from_file(&path),
            Err(NetworkError::Config(_))
        ));
    }
}

//! Node home directory layout and configuration loading

use anyhow::{Context, Result};
use chain_network::{NodeKey, P2pConfig};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Prefix of environment variables overriding the config file,
/// e.g. `CHAIN_P2P__PEX__SEED_MODE=true`
pub const ENV_PREFIX: &str = "CHAIN_P2P";

#[derive(Debug, Clone)]
pub struct Home {
    root: PathBuf,
}

impl Home {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn config_dir(&self) -> PathBuf {
        self.root.join("config")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir().join("config.toml")
    }

    pub fn node_key_file(&self) -> PathBuf {
        self.config_dir().join("node_key.json")
    }

    pub fn trust_db_dir(&self) -> PathBuf {
        self.data_dir().join("trust")
    }

    /// Relative paths in the config are relative to the home directory
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    /// Create the directory layout, a node key and a default config.
    /// Existing files are kept unless `force` is set.
    pub fn init(&self, force: bool) -> Result<NodeKey> {
        fs::create_dir_all(self.config_dir())
            .with_context(|| format!("creating {}", self.config_dir().display()))?;
        fs::create_dir_all(self.data_dir())
            .with_context(|| format!("creating {}", self.data_dir().display()))?;

        let key_file = self.node_key_file();
        let node_key = if force || !key_file.exists() {
            let key = NodeKey::generate();
            key.save_to_file(&key_file)
                .with_context(|| format!("writing {}", key_file.display()))?;
            key
        } else {
            NodeKey::load_from_file(&key_file)
                .with_context(|| format!("reading {}", key_file.display()))?
        };

        let config_file = self.config_file();
        if force || !config_file.exists() {
            let toml = toml::to_string_pretty(&P2pConfig::default()).context("serializing default config")?;
            fs::write(&config_file, toml).with_context(|| format!("writing {}", config_file.display()))?;
            info!("Wrote default config to {}", config_file.display());
        }

        Ok(node_key)
    }

    /// Load the config file, if present, with environment overrides on top
    pub fn load_config(&self) -> Result<P2pConfig> {
        let settings = config::Config::builder()
            .add_source(config::File::from(self.config_file()).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("reading configuration")?;

        settings
            .try_deserialize()
            .context("invalid configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_init_creates_layout() {
        let dir = tempdir().unwrap();
        let home = Home::new(dir.path());

        let key = home.init(false).unwrap();
        assert!(home.config_file().exists());
        assert!(home.node_key_file().exists());
        assert!(home.data_dir().is_dir());

        // A second init keeps the identity
        let again = home.init(false).unwrap();
        assert_eq!(key.id(), again.id());

        let forced = home.init(true).unwrap();
        assert_ne!(key.id(), forced.id());
    }

    #[test]
    fn test_load_default_config() {
        let dir = tempdir().unwrap();
        let home = Home::new(dir.path());
        home.init(false).unwrap();

        let config = home.load_config().unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_num_outbound_peers, 10);
    }

    #[test]
    fn test_load_edited_config() {
        let dir = tempdir().unwrap();
        let home = Home::new(dir.path());
        fs::create_dir_all(home.config_dir()).unwrap();
        fs::write(
            home.config_file(),
            "network = \"testnet\"\nmax_num_outbound_peers = 4\n\n[pex]\nseed_mode = true\n",
        )
        .unwrap();

        let config = home.load_config().unwrap();
        assert_eq!(config.network, "testnet");
        assert_eq!(config.max_num_outbound_peers, 4);
        assert!(config.pex.seed_mode);
        assert!(config.addr_book.strict);
    }

    #[test]
    fn test_missing_config_uses_defaults() {
        let dir = tempdir().unwrap();
        let config = Home::new(dir.path()).load_config().unwrap();
        assert_eq!(config.listen_address, "0.0.0.0:26656");
    }

    #[test]
    fn test_resolve() {
        let home = Home::new("/var/chain");
        assert_eq!(
            home.resolve(Path::new("config/addrbook.json")),
            PathBuf::from("/var/chain/config/addrbook.json")
        );
        assert_eq!(home.resolve(Path::new("/tmp/book.json")), PathBuf::from("/tmp/book.json"));
    }
}

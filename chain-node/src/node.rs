//! Wiring of the address book, trust store, switch and PEX reactor

use crate::home::Home;
use anyhow::{anyhow, Context, Result};
use chain_db::{Database, DatabaseConfig};
use chain_network::{
    AddrBook, NodeId, NodeKey, P2pConfig, PeerSwitch, PexReactor, Switch, TrustMetricStore,
};
use std::sync::{Arc, Weak};
use tracing::{info, warn};

pub struct Node {
    book: Arc<AddrBook>,
    trust: Arc<TrustMetricStore>,
    switch: Arc<Switch>,
    pex: Option<Arc<PexReactor>>,
}

impl Node {
    pub fn new(home: &Home, config: P2pConfig) -> Result<Self> {
        config.validate().map_err(|e| anyhow!(e)).context("invalid configuration")?;

        let node_key = NodeKey::load_or_generate(home.node_key_file()).context("loading node key")?;

        let db = Database::open(&DatabaseConfig::new(home.trust_db_dir()))
            .context("opening trust database")?;
        let trust = Arc::new(
            TrustMetricStore::new(Arc::new(db), config.trust_metric.clone())
                .with_save_interval(config.trust_store_save_interval()),
        );

        let mut book_config = config.addr_book.clone();
        book_config.file = home.resolve(&book_config.file);
        let book = Arc::new(AddrBook::new(book_config));
        book.add_private_ids(config.parse_private_peer_ids()?);

        let switch = Switch::new(config.clone(), node_key, Some(Arc::clone(&trust)));

        let pex = if config.pex.enabled {
            let pex = PexReactor::new(Arc::clone(&book), config.pex.clone());
            let weak: Weak<dyn PeerSwitch> = Arc::downgrade(&switch) as Weak<dyn PeerSwitch>;
            pex.set_switch(weak);
            switch.add_reactor(pex.clone())?;
            Some(pex)
        } else {
            warn!("PEX disabled, only persistent peers will be connected");
            None
        };

        Ok(Self {
            book,
            trust,
            switch,
            pex,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.switch.node_id()
    }

    pub async fn start(&self) -> Result<()> {
        self.trust.start().await.context("starting trust store")?;
        self.book.start().await.context("starting address book")?;
        self.switch.start().await.context("starting switch")?;

        match self.switch.node_info().net_address() {
            Ok(addr) => self.book.add_our_address(&addr),
            Err(e) => warn!("Could not determine our own address: {}", e),
        }

        if let Some(pex) = &self.pex {
            pex.start().await.context("starting peer exchange")?;
        }
        info!("Node {} started with {} known addresses", self.node_id(), self.book.size());
        Ok(())
    }

    /// Stop in reverse order. The trust store and address book save once
    /// more on the way out.
    pub async fn stop(&self) {
        if let Some(pex) = &self.pex {
            pex.stop().await;
        }
        self.switch.stop().await;
        self.trust.stop().await;
        self.book.stop().await;
        info!("Node {} stopped", self.node_id());
    }
}

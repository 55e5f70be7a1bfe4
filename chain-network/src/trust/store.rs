//! Registry of per-peer trust metrics backed by the key-value store

use super::metric::{MetricHistory, TrustMetric, TrustMetricConfig};
use crate::NetworkResult;
use chain_db::{ColumnFamily, SharedDatabase};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Key of the single record holding every metric's history
pub const TRUST_STORE_KEY: &[u8] = b"trustMetricStore";

pub const DEFAULT_SAVE_INTERVAL: Duration = Duration::from_secs(60);

pub struct TrustMetricStore {
    db: SharedDatabase,
    config: TrustMetricConfig,
    save_interval: Duration,
    metrics: Mutex<HashMap<String, Arc<TrustMetric>>>,
    cancel: CancellationToken,
    save_task: Mutex<Option<JoinHandle<()>>>,
}

impl TrustMetricStore {
    pub fn new(db: SharedDatabase, config: TrustMetricConfig) -> Self {
        Self {
            db,
            config,
            save_interval: DEFAULT_SAVE_INTERVAL,
            metrics: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            save_task: Mutex::new(None),
        }
    }

    pub fn with_save_interval(mut self, interval: Duration) -> Self {
        self.save_interval = interval;
        self
    }

    /// Reload persisted metrics and start saving periodically
    pub async fn start(self: &Arc<Self>) -> NetworkResult<()> {
        self.load_from_db()?;

        let store = Arc::clone(self);
        let cancel = self.cancel.clone();
        let period = self.save_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = store.save_to_db() {
                            error!("Failed to save trust metrics: {}", e);
                        }
                    }
                }
            }
        });
        *self.save_task.lock() = Some(handle);
        Ok(())
    }

    /// Stop every metric's ticker, then save once more
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.save_task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Trust store save task failed: {}", e);
            }
        }

        let metrics: Vec<Arc<TrustMetric>> = self.metrics.lock().values().cloned().collect();
        futures::future::join_all(metrics.iter().map(|tm| tm.stop())).await;

        if let Err(e) = self.save_to_db() {
            error!("Failed to save trust metrics on shutdown: {}", e);
        }
    }

    pub fn size(&self) -> usize {
        self.metrics.lock().len()
    }

    /// Register an externally created metric. An existing metric for the
    /// same key is kept.
    pub fn add_peer_trust_metric(&self, key: &str, tm: Arc<TrustMetric>) {
        if key.is_empty() {
            return;
        }
        self.metrics.lock().entry(key.to_string()).or_insert(tm);
    }

    /// The metric for `key`, created and started on first use
    pub fn get_peer_trust_metric(&self, key: &str) -> Arc<TrustMetric> {
        let mut metrics = self.metrics.lock();
        if let Some(tm) = metrics.get(key) {
            return Arc::clone(tm);
        }
        let tm = Arc::new(TrustMetric::new(&self.config));
        tm.start();
        metrics.insert(key.to_string(), Arc::clone(&tm));
        debug!("Created trust metric for {}", key);
        tm
    }

    /// Freeze the peer's metric until it is seen again
    pub fn peer_disconnected(&self, key: &str) {
        if let Some(tm) = self.metrics.lock().get(key) {
            tm.pause();
        }
    }

    pub fn good_events(&self, key: &str, num: u32) {
        self.get_peer_trust_metric(key).good_events(num);
    }

    pub fn bad_events(&self, key: &str, num: u32) {
        self.get_peer_trust_metric(key).bad_events(num);
    }

    /// Unknown peers have no history against them and score full trust
    pub fn trust_value(&self, key: &str) -> f64 {
        match self.metrics.lock().get(key) {
            Some(tm) => tm.trust_value(),
            None => 1.0,
        }
    }

    pub fn trust_score(&self, key: &str) -> u8 {
        match self.metrics.lock().get(key) {
            Some(tm) => tm.trust_score(),
            None => 100,
        }
    }

    pub fn save_to_db(&self) -> NetworkResult<()> {
        let snapshot: HashMap<String, MetricHistory> = self
            .metrics
            .lock()
            .iter()
            .map(|(key, tm)| (key.clone(), tm.history_json()))
            .collect();

        let bytes = serde_json::to_vec(&snapshot)?;
        self.db.put(ColumnFamily::TrustHistory, TRUST_STORE_KEY, &bytes)?;
        debug!("Saved {} trust metrics", snapshot.len());
        Ok(())
    }

    fn load_from_db(&self) -> NetworkResult<()> {
        let Some(bytes) = self.db.get(ColumnFamily::TrustHistory, TRUST_STORE_KEY)? else {
            return Ok(());
        };
        let saved: HashMap<String, MetricHistory> = serde_json::from_slice(&bytes)?;

        let mut metrics = self.metrics.lock();
        for (key, history) in saved {
            let tm = TrustMetric::new(&self.config);
            tm.start();
            tm.init(&history);
            metrics.insert(key, Arc::new(tm));
        }
        info!("Loaded {} trust metrics", metrics.len());
        Ok(())
    }
}

impl std::fmt::Debug for TrustMetricStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustMetricStore")
            .field("size", &self.size())
            .field("save_interval", &self.save_interval)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chain_db::{Database, DatabaseConfig, KeyValueDB, MemoryDatabase};
    use tempfile::tempdir;

    fn memory_store() -> (Arc<MemoryDatabase>, Arc<TrustMetricStore>) {
        let db = Arc::new(MemoryDatabase::new());
        let store = Arc::new(TrustMetricStore::new(
            db.clone(),
            TrustMetricConfig::default(),
        ));
        (db, store)
    }

    #[tokio::test]
    async fn test_lazy_creation() {
        let (_, store) = memory_store();
        store.start().await.unwrap();
        assert_eq!(store.size(), 0);
        assert_eq!(store.trust_score("peer"), 100);

        let a = store.get_peer_trust_metric("peer");
        let b = store.get_peer_trust_metric("peer");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(store.size(), 1);

        store.bad_events("peer", 5);
        assert!(store.trust_score("peer") < 100);
        store.stop().await;
    }

    #[tokio::test]
    async fn test_add_keeps_existing() {
        let (_, store) = memory_store();
        let first = Arc::new(TrustMetric::new(&TrustMetricConfig::default()));
        let second = Arc::new(TrustMetric::new(&TrustMetricConfig::default()));

        store.add_peer_trust_metric("peer", first.clone());
        store.add_peer_trust_metric("peer", second);
        store.add_peer_trust_metric("", first.clone());
        assert_eq!(store.size(), 1);
        assert!(Arc::ptr_eq(&store.get_peer_trust_metric("peer"), &first));
    }

    #[tokio::test]
    async fn test_peer_disconnected_pauses() {
        let (_, store) = memory_store();
        let tm = store.get_peer_trust_metric("peer");
        store.peer_disconnected("peer");
        tm.next_time_interval();
        assert_eq!(tm.history_json().num_intervals, 0);
        store.stop().await;
    }

    #[tokio::test]
    async fn test_save_and_reload() {
        let (db, store) = memory_store();
        store.start().await.unwrap();

        let tm = store.get_peer_trust_metric("peer");
        for _ in 0..5 {
            tm.bad_events(1);
            tm.good_events(1);
            tm.next_time_interval();
        }
        let expected = tm.history_json();
        store.stop().await;
        assert!(db.exists(ColumnFamily::TrustHistory, TRUST_STORE_KEY).unwrap());

        let reloaded = Arc::new(TrustMetricStore::new(db, TrustMetricConfig::default()));
        reloaded.start().await.unwrap();
        assert_eq!(reloaded.size(), 1);
        assert_eq!(reloaded.get_peer_trust_metric("peer").history_json(), expected);
        reloaded.stop().await;
    }

    #[tokio::test]
    async fn test_persisted_record_shape() {
        let (db, store) = memory_store();
        store.good_events("a", 1);
        store.save_to_db().unwrap();

        let bytes = db.get(ColumnFamily::TrustHistory, TRUST_STORE_KEY).unwrap().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["a"]["intervals"], 0);
        assert!(json["a"]["history"].as_array().unwrap().is_empty());
        store.stop().await;
    }

    #[tokio::test]
    async fn test_rocksdb_backend() {
        let dir = tempdir().unwrap();
        let db = Arc::new(Database::open(&DatabaseConfig::new(dir.path())).unwrap());

        let store = Arc::new(TrustMetricStore::new(db.clone(), TrustMetricConfig::default()));
        store.start().await.unwrap();
        store.bad_events("peer", 3);
        store.get_peer_trust_metric("peer").next_time_interval();
        store.stop().await;
        drop(store);

        let reloaded = Arc::new(TrustMetricStore::new(db, TrustMetricConfig::default()));
        reloaded.start().await.unwrap();
        assert_eq!(reloaded.get_peer_trust_metric("peer").history_json().num_intervals, 1);
        reloaded.stop().await;
    }

    #[tokio::test]
    async fn test_periodic_save() {
        let db = Arc::new(MemoryDatabase::new());
        let store = Arc::new(
            TrustMetricStore::new(db.clone(), TrustMetricConfig::default())
                .with_save_interval(Duration::from_millis(200)),
        );
        store.start().await.unwrap();
        store.good_events("peer", 1);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!db.is_empty());
        store.stop().await;
    }
}

use super::file;
use super::known_address::{BucketType, KnownAddress};
use super::*;
use crate::{NetAddress, NodeId};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::{Rng, RngCore};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Thread-safe address book shared by the PEX reactor and the switch
pub struct AddrBook {
    config: AddrBookConfig,
    inner: Mutex<Inner>,
    cancel: CancellationToken,
    save_task: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    key: [u8; 32],
    strict: bool,
    our_ids: HashSet<NodeId>,
    our_addrs: HashSet<SocketAddr>,
    private_ids: HashSet<NodeId>,
    addr_lookup: HashMap<NodeId, KnownAddress>,
    buckets_new: Vec<HashSet<NodeId>>,
    buckets_old: Vec<HashSet<NodeId>>,
    n_old: usize,
    n_new: usize,
}

impl AddrBook {
    /// Create an empty book with a fresh random bucket key
    pub fn new(config: AddrBookConfig) -> Self {
        let mut key = [0u8; 32];
        rand::rng().fill_bytes(&mut key);
        Self::with_key(config, key)
    }

    pub(crate) fn with_key(config: AddrBookConfig, key: [u8; 32]) -> Self {
        let inner = Inner::new(key, config.strict);
        Self {
            config,
            inner: Mutex::new(inner),
            cancel: CancellationToken::new(),
            save_task: Mutex::new(None),
        }
    }

    pub fn file_path(&self) -> &Path {
        &self.config.file
    }

    /// Load the persisted book, if any, and start saving it periodically
    pub async fn start(self: &Arc<Self>) -> Result<(), AddrBookError> {
        self.load()?;

        let book = Arc::clone(self);
        let cancel = self.cancel.clone();
        let period = self.config.save_interval();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = book.save() {
                            error!("Failed to save address book: {}", e);
                        }
                    }
                }
            }
            if let Err(e) = book.save() {
                error!("Failed to save address book on shutdown: {}", e);
            }
        });
        *self.save_task.lock() = Some(handle);
        Ok(())
    }

    /// Stop the save task after a final save and drop all buckets
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.save_task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Address book save task failed: {}", e);
            }
        }
        self.inner.lock().clear();
    }

    pub fn save(&self) -> Result<(), AddrBookError> {
        let (key, addrs) = {
            let inner = self.inner.lock();
            (inner.key, inner.addr_lookup.values().cloned().collect::<Vec<_>>())
        };
        let count = addrs.len();
        file::save(&self.config.file, &key, addrs)?;
        debug!("Saved address book with {} addresses to {}", count, self.config.file.display());
        Ok(())
    }

    fn load(&self) -> Result<(), AddrBookError> {
        let Some((key, addrs)) = file::load(&self.config.file)? else {
            return Ok(());
        };
        let mut inner = self.inner.lock();
        inner.restore(key, addrs);
        info!(
            "Loaded address book from {} with {} addresses",
            self.config.file.display(),
            inner.size()
        );
        Ok(())
    }

    /// Record an address this node is reachable on so it is never added
    pub fn add_our_address(&self, addr: &NetAddress) {
        let mut inner = self.inner.lock();
        inner.our_ids.insert(addr.id);
        inner.our_addrs.insert(addr.socket_addr());
    }

    pub fn our_address(&self, addr: &NetAddress) -> bool {
        self.inner.lock().is_our_address(addr)
    }

    /// IDs that must never be stored or gossiped
    pub fn add_private_ids(&self, ids: impl IntoIterator<Item = NodeId>) {
        self.inner.lock().private_ids.extend(ids);
    }

    /// Add an address learned from `src`. Known old addresses are left alone.
    pub fn add_address(&self, addr: &NetAddress, src: &NetAddress) -> Result<(), AddrBookError> {
        self.inner.lock().add_address(addr, src)
    }

    pub fn remove_address(&self, addr: &NetAddress) {
        let mut inner = self.inner.lock();
        if inner.remove_from_all_buckets(&addr.id).is_some() {
            debug!("Removed {} from address book", addr);
        }
    }

    pub fn has_address(&self, addr: &NetAddress) -> bool {
        self.inner.lock().addr_lookup.contains_key(&addr.id)
    }

    /// Whether the address has been connected to successfully
    pub fn is_good(&self, addr: &NetAddress) -> bool {
        self.inner
            .lock()
            .addr_lookup
            .get(&addr.id)
            .map(|ka| ka.is_old())
            .unwrap_or(false)
    }

    pub fn known_address(&self, id: &NodeId) -> Option<KnownAddress> {
        self.inner.lock().addr_lookup.get(id).cloned()
    }

    pub fn need_more_addrs(&self) -> bool {
        self.size() < NEED_ADDRESS_THRESHOLD
    }

    pub fn size(&self) -> usize {
        self.inner.lock().size()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Pick an address to dial. `bias` in 0..=100 is the preference for new
    /// addresses over old ones.
    pub fn pick_address(&self, bias: u8) -> Option<NetAddress> {
        self.inner.lock().pick_address(bias)
    }

    /// The peer with this ID connected successfully; promote it to old
    pub fn mark_good(&self, id: &NodeId) {
        let mut inner = self.inner.lock();
        let is_new = match inner.addr_lookup.get_mut(id) {
            Some(ka) => {
                ka.mark_good();
                ka.is_new()
            }
            None => return,
        };
        if is_new {
            if let Err(e) = inner.move_to_old(id) {
                error!("Failed to move {} to old bucket: {}", id, e);
            }
        }
    }

    pub fn mark_attempt(&self, addr: &NetAddress) {
        if let Some(ka) = self.inner.lock().addr_lookup.get_mut(&addr.id) {
            ka.mark_attempt();
        }
    }

    /// Forget a misbehaving address entirely
    pub fn mark_bad(&self, addr: &NetAddress) {
        let mut inner = self.inner.lock();
        if inner.remove_from_all_buckets(&addr.id).is_some() {
            info!("Marked {} as bad and removed it from the address book", addr);
        }
    }

    /// A random sample of known addresses to share with a peer
    pub fn get_selection(&self) -> Vec<NetAddress> {
        self.inner.lock().get_selection()
    }

    /// Like [`AddrBook::get_selection`] with `bias` percent of new addresses
    pub fn get_selection_with_bias(&self, bias: u8) -> Vec<NetAddress> {
        self.inner.lock().get_selection_with_bias(bias)
    }

    pub fn list_of_known_addresses(&self) -> Vec<KnownAddress> {
        self.inner.lock().addr_lookup.values().cloned().collect()
    }
}

impl std::fmt::Debug for AddrBook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("AddrBook")
            .field("file", &self.config.file)
            .field("n_new", &inner.n_new)
            .field("n_old", &inner.n_old)
            .finish()
    }
}

fn selection_size(size: usize) -> usize {
    let num = std::cmp::max(
        std::cmp::min(MIN_GET_SELECTION, size),
        size * GET_SELECTION_PERCENT / 100,
    );
    std::cmp::min(MAX_GET_SELECTION, num)
}

impl Inner {
    fn new(key: [u8; 32], strict: bool) -> Self {
        Self {
            key,
            strict,
            our_ids: HashSet::new(),
            our_addrs: HashSet::new(),
            private_ids: HashSet::new(),
            addr_lookup: HashMap::new(),
            buckets_new: vec![HashSet::new(); NEW_BUCKET_COUNT],
            buckets_old: vec![HashSet::new(); OLD_BUCKET_COUNT],
            n_old: 0,
            n_new: 0,
        }
    }

    fn size(&self) -> usize {
        self.n_old + self.n_new
    }

    fn clear(&mut self) {
        self.addr_lookup.clear();
        self.buckets_new.iter_mut().for_each(HashSet::clear);
        self.buckets_old.iter_mut().for_each(HashSet::clear);
        self.n_old = 0;
        self.n_new = 0;
    }

    fn restore(&mut self, key: [u8; 32], addrs: Vec<KnownAddress>) {
        self.clear();
        self.key = key;

        for mut ka in addrs {
            let id = ka.id();
            if self.addr_lookup.contains_key(&id) {
                continue;
            }
            let (buckets, capacity) = match ka.bucket_type {
                BucketType::New => (&mut self.buckets_new, NEW_BUCKET_SIZE),
                BucketType::Old => (&mut self.buckets_old, OLD_BUCKET_SIZE),
            };
            ka.buckets.retain(|&idx| buckets[idx].len() < capacity);
            if ka.buckets.is_empty() {
                continue;
            }
            for &idx in &ka.buckets {
                buckets[idx].insert(id);
            }
            match ka.bucket_type {
                BucketType::New => self.n_new += 1,
                BucketType::Old => self.n_old += 1,
            }
            self.addr_lookup.insert(id, ka);
        }
    }

    fn is_our_address(&self, addr: &NetAddress) -> bool {
        self.our_ids.contains(&addr.id) || self.our_addrs.contains(&addr.socket_addr())
    }

    fn add_address(&mut self, addr: &NetAddress, src: &NetAddress) -> Result<(), AddrBookError> {
        if let Err(e) = addr.validate() {
            return Err(AddrBookError::InvalidAddress {
                addr: *addr,
                reason: e.to_string(),
            });
        }
        if self.private_ids.contains(&addr.id) {
            return Err(AddrBookError::PrivateAddress(*addr));
        }
        if self.private_ids.contains(&src.id) {
            return Err(AddrBookError::PrivateSource {
                addr: *addr,
                src: *src,
            });
        }
        if self.is_our_address(addr) {
            return Err(AddrBookError::SelfAddress(*addr));
        }
        if self.strict && !addr.is_routable() {
            return Err(AddrBookError::NonRoutable(*addr));
        }

        let (addr, src) = match self.addr_lookup.get(&addr.id) {
            Some(ka) => {
                if ka.is_old() || ka.buckets.len() >= MAX_NEW_BUCKETS_PER_ADDRESS {
                    return Ok(());
                }
                // The more buckets it is already in, the less likely it is added again
                let factor = (2 * ka.buckets.len()).max(1) as u32;
                if rand::rng().random_range(0..factor) != 0 {
                    return Ok(());
                }
                (ka.addr, *src)
            }
            None => {
                self.addr_lookup.insert(addr.id, KnownAddress::new(*addr, *src));
                (*addr, *src)
            }
        };

        let bucket = self.calc_new_bucket(&addr, &src);
        let result = self.add_to_new_bucket(&addr.id, bucket);
        if result.is_err() {
            if let Some(ka) = self.addr_lookup.get(&addr.id) {
                if ka.buckets.is_empty() {
                    self.addr_lookup.remove(&addr.id);
                }
            }
        }
        result
    }

    fn hash_mod(&self, parts: &[&[u8]], modulus: u64) -> u64 {
        let mut hasher = blake3::Hasher::new_keyed(&self.key);
        for part in parts {
            hasher.update(&(part.len() as u32).to_be_bytes());
            hasher.update(part);
        }
        let digest = hasher.finalize();
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest.as_bytes()[..8]);
        u64::from_be_bytes(head) % modulus
    }

    fn calc_new_bucket(&self, addr: &NetAddress, src: &NetAddress) -> usize {
        let addr_group = addr.group_key(self.strict);
        let src_group = src.group_key(self.strict);

        let hash1 = self.hash_mod(
            &[addr_group.as_bytes(), src_group.as_bytes()],
            NEW_BUCKETS_PER_GROUP,
        );
        self.hash_mod(
            &[src_group.as_bytes(), &hash1.to_be_bytes()[..]],
            NEW_BUCKET_COUNT as u64,
        ) as usize
    }

    fn calc_old_bucket(&self, addr: &NetAddress) -> usize {
        let addr_str = addr.to_string();
        let addr_group = addr.group_key(self.strict);

        let hash1 = self.hash_mod(&[addr_str.as_bytes()], OLD_BUCKETS_PER_GROUP);
        self.hash_mod(
            &[addr_group.as_bytes(), &hash1.to_be_bytes()[..]],
            OLD_BUCKET_COUNT as u64,
        ) as usize
    }

    fn bucket(&mut self, bucket_type: BucketType, idx: usize) -> &mut HashSet<NodeId> {
        match bucket_type {
            BucketType::New => &mut self.buckets_new[idx],
            BucketType::Old => &mut self.buckets_old[idx],
        }
    }

    fn add_to_new_bucket(&mut self, id: &NodeId, bucket_idx: usize) -> Result<(), AddrBookError> {
        match self.addr_lookup.get(id) {
            Some(ka) if ka.is_old() => return Err(AddrBookError::OldAddressNewSource(ka.addr)),
            Some(_) => {}
            None => {
                return Err(AddrBookError::Inconsistent(format!(
                    "{} missing from lookup",
                    id
                )))
            }
        }

        if self.buckets_new[bucket_idx].contains(id) {
            return Ok(());
        }
        if self.buckets_new[bucket_idx].len() >= NEW_BUCKET_SIZE {
            self.expire_new(bucket_idx);
        }
        self.buckets_new[bucket_idx].insert(*id);

        if let Some(ka) = self.addr_lookup.get_mut(id) {
            if ka.add_bucket_ref(bucket_idx) == 1 {
                self.n_new += 1;
            }
        }
        Ok(())
    }

    /// Returns false if the bucket is full
    fn add_to_old_bucket(&mut self, id: &NodeId, bucket_idx: usize) -> bool {
        if self.buckets_old[bucket_idx].contains(id) {
            return true;
        }
        if self.buckets_old[bucket_idx].len() >= OLD_BUCKET_SIZE {
            return false;
        }
        self.buckets_old[bucket_idx].insert(*id);

        if let Some(ka) = self.addr_lookup.get_mut(id) {
            if ka.add_bucket_ref(bucket_idx) == 1 {
                self.n_old += 1;
            }
        }
        true
    }

    /// Drop the address from one bucket, forgetting it once no bucket
    /// references it. Returns the entry if it was forgotten.
    fn remove_from_bucket(
        &mut self,
        id: &NodeId,
        bucket_type: BucketType,
        bucket_idx: usize,
    ) -> Option<KnownAddress> {
        self.bucket(bucket_type, bucket_idx).remove(id);

        let remaining = self.addr_lookup.get_mut(id)?.remove_bucket_ref(bucket_idx);
        if remaining > 0 {
            return None;
        }
        match bucket_type {
            BucketType::New => self.n_new -= 1,
            BucketType::Old => self.n_old -= 1,
        }
        self.addr_lookup.remove(id)
    }

    fn remove_from_all_buckets(&mut self, id: &NodeId) -> Option<KnownAddress> {
        let mut ka = self.addr_lookup.remove(id)?;
        for &idx in &ka.buckets {
            self.bucket(ka.bucket_type, idx).remove(id);
        }
        match ka.bucket_type {
            BucketType::New => self.n_new -= 1,
            BucketType::Old => self.n_old -= 1,
        }
        ka.buckets.clear();
        Some(ka)
    }

    fn pick_oldest(&self, bucket_type: BucketType, bucket_idx: usize) -> Option<NodeId> {
        let bucket = match bucket_type {
            BucketType::New => &self.buckets_new[bucket_idx],
            BucketType::Old => &self.buckets_old[bucket_idx],
        };
        bucket
            .iter()
            .filter_map(|id| self.addr_lookup.get(id))
            .min_by_key(|ka| ka.last_attempt)
            .map(|ka| ka.id())
    }

    /// Make room in a full new bucket: a bad entry if there is one, otherwise
    /// the one attempted longest ago
    fn expire_new(&mut self, bucket_idx: usize) {
        let bad = self.buckets_new[bucket_idx]
            .iter()
            .find(|id| self.addr_lookup.get(*id).map(|ka| ka.is_bad()).unwrap_or(false))
            .copied();

        let victim = bad.or_else(|| self.pick_oldest(BucketType::New, bucket_idx));
        if let Some(id) = victim {
            debug!("Expiring {} from new bucket {}", id, bucket_idx);
            self.remove_from_bucket(&id, BucketType::New, bucket_idx);
        }
    }

    /// Promote a new address to an old bucket. If that bucket is full its
    /// oldest entry is demoted back to a new bucket.
    fn move_to_old(&mut self, id: &NodeId) -> Result<(), AddrBookError> {
        let freed_bucket = match self.addr_lookup.get(id) {
            None => return Ok(()),
            Some(ka) if ka.is_old() => return Ok(()),
            Some(ka) => *ka.buckets.first().ok_or_else(|| {
                AddrBookError::Inconsistent(format!("new address {} has no buckets", ka.addr))
            })?,
        };

        let mut ka = self
            .remove_from_all_buckets(id)
            .ok_or_else(|| AddrBookError::Inconsistent(format!("{} vanished", id)))?;
        ka.bucket_type = BucketType::Old;
        let old_idx = self.calc_old_bucket(&ka.addr);
        self.addr_lookup.insert(*id, ka);

        if self.add_to_old_bucket(id, old_idx) {
            return Ok(());
        }

        if let Some(oldest_id) = self.pick_oldest(BucketType::Old, old_idx) {
            if let Some(mut demoted) = self.remove_from_bucket(&oldest_id, BucketType::Old, old_idx) {
                demoted.bucket_type = BucketType::New;
                let new_idx = self.calc_new_bucket(&demoted.addr, &demoted.src);
                self.addr_lookup.insert(oldest_id, demoted);
                if self.add_to_new_bucket(&oldest_id, new_idx).is_err() {
                    self.add_to_new_bucket(&oldest_id, freed_bucket)?;
                }
            }
        }

        if !self.add_to_old_bucket(id, old_idx) {
            self.addr_lookup.remove(id);
            return Err(AddrBookError::Inconsistent(format!(
                "old bucket {} still full",
                old_idx
            )));
        }
        Ok(())
    }

    fn pick_address(&self, bias: u8) -> Option<NetAddress> {
        if self.size() == 0 {
            return None;
        }
        let bias = f64::from(bias.min(100));
        let mut rng = rand::rng();

        let old_correlation = (self.n_old as f64).sqrt() * (100.0 - bias);
        let new_correlation = (self.n_new as f64).sqrt() * bias;
        let total = old_correlation + new_correlation;

        let mut pick_old = total > 0.0 && rng.random::<f64>() * total < old_correlation;
        if pick_old && self.n_old == 0 {
            pick_old = false;
        } else if !pick_old && self.n_new == 0 {
            pick_old = true;
        }

        let buckets = if pick_old {
            &self.buckets_old
        } else {
            &self.buckets_new
        };
        let non_empty: Vec<&HashSet<NodeId>> = buckets.iter().filter(|b| !b.is_empty()).collect();
        if non_empty.is_empty() {
            return None;
        }
        let bucket = non_empty[rng.random_range(0..non_empty.len())];
        let id = bucket.iter().nth(rng.random_range(0..bucket.len()))?;
        self.addr_lookup.get(id).map(|ka| ka.addr)
    }

    fn get_selection(&self) -> Vec<NetAddress> {
        let num = selection_size(self.size());
        let mut all: Vec<NetAddress> = self.addr_lookup.values().map(|ka| ka.addr).collect();
        all.shuffle(&mut rand::rng());
        all.truncate(num);
        all
    }

    fn get_selection_with_bias(&self, bias: u8) -> Vec<NetAddress> {
        let size = self.size();
        if size == 0 {
            return Vec::new();
        }
        let num = selection_size(size);
        let bias = usize::from(bias.min(100));

        let num_required_new = std::cmp::max(num * bias / 100, num.saturating_sub(self.n_old));
        let mut selection = self.random_pick(BucketType::New, num_required_new);
        let remaining = num.saturating_sub(selection.len());
        selection.extend(self.random_pick(BucketType::Old, remaining));
        selection
    }

    /// Up to `num` distinct addresses drawn from buckets of one type
    fn random_pick(&self, bucket_type: BucketType, num: usize) -> Vec<NetAddress> {
        if num == 0 {
            return Vec::new();
        }
        let buckets = match bucket_type {
            BucketType::New => &self.buckets_new,
            BucketType::Old => &self.buckets_old,
        };

        // New addresses can sit in several buckets
        let mut seen = HashSet::new();
        let mut ids: Vec<NodeId> = buckets
            .iter()
            .flatten()
            .filter(|id| seen.insert(**id))
            .copied()
            .collect();
        ids.shuffle(&mut rand::rng());

        ids.into_iter()
            .take(num)
            .filter_map(|id| self.addr_lookup.get(&id).map(|ka| ka.addr))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NodeKey;
    use proptest::prelude::*;
    use std::net::{IpAddr, Ipv4Addr};
    use tempfile::tempdir;

    fn config(dir: &Path) -> AddrBookConfig {
        AddrBookConfig::new(dir.join("addrbook.json"))
    }

    fn routable(a: u8, b: u8) -> NetAddress {
        let id = NodeKey::generate().id();
        NetAddress::new(id, SocketAddr::new(IpAddr::V4(Ipv4Addr::new(a, b, 1, 1)), 26656))
    }

    /// Structural invariants between the lookup table, buckets and counters
    fn check_invariants(inner: &Inner) {
        let mut n_new = 0;
        let mut n_old = 0;
        for (id, ka) in &inner.addr_lookup {
            assert_eq!(*id, ka.id());
            match ka.bucket_type {
                BucketType::New => {
                    n_new += 1;
                    assert!(!ka.buckets.is_empty() && ka.buckets.len() <= MAX_NEW_BUCKETS_PER_ADDRESS);
                    for &idx in &ka.buckets {
                        assert!(inner.buckets_new[idx].contains(id));
                    }
                    assert!(inner.buckets_old.iter().all(|b| !b.contains(id)));
                }
                BucketType::Old => {
                    n_old += 1;
                    assert_eq!(ka.buckets.len(), 1);
                    assert!(inner.buckets_old[ka.buckets[0]].contains(id));
                    assert!(inner.buckets_new.iter().all(|b| !b.contains(id)));
                }
            }
        }
        assert_eq!(inner.n_new, n_new);
        assert_eq!(inner.n_old, n_old);

        for (idx, bucket) in inner.buckets_new.iter().enumerate() {
            assert!(bucket.len() <= NEW_BUCKET_SIZE);
            for id in bucket {
                assert!(inner.addr_lookup[id].buckets.contains(&idx));
            }
        }
        for bucket in &inner.buckets_old {
            assert!(bucket.len() <= OLD_BUCKET_SIZE);
            for id in bucket {
                assert!(inner.addr_lookup.contains_key(id));
            }
        }
    }

    #[test]
    fn test_add_and_size() {
        let dir = tempdir().unwrap();
        let book = AddrBook::new(config(dir.path()));
        assert!(book.is_empty());
        assert!(book.need_more_addrs());

        let a = routable(8, 8);
        book.add_address(&a, &a).unwrap();
        book.add_address(&a, &a).unwrap();
        assert_eq!(book.size(), 1);
        assert!(book.has_address(&a));
        assert!(!book.is_good(&a));

        check_invariants(&book.inner.lock());
    }

    #[test]
    fn test_add_rejections() {
        let dir = tempdir().unwrap();
        let book = AddrBook::new(config(dir.path()));
        let src = routable(8, 8);

        let local: NetAddress = format!("{}@127.0.0.1:26656", NodeKey::generate().id())
            .parse()
            .unwrap();
        assert!(matches!(
            book.add_address(&local, &src),
            Err(AddrBookError::NonRoutable(_))
        ));

        let zero_port = NetAddress::new(
            NodeKey::generate().id(),
            "8.8.8.8:0".parse().unwrap(),
        );
        assert!(matches!(
            book.add_address(&zero_port, &src),
            Err(AddrBookError::InvalidAddress { .. })
        ));

        let ours = routable(9, 9);
        book.add_our_address(&ours);
        assert!(book.our_address(&ours));
        assert!(matches!(
            book.add_address(&ours, &src),
            Err(AddrBookError::SelfAddress(_))
        ));

        let private = routable(11, 1);
        let private_src = routable(11, 2);
        book.add_private_ids([private.id, private_src.id]);
        assert!(matches!(
            book.add_address(&private, &src),
            Err(AddrBookError::PrivateAddress(_))
        ));
        assert!(matches!(
            book.add_address(&routable(12, 1), &private_src),
            Err(AddrBookError::PrivateSource { .. })
        ));

        assert!(book.is_empty());
    }

    #[test]
    fn test_non_strict_accepts_local() {
        let dir = tempdir().unwrap();
        let book = AddrBook::new(config(dir.path()).with_strict(false));
        let local: NetAddress = format!("{}@127.0.0.1:26656", NodeKey::generate().id())
            .parse()
            .unwrap();
        book.add_address(&local, &local).unwrap();
        assert_eq!(book.size(), 1);
    }

    #[test]
    fn test_new_bucket_is_deterministic_for_key() {
        let dir = tempdir().unwrap();
        let key = [42u8; 32];
        let a = AddrBook::with_key(config(dir.path()), key);
        let b = AddrBook::with_key(config(dir.path()), key);
        let addr = routable(8, 8);
        let src = routable(9, 9);

        let idx_a = a.inner.lock().calc_new_bucket(&addr, &src);
        let idx_b = b.inner.lock().calc_new_bucket(&addr, &src);
        assert_eq!(idx_a, idx_b);
        assert!(idx_a < NEW_BUCKET_COUNT);

        a.add_address(&addr, &src).unwrap();
        assert_eq!(a.known_address(&addr.id).unwrap().buckets, vec![idx_a]);
    }

    #[test]
    fn test_mark_good_moves_to_old() {
        let dir = tempdir().unwrap();
        let book = AddrBook::new(config(dir.path()));
        let a = routable(8, 8);
        book.add_address(&a, &a).unwrap();

        book.mark_attempt(&a);
        assert_eq!(book.known_address(&a.id).unwrap().attempts, 1);

        book.mark_good(&a.id);
        let ka = book.known_address(&a.id).unwrap();
        assert!(ka.is_old());
        assert_eq!(ka.attempts, 0);
        assert!(book.is_good(&a));

        // Old addresses are not re-added to new buckets
        book.add_address(&a, &routable(9, 9)).unwrap();
        assert!(book.known_address(&a.id).unwrap().is_old());
        check_invariants(&book.inner.lock());
    }

    #[test]
    fn test_full_old_bucket_demotes_oldest() {
        let dir = tempdir().unwrap();
        let book = AddrBook::new(config(dir.path()));
        let target = routable(8, 8);
        book.add_address(&target, &target).unwrap();

        let old_idx = book.inner.lock().calc_old_bucket(&target);
        {
            let mut inner = book.inner.lock();
            for i in 0..OLD_BUCKET_SIZE {
                let addr = routable(20 + (i % 100) as u8, i as u8);
                let mut ka = KnownAddress::new(addr, addr);
                ka.bucket_type = BucketType::Old;
                ka.buckets = vec![old_idx];
                ka.last_attempt = chrono::Utc::now() - chrono::Duration::hours(i as i64 + 1);
                inner.buckets_old[old_idx].insert(addr.id);
                inner.addr_lookup.insert(addr.id, ka);
                inner.n_old += 1;
            }
        }
        let oldest = book
            .inner
            .lock()
            .pick_oldest(BucketType::Old, old_idx)
            .unwrap();

        book.mark_good(&target.id);

        let inner = book.inner.lock();
        check_invariants(&inner);
        assert!(inner.addr_lookup[&target.id].is_old());
        assert!(inner.addr_lookup[&oldest].is_new());
        assert_eq!(inner.n_old, OLD_BUCKET_SIZE);
        assert_eq!(inner.n_new, 1);
    }

    #[test]
    fn test_full_new_bucket_expires_entry() {
        let dir = tempdir().unwrap();
        let book = AddrBook::new(config(dir.path()));
        let src = routable(9, 9);

        let mut inner = book.inner.lock();
        let idx = 5;
        for i in 0..NEW_BUCKET_SIZE {
            let addr = routable(30, i as u8);
            inner.addr_lookup.insert(addr.id, KnownAddress::new(addr, src));
            inner.add_to_new_bucket(&addr.id, idx).unwrap();
        }
        let extra = routable(31, 1);
        inner.addr_lookup.insert(extra.id, KnownAddress::new(extra, src));
        inner.add_to_new_bucket(&extra.id, idx).unwrap();

        assert_eq!(inner.buckets_new[idx].len(), NEW_BUCKET_SIZE);
        assert!(inner.buckets_new[idx].contains(&extra.id));
        assert_eq!(inner.n_new, NEW_BUCKET_SIZE);
        check_invariants(&inner);
    }

    #[test]
    fn test_mark_bad_and_remove() {
        let dir = tempdir().unwrap();
        let book = AddrBook::new(config(dir.path()));
        let a = routable(8, 8);
        let b = routable(9, 9);
        book.add_address(&a, &a).unwrap();
        book.add_address(&b, &b).unwrap();
        book.mark_good(&b.id);

        book.mark_bad(&a);
        assert!(!book.has_address(&a));
        book.remove_address(&b);
        assert!(book.is_empty());
        check_invariants(&book.inner.lock());
    }

    #[test]
    fn test_pick_address() {
        let dir = tempdir().unwrap();
        let book = AddrBook::new(config(dir.path()));
        assert!(book.pick_address(50).is_none());

        let a = routable(8, 8);
        book.add_address(&a, &a).unwrap();
        // Only a new address exists, so even a full old bias returns it
        assert_eq!(book.pick_address(0), Some(a));
        assert_eq!(book.pick_address(100), Some(a));

        book.mark_good(&a.id);
        assert_eq!(book.pick_address(100), Some(a));
    }

    #[test]
    fn test_pick_address_bias() {
        let dir = tempdir().unwrap();
        let book = AddrBook::new(config(dir.path()));
        let mut old = HashSet::new();
        for i in 0..4u8 {
            let addr = routable(40 + i, i);
            book.add_address(&addr, &addr).unwrap();
            book.mark_good(&addr.id);
            old.insert(addr);
        }
        for i in 0..16u8 {
            let addr = routable(50 + i, i);
            book.add_address(&addr, &addr).unwrap();
        }

        for _ in 0..50 {
            assert!(old.contains(&book.pick_address(0).unwrap()));
            assert!(!old.contains(&book.pick_address(100).unwrap()));
        }

        // sqrt(4) * 50 vs sqrt(16) * 50: old about a third of the time
        let trials = 3000;
        let old_picks = (0..trials)
            .filter(|_| old.contains(&book.pick_address(50).unwrap()))
            .count();
        let ratio = old_picks as f64 / trials as f64;
        assert!((0.25..0.42).contains(&ratio), "old ratio {}", ratio);
    }

    #[test]
    fn test_get_selection() {
        let dir = tempdir().unwrap();
        let book = AddrBook::new(config(dir.path()));
        assert!(book.get_selection().is_empty());
        assert!(book.get_selection_with_bias(30).is_empty());

        for i in 0..200u8 {
            let addr = routable(60 + (i % 30), i);
            book.add_address(&addr, &addr).unwrap();
        }
        let size = book.size();

        let selection = book.get_selection();
        assert_eq!(selection.len(), std::cmp::max(32, size * 23 / 100));
        let unique: HashSet<_> = selection.iter().collect();
        assert_eq!(unique.len(), selection.len());

        let biased = book.get_selection_with_bias(30);
        assert_eq!(biased.len(), selection.len());
        let unique: HashSet<_> = biased.iter().collect();
        assert_eq!(unique.len(), biased.len());
    }

    #[test]
    fn test_selection_size() {
        assert_eq!(selection_size(0), 0);
        assert_eq!(selection_size(10), 10);
        assert_eq!(selection_size(100), 32);
        assert_eq!(selection_size(1000), 230);
        assert_eq!(selection_size(5000), MAX_GET_SELECTION);
    }

    #[test]
    fn test_selection_with_bias_prefers_new() {
        let dir = tempdir().unwrap();
        let book = AddrBook::new(config(dir.path()));
        let mut new = HashSet::new();
        for i in 0..100u8 {
            let addr = routable(70 + (i % 50), i);
            book.add_address(&addr, &addr).unwrap();
            if i % 2 == 0 {
                book.mark_good(&addr.id);
            } else {
                new.insert(addr);
            }
        }

        let selection = book.get_selection_with_bias(100);
        assert_eq!(selection.len(), 32);
        assert!(selection.iter().all(|a| new.contains(a)));

        let selection = book.get_selection_with_bias(0);
        assert_eq!(selection.len(), 32);
        assert!(selection.iter().all(|a| !new.contains(a)));
    }

    #[tokio::test]
    async fn test_persistence() {
        let dir = tempdir().unwrap();
        let book = Arc::new(AddrBook::new(config(dir.path())));
        book.start().await.unwrap();

        let a = routable(8, 8);
        let b = routable(9, 9);
        book.add_address(&a, &a).unwrap();
        book.add_address(&b, &a).unwrap();
        book.mark_good(&b.id);
        let key = book.inner.lock().key;
        book.stop().await;
        assert!(book.is_empty());

        let restored = Arc::new(AddrBook::new(config(dir.path())));
        restored.start().await.unwrap();
        assert_eq!(restored.size(), 2);
        assert_eq!(restored.inner.lock().key, key);
        assert!(restored.is_good(&b));
        assert!(!restored.is_good(&a));
        check_invariants(&restored.inner.lock());
        restored.stop().await;
    }

    #[tokio::test]
    async fn test_periodic_save() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path()).with_save_interval(std::time::Duration::from_secs(1));
        let path = cfg.file.clone();
        let book = Arc::new(AddrBook::new(cfg));
        book.start().await.unwrap();

        let a = routable(8, 8);
        book.add_address(&a, &a).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
        assert!(path.exists());

        book.stop().await;
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add(usize, usize),
        Good(usize),
        Attempt(usize),
        Bad(usize),
        Remove(usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => (0..40usize, 0..8usize).prop_map(|(a, s)| Op::Add(a, s)),
            2 => (0..40usize).prop_map(Op::Good),
            1 => (0..40usize).prop_map(Op::Attempt),
            1 => (0..40usize).prop_map(Op::Bad),
            1 => (0..40usize).prop_map(Op::Remove),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_book_stays_consistent(ops in prop::collection::vec(op_strategy(), 1..200)) {
            let dir = tempdir().unwrap();
            let book = AddrBook::new(config(dir.path()));
            let addrs: Vec<NetAddress> = (0..40u8).map(|i| routable(20 + i, i)).collect();
            let srcs: Vec<NetAddress> = (0..8u8).map(|i| routable(100 + i, i)).collect();
            let mut promoted = HashSet::new();

            for op in ops {
                match op {
                    Op::Add(a, s) => { book.add_address(&addrs[a], &srcs[s]).unwrap(); }
                    Op::Good(a) => {
                        book.mark_good(&addrs[a].id);
                        if book.has_address(&addrs[a]) {
                            promoted.insert(addrs[a].id);
                        }
                    }
                    Op::Attempt(a) => book.mark_attempt(&addrs[a]),
                    Op::Bad(a) => {
                        book.mark_bad(&addrs[a]);
                        promoted.remove(&addrs[a].id);
                    }
                    Op::Remove(a) => {
                        book.remove_address(&addrs[a]);
                        promoted.remove(&addrs[a].id);
                    }
                }

                let inner = book.inner.lock();
                check_invariants(&inner);
                // Forty addresses never fill an old bucket, so promotion is final
                for id in &promoted {
                    prop_assert!(inner.addr_lookup[id].is_old());
                }
            }
        }
    }
}

//! JSON persistence of the address book

use super::known_address::{BucketType, KnownAddress};
use super::{AddrBookError, MAX_NEW_BUCKETS_PER_ADDRESS, NEW_BUCKET_COUNT, OLD_BUCKET_COUNT};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::Path;
use tracing::warn;

#[derive(Serialize, Deserialize)]
pub(super) struct AddrBookJson {
    pub key: String,
    pub addrs: Vec<KnownAddress>,
}

pub(super) fn save(path: &Path, key: &[u8; 32], addrs: Vec<KnownAddress>) -> Result<(), AddrBookError> {
    let json = AddrBookJson {
        key: hex::encode(key),
        addrs,
    };
    let data = serde_json::to_vec_pretty(&json)?;
    write_atomically(path, &data)?;
    Ok(())
}

/// Returns `None` when there is no file yet
pub(super) fn load(path: &Path) -> Result<Option<([u8; 32], Vec<KnownAddress>)>, AddrBookError> {
    if !path.exists() {
        return Ok(None);
    }

    let corrupt = |reason: String| AddrBookError::Corrupt {
        path: path.display().to_string(),
        reason,
    };

    let data = fs::read(path)?;
    let json: AddrBookJson = serde_json::from_slice(&data).map_err(|e| corrupt(e.to_string()))?;

    let key: [u8; 32] = hex::decode(&json.key)
        .map_err(|e| corrupt(format!("key: {}", e)))?
        .try_into()
        .map_err(|_| corrupt("key must be 32 bytes".to_string()))?;

    let addrs = json
        .addrs
        .into_iter()
        .filter(|ka| match check_buckets(ka) {
            Ok(()) => true,
            Err(reason) => {
                warn!("Skipping {} from {}: {}", ka.addr, path.display(), reason);
                false
            }
        })
        .collect();

    Ok(Some((key, addrs)))
}

fn check_buckets(ka: &KnownAddress) -> Result<(), String> {
    let (max_refs, bucket_count) = match ka.bucket_type {
        BucketType::New => (MAX_NEW_BUCKETS_PER_ADDRESS, NEW_BUCKET_COUNT),
        BucketType::Old => (1, OLD_BUCKET_COUNT),
    };
    if ka.buckets.is_empty() || ka.buckets.len() > max_refs {
        return Err(format!("has {} bucket references", ka.buckets.len()));
    }
    if let Some(idx) = ka.buckets.iter().find(|&&idx| idx >= bucket_count) {
        return Err(format!("bucket index {} out of range", idx));
    }
    let distinct: HashSet<usize> = ka.buckets.iter().copied().collect();
    if distinct.len() != ka.buckets.len() {
        return Err("repeated bucket index".to_string());
    }
    Ok(())
}

/// Write to a sibling temp file and rename over the target
fn write_atomically(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NetAddress, NodeKey};
    use tempfile::tempdir;

    fn known(buckets: Vec<usize>, bucket_type: BucketType) -> KnownAddress {
        let addr: NetAddress = format!("{}@8.8.8.8:26656", NodeKey::generate().id())
            .parse()
            .unwrap();
        let mut ka = KnownAddress::new(addr, addr);
        ka.buckets = buckets;
        ka.bucket_type = bucket_type;
        ka
    }

    #[test]
    fn test_missing_file() {
        let dir = tempdir().unwrap();
        assert!(load(&dir.path().join("addrbook.json")).unwrap().is_none());
    }

    #[test]
    fn test_save_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("addrbook.json");
        let key = [7u8; 32];
        let addrs = vec![
            known(vec![1, 2], BucketType::New),
            known(vec![3], BucketType::Old),
        ];

        save(&path, &key, addrs.clone()).unwrap();
        let (loaded_key, loaded) = load(&path).unwrap().unwrap();
        assert_eq!(loaded_key, key);
        assert_eq!(loaded, addrs);
    }

    #[test]
    fn test_skips_bad_bucket_refs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("addrbook.json");
        let good = known(vec![3], BucketType::Old);
        let addrs = vec![
            good.clone(),
            known(vec![OLD_BUCKET_COUNT], BucketType::Old),
            known(vec![], BucketType::New),
            known(vec![1, 2], BucketType::Old),
            known(vec![NEW_BUCKET_COUNT], BucketType::New),
            known(vec![1, 1], BucketType::New),
        ];

        save(&path, &[0u8; 32], addrs).unwrap();
        let (_, loaded) = load(&path).unwrap().unwrap();
        assert_eq!(loaded, vec![good]);
    }

    #[test]
    fn test_rejects_garbage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("addrbook.json");
        fs::write(&path, b"not json").unwrap();
        assert!(matches!(load(&path), Err(AddrBookError::Corrupt { .. })));

        fs::write(&path, br#"{"key":"00ff","addrs":[]}"#).unwrap();
        assert!(matches!(load(&path), Err(AddrBookError::Corrupt { .. })));
    }
}

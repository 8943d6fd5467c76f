//! Content-addressed registry of kernel and initrd images.
//!
//! An image entry is stored under `/<imtype>/<fnv64a-hex-of-path>`; the key
//! doubles as the image id referenced from boot data entries.  FNV-1a-64
//! gives short ids that are stable across restarts; it is not a security
//! measure, and a lookup only trusts a digest whose stored `path` matches.

use std::collections::HashMap;
use std::hash::Hasher;
use std::time::Duration;

use datastore::{make_key, KvPair, KvStore, KEY_MAX, KEY_MIN};
use fnv::FnvHasher;
use snafu::{OptionExt, ResultExt};

use crate::error::{self, Result};
use crate::model::{BootDataStore, ImageData};
use crate::store::{get_tags, store_entry};

pub const KERNEL_IMAGE_TYPE: &str = "kernel";
pub const INITRD_IMAGE_TYPE: &str = "initrd";

// Lease on the cluster-wide mutex serialising registry read-modify-write.
const DIST_LOCK_LEASE: Duration = Duration::from_secs(5);

/// Read-through cache of image entries, invalidated on delete only.  Stale
/// hits are tolerated because paths are never rewritten in place; every
/// distinct path yields a new id.
pub type ImageCache = HashMap<String, ImageData>;

/// Computes the storage key (and id) for an image path.
fn make_image_key(imtype: &str, path: &str) -> String {
    let mut hasher = FnvHasher::default();
    hasher.write(path.as_bytes());
    make_key(imtype, &format!("{:016x}", hasher.finish()))
}

/// Finds the entry whose stored path equals `path` among scanned pairs.
/// Entries that fail to decode, or whose path differs (including a digest
/// collision), are treated as misses.
fn image_lookup(path: &str, kvl: &[KvPair]) -> Option<(String, ImageData)> {
    for pair in kvl {
        match serde_json::from_str::<ImageData>(&pair.value) {
            Ok(imdata) if imdata.path == path => return Some((pair.key.clone(), imdata)),
            Ok(_) => {}
            Err(e) => debug!("undecodable image entry at {}: {}", pair.key, e),
        }
    }
    None
}

/// Scans every stored entry of one image type.
pub fn get_images<D: KvStore>(ds: &D, imtype: &str) -> Result<Vec<KvPair>> {
    ds.get_range(&make_key(imtype, KEY_MIN), &make_key(imtype, KEY_MAX))
        .context(error::StorageSnafu { op: "list images" })
}

/// Returns the id of the image stored for `path`, if any.  Lock-free.
pub fn find_image<D: KvStore>(ds: &D, path: &str, imtype: &str) -> Result<Option<String>> {
    Ok(image_lookup(path, &get_images(ds, imtype)?).map(|(key, _)| key))
}

/// Stores an image path, returning its id.  Idempotent: a path that is
/// already registered returns the existing id.  The find-then-store runs
/// under the cluster-wide mutex so two writers cannot race to different
/// outcomes for the same path.
pub fn store_image<D: KvStore>(ds: &mut D, path: &str, imtype: &str) -> Result<String> {
    ds.dist_lock(DIST_LOCK_LEASE)
        .context(error::StorageSnafu { op: "lock" })?;
    let ret = store_image_locked(ds, path, imtype);
    if let Err(e) = ds.dist_unlock() {
        warn!("releasing distributed lock failed: {}", e);
    }
    ret
}

fn store_image_locked<D: KvStore>(ds: &mut D, path: &str, imtype: &str) -> Result<String> {
    if let Some((key, _)) = image_lookup(path, &get_images(ds, imtype)?) {
        return Ok(key);
    }
    let key = make_image_key(imtype, path);
    let imdata = ImageData {
        path: path.to_string(),
        params: String::new(),
    };
    store_entry(ds, &key, &imdata)?;
    Ok(key)
}

/// Dereferences an image id.  Successful backing-store reads populate the
/// cache; a missing key is a storage error the caller decides how to treat.
pub fn get_image<D: KvStore>(ds: &D, cache: &mut ImageCache, key: &str) -> Result<ImageData> {
    if let Some(imdata) = cache.get(key) {
        return Ok(imdata.clone());
    }
    let val = ds
        .get(key)
        .context(error::StorageSnafu { op: "get image" })?
        .context(error::ImageNotFoundSnafu { key })?;
    let imdata: ImageData =
        serde_json::from_str(&val).context(error::EntryDecodeSnafu { key })?;
    cache.insert(key.to_string(), imdata.clone());
    Ok(imdata)
}

/// Deletes the image registered for `path` and clears the matching field of
/// every boot data entry that referenced it.  Removing a path that is not
/// registered is a no-op.
pub fn remove_image<D: KvStore>(
    ds: &mut D,
    cache: &mut ImageCache,
    path: &str,
    imtype: &str,
) -> Result<()> {
    if path.is_empty() {
        return Ok(());
    }
    ds.dist_lock(DIST_LOCK_LEASE)
        .context(error::StorageSnafu { op: "lock" })?;
    let ret = remove_image_locked(ds, cache, path, imtype);
    if let Err(e) = ds.dist_unlock() {
        warn!("releasing distributed lock failed: {}", e);
    }
    ret
}

fn remove_image_locked<D: KvStore>(
    ds: &mut D,
    cache: &mut ImageCache,
    path: &str,
    imtype: &str,
) -> Result<()> {
    let key = match image_lookup(path, &get_images(ds, imtype)?) {
        Some((key, _)) => key,
        None => return Ok(()),
    };
    ds.delete(&key)
        .context(error::StorageSnafu { op: "delete image" })?;
    cache.remove(&key);

    // Null out the reference in every entry that pointed at this image so
    // the resolver never chases a dangling id.
    for pair in get_tags(ds)? {
        let mut bds: BootDataStore = match serde_json::from_str(&pair.value) {
            Ok(bds) => bds,
            Err(e) => {
                debug!("undecodable boot data entry at {}: {}", pair.key, e);
                continue;
            }
        };
        let field = if imtype == KERNEL_IMAGE_TYPE {
            &mut bds.kernel
        } else {
            &mut bds.initrd
        };
        if *field == key {
            field.clear();
            store_entry(ds, &pair.key, &bds)?;
        }
    }
    Ok(())
}

/// Decoded entries of one image type; undecodable entries are skipped.
pub fn image_info<D: KvStore>(ds: &D, imtype: &str) -> Vec<ImageData> {
    match get_images(ds, imtype) {
        Ok(kvl) => kvl
            .iter()
            .filter_map(|pair| serde_json::from_str(&pair.value).ok())
            .collect(),
        Err(e) => {
            warn!("listing {} images failed: {}", imtype, e);
            Vec::new()
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::PARAMS_PFX;
    use datastore::MemoryKvStore;

    #[test]
    fn test_image_key_is_fnv64a_hex() {
        // Standard FNV-1a-64 test vector for the one-byte input "a".
        assert_eq!(make_image_key("kernel", "a"), "/kernel/af63dc4c8601ec8c");
    }

    #[test]
    fn test_store_image_is_idempotent() {
        let mut ds = MemoryKvStore::new();
        let id1 = store_image(&mut ds, "s3://boot/k", KERNEL_IMAGE_TYPE).unwrap();
        let id2 = store_image(&mut ds, "s3://boot/k", KERNEL_IMAGE_TYPE).unwrap();
        assert_eq!(id1, id2);
        assert_eq!(image_info(&ds, KERNEL_IMAGE_TYPE).len(), 1);

        let other = store_image(&mut ds, "s3://boot/other", KERNEL_IMAGE_TYPE).unwrap();
        assert_ne!(id1, other);
        assert_eq!(image_info(&ds, KERNEL_IMAGE_TYPE).len(), 2);
    }

    #[test]
    fn test_kernel_and_initrd_namespaces_are_distinct() {
        let mut ds = MemoryKvStore::new();
        let k = store_image(&mut ds, "http://img/x", KERNEL_IMAGE_TYPE).unwrap();
        let i = store_image(&mut ds, "http://img/x", INITRD_IMAGE_TYPE).unwrap();
        assert_ne!(k, i);
        assert!(k.starts_with("/kernel/"));
        assert!(i.starts_with("/initrd/"));
        // Same path, same digest suffix.
        assert_eq!(k.rsplit('/').next(), i.rsplit('/').next());
    }

    #[test]
    fn test_find_image_mismatched_path_is_a_miss() {
        let mut ds = MemoryKvStore::new();
        // A colliding entry: stored under the digest of one path but
        // claiming another.  The lookup must not trust the digest alone.
        let key = make_image_key(KERNEL_IMAGE_TYPE, "http://img/k");
        ds.store(&key, "{\"path\":\"http://img/other\"}").unwrap();
        assert_eq!(find_image(&ds, "http://img/k", KERNEL_IMAGE_TYPE).unwrap(), None);
    }

    #[test]
    fn test_get_image_reads_through_cache() {
        let mut ds = MemoryKvStore::new();
        let mut cache = ImageCache::new();
        let id = store_image(&mut ds, "http://img/k", KERNEL_IMAGE_TYPE).unwrap();

        let imdata = get_image(&ds, &mut cache, &id).unwrap();
        assert_eq!(imdata.path, "http://img/k");
        assert!(cache.contains_key(&id));

        // A cached entry survives the backing store losing the key...
        ds.delete(&id).unwrap();
        assert!(get_image(&ds, &mut cache, &id).is_ok());

        // ...but an invalidated one does not.
        cache.remove(&id);
        assert!(get_image(&ds, &mut cache, &id).is_err());
    }

    #[test]
    fn test_remove_image_clears_references() {
        let mut ds = MemoryKvStore::new();
        let mut cache = ImageCache::new();
        let kernel_id = store_image(&mut ds, "http://img/k", KERNEL_IMAGE_TYPE).unwrap();
        let initrd_id = store_image(&mut ds, "http://img/i", INITRD_IMAGE_TYPE).unwrap();

        for host in ["x0", "x1"] {
            let bds = BootDataStore {
                kernel: kernel_id.clone(),
                initrd: initrd_id.clone(),
                ..Default::default()
            };
            store_entry(&mut ds, &format!("{}{}", PARAMS_PFX, host), &bds).unwrap();
        }

        remove_image(&mut ds, &mut cache, "http://img/k", KERNEL_IMAGE_TYPE).unwrap();

        assert_eq!(find_image(&ds, "http://img/k", KERNEL_IMAGE_TYPE).unwrap(), None);
        for host in ["x0", "x1"] {
            let val = ds.get(&format!("{}{}", PARAMS_PFX, host)).unwrap().unwrap();
            let bds: BootDataStore = serde_json::from_str(&val).unwrap();
            assert_eq!(bds.kernel, "");
            // The initrd reference is untouched.
            assert_eq!(bds.initrd, initrd_id);
        }

        // Removing a path that was never stored is a no-op.
        remove_image(&mut ds, &mut cache, "http://img/gone", KERNEL_IMAGE_TYPE).unwrap();
    }
}

//! The boot parameter store and resolver.
//!
//! Boot data is persisted under `/params/<binding>`, where a binding is an
//! xname, a raw MAC address or `nid<N>` (used when the inventory cannot
//! resolve the identity), a role tag, or one of the reserved tags.  The
//! reserved tags are ordinary entries created and deleted by the same
//! operations as everything else.
//!
//! A store request honours exactly one selector branch (hosts > MACs >
//! NIDs > image-only); update and removal are cumulative over every list
//! the request names.

use datastore::{KvPair, KvStore, KEY_MAX, KEY_MIN};
use serde::Serialize;
use snafu::ResultExt;

use crate::cloudinit;
use crate::error::{self, Error, Result};
use crate::images::{self, ImageCache, INITRD_IMAGE_TYPE, KERNEL_IMAGE_TYPE};
use crate::inventory::InventoryState;
use crate::model::{nid_name, BootData, BootDataStore, BootParams, Component, ImageData};

pub const PARAMS_PFX: &str = "/params/";

pub const DEFAULT_TAG: &str = "Default";
pub const GLOBAL_TAG: &str = "Global";
pub const UNKNOWN_PREFIX: &str = "Unknown-";

/// Serialises a value to JSON and stores it at the given key.
pub(crate) fn store_entry<D: KvStore, T: Serialize>(ds: &mut D, key: &str, value: &T) -> Result<()> {
    let data = serde_json::to_string(value).context(error::StoreSerializationSnafu)?;
    debug!("storing {}: {}", key, data);
    ds.store(key, &data)
        .context(error::StorageSnafu { op: "store" })
}

fn params_key(binding: &str) -> String {
    format!("{}{}", PARAMS_PFX, binding)
}

/// Every `/params/` entry.
pub fn get_tags<D: KvStore>(ds: &D) -> Result<Vec<KvPair>> {
    ds.get_range(
        &format!("{}{}", PARAMS_PFX, KEY_MIN),
        &format!("{}{}", PARAMS_PFX, KEY_MAX),
    )
    .context(error::StorageSnafu { op: "list params" })
}

/// The binding name of a `/params/` entry.
pub fn extract_param_name(pair: &KvPair) -> String {
    pair.key
        .strip_prefix(PARAMS_PFX)
        .unwrap_or_default()
        .to_string()
}

/// Names of every stored binding.
pub fn get_names<D: KvStore>(ds: &D) -> Vec<String> {
    match get_tags(ds) {
        Ok(kvl) => kvl.iter().map(extract_param_name).collect(),
        Err(e) => {
            warn!("listing bindings failed: {}", e);
            Vec::new()
        }
    }
}

/// Reads the stored boot data for one binding.
pub fn lookup_host<D: KvStore>(ds: &D, name: &str) -> Result<BootDataStore> {
    let key = params_key(name);
    let val = match ds.get(&key).context(error::StorageSnafu { op: "get" })? {
        Some(val) => val,
        None => return error::BindingNotFoundSnafu { name }.fail(),
    };
    serde_json::from_str(&val).context(error::EntryDecodeSnafu { key })
}

fn host_exists<D: KvStore>(ds: &D, name: &str) -> bool {
    lookup_host(ds, name).is_ok()
}

// The binding a MAC or NID maps to: the canonical xname when the inventory
// resolves it, the raw identity otherwise so the record survives until the
// inventory catches up.
fn mac_binding(inv: &InventoryState, mac: &str) -> String {
    inv.find_by_mac(mac)
        .map(|comp| comp.id.clone())
        .unwrap_or_else(|| mac.to_string())
}

fn nid_binding(inv: &InventoryState, nid: i64) -> String {
    inv.find_by_nid(nid)
        .map(|comp| comp.id.clone())
        .unwrap_or_else(|| nid_name(nid))
}

/// POST semantics: first wins.  If the binding the request would write (or
/// the image it would register, for an image-only request) already exists,
/// the request fails naming the conflicting item and nothing is stored.
pub fn store_new<D: KvStore>(ds: &mut D, inv: &InventoryState, bp: &BootParams) -> Result<()> {
    let existing = if !bp.hosts.is_empty() {
        bp.hosts.iter().find(|h| host_exists(ds, h)).cloned()
    } else if !bp.macs.is_empty() {
        bp.macs
            .iter()
            .find(|m| host_exists(ds, &mac_binding(inv, m)))
            .cloned()
    } else if !bp.nids.is_empty() {
        bp.nids
            .iter()
            .find(|n| host_exists(ds, &nid_binding(inv, **n)))
            .map(|n| n.to_string())
    } else if !bp.kernel.is_empty() {
        images::find_image(ds, &bp.kernel, KERNEL_IMAGE_TYPE)?.map(|_| bp.kernel.clone())
    } else if !bp.initrd.is_empty() {
        images::find_image(ds, &bp.initrd, INITRD_IMAGE_TYPE)?.map(|_| bp.initrd.clone())
    } else {
        None
    };
    match existing {
        Some(item) => error::AlreadyExistsSnafu { item }.fail(),
        None => store(ds, inv, bp),
    }
}

/// PUT semantics: registers any named images and overwrites the boot data
/// of every binding in the first non-empty selector branch.  With no
/// bindings at all, a kernel (else initrd) path rewrites that image's own
/// `params` instead.
pub fn store<D: KvStore>(ds: &mut D, inv: &InventoryState, bp: &BootParams) -> Result<()> {
    let kernel_id = if !bp.kernel.is_empty() {
        images::store_image(ds, &bp.kernel, KERNEL_IMAGE_TYPE)?
    } else {
        String::new()
    };
    let initrd_id = if !bp.initrd.is_empty() {
        images::store_image(ds, &bp.initrd, INITRD_IMAGE_TYPE)?
    } else {
        String::new()
    };

    let bd = BootDataStore {
        params: bp.params.clone(),
        kernel: kernel_id.clone(),
        initrd: initrd_id.clone(),
        cloud_init: bp.cloud_init.clone(),
    };

    if !bp.hosts.is_empty() {
        for h in &bp.hosts {
            store_entry(ds, &params_key(h), &bd)?;
        }
    } else if !bp.macs.is_empty() {
        for m in &bp.macs {
            store_entry(ds, &params_key(&mac_binding(inv, m)), &bd)?;
        }
    } else if !bp.nids.is_empty() {
        for n in &bp.nids {
            store_entry(ds, &params_key(&nid_binding(inv, *n)), &bd)?;
        }
    } else if !kernel_id.is_empty() {
        let idata = ImageData {
            path: bp.kernel.clone(),
            params: bp.params.clone(),
        };
        store_entry(ds, &kernel_id, &idata)?;
    } else if !initrd_id.is_empty() {
        let idata = ImageData {
            path: bp.initrd.clone(),
            params: bp.params.clone(),
        };
        store_entry(ds, &initrd_id, &idata)?;
    } else {
        return error::NothingToStoreSnafu.fail();
    }
    Ok(())
}

/// PATCH semantics: updates entries without nulling out existing fields.
/// Every target binding must already exist; a miss fails the request before
/// anything is written.  Image ids are allocated up front, so a later
/// failure can leave an orphan image behind; orphans stay listable until
/// deleted.
pub fn update<D: KvStore>(ds: &mut D, inv: &InventoryState, bp: &BootParams) -> Result<()> {
    let kernel_id = if !bp.kernel.is_empty() {
        images::store_image(ds, &bp.kernel, KERNEL_IMAGE_TYPE)?
    } else {
        String::new()
    };
    let initrd_id = if !bp.initrd.is_empty() {
        images::store_image(ds, &bp.initrd, INITRD_IMAGE_TYPE)?
    } else {
        String::new()
    };

    // Unlike store(), every selector list contributes targets; a request
    // may name hosts, MACs and NIDs together.
    let mut host_map: Vec<(String, BootDataStore)> = Vec::new();
    for h in &bp.hosts {
        add_update_target(ds, &mut host_map, h, None)?;
    }
    for m in &bp.macs {
        match inv.find_by_mac(m) {
            Some(comp) => {
                let id = comp.id.clone();
                add_update_target(ds, &mut host_map, &id, Some(m))?;
            }
            None => add_update_target(ds, &mut host_map, m, None)?,
        }
    }
    for n in &bp.nids {
        let alt = nid_name(*n);
        match inv.find_by_nid(*n) {
            Some(comp) => {
                let id = comp.id.clone();
                add_update_target(ds, &mut host_map, &id, Some(&alt))?;
            }
            None => add_update_target(ds, &mut host_map, &alt, None)?,
        }
    }

    if !host_map.is_empty() {
        for (h, mut bds) in host_map {
            let mut updated = false;
            if !bp.params.is_empty() && bp.params != bds.params {
                bds.params = bp.params.clone();
                updated = true;
            }
            if !bp.kernel.is_empty() && kernel_id != bds.kernel {
                bds.kernel = kernel_id.clone();
                updated = true;
            }
            if !bp.initrd.is_empty() && initrd_id != bds.initrd {
                bds.initrd = initrd_id.clone();
                updated = true;
            }
            if cloudinit::update_cloud_init(&mut bds.cloud_init, &bp.cloud_init) {
                updated = true;
            }
            if updated {
                store_entry(ds, &params_key(&h), &bds)?;
            }
        }
    } else if !kernel_id.is_empty() {
        // No bindings named: the request updates the parameters stored with
        // the kernel image itself.
        let idata = ImageData {
            path: bp.kernel.clone(),
            params: bp.params.clone(),
        };
        store_entry(ds, &kernel_id, &idata)?;
    } else if !initrd_id.is_empty() {
        let idata = ImageData {
            path: bp.initrd.clone(),
            params: bp.params.clone(),
        };
        store_entry(ds, &initrd_id, &idata)?;
    }
    Ok(())
}

/// Reads one PATCH target into the host map, trying the alternate binding
/// when the primary has no entry.  Duplicate targets collapse to one.
fn add_update_target<D: KvStore>(
    ds: &D,
    host_map: &mut Vec<(String, BootDataStore)>,
    name: &str,
    alt: Option<&str>,
) -> Result<()> {
    if host_map.iter().any(|(h, _)| h == name) {
        return Ok(());
    }
    match lookup_host(ds, name) {
        Ok(bds) => {
            host_map.push((name.to_string(), bds));
            Ok(())
        }
        Err(e) => match alt {
            Some(alt) if alt != name => {
                if host_map.iter().any(|(h, _)| h == alt) {
                    return Ok(());
                }
                let bds = lookup_host(ds, alt)?;
                host_map.push((alt.to_string(), bds));
                Ok(())
            }
            _ => Err(e),
        },
    }
}

/// DELETE semantics: removes every named binding and every named image
/// (with reference cleanup).  MACs the inventory cannot resolve are
/// skipped.  Per-item failures do not stop the walk; the first error is
/// surfaced at the end.
pub fn remove<D: KvStore>(
    ds: &mut D,
    cache: &mut ImageCache,
    inv: &InventoryState,
    bp: &BootParams,
) -> Result<()> {
    let mut first_err: Option<Error> = None;
    for h in &bp.hosts {
        accumulate(&mut first_err, remove_host(ds, h));
    }
    for m in &bp.macs {
        // A MAC the inventory cannot resolve names no binding to delete;
        // NIDs below fall back to their nid<N> binding, MACs do not.
        if let Some(comp) = inv.find_by_mac(m) {
            let id = comp.id.clone();
            accumulate(&mut first_err, remove_host(ds, &id));
        }
    }
    for n in &bp.nids {
        accumulate(&mut first_err, remove_host(ds, &nid_binding(inv, *n)));
    }
    accumulate(
        &mut first_err,
        images::remove_image(ds, cache, &bp.kernel, KERNEL_IMAGE_TYPE),
    );
    accumulate(
        &mut first_err,
        images::remove_image(ds, cache, &bp.initrd, INITRD_IMAGE_TYPE),
    );
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn accumulate(first_err: &mut Option<Error>, result: Result<()>) {
    if let Err(e) = result {
        warn!("removal step failed: {}", e);
        if first_err.is_none() {
            *first_err = Some(e);
        }
    }
}

fn remove_host<D: KvStore>(ds: &mut D, name: &str) -> Result<()> {
    let key = params_key(name);
    match ds.get(&key).context(error::StorageSnafu { op: "get" })? {
        Some(_) => ds
            .delete(&key)
            .context(error::StorageSnafu { op: "delete" }),
        None => error::BindingNotFoundSnafu { name }.fail(),
    }
}

/// Converts stored boot data to its external form by dereferencing the
/// kernel and initrd ids.  A dangling reference leaves the image empty; the
/// caller observes it as "no path".
pub fn bd_convert<D: KvStore>(ds: &D, cache: &mut ImageCache, bds: &BootDataStore) -> BootData {
    let mut ret = BootData {
        params: bds.params.clone(),
        cloud_init: bds.cloud_init.clone(),
        ..Default::default()
    };
    if !bds.kernel.is_empty() {
        match images::get_image(ds, cache, &bds.kernel) {
            Ok(imdata) => ret.kernel = imdata,
            Err(e) => debug!("dangling kernel reference {}: {}", bds.kernel, e),
        }
    }
    if !bds.initrd.is_empty() {
        match images::get_image(ds, cache, &bds.initrd) {
            Ok(imdata) => ret.initrd = imdata,
            Err(e) => debug!("dangling initrd reference {}: {}", bds.initrd, e),
        }
    }
    ret
}

/// The fallback resolver: probes, in order, the primary name, the alternate
/// identity it was requested under, the component's role tag, and the
/// default tag, returning the boot data of the first binding that exists.
/// Empty probes are filtered out so a blank role never causes a lookup of
/// the `""` binding.
pub fn lookup<D: KvStore>(
    ds: &D,
    cache: &mut ImageCache,
    name: &str,
    alt_name: &str,
    role: &str,
    default_tag: &str,
) -> BootData {
    let mut probes: Vec<&str> = Vec::with_capacity(4);
    probes.push(name);
    if alt_name != name {
        probes.push(alt_name);
    }
    probes.push(role);
    probes.push(default_tag);

    for probe in probes.into_iter().filter(|p| !p.is_empty()) {
        if let Ok(bds) = lookup_host(ds, probe) {
            return bd_convert(ds, cache, &bds);
        }
    }
    debug!("boot data for {} not available", name);
    BootData::default()
}

/// Looks up boot data for a host name, which may be an xname, an alias the
/// inventory knows, or a raw binding name.
pub fn lookup_by_name<D: KvStore>(
    ds: &D,
    cache: &mut ImageCache,
    inv: &InventoryState,
    name: &str,
) -> (BootData, Component) {
    let (comp_name, role, comp) = match inv.find_by_name(name) {
        Some(comp) => (comp.id.clone(), comp.role.clone(), comp.clone()),
        None => (name.to_string(), String::new(), Component::default()),
    };
    (
        lookup(ds, cache, &comp_name, name, &role, DEFAULT_TAG),
        comp,
    )
}

pub fn lookup_by_mac<D: KvStore>(
    ds: &D,
    cache: &mut ImageCache,
    inv: &InventoryState,
    mac: &str,
) -> (BootData, Component) {
    let (comp_name, role, comp) = match inv.find_by_mac(mac) {
        Some(comp) => (comp.id.clone(), comp.role.clone(), comp.clone()),
        None => (mac.to_string(), String::new(), Component::default()),
    };
    (lookup(ds, cache, &comp_name, mac, &role, DEFAULT_TAG), comp)
}

pub fn lookup_by_nid<D: KvStore>(
    ds: &D,
    cache: &mut ImageCache,
    inv: &InventoryState,
    nid: i64,
) -> (BootData, Component) {
    let nid_str = nid_name(nid);
    let (comp_name, role, comp) = match inv.find_by_nid(nid) {
        Some(comp) => (comp.id.clone(), comp.role.clone(), comp.clone()),
        None => (nid_str.clone(), String::new(), Component::default()),
    };
    (
        lookup(ds, cache, &comp_name, &nid_str, &role, DEFAULT_TAG),
        comp,
    )
}

/// Reads a tag binding directly, bypassing the fallback chain.
pub fn lookup_by_role<D: KvStore>(
    ds: &D,
    cache: &mut ImageCache,
    role: &str,
) -> Result<BootData> {
    let bds = lookup_host(ds, role)?;
    Ok(bd_convert(ds, cache, &bds))
}

/// Boot data stored under the `Global` tag.
pub fn lookup_global<D: KvStore>(ds: &D, cache: &mut ImageCache) -> Result<BootData> {
    lookup_by_role(ds, cache, GLOBAL_TAG)
}

//! Boot handling for nodes the inventory does not know.
//!
//! A node is treated as unknown when the state manager has no record of it,
//! when its component is disabled, or when its resolved boot data names no
//! kernel.  Such nodes boot a discovery image registered under the
//! `Unknown-<arch>` tag for their architecture; a node whose architecture
//! has not been reported yet is sent back through iPXE's `${buildarch}`
//! expansion first.

use datastore::{KvPair, KvStore, KEY_MAX, KEY_MIN};
use snafu::{ensure, ResultExt};

use crate::config::Config;
use crate::error::{self, Result};
use crate::images::ImageCache;
use crate::model::{BootData, Component};
use crate::store::{self, lookup_host, PARAMS_PFX, UNKNOWN_PREFIX};

/// What the caller should serve an unknown node.
#[derive(Debug)]
pub enum DiscoveryOutcome {
    /// Inventory refresh in progress: emit a delayed chain so the node
    /// retries once new state has landed.
    Delayed,
    /// Architecture not reported yet: emit a bare chain request carrying
    /// `${buildarch}`.
    ProbeArch,
    /// Boot data resolved from the node's `Unknown-<arch>` tag.
    Resolved(BootData),
}

/// Every `Unknown-<arch>` binding, for any architecture.
fn unknown_keys<D: KvStore>(ds: &D) -> Result<Vec<KvPair>> {
    let base = format!("{}{}", PARAMS_PFX, UNKNOWN_PREFIX);
    ds.get_range(&format!("{}{}", base, KEY_MIN), &format!("{}{}", base, KEY_MAX))
        .context(error::StorageSnafu {
            op: "list unknown tags",
        })
}

/// Decides how to boot an unknown node.  `retrieving` reflects whether an
/// inventory refresh is in flight.
pub fn discover<D: KvStore>(
    ds: &D,
    cache: &mut ImageCache,
    retrieving: bool,
    arch: &str,
    descr: &str,
) -> Result<DiscoveryOutcome> {
    if retrieving {
        info!("{}: delaying while hardware state is retrieved", descr);
        return Ok(DiscoveryOutcome::Delayed);
    }
    ensure!(
        !unknown_keys(ds)?.is_empty(),
        error::NoUnknownConfigSnafu { descr }
    );
    if arch.is_empty() {
        info!("{}: requesting architecture of unknown host", descr);
        return Ok(DiscoveryOutcome::ProbeArch);
    }
    let tag = format!("{}{}", UNKNOWN_PREFIX, arch);
    Ok(DiscoveryOutcome::Resolved(store::lookup(
        ds, cache, &tag, "", "", "",
    )))
}

/// Builds the chain line an unknown node uses to call back: its identity,
/// the architecture iPXE reports via `${buildarch}`, and the timestamp that
/// lets the server notice stale state.
pub fn discovery_chain(config: &Config, mac: &str, name: &str, nid: i64, ts: i64) -> String {
    let mut chain = format!("chain {}/boot/v1/bootscript", config.chain_base());
    if !mac.is_empty() {
        chain.push_str(&format!("?mac={}", mac));
    } else if !name.is_empty() {
        chain.push_str(&format!("?name={}", name));
    } else if nid >= 0 {
        chain.push_str(&format!("?nid={}", nid));
    } else {
        // Nothing identified the requester; let iPXE fill in its own MAC.
        chain.push_str("?mac=${net/net0}");
    }
    chain.push_str(&format!("&arch=${{buildarch}}&ts={}", ts));
    chain
}

/// Applies the blocklist policy.  A component whose role is blocked is
/// still served when a binding exists for the node itself or for its role;
/// the blocklist only withholds the catch-all defaults.
pub fn blocklist_check<D: KvStore>(
    ds: &D,
    blocked_roles: &[String],
    comp: &Component,
) -> Result<()> {
    let blocked = blocked_roles
        .iter()
        .any(|role| role.eq_ignore_ascii_case(&comp.role));
    if !blocked {
        return Ok(());
    }
    if lookup_host(ds, &comp.id).is_ok() {
        return Ok(());
    }
    if !comp.role.is_empty() && lookup_host(ds, &comp.role).is_ok() {
        return Ok(());
    }
    error::BlockedSnafu {
        id: comp.id.clone(),
        role: comp.role.clone(),
    }
    .fail()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::Error;
    use crate::inventory::InventoryState;
    use crate::model::BootParams;
    use datastore::MemoryKvStore;

    fn store_unknown(ds: &mut MemoryKvStore, arch: &str) {
        let bp = BootParams {
            hosts: vec![format!("{}{}", UNKNOWN_PREFIX, arch)],
            params: "discovery".to_string(),
            kernel: "http://img/discovery-k".to_string(),
            ..Default::default()
        };
        store::store(ds, &InventoryState::default(), &bp).unwrap();
    }

    #[test]
    fn test_discover_delays_while_retrieving() {
        let ds = MemoryKvStore::new();
        let mut cache = ImageCache::new();
        // Retrieval wins even when no unknown configuration exists yet.
        let outcome = discover(&ds, &mut cache, true, "", "descr").unwrap();
        assert!(matches!(outcome, DiscoveryOutcome::Delayed));
    }

    #[test]
    fn test_discover_requires_unknown_config() {
        let ds = MemoryKvStore::new();
        let mut cache = ImageCache::new();
        let err = discover(&ds, &mut cache, false, "x86_64", "MAC de:ad").unwrap_err();
        assert!(matches!(err, Error::NoUnknownConfig { .. }));
        assert_eq!(
            err.to_string(),
            "MAC de:ad: no configuration available for unknown hosts"
        );
    }

    #[test]
    fn test_discover_probes_architecture() {
        let mut ds = MemoryKvStore::new();
        let mut cache = ImageCache::new();
        store_unknown(&mut ds, "x86_64");
        let outcome = discover(&ds, &mut cache, false, "", "descr").unwrap();
        assert!(matches!(outcome, DiscoveryOutcome::ProbeArch));
    }

    #[test]
    fn test_discover_resolves_architecture_tag() {
        let mut ds = MemoryKvStore::new();
        let mut cache = ImageCache::new();
        store_unknown(&mut ds, "x86_64");

        match discover(&ds, &mut cache, false, "x86_64", "descr").unwrap() {
            DiscoveryOutcome::Resolved(bd) => {
                assert_eq!(bd.kernel.path, "http://img/discovery-k");
                assert_eq!(bd.params, "discovery");
            }
            outcome => panic!("unexpected outcome: {:?}", outcome),
        }

        // An architecture with no tag resolves to empty boot data; the
        // builder then rejects it as not configured.
        match discover(&ds, &mut cache, false, "arm64", "descr").unwrap() {
            DiscoveryOutcome::Resolved(bd) => assert_eq!(bd.kernel.path, ""),
            outcome => panic!("unexpected outcome: {:?}", outcome),
        }
    }

    #[test]
    fn test_discovery_chain_identity_precedence() {
        let config = Config::default();
        assert_eq!(
            discovery_chain(&config, "aa:bb", "x0", 1, 7),
            "chain https://api-gw-service-nmn.local/apis/bss/boot/v1/bootscript\
             ?mac=aa:bb&arch=${buildarch}&ts=7"
        );
        assert_eq!(
            discovery_chain(&config, "", "x0", 1, 7),
            "chain https://api-gw-service-nmn.local/apis/bss/boot/v1/bootscript\
             ?name=x0&arch=${buildarch}&ts=7"
        );
        assert_eq!(
            discovery_chain(&config, "", "", 1, 7),
            "chain https://api-gw-service-nmn.local/apis/bss/boot/v1/bootscript\
             ?nid=1&arch=${buildarch}&ts=7"
        );
        assert_eq!(
            discovery_chain(&config, "", "", -1, 7),
            "chain https://api-gw-service-nmn.local/apis/bss/boot/v1/bootscript\
             ?mac=${net/net0}&arch=${buildarch}&ts=7"
        );
    }

    #[test]
    fn test_blocklist() {
        let mut ds = MemoryKvStore::new();
        let blocked = vec!["Management".to_string()];
        let comp = Component {
            id: "x3000c0s1b0n0".to_string(),
            role: "Management".to_string(),
            ..Default::default()
        };

        // Blocked role, no specific binding: refused.
        let err = blocklist_check(&ds, &blocked, &comp).unwrap_err();
        assert!(matches!(err, Error::Blocked { .. }));

        // A role binding lifts the block.
        let bp = BootParams {
            hosts: vec!["Management".to_string()],
            kernel: "http://img/k".to_string(),
            ..Default::default()
        };
        store::store(&mut ds, &InventoryState::default(), &bp).unwrap();
        blocklist_check(&ds, &blocked, &comp).unwrap();

        // Unblocked roles never consult the store.
        let other = Component {
            role: "Compute".to_string(),
            ..Default::default()
        };
        blocklist_check(&MemoryKvStore::new(), &blocked, &other).unwrap();
    }
}

//! In-memory store backing the boot server and its tests.
//!
//! Keys live in a `BTreeMap`, so range scans are a native ordered-map range
//! rather than a filtered walk.  The distributed lock degenerates to lease
//! bookkeeping: within one process the caller's outer lock already
//! serialises contenders, but the lease rules are enforced so that callers
//! exercise the same contract a cluster-backed store would hold them to.

use std::collections::BTreeMap;
use std::ops::Bound::Included;
use std::time::{Duration, Instant};

use super::error::{self, Result};
use super::{KvPair, KvStore};

#[derive(Debug, Default)]
pub struct MemoryKvStore {
    data: BTreeMap<String, String>,
    lock_expires: Option<Instant>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Default::default()
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.data.get(key).cloned())
    }

    fn store(&mut self, key: &str, value: &str) -> Result<()> {
        self.data.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<()> {
        match self.data.remove(key) {
            Some(_) => Ok(()),
            None => error::KeyNotFoundSnafu { key }.fail(),
        }
    }

    fn get_range(&self, first: &str, last: &str) -> Result<Vec<KvPair>> {
        if first > last {
            return Ok(Vec::new());
        }
        Ok(self
            .data
            .range::<str, _>((Included(first), Included(last)))
            .map(|(key, value)| KvPair {
                key: key.clone(),
                value: value.clone(),
            })
            .collect())
    }

    fn dist_lock(&mut self, lease: Duration) -> Result<()> {
        let now = Instant::now();
        if let Some(expires) = self.lock_expires {
            // An expired lease belongs to a holder that went away; take over.
            if expires > now {
                return error::LockHeldSnafu {
                    remaining_ms: (expires - now).as_millis(),
                }
                .fail();
            }
        }
        self.lock_expires = Some(now + lease);
        Ok(())
    }

    fn dist_unlock(&mut self) -> Result<()> {
        match self.lock_expires.take() {
            Some(_) => Ok(()),
            None => error::NotLockedSnafu.fail(),
        }
    }
}

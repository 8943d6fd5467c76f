//! Incremental updates of cloud-init payloads.
//!
//! PATCH requests carry partial cloud-init documents.  The `meta-data` and
//! `user-data` sub-documents follow RFC 7396 JSON Merge Patch: a key with a
//! `null` value removes that key, nested objects merge recursively, and
//! arrays replace wholesale.  The `phone-home` record is too small to merge
//! field-wise; any non-empty incoming record replaces it entirely.

use crate::model::CloudInit;
use serde_json::Value;

/// Merges `incoming` cloud-init data into `existing`, returning whether
/// anything changed.  Callers use the result to decide whether the owning
/// entry needs to be persisted again.
pub fn update_cloud_init(existing: &mut CloudInit, incoming: &CloudInit) -> bool {
    let mut changed = update_cloud_data(&mut existing.meta_data, &incoming.meta_data);
    changed = update_cloud_data(&mut existing.user_data, &incoming.user_data) || changed;
    if !incoming.phone_home.is_empty() && incoming.phone_home != existing.phone_home {
        existing.phone_home = incoming.phone_home.clone();
        changed = true;
    }
    changed
}

/// Applies one merge-patch sub-document.  An empty patch never changes
/// anything; a patch over empty existing data is adopted verbatim.
fn update_cloud_data(existing: &mut Option<Value>, incoming: &Option<Value>) -> bool {
    let patch = match incoming {
        Some(value) if !is_empty_value(value) => value,
        _ => return false,
    };
    match existing {
        Some(current) if !is_empty_value(current) => {
            let mut patched = current.clone();
            json_patch::merge(&mut patched, patch);
            if patched != *current {
                debug!("cloud-init data patched: {} -> {}", current, patched);
                *existing = Some(patched);
                true
            } else {
                false
            }
        }
        _ => {
            *existing = Some(patch.clone());
            true
        }
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

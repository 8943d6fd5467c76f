//! Wire and storage types served by the boot server.
use serde::{Deserialize, Serialize};
use serde_json::Value;

// Note: the field renames below pin the JSON names other cluster services
// already rely on; empty fields are omitted everywhere so that stored
// entries and API responses only carry the data that was actually set.

/// Boot parameters as they appear on the wire: a set of target bindings
/// (hosts, MAC addresses, or NIDs, honoured in that order of precedence)
/// plus the boot data to associate with them.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BootParams {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub macs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nids: Vec<i64>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub params: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kernel: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub initrd: String,
    #[serde(
        default,
        rename = "cloud-init",
        skip_serializing_if = "CloudInit::is_empty"
    )]
    pub cloud_init: CloudInit,
}

/// Cloud-init payload attached to a binding.  `meta-data` and `user-data`
/// are opaque JSON sub-documents owned by the booted image's cloud-init;
/// the server only merges and serves them.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CloudInit {
    #[serde(
        default,
        rename = "meta-data",
        skip_serializing_if = "Option::is_none"
    )]
    pub meta_data: Option<Value>,
    #[serde(
        default,
        rename = "user-data",
        skip_serializing_if = "Option::is_none"
    )]
    pub user_data: Option<Value>,
    #[serde(
        default,
        rename = "phone-home",
        skip_serializing_if = "PhoneHome::is_empty"
    )]
    pub phone_home: PhoneHome,
}

impl CloudInit {
    pub fn is_empty(&self) -> bool {
        self.meta_data.is_none() && self.user_data.is_none() && self.phone_home.is_empty()
    }
}

/// Host keys and identity reported back by a booted node's cloud-init
/// phone-home module.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PhoneHome {
    #[serde(
        default,
        rename = "pub_key_dsa",
        skip_serializing_if = "String::is_empty"
    )]
    pub public_key_dsa: String,
    #[serde(
        default,
        rename = "pub_key_rsa",
        skip_serializing_if = "String::is_empty"
    )]
    pub public_key_rsa: String,
    #[serde(
        default,
        rename = "pub_key_ecdsa",
        skip_serializing_if = "String::is_empty"
    )]
    pub public_key_ecdsa: String,
    #[serde(
        default,
        rename = "pub_key_ed25519",
        skip_serializing_if = "String::is_empty"
    )]
    pub public_key_ed25519: String,
    #[serde(
        default,
        rename = "instance_id",
        skip_serializing_if = "String::is_empty"
    )]
    pub instance_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub fqdn: String,
}

impl PhoneHome {
    pub fn is_empty(&self) -> bool {
        self.public_key_dsa.is_empty()
            && self.public_key_rsa.is_empty()
            && self.public_key_ecdsa.is_empty()
            && self.public_key_ed25519.is_empty()
            && self.instance_id.is_empty()
            && self.hostname.is_empty()
            && self.fqdn.is_empty()
    }
}

/// A registered kernel or initrd image.  `path` is a URL or path the booting
/// node can fetch; `params` is a kernel-argument fragment appended to any
/// binding that references this image.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageData {
    pub path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub params: String,
}

/// Boot data as persisted under a `/params/` binding.  `kernel` and `initrd`
/// hold image storage keys, not paths.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BootDataStore {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub params: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kernel: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub initrd: String,
    #[serde(
        default,
        rename = "cloud-init",
        skip_serializing_if = "CloudInit::is_empty"
    )]
    pub cloud_init: CloudInit,
}

/// Boot data with the image keys dereferenced to their registry entries.
/// Built per request by the resolver; never persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BootData {
    pub params: String,
    pub kernel: ImageData,
    pub initrd: ImageData,
    pub cloud_init: CloudInit,
}

/// Component record returned by the hardware state manager.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Component {
    #[serde(default, rename = "ID", skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, rename = "Role", skip_serializing_if = "String::is_empty")]
    pub role: String,
    #[serde(default, rename = "NID", skip_serializing_if = "Option::is_none")]
    pub nid: Option<i64>,
    #[serde(default, rename = "MAC", skip_serializing_if = "Vec::is_empty")]
    pub mac: Vec<String>,
    #[serde(default, rename = "EndpointEnabled")]
    pub endpoint_enabled: bool,
    #[serde(default, rename = "Fqdn", skip_serializing_if = "String::is_empty")]
    pub fqdn: String,
}

/// Composite debugging dump served by `/dumpstate`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StateDump {
    #[serde(rename = "Components")]
    pub components: Vec<Component>,
    #[serde(rename = "Params")]
    pub params: Vec<BootParams>,
}

/// Renders a NID the way it is used as a binding key, e.g. `nid42`.
pub fn nid_name(nid: i64) -> String {
    format!("nid{}", nid)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_empty_fields_are_omitted() {
        let bp = BootParams {
            hosts: vec!["x0".to_string()],
            params: "quiet".to_string(),
            ..Default::default()
        };
        let json = serde_json::to_value(&bp).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"hosts": ["x0"], "params": "quiet"})
        );
    }

    #[test]
    fn test_cloud_init_round_trip() {
        let json = serde_json::json!({
            "meta-data": {"shire": "hobbiton"},
            "user-data": {"a": 1},
            "phone-home": {"pub_key_rsa": "ssh-rsa AAAA", "fqdn": "x0.local"}
        });
        let ci: CloudInit = serde_json::from_value(json.clone()).unwrap();
        assert!(!ci.is_empty());
        assert_eq!(ci.phone_home.public_key_rsa, "ssh-rsa AAAA");
        assert_eq!(serde_json::to_value(&ci).unwrap(), json);
    }

    #[test]
    fn test_nid_name() {
        assert_eq!(nid_name(0), "nid0");
        assert_eq!(nid_name(1042), "nid1042");
    }
}

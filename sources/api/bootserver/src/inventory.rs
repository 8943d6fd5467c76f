//! Hardware inventory: a snapshot of the state manager's component records
//! and the client that refreshes it.
//!
//! The server never queries the state manager on the request path; every
//! lookup hits the local snapshot.  A refresh replaces the snapshot
//! wholesale, and the `retrieving` flag lets the discovery flow tell a
//! booting node to come back once new state has landed.

use std::collections::HashMap;

use serde::Deserialize;
use snafu::{ensure, ResultExt, Snafu};

use crate::model::Component;

#[derive(Debug, Default)]
pub struct InventoryState {
    components: Vec<Component>,
    by_name: HashMap<String, usize>,
    by_mac: HashMap<String, usize>,
    by_nid: HashMap<i64, usize>,
    /// Unix timestamp of the last completed refresh.
    pub timestamp: i64,
    /// True while a refresh task is fetching new state.
    pub retrieving: bool,
}

impl InventoryState {
    pub fn new(components: Vec<Component>) -> Self {
        let mut state = InventoryState {
            components,
            ..Default::default()
        };
        state.reindex();
        state
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    /// Installs a freshly fetched component list and clears `retrieving`.
    pub fn replace(&mut self, components: Vec<Component>, timestamp: i64) {
        self.components = components;
        self.reindex();
        self.timestamp = timestamp;
        self.retrieving = false;
    }

    fn reindex(&mut self) {
        self.by_name.clear();
        self.by_mac.clear();
        self.by_nid.clear();
        for (i, comp) in self.components.iter().enumerate() {
            if !comp.id.is_empty() {
                self.by_name.insert(comp.id.clone(), i);
            }
            if !comp.fqdn.is_empty() {
                self.by_name.insert(comp.fqdn.clone(), i);
            }
            for mac in &comp.mac {
                // The state manager sometimes reports an empty string in the
                // MAC list.
                if !mac.is_empty() {
                    self.by_mac.insert(mac.to_ascii_lowercase(), i);
                }
            }
            if let Some(nid) = comp.nid {
                self.by_nid.insert(nid, i);
            }
        }
    }

    /// Finds a component by xname or FQDN.
    pub fn find_by_name(&self, name: &str) -> Option<&Component> {
        self.by_name.get(name).map(|&i| &self.components[i])
    }

    /// Finds a component by MAC address, case-insensitively.
    pub fn find_by_mac(&self, mac: &str) -> Option<&Component> {
        self.by_mac
            .get(&mac.to_ascii_lowercase())
            .map(|&i| &self.components[i])
    }

    pub fn find_by_nid(&self, nid: i64) -> Option<&Component> {
        self.by_nid.get(&nid).map(|&i| &self.components[i])
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Error sending request to state manager at {}: {}", url, source))]
    Request { url: String, source: reqwest::Error },

    #[snafu(display("State manager response for {} was {}", url, status))]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },

    #[snafu(display("Error decoding state manager response: {}", source))]
    Decode { source: reqwest::Error },
}

#[derive(Debug, Deserialize)]
struct ComponentList {
    #[serde(default, rename = "Components")]
    components: Vec<Component>,
}

/// Client for the hardware state manager's component listing.
#[derive(Debug, Clone)]
pub struct InventoryClient {
    base_url: String,
    client: reqwest::Client,
}

impl InventoryClient {
    pub fn new(base_url: &str) -> Self {
        InventoryClient {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub async fn fetch_components(&self) -> Result<Vec<Component>, Error> {
        let url = format!("{}/State/Components", self.base_url);
        let rsp = self
            .client
            .get(&url)
            .send()
            .await
            .context(RequestSnafu { url: url.clone() })?;
        ensure!(
            rsp.status().is_success(),
            StatusSnafu {
                url,
                status: rsp.status(),
            }
        );
        let list: ComponentList = rsp.json().await.context(DecodeSnafu)?;
        Ok(list.components)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn components() -> Vec<Component> {
        vec![
            Component {
                id: "x1000c0s0b0n0".to_string(),
                role: "Compute".to_string(),
                nid: Some(1),
                mac: vec!["".to_string(), "AA:BB:CC:DD:EE:00".to_string()],
                endpoint_enabled: true,
                fqdn: "nid000001.local".to_string(),
            },
            Component {
                id: "x3000c0s1b0n0".to_string(),
                role: "Management".to_string(),
                nid: Some(100001),
                mac: vec!["aa:bb:cc:dd:ee:99".to_string()],
                endpoint_enabled: true,
                ..Default::default()
            },
        ]
    }

    #[test]
    fn test_lookups() {
        let inv = InventoryState::new(components());

        assert_eq!(inv.find_by_name("x1000c0s0b0n0").unwrap().nid, Some(1));
        assert_eq!(
            inv.find_by_name("nid000001.local").unwrap().id,
            "x1000c0s0b0n0"
        );
        assert!(inv.find_by_name("x9999").is_none());

        // MAC matching ignores case; the empty MAC the state manager
        // sometimes reports is never indexed.
        assert_eq!(
            inv.find_by_mac("aa:bb:cc:dd:ee:00").unwrap().id,
            "x1000c0s0b0n0"
        );
        assert!(inv.find_by_mac("").is_none());

        assert_eq!(inv.find_by_nid(100001).unwrap().id, "x3000c0s1b0n0");
        assert!(inv.find_by_nid(7).is_none());
    }

    #[test]
    fn test_replace_reindexes() {
        let mut inv = InventoryState::new(components());
        inv.retrieving = true;

        inv.replace(
            vec![Component {
                id: "x5000c0s0b0n0".to_string(),
                mac: vec!["00:11:22:33:44:55".to_string()],
                endpoint_enabled: true,
                ..Default::default()
            }],
            42,
        );

        assert!(!inv.retrieving);
        assert_eq!(inv.timestamp, 42);
        assert!(inv.find_by_name("x1000c0s0b0n0").is_none());
        assert_eq!(
            inv.find_by_mac("00:11:22:33:44:55").unwrap().id,
            "x5000c0s0b0n0"
        );
    }

    #[tokio::test]
    async fn test_fetch_components() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/State/Components")
            .with_status(200)
            .with_body(
                r#"{"Components":[{"ID":"x0","Role":"Compute","NID":1,"MAC":["aa:bb"],"EndpointEnabled":true}]}"#,
            )
            .create_async()
            .await;

        let client = InventoryClient::new(&server.url());
        let components = client.fetch_components().await.unwrap();
        assert_eq!(components.len(), 1);
        assert_eq!(components[0].id, "x0");
        assert_eq!(components[0].nid, Some(1));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_components_error_status() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/State/Components")
            .with_status(503)
            .create_async()
            .await;

        let client = InventoryClient::new(&server.url());
        let err = client.fetch_components().await.unwrap_err();
        assert!(matches!(err, Error::Status { .. }));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_components_bad_body() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/State/Components")
            .with_status(200)
            .with_body("not json")
            .create_async()
            .await;

        let client = InventoryClient::new(&server.url());
        let err = client.fetch_components().await.unwrap_err();
        assert!(matches!(err, Error::Decode { .. }));
        mock.assert_async().await;
    }
}

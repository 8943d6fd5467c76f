//! Client for the SPIRE join-token service.
//!
//! A short-lived join token lets a booting node's SPIRE agent enrol with
//! the SPIRE server.  Boot parameters reference it as `${SPIRE_JOIN_TOKEN}`
//! in the kernel command line; the script builder fetches one per request.
//!
//! ```text
//! $ curl -k -d xname=x1000c0s0b0n0 $SP/api/token
//! {"join_token":"aecbbf2b-14e5-4e2e-a7b2-864f05a49d0b"}
//! ```

use serde::Deserialize;
use snafu::{ensure, ResultExt, Snafu};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("{}: sending request to spire token service: {}", url, source))]
    Request { url: String, source: reqwest::Error },

    #[snafu(display("{}: reading response from spire token service: {}", url, source))]
    Decode { url: String, source: reqwest::Error },

    #[snafu(display("{}: join token retrieval failed: {}: {}", url, title, detail))]
    NoToken {
        url: String,
        title: String,
        detail: String,
    },
}

// The service reuses problem-details fields for failures, so a single
// response shape covers both outcomes.
#[derive(Debug, Default, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    title: String,
    #[serde(default)]
    detail: String,
    #[serde(default)]
    join_token: String,
}

#[derive(Debug, Clone)]
pub struct SpireTokenClient {
    base_url: String,
    client: reqwest::Client,
}

impl SpireTokenClient {
    pub fn new(base_url: &str) -> Self {
        SpireTokenClient {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Fetches a join token for the given xname.
    pub async fn join_token(&self, xname: &str) -> Result<String, Error> {
        let url = format!("{}/api/token", self.base_url);
        let rsp = self
            .client
            .post(&url)
            .form(&[("xname", xname)])
            .send()
            .await
            .context(RequestSnafu { url: url.clone() })?;
        if !rsp.status().is_success() {
            warn!(
                "{}: spire token service response for {}: {}",
                url,
                xname,
                rsp.status()
            );
        }
        let body: TokenResponse = rsp
            .json()
            .await
            .context(DecodeSnafu { url: url.clone() })?;
        ensure!(
            !body.join_token.is_empty(),
            NoTokenSnafu {
                url,
                title: body.title,
                detail: body.detail,
            }
        );
        Ok(body.join_token)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_join_token() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/token")
            .match_header("content-type", "application/x-www-form-urlencoded")
            .match_body("xname=x1000c0s0b0n0")
            .with_status(200)
            .with_body(r#"{"join_token":"aecbbf2b-14e5-4e2e-a7b2-864f05a49d0b"}"#)
            .create_async()
            .await;

        let client = SpireTokenClient::new(&server.url());
        let token = client.join_token("x1000c0s0b0n0").await.unwrap();
        assert_eq!(token, "aecbbf2b-14e5-4e2e-a7b2-864f05a49d0b");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_join_token_service_failure() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/token")
            .with_status(500)
            .with_body(r#"{"title":"Internal Server Error","detail":"no entry for xname"}"#)
            .create_async()
            .await;

        let client = SpireTokenClient::new(&server.url());
        let err = client.join_token("x0").await.unwrap_err();
        assert!(err.to_string().contains("no entry for xname"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_join_token_undecodable_response() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/token")
            .with_status(200)
            .with_body("not json")
            .create_async()
            .await;

        let client = SpireTokenClient::new(&server.url());
        let err = client.join_token("x0").await.unwrap_err();
        assert!(matches!(err, Error::Decode { .. }));
        mock.assert_async().await;
    }
}

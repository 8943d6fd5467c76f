//! Rewrites object-store image references into URLs iPXE can fetch.
//!
//! Kernel and initrd paths may be `s3://` references.  iPXE cannot speak
//! the S3 API, so at script-build time those are exchanged for presigned
//! HTTPS GET URLs.  The bucket is the URL host; when the host is empty the
//! first path segment is the bucket and the rest is the key.

use std::time::Duration;

use aws_config::BehaviorVersion;
use aws_sdk_s3::presigning::PresigningConfig;
use snafu::Snafu;
use tokio::sync::OnceCell;
use url::Url;

// A booting node may sit in firmware for a long time before fetching the
// images; match the 24 hour validity the rest of the cluster tooling uses.
const PRESIGN_VALIDITY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Failed to presign '{}': {}", url, reason))]
    Presign { url: String, reason: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Generates presigned GET URLs against the ambient AWS environment.
/// Region, credentials and endpoint all come from the standard AWS
/// environment variables.
#[derive(Debug)]
pub struct ObjectStorePresigner {
    client: aws_sdk_s3::Client,
}

impl ObjectStorePresigner {
    pub async fn from_env() -> Self {
        let config = aws_config::load_defaults(BehaviorVersion::latest()).await;
        ObjectStorePresigner {
            client: aws_sdk_s3::Client::new(&config),
        }
    }

    async fn presigned_get(&self, url: &str, bucket: &str, key: &str) -> Result<String> {
        let cfg = match PresigningConfig::expires_in(PRESIGN_VALIDITY) {
            Ok(cfg) => cfg,
            Err(e) => {
                return PresignSnafu {
                    url,
                    reason: e.to_string(),
                }
                .fail()
            }
        };
        let req = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .presigned(cfg)
            .await;
        match req {
            Ok(presigned) => Ok(presigned.uri().to_string()),
            Err(e) => PresignSnafu {
                url,
                reason: e.to_string(),
            }
            .fail(),
        }
    }
}

/// Splits an `s3://` URL into bucket and key.
fn split_s3_url(parsed: &Url) -> (String, String) {
    match parsed.host_str() {
        Some(host) if !host.is_empty() => (
            host.to_string(),
            parsed.path().trim_start_matches('/').to_string(),
        ),
        _ => {
            let trimmed = parsed.path().trim_matches('/');
            match trimmed.split_once('/') {
                Some((bucket, key)) => (bucket.to_string(), key.to_string()),
                None => (trimmed.to_string(), String::new()),
            }
        }
    }
}

/// Returns a URL a booting node can fetch.  Anything that is not an
/// `s3://` reference passes through unchanged; an `s3://` reference is
/// exchanged for a presigned HTTPS URL.  The presigner is created on first
/// use so deployments without an object store never touch the AWS config.
pub async fn check_url(presigner: &OnceCell<ObjectStorePresigner>, u: &str) -> Result<String> {
    let parsed = match Url::parse(u) {
        Ok(parsed) if parsed.scheme().eq_ignore_ascii_case("s3") => parsed,
        _ => return Ok(u.to_string()),
    };
    let (bucket, key) = split_s3_url(&parsed);
    let presigner = presigner.get_or_init(ObjectStorePresigner::from_env).await;
    presigner.presigned_get(u, &bucket, &key).await
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_split_s3_url() {
        let parsed = Url::parse("s3://boot-images/k8s/kernel").unwrap();
        assert_eq!(
            split_s3_url(&parsed),
            ("boot-images".to_string(), "k8s/kernel".to_string())
        );

        // Host-less form: the first path segment is the bucket.
        let parsed = Url::parse("s3:///boot-images/k8s/kernel").unwrap();
        assert_eq!(
            split_s3_url(&parsed),
            ("boot-images".to_string(), "k8s/kernel".to_string())
        );

        let parsed = Url::parse("s3://bucket-only").unwrap();
        assert_eq!(
            split_s3_url(&parsed),
            ("bucket-only".to_string(), "".to_string())
        );
    }

    #[tokio::test]
    async fn test_check_url_passes_through_non_s3() {
        let presigner = OnceCell::new();
        for u in [
            "http://img/kernel",
            "https://img/kernel",
            "tftp://boot/kernel",
            "/var/lib/images/kernel",
            "",
        ] {
            assert_eq!(check_url(&presigner, u).await.unwrap(), u);
        }
        // No s3 URL was seen, so the presigner was never initialised.
        assert!(presigner.get().is_none());
    }
}

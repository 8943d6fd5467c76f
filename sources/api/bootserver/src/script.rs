//! iPXE boot script assembly.
//!
//! The output is a complete iPXE program: fetch the kernel (and initrd, if
//! one is configured) by URL, boot, and on any failure sleep and chain back
//! to this server so the node retries instead of dropping to the firmware
//! prompt.

use snafu::{ensure, OptionExt, ResultExt};
use tokio::sync::OnceCell;

use crate::error::{self, Result};
use crate::model::BootData;
use crate::s3url::{self, ObjectStorePresigner};
use crate::spire::SpireTokenClient;

pub const JOIN_TOKEN_VAR: &str = "${SPIRE_JOIN_TOKEN}";

/// Per-node values injected into the kernel command line.
#[derive(Debug, Default, Clone)]
pub struct ScriptParams {
    pub xname: String,
    pub nid: String,
}

/// True if any space-separated token of `params` begins with `pname`.
/// `pname` includes the `=`, so `xname=` does not match `xnamelike=`.
pub fn param_exists(params: &str, pname: &str) -> bool {
    params.split(' ').any(|tok| tok.starts_with(pname))
}

/// Appends `pname` + `pval` unless a token starting with `pname` is already
/// present; an existing setting always wins over the injected one.
pub fn check_param(params: &str, pname: &str, pval: &str) -> String {
    if !pval.is_empty() && !param_exists(params, pname) {
        format!("{} {}{}", params, pname, pval)
    } else {
        params.to_string()
    }
}

// The kernel command line must not carry its own initrd= argument when iPXE
// supplies the initrd itself.
fn strip_initrd(params: &str) -> String {
    params
        .split(' ')
        .filter(|tok| !tok.starts_with("initrd"))
        .collect::<Vec<_>>()
        .join(" ")
}

pub struct ScriptBuilder<'a> {
    pub advertise_address: &'a str,
    pub retry_delay: u32,
    pub spire: Option<&'a SpireTokenClient>,
    pub presigner: &'a OnceCell<ObjectStorePresigner>,
}

impl ScriptBuilder<'_> {
    /// Constructs the iPXE boot script for resolved boot data.  `chain` is
    /// the verbatim retry line and must already begin with `chain ` followed
    /// by a URL; `descr` names the requester in errors and logs.
    pub async fn build(
        &self,
        bd: &BootData,
        sp: &ScriptParams,
        chain: &str,
        descr: &str,
    ) -> Result<String> {
        ensure!(
            !bd.kernel.path.is_empty(),
            error::NotConfiguredSnafu { descr }
        );

        let mut params = bd.params.clone();
        if !bd.kernel.params.is_empty() {
            params.push(' ');
            params.push_str(&bd.kernel.params);
        }
        if !bd.initrd.params.is_empty() {
            params.push(' ');
            params.push_str(&bd.initrd.params);
        }

        params = check_param(&params, "xname=", &sp.xname);
        params = check_param(&params, "nid=", &sp.nid);
        // Point cloud-init back at this server for its meta-data; images
        // without cloud-init simply ignore the data source argument.
        params = check_param(
            &params,
            "ds=",
            &format!("nocloud-net;s={}/", self.advertise_address),
        );

        if params.contains(JOIN_TOKEN_VAR) {
            let spire = self
                .spire
                .context(error::JoinTokenUnavailableSnafu { descr })?;
            let token = spire
                .join_token(&sp.xname)
                .await
                .context(error::JoinTokenSnafu)?;
            params = params.replace(JOIN_TOKEN_VAR, &token);
        }

        if !bd.initrd.path.is_empty() {
            params = strip_initrd(&params);
            params = format!("initrd=initrd {}", params);
        }

        let kernel_url = s3url::check_url(self.presigner, &bd.kernel.path)
            .await
            .context(error::ObjectStoreSnafu)?;

        let mut script = String::from("#!ipxe\n");
        script.push_str(&format!(
            "kernel --name kernel {} {} || goto boot_retry\n",
            kernel_url,
            params.trim()
        ));
        if !bd.initrd.path.is_empty() {
            let initrd_url = s3url::check_url(self.presigner, &bd.initrd.path)
                .await
                .context(error::ObjectStoreSnafu)?;
            script.push_str(&format!(
                "initrd --name initrd {} || goto boot_retry\n",
                initrd_url
            ));
        }
        script.push_str("boot || goto boot_retry\n:boot_retry\n");
        script.push_str(&format!("sleep {}\n{}\n", self.retry_delay, chain));
        Ok(script)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::Error;
    use crate::model::ImageData;

    fn builder(presigner: &OnceCell<ObjectStorePresigner>) -> ScriptBuilder<'_> {
        ScriptBuilder {
            advertise_address: "https://bss.local/apis/bss",
            retry_delay: 30,
            spire: None,
            presigner,
        }
    }

    fn boot_data() -> BootData {
        BootData {
            params: "console=ttyS0 quiet".to_string(),
            kernel: ImageData {
                path: "http://img/k".to_string(),
                params: "hugepages=512".to_string(),
            },
            initrd: ImageData {
                path: "http://img/i".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn script_params() -> ScriptParams {
        ScriptParams {
            xname: "x1000c0s0b0n0".to_string(),
            nid: "1".to_string(),
        }
    }

    const CHAIN: &str = "chain https://bss.local/apis/bss/boot/v1/bootscript?mac=aa:bb&retry=1";

    #[test]
    fn test_param_exists() {
        assert!(param_exists("quiet xname=x0 nid=1", "xname="));
        assert!(!param_exists("quiet xnamelike=x0", "xname="));
        assert!(!param_exists("", "xname="));
    }

    #[test]
    fn test_check_param() {
        assert_eq!(check_param("quiet", "nid=", "1"), "quiet nid=1");
        // Existing settings win; empty values inject nothing.
        assert_eq!(check_param("quiet nid=7", "nid=", "1"), "quiet nid=7");
        assert_eq!(check_param("quiet", "nid=", ""), "quiet");
    }

    #[tokio::test]
    async fn test_build_full_script() {
        let presigner = OnceCell::new();
        let script = builder(&presigner)
            .build(&boot_data(), &script_params(), CHAIN, "x1000c0s0b0n0")
            .await
            .unwrap();

        assert_eq!(
            script,
            "#!ipxe\n\
             kernel --name kernel http://img/k initrd=initrd console=ttyS0 quiet hugepages=512 \
             xname=x1000c0s0b0n0 nid=1 ds=nocloud-net;s=https://bss.local/apis/bss/ \
             || goto boot_retry\n\
             initrd --name initrd http://img/i || goto boot_retry\n\
             boot || goto boot_retry\n\
             :boot_retry\n\
             sleep 30\n\
             chain https://bss.local/apis/bss/boot/v1/bootscript?mac=aa:bb&retry=1\n"
        );
    }

    #[tokio::test]
    async fn test_build_is_idempotent_and_injection_is_conditional() {
        let presigner = OnceCell::new();
        let b = builder(&presigner);
        let mut bd = boot_data();
        bd.params = "quiet xname=x-other ds=nocloud-net;s=http://elsewhere/".to_string();

        let first = b
            .build(&bd, &script_params(), CHAIN, "descr")
            .await
            .unwrap();
        let second = b
            .build(&bd, &script_params(), CHAIN, "descr")
            .await
            .unwrap();
        assert_eq!(first, second);

        // The pre-existing xname and data source survive unduplicated.
        assert_eq!(first.matches("xname=").count(), 1);
        assert_eq!(first.matches("ds=").count(), 1);
        assert!(first.contains("xname=x-other"));
        assert!(first.contains("ds=nocloud-net;s=http://elsewhere/"));
    }

    #[tokio::test]
    async fn test_build_without_initrd() {
        let presigner = OnceCell::new();
        let mut bd = boot_data();
        bd.initrd = ImageData::default();

        let script = builder(&presigner)
            .build(&bd, &script_params(), CHAIN, "descr")
            .await
            .unwrap();
        assert!(!script.contains("initrd"));
        assert!(script.starts_with("#!ipxe\nkernel --name kernel http://img/k console=ttyS0"));
    }

    #[tokio::test]
    async fn test_build_strips_caller_initrd_argument() {
        let presigner = OnceCell::new();
        let mut bd = boot_data();
        bd.params = "initrd=oldinitrd.img quiet".to_string();

        let script = builder(&presigner)
            .build(&bd, &script_params(), CHAIN, "descr")
            .await
            .unwrap();
        assert!(!script.contains("oldinitrd"));
        assert!(script.contains("initrd=initrd quiet"));
    }

    #[tokio::test]
    async fn test_build_fails_without_kernel() {
        let presigner = OnceCell::new();
        let err = builder(&presigner)
            .build(&BootData::default(), &script_params(), CHAIN, "MAC aa:bb")
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "MAC aa:bb: this host not configured for booting."
        );
    }

    #[tokio::test]
    async fn test_join_token_substitution() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/token")
            .with_status(200)
            .with_body(r#"{"join_token":"tok-123"}"#)
            .create_async()
            .await;

        let presigner = OnceCell::new();
        let spire = SpireTokenClient::new(&server.url());
        let mut b = builder(&presigner);
        b.spire = Some(&spire);

        let mut bd = boot_data();
        bd.params = format!("quiet spire_join_token={}", JOIN_TOKEN_VAR);

        let script = b
            .build(&bd, &script_params(), CHAIN, "descr")
            .await
            .unwrap();
        assert!(script.contains("spire_join_token=tok-123"));
        assert!(!script.contains(JOIN_TOKEN_VAR));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_join_token_failure_fails_the_build() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/token")
            .with_status(500)
            .with_body(r#"{"title":"boom","detail":"no token"}"#)
            .create_async()
            .await;

        let presigner = OnceCell::new();
        let spire = SpireTokenClient::new(&server.url());
        let mut b = builder(&presigner);
        b.spire = Some(&spire);

        let mut bd = boot_data();
        bd.params = format!("token={}", JOIN_TOKEN_VAR);

        let err = b
            .build(&bd, &script_params(), CHAIN, "descr")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::JoinToken { .. }));
    }
}

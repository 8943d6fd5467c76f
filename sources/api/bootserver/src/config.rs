//! Runtime configuration: command line flags layered over the environment.

use argh::FromArgs;
use std::env;

/// Reads an environment variable with a fallback.  A variable defined as
/// the empty string overrides the default with the empty string.
pub fn env_val(var: &str, default: &str) -> String {
    env::var(var).unwrap_or_else(|_| default.to_string())
}

/// Boot script server: serves per-node iPXE boot scripts and the boot
/// parameter store behind them.
#[derive(FromArgs, Debug)]
pub struct Args {
    /// address to listen on for HTTP requests
    #[argh(option, default = "String::from(\"0.0.0.0:27778\")")]
    pub listen: String,

    /// number of HTTP worker threads
    #[argh(option, default = "4")]
    pub threads: usize,

    /// base URL of the hardware state manager
    #[argh(option, default = "String::from(\"http://cray-smd/hsm/v1\")")]
    pub sm_url: String,

    /// base URL of the SPIRE join token service; empty disables join token
    /// substitution
    #[argh(option, default = "String::new()")]
    pub spire_url: String,

    /// seconds a booting node sleeps before retrying a failed boot
    #[argh(option, default = "30")]
    pub retry_delay: u32,

    /// seconds a node waits while hardware state is being retrieved
    #[argh(option, default = "10")]
    pub hsm_retrieval_delay: u32,

    /// component role barred from booting via catch-all defaults; may be
    /// repeated
    #[argh(option, long = "blocked-role")]
    pub blocked_roles: Vec<String>,

    /// log level: off, error, warn, info, debug, trace
    #[argh(option, default = "String::from(\"info\")")]
    pub log_level: String,
}

/// Settled configuration the server runs with.
#[derive(Debug, Clone)]
pub struct Config {
    /// Host boot scripts chain back to; normally the API gateway.
    pub ipxe_server: String,
    pub chain_proto: String,
    pub gw_uri: String,
    /// Address cloud-init on the booted node phones back to.
    pub advertise_address: String,
    pub retry_delay: u32,
    pub hsm_retrieval_delay: u32,
    pub blocked_roles: Vec<String>,
    pub sm_url: String,
    pub spire_url: String,
}

impl Config {
    pub fn new(args: &Args) -> Self {
        let ipxe_server = env_val("BSS_IPXE_SERVER", "api-gw-service-nmn.local");
        let chain_proto = env_val("BSS_CHAIN_PROTO", "https");
        let gw_uri = env_val("BSS_GW_URI", "/apis/bss");
        let default_advertise = format!("{}://{}{}", chain_proto, ipxe_server, gw_uri);
        Config {
            advertise_address: env_val("BSS_ADVERTISE_ADDRESS", &default_advertise),
            ipxe_server,
            chain_proto,
            gw_uri,
            retry_delay: args.retry_delay,
            hsm_retrieval_delay: args.hsm_retrieval_delay,
            blocked_roles: args.blocked_roles.clone(),
            sm_url: args.sm_url.clone(),
            spire_url: args.spire_url.clone(),
        }
    }

    /// Base URL for chain lines, e.g. `https://api-gw-service-nmn.local/apis/bss`.
    pub fn chain_base(&self) -> String {
        format!("{}://{}{}", self.chain_proto, self.ipxe_server, self.gw_uri)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            ipxe_server: "api-gw-service-nmn.local".to_string(),
            chain_proto: "https".to_string(),
            gw_uri: "/apis/bss".to_string(),
            advertise_address: "https://api-gw-service-nmn.local/apis/bss".to_string(),
            retry_delay: 30,
            hsm_retrieval_delay: 10,
            blocked_roles: Vec::new(),
            sm_url: String::new(),
            spire_url: String::new(),
        }
    }
}

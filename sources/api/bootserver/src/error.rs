//! The common error type for the boot server.  The server module maps each
//! variant to the HTTP status it should produce.
use snafu::Snafu;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    // Storage
    #[snafu(display("Key value storage failure during {}: {}", op, source))]
    Storage {
        op: String,
        source: datastore::Error,
    },

    #[snafu(display("Failed to serialize entry for storage: {}", source))]
    StoreSerialization { source: serde_json::Error },

    #[snafu(display("Stored entry at {} is not decodable: {}", key, source))]
    EntryDecode {
        key: String,
        source: serde_json::Error,
    },

    #[snafu(display("Key '{}' does not exist", key))]
    ImageNotFound { key: String },

    #[snafu(display("Error looking up {}: key does not exist", name))]
    BindingNotFound { name: String },

    #[snafu(display("Data store lock poisoned"))]
    DataStoreLock,

    // Validation and conflicts
    #[snafu(display("Already exists: {}", item))]
    AlreadyExists { item: String },

    #[snafu(display("Nothing to Store"))]
    NothingToStore,

    #[snafu(display("Bad Request: {}", source))]
    RequestDecode { source: serde_json::Error },

    #[snafu(display("Bad Request - Invalid nid '{}'", nid))]
    InvalidNid { nid: String },

    #[snafu(display("Need a mac=, name=, or nid= parameter"))]
    MissingSelector,

    #[snafu(display("No specified data requested"))]
    NoSelectors,

    #[snafu(display("Cannot find boot parameters for requested {}", what))]
    NoParamsFound { what: String },

    // Host queries
    #[snafu(display("Not Found - Unknown host name '{}'", name))]
    UnknownName { name: String },

    #[snafu(display("Not Found - Unknown MAC address '{}'", mac))]
    UnknownMac { mac: String },

    #[snafu(display("Not Found - Unknown NID '{}'", nid))]
    UnknownNid { nid: i64 },

    // Boot script generation
    #[snafu(display("{}: this host not configured for booting.", descr))]
    NotConfigured { descr: String },

    #[snafu(display("{}: no configuration available for unknown hosts", descr))]
    NoUnknownConfig { descr: String },

    #[snafu(display("Node {} blocked, role: {}", id, role))]
    Blocked { id: String, role: String },

    #[snafu(display("{}: join token service not configured", descr))]
    JoinTokenUnavailable { descr: String },

    #[snafu(display("Join token retrieval failed: {}", source))]
    JoinToken { source: crate::spire::Error },

    #[snafu(display("Image URL rewrite failed: {}", source))]
    ObjectStore { source: crate::s3url::Error },

    // Inventory
    #[snafu(display("Hardware state retrieval failed: {}", source))]
    Inventory { source: crate::inventory::Error },

    // Serving
    #[snafu(display("Failed to serialize response: {}", source))]
    ResponseSerialization { source: serde_json::Error },

    #[snafu(display("Failed to bind {}: {}", addr, source))]
    BindAddress {
        addr: String,
        source: std::io::Error,
    },

    #[snafu(display("Server startup failed: {}", source))]
    ServerStart { source: std::io::Error },
}

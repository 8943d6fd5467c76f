//! The server module owns the API surface.  It interfaces with the data
//! store through the store, images and discovery modules.

mod routes;

pub use routes::register_routes;

use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

use actix_web::body::BoxBody;
use actix_web::error::ResponseError;
use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer, Responder};
use datastore::MemoryKvStore;
use http::StatusCode;
use serde::Serialize;
use snafu::ResultExt;
use tokio::sync::OnceCell;

use crate::config::Config;
use crate::error::{self, Error, Result};
use crate::images::ImageCache;
use crate::inventory::{InventoryClient, InventoryState};
use crate::model::{BootParams, Component, StateDump};
use crate::s3url::ObjectStorePresigner;
use crate::spire::SpireTokenClient;

/// State shared by every handler.  All persistent data lives in the KV
/// store; the image cache and inventory snapshot are process-local and
/// rebuildable.  The write guard on `ds` is the process-local mutex taken
/// in front of the store's distributed lock.
pub struct SharedData {
    pub(crate) ds: RwLock<MemoryKvStore>,
    pub(crate) image_cache: RwLock<ImageCache>,
    pub(crate) inventory: RwLock<InventoryState>,
    pub(crate) inventory_client: InventoryClient,
    pub(crate) spire: Option<SpireTokenClient>,
    pub(crate) presigner: OnceCell<ObjectStorePresigner>,
    pub(crate) config: Config,
}

impl SharedData {
    pub fn new(config: Config) -> Self {
        let inventory_client = InventoryClient::new(&config.sm_url);
        let spire = if config.spire_url.is_empty() {
            None
        } else {
            Some(SpireTokenClient::new(&config.spire_url))
        };
        SharedData {
            ds: RwLock::new(MemoryKvStore::new()),
            image_cache: RwLock::new(ImageCache::new()),
            inventory: RwLock::new(InventoryState::default()),
            inventory_client,
            spire,
            presigner: OnceCell::new(),
            config,
        }
    }

    /// Builds shared state around a pre-seeded inventory snapshot, current
    /// as of now.  Used at test time in place of a state manager.
    pub fn with_inventory(config: Config, components: Vec<Component>) -> Self {
        let mut inv = InventoryState::new(components);
        inv.timestamp = unix_now();
        SharedData {
            inventory: RwLock::new(inv),
            ..Self::new(config)
        }
    }

    /// True while an inventory refresh is in flight.
    pub(crate) fn check_state(&self) -> bool {
        self.inventory
            .read()
            .map(|inv| inv.retrieving)
            .unwrap_or(false)
    }
}

/// Kicks off a background inventory refresh when the caller's timestamp is
/// newer than the current snapshot.
pub(crate) fn maybe_refresh(data: &web::Data<SharedData>, ts: i64) {
    let stale = data
        .inventory
        .read()
        .map(|inv| !inv.retrieving && ts > inv.timestamp)
        .unwrap_or(false);
    if stale {
        actix_web::rt::spawn(refresh_inventory(data.clone(), ts));
    }
}

/// Replaces the inventory snapshot with fresh state manager data.  The
/// `retrieving` flag is visible to the discovery flow for the duration.
pub(crate) async fn refresh_inventory(data: web::Data<SharedData>, ts: i64) {
    {
        let mut inv = match data.inventory.write() {
            Ok(inv) => inv,
            Err(_) => return,
        };
        if inv.retrieving {
            return;
        }
        inv.retrieving = true;
    }
    debug!("refreshing hardware state");
    match data.inventory_client.fetch_components().await {
        Ok(components) => {
            info!("hardware state refreshed: {} components", components.len());
            if let Ok(mut inv) = data.inventory.write() {
                inv.replace(components, ts);
            }
        }
        Err(e) => {
            warn!("hardware state refresh failed: {}", e);
            if let Ok(mut inv) = data.inventory.write() {
                inv.retrieving = false;
            }
        }
    }
}

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

pub async fn serve(config: Config, listen: &str, threads: usize) -> Result<()> {
    // SharedData gives us a convenient way to make data available to
    // handler methods when it doesn't come from the request itself.
    let shared_data = web::Data::new(SharedData::new(config));

    // Prime the hardware state before accepting requests.  A failure here
    // is tolerated; POST /hosts or a stale bootscript timestamp repairs it.
    refresh_inventory(shared_data.clone(), unix_now()).await;

    let app_data = shared_data.clone();
    let http_server = HttpServer::new(move || {
        App::new()
            .app_data(app_data.clone())
            .configure(register_routes)
    })
    .workers(threads)
    .bind(listen)
    .context(error::BindAddressSnafu { addr: listen })?;

    info!("boot script server listening on {}", listen);
    http_server.run().await.context(error::ServerStartSnafu)
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// RFC 7807 problem details; every error response carries one.
#[derive(Debug, Serialize)]
struct ProblemDetails {
    #[serde(rename = "type")]
    problem_type: &'static str,
    title: String,
    detail: String,
    status: u16,
}

impl ResponseError for Error {
    /// Maps our error types to the HTTP error code they should return.
    fn error_response(&self) -> HttpResponse {
        use Error::*;
        let status_code = match self {
            // 400 Bad Request
            AlreadyExists { .. } => StatusCode::BAD_REQUEST,
            NothingToStore => StatusCode::BAD_REQUEST,
            RequestDecode { .. } => StatusCode::BAD_REQUEST,
            InvalidNid { .. } => StatusCode::BAD_REQUEST,
            MissingSelector => StatusCode::BAD_REQUEST,
            NoSelectors => StatusCode::BAD_REQUEST,

            // 404 Not Found
            BindingNotFound { .. } => StatusCode::NOT_FOUND,
            ImageNotFound { .. } => StatusCode::NOT_FOUND,
            NoParamsFound { .. } => StatusCode::NOT_FOUND,
            UnknownName { .. } => StatusCode::NOT_FOUND,
            UnknownMac { .. } => StatusCode::NOT_FOUND,
            UnknownNid { .. } => StatusCode::NOT_FOUND,
            NotConfigured { .. } => StatusCode::NOT_FOUND,
            NoUnknownConfig { .. } => StatusCode::NOT_FOUND,
            Blocked { .. } => StatusCode::NOT_FOUND,
            JoinTokenUnavailable { .. } => StatusCode::NOT_FOUND,
            JoinToken { .. } => StatusCode::NOT_FOUND,
            ObjectStore { .. } => StatusCode::NOT_FOUND,

            // 500 Internal Server Error
            Storage { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            StoreSerialization { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            EntryDecode { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            DataStoreLock => StatusCode::INTERNAL_SERVER_ERROR,
            Inventory { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ResponseSerialization { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            BindAddress { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ServerStart { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let problem = ProblemDetails {
            problem_type: "about:blank",
            title: status_code
                .canonical_reason()
                .unwrap_or("Error")
                .to_string(),
            detail: self.to_string(),
            status: status_code.as_u16(),
        };
        HttpResponse::build(status_code)
            .content_type("application/problem+json")
            .json(problem)
    }
}

/// Helper macro for implementing the actix-web Responder trait for a type.
/// $for: the type for which we implement Responder.
/// $self: just pass "self"  (macro hygiene requires this)
/// $serialize_expr: the thing to serialize for a response; this is just
///    "self.0" for a newtype over something implementing Serialize
macro_rules! impl_responder_for {
    ($for:ident, $self:ident, $serialize_expr:expr) => (
        impl Responder for $for {
            type Body = BoxBody;
            fn respond_to($self, _req: &HttpRequest) -> HttpResponse {
                let body = match serde_json::to_string(&$serialize_expr) {
                    Ok(s) => s,
                    Err(e) => {
                        return Error::ResponseSerialization { source: e }.error_response()
                    }
                };
                HttpResponse::Ok()
                    .content_type("application/json")
                    .body(body)
            }
        }
    )
}

/// This lets us respond from our handler methods with a list of boot
/// parameters (or Result<list>).
pub(crate) struct BootParamsResponse(pub(crate) Vec<BootParams>);
impl_responder_for!(BootParamsResponse, self, self.0);

/// This lets us respond from our handler methods with the inventory's
/// component records.
pub(crate) struct ComponentsResponse(pub(crate) Vec<Component>);
impl_responder_for!(ComponentsResponse, self, self.0);

/// This lets us respond from our handler methods with the composite
/// debugging dump.
pub(crate) struct DumpStateResponse(pub(crate) StateDump);
impl_responder_for!(DumpStateResponse, self, self.0);

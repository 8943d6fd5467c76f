//! Route registration and the handler methods behind the API.

use std::collections::HashMap;

use actix_web::{web, HttpRequest, HttpResponse};
use datastore::KvStore;
use snafu::{OptionExt, ResultExt};

use super::{
    maybe_refresh, refresh_inventory, unix_now, BootParamsResponse, ComponentsResponse,
    DumpStateResponse, SharedData,
};
use crate::discovery::{self, DiscoveryOutcome};
use crate::error::{self, Error, Result};
use crate::images::{self, ImageCache, INITRD_IMAGE_TYPE, KERNEL_IMAGE_TYPE};
use crate::model::{BootData, BootDataStore, BootParams, Component, StateDump};
use crate::script::{ScriptBuilder, ScriptParams};
use crate::store;

pub fn register_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/boot/v1")
            .service(
                web::resource("/bootparameters")
                    .route(web::get().to(bootparameters_get))
                    .route(web::post().to(bootparameters_post))
                    .route(web::put().to(bootparameters_put))
                    .route(web::patch().to(bootparameters_patch))
                    .route(web::delete().to(bootparameters_delete)),
            )
            .service(web::resource("/bootscript").route(web::get().to(bootscript_get)))
            .service(
                web::resource("/hosts")
                    .route(web::get().to(hosts_get))
                    .route(web::post().to(hosts_post)),
            )
            .service(web::resource("/dumpstate").route(web::get().to(dumpstate_get))),
    );
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// List boot parameters.  With no body and no query this returns
/// everything: per-image entries and per-binding entries resolved through
/// the fallback chain.  A body or `mac=`/`name=`/`nid=` query filters.
async fn bootparameters_get(
    body: web::Bytes,
    query: web::Query<HashMap<String, String>>,
    data: web::Data<SharedData>,
) -> Result<BootParamsResponse> {
    let qmac = query.get("mac").cloned().unwrap_or_default();
    let qname = query.get("name").cloned().unwrap_or_default();
    let qnid = query.get("nid").cloned().unwrap_or_default();
    let qparams = !qmac.is_empty() || !qname.is_empty() || !qnid.is_empty();

    let ds = data.ds.read().ok().context(error::DataStoreLockSnafu)?;
    let mut cache = data
        .image_cache
        .write()
        .ok()
        .context(error::DataStoreLockSnafu)?;

    if body.is_empty() && !qparams {
        return Ok(BootParamsResponse(all_boot_params(&*ds, &mut cache)));
    }

    let mut args = if body.is_empty() {
        BootParams::default()
    } else {
        match serde_json::from_slice::<BootParams>(&body) {
            Ok(args) => args,
            // A bad body is forgiven when the query identifies the target.
            Err(e) if qparams => {
                debug!("ignoring undecodable filter body: {}", e);
                BootParams::default()
            }
            Err(e) => return Err(e).context(error::RequestDecodeSnafu),
        }
    };
    if !qmac.is_empty() {
        args.macs.extend(qmac.split(',').map(str::to_string));
    }
    if !qname.is_empty() {
        args.hosts.extend(qname.split(',').map(str::to_string));
    }
    for n in qnid.split(',').filter(|s| !s.is_empty()) {
        let nid = n.parse::<i64>().ok().context(error::InvalidNidSnafu { nid: n })?;
        args.nids.push(nid);
    }

    let mut results: Vec<BootParams> = Vec::new();
    if !args.kernel.is_empty() || !args.initrd.is_empty() {
        for image in images::image_info(&*ds, KERNEL_IMAGE_TYPE) {
            if image.path == args.kernel {
                results.push(BootParams {
                    params: image.params,
                    kernel: image.path,
                    ..Default::default()
                });
            }
        }
        for image in images::image_info(&*ds, INITRD_IMAGE_TYPE) {
            if image.path == args.initrd {
                results.push(BootParams {
                    params: image.params,
                    initrd: image.path,
                    ..Default::default()
                });
            }
        }
    }

    let inv = data
        .inventory
        .read()
        .ok()
        .context(error::DataStoreLockSnafu)?;
    for name in store::get_names(&*ds) {
        let (bd, comp) = store::lookup_by_name(&*ds, &mut cache, &inv, &name);
        let mut matched = args
            .hosts
            .iter()
            .any(|v| *v == comp.id || *v == comp.fqdn || *v == name);
        if !matched {
            matched = args
                .macs
                .iter()
                .any(|v| comp.mac.iter().any(|m| v.eq_ignore_ascii_case(m)));
        }
        if !matched {
            matched = args.nids.iter().any(|v| comp.nid == Some(*v));
        }
        if matched {
            results.push(BootParams {
                hosts: vec![name],
                params: bd.params,
                kernel: bd.kernel.path,
                initrd: bd.initrd.path,
                cloud_init: bd.cloud_init,
                ..Default::default()
            });
        }
    }

    if results.is_empty() {
        return Err(no_params_error(&args));
    }
    Ok(BootParamsResponse(results))
}

/// Builds the error for an empty filter result; the message reflects what
/// was asked for.
fn no_params_error(args: &BootParams) -> Error {
    let mut objs: Vec<&str> = Vec::new();
    if !args.hosts.is_empty() {
        objs.push("Hosts");
    }
    if !args.macs.is_empty() {
        objs.push("MACs");
    }
    if !args.nids.is_empty() {
        objs.push("NIDs");
    }
    if !args.kernel.is_empty() {
        objs.push("kernel");
    }
    if !args.initrd.is_empty() {
        objs.push("initrd");
    }
    match objs.split_last() {
        None => Error::NoSelectors,
        Some((last, [])) => Error::NoParamsFound {
            what: last.to_string(),
        },
        Some((last, rest)) => Error::NoParamsFound {
            what: format!("{} or {}", rest.join(", "), last),
        },
    }
}

/// Every stored boot parameter: image entries first, then binding entries.
fn all_boot_params<D: KvStore>(ds: &D, cache: &mut ImageCache) -> Vec<BootParams> {
    let mut results = Vec::new();
    for image in images::image_info(ds, KERNEL_IMAGE_TYPE) {
        results.push(BootParams {
            params: image.params,
            kernel: image.path,
            ..Default::default()
        });
    }
    for image in images::image_info(ds, INITRD_IMAGE_TYPE) {
        results.push(BootParams {
            params: image.params,
            initrd: image.path,
            ..Default::default()
        });
    }
    if let Ok(kvl) = store::get_tags(ds) {
        for pair in &kvl {
            let name = store::extract_param_name(pair);
            let bds: BootDataStore = match serde_json::from_str(&pair.value) {
                Ok(bds) => bds,
                Err(e) => {
                    debug!("undecodable boot data entry at {}: {}", pair.key, e);
                    continue;
                }
            };
            let bd = store::bd_convert(ds, cache, &bds);
            results.push(BootParams {
                hosts: vec![name],
                params: bd.params,
                kernel: bd.kernel.path,
                initrd: bd.initrd.path,
                cloud_init: bd.cloud_init,
                ..Default::default()
            });
        }
    }
    results
}

fn decode_boot_params(body: &web::Bytes) -> Result<BootParams> {
    serde_json::from_slice(body).context(error::RequestDecodeSnafu)
}

fn log_boot_params(prefix: &str, bp: &BootParams) {
    match serde_json::to_string_pretty(bp) {
        Ok(j) => info!("{}: {}", prefix, j),
        Err(_) => info!("{}: {:?}", prefix, bp),
    }
}

/// Create new boot parameters.  Fails if anything named already exists.
async fn bootparameters_post(
    body: web::Bytes,
    data: web::Data<SharedData>,
) -> Result<HttpResponse> {
    let args = decode_boot_params(&body)?;
    {
        let mut ds = data.ds.write().ok().context(error::DataStoreLockSnafu)?;
        let inv = data
            .inventory
            .read()
            .ok()
            .context(error::DataStoreLockSnafu)?;
        store::store_new(&mut *ds, &inv, &args).map_err(|e| {
            log_boot_params(&format!("/bootparameters POST FAILED: {}", e), &args);
            e
        })?;
    }
    log_boot_params("/bootparameters POST", &args);
    Ok(HttpResponse::Created()
        .content_type("application/json")
        .finish())
}

/// Set boot parameters, overwriting whatever the named bindings held.
async fn bootparameters_put(
    body: web::Bytes,
    data: web::Data<SharedData>,
) -> Result<HttpResponse> {
    let args = decode_boot_params(&body)?;
    {
        let mut ds = data.ds.write().ok().context(error::DataStoreLockSnafu)?;
        let inv = data
            .inventory
            .read()
            .ok()
            .context(error::DataStoreLockSnafu)?;
        store::store(&mut *ds, &inv, &args).map_err(|e| {
            log_boot_params(&format!("/bootparameters PUT FAILED: {}", e), &args);
            e
        })?;
    }
    log_boot_params("/bootparameters PUT", &args);
    Ok(HttpResponse::Ok().content_type("application/json").finish())
}

/// Update existing boot parameters without nulling out absent fields.
async fn bootparameters_patch(
    body: web::Bytes,
    data: web::Data<SharedData>,
) -> Result<HttpResponse> {
    let args = decode_boot_params(&body)?;
    {
        let mut ds = data.ds.write().ok().context(error::DataStoreLockSnafu)?;
        let inv = data
            .inventory
            .read()
            .ok()
            .context(error::DataStoreLockSnafu)?;
        store::update(&mut *ds, &inv, &args).map_err(|e| {
            log_boot_params(&format!("/bootparameters PATCH FAILED: {}", e), &args);
            e
        })?;
    }
    log_boot_params("/bootparameters PATCH", &args);
    Ok(HttpResponse::Ok().content_type("application/json").finish())
}

/// Delete bindings and images named in the request.
async fn bootparameters_delete(
    body: web::Bytes,
    data: web::Data<SharedData>,
) -> Result<HttpResponse> {
    let args = decode_boot_params(&body)?;
    {
        let mut ds = data.ds.write().ok().context(error::DataStoreLockSnafu)?;
        let mut cache = data
            .image_cache
            .write()
            .ok()
            .context(error::DataStoreLockSnafu)?;
        let inv = data
            .inventory
            .read()
            .ok()
            .context(error::DataStoreLockSnafu)?;
        store::remove(&mut *ds, &mut cache, &inv, &args).map_err(|e| {
            log_boot_params(&format!("/bootparameters DELETE FAILED: {}", e), &args);
            e
        })?;
    }
    log_boot_params("/bootparameters DELETE", &args);
    Ok(HttpResponse::Ok().content_type("application/json").finish())
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

fn int_param(query: &web::Query<HashMap<String, String>>, param: &str, default: i64) -> i64 {
    query
        .get(param)
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn script_builder(data: &SharedData) -> ScriptBuilder<'_> {
    ScriptBuilder {
        advertise_address: &data.config.advertise_address,
        retry_delay: data.config.retry_delay,
        spire: data.spire.as_ref(),
        presigner: &data.presigner,
    }
}

/// Emit the iPXE boot script for the requesting node.
async fn bootscript_get(
    req: HttpRequest,
    query: web::Query<HashMap<String, String>>,
    data: web::Data<SharedData>,
) -> Result<HttpResponse> {
    let mac = query.get("mac").cloned().unwrap_or_default();
    let mut name = query.get("name").cloned().unwrap_or_default();
    let arch = query.get("arch").cloned().unwrap_or_default();
    let mut nid = int_param(&query, "nid", -1);
    let retry = int_param(&query, "retry", 0);
    let ts = int_param(&query, "ts", unix_now());

    // A node reporting a timestamp newer than our snapshot has seen state
    // we have not; refresh in the background.
    if query.contains_key("ts") {
        maybe_refresh(&data, ts);
    }

    let (bd, comp, mut descr) = {
        let ds = data.ds.read().ok().context(error::DataStoreLockSnafu)?;
        let mut cache = data
            .image_cache
            .write()
            .ok()
            .context(error::DataStoreLockSnafu)?;
        let inv = data
            .inventory
            .read()
            .ok()
            .context(error::DataStoreLockSnafu)?;
        if !mac.is_empty() {
            let (bd, comp) = store::lookup_by_mac(&*ds, &mut cache, &inv, &mac);
            let descr = if comp.id.is_empty() {
                format!("MAC {}", mac)
            } else {
                format!("MAC {} ({})", mac, comp.id)
            };
            (bd, comp, descr)
        } else if !name.is_empty() {
            let (bd, comp) = store::lookup_by_name(&*ds, &mut cache, &inv, &name);
            let descr = if comp.id.is_empty() || comp.id == name {
                name.clone()
            } else {
                format!("{} ({})", name, comp.id)
            };
            (bd, comp, descr)
        } else if nid >= 0 {
            let (bd, comp) = store::lookup_by_nid(&*ds, &mut cache, &inv, nid);
            let descr = if comp.id.is_empty() {
                format!("NID {}", nid)
            } else {
                format!("NID {} ({})", nid, comp.id)
            };
            (bd, comp, descr)
        } else {
            warn!("bootscript request without mac=, name=, or nid= parameter");
            return error::MissingSelectorSnafu.fail();
        }
    };

    // A node with no inventory record, a disabled one, or one with no
    // kernel configured is in the discovery process and gets the discovery
    // kernel.  When that cannot be served and the component is known, the
    // regular pathway is tried instead.
    let unknown = comp.id.is_empty() || !comp.endpoint_enabled || bd.kernel.path.is_empty();
    let script = if !unknown {
        normal_bootscript(&data, req.path(), &bd, &comp, &mac, retry, &descr).await
    } else {
        if name.is_empty() {
            name = comp.id.clone();
        }
        if let Some(n) = comp.nid {
            nid = n;
        }
        let disc_mac = if mac.is_empty() {
            first_mac(&comp)
        } else {
            mac.clone()
        };
        descr = format!("Unknown {}", descr);
        if !arch.is_empty() {
            descr.push_str(&format!(" architecture {}", arch));
        }
        match discovery_bootscript(&data, &arch, &disc_mac, &name, nid, ts, &descr).await {
            Ok(script) => Ok(script),
            Err(e) if !comp.id.is_empty() => {
                debug!("discovery unavailable for {}: {}", descr, e);
                normal_bootscript(&data, req.path(), &bd, &comp, &mac, retry, &descr).await
            }
            Err(e) => Err(e),
        }
    };

    let script = script.map_err(|e| {
        warn!("BSS request failed for {}: {}", descr, e);
        e
    })?;
    info!("BSS request succeeded for {}", descr);
    Ok(HttpResponse::Ok()
        .content_type("text/plain; charset=utf-8")
        .body(script))
}

// The state manager sometimes reports an empty string in the MAC list.
fn first_mac(comp: &Component) -> String {
    comp.mac
        .iter()
        .find(|m| !m.is_empty())
        .cloned()
        .unwrap_or_default()
}

/// The regular (non-discovery) pathway: blocklist policy, then either a
/// delayed chain while state is refreshing or the full boot script.
async fn normal_bootscript(
    data: &web::Data<SharedData>,
    path: &str,
    bd: &BootData,
    comp: &Component,
    mac: &str,
    retry: i64,
    descr: &str,
) -> Result<String> {
    {
        let ds = data.ds.read().ok().context(error::DataStoreLockSnafu)?;
        discovery::blocklist_check(&*ds, &data.config.blocked_roles, comp)?;
    }
    let mac = if mac.is_empty() {
        first_mac(comp)
    } else {
        mac.to_string()
    };
    let sp = ScriptParams {
        xname: comp.id.clone(),
        nid: comp.nid.map(|n| n.to_string()).unwrap_or_default(),
    };
    let mut chain = format!("chain {}{}", data.config.chain_base(), path);
    if !mac.is_empty() {
        chain.push_str(&format!("?mac={}", mac));
    } else {
        chain.push_str(&format!("?name={}", comp.id));
    }
    chain.push_str(&format!("&retry={}", retry + 1));

    if data.check_state() {
        info!("BSS request delayed for {} while updating state", descr);
        return Ok(format!(
            "#!ipxe\nsleep {}\n{}\n",
            data.config.hsm_retrieval_delay, chain
        ));
    }
    script_builder(data).build(bd, &sp, &chain, descr).await
}

/// The discovery pathway for unknown nodes.
async fn discovery_bootscript(
    data: &web::Data<SharedData>,
    arch: &str,
    mac: &str,
    name: &str,
    nid: i64,
    ts: i64,
    descr: &str,
) -> Result<String> {
    let chain = discovery::discovery_chain(&data.config, mac, name, nid, ts);
    let retrieving = data.check_state();
    let outcome = {
        let ds = data.ds.read().ok().context(error::DataStoreLockSnafu)?;
        let mut cache = data
            .image_cache
            .write()
            .ok()
            .context(error::DataStoreLockSnafu)?;
        discovery::discover(&*ds, &mut cache, retrieving, arch, descr)?
    };
    match outcome {
        DiscoveryOutcome::Delayed => {
            info!("BSS request delayed for {} while updating state", descr);
            Ok(format!(
                "#!ipxe\nsleep {}\n{}\n",
                data.config.hsm_retrieval_delay, chain
            ))
        }
        DiscoveryOutcome::ProbeArch => Ok(format!("#!ipxe\n{}\n", chain)),
        DiscoveryOutcome::Resolved(bd) => {
            script_builder(data)
                .build(&bd, &ScriptParams::default(), &chain, descr)
                .await
        }
    }
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// List inventory components, optionally filtered by `name=`, `mac=` or
/// `nid=` comma-separated query values.
async fn hosts_get(
    query: web::Query<HashMap<String, String>>,
    data: web::Data<SharedData>,
) -> Result<ComponentsResponse> {
    let name = query.get("name").cloned().unwrap_or_default();
    let mac = query.get("mac").cloned().unwrap_or_default();
    let nid = query.get("nid").cloned().unwrap_or_default();

    let inv = data
        .inventory
        .read()
        .ok()
        .context(error::DataStoreLockSnafu)?;
    if name.is_empty() && mac.is_empty() && nid.is_empty() {
        return Ok(ComponentsResponse(inv.components().to_vec()));
    }

    let mut results = Vec::new();
    for n in name.split(',').filter(|s| !s.is_empty()) {
        let comp = inv
            .find_by_name(n)
            .context(error::UnknownNameSnafu { name: n })?;
        results.push(comp.clone());
    }
    for m in mac.split(',').filter(|s| !s.is_empty()) {
        let comp = inv
            .find_by_mac(m)
            .context(error::UnknownMacSnafu { mac: m })?;
        results.push(comp.clone());
    }
    for n in nid.split(',').filter(|s| !s.is_empty()) {
        let nid = n.parse::<i64>().ok().context(error::InvalidNidSnafu { nid: n })?;
        let comp = inv.find_by_nid(nid).context(error::UnknownNidSnafu { nid })?;
        results.push(comp.clone());
    }
    Ok(ComponentsResponse(results))
}

/// Trigger a hardware state refresh.
async fn hosts_post(data: web::Data<SharedData>) -> HttpResponse {
    actix_web::rt::spawn(refresh_inventory(data.clone(), unix_now()));
    HttpResponse::NoContent()
        .insert_header(("Cache-Control", "no-cache"))
        .finish()
}

/// Composite dump of inventory and boot parameters for debugging.
async fn dumpstate_get(data: web::Data<SharedData>) -> Result<DumpStateResponse> {
    let ds = data.ds.read().ok().context(error::DataStoreLockSnafu)?;
    let mut cache = data
        .image_cache
        .write()
        .ok()
        .context(error::DataStoreLockSnafu)?;
    let inv = data
        .inventory
        .read()
        .ok()
        .context(error::DataStoreLockSnafu)?;
    Ok(DumpStateResponse(StateDump {
        components: inv.components().to_vec(),
        params: all_boot_params(&*ds, &mut cache),
    }))
}

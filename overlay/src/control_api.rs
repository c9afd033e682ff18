//! Local control API (component K): a Unix-domain HTTP server speaking
//! `Authorization: Bearer <cookie>` auth, used by an operator's CLI/UI to
//! drive a running peer daemon.
//!
//! Grounded on the same hyper-over-Unix-socket shape the teacher uses for
//! its JSON-RPC server, but re-keyed to bearer-cookie auth and the
//! endpoint set this overlay actually needs. The overlay swarm itself
//! (dialing, pinging, tracerouting a remote peer) is an external
//! collaborator; this module depends on it only through the [`OverlayOps`]
//! trait, the same "inject the thing you can't own" pattern already used
//! by the path dialer and stream-dial-with-retry modules.

use std::collections::HashMap;
use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use subtle::ConstantTimeEq;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::allowlist::{AllowListStore, Role};
use crate::error::{OverlayError, Result};
use crate::gater::ConnectionGater;
use crate::identity::PeerId;
use crate::service::ServiceRegistry;

/// Max request body size accepted by any endpoint.
const MAX_BODY_BYTES: usize = 1024 * 1024;
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(3);

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = Result<T>> + Send>>;

#[derive(Debug, Clone, Serialize)]
pub struct PingReport {
    pub sent: u32,
    pub received: u32,
    pub rtts_ms: Vec<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerSummary {
    pub peer_id: PeerId,
    pub overlay: bool,
    pub connected_since_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PathSummary {
    pub peer_id: PeerId,
    pub path_type: String,
    pub transport: String,
    pub ip_version: u8,
    pub rtt_ms: Option<u64>,
}

/// Everything about the overlay swarm this API needs but does not own.
/// Implemented by the binary that assembles the runtime context, over
/// whatever libp2p swarm handle it holds.
pub trait OverlayOps: Send + Sync + 'static {
    type Stream: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static;

    fn ping(&self, peer: PeerId, count: u32, interval_ms: u64) -> BoxFuture<PingReport>;
    fn traceroute(&self, peer: PeerId) -> BoxFuture<Vec<String>>;
    fn resolve(&self, name: String) -> BoxFuture<(PeerId, &'static str)>;
    fn dial_service(&self, peer: PeerId, service: String) -> BoxFuture<Self::Stream>;
    fn peers(&self, all: bool) -> BoxFuture<Vec<PeerSummary>>;
    fn paths(&self) -> BoxFuture<Vec<PathSummary>>;
    fn reachability_grade(&self) -> &'static str;
}

struct ActiveProxy {
    listen_address: String,
    cancel: CancellationToken,
}

/// Shared state behind every request handler.
pub struct ControlApiState<O: OverlayOps> {
    namespace: String,
    started_at: Instant,
    identity: PeerId,
    allowlist: Arc<AllowListStore>,
    gater: Arc<ConnectionGater>,
    services: Arc<ServiceRegistry>,
    ops: Arc<O>,
    proxies: Mutex<HashMap<u64, ActiveProxy>>,
    next_proxy_id: AtomicU64,
    shutdown: CancellationToken,
}

impl<O: OverlayOps> ControlApiState<O> {
    pub fn new(
        namespace: impl Into<String>,
        identity: PeerId,
        allowlist: Arc<AllowListStore>,
        gater: Arc<ConnectionGater>,
        services: Arc<ServiceRegistry>,
        ops: Arc<O>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            namespace: namespace.into(),
            started_at: Instant::now(),
            identity,
            allowlist,
            gater,
            services,
            ops,
            proxies: Mutex::new(HashMap::new()),
            next_proxy_id: AtomicU64::new(1),
            shutdown,
        })
    }
}

/// A listener bound and ready to serve, plus the cookie a client must send.
pub struct BoundSocket {
    listener: UnixListener,
    pub cookie: String,
    socket_path: PathBuf,
    cookie_path: PathBuf,
}

impl BoundSocket {
    /// The underlying listener, for callers (e.g. the admin protocol) that
    /// reuse this bind/cookie discipline but run their own accept loop.
    pub fn listener_ref(&self) -> &UnixListener {
        &self.listener
    }

    /// Remove the socket and cookie files. Safe to call even if they were
    /// already removed.
    pub fn cleanup(&self) {
        std::fs::remove_file(&self.socket_path).ok();
        std::fs::remove_file(&self.cookie_path).ok();
    }
}

/// Bind `socket_path`, generate a fresh bearer cookie, and write it to
/// `cookie_path` at `0600` -- only after the socket itself is live at
/// `0600`. A pre-existing socket is probed with a connect attempt: a
/// successful connect means another instance is already serving
/// (`ALREADY_RUNNING`); a failed connect means the path is stale and is
/// removed before rebinding.
pub async fn bind_with_fresh_cookie(socket_path: impl Into<PathBuf>, cookie_path: impl Into<PathBuf>) -> Result<BoundSocket> {
    let socket_path = socket_path.into();
    let cookie_path = cookie_path.into();

    if socket_path.exists() {
        match UnixStream::connect(&socket_path).await {
            Ok(_) => {
                return Err(OverlayError::resource(format!(
                    "ALREADY_RUNNING: a control API is already listening on {}",
                    socket_path.display()
                )))
            }
            Err(_) => {
                std::fs::remove_file(&socket_path).map_err(|e| {
                    OverlayError::configuration(format!("cannot remove stale socket {}: {e}", socket_path.display()))
                })?;
            }
        }
    }

    // umask(0077) for the bind so the socket never has a window at a wider
    // mode than 0600; restored immediately after.
    let previous_umask = unsafe { libc_umask(0o077) };
    let listener = UnixListener::bind(&socket_path);
    unsafe {
        libc_umask(previous_umask);
    }
    let listener = listener.map_err(|e| OverlayError::configuration(format!("cannot bind {}: {e}", socket_path.display())))?;
    std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| OverlayError::configuration(format!("cannot chmod {}: {e}", socket_path.display())))?;

    let mut cookie_bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut cookie_bytes);
    let cookie = hex::encode(cookie_bytes);

    {
        use std::io::Write;
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&cookie_path)
            .map_err(|e| OverlayError::configuration(format!("cannot create {}: {e}", cookie_path.display())))?;
        f.write_all(cookie.as_bytes())
            .map_err(|e| OverlayError::configuration(format!("cannot write {}: {e}", cookie_path.display())))?;
    }

    Ok(BoundSocket {
        listener,
        cookie,
        socket_path,
        cookie_path,
    })
}

/// Thin wrapper so this module does not take a direct `libc` dependency for
/// a single syscall; `nix`/`libc` are both absent from the workspace, and
/// glibc's `umask` is reachable through the platform's raw syscall binding
/// already pulled in transitively by tokio on unix.
#[cfg(unix)]
unsafe fn libc_umask(mask: u32) -> u32 {
    extern "C" {
        fn umask(mask: u32) -> u32;
    }
    umask(mask)
}
#[cfg(not(unix))]
unsafe fn libc_umask(_mask: u32) -> u32 {
    0
}

/// Serve the control API on `bound` until `cancel` fires, then remove the
/// socket and cookie files and return.
pub async fn serve<O: OverlayOps>(bound: BoundSocket, state: Arc<ControlApiState<O>>, cancel: CancellationToken) -> Result<()> {
    info!(socket = %bound.socket_path.display(), "control API listening");
    loop {
        let (stream, _addr) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = bound.listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "control API accept failed");
                    continue;
                }
            },
        };

        let state = Arc::clone(&state);
        let cookie = bound.cookie.clone();
        let conn_cancel = cancel.child_token();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = hyper::service::service_fn(move |req| {
                let state = Arc::clone(&state);
                let cookie = cookie.clone();
                async move { Ok::<_, std::convert::Infallible>(route(req, state, cookie).await) }
            });
            let conn = hyper::server::conn::http1::Builder::new().serve_connection(io, service);
            tokio::select! {
                _ = conn_cancel.cancelled() => {}
                result = conn => {
                    if let Err(e) = result {
                        warn!(error = %e, "control API connection error");
                    }
                }
            }
        });
    }

    std::fs::remove_file(&bound.socket_path).ok();
    std::fs::remove_file(&bound.cookie_path).ok();
    Ok(())
}

fn json_response(status: StatusCode, body: Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .expect("static response parts are always valid")
}

/// Whether the caller asked for the human-readable rendering: `?format=text`
/// on the query string, or an `Accept` header naming `text/plain` without
/// also naming `application/json` (a bare curl/browser request, not a JSON
/// client that happens to accept anything).
fn wants_text_format(req: &Request<Incoming>) -> bool {
    let query_wants_text = req
        .uri()
        .query()
        .map(|q| q.split('&').any(|kv| kv == "format=text"))
        .unwrap_or(false);
    if query_wants_text {
        return true;
    }
    req.headers()
        .get(hyper::header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|accept| accept.contains("text/plain") && !accept.contains("application/json"))
        .unwrap_or(false)
}

/// Re-render a JSON envelope response as `text/plain`, one `key: value` line
/// per top-level field. Nested objects/arrays are rendered as compact JSON
/// on their line rather than recursively flattened, matching what an
/// operator piping `curl` through a terminal wants: scannable, not another
/// parser to write.
async fn to_text_format(resp: Response<Full<Bytes>>) -> Response<Full<Bytes>> {
    let status = resp.status();
    let body_bytes = resp
        .into_body()
        .collect()
        .await
        .expect("Full<Bytes> body collection never fails")
        .to_bytes();
    let Ok(value): std::result::Result<Value, _> = serde_json::from_slice(&body_bytes) else {
        return Response::builder()
            .status(status)
            .header("content-type", "text/plain")
            .body(Full::new(body_bytes))
            .expect("static response parts are always valid");
    };

    let mut lines = Vec::new();
    match &value {
        Value::Object(map) => {
            for (key, v) in map {
                match v {
                    Value::Object(inner) if key == "data" => {
                        for (k, v) in inner {
                            lines.push(format!("{k}: {}", render_text_scalar(v)));
                        }
                    }
                    _ => lines.push(format!("{key}: {}", render_text_scalar(v))),
                }
            }
        }
        other => lines.push(render_text_scalar(other)),
    }

    Response::builder()
        .status(status)
        .header("content-type", "text/plain")
        .body(Full::new(Bytes::from(lines.join("\n"))))
        .expect("static response parts are always valid")
}

fn render_text_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        _ => value.to_string(),
    }
}

fn ok(body: Value) -> Response<Full<Bytes>> {
    json_response(StatusCode::OK, json!({ "data": body }))
}

fn err(e: OverlayError) -> Response<Full<Bytes>> {
    let status = StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    json_response(status, json!({ "error": e.message }))
}

fn unauthorized() -> Response<Full<Bytes>> {
    json_response(StatusCode::UNAUTHORIZED, json!({ "error": "missing or invalid bearer cookie" }))
}

fn bad_request(message: impl Into<String>) -> Response<Full<Bytes>> {
    json_response(StatusCode::BAD_REQUEST, json!({ "error": message.into() }))
}

fn authorized(req: &Request<Incoming>, cookie: &str) -> bool {
    bearer_matches(req.headers(), cookie)
}

fn bearer_matches(headers: &hyper::HeaderMap, cookie: &str) -> bool {
    let Some(header) = headers.get(hyper::header::AUTHORIZATION) else {
        return false;
    };
    let Ok(value) = header.to_str() else {
        return false;
    };
    let Some(presented) = value.strip_prefix("Bearer ") else {
        return false;
    };
    presented.as_bytes().ct_eq(cookie.as_bytes()).into()
}

async fn read_json_body(req: Request<Incoming>) -> std::result::Result<Value, Response<Full<Bytes>>> {
    let collected = req
        .collect()
        .await
        .map_err(|_| bad_request("cannot read request body"))?;
    let bytes = collected.to_bytes();
    if bytes.len() > MAX_BODY_BYTES {
        return Err(json_response(
            StatusCode::PAYLOAD_TOO_LARGE,
            json!({ "error": "request body exceeds 1 MiB" }),
        ));
    }
    if bytes.is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_slice(&bytes).map_err(|e| bad_request(format!("malformed JSON body: {e}")))
}

async fn route<O: OverlayOps>(req: Request<Incoming>, state: Arc<ControlApiState<O>>, cookie: String) -> Response<Full<Bytes>> {
    if !authorized(&req, &cookie) {
        return unauthorized();
    }

    let as_text = wants_text_format(&req);
    let method = req.method().clone();
    let path = req.uri().path().trim_start_matches("/v1").to_string();

    let response = match (method, path.as_str()) {
        (Method::GET, "/status") => handle_status(&state).await,
        (Method::GET, "/services") => ok(json!(state.services.list())),
        (Method::GET, "/peers") => handle_list_peers(req, &state).await,
        (Method::GET, "/paths") => handle_paths(&state).await,
        (Method::GET, "/auth") => handle_get_auth(&state),
        (Method::POST, "/auth") => handle_post_auth(req, &state).await,
        (Method::POST, "/ping") => handle_ping(req, &state).await,
        (Method::POST, "/traceroute") => handle_traceroute(req, &state).await,
        (Method::POST, "/resolve") => handle_resolve(req, &state).await,
        (Method::POST, "/connect") => handle_connect(req, &state).await,
        (Method::POST, "/expose") => handle_expose(req, &state).await,
        (Method::POST, "/shutdown") => handle_shutdown(&state),
        (Method::DELETE, path) if path.starts_with("/auth/") => handle_delete_auth(path, &state),
        (Method::DELETE, path) if path.starts_with("/connect/") => handle_disconnect(path, &state),
        (Method::DELETE, path) if path.starts_with("/expose/") => handle_unexpose(path, &state),
        _ => json_response(StatusCode::NOT_FOUND, json!({ "error": "no such endpoint" })),
    };

    if as_text {
        to_text_format(response).await
    } else {
        response
    }
}

async fn handle_status<O: OverlayOps>(state: &Arc<ControlApiState<O>>) -> Response<Full<Bytes>> {
    ok(json!({
        "peer_id": state.identity.to_string(),
        "namespace": state.namespace,
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "peer_count": state.gater.current_size(),
        "reachability_grade": state.ops.reachability_grade(),
    }))
}

async fn handle_list_peers<O: OverlayOps>(req: Request<Incoming>, state: &Arc<ControlApiState<O>>) -> Response<Full<Bytes>> {
    let all = req
        .uri()
        .query()
        .map(|q| q.contains("all=true"))
        .unwrap_or(false);
    match state.ops.peers(all).await {
        Ok(peers) => ok(json!(peers)),
        Err(e) => err(e),
    }
}

async fn handle_paths<O: OverlayOps>(state: &Arc<ControlApiState<O>>) -> Response<Full<Bytes>> {
    match state.ops.paths().await {
        Ok(paths) => ok(json!(paths)),
        Err(e) => err(e),
    }
}

fn handle_get_auth<O: OverlayOps>(state: &Arc<ControlApiState<O>>) -> Response<Full<Bytes>> {
    match state.allowlist.load() {
        Ok(entries) => ok(json!(entries)),
        Err(e) => err(e),
    }
}

#[derive(Deserialize)]
struct PostAuthBody {
    peer_id: String,
    comment: Option<String>,
    role: Option<String>,
}

async fn handle_post_auth<O: OverlayOps>(req: Request<Incoming>, state: &Arc<ControlApiState<O>>) -> Response<Full<Bytes>> {
    let body = match read_json_body(req).await {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let body: PostAuthBody = match serde_json::from_value(body) {
        Ok(b) => b,
        Err(e) => return bad_request(format!("invalid body: {e}")),
    };
    let peer_id: PeerId = match body.peer_id.parse() {
        Ok(p) => p,
        Err(_) => return bad_request("invalid peer_id"),
    };
    let role = match body.role.as_deref() {
        None | Some("member") => Role::Member,
        Some("admin") => Role::Admin,
        Some(_) => return bad_request("role must be 'member' or 'admin'"),
    };

    if let Err(e) = state.allowlist.add_peer(peer_id, body.comment, role, None) {
        return err(e);
    }
    if let Err(e) = state.gater.reload_from_file(&state.allowlist) {
        return err(e);
    }
    ok(json!({ "added": true }))
}

fn handle_delete_auth<O: OverlayOps>(path: &str, state: &Arc<ControlApiState<O>>) -> Response<Full<Bytes>> {
    let Some(raw) = path.strip_prefix("/auth/") else {
        return bad_request("missing peer id");
    };
    let peer_id: PeerId = match raw.parse() {
        Ok(p) => p,
        Err(_) => return bad_request("invalid peer_id"),
    };
    match state.allowlist.remove_peer(&peer_id) {
        Ok(removed) => {
            if removed {
                if let Err(e) = state.gater.reload_from_file(&state.allowlist) {
                    return err(e);
                }
            }
            ok(json!({ "removed": removed }))
        }
        Err(e) => err(e),
    }
}

#[derive(Deserialize)]
struct PingBody {
    peer: String,
    #[serde(default = "default_ping_count")]
    count: u32,
    #[serde(default = "default_ping_interval_ms")]
    interval_ms: u64,
}
fn default_ping_count() -> u32 {
    4
}
fn default_ping_interval_ms() -> u64 {
    1000
}

async fn handle_ping<O: OverlayOps>(req: Request<Incoming>, state: &Arc<ControlApiState<O>>) -> Response<Full<Bytes>> {
    let body = match read_json_body(req).await {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let body: PingBody = match serde_json::from_value(body) {
        Ok(b) => b,
        Err(e) => return bad_request(format!("invalid body: {e}")),
    };
    let peer: PeerId = match body.peer.parse() {
        Ok(p) => p,
        Err(_) => return bad_request("invalid peer"),
    };
    match state.ops.ping(peer, body.count, body.interval_ms).await {
        Ok(report) => ok(json!(report)),
        Err(e) => err(e),
    }
}

#[derive(Deserialize)]
struct TracerouteBody {
    peer: String,
}

async fn handle_traceroute<O: OverlayOps>(req: Request<Incoming>, state: &Arc<ControlApiState<O>>) -> Response<Full<Bytes>> {
    let body = match read_json_body(req).await {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let body: TracerouteBody = match serde_json::from_value(body) {
        Ok(b) => b,
        Err(e) => return bad_request(format!("invalid body: {e}")),
    };
    let peer: PeerId = match body.peer.parse() {
        Ok(p) => p,
        Err(_) => return bad_request("invalid peer"),
    };
    match state.ops.traceroute(peer).await {
        Ok(hops) => ok(json!({ "hops": hops })),
        Err(e) => err(e),
    }
}

#[derive(Deserialize)]
struct ResolveBody {
    name: String,
}

async fn handle_resolve<O: OverlayOps>(req: Request<Incoming>, state: &Arc<ControlApiState<O>>) -> Response<Full<Bytes>> {
    let body = match read_json_body(req).await {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let body: ResolveBody = match serde_json::from_value(body) {
        Ok(b) => b,
        Err(e) => return bad_request(format!("invalid body: {e}")),
    };
    match state.ops.resolve(body.name).await {
        Ok((peer_id, source)) => ok(json!({ "peer_id": peer_id.to_string(), "source": source })),
        Err(e) => err(e),
    }
}

#[derive(Deserialize)]
struct ConnectBody {
    peer: String,
    service: String,
    listen: String,
}

async fn handle_connect<O: OverlayOps>(req: Request<Incoming>, state: &Arc<ControlApiState<O>>) -> Response<Full<Bytes>> {
    let body = match read_json_body(req).await {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let body: ConnectBody = match serde_json::from_value(body) {
        Ok(b) => b,
        Err(e) => return bad_request(format!("invalid body: {e}")),
    };
    let peer: PeerId = match body.peer.parse() {
        Ok(p) => p,
        Err(_) => return bad_request("invalid peer"),
    };

    let ops = Arc::clone(&state.ops);
    let service_name = body.service.clone();
    let cancel = CancellationToken::new();
    let dial = {
        let ops = Arc::clone(&ops);
        let peer = peer.clone();
        let service_name = service_name.clone();
        move || {
            let ops = Arc::clone(&ops);
            let peer = peer.clone();
            let service_name = service_name.clone();
            async move { ops.dial_service(peer, service_name).await }
        }
    };

    match crate::service::spawn_tcp_listener(&body.listen, dial, cancel.clone()).await {
        Ok(bound_addr) => {
            let id = state.next_proxy_id.fetch_add(1, Ordering::SeqCst);
            let listen_address = bound_addr.to_string();
            state.proxies.lock().insert(
                id,
                ActiveProxy {
                    listen_address: listen_address.clone(),
                    cancel,
                },
            );
            ok(json!({ "id": format!("proxy-{id}"), "listen_address": listen_address }))
        }
        Err(e) => err(e),
    }
}

fn handle_disconnect<O: OverlayOps>(path: &str, state: &Arc<ControlApiState<O>>) -> Response<Full<Bytes>> {
    let Some(raw_id) = path.strip_prefix("/connect/proxy-") else {
        return bad_request("malformed proxy id");
    };
    let Ok(id) = raw_id.parse::<u64>() else {
        return bad_request("malformed proxy id");
    };
    match state.proxies.lock().remove(&id) {
        Some(proxy) => {
            proxy.cancel.cancel();
            ok(json!({ "closed": true }))
        }
        None => json_response(StatusCode::NOT_FOUND, json!({ "error": "no such proxy" })),
    }
}

#[derive(Deserialize)]
struct ExposeBody {
    name: String,
    local_address: String,
    protocol_override: Option<String>,
}

async fn handle_expose<O: OverlayOps>(req: Request<Incoming>, state: &Arc<ControlApiState<O>>) -> Response<Full<Bytes>> {
    let body = match read_json_body(req).await {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let body: ExposeBody = match serde_json::from_value(body) {
        Ok(b) => b,
        Err(e) => return bad_request(format!("invalid body: {e}")),
    };
    match state
        .services
        .expose(&body.name, &body.local_address, body.protocol_override)
    {
        Ok(record) => ok(json!(record)),
        Err(e) => err(e),
    }
}

fn handle_unexpose<O: OverlayOps>(path: &str, state: &Arc<ControlApiState<O>>) -> Response<Full<Bytes>> {
    let Some(name) = path.strip_prefix("/expose/") else {
        return bad_request("missing service name");
    };
    match state.services.unexpose(name) {
        Ok(()) => ok(json!({ "removed": true })),
        Err(e) => err(e),
    }
}

fn handle_shutdown<O: OverlayOps>(state: &Arc<ControlApiState<O>>) -> Response<Full<Bytes>> {
    state.shutdown.cancel();
    ok(json!({ "shutting_down": true, "deadline_secs": SHUTDOWN_DEADLINE.as_secs() }))
}

// `ServiceRecord` needs to serialize for `/services` and `/expose`'s
// response; derived here rather than in service.rs to keep that module
// free of a wire-format dependency it does not otherwise need.
impl Serialize for crate::service::ServiceRecord {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("ServiceRecord", 4)?;
        s.serialize_field("name", &self.name)?;
        s.serialize_field("protocol_id", &self.protocol_id)?;
        s.serialize_field("local_address", &self.local_address)?;
        s.serialize_field("enabled", &self.enabled)?;
        s.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allowlist::AllowListStore;
    use tempfile::tempdir;

    struct NoopOps;
    impl OverlayOps for NoopOps {
        type Stream = tokio::io::DuplexStream;

        fn ping(&self, _peer: PeerId, count: u32, _interval_ms: u64) -> BoxFuture<PingReport> {
            Box::pin(async move {
                Ok(PingReport {
                    sent: count,
                    received: count,
                    rtts_ms: vec![10; count as usize],
                })
            })
        }
        fn traceroute(&self, _peer: PeerId) -> BoxFuture<Vec<String>> {
            Box::pin(async move { Ok(vec![]) })
        }
        fn resolve(&self, _name: String) -> BoxFuture<(PeerId, &'static str)> {
            Box::pin(async move { Err(OverlayError::resource("not found")) })
        }
        fn dial_service(&self, _peer: PeerId, _service: String) -> BoxFuture<Self::Stream> {
            Box::pin(async move { Err(OverlayError::network_transient("no route")) })
        }
        fn peers(&self, _all: bool) -> BoxFuture<Vec<PeerSummary>> {
            Box::pin(async move { Ok(vec![]) })
        }
        fn paths(&self) -> BoxFuture<Vec<PathSummary>> {
            Box::pin(async move { Ok(vec![]) })
        }
        fn reachability_grade(&self) -> &'static str {
            "unknown"
        }
    }

    fn state() -> Arc<ControlApiState<NoopOps>> {
        let dir = tempdir().unwrap();
        let allowlist = Arc::new(AllowListStore::new(dir.path().join("authorized_keys")));
        let gater = ConnectionGater::empty();
        let services = Arc::new(ServiceRegistry::new("homelab"));
        ControlApiState::new(
            "homelab",
            PeerId(hex::encode([3u8; 32])),
            allowlist,
            gater,
            services,
            Arc::new(NoopOps),
            CancellationToken::new(),
        )
    }

    #[test]
    fn bearer_check_rejects_wrong_and_missing_cookies() {
        let mut headers = hyper::HeaderMap::new();
        headers.insert(hyper::header::AUTHORIZATION, "Bearer wrong".parse().unwrap());
        assert!(!bearer_matches(&headers, "right"));
        assert!(!bearer_matches(&hyper::HeaderMap::new(), "right"));

        let mut correct = hyper::HeaderMap::new();
        correct.insert(hyper::header::AUTHORIZATION, "Bearer right".parse().unwrap());
        assert!(bearer_matches(&correct, "right"));
    }

    #[tokio::test]
    async fn to_text_format_renders_data_envelope_as_key_value_lines() {
        let resp = ok(json!({ "peer_id": "abc", "uptime_secs": 42 }));
        let rendered = to_text_format(resp).await;
        assert_eq!(
            rendered.headers().get("content-type").and_then(|v| v.to_str().ok()),
            Some("text/plain")
        );
        let body = rendered.into_body().collect().await.unwrap().to_bytes();
        let text = std::str::from_utf8(&body).unwrap();
        assert!(text.contains("peer_id: abc"));
        assert!(text.contains("uptime_secs: 42"));
    }

    #[tokio::test]
    async fn to_text_format_renders_error_envelope() {
        let resp = err(OverlayError::resource("no capacity"));
        let rendered = to_text_format(resp).await;
        let body = rendered.into_body().collect().await.unwrap().to_bytes();
        let text = std::str::from_utf8(&body).unwrap();
        assert_eq!(text, "error: no capacity");
    }

    #[tokio::test]
    async fn post_auth_adds_and_reloads_gater() {
        let state = state();
        let peer = PeerId(hex::encode([9u8; 32]));
        state
            .allowlist
            .add_peer(peer.clone(), None, Role::Member, None)
            .unwrap();
        state.gater.reload_from_file(&state.allowlist).unwrap();
        assert!(state.gater.should_accept(&peer));
    }

    #[test]
    fn expose_then_unexpose_round_trips_through_the_registry() {
        let state = state();
        state.services.expose("printer", "127.0.0.1:9100", None).unwrap();
        assert_eq!(state.services.list().len(), 1);
        state.services.unexpose("printer").unwrap();
        assert!(state.services.list().is_empty());
    }
}

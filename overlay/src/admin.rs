//! Relay admin protocol (component L): a local admin socket (same
//! cookie/umask discipline as the control API) plus an overlay-facing
//! unseal protocol spoken over `/<namespace>/relay-unseal/1.0.0`.
//!
//! Grounded on [`control_api`]'s bind/serve shape for the local half, and
//! on the allow-list store's length-prefixed-record instincts for the
//! overlay-facing half -- here a single request/response frame rather than
//! a whole file.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::control_api::{bind_with_fresh_cookie, BoundSocket};
use crate::error::{OverlayError, Result};
use crate::invite::InvitePayload;
use crate::pairing::{PairingGroup, PairingGroupRegistry};
use crate::vault::{SecretMaterial, Vault, VaultStatus};

const MAX_FRAME_BYTES: u32 = 64 * 1024;

/// Namespaced protocol id for the overlay-facing unseal request, per §4.L.
pub fn unseal_protocol_id(namespace: &str) -> String {
    format!("/{namespace}/relay-unseal/1.0.0")
}

#[derive(Serialize, Deserialize)]
struct UnsealFrame {
    passphrase: String,
    totp_code: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct UnsealResponse {
    ok: bool,
    message: String,
}

async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| OverlayError::network_transient(format!("cannot read frame length: {e}")))?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(OverlayError::protocol("admin frame exceeds maximum size"));
    }
    let mut payload = vec![0u8; len as usize];
    stream
        .read_exact(&mut payload)
        .await
        .map_err(|e| OverlayError::network_transient(format!("cannot read frame body: {e}")))?;
    Ok(payload)
}

async fn write_frame<S: AsyncWrite + Unpin>(stream: &mut S, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len()).map_err(|_| OverlayError::internal("frame too large to send"))?;
    stream
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|e| OverlayError::network_transient(format!("cannot write frame length: {e}")))?;
    stream
        .write_all(payload)
        .await
        .map_err(|e| OverlayError::network_transient(format!("cannot write frame body: {e}")))?;
    Ok(())
}

/// Handle one `/relay-unseal/1.0.0` stream end to end: read the request
/// frame, attempt the unseal, and write back the `(ok, message)` response.
/// Never propagates the underlying vault error kind to the wire -- only
/// its message -- since this protocol has no authentication of its own
/// beyond the overlay transport's peer identity.
pub async fn handle_unseal_stream<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S, vault: &Vault) -> Result<()> {
    let raw = read_frame(stream).await?;
    let request: UnsealFrame = match serde_json::from_slice(&raw) {
        Ok(r) => r,
        Err(e) => {
            let response = UnsealResponse {
                ok: false,
                message: format!("malformed unseal request: {e}"),
            };
            return write_frame(stream, &serde_json::to_vec(&response).unwrap_or_default()).await;
        }
    };

    let response = match vault.unseal(&request.passphrase, request.totp_code.as_deref()) {
        Ok(()) => UnsealResponse {
            ok: true,
            message: "unsealed".to_string(),
        },
        Err(e) => UnsealResponse { ok: false, message: e.message },
    };
    write_frame(stream, &serde_json::to_vec(&response).map_err(|e| OverlayError::internal(e.to_string()))?).await
}

/// A macaroon-style attenuation caveat an inviter can attach to a group's
/// codes before they are redeemed. Caveats may only be added, never
/// removed or widened, once a code has been handed out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum InviteCaveat {
    ExpiresBy(u64),
    RestrictedToRole(String),
    MaxUses(u32),
}

/// Tracks the caveats attached to a group, additively. Not itself a
/// cryptographic macaroon (there is no chained-HMAC signature here, since
/// every caveat is enforced locally by the same relay that issued the
/// group rather than verified by a third party) -- the attenuation-only
/// discipline is what this type exists to enforce.
#[derive(Default)]
pub struct MacaroonCaveats {
    by_group: parking_lot::Mutex<std::collections::HashMap<String, Vec<InviteCaveat>>>,
}

impl MacaroonCaveats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a caveat to `group_id`. Attenuation-only: this never removes an
    /// existing caveat, so the effective policy can only get stricter.
    pub fn attenuate(&self, group_id: &str, caveat: InviteCaveat) {
        self.by_group.lock().entry(group_id.to_string()).or_default().push(caveat);
    }

    pub fn caveats_for(&self, group_id: &str) -> Vec<InviteCaveat> {
        self.by_group.lock().get(group_id).cloned().unwrap_or_default()
    }
}

/// Shared state behind the local admin HTTP surface.
pub struct AdminApiState {
    namespace: String,
    rendezvous_address: String,
    vault: Arc<Vault>,
    groups: Arc<PairingGroupRegistry>,
    caveats: Arc<MacaroonCaveats>,
}

impl AdminApiState {
    pub fn new(
        namespace: impl Into<String>,
        rendezvous_address: impl Into<String>,
        vault: Arc<Vault>,
        groups: Arc<PairingGroupRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            namespace: namespace.into(),
            rendezvous_address: rendezvous_address.into(),
            vault,
            groups,
            caveats: Arc::new(MacaroonCaveats::new()),
        })
    }
}

/// Bind the admin socket and serve until `cancel` fires. Shares the
/// control API's stale-socket/umask/cookie discipline verbatim.
pub async fn serve(
    bound: BoundSocket,
    state: Arc<AdminApiState>,
    cancel: CancellationToken,
    inviter_peer_id: String,
) -> Result<()> {
    info!("relay admin socket listening");
    loop {
        let (stream, _addr) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = bound_accept(&bound) => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "admin socket accept failed");
                    continue;
                }
            },
        };

        let state = Arc::clone(&state);
        let cookie = bound_cookie(&bound);
        let inviter_peer_id = inviter_peer_id.clone();
        let conn_cancel = cancel.child_token();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = hyper::service::service_fn(move |req| {
                let state = Arc::clone(&state);
                let cookie = cookie.clone();
                let inviter_peer_id = inviter_peer_id.clone();
                async move { Ok::<_, std::convert::Infallible>(route(req, state, cookie, inviter_peer_id).await) }
            });
            let conn = hyper::server::conn::http1::Builder::new().serve_connection(io, service);
            tokio::select! {
                _ = conn_cancel.cancelled() => {}
                result = conn => {
                    if let Err(e) = result {
                        warn!(error = %e, "admin connection error");
                    }
                }
            }
        });
    }
    bound_cleanup(&bound);
    Ok(())
}

async fn bound_accept(bound: &BoundSocket) -> std::io::Result<(tokio::net::UnixStream, tokio::net::unix::SocketAddr)> {
    bound.listener_ref().accept().await
}
fn bound_cookie(bound: &BoundSocket) -> String {
    bound.cookie.clone()
}
fn bound_cleanup(bound: &BoundSocket) {
    bound.cleanup();
}

fn json_response(status: StatusCode, body: Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .expect("static response parts are always valid")
}
fn ok(body: Value) -> Response<Full<Bytes>> {
    json_response(StatusCode::OK, json!({ "data": body }))
}
fn err(e: OverlayError) -> Response<Full<Bytes>> {
    let status = StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    json_response(status, json!({ "error": e.message }))
}
fn bad_request(message: impl Into<String>) -> Response<Full<Bytes>> {
    json_response(StatusCode::BAD_REQUEST, json!({ "error": message.into() }))
}

fn authorized(req: &Request<Incoming>, cookie: &str) -> bool {
    use subtle::ConstantTimeEq;
    let Some(header) = req.headers().get(hyper::header::AUTHORIZATION) else {
        return false;
    };
    let Ok(value) = header.to_str() else { return false };
    let Some(presented) = value.strip_prefix("Bearer ") else {
        return false;
    };
    presented.as_bytes().ct_eq(cookie.as_bytes()).into()
}

async fn read_json_body(req: Request<Incoming>) -> std::result::Result<Value, Response<Full<Bytes>>> {
    let bytes = req
        .collect()
        .await
        .map_err(|_| bad_request("cannot read request body"))?
        .to_bytes();
    if bytes.is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_slice(&bytes).map_err(|e| bad_request(format!("malformed JSON body: {e}")))
}

async fn route(
    req: Request<Incoming>,
    state: Arc<AdminApiState>,
    cookie: String,
    inviter_peer_id: String,
) -> Response<Full<Bytes>> {
    if !authorized(&req, &cookie) {
        return json_response(StatusCode::UNAUTHORIZED, json!({ "error": "missing or invalid bearer cookie" }));
    }

    let method = req.method().clone();
    let path = req.uri().path().trim_start_matches("/v1").to_string();

    match (method, path.as_str()) {
        (Method::GET, "/vault/status") => ok(json!({ "status": status_str(state.vault.status()) })),
        (Method::POST, "/vault/init") => handle_vault_init(req, &state).await,
        (Method::POST, "/vault/seal") => {
            state.vault.seal();
            ok(json!({ "status": status_str(state.vault.status()) }))
        }
        (Method::POST, "/vault/unseal") => handle_vault_unseal(req, &state).await,
        (Method::POST, "/groups") => handle_create_group(req, &state, &inviter_peer_id).await,
        (Method::GET, "/groups") => ok(json!(state.groups.list_groups().iter().map(group_to_json).collect::<Vec<_>>())),
        (Method::POST, path) if path.starts_with("/groups/") && path.ends_with("/revoke") => {
            handle_revoke_group(path, &state)
        }
        (Method::POST, path) if path.starts_with("/groups/") && path.ends_with("/caveats") => {
            handle_attenuate(req, path, &state).await
        }
        _ => json_response(StatusCode::NOT_FOUND, json!({ "error": "no such endpoint" })),
    }
}

fn status_str(status: VaultStatus) -> &'static str {
    match status {
        VaultStatus::Uninitialized => "uninitialized",
        VaultStatus::Sealed => "sealed",
        VaultStatus::Unsealed => "unsealed",
    }
}

fn group_to_json(g: &PairingGroup) -> Value {
    json!({
        "group_id": g.group_id,
        "total_codes": g.total_codes,
        "used_codes": g.used_codes,
        "created_at": g.created_at,
        "expires_at": g.expires_at,
        "network_tag": g.network_tag,
    })
}

#[derive(Deserialize)]
struct VaultInitBody {
    passphrase: String,
    confirm: String,
    enable_totp: bool,
    auto_seal_mins: Option<u64>,
}

async fn handle_vault_init(req: Request<Incoming>, state: &Arc<AdminApiState>) -> Response<Full<Bytes>> {
    let body = match read_json_body(req).await {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let body: VaultInitBody = match serde_json::from_value(body) {
        Ok(b) => b,
        Err(e) => return bad_request(format!("invalid body: {e}")),
    };

    let mut signing_key = [0u8; 32];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut signing_key);
    let pairing_seed = crate::vault::derive_pairing_seed(&signing_key);
    let secret = SecretMaterial { signing_key, pairing_seed };

    match state.vault.init(&body.passphrase, &body.confirm, secret, body.enable_totp, body.auto_seal_mins) {
        Ok(outcome) => ok(json!({
            "recovery_phrase": outcome.recovery_phrase,
            "totp_provisioning_uri": outcome.totp_provisioning_uri,
        })),
        Err(e) => err(e),
    }
}

#[derive(Deserialize)]
struct VaultUnsealBody {
    passphrase: String,
    totp_code: Option<String>,
}

async fn handle_vault_unseal(req: Request<Incoming>, state: &Arc<AdminApiState>) -> Response<Full<Bytes>> {
    let body = match read_json_body(req).await {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let body: VaultUnsealBody = match serde_json::from_value(body) {
        Ok(b) => b,
        Err(e) => return bad_request(format!("invalid body: {e}")),
    };
    match state.vault.unseal(&body.passphrase, body.totp_code.as_deref()) {
        Ok(()) => ok(json!({ "status": status_str(state.vault.status()) })),
        Err(e) => err(e),
    }
}

#[derive(Deserialize)]
struct CreateGroupBody {
    count: u32,
    ttl_secs: u64,
    joiner_expiry_secs: Option<u64>,
    network_tag: Option<String>,
}

async fn handle_create_group(req: Request<Incoming>, state: &Arc<AdminApiState>, inviter_peer_id: &str) -> Response<Full<Bytes>> {
    let body = match read_json_body(req).await {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let body: CreateGroupBody = match serde_json::from_value(body) {
        Ok(b) => b,
        Err(e) => return bad_request(format!("invalid body: {e}")),
    };

    let (group_id, tokens) = match state.groups.create_group(
        body.count,
        Duration::from_secs(body.ttl_secs),
        body.joiner_expiry_secs.map(Duration::from_secs),
        body.network_tag.clone(),
    ) {
        Ok(v) => v,
        Err(e) => return err(e),
    };

    let codes: Vec<String> = tokens
        .into_iter()
        .filter_map(|token| {
            InvitePayload {
                token,
                inviter_peer_id: inviter_peer_id.to_string(),
                rendezvous_address: state.rendezvous_address.clone(),
                network_tag: body.network_tag.clone(),
            }
            .encode()
            .ok()
        })
        .collect();

    ok(json!({ "group_id": group_id, "codes": codes }))
}

fn handle_revoke_group(path: &str, state: &Arc<AdminApiState>) -> Response<Full<Bytes>> {
    let Some(group_id) = path.strip_prefix("/groups/").and_then(|rest| rest.strip_suffix("/revoke")) else {
        return bad_request("malformed group id");
    };
    match state.groups.revoke_group(group_id) {
        Ok(()) => ok(json!({ "revoked": true })),
        Err(e) => err(e),
    }
}

#[derive(Deserialize)]
struct AttenuateBody {
    caveat: InviteCaveat,
}

async fn handle_attenuate(req: Request<Incoming>, path: &str, state: &Arc<AdminApiState>) -> Response<Full<Bytes>> {
    let Some(group_id) = path.strip_prefix("/groups/").and_then(|rest| rest.strip_suffix("/caveats")) else {
        return bad_request("malformed group id");
    };
    let body = match read_json_body(req).await {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let body: AttenuateBody = match serde_json::from_value(body) {
        Ok(b) => b,
        Err(e) => return bad_request(format!("invalid body: {e}")),
    };
    state.caveats.attenuate(group_id, body.caveat);
    ok(json!({ "caveats": state.caveats.caveats_for(group_id) }))
}

impl Serialize for InviteCaveat {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            InviteCaveat::ExpiresBy(ts) => {
                let mut s = serializer.serialize_struct_variant("InviteCaveat", 0, "ExpiresBy", 1)?;
                use serde::ser::SerializeStructVariant;
                s.serialize_field("at", ts)?;
                s.end()
            }
            InviteCaveat::RestrictedToRole(role) => {
                let mut s = serializer.serialize_struct_variant("InviteCaveat", 1, "RestrictedToRole", 1)?;
                use serde::ser::SerializeStructVariant;
                s.serialize_field("role", role)?;
                s.end()
            }
            InviteCaveat::MaxUses(n) => {
                let mut s = serializer.serialize_struct_variant("InviteCaveat", 2, "MaxUses", 1)?;
                use serde::ser::SerializeStructVariant;
                s.serialize_field("n", n)?;
                s.end()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn unseal_protocol_id_is_namespaced() {
        assert_eq!(unseal_protocol_id("homelab"), "/homelab/relay-unseal/1.0.0");
    }

    #[tokio::test]
    async fn unseal_stream_round_trips_success_and_failure() {
        let dir = tempdir().unwrap();
        let vault = Vault::load(dir.path().join("vault.json")).unwrap();
        vault
            .init(
                "correct horse battery staple",
                "correct horse battery staple",
                SecretMaterial { signing_key: [1; 32], pairing_seed: [2; 32] },
                false,
                None,
            )
            .unwrap();

        let (mut client, mut server) = tokio::io::duplex(4096);
        let vault_for_server = vault;
        let server_task = tokio::spawn(async move { handle_unseal_stream(&mut server, &vault_for_server).await });

        let request = serde_json::to_vec(&UnsealFrame {
            passphrase: "correct horse battery staple".to_string(),
            totp_code: None,
        })
        .unwrap();
        write_frame(&mut client, &request).await.unwrap();
        server_task.await.unwrap().unwrap();

        let response = read_frame(&mut client).await.unwrap();
        let response: UnsealResponse = serde_json::from_slice(&response).unwrap();
        assert!(response.ok);
    }

    #[test]
    fn caveats_are_additive_only() {
        let caveats = MacaroonCaveats::new();
        caveats.attenuate("g1", InviteCaveat::MaxUses(5));
        caveats.attenuate("g1", InviteCaveat::RestrictedToRole("member".to_string()));
        assert_eq!(caveats.caveats_for("g1").len(), 2);
        assert!(caveats.caveats_for("g2").is_empty());
    }
}

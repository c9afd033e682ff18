//! Service registry & proxy (component J): maps a local TCP target to an
//! overlay protocol id and bidirectionally proxies bytes between the two,
//! in both directions (exposing a local service, and dialing out to a
//! remote one).

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use crate::error::{OverlayError, Result};

/// `1-63, lowercase alphanumeric and hyphen, not hyphen-bounded`.
pub fn validate_service_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.len() <= 63
        && !name.starts_with('-')
        && !name.ends_with('-')
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');
    if ok {
        Ok(())
    } else {
        Err(OverlayError::protocol(format!(
            "'{name}' is not a valid service name (1-63 lowercase alphanumeric/hyphen, not hyphen-bounded)"
        )))
    }
}

/// A local TCP target mapped to an overlay protocol id.
#[derive(Debug, Clone)]
pub struct ServiceRecord {
    pub name: String,
    pub protocol_id: String,
    pub local_address: String,
    pub enabled: bool,
}

fn default_protocol_id(namespace: &str, name: &str) -> String {
    format!("/{namespace}/{name}/1.0.0")
}

struct Entry {
    record: ServiceRecord,
    /// Flips to `false` on `unexpose`; new inbound streams are refused, but
    /// existing ones (outside this registry's bookkeeping) run to completion.
    accepting: Arc<std::sync::atomic::AtomicBool>,
}

/// Registry of locally exposed services, consulted by the overlay's stream
/// handler to route an inbound protocol-id stream to a local TCP address.
pub struct ServiceRegistry {
    namespace: String,
    entries: RwLock<Vec<Entry>>,
}

impl ServiceRegistry {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Register a handler for `name`, resolved to `protocol_override` or the
    /// namespace-derived default protocol id.
    pub fn expose(
        &self,
        name: &str,
        local_address: &str,
        protocol_override: Option<String>,
    ) -> Result<ServiceRecord> {
        validate_service_name(name)?;
        let protocol_id = protocol_override.unwrap_or_else(|| default_protocol_id(&self.namespace, name));
        let record = ServiceRecord {
            name: name.to_string(),
            protocol_id,
            local_address: local_address.to_string(),
            enabled: true,
        };

        let mut entries = self.entries.write();
        if let Some(existing) = entries.iter_mut().find(|e| e.record.name == name) {
            existing.record = record.clone();
            existing.accepting.store(true, std::sync::atomic::Ordering::SeqCst);
        } else {
            entries.push(Entry {
                record: record.clone(),
                accepting: Arc::new(std::sync::atomic::AtomicBool::new(true)),
            });
        }
        Ok(record)
    }

    /// Remove the handler for `name`. Refuses new streams immediately;
    /// streams already in flight are untouched by this call.
    pub fn unexpose(&self, name: &str) -> Result<()> {
        let mut entries = self.entries.write();
        let pos = entries
            .iter()
            .position(|e| e.record.name == name)
            .ok_or_else(|| OverlayError::protocol(format!("no exposed service named '{name}'")))?;
        entries[pos].accepting.store(false, std::sync::atomic::Ordering::SeqCst);
        entries.remove(pos);
        Ok(())
    }

    /// Records in insertion order.
    pub fn list(&self) -> Vec<ServiceRecord> {
        self.entries.read().iter().map(|e| e.record.clone()).collect()
    }

    pub fn resolve_by_protocol(&self, protocol_id: &str) -> Option<ServiceRecord> {
        self.entries
            .read()
            .iter()
            .find(|e| e.record.protocol_id == protocol_id)
            .map(|e| e.record.clone())
    }

    /// Open a TCP connection to the service's local address and copy bytes
    /// in both directions with `stream` until either side closes, then
    /// close both. Called once per inbound overlay stream for a registered
    /// protocol id.
    pub async fn handle_inbound_stream<S>(&self, protocol_id: &str, stream: S) -> Result<ProxyStats>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let record = self
            .resolve_by_protocol(protocol_id)
            .ok_or_else(|| OverlayError::network_permanent(format!("protocol '{protocol_id}' is not registered")))?;

        let tcp = TcpStream::connect(&record.local_address)
            .await
            .map_err(|e| OverlayError::network_transient(format!("cannot reach {}: {e}", record.local_address)))?;

        debug!(service = %record.name, local = %record.local_address, "proxying inbound stream to local service");
        copy_bidirectional(stream, tcp).await
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProxyStats {
    pub bytes_to_local: u64,
    pub bytes_from_local: u64,
}

/// Copy bytes in both directions between an overlay stream and a TCP
/// connection until either side reaches EOF, then shut down both halves.
pub async fn copy_bidirectional<S, T>(overlay: S, tcp: T) -> Result<ProxyStats>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut overlay_read, mut overlay_write) = tokio::io::split(overlay);
    let (mut tcp_read, mut tcp_write) = tokio::io::split(tcp);

    let to_local = tokio::io::copy(&mut overlay_read, &mut tcp_write);
    let from_local = tokio::io::copy(&mut tcp_read, &mut overlay_write);

    let result = futures::future::try_join(to_local, from_local).await;

    overlay_write.shutdown().await.ok();
    tcp_write.shutdown().await.ok();

    match result {
        Ok((bytes_to_local, bytes_from_local)) => Ok(ProxyStats {
            bytes_to_local,
            bytes_from_local,
        }),
        Err(e) => Err(OverlayError::network_transient(e.to_string())),
    }
}

/// The complementary TCP listener (§4.J): binds `listen_address`, then
/// spawns an accept loop that, for each local TCP connection, invokes
/// `dial` (typically wrapped by component I's retry) to obtain an overlay
/// stream and proxies bytes symmetrically. Returns the bound address
/// immediately; the accept loop runs until `cancel` fires, per the ≤3s
/// cancellation bound control-API proxies must honor.
pub async fn spawn_tcp_listener<D, Fut, S>(
    listen_address: &str,
    dial: D,
    cancel: tokio_util::sync::CancellationToken,
) -> Result<std::net::SocketAddr>
where
    D: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<S>> + Send,
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let listener = TcpListener::bind(listen_address)
        .await
        .map_err(|e| OverlayError::configuration(format!("cannot bind {listen_address}: {e}")))?;
    let bound_addr = listener
        .local_addr()
        .map_err(|e| OverlayError::configuration(e.to_string()))?;

    let dial = Arc::new(dial);
    tokio::spawn(run_accept_loop(listener, dial, cancel));
    Ok(bound_addr)
}

async fn run_accept_loop<D, Fut, S>(listener: TcpListener, dial: Arc<D>, cancel: tokio_util::sync::CancellationToken)
where
    D: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<S>> + Send,
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        let (tcp, peer_addr) = tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "tcp accept failed");
                    continue;
                }
            },
        };

        let dial = Arc::clone(&dial);
        let child = cancel.child_token();
        tokio::spawn(async move {
            let overlay_stream = tokio::select! {
                _ = child.cancelled() => return,
                result = dial() => match result {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!(peer = %peer_addr, error = %e, "dial for proxied connection failed");
                        return;
                    }
                },
            };
            if let Err(e) = copy_bidirectional(overlay_stream, tcp).await {
                debug!(peer = %peer_addr, error = %e, "proxy connection ended");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expose_rejects_hyphen_bounded_names() {
        let registry = ServiceRegistry::new("overlay");
        assert!(registry.expose("-bad", "127.0.0.1:9000", None).is_err());
    }

    #[test]
    fn expose_derives_the_namespaced_protocol_id_by_default() {
        let registry = ServiceRegistry::new("homelab");
        let record = registry.expose("printer", "127.0.0.1:9100", None).unwrap();
        assert_eq!(record.protocol_id, "/homelab/printer/1.0.0");
    }

    #[test]
    fn expose_honors_a_protocol_override() {
        let registry = ServiceRegistry::new("homelab");
        let record = registry
            .expose("printer", "127.0.0.1:9100", Some("/custom/1.0.0".to_string()))
            .unwrap();
        assert_eq!(record.protocol_id, "/custom/1.0.0");
    }

    #[test]
    fn unexpose_removes_the_handler_and_is_idempotent_failure() {
        let registry = ServiceRegistry::new("homelab");
        registry.expose("printer", "127.0.0.1:9100", None).unwrap();
        assert!(registry.unexpose("printer").is_ok());
        assert!(registry.unexpose("printer").is_err());
        assert!(registry.list().is_empty());
    }

    #[test]
    fn list_is_insertion_ordered() {
        let registry = ServiceRegistry::new("homelab");
        registry.expose("b-svc", "127.0.0.1:1", None).unwrap();
        registry.expose("a-svc", "127.0.0.1:2", None).unwrap();
        let names: Vec<_> = registry.list().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["b-svc", "a-svc"]);
    }

    #[tokio::test]
    async fn copy_bidirectional_moves_bytes_both_ways() {
        let (client_a, server_a) = tokio::io::duplex(1024);
        let (client_b, server_b) = tokio::io::duplex(1024);

        let mut client_a = client_a;
        let mut client_b = client_b;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        client_a.write_all(b"to-local").await.unwrap();
        client_a.shutdown().await.unwrap();

        let stats = copy_bidirectional(server_a, server_b).await.unwrap();
        assert_eq!(stats.bytes_to_local, 8);

        client_b.write_all(b"echo").await.unwrap();
        drop(client_b);
        let mut buf = Vec::new();
        let _ = client_a.read_to_end(&mut buf).await;
    }
}

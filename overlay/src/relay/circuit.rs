//! Circuit engine (the other half of component G): admits relay circuits
//! against live reservations and runs the bounded, rate-limited byte pump
//! between a circuit's two hops.
//!
//! Grounded on the `OutboundCircuit`/`CircuitPool` expiry bookkeeping this
//! codebase already uses for onion circuits, adapted from a 3-hop onion
//! pool to a single relayed hop with a hard per-direction byte budget.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::error::{OverlayError, Result};
use crate::identity::PeerId;
use crate::relay::reservation::ReservationEngine;

#[derive(Debug, Clone)]
pub struct CircuitLimits {
    pub max_circuits: u32,
    pub session_duration: Duration,
    pub session_data_limit: u64,
    pub buffer_size: usize,
}

impl Default for CircuitLimits {
    fn default() -> Self {
        Self {
            max_circuits: 512,
            session_duration: Duration::from_secs(600),
            session_data_limit: 64 * 1024 * 1024,
            buffer_size: 16 * 1024,
        }
    }
}

struct CircuitHandle {
    terminal_peer: PeerId,
    created_at: Instant,
    deadline: Instant,
    bytes_a_to_b: Arc<AtomicU64>,
    bytes_b_to_a: Arc<AtomicU64>,
    cancel: CancellationToken,
}

/// Tracks live circuits and admits new ones against the reservation engine.
/// Does not own the reservation table itself, only a reference to it, per
/// the "single engine owns both tables" resource policy.
pub struct CircuitEngine {
    limits: CircuitLimits,
    reservations: Arc<ReservationEngine>,
    circuits: RwLock<HashMap<u64, CircuitHandle>>,
    next_id: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitStats {
    pub bytes_a_to_b: u64,
    pub bytes_b_to_a: u64,
}

impl CircuitEngine {
    pub fn new(limits: CircuitLimits, reservations: Arc<ReservationEngine>) -> Self {
        Self {
            limits,
            reservations,
            circuits: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn live_count(&self) -> usize {
        self.circuits.read().len()
    }

    /// Admit a circuit to `terminal_peer` if it holds a live reservation and
    /// the engine is under `max_circuits`. Admission failure is reported
    /// synchronously; there is no queuing of blocked requests.
    fn admit(&self, terminal_peer: &PeerId) -> Result<u64> {
        if !self.reservations.has_live_reservation(terminal_peer) {
            return Err(OverlayError::authorization(
                "terminal peer holds no live reservation",
            ));
        }

        let mut circuits = self.circuits.write();
        if circuits.len() as u32 >= self.limits.max_circuits {
            return Err(OverlayError::resource("circuit table is full"));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        circuits.insert(
            id,
            CircuitHandle {
                terminal_peer: terminal_peer.clone(),
                created_at: now,
                deadline: now + self.limits.session_duration,
                bytes_a_to_b: Arc::new(AtomicU64::new(0)),
                bytes_b_to_a: Arc::new(AtomicU64::new(0)),
                cancel: CancellationToken::new(),
            },
        );
        Ok(id)
    }

    pub fn stats(&self, circuit_id: u64) -> Option<CircuitStats> {
        self.circuits.read().get(&circuit_id).map(|h| CircuitStats {
            bytes_a_to_b: h.bytes_a_to_b.load(Ordering::Relaxed),
            bytes_b_to_a: h.bytes_b_to_a.load(Ordering::Relaxed),
        })
    }

    fn remove(&self, circuit_id: u64) {
        self.circuits.write().remove(&circuit_id);
    }

    /// Admit a circuit to `terminal_peer` and pump bytes between `side_a`
    /// and `side_b` until one side closes, the session deadline elapses, the
    /// per-direction byte budget is exceeded, or cancellation fires.
    pub async fn run_circuit<A, B>(
        &self,
        terminal_peer: PeerId,
        side_a: A,
        side_b: B,
    ) -> Result<CircuitStats>
    where
        A: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let circuit_id = self.admit(&terminal_peer)?;
        let handle_snapshot = {
            let circuits = self.circuits.read();
            let h = circuits.get(&circuit_id).expect("just inserted");
            (
                h.deadline,
                Arc::clone(&h.bytes_a_to_b),
                Arc::clone(&h.bytes_b_to_a),
                h.cancel.clone(),
            )
        };
        let (deadline, bytes_a_to_b, bytes_b_to_a, cancel) = handle_snapshot;

        let result = pump_bidirectional(
            side_a,
            side_b,
            self.limits.session_data_limit,
            self.limits.buffer_size,
            deadline,
            cancel,
            bytes_a_to_b.clone(),
            bytes_b_to_a.clone(),
        )
        .await;

        let stats = CircuitStats {
            bytes_a_to_b: bytes_a_to_b.load(Ordering::Relaxed),
            bytes_b_to_a: bytes_b_to_a.load(Ordering::Relaxed),
        };
        self.remove(circuit_id);
        result.map(|()| stats)
    }

    /// Close every circuit terminating at `peer_id`, used when that peer's
    /// reservation expires or is evicted.
    pub fn close_circuits_for_peer(&self, peer_id: &PeerId) {
        let circuits = self.circuits.read();
        for handle in circuits.values() {
            if &handle.terminal_peer == peer_id {
                handle.cancel.cancel();
            }
        }
    }

    pub fn oldest_age(&self, circuit_id: u64) -> Option<Duration> {
        self.circuits
            .read()
            .get(&circuit_id)
            .map(|h| h.created_at.elapsed())
    }
}

#[allow(clippy::too_many_arguments)]
async fn pump_bidirectional<A, B>(
    side_a: A,
    side_b: B,
    session_data_limit: u64,
    buffer_size: usize,
    deadline: Instant,
    cancel: CancellationToken,
    bytes_a_to_b: Arc<AtomicU64>,
    bytes_b_to_a: Arc<AtomicU64>,
) -> Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut a_read, mut a_write) = tokio::io::split(side_a);
    let (mut b_read, mut b_write) = tokio::io::split(side_b);

    let remaining = deadline.saturating_duration_since(Instant::now());

    let a_to_b = copy_capped(&mut a_read, &mut b_write, buffer_size, session_data_limit, bytes_a_to_b);
    let b_to_a = copy_capped(&mut b_read, &mut a_write, buffer_size, session_data_limit, bytes_b_to_a);

    let outcome = tokio::select! {
        res = futures::future::try_join(a_to_b, b_to_a) => res.map(|_| ()),
        _ = tokio::time::sleep(remaining) => Err(OverlayError::network_transient("circuit session deadline reached")),
        _ = cancel.cancelled() => Err(OverlayError::network_transient("circuit cancelled")),
    };

    a_write.shutdown().await.ok();
    b_write.shutdown().await.ok();
    outcome
}

/// Copy from `reader` to `writer` until EOF, or until `budget` (this
/// direction's byte counter) reaches `session_data_limit` -- the write is
/// clamped to what remains of the budget so this direction never forwards a
/// byte past the cap.
async fn copy_capped<R, W>(
    reader: &mut R,
    writer: &mut W,
    buffer_size: usize,
    session_data_limit: u64,
    budget: Arc<AtomicU64>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    use tokio::io::AsyncReadExt;

    let mut buf = vec![0u8; buffer_size];
    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| OverlayError::network_transient(e.to_string()))?;
        if n == 0 {
            return Ok(());
        }

        let prior_total = budget.load(Ordering::Relaxed);
        let remaining = session_data_limit.saturating_sub(prior_total);
        if remaining == 0 {
            return Err(OverlayError::resource("circuit data budget exceeded"));
        }
        let write_len = std::cmp::min(n as u64, remaining) as usize;

        writer
            .write_all(&buf[..write_len])
            .await
            .map_err(|e| OverlayError::network_transient(e.to_string()))?;
        budget.fetch_add(write_len as u64, Ordering::Relaxed);

        if write_len < n {
            return Err(OverlayError::resource("circuit data budget exceeded"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::reservation::{ReservationEngine, ReservationLimits};
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::io::AsyncWriteExt as _;

    fn peer(seed: u8) -> PeerId {
        PeerId(hex::encode([seed; 32]))
    }

    fn ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))
    }

    fn engine_with_reservation(p: &PeerId) -> Arc<ReservationEngine> {
        let reservations = Arc::new(ReservationEngine::new(ReservationLimits::default(), None));
        reservations.try_reserve(p.clone(), ip()).unwrap();
        reservations
    }

    #[tokio::test]
    async fn circuit_rejected_without_a_live_reservation() {
        let reservations = Arc::new(ReservationEngine::new(ReservationLimits::default(), None));
        let engine = CircuitEngine::new(CircuitLimits::default(), reservations);
        let (a, _a_peer) = tokio::io::duplex(64);
        let (b, _b_peer) = tokio::io::duplex(64);
        let err = engine.run_circuit(peer(1), a, b).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Authorization);
        assert_eq!(engine.live_count(), 0);
    }

    #[tokio::test]
    async fn max_circuits_cap_is_enforced() {
        let target = peer(1);
        let reservations = engine_with_reservation(&target);
        let limits = CircuitLimits {
            max_circuits: 0,
            ..CircuitLimits::default()
        };
        let engine = CircuitEngine::new(limits, reservations);
        let (a, _a_peer) = tokio::io::duplex(64);
        let (b, _b_peer) = tokio::io::duplex(64);
        let err = engine.run_circuit(target, a, b).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Resource);
    }

    #[tokio::test]
    async fn byte_budget_closes_the_circuit_once_exceeded() {
        let target = peer(1);
        let reservations = engine_with_reservation(&target);
        let limits = CircuitLimits {
            session_data_limit: 4,
            buffer_size: 1024,
            ..CircuitLimits::default()
        };
        let engine = Arc::new(CircuitEngine::new(limits, reservations));

        let (mut a_local, a_remote) = tokio::io::duplex(1024);
        let (_b_local, b_remote) = tokio::io::duplex(1024);

        let run = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.run_circuit(target, a_remote, b_remote).await })
        };

        a_local.write_all(b"hello world").await.unwrap();
        a_local.shutdown().await.unwrap();

        let result = run.await.unwrap();
        let err = result.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Resource);
    }

    #[tokio::test]
    async fn proxy_conserves_bytes_across_both_directions() {
        let target = peer(1);
        let reservations = engine_with_reservation(&target);
        let engine = Arc::new(CircuitEngine::new(CircuitLimits::default(), reservations));

        let (mut a_local, a_remote) = tokio::io::duplex(1024);
        let (mut b_local, b_remote) = tokio::io::duplex(1024);

        let run = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.run_circuit(target, a_remote, b_remote).await })
        };

        a_local.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        tokio::io::AsyncReadExt::read_exact(&mut b_local, &mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        b_local.write_all(b"pong!").await.unwrap();
        let mut buf2 = [0u8; 5];
        tokio::io::AsyncReadExt::read_exact(&mut a_local, &mut buf2).await.unwrap();
        assert_eq!(&buf2, b"pong!");

        drop(a_local);
        drop(b_local);

        let stats = run.await.unwrap().unwrap();
        assert_eq!(stats.bytes_a_to_b, 4);
        assert_eq!(stats.bytes_b_to_a, 5);
    }

    #[tokio::test]
    async fn close_circuits_for_peer_cancels_the_running_pump() {
        let target = peer(1);
        let reservations = engine_with_reservation(&target);
        let engine = Arc::new(CircuitEngine::new(CircuitLimits::default(), reservations));

        let (_a_local, a_remote) = tokio::io::duplex(1024);
        let (_b_local, b_remote) = tokio::io::duplex(1024);

        let run = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.run_circuit(target.clone(), a_remote, b_remote).await })
        };

        // Give the spawned task a chance to register the circuit before we
        // close it, without relying on a fixed sleep duration.
        for _ in 0..100 {
            if engine.live_count() == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(engine.live_count(), 1);

        engine.close_circuits_for_peer(&peer(1));
        let result = run.await.unwrap();
        assert!(result.is_err());
        assert_eq!(engine.live_count(), 0);
    }
}

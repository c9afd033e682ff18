//! Observability (component P): a small Prometheus registry tracking the
//! handful of gauges and counters an operator needs to see the relay/peer
//! doing its job -- current reservations, current circuits, bytes proxied,
//! pairing outcomes. No HTTP exporter is bundled; a caller that wants to
//! serve `/metrics` takes `Metrics::registry()` and hands it to whatever
//! scrape endpoint it already runs.

use std::sync::Arc;

use prometheus::{IntCounter, IntGauge, Registry};

use crate::error::{OverlayError, Result};

pub struct Metrics {
    registry: Registry,
    pub reservations_current: IntGauge,
    pub circuits_current: IntGauge,
    pub proxy_bytes_total: IntCounter,
    pub pairing_success_total: IntCounter,
    pub pairing_failure_total: IntCounter,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>> {
        let registry = Registry::new();

        let reservations_current = IntGauge::new("overlay_reservations_current", "Live relay reservations")
            .map_err(|e| OverlayError::internal(format!("metrics: {e}")))?;
        let circuits_current = IntGauge::new("overlay_circuits_current", "Live relayed circuits")
            .map_err(|e| OverlayError::internal(format!("metrics: {e}")))?;
        let proxy_bytes_total = IntCounter::new("overlay_proxy_bytes_total", "Bytes proxied through this node")
            .map_err(|e| OverlayError::internal(format!("metrics: {e}")))?;
        let pairing_success_total = IntCounter::new(
            "overlay_pairing_success_total",
            "Pairing handshakes that admitted a new peer",
        )
        .map_err(|e| OverlayError::internal(format!("metrics: {e}")))?;
        let pairing_failure_total = IntCounter::new(
            "overlay_pairing_failure_total",
            "Pairing handshakes that were rejected or failed",
        )
        .map_err(|e| OverlayError::internal(format!("metrics: {e}")))?;

        for collector in [
            Box::new(reservations_current.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(circuits_current.clone()),
            Box::new(proxy_bytes_total.clone()),
            Box::new(pairing_success_total.clone()),
            Box::new(pairing_failure_total.clone()),
        ] {
            registry
                .register(collector)
                .map_err(|e| OverlayError::internal(format!("metrics: {e}")))?;
        }

        Ok(Arc::new(Self {
            registry,
            reservations_current,
            circuits_current,
            proxy_bytes_total,
            pairing_success_total,
            pairing_failure_total,
        }))
    }

    /// Exposed for a caller that wants to wire a scrape endpoint; this crate
    /// does not bind one itself.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_proxy_bytes(&self, bytes: u64) {
        self.proxy_bytes_total.inc_by(bytes);
    }

    pub fn record_pairing_success(&self) {
        self.pairing_success_total.inc();
    }

    pub fn record_pairing_failure(&self) {
        self.pairing_failure_total.inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_registers_every_collector_without_panicking() {
        let metrics = Metrics::new().unwrap();
        assert!(metrics.registry().gather().len() >= 5);
    }

    #[test]
    fn counters_and_gauges_move_as_expected() {
        let metrics = Metrics::new().unwrap();
        metrics.reservations_current.set(3);
        metrics.circuits_current.inc();
        metrics.record_proxy_bytes(1024);
        metrics.record_pairing_success();
        metrics.record_pairing_failure();

        assert_eq!(metrics.reservations_current.get(), 3);
        assert_eq!(metrics.circuits_current.get(), 1);
        assert_eq!(metrics.proxy_bytes_total.get(), 1024);
        assert_eq!(metrics.pairing_success_total.get(), 1);
        assert_eq!(metrics.pairing_failure_total.get(), 1);
    }
}

//! Prometheus metrics for the port table. Gauges are set inline by
//! `PortTable` at the same point its state changes, rather than through a
//! pull-based `Collector`: `Collector::encode` is synchronous, and the
//! table's state lives behind a `tokio::sync::RwLock`, so there's no way to
//! read it from a sync scrape callback without blocking the runtime.
use prometheus_client::{metrics::gauge::Gauge, registry::Registry};

/// Point-in-time gauges describing the table's mapping set.
#[derive(Clone, Default)]
pub struct PortTableMetrics {
    pub(crate) mappings_active: Gauge,
    pub(crate) mappings_failed: Gauge,
    pub(crate) host_ports_free: Gauge,
}

impl PortTableMetrics {
    /// Registers the gauges with `prom` and returns the handles `PortTable`
    /// updates on every allocate/release/populate.
    pub fn register(prom: &mut Registry) -> Self {
        let metrics = Self::default();
        prom.register(
            "npl_mappings_active",
            "Number of host-port mappings with an installed rule",
            metrics.mappings_active.clone(),
        );
        prom.register(
            "npl_mappings_failed",
            "Number of host-port mappings whose rule install failed",
            metrics.mappings_failed.clone(),
        );
        prom.register(
            "npl_host_ports_free",
            "Number of host ports in the configured range not currently mapped",
            metrics.host_ports_free.clone(),
        );
        metrics
    }
}

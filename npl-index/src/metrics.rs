//! Reconciler-level metrics. Gauges and counters are set inline at the call
//! site that observes the change, the same as `npl_port_table::PortTableMetrics`.
use prometheus_client::{metrics::counter::Counter, registry::Registry};

/// Counts errors the reconciler observed while applying a pod event.
#[derive(Clone, Default)]
pub struct ReconcileMetrics {
    errors: Counter,
}

impl ReconcileMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let metrics = Self::default();
        prom.register(
            "npl_reconcile_errors",
            "Count of errors encountered while reconciling pod state",
            metrics.errors.clone(),
        );
        metrics
    }

    pub(crate) fn record_error(&self) {
        self.errors.inc();
    }
}

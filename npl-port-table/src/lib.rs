//! The port-allocation table: the only component that allocates host ports
//! or invokes a [`RuleDriver`], and the only shared mutable state in the
//! agent.
#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod metrics;

pub use metrics::PortTableMetrics;

use npl_core::{HostPort, Mapping, MappingState, PortRange};
use npl_rules::{DriverError, RuleDriver};
use std::{collections::BTreeMap, net::TcpListener};
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error("no free host port available in range {start}-{end}")]
    Exhaustion { start: u16, end: u16 },
    #[error(transparent)]
    Driver(#[from] DriverError),
}

struct Inner {
    /// Keyed by host port so ascending free-port search and `populate`
    /// reconstruction are both deterministic: iterating the map's keys
    /// walks the range in order.
    by_port: BTreeMap<u16, Mapping>,
}

/// Authoritative node-local index of [`Mapping`]s.
///
/// Holds a readers-writer lock covering both the in-memory index and the
/// call into the `RuleDriver`, so that the external (kernel) effect and the
/// in-memory effect are observed as one step. `tokio::sync::RwLock` is used
/// rather than a `std`/`parking_lot` lock because the write guard is held
/// across the driver's `.await` points.
pub struct PortTable<D> {
    inner: RwLock<Inner>,
    range: PortRange,
    driver: D,
    metrics: Option<PortTableMetrics>,
}

impl<D: RuleDriver> PortTable<D> {
    pub fn new(range: PortRange, driver: D) -> Self {
        Self {
            inner: RwLock::new(Inner {
                by_port: BTreeMap::new(),
            }),
            range,
            driver,
            metrics: None,
        }
    }

    /// Attach Prometheus gauges, updated on every subsequent mutation.
    pub fn with_metrics(mut self, metrics: PortTableMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    fn observe(&self, by_port: &BTreeMap<u16, Mapping>) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        let active = by_port.values().filter(|m| m.state == MappingState::Active).count();
        let failed = by_port.values().filter(|m| m.state == MappingState::Failed).count();
        let total = self.range.end as i64 - self.range.start as i64 + 1;
        metrics.mappings_active.set(active as i64);
        metrics.mappings_failed.set(failed as i64);
        metrics.host_ports_free.set(total - by_port.len() as i64);
    }

    /// Query the driver for all rules currently in the managed chain and
    /// replace the table atomically with `Active` mappings built from them.
    /// Called once at startup, before the watcher starts, so a restarted
    /// agent picks up the rules a previous run left installed instead of
    /// reallocating them.
    pub async fn populate(&self) -> Result<(), TableError> {
        self.driver.init().await?;
        let rules = self.driver.list_rules().await?;
        let mut by_port = BTreeMap::new();
        for (host_port, destination) in rules {
            let Some((pod_ip, pod_port)) = destination.rsplit_once(':') else {
                warn!(%destination, "skipping rule with malformed destination");
                continue;
            };
            let Ok(pod_port) = pod_port.parse::<u16>() else {
                warn!(%destination, "skipping rule with non-numeric destination port");
                continue;
            };
            by_port.insert(
                host_port.0,
                Mapping {
                    host_port,
                    pod_ip: pod_ip.to_string(),
                    pod_port,
                    state: MappingState::Active,
                },
            );
        }
        info!(mappings = by_port.len(), "populated port table from driver");
        self.observe(&by_port);
        *self.inner.write().await = Inner { by_port };
        Ok(())
    }

    /// Return an existing mapping for `(pod_ip, pod_port)`, or allocate the
    /// smallest free host port in range, install the rule, and return it.
    pub async fn allocate(&self, pod_ip: &str, pod_port: u16) -> Result<HostPort, TableError> {
        let mut inner = self.inner.write().await;

        if let Some(existing) = find_by_endpoint(&inner.by_port, pod_ip, pod_port) {
            return Ok(existing.host_port);
        }

        let host_port = self
            .find_free_port(&inner.by_port)
            .ok_or(TableError::Exhaustion {
                start: self.range.start,
                end: self.range.end,
            })?;

        inner.by_port.insert(
            host_port.0,
            Mapping {
                host_port,
                pod_ip: pod_ip.to_string(),
                pod_port,
                state: MappingState::Pending,
            },
        );

        let destination = format!("{pod_ip}:{pod_port}");
        let result = match self.driver.add_rule(host_port, &destination).await {
            Ok(()) => {
                if let Some(m) = inner.by_port.get_mut(&host_port.0) {
                    m.state = MappingState::Active;
                }
                info!(%host_port, pod_ip, pod_port, "allocated host port");
                Ok(host_port)
            }
            Err(error) => {
                if let Some(m) = inner.by_port.get_mut(&host_port.0) {
                    m.state = MappingState::Failed;
                }
                warn!(%host_port, pod_ip, pod_port, %error, "rule install failed");
                Err(error.into())
            }
        };
        self.observe(&inner.by_port);
        result
    }

    /// Release the mapping for `(pod_ip, pod_port)`. A missing mapping is a
    /// no-op success. Driver failure leaves the entry in the table.
    pub async fn release(&self, pod_ip: &str, pod_port: u16) -> Result<(), TableError> {
        let mut inner = self.inner.write().await;
        let Some(host_port) = find_by_endpoint(&inner.by_port, pod_ip, pod_port)
            .map(|m| m.host_port)
        else {
            return Ok(());
        };
        let destination = format!("{pod_ip}:{pod_port}");
        self.driver.delete_rule(host_port, &destination).await?;
        inner.by_port.remove(&host_port.0);
        info!(%host_port, pod_ip, pod_port, "released host port");
        self.observe(&inner.by_port);
        Ok(())
    }

    /// Release every mapping belonging to `pod_ip` (pod deleted). Attempts
    /// every endpoint even if one fails; returns the first error, if any.
    pub async fn release_all_by_pod_ip(&self, pod_ip: &str) -> Result<(), TableError> {
        let endpoints: Vec<u16> = {
            let inner = self.inner.read().await;
            inner
                .by_port
                .values()
                .filter(|m| m.pod_ip == pod_ip)
                .map(|m| m.pod_port)
                .collect()
        };
        let mut first_error = None;
        for pod_port in endpoints {
            if let Err(error) = self.release(pod_ip, pod_port).await {
                warn!(pod_ip, pod_port, %error, "failed to release mapping");
                first_error.get_or_insert(error);
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Tear down all auxiliary driver state. Used on shutdown, and only when
    /// explicitly configured: leaving rules in place is the default so that
    /// in-flight connections survive an agent restart.
    pub async fn delete_all(&self) -> Result<(), TableError> {
        let _inner = self.inner.write().await;
        self.driver.delete_all().await?;
        Ok(())
    }

    pub async fn exists(&self, pod_ip: &str, pod_port: u16) -> bool {
        let inner = self.inner.read().await;
        find_by_endpoint(&inner.by_port, pod_ip, pod_port).is_some()
    }

    pub async fn get(&self, host_port: HostPort) -> Option<Mapping> {
        let inner = self.inner.read().await;
        inner.by_port.get(&host_port.0).cloned()
    }

    pub async fn get_by(&self, pod_ip: &str, pod_port: u16) -> Option<Mapping> {
        let inner = self.inner.read().await;
        find_by_endpoint(&inner.by_port, pod_ip, pod_port).cloned()
    }

    /// All mappings currently tracked, for metrics/diagnostics.
    pub async fn snapshot(&self) -> Vec<Mapping> {
        self.inner.read().await.by_port.values().cloned().collect()
    }

    /// Smallest integer in `[start, end]` neither used in the table nor
    /// bound on the host. `by_port` is a `BTreeMap`, so iterating its keys
    /// alone wouldn't catch gaps; we walk the configured range in order
    /// instead, returning `None` once the whole range has been checked and
    /// nothing is free.
    fn find_free_port(&self, by_port: &BTreeMap<u16, Mapping>) -> Option<HostPort> {
        for port in self.range.iter() {
            if by_port.contains_key(&port) {
                continue;
            }
            if is_port_available(port) {
                return Some(HostPort(port));
            }
        }
        None
    }
}

fn find_by_endpoint<'a>(
    by_port: &'a BTreeMap<u16, Mapping>,
    pod_ip: &str,
    pod_port: u16,
) -> Option<&'a Mapping> {
    by_port
        .values()
        .find(|m| m.pod_ip == pod_ip && m.pod_port == pod_port)
}

/// Bind-and-immediately-close liveness probe: a port may be free in the
/// table yet held by an unrelated process, so a table-only check is not
/// sufficient.
fn is_port_available(port: u16) -> bool {
    TcpListener::bind(("0.0.0.0", port)).is_ok()
}

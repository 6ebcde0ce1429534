//! Turns pod lifecycle events into `PortTable`/`Annotator` operations. One
//! task consumes the watch stream and applies updates sequentially, so
//! per-pod ordering is free and there is no index-internal locking to
//! reason about.
#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod metrics;
mod writeback;

pub use self::metrics::ReconcileMetrics;
pub use self::writeback::{WriteBackJob, Writeback};

use npl_core::HostPort;
use npl_k8s_api::{Event, Pod, ResourceExt, Watch};
use npl_rules::RuleDriver;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

/// Errors the reconciler can observe while applying a pod event. None of
/// these propagate out of [`PodReconciler::run`]: a single bad pod event
/// shouldn't take the whole loop down, so each is logged and recorded
/// against [`ReconcileMetrics`] at the point it occurs instead.
#[derive(Debug, thiserror::Error)]
enum ReconcileError {
    #[error(transparent)]
    Table(#[from] npl_port_table::TableError),
    #[error("writeback task is gone, dropping annotation update")]
    WritebackClosed,
}

/// Namespace/name identity of a pod, independent of its `resourceVersion`.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
struct PodKey {
    namespace: String,
    name: String,
}

impl PodKey {
    fn of(pod: &Pod) -> Self {
        Self {
            namespace: pod.namespace().unwrap_or_default(),
            name: pod.name_any(),
        }
    }
}

impl fmt::Display for PodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// What the reconciler last observed for a pod it considers local to this
/// node. Pods that are not local, or not yet assigned IPs, are absent here.
#[derive(Clone, Debug)]
struct CachedPod {
    resource_version: String,
    pod_ip: String,
    ports: BTreeSet<u16>,
}

/// Event-driven translator from pod watch events to `PortTable` and
/// `Annotator` operations, per the OnAdd/OnDelete/OnUpdate semantics.
pub struct PodReconciler<D> {
    port_table: Arc<npl_port_table::PortTable<D>>,
    hostname: String,
    cache: HashMap<PodKey, CachedPod>,
    writeback: UnboundedSender<WriteBackJob>,
    metrics: ReconcileMetrics,
}

fn is_local(pod: &Pod, hostname: &str) -> bool {
    npl_k8s_api::node_name(pod) == Some(hostname)
}

impl<D: RuleDriver> PodReconciler<D> {
    pub fn new(
        port_table: Arc<npl_port_table::PortTable<D>>,
        hostname: String,
        writeback: UnboundedSender<WriteBackJob>,
        metrics: ReconcileMetrics,
    ) -> Self {
        Self {
            port_table,
            hostname,
            cache: HashMap::new(),
            writeback,
            metrics,
        }
    }

    fn record_error(&self, key: &PodKey, context: &'static str, error: ReconcileError) {
        tracing::warn!(%error, pod = %key, context, "reconcile error, dropping and continuing");
        self.metrics.record_error();
    }

    /// Drives the reconciler off a pod watch until the process is stopped.
    pub async fn run(mut self, mut watch: Watch<Pod>) {
        loop {
            match watch.recv().await {
                Event::Applied(pod) => self.handle_applied(pod).await,
                Event::Deleted(pod) => self.on_delete(&pod).await,
                Event::Restarted(pods) => self.reset(pods).await,
            }
        }
    }

    async fn handle_applied(&mut self, pod: Pod) {
        let key = PodKey::of(&pod);
        if self.cache.contains_key(&key) {
            self.on_update(pod).await;
        } else {
            self.on_add(pod).await;
        }
    }

    /// A new, or newly-local, pod. Allocates every declared container port
    /// and upserts the annotation. Pods missing `podIP`/`hostIP` are left
    /// for the update that assigns them.
    async fn on_add(&mut self, pod: Pod) {
        let key = PodKey::of(&pod);
        if !is_local(&pod, &self.hostname) {
            return;
        }
        let (pod_ip, host_ip) = match (npl_k8s_api::pod_ip(&pod), npl_k8s_api::host_ip(&pod)) {
            (Some(p), Some(h)) => (p.to_string(), h.to_string()),
            _ => {
                tracing::debug!(pod = %key, "pod has no podIP/hostIP yet, awaiting update");
                return;
            }
        };

        let ports: BTreeSet<u16> = npl_k8s_api::declared_ports(&pod).into_iter().collect();
        let upserts = self.allocate_ports(&key, &pod_ip, &host_ip, ports.iter().copied()).await;
        if !upserts.is_empty() {
            self.enqueue(&key, upserts, Vec::new());
        }

        self.cache.insert(
            key,
            CachedPod {
                resource_version: pod.resource_version().unwrap_or_default(),
                pod_ip,
                ports,
            },
        );
    }

    /// A pod this reconciler was tracking as local is gone. Releases every
    /// mapping it held; the annotation disappears with the pod object.
    async fn on_delete(&mut self, pod: &Pod) {
        let key = PodKey::of(pod);
        if let Some(cached) = self.cache.remove(&key) {
            if let Err(error) = self.port_table.release_all_by_pod_ip(&cached.pod_ip).await {
                self.record_error(&key, "on_delete", error.into());
            }
        }
    }

    /// Diffs the previously-cached port set against the pod's current
    /// declared ports, per the added/removed/kept split.
    async fn on_update(&mut self, pod: Pod) {
        let key = PodKey::of(&pod);

        if !is_local(&pod, &self.hostname) {
            // Moved off this node, or a namespace change took it out of
            // scope: equivalent to delete.
            self.on_delete(&pod).await;
            return;
        }

        let Some(cached) = self.cache.get(&key).cloned() else {
            // First sighting of this pod as local: treat as add.
            self.on_add(pod).await;
            return;
        };

        let rv = pod.resource_version().unwrap_or_default();
        if cached.resource_version == rv {
            return;
        }

        let (pod_ip, host_ip) = match (npl_k8s_api::pod_ip(&pod), npl_k8s_api::host_ip(&pod)) {
            (Some(p), Some(h)) => (p.to_string(), h.to_string()),
            _ => return,
        };

        let new_ports: BTreeSet<u16> = npl_k8s_api::declared_ports(&pod).into_iter().collect();
        let added = new_ports.difference(&cached.ports).copied();
        let removed: Vec<u16> = cached.ports.difference(&new_ports).copied().collect();
        let kept: Vec<u16> = cached.ports.intersection(&new_ports).copied().collect();

        let mut upserts = self.allocate_ports(&key, &pod_ip, &host_ip, added).await;

        let mut removals = Vec::with_capacity(removed.len());
        for port in removed {
            if let Err(error) = self.port_table.release(&pod_ip, port).await {
                self.record_error(&key, "on_update release", error.into());
            }
            removals.push(port);
        }

        // Recover from restart drift: a kept port whose mapping vanished
        // (e.g. the driver's rules were flushed) is re-allocated as if new.
        for port in kept {
            if self.port_table.get_by(&pod_ip, port).await.is_none() {
                upserts.extend(self.allocate_ports(&key, &pod_ip, &host_ip, std::iter::once(port)).await);
            }
        }

        if !upserts.is_empty() || !removals.is_empty() {
            self.enqueue(&key, upserts, removals);
        }

        self.cache.insert(
            key,
            CachedPod { resource_version: rv, pod_ip, ports: new_ports },
        );
    }

    /// A full relist: release every locally-tracked pod that is no longer
    /// present, then apply each listed pod as if freshly observed.
    async fn reset(&mut self, pods: Vec<Pod>) {
        let present: HashSet<PodKey> = pods.iter().map(PodKey::of).collect();
        let stale: Vec<PodKey> = self
            .cache
            .keys()
            .filter(|key| !present.contains(*key))
            .cloned()
            .collect();
        for key in stale {
            if let Some(cached) = self.cache.remove(&key) {
                if let Err(error) = self.port_table.release_all_by_pod_ip(&cached.pod_ip).await {
                    self.record_error(&key, "reset", error.into());
                }
            }
        }
        for pod in pods {
            self.handle_applied(pod).await;
        }
    }

    async fn allocate_ports(
        &self,
        key: &PodKey,
        pod_ip: &str,
        host_ip: &str,
        ports: impl Iterator<Item = u16>,
    ) -> Vec<(u16, String, HostPort)> {
        let mut upserts = Vec::new();
        for port in ports {
            match self.port_table.allocate(pod_ip, port).await {
                Ok(host_port) => upserts.push((port, host_ip.to_string(), host_port)),
                Err(error) => self.record_error(key, "allocate", error.into()),
            }
        }
        upserts
    }

    fn enqueue(&self, key: &PodKey, upserts: Vec<(u16, String, HostPort)>, removals: Vec<u16>) {
        let job = WriteBackJob {
            namespace: key.namespace.clone(),
            name: key.name.clone(),
            upserts,
            removals,
        };
        if self.writeback.send(job).is_err() {
            self.record_error(key, "enqueue", ReconcileError::WritebackClosed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, ContainerPort, PodSpec, PodStatus};
    use npl_k8s_api::ObjectMeta;
    use npl_port_table::PortTable;
    use npl_rules::FakeRuleDriver;
    use tokio::sync::mpsc;

    fn pod(name: &str, node: &str, pod_ip: &str, host_ip: &str, ports: &[i32], rv: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                namespace: Some("default".into()),
                name: Some(name.into()),
                resource_version: Some(rv.into()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some(node.into()),
                containers: vec![Container {
                    name: "c".into(),
                    ports: Some(
                        ports
                            .iter()
                            .map(|p| ContainerPort { container_port: *p, ..Default::default() })
                            .collect(),
                    ),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: Some(PodStatus {
                pod_ip: Some(pod_ip.into()),
                host_ip: Some(host_ip.into()),
                ..Default::default()
            }),
        }
    }

    fn reconciler() -> (PodReconciler<FakeRuleDriver>, mpsc::UnboundedReceiver<WriteBackJob>) {
        let range = npl_core::PortRange { start: 40000, end: 40010 };
        let table = Arc::new(PortTable::new(range, FakeRuleDriver::new()));
        let (tx, rx) = mpsc::unbounded_channel();
        (PodReconciler::new(table, "node-a".into(), tx, ReconcileMetrics::default()), rx)
    }

    #[tokio::test]
    async fn on_add_allocates_every_declared_port_and_queues_writeback() {
        let (mut r, mut rx) = reconciler();
        r.on_add(pod("p1", "node-a", "10.0.0.1", "192.168.1.1", &[80, 443], "1")).await;

        let snapshot = r.port_table.snapshot().await;
        assert_eq!(snapshot.len(), 2);

        let job = rx.try_recv().expect("writeback job queued");
        assert_eq!(job.upserts.len(), 2);
        assert!(job.removals.is_empty());
    }

    #[tokio::test]
    async fn on_add_ignores_pod_on_another_node() {
        let (mut r, mut rx) = reconciler();
        r.on_add(pod("p1", "node-b", "10.0.0.1", "192.168.1.1", &[80], "1")).await;

        assert!(r.port_table.snapshot().await.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn on_add_without_pod_ip_is_deferred() {
        let (mut r, mut rx) = reconciler();
        let mut missing_ip = pod("p1", "node-a", "", "", &[80], "1");
        missing_ip.status = None;
        r.on_add(missing_ip).await;

        assert!(r.port_table.snapshot().await.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn on_update_diffs_added_removed_and_kept_ports() {
        let (mut r, mut rx) = reconciler();
        r.on_add(pod("p1", "node-a", "10.0.0.1", "192.168.1.1", &[80, 443], "1")).await;
        rx.try_recv().unwrap();

        r.on_update(pod("p1", "node-a", "10.0.0.1", "192.168.1.1", &[443, 8080], "2")).await;

        let job = rx.try_recv().expect("second writeback job queued");
        assert_eq!(job.upserts.len(), 1);
        assert_eq!(job.upserts[0].0, 8080);
        assert_eq!(job.removals, vec![80]);

        assert!(r.port_table.get_by("10.0.0.1", 443).await.is_some());
        assert!(r.port_table.get_by("10.0.0.1", 80).await.is_none());
    }

    #[tokio::test]
    async fn on_update_same_resource_version_is_a_noop() {
        let (mut r, mut rx) = reconciler();
        r.on_add(pod("p1", "node-a", "10.0.0.1", "192.168.1.1", &[80], "1")).await;
        rx.try_recv().unwrap();

        r.on_update(pod("p1", "node-a", "10.0.0.1", "192.168.1.1", &[80], "1")).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn on_update_moving_off_node_releases_all_ports() {
        let (mut r, mut rx) = reconciler();
        r.on_add(pod("p1", "node-a", "10.0.0.1", "192.168.1.1", &[80], "1")).await;
        rx.try_recv().unwrap();

        r.on_update(pod("p1", "node-b", "10.0.0.1", "192.168.1.1", &[80], "2")).await;

        assert!(r.port_table.snapshot().await.is_empty());
        assert!(!r.cache.contains_key(&PodKey { namespace: "default".into(), name: "p1".into() }));
    }

    #[tokio::test]
    async fn on_update_recovers_kept_port_dropped_by_driver() {
        let (mut r, mut rx) = reconciler();
        r.on_add(pod("p1", "node-a", "10.0.0.1", "192.168.1.1", &[80], "1")).await;
        rx.try_recv().unwrap();

        r.port_table.release("10.0.0.1", 80).await.unwrap();
        assert!(r.port_table.get_by("10.0.0.1", 80).await.is_none());

        r.on_update(pod("p1", "node-a", "10.0.0.1", "192.168.1.1", &[80], "2")).await;

        assert!(r.port_table.get_by("10.0.0.1", 80).await.is_some());
        let job = rx.try_recv().expect("recovery writeback queued");
        assert_eq!(job.upserts[0].0, 80);
    }

    #[tokio::test]
    async fn on_delete_releases_all_ports_and_forgets_the_pod() {
        let (mut r, mut rx) = reconciler();
        r.on_add(pod("p1", "node-a", "10.0.0.1", "192.168.1.1", &[80, 443], "1")).await;
        rx.try_recv().unwrap();

        r.on_delete(&pod("p1", "node-a", "10.0.0.1", "192.168.1.1", &[80, 443], "1")).await;

        assert!(r.port_table.snapshot().await.is_empty());
        assert!(r.cache.is_empty());
    }

    #[tokio::test]
    async fn reset_releases_pods_missing_from_the_relist() {
        let (mut r, mut rx) = reconciler();
        r.on_add(pod("p1", "node-a", "10.0.0.1", "192.168.1.1", &[80], "1")).await;
        rx.try_recv().unwrap();

        r.reset(vec![pod("p2", "node-a", "10.0.0.2", "192.168.1.1", &[81], "1")]).await;
        rx.try_recv().expect("p2 writeback queued");

        assert!(r.port_table.get_by("10.0.0.1", 80).await.is_none());
        assert!(r.port_table.get_by("10.0.0.2", 81).await.is_some());
    }
}

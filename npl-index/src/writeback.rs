//! Decouples annotation writes from the reconcile loop: the indexer only
//! ever enqueues an update; a separate task owns the API client and retries
//! against the cluster's current view of the pod.
use npl_annotation::PodAnnotationRecord;
use npl_core::HostPort;
use npl_k8s_api::{Api, Client, Patch, PatchParams, Pod, ResourceExt};
use tokio::sync::mpsc::UnboundedReceiver;

const MAX_ATTEMPTS: u32 = 5;

/// One batch of annotation changes for a single pod, queued by the reconciler.
pub struct WriteBackJob {
    pub namespace: String,
    pub name: String,
    pub upserts: Vec<(u16, String, HostPort)>,
    pub removals: Vec<u16>,
}

/// Applies queued [`WriteBackJob`]s against the API, retrying on conflict.
pub struct Writeback {
    client: Client,
}

impl Writeback {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Drains `rx` until the reconciler drops its sender.
    pub async fn run(self, mut rx: UnboundedReceiver<WriteBackJob>) {
        while let Some(job) = rx.recv().await {
            self.apply(job).await;
        }
    }

    async fn apply(&self, job: WriteBackJob) {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &job.namespace);

        for attempt in 1..=MAX_ATTEMPTS {
            let pod = match api.get(&job.name).await {
                Ok(pod) => pod,
                Err(error) => {
                    tracing::warn!(
                        namespace = %job.namespace, name = %job.name, %error,
                        "failed to read pod for annotation writeback",
                    );
                    return;
                }
            };

            let mut records: Vec<PodAnnotationRecord> =
                npl_annotation::read_from(Some(pod.annotations()));
            for (pod_port, host_ip, host_port) in &job.upserts {
                npl_annotation::upsert(&mut records, *pod_port, host_ip, *host_port);
            }
            for pod_port in &job.removals {
                npl_annotation::remove(&mut records, *pod_port);
            }

            let patch = serde_json::json!({
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": {
                    "resourceVersion": pod.resource_version(),
                    "annotations": { npl_annotation::ANNOTATION_KEY: npl_annotation::serialize(&records) },
                },
            });

            match api.patch(&job.name, &PatchParams::default(), &Patch::Merge(patch)).await {
                Ok(_) => return,
                Err(npl_k8s_api::Error::Api(resp)) if resp.code == 409 => {
                    tracing::debug!(
                        namespace = %job.namespace, name = %job.name, attempt,
                        "pod changed concurrently, retrying annotation writeback",
                    );
                    continue;
                }
                Err(error) => {
                    tracing::warn!(
                        namespace = %job.namespace, name = %job.name, %error,
                        "failed to patch pod annotation",
                    );
                    return;
                }
            }
        }

        tracing::error!(
            namespace = %job.namespace, name = %job.name,
            "giving up on annotation writeback after repeated conflicts",
        );
    }
}

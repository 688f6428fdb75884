//! Node-level cluster operations used by the driver manager.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::api::Patch;
use kube::api::PatchParams;
use kube::Api;
use kube::Client;
use kube::ResourceExt;
use serde_json::json;
use tokio::time::sleep;
use tokio::time::Instant;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::config::DrainOptions;
use crate::k8s::drain;
use crate::k8s::drain::PodDeleteList;
use crate::k8s::drain::PodDeleteStatus;
use crate::k8s::gpu_pods::pod_uses_gpu;
use crate::k8s::gpu_pods::GpuClaimLookup;
use crate::k8s::KubernetesError;
use crate::k8s::ResourceClaimCache;

const LABEL_UPDATE_RETRIES: u32 = 5;
const POD_TERMINATION_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Result of a GPU-pod eviction attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    /// GPU pods found on the node.
    pub gpu_pods: usize,
    /// GPU pods that passed the drain filters.
    pub deletable: usize,
    /// Why the remaining GPU pods could not be deleted.
    pub errors: Vec<String>,
}

impl EvictionReport {
    /// True when every GPU pod on the node was deletable.
    pub fn is_complete(&self) -> bool {
        self.deletable == self.gpu_pods
    }
}

/// GPU pods on a node and the subset that may be deleted.
#[derive(Debug, Default)]
pub struct GpuEvictionPlan {
    pub gpu_pods: usize,
    pub deletable: PodDeleteList,
}

impl GpuEvictionPlan {
    pub fn report(&self) -> EvictionReport {
        EvictionReport {
            gpu_pods: self.gpu_pods,
            deletable: self.deletable.pods.len(),
            errors: self.deletable.errors.clone(),
        }
    }
}

/// Selects the GPU pods among `pods` and runs them through the drain filters.
pub fn plan_gpu_eviction(
    pods: Vec<Pod>,
    options: &DrainOptions,
    claims: &impl GpuClaimLookup,
) -> GpuEvictionPlan {
    let gpu_pods = pods.iter().filter(|pod| pod_uses_gpu(pod, claims)).count();
    let deletable = drain::pods_for_deletion(pods, options, |pod| {
        if pod_uses_gpu(pod, claims) {
            PodDeleteStatus::Okay
        } else {
            PodDeleteStatus::Skip("pod does not use an NVIDIA GPU")
        }
    });

    GpuEvictionPlan {
        gpu_pods,
        deletable,
    }
}

/// Cluster operations the driver manager needs on its own node.
#[async_trait]
pub trait ClusterControl: Send + Sync {
    /// Labels of the node; a node without labels yields an empty map.
    async fn node_labels(&self, node: &str)
        -> Result<BTreeMap<String, String>, Report<KubernetesError>>;

    /// Annotations of the node; a node without annotations yields an empty map.
    async fn node_annotations(
        &self,
        node: &str,
    ) -> Result<BTreeMap<String, String>, Report<KubernetesError>>;

    /// Writes all given labels in one update.
    async fn update_node_labels(
        &self,
        node: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), Report<KubernetesError>>;

    async fn cordon(&self, node: &str) -> Result<(), Report<KubernetesError>>;

    async fn uncordon(&self, node: &str) -> Result<(), Report<KubernetesError>>;

    /// Waits until no pod matching `selector` in `namespace` runs on `node`.
    async fn wait_for_pod_termination(
        &self,
        selector: &str,
        namespace: &str,
        node: &str,
        timeout: Duration,
    ) -> Result<(), Report<KubernetesError>>;

    /// Evicts every evictable pod from the node.
    async fn drain_node(
        &self,
        node: &str,
        options: &DrainOptions,
    ) -> Result<(), Report<KubernetesError>>;

    /// Evicts the node's GPU pods, but only if all of them can be evicted.
    async fn evict_gpu_pods(
        &self,
        node: &str,
        options: &DrainOptions,
    ) -> Result<EvictionReport, Report<KubernetesError>>;
}

/// [`ClusterControl`] backed by the Kubernetes API.
pub struct KubeCluster {
    client: Client,
    claims: Arc<ResourceClaimCache>,
}

impl KubeCluster {
    pub fn new(client: Client, claims: Arc<ResourceClaimCache>) -> Self {
        Self { client, claims }
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    async fn get_node(&self, node: &str) -> Result<Node, Report<KubernetesError>> {
        self.nodes()
            .get(node)
            .await
            .change_context(KubernetesError::NodeReadFailed {
                node: node.to_string(),
            })
    }

    /// Evicts every GPU pod from `node` without touching its labels or schedulability.
    ///
    /// Refuses to evict anything unless all GPU pods pass the drain filters.
    /// With `dry_run` the pods are only listed.
    #[tracing::instrument(skip(self, options))]
    pub async fn nvdrain(
        &self,
        node: &str,
        options: &DrainOptions,
        dry_run: bool,
    ) -> Result<EvictionReport, Report<KubernetesError>> {
        let pods = drain::list_node_pods(&self.client, node, None).await?;
        let plan = plan_gpu_eviction(pods, options, self.claims.as_ref());
        let report = plan.report();

        for pod in &plan.deletable.pods {
            info!("GPU pod - {}", drain::pod_ref(pod));
        }
        if !report.is_complete() {
            return Err(Report::new(KubernetesError::DrainFailed {
                node: node.to_string(),
                message: format!(
                    "only {} of {} GPU pods can be deleted: {}",
                    report.deletable, report.gpu_pods, plan.deletable
                ),
            }));
        }
        if dry_run {
            info!("Dry run, not deleting {} GPU pods", report.deletable);
            return Ok(report);
        }
        if report.gpu_pods == 0 {
            info!("No GPU pods to delete");
            return Ok(report);
        }

        drain::delete_or_evict_pods(&self.client, plan.deletable.pods, options)
            .await
            .change_context(KubernetesError::DrainFailed {
                node: node.to_string(),
                message: "failed to delete all GPU pods".to_string(),
            })?;
        info!("Deleted {} GPU pods", report.deletable);
        Ok(report)
    }

    async fn patch_labels(
        &self,
        node: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), Report<KubernetesError>> {
        let patch = json!({ "metadata": { "labels": labels } });
        self.nodes()
            .patch(node, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .change_context(KubernetesError::NodeUpdateFailed {
                node: node.to_string(),
            })?;
        Ok(())
    }
}

#[async_trait]
impl ClusterControl for KubeCluster {
    async fn node_labels(
        &self,
        node: &str,
    ) -> Result<BTreeMap<String, String>, Report<KubernetesError>> {
        Ok(self.get_node(node).await?.labels().clone())
    }

    async fn node_annotations(
        &self,
        node: &str,
    ) -> Result<BTreeMap<String, String>, Report<KubernetesError>> {
        Ok(self.get_node(node).await?.annotations().clone())
    }

    #[tracing::instrument(skip(self, labels))]
    async fn update_node_labels(
        &self,
        node: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), Report<KubernetesError>> {
        let mut retry_count = 0;

        loop {
            match self.patch_labels(node, labels).await {
                Ok(()) => {
                    debug!(labels = ?labels, "Updated node labels");
                    return Ok(());
                }
                Err(e) => {
                    retry_count += 1;
                    warn!(
                        "Failed to update node labels (attempt {}/{}): {e:?}",
                        retry_count, LABEL_UPDATE_RETRIES
                    );
                    if retry_count >= LABEL_UPDATE_RETRIES {
                        return Err(e.attach_printable(format!(
                            "giving up after {LABEL_UPDATE_RETRIES} attempts"
                        )));
                    }
                    sleep(Duration::from_millis(200 * (1 << retry_count))).await;
                }
            }
        }
    }

    async fn cordon(&self, node: &str) -> Result<(), Report<KubernetesError>> {
        info!(node, "Cordoning node");
        self.nodes()
            .cordon(node)
            .await
            .change_context(KubernetesError::NodeUpdateFailed {
                node: node.to_string(),
            })
            .attach_printable("cordon")?;
        Ok(())
    }

    async fn uncordon(&self, node: &str) -> Result<(), Report<KubernetesError>> {
        info!(node, "Uncordoning node");
        self.nodes()
            .uncordon(node)
            .await
            .change_context(KubernetesError::NodeUpdateFailed {
                node: node.to_string(),
            })
            .attach_printable("uncordon")?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn wait_for_pod_termination(
        &self,
        selector: &str,
        namespace: &str,
        node: &str,
        timeout: Duration,
    ) -> Result<(), Report<KubernetesError>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams {
            label_selector: Some(selector.to_string()),
            field_selector: Some(format!("spec.nodeName={node}")),
            ..Default::default()
        };
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = pods
                .list(&params)
                .await
                .change_context(KubernetesError::PodListFailed {
                    message: format!("pods matching {selector} in {namespace}"),
                })?;
            if remaining.items.is_empty() {
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Report::new(KubernetesError::PodTerminationTimeout {
                    selector: selector.to_string(),
                    timeout,
                }));
            }
            debug!(
                pods = remaining.items.len(),
                "Waiting for pods to terminate"
            );
            sleep(POD_TERMINATION_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    #[tracing::instrument(skip(self, options))]
    async fn drain_node(
        &self,
        node: &str,
        options: &DrainOptions,
    ) -> Result<(), Report<KubernetesError>> {
        info!("Draining node");
        let drain_failed = || KubernetesError::DrainFailed {
            node: node.to_string(),
            message: "could not evict all pods".to_string(),
        };

        let pods =
            drain::list_node_pods(&self.client, node, options.pod_selector.as_deref()).await?;
        let list = drain::pods_for_deletion(pods, options, |_| PodDeleteStatus::Okay);
        if !list.errors.is_empty() {
            return Err(Report::new(KubernetesError::DrainFailed {
                node: node.to_string(),
                message: list.to_string(),
            }));
        }

        drain::delete_or_evict_pods(&self.client, list.pods, options)
            .await
            .change_context_lazy(drain_failed)
    }

    #[tracing::instrument(skip(self, options))]
    async fn evict_gpu_pods(
        &self,
        node: &str,
        options: &DrainOptions,
    ) -> Result<EvictionReport, Report<KubernetesError>> {
        info!("Identifying GPU pods to delete");
        let pods = drain::list_node_pods(&self.client, node, None).await?;
        let plan = plan_gpu_eviction(pods, options, self.claims.as_ref());
        let report = plan.report();

        if report.gpu_pods == 0 {
            info!("No GPU pods to delete");
            return Ok(report);
        }
        if !report.is_complete() {
            error!(
                gpu_pods = report.gpu_pods,
                deletable = report.deletable,
                "Cannot delete all GPU pods"
            );
            for e in &report.errors {
                error!("error reported by drain filters: {e}");
            }
            return Ok(report);
        }

        for pod in &plan.deletable.pods {
            info!("GPU pod - {}", drain::pod_ref(pod));
        }
        info!("Deleting GPU pods...");
        drain::delete_or_evict_pods(&self.client, plan.deletable.pods, options)
            .await
            .change_context(KubernetesError::DrainFailed {
                node: node.to_string(),
                message: "failed to delete all GPU pods".to_string(),
            })?;

        Ok(report)
    }
}

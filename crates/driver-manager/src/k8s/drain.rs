//! Pod selection and eviction for draining a node, similar to `kubectl drain`.
//!
//! Cordoning is not handled here, `kube` provides `Api::cordon()`.
//! Evictions go through the Eviction API so PodDisruptionBudgets are respected.

use std::fmt;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use futures::stream;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::DeleteParams;
use kube::api::EvictParams;
use kube::api::ListParams;
use kube::Api;
use kube::Client;
use kube::ResourceExt;
use tokio::time::sleep;
use tokio::time::Instant;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::config::DrainOptions;
use crate::k8s::KubernetesError;

// Waiting for deletion counts against this limit too.
const CONCURRENT_EVICTIONS: usize = 5;

// `kubectl drain` also waits 5 seconds between eviction attempts.
const EVICTION_RETRY_INTERVAL: Duration = Duration::from_secs(5);
const DELETION_CHECK_INTERVAL: Duration = Duration::from_secs(5);

const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";

/// Outcome of running a pod through the drain filters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodDeleteStatus {
    /// The pod should be removed.
    Okay,
    /// The pod stays on the node and is not a problem.
    Skip(&'static str),
    /// The pod stays on the node and blocks the drain.
    Error(String),
}

impl PodDeleteStatus {
    fn is_okay(&self) -> bool {
        matches!(self, PodDeleteStatus::Okay)
    }
}

/// Pods selected for removal plus the reasons others could not be selected.
#[derive(Debug, Default)]
pub struct PodDeleteList {
    pub pods: Vec<Pod>,
    pub errors: Vec<String>,
}

impl fmt::Display for PodDeleteList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.errors.join("; "))
    }
}

/// Lists every pod scheduled on `node_name`, optionally narrowed by a label selector.
#[tracing::instrument(skip(client))]
pub async fn list_node_pods(
    client: &Client,
    node_name: &str,
    label_selector: Option<&str>,
) -> Result<Vec<Pod>, Report<KubernetesError>> {
    let pods: Api<Pod> = Api::all(client.clone());
    let params = ListParams {
        field_selector: Some(format!("spec.nodeName={node_name}")),
        label_selector: label_selector.map(str::to_string),
        ..Default::default()
    };

    let list = pods
        .list(&params)
        .await
        .change_context(KubernetesError::PodListFailed {
            message: format!("pods on node {node_name}"),
        })?;
    Ok(list.items)
}

/// Runs every pod through `filter` and then the standard drain filters.
///
/// DaemonSet members and static mirror pods are always skipped. Pods with
/// emptyDir volumes or without a controller are reported as errors unless
/// the options allow deleting them. Completed pods pass both of those checks.
pub fn pods_for_deletion(
    pods: Vec<Pod>,
    options: &DrainOptions,
    filter: impl Fn(&Pod) -> PodDeleteStatus,
) -> PodDeleteList {
    let mut list = PodDeleteList::default();

    for pod in pods {
        let local_storage = |pod: &Pod| local_storage_filter(pod, options);
        let unreplicated = |pod: &Pod| unreplicated_filter(pod, options);
        let filters: [PodFilter<'_>; 5] = [
            &filter,
            &daemon_set_filter,
            &mirror_pod_filter,
            &local_storage,
            &unreplicated,
        ];

        match first_verdict(&pod, &filters) {
            PodDeleteStatus::Okay => list.pods.push(pod),
            PodDeleteStatus::Skip(reason) => {
                debug!(pod = %pod_ref(&pod), "Not draining pod: {reason}");
            }
            PodDeleteStatus::Error(message) => {
                list.errors.push(format!("{}: {message}", pod_ref(&pod)));
            }
        }
    }

    list
}

type PodFilter<'a> = &'a dyn Fn(&Pod) -> PodDeleteStatus;

/// Returns the first verdict that is not `Okay`. Later filters are not run.
fn first_verdict(pod: &Pod, filters: &[PodFilter<'_>]) -> PodDeleteStatus {
    filters
        .iter()
        .map(|filter| filter(pod))
        .find(|status| !status.is_okay())
        .unwrap_or(PodDeleteStatus::Okay)
}

fn is_completed(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        .is_some_and(|phase| phase == "Succeeded" || phase == "Failed")
}

fn daemon_set_filter(pod: &Pod) -> PodDeleteStatus {
    // The DaemonSet controller ignores node cordons, so we don't battle it.
    let owned_by_daemon_set = pod
        .owner_references()
        .iter()
        .any(|owner| owner.controller == Some(true) && owner.kind == "DaemonSet");
    if owned_by_daemon_set {
        PodDeleteStatus::Skip("pod is member of a DaemonSet")
    } else {
        PodDeleteStatus::Okay
    }
}

fn mirror_pod_filter(pod: &Pod) -> PodDeleteStatus {
    if pod.annotations().contains_key(MIRROR_POD_ANNOTATION) {
        PodDeleteStatus::Skip("pod is a static mirror pod")
    } else {
        PodDeleteStatus::Okay
    }
}

fn local_storage_filter(pod: &Pod, options: &DrainOptions) -> PodDeleteStatus {
    let uses_empty_dir = pod
        .spec
        .as_ref()
        .and_then(|spec| spec.volumes.as_ref())
        .is_some_and(|volumes| volumes.iter().any(|volume| volume.empty_dir.is_some()));

    if !uses_empty_dir || is_completed(pod) || options.delete_emptydir_data {
        PodDeleteStatus::Okay
    } else {
        PodDeleteStatus::Error("pod has local storage (use delete-emptydir-data to override)".into())
    }
}

fn unreplicated_filter(pod: &Pod, options: &DrainOptions) -> PodDeleteStatus {
    let has_controller = pod
        .owner_references()
        .iter()
        .any(|owner| owner.controller == Some(true));

    if has_controller || is_completed(pod) {
        PodDeleteStatus::Okay
    } else if options.force {
        warn!(pod = %pod_ref(pod), "Deleting pod not managed by a controller");
        PodDeleteStatus::Okay
    } else {
        PodDeleteStatus::Error("pod is not managed by a controller (use force to override)".into())
    }
}

/// Evicts the given pods and waits for them to be deleted.
///
/// Up to [`CONCURRENT_EVICTIONS`] pods are handled at once. Every pod is
/// attempted even if an earlier one fails; all failures are reported together.
#[tracing::instrument(skip_all, fields(pods = pods.len()))]
pub async fn delete_or_evict_pods(
    client: &Client,
    pods: Vec<Pod>,
    options: &DrainOptions,
) -> Result<(), Report<KubernetesError>> {
    let deadline = (!options.timeout.is_zero()).then(|| Instant::now() + options.timeout);

    let failures: Vec<Report<KubernetesError>> = stream::iter(pods)
        .map(|pod| async move {
            let api = namespaced_pod_api(client, &pod);
            evict_pod(&api, &pod, options.grace_period_seconds, deadline).await?;
            wait_for_deletion(&api, &pod, options.timeout, deadline).await
        })
        .buffer_unordered(CONCURRENT_EVICTIONS)
        .filter_map(|result| async move { result.err() })
        .collect()
        .await;

    let mut failures = failures.into_iter();
    match failures.next() {
        None => Ok(()),
        Some(first) => Err(failures.fold(first, |mut acc, report| {
            acc.extend_one(report);
            acc
        })),
    }
}

/// Creates an eviction for the pod, retrying while a PodDisruptionBudget
/// (429) or a misconfigured budget (500) blocks it.
async fn evict_pod(
    api: &Api<Pod>,
    pod: &Pod,
    grace_period_seconds: Option<u32>,
    deadline: Option<Instant>,
) -> Result<(), Report<KubernetesError>> {
    let name = pod.name_any();
    let params = EvictParams {
        delete_options: Some(DeleteParams {
            grace_period_seconds,
            ..Default::default()
        }),
        ..Default::default()
    };

    loop {
        info!(pod = %pod_ref(pod), "Evicting pod");
        match api.evict(&name, &params).await {
            Ok(_) => return Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!(pod = %pod_ref(pod), "Pod already gone");
                return Ok(());
            }
            Err(kube::Error::Api(e)) if e.code == 429 || e.code == 500 => {
                error!(
                    pod = %pod_ref(pod),
                    "Eviction rejected: '{}'. Check PodDisruptionBudgets. Retrying in {:.2}s.",
                    e,
                    EVICTION_RETRY_INTERVAL.as_secs_f64()
                );
            }
            Err(e) => {
                return Err(Report::new(e).change_context(KubernetesError::EvictionFailed {
                    pod: pod_ref(pod),
                }));
            }
        }

        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(Report::new(KubernetesError::EvictionFailed { pod: pod_ref(pod) })
                .attach_printable("drain timeout exceeded while retrying eviction"));
        }
        sleep(EVICTION_RETRY_INTERVAL).await;
    }
}

/// Waits until the pod is gone or has been replaced by a pod of the same name.
async fn wait_for_deletion(
    api: &Api<Pod>,
    pod: &Pod,
    timeout: Duration,
    deadline: Option<Instant>,
) -> Result<(), Report<KubernetesError>> {
    let name = pod.name_any();

    loop {
        match api.get_opt(&name).await {
            Ok(None) => break,
            Ok(Some(current)) if current.uid() != pod.uid() => break,
            Ok(Some(_)) => {
                debug!(
                    pod = %pod_ref(pod),
                    "Pod not yet deleted. Waiting {}s.",
                    DELETION_CHECK_INTERVAL.as_secs_f64()
                );
            }
            Err(e) => {
                warn!(
                    pod = %pod_ref(pod),
                    "Could not determine if pod has been deleted: '{e}'. Waiting {}s.",
                    DELETION_CHECK_INTERVAL.as_secs_f64()
                );
            }
        }

        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(Report::new(KubernetesError::PodDeletionTimeout {
                pod: pod_ref(pod),
                timeout,
            }));
        }
        sleep(DELETION_CHECK_INTERVAL).await;
    }

    info!(pod = %pod_ref(pod), "Pod deleted");
    Ok(())
}

fn namespaced_pod_api(client: &Client, pod: &Pod) -> Api<Pod> {
    match pod.metadata.namespace.as_deref() {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::default_namespaced(client.clone()),
    }
}

/// `namespace/name` of a pod, for logs and error messages.
pub fn pod_ref(pod: &Pod) -> String {
    format!(
        "{}/{}",
        pod.namespace().unwrap_or_default(),
        pod.name_any()
    )
}

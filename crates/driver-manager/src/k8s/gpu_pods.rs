//! Decides whether a pod is consuming an NVIDIA GPU.
//!
//! Two resource models can coexist on a node: legacy extended resources
//! requested by containers, and dynamic resource claims. Extended resources
//! are checked first because they need nothing but the pod spec.

use k8s_openapi::api::core::v1::Container;
use k8s_openapi::api::core::v1::Pod;

/// Prefix of the device plugin's full-GPU extended resources.
pub const GPU_RESOURCE_PREFIX: &str = "nvidia.com/gpu";
/// Prefix of the device plugin's MIG partition extended resources.
pub const MIG_RESOURCE_PREFIX: &str = "nvidia.com/mig-";

/// Answers whether a pod holds an NVIDIA GPU resource claim.
pub trait GpuClaimLookup {
    fn pod_uses_nvidia_gpu(&self, pod_uid: &str) -> bool;
}

/// Returns true if the pod requests an NVIDIA GPU through either resource model.
pub fn pod_uses_gpu(pod: &Pod, claims: &impl GpuClaimLookup) -> bool {
    let Some(spec) = pod.spec.as_ref() else {
        return false;
    };

    if spec.containers.iter().any(requests_gpu_resource) {
        return true;
    }

    let has_claims = spec
        .resource_claims
        .as_ref()
        .is_some_and(|claims| !claims.is_empty());
    if !has_claims {
        return false;
    }

    pod.metadata
        .uid
        .as_deref()
        .is_some_and(|uid| claims.pod_uses_nvidia_gpu(uid))
}

fn requests_gpu_resource(container: &Container) -> bool {
    let Some(resources) = container.resources.as_ref() else {
        return false;
    };

    resources
        .limits
        .iter()
        .chain(resources.requests.iter())
        .flat_map(|quantities| quantities.keys())
        .any(|name| is_gpu_resource(name))
}

fn is_gpu_resource(name: &str) -> bool {
    name.starts_with(GPU_RESOURCE_PREFIX) || name.starts_with(MIG_RESOURCE_PREFIX)
}

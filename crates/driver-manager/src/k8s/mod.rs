//! Kubernetes integration module.
//!
//! The main components are:
//! - [`ResourceClaimCache`]: pod UIDs holding an allocated NVIDIA GPU resource claim
//! - [`gpu_pods`]: decides whether a pod consumes an NVIDIA GPU
//! - [`KubeCluster`]: node label, cordon, drain and eviction operations
//! - [`ClusterControl`]: the seam the driver manager drives the cluster through

use core::error::Error;

pub mod claim_cache;
pub mod cluster;
pub mod drain;
pub mod gpu_pods;
pub mod kube_client;
pub mod resource_claim;

pub use claim_cache::ClaimEvent;
pub use claim_cache::ResourceClaimCache;
pub use cluster::ClusterControl;
pub use cluster::EvictionReport;
pub use cluster::KubeCluster;
pub use gpu_pods::GpuClaimLookup;
pub use resource_claim::ResourceClaim;

/// Errors that can occur during Kubernetes operations.
#[derive(Debug, derive_more::Display)]
pub enum KubernetesError {
    #[display("Failed to connect to Kubernetes API: {message}")]
    ConnectionFailed { message: String },
    #[display("Failed to watch resource claims: {message}")]
    WatchFailed { message: String },
    #[display("Resource claim cache did not sync within {timeout:?}")]
    CacheSyncTimeout { timeout: std::time::Duration },
    #[display("Failed to read node {node}")]
    NodeReadFailed { node: String },
    #[display("Failed to update node {node}")]
    NodeUpdateFailed { node: String },
    #[display("Failed to list pods: {message}")]
    PodListFailed { message: String },
    #[display("Timed out after {timeout:?} waiting for pods matching {selector} to terminate")]
    PodTerminationTimeout {
        selector: String,
        timeout: std::time::Duration,
    },
    #[display("Failed to evict pod {pod}")]
    EvictionFailed { pod: String },
    #[display("Pod {pod} was not deleted within {timeout:?}")]
    PodDeletionTimeout {
        pod: String,
        timeout: std::time::Duration,
    },
    #[display("Failed to drain node {node}: {message}")]
    DrainFailed { node: String, message: String },
}

impl Error for KubernetesError {}

pub mod cli;
pub mod manager;
pub mod nvdrain;

pub use cli::*;
pub use manager::*;
pub use nvdrain::*;

use std::time::Duration;

/// How pods are removed from the node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainOptions {
    /// Delete pods that are not managed by a controller.
    pub force: bool,
    /// Delete pods that use emptyDir volumes.
    pub delete_emptydir_data: bool,
    /// Overall budget for evictions and deletions; zero waits forever.
    pub timeout: Duration,
    /// Label selector narrowing the pods a full drain touches.
    pub pod_selector: Option<String>,
    /// Grace period given to evicted pods; `None` keeps the pod's own setting.
    pub grace_period_seconds: Option<u32>,
}

/// Immutable settings of one driver manager run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub node_name: String,
    pub drain: DrainOptions,
    pub enable_auto_drain: bool,
    pub enable_gpu_pod_eviction: bool,
    pub operator_namespace: String,
    /// Extra node label paused alongside the GPU operator components.
    pub custom_eviction_label: Option<String>,
    pub gpu_direct_rdma_enabled: bool,
    pub use_host_mofed: bool,
    /// Driver version the pending install will bring; empty disables the skip check.
    pub driver_version: Option<String>,
    pub force_reinstall: bool,
}

impl From<&manager::ManagerArgs> for Config {
    fn from(args: &manager::ManagerArgs) -> Self {
        Self {
            node_name: args.node_name.clone(),
            drain: DrainOptions {
                force: args.drain_use_force,
                delete_emptydir_data: args.drain_delete_emptydir_data,
                timeout: args.drain_timeout_seconds,
                pod_selector: non_empty(args.drain_pod_selector_label.as_deref()),
                grace_period_seconds: None,
            },
            enable_auto_drain: args.enable_auto_drain,
            enable_gpu_pod_eviction: args.enable_gpu_pod_eviction,
            operator_namespace: args.operator_namespace.clone(),
            custom_eviction_label: non_empty(args.node_label_for_gpu_pod_eviction.as_deref()),
            gpu_direct_rdma_enabled: args.gpu_direct_rdma_enabled,
            use_host_mofed: args.use_host_mofed,
            driver_version: non_empty(args.driver_version.as_deref()),
            force_reinstall: args.force_reinstall,
        }
    }
}

impl From<&nvdrain::NvdrainArgs> for DrainOptions {
    fn from(args: &nvdrain::NvdrainArgs) -> Self {
        Self {
            force: args.force,
            delete_emptydir_data: args.delete_emptydir_data,
            timeout: args.timeout,
            pod_selector: None,
            grace_period_seconds: u32::try_from(args.grace_period).ok(),
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.filter(|v| !v.is_empty()).map(str::to_string)
}

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

#[derive(Parser, Clone, Debug)]
pub struct ManagerArgs {
    #[arg(long, env = "NODE_NAME", help = "The name of the node to manage")]
    pub node_name: String,

    #[arg(
        long,
        env = "DRAIN_USE_FORCE",
        help = "Use force when draining nodes",
        default_value_t = false,
        action = clap::ArgAction::Set
    )]
    pub drain_use_force: bool,

    #[arg(
        long,
        env = "DRAIN_POD_SELECTOR_LABEL",
        help = "Pod selector label for draining"
    )]
    pub drain_pod_selector_label: Option<String>,

    #[arg(
        long,
        env = "DRAIN_TIMEOUT_SECONDS",
        help = "Timeout for drain operations, e.g. 300s; zero waits forever",
        default_value = "0s",
        value_parser = humantime::parse_duration
    )]
    pub drain_timeout_seconds: Duration,

    #[arg(
        long,
        env = "DRAIN_DELETE_EMPTYDIR_DATA",
        help = "Delete emptyDir data during drain",
        default_value_t = false,
        action = clap::ArgAction::Set
    )]
    pub drain_delete_emptydir_data: bool,

    #[arg(
        long,
        env = "ENABLE_AUTO_DRAIN",
        help = "Enable automatic node draining",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub enable_auto_drain: bool,

    #[arg(
        long,
        env = "ENABLE_GPU_POD_EVICTION",
        help = "Enable GPU pod eviction",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub enable_gpu_pod_eviction: bool,

    #[arg(
        long,
        env = "OPERATOR_NAMESPACE",
        help = "Namespace where the GPU operator is installed in",
        default_value = "gpu-operator"
    )]
    pub operator_namespace: String,

    #[arg(
        long,
        env = "NODE_LABEL_FOR_GPU_POD_EVICTION",
        help = "Node label for GPU pod eviction"
    )]
    pub node_label_for_gpu_pod_eviction: Option<String>,

    #[arg(
        long,
        env = "GPU_DIRECT_RDMA_ENABLED",
        help = "Enable GPU Direct RDMA",
        default_value_t = false,
        action = clap::ArgAction::Set
    )]
    pub gpu_direct_rdma_enabled: bool,

    #[arg(
        long,
        env = "USE_HOST_MOFED",
        help = "Use host MOFED driver",
        default_value_t = false,
        action = clap::ArgAction::Set
    )]
    pub use_host_mofed: bool,

    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to kubeconfig file"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(long, env = "DRIVER_VERSION", help = "Desired NVIDIA driver version")]
    pub driver_version: Option<String>,

    #[arg(
        long,
        env = "FORCE_REINSTALL",
        help = "Force driver reinstall regardless of current state",
        default_value_t = false,
        action = clap::ArgAction::Set
    )]
    pub force_reinstall: bool,
}

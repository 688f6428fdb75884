use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

#[derive(Parser, Clone, Debug)]
pub struct NvdrainArgs {
    #[arg(long, env = "NODE_NAME", help = "The name of the node to drain")]
    pub node_name: String,

    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Absolute path to the kubeconfig file"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(long, env = "NVDRAIN_DRY_RUN", help = "Print list of pods to be evicted")]
    pub dry_run: bool,

    #[arg(
        long,
        env = "NVDRAIN_DELETE_EMPTYDIR_DATA",
        help = "Continue even if there are pods using emptyDir"
    )]
    pub delete_emptydir_data: bool,

    #[arg(
        short,
        long,
        env = "NVDRAIN_USE_FORCE",
        help = "Continue even if there are pods not managed by a controller"
    )]
    pub force: bool,

    #[arg(
        short,
        long,
        env = "NVDRAIN_TIMEOUT_SECONDS",
        help = "The length of time to wait before giving up, zero means infinite",
        default_value = "0s",
        value_parser = humantime::parse_duration
    )]
    pub timeout: Duration,

    #[arg(
        long,
        env = "NVDRAIN_GRACE_PERIOD",
        help = "Seconds given to each pod to terminate gracefully; negative uses the pod's own setting",
        default_value_t = -1,
        allow_negative_numbers = true
    )]
    pub grace_period: i64,
}

use clap::Parser;
use clap::Subcommand;
use utils::version;

use crate::config::manager::ManagerArgs;
use crate::config::nvdrain::NvdrainArgs;

/// Prepares a node for a GPU driver container upgrade.
#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        env = "DEBUG",
        help = "Enable debug-level logging"
    )]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Uninstall the NVIDIA driver and manage GPU operator components
    #[command(name = "uninstall_driver")]
    UninstallDriver(Box<ManagerArgs>),
    /// Perform preflight checks
    #[command(name = "preflight_check")]
    PreflightCheck(Box<ManagerArgs>),
    /// Evict the pods using NVIDIA GPUs from the node
    Nvdrain(NvdrainArgs),
}

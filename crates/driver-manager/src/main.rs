use std::future::Future;

use anyhow::anyhow;
use anyhow::Result;
use clap::Parser;
use driver_manager::app::ManagerContext;
use driver_manager::config::Cli;
use driver_manager::config::Commands;
use driver_manager::config::Config;
use driver_manager::config::DrainOptions;
use driver_manager::config::ManagerArgs;
use driver_manager::config::NvdrainArgs;
use driver_manager::driver::DriverManager;
use driver_manager::driver::UninstallOutcome;
use driver_manager::host::LinuxHost;
use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;
use utils::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();
    utils::logging::init(cli.debug);
    tracing::info!("Starting driver-manager {}", &**version::VERSION);

    match cli.command {
        Commands::UninstallDriver(args) => run_uninstall_driver(*args).await,
        Commands::PreflightCheck(args) => run_preflight_check(*args).await,
        Commands::Nvdrain(args) => run_nvdrain(args).await,
    }
}

async fn run_uninstall_driver(args: ManagerArgs) -> Result<()> {
    let context = ManagerContext::start(args.kubeconfig.clone())
        .await
        .map_err(|e| anyhow!("{e:?}"))?;

    let mut manager = DriverManager::new(Config::from(&args), context.cluster(), LinuxHost::default());
    let result = until_shutdown_signal(manager.uninstall_driver()).await;
    context.shutdown().await;

    match result? {
        Ok(UninstallOutcome::Skipped) => {
            tracing::info!("Desired driver version already installed, nothing to do");
            Ok(())
        }
        Ok(UninstallOutcome::Completed) => Ok(()),
        Err(e) => {
            tracing::error!("Driver uninstall failed: {e:?}");
            Err(anyhow!("{e:?}"))
        }
    }
}

async fn run_preflight_check(args: ManagerArgs) -> Result<()> {
    let context = ManagerContext::start(args.kubeconfig.clone())
        .await
        .map_err(|e| anyhow!("{e:?}"))?;

    let manager = DriverManager::new(Config::from(&args), context.cluster(), LinuxHost::default());
    let result = manager.preflight_check().await;
    context.shutdown().await;

    result.map_err(|e| anyhow!("{e:?}"))
}

async fn run_nvdrain(args: NvdrainArgs) -> Result<()> {
    let context = ManagerContext::start(args.kubeconfig.clone())
        .await
        .map_err(|e| anyhow!("{e:?}"))?;

    let options = DrainOptions::from(&args);
    let cluster = context.cluster();
    let result = until_shutdown_signal(cluster.nvdrain(&args.node_name, &options, args.dry_run)).await;
    context.shutdown().await;

    let report = result?.map_err(|e| anyhow!("{e:?}"))?;
    tracing::info!(
        gpu_pods = report.gpu_pods,
        dry_run = args.dry_run,
        "GPU pod drain finished"
    );
    Ok(())
}

/// Runs `future` unless SIGTERM or SIGINT arrives first.
async fn until_shutdown_signal<F: Future>(future: F) -> Result<F::Output> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        output = future => Ok(output),
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
            Err(anyhow!("interrupted by SIGTERM"))
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT, initiating graceful shutdown");
            Err(anyhow!("interrupted by SIGINT"))
        }
    }
}

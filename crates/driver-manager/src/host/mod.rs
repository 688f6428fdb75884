//! Privileged probes and mutations on the node the driver manager runs on.
//!
//! [`HostSystem`] is the seam the driver manager uses; [`LinuxHost`] is the
//! real implementation, rooted at [`HostPaths`] so it can run against a fake
//! sysfs/procfs tree.

use core::error::Error;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use derive_more::Display;
use error_stack::Report;
use error_stack::ResultExt;
use tokio::process::Command;
use tracing::debug;
use tracing::info;
use tracing::warn;

pub mod kmod;
pub mod mounts;

const MODINFO_TIMEOUT: Duration = Duration::from_secs(10);
const MELLANOX_VENDOR_ID: &str = "0x15b3";
const MOFED_MODULE: &str = "mlx5_core";
const NOUVEAU_MODULE: &str = "nouveau";

/// Errors that can occur while probing or changing the host.
#[derive(Debug, Display)]
pub enum HostError {
    #[display("Failed to run {command}")]
    CommandFailed { command: String },
    #[display("Failed to read {path}")]
    ReadFailed { path: String },
    #[display("Unable to determine the installed driver version")]
    VersionUnknown,
    #[display("NVIDIA driver kernel modules are in use")]
    ModulesInUse,
    #[display("Failed to unload kernel modules: {modules}")]
    UnloadFailed { modules: String },
    #[display("Failed to unmount {path}")]
    UnmountFailed { path: String },
}

impl Error for HostError {}

/// Filesystem locations used by [`LinuxHost`].
#[derive(Debug, Clone)]
pub struct HostPaths {
    pub sys_root: PathBuf,
    pub proc_root: PathBuf,
    /// Host root filesystem, mounted into the container.
    pub host_root: PathBuf,
    /// Root filesystem of the containerized driver.
    pub driver_root: PathBuf,
    pub driver_pid_file: PathBuf,
    /// Marker created by the MOFED container once its driver is loaded.
    pub mofed_ready_file: PathBuf,
}

impl Default for HostPaths {
    fn default() -> Self {
        Self {
            sys_root: PathBuf::from("/sys"),
            proc_root: PathBuf::from("/proc"),
            host_root: PathBuf::from("/host"),
            driver_root: PathBuf::from("/run/nvidia/driver"),
            driver_pid_file: PathBuf::from("/run/nvidia/nvidia-driver.pid"),
            mofed_ready_file: PathBuf::from("/run/mellanox/drivers/.driver-ready"),
        }
    }
}

/// Host operations the driver manager needs.
#[async_trait]
pub trait HostSystem: Send + Sync {
    /// Version reported by `nvidia-smi` on the host, if a driver is installed there.
    async fn host_driver_version(&self) -> Option<String>;

    /// Version of the loaded containerized driver.
    async fn driver_version(&self) -> Result<String, Report<HostError>>;

    async fn is_module_loaded(&self, module: &str) -> bool;

    /// Unloads the driver modules, unmounts the driver root and removes the pid file.
    async fn cleanup_driver(&self) -> Result<(), Report<HostError>>;

    /// Unbinds vfio-pci from every device. A no-op when nothing is bound.
    async fn unbind_vfio_devices(&self) -> Result<(), Report<HostError>>;

    /// True if a Mellanox PCI device is present.
    async fn rdma_devices_present(&self) -> bool;

    /// True once the MOFED driver is loaded.
    async fn mofed_ready(&self, use_host_mofed: bool) -> bool;

    async fn unload_nouveau(&self) -> Result<(), Report<HostError>>;
}

/// [`HostSystem`] for a Linux node.
#[derive(Debug, Clone, Default)]
pub struct LinuxHost {
    paths: HostPaths,
}

impl LinuxHost {
    pub fn new(paths: HostPaths) -> Self {
        Self { paths }
    }

    async fn modinfo_version(&self) -> Result<String, Report<HostError>> {
        let root = self.paths.driver_root.to_string_lossy();
        let output = tokio::time::timeout(
            MODINFO_TIMEOUT,
            run_command("chroot", &[&*root, "modinfo", "-F", "version", "nvidia"]),
        )
        .await
        .map_err(|_| {
            Report::new(HostError::CommandFailed {
                command: "modinfo".to_string(),
            })
            .attach_printable(format!("timed out after {MODINFO_TIMEOUT:?}"))
        })??;

        let version = output.trim();
        if version.is_empty() {
            return Err(Report::new(HostError::VersionUnknown).attach_printable("modinfo printed nothing"));
        }
        Ok(version.to_string())
    }

    async fn sysfs_version(&self) -> Result<String, Report<HostError>> {
        let path = self.paths.sys_root.join("module/nvidia/version");
        let content = tokio::fs::read_to_string(&path)
            .await
            .change_context(HostError::ReadFailed {
                path: path.display().to_string(),
            })?;

        let version = content.trim();
        if version.is_empty() {
            return Err(Report::new(HostError::VersionUnknown).attach_printable("empty sysfs version"));
        }
        Ok(version.to_string())
    }
}

#[async_trait]
impl HostSystem for LinuxHost {
    async fn host_driver_version(&self) -> Option<String> {
        let root = self.paths.host_root.to_string_lossy();
        let output = run_command(
            "chroot",
            &[
                &*root,
                "nvidia-smi",
                "--query-gpu=driver_version",
                "--format=csv,noheader",
            ],
        )
        .await
        .ok()?;

        let version = output.trim();
        if version.is_empty() {
            return None;
        }
        info!("Host driver detected: {version}");
        Some(version.to_string())
    }

    async fn driver_version(&self) -> Result<String, Report<HostError>> {
        let chroot_err = match self.modinfo_version().await {
            Ok(version) => {
                info!("Driver version detected via chroot: {version}");
                return Ok(version);
            }
            Err(e) => e,
        };

        match self.sysfs_version().await {
            Ok(version) => {
                info!("Driver version detected from sysfs: {version}");
                Ok(version)
            }
            Err(mut e) => {
                e.extend_one(chroot_err);
                Err(e.change_context(HostError::VersionUnknown))
            }
        }
    }

    async fn is_module_loaded(&self, module: &str) -> bool {
        let refcnt = self.paths.sys_root.join("module").join(module).join("refcnt");
        tokio::fs::try_exists(refcnt).await.unwrap_or(false)
    }

    #[tracing::instrument(skip(self))]
    async fn cleanup_driver(&self) -> Result<(), Report<HostError>> {
        info!("Cleaning up NVIDIA driver");
        kmod::unload_driver_modules(&self.paths.sys_root, &self.paths.proc_root, &kmod::Rmmod)
            .await?;

        info!("Unmounting NVIDIA driver rootfs");
        let mountinfo = self.paths.proc_root.join("self/mountinfo");
        mounts::recursive_unmount(&self.paths.driver_root, &mountinfo).await?;

        match tokio::fs::remove_file(&self.paths.driver_pid_file).await {
            Ok(()) => debug!("Removed driver pid file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                "Failed to remove PID file {}: {e}",
                self.paths.driver_pid_file.display()
            ),
        }
        Ok(())
    }

    async fn unbind_vfio_devices(&self) -> Result<(), Report<HostError>> {
        info!("Unbinding vfio-pci driver from all devices");
        run_command("vfio-manage", &["unbind", "--all"]).await?;
        Ok(())
    }

    async fn rdma_devices_present(&self) -> bool {
        let devices = self.paths.sys_root.join("bus/pci/devices");
        let Ok(mut entries) = tokio::fs::read_dir(&devices).await else {
            return false;
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(vendor) = tokio::fs::read_to_string(entry.path().join("vendor")).await else {
                continue;
            };
            if vendor.trim() == MELLANOX_VENDOR_ID {
                info!("Mellanox device found at {}", entry.file_name().to_string_lossy());
                return true;
            }
        }

        info!("No Mellanox devices were found");
        false
    }

    async fn mofed_ready(&self, use_host_mofed: bool) -> bool {
        if !use_host_mofed {
            return tokio::fs::try_exists(&self.paths.mofed_ready_file)
                .await
                .unwrap_or(false);
        }

        match tokio::fs::read_to_string(self.paths.proc_root.join("modules")).await {
            Ok(modules) => modules.contains(MOFED_MODULE),
            Err(e) => {
                warn!("Failed to read /proc/modules: {e}");
                false
            }
        }
    }

    async fn unload_nouveau(&self) -> Result<(), Report<HostError>> {
        run_command("rmmod", &[NOUVEAU_MODULE])
            .await
            .change_context(HostError::UnloadFailed {
                modules: NOUVEAU_MODULE.to_string(),
            })?;
        Ok(())
    }
}

/// Runs a command to completion with `LC_ALL=C` and returns its stdout.
///
/// A non-zero exit is an error carrying the command's stderr.
pub(crate) async fn run_command(program: &str, args: &[&str]) -> Result<String, Report<HostError>> {
    let command_line = std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ");
    debug!(command = %command_line, "Running command");

    let output = Command::new(program)
        .args(args)
        .env("LC_ALL", "C")
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .change_context_lazy(|| HostError::CommandFailed {
            command: command_line.clone(),
        })?;

    if !output.status.success() {
        return Err(Report::new(HostError::CommandFailed {
            command: command_line,
        })
        .attach_printable(format!("exit status: {}", output.status))
        .attach_printable(String::from_utf8_lossy(&output.stderr).trim().to_string()));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

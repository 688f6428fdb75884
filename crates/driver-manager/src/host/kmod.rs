//! NVIDIA kernel module inspection and unload.

use std::path::Path;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use tracing::info;
use tracing::warn;

use crate::host::run_command;
use crate::host::HostError;

/// Driver modules in unload order, dependents before the base module.
pub const NVIDIA_MODULES: [&str; 7] = [
    "nvidia_modeset",
    "nvidia_uvm",
    "nvidia_peermem",
    "nvidia_fs",
    "nvidia_vgpu_vfio",
    "gdrdrv",
    "nvidia",
];

const BASE_MODULE: &str = "nvidia";
const VGPU_VFIO_MODULE: &str = "nvidia_vgpu_vfio";

/// A driver module found in sysfs with its reference count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedModule {
    pub name: &'static str,
    pub refcount: u32,
}

/// Why the driver modules cannot be removed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UnloadRefusal {
    #[error("nvidia has {refcount} references but only {dependents} dependent modules are loaded")]
    BaseModuleInUse { refcount: u32, dependents: usize },
    #[error("{module} is in use ({refcount} references)")]
    ModuleInUse { module: &'static str, refcount: u32 },
}

/// A row of `/proc/modules`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcModule {
    pub name: String,
    pub size: u64,
    pub refcount: u32,
    pub used_by: String,
}

/// Removes kernel modules from the running kernel.
#[async_trait]
pub trait ModuleRemover: Send + Sync {
    /// Removes `modules` in the given order.
    async fn remove(&self, modules: &[&'static str]) -> Result<(), Report<HostError>>;
}

/// Removes modules with `rmmod`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Rmmod;

#[async_trait]
impl ModuleRemover for Rmmod {
    async fn remove(&self, modules: &[&'static str]) -> Result<(), Report<HostError>> {
        run_command("rmmod", modules).await.map(|_| ())
    }
}

/// Reads the reference count of every loaded driver module.
pub async fn loaded_modules(sys_root: &Path) -> Result<Vec<LoadedModule>, Report<HostError>> {
    let mut loaded = Vec::new();

    for name in NVIDIA_MODULES {
        let path = sys_root.join("module").join(name).join("refcnt");
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => {
                return Err(Report::new(e).change_context(HostError::ReadFailed {
                    path: path.display().to_string(),
                }));
            }
        };

        let refcount = content
            .trim()
            .parse::<u32>()
            .change_context(HostError::ReadFailed {
                path: path.display().to_string(),
            })
            .attach_printable_lazy(|| format!("invalid refcount {:?}", content.trim()))?;
        loaded.push(LoadedModule { name, refcount });
    }

    Ok(loaded)
}

/// Decides whether the loaded modules can be removed and returns them in removal order.
///
/// The base module may only hold references from its loaded dependents, and
/// dependents must be unused. The one exception is a base refcount of exactly
/// two while `nvidia_vgpu_vfio` is loaded: the vGPU manager keeps two handles
/// on the base module in that state.
pub fn plan_unload(loaded: &[LoadedModule]) -> Result<Vec<&'static str>, UnloadRefusal> {
    let base_refcount = loaded
        .iter()
        .find(|module| module.name == BASE_MODULE)
        .map_or(0, |module| module.refcount);
    let dependents: Vec<&LoadedModule> = loaded
        .iter()
        .filter(|module| module.name != BASE_MODULE)
        .collect();
    let vgpu_vfio_loaded = dependents.iter().any(|module| module.name == VGPU_VFIO_MODULE);
    let modules = loaded.iter().map(|module| module.name).collect();

    let exceeds_dependents = base_refcount as usize > dependents.len();
    if base_refcount == 2 && exceeds_dependents && vgpu_vfio_loaded {
        return Ok(modules);
    }

    if exceeds_dependents {
        return Err(UnloadRefusal::BaseModuleInUse {
            refcount: base_refcount,
            dependents: dependents.len(),
        });
    }
    if let Some(busy) = dependents.iter().find(|module| module.refcount != 0) {
        return Err(UnloadRefusal::ModuleInUse {
            module: busy.name,
            refcount: busy.refcount,
        });
    }

    Ok(modules)
}

/// Removes the driver modules if nothing holds them.
///
/// On refusal the loaded NVIDIA modules are logged and nothing is removed.
#[tracing::instrument(skip_all)]
pub async fn unload_driver_modules(
    sys_root: &Path,
    proc_root: &Path,
    remover: &impl ModuleRemover,
) -> Result<(), Report<HostError>> {
    info!("Unloading NVIDIA driver kernel modules");
    let loaded = loaded_modules(sys_root).await?;
    if loaded.is_empty() {
        info!("No NVIDIA driver kernel modules loaded");
        return Ok(());
    }

    let modules = match plan_unload(&loaded) {
        Ok(modules) => modules,
        Err(refusal) => {
            info!("Could not unload NVIDIA driver kernel modules, driver is in use");
            if let Err(e) = log_modules(proc_root, BASE_MODULE).await {
                warn!("Failed to list kernel modules: {e:?}");
            }
            return Err(Report::new(refusal).change_context(HostError::ModulesInUse));
        }
    };

    remover
        .remove(&modules)
        .await
        .change_context(HostError::UnloadFailed {
            modules: modules.join(" "),
        })?;
    info!(modules = %modules.join(" "), "Unloaded NVIDIA driver kernel modules");
    Ok(())
}

/// Parses `/proc/modules`, keeping rows whose line contains `filter`.
pub fn parse_proc_modules(content: &str, filter: &str) -> Vec<ProcModule> {
    content
        .lines()
        .filter(|line| filter.is_empty() || line.contains(filter))
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let name = fields.next()?;
            let size = fields.next()?;
            let refcount = fields.next()?;
            let used_by = fields.next()?;

            let (Ok(size), Ok(refcount)) = (size.parse(), refcount.parse()) else {
                warn!("skipping malformed module entry: {line}");
                return None;
            };
            Some(ProcModule {
                name: name.to_string(),
                size,
                refcount,
                used_by: used_by.to_string(),
            })
        })
        .collect()
}

/// Logs a table of the loaded kernel modules matching `filter`.
pub async fn log_modules(proc_root: &Path, filter: &str) -> Result<(), Report<HostError>> {
    let path = proc_root.join("modules");
    let content = tokio::fs::read_to_string(&path)
        .await
        .change_context(HostError::ReadFailed {
            path: path.display().to_string(),
        })?;

    info!("{:<20} {:<10} {:<15} Used by", "Module", "Size", "Ref Count");
    for module in parse_proc_modules(&content, filter) {
        info!(
            "{:<20} {:<10} {:<15} {}",
            module.name, module.size, module.refcount, module.used_by
        );
    }
    Ok(())
}

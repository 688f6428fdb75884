//! Node-label encoding used to pause and resume GPU operator components.
//!
//! Every operand of the GPU operator is scheduled through a
//! `nvidia.com/gpu.deploy.<component>` node label. Pausing rewrites that value
//! so the operand's node selector stops matching, while keeping the original
//! value recoverable from the node object alone:
//!
//! | current value   | paused value                        |
//! |-----------------|-------------------------------------|
//! | `""`            | `""` (disabled by the user)         |
//! | `"false"`       | `"false"` (force-disabled)          |
//! | `"true"`        | `"paused-for-driver-upgrade"`       |
//! | `"<value>"`     | `"<value>_paused-for-driver-upgrade"` |
//!
//! [`resume`] is the inverse of [`pause`], so a fresh process can restore the
//! node after a crash mid-upgrade.

/// Marker written into a label value while its component is paused.
pub const PAUSED_MARKER: &str = "paused-for-driver-upgrade";

const ENABLED: &str = "true";
const DISABLED: &str = "false";
const SEPARATOR: char = '_';

pub const DRIVER_DEPLOY_LABEL: &str = "nvidia.com/gpu.deploy.driver";
pub const OPERATOR_VALIDATOR_DEPLOY_LABEL: &str = "nvidia.com/gpu.deploy.operator-validator";
pub const CONTAINER_TOOLKIT_DEPLOY_LABEL: &str = "nvidia.com/gpu.deploy.container-toolkit";
pub const DEVICE_PLUGIN_DEPLOY_LABEL: &str = "nvidia.com/gpu.deploy.device-plugin";
pub const GFD_DEPLOY_LABEL: &str = "nvidia.com/gpu.deploy.gpu-feature-discovery";
pub const DCGM_EXPORTER_DEPLOY_LABEL: &str = "nvidia.com/gpu.deploy.dcgm-exporter";
pub const DCGM_DEPLOY_LABEL: &str = "nvidia.com/gpu.deploy.dcgm";
pub const MIG_MANAGER_DEPLOY_LABEL: &str = "nvidia.com/gpu.deploy.mig-manager";
pub const NVSM_DEPLOY_LABEL: &str = "nvidia.com/gpu.deploy.nvsm";
pub const SANDBOX_VALIDATOR_DEPLOY_LABEL: &str = "nvidia.com/gpu.deploy.sandbox-validator";
pub const SANDBOX_DEVICE_PLUGIN_DEPLOY_LABEL: &str = "nvidia.com/gpu.deploy.sandbox-device-plugin";
pub const VGPU_DEVICE_MANAGER_DEPLOY_LABEL: &str = "nvidia.com/gpu.deploy.vgpu-device-manager";

/// Value written to the driver deploy label when a host driver is detected.
pub const DRIVER_PREINSTALLED: &str = "pre-installed";

/// Node annotation carrying the auto-upgrade policy of the GPU operator.
pub const DRIVER_UPGRADE_ENABLED_ANNOTATION: &str = "nvidia.com/gpu-driver-upgrade-enabled";

/// Returns the paused form of a label value.
///
/// Empty and `"false"` are explicit user choices and are returned verbatim.
/// Already paused values are returned unchanged.
pub fn pause(current: &str) -> String {
    match current {
        "" | DISABLED => current.to_string(),
        ENABLED => PAUSED_MARKER.to_string(),
        value if value.contains(PAUSED_MARKER) => value.to_string(),
        value => format!("{value}{SEPARATOR}{PAUSED_MARKER}"),
    }
}

/// Returns the value a label had before [`pause`].
///
/// The bare marker maps back to `"true"`; otherwise every marker occurrence,
/// together with one trailing separator, is removed and leftover separators
/// are trimmed from both ends.
pub fn resume(current: &str) -> String {
    match current {
        DISABLED => current.to_string(),
        PAUSED_MARKER => ENABLED.to_string(),
        value => strip_markers(value)
            .trim_matches(SEPARATOR)
            .to_string(),
    }
}

fn strip_markers(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(pos) = rest.find(PAUSED_MARKER) {
        out.push_str(&rest[..pos]);
        rest = &rest[pos + PAUSED_MARKER.len()..];
        if let Some(stripped) = rest.strip_prefix(SEPARATOR) {
            rest = stripped;
        }
    }
    out.push_str(rest);
    out
}

//! GPU operator components that are descheduled across a driver restart.

use std::collections::BTreeMap;

use crate::labels;

/// An operand of the GPU operator controlled through a deploy label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    OperatorValidator,
    ContainerToolkit,
    DevicePlugin,
    GpuFeatureDiscovery,
    DcgmExporter,
    Dcgm,
    MigManager,
    Nvsm,
    SandboxValidator,
    SandboxDevicePlugin,
    VgpuDeviceManager,
}

impl Component {
    pub const COUNT: usize = 11;

    pub const ALL: [Component; Self::COUNT] = [
        Component::OperatorValidator,
        Component::ContainerToolkit,
        Component::DevicePlugin,
        Component::GpuFeatureDiscovery,
        Component::DcgmExporter,
        Component::Dcgm,
        Component::MigManager,
        Component::Nvsm,
        Component::SandboxValidator,
        Component::SandboxDevicePlugin,
        Component::VgpuDeviceManager,
    ];

    pub const fn label_key(self) -> &'static str {
        match self {
            Component::OperatorValidator => labels::OPERATOR_VALIDATOR_DEPLOY_LABEL,
            Component::ContainerToolkit => labels::CONTAINER_TOOLKIT_DEPLOY_LABEL,
            Component::DevicePlugin => labels::DEVICE_PLUGIN_DEPLOY_LABEL,
            Component::GpuFeatureDiscovery => labels::GFD_DEPLOY_LABEL,
            Component::DcgmExporter => labels::DCGM_EXPORTER_DEPLOY_LABEL,
            Component::Dcgm => labels::DCGM_DEPLOY_LABEL,
            Component::MigManager => labels::MIG_MANAGER_DEPLOY_LABEL,
            Component::Nvsm => labels::NVSM_DEPLOY_LABEL,
            Component::SandboxValidator => labels::SANDBOX_VALIDATOR_DEPLOY_LABEL,
            Component::SandboxDevicePlugin => labels::SANDBOX_DEVICE_PLUGIN_DEPLOY_LABEL,
            Component::VgpuDeviceManager => labels::VGPU_DEVICE_MANAGER_DEPLOY_LABEL,
        }
    }

    /// Value of the `app` label carried by the component's pods, if we wait for them.
    pub const fn pod_app(self) -> Option<&'static str> {
        match self {
            Component::OperatorValidator => Some("nvidia-operator-validator"),
            Component::ContainerToolkit => Some("nvidia-container-toolkit-daemonset"),
            Component::DevicePlugin => Some("nvidia-device-plugin-daemonset"),
            Component::GpuFeatureDiscovery => Some("gpu-feature-discovery"),
            Component::DcgmExporter => Some("nvidia-dcgm-exporter"),
            Component::Dcgm => Some("nvidia-dcgm"),
            Component::MigManager => Some("nvidia-mig-manager"),
            Component::Nvsm => None,
            Component::SandboxValidator => Some("nvidia-sandbox-validator"),
            Component::SandboxDevicePlugin => Some("nvidia-sandbox-device-plugin-daemonset"),
            Component::VgpuDeviceManager => Some("nvidia-vgpu-device-manager"),
        }
    }

    /// Optional components are only touched when the node carries their label.
    const fn is_optional(self) -> bool {
        matches!(
            self,
            Component::MigManager
                | Component::SandboxValidator
                | Component::SandboxDevicePlugin
                | Component::VgpuDeviceManager
        )
    }

    /// Whether the deploy label is written even when its captured value is empty.
    const fn always_written(self) -> bool {
        !matches!(self, Component::MigManager)
    }
}

/// A label supplied by the operator to deschedule custom GPU operands.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CustomLabel {
    key: String,
    value: String,
}

/// Deploy-label values captured from the node at the start of a run.
///
/// The captured values are the pre-pause state; both the paused and the
/// resumed label sets are derived from them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComponentState {
    values: [String; Component::COUNT],
    custom: Option<CustomLabel>,
    auto_upgrade_policy: String,
}

impl ComponentState {
    pub fn get(&self, component: Component) -> &str {
        &self.values[component as usize]
    }

    pub fn set(&mut self, component: Component, value: impl Into<String>) {
        self.values[component as usize] = value.into();
    }

    pub fn set_custom(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.custom = Some(CustomLabel {
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn set_auto_upgrade_policy(&mut self, value: impl Into<String>) {
        self.auto_upgrade_policy = value.into();
    }

    /// The annotation value `"true"` hands driver upgrades to the operator's
    /// upgrade controller, which disables our own drain and eviction.
    pub fn auto_upgrade_policy_enabled(&self) -> bool {
        self.auto_upgrade_policy == "true"
    }

    /// Label set that deschedules every component.
    pub fn paused_labels(&self) -> BTreeMap<String, String> {
        self.encode_labels(labels::pause)
    }

    /// Label set that restores every component to its captured value.
    pub fn resumed_labels(&self) -> BTreeMap<String, String> {
        self.encode_labels(labels::resume)
    }

    fn encode_labels(&self, encode: fn(&str) -> String) -> BTreeMap<String, String> {
        let mut out: BTreeMap<String, String> = Component::ALL
            .into_iter()
            .filter(|c| c.always_written() || !self.get(*c).is_empty())
            .map(|c| (c.label_key().to_string(), encode(self.get(c))))
            .collect();

        if let Some(custom) = self.custom.as_ref().filter(|c| !c.value.is_empty()) {
            out.insert(custom.key.clone(), encode(&custom.value));
        }
        out
    }

    /// `app` selectors of the component pods that must leave the node, in shutdown order.
    pub fn pods_to_await(&self) -> Vec<&'static str> {
        Component::ALL
            .into_iter()
            .filter(|c| !c.is_optional() || !self.get(*c).is_empty())
            .filter_map(Component::pod_app)
            .collect()
    }
}

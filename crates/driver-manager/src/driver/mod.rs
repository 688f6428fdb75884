//! Driver lifecycle orchestration.
//!
//! [`DriverManager::uninstall_driver`] takes a node from "driver loaded, GPU
//! workloads running" to "driver unloaded, node ready for a new driver
//! container". Every mutation it makes (paused component labels, cordon) is
//! undone on failure, so a failed run leaves the node schedulable again.
//!
//! ```text
//! Start -> PreflightSkipCheck -> LabelsFetched -> ComponentsEvicted -> PodsDrained
//!       -> ModulesUnloaded -> DevicesRebound -> RdmaWaited -> Rescheduled -> Done
//! ```
//!
//! Any fatal step moves to `Failed` after the rollback.

use core::error::Error;
use std::collections::BTreeMap;
use std::time::Duration;

use derive_more::Display;
use error_stack::Report;
use error_stack::ResultExt;
use tokio::time::sleep;
use tokio::time::Instant;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::config::Config;
use crate::host::HostSystem;
use crate::k8s::ClusterControl;
use crate::labels;

pub mod components;
#[cfg(test)]
mod mock;

pub use components::Component;
pub use components::ComponentState;

const BASE_MODULE: &str = "nvidia";
const NOUVEAU_MODULE: &str = "nouveau";

/// Errors that abort a driver manager run.
#[derive(Debug, Display)]
pub enum DriverManagerError {
    #[display("NVIDIA GPU driver is pre-installed on the host")]
    HostDriverPreinstalled,
    #[display("Failed to disable the containerized driver")]
    DisableDriverFailed,
    #[display("Failed to fetch current node labels")]
    FetchLabelsFailed,
    #[display("Failed to fetch the auto upgrade annotation")]
    FetchAnnotationFailed,
    #[display("Failed to evict GPU operator components")]
    ComponentEvictionFailed,
    #[display("Failed to cordon node")]
    CordonFailed,
    #[display("Cannot proceed until all GPU pods are drained from the node")]
    GpuPodsRemaining,
    #[display("Failed to drain node")]
    DrainFailed,
    #[display("Failed to cleanup NVIDIA driver")]
    CleanupFailed,
    #[display("Failed to unbind vfio-pci driver")]
    VfioUnbindFailed,
    #[display("Failed to wait for MOFED driver")]
    MofedWaitFailed,
    #[display("Failed to unload nouveau driver")]
    NouveauUnloadFailed,
}

impl Error for DriverManagerError {}

/// Progress of an uninstall run.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Start,
    PreflightSkipCheck,
    LabelsFetched,
    ComponentsEvicted,
    PodsDrained,
    ModulesUnloaded,
    DevicesRebound,
    RdmaWaited,
    Rescheduled,
    Done,
    Failed,
}

/// How an uninstall run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UninstallOutcome {
    /// The desired driver version is already loaded.
    Skipped,
    /// The driver was removed and the node handed back to the scheduler.
    Completed,
}

/// Fixed waits of the uninstall flow.
#[derive(Debug, Clone)]
pub struct Timings {
    /// Pause after marking the node as having a pre-installed driver.
    pub host_driver_settle: Duration,
    /// Budget for each GPU operator component to leave the node.
    pub component_grace: Duration,
    pub mofed_poll_interval: Duration,
    /// `None` waits for MOFED forever.
    pub mofed_timeout: Option<Duration>,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            host_driver_settle: Duration::from_secs(60),
            component_grace: Duration::from_secs(5 * 60),
            mofed_poll_interval: Duration::from_secs(5),
            mofed_timeout: None,
        }
    }
}

/// Removes the GPU driver from one node.
pub struct DriverManager<C, H> {
    config: Config,
    cluster: C,
    host: H,
    timings: Timings,
    components: ComponentState,
    cordoned: bool,
    stage: Stage,
}

impl<C: ClusterControl, H: HostSystem> DriverManager<C, H> {
    pub fn new(config: Config, cluster: C, host: H) -> Self {
        Self {
            config,
            cluster,
            host,
            timings: Timings::default(),
            components: ComponentState::default(),
            cordoned: false,
            stage: Stage::Start,
        }
    }

    pub fn with_timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Reserved for checks that must pass before an upgrade starts.
    pub async fn preflight_check(&self) -> Result<(), Report<DriverManagerError>> {
        info!(node = %self.config.node_name, "Running preflight checks");
        Ok(())
    }

    /// Removes the driver so a new driver container can take over the node.
    #[tracing::instrument(skip(self), fields(node = %self.config.node_name))]
    pub async fn uninstall_driver(&mut self) -> Result<UninstallOutcome, Report<DriverManagerError>> {
        info!("Starting driver uninstallation process");

        if let Some(version) = self.host.host_driver_version().await {
            let result = self.disable_containerized_driver(&version).await;
            self.enter(Stage::Failed);
            return result;
        }

        self.enter(Stage::PreflightSkipCheck);
        if self.should_skip_uninstall().await {
            self.enter(Stage::Done);
            return Ok(UninstallOutcome::Skipped);
        }

        // nothing has been changed yet, so read failures need no rollback
        if let Err(e) = self.fetch_current_state().await {
            self.enter(Stage::Failed);
            return Err(e);
        }
        self.enter(Stage::LabelsFetched);

        if let Err(e) = self.remove_driver().await {
            error!("Driver uninstall failed, attempting cleanup: {e:?}");
            self.cleanup_on_failure().await;
            self.enter(Stage::Failed);
            return Err(e);
        }

        self.reschedule().await;
        self.enter(Stage::Rescheduled);

        if self.host.is_module_loaded(NOUVEAU_MODULE).await {
            if let Err(e) = self.host.unload_nouveau().await {
                self.enter(Stage::Failed);
                return Err(e.change_context(DriverManagerError::NouveauUnloadFailed));
            }
            info!("Successfully unloaded nouveau driver");
        }

        self.enter(Stage::Done);
        info!("Driver uninstallation completed successfully");
        Ok(UninstallOutcome::Completed)
    }

    fn enter(&mut self, stage: Stage) {
        info!(from = %self.stage, to = %stage, "Driver manager stage changed");
        self.stage = stage;
    }

    async fn disable_containerized_driver(
        &self,
        version: &str,
    ) -> Result<UninstallOutcome, Report<DriverManagerError>> {
        info!(
            version,
            "NVIDIA GPU driver is already pre-installed on the node, disabling the containerized driver"
        );
        let driver_label = BTreeMap::from([(
            labels::DRIVER_DEPLOY_LABEL.to_string(),
            labels::DRIVER_PREINSTALLED.to_string(),
        )]);
        self.cluster
            .update_node_labels(&self.config.node_name, &driver_label)
            .await
            .change_context(DriverManagerError::DisableDriverFailed)?;

        // give the driver pod time to be removed from the node
        sleep(self.timings.host_driver_settle).await;
        Err(Report::new(DriverManagerError::HostDriverPreinstalled))
    }

    /// True when the desired driver version is already loaded.
    ///
    /// Any uncertainty about the loaded version means the driver is reinstalled.
    async fn should_skip_uninstall(&self) -> bool {
        if self.config.force_reinstall {
            info!("Force reinstall is enabled, proceeding with driver uninstall");
            return false;
        }
        let Some(desired) = self.config.driver_version.as_deref() else {
            return false;
        };
        if !self.host.is_module_loaded(BASE_MODULE).await {
            return false;
        }

        match self.host.driver_version().await {
            Ok(version) if version == desired => {
                info!("Installed driver version {version} matches desired version, skipping uninstall");
                true
            }
            Ok(version) => {
                info!(
                    "Installed driver version {version} does not match desired {desired}, proceeding with uninstall"
                );
                false
            }
            Err(e) => {
                warn!("Unable to determine installed driver version: {e:?}");
                info!("Cannot verify driver version, proceeding with reinstall to ensure correct version is installed");
                false
            }
        }
    }

    async fn fetch_current_state(&mut self) -> Result<(), Report<DriverManagerError>> {
        info!("Fetching current component labels");
        let node = &self.config.node_name;
        let node_labels = self
            .cluster
            .node_labels(node)
            .await
            .change_context(DriverManagerError::FetchLabelsFailed)?;

        for component in Component::ALL {
            let value = node_labels
                .get(component.label_key())
                .cloned()
                .unwrap_or_default();
            info!("Current value of {:?}={value}", component.label_key());
            self.components.set(component, value);
        }

        if let Some(key) = self.config.custom_eviction_label.as_deref() {
            let value = node_labels.get(key).cloned().unwrap_or_default();
            info!("Current value of {key:?}={value} (custom operands)");
            self.components.set_custom(key, value);
        }

        let annotations = self
            .cluster
            .node_annotations(node)
            .await
            .change_context(DriverManagerError::FetchAnnotationFailed)?;
        let policy = annotations
            .get(labels::DRIVER_UPGRADE_ENABLED_ANNOTATION)
            .cloned()
            .unwrap_or_default();
        info!("Current value of AUTO_UPGRADE_POLICY_ENABLED={policy}");
        self.components.set_auto_upgrade_policy(policy);
        Ok(())
    }

    fn auto_drain_enabled(&self) -> bool {
        if self.components.auto_upgrade_policy_enabled() {
            info!("Auto drain of the node is disabled by the upgrade policy");
            return false;
        }
        self.config.enable_auto_drain
    }

    fn gpu_pod_eviction_enabled(&self) -> bool {
        if self.components.auto_upgrade_policy_enabled() {
            info!("Auto eviction of GPU pods is disabled by the upgrade policy");
            return false;
        }
        self.config.enable_gpu_pod_eviction
    }

    /// Forward steps between reading the node state and rescheduling.
    async fn remove_driver(&mut self) -> Result<(), Report<DriverManagerError>> {
        self.evict_operator_components().await?;
        self.enter(Stage::ComponentsEvicted);

        if self.gpu_pod_eviction_enabled() {
            self.cordon().await?;
            self.evict_gpu_pods().await?;
        }
        self.enter(Stage::PodsDrained);

        if self.host.is_module_loaded(BASE_MODULE).await {
            self.cleanup_driver().await?;
        }
        self.enter(Stage::ModulesUnloaded);

        self.host
            .unbind_vfio_devices()
            .await
            .change_context(DriverManagerError::VfioUnbindFailed)?;
        self.enter(Stage::DevicesRebound);

        if self.config.gpu_direct_rdma_enabled && self.host.rdma_devices_present().await {
            info!("GPUDirect RDMA is enabled, validating MOFED driver installation");
            self.wait_for_mofed().await?;
        }
        self.enter(Stage::RdmaWaited);
        Ok(())
    }

    async fn evict_operator_components(&self) -> Result<(), Report<DriverManagerError>> {
        info!("Shutting down all GPU clients on the current node by disabling their component-specific nodeSelector labels");
        let node = &self.config.node_name;
        self.cluster
            .update_node_labels(node, &self.components.paused_labels())
            .await
            .change_context(DriverManagerError::ComponentEvictionFailed)?;

        for app in self.components.pods_to_await() {
            info!("Waiting for {app} to shutdown");
            self.cluster
                .wait_for_pod_termination(
                    &format!("app={app}"),
                    &self.config.operator_namespace,
                    node,
                    self.timings.component_grace,
                )
                .await
                .change_context(DriverManagerError::ComponentEvictionFailed)
                .attach_printable_lazy(|| format!("{app} did not shut down"))?;
        }
        Ok(())
    }

    async fn cordon(&mut self) -> Result<(), Report<DriverManagerError>> {
        self.cluster
            .cordon(&self.config.node_name)
            .await
            .change_context(DriverManagerError::CordonFailed)?;
        self.cordoned = true;
        Ok(())
    }

    /// Evicts GPU pods, falling back to a full drain when some cannot be evicted.
    async fn evict_gpu_pods(&mut self) -> Result<(), Report<DriverManagerError>> {
        info!("Draining node of any GPU pods...");
        let evicted = match self
            .cluster
            .evict_gpu_pods(&self.config.node_name, &self.config.drain)
            .await
        {
            Ok(report) if report.is_complete() => true,
            Ok(report) => {
                info!(
                    "Failed to drain node of GPU pods: {} of {} deletable",
                    report.deletable, report.gpu_pods
                );
                false
            }
            Err(e) => {
                info!("Failed to drain node of GPU pods: {e:?}");
                false
            }
        };
        if evicted {
            return Ok(());
        }

        if !self.auto_drain_enabled() {
            return Err(Report::new(DriverManagerError::GpuPodsRemaining));
        }
        info!("Attempting node drain");
        self.drain_node().await?;
        self.host
            .cleanup_driver()
            .await
            .change_context(DriverManagerError::CleanupFailed)
    }

    async fn drain_node(&mut self) -> Result<(), Report<DriverManagerError>> {
        if !self.cordoned {
            self.cordon().await?;
        }
        self.cluster
            .drain_node(&self.config.node_name, &self.config.drain)
            .await
            .change_context(DriverManagerError::DrainFailed)
    }

    /// Unloads the driver, retrying once after a full drain if it is in use.
    async fn cleanup_driver(&mut self) -> Result<(), Report<DriverManagerError>> {
        if let Err(e) = self.host.cleanup_driver().await {
            if !self.auto_drain_enabled() {
                error!("Failed to uninstall nvidia driver components");
                return Err(e.change_context(DriverManagerError::CleanupFailed));
            }
            info!("Unable to cleanup driver modules, attempting again with node drain...");
            warn!("Driver cleanup failed: {e:?}");
            self.drain_node().await?;
            self.host
                .cleanup_driver()
                .await
                .change_context(DriverManagerError::CleanupFailed)?;
        }
        info!("Successfully uninstalled nvidia driver components");
        Ok(())
    }

    async fn wait_for_mofed(&self) -> Result<(), Report<DriverManagerError>> {
        info!("Waiting for MOFED to be installed");
        let deadline = self.timings.mofed_timeout.map(|timeout| Instant::now() + timeout);

        while !self.host.mofed_ready(self.config.use_host_mofed).await {
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Err(Report::new(DriverManagerError::MofedWaitFailed)
                    .attach_printable(format!("not ready after {:?}", self.timings.mofed_timeout)));
            }
            info!("Waiting for MOFED to be installed...");
            sleep(self.timings.mofed_poll_interval).await;
        }
        Ok(())
    }

    /// Uncordons (if we cordoned) and restores every paused label. Failures only warn.
    async fn reschedule(&mut self) {
        if self.cordoned {
            match self.cluster.uncordon(&self.config.node_name).await {
                Ok(()) => self.cordoned = false,
                Err(e) => warn!("Failed to uncordon node: {e:?}"),
            }
        }

        info!("Rescheduling all GPU clients on the current node by enabling their component-specific nodeSelector labels");
        if let Err(e) = self
            .cluster
            .update_node_labels(&self.config.node_name, &self.components.resumed_labels())
            .await
        {
            warn!("Failed to reschedule GPU operator components: {e:?}");
        }
    }

    async fn cleanup_on_failure(&mut self) {
        info!("Performing cleanup on failure");
        self.reschedule().await;
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::mock::Call;
    use super::mock::MockCluster;
    use super::mock::MockHost;
    use super::mock::MockNode;
    use super::*;
    use crate::config::DrainOptions;
    use crate::k8s::EvictionReport;

    const NODE: &str = "gpu-node-1";

    fn config() -> Config {
        Config {
            node_name: NODE.to_string(),
            drain: DrainOptions::default(),
            enable_auto_drain: true,
            enable_gpu_pod_eviction: true,
            operator_namespace: "gpu-operator".to_string(),
            custom_eviction_label: None,
            gpu_direct_rdma_enabled: false,
            use_host_mofed: false,
            driver_version: None,
            force_reinstall: false,
        }
    }

    fn instant() -> Timings {
        Timings {
            host_driver_settle: Duration::ZERO,
            component_grace: Duration::ZERO,
            mofed_poll_interval: Duration::ZERO,
            mofed_timeout: Some(Duration::from_millis(50)),
        }
    }

    fn manager(node: &MockNode, config: Config) -> DriverManager<MockCluster, MockHost> {
        DriverManager::new(config, node.cluster(), node.host()).with_timings(instant())
    }

    /// Labels of a node running the default GPU operator operands.
    fn operator_labels() -> BTreeMap<String, String> {
        [
            (labels::OPERATOR_VALIDATOR_DEPLOY_LABEL, "true"),
            (labels::CONTAINER_TOOLKIT_DEPLOY_LABEL, "true"),
            (labels::DEVICE_PLUGIN_DEPLOY_LABEL, "true"),
            (labels::GFD_DEPLOY_LABEL, "true"),
            (labels::DCGM_EXPORTER_DEPLOY_LABEL, "false"),
            (labels::DCGM_DEPLOY_LABEL, "true"),
            (labels::NVSM_DEPLOY_LABEL, ""),
            (labels::SANDBOX_VALIDATOR_DEPLOY_LABEL, ""),
            (labels::SANDBOX_DEVICE_PLUGIN_DEPLOY_LABEL, ""),
            (labels::VGPU_DEVICE_MANAGER_DEPLOY_LABEL, ""),
            ("kubernetes.io/hostname", NODE),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    fn loaded_node() -> MockNode {
        let node = MockNode::new(operator_labels());
        node.load_module("nvidia");
        node
    }

    fn count(calls: &[Call], wanted: &Call) -> usize {
        calls.iter().filter(|call| *call == wanted).count()
    }

    #[test(tokio::test)]
    async fn happy_path_restores_labels_without_drain() {
        let node = loaded_node();
        node.set_eviction(EvictionReport {
            gpu_pods: 2,
            deletable: 2,
            errors: vec![],
        });
        let mut manager = manager(&node, config());

        let outcome = manager.uninstall_driver().await.expect("uninstall succeeds");

        assert_eq!(outcome, UninstallOutcome::Completed);
        assert_eq!(manager.stage(), Stage::Done);
        assert_eq!(node.labels(), operator_labels());
        assert!(!node.is_cordoned());

        let calls = node.calls();
        assert_eq!(count(&calls, &Call::Drain), 0);
        assert_eq!(count(&calls, &Call::CleanupDriver), 1);
        assert_eq!(count(&calls, &Call::Cordon), 1);
        assert_eq!(count(&calls, &Call::Uncordon), 1);
        assert!(calls.contains(&Call::UnbindVfio));
    }

    #[test(tokio::test)]
    async fn components_are_paused_before_pods_are_awaited() {
        let node = loaded_node();
        let mut manager = manager(&node, config());
        manager.uninstall_driver().await.expect("uninstall succeeds");

        let calls = node.calls();
        let Call::UpdateLabels(paused) = &calls[0] else {
            panic!("first call should pause components, got {:?}", calls[0]);
        };
        assert_eq!(paused[labels::DEVICE_PLUGIN_DEPLOY_LABEL], labels::PAUSED_MARKER);
        assert_eq!(paused[labels::DCGM_EXPORTER_DEPLOY_LABEL], "false");
        assert!(!paused.contains_key(labels::MIG_MANAGER_DEPLOY_LABEL));

        let waited: Vec<&str> = calls
            .iter()
            .filter_map(|call| match call {
                Call::WaitForPods(selector) => Some(selector.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(
            waited,
            vec![
                "app=nvidia-operator-validator",
                "app=nvidia-container-toolkit-daemonset",
                "app=nvidia-device-plugin-daemonset",
                "app=gpu-feature-discovery",
                "app=nvidia-dcgm-exporter",
                "app=nvidia-dcgm",
            ]
        );
    }

    #[test(tokio::test)]
    async fn fetched_labels_decide_what_is_paused() {
        let mut labels = operator_labels();
        labels.insert(labels::MIG_MANAGER_DEPLOY_LABEL.to_string(), "true".to_string());
        labels.insert(labels::DRIVER_DEPLOY_LABEL.to_string(), "true".to_string());
        let node = MockNode::new(labels);
        node.set_annotation(labels::DRIVER_UPGRADE_ENABLED_ANNOTATION, "false");
        let mut manager = manager(&node, config());

        manager.uninstall_driver().await.expect("uninstall succeeds");

        let calls = node.calls();
        let Call::UpdateLabels(paused) = &calls[0] else {
            panic!("first call should pause components, got {:?}", calls[0]);
        };
        assert_eq!(paused[labels::MIG_MANAGER_DEPLOY_LABEL], labels::PAUSED_MARKER);
        assert_eq!(paused[labels::OPERATOR_VALIDATOR_DEPLOY_LABEL], labels::PAUSED_MARKER);
        assert_eq!(paused[labels::NVSM_DEPLOY_LABEL], "");
        assert!(!paused.contains_key(labels::DRIVER_DEPLOY_LABEL));
        assert!(!paused.contains_key("kubernetes.io/hostname"));
        assert!(calls.contains(&Call::WaitForPods("app=nvidia-mig-manager".to_string())));
        // "false" leaves eviction enabled
        assert!(calls.contains(&Call::EvictGpuPods));
    }

    #[test(tokio::test)]
    async fn partial_eviction_falls_back_to_drain_and_one_cleanup() {
        let node = loaded_node();
        node.set_eviction(EvictionReport {
            gpu_pods: 2,
            deletable: 1,
            errors: vec!["default/bare: pod is not managed by a controller".to_string()],
        });
        let mut manager = manager(&node, config());

        manager.uninstall_driver().await.expect("fallback succeeds");

        let calls = node.calls();
        let drain = calls
            .iter()
            .position(|call| *call == Call::Drain)
            .expect("drain invoked");
        assert_eq!(count(&calls, &Call::Drain), 1);
        assert_eq!(calls[drain + 1], Call::CleanupDriver);
        // the fallback cleanup unloaded the driver, the regular step is skipped
        assert_eq!(count(&calls, &Call::CleanupDriver), 1);
        assert_eq!(manager.stage(), Stage::Done);
        assert_eq!(node.labels(), operator_labels());
    }

    #[test(tokio::test)]
    async fn partial_eviction_without_auto_drain_rolls_back() {
        let node = loaded_node();
        node.set_eviction(EvictionReport {
            gpu_pods: 2,
            deletable: 1,
            errors: vec![],
        });
        let mut manager = manager(
            &node,
            Config {
                enable_auto_drain: false,
                ..config()
            },
        );

        let err = manager.uninstall_driver().await.expect_err("should fail");

        assert!(matches!(
            err.current_context(),
            DriverManagerError::GpuPodsRemaining
        ));
        assert_eq!(manager.stage(), Stage::Failed);
        assert!(!node.calls().contains(&Call::Drain));
        assert!(!node.is_cordoned());
        assert_eq!(node.labels(), operator_labels());
    }

    #[test(tokio::test)]
    async fn upgrade_policy_annotation_bypasses_eviction_and_drain() {
        let node = loaded_node();
        node.set_annotation(labels::DRIVER_UPGRADE_ENABLED_ANNOTATION, "true");
        // the driver is busy, which would normally trigger a drain
        node.fail_cleanups(1);
        let mut manager = manager(&node, config());

        let err = manager.uninstall_driver().await.expect_err("cleanup fails");

        assert!(matches!(
            err.current_context(),
            DriverManagerError::CleanupFailed
        ));
        let calls = node.calls();
        assert!(!calls.contains(&Call::Cordon));
        assert!(!calls.contains(&Call::EvictGpuPods));
        assert!(!calls.contains(&Call::Drain));
        assert_eq!(node.labels(), operator_labels());
    }

    #[test(tokio::test)]
    async fn busy_driver_is_retried_once_after_drain() {
        let node = loaded_node();
        node.fail_cleanups(1);
        let mut manager = manager(
            &node,
            Config {
                enable_gpu_pod_eviction: false,
                ..config()
            },
        );

        manager.uninstall_driver().await.expect("retry succeeds");

        let calls = node.calls();
        assert_eq!(count(&calls, &Call::CleanupDriver), 2);
        assert_eq!(count(&calls, &Call::Drain), 1);
        // the drain cordoned the node, so it must be uncordoned again
        assert_eq!(count(&calls, &Call::Cordon), 1);
        assert!(!node.is_cordoned());
    }

    #[test(tokio::test)]
    async fn matching_driver_version_skips_uninstall() {
        let node = loaded_node();
        node.set_driver_version(Some("550.54.15"));
        let mut manager = manager(
            &node,
            Config {
                driver_version: Some("550.54.15".to_string()),
                ..config()
            },
        );

        let outcome = manager.uninstall_driver().await.expect("skip");

        assert_eq!(outcome, UninstallOutcome::Skipped);
        assert_eq!(manager.stage(), Stage::Done);
        assert!(node.calls().is_empty());
    }

    #[test(tokio::test)]
    async fn unknown_driver_version_reinstalls() {
        let node = loaded_node();
        node.set_driver_version(None);
        let mut manager = manager(
            &node,
            Config {
                driver_version: Some("550.54.15".to_string()),
                ..config()
            },
        );

        let outcome = manager.uninstall_driver().await.expect("uninstall succeeds");
        assert_eq!(outcome, UninstallOutcome::Completed);
        assert!(node.calls().contains(&Call::CleanupDriver));
    }

    #[test(tokio::test)]
    async fn force_reinstall_ignores_matching_version() {
        let node = loaded_node();
        node.set_driver_version(Some("550.54.15"));
        let mut manager = manager(
            &node,
            Config {
                driver_version: Some("550.54.15".to_string()),
                force_reinstall: true,
                ..config()
            },
        );

        let outcome = manager.uninstall_driver().await.expect("uninstall succeeds");
        assert_eq!(outcome, UninstallOutcome::Completed);
    }

    #[test(tokio::test)]
    async fn host_driver_marks_node_and_fails() {
        let node = loaded_node();
        node.set_host_driver(Some("535.129.03"));
        let mut manager = manager(&node, config());

        let err = manager.uninstall_driver().await.expect_err("should stop");

        assert!(matches!(
            err.current_context(),
            DriverManagerError::HostDriverPreinstalled
        ));
        assert_eq!(
            node.labels()[labels::DRIVER_DEPLOY_LABEL],
            labels::DRIVER_PREINSTALLED
        );
        assert!(!node.calls().contains(&Call::CleanupDriver));
    }

    #[test(tokio::test)]
    async fn label_read_failure_changes_nothing() {
        let node = loaded_node();
        node.fail_label_reads();
        let mut manager = manager(&node, config());

        let err = manager.uninstall_driver().await.expect_err("should fail");

        assert!(matches!(
            err.current_context(),
            DriverManagerError::FetchLabelsFailed
        ));
        assert!(node.calls().is_empty());
        assert_eq!(manager.stage(), Stage::Failed);
    }

    #[test(tokio::test)]
    async fn vfio_unbind_failure_rolls_back() {
        let node = loaded_node();
        node.fail_vfio_unbind();
        let mut manager = manager(&node, config());

        let err = manager.uninstall_driver().await.expect_err("should fail");

        assert!(matches!(
            err.current_context(),
            DriverManagerError::VfioUnbindFailed
        ));
        assert!(!node.is_cordoned());
        assert_eq!(node.labels(), operator_labels());
    }

    #[test(tokio::test)]
    async fn component_shutdown_timeout_rolls_back() {
        let node = loaded_node();
        node.stuck_pods("app=nvidia-dcgm");
        let mut manager = manager(&node, config());

        let err = manager.uninstall_driver().await.expect_err("should fail");

        assert!(matches!(
            err.current_context(),
            DriverManagerError::ComponentEvictionFailed
        ));
        assert!(!node.calls().contains(&Call::Cordon));
        assert_eq!(node.labels(), operator_labels());
    }

    #[test(tokio::test)]
    async fn rdma_waits_for_mofed() {
        let node = loaded_node();
        node.set_rdma(true, 2);
        let mut manager = manager(
            &node,
            Config {
                gpu_direct_rdma_enabled: true,
                ..config()
            },
        );

        manager.uninstall_driver().await.expect("mofed becomes ready");
        assert_eq!(count(&node.calls(), &Call::MofedProbe), 3);
    }

    #[test(tokio::test)]
    async fn mofed_timeout_rolls_back() {
        let node = loaded_node();
        node.set_rdma(true, usize::MAX);
        let mut manager = manager(
            &node,
            Config {
                gpu_direct_rdma_enabled: true,
                ..config()
            },
        );

        let err = manager.uninstall_driver().await.expect_err("mofed never ready");
        assert!(matches!(
            err.current_context(),
            DriverManagerError::MofedWaitFailed
        ));
        assert_eq!(node.labels(), operator_labels());
    }

    #[test(tokio::test)]
    async fn nouveau_is_unloaded_last() {
        let node = loaded_node();
        node.load_module("nouveau");
        let mut manager = manager(&node, config());

        manager.uninstall_driver().await.expect("uninstall succeeds");
        assert_eq!(node.calls().last(), Some(&Call::UnloadNouveau));
    }

    #[test(tokio::test)]
    async fn custom_label_is_paused_and_restored() {
        let mut labels = operator_labels();
        labels.insert("example.com/gpu-workload".to_string(), "enabled".to_string());
        let node = MockNode::new(labels.clone());
        let mut manager = manager(
            &node,
            Config {
                custom_eviction_label: Some("example.com/gpu-workload".to_string()),
                ..config()
            },
        );

        manager.uninstall_driver().await.expect("uninstall succeeds");

        let calls = node.calls();
        let Call::UpdateLabels(paused) = &calls[0] else {
            panic!("expected label update");
        };
        assert_eq!(
            paused["example.com/gpu-workload"],
            "enabled_paused-for-driver-upgrade"
        );
        assert_eq!(node.labels(), labels);
    }

    #[test(tokio::test)]
    async fn resume_after_crash_restores_original_values() {
        // a previous run paused the labels and died before resuming them
        let mut labels = operator_labels();
        labels.insert(
            labels::DEVICE_PLUGIN_DEPLOY_LABEL.to_string(),
            labels::PAUSED_MARKER.to_string(),
        );
        labels.insert(
            labels::MIG_MANAGER_DEPLOY_LABEL.to_string(),
            "custom_paused-for-driver-upgrade".to_string(),
        );
        let node = MockNode::new(labels);
        let mut manager = manager(&node, config());

        manager.uninstall_driver().await.expect("uninstall succeeds");

        let final_labels = node.labels();
        assert_eq!(final_labels[labels::DEVICE_PLUGIN_DEPLOY_LABEL], "true");
        assert_eq!(final_labels[labels::MIG_MANAGER_DEPLOY_LABEL], "custom");
    }
}

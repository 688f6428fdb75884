//! In-memory cluster and host recording what the driver manager does to a node.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use error_stack::Report;

use crate::config::DrainOptions;
use crate::host::HostError;
use crate::host::HostSystem;
use crate::k8s::ClusterControl;
use crate::k8s::EvictionReport;
use crate::k8s::KubernetesError;

/// Mutating calls, in the order they were made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    UpdateLabels(BTreeMap<String, String>),
    Cordon,
    Uncordon,
    WaitForPods(String),
    Drain,
    EvictGpuPods,
    CleanupDriver,
    UnbindVfio,
    MofedProbe,
    UnloadNouveau,
}

#[derive(Default)]
struct NodeState {
    labels: BTreeMap<String, String>,
    annotations: BTreeMap<String, String>,
    unschedulable: bool,
    fail_label_reads: bool,
    stuck_selectors: HashSet<String>,
    eviction: EvictionReport,

    host_driver: Option<String>,
    driver_version: Option<String>,
    modules: HashSet<String>,
    failing_cleanups: usize,
    fail_vfio_unbind: bool,
    rdma_present: bool,
    mofed_not_ready: usize,

    calls: Vec<Call>,
}

/// Shared state behind [`MockCluster`] and [`MockHost`].
#[derive(Clone, Default)]
pub struct MockNode {
    state: Arc<Mutex<NodeState>>,
}

impl MockNode {
    pub fn new(labels: BTreeMap<String, String>) -> Self {
        let node = Self::default();
        node.with(|state| state.labels = labels);
        node
    }

    fn with<T>(&self, f: impl FnOnce(&mut NodeState) -> T) -> T {
        f(&mut self.state.lock().expect("poisoned"))
    }

    pub fn cluster(&self) -> MockCluster {
        MockCluster(self.clone())
    }

    pub fn host(&self) -> MockHost {
        MockHost(self.clone())
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        self.with(|state| state.labels.clone())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.with(|state| state.calls.clone())
    }

    pub fn is_cordoned(&self) -> bool {
        self.with(|state| state.unschedulable)
    }

    pub fn set_annotation(&self, key: &str, value: &str) {
        self.with(|state| state.annotations.insert(key.to_string(), value.to_string()));
    }

    pub fn set_eviction(&self, report: EvictionReport) {
        self.with(|state| state.eviction = report);
    }

    pub fn fail_label_reads(&self) {
        self.with(|state| state.fail_label_reads = true);
    }

    pub fn stuck_pods(&self, selector: &str) {
        self.with(|state| state.stuck_selectors.insert(selector.to_string()));
    }

    pub fn load_module(&self, module: &str) {
        self.with(|state| state.modules.insert(module.to_string()));
    }

    pub fn set_host_driver(&self, version: Option<&str>) {
        self.with(|state| state.host_driver = version.map(str::to_string));
    }

    pub fn set_driver_version(&self, version: Option<&str>) {
        self.with(|state| state.driver_version = version.map(str::to_string));
    }

    /// The next `count` driver cleanups fail as if the driver were in use.
    pub fn fail_cleanups(&self, count: usize) {
        self.with(|state| state.failing_cleanups = count);
    }

    pub fn fail_vfio_unbind(&self) {
        self.with(|state| state.fail_vfio_unbind = true);
    }

    /// MOFED reports ready after `not_ready` failed probes.
    pub fn set_rdma(&self, present: bool, not_ready: usize) {
        self.with(|state| {
            state.rdma_present = present;
            state.mofed_not_ready = not_ready;
        });
    }

    fn record(&self, call: Call) {
        self.with(|state| state.calls.push(call));
    }
}

pub struct MockCluster(MockNode);

#[async_trait]
impl ClusterControl for MockCluster {
    async fn node_labels(
        &self,
        node: &str,
    ) -> Result<BTreeMap<String, String>, Report<KubernetesError>> {
        self.0.with(|state| {
            if state.fail_label_reads {
                return Err(Report::new(KubernetesError::NodeReadFailed {
                    node: node.to_string(),
                }));
            }
            Ok(state.labels.clone())
        })
    }

    async fn node_annotations(
        &self,
        _node: &str,
    ) -> Result<BTreeMap<String, String>, Report<KubernetesError>> {
        Ok(self.0.with(|state| state.annotations.clone()))
    }

    async fn update_node_labels(
        &self,
        _node: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), Report<KubernetesError>> {
        self.0.record(Call::UpdateLabels(labels.clone()));
        self.0.with(|state| {
            state
                .labels
                .extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())))
        });
        Ok(())
    }

    async fn cordon(&self, _node: &str) -> Result<(), Report<KubernetesError>> {
        self.0.record(Call::Cordon);
        self.0.with(|state| state.unschedulable = true);
        Ok(())
    }

    async fn uncordon(&self, _node: &str) -> Result<(), Report<KubernetesError>> {
        self.0.record(Call::Uncordon);
        self.0.with(|state| state.unschedulable = false);
        Ok(())
    }

    async fn wait_for_pod_termination(
        &self,
        selector: &str,
        _namespace: &str,
        _node: &str,
        timeout: Duration,
    ) -> Result<(), Report<KubernetesError>> {
        self.0.record(Call::WaitForPods(selector.to_string()));
        if self.0.with(|state| state.stuck_selectors.contains(selector)) {
            return Err(Report::new(KubernetesError::PodTerminationTimeout {
                selector: selector.to_string(),
                timeout,
            }));
        }
        Ok(())
    }

    async fn drain_node(
        &self,
        _node: &str,
        _options: &DrainOptions,
    ) -> Result<(), Report<KubernetesError>> {
        self.0.record(Call::Drain);
        Ok(())
    }

    async fn evict_gpu_pods(
        &self,
        _node: &str,
        _options: &DrainOptions,
    ) -> Result<EvictionReport, Report<KubernetesError>> {
        self.0.record(Call::EvictGpuPods);
        Ok(self.0.with(|state| state.eviction.clone()))
    }
}

pub struct MockHost(MockNode);

#[async_trait]
impl HostSystem for MockHost {
    async fn host_driver_version(&self) -> Option<String> {
        self.0.with(|state| state.host_driver.clone())
    }

    async fn driver_version(&self) -> Result<String, Report<HostError>> {
        self.0
            .with(|state| state.driver_version.clone())
            .ok_or_else(|| Report::new(HostError::VersionUnknown))
    }

    async fn is_module_loaded(&self, module: &str) -> bool {
        self.0.with(|state| state.modules.contains(module))
    }

    async fn cleanup_driver(&self) -> Result<(), Report<HostError>> {
        self.0.record(Call::CleanupDriver);
        self.0.with(|state| {
            if state.failing_cleanups > 0 {
                state.failing_cleanups -= 1;
                return Err(Report::new(HostError::ModulesInUse));
            }
            state.modules.remove("nvidia");
            Ok(())
        })
    }

    async fn unbind_vfio_devices(&self) -> Result<(), Report<HostError>> {
        self.0.record(Call::UnbindVfio);
        if self.0.with(|state| state.fail_vfio_unbind) {
            return Err(Report::new(HostError::CommandFailed {
                command: "vfio-manage unbind --all".to_string(),
            }));
        }
        Ok(())
    }

    async fn rdma_devices_present(&self) -> bool {
        self.0.with(|state| state.rdma_present)
    }

    async fn mofed_ready(&self, _use_host_mofed: bool) -> bool {
        self.0.record(Call::MofedProbe);
        self.0.with(|state| {
            if state.mofed_not_ready == 0 {
                return true;
            }
            state.mofed_not_ready -= 1;
            false
        })
    }

    async fn unload_nouveau(&self) -> Result<(), Report<HostError>> {
        self.0.record(Call::UnloadNouveau);
        self.0.with(|state| state.modules.remove("nouveau"));
        Ok(())
    }
}

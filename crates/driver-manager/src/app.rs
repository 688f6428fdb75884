//! Process-wide Kubernetes state shared by the subcommands.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use kube::Client;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::k8s::kube_client::init_kube_client;
use crate::k8s::KubeCluster;
use crate::k8s::KubernetesError;
use crate::k8s::ResourceClaimCache;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Kubernetes client plus the background tasks keeping the claim cache fresh.
pub struct ManagerContext {
    client: Client,
    claims: Arc<ResourceClaimCache>,
    cancellation_token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ManagerContext {
    /// Connects to the API server and waits for the resource claim cache to sync.
    pub async fn start(kubeconfig: Option<PathBuf>) -> Result<Self, Report<KubernetesError>> {
        let client = init_kube_client(kubeconfig).await?;
        let cancellation_token = CancellationToken::new();
        let (claims, tasks) =
            ResourceClaimCache::start(client.clone(), cancellation_token.clone()).await?;
        info!("Resource claim cache synced");

        Ok(Self {
            client,
            claims,
            cancellation_token,
            tasks,
        })
    }

    pub fn cluster(&self) -> KubeCluster {
        KubeCluster::new(self.client.clone(), self.claims.clone())
    }

    /// Stops the background tasks, giving them a short grace period.
    pub async fn shutdown(mut self) {
        self.cancellation_token.cancel();
        self.wait_for_tasks_with_timeout(SHUTDOWN_TIMEOUT).await;
    }

    async fn wait_for_tasks_with_timeout(&mut self, timeout: Duration) {
        tokio::time::timeout(timeout, async {
            for task in &mut self.tasks {
                if let Err(e) = task.await {
                    error!("Task failed during shutdown: {e}");
                }
            }
        })
        .await
        .unwrap_or_else(|_| {
            warn!("Task shutdown timed out after {:?}", timeout);
        });
    }
}

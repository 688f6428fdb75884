use std::path::Path;
use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use kube::config::KubeConfigOptions;
use kube::config::Kubeconfig;
use kube::Client;
use kube::Config;
use tracing::info;

use crate::k8s::KubernetesError;

/// Connects the driver manager to the API server.
///
/// Inside the driver DaemonSet pod the service account is used. `--kubeconfig`
/// overrides it when running the manager by hand against a remote cluster.
pub async fn init_kube_client(
    kubeconfig: Option<PathBuf>,
) -> Result<Client, Report<KubernetesError>> {
    match kubeconfig {
        Some(path) => {
            info!(kubeconfig = %path.display(), "Using kubeconfig file");
            client_from_kubeconfig(&path).await
        }
        None => Client::try_default()
            .await
            .change_context(KubernetesError::ConnectionFailed {
                message: "no in-cluster service account or default kubeconfig".to_string(),
            }),
    }
}

async fn client_from_kubeconfig(path: &Path) -> Result<Client, Report<KubernetesError>> {
    let connection_failed = || KubernetesError::ConnectionFailed {
        message: format!("unusable kubeconfig {}", path.display()),
    };

    let kubeconfig = Kubeconfig::read_from(path).change_context_lazy(connection_failed)?;
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .change_context_lazy(connection_failed)?;
    Client::try_from(config).change_context_lazy(connection_failed)
}

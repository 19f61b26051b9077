//! Kubernetes client construction from the admin kubeconfig stored in the
//! cluster status.

use kube::config::{KubeConfigOptions, Kubeconfig};
use talemu_runtime::Error;

/// Build a client from an inline kubeconfig document.
pub async fn from_kubeconfig(kubeconfig: &str) -> Result<kube::Client, Error> {
    let kubeconfig = Kubeconfig::from_yaml(kubeconfig)
        .map_err(|e| Error::controller("parsing admin kubeconfig", e))?;
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::controller("building kube config", e))?;
    kube::Client::try_from(config).map_err(|e| Error::controller("building kube client", e))
}

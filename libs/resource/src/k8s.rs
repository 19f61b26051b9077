//! Kubernetes namespace resources.

use serde::{Deserialize, Serialize};

use crate::config::spec;
use crate::ns;

/// Static pod ids managed on control planes.
pub const APISERVER: &str = "kube-apiserver";
pub const CONTROLLER_MANAGER: &str = "kube-controller-manager";
pub const SCHEDULER: &str = "kube-scheduler";

/// Kubernetes-compliant node name derived from the hostname.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Nodename {
    pub nodename: String,
}
spec!(Nodename, ns::K8S, "Nodename");

/// A static pod to be applied through the cluster's admin kubeconfig. The
/// manifest is a full `v1.Pod` document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticPod {
    pub pod: serde_json::Value,
}
spec!(StaticPod, ns::K8S, "StaticPod");

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretsStatus {
    pub ready: bool,
    /// Version of the root secrets the rendered files were produced from.
    pub version: String,
}
spec!(SecretsStatus, ns::K8S, "SecretsStatus");

//! Kubernetes-facing simulation: static pods and the node object are driven
//! through the cluster's admin kubeconfig rather than a running kubelet.

pub mod client;
pub mod kubeconfig;
pub mod node;
pub mod staticpod;

pub use kubeconfig::KubeconfigController;
pub use node::KubernetesNodeController;
pub use staticpod::StaticPodController;

//! Identity and TLS secret controllers: root CAs projected from the machine
//! configuration, short-lived Kubernetes serving certs, the node-management
//! API certificate (locally issued on control planes, remotely signed for
//! workers), and the on-disk rendering consumed by static pods.

pub mod apicert;
pub mod dynamic;
pub mod pki;
pub mod render;
pub mod roots;
pub mod sans;

pub use apicert::{ApiCertController, CsrSigner, SignedCertificate};
pub use dynamic::KubernetesDynamicCertsController;
pub use render::RenderSecretsController;
pub use roots::{KubernetesRootController, OsRootController};
pub use sans::ApiCertSansController;

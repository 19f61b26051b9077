//! Secrets namespace resources: CA bundles, issued certificates and the SAN
//! sets they are issued for. All key material is PEM-encoded strings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::spec;
use crate::ns;

/// Id of the API cert SAN set.
pub const API_CERT_SANS: &str = "api";

/// OS-level root secrets. Control planes carry the full CA key pair; workers
/// only the accepted certificates.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OsRoot {
    pub ca_crt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_key: Option<String>,
    pub cert_sans_ips: Vec<String>,
    pub cert_sans_dns: Vec<String>,
}
spec!(OsRoot, ns::SECRETS, "OSRoot");

/// Kubernetes-level root secrets projected from a control-plane machine
/// configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesRoot {
    pub ca_crt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_key: Option<String>,
    pub aggregator_ca_crt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregator_ca_key: Option<String>,
    pub service_account_key: String,
    /// `https://<first-node-address>:6443`
    pub endpoint: String,
    pub cert_sans_ips: Vec<String>,
    pub cert_sans_dns: Vec<String>,
    /// Admin kubeconfig rendered against `endpoint`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_kubeconfig: Option<String>,
}
spec!(KubernetesRoot, ns::SECRETS, "KubernetesRoot");

/// Short-lived Kubernetes serving certs, reissued every half validity period
/// or on root change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesDynamicCerts {
    pub api_server_crt: String,
    pub api_server_key: String,
    pub kubelet_client_crt: String,
    pub kubelet_client_key: String,
    pub front_proxy_crt: String,
    pub front_proxy_key: String,
    pub valid_until: DateTime<Utc>,
}
spec!(KubernetesDynamicCerts, ns::SECRETS, "KubernetesDynamicCerts");

/// Certificates for the node-management gRPC surface.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiCert {
    pub server_crt: String,
    pub server_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_crt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key: Option<String>,
    /// PEM bundle of CAs accepted for peer verification.
    pub accepted_cas: Vec<String>,
}
spec!(ApiCert, ns::SECRETS, "APICertificates");

/// Merged SAN set the API cert is issued for.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertSans {
    pub ips: Vec<String>,
    pub dns_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fqdn: Option<String>,
}
spec!(CertSans, ns::SECRETS, "CertSANs");

impl CertSans {
    /// Sorted, deduplicated union of everything certifiable.
    pub fn all(&self) -> Vec<String> {
        let mut all: Vec<String> = self
            .ips
            .iter()
            .chain(self.dns_names.iter())
            .chain(self.fqdn.iter())
            .cloned()
            .collect();
        all.sort();
        all.dedup();
        all
    }
}

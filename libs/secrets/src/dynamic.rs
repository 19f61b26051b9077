//! Short-lived Kubernetes serving certificates, reissued on root change and
//! on a periodic tick at half validity.

use async_trait::async_trait;
use chrono::Utc;
use talemu_resource::Resource;
use talemu_resource::config::id;
use talemu_resource::secrets::{CertSans, KubernetesDynamicCerts, KubernetesRoot, API_CERT_SANS};
use talemu_runtime::{ControllerContext, Error, Input, Output, Reconcile, Result};
use time::Duration;

use crate::pki::{self, CertUse, LeafRequest};

/// Validity of the issued serving certs; refresh happens at half of this.
const VALIDITY: Duration = Duration::hours(24);

pub struct KubernetesDynamicCertsController;

#[async_trait]
impl Reconcile for KubernetesDynamicCertsController {
    fn name(&self) -> &'static str {
        "KubernetesDynamicCertsController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::weak::<KubernetesRoot>().with_id(id::CURRENT),
            Input::weak::<CertSans>().with_id(API_CERT_SANS),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<KubernetesDynamicCerts>()]
    }

    async fn reconcile(&self, ctx: &ControllerContext) -> Result<()> {
        let Some(root) = ctx.get_optional::<KubernetesRoot>(id::CURRENT)? else {
            ctx.teardown_and_destroy::<KubernetesDynamicCerts>(id::CURRENT)?;
            return Ok(());
        };
        let Some(ca_key) = root.spec.ca_key.as_deref() else {
            return Ok(());
        };

        let half = std::time::Duration::from_secs(VALIDITY.whole_seconds() as u64 / 2);

        // Still fresh: come back at the half-validity boundary.
        if let Some(existing) = ctx.get_optional::<KubernetesDynamicCerts>(id::CURRENT)? {
            let age_left = existing.spec.valid_until - Utc::now();
            if age_left > chrono::Duration::from_std(half).unwrap_or_else(|_| chrono::Duration::zero()) {
                ctx.requeue_after(half);
                return Ok(());
            }
        }

        let ca = pki::load_ca(&root.spec.ca_crt, ca_key)
            .map_err(|e| Error::controller("reloading kubernetes ca", e))?;
        let aggregator_key = root.spec.aggregator_ca_key.as_deref().unwrap_or(ca_key);
        let aggregator = pki::load_ca(&root.spec.aggregator_ca_crt, aggregator_key)
            .map_err(|e| Error::controller("reloading aggregator ca", e))?;

        let mut san: Vec<String> = root.spec.cert_sans_dns.clone();
        san.extend(root.spec.cert_sans_ips.iter().cloned());
        if let Some(sans) = ctx.get_optional::<CertSans>(API_CERT_SANS)? {
            san.extend(sans.spec.all());
        }
        san.sort();
        san.dedup();

        let api_server = ca
            .issue(&LeafRequest {
                common_name: "kube-apiserver",
                organization: None,
                san: &san,
                cert_use: CertUse::Server,
                valid_for: VALIDITY,
            })
            .map_err(|e| Error::controller("issuing api-server cert", e))?;
        let kubelet_client = ca
            .issue(&LeafRequest {
                common_name: "apiserver-kubelet-client",
                organization: Some("kube-master"),
                san: &[],
                cert_use: CertUse::Client,
                valid_for: VALIDITY,
            })
            .map_err(|e| Error::controller("issuing apiserver-kubelet-client cert", e))?;
        let front_proxy = aggregator
            .issue(&LeafRequest {
                common_name: "front-proxy-client",
                organization: None,
                san: &[],
                cert_use: CertUse::Client,
                valid_for: VALIDITY,
            })
            .map_err(|e| Error::controller("issuing front-proxy-client cert", e))?;

        ctx.apply(Resource::new(
            id::CURRENT,
            KubernetesDynamicCerts {
                api_server_crt: api_server.crt,
                api_server_key: api_server.key,
                kubelet_client_crt: kubelet_client.crt,
                kubelet_client_key: kubelet_client.key,
                front_proxy_crt: front_proxy.crt,
                front_proxy_key: front_proxy.key,
                valid_until: Utc::now()
                    + chrono::Duration::from_std(half * 2)
                        .unwrap_or_else(|_| chrono::Duration::zero()),
            },
        ))?;
        ctx.requeue_after(half);

        Ok(())
    }
}

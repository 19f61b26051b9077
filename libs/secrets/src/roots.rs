//! Root secret projection from the machine configuration.

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use talemu_resource::config::{CompleteMachineConfig, MachineTypeSpec, id};
use talemu_resource::document::ParsedConfig;
use talemu_resource::network::{NodeAddress, node_address};
use talemu_resource::secrets::{KubernetesRoot, OsRoot};
use talemu_resource::Resource;
use talemu_runtime::{ControllerContext, Error, Input, Output, Reconcile, Result};
use time::Duration;

use crate::pki::{self, Authority, CertUse, LeafRequest};

const CA_VALIDITY: Duration = Duration::days(10 * 365);

fn parse_config(config: &Resource<CompleteMachineConfig>) -> Result<ParsedConfig> {
    config
        .spec
        .parse()
        .map_err(|e| Error::controller("parsing machine config", e))
}

/// Config-carried CAs arrive base64-encoded; generated ones are plain PEM.
fn decode_pem(value: &str) -> String {
    match BASE64.decode(value) {
        Ok(decoded) => String::from_utf8(decoded).unwrap_or_else(|_| value.to_string()),
        Err(_) => value.to_string(),
    }
}

/// Resolve the CA for an output resource: prefer the pair carried in the
/// configuration, then the previously generated pair stored in the output,
/// then generate a fresh one.
fn resolve_ca(
    configured: Option<(String, Option<String>)>,
    stored: Option<(String, Option<String>)>,
    common_name: &str,
) -> Result<Authority> {
    let existing = configured.or(stored);
    match existing {
        Some((crt, Some(key))) => pki::load_ca(&crt, &key)
            .map_err(|e| Error::controller("reloading certificate authority", e)),
        _ => pki::generate_ca(common_name, CA_VALIDITY)
            .map_err(|e| Error::controller("generating certificate authority", e)),
    }
}

/// Projects the OS-level root secrets. Control planes carry the full CA;
/// workers only the accepted certificate.
pub struct OsRootController;

#[async_trait]
impl Reconcile for OsRootController {
    fn name(&self) -> &'static str {
        "OsRootController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::weak::<CompleteMachineConfig>().with_id(id::CURRENT),
            Input::weak::<MachineTypeSpec>().with_id(id::CURRENT),
            Input::weak::<NodeAddress>().with_id(node_address::DEFAULT),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<OsRoot>()]
    }

    async fn reconcile(&self, ctx: &ControllerContext) -> Result<()> {
        let Some(config) = ctx.get_optional::<CompleteMachineConfig>(id::CURRENT)? else {
            ctx.teardown_and_destroy::<OsRoot>(id::CURRENT)?;
            return Ok(());
        };
        let parsed = parse_config(&config)?;

        let machine_ca = parsed
            .document
            .as_ref()
            .and_then(|d| d.machine.as_ref())
            .and_then(|m| m.ca.as_ref());

        let mut cert_sans_ips: Vec<String> = ctx
            .get_optional::<NodeAddress>(node_address::DEFAULT)?
            .map(|a| a.spec.addresses)
            .unwrap_or_default();
        let mut cert_sans_dns: Vec<String> = Vec::new();
        if let Some(machine) = parsed.document.as_ref().and_then(|d| d.machine.as_ref()) {
            for san in &machine.cert_sans {
                if san.parse::<std::net::IpAddr>().is_ok() {
                    cert_sans_ips.push(san.clone());
                } else {
                    cert_sans_dns.push(san.clone());
                }
            }
        }
        cert_sans_ips.sort();
        cert_sans_ips.dedup();

        let control_plane = ctx
            .get_optional::<MachineTypeSpec>(id::CURRENT)?
            .is_some_and(|t| t.spec.machine_type.is_control_plane());

        let spec = if control_plane {
            let stored = ctx
                .get_optional::<OsRoot>(id::CURRENT)?
                .filter(|r| !r.spec.ca_crt.is_empty())
                .map(|r| (r.spec.ca_crt, r.spec.ca_key));
            let configured = machine_ca
                .filter(|ca| !ca.crt.is_empty())
                .map(|ca| (decode_pem(&ca.crt), ca.key.as_deref().map(decode_pem)));
            let ca = resolve_ca(configured, stored, "talos")?;

            OsRoot {
                ca_crt: ca.pair.crt.clone(),
                ca_key: Some(ca.pair.key.clone()),
                cert_sans_ips,
                cert_sans_dns,
            }
        } else {
            OsRoot {
                ca_crt: machine_ca.map(|ca| decode_pem(&ca.crt)).unwrap_or_default(),
                ca_key: None,
                cert_sans_ips,
                cert_sans_dns,
            }
        };

        ctx.apply(Resource::new(id::CURRENT, spec))?;
        Ok(())
    }
}

/// Projects the Kubernetes root secrets on control planes: cluster CA,
/// aggregator CA, service account key, control-plane endpoint and the admin
/// kubeconfig.
pub struct KubernetesRootController;

pub(crate) fn render_kubeconfig(
    cluster_name: &str,
    endpoint: &str,
    ca_crt: &str,
    client: &pki::CertifiedPair,
) -> String {
    format!(
        "apiVersion: v1\n\
         kind: Config\n\
         clusters:\n\
         - name: {cluster}\n\
         \x20 cluster:\n\
         \x20   server: {endpoint}\n\
         \x20   certificate-authority-data: {ca}\n\
         users:\n\
         - name: admin@{cluster}\n\
         \x20 user:\n\
         \x20   client-certificate-data: {crt}\n\
         \x20   client-key-data: {key}\n\
         contexts:\n\
         - name: admin@{cluster}\n\
         \x20 context:\n\
         \x20   cluster: {cluster}\n\
         \x20   user: admin@{cluster}\n\
         current-context: admin@{cluster}\n",
        cluster = cluster_name,
        endpoint = endpoint,
        ca = BASE64.encode(ca_crt),
        crt = BASE64.encode(&client.crt),
        key = BASE64.encode(&client.key),
    )
}

#[async_trait]
impl Reconcile for KubernetesRootController {
    fn name(&self) -> &'static str {
        "KubernetesRootController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::weak::<CompleteMachineConfig>().with_id(id::CURRENT),
            Input::weak::<MachineTypeSpec>().with_id(id::CURRENT),
            Input::weak::<NodeAddress>().with_id(node_address::DEFAULT),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<KubernetesRoot>()]
    }

    async fn reconcile(&self, ctx: &ControllerContext) -> Result<()> {
        let control_plane = ctx
            .get_optional::<MachineTypeSpec>(id::CURRENT)?
            .is_some_and(|t| t.spec.machine_type.is_control_plane());
        let config = ctx.get_optional::<CompleteMachineConfig>(id::CURRENT)?;

        let Some(config) = config.filter(|_| control_plane) else {
            ctx.teardown_and_destroy::<KubernetesRoot>(id::CURRENT)?;
            return Ok(());
        };
        let parsed = parse_config(&config)?;
        let cluster = parsed.document.as_ref().and_then(|d| d.cluster.as_ref());

        let endpoint = match ctx
            .get_optional::<NodeAddress>(node_address::DEFAULT)?
            .as_ref()
            .and_then(|a| a.spec.first())
        {
            Some(address) if address.contains(':') => format!("https://[{address}]:6443"),
            Some(address) => format!("https://{address}:6443"),
            None => return Ok(()),
        };

        let stored = ctx.get_optional::<KubernetesRoot>(id::CURRENT)?;

        let ca = resolve_ca(
            cluster
                .and_then(|c| c.ca.as_ref())
                .filter(|ca| !ca.crt.is_empty())
                .map(|ca| (decode_pem(&ca.crt), ca.key.as_deref().map(decode_pem))),
            stored
                .as_ref()
                .filter(|r| !r.spec.ca_crt.is_empty())
                .map(|r| (r.spec.ca_crt.clone(), r.spec.ca_key.clone())),
            "kubernetes",
        )?;
        let aggregator = resolve_ca(
            cluster
                .and_then(|c| c.aggregator_ca.as_ref())
                .filter(|ca| !ca.crt.is_empty())
                .map(|ca| (decode_pem(&ca.crt), ca.key.as_deref().map(decode_pem))),
            stored
                .as_ref()
                .filter(|r| !r.spec.aggregator_ca_crt.is_empty())
                .map(|r| {
                    (
                        r.spec.aggregator_ca_crt.clone(),
                        r.spec.aggregator_ca_key.clone(),
                    )
                }),
            "front-proxy",
        )?;

        let service_account_key = stored
            .as_ref()
            .map(|r| r.spec.service_account_key.clone())
            .filter(|key| !key.is_empty())
            .unwrap_or_else(|| {
                rcgen::KeyPair::generate()
                    .map(|k| k.serialize_pem())
                    .unwrap_or_default()
            });

        let cluster_name = cluster
            .and_then(|c| c.cluster_name.as_deref())
            .unwrap_or("talos");

        // The admin cert is stable as long as the CA and endpoint are; a
        // fresh issue on every pass would churn every kubeconfig consumer.
        let admin_kubeconfig = match stored.as_ref() {
            Some(r)
                if r.spec.endpoint == endpoint
                    && r.spec.ca_crt == ca.pair.crt
                    && r.spec.admin_kubeconfig.is_some() =>
            {
                r.spec.admin_kubeconfig.clone().unwrap_or_default()
            }
            _ => {
                let admin = ca
                    .issue(&LeafRequest {
                        common_name: "admin",
                        organization: Some("system:masters"),
                        san: &[],
                        cert_use: CertUse::Client,
                        valid_for: Duration::days(365),
                    })
                    .map_err(|e| Error::controller("issuing admin client cert", e))?;
                render_kubeconfig(cluster_name, &endpoint, &ca.pair.crt, &admin)
            }
        };

        let mut cert_sans_dns = vec![
            "kubernetes".to_string(),
            "kubernetes.default".to_string(),
            "kubernetes.default.svc".to_string(),
        ];
        if let Some(machine) = parsed.document.as_ref().and_then(|d| d.machine.as_ref()) {
            cert_sans_dns.extend(
                machine
                    .cert_sans
                    .iter()
                    .filter(|san| san.parse::<std::net::IpAddr>().is_err())
                    .cloned(),
            );
        }

        ctx.apply(Resource::new(
            id::CURRENT,
            KubernetesRoot {
                ca_crt: ca.pair.crt.clone(),
                ca_key: Some(ca.pair.key.clone()),
                aggregator_ca_crt: aggregator.pair.crt.clone(),
                aggregator_ca_key: Some(aggregator.pair.key.clone()),
                service_account_key,
                endpoint,
                cert_sans_ips: ctx
                    .get_optional::<NodeAddress>(node_address::DEFAULT)?
                    .map(|a| a.spec.addresses)
                    .unwrap_or_default(),
                cert_sans_dns,
                admin_kubeconfig: Some(admin_kubeconfig).filter(|k| !k.is_empty()),
            },
        ))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kubeconfig_rendering() {
        let kubeconfig = render_kubeconfig(
            "demo",
            "https://10.5.0.2:6443",
            "-----BEGIN CERTIFICATE-----\n",
            &pki::CertifiedPair {
                crt: "crt".to_string(),
                key: "key".to_string(),
            },
        );
        assert!(kubeconfig.contains("server: https://10.5.0.2:6443"));
        assert!(kubeconfig.contains("current-context: admin@demo"));
    }
}

//! Merged SAN set for the node-management API certificate.

use async_trait::async_trait;
use talemu_resource::Resource;
use talemu_resource::config::id;
use talemu_resource::network::{HostnameStatus, NodeAddress, node_address};
use talemu_resource::secrets::{API_CERT_SANS, CertSans, OsRoot};
use talemu_runtime::{ControllerContext, Input, Output, Reconcile, Result};

pub struct ApiCertSansController;

#[async_trait]
impl Reconcile for ApiCertSansController {
    fn name(&self) -> &'static str {
        "ApiCertSansController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::weak::<OsRoot>().with_id(id::CURRENT),
            Input::weak::<NodeAddress>().with_id(node_address::DEFAULT),
            Input::weak::<HostnameStatus>().with_id(id::CURRENT),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<CertSans>()]
    }

    async fn reconcile(&self, ctx: &ControllerContext) -> Result<()> {
        let Some(root) = ctx.get_optional::<OsRoot>(id::CURRENT)? else {
            ctx.teardown_and_destroy::<CertSans>(API_CERT_SANS)?;
            return Ok(());
        };

        let mut ips = root.spec.cert_sans_ips.clone();
        if let Some(addresses) = ctx.get_optional::<NodeAddress>(node_address::DEFAULT)? {
            ips.extend(addresses.spec.addresses);
        }
        ips.sort();
        ips.dedup();

        let mut dns_names = root.spec.cert_sans_dns.clone();
        let mut fqdn = None;
        if let Some(hostname) = ctx.get_optional::<HostnameStatus>(id::CURRENT)? {
            dns_names.push(hostname.spec.hostname.clone());
            fqdn = Some(hostname.spec.fqdn());
        }
        dns_names.sort();
        dns_names.dedup();

        ctx.apply(Resource::new(
            API_CERT_SANS,
            CertSans {
                ips,
                dns_names,
                fqdn,
            },
        ))?;
        Ok(())
    }
}

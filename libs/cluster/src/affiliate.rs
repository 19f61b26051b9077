//! Publishes the machine's own discovery affiliate while discovery is
//! enabled.

use async_trait::async_trait;
use talemu_resource::cluster::{Affiliate, DiscoveryConfig, Identity, LOCAL, LOCAL_LABEL};
use talemu_resource::config::{MachineTypeSpec, id};
use talemu_resource::k8s::Nodename;
use talemu_resource::network::{HostnameStatus, NodeAddress, node_address};
use talemu_resource::runtime::VersionSpec;
use talemu_resource::{LabelQuery, Resource};
use talemu_runtime::{ControllerContext, Input, Output, Reconcile, Result};

pub struct LocalAffiliateController;

#[async_trait]
impl Reconcile for LocalAffiliateController {
    fn name(&self) -> &'static str {
        "LocalAffiliateController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::weak::<Identity>().with_id(LOCAL),
            Input::weak::<DiscoveryConfig>().with_id(id::CURRENT),
            Input::weak::<HostnameStatus>().with_id(id::CURRENT),
            Input::weak::<Nodename>().with_id(id::CURRENT),
            Input::weak::<MachineTypeSpec>().with_id(id::CURRENT),
            Input::weak::<NodeAddress>().with_id(node_address::CURRENT),
            Input::weak::<VersionSpec>().with_id(id::CURRENT),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<Affiliate>()]
    }

    async fn reconcile(&self, ctx: &ControllerContext) -> Result<()> {
        let discovery = ctx
            .get_optional::<DiscoveryConfig>(id::CURRENT)?
            .map(|d| d.spec.discovery_enabled)
            .unwrap_or(false);
        let identity = ctx.get_optional::<Identity>(LOCAL)?;

        let Some(identity) = identity.filter(|_| discovery) else {
            for affiliate in ctx.list::<Affiliate>(&LabelQuery::new())? {
                ctx.teardown_and_destroy::<Affiliate>(&affiliate.metadata.id)?;
            }
            return Ok(());
        };

        let hostname = ctx
            .get_optional::<HostnameStatus>(id::CURRENT)?
            .map(|h| h.spec.hostname)
            .unwrap_or_default();
        let nodename = ctx
            .get_optional::<Nodename>(id::CURRENT)?
            .map(|n| n.spec.nodename)
            .unwrap_or_default();
        let machine_type = ctx
            .get_optional::<MachineTypeSpec>(id::CURRENT)?
            .map(|t| t.spec.machine_type)
            .unwrap_or_default();
        let addresses = ctx
            .get_optional::<NodeAddress>(node_address::CURRENT)?
            .map(|a| a.spec.addresses)
            .unwrap_or_default();
        let operating_system = ctx
            .get_optional::<VersionSpec>(id::CURRENT)?
            .map(|v| format!("Talos ({})", v.spec.version))
            .unwrap_or_else(|| "Talos".to_string());

        let node_id = identity.spec.node_id.clone();
        let mut affiliate = Resource::new(
            node_id.clone(),
            Affiliate {
                node_id: node_id.clone(),
                hostname,
                nodename,
                machine_type,
                operating_system,
                addresses,
            },
        );
        affiliate
            .metadata
            .labels
            .insert(LOCAL_LABEL.to_string(), String::new());
        ctx.apply(affiliate)?;

        // An identity change leaves the previous affiliate behind.
        for stale in ctx.list::<Affiliate>(&LabelQuery::new())? {
            if stale.metadata.id != node_id {
                ctx.teardown_and_destroy::<Affiliate>(&stale.metadata.id)?;
            }
        }

        Ok(())
    }
}

//! Hostname derivation: configuration layer when the machine config names a
//! hostname, platform layer from platform metadata, and a default layer
//! derived from the default node address or the hashed node id.

use async_trait::async_trait;
use talemu_cluster::GlobalState;
use talemu_resource::cluster::{Identity, LOCAL};
use talemu_resource::config::{CompleteMachineConfig, PlatformMetadata, id};
use talemu_resource::network::{ConfigLayer, HostnameSpec, HostnameStatus, NodeAddress, node_address};
use talemu_resource::{LabelQuery, Resource};
use talemu_runtime::{ControllerContext, Error, Input, Output, Reconcile, Result};
use talemu_util::ids::stable_hostname;

/// Hostname derived from an address: colons collapse away except the last
/// group separator, dots become dashes.
pub fn hostname_from_address(address: &str) -> String {
    let bare = address.split_once('/').map_or(address, |(a, _)| a);
    match bare.rfind(':') {
        Some(at) => {
            let head: String = bare[..at].chars().filter(|c| *c != ':').collect();
            format!("talos-{}-{}", head, &bare[at + 1..])
        }
        None => format!("talos-{}", bare.replace('.', "-")),
    }
}

/// Publishes hostname specs per configuration layer.
pub struct HostnameConfigController;

#[async_trait]
impl Reconcile for HostnameConfigController {
    fn name(&self) -> &'static str {
        "HostnameConfigController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::weak::<CompleteMachineConfig>().with_id(id::CURRENT),
            Input::weak::<PlatformMetadata>().with_id(id::CURRENT),
            Input::weak::<NodeAddress>().with_id(node_address::DEFAULT),
            Input::weak::<Identity>().with_id(LOCAL),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<HostnameSpec>()]
    }

    async fn reconcile(&self, ctx: &ControllerContext) -> Result<()> {
        let configured = ctx
            .get_optional::<CompleteMachineConfig>(id::CURRENT)?
            .map(|c| c.spec.parse().map_err(|e| Error::controller("parsing machine config", e)))
            .transpose()?
            .and_then(|parsed| parsed.hostname().map(str::to_string));

        match configured {
            Some(hostname) => {
                ctx.apply(Resource::new(
                    ConfigLayer::Configuration.id(),
                    HostnameSpec {
                        hostname,
                        domainname: String::new(),
                        layer: ConfigLayer::Configuration,
                    },
                ))?;
            }
            None => ctx.teardown_and_destroy::<HostnameSpec>(ConfigLayer::Configuration.id())?,
        }

        let platform = ctx
            .get_optional::<PlatformMetadata>(id::CURRENT)?
            .and_then(|p| p.spec.hostname);
        match platform {
            Some(hostname) => {
                ctx.apply(Resource::new(
                    ConfigLayer::Platform.id(),
                    HostnameSpec {
                        hostname,
                        domainname: String::new(),
                        layer: ConfigLayer::Platform,
                    },
                ))?;
            }
            None => ctx.teardown_and_destroy::<HostnameSpec>(ConfigLayer::Platform.id())?,
        }

        // Default layer: prefer the default node address, fall back to a
        // stable name hashed from the node id.
        let derived = match ctx
            .get_optional::<NodeAddress>(node_address::DEFAULT)?
            .as_ref()
            .and_then(|a| a.spec.first())
        {
            Some(address) => Some(hostname_from_address(address)),
            None => ctx
                .get_optional::<Identity>(LOCAL)?
                .map(|identity| stable_hostname(&identity.spec.node_id)),
        };
        match derived {
            Some(hostname) => {
                ctx.apply(Resource::new(
                    ConfigLayer::Default.id(),
                    HostnameSpec {
                        hostname,
                        domainname: String::new(),
                        layer: ConfigLayer::Default,
                    },
                ))?;
            }
            None => ctx.teardown_and_destroy::<HostnameSpec>(ConfigLayer::Default.id())?,
        }

        Ok(())
    }
}

/// Projects the winning hostname spec into the hostname status and mirrors
/// it into the global machine status.
pub struct HostnameStatusController {
    global: GlobalState,
    machine_id: String,
}

impl HostnameStatusController {
    pub fn new(global: GlobalState, machine_id: impl Into<String>) -> Self {
        Self {
            global,
            machine_id: machine_id.into(),
        }
    }
}

#[async_trait]
impl Reconcile for HostnameStatusController {
    fn name(&self) -> &'static str {
        "HostnameStatusController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::weak::<HostnameSpec>()]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<HostnameStatus>()]
    }

    async fn reconcile(&self, ctx: &ControllerContext) -> Result<()> {
        let specs = ctx.list::<HostnameSpec>(&LabelQuery::new())?;
        let Some(winner) = specs.iter().max_by_key(|s| s.spec.layer) else {
            ctx.teardown_and_destroy::<HostnameStatus>(id::CURRENT)?;
            return Ok(());
        };

        let status = HostnameStatus {
            hostname: winner.spec.hostname.clone(),
            domainname: winner.spec.domainname.clone(),
        };
        ctx.apply(Resource::new(id::CURRENT, status.clone()))?;

        self.global
            .update_machine(&self.machine_id, |machine| {
                machine.spec.hostname = Some(status.hostname.clone());
                Ok(())
            })
            .map_err(Error::State)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hostname_from_overlay_address() {
        assert_eq!(
            hostname_from_address("fdae:41e4:649b:9303:1111:2222:3333:4444/64"),
            "talos-fdae41e4649b9303111122223333-4444"
        );
    }

    #[test]
    fn test_hostname_from_ipv4_address() {
        assert_eq!(hostname_from_address("172.20.0.2/24"), "talos-172-20-0-2");
    }
}

//! Address projection: specs into statuses, statuses into the aggregated
//! node-address views.

use std::sync::Mutex;

use async_trait::async_trait;
use talemu_resource::cluster::{Identity, LOCAL};
use talemu_resource::network::{AddressSpec, AddressStatus, NodeAddress, node_address};
use talemu_resource::{LabelQuery, Resource};
use talemu_runtime::{
    ControllerContext, Input, Output, Reconcile, Result, TransformController, Transformed,
};
use talemu_util::ids::pseudo_ipv6;

/// Mirrors every address spec into an address status. The emulator has no
/// real links to program, so a spec is "up" as soon as it exists.
pub struct AddressStatusController;

#[async_trait]
impl TransformController for AddressStatusController {
    type Input = AddressSpec;
    type Output = AddressStatus;

    fn name(&self) -> &'static str {
        "AddressStatusController"
    }

    async fn transform(&self, input: &Resource<AddressSpec>) -> Result<Transformed<AddressStatus>> {
        Ok(Transformed::Apply(AddressStatus {
            address: input.spec.address.clone(),
            link_name: input.spec.link_name.clone(),
        }))
    }
}

/// Derives the default, current and filtered node-address views, injecting
/// the machine's deterministic ULA pseudo-address once an identity exists.
pub struct NodeAddressController {
    // The pseudo-address interface identifier is random; cache it so the
    // derived views stay stable across reconciles.
    pseudo: Mutex<Option<(String, String)>>,
}

impl NodeAddressController {
    pub fn new() -> Self {
        Self {
            pseudo: Mutex::new(None),
        }
    }

    fn pseudo_for(&self, node_id: &str) -> String {
        let mut cache = self.pseudo.lock().expect("pseudo lock poisoned");
        match cache.as_ref() {
            Some((cached_id, address)) if cached_id == node_id => address.clone(),
            _ => {
                let address = pseudo_ipv6(node_id).to_string();
                *cache = Some((node_id.to_string(), address.clone()));
                address
            }
        }
    }
}

impl Default for NodeAddressController {
    fn default() -> Self {
        Self::new()
    }
}

/// Strip the prefix length from a CIDR.
fn bare_address(cidr: &str) -> &str {
    cidr.split_once('/').map_or(cidr, |(addr, _)| addr)
}

#[async_trait]
impl Reconcile for NodeAddressController {
    fn name(&self) -> &'static str {
        "NodeAddressController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::weak::<AddressStatus>(),
            Input::weak::<Identity>().with_id(LOCAL),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<NodeAddress>()]
    }

    async fn reconcile(&self, ctx: &ControllerContext) -> Result<()> {
        let statuses = ctx.list::<AddressStatus>(&LabelQuery::new())?;
        if statuses.is_empty() {
            for view in [
                node_address::DEFAULT,
                node_address::CURRENT,
                node_address::FILTERED,
            ] {
                ctx.teardown_and_destroy::<NodeAddress>(view)?;
            }
            return Ok(());
        }

        let mut addresses: Vec<String> = statuses
            .iter()
            .map(|s| bare_address(&s.spec.address).to_string())
            .collect();

        let pseudo = ctx
            .get_optional::<Identity>(LOCAL)?
            .map(|identity| self.pseudo_for(&identity.spec.node_id));
        if let Some(pseudo) = &pseudo {
            addresses.push(pseudo.clone());
        }
        addresses.dedup();

        let filtered: Vec<String> = addresses
            .iter()
            .filter(|a| Some(*a) != pseudo.as_ref())
            .cloned()
            .collect();
        let default = vec![addresses[0].clone()];

        ctx.apply(Resource::new(
            node_address::DEFAULT,
            NodeAddress { addresses: default },
        ))?;
        ctx.apply(Resource::new(
            node_address::CURRENT,
            NodeAddress { addresses },
        ))?;
        ctx.apply(Resource::new(
            node_address::FILTERED,
            NodeAddress {
                addresses: filtered,
            },
        ))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use talemu_runtime::{ControllerRuntime, RuntimeMetrics, TransformAdapter};
    use talemu_state::{Store, WriteOptions};
    use tokio_util::sync::CancellationToken;

    use super::*;

    #[tokio::test]
    async fn test_node_address_views() {
        let store = Arc::new(Store::in_memory());
        let cancel = CancellationToken::new();
        let mut runtime = ControllerRuntime::new(
            store.clone(),
            Arc::new(RuntimeMetrics::new()),
            cancel.clone(),
        );
        runtime
            .register(TransformAdapter(AddressStatusController))
            .unwrap();
        runtime.register(NodeAddressController::new()).unwrap();
        let handle = tokio::spawn(runtime.run());

        store
            .create(
                Resource::new(
                    "eth0/172.20.0.2/24",
                    AddressSpec {
                        address: "172.20.0.2/24".to_string(),
                        link_name: "eth0".to_string(),
                    },
                ),
                &WriteOptions::system(),
            )
            .unwrap();
        store
            .create(
                Resource::new(LOCAL, Identity { node_id: "node-1".to_string() }),
                &WriteOptions::system(),
            )
            .unwrap();

        let current = tokio::time::timeout(
            Duration::from_secs(5),
            store.watch_for::<NodeAddress>(node_address::CURRENT, |a| a.spec.addresses.len() == 2),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(current.spec.addresses[0], "172.20.0.2");
        assert!(current.spec.addresses[1].starts_with("dd"));

        let default = store.get::<NodeAddress>(node_address::DEFAULT).unwrap();
        assert_eq!(default.spec.addresses, vec!["172.20.0.2".to_string()]);

        let filtered = store.get::<NodeAddress>(node_address::FILTERED).unwrap();
        assert_eq!(filtered.spec.addresses, vec!["172.20.0.2".to_string()]);

        cancel.cancel();
        handle.await.unwrap();
    }
}

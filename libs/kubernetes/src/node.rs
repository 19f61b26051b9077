//! Registers the emulated machine as a Kubernetes node object. Capacity is
//! synthesized from the machine's hardware inventory; deletion on teardown is
//! best-effort with a short timeout.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, NodeAddress as K8sNodeAddress, NodeStatus, NodeSystemInfo};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use talemu_cluster::GlobalState;
use talemu_resource::cluster::{Identity, LOCAL};
use talemu_resource::config::{CompleteMachineConfig, id};
use talemu_resource::k8s::Nodename;
use talemu_resource::network::{NodeAddress, node_address};
use talemu_resource::runtime::{MemoryModule, Processor, VersionSpec};
use talemu_resource::{LabelQuery, Phase, Resource};
use talemu_runtime::{ControllerContext, Error, Input, Output, Reconcile, Result};
use tracing::{debug, warn};

const FIELD_MANAGER: &str = "talemu";
const RETRY_INTERVAL: Duration = Duration::from_secs(30);
const DELETE_TIMEOUT: Duration = Duration::from_secs(1);

const EPHEMERAL_STORAGE: &str = "5368709120";
const MAX_PODS: &str = "110";

pub struct KubernetesNodeController {
    global: GlobalState,
}

impl KubernetesNodeController {
    pub fn new(global: GlobalState) -> Self {
        Self { global }
    }

    fn capacity(ctx: &ControllerContext) -> Result<BTreeMap<String, Quantity>> {
        let memory_mib: u64 = ctx
            .list::<MemoryModule>(&LabelQuery::new())?
            .iter()
            .map(|m| m.spec.size_mib)
            .sum();
        let cores: u32 = ctx
            .list::<Processor>(&LabelQuery::new())?
            .iter()
            .map(|p| p.spec.core_count)
            .sum();

        Ok(BTreeMap::from([
            ("cpu".to_string(), Quantity(cores.to_string())),
            ("memory".to_string(), Quantity(format!("{memory_mib}Mi"))),
            (
                "ephemeral-storage".to_string(),
                Quantity(EPHEMERAL_STORAGE.to_string()),
            ),
            ("pods".to_string(), Quantity(MAX_PODS.to_string())),
        ]))
    }

    fn node_object(
        &self,
        ctx: &ControllerContext,
        nodename: &str,
        node_id: &str,
    ) -> Result<Node> {
        let version = ctx
            .get_optional::<VersionSpec>(id::CURRENT)?
            .map(|v| v.spec.version)
            .unwrap_or_else(|| "v0.0.0".to_string());
        let addresses = ctx
            .get_optional::<NodeAddress>(node_address::CURRENT)?
            .map(|a| a.spec.addresses)
            .unwrap_or_default();

        let kubelet_version = "v1.32.0";

        Ok(Node {
            metadata: ObjectMeta {
                name: Some(nodename.to_string()),
                labels: Some(BTreeMap::from([(
                    super::staticpod::NODE_LABEL.to_string(),
                    node_id.to_string(),
                )])),
                ..Default::default()
            },
            spec: None,
            status: Some(NodeStatus {
                addresses: Some(
                    addresses
                        .into_iter()
                        .map(|address| K8sNodeAddress {
                            address,
                            type_: "InternalIP".to_string(),
                        })
                        .collect(),
                ),
                capacity: Some(Self::capacity(ctx)?),
                node_info: Some(NodeSystemInfo {
                    architecture: std::env::consts::ARCH.to_string(),
                    container_runtime_version: "containerd://2.0.0".to_string(),
                    kernel_version: "6.6.0-talos".to_string(),
                    kube_proxy_version: kubelet_version.to_string(),
                    kubelet_version: kubelet_version.to_string(),
                    operating_system: "linux".to_string(),
                    os_image: format!("Talos ({version})"),
                    ..Default::default()
                }),
                ..Default::default()
            }),
        })
    }

    async fn client_for(&self, cluster_id: &str) -> Result<Option<kube::Client>> {
        let Some(kubeconfig) = self
            .global
            .cluster(cluster_id)?
            .and_then(|c| c.spec.kubeconfig)
        else {
            return Ok(None);
        };
        match crate::client::from_kubeconfig(&kubeconfig).await {
            Ok(client) => Ok(Some(client)),
            Err(e) => {
                debug!(msg = "kube client unavailable", %e);
                Ok(None)
            }
        }
    }

    /// Best-effort node deletion with a one second timeout; failures are
    /// logged and swallowed.
    async fn delete_node(&self, cluster_id: &str, nodename: &str) {
        let client = match self.client_for(cluster_id).await {
            Ok(Some(client)) => client,
            _ => return,
        };
        let nodes: Api<Node> = Api::all(client);

        match tokio::time::timeout(
            DELETE_TIMEOUT,
            nodes.delete(nodename, &DeleteParams::default()),
        )
        .await
        {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(msg = "node delete failed", node = nodename, %e),
            Err(_) => warn!(msg = "node delete timed out", node = nodename),
        }
    }
}

#[async_trait]
impl Reconcile for KubernetesNodeController {
    fn name(&self) -> &'static str {
        "KubernetesNodeController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::strong::<CompleteMachineConfig>().with_id(id::CURRENT),
            Input::weak::<Nodename>().with_id(id::CURRENT),
            Input::weak::<Identity>().with_id(LOCAL),
            Input::weak::<NodeAddress>().with_id(node_address::CURRENT),
            Input::weak::<VersionSpec>().with_id(id::CURRENT),
            Input::weak::<MemoryModule>(),
            Input::weak::<Processor>(),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        Vec::new()
    }

    async fn reconcile(&self, ctx: &ControllerContext) -> Result<()> {
        let config = ctx.get_optional::<CompleteMachineConfig>(id::CURRENT)?;
        let nodename = ctx.get_optional::<Nodename>(id::CURRENT)?;

        let cluster_id = config
            .as_ref()
            .and_then(|c| c.spec.parse().ok())
            .and_then(|p| p.cluster_id().map(str::to_string));

        let tearing_down = config
            .as_ref()
            .is_some_and(|c| c.metadata.phase == Phase::TearingDown);
        if tearing_down || config.is_none() {
            if let (Some(cluster_id), Some(nodename)) = (&cluster_id, &nodename) {
                self.delete_node(cluster_id, &nodename.spec.nodename).await;
            }
            if config.is_some() {
                ctx.remove_finalizer::<CompleteMachineConfig>(id::CURRENT)?;
            }
            return Ok(());
        }

        let (Some(cluster_id), Some(nodename), Some(identity)) = (
            cluster_id,
            nodename,
            ctx.get_optional::<Identity>(LOCAL)?,
        ) else {
            return Ok(());
        };

        let Some(client) = self.client_for(&cluster_id).await? else {
            ctx.requeue_after(RETRY_INTERVAL);
            return Ok(());
        };

        let node = self.node_object(ctx, &nodename.spec.nodename, &identity.spec.node_id)?;
        let nodes: Api<Node> = Api::all(client);
        if let Err(e) = nodes
            .patch(
                &nodename.spec.nodename,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&node),
            )
            .await
        {
            warn!(msg = "node apply failed", node = %nodename.spec.nodename, %e);
            ctx.requeue_after(RETRY_INTERVAL);
        }

        Ok(())
    }
}

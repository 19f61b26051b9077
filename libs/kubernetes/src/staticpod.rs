//! Static pod simulation: when the control plane is ready, the three
//! control-plane pods are applied to the cluster's Kubernetes through the
//! admin kubeconfig, labeled with the machine id and the nodename version so
//! stale generations can be swept.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use talemu_cluster::GlobalState;
use talemu_resource::cluster::{Identity, LOCAL};
use talemu_resource::config::{CompleteMachineConfig, id};
use talemu_resource::k8s::{self, Nodename, SecretsStatus, StaticPod};
use talemu_resource::runtime::{Service, service};
use talemu_resource::network::{NodeAddress, node_address};
use talemu_resource::{LabelQuery, Resource};
use talemu_runtime::{ControllerContext, Error, Input, Output, Reconcile, Result};
use tracing::{debug, warn};

/// Label carrying the emulated machine id on applied pods.
pub const NODE_LABEL: &str = "talemu.dev/node-id";
/// Label carrying the nodename generation a pod was applied for.
pub const NODENAME_VERSION_LABEL: &str = "talemu.dev/nodename-version";

const FIELD_MANAGER: &str = "talemu";
const RETRY_INTERVAL: Duration = Duration::from_secs(30);

pub struct StaticPodController {
    global: GlobalState,
}

impl StaticPodController {
    pub fn new(global: GlobalState) -> Self {
        Self { global }
    }

    fn pod_manifest(
        name: &str,
        image_suffix: &str,
        node_id: &str,
        nodename: &Resource<Nodename>,
    ) -> serde_json::Value {
        serde_json::json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": format!("{name}-{}", nodename.spec.nodename),
                "namespace": "kube-system",
                "labels": {
                    "k8s-app": name,
                    "tier": "control-plane",
                    NODE_LABEL: node_id,
                    NODENAME_VERSION_LABEL:
                        format!("{}-{}", nodename.spec.nodename, nodename.metadata.version),
                },
            },
            "spec": {
                "nodeName": nodename.spec.nodename,
                "hostNetwork": true,
                "containers": [{
                    "name": name,
                    "image": format!("registry.k8s.io/{image_suffix}"),
                }],
            },
        })
    }

    async fn apply_to_cluster(
        &self,
        ctx: &ControllerContext,
        cluster_id: &str,
        node_id: &str,
        nodename: &Resource<Nodename>,
    ) -> Result<()> {
        let Some(kubeconfig) = self
            .global
            .cluster(cluster_id)?
            .and_then(|c| c.spec.kubeconfig)
        else {
            debug!(msg = "no admin kubeconfig yet, delaying static pod apply");
            ctx.requeue_after(RETRY_INTERVAL);
            return Ok(());
        };

        let client = match crate::client::from_kubeconfig(&kubeconfig).await {
            Ok(client) => client,
            Err(e) => {
                warn!(msg = "kube client unavailable", %e);
                ctx.requeue_after(RETRY_INTERVAL);
                return Ok(());
            }
        };
        let pods: Api<Pod> = Api::namespaced(client, "kube-system");

        for static_pod in ctx.list::<StaticPod>(&LabelQuery::new())? {
            let pod: Pod = serde_json::from_value(static_pod.spec.pod.clone())
                .map_err(|e| Error::controller("decoding static pod manifest", e))?;
            let name = pod.metadata.name.clone().unwrap_or_default();

            if let Err(e) = pods
                .patch(
                    &name,
                    &PatchParams::apply(FIELD_MANAGER).force(),
                    &Patch::Apply(&pod),
                )
                .await
            {
                warn!(msg = "static pod apply failed", pod = %name, %e);
                ctx.requeue_after(RETRY_INTERVAL);
                return Ok(());
            }
        }

        // Sweep pods applied for an older nodename generation.
        let current = format!("{}-{}", nodename.spec.nodename, nodename.metadata.version);
        let labeled = pods
            .list(&ListParams::default().labels(&format!("{NODE_LABEL}={node_id}")))
            .await;
        match labeled {
            Ok(list) => {
                for pod in list {
                    let stale = pod
                        .metadata
                        .labels
                        .as_ref()
                        .and_then(|l| l.get(NODENAME_VERSION_LABEL))
                        .is_some_and(|v| *v != current);
                    if stale {
                        let name = pod.metadata.name.clone().unwrap_or_default();
                        if let Err(e) = pods.delete(&name, &DeleteParams::default()).await {
                            warn!(msg = "stale static pod delete failed", pod = %name, %e);
                        }
                    }
                }
            }
            Err(e) => {
                warn!(msg = "static pod list failed", %e);
                ctx.requeue_after(RETRY_INTERVAL);
            }
        }

        Ok(())
    }
}

#[async_trait]
impl Reconcile for StaticPodController {
    fn name(&self) -> &'static str {
        "StaticPodController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::weak::<Service>().with_id(service::KUBELET),
            Input::weak::<SecretsStatus>().with_id(id::CURRENT),
            Input::weak::<Nodename>().with_id(id::CURRENT),
            Input::weak::<NodeAddress>().with_id(node_address::CURRENT),
            Input::weak::<CompleteMachineConfig>().with_id(id::CURRENT),
            Input::weak::<Identity>().with_id(LOCAL),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<StaticPod>()]
    }

    async fn reconcile(&self, ctx: &ControllerContext) -> Result<()> {
        let kubelet_healthy = ctx
            .get_optional::<Service>(service::KUBELET)?
            .is_some_and(|s| s.spec.healthy);
        let secrets_ready = ctx
            .get_optional::<SecretsStatus>(id::CURRENT)?
            .is_some_and(|s| s.spec.ready);
        let nodename = ctx.get_optional::<Nodename>(id::CURRENT)?;
        let addresses = ctx.get_optional::<NodeAddress>(node_address::CURRENT)?;
        let config = ctx.get_optional::<CompleteMachineConfig>(id::CURRENT)?;
        let identity = ctx.get_optional::<Identity>(LOCAL)?;

        let ready = kubelet_healthy && secrets_ready && addresses.is_some();
        let (Some(nodename), Some(config), Some(identity)) =
            (nodename, config, identity)
        else {
            for pod in ctx.list::<StaticPod>(&LabelQuery::new())? {
                ctx.teardown_and_destroy::<StaticPod>(&pod.metadata.id)?;
            }
            return Ok(());
        };
        if !ready {
            return Ok(());
        }

        let node_id = identity.spec.node_id.clone();
        let pods = [
            (k8s::APISERVER, "kube-apiserver:v1.32.0"),
            (k8s::CONTROLLER_MANAGER, "kube-controller-manager:v1.32.0"),
            (k8s::SCHEDULER, "kube-scheduler:v1.32.0"),
        ];
        for (name, image) in pods {
            ctx.apply(Resource::new(
                name,
                StaticPod {
                    pod: Self::pod_manifest(name, image, &node_id, &nodename),
                },
            ))?;
        }

        let cluster_id = config
            .spec
            .parse()
            .map_err(|e| Error::controller("parsing machine config", e))?
            .cluster_id()
            .map(str::to_string);
        if let Some(cluster_id) = cluster_id {
            self.apply_to_cluster(ctx, &cluster_id, &node_id, &nodename)
                .await?;
        }

        Ok(())
    }
}

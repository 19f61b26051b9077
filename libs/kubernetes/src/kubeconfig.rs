//! Copies the admin kubeconfig from the Kubernetes root secrets into the
//! cluster's global record, where the node-management RPCs and the static pod
//! simulation pick it up.

use async_trait::async_trait;
use talemu_cluster::GlobalState;
use talemu_resource::config::{CompleteMachineConfig, id};
use talemu_resource::secrets::KubernetesRoot;
use talemu_runtime::{ControllerContext, Error, Input, Output, Reconcile, Result};
use tracing::debug;

pub struct KubeconfigController {
    global: GlobalState,
}

impl KubeconfigController {
    pub fn new(global: GlobalState) -> Self {
        Self { global }
    }
}

#[async_trait]
impl Reconcile for KubeconfigController {
    fn name(&self) -> &'static str {
        "KubeconfigController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::weak::<KubernetesRoot>().with_id(id::CURRENT),
            Input::weak::<CompleteMachineConfig>().with_id(id::CURRENT),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        Vec::new()
    }

    async fn reconcile(&self, ctx: &ControllerContext) -> Result<()> {
        let Some(root) = ctx.get_optional::<KubernetesRoot>(id::CURRENT)? else {
            return Ok(());
        };
        let Some(kubeconfig) = root.spec.admin_kubeconfig.as_deref() else {
            return Ok(());
        };
        let Some(config) = ctx.get_optional::<CompleteMachineConfig>(id::CURRENT)? else {
            return Ok(());
        };
        let Some(cluster_id) = config
            .spec
            .parse()
            .map_err(|e| Error::controller("parsing machine config", e))?
            .cluster_id()
            .map(str::to_string)
        else {
            return Ok(());
        };

        let already = self
            .global
            .cluster(&cluster_id)?
            .and_then(|c| c.spec.kubeconfig)
            .is_some_and(|existing| existing == kubeconfig);
        if already {
            return Ok(());
        }

        debug!(msg = "publishing admin kubeconfig", cluster = %cluster_id);
        self.global.set_kubeconfig(&cluster_id, kubeconfig)?;
        Ok(())
    }
}

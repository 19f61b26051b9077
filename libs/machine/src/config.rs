//! Projects the applied machine configuration into its derived views: the
//! complete-configuration marker, the machine type, discovery and join
//! endpoint settings.

use async_trait::async_trait;
use talemu_resource::cluster::DiscoveryConfig;
use talemu_resource::config::{
    CompleteMachineConfig, JoinEndpoints, MachineConfig, MachineTypeSpec, id,
};
use talemu_resource::Resource;
use talemu_runtime::{ControllerContext, Error, Input, Output, Reconcile, Result};
use url::Url;

pub struct MachineConfigController;

#[async_trait]
impl Reconcile for MachineConfigController {
    fn name(&self) -> &'static str {
        "MachineConfigController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::strong::<MachineConfig>().with_id(id::ACTIVE)]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![
            Output::exclusive::<CompleteMachineConfig>(),
            Output::exclusive::<MachineTypeSpec>(),
            Output::exclusive::<DiscoveryConfig>(),
            Output::exclusive::<JoinEndpoints>(),
        ]
    }

    async fn reconcile(&self, ctx: &ControllerContext) -> Result<()> {
        let config = ctx.get_optional::<MachineConfig>(id::ACTIVE)?;

        let active = match &config {
            Some(c) if c.metadata.phase == talemu_resource::Phase::Running => Some(c),
            _ => None,
        };

        let Some(active) = active else {
            // Tear everything down; the complete config blocks on downstream
            // finalizers, so the active config's own finalizer is released
            // only once the whole chain unwound.
            ctx.teardown_and_destroy::<CompleteMachineConfig>(id::CURRENT)?;
            ctx.teardown_and_destroy::<MachineTypeSpec>(id::CURRENT)?;
            ctx.teardown_and_destroy::<DiscoveryConfig>(id::CURRENT)?;
            ctx.teardown_and_destroy::<JoinEndpoints>(id::CURRENT)?;

            if config.is_some()
                && ctx.get_optional::<CompleteMachineConfig>(id::CURRENT)?.is_none()
                && ctx.get_optional::<MachineTypeSpec>(id::CURRENT)?.is_none()
            {
                ctx.remove_finalizer::<MachineConfig>(id::ACTIVE)?;
            }
            return Ok(());
        };

        let parsed = active
            .spec
            .parse()
            .map_err(|e| Error::controller("parsing machine config", e))?;

        if !parsed.is_complete() {
            ctx.teardown_and_destroy::<CompleteMachineConfig>(id::CURRENT)?;
            return Ok(());
        }

        let mut complete = Resource::new(
            id::CURRENT,
            CompleteMachineConfig {
                raw: active.spec.raw.clone(),
            },
        );
        complete.metadata.labels = active.metadata.labels.clone();
        ctx.apply(complete)?;

        ctx.apply(Resource::new(
            id::CURRENT,
            MachineTypeSpec {
                machine_type: parsed.machine_type(),
            },
        ))?;

        ctx.apply(Resource::new(
            id::CURRENT,
            DiscoveryConfig {
                discovery_enabled: parsed.discovery_enabled(),
                service_endpoint: None,
            },
        ))?;

        // Workers send CSRs to the cluster's control-plane endpoint.
        let join_endpoints: Vec<String> = parsed
            .document
            .as_ref()
            .and_then(|d| d.cluster.as_ref())
            .and_then(|c| c.control_plane.as_ref())
            .and_then(|cp| cp.endpoint.as_deref())
            .and_then(|e| Url::parse(e).ok())
            .and_then(|u| u.host_str().map(|h| (h.to_string(), u.port().unwrap_or(50001))))
            .map(|(host, port)| vec![format!("{host}:{port}")])
            .unwrap_or_default();
        ctx.apply(Resource::new(
            id::CURRENT,
            JoinEndpoints {
                endpoints: join_endpoints,
            },
        ))?;

        Ok(())
    }
}

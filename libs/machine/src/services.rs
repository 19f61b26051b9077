//! Service lifecycle simulation for the managed components. Service records
//! appear and flip health as the machine moves through its lifecycle:
//! configuration brings up kubelet (and etcd on control planes), cluster
//! bootstrap makes etcd healthy.

use std::sync::Arc;

use async_trait::async_trait;
use talemu_resource::cluster::ClusterStatus;
use talemu_resource::config::{CompleteMachineConfig, MachineTypeSpec, id};
use talemu_resource::runtime::{Service, service};
use talemu_resource::{Resource, ResourceSpec};
use talemu_runtime::{Controller, ControllerContext, Input, Output, Result};
use talemu_state::WatchOptions;
use talemu_cluster::GlobalState;

pub struct ServiceController {
    global: GlobalState,
}

impl ServiceController {
    pub fn new(global: GlobalState) -> Self {
        Self { global }
    }

    fn reconcile(&self, ctx: &ControllerContext) -> Result<()> {
        let config = ctx.get_optional::<CompleteMachineConfig>(id::CURRENT)?;
        let configured = config.is_some();

        ctx.apply(Resource::new(
            service::APID,
            Service {
                running: true,
                healthy: configured,
            },
        ))?;

        if !configured {
            ctx.teardown_and_destroy::<Service>(service::KUBELET)?;
            ctx.teardown_and_destroy::<Service>(service::ETCD)?;
            return Ok(());
        }

        ctx.apply(Resource::new(
            service::KUBELET,
            Service {
                running: true,
                healthy: true,
            },
        ))?;

        let control_plane = ctx
            .get_optional::<MachineTypeSpec>(id::CURRENT)?
            .is_some_and(|t| t.spec.machine_type.is_control_plane());
        if control_plane {
            let bootstrapped = config
                .as_ref()
                .and_then(|c| c.spec.parse().ok())
                .and_then(|p| p.cluster_id().map(str::to_string))
                .and_then(|cluster_id| self.global.cluster(&cluster_id).ok().flatten())
                .is_some_and(|c| c.spec.bootstrapped);

            ctx.apply(Resource::new(
                service::ETCD,
                Service {
                    running: true,
                    healthy: bootstrapped,
                },
            ))?;
        } else {
            ctx.teardown_and_destroy::<Service>(service::ETCD)?;
        }

        Ok(())
    }
}

#[async_trait]
impl Controller for ServiceController {
    fn name(&self) -> &'static str {
        "ServiceController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::weak::<CompleteMachineConfig>().with_id(id::CURRENT),
            Input::weak::<MachineTypeSpec>().with_id(id::CURRENT),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<Service>()]
    }

    async fn run(&self, ctx: Arc<ControllerContext>) -> Result<()> {
        // Bootstrap state lives in the global cluster record; watch it in
        // addition to the runtime-pumped inputs.
        let mut cluster_events = self.global.store().watch_kind(
            ClusterStatus::NAMESPACE,
            ClusterStatus::KIND,
            WatchOptions::default(),
        );

        loop {
            match self.reconcile(&ctx) {
                Ok(()) => ctx.reset_restart_backoff(),
                Err(e) if e.is_wait() => {}
                Err(e) => return Err(e),
            }

            tokio::select! {
                woke = ctx.next_wake() => {
                    if !woke {
                        return Ok(());
                    }
                }
                event = cluster_events.recv() => {
                    if event.is_none() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

//! Emulated etcd membership: a random 64-bit member id generated once per
//! control plane, mirrored into the global machine status, honoring the
//! cluster's deny list.

use std::sync::Arc;

use async_trait::async_trait;
use talemu_resource::cluster::{ClusterStatus, EtcdMember, Identity, LOCAL};
use talemu_resource::config::{CompleteMachineConfig, MachineTypeSpec, id};
use talemu_resource::{Phase, Resource, ResourceSpec};
use talemu_state::WatchOptions;
use talemu_runtime::{Controller, ControllerContext, Input, Output, Result};
use talemu_util::ids::generate_member_id;
use tracing::info;

use crate::global::GlobalState;

pub struct EtcdMemberController {
    global: GlobalState,
    machine_id: String,
}

impl EtcdMemberController {
    pub fn new(global: GlobalState, machine_id: impl Into<String>) -> Self {
        Self {
            global,
            machine_id: machine_id.into(),
        }
    }

    fn reconcile(&self, ctx: &ControllerContext) -> Result<()> {
        let config = ctx.get_optional::<CompleteMachineConfig>(id::CURRENT)?;

        let teardown = match &config {
            None => true,
            Some(c) => c.metadata.phase == Phase::TearingDown,
        };
        if teardown {
            self.global.update_machine(&self.machine_id, |machine| {
                machine.spec.etcd_member_id = None;
                Ok(())
            })?;
            ctx.teardown_and_destroy::<EtcdMember>(LOCAL)?;
            if config.is_some() && ctx.get_optional::<EtcdMember>(LOCAL)?.is_none() {
                ctx.remove_finalizer::<CompleteMachineConfig>(id::CURRENT)?;
            }
            return Ok(());
        }

        let control_plane = ctx
            .get_optional::<MachineTypeSpec>(id::CURRENT)?
            .is_some_and(|t| t.spec.machine_type.is_control_plane());
        if !control_plane {
            ctx.teardown_and_destroy::<EtcdMember>(LOCAL)?;
            return Ok(());
        }

        if ctx.get_optional::<Identity>(LOCAL)?.is_none() {
            return Ok(());
        }

        // Idempotent id generation: once assigned, the id sticks.
        let member = match ctx.get_optional::<EtcdMember>(LOCAL)? {
            Some(member) => member,
            None => {
                let member_id = generate_member_id();
                info!(msg = "assigned etcd member id", %member_id);
                ctx.create(Resource::new(LOCAL, EtcdMember { member_id }))?
            }
        };

        let cluster_id = config
            .as_ref()
            .and_then(|c| c.spec.parse().ok())
            .and_then(|p| p.cluster_id().map(str::to_string));

        let denied = match &cluster_id {
            Some(cluster_id) => self
                .global
                .cluster(cluster_id)?
                .is_some_and(|c| {
                    c.spec
                        .deny_etcd_members
                        .iter()
                        .any(|m| *m == member.spec.member_id)
                }),
            None => false,
        };

        // Denied members disappear from the aggregated member list but the
        // local record stays so the id is not regenerated.
        let published = (!denied).then(|| member.spec.member_id.clone());
        self.global.update_machine(&self.machine_id, |machine| {
            machine.spec.etcd_member_id = published.clone();
            Ok(())
        })?;

        Ok(())
    }
}

#[async_trait]
impl Controller for EtcdMemberController {
    fn name(&self) -> &'static str {
        "EtcdMemberController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::strong::<CompleteMachineConfig>().with_id(id::CURRENT),
            Input::weak::<MachineTypeSpec>().with_id(id::CURRENT),
            Input::weak::<Identity>().with_id(LOCAL),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<EtcdMember>()]
    }

    async fn run(&self, ctx: Arc<ControllerContext>) -> Result<()> {
        // Cluster statuses live in the global state, outside the machine
        // store the runtime pumps for us; watch them directly.
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

//! Overall machine status: lifecycle stage, readiness with unmet conditions,
//! and system disk selection.

use async_trait::async_trait;
use talemu_resource::config::{CompleteMachineConfig, id};
use talemu_resource::document::DiskSelector;
use talemu_resource::runtime::{
    Disk, ImageSpec, MachineStage, MachineStatus, RebootStatus, Service, service,
};
use talemu_resource::{LabelQuery, Resource};
use talemu_runtime::{ControllerContext, Input, Output, Reconcile, Result};

pub struct MachineStatusController;

fn disk_matches(disk: &Resource<Disk>, selector: &DiskSelector) -> bool {
    if let Some(model) = &selector.model {
        if !disk.spec.model.contains(model.trim_end_matches('*')) {
            return false;
        }
    }
    true
}

#[async_trait]
impl Reconcile for MachineStatusController {
    fn name(&self) -> &'static str {
        "MachineStatusController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::weak::<CompleteMachineConfig>().with_id(id::CURRENT),
            Input::weak::<Service>(),
            Input::weak::<RebootStatus>().with_id(id::CURRENT),
            Input::weak::<ImageSpec>().with_id(id::CURRENT),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![
            Output::exclusive::<MachineStatus>(),
            Output::shared::<Disk>(),
        ]
    }

    async fn reconcile(&self, ctx: &ControllerContext) -> Result<()> {
        let config = ctx.get_optional::<CompleteMachineConfig>(id::CURRENT)?;
        let rebooting = ctx.get_optional::<RebootStatus>(id::CURRENT)?.is_some();
        let staged = ctx
            .get_optional::<ImageSpec>(id::CURRENT)?
            .is_some_and(|i| i.spec.staged);
        let services = ctx.list::<Service>(&LabelQuery::new())?;

        let parsed = config.as_ref().and_then(|c| c.spec.parse().ok());
        let control_plane = parsed
            .as_ref()
            .map(|p| p.machine_type().is_control_plane())
            .unwrap_or(false);

        // Pick and mark the system disk from the install stanza.
        if let Some(install) = parsed.as_ref().and_then(|p| p.install()) {
            let disks = ctx.list::<Disk>(&LabelQuery::new())?;
            let picked: Option<String> = install
                .disk
                .as_ref()
                .and_then(|wanted| {
                    disks
                        .iter()
                        .find(|d| d.spec.dev_path == *wanted)
                        .map(|d| d.metadata.id.clone())
                })
                .or_else(|| {
                    install.disk_selector.as_ref().and_then(|selector| {
                        disks
                            .iter()
                            .find(|d| disk_matches(d, selector))
                            .map(|d| d.metadata.id.clone())
                    })
                })
                .or_else(|| disks.first().map(|d| d.metadata.id.clone()));

            for disk in &disks {
                let system = Some(&disk.metadata.id) == picked.as_ref();
                if disk.spec.system_disk != system {
                    ctx.modify::<Disk>(&disk.metadata.id, |d| {
                        d.spec.system_disk = system;
                        Ok(())
                    })?;
                }
            }
        }

        let mut unmet: Vec<String> = Vec::new();

        let stage = if rebooting {
            MachineStage::Rebooting
        } else if config.is_none() {
            unmet.push("machine configuration missing".to_string());
            MachineStage::Maintenance
        } else if staged {
            unmet.push("installation in progress".to_string());
            MachineStage::Installing
        } else {
            let mut expected = vec![service::APID, service::KUBELET];
            if control_plane {
                expected.push(service::ETCD);
            }

            let mut booting = false;
            for id in &expected {
                match services.iter().find(|s| s.metadata.id == *id) {
                    Some(s) if s.spec.running => {
                        if !s.spec.healthy {
                            unmet.push(format!("service {id} not healthy"));
                        }
                    }
                    _ => {
                        booting = true;
                        unmet.push(format!("service {id} not running"));
                    }
                }
            }
            if booting {
                MachineStage::Booting
            } else {
                MachineStage::Running
            }
        };

        let ready = stage == MachineStage::Running && unmet.is_empty();
        ctx.apply(Resource::new(
            id::CURRENT,
            MachineStatus {
                stage,
                ready,
                unmet_conditions: unmet,
            },
        ))?;

        Ok(())
    }
}

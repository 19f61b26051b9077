//! Version, schematic, extension and kernel command line derivation from the
//! installer image.

use async_trait::async_trait;
use talemu_resource::config::{CompleteMachineConfig, KernelCmdline, id};
use talemu_resource::runtime::{ExtensionStatus, ImageSpec, VersionSpec};
use talemu_resource::{LabelQuery, Resource};
use talemu_runtime::{ControllerContext, Input, Output, Reconcile, Result};
use talemu_util::image::{FactoryReference, split_tag};

/// Kernel arguments every emulated machine boots with.
pub const BASE_KERNEL_ARGS: &str =
    "talos.platform=metal console=ttyS0 init_on_alloc=1 slab_nomerge pti=on";

/// Resolves the running version and schematic from the staged image when an
/// upgrade is pending, otherwise from the configured install image.
pub struct VersionController;

#[async_trait]
impl Reconcile for VersionController {
    fn name(&self) -> &'static str {
        "VersionController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::weak::<ImageSpec>().with_id(id::CURRENT),
            Input::weak::<CompleteMachineConfig>().with_id(id::CURRENT),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<VersionSpec>()]
    }

    async fn reconcile(&self, ctx: &ControllerContext) -> Result<()> {
        let image = ctx.get_optional::<ImageSpec>(id::CURRENT)?;

        let configured = ctx
            .get_optional::<CompleteMachineConfig>(id::CURRENT)?
            .and_then(|c| c.spec.parse().ok())
            .and_then(|p| p.install().and_then(|i| i.image.clone()));

        // The image resource tracks upgrades (staged or applied); the
        // configured install image only seeds the very first resolution.
        let reference = image
            .as_ref()
            .map(|i| i.spec.reference.clone())
            .or(configured);

        let Some(reference) = reference else {
            ctx.apply(Resource::new(
                id::CURRENT,
                VersionSpec {
                    version: VersionSpec::FALLBACK.to_string(),
                    schematic: None,
                },
            ))?;
            return Ok(());
        };

        let spec = match FactoryReference::parse(&reference) {
            Ok(factory) => VersionSpec {
                version: factory.version,
                schematic: Some(factory.schematic),
            },
            // Non-factory installers still carry the version in the tag.
            Err(_) => VersionSpec {
                version: split_tag(&reference)
                    .map(|(_, tag)| tag.to_string())
                    .unwrap_or_else(|_| VersionSpec::FALLBACK.to_string()),
                schematic: None,
            },
        };

        ctx.apply(Resource::new(id::CURRENT, spec))?;
        Ok(())
    }
}

/// Publishes an extension status per schematic customization. The emulator
/// models the schematic itself as a single extension record.
pub struct ExtensionStatusController;

#[async_trait]
impl Reconcile for ExtensionStatusController {
    fn name(&self) -> &'static str {
        "ExtensionStatusController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::weak::<VersionSpec>().with_id(id::CURRENT)]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<ExtensionStatus>()]
    }

    async fn reconcile(&self, ctx: &ControllerContext) -> Result<()> {
        let schematic = ctx
            .get_optional::<VersionSpec>(id::CURRENT)?
            .and_then(|v| v.spec.schematic);

        match schematic {
            Some(schematic) => {
                ctx.apply(Resource::new(
                    "schematic",
                    ExtensionStatus {
                        name: "schematic".to_string(),
                        version: schematic,
                    },
                ))?;
            }
            None => {
                for extension in ctx.list::<ExtensionStatus>(&LabelQuery::new())? {
                    ctx.teardown_and_destroy::<ExtensionStatus>(&extension.metadata.id)?;
                }
            }
        }
        Ok(())
    }
}

/// Derived kernel command line: base arguments, schematic extras, and the
/// emulator marker.
pub struct KernelCmdlineController;

#[async_trait]
impl Reconcile for KernelCmdlineController {
    fn name(&self) -> &'static str {
        "KernelCmdlineController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::weak::<VersionSpec>().with_id(id::CURRENT)]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<KernelCmdline>()]
    }

    async fn reconcile(&self, ctx: &ControllerContext) -> Result<()> {
        let schematic = ctx
            .get_optional::<VersionSpec>(id::CURRENT)?
            .and_then(|v| v.spec.schematic);

        let mut cmdline = BASE_KERNEL_ARGS.to_string();
        if let Some(schematic) = schematic {
            cmdline.push_str(&format!(" talos.schematic={schematic}"));
        }
        cmdline.push_str(" talemu=1");

        ctx.apply(Resource::new(id::CURRENT, KernelCmdline { cmdline }))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_args_end_with_marker() {
        let mut cmdline = BASE_KERNEL_ARGS.to_string();
        cmdline.push_str(" talemu=1");
        assert!(cmdline.ends_with("talemu=1"));
        assert!(cmdline.starts_with("talos.platform=metal"));
    }
}

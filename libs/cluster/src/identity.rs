//! Node identity lifecycle: a random base62 id exists while a complete
//! machine configuration does.

use async_trait::async_trait;
use talemu_resource::cluster::{Identity, LOCAL};
use talemu_resource::config::{CompleteMachineConfig, id};
use talemu_resource::Resource;
use talemu_runtime::{ControllerContext, Input, Output, Reconcile, Result};
use talemu_util::ids::generate_node_id;
use tracing::info;

pub struct NodeIdentityController;

#[async_trait]
impl Reconcile for NodeIdentityController {
    fn name(&self) -> &'static str {
        "NodeIdentityController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::weak::<CompleteMachineConfig>().with_id(id::CURRENT)]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<Identity>()]
    }

    async fn reconcile(&self, ctx: &ControllerContext) -> Result<()> {
        let configured = ctx
            .get_optional::<CompleteMachineConfig>(id::CURRENT)?
            .is_some();

        if !configured {
            ctx.teardown_and_destroy::<Identity>(LOCAL)?;
            return Ok(());
        }

        if ctx.get_optional::<Identity>(LOCAL)?.is_none() {
            let node_id = generate_node_id();
            info!(msg = "generated node identity", %node_id);
            ctx.create(Resource::new(
                LOCAL,
                Identity { node_id },
            ))?;
        }

        Ok(())
    }
}

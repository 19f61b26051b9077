use async_trait::async_trait;
use talemu_resource::Resource;
use talemu_resource::config::id;
use talemu_resource::k8s::Nodename;
use talemu_resource::network::HostnameStatus;
use talemu_runtime::{ControllerContext, Error, Input, Output, Reconcile, Result};

/// Derives the Kubernetes node name from the hostname.
pub struct NodenameController;

#[async_trait]
impl Reconcile for NodenameController {
    fn name(&self) -> &'static str {
        "NodenameController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::weak::<HostnameStatus>().with_id(id::CURRENT)]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<Nodename>()]
    }

    async fn reconcile(&self, ctx: &ControllerContext) -> Result<()> {
        let Some(hostname) = ctx.get_optional::<HostnameStatus>(id::CURRENT)? else {
            ctx.teardown_and_destroy::<Nodename>(id::CURRENT)?;
            return Ok(());
        };

        let nodename = talemu_util::nodename::from_hostname(&hostname.spec.hostname)
            .map_err(|e| Error::controller("deriving nodename", e))?;

        ctx.apply(Resource::new(id::CURRENT, Nodename { nodename }))?;
        Ok(())
    }
}

use async_trait::async_trait;
use talemu_resource::Resource;
use talemu_resource::network::{LinkSpec, LinkStatus};
use talemu_runtime::{Result, TransformController, Transformed};

/// Mirrors link specs into link statuses; emulated links come up as soon as
/// they are declared.
pub struct LinkStatusController;

#[async_trait]
impl TransformController for LinkStatusController {
    type Input = LinkSpec;
    type Output = LinkStatus;

    fn name(&self) -> &'static str {
        "LinkStatusController"
    }

    async fn transform(&self, input: &Resource<LinkSpec>) -> Result<Transformed<LinkStatus>> {
        Ok(Transformed::Apply(LinkStatus {
            name: input.spec.name.clone(),
            up: input.spec.up,
            mtu: input.spec.mtu,
            kind: input.spec.kind.clone(),
        }))
    }
}

//! Transform controllers: a declarative input-to-output mapping the runtime
//! drives, including teardown of the output when the input goes away.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use talemu_resource::{LabelQuery, Phase, Resource, ResourceSpec};

use crate::controller::{ControllerContext, Input, Output, Reconcile};
use crate::error::Result;

/// Outcome of one transform invocation.
pub enum Transformed<O> {
    /// Bring the output to this state.
    Apply(O),
    /// Bring the output to this state and re-run after the delay.
    Requeue(O, Duration),
    /// The output should not exist right now.
    Destroy,
}

/// A pure mapping from an input resource to an output resource. Wrapped in
/// [`TransformAdapter`] it becomes a full controller: the runtime mirrors
/// create/update/destroy of the output to the input, manages the finalizer
/// on the input, and cleans up orphaned outputs.
#[async_trait]
pub trait TransformController: Send + Sync + 'static {
    type Input: ResourceSpec;
    type Output: ResourceSpec;

    fn name(&self) -> &'static str;

    /// Restrict which inputs participate; non-matching inputs get no output.
    fn input_filter(&self, _input: &Resource<Self::Input>) -> bool {
        true
    }

    /// Map input metadata to output metadata.
    fn output_id(&self, input: &Resource<Self::Input>) -> String {
        input.metadata.id.clone()
    }

    async fn transform(&self, input: &Resource<Self::Input>) -> Result<Transformed<Self::Output>>;
}

pub struct TransformAdapter<T>(pub T);

#[async_trait]
impl<T: TransformController> Reconcile for TransformAdapter<T> {
    fn name(&self) -> &'static str {
        self.0.name()
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::strong::<T::Input>()]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<T::Output>()]
    }

    async fn reconcile(&self, ctx: &ControllerContext) -> Result<()> {
        let inputs = ctx.list::<T::Input>(&LabelQuery::new())?;
        let mut want = BTreeSet::new();

        for input in &inputs {
            let participates = self.0.input_filter(input);

            if input.metadata.phase == Phase::TearingDown {
                // Filtered inputs never produced an output; release them
                // right away so their destruction is not blocked on us.
                if participates {
                    let output_id = self.0.output_id(input);
                    ctx.teardown_and_destroy::<T::Output>(&output_id)?;
                    if ctx.get_optional::<T::Output>(&output_id)?.is_some() {
                        continue;
                    }
                }
                ctx.remove_finalizer::<T::Input>(&input.metadata.id)?;
                continue;
            }

            if !participates {
                continue;
            }
            let output_id = self.0.output_id(input);

            match self.0.transform(input).await? {
                Transformed::Apply(spec) => {
                    want.insert(output_id.clone());
                    ctx.apply(Resource::new(output_id, spec))?;
                }
                Transformed::Requeue(spec, delay) => {
                    want.insert(output_id.clone());
                    ctx.apply(Resource::new(output_id, spec))?;
                    ctx.requeue_after(delay);
                }
                Transformed::Destroy => {
                    ctx.teardown_and_destroy::<T::Output>(&output_id)?;
                }
            }
        }

        // Outputs whose input disappeared entirely.
        for output in ctx.list::<T::Output>(&LabelQuery::new())? {
            if !want.contains(&output.metadata.id) {
                ctx.teardown_and_destroy::<T::Output>(&output.metadata.id)?;
            }
        }

        Ok(())
    }
}

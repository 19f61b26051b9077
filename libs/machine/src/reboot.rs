//! Reboot simulation: a reboot status exists from the moment the reboot
//! resource is (re)created until its update time plus the configured
//! downtime.

use async_trait::async_trait;
use chrono::Utc;
use talemu_resource::Resource;
use talemu_resource::runtime::{RebootSpec, RebootStatus};
use talemu_runtime::{Result, TransformController, Transformed};

pub struct RebootStatusController;

#[async_trait]
impl TransformController for RebootStatusController {
    type Input = RebootSpec;
    type Output = RebootStatus;

    fn name(&self) -> &'static str {
        "RebootStatusController"
    }

    async fn transform(&self, input: &Resource<RebootSpec>) -> Result<Transformed<RebootStatus>> {
        let expires =
            input.metadata.updated + chrono::Duration::seconds(input.spec.downtime_secs as i64);
        let remaining = expires - Utc::now();

        if remaining > chrono::Duration::zero() {
            Ok(Transformed::Requeue(
                RebootStatus {
                    downtime_secs: input.spec.downtime_secs,
                },
                remaining.to_std().unwrap_or_default(),
            ))
        } else {
            Ok(Transformed::Destroy)
        }
    }
}

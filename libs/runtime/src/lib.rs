//! Controller runtime: runs a set of declarative reconcilers against the
//! machine's state store.
//!
//! Each controller declares its inputs (resource kinds, with weak, strong or
//! destroy-ready semantics) and outputs (exclusive or shared ownership). The
//! runtime subscribes to the declared kinds, coalesces change notifications
//! into single wakeups, enforces ownership on every write, manages finalizer
//! lifecycle for strong inputs, and restarts failed controllers with
//! exponential backoff.

mod backoff;
pub mod controller;
pub mod error;
pub mod metrics;
pub mod runtime;
pub mod transform;

pub use controller::{
    Controller, ControllerContext, Input, InputMode, Output, OutputMode, Reconcile,
};
pub use error::{Error, Result};
pub use metrics::RuntimeMetrics;
pub use runtime::ControllerRuntime;
pub use transform::{TransformAdapter, TransformController, Transformed};

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use talemu_resource::runtime::{RebootSpec, RebootStatus, Service};
    use talemu_resource::{LabelQuery, Resource, ResourceSpec};
    use talemu_state::{Store, WriteOptions};
    use tokio_util::sync::CancellationToken;

    use super::*;

    /// Test reconciler: mirrors `Service` records into `MachineStatus.ready`
    /// (ready iff every service is healthy).
    struct ReadyController;

    #[async_trait]
    impl Reconcile for ReadyController {
        fn name(&self) -> &'static str {
            "ReadyController"
        }

        fn inputs(&self) -> Vec<Input> {
            vec![Input::weak::<Service>()]
        }

        fn outputs(&self) -> Vec<Output> {
            vec![Output::exclusive::<talemu_resource::runtime::MachineStatus>()]
        }

        async fn reconcile(&self, ctx: &ControllerContext) -> Result<()> {
            use talemu_resource::runtime::{MachineStage, MachineStatus};

            let services = ctx.list::<Service>(&LabelQuery::new())?;
            if services.is_empty() {
                return Ok(());
            }
            let ready = services.iter().all(|s| s.spec.healthy);
            ctx.apply(Resource::new(
                "current",
                MachineStatus {
                    stage: MachineStage::Running,
                    ready,
                    unmet_conditions: vec![],
                },
            ))?;
            Ok(())
        }
    }

    async fn eventually<T: ResourceSpec>(
        store: &Store,
        id: &str,
        pred: impl Fn(&Resource<T>) -> bool,
    ) -> Resource<T> {
        tokio::time::timeout(Duration::from_secs(5), store.watch_for::<T>(id, pred))
            .await
            .expect("condition not reached in time")
            .expect("watch failed")
    }

    #[tokio::test]
    async fn test_reconciler_tracks_inputs() {
        let store = Arc::new(Store::in_memory());
        let cancel = CancellationToken::new();

        let mut runtime = ControllerRuntime::new(
            store.clone(),
            Arc::new(RuntimeMetrics::new()),
            cancel.clone(),
        );
        runtime.register(ReadyController).unwrap();
        let handle = tokio::spawn(runtime.run());

        store
            .create(
                Resource::new(
                    "apid",
                    Service {
                        running: true,
                        healthy: false,
                    },
                ),
                &WriteOptions::system(),
            )
            .unwrap();

        use talemu_resource::runtime::MachineStatus;
        let status = eventually::<MachineStatus>(&store, "current", |_| true).await;
        assert!(!status.spec.ready);
        assert_eq!(
            status.metadata.owner.as_deref(),
            Some("ReadyController")
        );

        store
            .modify::<Service>("apid", &WriteOptions::system(), |s| {
                s.spec.healthy = true;
                Ok(())
            })
            .unwrap();

        eventually::<MachineStatus>(&store, "current", |s| s.spec.ready).await;

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_exclusive_output_claimed_once() {
        let store = Arc::new(Store::in_memory());
        let mut runtime = ControllerRuntime::new(
            store,
            Arc::new(RuntimeMetrics::new()),
            CancellationToken::new(),
        );
        runtime.register(ReadyController).unwrap();
        let err = runtime.register(ReadyController).unwrap_err();
        assert!(matches!(err, Error::DuplicateController(_)));
    }

    /// Reboot-status-style transform: the output exists until the input's
    /// update time plus downtime, then is destroyed.
    struct Expiry;

    #[async_trait]
    impl TransformController for Expiry {
        type Input = RebootSpec;
        type Output = RebootStatus;

        fn name(&self) -> &'static str {
            "ExpiryController"
        }

        async fn transform(&self, input: &Resource<RebootSpec>) -> Result<Transformed<RebootStatus>> {
            let expires =
                input.metadata.updated + chrono::Duration::seconds(input.spec.downtime_secs as i64);
            let left = expires - chrono::Utc::now();
            if left > chrono::Duration::zero() {
                Ok(Transformed::Requeue(
                    RebootStatus {
                        downtime_secs: input.spec.downtime_secs,
                    },
                    left.to_std().unwrap_or_default(),
                ))
            } else {
                Ok(Transformed::Destroy)
            }
        }
    }

    #[tokio::test]
    async fn test_transform_expires_output() {
        let store = Arc::new(Store::in_memory());
        let cancel = CancellationToken::new();

        let mut runtime = ControllerRuntime::new(
            store.clone(),
            Arc::new(RuntimeMetrics::new()),
            cancel.clone(),
        );
        runtime.register(TransformAdapter(Expiry)).unwrap();
        let handle = tokio::spawn(runtime.run());

        store
            .create(
                Resource::new("current", RebootSpec { downtime_secs: 1 }),
                &WriteOptions::system(),
            )
            .unwrap();

        eventually::<RebootStatus>(&store, "current", |_| true).await;

        // After the downtime elapses the transform destroys its output.
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if store.get::<RebootStatus>("current").is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("reboot status not destroyed");

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_strong_input_finalizer_lifecycle() {
        let store = Arc::new(Store::in_memory());
        let cancel = CancellationToken::new();

        let mut runtime = ControllerRuntime::new(
            store.clone(),
            Arc::new(RuntimeMetrics::new()),
            cancel.clone(),
        );
        runtime.register(TransformAdapter(Expiry)).unwrap();
        let handle = tokio::spawn(runtime.run());

        let created = store
            .create(
                Resource::new("current", RebootSpec { downtime_secs: 3600 }),
                &WriteOptions::system(),
            )
            .unwrap();
        let reference = created.reference();

        // The runtime stamps the finalizer on first sight of a strong input.
        eventually::<RebootSpec>(&store, "current", |r| {
            r.metadata.has_finalizer("ExpiryController")
        })
        .await;
        eventually::<RebootStatus>(&store, "current", |_| true).await;

        // Teardown: controller destroys its output and releases the input.
        let ready = store
            .teardown(&reference, &WriteOptions::system())
            .unwrap();
        assert!(!ready);

        tokio::time::timeout(
            Duration::from_secs(5),
            store.wait_finalizers_empty(&reference),
        )
        .await
        .expect("finalizers not released")
        .unwrap();

        store.destroy(&reference, &WriteOptions::system()).unwrap();
        assert!(store.get::<RebootStatus>("current").is_err());

        cancel.cancel();
        handle.await.unwrap();
    }
}

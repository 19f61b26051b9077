//! Controller contract and the scoped store view each controller runs
//! against.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use talemu_resource::{LabelQuery, Resource, ResourceRef, ResourceSpec};
use talemu_state::{Store, WriteOptions};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::metrics::RuntimeMetrics;

/// How the runtime treats changes to an input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputMode {
    /// Wake on changes; no lifecycle involvement.
    Weak,
    /// Wake on changes; the runtime adds the controller's finalizer on first
    /// sight and the controller removes it once teardown work is done.
    Strong,
    /// Wake only when the input is tearing down with no remaining
    /// finalizers.
    DestroyReady,
}

#[derive(Clone, Debug)]
pub struct Input {
    pub namespace: &'static str,
    pub kind: &'static str,
    pub id: Option<String>,
    pub mode: InputMode,
}

impl Input {
    pub fn weak<T: ResourceSpec>() -> Self {
        Self {
            namespace: T::NAMESPACE,
            kind: T::KIND,
            id: None,
            mode: InputMode::Weak,
        }
    }

    pub fn strong<T: ResourceSpec>() -> Self {
        Self {
            mode: InputMode::Strong,
            ..Self::weak::<T>()
        }
    }

    pub fn destroy_ready<T: ResourceSpec>() -> Self {
        Self {
            mode: InputMode::DestroyReady,
            ..Self::weak::<T>()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputMode {
    /// Sole ownership of every resource of the type.
    Exclusive,
    /// Multiple controllers own disjoint ids of the type.
    Shared,
}

#[derive(Clone, Copy, Debug)]
pub struct Output {
    pub namespace: &'static str,
    pub kind: &'static str,
    pub mode: OutputMode,
}

impl Output {
    pub fn exclusive<T: ResourceSpec>() -> Self {
        Self {
            namespace: T::NAMESPACE,
            kind: T::KIND,
            mode: OutputMode::Exclusive,
        }
    }

    pub fn shared<T: ResourceSpec>() -> Self {
        Self {
            mode: OutputMode::Shared,
            ..Self::exclusive::<T>()
        }
    }
}

/// A long-running controller. `run` is expected to loop on
/// [`ControllerContext::next_wake`]; returning an error schedules a restart
/// with backoff.
#[async_trait]
pub trait Controller: Send + Sync + 'static {
    fn name(&self) -> &'static str;
    fn inputs(&self) -> Vec<Input>;
    fn outputs(&self) -> Vec<Output>;
    async fn run(&self, ctx: Arc<ControllerContext>) -> Result<()>;
}

/// The common controller shape: one idempotent reconcile pass per wakeup.
/// Implementors get the run loop, backoff reset and wait-on-missing-input
/// handling for free through the blanket [`Controller`] impl.
#[async_trait]
pub trait Reconcile: Send + Sync + 'static {
    fn name(&self) -> &'static str;
    fn inputs(&self) -> Vec<Input>;
    fn outputs(&self) -> Vec<Output>;
    async fn reconcile(&self, ctx: &ControllerContext) -> Result<()>;
}

#[async_trait]
impl<R: Reconcile> Controller for R {
    fn name(&self) -> &'static str {
        Reconcile::name(self)
    }

    fn inputs(&self) -> Vec<Input> {
        Reconcile::inputs(self)
    }

    fn outputs(&self) -> Vec<Output> {
        Reconcile::outputs(self)
    }

    async fn run(&self, ctx: Arc<ControllerContext>) -> Result<()> {
        loop {
            match self.reconcile(&ctx).await {
                Ok(()) => ctx.reset_restart_backoff(),
                Err(e) if e.is_wait() => {
                    debug!(msg = "reconcile waiting on inputs", controller = Reconcile::name(self), %e);
                }
                Err(e) => return Err(e),
            }

            if !ctx.next_wake().await {
                return Ok(());
            }
        }
    }
}

/// Scoped store view handed to a controller. Reads are limited to declared
/// inputs and outputs; writes to declared outputs, stamped with the
/// controller as owner.
pub struct ControllerContext {
    name: &'static str,
    store: Arc<Store>,
    readable: Vec<&'static str>,
    writable: Vec<&'static str>,
    wake: Arc<Notify>,
    cancel: CancellationToken,
    requeue_at: Mutex<Option<Instant>>,
    backoff_reset: AtomicBool,
    metrics: Arc<RuntimeMetrics>,
}

impl ControllerContext {
    pub(crate) fn new(
        name: &'static str,
        store: Arc<Store>,
        inputs: &[Input],
        outputs: &[Output],
        wake: Arc<Notify>,
        cancel: CancellationToken,
        metrics: Arc<RuntimeMetrics>,
    ) -> Self {
        let mut readable: Vec<&'static str> =
            inputs.iter().map(|i| i.kind).collect();
        let writable: Vec<&'static str> = outputs.iter().map(|o| o.kind).collect();
        readable.extend(writable.iter().copied());

        Self {
            name,
            store,
            readable,
            writable,
            wake,
            cancel,
            requeue_at: Mutex::new(None),
            backoff_reset: AtomicBool::new(false),
            metrics,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait for the next wakeup: a coalesced input/output change, a requeue
    /// deadline, or cancellation. Returns false on cancellation.
    pub async fn next_wake(&self) -> bool {
        let deadline = *self.requeue_at.lock().expect("requeue lock poisoned");

        let woke = tokio::select! {
            _ = self.cancel.cancelled() => return false,
            _ = self.wake.notified() => true,
            () = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            } => false,
        };

        if !woke {
            // The deadline fired; clear it so it does not fire again.
            let mut slot = self.requeue_at.lock().expect("requeue lock poisoned");
            if *slot == deadline {
                *slot = None;
            }
        }
        self.metrics.wakeup(self.name);
        true
    }

    /// Ask to be re-run after the delay, keeping the earliest pending
    /// deadline.
    pub fn requeue_after(&self, delay: Duration) {
        let at = Instant::now() + delay;
        let mut slot = self.requeue_at.lock().expect("requeue lock poisoned");
        match *slot {
            Some(existing) if existing <= at => {}
            _ => *slot = Some(at),
        }
    }

    /// Signal a successful pass: the next restart starts from a fresh
    /// backoff.
    pub fn reset_restart_backoff(&self) {
        self.backoff_reset.store(true, Ordering::Relaxed);
    }

    pub(crate) fn take_backoff_reset(&self) -> bool {
        self.backoff_reset.swap(false, Ordering::Relaxed)
    }

    fn check_readable(&self, kind: &'static str) -> Result<()> {
        if self.readable.contains(&kind) {
            Ok(())
        } else {
            Err(Error::UndeclaredInput {
                controller: self.name,
                kind,
            })
        }
    }

    fn check_writable(&self, kind: &'static str) -> Result<()> {
        if self.writable.contains(&kind) {
            Ok(())
        } else {
            Err(Error::UndeclaredOutput {
                controller: self.name,
                kind,
            })
        }
    }

    fn write_options(&self) -> WriteOptions {
        WriteOptions::owned_by(self.name)
    }

    pub fn get<T: ResourceSpec>(&self, id: &str) -> Result<Resource<T>> {
        self.check_readable(T::KIND)?;
        Ok(self.store.get::<T>(id)?)
    }

    /// `get` with not-found mapped to `None`; the usual shape for optional
    /// inputs.
    pub fn get_optional<T: ResourceSpec>(&self, id: &str) -> Result<Option<Resource<T>>> {
        match self.get::<T>(id) {
            Ok(r) => Ok(Some(r)),
            Err(Error::State(e)) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn list<T: ResourceSpec>(&self, query: &LabelQuery) -> Result<Vec<Resource<T>>> {
        self.check_readable(T::KIND)?;
        Ok(self.store.list::<T>(query)?)
    }

    pub fn create<T: ResourceSpec>(&self, resource: Resource<T>) -> Result<Resource<T>> {
        self.check_writable(T::KIND)?;
        Ok(self.store.create(resource, &self.write_options())?)
    }

    pub fn update<T: ResourceSpec>(&self, resource: Resource<T>) -> Result<Resource<T>> {
        self.check_writable(T::KIND)?;
        Ok(self.store.update(resource, &self.write_options())?)
    }

    /// Create-or-update an output to the desired state.
    pub fn apply<T: ResourceSpec>(&self, resource: Resource<T>) -> Result<Resource<T>> {
        self.check_writable(T::KIND)?;
        Ok(self.store.apply(resource, &self.write_options())?)
    }

    /// Read-modify-write with conflict retry.
    pub fn modify<T: ResourceSpec>(
        &self,
        id: &str,
        mutate: impl FnMut(&mut Resource<T>) -> talemu_state::Result<()>,
    ) -> Result<Resource<T>> {
        self.check_writable(T::KIND)?;
        Ok(self.store.modify(id, &self.write_options(), mutate)?)
    }

    pub fn teardown<T: ResourceSpec>(&self, id: &str) -> Result<bool> {
        self.check_writable(T::KIND)?;
        let reference = ResourceRef::new(T::NAMESPACE, T::KIND, id);
        Ok(self.store.teardown(&reference, &self.write_options())?)
    }

    pub fn destroy<T: ResourceSpec>(&self, id: &str) -> Result<()> {
        self.check_writable(T::KIND)?;
        let reference = ResourceRef::new(T::NAMESPACE, T::KIND, id);
        Ok(self.store.destroy(&reference, &self.write_options())?)
    }

    /// Tear an output down and destroy it once its finalizers clear. When
    /// finalizers remain this returns Ok and the controller is re-woken as
    /// they are removed.
    pub fn teardown_and_destroy<T: ResourceSpec>(&self, id: &str) -> Result<()> {
        match self.teardown::<T>(id) {
            Ok(true) => self.destroy::<T>(id),
            Ok(false) => Ok(()),
            Err(Error::State(e)) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Add this controller's finalizer to an input.
    pub fn add_finalizer<T: ResourceSpec>(&self, id: &str) -> Result<()> {
        self.check_readable(T::KIND)?;
        let reference = ResourceRef::new(T::NAMESPACE, T::KIND, id);
        Ok(self.store.add_finalizer(&reference, self.name)?)
    }

    /// Remove this controller's finalizer from an input, unblocking its
    /// destruction.
    pub fn remove_finalizer<T: ResourceSpec>(&self, id: &str) -> Result<()> {
        self.check_readable(T::KIND)?;
        let reference = ResourceRef::new(T::NAMESPACE, T::KIND, id);
        match self.store.remove_finalizer(&reference, self.name) {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

}

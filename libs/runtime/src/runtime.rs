//! The scheduler: one task per controller, watch-driven coalescing wakeups,
//! restart with exponential backoff.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::StreamExt;
use futures::stream::select_all;
use talemu_resource::Phase;
use talemu_state::{EventKind, Store, WatchOptions};
use tokio::sync::Notify;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::backoff::RestartBackoff;
use crate::controller::{Controller, ControllerContext, Input, InputMode, OutputMode};
use crate::error::{Error, Result};
use crate::metrics::RuntimeMetrics;

/// What a pump subscription feeds: a declared input, or one of the
/// controller's own outputs (watched so teardown of an output re-wakes its
/// owner once finalizers clear).
enum Source {
    Input(Input),
    Output,
}

pub struct ControllerRuntime {
    store: Arc<Store>,
    metrics: Arc<RuntimeMetrics>,
    cancel: CancellationToken,
    controllers: Vec<Arc<dyn Controller>>,
    names: HashSet<&'static str>,
    exclusive: HashMap<&'static str, &'static str>,
    shared: HashMap<&'static str, Vec<&'static str>>,
}

impl ControllerRuntime {
    pub fn new(store: Arc<Store>, metrics: Arc<RuntimeMetrics>, cancel: CancellationToken) -> Self {
        Self {
            store,
            metrics,
            cancel,
            controllers: Vec::new(),
            names: HashSet::new(),
            exclusive: HashMap::new(),
            shared: HashMap::new(),
        }
    }

    /// Register a controller, enforcing name uniqueness and output
    /// exclusivity across the whole set.
    pub fn register(&mut self, controller: impl Controller) -> Result<()> {
        let name = controller.name();
        if !self.names.insert(name) {
            return Err(Error::DuplicateController(name));
        }

        for output in controller.outputs() {
            if let Some(&claimed_by) = self.exclusive.get(output.kind) {
                return Err(Error::OutputClaimed {
                    kind: output.kind.to_string(),
                    claimed_by,
                    controller: name,
                });
            }
            match output.mode {
                OutputMode::Exclusive => {
                    if let Some(sharers) = self.shared.get(output.kind) {
                        return Err(Error::OutputClaimed {
                            kind: output.kind.to_string(),
                            claimed_by: sharers[0],
                            controller: name,
                        });
                    }
                    self.exclusive.insert(output.kind, name);
                }
                OutputMode::Shared => {
                    self.shared.entry(output.kind).or_default().push(name);
                }
            }
        }

        self.controllers.push(Arc::new(controller));
        Ok(())
    }

    /// Run every controller until cancellation. Each controller gets a
    /// watch pump feeding a coalescing wakeup and a run task restarted with
    /// backoff on error.
    pub async fn run(self) {
        let mut tasks = Vec::new();

        for controller in &self.controllers {
            let name = controller.name();
            let inputs = controller.inputs();
            let outputs = controller.outputs();

            let wake = Arc::new(Notify::new());
            // First pass runs without waiting for an event.
            wake.notify_one();

            let ctx = Arc::new(ControllerContext::new(
                name,
                self.store.clone(),
                &inputs,
                &outputs,
                wake.clone(),
                self.cancel.child_token(),
                self.metrics.clone(),
            ));

            tasks.push(tokio::spawn(pump(
                name,
                self.store.clone(),
                inputs,
                outputs
                    .iter()
                    .map(|o| (o.namespace, o.kind))
                    .collect(),
                wake,
                self.cancel.child_token(),
            )));

            let metrics = self.metrics.clone();
            let cancel = self.cancel.child_token();
            let controller = controller.clone();
            tasks.push(tokio::spawn(async move {
                run_with_restarts(controller, ctx, metrics, cancel).await;
            }));
        }

        info!(msg = "controller runtime started", controllers = self.controllers.len());
        for task in tasks {
            let _ = task.await;
        }
    }
}

async fn run_with_restarts(
    controller: Arc<dyn Controller>,
    ctx: Arc<ControllerContext>,
    metrics: Arc<RuntimeMetrics>,
    cancel: CancellationToken,
) {
    let name = controller.name();
    let backoff = RestartBackoff::new();
    metrics.controller_started();

    loop {
        match controller.run(ctx.clone()).await {
            Ok(()) => break,
            Err(e) => {
                error!(msg = "controller run failed", controller = name, %e);
                metrics.reconcile_failure(name);

                if ctx.take_backoff_reset() {
                    backoff.reset();
                }
                let delay = backoff.next_delay();
                metrics.restart(name);
                debug!(msg = "restarting controller", controller = name, ?delay);

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    metrics.controller_stopped();
}

/// Subscribe to every input (and output) kind and translate matching events
/// into coalesced wakeups. Strong inputs get the controller's finalizer
/// added on first sight.
async fn pump(
    name: &'static str,
    store: Arc<Store>,
    inputs: Vec<Input>,
    output_kinds: Vec<(&'static str, &'static str)>,
    wake: Arc<Notify>,
    cancel: CancellationToken,
) {
    let mut streams = Vec::new();
    let mut sources = Vec::new();

    for input in inputs {
        let rx = store.watch_kind(input.namespace, input.kind, WatchOptions::default());
        let idx = sources.len();
        sources.push(Source::Input(input));
        streams.push(UnboundedReceiverStream::new(rx).map(move |e| (idx, e)).boxed());
    }
    for (namespace, kind) in output_kinds {
        let rx = store.watch_kind(namespace, kind, WatchOptions::default());
        let idx = sources.len();
        sources.push(Source::Output);
        streams.push(UnboundedReceiverStream::new(rx).map(move |e| (idx, e)).boxed());
    }

    if streams.is_empty() {
        cancel.cancelled().await;
        return;
    }
    let mut merged = select_all(streams);

    loop {
        let (idx, event) = tokio::select! {
            _ = cancel.cancelled() => return,
            next = merged.next() => match next {
                Some(pair) => pair,
                None => return,
            },
        };

        match event.kind {
            // Writes that changed nothing must not re-wake the writer.
            EventKind::Bootstrapped | EventKind::Noop => continue,
            EventKind::Errored => {
                error!(msg = "watch terminated by store failure", controller = name);
                continue;
            }
            EventKind::Created | EventKind::Updated | EventKind::Destroyed => {}
        }

        let Some(resource) = event.resource.as_ref() else {
            continue;
        };

        match &sources[idx] {
            Source::Input(input) => {
                if input
                    .id
                    .as_ref()
                    .is_some_and(|id| *id != resource.metadata.id)
                {
                    continue;
                }

                match input.mode {
                    InputMode::Weak => {}
                    InputMode::Strong => {
                        if event.kind != EventKind::Destroyed
                            && resource.metadata.phase == Phase::Running
                            && !resource.metadata.has_finalizer(name)
                        {
                            if let Err(e) = store.add_finalizer(&resource.reference(), name) {
                                if !e.is_not_found() {
                                    error!(msg = "failed to add finalizer", controller = name, %e);
                                }
                            }
                        }
                    }
                    InputMode::DestroyReady => {
                        let ready = resource.metadata.phase == Phase::TearingDown
                            && resource.metadata.finalizers.is_empty();
                        if !ready {
                            continue;
                        }
                    }
                }
            }
            Source::Output => {
                // Only teardown progress on an output is interesting to its
                // owner; everything else is the owner's own write echo.
                let relevant = event.kind == EventKind::Destroyed
                    || resource.metadata.phase == Phase::TearingDown;
                if !relevant {
                    continue;
                }
            }
        }

        wake.notify_one();
    }
}

//! Event publisher: watches service records and the machine status,
//! publishes each change to the configured sink, and keeps a per-kind
//! last-sent-version so missed events are replayed after a reconnect.
//!
//! Delivery is at-least-once; the consumer must tolerate duplicates after
//! reconnection.

use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use hyper_util::rt::TokioIo;
use talemu_resource::runtime::{MachineStatus, PublisherStatus, Service};
use talemu_resource::{Resource, ResourceSpec};
use talemu_state::{Error as StateError, EventKind, Store, WatchOptions, WriteOptions};
use talemu_util::dialer::BoundDialer;
use talemu_util::ids::event_id;
use thiserror::Error;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::{debug, info, warn};

use crate::proto::events::EventRequest;
use crate::proto::events::event_sink_client::EventSinkClient;

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("sink endpoint unusable: {0}")]
    Endpoint(#[source] tonic::transport::Error),

    #[error("sink connection failed: {0}")]
    Connect(#[source] tonic::transport::Error),

    #[error("publish failed: {0}")]
    Publish(#[source] tonic::Status),

    #[error(transparent)]
    State(#[from] StateError),
}

pub struct EventPublisher {
    store: Arc<Store>,
    endpoint: String,
    dialer: BoundDialer,
}

impl EventPublisher {
    pub fn new(store: Arc<Store>, endpoint: impl Into<String>, dialer: BoundDialer) -> Self {
        Self {
            store,
            endpoint: endpoint.into(),
            dialer,
        }
    }

    /// Run until cancelled, reconnecting with exponential backoff on any
    /// session failure.
    pub async fn run(self, cancel: CancellationToken) {
        let mut backoff = ExponentialBuilder::default()
            .with_min_delay(BACKOFF_BASE)
            .with_max_delay(BACKOFF_CAP)
            .with_jitter()
            .without_max_times()
            .build();

        loop {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return,
                outcome = self.session(&cancel) => outcome,
            };

            match outcome {
                Ok(()) => return,
                Err(e) => {
                    let delay = backoff.next().unwrap_or(BACKOFF_CAP);
                    warn!(msg = "event publisher session failed", %e, ?delay);
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn connect(&self) -> Result<Channel, PublishError> {
        let dialer = self.dialer.clone();
        let target = self.endpoint.clone();

        Endpoint::try_from(format!("http://{}", self.endpoint))
            .map_err(PublishError::Endpoint)?
            .connect_with_connector(service_fn(move |_uri: Uri| {
                let dialer = dialer.clone();
                let target = target.clone();
                async move { dialer.connect(&target).await.map(TokioIo::new) }
            }))
            .await
            .map_err(PublishError::Connect)
    }

    fn last_sent(&self, kind: &str) -> u64 {
        self.store
            .get::<PublisherStatus>(kind)
            .map(|status| status.spec.last_sent_version)
            .unwrap_or(0)
    }

    /// Persist the delivery watermark transactionally.
    fn advance(&self, kind: &str, sequence: u64) -> Result<(), StateError> {
        let system = WriteOptions::system();
        match self.store.modify::<PublisherStatus>(kind, &system, |s| {
            s.spec.last_sent_version = s.spec.last_sent_version.max(sequence);
            Ok(())
        }) {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                self.store.create(
                    Resource::new(
                        kind,
                        PublisherStatus {
                            last_sent_version: sequence,
                        },
                    ),
                    &system,
                )?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Open a watch sized to replay the gap between the store's current
    /// per-kind sequence and the last version the sink acknowledged.
    fn open_watch(
        &self,
        namespace: &str,
        kind: &str,
    ) -> talemu_state::WatchReceiver {
        let current = self.store.kind_sequence(namespace, kind);
        let gap = current.saturating_sub(self.last_sent(kind));
        if gap > 0 {
            debug!(msg = "replaying missed events", kind, gap);
            self.store
                .watch_kind(namespace, kind, WatchOptions::tail(gap as usize))
        } else {
            self.store
                .watch_kind(namespace, kind, WatchOptions::default())
        }
    }

    async fn session(&self, cancel: &CancellationToken) -> Result<(), PublishError> {
        let channel = self.connect().await?;
        let mut client = EventSinkClient::new(channel);
        info!(msg = "event sink connected", endpoint = %self.endpoint);

        let services = self.open_watch(Service::NAMESPACE, Service::KIND);
        let statuses = self.open_watch(MachineStatus::NAMESPACE, MachineStatus::KIND);

        let mut merged = UnboundedReceiverStream::new(services)
            .merge(UnboundedReceiverStream::new(statuses));

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                event = merged.next() => match event {
                    Some(event) => event,
                    None => return Ok(()),
                },
            };

            let Some(resource) = event.resource.as_ref() else {
                continue;
            };

            match event.kind {
                EventKind::Created | EventKind::Updated => {}
                // Nothing to publish for a no-op apply, but the watermark
                // still moves so reconnects do not replay it.
                EventKind::Noop => {
                    self.advance(&resource.metadata.kind, event.sequence)?;
                    continue;
                }
                _ => continue,
            }

            let payload = match resource.metadata.kind.as_str() {
                kind if kind == Service::KIND => {
                    let service: Resource<Service> = match resource.typed() {
                        Ok(service) => service,
                        Err(_) => continue,
                    };
                    let state = if !service.spec.running {
                        "Stopped"
                    } else if service.spec.healthy {
                        "Running"
                    } else {
                        "Starting"
                    };
                    serde_json::json!({
                        "service": service.metadata.id,
                        "state": state,
                        "healthy": service.spec.healthy,
                    })
                }
                kind if kind == MachineStatus::KIND => {
                    let status: Resource<MachineStatus> = match resource.typed() {
                        Ok(status) => status,
                        Err(_) => continue,
                    };
                    serde_json::json!({
                        "stage": status.spec.stage,
                        "ready": status.spec.ready,
                        "unmetConditions": status.spec.unmet_conditions,
                    })
                }
                _ => continue,
            };

            let request = EventRequest {
                id: event_id(resource.metadata.updated),
                kind: resource.metadata.kind.clone(),
                resource_id: resource.metadata.id.clone(),
                version: resource.metadata.version,
                payload_type: format!("talemu.dev/{}", resource.metadata.kind),
                payload: serde_json::to_vec(&payload).unwrap_or_default(),
            };

            client
                .publish(request)
                .await
                .map_err(PublishError::Publish)?;

            self.advance(&resource.metadata.kind, event.sequence)?;
        }
    }
}

//! Typed-state service: the full CRUD+watch surface of the store, validated
//! against the type registry.

use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use talemu_resource::registry::TypeRegistry;
use talemu_resource::{AnyResource, LabelQuery, Metadata, Phase, ResourceRef};
use talemu_state::{Event, EventKind, Store, WatchOptions, WriteOptions};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::{self as stream, StreamExt};
use tonic::{Request, Response, Status};

use crate::error::to_status;
use crate::proto::state::state_service_server::StateService as StateServiceApi;
use crate::proto::state::{
    CreateRequest, CreateResponse, DestroyRequest, DestroyResponse, EventType, GetRequest,
    GetResponse, ListRequest, ListResponse, TeardownRequest, TeardownResponse, UpdateRequest,
    UpdateResponse, WatchRequest, WatchResponse,
};

pub struct StateRpc {
    store: Arc<Store>,
    registry: Arc<TypeRegistry>,
}

impl StateRpc {
    pub fn new(store: Arc<Store>, registry: Arc<TypeRegistry>) -> Self {
        Self { store, registry }
    }

    fn decode(&self, proto: crate::proto::state::Resource) -> Result<AnyResource, Status> {
        let spec: serde_json::Value = serde_json::from_slice(&proto.spec)
            .map_err(|e| Status::invalid_argument(format!("spec is not JSON: {e}")))?;

        let mut metadata = Metadata::new(proto.namespace, proto.kind, proto.id);
        metadata.version = proto.version;
        metadata.phase = match proto.phase.as_str() {
            "tearingDown" => Phase::TearingDown,
            _ => Phase::Running,
        };
        metadata.labels = proto.labels.into_iter().collect();

        let resource = AnyResource { metadata, spec };
        self.registry
            .validate(&resource)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;
        Ok(resource)
    }
}

fn encode(resource: &AnyResource) -> crate::proto::state::Resource {
    crate::proto::state::Resource {
        namespace: resource.metadata.namespace.clone(),
        kind: resource.metadata.kind.clone(),
        id: resource.metadata.id.clone(),
        version: resource.metadata.version,
        phase: match resource.metadata.phase {
            Phase::Running => "running".to_string(),
            Phase::TearingDown => "tearingDown".to_string(),
        },
        owner: resource.metadata.owner.clone().unwrap_or_default(),
        finalizers: resource.metadata.finalizers.clone(),
        labels: resource.metadata.labels.clone().into_iter().collect(),
        spec: serde_json::to_vec(&resource.spec).unwrap_or_default(),
    }
}

fn encode_event(event: &Event) -> WatchResponse {
    let event_type = match event.kind {
        EventKind::Created => EventType::Created,
        EventKind::Updated => EventType::Updated,
        EventKind::Destroyed => EventType::Destroyed,
        EventKind::Bootstrapped => EventType::Bootstrapped,
        EventKind::Errored => EventType::Errored,
        EventKind::Noop => EventType::Noop,
    };

    WatchResponse {
        event: event_type as i32,
        resource: event.resource.as_ref().map(encode),
        old: event.old.as_ref().map(encode),
    }
}

fn selector_query(selectors: &[crate::proto::state::LabelTerm]) -> LabelQuery {
    let mut query = LabelQuery::new();
    for term in selectors {
        query = if term.exists {
            query.exists(&term.key)
        } else {
            query.equals(&term.key, &term.value)
        };
    }
    query
}

type ServerStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send + 'static>>;

#[tonic::async_trait]
impl StateServiceApi for StateRpc {
    async fn get(&self, request: Request<GetRequest>) -> Result<Response<GetResponse>, Status> {
        let request = request.into_inner();
        let reference = ResourceRef::new(request.namespace, request.kind, request.id);
        let resource = self.store.get_any(&reference).map_err(to_status)?;
        Ok(Response::new(GetResponse {
            resource: Some(encode(&resource)),
        }))
    }

    type ListStream = ServerStream<ListResponse>;

    async fn list(
        &self,
        request: Request<ListRequest>,
    ) -> Result<Response<Self::ListStream>, Status> {
        let request = request.into_inner();
        let query = selector_query(&request.selectors);

        let resources = self
            .store
            .list_any(&request.namespace, &request.kind, &query)
            .map_err(to_status)?;

        let responses: Vec<Result<ListResponse, Status>> = resources
            .iter()
            .map(|r| {
                Ok(ListResponse {
                    resource: Some(encode(r)),
                })
            })
            .collect();
        Ok(Response::new(Box::pin(stream::iter(responses))))
    }

    async fn create(
        &self,
        request: Request<CreateRequest>,
    ) -> Result<Response<CreateResponse>, Status> {
        let proto = request
            .into_inner()
            .resource
            .ok_or_else(|| Status::invalid_argument("resource is required"))?;
        let resource = self.decode(proto)?;

        let created = self
            .store
            .create_any(resource, &WriteOptions::system())
            .map_err(to_status)?;
        Ok(Response::new(CreateResponse {
            resource: Some(encode(&created)),
        }))
    }

    async fn update(
        &self,
        request: Request<UpdateRequest>,
    ) -> Result<Response<UpdateResponse>, Status> {
        let proto = request
            .into_inner()
            .resource
            .ok_or_else(|| Status::invalid_argument("resource is required"))?;
        let resource = self.decode(proto)?;

        let updated = self
            .store
            .update_any(resource, &WriteOptions::system())
            .map_err(to_status)?;
        Ok(Response::new(UpdateResponse {
            resource: Some(encode(&updated)),
        }))
    }

    async fn teardown(
        &self,
        request: Request<TeardownRequest>,
    ) -> Result<Response<TeardownResponse>, Status> {
        let request = request.into_inner();
        let reference = ResourceRef::new(request.namespace, request.kind, request.id);
        let ready = self
            .store
            .teardown(&reference, &WriteOptions::system())
            .map_err(to_status)?;
        Ok(Response::new(TeardownResponse { ready }))
    }

    async fn destroy(
        &self,
        request: Request<DestroyRequest>,
    ) -> Result<Response<DestroyResponse>, Status> {
        let request = request.into_inner();
        let reference = ResourceRef::new(request.namespace, request.kind, request.id);
        self.store
            .destroy(&reference, &WriteOptions::system())
            .map_err(to_status)?;
        Ok(Response::new(DestroyResponse {}))
    }

    type WatchStream = ServerStream<WatchResponse>;

    async fn watch(
        &self,
        request: Request<WatchRequest>,
    ) -> Result<Response<Self::WatchStream>, Status> {
        let request = request.into_inner();

        let options = if request.tail_events > 0 {
            WatchOptions::tail(request.tail_events as usize)
        } else {
            WatchOptions::default()
        };

        let receiver = if request.id.is_empty() {
            self.store
                .watch_kind(&request.namespace, &request.kind, options)
        } else {
            self.store.watch(
                &ResourceRef::new(request.namespace, request.kind, request.id),
                options,
            )
        };

        let responses = UnboundedReceiverStream::new(receiver).map(|event| Ok(encode_event(&event)));
        Ok(Response::new(Box::pin(responses)))
    }
}

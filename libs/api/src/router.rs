//! Method routing for the proxying listener: every call is classified as
//! unary or streamed, then dispatched to a backend. Only the in-process
//! local backend is wired today; the registry keeps the shape needed to add
//! remote fan-out later.

use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};

use regex::RegexSet;
use tower::{Layer, Service};
use tracing::trace;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MethodClass {
    Unary,
    Streaming,
}

/// Full-path patterns for streaming methods that do not follow the
/// `...Stream` suffix convention.
const STREAMING_PATTERNS: &[&str] = &[
    r"Stream$",
    r"^/machine\.MachineService/(Copy|Dmesg|Logs|Events|List|Read|Kubeconfig)$",
    r"^/machine\.MachineService/(ImageList|PacketCapture|DiskUsage|EtcdSnapshot)$",
    r"^/cluster\.ClusterService/HealthCheck$",
    r"^/state\.StateService/(List|Watch)$",
];

fn streaming_set() -> &'static RegexSet {
    static SET: OnceLock<RegexSet> = OnceLock::new();
    SET.get_or_init(|| RegexSet::new(STREAMING_PATTERNS).expect("patterns are valid"))
}

/// Classify a full gRPC method path such as `/machine.MachineService/Dmesg`.
pub fn classify(path: &str) -> MethodClass {
    if streaming_set().is_match(path) {
        MethodClass::Streaming
    } else {
        MethodClass::Unary
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Backend {
    /// Serve from the in-process services.
    Local,
    /// Forward to another node-management endpoint.
    Remote(String),
}

/// Named backend registry consulted per call. The first registered backend
/// is the default.
#[derive(Clone, Debug, Default)]
pub struct Router {
    backends: Vec<(String, Backend)>,
}

impl Router {
    pub fn new() -> Self {
        let mut router = Self::default();
        router.add_backend("local", Backend::Local);
        router
    }

    pub fn add_backend(&mut self, name: impl Into<String>, backend: Backend) {
        self.backends.push((name.into(), backend));
    }

    pub fn backend_for(&self, _path: &str) -> &Backend {
        // All methods currently route to the default backend.
        &self.backends[0].1
    }
}

/// Tower layer applying classification and backend selection to every
/// request flowing into the gRPC server.
#[derive(Clone)]
pub struct RouterLayer {
    router: Arc<Router>,
}

impl RouterLayer {
    pub fn new(router: Router) -> Self {
        Self {
            router: Arc::new(router),
        }
    }
}

impl<S> Layer<S> for RouterLayer {
    type Service = RouterService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RouterService {
            inner,
            router: self.router.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RouterService<S> {
    inner: S,
    router: Arc<Router>,
}

impl<S, B> Service<http::Request<B>> for RouterService<S>
where
    S: Service<http::Request<B>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: http::Request<B>) -> Self::Future {
        let path = request.uri().path();
        let class = classify(path);
        let backend = self.router.backend_for(path);
        trace!(msg = "routing call", path, ?class, ?backend);
        // Remote backends are not wired yet; everything dispatches locally.
        self.inner.call(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_streaming_classification() {
        for path in [
            "/machine.MachineService/Dmesg",
            "/machine.MachineService/Logs",
            "/machine.MachineService/List",
            "/machine.MachineService/ImageList",
            "/machine.MachineService/Copy",
            "/machine.MachineService/EtcdSnapshot",
            "/state.StateService/Watch",
            "/cluster.ClusterService/HealthCheck",
            "/anything.Service/EventsStream",
        ] {
            assert_eq!(classify(path), MethodClass::Streaming, "{path}");
        }
    }

    #[test]
    fn test_unary_classification() {
        for path in [
            "/machine.MachineService/Bootstrap",
            "/machine.MachineService/ApplyConfiguration",
            // List-suffixed unary calls must not be misclassified.
            "/machine.MachineService/EtcdMemberList",
            "/machine.MachineService/ServiceList",
            "/state.StateService/Get",
        ] {
            assert_eq!(classify(path), MethodClass::Unary, "{path}");
        }
    }

    #[test]
    fn test_default_backend_is_local() {
        let router = Router::new();
        assert_eq!(
            router.backend_for("/machine.MachineService/Version"),
            &Backend::Local
        );
    }
}

//! The node-management listener: one TLS socket bound to the overlay
//! address, three gRPC services behind the router.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use talemu_cluster::GlobalState;
use talemu_resource::registry::TypeRegistry;
use talemu_state::Store;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::transport::server::Connected;
use tracing::{debug, info};

use crate::machine_service::MachineRpc;
use crate::proto::machine::machine_service_server::MachineServiceServer;
use crate::proto::state::state_service_server::StateServiceServer;
use crate::proto::storage::storage_service_server::StorageServiceServer;
use crate::router::{Router, RouterLayer};
use crate::state_service::StateRpc;
use crate::storage_service::StorageRpc;
use crate::tls::{TlsError, TlsProvider};

/// Grace period for in-flight calls after shutdown is requested.
const STOP_GRACE: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum ServeError {
    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("bind failed: {0}")]
    Bind(#[source] std::io::Error),

    #[error("serve failed: {0}")]
    Serve(#[source] tonic::transport::Error),
}

/// An accepted TLS connection, typed for tonic's incoming stream.
pub struct TlsConn {
    stream: tokio_rustls::server::TlsStream<TcpStream>,
    remote: Option<SocketAddr>,
}

#[derive(Clone)]
pub struct TlsConnectInfo {
    pub remote: Option<SocketAddr>,
}

impl Connected for TlsConn {
    type ConnectInfo = TlsConnectInfo;

    fn connect_info(&self) -> TlsConnectInfo {
        TlsConnectInfo {
            remote: self.remote,
        }
    }
}

impl AsyncRead for TlsConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TlsConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

pub struct ApiServer {
    store: Arc<Store>,
    global: GlobalState,
    machine_id: String,
    provider: Arc<TlsProvider>,
}

impl ApiServer {
    /// Create the server with a self-signed maintenance certificate; the
    /// provider hot-swaps once an API certificate is issued.
    pub fn new(
        store: Arc<Store>,
        global: GlobalState,
        machine_id: impl Into<String>,
        san: &[String],
    ) -> Result<Self, TlsError> {
        Ok(Self {
            store,
            global,
            machine_id: machine_id.into(),
            provider: TlsProvider::self_signed(san)?,
        })
    }

    pub fn tls_provider(&self) -> Arc<TlsProvider> {
        self.provider.clone()
    }

    /// Serve until cancelled. In-flight calls get a short grace period, then
    /// the listener stops hard.
    pub async fn serve(self, bind: SocketAddr, cancel: CancellationToken) -> Result<(), ServeError> {
        let listener = TcpListener::bind(bind).await.map_err(ServeError::Bind)?;
        let local = listener.local_addr().map_err(ServeError::Bind)?;
        info!(msg = "node management api listening", machine = %self.machine_id, %local);

        self.serve_on(listener, cancel).await
    }

    /// Serve on an already-bound listener (tests bind to an ephemeral port).
    pub async fn serve_on(
        self,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<(), ServeError> {
        let acceptor = TlsAcceptor::from(self.provider.server_config()?);

        tokio::spawn(
            self.provider
                .clone()
                .follow_store(self.store.clone(), cancel.child_token()),
        );

        // Accept loop: TLS handshakes run per connection; failures are
        // dropped without disturbing the listener.
        let (tx, rx) = mpsc::channel::<Result<TlsConn, std::io::Error>>(16);
        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let accepted = tokio::select! {
                        _ = cancel.cancelled() => return,
                        accepted = listener.accept() => accepted,
                    };
                    let (tcp, remote) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            debug!(msg = "accept failed", %e);
                            continue;
                        }
                    };

                    let acceptor = acceptor.clone();
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        match acceptor.accept(tcp).await {
                            Ok(stream) => {
                                let _ = tx
                                    .send(Ok(TlsConn {
                                        stream,
                                        remote: Some(remote),
                                    }))
                                    .await;
                            }
                            Err(e) => debug!(msg = "tls handshake failed", %remote, %e),
                        }
                    });
                }
            });
        }

        let machine = MachineRpc::new(
            self.store.clone(),
            self.global.clone(),
            self.machine_id.clone(),
        );
        let storage = StorageRpc::new(self.store.clone());
        let state = StateRpc::new(
            self.store.clone(),
            Arc::new(TypeRegistry::default()),
        );

        let serve = Server::builder()
            .layer(RouterLayer::new(Router::new()))
            .add_service(MachineServiceServer::new(machine))
            .add_service(StorageServiceServer::new(storage))
            .add_service(StateServiceServer::new(state))
            .serve_with_incoming_shutdown(ReceiverStream::new(rx), cancel.clone().cancelled_owned());

        // Hard stop when the grace period after cancellation runs out.
        let grace = async {
            cancel.cancelled().await;
            tokio::time::sleep(STOP_GRACE).await;
        };

        tokio::select! {
            result = serve => result.map_err(ServeError::Serve),
            _ = grace => Ok(()),
        }
    }
}

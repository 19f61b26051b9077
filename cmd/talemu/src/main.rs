mod telemetry;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{Router, get};
use clap::{Parser, crate_description, crate_version};
use prometheus_client::registry::Registry;
use talemu_cluster::GlobalState;
use talemu_events::{SinkAddress, logsink};
use talemu_machine::{Machine, MachineParams};
use talemu_runtime::RuntimeMetrics;
use talemu_util::cmdline::{KernelConfig, SideroLinkParams};
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "talemu",
    about = crate_description!(),
    version = crate_version!(),
)]
struct Args {
    /// Number of emulated machines to run.
    #[arg(long, default_value_t = 1, env = "TALEMU_MACHINES")]
    machines: u32,

    /// Overlay join URL; may carry `?jointoken=<t>` and `?grpc_tunnel=true`.
    #[arg(long, env)]
    sidero_link_api_endpoint: Option<String>,

    /// Overlay join token, overriding the one carried in the URL.
    #[arg(long, env)]
    sidero_link_join_token: Option<String>,

    /// Event sink the machines publish state changes to (`host:port`).
    #[arg(long, env)]
    event_sink_endpoint: Option<String>,

    /// Log receiver machines forward JSON logs to (`tcp://` or `udp://`).
    #[arg(long, env)]
    log_receiver_endpoint: Option<String>,

    /// Alternative configuration carrier: a kernel command line with the
    /// siderolink, event sink and logging parameters.
    #[arg(long, env)]
    kernel_args: Option<String>,

    /// Base directory for per-machine state.
    #[arg(long, default_value = "_out/state", env)]
    state_dir: PathBuf,

    /// First node-management API port; machine N listens on base + N.
    #[arg(long, default_value_t = 50000, env)]
    api_port_base: u16,

    /// Metrics/health listen port.
    #[arg(short, long, default_value_t = 8080, env)]
    port: u16,

    /// Logging filter directive for `tracing_subscriber::filter::EnvFilter`.
    /// Example: "info,talemu_runtime=debug"
    #[arg(long, default_value = "info", env)]
    log_filter: String,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = telemetry::LogFormat::Text, env)]
    log_format: telemetry::LogFormat,
}

#[derive(Clone)]
struct AppState {
    registry: Arc<Mutex<Registry>>,
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let registry = state.registry.lock().expect("registry lock poisoned");
    let mut buffer = String::new();
    match prometheus_client::encoding::text::encode(&mut buffer, &registry) {
        Ok(()) => (
            StatusCode::OK,
            [(
                "content-type",
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            buffer,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("failed to encode metrics: {e:?}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn health() -> impl IntoResponse {
    Json("healthy")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Args = Args::parse();

    // Kernel args are the alternative carrier for the same configuration;
    // explicit flags win.
    let kernel = match &args.kernel_args {
        Some(cmdline) => KernelConfig::from_cmdline(cmdline)?,
        None => KernelConfig::default(),
    };

    let siderolink = match &args.sidero_link_api_endpoint {
        Some(endpoint) => {
            let mut params = SideroLinkParams::from_url(endpoint)?;
            if args.sidero_link_join_token.is_some() {
                params.join_token = args.sidero_link_join_token.clone();
            }
            Some(params)
        }
        None => kernel.siderolink,
    };
    let event_sink_endpoint = args
        .event_sink_endpoint
        .clone()
        .or(kernel.event_sink_endpoint);
    let log_receiver_endpoint = args
        .log_receiver_endpoint
        .clone()
        .or(kernel.log_receiver_endpoint);

    // Log bridge: buffered until the destination is known; here it is known
    // at startup when configured at all.
    let cancel = CancellationToken::new();
    let sink_layer = match &log_receiver_endpoint {
        Some(endpoint) => {
            let (layer, bridge) = logsink::pair("talemu");
            bridge.handle().set_endpoint(SinkAddress::parse(endpoint));
            tokio::spawn(bridge.run(cancel.child_token()));
            Some(layer)
        }
        None => None,
    };

    telemetry::init(&args.log_filter, args.log_format, sink_layer)?;

    info!(
        msg = "starting machine emulator",
        machines = args.machines,
        state_dir = %args.state_dir.display(),
    );

    let mut registry = Registry::default();
    let runtime_metrics = Arc::new(RuntimeMetrics::new());
    runtime_metrics.register_into(&mut registry);
    let state = AppState {
        registry: Arc::new(Mutex::new(registry)),
    };

    let app = Router::new()
        .route("/metrics", get(metrics))
        .route("/health", get(health))
        .with_state(state);
    let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], args.port))).await?;
    {
        let cancel = cancel.child_token();
        tokio::spawn(async move {
            let shutdown = async move { cancel.cancelled().await };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!("metrics server failed: {e}");
            }
        });
    }

    let global = GlobalState::open(args.state_dir.join("global"))?;

    let mut machines = Vec::new();
    for slot in 0..args.machines {
        let mut params = MachineParams::new(
            format!("talemu-{:04}", slot + 1),
            slot,
            args.state_dir.clone(),
        );
        params.siderolink = siderolink.clone();
        params.event_sink_endpoint = event_sink_endpoint.clone();
        params.log_receiver_endpoint = log_receiver_endpoint.clone();
        if args.api_port_base > 0 {
            params.api_bind =
                SocketAddr::from(([127, 0, 0, 1], args.api_port_base.saturating_add(slot as u16)));
        }

        let machine = Machine::new(params, global.clone());
        let metrics = runtime_metrics.clone();
        let machine_cancel = cancel.child_token();
        machines.push(tokio::spawn(async move {
            machine.run(metrics, machine_cancel).await
        }));
    }

    // Cancel everything on the first termination signal.
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(e) => {
                    error!("failed to install SIGTERM handler: {e}");
                    return;
                }
            };
            let mut sigint = match signal(SignalKind::interrupt()) {
                Ok(signal) => signal,
                Err(e) => {
                    error!("failed to install SIGINT handler: {e}");
                    return;
                }
            };
            tokio::select! {
                _ = sigterm.recv() => info!(msg = "received SIGTERM"),
                _ = sigint.recv() => info!(msg = "received SIGINT"),
            }
            cancel.cancel();
        });
    }

    let mut failed = false;
    for machine in machines {
        match machine.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(msg = "machine failed", %e);
                failed = true;
            }
            Err(e) => {
                error!(msg = "machine task panicked", %e);
                failed = true;
            }
        }
    }

    if failed {
        anyhow::bail!("one or more machines failed");
    }
    info!(msg = "shutdown complete");
    Ok(())
}

//! One emulated machine: its state store, controller set, node-management
//! API server and event publisher, wired together and run until cancelled.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use talemu_api::{ApiServer, GrpcCsrSigner};
use talemu_cluster::{
    EtcdMemberController, GlobalState, LocalAffiliateController, NodeIdentityController,
};
use talemu_events::EventPublisher;
use talemu_kubernetes::{KubeconfigController, KubernetesNodeController, StaticPodController};
use talemu_network::{
    AddressStatusController, HostnameConfigController, HostnameStatusController,
    LinkStatusController, NodeAddressController, NodenameController,
};
use talemu_resource::config::{
    EventSinkConfig, KmsgLogConfig, PlatformMetadata, SecurityState, SideroLinkConfig, id,
};
use talemu_resource::network::{AddressSpec, ETH0, LinkSpec, OVERLAY_LINK};
use talemu_resource::runtime::{Disk, ImageSpec, MemoryModule, Processor};
use talemu_resource::{Resource, ResourceSpec};
use talemu_runtime::{ControllerRuntime, RuntimeMetrics, TransformAdapter};
use talemu_secrets::{
    ApiCertController, ApiCertSansController, KubernetesDynamicCertsController,
    KubernetesRootController, OsRootController, RenderSecretsController,
};
use talemu_state::{EventKind, Store, WatchOptions, WriteOptions};
use talemu_util::cmdline::SideroLinkParams;
use talemu_util::dialer::BoundDialer;
use talemu_util::ids::pseudo_ipv6;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum MachineError {
    #[error(transparent)]
    State(#[from] talemu_state::Error),

    #[error(transparent)]
    Runtime(#[from] talemu_runtime::Error),

    #[error(transparent)]
    Tls(#[from] talemu_api::tls::TlsError),

    #[error(transparent)]
    Serve(#[from] talemu_api::server::ServeError),
}

/// Hardware synthesized for a machine.
#[derive(Clone, Debug)]
pub struct HardwareParams {
    pub disks: Vec<(String, u64, String)>,
    pub memory_mib: u64,
    pub cores: u32,
}

impl Default for HardwareParams {
    fn default() -> Self {
        Self {
            disks: vec![("/dev/vda".to_string(), 10 * 1024 * 1024 * 1024, "QEMU-HD".to_string())],
            memory_mib: 2048,
            cores: 2,
        }
    }
}

#[derive(Clone, Debug)]
pub struct MachineParams {
    /// Stable machine id, also the name of the state directory.
    pub id: String,
    /// Slot index, used to derive the synthetic eth0 address.
    pub slot: u32,
    /// Base state directory; the machine lives under `machines/<id>/`.
    pub state_dir: PathBuf,
    pub siderolink: Option<SideroLinkParams>,
    pub event_sink_endpoint: Option<String>,
    pub log_receiver_endpoint: Option<String>,
    /// Node-management bind address; an unspecified port picks an ephemeral
    /// one.
    pub api_bind: SocketAddr,
    pub secure_boot: bool,
    pub hardware: HardwareParams,
}

impl MachineParams {
    pub fn new(id: impl Into<String>, slot: u32, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            slot,
            state_dir: state_dir.into(),
            siderolink: None,
            event_sink_endpoint: None,
            log_receiver_endpoint: None,
            api_bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            secure_boot: false,
            hardware: HardwareParams::default(),
        }
    }

    fn machine_dir(&self) -> PathBuf {
        self.state_dir.join("machines").join(&self.id)
    }

    fn eth0_address(&self) -> String {
        let third = (self.slot / 250) as u8;
        let fourth = (self.slot % 250 + 2) as u8;
        format!("172.20.{third}.{fourth}/24")
    }
}

pub struct Machine {
    params: MachineParams,
    global: GlobalState,
}

impl Machine {
    pub fn new(params: MachineParams, global: GlobalState) -> Self {
        Self { params, global }
    }

    fn seed<T: ResourceSpec>(store: &Store, resource: Resource<T>) -> Result<(), MachineError> {
        match store.create(resource, &WriteOptions::system()) {
            Ok(_) => Ok(()),
            Err(e) if e.is_already_exists() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn seed_store(&self, store: &Store, overlay_address: &str) -> Result<(), MachineError> {
        Self::seed(
            store,
            Resource::new(
                ETH0,
                LinkSpec {
                    name: ETH0.to_string(),
                    up: true,
                    mtu: 1500,
                    kind: "ether".to_string(),
                },
            ),
        )?;
        Self::seed(
            store,
            Resource::new(
                OVERLAY_LINK,
                LinkSpec {
                    name: OVERLAY_LINK.to_string(),
                    up: true,
                    mtu: 1280,
                    kind: "wireguard".to_string(),
                },
            ),
        )?;
        Self::seed(
            store,
            Resource::new(
                format!("{ETH0}/{}", self.params.eth0_address()),
                AddressSpec {
                    address: self.params.eth0_address(),
                    link_name: ETH0.to_string(),
                },
            ),
        )?;
        Self::seed(
            store,
            Resource::new(
                format!("{OVERLAY_LINK}/{overlay_address}/64"),
                AddressSpec {
                    address: format!("{overlay_address}/64"),
                    link_name: OVERLAY_LINK.to_string(),
                },
            ),
        )?;

        Self::seed(
            store,
            Resource::new(
                id::CURRENT,
                PlatformMetadata {
                    platform: "metal".to_string(),
                    hostname: None,
                },
            ),
        )?;
        Self::seed(
            store,
            Resource::new(
                id::CURRENT,
                SecurityState {
                    secure_boot: self.params.secure_boot,
                },
            ),
        )?;

        if let Some(siderolink) = &self.params.siderolink {
            Self::seed(
                store,
                Resource::new(
                    id::CURRENT,
                    SideroLinkConfig {
                        api_endpoint: siderolink.api_endpoint.clone(),
                        join_token: siderolink.join_token.clone(),
                        tunnel: siderolink.tunnel,
                    },
                ),
            )?;
        }
        if let Some(endpoint) = &self.params.event_sink_endpoint {
            Self::seed(
                store,
                Resource::new(
                    id::CURRENT,
                    EventSinkConfig {
                        endpoint: endpoint.clone(),
                    },
                ),
            )?;
        }
        if let Some(url) = &self.params.log_receiver_endpoint {
            Self::seed(
                store,
                Resource::new(id::CURRENT, KmsgLogConfig { url: url.clone() }),
            )?;
        }

        for (dev_path, size_bytes, model) in &self.params.hardware.disks {
            let name = dev_path.trim_start_matches("/dev/").to_string();
            Self::seed(
                store,
                Resource::new(
                    name,
                    Disk {
                        dev_path: dev_path.clone(),
                        size_bytes: *size_bytes,
                        model: model.clone(),
                        system_disk: false,
                    },
                ),
            )?;
        }
        Self::seed(
            store,
            Resource::new(
                "0",
                MemoryModule {
                    size_mib: self.params.hardware.memory_mib,
                },
            ),
        )?;
        Self::seed(
            store,
            Resource::new(
                "0",
                Processor {
                    core_count: self.params.hardware.cores,
                },
            ),
        )?;

        Ok(())
    }

    fn register_controllers(
        &self,
        runtime: &mut ControllerRuntime,
        overlay_ip: IpAddr,
    ) -> Result<(), MachineError> {
        let global = self.global.clone();
        let machine_id = self.params.id.clone();
        let certs_dir = self.params.machine_dir().join("certs");

        runtime.register(super::config::MachineConfigController)?;
        runtime.register(super::version::VersionController)?;
        runtime.register(super::version::ExtensionStatusController)?;
        runtime.register(super::version::KernelCmdlineController)?;
        runtime.register(TransformAdapter(super::reboot::RebootStatusController))?;
        runtime.register(TransformAdapter(super::meta::UniqueTokenController))?;
        runtime.register(super::services::ServiceController::new(global.clone()))?;
        runtime.register(super::status::MachineStatusController)?;

        runtime.register(TransformAdapter(AddressStatusController))?;
        runtime.register(NodeAddressController::new())?;
        runtime.register(HostnameConfigController)?;
        runtime.register(HostnameStatusController::new(
            global.clone(),
            machine_id.clone(),
        ))?;
        runtime.register(TransformAdapter(LinkStatusController))?;
        runtime.register(NodenameController)?;

        runtime.register(OsRootController)?;
        runtime.register(KubernetesRootController)?;
        runtime.register(KubernetesDynamicCertsController)?;
        runtime.register(ApiCertSansController)?;
        runtime.register(ApiCertController::new(Some(Arc::new(GrpcCsrSigner::new(
            BoundDialer::bound_to(overlay_ip),
        )))))?;
        runtime.register(RenderSecretsController::new(certs_dir))?;

        runtime.register(NodeIdentityController)?;
        runtime.register(LocalAffiliateController)?;
        runtime.register(EtcdMemberController::new(global.clone(), machine_id))?;

        runtime.register(StaticPodController::new(global.clone()))?;
        runtime.register(KubernetesNodeController::new(global.clone()))?;
        runtime.register(KubeconfigController::new(global))?;

        Ok(())
    }

    /// Run the machine until cancelled.
    pub async fn run(
        self,
        metrics: Arc<RuntimeMetrics>,
        cancel: CancellationToken,
    ) -> Result<(), MachineError> {
        let machine_dir = self.params.machine_dir();
        let store = Arc::new(Store::open(machine_dir.join("state"))?);

        let overlay_ip = pseudo_ipv6(&self.params.id);
        let overlay_address = overlay_ip.to_string();
        self.seed_store(&store, &overlay_address)?;

        let mut runtime = ControllerRuntime::new(store.clone(), metrics, cancel.child_token());
        self.register_controllers(&mut runtime, IpAddr::from(overlay_ip))?;

        let api = ApiServer::new(
            store.clone(),
            self.global.clone(),
            self.params.id.clone(),
            &[
                overlay_address.clone(),
                "localhost".to_string(),
                "127.0.0.1".to_string(),
            ],
        )?;

        info!(
            msg = "starting machine",
            machine = %self.params.id,
            overlay = %overlay_address,
        );

        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(runtime.run()));

        {
            let api_cancel = cancel.child_token();
            let bind = self.params.api_bind;
            let machine = self.params.id.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = api.serve(bind, api_cancel).await {
                    warn!(msg = "api server stopped", machine = %machine, %e);
                }
            }));
        }

        // The publisher starts once an event sink destination exists, seeded
        // or applied later.
        {
            let store = store.clone();
            let cancel = cancel.child_token();
            let dialer = BoundDialer::bound_to(IpAddr::from(overlay_ip));
            tasks.push(tokio::spawn(async move {
                let Ok(config) = store
                    .watch_for::<EventSinkConfig>(id::CURRENT, |_| true)
                    .await
                else {
                    return;
                };
                EventPublisher::new(store, config.spec.endpoint, dialer)
                    .run(cancel)
                    .await;
            }));
        }

        // Upgrade completion: the staged marker clears when the reboot
        // window closes.
        {
            let store = store.clone();
            let cancel = cancel.child_token();
            tasks.push(tokio::spawn(async move {
                staged_image_sweeper(store, cancel).await;
            }));
        }

        cancel.cancelled().await;
        for task in tasks {
            let _ = task.await;
        }

        info!(msg = "machine stopped", machine = %self.params.id);
        Ok(())
    }
}

/// Clears the staged flag on the installer image when a simulated reboot
/// finishes, making the staged upgrade the running one.
pub async fn staged_image_sweeper(store: Arc<Store>, cancel: CancellationToken) {
    use talemu_resource::runtime::RebootStatus;

    let mut events = store.watch_kind(
        RebootStatus::NAMESPACE,
        RebootStatus::KIND,
        WatchOptions::default(),
    );

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            event = events.recv() => match event {
                Some(event) => event,
                None => return,
            },
        };

        if event.kind != EventKind::Destroyed {
            continue;
        }

        let staged = store
            .get::<ImageSpec>(id::CURRENT)
            .map(|i| i.spec.staged)
            .unwrap_or(false);
        if !staged {
            continue;
        }

        let result = store.modify::<ImageSpec>(id::CURRENT, &WriteOptions::system(), |image| {
            image.spec.staged = false;
            Ok(())
        });
        match result {
            Ok(image) => info!(msg = "staged upgrade applied", image = %image.spec.reference),
            Err(e) => warn!(msg = "failed to finish staged upgrade", %e),
        }
    }
}

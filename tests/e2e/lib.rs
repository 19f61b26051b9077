//! End-to-end harness: a single emulated node with its controller set and
//! the node-management RPC surface, driven in-process.

use std::sync::Arc;
use std::time::Duration;

use talemu_api::machine_service::MachineRpc;
use talemu_api::proto::machine::machine_service_server::MachineService as _;
use talemu_api::proto::machine::{
    ApplyConfigurationRequest, ApplyConfigurationResponse, ApplyMode, BootstrapRequest,
    RebootRequest, ResetRequest, ResetResponse, SystemPartition, UpgradeRequest,
};
use talemu_cluster::{
    EtcdMemberController, GlobalState, LocalAffiliateController, NodeIdentityController,
};
use talemu_kubernetes::KubeconfigController;
use talemu_machine::machine::staged_image_sweeper;
use talemu_machine::{
    MachineConfigController, MachineStatusController, RebootStatusController, ServiceController,
    UniqueTokenController, VersionController,
};
use talemu_network::{
    AddressStatusController, HostnameConfigController, HostnameStatusController,
    LinkStatusController, NodeAddressController, NodenameController,
};
use talemu_resource::config::{PlatformMetadata, SecurityState, id};
use talemu_resource::network::{AddressSpec, ETH0, LinkSpec};
use talemu_resource::runtime::{Disk, MemoryModule, Processor};
use talemu_resource::{Resource, ResourceSpec};
use talemu_runtime::{ControllerRuntime, RuntimeMetrics, TransformAdapter};
use talemu_secrets::{
    ApiCertController, ApiCertSansController, KubernetesRootController, OsRootController,
};
use talemu_state::{Store, WriteOptions};
use tokio_util::sync::CancellationToken;
use tonic::{Request, Status};

#[cfg(test)]
mod test;

pub struct TestNode {
    pub machine_id: String,
    pub store: Arc<Store>,
    pub global: GlobalState,
    pub rpc: MachineRpc,
    cancel: CancellationToken,
    runtime: tokio::task::JoinHandle<()>,
}

impl TestNode {
    pub async fn start(machine_id: &str, global: GlobalState) -> Self {
        let store = Arc::new(Store::in_memory());
        let cancel = CancellationToken::new();

        seed(&store);

        let mut runtime = ControllerRuntime::new(
            store.clone(),
            Arc::new(RuntimeMetrics::new()),
            cancel.child_token(),
        );
        runtime.register(MachineConfigController).unwrap();
        runtime.register(VersionController).unwrap();
        runtime
            .register(TransformAdapter(RebootStatusController))
            .unwrap();
        runtime
            .register(TransformAdapter(UniqueTokenController))
            .unwrap();
        runtime
            .register(ServiceController::new(global.clone()))
            .unwrap();
        runtime.register(MachineStatusController).unwrap();
        runtime
            .register(TransformAdapter(AddressStatusController))
            .unwrap();
        runtime.register(NodeAddressController::new()).unwrap();
        runtime.register(HostnameConfigController).unwrap();
        runtime
            .register(HostnameStatusController::new(
                global.clone(),
                machine_id.to_string(),
            ))
            .unwrap();
        runtime
            .register(TransformAdapter(LinkStatusController))
            .unwrap();
        runtime.register(NodenameController).unwrap();
        runtime.register(NodeIdentityController).unwrap();
        runtime.register(LocalAffiliateController).unwrap();
        runtime
            .register(EtcdMemberController::new(
                global.clone(),
                machine_id.to_string(),
            ))
            .unwrap();
        runtime.register(OsRootController).unwrap();
        runtime.register(KubernetesRootController).unwrap();
        runtime.register(ApiCertSansController).unwrap();
        runtime.register(ApiCertController::new(None)).unwrap();
        runtime
            .register(KubeconfigController::new(global.clone()))
            .unwrap();

        let runtime = tokio::spawn(runtime.run());
        tokio::spawn(staged_image_sweeper(store.clone(), cancel.child_token()));

        let rpc = MachineRpc::new(store.clone(), global.clone(), machine_id);

        Self {
            machine_id: machine_id.to_string(),
            store,
            global,
            rpc,
            cancel,
            runtime,
        }
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.runtime.await;
    }

    pub async fn apply(
        &self,
        yaml: &str,
        mode: ApplyMode,
    ) -> Result<ApplyConfigurationResponse, Status> {
        self.rpc
            .apply_configuration(Request::new(ApplyConfigurationRequest {
                data: yaml.as_bytes().to_vec(),
                mode: mode as i32,
            }))
            .await
            .map(|r| r.into_inner())
    }

    pub async fn bootstrap(&self) -> Result<(), Status> {
        self.rpc
            .bootstrap(Request::new(BootstrapRequest {}))
            .await
            .map(|_| ())
    }

    pub async fn reset(&self) -> Result<ResetResponse, Status> {
        self.rpc
            .reset(Request::new(ResetRequest {
                system_partitions_to_wipe: vec![SystemPartition {
                    label: "STATE".to_string(),
                }],
                graceful: true,
                reboot: false,
            }))
            .await
            .map(|r| r.into_inner())
    }

    pub async fn reboot(&self) -> Result<(), Status> {
        self.rpc
            .reboot(Request::new(RebootRequest {}))
            .await
            .map(|_| ())
    }

    pub async fn upgrade(&self, image: &str) -> Result<(), Status> {
        self.rpc
            .upgrade(Request::new(UpgradeRequest {
                image: image.to_string(),
                stage: false,
            }))
            .await
            .map(|_| ())
    }

    /// Wait up to five seconds for the resource to satisfy the predicate.
    pub async fn eventually<T: ResourceSpec>(
        &self,
        id: &str,
        predicate: impl Fn(&Resource<T>) -> bool,
    ) -> Resource<T> {
        tokio::time::timeout(Duration::from_secs(5), self.store.watch_for::<T>(id, predicate))
            .await
            .unwrap_or_else(|_| panic!("{}/{} did not reach expected state", T::KIND, id))
            .expect("watch failed")
    }

    /// Wait up to five seconds for the resource to disappear.
    pub async fn eventually_gone<T: ResourceSpec>(&self, id: &str) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match self.store.get::<T>(id) {
                    Err(e) if e.is_not_found() => break,
                    _ => tokio::time::sleep(Duration::from_millis(20)).await,
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("{}/{} was not destroyed", T::KIND, id));
    }
}

fn seed(store: &Store) {
    let system = WriteOptions::system();

    store
        .create(
            Resource::new(
                ETH0,
                LinkSpec {
                    name: ETH0.to_string(),
                    up: true,
                    mtu: 1500,
                    kind: "ether".to_string(),
                },
            ),
            &system,
        )
        .unwrap();
    store
        .create(
            Resource::new(
                "eth0/172.20.0.2/24",
                AddressSpec {
                    address: "172.20.0.2/24".to_string(),
                    link_name: ETH0.to_string(),
                },
            ),
            &system,
        )
        .unwrap();
    store
        .create(
            Resource::new(
                id::CURRENT,
                PlatformMetadata {
                    platform: "metal".to_string(),
                    hostname: None,
                },
            ),
            &system,
        )
        .unwrap();
    store
        .create(
            Resource::new(id::CURRENT, SecurityState { secure_boot: false }),
            &system,
        )
        .unwrap();
    store
        .create(
            Resource::new(
                "vda",
                Disk {
                    dev_path: "/dev/vda".to_string(),
                    size_bytes: 10 * 1024 * 1024 * 1024,
                    model: "QEMU-HD".to_string(),
                    system_disk: false,
                },
            ),
            &system,
        )
        .unwrap();
    store
        .create(Resource::new("0", MemoryModule { size_mib: 2048 }), &system)
        .unwrap();
    store
        .create(Resource::new("0", Processor { core_count: 2 }), &system)
        .unwrap();
}

/// A minimal full v1alpha1 configuration document.
pub fn full_config(cluster_id: &str, machine_type: &str) -> String {
    format!(
        "version: v1alpha1\n\
         machine:\n\
         \x20 type: {machine_type}\n\
         \x20 token: abcdef\n\
         \x20 install:\n\
         \x20   disk: /dev/vda\n\
         \x20   image: factory.talos.dev/installer/376567988ad370138ad8b2698212367b8edcb69b5fd68c80be1f2ec7d603b4ba:v1.9.1\n\
         cluster:\n\
         \x20 id: {cluster_id}\n\
         \x20 clusterName: {cluster_id}\n\
         \x20 controlPlane:\n\
         \x20   endpoint: https://172.20.0.2:6443\n"
    )
}

pub const PARTIAL_CONFIG: &str = "\
apiVersion: v1alpha1\n\
kind: EventSinkConfig\n\
endpoint: \"[fdae:41e4:649b:9303::1]:8090\"\n\
---\n\
apiVersion: v1alpha1\n\
kind: KmsgLogConfig\n\
name: omni-kmsg\n\
url: \"tcp://[fdae:41e4:649b:9303::1]:8092\"\n";

//! Machine lifecycle flows: partial/full apply, reboot window, staged
//! upgrades, meta keys, images, services, hostname derivation.

use std::time::Duration;

use futures::StreamExt;
use talemu_api::proto::machine::machine_service_server::MachineService as _;
use talemu_api::proto::machine::{
    ApplyMode, HostnameRequest, ImageListRequest, ImagePullRequest, MetaDeleteRequest,
    MetaWriteRequest, ServiceListRequest, VersionRequest,
};
use talemu_cluster::GlobalState;
use talemu_resource::config::{CompleteMachineConfig, EventSinkConfig, KmsgLogConfig, UniqueToken, id};
use talemu_resource::network::HostnameStatus;
use talemu_resource::runtime::{
    Disk, ImageSpec, MachineStage, MachineStatus, RebootStatus, VersionSpec,
};
use tonic::{Code, Request};

use crate::{PARTIAL_CONFIG, TestNode, full_config};

#[tokio::test]
async fn test_apply_partial_then_full() {
    let global = GlobalState::in_memory();
    let node = TestNode::start("machine-0001", global.clone()).await;

    // Partial configuration: side documents land, no reboot, no counting.
    let response = node.apply(PARTIAL_CONFIG, ApplyMode::Auto).await.unwrap();
    assert_eq!(response.mode, ApplyMode::NoReboot as i32);

    let sink = node.store.get::<EventSinkConfig>(id::CURRENT).unwrap();
    assert_eq!(sink.spec.endpoint, "[fdae:41e4:649b:9303::1]:8090");
    let kmsg = node.store.get::<KmsgLogConfig>(id::CURRENT).unwrap();
    assert_eq!(kmsg.spec.url, "tcp://[fdae:41e4:649b:9303::1]:8092");
    assert!(global.cluster("c1").unwrap().is_none());

    // Full configuration: reboot signaled, counted exactly once.
    let response = node
        .apply(&full_config("c1", "controlplane"), ApplyMode::Auto)
        .await
        .unwrap();
    assert_eq!(response.mode, ApplyMode::Reboot as i32);

    let cluster = global.cluster("c1").unwrap().unwrap();
    assert_eq!(cluster.spec.control_planes, 1);

    // Re-applying the same configuration does not count again.
    node.apply(&full_config("c1", "controlplane"), ApplyMode::Auto)
        .await
        .unwrap();
    let cluster = global.cluster("c1").unwrap().unwrap();
    assert_eq!(cluster.spec.control_planes, 1);

    node.stop().await;
}

#[tokio::test]
async fn test_reboot_lifecycle() {
    let global = GlobalState::in_memory();
    let node = TestNode::start("machine-0001", global).await;

    node.reboot().await.unwrap();

    node.eventually::<RebootStatus>(id::CURRENT, |_| true).await;
    node.eventually::<MachineStatus>(id::CURRENT, |s| s.spec.stage == MachineStage::Rebooting)
        .await;

    // The two second downtime elapses and the status is destroyed.
    tokio::time::sleep(Duration::from_millis(2200)).await;
    node.eventually_gone::<RebootStatus>(id::CURRENT).await;
    node.eventually::<MachineStatus>(id::CURRENT, |s| s.spec.stage != MachineStage::Rebooting)
        .await;

    node.stop().await;
}

#[tokio::test]
async fn test_upgrade_stages_then_applies_after_reboot() {
    let global = GlobalState::in_memory();
    let node = TestNode::start("machine-0001", global).await;

    node.apply(&full_config("c1", "controlplane"), ApplyMode::Auto)
        .await
        .unwrap();
    node.eventually::<VersionSpec>(id::CURRENT, |v| v.spec.version == "v1.9.1")
        .await;

    let err = node.upgrade("not-an-image").await.unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    node.upgrade("factory.talos.dev/installer/0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef:v1.9.2")
        .await
        .unwrap();

    let image = node.store.get::<ImageSpec>(id::CURRENT).unwrap();
    assert!(image.spec.staged);

    // The staged flag clears when the simulated reboot completes, and the
    // version re-resolves from the new image.
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let image = node.store.get::<ImageSpec>(id::CURRENT).unwrap();
            if !image.spec.staged {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("staged upgrade never applied");

    node.eventually::<VersionSpec>(id::CURRENT, |v| v.spec.version == "v1.9.2")
        .await;

    let version = node
        .rpc
        .version(Request::new(VersionRequest {}))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(version.tag, "v1.9.2");

    // Non-factory installers are valid upgrade targets too; the version
    // then resolves from the tag alone.
    node.upgrade("ghcr.io/siderolabs/installer:v1.9.3")
        .await
        .unwrap();
    node.eventually::<VersionSpec>(id::CURRENT, |v| {
        v.spec.version == "v1.9.3" && v.spec.schematic.is_none()
    })
    .await;

    node.stop().await;
}

#[tokio::test]
async fn test_meta_key_unique_token() {
    let global = GlobalState::in_memory();
    let node = TestNode::start("machine-0001", global).await;

    node.rpc
        .meta_write(Request::new(MetaWriteRequest {
            key: 16,
            value: b"token-value".to_vec(),
        }))
        .await
        .unwrap();

    let token = node
        .eventually::<UniqueToken>(id::CURRENT, |t| t.spec.token == "token-value")
        .await;
    assert_eq!(token.spec.token, "token-value");

    node.rpc
        .meta_delete(Request::new(MetaDeleteRequest { key: 16 }))
        .await
        .unwrap();
    node.eventually_gone::<UniqueToken>(id::CURRENT).await;

    node.stop().await;
}

#[tokio::test]
async fn test_image_pull_and_list() {
    let global = GlobalState::in_memory();
    let node = TestNode::start("machine-0001", global).await;

    let err = node
        .rpc
        .image_pull(Request::new(ImagePullRequest {
            reference: "ghcr.io/some/image:v1-bad".to_string(),
        }))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    node.rpc
        .image_pull(Request::new(ImagePullRequest {
            reference: "ghcr.io/some/image:v1".to_string(),
        }))
        .await
        .unwrap();

    let mut stream = node
        .rpc
        .image_list(Request::new(ImageListRequest {}))
        .await
        .unwrap()
        .into_inner();
    let mut references = Vec::new();
    while let Some(item) = stream.next().await {
        references.push(item.unwrap().reference);
    }
    assert_eq!(references, vec!["ghcr.io/some/image:v1".to_string()]);

    node.stop().await;
}

#[tokio::test]
async fn test_service_list_and_machine_status() {
    let global = GlobalState::in_memory();
    let node = TestNode::start("machine-0001", global).await;

    // Maintenance: only apid (plus the synthetic machined entry).
    node.eventually::<talemu_resource::runtime::Service>("apid", |_| true)
        .await;
    let services = node
        .rpc
        .service_list(Request::new(ServiceListRequest {}))
        .await
        .unwrap()
        .into_inner()
        .services;
    let ids: Vec<&str> = services.iter().map(|s| s.id.as_str()).collect();
    assert!(ids.contains(&"apid"));
    assert!(ids.contains(&"machined"));
    assert!(!ids.contains(&"etcd"));

    node.eventually::<MachineStatus>(id::CURRENT, |s| s.spec.stage == MachineStage::Maintenance)
        .await;

    // Configured control plane: etcd and kubelet appear; etcd is healthy
    // only after bootstrap.
    node.apply(&full_config("c1", "controlplane"), ApplyMode::Auto)
        .await
        .unwrap();
    node.eventually::<talemu_resource::runtime::Service>("etcd", |s| s.spec.running)
        .await;
    node.eventually::<MachineStatus>(id::CURRENT, |s| {
        s.spec
            .unmet_conditions
            .iter()
            .any(|c| c.contains("etcd"))
    })
    .await;

    node.bootstrap().await.unwrap();
    node.eventually::<talemu_resource::runtime::Service>("etcd", |s| s.spec.healthy)
        .await;
    node.eventually::<MachineStatus>(id::CURRENT, |s| {
        s.spec.stage == MachineStage::Running && s.spec.ready
    })
    .await;

    node.stop().await;
}

#[tokio::test]
async fn test_hostname_derived_from_config_and_rpc() {
    let global = GlobalState::in_memory();
    let node = TestNode::start("machine-0001", global.clone()).await;

    // Without configuration the default layer derives from the address.
    node.eventually::<HostnameStatus>(id::CURRENT, |h| {
        h.spec.hostname == "talos-172-20-0-2"
    })
    .await;

    let hostname = node
        .rpc
        .hostname(Request::new(HostnameRequest {}))
        .await
        .unwrap()
        .into_inner()
        .hostname;
    assert_eq!(hostname, "talos-172-20-0-2");

    // The configured hostname wins over the derived default.
    let mut config = full_config("c1", "controlplane");
    config = config.replace(
        "  install:",
        "  network:\n    hostname: cp-1\n  install:",
    );
    node.apply(&config, ApplyMode::Auto).await.unwrap();
    node.eventually::<HostnameStatus>(id::CURRENT, |h| h.spec.hostname == "cp-1")
        .await;

    // The chosen hostname lands in the global machine status.
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let hostname = global
                .machine("machine-0001")
                .unwrap()
                .and_then(|m| m.spec.hostname);
            if hostname.as_deref() == Some("cp-1") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("hostname never reached global state");

    node.stop().await;
}

#[tokio::test]
async fn test_system_disk_marked_from_install_stanza() {
    let global = GlobalState::in_memory();
    let node = TestNode::start("machine-0001", global).await;

    node.apply(&full_config("c1", "controlplane"), ApplyMode::Auto)
        .await
        .unwrap();

    node.eventually::<Disk>("vda", |d| d.spec.system_disk).await;

    node.stop().await;
}

#[tokio::test]
async fn test_secrets_issued_for_control_plane() {
    let global = GlobalState::in_memory();
    let node = TestNode::start("machine-0001", global).await;

    node.apply(&full_config("c1", "controlplane"), ApplyMode::Auto)
        .await
        .unwrap();
    node.eventually::<CompleteMachineConfig>(id::CURRENT, |_| true)
        .await;

    let root = node
        .eventually::<talemu_resource::secrets::OsRoot>(id::CURRENT, |r| {
            !r.spec.ca_crt.is_empty()
        })
        .await;
    assert!(root.spec.ca_key.is_some());

    node.eventually::<talemu_resource::secrets::KubernetesRoot>(id::CURRENT, |r| {
        r.spec.admin_kubeconfig.is_some() && r.spec.endpoint.starts_with("https://")
    })
    .await;

    node.eventually::<talemu_resource::secrets::ApiCert>(id::CURRENT, |c| {
        !c.spec.server_crt.is_empty() && c.spec.client_crt.is_some()
    })
    .await;

    node.stop().await;
}

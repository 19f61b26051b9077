//! Cluster membership flows: counting, bootstrap, etcd deny list, reset.

use talemu_api::proto::machine::machine_service_server::MachineService as _;
use talemu_api::proto::machine::{ApplyMode, EtcdMemberListRequest, EtcdRemoveMemberByIdRequest};
use talemu_cluster::GlobalState;
use talemu_resource::config::{CompleteMachineConfig, MachineConfig, id};
use tonic::{Code, Request};

use crate::{TestNode, full_config};

#[tokio::test]
async fn test_cluster_counting_and_bootstrap() {
    let global = GlobalState::in_memory();
    let cp = TestNode::start("machine-0001", global.clone()).await;
    let worker = TestNode::start("machine-0002", global.clone()).await;

    let response = cp
        .apply(&full_config("c1", "controlplane"), ApplyMode::Auto)
        .await
        .unwrap();
    assert_eq!(response.mode, ApplyMode::Reboot as i32);

    worker
        .apply(&full_config("c1", "worker"), ApplyMode::Auto)
        .await
        .unwrap();

    let cluster = global.cluster("c1").unwrap().unwrap();
    assert_eq!(cluster.spec.control_planes, 1);
    assert_eq!(cluster.spec.workers, 1);
    assert!(!cluster.spec.bootstrapped);

    cp.bootstrap().await.unwrap();
    let err = cp.bootstrap().await.unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    let cluster = global.cluster("c1").unwrap().unwrap();
    assert!(cluster.spec.bootstrapped);

    cp.stop().await;
    worker.stop().await;
}

#[tokio::test]
async fn test_bootstrap_unconfigured_rejected() {
    let global = GlobalState::in_memory();
    let node = TestNode::start("machine-0001", global).await;

    let err = node.bootstrap().await.unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    node.stop().await;
}

#[tokio::test]
async fn test_etcd_member_removal_is_idempotent() {
    let global = GlobalState::in_memory();
    let node = TestNode::start("machine-0001", global.clone()).await;

    node.apply(&full_config("c1", "controlplane"), ApplyMode::Auto)
        .await
        .unwrap();

    for _ in 0..2 {
        node.rpc
            .etcd_remove_member_by_id(Request::new(EtcdRemoveMemberByIdRequest { member_id: 42 }))
            .await
            .unwrap();
    }

    let cluster = global.cluster("c1").unwrap().unwrap();
    assert_eq!(
        cluster.spec.deny_etcd_members,
        vec!["2a00000000000000".to_string()]
    );

    node.stop().await;
}

#[tokio::test]
async fn test_etcd_member_list_aggregates_control_planes() {
    let global = GlobalState::in_memory();
    let cp = TestNode::start("machine-0001", global.clone()).await;
    let worker = TestNode::start("machine-0002", global.clone()).await;

    cp.apply(&full_config("c1", "controlplane"), ApplyMode::Auto)
        .await
        .unwrap();
    worker
        .apply(&full_config("c1", "worker"), ApplyMode::Auto)
        .await
        .unwrap();

    // The etcd member id is generated by a controller; give it a moment.
    cp.eventually::<talemu_resource::cluster::EtcdMember>(talemu_resource::cluster::LOCAL, |_| {
        true
    })
    .await;

    let members = loop {
        let members = cp
            .rpc
            .etcd_member_list(Request::new(EtcdMemberListRequest {}))
            .await
            .unwrap()
            .into_inner()
            .members;
        if !members.is_empty() {
            break members;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    };

    // Only the control plane carries an etcd member.
    assert_eq!(members.len(), 1);
    assert_ne!(members[0].id, 0);

    cp.stop().await;
    worker.stop().await;
}

#[tokio::test]
async fn test_reset_round_trip() {
    let global = GlobalState::in_memory();
    let node = TestNode::start("machine-0001", global.clone()).await;

    node.apply(&full_config("c1", "controlplane"), ApplyMode::Auto)
        .await
        .unwrap();
    node.eventually::<CompleteMachineConfig>(id::CURRENT, |_| true)
        .await;

    let response = node.reset().await.unwrap();
    assert!(!response.actor_id.is_empty());

    // The configuration and its derived views are gone.
    assert!(
        node.store
            .get::<MachineConfig>(id::ACTIVE)
            .unwrap_err()
            .is_not_found()
    );
    node.eventually_gone::<CompleteMachineConfig>(id::CURRENT)
        .await;

    // Last member out destroys the cluster record.
    assert!(global.cluster("c1").unwrap().is_none());

    // A fresh apply joins again and counts exactly once.
    node.apply(&full_config("c1", "controlplane"), ApplyMode::Auto)
        .await
        .unwrap();
    let cluster = global.cluster("c1").unwrap().unwrap();
    assert_eq!(cluster.spec.control_planes, 1);
    assert_eq!(cluster.spec.workers, 0);

    node.stop().await;
}

#[tokio::test]
async fn test_cluster_status_gets_kubeconfig() {
    let global = GlobalState::in_memory();
    let node = TestNode::start("machine-0001", global.clone()).await;

    node.apply(&full_config("c1", "controlplane"), ApplyMode::Auto)
        .await
        .unwrap();

    let kubeconfig = tokio::time::timeout(std::time::Duration::from_secs(10), async {
        loop {
            if let Some(cluster) = global.cluster("c1").unwrap() {
                if let Some(kubeconfig) = cluster.spec.kubeconfig {
                    break kubeconfig;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("kubeconfig never published");
    assert!(kubeconfig.contains("current-context: admin@c1"));

    node.stop().await;
}

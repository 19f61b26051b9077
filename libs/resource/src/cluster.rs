//! Cluster membership resources. Per-machine affiliate state lives in the
//! `cluster` namespace; cross-machine records live in `global` and are backed
//! by the shared global state.

use serde::{Deserialize, Serialize};

use crate::config::{MachineType, spec};
use crate::ns;

/// Label marking the machine's own affiliate.
pub const LOCAL_LABEL: &str = "local";
/// Label carrying the cluster id on machine-scoped resources.
pub const CLUSTER_ID_LABEL: &str = "cluster-id";
/// Label carrying the machine role on global machine statuses.
pub const ROLE_LABEL: &str = "role";

pub const LOCAL: &str = "local";

/// Node identity: 32 random bytes, base62-encoded. Generated once a complete
/// configuration exists.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub node_id: String,
}
spec!(Identity, ns::CLUSTER, "Identity");

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryConfig {
    pub discovery_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_endpoint: Option<String>,
}
spec!(DiscoveryConfig, ns::CLUSTER, "DiscoveryConfig");

/// The machine as seen by cluster discovery.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Affiliate {
    pub node_id: String,
    pub hostname: String,
    pub nodename: String,
    pub machine_type: MachineType,
    pub operating_system: String,
    pub addresses: Vec<String>,
}
spec!(Affiliate, ns::CLUSTER, "Affiliate");

/// Emulated etcd membership of this machine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EtcdMember {
    /// 64-bit member id, low-endian hex.
    pub member_id: String,
}
spec!(EtcdMember, ns::CLUSTER, "EtcdMember");

/// Cross-machine cluster record, keyed by cluster id.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    pub bootstrapped: bool,
    pub control_planes: u32,
    pub workers: u32,
    /// Ejected etcd member ids; append-only for the lifetime of the record.
    pub deny_etcd_members: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<String>,
}
spec!(ClusterStatus, ns::GLOBAL, "ClusterStatus");

impl ClusterStatus {
    pub fn machine_count(&self) -> u32 {
        self.control_planes + self.workers
    }
}

/// Cross-machine view of one machine, keyed by node id. Role and cluster id
/// are carried as metadata labels.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterMachineStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub addresses: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etcd_member_id: Option<String>,
}
spec!(ClusterMachineStatus, ns::GLOBAL, "ClusterMachineStatus");

//! Runtime namespace resources: machine lifecycle, services, hardware
//! inventory.

use serde::{Deserialize, Serialize};

use crate::config::spec;
use crate::ns;

/// Managed service ids.
pub mod service {
    pub const APID: &str = "apid";
    pub const ETCD: &str = "etcd";
    pub const KUBELET: &str = "kubelet";
}

/// Overall machine lifecycle stage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MachineStage {
    #[default]
    Unknown,
    Maintenance,
    Booting,
    Installing,
    Rebooting,
    Running,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    pub stage: MachineStage,
    pub ready: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unmet_conditions: Vec<String>,
}
spec!(MachineStatus, ns::RUNTIME, "MachineStatus");

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionStatus {
    pub name: String,
    pub version: String,
}
spec!(ExtensionStatus, ns::RUNTIME, "ExtensionStatus");

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountStatus {
    pub target: String,
    pub filesystem: String,
}
spec!(MountStatus, ns::RUNTIME, "MountStatus");

/// Requested reboot; recreated on every `Reboot` RPC so `updated` reflects
/// the reboot start.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebootSpec {
    pub downtime_secs: u64,
}
spec!(RebootSpec, ns::RUNTIME, "Reboot");

/// Present while the simulated reboot is in progress.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebootStatus {
    pub downtime_secs: u64,
}
spec!(RebootStatus, ns::RUNTIME, "RebootStatus");

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionSpec {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schematic: Option<String>,
}
spec!(VersionSpec, ns::RUNTIME, "Version");

impl VersionSpec {
    /// Reported when no installer image has resolved yet.
    pub const FALLBACK: &'static str = "v1.9.1";
}

/// Installer image the machine runs or is upgrading to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageSpec {
    pub reference: String,
    /// Set while an upgrade is staged but the machine has not rebooted yet.
    #[serde(default)]
    pub staged: bool,
}
spec!(ImageSpec, ns::RUNTIME, "Image");

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedImage {
    pub reference: String,
}
spec!(CachedImage, ns::RUNTIME, "CachedImage");

/// State of one managed component.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub running: bool,
    pub healthy: bool,
}
spec!(Service, ns::RUNTIME, "Service");

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Disk {
    pub dev_path: String,
    pub size_bytes: u64,
    pub model: String,
    #[serde(default)]
    pub system_disk: bool,
}
spec!(Disk, ns::RUNTIME, "Disk");

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryModule {
    pub size_mib: u64,
}
spec!(MemoryModule, ns::RUNTIME, "MemoryModule");

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Processor {
    pub core_count: u32,
}
spec!(Processor, ns::RUNTIME, "Processor");

/// Event publisher bookkeeping: last version published per watched kind. The
/// id is the watched kind name.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublisherStatus {
    pub last_sent_version: u64,
}
spec!(PublisherStatus, ns::RUNTIME, "PublisherStatus");

//! Configuration namespace resources. Seeded by the machine bootstrap and the
//! `ApplyConfiguration` RPC, consumed by nearly every controller.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ns;

/// Singleton resource ids used across namespaces.
pub mod id {
    /// The applied machine configuration.
    pub const ACTIVE: &str = "active";
    /// Generic singleton id.
    pub const CURRENT: &str = "current";
}

macro_rules! spec {
    ($ty:ty, $ns:expr, $kind:literal) => {
        impl $crate::ResourceSpec for $ty {
            const KIND: &'static str = $kind;
            const NAMESPACE: &'static str = $ns;
        }
    };
}
pub(crate) use spec;

/// Role of the machine within its cluster.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MachineType {
    #[default]
    Unknown,
    ControlPlane,
    Worker,
}

impl MachineType {
    pub fn is_control_plane(self) -> bool {
        self == MachineType::ControlPlane
    }
}

impl fmt::Display for MachineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MachineType::Unknown => f.write_str("unknown"),
            MachineType::ControlPlane => f.write_str("controlplane"),
            MachineType::Worker => f.write_str("worker"),
        }
    }
}

/// The applied machine configuration document, kept verbatim. Controllers
/// parse the pieces they need out of `raw`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineConfig {
    pub raw: String,
}
spec!(MachineConfig, ns::CONFIG, "MachineConfig");

/// Derived view of the machine configuration. Present iff the active
/// configuration exists and its machine stanza is non-empty.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteMachineConfig {
    pub raw: String,
}
spec!(CompleteMachineConfig, ns::CONFIG, "CompleteMachineConfig");

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineTypeSpec {
    pub machine_type: MachineType,
}
spec!(MachineTypeSpec, ns::CONFIG, "MachineType");

/// Destination for the event publisher.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSinkConfig {
    pub endpoint: String,
}
spec!(EventSinkConfig, ns::CONFIG, "EventSinkConfig");

/// Overlay link join parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SideroLinkConfig {
    pub api_endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_token: Option<String>,
    #[serde(default)]
    pub tunnel: bool,
}
spec!(SideroLinkConfig, ns::CONFIG, "SideroLinkConfig");

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UniqueToken {
    pub token: String,
}
spec!(UniqueToken, ns::CONFIG, "UniqueToken");

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformMetadata {
    pub platform: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}
spec!(PlatformMetadata, ns::CONFIG, "PlatformMetadata");

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityState {
    pub secure_boot: bool,
}
spec!(SecurityState, ns::CONFIG, "SecurityState");

/// Trust endpoints workers send certificate signing requests to.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinEndpoints {
    pub endpoints: Vec<String>,
}
spec!(JoinEndpoints, ns::CONFIG, "JoinEndpoints");

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelCmdline {
    pub cmdline: String,
}
spec!(KernelCmdline, ns::CONFIG, "KernelCmdline");

/// Destination for forwarded kernel/machine logs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KmsgLogConfig {
    pub url: String,
}
spec!(KmsgLogConfig, ns::CONFIG, "KmsgLogConfig");

/// Node-level opaque state keyed by a small integer tag.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaKey {
    pub tag: u8,
    pub value: String,
}
spec!(MetaKey, ns::CONFIG, "MetaKey");

impl MetaKey {
    /// Tag carrying the unique machine token.
    pub const UNIQUE_TOKEN_TAG: u8 = 16;

    pub fn id_for_tag(tag: u8) -> String {
        format!("0x{tag:02x}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_key_id() {
        assert_eq!(MetaKey::id_for_tag(16), "0x10");
        assert_eq!(MetaKey::id_for_tag(0), "0x00");
    }

    #[test]
    fn test_machine_type_display() {
        assert_eq!(MachineType::ControlPlane.to_string(), "controlplane");
        assert_eq!(MachineType::Worker.to_string(), "worker");
    }
}

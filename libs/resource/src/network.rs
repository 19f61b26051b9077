//! Network namespace resources. The emulated machine carries one synthetic
//! `eth0` plus the overlay link toward the orchestrator.

use serde::{Deserialize, Serialize};

use crate::config::spec;
use crate::ns;

pub const ETH0: &str = "eth0";
pub const OVERLAY_LINK: &str = "siderolink";

/// Node-address ids.
pub mod node_address {
    pub const DEFAULT: &str = "default";
    pub const CURRENT: &str = "current";
    pub const FILTERED: &str = "filtered-no-k8s";
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressSpec {
    /// CIDR notation, e.g. `172.20.0.2/24`.
    pub address: String,
    pub link_name: String,
}
spec!(AddressSpec, ns::NETWORK, "AddressSpec");

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressStatus {
    pub address: String,
    pub link_name: String,
}
spec!(AddressStatus, ns::NETWORK, "AddressStatus");

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkSpec {
    pub name: String,
    pub up: bool,
    pub mtu: u32,
    pub kind: String,
}
spec!(LinkSpec, ns::NETWORK, "LinkSpec");

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkStatus {
    pub name: String,
    pub up: bool,
    pub mtu: u32,
    pub kind: String,
}
spec!(LinkStatus, ns::NETWORK, "LinkStatus");

/// Configuration layer a hostname spec originates from. Higher layers win.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConfigLayer {
    Default,
    Platform,
    Configuration,
}

impl ConfigLayer {
    pub fn id(self) -> &'static str {
        match self {
            ConfigLayer::Default => "default",
            ConfigLayer::Platform => "platform",
            ConfigLayer::Configuration => "configuration",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostnameSpec {
    pub hostname: String,
    #[serde(default)]
    pub domainname: String,
    pub layer: ConfigLayer,
}
spec!(HostnameSpec, ns::NETWORK, "HostnameSpec");

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostnameStatus {
    pub hostname: String,
    #[serde(default)]
    pub domainname: String,
}
spec!(HostnameStatus, ns::NETWORK, "HostnameStatus");

impl HostnameStatus {
    pub fn fqdn(&self) -> String {
        if self.domainname.is_empty() {
            self.hostname.clone()
        } else {
            format!("{}.{}", self.hostname, self.domainname)
        }
    }
}

/// Aggregated address list; one resource per view (default, current,
/// filtered).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeAddress {
    /// Plain addresses without prefix length, ordered.
    pub addresses: Vec<String>,
}
spec!(NodeAddress, ns::NETWORK, "NodeAddress");

impl NodeAddress {
    pub fn first(&self) -> Option<&str> {
        self.addresses.first().map(String::as_str)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolver {
    pub servers: Vec<String>,
}
spec!(Resolver, ns::NETWORK, "Resolver");

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeServer {
    pub servers: Vec<String>,
}
spec!(TimeServer, ns::NETWORK, "TimeServer");

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub destination: String,
    pub gateway: String,
    pub link_name: String,
}
spec!(Route, ns::NETWORK, "Route");

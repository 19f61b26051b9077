//! Machine configuration documents: the YAML carried by `MachineConfig.raw`.
//!
//! A configuration blob is a multi-document YAML stream: at most one
//! v1alpha1 machine document (recognized by its `version` field) plus any
//! number of side documents (recognized by `kind`).

use serde::{Deserialize, Serialize};

use crate::config::{MachineConfig, MachineType};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("malformed configuration document: {0}")]
    Malformed(#[source] serde_yaml::Error),

    #[error("unknown document kind {0:?}")]
    UnknownKind(String),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PemPair {
    #[serde(default)]
    pub crt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallStanza {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Size/model matchers used when no disk is named.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_selector: Option<DiskSelector>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskSelector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStanza {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeaturesStanza {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovery: Option<bool>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineStanza {
    #[serde(rename = "type", default)]
    pub machine_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<PemPair>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cert_sans: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install: Option<InstallStanza>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkStanza>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<FeaturesStanza>,
}

impl MachineStanza {
    pub fn machine_type(&self) -> MachineType {
        match self.machine_type.as_str() {
            "controlplane" | "init" => MachineType::ControlPlane,
            "worker" | "join" => MachineType::Worker,
            _ => MachineType::Unknown,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneStanza {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStanza {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane: Option<ControlPlaneStanza>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<PemPair>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregator_ca: Option<PemPair>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<PemPair>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// The main v1alpha1 document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine: Option<MachineStanza>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<ClusterStanza>,
}

/// Side documents that may accompany (or replace) the main document.
#[derive(Clone, Debug, PartialEq)]
pub enum SideDocument {
    EventSink { endpoint: String },
    KmsgLog { url: String },
    SideroLink { api_url: String },
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParsedConfig {
    pub document: Option<ConfigDocument>,
    pub side: Vec<SideDocument>,
}

impl ParsedConfig {
    /// The configuration is complete iff the machine stanza is present and
    /// non-empty.
    pub fn is_complete(&self) -> bool {
        self.document
            .as_ref()
            .and_then(|d| d.machine.as_ref())
            .is_some_and(|m| *m != MachineStanza::default())
    }

    pub fn machine_type(&self) -> MachineType {
        self.document
            .as_ref()
            .and_then(|d| d.machine.as_ref())
            .map_or(MachineType::Unknown, MachineStanza::machine_type)
    }

    pub fn cluster_id(&self) -> Option<&str> {
        self.document
            .as_ref()
            .and_then(|d| d.cluster.as_ref())
            .and_then(|c| c.id.as_deref())
    }

    pub fn install(&self) -> Option<&InstallStanza> {
        self.document
            .as_ref()
            .and_then(|d| d.machine.as_ref())
            .and_then(|m| m.install.as_ref())
    }

    pub fn hostname(&self) -> Option<&str> {
        self.document
            .as_ref()
            .and_then(|d| d.machine.as_ref())
            .and_then(|m| m.network.as_ref())
            .and_then(|n| n.hostname.as_deref())
    }

    pub fn discovery_enabled(&self) -> bool {
        self.document
            .as_ref()
            .and_then(|d| d.machine.as_ref())
            .and_then(|m| m.features.as_ref())
            .and_then(|f| f.discovery)
            .unwrap_or(false)
    }
}

/// Parse a multi-document YAML configuration blob.
pub fn parse(raw: &str) -> Result<ParsedConfig, Error> {
    use serde::Deserialize as _;

    let mut parsed = ParsedConfig::default();

    for document in serde_yaml::Deserializer::from_str(raw) {
        let value = serde_yaml::Value::deserialize(document).map_err(Error::Malformed)?;
        if value.is_null() {
            continue;
        }

        match value.get("kind").and_then(|k| k.as_str()) {
            Some("EventSinkConfig") => {
                let endpoint = value
                    .get("endpoint")
                    .and_then(|e| e.as_str())
                    .unwrap_or_default()
                    .to_string();
                parsed.side.push(SideDocument::EventSink { endpoint });
            }
            Some("KmsgLogConfig") => {
                let url = value
                    .get("url")
                    .and_then(|u| u.as_str())
                    .unwrap_or_default()
                    .to_string();
                parsed.side.push(SideDocument::KmsgLog { url });
            }
            Some("SideroLinkConfig") => {
                let api_url = value
                    .get("apiUrl")
                    .and_then(|u| u.as_str())
                    .unwrap_or_default()
                    .to_string();
                parsed.side.push(SideDocument::SideroLink { api_url });
            }
            Some(other) => return Err(Error::UnknownKind(other.to_string())),
            None => {
                let document: ConfigDocument =
                    serde_yaml::from_value(value).map_err(Error::Malformed)?;
                parsed.document = Some(document);
            }
        }
    }

    Ok(parsed)
}

impl MachineConfig {
    pub fn parse(&self) -> Result<ParsedConfig, Error> {
        parse(&self.raw)
    }
}

impl crate::config::CompleteMachineConfig {
    pub fn parse(&self) -> Result<ParsedConfig, Error> {
        parse(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
version: v1alpha1
machine:
  type: controlplane
  token: abcdef
  install:
    disk: /dev/vda
    image: factory.talos.dev/installer/376567988ad370138ad8b2698212367b8edcb69b5fd68c80be1f2ec7d603b4ba:v1.9.1
  network:
    hostname: cp-1
cluster:
  id: c1
  clusterName: demo
  controlPlane:
    endpoint: https://10.5.0.2:6443
"#;

    const PARTIAL: &str = r#"
apiVersion: v1alpha1
kind: EventSinkConfig
endpoint: "[fdae:41e4:649b:9303::1]:8090"
---
apiVersion: v1alpha1
kind: KmsgLogConfig
name: omni-kmsg
url: "tcp://[fdae:41e4:649b:9303::1]:8092"
"#;

    #[test]
    fn test_parse_full_document() {
        let parsed = parse(FULL).unwrap();
        assert!(parsed.is_complete());
        assert_eq!(parsed.machine_type(), MachineType::ControlPlane);
        assert_eq!(parsed.cluster_id(), Some("c1"));
        assert_eq!(parsed.hostname(), Some("cp-1"));
        assert_eq!(
            parsed.install().and_then(|i| i.disk.as_deref()),
            Some("/dev/vda")
        );
    }

    #[test]
    fn test_parse_partial_side_documents() {
        let parsed = parse(PARTIAL).unwrap();
        assert!(!parsed.is_complete());
        assert!(parsed.document.is_none());
        assert_eq!(parsed.side.len(), 2);
        assert!(matches!(
            &parsed.side[0],
            SideDocument::EventSink { endpoint } if endpoint == "[fdae:41e4:649b:9303::1]:8090"
        ));
        assert!(matches!(
            &parsed.side[1],
            SideDocument::KmsgLog { url } if url == "tcp://[fdae:41e4:649b:9303::1]:8092"
        ));
    }

    #[test]
    fn test_empty_machine_stanza_is_incomplete() {
        let parsed = parse("version: v1alpha1\ncluster:\n  id: c1\n").unwrap();
        assert!(!parsed.is_complete());
    }

    #[test]
    fn test_unknown_kind_rejected() {
        assert!(matches!(
            parse("kind: Mystery\n"),
            Err(Error::UnknownKind(_))
        ));
    }
}

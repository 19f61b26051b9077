//! Resource model for the emulated machine state.
//!
//! Every piece of machine state is a [`Resource`]: metadata identifying it by
//! `(namespace, kind, id)` plus a typed, serializable spec. Specs are plain
//! serde structs; the [`registry::TypeRegistry`] maps kind names back to
//! decoders for the dynamic surfaces (journal replay, the typed-state gRPC
//! service).

pub mod cluster;
pub mod config;
pub mod document;
pub mod k8s;
pub mod metadata;
pub mod network;
pub mod registry;
pub mod runtime;
pub mod secrets;

pub use metadata::{LabelQuery, LabelTerm, Metadata, Phase, ResourceRef};

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Well-known namespaces. `GLOBAL` is cross-machine and backed by the shared
/// global state; everything else is per-machine.
pub mod ns {
    pub const CONFIG: &str = "config";
    pub const NETWORK: &str = "network";
    pub const SECRETS: &str = "secrets";
    pub const K8S: &str = "k8s";
    pub const CLUSTER: &str = "cluster";
    pub const RUNTIME: &str = "runtime";
    pub const GLOBAL: &str = "global";
}

/// A typed resource spec. `KIND` is the wire name of the resource type and
/// `NAMESPACE` the namespace all resources of this type live in.
pub trait ResourceSpec:
    Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const KIND: &'static str;
    const NAMESPACE: &'static str;
}

/// A resource with a statically known spec type.
#[derive(Clone, Debug, PartialEq)]
pub struct Resource<T> {
    pub metadata: Metadata,
    pub spec: T,
}

impl<T: ResourceSpec> Resource<T> {
    pub fn new(id: impl Into<String>, spec: T) -> Self {
        Self {
            metadata: Metadata::new(T::NAMESPACE, T::KIND, id),
            spec,
        }
    }

    pub fn reference(&self) -> ResourceRef {
        self.metadata.reference()
    }

    /// Erase the spec type. Fails only if the spec cannot be represented as
    /// JSON, which would be a bug in the spec definition.
    pub fn into_any(self) -> Result<AnyResource, Error> {
        Ok(AnyResource {
            metadata: self.metadata,
            spec: serde_json::to_value(&self.spec)
                .map_err(|e| Error::Encode(T::KIND.to_string(), e))?,
        })
    }
}

/// A resource with its spec held as raw JSON. This is the store's internal
/// representation and the payload of watch events.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AnyResource {
    pub metadata: Metadata,
    pub spec: serde_json::Value,
}

impl AnyResource {
    pub fn reference(&self) -> ResourceRef {
        self.metadata.reference()
    }

    pub fn typed<T: ResourceSpec>(&self) -> Result<Resource<T>, Error> {
        if self.metadata.kind != T::KIND {
            return Err(Error::KindMismatch {
                expected: T::KIND,
                found: self.metadata.kind.clone(),
            });
        }

        Ok(Resource {
            metadata: self.metadata.clone(),
            spec: serde_json::from_value(self.spec.clone())
                .map_err(|e| Error::Decode(T::KIND.to_string(), e))?,
        })
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to encode {0} spec: {1}")]
    Encode(String, #[source] serde_json::Error),

    #[error("failed to decode {0} spec: {1}")]
    Decode(String, #[source] serde_json::Error),

    #[error("kind mismatch: expected {expected}, found {found}")]
    KindMismatch {
        expected: &'static str,
        found: String,
    },

    #[error("unknown resource kind {0:?} in namespace {1:?}")]
    UnknownKind(String, String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RebootSpec;

    #[test]
    fn test_any_round_trip() {
        let reboot = Resource::new("current", RebootSpec { downtime_secs: 2 });
        let any = reboot.clone().into_any().unwrap();
        assert_eq!(any.metadata.kind, RebootSpec::KIND);
        assert_eq!(any.metadata.namespace, ns::RUNTIME);

        let back: Resource<RebootSpec> = any.typed().unwrap();
        assert_eq!(back, reboot);
    }

    #[test]
    fn test_typed_rejects_wrong_kind() {
        let reboot = Resource::new("current", RebootSpec { downtime_secs: 2 });
        let any = reboot.into_any().unwrap();
        assert!(any.typed::<crate::runtime::VersionSpec>().is_err());
    }
}

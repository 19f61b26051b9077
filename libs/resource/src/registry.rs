//! Type registry: maps resource kind names to their namespace and decoder so
//! dynamic surfaces (journal replay, the typed-state service) can validate
//! payloads they did not construct.

use std::collections::BTreeMap;

use crate::{AnyResource, Error, ResourceSpec, cluster, config, k8s, network, runtime, secrets};

type Validator = fn(&serde_json::Value) -> Result<(), serde_json::Error>;

struct TypeEntry {
    namespace: &'static str,
    validate: Validator,
}

/// Registry of every resource kind the emulator understands.
pub struct TypeRegistry {
    entries: BTreeMap<&'static str, TypeEntry>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    pub fn register<T: ResourceSpec>(&mut self) {
        fn validate<T: ResourceSpec>(value: &serde_json::Value) -> Result<(), serde_json::Error> {
            serde_json::from_value::<T>(value.clone()).map(|_| ())
        }

        self.entries.insert(
            T::KIND,
            TypeEntry {
                namespace: T::NAMESPACE,
                validate: validate::<T>,
            },
        );
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.entries.contains_key(kind)
    }

    pub fn namespace_of(&self, kind: &str) -> Option<&'static str> {
        self.entries.get(kind).map(|e| e.namespace)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.keys().copied()
    }

    /// Check that the resource's kind is known, lives in the namespace it
    /// claims, and that its spec decodes.
    pub fn validate(&self, resource: &AnyResource) -> Result<(), Error> {
        let entry = self.entries.get(resource.metadata.kind.as_str()).ok_or_else(|| {
            Error::UnknownKind(
                resource.metadata.kind.clone(),
                resource.metadata.namespace.clone(),
            )
        })?;

        if entry.namespace != resource.metadata.namespace {
            return Err(Error::UnknownKind(
                resource.metadata.kind.clone(),
                resource.metadata.namespace.clone(),
            ));
        }

        (entry.validate)(&resource.spec)
            .map_err(|e| Error::Decode(resource.metadata.kind.clone(), e))
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        emulator_registry()
    }
}

/// Registry preloaded with every kind the emulator serves.
pub fn emulator_registry() -> TypeRegistry {
    let mut r = TypeRegistry::new();

    r.register::<config::MachineConfig>();
    r.register::<config::CompleteMachineConfig>();
    r.register::<config::MachineTypeSpec>();
    r.register::<config::EventSinkConfig>();
    r.register::<config::SideroLinkConfig>();
    r.register::<config::UniqueToken>();
    r.register::<config::PlatformMetadata>();
    r.register::<config::SecurityState>();
    r.register::<config::JoinEndpoints>();
    r.register::<config::KernelCmdline>();
    r.register::<config::KmsgLogConfig>();
    r.register::<config::MetaKey>();

    r.register::<network::AddressSpec>();
    r.register::<network::AddressStatus>();
    r.register::<network::LinkSpec>();
    r.register::<network::LinkStatus>();
    r.register::<network::HostnameSpec>();
    r.register::<network::HostnameStatus>();
    r.register::<network::NodeAddress>();
    r.register::<network::Resolver>();
    r.register::<network::TimeServer>();
    r.register::<network::Route>();

    r.register::<secrets::OsRoot>();
    r.register::<secrets::KubernetesRoot>();
    r.register::<secrets::KubernetesDynamicCerts>();
    r.register::<secrets::ApiCert>();
    r.register::<secrets::CertSans>();

    r.register::<k8s::Nodename>();
    r.register::<k8s::StaticPod>();
    r.register::<k8s::SecretsStatus>();

    r.register::<cluster::Identity>();
    r.register::<cluster::DiscoveryConfig>();
    r.register::<cluster::Affiliate>();
    r.register::<cluster::EtcdMember>();
    r.register::<cluster::ClusterStatus>();
    r.register::<cluster::ClusterMachineStatus>();

    r.register::<runtime::MachineStatus>();
    r.register::<runtime::ExtensionStatus>();
    r.register::<runtime::MountStatus>();
    r.register::<runtime::RebootSpec>();
    r.register::<runtime::RebootStatus>();
    r.register::<runtime::VersionSpec>();
    r.register::<runtime::ImageSpec>();
    r.register::<runtime::CachedImage>();
    r.register::<runtime::Service>();
    r.register::<runtime::Disk>();
    r.register::<runtime::MemoryModule>();
    r.register::<runtime::Processor>();
    r.register::<runtime::PublisherStatus>();

    r
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Resource;

    #[test]
    fn test_validates_known_kind() {
        let registry = emulator_registry();
        let any = Resource::new("current", runtime::RebootSpec { downtime_secs: 2 })
            .into_any()
            .unwrap();
        registry.validate(&any).unwrap();
    }

    #[test]
    fn test_rejects_unknown_kind() {
        let registry = emulator_registry();
        let mut any = Resource::new("current", runtime::RebootSpec { downtime_secs: 2 })
            .into_any()
            .unwrap();
        any.metadata.kind = "Bogus".to_string();
        assert!(registry.validate(&any).is_err());
    }

    #[test]
    fn test_rejects_namespace_mismatch() {
        let registry = emulator_registry();
        let mut any = Resource::new("current", runtime::RebootSpec { downtime_secs: 2 })
            .into_any()
            .unwrap();
        any.metadata.namespace = "network".to_string();
        assert!(registry.validate(&any).is_err());
    }

    #[test]
    fn test_rejects_bad_spec() {
        let registry = emulator_registry();
        let mut any = Resource::new("current", runtime::RebootSpec { downtime_secs: 2 })
            .into_any()
            .unwrap();
        any.spec = serde_json::json!({"downtimeSecs": "not-a-number"});
        assert!(registry.validate(&any).is_err());
    }
}

//! Shared global state: cluster records and cross-machine machine statuses.
//! One instance is shared by every machine in the process; access is keyed
//! by cluster id and node id.

use std::path::PathBuf;
use std::sync::Arc;

use talemu_resource::cluster::{CLUSTER_ID_LABEL, ClusterMachineStatus, ClusterStatus, ROLE_LABEL};
use talemu_resource::config::MachineType;
use talemu_resource::{LabelQuery, Resource, ResourceRef, ResourceSpec};
use talemu_state::{Error, Result, Store, WriteOptions};
use tracing::info;

#[derive(Clone)]
pub struct GlobalState {
    store: Arc<Store>,
}

impl GlobalState {
    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(Store::in_memory()),
        }
    }

    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            store: Arc::new(Store::open(dir)?),
        })
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn cluster(&self, cluster_id: &str) -> Result<Option<Resource<ClusterStatus>>> {
        match self.store.get::<ClusterStatus>(cluster_id) {
            Ok(status) => Ok(Some(status)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Record a machine joining a cluster, creating the cluster record on
    /// first join and bumping the role count.
    pub fn machine_joined(&self, cluster_id: &str, machine_type: MachineType) -> Result<()> {
        if self.cluster(cluster_id)?.is_none() {
            match self.store.create(
                Resource::new(cluster_id, ClusterStatus::default()),
                &WriteOptions::system(),
            ) {
                Ok(_) => info!(msg = "new cluster", cluster = cluster_id),
                Err(e) if e.is_already_exists() => {}
                Err(e) => return Err(e),
            }
        }

        self.store
            .modify::<ClusterStatus>(cluster_id, &WriteOptions::system(), |status| {
                match machine_type {
                    MachineType::Worker => status.spec.workers += 1,
                    _ => status.spec.control_planes += 1,
                }
                Ok(())
            })?;
        Ok(())
    }

    /// Record a machine leaving; the cluster record is destroyed when the
    /// last machine is gone.
    pub fn machine_left(&self, cluster_id: &str, machine_type: MachineType) -> Result<()> {
        let status = self
            .store
            .modify::<ClusterStatus>(cluster_id, &WriteOptions::system(), |status| {
                match machine_type {
                    MachineType::Worker => {
                        status.spec.workers = status.spec.workers.saturating_sub(1);
                    }
                    _ => {
                        status.spec.control_planes = status.spec.control_planes.saturating_sub(1);
                    }
                }
                Ok(())
            })?;

        if status.spec.machine_count() == 0 {
            info!(msg = "last machine left, destroying cluster", cluster = cluster_id);
            self.store
                .destroy(&status.reference(), &WriteOptions::system())?;
        }
        Ok(())
    }

    /// Mark the cluster bootstrapped. Fails with invalid-argument when it
    /// already is.
    pub fn bootstrap(&self, cluster_id: &str) -> Result<()> {
        self.store
            .modify::<ClusterStatus>(cluster_id, &WriteOptions::system(), |status| {
                if status.spec.bootstrapped {
                    return Err(Error::InvalidArgument(format!(
                        "cluster {cluster_id} is already bootstrapped"
                    )));
                }
                status.spec.bootstrapped = true;
                Ok(())
            })?;
        Ok(())
    }

    /// Append an ejected etcd member id. Idempotent: the deny list holds
    /// each id once and only grows.
    pub fn deny_etcd_member(&self, cluster_id: &str, member_id: &str) -> Result<()> {
        self.store
            .modify::<ClusterStatus>(cluster_id, &WriteOptions::system(), |status| {
                if !status.spec.deny_etcd_members.iter().any(|m| m == member_id) {
                    status.spec.deny_etcd_members.push(member_id.to_string());
                }
                Ok(())
            })?;
        Ok(())
    }

    pub fn set_kubeconfig(&self, cluster_id: &str, kubeconfig: &str) -> Result<()> {
        self.store
            .modify::<ClusterStatus>(cluster_id, &WriteOptions::system(), |status| {
                status.spec.kubeconfig = Some(kubeconfig.to_string());
                Ok(())
            })?;
        Ok(())
    }

    pub fn machine(&self, node_id: &str) -> Result<Option<Resource<ClusterMachineStatus>>> {
        match self.store.get::<ClusterMachineStatus>(node_id) {
            Ok(machine) => Ok(Some(machine)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Machines of one cluster, optionally restricted by role.
    pub fn machines(
        &self,
        cluster_id: &str,
        role: Option<MachineType>,
    ) -> Result<Vec<Resource<ClusterMachineStatus>>> {
        let mut query = LabelQuery::new().equals(CLUSTER_ID_LABEL, cluster_id);
        if let Some(role) = role {
            query = query.equals(ROLE_LABEL, role.to_string());
        }
        self.store.list::<ClusterMachineStatus>(&query)
    }

    /// Upsert the cross-machine view of one machine.
    pub fn update_machine(
        &self,
        node_id: &str,
        mutate: impl FnMut(&mut Resource<ClusterMachineStatus>) -> Result<()>,
    ) -> Result<Resource<ClusterMachineStatus>> {
        match self.store.create(
            Resource::new(node_id, ClusterMachineStatus::default()),
            &WriteOptions::system(),
        ) {
            Ok(_) | Err(Error::AlreadyExists(_)) => {}
            Err(e) => return Err(e),
        }
        self.store
            .modify::<ClusterMachineStatus>(node_id, &WriteOptions::system(), mutate)
    }

    /// Drop labels and cluster-derived fields of a machine on reset.
    pub fn clear_machine(&self, node_id: &str) -> Result<()> {
        match self.update_machine(node_id, |machine| {
            machine.metadata.labels.clear();
            machine.spec.etcd_member_id = None;
            Ok(())
        }) {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn remove_machine(&self, node_id: &str) -> Result<()> {
        let reference = ResourceRef::new(
            ClusterMachineStatus::NAMESPACE,
            ClusterMachineStatus::KIND,
            node_id,
        );
        match self.store.destroy(&reference, &WriteOptions::system()) {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_leave_lifecycle() {
        let global = GlobalState::in_memory();

        global
            .machine_joined("c1", MachineType::ControlPlane)
            .unwrap();
        global.machine_joined("c1", MachineType::Worker).unwrap();

        let cluster = global.cluster("c1").unwrap().unwrap();
        assert_eq!(cluster.spec.control_planes, 1);
        assert_eq!(cluster.spec.workers, 1);
        assert!(!cluster.spec.bootstrapped);

        global.machine_left("c1", MachineType::Worker).unwrap();
        assert!(global.cluster("c1").unwrap().is_some());

        global
            .machine_left("c1", MachineType::ControlPlane)
            .unwrap();
        assert!(global.cluster("c1").unwrap().is_none());
    }

    #[test]
    fn test_bootstrap_only_once() {
        let global = GlobalState::in_memory();
        global
            .machine_joined("c1", MachineType::ControlPlane)
            .unwrap();

        global.bootstrap("c1").unwrap();
        let err = global.bootstrap("c1").unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_bootstrap_unknown_cluster() {
        let global = GlobalState::in_memory();
        assert!(global.bootstrap("missing").unwrap_err().is_not_found());
    }

    #[test]
    fn test_deny_list_appends_once() {
        let global = GlobalState::in_memory();
        global
            .machine_joined("c1", MachineType::ControlPlane)
            .unwrap();

        global
            .deny_etcd_member("c1", &talemu_util::ids::format_member_id(42))
            .unwrap();
        global
            .deny_etcd_member("c1", &talemu_util::ids::format_member_id(42))
            .unwrap();

        let cluster = global.cluster("c1").unwrap().unwrap();
        assert_eq!(
            cluster.spec.deny_etcd_members,
            vec!["2a00000000000000".to_string()]
        );
    }

    #[test]
    fn test_machine_upsert_and_clear() {
        let global = GlobalState::in_memory();

        global
            .update_machine("node-1", |machine| {
                machine
                    .metadata
                    .labels
                    .insert(CLUSTER_ID_LABEL.to_string(), "c1".to_string());
                machine
                    .metadata
                    .labels
                    .insert(ROLE_LABEL.to_string(), "controlplane".to_string());
                machine.spec.hostname = Some("talos-aaa-bbb".to_string());
                Ok(())
            })
            .unwrap();

        let machines = global
            .machines("c1", Some(MachineType::ControlPlane))
            .unwrap();
        assert_eq!(machines.len(), 1);

        global.clear_machine("node-1").unwrap();
        assert!(global.machines("c1", None).unwrap().is_empty());
    }
}

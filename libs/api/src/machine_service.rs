//! The node-management service: configuration apply, bootstrap, reset,
//! reboot, upgrade, membership, images, logs and meta keys.

use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use talemu_cluster::GlobalState;
use talemu_resource::cluster::{CLUSTER_ID_LABEL, EtcdMember as EtcdMemberSpec, LOCAL, ROLE_LABEL};
use talemu_resource::config::{
    EventSinkConfig, KmsgLogConfig, MachineConfig, MetaKey, SecurityState, SideroLinkConfig, id,
};
use talemu_resource::document::{self, SideDocument};
use talemu_resource::network::HostnameStatus;
use talemu_resource::config::MachineType;
use talemu_resource::runtime::{CachedImage, ImageSpec, RebootSpec, Service, VersionSpec};
use talemu_resource::{LabelQuery, Resource, ResourceRef, ResourceSpec};
use talemu_state::{Store, WriteOptions};
use talemu_util::ids::{format_member_id, parse_member_id};
use talemu_util::image::{FactoryReference, split_tag};
use tokio_stream as stream;
use tonic::{Request, Response, Status};
use tracing::info;
use ulid::Ulid;

use crate::error::{config_missing, to_status};
use crate::proto::machine::machine_service_server::MachineService as MachineServiceApi;
use crate::proto::machine::{
    ApplyConfigurationRequest, ApplyConfigurationResponse, ApplyMode, BootstrapRequest,
    BootstrapResponse, Data, DmesgRequest, EtcdForfeitLeadershipRequest,
    EtcdForfeitLeadershipResponse, EtcdLeaveClusterRequest, EtcdLeaveClusterResponse, EtcdMember,
    EtcdMemberListRequest, EtcdMemberListResponse, EtcdRemoveMemberByIdRequest,
    EtcdRemoveMemberByIdResponse, EtcdStatusRequest, EtcdStatusResponse, FileInfo,
    HostnameRequest, HostnameResponse, ImageListRequest, ImageListResponse, ImagePullRequest,
    ImagePullResponse, ListRequest, LogsRequest, MetaDeleteRequest, MetaDeleteResponse,
    MetaWriteRequest, MetaWriteResponse, RebootRequest, RebootResponse, ResetRequest,
    ResetResponse, ServiceInfo, ServiceListRequest, ServiceListResponse, UpgradeRequest,
    UpgradeResponse, VersionRequest, VersionResponse,
};

const REBOOT_DOWNTIME_SECS: u64 = 2;
const ETCD_DATA_PATH: &str = "/var/lib/etcd/member";

const DMESG: &str = "\
[    0.000000] Linux version 6.6.0-talos\n\
[    0.120000] Command line: talos.platform=metal talemu=1\n\
[    1.300000] talos: machine emulator boot complete\n";

pub struct MachineRpc {
    store: Arc<Store>,
    global: GlobalState,
    machine_id: String,
}

impl MachineRpc {
    pub fn new(store: Arc<Store>, global: GlobalState, machine_id: impl Into<String>) -> Self {
        Self {
            store,
            global,
            machine_id: machine_id.into(),
        }
    }

    fn active_config(&self) -> Result<Option<Resource<MachineConfig>>, Status> {
        match self.store.get::<MachineConfig>(id::ACTIVE) {
            Ok(config) => Ok(Some(config)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(to_status(e)),
        }
    }

    fn cluster_context(&self) -> Result<Option<(String, MachineType)>, Status> {
        let Some(config) = self.active_config()? else {
            return Ok(None);
        };
        let parsed = config
            .spec
            .parse()
            .map_err(|e| Status::internal(e.to_string()))?;
        Ok(parsed
            .cluster_id()
            .map(|cluster| (cluster.to_string(), parsed.machine_type())))
    }

    fn write_side_documents(&self, side: &[SideDocument]) -> Result<(), Status> {
        let system = WriteOptions::system();
        for document in side {
            match document {
                SideDocument::EventSink { endpoint } => {
                    self.store
                        .apply(
                            Resource::new(
                                id::CURRENT,
                                EventSinkConfig {
                                    endpoint: endpoint.clone(),
                                },
                            ),
                            &system,
                        )
                        .map_err(to_status)?;
                }
                SideDocument::KmsgLog { url } => {
                    self.store
                        .apply(
                            Resource::new(id::CURRENT, KmsgLogConfig { url: url.clone() }),
                            &system,
                        )
                        .map_err(to_status)?;
                }
                SideDocument::SideroLink { api_url } => {
                    self.store
                        .apply(
                            Resource::new(
                                id::CURRENT,
                                SideroLinkConfig {
                                    api_endpoint: api_url.clone(),
                                    join_token: None,
                                    tunnel: false,
                                },
                            ),
                            &system,
                        )
                        .map_err(to_status)?;
                }
            }
        }
        Ok(())
    }

    fn check_secure_boot(&self, image: &str) -> Result<(), Status> {
        let secure_boot = self
            .store
            .get::<SecurityState>(id::CURRENT)
            .map(|s| s.spec.secure_boot)
            .unwrap_or(false);
        if !secure_boot {
            return Ok(());
        }

        let factory = FactoryReference::parse(image)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;
        if !factory.secure_boot {
            return Err(Status::invalid_argument(format!(
                "non-secureboot installer {image:?} rejected: secure boot is enabled"
            )));
        }
        Ok(())
    }

    fn trigger_reboot(&self) -> Result<(), Status> {
        let system = WriteOptions::system();
        // A plain update advances the update timestamp, which restarts the
        // downtime window exactly like the recreate in the real flow.
        let result = match self.store.get::<RebootSpec>(id::CURRENT) {
            Ok(_) => self
                .store
                .modify::<RebootSpec>(id::CURRENT, &system, |r| {
                    r.spec.downtime_secs = REBOOT_DOWNTIME_SECS;
                    Ok(())
                })
                .map(|_| ()),
            Err(e) if e.is_not_found() => self
                .store
                .create(
                    Resource::new(
                        id::CURRENT,
                        RebootSpec {
                            downtime_secs: REBOOT_DOWNTIME_SECS,
                        },
                    ),
                    &system,
                )
                .map(|_| ()),
            Err(e) => Err(e),
        };
        result.map_err(to_status)
    }
}

type ServerStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send + 'static>>;

#[tonic::async_trait]
impl MachineServiceApi for MachineRpc {
    async fn apply_configuration(
        &self,
        request: Request<ApplyConfigurationRequest>,
    ) -> Result<Response<ApplyConfigurationResponse>, Status> {
        let request = request.into_inner();
        let requested_mode = ApplyMode::try_from(request.mode).unwrap_or(ApplyMode::Auto);

        let raw = String::from_utf8(request.data)
            .map_err(|e| Status::invalid_argument(format!("configuration is not UTF-8: {e}")))?;
        let parsed = document::parse(&raw)
            .map_err(|e| Status::invalid_argument(format!("malformed configuration: {e}")))?;

        self.write_side_documents(&parsed.side)?;

        // A partial configuration is accepted but never signals a reboot and
        // never joins a cluster.
        if !parsed.is_complete() {
            return Ok(Response::new(ApplyConfigurationResponse {
                mode: ApplyMode::NoReboot as i32,
                mode_details: "partial configuration applied".to_string(),
            }));
        }

        if let Some(image) = parsed.install().and_then(|i| i.image.as_deref()) {
            self.check_secure_boot(image)?;
        }

        let previously_complete = self
            .active_config()?
            .and_then(|c| c.spec.parse().ok())
            .is_some_and(|p| p.is_complete());

        let machine_type = parsed.machine_type();
        let cluster_id = parsed.cluster_id().map(str::to_string);

        let mut config = Resource::new(
            id::ACTIVE,
            MachineConfig { raw: raw.clone() },
        );
        if let Some(cluster_id) = &cluster_id {
            config
                .metadata
                .labels
                .insert(CLUSTER_ID_LABEL.to_string(), cluster_id.clone());
        }
        self.store
            .apply(config, &WriteOptions::system())
            .map_err(to_status)?;

        if let Some(image) = parsed.install().and_then(|i| i.image.clone()) {
            self.store
                .apply(
                    Resource::new(
                        id::CURRENT,
                        ImageSpec {
                            reference: image,
                            staged: false,
                        },
                    ),
                    &WriteOptions::system(),
                )
                .map_err(to_status)?;
        }

        // Only the first full apply joins the cluster and bumps the counts.
        if !previously_complete {
            if let Some(cluster_id) = &cluster_id {
                self.global
                    .machine_joined(cluster_id, machine_type)
                    .map_err(to_status)?;
                self.global
                    .update_machine(&self.machine_id, |machine| {
                        machine
                            .metadata
                            .labels
                            .insert(CLUSTER_ID_LABEL.to_string(), cluster_id.clone());
                        machine
                            .metadata
                            .labels
                            .insert(ROLE_LABEL.to_string(), machine_type.to_string());
                        Ok(())
                    })
                    .map_err(to_status)?;
            }
            info!(
                msg = "machine configured",
                machine = %self.machine_id,
                cluster = cluster_id.as_deref().unwrap_or(""),
                machine_type = %machine_type,
            );
        }

        let mode = match requested_mode {
            ApplyMode::NoReboot => ApplyMode::NoReboot,
            _ => ApplyMode::Reboot,
        };
        Ok(Response::new(ApplyConfigurationResponse {
            mode: mode as i32,
            mode_details: "configuration applied".to_string(),
        }))
    }

    async fn bootstrap(
        &self,
        _request: Request<BootstrapRequest>,
    ) -> Result<Response<BootstrapResponse>, Status> {
        let Some((cluster_id, _)) = self.cluster_context()? else {
            return Err(config_missing("bootstrap"));
        };

        self.global.bootstrap(&cluster_id).map_err(|e| {
            if e.is_not_found() {
                config_missing("bootstrap")
            } else {
                to_status(e)
            }
        })?;

        info!(msg = "cluster bootstrapped", cluster = %cluster_id);
        Ok(Response::new(BootstrapResponse {}))
    }

    async fn reset(
        &self,
        request: Request<ResetRequest>,
    ) -> Result<Response<ResetResponse>, Status> {
        let request = request.into_inner();

        let wipes_state = request
            .system_partitions_to_wipe
            .iter()
            .any(|p| p.label == "STATE");
        if !wipes_state {
            return Err(Status::unimplemented(
                "only a reset wiping the STATE partition is implemented",
            ));
        }

        let Some(config) = self.active_config()? else {
            return Err(config_missing("reset"));
        };
        let context = self.cluster_context()?;

        // Destroy the configuration, letting every controller unwind first.
        let reference = config.reference();
        let system = WriteOptions::system();
        let ready = self
            .store
            .teardown(&reference, &system)
            .map_err(to_status)?;
        if !ready {
            self.store
                .wait_finalizers_empty(&reference)
                .await
                .map_err(to_status)?;
        }
        self.store
            .destroy(&reference, &system)
            .map_err(to_status)?;

        if let Some((cluster_id, machine_type)) = context {
            self.global
                .machine_left(&cluster_id, machine_type)
                .map_err(to_status)?;
        }
        self.global
            .clear_machine(&self.machine_id)
            .map_err(to_status)?;

        let actor_id = Ulid::new().to_string();
        info!(msg = "machine reset", machine = %self.machine_id, %actor_id);
        Ok(Response::new(ResetResponse { actor_id }))
    }

    async fn reboot(
        &self,
        _request: Request<RebootRequest>,
    ) -> Result<Response<RebootResponse>, Status> {
        self.trigger_reboot()?;
        let actor_id = Ulid::new().to_string();
        info!(msg = "reboot requested", machine = %self.machine_id, %actor_id);
        Ok(Response::new(RebootResponse { actor_id }))
    }

    async fn upgrade(
        &self,
        request: Request<UpgradeRequest>,
    ) -> Result<Response<UpgradeResponse>, Status> {
        let request = request.into_inner();

        // Any tagged installer reference is acceptable; only secure boot
        // demands the factory form, which check_secure_boot enforces.
        split_tag(&request.image).map_err(|e| Status::invalid_argument(e.to_string()))?;
        self.check_secure_boot(&request.image)?;

        let changed = match self.store.get::<ImageSpec>(id::CURRENT) {
            Ok(image) => image.spec.reference != request.image,
            Err(e) if e.is_not_found() => true,
            Err(e) => return Err(to_status(e)),
        };

        if changed {
            self.store
                .apply(
                    Resource::new(
                        id::CURRENT,
                        ImageSpec {
                            reference: request.image.clone(),
                            staged: true,
                        },
                    ),
                    &WriteOptions::system(),
                )
                .map_err(to_status)?;
            self.trigger_reboot()?;
            info!(msg = "upgrade staged", image = %request.image);
        }

        Ok(Response::new(UpgradeResponse {
            actor_id: Ulid::new().to_string(),
        }))
    }

    async fn version(
        &self,
        _request: Request<VersionRequest>,
    ) -> Result<Response<VersionResponse>, Status> {
        let tag = self
            .store
            .get::<VersionSpec>(id::CURRENT)
            .map(|v| v.spec.version)
            .unwrap_or_else(|_| VersionSpec::FALLBACK.to_string());

        let arch = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            other => other,
        };

        Ok(Response::new(VersionResponse {
            tag,
            arch: arch.to_string(),
        }))
    }

    async fn etcd_member_list(
        &self,
        _request: Request<EtcdMemberListRequest>,
    ) -> Result<Response<EtcdMemberListResponse>, Status> {
        let Some((cluster_id, _)) = self.cluster_context()? else {
            return Err(config_missing("etcd member list"));
        };

        let deny = self
            .global
            .cluster(&cluster_id)
            .map_err(to_status)?
            .map(|c| c.spec.deny_etcd_members)
            .unwrap_or_default();

        let members = self
            .global
            .machines(&cluster_id, Some(MachineType::ControlPlane))
            .map_err(to_status)?
            .into_iter()
            .filter_map(|machine| {
                let member_id = machine.spec.etcd_member_id.as_deref()?;
                if deny.iter().any(|d| d == member_id) {
                    return None;
                }
                Some(EtcdMember {
                    id: parse_member_id(member_id)?,
                    hostname: machine.spec.hostname.clone().unwrap_or_default(),
                    is_learner: false,
                })
            })
            .collect();

        Ok(Response::new(EtcdMemberListResponse { members }))
    }

    async fn etcd_remove_member_by_id(
        &self,
        request: Request<EtcdRemoveMemberByIdRequest>,
    ) -> Result<Response<EtcdRemoveMemberByIdResponse>, Status> {
        let Some((cluster_id, _)) = self.cluster_context()? else {
            return Err(config_missing("etcd remove member"));
        };

        let member_id = format_member_id(request.into_inner().member_id);
        self.global
            .deny_etcd_member(&cluster_id, &member_id)
            .map_err(to_status)?;

        info!(msg = "etcd member denied", cluster = %cluster_id, %member_id);
        Ok(Response::new(EtcdRemoveMemberByIdResponse {}))
    }

    async fn etcd_leave_cluster(
        &self,
        _request: Request<EtcdLeaveClusterRequest>,
    ) -> Result<Response<EtcdLeaveClusterResponse>, Status> {
        let Some((cluster_id, _)) = self.cluster_context()? else {
            return Err(config_missing("etcd leave cluster"));
        };

        let own = self
            .global
            .machine(&self.machine_id)
            .map_err(to_status)?
            .and_then(|m| m.spec.etcd_member_id);
        if let Some(member_id) = own {
            self.global
                .deny_etcd_member(&cluster_id, &member_id)
                .map_err(to_status)?;
        }

        Ok(Response::new(EtcdLeaveClusterResponse {}))
    }

    async fn etcd_forfeit_leadership(
        &self,
        _request: Request<EtcdForfeitLeadershipRequest>,
    ) -> Result<Response<EtcdForfeitLeadershipResponse>, Status> {
        Ok(Response::new(EtcdForfeitLeadershipResponse {}))
    }

    async fn etcd_status(
        &self,
        _request: Request<EtcdStatusRequest>,
    ) -> Result<Response<EtcdStatusResponse>, Status> {
        let member = self
            .store
            .get::<EtcdMemberSpec>(LOCAL)
            .map_err(to_status)?;

        Ok(Response::new(EtcdStatusResponse {
            member_id: parse_member_id(&member.spec.member_id).unwrap_or_default(),
            db_size: 20 * 1024 * 1024,
        }))
    }

    async fn service_list(
        &self,
        _request: Request<ServiceListRequest>,
    ) -> Result<Response<ServiceListResponse>, Status> {
        let mut services: Vec<ServiceInfo> = self
            .store
            .list::<Service>(&LabelQuery::new())
            .map_err(to_status)?
            .into_iter()
            .map(|s| ServiceInfo {
                id: s.metadata.id.clone(),
                state: if !s.spec.running {
                    "Stopped".to_string()
                } else if s.spec.healthy {
                    "Running".to_string()
                } else {
                    "Preparing".to_string()
                },
                healthy: s.spec.healthy,
            })
            .collect();

        services.push(ServiceInfo {
            id: "machined".to_string(),
            state: "Running".to_string(),
            healthy: true,
        });

        Ok(Response::new(ServiceListResponse { services }))
    }

    async fn hostname(
        &self,
        _request: Request<HostnameRequest>,
    ) -> Result<Response<HostnameResponse>, Status> {
        let hostname = self
            .store
            .get::<HostnameStatus>(id::CURRENT)
            .map_err(|e| {
                if e.is_not_found() {
                    config_missing("hostname")
                } else {
                    to_status(e)
                }
            })?;

        Ok(Response::new(HostnameResponse {
            hostname: hostname.spec.hostname,
        }))
    }

    type ImageListStream = ServerStream<ImageListResponse>;

    async fn image_list(
        &self,
        _request: Request<ImageListRequest>,
    ) -> Result<Response<Self::ImageListStream>, Status> {
        let images = self
            .store
            .list::<CachedImage>(&LabelQuery::new())
            .map_err(to_status)?;

        let responses: Vec<Result<ImageListResponse, Status>> = images
            .into_iter()
            .map(|image| {
                Ok(ImageListResponse {
                    reference: image.spec.reference,
                })
            })
            .collect();

        Ok(Response::new(Box::pin(stream::iter(responses))))
    }

    async fn image_pull(
        &self,
        request: Request<ImagePullRequest>,
    ) -> Result<Response<ImagePullResponse>, Status> {
        let reference = request.into_inner().reference;
        if reference.ends_with("-bad") {
            return Err(Status::invalid_argument(format!(
                "image {reference:?} cannot be pulled"
            )));
        }

        self.store
            .apply(
                Resource::new(
                    reference.clone(),
                    CachedImage {
                        reference: reference.clone(),
                    },
                ),
                &WriteOptions::system(),
            )
            .map_err(to_status)?;

        Ok(Response::new(ImagePullResponse {}))
    }

    type DmesgStream = ServerStream<Data>;

    async fn dmesg(
        &self,
        _request: Request<DmesgRequest>,
    ) -> Result<Response<Self::DmesgStream>, Status> {
        // Canned text, raw bytes in a one-shot stream.
        let data = Data {
            bytes: DMESG.as_bytes().to_vec(),
        };
        Ok(Response::new(Box::pin(stream::once(Ok(data)))))
    }

    type LogsStream = ServerStream<Data>;

    async fn logs(
        &self,
        request: Request<LogsRequest>,
    ) -> Result<Response<Self::LogsStream>, Status> {
        let id = request.into_inner().id;
        let data = Data {
            bytes: format!("{{\"msg\":\"service {id} log\",\"talemu\":true}}\n").into_bytes(),
        };
        Ok(Response::new(Box::pin(stream::once(Ok(data)))))
    }

    type ListStream = ServerStream<FileInfo>;

    async fn list(
        &self,
        request: Request<ListRequest>,
    ) -> Result<Response<Self::ListStream>, Status> {
        let root = request.into_inner().root;

        let mut entries = Vec::new();
        if root == ETCD_DATA_PATH && self.store.get::<EtcdMemberSpec>(LOCAL).is_ok() {
            entries.push(Ok(FileInfo {
                name: "db".to_string(),
                size: 20 * 1024 * 1024,
                is_dir: false,
            }));
        }

        Ok(Response::new(Box::pin(stream::iter(entries))))
    }

    async fn meta_write(
        &self,
        request: Request<MetaWriteRequest>,
    ) -> Result<Response<MetaWriteResponse>, Status> {
        let request = request.into_inner();
        let tag = u8::try_from(request.key)
            .map_err(|_| Status::invalid_argument("meta key tag out of range"))?;
        let value = String::from_utf8(request.value)
            .map_err(|e| Status::invalid_argument(format!("meta value is not UTF-8: {e}")))?;

        self.store
            .apply(
                Resource::new(MetaKey::id_for_tag(tag), MetaKey { tag, value }),
                &WriteOptions::system(),
            )
            .map_err(to_status)?;

        Ok(Response::new(MetaWriteResponse {}))
    }

    async fn meta_delete(
        &self,
        request: Request<MetaDeleteRequest>,
    ) -> Result<Response<MetaDeleteResponse>, Status> {
        let tag = u8::try_from(request.into_inner().key)
            .map_err(|_| Status::invalid_argument("meta key tag out of range"))?;

        let reference = ResourceRef::new(
            MetaKey::NAMESPACE,
            MetaKey::KIND,
            MetaKey::id_for_tag(tag),
        );
        let system = WriteOptions::system();

        let ready = match self.store.teardown(&reference, &system) {
            Ok(ready) => ready,
            Err(e) if e.is_not_found() => return Ok(Response::new(MetaDeleteResponse {})),
            Err(e) => return Err(to_status(e)),
        };
        if !ready {
            self.store
                .wait_finalizers_empty(&reference)
                .await
                .map_err(to_status)?;
        }
        self.store
            .destroy(&reference, &system)
            .map_err(to_status)?;

        Ok(Response::new(MetaDeleteResponse {}))
    }
}


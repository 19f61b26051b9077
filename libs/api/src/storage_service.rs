//! Disk inventory projection.

use std::sync::Arc;

use talemu_resource::LabelQuery;
use talemu_resource::runtime::Disk;
use talemu_state::Store;
use tonic::{Request, Response, Status};

use crate::error::to_status;
use crate::proto::storage::storage_service_server::StorageService as StorageServiceApi;
use crate::proto::storage::{DisksRequest, DisksResponse};

pub struct StorageRpc {
    store: Arc<Store>,
}

impl StorageRpc {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }
}

#[tonic::async_trait]
impl StorageServiceApi for StorageRpc {
    async fn disks(
        &self,
        _request: Request<DisksRequest>,
    ) -> Result<Response<DisksResponse>, Status> {
        let disks = self
            .store
            .list::<Disk>(&LabelQuery::new())
            .map_err(to_status)?
            .into_iter()
            .map(|disk| crate::proto::storage::Disk {
                device_name: disk.spec.dev_path,
                size: disk.spec.size_bytes,
                model: disk.spec.model,
                system_disk: disk.spec.system_disk,
            })
            .collect();

        Ok(Response::new(DisksResponse { disks }))
    }
}

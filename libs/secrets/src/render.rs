//! Materializes control-plane secrets as files for the static pods: cert and
//! key files under the machine's `certs/` directory, wiped when the machine
//! is not a control plane.

use std::fs;
use std::path::PathBuf;

use async_trait::async_trait;
use talemu_resource::Resource;
use talemu_resource::config::{MachineTypeSpec, id};
use talemu_resource::k8s::SecretsStatus;
use talemu_resource::secrets::{KubernetesDynamicCerts, KubernetesRoot};
use talemu_runtime::{ControllerContext, Error, Input, Output, Reconcile, Result};
use tracing::info;

pub struct RenderSecretsController {
    certs_dir: PathBuf,
}

impl RenderSecretsController {
    pub fn new(certs_dir: impl Into<PathBuf>) -> Self {
        Self {
            certs_dir: certs_dir.into(),
        }
    }

    fn write_secret(&self, name: &str, contents: &str) -> std::io::Result<()> {
        let path = self.certs_dir.join(name);
        // Re-renders must get past the 0400 mode of the previous file.
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        fs::write(&path, contents)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o400))?;
        }
        Ok(())
    }

    fn wipe(&self) -> std::io::Result<()> {
        if self.certs_dir.exists() {
            fs::remove_dir_all(&self.certs_dir)?;
        }
        Ok(())
    }
}

#[async_trait]
impl Reconcile for RenderSecretsController {
    fn name(&self) -> &'static str {
        "RenderSecretsController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::weak::<MachineTypeSpec>().with_id(id::CURRENT),
            Input::weak::<KubernetesRoot>().with_id(id::CURRENT),
            Input::weak::<KubernetesDynamicCerts>().with_id(id::CURRENT),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<SecretsStatus>()]
    }

    async fn reconcile(&self, ctx: &ControllerContext) -> Result<()> {
        let control_plane = ctx
            .get_optional::<MachineTypeSpec>(id::CURRENT)?
            .is_some_and(|t| t.spec.machine_type.is_control_plane());

        if !control_plane {
            self.wipe()
                .map_err(|e| Error::controller("wiping certs directory", e))?;
            ctx.teardown_and_destroy::<SecretsStatus>(id::CURRENT)?;
            return Ok(());
        }

        let (Some(root), Some(dynamic)) = (
            ctx.get_optional::<KubernetesRoot>(id::CURRENT)?,
            ctx.get_optional::<KubernetesDynamicCerts>(id::CURRENT)?,
        ) else {
            return Ok(());
        };

        // The rendered set is keyed by the secret versions; skip rewriting
        // files nothing changed in.
        let version = format!(
            "{}-{}",
            root.metadata.version, dynamic.metadata.version
        );
        if let Some(status) = ctx.get_optional::<SecretsStatus>(id::CURRENT)? {
            if status.spec.ready && status.spec.version == version {
                return Ok(());
            }
        }

        fs::create_dir_all(&self.certs_dir)
            .map_err(|e| Error::controller("creating certs directory", e))?;

        let files = [
            ("ca.crt", root.spec.ca_crt.as_str()),
            ("apiserver.crt", dynamic.spec.api_server_crt.as_str()),
            ("apiserver.key", dynamic.spec.api_server_key.as_str()),
            (
                "apiserver-kubelet-client.crt",
                dynamic.spec.kubelet_client_crt.as_str(),
            ),
            (
                "apiserver-kubelet-client.key",
                dynamic.spec.kubelet_client_key.as_str(),
            ),
            ("front-proxy.crt", dynamic.spec.front_proxy_crt.as_str()),
            ("front-proxy.key", dynamic.spec.front_proxy_key.as_str()),
            (
                "service-account.key",
                root.spec.service_account_key.as_str(),
            ),
        ];
        for (name, contents) in files {
            self.write_secret(name, contents)
                .map_err(|e| Error::controller("writing secret file", e))?;
        }

        info!(msg = "rendered control-plane secrets", dir = %self.certs_dir.display());
        ctx.apply(Resource::new(
            id::CURRENT,
            SecretsStatus {
                ready: true,
                version,
            },
        ))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use talemu_resource::config::MachineType;
    use talemu_runtime::{ControllerRuntime, RuntimeMetrics};
    use talemu_state::{Store, WriteOptions};
    use tokio_util::sync::CancellationToken;

    use super::*;

    #[tokio::test]
    async fn test_renders_and_wipes() {
        let dir = tempfile::tempdir().unwrap();
        let certs_dir = dir.path().join("certs");

        let store = Arc::new(Store::in_memory());
        let cancel = CancellationToken::new();
        let mut runtime = ControllerRuntime::new(
            store.clone(),
            Arc::new(RuntimeMetrics::new()),
            cancel.clone(),
        );
        runtime
            .register(RenderSecretsController::new(&certs_dir))
            .unwrap();
        let handle = tokio::spawn(runtime.run());

        store
            .create(
                Resource::new(
                    id::CURRENT,
                    MachineTypeSpec {
                        machine_type: MachineType::ControlPlane,
                    },
                ),
                &WriteOptions::system(),
            )
            .unwrap();
        store
            .create(
                Resource::new(
                    id::CURRENT,
                    KubernetesRoot {
                        ca_crt: "ca-pem".to_string(),
                        service_account_key: "sa-pem".to_string(),
                        ..Default::default()
                    },
                ),
                &WriteOptions::system(),
            )
            .unwrap();
        store
            .create(
                Resource::new(
                    id::CURRENT,
                    KubernetesDynamicCerts {
                        api_server_crt: "crt".into(),
                        api_server_key: "key".into(),
                        kubelet_client_crt: "crt".into(),
                        kubelet_client_key: "key".into(),
                        front_proxy_crt: "crt".into(),
                        front_proxy_key: "key".into(),
                        valid_until: chrono::Utc::now(),
                    },
                ),
                &WriteOptions::system(),
            )
            .unwrap();

        tokio::time::timeout(
            Duration::from_secs(5),
            store.watch_for::<SecretsStatus>(id::CURRENT, |s| s.spec.ready),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(
            fs::read_to_string(certs_dir.join("ca.crt")).unwrap(),
            "ca-pem"
        );
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(certs_dir.join("apiserver.key"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o400);
        }

        // Becoming a worker wipes the directory.
        store
            .modify::<MachineTypeSpec>(id::CURRENT, &WriteOptions::system(), |t| {
                t.spec.machine_type = MachineType::Worker;
                Ok(())
            })
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if !certs_dir.exists() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        handle.await.unwrap();
    }
}

//! Node-management API certificates. Control planes issue locally from the
//! OS root; workers send a CSR to the cluster's trust endpoints through the
//! overlay link.

use std::sync::Arc;

use async_trait::async_trait;
use talemu_resource::Resource;
use talemu_resource::config::{JoinEndpoints, MachineTypeSpec, id};
use talemu_resource::secrets::{API_CERT_SANS, ApiCert, CertSans, OsRoot};
use talemu_runtime::{ControllerContext, Error, Input, Output, Reconcile, Result};
use talemu_util::retry::{self, Attempt, RetryPolicy};
use time::Duration;
use tracing::{debug, warn};

use crate::pki::{self, CertUse, LeafRequest};

const VALIDITY: Duration = Duration::days(365);

/// Signs a worker CSR against a trust endpoint. The transport lives with the
/// gRPC surface; the controller only sees this contract.
#[async_trait]
pub trait CsrSigner: Send + Sync + 'static {
    async fn sign(&self, endpoint: &str, csr_pem: &str) -> std::io::Result<SignedCertificate>;
}

#[derive(Clone, Debug)]
pub struct SignedCertificate {
    pub crt: String,
    pub accepted_cas: Vec<String>,
}

pub struct ApiCertController {
    signer: Option<Arc<dyn CsrSigner>>,
}

impl ApiCertController {
    pub fn new(signer: Option<Arc<dyn CsrSigner>>) -> Self {
        Self { signer }
    }

    /// Round-robin CSR signing against the trust endpoints with bounded
    /// retry. Cancelled and requeued by the runtime when inputs change.
    async fn remote_sign(
        &self,
        endpoints: &[String],
        csr_pem: &str,
    ) -> Result<Option<SignedCertificate>> {
        let Some(signer) = self.signer.as_ref() else {
            debug!(msg = "no csr signer wired, staying in maintenance tls");
            return Ok(None);
        };
        if endpoints.is_empty() {
            return Ok(None);
        }

        let mut round_robin = endpoints.iter().cycle();
        let outcome = retry::retry(RetryPolicy::signing(), || {
            let endpoint = round_robin.next().expect("endpoints not empty").clone();
            let signer = signer.clone();
            let csr_pem = csr_pem.to_string();
            async move {
                signer
                    .sign(&endpoint, &csr_pem)
                    .await
                    .map_err(Attempt::Retry)
            }
        })
        .await;

        match outcome {
            Ok(signed) => Ok(Some(signed)),
            Err(e) => {
                warn!(msg = "remote csr signing failed", %e);
                Err(Error::controller("signing csr against trust endpoints", e))
            }
        }
    }
}

#[async_trait]
impl Reconcile for ApiCertController {
    fn name(&self) -> &'static str {
        "ApiCertController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::weak::<OsRoot>().with_id(id::CURRENT),
            Input::weak::<MachineTypeSpec>().with_id(id::CURRENT),
            Input::weak::<CertSans>().with_id(API_CERT_SANS),
            Input::weak::<JoinEndpoints>().with_id(id::CURRENT),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<ApiCert>()]
    }

    async fn reconcile(&self, ctx: &ControllerContext) -> Result<()> {
        let Some(root) = ctx.get_optional::<OsRoot>(id::CURRENT)? else {
            ctx.teardown_and_destroy::<ApiCert>(id::CURRENT)?;
            return Ok(());
        };
        let Some(sans) = ctx.get_optional::<CertSans>(API_CERT_SANS)? else {
            return Ok(());
        };

        // Keep an issued cert until the SAN set changes.
        if let Some(existing) = ctx.get_optional::<ApiCert>(id::CURRENT)? {
            if !existing.spec.server_crt.is_empty()
                && existing.spec.accepted_cas.first() == Some(&root.spec.ca_crt)
            {
                return Ok(());
            }
        }

        let control_plane = ctx
            .get_optional::<MachineTypeSpec>(id::CURRENT)?
            .is_some_and(|t| t.spec.machine_type.is_control_plane());

        let san = sans.spec.all();

        let spec = if control_plane {
            let Some(ca_key) = root.spec.ca_key.as_deref() else {
                return Ok(());
            };
            let ca = pki::load_ca(&root.spec.ca_crt, ca_key)
                .map_err(|e| Error::controller("reloading os ca", e))?;

            let server = ca
                .issue(&LeafRequest {
                    common_name: "apid",
                    organization: None,
                    san: &san,
                    cert_use: CertUse::Server,
                    valid_for: VALIDITY,
                })
                .map_err(|e| Error::controller("issuing api server cert", e))?;
            let client = ca
                .issue(&LeafRequest {
                    common_name: "apid-client",
                    organization: None,
                    san: &[],
                    cert_use: CertUse::Client,
                    valid_for: VALIDITY,
                })
                .map_err(|e| Error::controller("issuing api client cert", e))?;

            ApiCert {
                server_crt: server.crt,
                server_key: server.key,
                client_crt: Some(client.crt),
                client_key: Some(client.key),
                accepted_cas: vec![root.spec.ca_crt.clone()],
            }
        } else {
            let endpoints = ctx
                .get_optional::<JoinEndpoints>(id::CURRENT)?
                .map(|e| e.spec.endpoints)
                .unwrap_or_default();

            // Workers hold the key locally and get the cert signed remotely.
            let key = rcgen::KeyPair::generate()
                .map_err(|e| Error::controller("generating worker key", e))?;
            let csr_params = rcgen::CertificateParams::new(san.clone())
                .map_err(|e| Error::controller("building csr params", e))?;
            let csr_pem = csr_params
                .serialize_request(&key)
                .and_then(|csr| csr.pem())
                .map_err(|e| Error::controller("serializing csr", e))?;

            match self.remote_sign(&endpoints, &csr_pem).await? {
                Some(signed) => ApiCert {
                    server_crt: signed.crt,
                    server_key: key.serialize_pem(),
                    client_crt: None,
                    client_key: None,
                    accepted_cas: if signed.accepted_cas.is_empty() {
                        vec![root.spec.ca_crt.clone()]
                    } else {
                        signed.accepted_cas
                    },
                },
                None => return Ok(()),
            }
        };

        ctx.apply(Resource::new(id::CURRENT, spec))?;
        Ok(())
    }
}

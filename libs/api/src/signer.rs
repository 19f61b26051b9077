//! CSR signing against a trust endpoint, dialed through the overlay link.

use async_trait::async_trait;
use hyper_util::rt::TokioIo;
use talemu_secrets::{CsrSigner, SignedCertificate};
use talemu_util::dialer::BoundDialer;
use tonic::transport::{Endpoint, Uri};
use tower::service_fn;

use crate::proto::security::CertificateRequest;
use crate::proto::security::security_service_client::SecurityServiceClient;

pub struct GrpcCsrSigner {
    dialer: BoundDialer,
}

impl GrpcCsrSigner {
    pub fn new(dialer: BoundDialer) -> Self {
        Self { dialer }
    }
}

#[async_trait]
impl CsrSigner for GrpcCsrSigner {
    async fn sign(&self, endpoint: &str, csr_pem: &str) -> std::io::Result<SignedCertificate> {
        let dialer = self.dialer.clone();
        let target = endpoint.to_string();

        let channel = Endpoint::try_from(format!("http://{endpoint}"))
            .map_err(std::io::Error::other)?
            .connect_with_connector(service_fn(move |_uri: Uri| {
                let dialer = dialer.clone();
                let target = target.clone();
                async move { dialer.connect(&target).await.map(TokioIo::new) }
            }))
            .await
            .map_err(std::io::Error::other)?;

        let mut client = SecurityServiceClient::new(channel);
        let response = client
            .certificate(CertificateRequest {
                csr: csr_pem.as_bytes().to_vec(),
            })
            .await
            .map_err(std::io::Error::other)?
            .into_inner();

        Ok(SignedCertificate {
            crt: String::from_utf8_lossy(&response.crt).into_owned(),
            accepted_cas: if response.ca.is_empty() {
                Vec::new()
            } else {
                vec![String::from_utf8_lossy(&response.ca).into_owned()]
            },
        })
    }
}

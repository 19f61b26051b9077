//! TLS for the node-management listener. The provider starts with a
//! self-signed certificate (maintenance mode) and hot-swaps to the issued
//! API certificate as soon as one appears in the store, without restarting
//! the listener.

use std::fmt;
use std::sync::{Arc, RwLock};

use rustls::ServerConfig;
use rustls::crypto::ring::sign::any_supported_type;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::ResolvesServerCert;
use rustls::sign::CertifiedKey;
use talemu_resource::ResourceSpec;
use talemu_resource::config::id;
use talemu_resource::secrets::ApiCert;
use talemu_secrets::pki;
use talemu_state::{EventKind, Store, WatchOptions};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Error, Debug)]
pub enum TlsError {
    #[error("bad certificate pem: {0}")]
    BadPem(#[source] std::io::Error),

    #[error("no certificate in pem bundle")]
    EmptyPem,

    #[error("unusable private key: {0}")]
    BadKey(#[source] rustls::Error),

    #[error("self-signed bootstrap failed: {0}")]
    SelfSigned(#[source] talemu_secrets::pki::PkiError),
}

fn certified_key(crt_pem: &str, key_pem: &str) -> Result<CertifiedKey, TlsError> {
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut crt_pem.as_bytes())
            .collect::<Result<_, _>>()
            .map_err(TlsError::BadPem)?;
    if certs.is_empty() {
        return Err(TlsError::EmptyPem);
    }

    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_pem.as_bytes())
        .map_err(TlsError::BadPem)?
        .ok_or(TlsError::EmptyPem)?;
    let signing_key = any_supported_type(&key).map_err(TlsError::BadKey)?;

    Ok(CertifiedKey::new(certs, signing_key))
}

/// Certificate source with interior mutability so the serving certificate
/// can be replaced under a running listener.
pub struct TlsProvider {
    current: RwLock<Arc<CertifiedKey>>,
}

impl fmt::Debug for TlsProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsProvider").finish_non_exhaustive()
    }
}

impl TlsProvider {
    /// Bootstrap with a self-signed maintenance certificate for the given
    /// names.
    pub fn self_signed(san: &[String]) -> Result<Arc<Self>, TlsError> {
        let pair = pki::self_signed_server(san).map_err(TlsError::SelfSigned)?;
        let key = certified_key(&pair.crt, &pair.key)?;
        Ok(Arc::new(Self {
            current: RwLock::new(Arc::new(key)),
        }))
    }

    /// Swap in an issued certificate.
    pub fn set_pair(&self, crt_pem: &str, key_pem: &str) -> Result<(), TlsError> {
        let key = certified_key(crt_pem, key_pem)?;
        *self.current.write().expect("tls lock poisoned") = Arc::new(key);
        Ok(())
    }

    /// rustls server config serving through this provider. The crypto
    /// provider is pinned to ring so feature unification elsewhere in the
    /// dependency tree cannot leave the default ambiguous.
    pub fn server_config(self: &Arc<Self>) -> Result<Arc<ServerConfig>, TlsError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(TlsError::BadKey)?
            .with_no_client_auth()
            .with_cert_resolver(self.clone());
        config.alpn_protocols = vec![b"h2".to_vec()];
        Ok(Arc::new(config))
    }

    /// Follow the issued API certificate in the store, hot-swapping on every
    /// change until cancelled.
    pub async fn follow_store(self: Arc<Self>, store: Arc<Store>, cancel: CancellationToken) {
        let mut events = store.watch(
            &talemu_resource::ResourceRef::new(ApiCert::NAMESPACE, ApiCert::KIND, id::CURRENT),
            WatchOptions::default(),
        );

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => return,
                },
            };

            if !matches!(event.kind, EventKind::Created | EventKind::Updated) {
                continue;
            }
            let Some(resource) = event.resource.as_ref() else {
                continue;
            };
            let Ok(cert) = resource.typed::<ApiCert>() else {
                continue;
            };
            if cert.spec.server_crt.is_empty() {
                continue;
            }

            match self.set_pair(&cert.spec.server_crt, &cert.spec.server_key) {
                Ok(()) => info!(msg = "api certificate rotated in"),
                Err(e) => error!(msg = "issued api certificate unusable", %e),
            }
        }
    }
}

impl ResolvesServerCert for TlsProvider {
    fn resolve(&self, _hello: rustls::server::ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.current.read().expect("tls lock poisoned").clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_signed_and_swap() {
        let provider = TlsProvider::self_signed(&["localhost".to_string()]).unwrap();
        let _config = provider.server_config().unwrap();

        let ca = pki::generate_ca("talos", time::Duration::days(365)).unwrap();
        let issued = ca
            .issue(&pki::LeafRequest {
                common_name: "apid",
                organization: None,
                san: &["localhost".to_string()],
                cert_use: pki::CertUse::Server,
                valid_for: time::Duration::days(30),
            })
            .unwrap();

        provider.set_pair(&issued.crt, &issued.key).unwrap();
    }

    #[test]
    fn test_rejects_garbage_pem() {
        let provider = TlsProvider::self_signed(&["localhost".to_string()]).unwrap();
        assert!(provider.set_pair("not-pem", "not-pem").is_err());
    }
}

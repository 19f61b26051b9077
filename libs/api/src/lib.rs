//! The node-management gRPC facade: three services behind one TLS listener
//! bound to the overlay address, with a certificate provider that hot-swaps
//! from a self-signed maintenance cert to the issued API cert.

pub mod error;
pub mod machine_service;
pub mod router;
pub mod server;
pub mod signer;
pub mod state_service;
pub mod storage_service;
pub mod tls;

pub mod proto {
    pub mod machine {
        tonic::include_proto!("machine");
    }
    pub mod security {
        tonic::include_proto!("security");
    }
    pub mod state {
        tonic::include_proto!("state");
    }
    pub mod storage {
        tonic::include_proto!("storage");
    }
}

pub use server::ApiServer;
pub use signer::GrpcCsrSigner;
pub use tls::TlsProvider;

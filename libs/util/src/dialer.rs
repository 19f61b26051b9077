//! Outbound TCP dialing bound to a specific local address, so traffic toward
//! the orchestrator leaves through the overlay link rather than whatever the
//! host routing table prefers.

use std::io;
use std::net::{IpAddr, SocketAddr};

use tokio::net::{TcpSocket, TcpStream, lookup_host};

/// Dialer with an optional local bind address.
#[derive(Clone, Debug, Default)]
pub struct BoundDialer {
    local: Option<IpAddr>,
}

impl BoundDialer {
    pub fn new(local: Option<IpAddr>) -> Self {
        Self { local }
    }

    /// Bind to the named local address before connecting.
    pub fn bound_to(local: IpAddr) -> Self {
        Self { local: Some(local) }
    }

    /// Connect to `addr` (`host:port`), binding the socket locally first when
    /// a bind address is configured and its family matches.
    pub async fn connect(&self, addr: &str) -> io::Result<TcpStream> {
        let mut last_err = None;

        for remote in lookup_host(addr).await? {
            match self.connect_one(remote).await {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = Some(e),
            }
        }

        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no addresses for {addr}"))
        }))
    }

    async fn connect_one(&self, remote: SocketAddr) -> io::Result<TcpStream> {
        let socket = if remote.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };

        if let Some(local) = self.local {
            if local.is_ipv4() == remote.is_ipv4() {
                socket.bind(SocketAddr::new(local, 0))?;
            }
        }

        socket.connect(remote).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_loopback() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let dialer = BoundDialer::bound_to(IpAddr::from([127, 0, 0, 1]));
        let stream = dialer.connect(&addr.to_string()).await.unwrap();
        assert_eq!(
            stream.local_addr().unwrap().ip(),
            IpAddr::from([127, 0, 0, 1])
        );
    }

    #[tokio::test]
    async fn test_family_mismatch_falls_back_to_unbound() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // An IPv6 bind address cannot be used for an IPv4 remote; the dial
        // still succeeds unbound.
        let dialer = BoundDialer::bound_to("::1".parse().unwrap());
        dialer.connect(&addr.to_string()).await.unwrap();
    }
}

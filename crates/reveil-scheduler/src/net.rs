//! Network reachability and name resolution checks for the readiness prober.

use async_trait::async_trait;
use tokio::net::{lookup_host, TcpStream};
use tracing::debug;

#[async_trait]
pub trait Connectivity: Send + Sync {
    /// Prove the uplink works without involving DNS.
    async fn check_network(&self) -> Result<(), String>;

    /// Resolve `host` to at least one address.
    async fn check_dns(&self, host: &str) -> Result<(), String>;
}

/// TCP connect to a fixed `ip:port`, and the system resolver for DNS.
#[derive(Debug, Clone)]
pub struct TcpConnectivity {
    probe_addr: String,
}

impl TcpConnectivity {
    pub fn new(probe_addr: impl Into<String>) -> Self {
        Self {
            probe_addr: probe_addr.into(),
        }
    }
}

#[async_trait]
impl Connectivity for TcpConnectivity {
    async fn check_network(&self) -> Result<(), String> {
        let stream = TcpStream::connect(&self.probe_addr)
            .await
            .map_err(|e| format!("connect {}: {e}", self.probe_addr))?;
        debug!(addr = %self.probe_addr, peer = ?stream.peer_addr().ok(), "network probe connected");
        Ok(())
    }

    async fn check_dns(&self, host: &str) -> Result<(), String> {
        let mut addrs = lookup_host((host, 443))
            .await
            .map_err(|e| format!("resolve {host}: {e}"))?;
        match addrs.next() {
            Some(addr) => {
                debug!(%host, %addr, "dns probe resolved");
                Ok(())
            }
            None => Err(format!("resolve {host}: no addresses")),
        }
    }
}

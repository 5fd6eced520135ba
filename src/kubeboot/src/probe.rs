//! TCP reachability probe against each host's SSH port.

use async_trait::async_trait;
use cluster::executor::{HostProbe, HostTarget};
use std::time::Duration;
use tokio::net::TcpStream;

pub struct TcpProbe {
    port: u16,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(port: u16, timeout: Duration) -> Self {
        Self { port, timeout }
    }
}

#[async_trait]
impl HostProbe for TcpProbe {
    async fn probe(&self, host: &HostTarget) -> Result<(), String> {
        let connect = TcpStream::connect((host.address.as_str(), self.port));
        match tokio::time::timeout(self.timeout, connect).await {
            Ok(Ok(_stream)) => {
                tracing::debug!("[Probe] {} ({}:{}) reachable", host.name, host.address, self.port);
                Ok(())
            }
            Ok(Err(e)) => Err(format!("{}:{}: {}", host.address, self.port, e)),
            Err(_) => Err(format!(
                "{}:{}: no answer within {:?}",
                host.address, self.port, self.timeout
            )),
        }
    }
}

// # TCP Heartbeat
//
// Heartbeat client for DCs that expose no heartbeat RPC: a DC is alive when
// its heartbeat port accepts a connection. The answer carries a single
// service entry named after the port.

use async_trait::async_trait;
use dcaffinity_core::config::MachineCredentials;
use dcaffinity_core::traits::{HeartbeatClient, HeartbeatStatus, ServiceHeartbeat};
use dcaffinity_core::{Error, Result};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::trace;

#[derive(Debug, Clone)]
pub struct TcpHeartbeat {
    port: u16,
    timeout: Duration,
}

impl TcpHeartbeat {
    pub fn new(port: u16, timeout: Duration) -> Self {
        Self { port, timeout }
    }
}

#[async_trait]
impl HeartbeatClient for TcpHeartbeat {
    async fn heartbeat(&self, dc_name: &str, _credentials: &MachineCredentials) -> Result<HeartbeatStatus> {
        let connect = TcpStream::connect((dc_name, self.port));
        match tokio::time::timeout(self.timeout, connect).await {
            Ok(Ok(_stream)) => {
                trace!(dc = dc_name, port = self.port, "Heartbeat port accepted");
                Ok(HeartbeatStatus::alive().with_service(ServiceHeartbeat {
                    service_name: format!("tcp/{}", self.port),
                    is_alive: true,
                    last_heartbeat_secs: 0,
                }))
            }
            Ok(Err(e)) => Err(Error::heartbeat(format!("{}:{}: {}", dc_name, self.port, e))),
            Err(_) => Err(Error::heartbeat(format!(
                "{}:{} did not answer within {:?}",
                dc_name, self.port, self.timeout
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn listening_port_is_alive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let client = TcpHeartbeat::new(port, Duration::from_secs(1));
        let status = client
            .heartbeat("127.0.0.1", &MachineCredentials::default())
            .await
            .unwrap();
        assert!(status.is_alive);
        assert_eq!(status.services[0].service_name, format!("tcp/{}", port));
    }

    #[tokio::test]
    async fn closed_port_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = TcpHeartbeat::new(port, Duration::from_secs(1));
        let result = client.heartbeat("127.0.0.1", &MachineCredentials::default()).await;
        assert!(matches!(result, Err(Error::Heartbeat(_))));
    }
}

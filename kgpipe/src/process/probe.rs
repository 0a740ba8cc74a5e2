//! Readiness probes for long-running stages.

use async_trait::async_trait;
use std::fmt::Debug;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::trace;

/// Checks whether a service endpoint is ready.
#[async_trait]
pub trait HealthProbe: Send + Sync + Debug {
    /// Returns true if the service at `host:port` is ready.
    async fn is_ready(&self, host: &str, port: u16) -> bool;
}

/// Treats a service as ready once it accepts a TCP connection.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    connect_timeout: Duration,
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(1),
        }
    }
}

impl TcpProbe {
    /// Creates a probe with the given per-attempt connect timeout.
    #[must_use]
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl HealthProbe for TcpProbe {
    async fn is_ready(&self, host: &str, port: u16) -> bool {
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(_stream)) => true,
            Ok(Err(e)) => {
                trace!(host, port, error = %e, "Readiness probe refused");
                false
            }
            Err(_) => {
                trace!(host, port, "Readiness probe timed out");
                false
            }
        }
    }
}

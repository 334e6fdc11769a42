//! Endpoint latency probing
//!
//! Measures TCP connect time to proxy endpoints. Used to pick or display
//! endpoints; it does not affect endpoint health.

use crate::config::ProxyEndpoint;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tracing::debug;

/// Probe errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProbeError {
    #[error("Connect timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connect failed: {0}")]
    Connect(String),
}

/// Latency of one endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub endpoint: String,
    pub addr: SocketAddr,
    pub latency: Result<Duration, ProbeError>,
}

impl ProbeResult {
    /// Latency in whole milliseconds, `None` when unreachable
    pub fn latency_ms(&self) -> Option<u64> {
        self.latency.as_ref().ok().map(|d| d.as_millis() as u64)
    }
}

/// Measure the TCP connect time to `addr`
pub async fn probe_endpoint(addr: SocketAddr, timeout: Duration) -> Result<Duration, ProbeError> {
    let started = Instant::now();
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(_stream)) => {
            let latency = started.elapsed();
            debug!("Probe {}: {:?}", addr, latency);
            Ok(latency)
        }
        Ok(Err(e)) => Err(ProbeError::Connect(e.to_string())),
        Err(_) => Err(ProbeError::Timeout(timeout)),
    }
}

/// Probe all endpoints concurrently; results keep the input order
pub async fn probe_endpoints(endpoints: &[ProxyEndpoint], timeout: Duration) -> Vec<ProbeResult> {
    let mut set = JoinSet::new();
    for (index, endpoint) in endpoints.iter().enumerate() {
        let addr = endpoint.addr;
        set.spawn(async move { (index, probe_endpoint(addr, timeout).await) });
    }

    let mut latencies: Vec<Option<Result<Duration, ProbeError>>> = vec![None; endpoints.len()];
    while let Some(joined) = set.join_next().await {
        if let Ok((index, latency)) = joined {
            latencies[index] = Some(latency);
        }
    }

    endpoints
        .iter()
        .zip(latencies)
        .map(|(endpoint, latency)| ProbeResult {
            endpoint: endpoint.name.clone(),
            addr: endpoint.addr,
            latency: latency.unwrap_or_else(|| Err(ProbeError::Connect("probe task failed".into()))),
        })
        .collect()
}

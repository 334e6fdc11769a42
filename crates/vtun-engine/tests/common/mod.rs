#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use vtun_engine::{
    DevicePeer, FlowId, Frame, ProxyCredentials, ProxyEndpoint, ProxyTransport, SessionError,
    TransportChannel, TunnelConfig, TunnelEvent, TunnelState,
};

/// Channel that echoes every payload back on the same flow
pub struct EchoChannel {
    tx: mpsc::UnboundedSender<Result<Frame, SessionError>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<Frame, SessionError>>>,
}

impl EchoChannel {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// Simulate the remote end dropping the connection
    pub fn kill(&self) {
        let _ = self.tx.send(Err(SessionError::ConnectionLost("reset by peer".into())));
    }
}

#[async_trait]
impl TransportChannel for EchoChannel {
    async fn send(&self, flow: FlowId, payload: &[u8]) -> Result<(), SessionError> {
        self.tx
            .send(Ok(Frame {
                flow,
                payload: payload.to_vec(),
            }))
            .map_err(|_| SessionError::Closed)
    }

    async fn recv(&self) -> Result<Frame, SessionError> {
        match self.rx.lock().await.recv().await {
            Some(result) => result,
            None => Err(SessionError::Closed),
        }
    }

    async fn close(&self) {
        let _ = self.tx.send(Err(SessionError::Closed));
    }
}

/// Scriptable proxy transport
#[derive(Default)]
pub struct MockTransport {
    connects: Mutex<HashMap<String, u32>>,
    failing: Mutex<HashSet<String>>,
    delay: Mutex<Option<Duration>>,
    channels: Mutex<Vec<Arc<EchoChannel>>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail(&self, endpoint: &str, fail: bool) {
        let mut failing = self.failing.lock();
        if fail {
            failing.insert(endpoint.to_string());
        } else {
            failing.remove(endpoint);
        }
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn connects(&self, endpoint: &str) -> u32 {
        self.connects.lock().get(endpoint).copied().unwrap_or(0)
    }

    pub fn total_connects(&self) -> u32 {
        self.connects.lock().values().sum()
    }

    pub fn channel(&self, index: usize) -> Arc<EchoChannel> {
        self.channels.lock()[index].clone()
    }
}

#[async_trait]
impl ProxyTransport for MockTransport {
    async fn connect(
        &self,
        endpoint: &ProxyEndpoint,
        _credentials: &ProxyCredentials,
    ) -> Result<Arc<dyn TransportChannel>, SessionError> {
        *self.connects.lock().entry(endpoint.name.clone()).or_default() += 1;

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().contains(&endpoint.name) {
            return Err(SessionError::HandshakeFailed("refused".into()));
        }

        let channel = Arc::new(EchoChannel::new());
        self.channels.lock().push(channel.clone());
        Ok(channel)
    }
}

pub fn endpoint(name: &str, port: u16) -> ProxyEndpoint {
    ProxyEndpoint::new(name, SocketAddr::from(([198, 51, 100, 7], port)))
}

/// Proxying configuration tuned for fast tests
pub fn proxied_config() -> TunnelConfig {
    let mut config = TunnelConfig::with_endpoints(vec![endpoint("e1", 443)]);
    config.bypass = vec!["192.168.0.0/16".parse().unwrap()];
    config.session.backoff_base_ms = 1;
    config.session.backoff_max_ms = 2;
    config.session.handshake_timeout_ms = 500;
    config.stats_interval_ms = None;
    config
}

/// Wait for a packet the engine wrote toward applications
pub async fn receive(peer: &DevicePeer) -> Option<Vec<u8>> {
    let peer = peer.clone();
    tokio::task::spawn_blocking(move || peer.receive(Duration::from_secs(2)))
        .await
        .ok()
        .flatten()
}

/// Poll `cond` until it holds or two seconds pass
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Collect state events until `last` is seen
pub async fn states_until(
    events: &mut broadcast::Receiver<TunnelEvent>,
    last: TunnelState,
) -> Vec<TunnelState> {
    let mut states = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while let Ok(Ok(event)) = tokio::time::timeout_at(deadline, events.recv()).await {
        if let TunnelEvent::State(state) = event {
            let done = state == last;
            states.push(state);
            if done {
                break;
            }
        }
    }
    states
}

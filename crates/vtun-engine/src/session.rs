//! Proxy Session Manager
//!
//! Maintains multiplexed sessions to the upstream proxy endpoints. Many flows
//! share one session; each session is driven by its own task that forwards
//! outbound packets to the transport and inbound frames to the engine.
//!
//! # Establishment
//!
//! A flow targets an endpoint group. The manager first reuses an Active
//! session of that group with spare capacity. Otherwise it tries the group's
//! endpoints in configuration order, skipping endpoints in cooldown. Each
//! endpoint gets up to `max_attempts` handshakes with exponential backoff and
//! jitter; after the last failure it is unhealthy for `cooldown`.
//! Establishment is serialized, so concurrent acquirers never open duplicate
//! sessions.
//!
//! # Session loss
//!
//! When a session dies unexpectedly its flows move to ReconnectPending and
//! one reconnect attempt is made. Flows that cannot be re-homed are removed
//! from the flow table and reported as [`SessionEvent::FlowFailed`].

use crate::config::{ProxyCredentials, ProxyEndpoint, SessionTuning, TunnelConfig};
use crate::flow::{FlowId, FlowState, FlowTable};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Session identifier
pub type SessionId = u64;

/// Packets queued toward one session
const OUTBOUND_QUEUE: usize = 1024;

/// How long a session task gets to finish after its channel is closed
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Rounds of acquisition when the chosen session dies before the flow binds
const BIND_ROUNDS: usize = 3;

/// A payload tagged with the flow it belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub flow: FlowId,
    pub payload: Vec<u8>,
}

/// An established, multiplexed connection to a proxy endpoint
#[async_trait]
pub trait TransportChannel: Send + Sync {
    /// Send a payload for a flow
    async fn send(&self, flow: FlowId, payload: &[u8]) -> Result<(), SessionError>;

    /// Receive the next frame. Must be cancel safe: the session task polls
    /// it inside `select!`.
    async fn recv(&self) -> Result<Frame, SessionError>;

    /// Close the connection; pending `recv` calls return an error
    async fn close(&self);
}

/// Opaque proxy protocol: performs the handshake and yields a channel
#[async_trait]
pub trait ProxyTransport: Send + Sync {
    async fn connect(
        &self,
        endpoint: &ProxyEndpoint,
        credentials: &ProxyCredentials,
    ) -> Result<Arc<dyn TransportChannel>, SessionError>;
}

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Handshaking,
    Active,
    Closing,
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Handshaking => write!(f, "handshaking"),
            SessionState::Active => write!(f, "active"),
            SessionState::Closing => write!(f, "closing"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// Snapshot of a session
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: SessionId,
    pub endpoint: String,
    pub group: String,
    pub state: SessionState,
    pub flows: Vec<FlowId>,
    pub created_at: Instant,
}

/// Endpoint health record
#[derive(Debug, Clone)]
pub struct EndpointHealth {
    pub endpoint: String,
    pub group: String,
    /// Handshake failures since the last success
    pub consecutive_failures: u32,
    pub failures: u64,
    pub successes: u64,
    pub last_error: Option<String>,
    pub last_success: Option<Instant>,
    /// Skipped by acquisitions until this instant
    pub unhealthy_until: Option<Instant>,
}

impl EndpointHealth {
    fn new(endpoint: &ProxyEndpoint) -> Self {
        Self {
            endpoint: endpoint.name.clone(),
            group: endpoint.group.clone(),
            consecutive_failures: 0,
            failures: 0,
            successes: 0,
            last_error: None,
            last_success: None,
            unhealthy_until: None,
        }
    }

    /// Time left in the cooldown, if the endpoint is unhealthy
    pub fn cooldown_remaining(&self) -> Option<Duration> {
        let until = self.unhealthy_until?;
        let now = Instant::now();
        (until > now).then(|| until - now)
    }

    /// Check if acquisitions may use this endpoint
    pub fn is_healthy(&self) -> bool {
        self.cooldown_remaining().is_none()
    }

    fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.successes += 1;
        self.last_success = Some(Instant::now());
        self.unhealthy_until = None;
    }

    fn record_failure(&mut self, error: &SessionError) {
        self.consecutive_failures += 1;
        self.failures += 1;
        self.last_error = Some(error.to_string());
    }

    fn mark_unhealthy(&mut self, cooldown: Duration) {
        self.unhealthy_until = Some(Instant::now() + cooldown);
    }
}

/// Notifications from the session manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A session died unexpectedly
    SessionLost {
        session: SessionId,
        endpoint: String,
        reason: String,
    },
    /// A flow could not be re-homed after its session was lost
    FlowFailed { flow: FlowId, reason: String },
}

/// Session errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// `retry_in` is set when every endpoint of the group is cooling down
    #[error("No session available for group '{group}'")]
    NoSessionAvailable {
        group: String,
        retry_in: Option<Duration>,
    },

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Session {0} not found")]
    SessionNotFound(SessionId),

    #[error("Flow {0} closed before it was bound")]
    FlowClosed(FlowId),

    #[error("Session manager closed")]
    Closed,

    #[error("Transport error: {0}")]
    Transport(String),
}

struct SessionLink {
    outbound: mpsc::Sender<(FlowId, Vec<u8>)>,
    channel: Arc<dyn TransportChannel>,
    task: JoinHandle<()>,
}

struct SessionEntry {
    endpoint: ProxyEndpoint,
    state: SessionState,
    flows: HashSet<FlowId>,
    created_at: Instant,
    link: Option<SessionLink>,
}

struct Inner {
    transport: Arc<dyn ProxyTransport>,
    endpoints: Vec<ProxyEndpoint>,
    credentials: ProxyCredentials,
    tuning: SessionTuning,
    default_group: String,
    sessions: Mutex<HashMap<SessionId, SessionEntry>>,
    health: Mutex<HashMap<String, EndpointHealth>>,
    flows: Arc<FlowTable>,
    inbound: mpsc::Sender<Frame>,
    events: mpsc::UnboundedSender<SessionEvent>,
    establish: tokio::sync::Mutex<()>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

/// Proxy session manager
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    /// Create a manager for the endpoints of a configuration
    ///
    /// Frames received from any session are delivered on `inbound`.
    pub fn new(
        transport: Arc<dyn ProxyTransport>,
        config: &TunnelConfig,
        flows: Arc<FlowTable>,
        inbound: mpsc::Sender<Frame>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let health = config
            .endpoints
            .iter()
            .map(|e| (e.name.clone(), EndpointHealth::new(e)))
            .collect();

        Self {
            inner: Arc::new(Inner {
                transport,
                endpoints: config.endpoints.clone(),
                credentials: config.credentials.clone(),
                tuning: config.session.clone(),
                default_group: config.default_group.clone(),
                sessions: Mutex::new(HashMap::new()),
                health: Mutex::new(health),
                flows,
                inbound,
                events,
                establish: tokio::sync::Mutex::new(()),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Establish the first session of the default group
    ///
    /// Returns `None` when there are no endpoints (pure bypass).
    pub async fn warm_up(&self) -> Result<Option<SessionId>, SessionError> {
        if self.inner.endpoints.is_empty() {
            return Ok(None);
        }
        let group = self.inner.default_group.clone();
        self.session_for(&group, None).await.map(Some)
    }

    /// Attach a flow to an existing session without establishing one
    pub fn try_attach(&self, flow: FlowId, group: &str) -> Option<SessionId> {
        let id = self.inner.pick(group, Some(flow))?;
        self.inner.bind(flow, id).ok().map(|()| id)
    }

    /// Get a session for a proxied flow, establishing one if needed
    ///
    /// On success the flow is bound to the session and marked Active. Fails
    /// with [`SessionError::FlowClosed`] when the flow left the table first.
    pub async fn acquire(&self, flow: FlowId, group: &str) -> Result<SessionId, SessionError> {
        for _ in 0..BIND_ROUNDS {
            let id = self.session_for(group, Some(flow)).await?;
            match self.inner.bind(flow, id) {
                Ok(()) => return Ok(id),
                Err(SessionError::SessionNotFound(_)) => {
                    debug!("Session {} lost before flow {} was bound, retrying", id, flow);
                }
                Err(e) => return Err(e),
            }
        }
        Err(SessionError::ConnectionLost(format!(
            "sessions of group '{}' keep failing",
            group
        )))
    }

    /// Whether the group has no Active session and every endpoint in it is
    /// cooling down
    pub fn group_exhausted(&self, group: &str) -> bool {
        let inner = &self.inner;
        let active = inner
            .sessions
            .lock()
            .values()
            .any(|e| e.state == SessionState::Active && e.endpoint.group == group);
        !active
            && inner
                .endpoints
                .iter()
                .filter(|e| e.group == group)
                .all(|e| inner.cooldown_remaining(&e.name).is_some())
    }

    /// Find or establish a session of `group`; a given flow holds a
    /// reserved slot on it but is not bound yet
    async fn session_for(&self, group: &str, flow: Option<FlowId>) -> Result<SessionId, SessionError> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(SessionError::Closed);
        }
        if let Some(id) = inner.pick(group, flow) {
            return Ok(id);
        }

        let _guard = inner.establish.lock().await;
        // Another acquirer may have established one while we waited
        if let Some(id) = inner.pick(group, flow) {
            return Ok(id);
        }

        let candidates: Vec<ProxyEndpoint> = inner
            .endpoints
            .iter()
            .filter(|e| e.group == group)
            .cloned()
            .collect();
        if candidates.is_empty() {
            return Err(SessionError::NoSessionAvailable {
                group: group.to_string(),
                retry_in: None,
            });
        }

        let mut cooling: Option<Duration> = None;
        let mut tried = false;
        for endpoint in &candidates {
            if let Some(remaining) = inner.cooldown_remaining(&endpoint.name) {
                debug!("Skipping unhealthy endpoint {} ({:?} left)", endpoint, remaining);
                cooling = Some(cooling.map_or(remaining, |c| c.min(remaining)));
                continue;
            }
            tried = true;
            match inner.establish_with_retry(endpoint, flow).await {
                Ok(id) => return Ok(id),
                Err(SessionError::Closed) => return Err(SessionError::Closed),
                Err(e) => warn!("Endpoint {} failed: {}", endpoint, e),
            }
        }

        Err(SessionError::NoSessionAvailable {
            group: group.to_string(),
            retry_in: if tried { None } else { cooling },
        })
    }

    /// Forward a packet of a flow through its session
    pub async fn send(&self, session: SessionId, flow: FlowId, payload: Vec<u8>) -> Result<(), SessionError> {
        let outbound = {
            let sessions = self.inner.sessions.lock();
            match sessions.get(&session) {
                Some(SessionEntry { state: SessionState::Active, link: Some(link), .. }) => link.outbound.clone(),
                _ => return Err(SessionError::SessionNotFound(session)),
            }
        };
        outbound
            .send((flow, payload))
            .await
            .map_err(|_| SessionError::Closed)
    }

    /// Detach a flow from its session; the session stays open
    pub fn release(&self, flow: FlowId, session: SessionId) {
        if let Some(entry) = self.inner.sessions.lock().get_mut(&session) {
            entry.flows.remove(&flow);
        }
    }

    /// Close every session and wait for their tasks
    pub async fn shutdown_all(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let entries: Vec<(SessionId, SessionEntry)> = self.inner.sessions.lock().drain().collect();

        for (id, mut entry) in entries {
            entry.state = SessionState::Closing;
            if let Some(link) = entry.link.take() {
                drop(link.outbound);
                link.channel.close().await;
                let mut task = link.task;
                if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                    warn!("Session {} task did not stop in time, aborting", id);
                    task.abort();
                }
            }
            debug!("Session {} to {} closed", id, entry.endpoint);
        }
        info!("All proxy sessions closed");
    }

    /// Snapshot of every open session
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let sessions = self.inner.sessions.lock();
        let mut infos: Vec<SessionInfo> = sessions
            .iter()
            .map(|(id, entry)| SessionInfo {
                id: *id,
                endpoint: entry.endpoint.name.clone(),
                group: entry.endpoint.group.clone(),
                state: entry.state,
                flows: entry.flows.iter().copied().collect(),
                created_at: entry.created_at,
            })
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    /// Number of sessions that completed their handshake
    pub fn active_sessions(&self) -> usize {
        self.inner
            .sessions
            .lock()
            .values()
            .filter(|entry| entry.state == SessionState::Active)
            .count()
    }

    /// Health of every endpoint, in configuration order
    pub fn endpoint_health(&self) -> Vec<EndpointHealth> {
        let health = self.inner.health.lock();
        self.inner
            .endpoints
            .iter()
            .filter_map(|e| health.get(&e.name).cloned())
            .collect()
    }
}

impl Inner {
    /// Pick the least loaded Active session of a group with spare capacity,
    /// reserving a slot for `flow`
    fn pick(&self, group: &str, flow: Option<FlowId>) -> Option<SessionId> {
        let mut sessions = self.sessions.lock();
        let (id, entry) = sessions
            .iter_mut()
            .filter(|(_, e)| {
                e.state == SessionState::Active
                    && e.endpoint.group == group
                    && e.flows.len() < self.tuning.max_flows_per_session
            })
            .min_by_key(|(id, e)| (e.flows.len(), **id))?;
        if let Some(flow) = flow {
            entry.flows.insert(flow);
        }
        Some(*id)
    }

    /// Reserve a slot on a specific session
    fn attach(&self, session: SessionId, flow: FlowId) -> bool {
        match self.sessions.lock().get_mut(&session) {
            Some(entry)
                if entry.state == SessionState::Active
                    && entry.flows.len() < self.tuning.max_flows_per_session =>
            {
                entry.flows.insert(flow);
                true
            }
            _ => false,
        }
    }

    /// Record a reserved slot in the flow table
    ///
    /// Runs under the sessions lock: a session removed by `session_lost`
    /// either misses the flow here or finds it in `detach_session`.
    fn bind(&self, flow: FlowId, session: SessionId) -> Result<(), SessionError> {
        let mut sessions = self.sessions.lock();
        let reserved = sessions
            .get(&session)
            .is_some_and(|e| e.state == SessionState::Active && e.flows.contains(&flow));
        if !reserved {
            return Err(SessionError::SessionNotFound(session));
        }
        if self.flows.assign_session(flow, session) {
            return Ok(());
        }

        debug!("Flow {} gone before binding to session {}", flow, session);
        if let Some(entry) = sessions.get_mut(&session) {
            entry.flows.remove(&flow);
        }
        Err(SessionError::FlowClosed(flow))
    }

    fn cooldown_remaining(&self, endpoint: &str) -> Option<Duration> {
        self.health.lock().get(endpoint)?.cooldown_remaining()
    }

    fn with_health(&self, endpoint: &str, f: impl FnOnce(&mut EndpointHealth)) {
        if let Some(health) = self.health.lock().get_mut(endpoint) {
            f(health);
        }
    }

    /// Backoff before retry `attempt`, with up to 25% random jitter
    fn retry_delay(&self, attempt: u32) -> Duration {
        let base = self.tuning.backoff(attempt);
        let spread = (base.as_millis() as u64) / 4;
        let jitter = if spread > 0 {
            rand::thread_rng().gen_range(0..=spread)
        } else {
            0
        };
        base + Duration::from_millis(jitter)
    }

    async fn establish_with_retry(
        self: &Arc<Self>,
        endpoint: &ProxyEndpoint,
        flow: Option<FlowId>,
    ) -> Result<SessionId, SessionError> {
        let max = self.tuning.max_attempts.max(1);
        let mut last = SessionError::NoSessionAvailable {
            group: endpoint.group.clone(),
            retry_in: None,
        };

        for attempt in 1..=max {
            match self.establish(endpoint, flow).await {
                Ok(id) => {
                    self.with_health(&endpoint.name, |h| h.record_success());
                    return Ok(id);
                }
                Err(SessionError::Closed) => return Err(SessionError::Closed),
                Err(e) => {
                    debug!("Handshake {}/{} with {} failed: {}", attempt, max, endpoint, e);
                    self.with_health(&endpoint.name, |h| h.record_failure(&e));
                    last = e;
                    if attempt < max {
                        tokio::time::sleep(self.retry_delay(attempt)).await;
                    }
                }
            }
        }

        let cooldown = self.tuning.cooldown();
        self.with_health(&endpoint.name, |h| h.mark_unhealthy(cooldown));
        warn!(
            "Endpoint {} unhealthy after {} failed handshakes, cooling down for {:?}",
            endpoint, max, cooldown
        );
        Err(last)
    }

    /// One handshake; on success the session is Active and `flow` (if any)
    /// holds a slot on it
    async fn establish(
        self: &Arc<Self>,
        endpoint: &ProxyEndpoint,
        flow: Option<FlowId>,
    ) -> Result<SessionId, SessionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SessionError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sessions.lock().insert(
            id,
            SessionEntry {
                endpoint: endpoint.clone(),
                state: SessionState::Handshaking,
                flows: HashSet::new(),
                created_at: Instant::now(),
                link: None,
            },
        );
        debug!("Session {} handshaking with {}", id, endpoint);

        let timeout = self.tuning.handshake_timeout();
        let connect = self.transport.connect(endpoint, &self.credentials);
        let channel = match tokio::time::timeout(timeout, connect).await {
            Ok(Ok(channel)) => channel,
            Ok(Err(e)) => {
                self.sessions.lock().remove(&id);
                return Err(e);
            }
            Err(_) => {
                self.sessions.lock().remove(&id);
                return Err(SessionError::HandshakeTimeout(timeout));
            }
        };

        let (outbound, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let task = tokio::spawn(run_session(
            Arc::downgrade(self),
            id,
            channel.clone(),
            rx,
            self.inbound.clone(),
        ));

        let installed = {
            let mut sessions = self.sessions.lock();
            match sessions.get_mut(&id) {
                Some(entry) if !self.closed.load(Ordering::Acquire) => {
                    entry.state = SessionState::Active;
                    if let Some(flow) = flow {
                        entry.flows.insert(flow);
                    }
                    entry.link = Some(SessionLink {
                        outbound,
                        channel: channel.clone(),
                        task,
                    });
                    true
                }
                _ => {
                    sessions.remove(&id);
                    task.abort();
                    false
                }
            }
        };

        if !installed {
            channel.close().await;
            return if self.closed.load(Ordering::Acquire) {
                Err(SessionError::Closed)
            } else {
                Err(SessionError::ConnectionLost("session closed during handshake".into()))
            };
        }

        info!("Session {} established with {}", id, endpoint);
        Ok(id)
    }

    /// Called from a session task whose channel failed
    fn session_lost(self: &Arc<Self>, id: SessionId, error: SessionError) {
        let Some(entry) = self.sessions.lock().remove(&id) else {
            // Closed on purpose
            return;
        };
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        let reason = error.to_string();
        warn!("Session {} to {} lost: {}", id, entry.endpoint, reason);
        self.with_health(&entry.endpoint.name, |h| h.last_error = Some(reason.clone()));
        let _ = self.events.send(SessionEvent::SessionLost {
            session: id,
            endpoint: entry.endpoint.name.clone(),
            reason: reason.clone(),
        });

        let flows = self.flows.detach_session(id);
        if flows.is_empty() {
            return;
        }
        let inner = self.clone();
        tokio::spawn(async move {
            inner.reconnect(entry.endpoint, flows, reason).await;
        });
    }

    /// Re-home the flows of a lost session with a single reconnect attempt
    async fn reconnect(self: Arc<Self>, lost: ProxyEndpoint, flows: Vec<FlowId>, reason: String) {
        info!("Reconnecting {} flows from {}", flows.len(), lost);
        let group = lost.group.clone();

        let replacement = {
            let _guard = self.establish.lock().await;
            match self.pick(&group, None) {
                Some(id) => Some(id),
                None => self.reconnect_once(&group).await,
            }
        };

        for flow in flows {
            let session = replacement
                .filter(|id| self.attach(*id, flow))
                .or_else(|| self.pick(&group, Some(flow)));

            match session.map(|id| (id, self.bind(flow, id))) {
                Some((id, Ok(()))) => debug!("Flow {} moved to session {}", flow, id),
                Some((_, Err(SessionError::FlowClosed(_)))) => {}
                _ => self.fail_flow(flow, &reason),
            }
        }
    }

    async fn reconnect_once(self: &Arc<Self>, group: &str) -> Option<SessionId> {
        let endpoint = self
            .endpoints
            .iter()
            .find(|e| e.group == group && self.cooldown_remaining(&e.name).is_none())?
            .clone();

        match self.establish(&endpoint, None).await {
            Ok(id) => {
                self.with_health(&endpoint.name, |h| h.record_success());
                Some(id)
            }
            Err(e) => {
                warn!("Reconnect to {} failed: {}", endpoint, e);
                self.with_health(&endpoint.name, |h| h.record_failure(&e));
                None
            }
        }
    }

    fn fail_flow(&self, flow: FlowId, reason: &str) {
        // Only flows still waiting for a new session are failed
        let pending = self
            .flows
            .get(flow)
            .is_some_and(|f| f.state == FlowState::ReconnectPending);
        if pending && self.flows.remove(flow).is_some() {
            warn!("Flow {} failed: {}", flow, reason);
            let _ = self.events.send(SessionEvent::FlowFailed {
                flow,
                reason: reason.to_string(),
            });
        }
    }
}

/// Drive one session: outbound packets to the transport, frames to the engine
async fn run_session(
    inner: Weak<Inner>,
    id: SessionId,
    channel: Arc<dyn TransportChannel>,
    mut outbound: mpsc::Receiver<(FlowId, Vec<u8>)>,
    inbound: mpsc::Sender<Frame>,
) {
    let error = loop {
        tokio::select! {
            msg = outbound.recv() => match msg {
                Some((flow, payload)) => {
                    if let Err(e) = channel.send(flow, &payload).await {
                        break e;
                    }
                }
                None => {
                    channel.close().await;
                    return;
                }
            },
            frame = channel.recv() => match frame {
                Ok(frame) => {
                    if inbound.send(frame).await.is_err() {
                        channel.close().await;
                        return;
                    }
                }
                Err(e) => break e,
            },
        }
    };

    channel.close().await;
    if let Some(inner) = inner.upgrade() {
        inner.session_lost(id, error);
    }
}

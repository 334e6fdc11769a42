//! Lifecycle Controller
//!
//! Owns the tunnel state machine and wires the other components together:
//!
//! ```text
//! Stopped ──start──▶ Starting ──▶ Running ──stop──▶ Stopping ──▶ Stopped
//!                       │            │
//!                       └──failure───┴──▶ Error ──cleanup──▶ Stopped
//! ```
//!
//! While Running:
//! - a reader thread pulls packets off the virtual device,
//! - the dispatcher classifies them, tracks flows and forwards proxied
//!   packets to their session,
//! - the inbound task writes frames from sessions back to the device,
//! - the reaper removes idle flows,
//! - the supervisor turns fatal component failures into Error → Stopped.
//!
//! State changes are pushed on the event feed at transition time.
//!
//! # Usage
//!
//! ```rust,ignore
//! let engine = TunnelEngine::builder(provider, transport).build();
//! let mut events = engine.subscribe();
//!
//! engine.start(TunnelConfig::from_file(path)?).await?;
//! // ...
//! engine.stop().await;
//! ```

use crate::capture::{CaptureError, CaptureInterface, DeviceProvider};
use crate::classify::{AppResolver, Decision, NoAppResolver, RoutingClassifier};
use crate::config::{ConfigError, TunnelConfig};
use crate::flow::{Flow, FlowId, FlowState, FlowTable, NewFlow};
use crate::packet::{ClassificationError, FiveTuple};
use crate::session::{
    EndpointHealth, Frame, ProxyTransport, SessionError, SessionEvent, SessionId, SessionInfo,
    SessionManager,
};
use crate::stats::{StatsSnapshot, TrafficAccounting};
use ipnet::IpNet;
use parking_lot::{Mutex, RwLock};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Packets queued between the reader thread and the dispatcher
const PACKET_QUEUE: usize = 4096;

/// Frames queued between sessions and the device writer
const INBOUND_QUEUE: usize = 4096;

/// Event feed capacity; slow subscribers skip ahead
const EVENT_CAPACITY: usize = 256;

/// Largest packet read from the device
const READ_BUFFER: usize = 65_535;

/// Engine version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Tunnel lifecycle state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelState {
    Stopped,
    Starting,
    Running,
    Stopping,
    /// Irrecoverable failure; cleanup follows immediately
    Error(String),
}

impl TunnelState {
    /// Check if the tunnel is carrying traffic
    pub fn is_running(&self) -> bool {
        matches!(self, TunnelState::Running)
    }

    /// Check if the tunnel holds no resources
    pub fn is_stopped(&self) -> bool {
        matches!(self, TunnelState::Stopped)
    }

    /// Short lowercase name for logs and UIs
    pub fn name(&self) -> &'static str {
        match self {
            TunnelState::Stopped => "stopped",
            TunnelState::Starting => "starting",
            TunnelState::Running => "running",
            TunnelState::Stopping => "stopping",
            TunnelState::Error(_) => "error",
        }
    }
}

impl std::fmt::Display for TunnelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelState::Error(reason) => write!(f, "error ({})", reason),
            other => write!(f, "{}", other.name()),
        }
    }
}

/// Event feed item
#[derive(Debug, Clone)]
pub enum TunnelEvent {
    /// The tunnel entered a new state
    State(TunnelState),
    /// Periodic traffic statistics
    Stats(StatsSnapshot),
    /// A proxied flow was given up
    FlowFailed { flow: FlowId, reason: String },
}

/// Error category, for callers that branch on the kind of failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    PermissionDenied,
    Capture,
    Session,
    Classification,
    NotRunning,
    ShutDown,
}

/// Engine errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Classification error: {0}")]
    Classification(#[from] ClassificationError),

    #[error("Tunnel not running")]
    NotRunning,

    #[error("Engine has been shut down")]
    ShutDown,
}

impl EngineError {
    /// Get the error category
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Config(_) => ErrorKind::Config,
            EngineError::Capture(CaptureError::PermissionDenied) => ErrorKind::PermissionDenied,
            EngineError::Capture(_) => ErrorKind::Capture,
            EngineError::Session(_) => ErrorKind::Session,
            EngineError::Classification(_) => ErrorKind::Classification,
            EngineError::NotRunning => ErrorKind::NotRunning,
            EngineError::ShutDown => ErrorKind::ShutDown,
        }
    }
}

/// Delivery of Direct packets that still reached the device
///
/// Bypass ranges are excluded from capture, so only the host app's own
/// traffic and pure bypass mode end up here.
pub trait DirectPath: Send + Sync {
    fn forward(&self, flow: &Flow, packet: &[u8]);
}

/// Direct path that discards packets
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardDirect;

impl DirectPath for DiscardDirect {
    fn forward(&self, flow: &Flow, packet: &[u8]) {
        trace!("Discarding {} direct bytes of flow {}", packet.len(), flow.id);
    }
}

/// Builder for [`TunnelEngine`]
pub struct TunnelEngineBuilder {
    provider: Arc<dyn DeviceProvider>,
    transport: Arc<dyn ProxyTransport>,
    resolver: Arc<dyn AppResolver>,
    direct: Arc<dyn DirectPath>,
}

impl TunnelEngineBuilder {
    /// Set the lookup for the app owning a flow
    pub fn app_resolver(mut self, resolver: Arc<dyn AppResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Set where Direct packets go
    pub fn direct_path(mut self, direct: Arc<dyn DirectPath>) -> Self {
        self.direct = direct;
        self
    }

    /// Build a stopped engine
    pub fn build(self) -> TunnelEngine {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        TunnelEngine {
            inner: Arc::new(Inner {
                provider: self.provider,
                transport: self.transport,
                resolver: self.resolver,
                direct: self.direct,
                state: RwLock::new(TunnelState::Stopped),
                events,
                control: tokio::sync::Mutex::new(()),
                running: Mutex::new(None),
                generation: AtomicU64::new(0),
                shut_down: AtomicBool::new(false),
            }),
        }
    }
}

/// Resources of one Running period
struct Running {
    generation: u64,
    config: TunnelConfig,
    capture: Arc<CaptureInterface>,
    sessions: SessionManager,
    flows: Arc<FlowTable>,
    accounting: Arc<TrafficAccounting>,
    tasks: Vec<JoinHandle<()>>,
    reader: Option<thread::JoinHandle<()>>,
}

struct Inner {
    provider: Arc<dyn DeviceProvider>,
    transport: Arc<dyn ProxyTransport>,
    resolver: Arc<dyn AppResolver>,
    direct: Arc<dyn DirectPath>,
    /// Written only by the lifecycle paths below
    state: RwLock<TunnelState>,
    events: broadcast::Sender<TunnelEvent>,
    /// Serializes start, stop and failure handling
    control: tokio::sync::Mutex<()>,
    running: Mutex<Option<Running>>,
    generation: AtomicU64,
    shut_down: AtomicBool,
}

/// Local VPN tunnel engine
#[derive(Clone)]
pub struct TunnelEngine {
    inner: Arc<Inner>,
}

impl TunnelEngine {
    /// Start building an engine around a device provider and a proxy transport
    pub fn builder(provider: Arc<dyn DeviceProvider>, transport: Arc<dyn ProxyTransport>) -> TunnelEngineBuilder {
        TunnelEngineBuilder {
            provider,
            transport,
            resolver: Arc::new(NoAppResolver),
            direct: Arc::new(DiscardDirect),
        }
    }

    /// Current state
    pub fn state(&self) -> TunnelState {
        self.inner.state.read().clone()
    }

    /// Attach to the event feed
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.inner.events.subscribe()
    }

    /// Publish the current state on the event feed and return the version
    pub fn init(&self) -> &'static str {
        let _ = self.inner.events.send(TunnelEvent::State(self.state()));
        version()
    }

    /// Engine version
    pub fn version(&self) -> &'static str {
        version()
    }

    /// Whether the device provider is authorized
    pub fn has_permission(&self) -> bool {
        self.inner.provider.has_permission()
    }

    /// Start the tunnel
    ///
    /// Only acts from Stopped; in any other state returns the current state
    /// without touching anything. An invalid configuration fails before any
    /// resource is acquired.
    pub async fn start(&self, config: TunnelConfig) -> Result<TunnelState, EngineError> {
        if self.inner.shut_down.load(Ordering::Acquire) {
            return Err(EngineError::ShutDown);
        }
        let current = self.state();
        if !current.is_stopped() {
            debug!("Start ignored while {}", current);
            return Ok(current);
        }
        config.validate()?;

        let _control = self.inner.control.lock().await;
        let current = self.state();
        if !current.is_stopped() {
            return Ok(current);
        }

        self.inner.set_state(TunnelState::Starting);
        let mut cancelled = CancelGuard::new(&self.inner);
        info!(
            "Starting tunnel '{}' ({}, {} endpoints)",
            config.session_name,
            config.address,
            config.endpoints.len()
        );

        let result = self.inner.bring_up(config).await;
        cancelled.disarm();
        match result {
            Ok(running) => {
                *self.inner.running.lock() = Some(running);
                self.inner.set_state(TunnelState::Running);
                Ok(TunnelState::Running)
            }
            Err(e) => {
                error!("Tunnel start failed: {}", e);
                self.inner.set_state(TunnelState::Error(e.to_string()));
                self.inner.set_state(TunnelState::Stopped);
                Err(e)
            }
        }
    }

    /// Stop the tunnel; always ends in Stopped
    ///
    /// A stop issued during Starting waits for the start to finish first.
    pub async fn stop(&self) -> TunnelState {
        let _control = self.inner.control.lock().await;
        let current = self.state();
        if matches!(current, TunnelState::Stopped | TunnelState::Stopping) {
            return current;
        }

        self.inner.set_state(TunnelState::Stopping);
        self.inner.teardown().await;
        self.inner.set_state(TunnelState::Stopped);
        TunnelState::Stopped
    }

    /// Stop, then start again with the current configuration
    pub async fn restart(&self) -> Result<TunnelState, EngineError> {
        let config = self.config().ok_or(EngineError::NotRunning)?;
        self.stop().await;
        self.start(config).await
    }

    /// Stop and refuse further starts
    pub async fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::Release);
        self.stop().await;
        info!("Engine shut down");
    }

    /// Configuration of the running tunnel, including live DNS/route changes
    pub fn config(&self) -> Option<TunnelConfig> {
        self.inner.running.lock().as_ref().map(|r| r.config.clone())
    }

    /// Replace the DNS servers
    ///
    /// Returns whether the device applied them live; otherwise they take
    /// effect on the next restart.
    pub fn set_dns(&self, servers: Vec<IpAddr>) -> Result<bool, EngineError> {
        let mut running = self.inner.running.lock();
        let running = running.as_mut().ok_or(EngineError::NotRunning)?;
        let applied = live_update("DNS servers", running.capture.update_dns(&servers));
        running.config.dns = servers;
        Ok(applied)
    }

    /// Replace the captured routes
    ///
    /// Returns whether the device applied them live; otherwise they take
    /// effect on the next restart.
    pub fn set_routes(&self, routes: Vec<IpNet>) -> Result<bool, EngineError> {
        let mut running = self.inner.running.lock();
        let running = running.as_mut().ok_or(EngineError::NotRunning)?;
        let applied = live_update("routes", running.capture.update_routes(&routes));
        running.config.routes = routes;
        Ok(applied)
    }

    /// Current traffic statistics
    pub fn snapshot(&self) -> Option<StatsSnapshot> {
        self.inner.running.lock().as_ref().map(|r| r.accounting.snapshot())
    }

    /// Number of tracked flows
    pub fn flow_count(&self) -> usize {
        self.inner.running.lock().as_ref().map_or(0, |r| r.flows.len())
    }

    /// Look up a flow by 5-tuple
    pub fn flow(&self, key: &FiveTuple) -> Option<Flow> {
        let flows = self.inner.running.lock().as_ref()?.flows.clone();
        flows.get_by_key(key)
    }

    /// Run a reap pass now; returns the number of flows removed
    pub fn reap_idle_flows(&self) -> usize {
        let parts = self.inner.running.lock().as_ref().map(|r| {
            (
                r.flows.clone(),
                r.sessions.clone(),
                r.accounting.clone(),
                r.config.flow_idle_timeout(),
            )
        });
        match parts {
            Some((flows, sessions, accounting, idle)) => reap_idle(&flows, &sessions, &accounting, idle),
            None => 0,
        }
    }

    /// Health of every configured endpoint
    pub fn endpoint_health(&self) -> Vec<EndpointHealth> {
        self.inner
            .running
            .lock()
            .as_ref()
            .map(|r| r.sessions.endpoint_health())
            .unwrap_or_default()
    }

    /// Open proxy sessions
    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.inner
            .running
            .lock()
            .as_ref()
            .map(|r| r.sessions.sessions())
            .unwrap_or_default()
    }
}

/// Puts the state back to Stopped when a `start` future is dropped
/// mid-way; resources held by the dropped future release themselves
struct CancelGuard<'a> {
    inner: &'a Inner,
    armed: bool,
}

impl<'a> CancelGuard<'a> {
    fn new(inner: &'a Inner) -> Self {
        Self { inner, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CancelGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!("Tunnel start cancelled");
            self.inner.set_state(TunnelState::Stopped);
        }
    }
}

fn live_update(what: &str, result: Result<(), CaptureError>) -> bool {
    match result {
        Ok(()) => {
            info!("Applied new {} to the live device", what);
            true
        }
        Err(CaptureError::Unsupported) => {
            info!("Device cannot change {} live; applying on next restart", what);
            false
        }
        Err(e) => {
            warn!("Failed to apply {}: {}; applying on next restart", what, e);
            false
        }
    }
}

impl Inner {
    fn set_state(&self, state: TunnelState) {
        {
            let mut current = self.state.write();
            if *current == state {
                return;
            }
            debug!("Tunnel state {} -> {}", *current, state);
            *current = state.clone();
        }
        info!("Tunnel {}", state);
        let _ = self.events.send(TunnelEvent::State(state));
    }

    /// Open the device, establish the first session and start the tasks
    async fn bring_up(self: &Arc<Self>, config: TunnelConfig) -> Result<Running, EngineError> {
        let (capture, report) = CaptureInterface::open(self.provider.as_ref(), &config)?;
        if !report.skipped.is_empty() {
            warn!("{} entries rejected by the device: {:?}", report.skipped.len(), report.skipped);
        }
        let capture = Arc::new(capture);

        let flows = Arc::new(FlowTable::new());
        let accounting = Arc::new(TrafficAccounting::new());
        let (frames_tx, frames_rx) = mpsc::channel(INBOUND_QUEUE);
        let (session_events_tx, session_events_rx) = mpsc::unbounded_channel();
        let sessions = SessionManager::new(
            self.transport.clone(),
            &config,
            flows.clone(),
            frames_tx,
            session_events_tx,
        );

        match sessions.warm_up().await {
            Ok(Some(session)) => debug!("Control session {} ready", session),
            Ok(None) => info!("No proxy endpoints, running in pure bypass mode"),
            Err(e) => {
                sessions.shutdown_all().await;
                capture.close();
                return Err(e.into());
            }
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let (packets_tx, packets_rx) = mpsc::channel(PACKET_QUEUE);
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel::<String>();

        let reader = match spawn_reader(capture.clone(), packets_tx, fatal_tx.clone()) {
            Ok(reader) => reader,
            Err(e) => {
                sessions.shutdown_all().await;
                capture.close();
                return Err(CaptureError::Io(e.to_string()).into());
            }
        };

        let pipeline = Arc::new(Pipeline {
            classifier: RoutingClassifier::new(&config),
            resolver: self.resolver.clone(),
            direct: self.direct.clone(),
            flows: flows.clone(),
            sessions: sessions.clone(),
            accounting: accounting.clone(),
            events: self.events.clone(),
            fatal: fatal_tx.clone(),
            default_group: config.default_group.clone(),
        });

        let mut tasks = vec![
            spawn_dispatcher(pipeline, packets_rx),
            spawn_inbound(capture.clone(), flows.clone(), accounting.clone(), frames_rx, fatal_tx),
            spawn_session_events(accounting.clone(), self.events.clone(), session_events_rx),
            spawn_reaper(
                flows.clone(),
                sessions.clone(),
                accounting.clone(),
                config.flow_idle_timeout(),
                config.reap_interval(),
            ),
            spawn_supervisor(Arc::downgrade(self), generation, fatal_rx),
        ];
        if let Some(interval) = config.stats_interval() {
            tasks.push(spawn_stats_push(accounting.clone(), self.events.clone(), interval));
        }

        Ok(Running {
            generation,
            config,
            capture,
            sessions,
            flows,
            accounting,
            tasks,
            reader: Some(reader),
        })
    }

    /// Release everything of the current Running period: sessions first,
    /// then the device
    async fn teardown(&self) {
        let Some(mut running) = self.running.lock().take() else {
            return;
        };

        for task in &running.tasks {
            task.abort();
        }
        running.sessions.shutdown_all().await;
        running.capture.close();

        if let Some(reader) = running.reader.take() {
            let joined = tokio::task::spawn_blocking(move || reader.join()).await;
            if !matches!(joined, Ok(Ok(()))) {
                warn!("Capture reader did not exit cleanly");
            }
        }

        let flows = running.flows.len();
        running.flows.clear();
        info!("Tunnel resources released ({} flows dropped)", flows);
    }

    /// Handle a fatal signal from the Running period `generation`
    async fn fail(self: Arc<Self>, generation: u64, reason: String) {
        let _control = self.control.lock().await;
        let current = self.running.lock().as_ref().map(|r| r.generation);
        if current != Some(generation) || !self.state.read().is_running() {
            debug!("Ignoring stale failure: {}", reason);
            return;
        }

        error!("Tunnel failed: {}", reason);
        self.set_state(TunnelState::Error(reason));
        self.teardown().await;
        self.set_state(TunnelState::Stopped);
    }
}

/// Per-packet path shared by the dispatcher and connect tasks
struct Pipeline {
    classifier: RoutingClassifier,
    resolver: Arc<dyn AppResolver>,
    direct: Arc<dyn DirectPath>,
    flows: Arc<FlowTable>,
    sessions: SessionManager,
    accounting: Arc<TrafficAccounting>,
    events: broadcast::Sender<TunnelEvent>,
    fatal: mpsc::UnboundedSender<String>,
    default_group: String,
}

impl Pipeline {
    async fn dispatch(self: &Arc<Self>, packet: Vec<u8>) {
        let header = match self.classifier.parse(&packet) {
            Ok(header) => header,
            Err(e) => {
                debug!("Dropping malformed packet: {}", e);
                return;
            }
        };

        // Classification runs once, when the flow is created
        let (flow, created) = self.flows.get_or_create(header.tuple, |id| {
            let (app, decision) = self.classifier.classify_flow(&header, self.resolver.as_ref());
            let group = (decision == Decision::Proxy)
                .then(|| self.classifier.group_for(header.destination()).to_string());
            NewFlow {
                decision,
                group,
                app,
                counters: self.accounting.register(id),
            }
        });
        if created {
            debug!("Flow {} {} -> {}", flow.id, flow.key, flow.decision);
        }

        match flow.decision {
            Decision::Drop => trace!("Dropping packet of flow {}", flow.id),
            Decision::Direct => {
                self.accounting.record_sent(flow.id, packet.len());
                self.direct.forward(&flow, &packet);
            }
            Decision::Proxy => match (flow.state, flow.session) {
                (FlowState::Active, Some(session)) => self.forward(session, flow.id, packet).await,
                (FlowState::Connecting, None) if created => {
                    let group = flow.group.clone().unwrap_or_default();
                    match self.sessions.try_attach(flow.id, &group) {
                        Some(session) => self.forward(session, flow.id, packet).await,
                        None => {
                            let pipeline = self.clone();
                            tokio::spawn(async move {
                                pipeline.connect(flow.id, group, packet).await;
                            });
                        }
                    }
                }
                (state, _) => trace!("Flow {} is {:?}, dropping packet", flow.id, state),
            },
        }
    }

    async fn forward(&self, session: SessionId, flow: FlowId, packet: Vec<u8>) {
        let len = packet.len();
        match self.sessions.send(session, flow, packet).await {
            Ok(()) => self.accounting.record_sent(flow, len),
            Err(e) => debug!("Flow {} packet not sent: {}", flow, e),
        }
    }

    /// Acquire a session for a new flow, then send its first packet
    ///
    /// Losing every endpoint of the default group is fatal for the tunnel.
    async fn connect(&self, flow: FlowId, group: String, first: Vec<u8>) {
        match self.sessions.acquire(flow, &group).await {
            Ok(session) => self.forward(session, flow, first).await,
            Err(SessionError::Closed) => {}
            Err(SessionError::FlowClosed(_)) => trace!("Flow {} closed while connecting", flow),
            Err(e) => {
                warn!("No session for flow {}: {}", flow, e);
                self.flows.remove(flow);
                self.accounting.forget(flow);
                let _ = self.events.send(TunnelEvent::FlowFailed {
                    flow,
                    reason: e.to_string(),
                });
                if group == self.default_group && self.sessions.group_exhausted(&group) {
                    let _ = self.fatal.send(format!("all proxy endpoints unhealthy: {}", e));
                }
            }
        }
    }
}

/// Remove idle flows and release their sessions
fn reap_idle(flows: &FlowTable, sessions: &SessionManager, accounting: &TrafficAccounting, idle: Duration) -> usize {
    let reaped = flows.reap_idle(idle);
    for flow in &reaped {
        if let Some(session) = flow.session {
            sessions.release(flow.id, session);
        }
        accounting.forget(flow.id);
        debug!("Reaped idle flow {} {}", flow.id, flow.key);
    }
    reaped.len()
}

/// Blocking device reader; exits when the device closes or the dispatcher
/// goes away
fn spawn_reader(
    capture: Arc<CaptureInterface>,
    packets: mpsc::Sender<Vec<u8>>,
    fatal: mpsc::UnboundedSender<String>,
) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("vtun-reader".into())
        .spawn(move || {
            let mut buf = vec![0u8; READ_BUFFER];
            loop {
                match capture.read_packet(&mut buf) {
                    Ok(0) => continue,
                    Ok(n) => {
                        if packets.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = fatal.send(format!("device read failed: {}", e));
                        break;
                    }
                }
            }
            debug!("Capture reader exited");
        })
}

fn spawn_dispatcher(pipeline: Arc<Pipeline>, mut packets: mpsc::Receiver<Vec<u8>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(packet) = packets.recv().await {
            pipeline.dispatch(packet).await;
        }
    })
}

/// Write frames from sessions back to the device
fn spawn_inbound(
    capture: Arc<CaptureInterface>,
    flows: Arc<FlowTable>,
    accounting: Arc<TrafficAccounting>,
    mut frames: mpsc::Receiver<Frame>,
    fatal: mpsc::UnboundedSender<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            if !flows.touch(frame.flow) {
                trace!("Frame for unknown flow {}", frame.flow);
                continue;
            }
            match capture.write_packet(&frame.payload) {
                Ok(()) => accounting.record_received(frame.flow, frame.payload.len()),
                Err(e @ CaptureError::PacketTooLarge { .. }) => warn!("Flow {}: {}", frame.flow, e),
                Err(e) => {
                    let _ = fatal.send(format!("device write failed: {}", e));
                    break;
                }
            }
        }
    })
}

fn spawn_session_events(
    accounting: Arc<TrafficAccounting>,
    events: broadcast::Sender<TunnelEvent>,
    mut session_events: mpsc::UnboundedReceiver<SessionEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = session_events.recv().await {
            match event {
                SessionEvent::SessionLost { session, endpoint, reason } => {
                    debug!("Session {} to {} lost: {}", session, endpoint, reason);
                }
                SessionEvent::FlowFailed { flow, reason } => {
                    accounting.forget(flow);
                    let _ = events.send(TunnelEvent::FlowFailed { flow, reason });
                }
            }
        }
    })
}

fn spawn_reaper(
    flows: Arc<FlowTable>,
    sessions: SessionManager,
    accounting: Arc<TrafficAccounting>,
    idle: Duration,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        loop {
            interval.tick().await;
            let reaped = reap_idle(&flows, &sessions, &accounting, idle);
            if reaped > 0 {
                debug!("Reap pass removed {} flows", reaped);
            }
        }
    })
}

fn spawn_stats_push(
    accounting: Arc<TrafficAccounting>,
    events: broadcast::Sender<TunnelEvent>,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        loop {
            interval.tick().await;
            // No subscribers is fine
            let _ = events.send(TunnelEvent::Stats(accounting.snapshot()));
        }
    })
}

/// Wait for the first fatal signal and hand it to the engine
fn spawn_supervisor(
    engine: Weak<Inner>,
    generation: u64,
    mut fatal: mpsc::UnboundedReceiver<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let Some(reason) = fatal.recv().await else {
            return;
        };
        let Some(inner) = engine.upgrade() else {
            return;
        };
        // Teardown aborts this task, so failure handling runs on its own
        tokio::spawn(inner.fail(generation, reason));
    })
}

//! vtun engine - Local VPN Tunnel
//!
//! Captures device traffic through a virtual network interface, decides per
//! flow whether it goes direct, through an upstream proxy or nowhere, and
//! multiplexes proxied flows over a small set of proxy sessions.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  packets  ┌────────────┐ Proxy ┌─────────────────┐
//! │   Virtual    │──────────▶│  Routing   │──────▶│  Proxy Session  │──▶ endpoints
//! │   Device     │           │ Classifier │       │     Manager     │
//! │  (capture)   │◀──────────┴─────┬──────┴───────┴────────┬────────┘
//! └──────────────┘   frames        │ Direct / Drop         │
//!        ▲                         ▼                       │
//!        │                  ┌─────────────┐                │
//!        └──────────────────│  Lifecycle  │◀───────────────┘
//!                           │ Controller  │──▶ event feed (state, stats)
//!                           └─────────────┘
//! ```
//!
//! # Features
//!
//! - **Pluggable device**: the OS VPN service sits behind [`DeviceProvider`];
//!   [`MemoryDeviceProvider`] is a channel-backed device for embedding and tests
//! - **Pluggable proxy protocol**: [`ProxyTransport`] performs the handshake,
//!   the engine handles multiplexing, retries and failover
//! - **Per-app policy**: allow/deny lists applied by the OS and by the classifier
//! - **Accounting**: per-flow and total byte counters with rate snapshots
//!
//! # Concurrency
//!
//! One blocking reader thread per device, one task per proxy session, a
//! sharded flow table and atomic counters. Only the lifecycle paths write the
//! tunnel state.

mod capture;
mod classify;
mod config;
mod engine;
mod flow;
mod packet;
mod probe;
mod session;
mod stats;

pub use capture::{
    AppliedSettings, CaptureError, CaptureInterface, CaptureStats, DevicePeer, DeviceProvider,
    InterfaceBuilder, MemoryDeviceProvider, OpenReport, VirtualDevice,
};
pub use classify::{AppResolver, ClassifierStats, Decision, NoAppResolver, RoutingClassifier};
pub use config::{
    AppPolicy, AppPolicyMode, ConfigError, DEFAULT_GROUP, GroupRule, LAN_RANGES, MIN_MTU,
    ProxyCredentials, ProxyEndpoint, SessionTuning, TunnelConfig,
};
pub use engine::{
    DirectPath, DiscardDirect, EngineError, ErrorKind, TunnelEngine, TunnelEngineBuilder,
    TunnelEvent, TunnelState, version,
};
pub use flow::{Flow, FlowId, FlowState, FlowTable, NewFlow};
pub use packet::{ClassificationError, FiveTuple, PacketHeader, Protocol, build_ipv4};
pub use probe::{ProbeError, ProbeResult, probe_endpoint, probe_endpoints};
pub use session::{
    EndpointHealth, Frame, ProxyTransport, SessionError, SessionEvent, SessionId, SessionInfo,
    SessionManager, SessionState, TransportChannel,
};
pub use stats::{FlowCounters, StatsSnapshot, TrafficAccounting, format_bytes};

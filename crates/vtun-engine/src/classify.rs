//! Routing Classifier
//!
//! Decides, once per flow, whether its packets are delivered directly,
//! forwarded to the proxy, or dropped.
//!
//! Decision order:
//! 1. Destination in a bypass range → [`Decision::Direct`]
//! 2. Traffic of the hosting app itself → [`Decision::Direct`]
//! 3. Allow-list mode and owning app not listed → [`Decision::Drop`]
//! 4. Deny-list mode and owning app listed → [`Decision::Drop`]
//! 5. UDP with UDP proxying disabled → [`Decision::Drop`]
//! 6. No proxy endpoints (pure bypass) → [`Decision::Direct`]
//! 7. Otherwise → [`Decision::Proxy`]
//!
//! The result depends only on (destination, app, config), so it is safe to
//! cache it for the flow's lifetime.

use crate::config::{AppPolicyMode, GroupRule, TunnelConfig};
use crate::packet::{ClassificationError, FiveTuple, PacketHeader, Protocol};
use ipnet::IpNet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// Routing decision for a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Decision {
    /// Delivered without the proxy
    Direct,
    /// Forwarded through a proxy session
    Proxy,
    /// Discarded
    Drop,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decision::Direct => write!(f, "direct"),
            Decision::Proxy => write!(f, "proxy"),
            Decision::Drop => write!(f, "drop"),
        }
    }
}

/// Maps a flow to the app that owns it (e.g. via the OS connection owner lookup)
pub trait AppResolver: Send + Sync {
    fn resolve(&self, tuple: &FiveTuple) -> Option<String>;
}

/// Resolver for platforms without owner lookup; per-app policy is then
/// enforced only by the OS at capture time
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAppResolver;

impl AppResolver for NoAppResolver {
    fn resolve(&self, _tuple: &FiveTuple) -> Option<String> {
        None
    }
}

/// Classification counters
#[derive(Debug, Default)]
pub struct ClassifierStats {
    pub direct: AtomicU64,
    pub proxied: AtomicU64,
    pub dropped: AtomicU64,
    pub malformed: AtomicU64,
}

impl ClassifierStats {
    fn record(&self, decision: Decision) {
        let counter = match decision {
            Decision::Direct => &self.direct,
            Decision::Proxy => &self.proxied,
            Decision::Drop => &self.dropped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Routing classifier built from one configuration snapshot
pub struct RoutingClassifier {
    bypass: Vec<IpNet>,
    app_mode: AppPolicyMode,
    apps: Vec<String>,
    self_package: Option<String>,
    enable_udp: bool,
    pure_bypass: bool,
    default_group: String,
    group_rules: Vec<GroupRule>,
    stats: ClassifierStats,
}

impl RoutingClassifier {
    /// Create a classifier for a configuration
    pub fn new(config: &TunnelConfig) -> Self {
        Self {
            bypass: config.bypass_ranges(),
            app_mode: config.app_policy.mode,
            apps: config.app_policy.apps.clone(),
            self_package: config.self_package.clone(),
            enable_udp: config.enable_udp,
            pure_bypass: config.is_pure_bypass(),
            default_group: config.default_group.clone(),
            group_rules: config.group_rules.clone(),
            stats: ClassifierStats::default(),
        }
    }

    /// Is `addr` inside a bypass range?
    pub fn is_bypassed(&self, addr: IpAddr) -> bool {
        self.bypass.iter().any(|net| net.contains(&addr))
    }

    /// Classify a flow by its destination, protocol and owning app
    pub fn classify(&self, header: &PacketHeader, app: Option<&str>) -> Decision {
        let decision = self.decide(header.destination(), header.protocol(), app);
        self.stats.record(decision);
        trace!("{} ({}) -> {}", header.tuple, app.unwrap_or("-"), decision);
        decision
    }

    fn decide(&self, dst: IpAddr, protocol: Protocol, app: Option<&str>) -> Decision {
        if self.is_bypassed(dst) {
            return Decision::Direct;
        }

        if let Some(app) = app {
            if self.self_package.as_deref() == Some(app) {
                return Decision::Direct;
            }
            let listed = self.apps.iter().any(|a| a == app);
            match self.app_mode {
                AppPolicyMode::Allow if !listed => return Decision::Drop,
                AppPolicyMode::Deny if listed => return Decision::Drop,
                _ => {}
            }
        }

        if protocol == Protocol::Udp && !self.enable_udp {
            return Decision::Drop;
        }

        if self.pure_bypass {
            Decision::Direct
        } else {
            Decision::Proxy
        }
    }

    /// Parse a raw packet header, counting malformed packets
    pub fn parse(&self, packet: &[u8]) -> Result<PacketHeader, ClassificationError> {
        PacketHeader::parse(packet).inspect_err(|_| {
            self.stats.malformed.fetch_add(1, Ordering::Relaxed);
        })
    }

    /// Resolve the owning app of a new flow and classify it
    pub fn classify_flow(&self, header: &PacketHeader, resolver: &dyn AppResolver) -> (Option<String>, Decision) {
        let app = resolver.resolve(&header.tuple);
        let decision = self.classify(header, app.as_deref());
        (app, decision)
    }

    /// Endpoint group for a proxied destination
    pub fn group_for(&self, dst: IpAddr) -> &str {
        self.group_rules
            .iter()
            .find(|rule| rule.range.contains(&dst))
            .map(|rule| rule.group.as_str())
            .unwrap_or(self.default_group.as_str())
    }

    /// Get classification counters
    pub fn stats(&self) -> &ClassifierStats {
        &self.stats
    }
}

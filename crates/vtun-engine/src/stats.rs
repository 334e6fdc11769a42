//! Traffic Accounting
//!
//! Byte and packet counters per flow and for the whole tunnel. Counters are
//! plain atomics, so the capture reader and session tasks can record from any
//! thread without locking. Only `snapshot()` takes a lock, to remember the
//! previous totals for rate computation.

use crate::flow::FlowId;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Counters of a single flow
#[derive(Debug, Default)]
pub struct FlowCounters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
}

impl FlowCounters {
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }

    pub fn packets_received(&self) -> u64 {
        self.packets_received.load(Ordering::Relaxed)
    }

    fn add_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
    }

    fn add_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time traffic statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Total bytes sent toward the network
    pub up_bytes: u64,
    /// Total bytes delivered to applications
    pub down_bytes: u64,
    /// Upload rate since the previous snapshot (bytes per second)
    pub up_rate_bps: u64,
    /// Download rate since the previous snapshot (bytes per second)
    pub down_rate_bps: u64,
    pub up_packets: u64,
    pub down_packets: u64,
    /// Flows currently tracked
    pub active_flows: u64,
    /// Timestamp in milliseconds since the Unix epoch
    pub timestamp_ms: u64,
}

impl StatsSnapshot {
    /// Total bytes in both directions
    #[must_use]
    pub const fn total_bytes(&self) -> u64 {
        self.up_bytes + self.down_bytes
    }
}

struct RateMark {
    up: u64,
    down: u64,
    at: Instant,
}

/// Tunnel-wide traffic accounting
pub struct TrafficAccounting {
    up_bytes: AtomicU64,
    down_bytes: AtomicU64,
    up_packets: AtomicU64,
    down_packets: AtomicU64,
    flows: DashMap<FlowId, Arc<FlowCounters>>,
    last: Mutex<Option<RateMark>>,
}

impl Default for TrafficAccounting {
    fn default() -> Self {
        Self::new()
    }
}

impl TrafficAccounting {
    /// Create accounting with zeroed counters
    pub fn new() -> Self {
        Self {
            up_bytes: AtomicU64::new(0),
            down_bytes: AtomicU64::new(0),
            up_packets: AtomicU64::new(0),
            down_packets: AtomicU64::new(0),
            flows: DashMap::new(),
            last: Mutex::new(None),
        }
    }

    /// Start tracking a flow, returning its shared counters
    pub fn register(&self, flow: FlowId) -> Arc<FlowCounters> {
        self.flows.entry(flow).or_default().clone()
    }

    /// Record bytes sent on behalf of a flow (application → network)
    pub fn record_sent(&self, flow: FlowId, n: usize) {
        let n = n as u64;
        self.up_bytes.fetch_add(n, Ordering::Relaxed);
        self.up_packets.fetch_add(1, Ordering::Relaxed);
        if let Some(counters) = self.flows.get(&flow) {
            counters.add_sent(n);
        }
    }

    /// Record bytes received for a flow (network → application)
    pub fn record_received(&self, flow: FlowId, n: usize) {
        let n = n as u64;
        self.down_bytes.fetch_add(n, Ordering::Relaxed);
        self.down_packets.fetch_add(1, Ordering::Relaxed);
        if let Some(counters) = self.flows.get(&flow) {
            counters.add_received(n);
        }
    }

    /// Stop tracking a flow; its bytes stay in the totals
    pub fn forget(&self, flow: FlowId) {
        self.flows.remove(&flow);
    }

    /// Counters of a tracked flow
    pub fn flow(&self, flow: FlowId) -> Option<Arc<FlowCounters>> {
        self.flows.get(&flow).map(|c| c.clone())
    }

    /// Total bytes sent toward the network
    pub fn up_bytes(&self) -> u64 {
        self.up_bytes.load(Ordering::Relaxed)
    }

    /// Total bytes delivered to applications
    pub fn down_bytes(&self) -> u64 {
        self.down_bytes.load(Ordering::Relaxed)
    }

    /// Take a snapshot; rates cover the time since the previous snapshot
    pub fn snapshot(&self) -> StatsSnapshot {
        let mut last = self.last.lock();
        let now = Instant::now();
        let up = self.up_bytes();
        let down = self.down_bytes();

        let (up_rate_bps, down_rate_bps) = match last.as_ref() {
            Some(mark) => {
                let elapsed = now.duration_since(mark.at).as_secs_f64();
                if elapsed > 0.0 {
                    (
                        (up.saturating_sub(mark.up) as f64 / elapsed) as u64,
                        (down.saturating_sub(mark.down) as f64 / elapsed) as u64,
                    )
                } else {
                    (0, 0)
                }
            }
            None => (0, 0),
        };
        *last = Some(RateMark { up, down, at: now });

        StatsSnapshot {
            up_bytes: up,
            down_bytes: down,
            up_rate_bps,
            down_rate_bps,
            up_packets: self.up_packets.load(Ordering::Relaxed),
            down_packets: self.down_packets.load(Ordering::Relaxed),
            active_flows: self.flows.len() as u64,
            timestamp_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        }
    }
}

/// Format a byte count for display
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

//! Flow table
//!
//! Tracks every flow seen on the capture device, keyed by its 5-tuple, with a
//! secondary index by [`FlowId`] for frames coming back from proxy sessions.
//!
//! # Thread Safety
//!
//! Both maps are `DashMap`s. No operation holds a reference into one map
//! while locking the other for writing, and no reference is held across an
//! `.await`.

use crate::classify::Decision;
use crate::packet::FiveTuple;
use crate::session::SessionId;
use crate::stats::FlowCounters;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Numeric flow identifier, unique for the lifetime of a flow table
pub type FlowId = u64;

/// Forwarding state of a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    /// Proxied flow waiting for a session
    Connecting,
    /// Packets are being forwarded
    Active,
    /// Its session was lost; a reconnect is in progress
    ReconnectPending,
}

/// A tracked flow
#[derive(Debug, Clone)]
pub struct Flow {
    pub id: FlowId,
    pub key: FiveTuple,
    pub decision: Decision,
    /// Endpoint group (proxied flows only)
    pub group: Option<String>,
    /// Owning app, when the resolver knows it
    pub app: Option<String>,
    pub session: Option<SessionId>,
    pub state: FlowState,
    pub created_at: Instant,
    pub last_activity: Instant,
    pub counters: Arc<FlowCounters>,
}

impl Flow {
    /// Check if the flow goes through a proxy session
    pub fn is_proxied(&self) -> bool {
        self.decision == Decision::Proxy
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }
}

/// Attributes of a flow about to be created
pub struct NewFlow {
    pub decision: Decision,
    pub group: Option<String>,
    pub app: Option<String>,
    pub counters: Arc<FlowCounters>,
}

/// Concurrent flow table
pub struct FlowTable {
    flows: DashMap<FiveTuple, Flow>,
    by_id: DashMap<FlowId, FiveTuple>,
    next_id: AtomicU64,
}

impl Default for FlowTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self {
            flows: DashMap::new(),
            by_id: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate the id the next created flow will use
    pub fn next_id(&self) -> FlowId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Look up a flow by 5-tuple and mark it active, or create it
    ///
    /// `make` runs only when the flow is new, with the id it will get.
    /// Returns the flow and whether it was created.
    pub fn get_or_create(&self, key: FiveTuple, make: impl FnOnce(FlowId) -> NewFlow) -> (Flow, bool) {
        let now = Instant::now();
        let (flow, created) = match self.flows.entry(key) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().last_activity = now;
                (entry.get().clone(), false)
            }
            Entry::Vacant(entry) => {
                let id = self.next_id();
                let new = make(id);
                let state = if new.decision == Decision::Proxy {
                    FlowState::Connecting
                } else {
                    FlowState::Active
                };
                let flow = Flow {
                    id,
                    key,
                    decision: new.decision,
                    group: new.group,
                    app: new.app,
                    session: None,
                    state,
                    created_at: now,
                    last_activity: now,
                    counters: new.counters,
                };
                entry.insert(flow.clone());
                (flow, true)
            }
        };
        if created {
            self.by_id.insert(flow.id, key);
        }
        (flow, created)
    }

    /// Look up a flow by id
    pub fn get(&self, id: FlowId) -> Option<Flow> {
        let key = *self.by_id.get(&id)?;
        self.flows.get(&key).map(|f| f.clone())
    }

    /// Look up a flow by 5-tuple
    pub fn get_by_key(&self, key: &FiveTuple) -> Option<Flow> {
        self.flows.get(key).map(|f| f.clone())
    }

    /// Refresh the activity timestamp of a flow
    pub fn touch(&self, id: FlowId) -> bool {
        self.update(id, |flow| flow.last_activity = Instant::now())
    }

    /// Bind a flow to a session and make it Active
    pub fn assign_session(&self, id: FlowId, session: SessionId) -> bool {
        self.update(id, |flow| {
            flow.session = Some(session);
            flow.state = FlowState::Active;
        })
    }

    pub fn set_state(&self, id: FlowId, state: FlowState) -> bool {
        self.update(id, |flow| flow.state = state)
    }

    /// Move every flow of a lost session to ReconnectPending, returning them
    pub fn detach_session(&self, session: SessionId) -> Vec<FlowId> {
        let mut detached = Vec::new();
        for mut flow in self.flows.iter_mut() {
            if flow.session == Some(session) {
                flow.session = None;
                flow.state = FlowState::ReconnectPending;
                detached.push(flow.id);
            }
        }
        detached
    }

    /// Ids of the flows bound to a session
    pub fn flows_on_session(&self, session: SessionId) -> Vec<FlowId> {
        self.flows
            .iter()
            .filter(|flow| flow.session == Some(session))
            .map(|flow| flow.id)
            .collect()
    }

    /// Remove a flow, returning it
    pub fn remove(&self, id: FlowId) -> Option<Flow> {
        let (_, key) = self.by_id.remove(&id)?;
        self.flows.remove(&key).map(|(_, flow)| flow)
    }

    /// Remove flows idle for at least `idle`, returning them
    pub fn reap_idle(&self, idle: Duration) -> Vec<Flow> {
        let now = Instant::now();
        let stale: Vec<FlowId> = self
            .flows
            .iter()
            .filter(|flow| flow.idle_for(now) >= idle)
            .map(|flow| flow.id)
            .collect();

        let mut reaped = Vec::with_capacity(stale.len());
        for id in stale {
            let Some(key) = self.by_id.get(&id).map(|k| *k) else {
                continue;
            };
            // Activity may have arrived since the scan
            if let Some((_, flow)) = self.flows.remove_if(&key, |_, flow| flow.idle_for(Instant::now()) >= idle) {
                self.by_id.remove(&id);
                reaped.push(flow);
            }
        }
        reaped
    }

    /// Drop every flow
    pub fn clear(&self) {
        self.flows.clear();
        self.by_id.clear();
    }

    /// Number of tracked flows
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    fn update(&self, id: FlowId, f: impl FnOnce(&mut Flow)) -> bool {
        let Some(key) = self.by_id.get(&id).map(|k| *k) else {
            return false;
        };
        match self.flows.get_mut(&key) {
            Some(mut flow) => {
                f(&mut flow);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn key(port: u16) -> FiveTuple {
        FiveTuple::tcp(
            format!("10.1.10.1:{}", port).parse().unwrap(),
            "93.184.216.34:443".parse().unwrap(),
        )
    }

    fn proxied(_id: FlowId) -> NewFlow {
        NewFlow {
            decision: Decision::Proxy,
            group: Some("default".into()),
            app: None,
            counters: Arc::new(FlowCounters::default()),
        }
    }

    fn direct(_id: FlowId) -> NewFlow {
        NewFlow {
            decision: Decision::Direct,
            group: None,
            app: None,
            counters: Arc::new(FlowCounters::default()),
        }
    }

    #[test]
    fn test_get_or_create_reuses_flow() {
        let table = FlowTable::new();

        let (first, created) = table.get_or_create(key(1000), proxied);
        assert!(created);
        assert_eq!(first.state, FlowState::Connecting);
        assert!(first.session.is_none());

        let (second, created) = table.get_or_create(key(1000), |_| panic!("flow already exists"));
        assert!(!created);
        assert_eq!(second.id, first.id);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_direct_flow_starts_active() {
        let table = FlowTable::new();
        let (flow, _) = table.get_or_create(key(1), direct);

        assert_eq!(flow.state, FlowState::Active);
        assert!(!flow.is_proxied());
        assert!(flow.session.is_none());
    }

    #[test]
    fn test_assign_and_detach_session() {
        let table = FlowTable::new();
        let (a, _) = table.get_or_create(key(1), proxied);
        let (b, _) = table.get_or_create(key(2), proxied);
        let (c, _) = table.get_or_create(key(3), proxied);

        assert!(table.assign_session(a.id, 10));
        assert!(table.assign_session(b.id, 10));
        assert!(table.assign_session(c.id, 11));
        assert_eq!(table.get(a.id).unwrap().state, FlowState::Active);

        let mut on_ten = table.flows_on_session(10);
        on_ten.sort();
        assert_eq!(on_ten, vec![a.id, b.id]);

        let mut detached = table.detach_session(10);
        detached.sort();
        assert_eq!(detached, vec![a.id, b.id]);

        let a = table.get(a.id).unwrap();
        assert_eq!(a.state, FlowState::ReconnectPending);
        assert!(a.session.is_none());
        assert_eq!(table.get(c.id).unwrap().session, Some(11));
    }

    #[test]
    fn test_remove_clears_both_indexes() {
        let table = FlowTable::new();
        let (flow, _) = table.get_or_create(key(5), direct);

        assert!(table.remove(flow.id).is_some());
        assert!(table.get(flow.id).is_none());
        assert!(table.get_by_key(&key(5)).is_none());
        assert!(!table.touch(flow.id));
        assert!(table.is_empty());
    }

    #[test]
    fn test_reap_idle() {
        let table = FlowTable::new();
        let (old, _) = table.get_or_create(key(1), proxied);
        table.assign_session(old.id, 3);

        thread::sleep(Duration::from_millis(60));
        let (fresh, _) = table.get_or_create(key(2), proxied);

        let reaped = table.reap_idle(Duration::from_millis(50));
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].id, old.id);
        assert_eq!(reaped[0].session, Some(3));
        assert!(table.get(fresh.id).is_some());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_touch_defers_reaping() {
        let table = FlowTable::new();
        let (flow, _) = table.get_or_create(key(1), direct);

        thread::sleep(Duration::from_millis(60));
        assert!(table.touch(flow.id));

        assert!(table.reap_idle(Duration::from_millis(50)).is_empty());
    }

    #[test]
    fn test_flow_ids_are_unique() {
        let table = Arc::new(FlowTable::new());
        let handles: Vec<_> = (0..4u16)
            .map(|t| {
                let table = table.clone();
                thread::spawn(move || {
                    (0..100u16)
                        .map(|i| table.get_or_create(key(t * 1000 + i), direct).0.id)
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut ids: Vec<FlowId> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 400);
    }
}

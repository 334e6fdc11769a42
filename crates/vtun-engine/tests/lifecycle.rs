mod common;

use common::{MockTransport, endpoint, eventually, proxied_config, receive, states_until};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use vtun_engine::{
    AppPolicy, AppPolicyMode, AppResolver, Decision, DirectPath, ErrorKind, FiveTuple, Flow,
    FlowState, GroupRule, MemoryDeviceProvider, Protocol, TunnelConfig, TunnelEngine, TunnelEvent,
    TunnelState, build_ipv4,
};

const APP: &str = "10.1.10.1:40000";

fn engine(provider: &MemoryDeviceProvider, transport: &Arc<MockTransport>) -> TunnelEngine {
    TunnelEngine::builder(Arc::new(provider.clone()), transport.clone()).build()
}

fn tcp(src: &str, dst: &str, payload: &[u8]) -> (FiveTuple, Vec<u8>) {
    let src: SocketAddr = src.parse().unwrap();
    let dst: SocketAddr = dst.parse().unwrap();
    (FiveTuple::tcp(src, dst), build_ipv4(Protocol::Tcp, src, dst, payload))
}

#[derive(Default)]
struct RecordingDirect {
    packets: Mutex<Vec<Vec<u8>>>,
}

impl DirectPath for RecordingDirect {
    fn forward(&self, _flow: &Flow, packet: &[u8]) {
        self.packets.lock().push(packet.to_vec());
    }
}

/// Resolver whose answer can change between packets
struct SwitchingResolver {
    app: Mutex<String>,
    lookups: AtomicUsize,
}

impl AppResolver for SwitchingResolver {
    fn resolve(&self, _tuple: &FiveTuple) -> Option<String> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Some(self.app.lock().clone())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_start_stop_transitions() {
    let provider = MemoryDeviceProvider::new();
    let transport = MockTransport::new();
    let engine = engine(&provider, &transport);
    let mut events = engine.subscribe();

    assert_eq!(engine.start(proxied_config()).await, Ok(TunnelState::Running));
    assert_eq!(engine.stop().await, TunnelState::Stopped);

    let states = states_until(&mut events, TunnelState::Stopped).await;
    assert_eq!(
        states,
        vec![
            TunnelState::Starting,
            TunnelState::Running,
            TunnelState::Stopping,
            TunnelState::Stopped,
        ]
    );
    assert!(provider.peer().unwrap().is_closed());
    assert_eq!(engine.stop().await, TunnelState::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_start_while_running_is_noop() {
    let provider = MemoryDeviceProvider::new();
    let transport = MockTransport::new();
    let engine = engine(&provider, &transport);

    engine.start(proxied_config()).await.unwrap();
    let again = engine.start(proxied_config()).await;

    assert_eq!(again, Ok(TunnelState::Running));
    assert_eq!(provider.opened(), 1);
    assert_eq!(transport.total_connects(), 1);
    engine.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restart_has_empty_flow_table() {
    let provider = MemoryDeviceProvider::new();
    let transport = MockTransport::new();
    let engine = engine(&provider, &transport);
    let config = proxied_config();

    engine.start(config.clone()).await.unwrap();
    let (_, packet) = tcp(APP, "93.184.216.34:443", b"hello");
    provider.peer().unwrap().inject(packet).unwrap();
    assert!(eventually(|| engine.flow_count() == 1).await);

    assert_eq!(engine.restart().await, Ok(TunnelState::Running));
    assert_eq!(engine.flow_count(), 0);
    assert_eq!(engine.config().unwrap().session_name, config.session_name);
    assert_eq!(provider.opened(), 2);
    engine.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_invalid_config_acquires_nothing() {
    let provider = MemoryDeviceProvider::new();
    let transport = MockTransport::new();
    let engine = engine(&provider, &transport);

    let mut config = proxied_config();
    config.mtu = 100;
    let err = engine.start(config).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Config);
    assert_eq!(engine.state(), TunnelState::Stopped);
    assert_eq!(provider.opened(), 0);
    assert_eq!(transport.total_connects(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_missing_permission_has_own_kind() {
    let provider = MemoryDeviceProvider::new();
    provider.deny_permission(true);
    let transport = MockTransport::new();
    let engine = engine(&provider, &transport);
    let mut events = engine.subscribe();

    assert!(!engine.has_permission());
    let err = engine.start(proxied_config()).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    assert_eq!(engine.state(), TunnelState::Stopped);
    let states = states_until(&mut events, TunnelState::Stopped).await;
    assert_eq!(states.len(), 3);
    assert!(matches!(states[1], TunnelState::Error(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_handshake_failure_rolls_back_device() {
    let provider = MemoryDeviceProvider::new();
    let transport = MockTransport::new();
    transport.fail("e1", true);
    let engine = engine(&provider, &transport);

    let err = engine.start(proxied_config()).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Session);
    assert_eq!(engine.state(), TunnelState::Stopped);
    assert!(provider.peer().unwrap().is_closed());
    assert_eq!(transport.connects("e1"), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_proxied_flow_roundtrip() {
    let provider = MemoryDeviceProvider::new();
    let transport = MockTransport::new();
    let engine = engine(&provider, &transport);
    engine.start(proxied_config()).await.unwrap();
    let peer = provider.peer().unwrap();

    let (key, packet) = tcp(APP, "93.184.216.34:443", b"GET / HTTP/1.1");
    let len = packet.len() as u64;
    peer.inject(packet.clone()).unwrap();

    assert_eq!(receive(&peer).await, Some(packet));
    let flow = engine.flow(&key).unwrap();
    assert_eq!(flow.decision, Decision::Proxy);
    assert_eq!(flow.state, FlowState::Active);
    assert!(flow.session.is_some());
    assert_eq!(flow.counters.bytes_sent(), len);
    assert!(eventually(|| flow.counters.bytes_received() == len).await);

    let snap = engine.snapshot().unwrap();
    assert_eq!(snap.up_bytes, len);
    assert_eq!(snap.down_bytes, len);
    assert_eq!(snap.active_flows, 1);
    engine.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_flow_keeps_session_while_active() {
    let provider = MemoryDeviceProvider::new();
    let transport = MockTransport::new();
    let engine = engine(&provider, &transport);
    engine.start(proxied_config()).await.unwrap();
    let peer = provider.peer().unwrap();

    let (key, first) = tcp(APP, "93.184.216.34:443", b"one");
    peer.inject(first).unwrap();
    assert!(receive(&peer).await.is_some());
    let session = engine.flow(&key).unwrap().session;

    for i in 0..5u8 {
        let (_, packet) = tcp(APP, "93.184.216.34:443", &[i; 16]);
        peer.inject(packet).unwrap();
        assert!(receive(&peer).await.is_some());
        let flow = engine.flow(&key).unwrap();
        assert_eq!(flow.state, FlowState::Active);
        assert_eq!(flow.session, session);
    }
    engine.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_bypass_is_direct_regardless_of_health() {
    let provider = MemoryDeviceProvider::new();
    let transport = MockTransport::new();
    let direct = Arc::new(RecordingDirect::default());
    let engine = TunnelEngine::builder(Arc::new(provider.clone()), transport.clone())
        .direct_path(direct.clone())
        .build();
    engine.start(proxied_config()).await.unwrap();
    let peer = provider.peer().unwrap();

    // Take the only endpoint down
    transport.fail("e1", true);
    transport.channel(0).kill();
    assert!(eventually(|| engine.sessions().is_empty()).await);

    let (lan, packet) = tcp(APP, "192.168.1.5:80", b"local");
    peer.inject(packet.clone()).unwrap();
    assert!(eventually(|| direct.packets.lock().len() == 1).await);

    let flow = engine.flow(&lan).unwrap();
    assert_eq!(flow.decision, Decision::Direct);
    assert!(flow.session.is_none());
    assert_eq!(direct.packets.lock()[0], packet);
    engine.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unhealthy_endpoint_fails_fast() {
    let provider = MemoryDeviceProvider::new();
    let transport = MockTransport::new();
    transport.fail("asia", true);
    let engine = engine(&provider, &transport);
    let mut events = engine.subscribe();

    let mut config = proxied_config();
    config.endpoints.push(endpoint("asia", 8443).in_group("asia"));
    config.group_rules.push(GroupRule {
        range: "203.0.113.0/24".parse().unwrap(),
        group: "asia".into(),
    });
    engine.start(config).await.unwrap();
    let peer = provider.peer().unwrap();

    let (first, packet) = tcp(APP, "203.0.113.9:443", b"x");
    peer.inject(packet).unwrap();
    assert!(eventually(|| {
        engine
            .endpoint_health()
            .iter()
            .any(|h| h.endpoint == "asia" && !h.is_healthy())
    })
    .await);
    assert_eq!(transport.connects("asia"), 5);
    assert!(eventually(|| engine.flow(&first).is_none()).await);

    let health = engine.endpoint_health();
    let asia = health.iter().find(|h| h.endpoint == "asia").unwrap();
    assert_eq!(asia.consecutive_failures, 5);

    // A later flow bound to the same group fails without a handshake
    let (second, packet) = tcp("10.1.10.1:40001", "203.0.113.10:443", b"y");
    peer.inject(packet).unwrap();
    assert!(eventually(|| engine.flow(&second).is_none()).await);
    assert_eq!(transport.connects("asia"), 5);

    let mut failed = 0;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while failed < 2 {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Ok(TunnelEvent::FlowFailed { .. })) => failed += 1,
            Ok(Ok(_)) => {}
            _ => break,
        }
    }
    assert_eq!(failed, 2);

    // The default group is unaffected
    let (ok, packet) = tcp(APP, "93.184.216.34:443", b"z");
    peer.inject(packet).unwrap();
    assert!(receive(&peer).await.is_some());
    assert!(engine.flow(&ok).unwrap().session.is_some());
    engine.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_idle_flow_reaped_and_released() {
    let provider = MemoryDeviceProvider::new();
    let transport = MockTransport::new();
    let engine = engine(&provider, &transport);
    let mut config = proxied_config();
    config.flow_idle_timeout_secs = 1;
    config.reap_interval_secs = 60;
    engine.start(config).await.unwrap();
    let peer = provider.peer().unwrap();

    let (key, packet) = tcp(APP, "93.184.216.34:443", b"ping");
    peer.inject(packet).unwrap();
    assert!(receive(&peer).await.is_some());
    let session = engine.flow(&key).unwrap().session.unwrap();
    assert_eq!(engine.sessions()[0].flows.len(), 1);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(engine.reap_idle_flows(), 1);

    assert!(engine.flow(&key).is_none());
    let sessions = engine.sessions();
    assert_eq!(sessions[0].id, session);
    assert!(sessions[0].flows.is_empty());
    assert_eq!(engine.snapshot().unwrap().active_flows, 0);
    engine.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_snapshots_never_decrease() {
    let provider = MemoryDeviceProvider::new();
    let transport = MockTransport::new();
    let engine = engine(&provider, &transport);
    engine.start(proxied_config()).await.unwrap();
    let peer = provider.peer().unwrap();

    let mut previous = engine.snapshot().unwrap();
    assert_eq!(previous.up_rate_bps, 0);
    for i in 0..10u16 {
        let (_, packet) = tcp(&format!("10.1.10.1:{}", 41000 + i), "93.184.216.34:443", b"data");
        peer.inject(packet).unwrap();
        let snap = engine.snapshot().unwrap();
        assert!(snap.up_bytes >= previous.up_bytes);
        assert!(snap.down_bytes >= previous.down_bytes);
        assert!(snap.timestamp_ms >= previous.timestamp_ms);
        previous = snap;
    }
    engine.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_session_loss_is_transparent() {
    let provider = MemoryDeviceProvider::new();
    let transport = MockTransport::new();
    let engine = engine(&provider, &transport);
    engine.start(proxied_config()).await.unwrap();
    let peer = provider.peer().unwrap();

    let (key, packet) = tcp(APP, "93.184.216.34:443", b"before");
    peer.inject(packet).unwrap();
    assert!(receive(&peer).await.is_some());
    let before = engine.flow(&key).unwrap().session;

    transport.channel(0).kill();
    assert!(eventually(|| {
        engine
            .flow(&key)
            .is_some_and(|f| f.state == FlowState::Active && f.session.is_some() && f.session != before)
    })
    .await);
    assert_eq!(transport.connects("e1"), 2);

    let (_, packet) = tcp(APP, "93.184.216.34:443", b"after");
    peer.inject(packet.clone()).unwrap();
    assert_eq!(receive(&peer).await, Some(packet));
    engine.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_device_loss_errors_then_stops() {
    let provider = MemoryDeviceProvider::new();
    let transport = MockTransport::new();
    let engine = engine(&provider, &transport);
    engine.start(proxied_config()).await.unwrap();
    let mut events = engine.subscribe();

    provider.peer().unwrap().kill();

    let states = states_until(&mut events, TunnelState::Stopped).await;
    assert_eq!(states.len(), 2);
    assert!(matches!(&states[0], TunnelState::Error(reason) if reason.contains("read")));
    assert_eq!(states[1], TunnelState::Stopped);
    assert_eq!(engine.state(), TunnelState::Stopped);
    assert!(engine.sessions().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_during_start_waits() {
    let provider = MemoryDeviceProvider::new();
    let transport = MockTransport::new();
    transport.set_delay(Duration::from_millis(200));
    let engine = engine(&provider, &transport);

    let starting = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.start(proxied_config()).await })
    };
    assert!(eventually(|| engine.state() == TunnelState::Starting).await);

    assert_eq!(engine.stop().await, TunnelState::Stopped);
    assert_eq!(starting.await.unwrap(), Ok(TunnelState::Running));
    assert_eq!(engine.state(), TunnelState::Stopped);
    assert!(provider.peer().unwrap().is_closed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_set_dns_and_routes() {
    let provider = MemoryDeviceProvider::new();
    let transport = MockTransport::new();
    let engine = engine(&provider, &transport);
    let dns = vec!["1.1.1.1".parse().unwrap()];

    let err = engine.set_dns(dns.clone()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotRunning);

    engine.start(TunnelConfig::default()).await.unwrap();
    assert_eq!(engine.set_dns(dns.clone()), Ok(true));
    let routes = vec!["10.0.0.0/8".parse().unwrap()];
    assert_eq!(engine.set_routes(routes.clone()), Ok(true));

    let settings = provider.peer().unwrap().settings();
    assert_eq!(settings.dns, dns);
    assert_eq!(settings.routes, routes);
    assert_eq!(engine.config().unwrap().dns, dns);
    engine.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stats_are_pushed() {
    let provider = MemoryDeviceProvider::new();
    let transport = MockTransport::new();
    let engine = engine(&provider, &transport);
    let mut events = engine.subscribe();
    let mut config = TunnelConfig::default();
    config.stats_interval_ms = Some(20);

    engine.start(config).await.unwrap();

    let stats = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(TunnelEvent::Stats(snap)) = events.recv().await {
                return snap;
            }
        }
    })
    .await;
    assert!(stats.is_ok());
    engine.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pure_bypass_runs_without_sessions() {
    let provider = MemoryDeviceProvider::new();
    let transport = MockTransport::new();
    let engine = engine(&provider, &transport);

    assert_eq!(engine.start(TunnelConfig::default()).await, Ok(TunnelState::Running));

    let (key, packet) = tcp(APP, "93.184.216.34:443", b"x");
    provider.peer().unwrap().inject(packet).unwrap();
    assert!(eventually(|| engine.flow(&key).is_some()).await);
    assert_eq!(engine.flow(&key).unwrap().decision, Decision::Direct);
    assert_eq!(transport.total_connects(), 0);
    // Nothing is routed into the device, so direct traffic never lands here
    assert!(provider.peer().unwrap().settings().routes.is_empty());
    engine.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_default_group_exhausted_stops_tunnel() {
    let provider = MemoryDeviceProvider::new();
    let transport = MockTransport::new();
    let engine = engine(&provider, &transport);
    engine.start(proxied_config()).await.unwrap();
    let peer = provider.peer().unwrap();
    let mut events = engine.subscribe();

    transport.fail("e1", true);
    transport.channel(0).kill();
    assert!(eventually(|| engine.sessions().is_empty()).await);
    assert!(engine.state().is_running());

    let (_, packet) = tcp(APP, "93.184.216.34:443", b"x");
    peer.inject(packet).unwrap();

    let states = states_until(&mut events, TunnelState::Stopped).await;
    assert_eq!(states.len(), 2);
    assert!(matches!(&states[0], TunnelState::Error(reason) if reason.contains("unhealthy")));
    assert_eq!(states[1], TunnelState::Stopped);
    assert_eq!(transport.connects("e1"), 6);
    assert!(peer.is_closed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_decision_fixed_for_flow_lifetime() {
    let provider = MemoryDeviceProvider::new();
    let transport = MockTransport::new();
    let resolver = Arc::new(SwitchingResolver {
        app: Mutex::new("com.browser".into()),
        lookups: AtomicUsize::new(0),
    });
    let engine = TunnelEngine::builder(Arc::new(provider.clone()), transport.clone())
        .app_resolver(resolver.clone())
        .build();
    let mut config = proxied_config();
    config.app_policy = AppPolicy {
        mode: AppPolicyMode::Deny,
        apps: vec!["com.blocked".into()],
    };
    engine.start(config).await.unwrap();
    let peer = provider.peer().unwrap();

    let (key, packet) = tcp(APP, "93.184.216.34:443", b"first");
    peer.inject(packet).unwrap();
    assert!(receive(&peer).await.is_some());
    assert_eq!(engine.flow(&key).unwrap().decision, Decision::Proxy);

    // The owner now resolves to a denied app; the flow keeps its decision
    *resolver.app.lock() = "com.blocked".into();
    let (_, packet) = tcp(APP, "93.184.216.34:443", b"second");
    peer.inject(packet.clone()).unwrap();
    assert_eq!(receive(&peer).await, Some(packet));

    let flow = engine.flow(&key).unwrap();
    assert_eq!(flow.decision, Decision::Proxy);
    assert_eq!(flow.app.as_deref(), Some("com.browser"));
    assert_eq!(resolver.lookups.load(Ordering::SeqCst), 1);

    // A new flow from the same app is classified with the new answer
    let (other, packet) = tcp("10.1.10.1:40001", "93.184.216.34:443", b"third");
    peer.inject(packet).unwrap();
    assert!(eventually(|| engine.flow(&other).is_some()).await);
    assert_eq!(engine.flow(&other).unwrap().decision, Decision::Drop);
    engine.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancelled_start_returns_to_stopped() {
    let provider = MemoryDeviceProvider::new();
    let transport = MockTransport::new();
    transport.set_delay(Duration::from_millis(300));
    let engine = engine(&provider, &transport);

    let starting = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.start(proxied_config()).await })
    };
    assert!(eventually(|| engine.state() == TunnelState::Starting).await);

    starting.abort();
    assert!(starting.await.unwrap_err().is_cancelled());

    assert!(eventually(|| engine.state() == TunnelState::Stopped).await);
    assert!(provider.peer().unwrap().is_closed());
    assert_eq!(engine.start(proxied_config()).await, Ok(TunnelState::Running));
    assert_eq!(provider.opened(), 2);
    engine.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_refuses_start() {
    let provider = MemoryDeviceProvider::new();
    let transport = MockTransport::new();
    let engine = engine(&provider, &transport);
    engine.start(TunnelConfig::default()).await.unwrap();

    assert_eq!(engine.init(), vtun_engine::version());
    engine.shutdown().await;

    assert_eq!(engine.state(), TunnelState::Stopped);
    let err = engine.start(TunnelConfig::default()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ShutDown);
}

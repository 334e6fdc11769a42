//! Packet Capture Interface
//!
//! Owns the virtual network device. The OS side is reached through a
//! builder modelled on the mobile VPN builder APIs: the engine asks a
//! [`DeviceProvider`] for an [`InterfaceBuilder`], applies every setting from
//! the [`TunnelConfig`], then calls `establish` to get the device.
//!
//! A rejected route, DNS server or app entry is logged and skipped. Opening
//! fails only when the device itself cannot be created.

use crate::config::{AppPolicyMode, TunnelConfig};
use crossbeam_channel::{Receiver, Sender, select};
use ipnet::IpNet;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Capture errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    #[error("Permission to create the virtual device was not granted")]
    PermissionDenied,

    #[error("Device creation failed: {0}")]
    DeviceCreation(String),

    #[error("Entry rejected: {0}")]
    Rejected(String),

    #[error("Device closed")]
    Closed,

    #[error("Packet of {len} bytes exceeds MTU {mtu}")]
    PacketTooLarge { len: usize, mtu: u16 },

    #[error("Operation not supported by this device")]
    Unsupported,

    #[error("Device I/O error: {0}")]
    Io(String),
}

/// Source of virtual devices (the OS VPN service, or the in-memory device)
pub trait DeviceProvider: Send + Sync {
    /// Start building a new device; fails fast with
    /// [`CaptureError::PermissionDenied`] when unauthorized
    fn builder(&self) -> Result<Box<dyn InterfaceBuilder>, CaptureError>;

    /// Has the collaborator obtained authorization to create devices?
    fn has_permission(&self) -> bool {
        true
    }
}

/// Accumulates interface settings before the device is created
pub trait InterfaceBuilder: Send {
    fn set_session(&mut self, name: &str);
    fn set_mtu(&mut self, mtu: u16) -> Result<(), CaptureError>;
    fn add_address(&mut self, address: IpNet) -> Result<(), CaptureError>;
    fn add_route(&mut self, route: IpNet) -> Result<(), CaptureError>;
    fn exclude_route(&mut self, route: IpNet) -> Result<(), CaptureError>;
    fn add_dns_server(&mut self, server: IpAddr) -> Result<(), CaptureError>;
    fn add_allowed_application(&mut self, app: &str) -> Result<(), CaptureError>;
    fn add_disallowed_application(&mut self, app: &str) -> Result<(), CaptureError>;
    /// Create the device; all matching traffic is redirected to it while open
    fn establish(self: Box<Self>) -> Result<Arc<dyn VirtualDevice>, CaptureError>;
}

/// An open virtual device
pub trait VirtualDevice: Send + Sync {
    /// Block until a packet is available; [`CaptureError::Closed`] once closed
    fn read_packet(&self, buf: &mut [u8]) -> Result<usize, CaptureError>;
    fn write_packet(&self, packet: &[u8]) -> Result<(), CaptureError>;
    /// Release the device and unblock pending reads
    fn close(&self);
    fn is_closed(&self) -> bool;

    /// Replace the DNS servers of the live device
    fn update_dns(&self, _servers: &[IpAddr]) -> Result<(), CaptureError> {
        Err(CaptureError::Unsupported)
    }

    /// Replace the captured routes of the live device
    fn update_routes(&self, _routes: &[IpNet]) -> Result<(), CaptureError> {
        Err(CaptureError::Unsupported)
    }
}

/// Entries the OS refused while opening
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpenReport {
    pub skipped: Vec<String>,
}

/// Capture statistics
#[derive(Debug, Default)]
pub struct CaptureStats {
    pub packets_read: AtomicU64,
    pub packets_written: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
}

/// The open capture interface
pub struct CaptureInterface {
    device: Arc<dyn VirtualDevice>,
    mtu: u16,
    closed: AtomicBool,
    stats: CaptureStats,
}

impl CaptureInterface {
    /// Open the virtual device and apply the configuration atomically
    pub fn open(
        provider: &dyn DeviceProvider,
        config: &TunnelConfig,
    ) -> Result<(Self, OpenReport), CaptureError> {
        let mut builder = provider.builder()?;
        let mut report = OpenReport::default();

        builder.set_session(&config.session_name);
        builder.set_mtu(config.mtu)
            .map_err(|e| CaptureError::DeviceCreation(format!("MTU {}: {}", config.mtu, e)))?;
        builder.add_address(config.address)
            .map_err(|e| CaptureError::DeviceCreation(format!("address {}: {}", config.address, e)))?;

        // Without endpoints everything is Direct, so nothing is routed into
        // the device
        if config.is_pure_bypass() {
            info!("Pure bypass mode, not capturing any route");
        } else {
            for route in &config.routes {
                skip_rejected(&mut report, format!("route {}", route), builder.add_route(*route));
            }
            for range in config.bypass_ranges() {
                skip_rejected(&mut report, format!("excluded route {}", range), builder.exclude_route(range));
            }
        }
        for server in &config.dns {
            skip_rejected(&mut report, format!("dns {}", server), builder.add_dns_server(*server));
        }

        let policy = &config.app_policy;
        match policy.mode {
            AppPolicyMode::Allow => {
                for app in &policy.apps {
                    skip_rejected(&mut report, format!("allowed app {}", app), builder.add_allowed_application(app));
                }
            }
            AppPolicyMode::Deny => {
                for app in &policy.apps {
                    skip_rejected(&mut report, format!("disallowed app {}", app), builder.add_disallowed_application(app));
                }
            }
            AppPolicyMode::Off => {}
        }

        // The hosting app must never loop through its own tunnel. The OS
        // rejects mixing allowed and disallowed apps, so allow mode relies on
        // the package being absent from the list.
        if let Some(own) = &config.self_package {
            if policy.mode != AppPolicyMode::Allow && !policy.lists(own) {
                skip_rejected(&mut report, format!("own package {}", own), builder.add_disallowed_application(own));
            }
        }

        let device = builder.establish()?;
        info!(
            "Virtual device '{}' established ({}, MTU {}, {} skipped entries)",
            config.session_name,
            config.address,
            config.mtu,
            report.skipped.len()
        );

        Ok((
            Self {
                device,
                mtu: config.mtu,
                closed: AtomicBool::new(false),
                stats: CaptureStats::default(),
            },
            report,
        ))
    }

    /// Read the next packet, blocking until one arrives or the device closes
    pub fn read_packet(&self, buf: &mut [u8]) -> Result<usize, CaptureError> {
        let n = self.device.read_packet(buf)?;
        self.stats.packets_read.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    /// Inject a packet toward applications
    pub fn write_packet(&self, packet: &[u8]) -> Result<(), CaptureError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CaptureError::Closed);
        }
        if packet.len() > usize::from(self.mtu) {
            return Err(CaptureError::PacketTooLarge { len: packet.len(), mtu: self.mtu });
        }
        self.device.write_packet(packet)?;
        self.stats.packets_written.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_written.fetch_add(packet.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Close the device (idempotent)
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.device.close();
        info!("Virtual device closed");
    }

    /// Check if the interface or its device was closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.device.is_closed()
    }

    /// Get the device MTU
    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    /// Get packet and byte counters
    pub fn stats(&self) -> &CaptureStats {
        &self.stats
    }

    /// Push new DNS servers to the live device
    pub fn update_dns(&self, servers: &[IpAddr]) -> Result<(), CaptureError> {
        self.device.update_dns(servers)
    }

    /// Push new routes to the live device
    pub fn update_routes(&self, routes: &[IpNet]) -> Result<(), CaptureError> {
        self.device.update_routes(routes)
    }
}

impl Drop for CaptureInterface {
    fn drop(&mut self) {
        self.close();
    }
}

fn skip_rejected(report: &mut OpenReport, entry: String, result: Result<(), CaptureError>) {
    if let Err(e) = result {
        warn!("Skipping {}: {}", entry, e);
        report.skipped.push(entry);
    }
}

/// Settings a [`MemoryDeviceProvider`] device was built with
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppliedSettings {
    pub session: String,
    pub mtu: u16,
    pub addresses: Vec<IpNet>,
    pub routes: Vec<IpNet>,
    pub excluded_routes: Vec<IpNet>,
    pub dns: Vec<IpAddr>,
    pub allowed_apps: Vec<String>,
    pub disallowed_apps: Vec<String>,
}

#[derive(Default)]
struct ProviderState {
    permission_denied: bool,
    rejected_routes: HashSet<IpNet>,
    rejected_dns: HashSet<IpAddr>,
    rejected_apps: HashSet<String>,
    fail_establish: bool,
    opened: u64,
    current: Option<DevicePeer>,
}

/// Channel-backed device provider for embedding and tests
///
/// Every `establish` creates a fresh device; [`MemoryDeviceProvider::peer`]
/// returns the application-side handle of the most recent one.
#[derive(Clone, Default)]
pub struct MemoryDeviceProvider {
    state: Arc<Mutex<ProviderState>>,
}

impl MemoryDeviceProvider {
    /// Create a provider with permission granted and no rejections
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse to hand out builders, as an unauthorized OS would
    pub fn deny_permission(&self, denied: bool) {
        self.state.lock().permission_denied = denied;
    }

    /// Make the builder reject a route
    pub fn reject_route(&self, route: IpNet) {
        self.state.lock().rejected_routes.insert(route);
    }

    /// Make the builder reject a DNS server
    pub fn reject_dns(&self, server: IpAddr) {
        self.state.lock().rejected_dns.insert(server);
    }

    /// Make the builder reject an app id
    pub fn reject_app(&self, app: &str) {
        self.state.lock().rejected_apps.insert(app.to_string());
    }

    /// Make `establish` fail
    pub fn fail_establish(&self, fail: bool) {
        self.state.lock().fail_establish = fail;
    }

    /// Number of devices created so far
    pub fn opened(&self) -> u64 {
        self.state.lock().opened
    }

    /// Application-side handle of the current device
    pub fn peer(&self) -> Option<DevicePeer> {
        self.state.lock().current.clone()
    }
}

impl DeviceProvider for MemoryDeviceProvider {
    fn has_permission(&self) -> bool {
        !self.state.lock().permission_denied
    }

    fn builder(&self) -> Result<Box<dyn InterfaceBuilder>, CaptureError> {
        if self.state.lock().permission_denied {
            return Err(CaptureError::PermissionDenied);
        }
        Ok(Box::new(MemoryBuilder {
            provider: self.clone(),
            settings: AppliedSettings::default(),
        }))
    }
}

struct MemoryBuilder {
    provider: MemoryDeviceProvider,
    settings: AppliedSettings,
}

impl MemoryBuilder {
    fn rejected<T: std::fmt::Display>(what: &str, value: T) -> CaptureError {
        CaptureError::Rejected(format!("{} {}", what, value))
    }
}

impl InterfaceBuilder for MemoryBuilder {
    fn set_session(&mut self, name: &str) {
        self.settings.session = name.to_string();
    }

    fn set_mtu(&mut self, mtu: u16) -> Result<(), CaptureError> {
        self.settings.mtu = mtu;
        Ok(())
    }

    fn add_address(&mut self, address: IpNet) -> Result<(), CaptureError> {
        self.settings.addresses.push(address);
        Ok(())
    }

    fn add_route(&mut self, route: IpNet) -> Result<(), CaptureError> {
        if self.provider.state.lock().rejected_routes.contains(&route) {
            return Err(Self::rejected("route", route));
        }
        self.settings.routes.push(route);
        Ok(())
    }

    fn exclude_route(&mut self, route: IpNet) -> Result<(), CaptureError> {
        if self.provider.state.lock().rejected_routes.contains(&route) {
            return Err(Self::rejected("route", route));
        }
        self.settings.excluded_routes.push(route);
        Ok(())
    }

    fn add_dns_server(&mut self, server: IpAddr) -> Result<(), CaptureError> {
        if self.provider.state.lock().rejected_dns.contains(&server) {
            return Err(Self::rejected("dns", server));
        }
        self.settings.dns.push(server);
        Ok(())
    }

    fn add_allowed_application(&mut self, app: &str) -> Result<(), CaptureError> {
        if self.provider.state.lock().rejected_apps.contains(app) {
            return Err(Self::rejected("app", app));
        }
        self.settings.allowed_apps.push(app.to_string());
        Ok(())
    }

    fn add_disallowed_application(&mut self, app: &str) -> Result<(), CaptureError> {
        if self.provider.state.lock().rejected_apps.contains(app) {
            return Err(Self::rejected("app", app));
        }
        self.settings.disallowed_apps.push(app.to_string());
        Ok(())
    }

    fn establish(self: Box<Self>) -> Result<Arc<dyn VirtualDevice>, CaptureError> {
        let mut state = self.provider.state.lock();
        if state.fail_establish {
            return Err(CaptureError::DeviceCreation("establish refused".into()));
        }

        let (to_device_tx, to_device_rx) = crossbeam_channel::unbounded();
        let (to_apps_tx, to_apps_rx) = crossbeam_channel::unbounded();
        let (close_tx, close_rx) = crossbeam_channel::bounded::<()>(0);

        let shared = Arc::new(MemoryShared {
            settings: Mutex::new(self.settings),
            close_tx: Mutex::new(Some(close_tx)),
            closed: AtomicBool::new(false),
        });

        let device = Arc::new(MemoryDevice {
            inbound: to_device_rx,
            outbound: to_apps_tx,
            close_rx,
            shared: shared.clone(),
        });

        state.opened += 1;
        state.current = Some(DevicePeer {
            to_device: to_device_tx,
            from_device: to_apps_rx,
            shared,
        });
        debug!("Memory device #{} established", state.opened);

        Ok(device)
    }
}

struct MemoryShared {
    settings: Mutex<AppliedSettings>,
    close_tx: Mutex<Option<Sender<()>>>,
    closed: AtomicBool,
}

struct MemoryDevice {
    inbound: Receiver<Vec<u8>>,
    outbound: Sender<Vec<u8>>,
    close_rx: Receiver<()>,
    shared: Arc<MemoryShared>,
}

impl VirtualDevice for MemoryDevice {
    fn read_packet(&self, buf: &mut [u8]) -> Result<usize, CaptureError> {
        if self.is_closed() {
            return Err(CaptureError::Closed);
        }
        select! {
            recv(self.inbound) -> msg => match msg {
                Ok(packet) => {
                    let n = packet.len().min(buf.len());
                    buf[..n].copy_from_slice(&packet[..n]);
                    Ok(n)
                }
                Err(_) => Err(CaptureError::Closed),
            },
            // Disconnects when the close sender is dropped
            recv(self.close_rx) -> _ => Err(CaptureError::Closed),
        }
    }

    fn write_packet(&self, packet: &[u8]) -> Result<(), CaptureError> {
        if self.is_closed() {
            return Err(CaptureError::Closed);
        }
        self.outbound
            .send(packet.to_vec())
            .map_err(|_| CaptureError::Io("application side gone".into()))
    }

    fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.close_tx.lock().take();
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    fn update_dns(&self, servers: &[IpAddr]) -> Result<(), CaptureError> {
        self.shared.settings.lock().dns = servers.to_vec();
        Ok(())
    }

    fn update_routes(&self, routes: &[IpNet]) -> Result<(), CaptureError> {
        self.shared.settings.lock().routes = routes.to_vec();
        Ok(())
    }
}

/// Application side of a memory device
#[derive(Clone)]
pub struct DevicePeer {
    to_device: Sender<Vec<u8>>,
    from_device: Receiver<Vec<u8>>,
    shared: Arc<MemoryShared>,
}

impl DevicePeer {
    /// Send a packet into the device, as an application would
    pub fn inject(&self, packet: Vec<u8>) -> Result<(), CaptureError> {
        if self.is_closed() {
            return Err(CaptureError::Closed);
        }
        self.to_device.send(packet).map_err(|_| CaptureError::Closed)
    }

    /// Wait for a packet the engine wrote toward applications
    pub fn receive(&self, timeout: Duration) -> Option<Vec<u8>> {
        self.from_device.recv_timeout(timeout).ok()
    }

    /// Simulate the OS tearing the device down
    pub fn kill(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.close_tx.lock().take();
    }

    /// Check if the device was torn down
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Settings the device was built with (updated by live DNS/route changes)
    pub fn settings(&self) -> AppliedSettings {
        self.shared.settings.lock().clone()
    }
}

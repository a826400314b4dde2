//! LAN discovery: UDP multicast beacons, direct replies, peer expiry.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use meshlink_core::{Discovery, DiscoveryEvent, MeshError, MeshResult, PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Socket and timing parameters for [`BeaconDiscovery`].
#[derive(Debug, Clone)]
pub struct BeaconSettings {
    pub discovery_port: u16,
    pub multicast_group: Ipv4Addr,
    pub beacon_interval: Duration,
    pub peer_timeout: Duration,
}

/// Advertisement of one running instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Announcement {
    protocol_version: u8,
    instance_id: Uuid,
    service_name: String,
    listen_port: u16,
}

/// Discovery datagram. A multicast `Announce` is answered with a unicast
/// `Reply`; replies are never answered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum Beacon {
    Announce(Announcement),
    Reply(Announcement),
    Goodbye { instance_id: Uuid },
}

struct Advert {
    service_name: String,
    port: u16,
    beacon: CancellationToken,
}

struct Watcher {
    service_name: String,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
    peers: PeerTable,
    expiry: CancellationToken,
}

impl Watcher {
    fn emit(&self, event: DiscoveryEvent) {
        if let Err(e) = self.events.send(event) {
            tracing::trace!(event = ?e.0, "discovery event receiver dropped");
        }
    }
}

struct Shared {
    instance_id: Uuid,
    settings: BeaconSettings,
    socket: UdpSocket,
    advert: Mutex<Option<Advert>>,
    watcher: Mutex<Option<Watcher>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn announcement(&self, service_name: &str, port: u16) -> Announcement {
        Announcement {
            protocol_version: PROTOCOL_VERSION,
            instance_id: self.instance_id,
            service_name: service_name.to_owned(),
            listen_port: port,
        }
    }

    fn group_addr(&self) -> SocketAddr {
        SocketAddr::from((self.settings.multicast_group, self.settings.discovery_port))
    }

    /// Our announcement, if we advertise `service_name`.
    fn own_announcement_for(&self, service_name: &str) -> Option<Announcement> {
        let advert = lock(&self.advert);
        advert
            .as_ref()
            .filter(|a| a.service_name == service_name)
            .map(|a| self.announcement(&a.service_name, a.port))
    }

    fn try_send(&self, beacon: &Beacon, dest: SocketAddr) {
        let datagram = match bincode::serialize(beacon) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode beacon");
                return;
            }
        };
        if let Err(e) = self.socket.try_send_to(&datagram, dest) {
            tracing::debug!(dest = %dest, error = %e, "Failed to send beacon");
        }
    }

    /// Handle one datagram; returns a reply to send back to `from`, if any.
    fn handle_datagram(&self, datagram: &[u8], from: SocketAddr, now: Instant) -> Option<Beacon> {
        let beacon: Beacon = match bincode::deserialize(datagram) {
            Ok(b) => b,
            Err(e) => {
                tracing::trace!(from = %from, error = %e, "Ignoring malformed beacon");
                return None;
            }
        };
        match beacon {
            Beacon::Announce(a) | Beacon::Reply(a) if a.instance_id == self.instance_id => None,
            Beacon::Announce(a) | Beacon::Reply(a) if a.protocol_version != PROTOCOL_VERSION => {
                tracing::debug!(from = %from, version = a.protocol_version, "Ignoring beacon from other protocol version");
                None
            }
            Beacon::Announce(a) => {
                self.observe(&a, from.ip(), now);
                self.own_announcement_for(&a.service_name).map(Beacon::Reply)
            }
            Beacon::Reply(a) => {
                self.observe(&a, from.ip(), now);
                None
            }
            Beacon::Goodbye { instance_id } => {
                let mut watcher = lock(&self.watcher);
                if let Some(w) = watcher.as_mut() {
                    if let Some(addr) = w.peers.forget(&instance_id) {
                        tracing::info!(peer = %addr, "Peer said goodbye");
                        w.emit(DiscoveryEvent::Lost { addr });
                    }
                }
                None
            }
        }
    }

    fn observe(&self, a: &Announcement, addr: IpAddr, now: Instant) {
        let mut watcher = lock(&self.watcher);
        let Some(w) = watcher.as_mut() else {
            return;
        };
        if w.service_name != a.service_name {
            return;
        }
        if w.peers.observe(a.instance_id, addr, now) {
            tracing::info!(peer = %addr, port = a.listen_port, "Discovered peer");
        }
        w.emit(DiscoveryEvent::Found {
            addr,
            port: a.listen_port,
        });
    }

    fn expire(&self, now: Instant) {
        let mut watcher = lock(&self.watcher);
        if let Some(w) = watcher.as_mut() {
            for addr in w.peers.expire(now, self.settings.peer_timeout) {
                tracing::info!(peer = %addr, "Peer timed out");
                w.emit(DiscoveryEvent::Lost { addr });
            }
        }
    }
}

/// Live instances by id. Lost is reported per address, once no live
/// instance remains there.
#[derive(Default)]
struct PeerTable {
    peers: HashMap<Uuid, (IpAddr, Instant)>,
}

impl PeerTable {
    /// Record a beacon. Returns true for a newly seen instance.
    fn observe(&mut self, id: Uuid, addr: IpAddr, now: Instant) -> bool {
        self.peers.insert(id, (addr, now)).is_none()
    }

    fn forget(&mut self, id: &Uuid) -> Option<IpAddr> {
        let (addr, _) = self.peers.remove(id)?;
        (!self.has_addr(addr)).then_some(addr)
    }

    fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<IpAddr> {
        let mut gone: Vec<IpAddr> = Vec::new();
        self.peers.retain(|_, (addr, last_seen)| {
            let alive = now.duration_since(*last_seen) < timeout;
            if !alive {
                gone.push(*addr);
            }
            alive
        });
        gone.sort();
        gone.dedup();
        gone.retain(|addr| !self.has_addr(*addr));
        gone
    }

    fn has_addr(&self, addr: IpAddr) -> bool {
        self.peers.values().any(|(a, _)| *a == addr)
    }
}

/// [`Discovery`] over a UDP multicast group on the local network.
pub struct BeaconDiscovery {
    shared: Arc<Shared>,
    shutdown: CancellationToken,
}

impl BeaconDiscovery {
    /// Bind the discovery socket and start answering beacons. Must run inside a tokio runtime.
    pub fn bind(settings: BeaconSettings) -> io::Result<Self> {
        let socket = make_multicast_socket(&settings)?;
        let instance_id = Uuid::new_v4();
        tracing::info!(
            port = settings.discovery_port,
            group = %settings.multicast_group,
            instance = %instance_id,
            "Discovery socket ready"
        );
        let shared = Arc::new(Shared {
            instance_id,
            settings,
            socket,
            advert: Mutex::new(None),
            watcher: Mutex::new(None),
        });
        let shutdown = CancellationToken::new();
        tokio::spawn(recv_loop(shared.clone(), shutdown.clone()));
        Ok(Self { shared, shutdown })
    }
}

impl Drop for BeaconDiscovery {
    fn drop(&mut self) {
        self.unregister_local_service();
        self.stop_discovery();
        self.shutdown.cancel();
    }
}

impl Discovery for BeaconDiscovery {
    fn register_local_service(&self, service_name: &str, port: u16) -> MeshResult<()> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| MeshError::Discovery(e.to_string()))?;
        let beacon = CancellationToken::new();
        let previous = lock(&self.shared.advert).replace(Advert {
            service_name: service_name.to_owned(),
            port,
            beacon: beacon.clone(),
        });
        if let Some(previous) = previous {
            previous.beacon.cancel();
        }
        let announcement = self.shared.announcement(service_name, port);
        handle.spawn(beacon_loop(self.shared.clone(), announcement, beacon));
        tracing::info!(service = %service_name, port, "Advertising service");
        Ok(())
    }

    fn unregister_local_service(&self) {
        let Some(advert) = lock(&self.shared.advert).take() else {
            return;
        };
        advert.beacon.cancel();
        self.shared.try_send(
            &Beacon::Goodbye {
                instance_id: self.shared.instance_id,
            },
            self.shared.group_addr(),
        );
        tracing::info!(service = %advert.service_name, "Stopped advertising service");
    }

    fn start_discovery(
        &self,
        service_name: &str,
        events: mpsc::UnboundedSender<DiscoveryEvent>,
    ) -> MeshResult<()> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| MeshError::Discovery(e.to_string()))?;
        let expiry = CancellationToken::new();
        let previous = lock(&self.shared.watcher).replace(Watcher {
            service_name: service_name.to_owned(),
            events,
            peers: PeerTable::default(),
            expiry: expiry.clone(),
        });
        if let Some(previous) = previous {
            previous.expiry.cancel();
        }
        handle.spawn(expiry_loop(self.shared.clone(), expiry));

        // Prompt peers to reply now rather than at their next beacon.
        if let Some(own) = self.shared.own_announcement_for(service_name) {
            self.shared
                .try_send(&Beacon::Announce(own), self.shared.group_addr());
        }
        tracing::info!(service = %service_name, "Discovery started");
        Ok(())
    }

    fn stop_discovery(&self) {
        if let Some(watcher) = lock(&self.shared.watcher).take() {
            watcher.expiry.cancel();
            tracing::info!(service = %watcher.service_name, "Discovery stopped");
        }
    }

    fn is_discovering(&self) -> bool {
        lock(&self.shared.watcher).is_some()
    }
}

fn make_multicast_socket(settings: &BeaconSettings) -> io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, settings.discovery_port))?;
    std_sock.join_multicast_v4(&settings.multicast_group, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_multicast_loop_v4(true)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

async fn beacon_loop(shared: Arc<Shared>, announcement: Announcement, cancel: CancellationToken) {
    let beacon = Beacon::Announce(announcement);
    let mut ticker = tokio::time::interval(shared.settings.beacon_interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => shared.try_send(&beacon, shared.group_addr()),
        }
    }
}

async fn recv_loop(shared: Arc<Shared>, shutdown: CancellationToken) {
    let mut buf = vec![0u8; 65536];
    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = shared.socket.recv_from(&mut buf) => received,
        };
        match received {
            Ok((n, from)) => {
                if let Some(reply) = shared.handle_datagram(&buf[..n], from, Instant::now()) {
                    shared.try_send(&reply, from);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Discovery receive error");
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
        }
    }
    tracing::debug!("Discovery receive loop stopped");
}

async fn expiry_loop(shared: Arc<Shared>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(shared.settings.beacon_interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => shared.expire(Instant::now()),
        }
    }
}

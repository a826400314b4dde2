//! Connection coordinator: the facade that ties the acceptor, the registry,
//! discovery and the event sink together.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures::future::join_all;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::acceptor::ConnectionAcceptor;
use crate::config::MeshConfig;
use crate::connection::{PeerConnection, PeerState};
use crate::discovery::{Discovery, DiscoveryEvent};
use crate::error::{MeshError, MeshResult};
use crate::events::EventSink;
use crate::identity::PeerIdentity;
use crate::protocol::Message;
use crate::registry::PeerRegistry;

/// State shared by the coordinator, the accept loop and every connection.
pub(crate) struct MeshContext {
    pub(crate) registry: PeerRegistry<PeerConnection>,
    pub(crate) sink: Arc<dyn EventSink>,
    pub(crate) config: MeshConfig,
    /// Last value pushed through `on_connected_changed`.
    mesh_connected: Mutex<bool>,
    shutting_down: AtomicBool,
}

impl MeshContext {
    pub(crate) fn new(config: MeshConfig, sink: Arc<dyn EventSink>) -> Self {
        Self {
            registry: PeerRegistry::new(),
            sink,
            config,
            mesh_connected: Mutex::new(false),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub(crate) fn set_shutting_down(&self, value: bool) {
        self.shutting_down.store(value, Ordering::Release);
    }

    pub(crate) async fn any_connected(&self) -> bool {
        self.registry
            .snapshot()
            .await
            .iter()
            .any(|(_, conn)| conn.is_connected())
    }

    /// Recompute the aggregate state and notify the sink if it changed.
    pub(crate) async fn refresh_connected(&self, force: bool) -> bool {
        let mut published = self.mesh_connected.lock().await;
        let connected = self.any_connected().await;
        if force || connected != *published {
            *published = connected;
            tracing::info!(connected, "Updating client about mesh connection");
            self.sink.on_connected_changed(connected);
        }
        connected
    }
}

/// Diagnostic view of one registry entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSummary {
    pub identity: PeerIdentity,
    pub dial_port: Option<u16>,
    pub state: PeerState,
    pub published: bool,
}

struct Inner {
    ctx: Arc<MeshContext>,
    discovery: Arc<dyn Discovery>,
    acceptor: Mutex<Option<ConnectionAcceptor>>,
    service_name: Mutex<Option<String>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

/// Manages the mesh of peer connections. Cheap to clone.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    pub fn new(config: MeshConfig, discovery: Arc<dyn Discovery>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            inner: Arc::new(Inner {
                ctx: Arc::new(MeshContext::new(config, sink)),
                discovery,
                acceptor: Mutex::new(None),
                service_name: Mutex::new(None),
                pump: Mutex::new(None),
            }),
        }
    }

    /// Bind the acceptor (if needed), advertise its port and start discovery.
    /// Starting under a different service name tears the old mesh down first.
    pub async fn start(&self, service_name: &str) -> MeshResult<u16> {
        let current = self.inner.service_name.lock().await.clone();
        if let Some(current) = current {
            if current != service_name {
                tracing::info!(from = %current, to = %service_name, "Service name changed, restarting mesh");
                self.tear_down_all().await;
            }
        }
        self.inner.ctx.set_shutting_down(false);

        let port = {
            let mut acceptor = self.inner.acceptor.lock().await;
            match acceptor.as_ref() {
                Some(running) => running.local_port(),
                None => {
                    let started = ConnectionAcceptor::start(self.inner.ctx.clone()).await?;
                    let port = started.local_port();
                    *acceptor = Some(started);
                    port
                }
            }
        };

        *self.inner.service_name.lock().await = Some(service_name.to_owned());
        self.inner.discovery.register_local_service(service_name, port)?;
        self.start_discovery(service_name).await?;
        tracing::info!(service = %service_name, port, "Mesh started");
        Ok(port)
    }

    /// Stop discovery; existing connections stay up.
    pub async fn pause(&self) {
        tracing::debug!("Pausing discovery");
        self.stop_discovery().await;
    }

    /// Reconnect every shell, restart discovery and re-announce the mesh state.
    pub async fn resume(&self) -> MeshResult<()> {
        let name = self
            .inner
            .service_name
            .lock()
            .await
            .clone()
            .ok_or(MeshError::NotStarted)?;
        self.refresh().await;
        self.start_discovery(&name).await?;
        self.inner.ctx.refresh_connected(true).await;
        Ok(())
    }

    /// `check_reconnect` on every registered peer.
    pub async fn refresh(&self) {
        let peers = self.inner.ctx.registry.snapshot().await;
        join_all(peers.iter().map(|(_, conn)| conn.check_reconnect())).await;
    }

    pub async fn refresh_all(&self) -> MeshResult<()> {
        self.pause().await;
        self.resume().await
    }

    /// Discovery reported a peer listening on `addr:port`.
    pub async fn on_peer_found(&self, addr: IpAddr, port: u16) -> bool {
        let ctx = &self.inner.ctx;
        if ctx.is_shutting_down() {
            return false;
        }
        let identity = PeerIdentity::from(addr);
        let existing = match ctx.registry.get(&identity).await {
            Some(conn) => conn,
            None => {
                let conn = PeerConnection::outbound(identity, port, ctx.clone());
                match ctx.registry.insert_if_absent(identity, conn.clone()).await {
                    None if ctx.is_shutting_down() => {
                        conn.tear_down().await;
                        return false;
                    }
                    None => return conn.connect_outbound().await,
                    Some(existing) => existing,
                }
            }
        };
        existing.set_dial_port(port);
        existing.mark_discovery_published(true);
        existing.check_reconnect().await
    }

    /// Discovery no longer sees the peer at `addr`.
    pub async fn on_peer_lost(&self, addr: IpAddr) {
        let identity = PeerIdentity::from(addr);
        let Some(conn) = self.inner.ctx.registry.get(&identity).await else {
            tracing::debug!(peer = %identity, "Lost unknown peer");
            return;
        };
        conn.mark_discovery_published(false);
        if !conn.is_connected() {
            tracing::info!(peer = %identity, "Removing lost peer");
            conn.tear_down().await;
        }
    }

    /// Send to every registered peer. Returns how many accepted the message.
    pub async fn broadcast(&self, message: impl Into<Message>) -> usize {
        let message = message.into();
        let peers = self.inner.ctx.registry.snapshot().await;
        let sent = join_all(peers.iter().map(|(_, conn)| conn.send(&message)))
            .await
            .into_iter()
            .filter(|sent| *sent)
            .count();
        tracing::debug!(peers = peers.len(), sent, kind = message.kind(), "Broadcast");
        sent
    }

    /// Send to one peer.
    pub async fn send_to(&self, addr: IpAddr, message: impl Into<Message>) -> bool {
        match self.inner.ctx.registry.get(&PeerIdentity::from(addr)).await {
            Some(conn) => conn.send(&message.into()).await,
            None => {
                tracing::debug!(peer = %addr, "Send to unknown peer");
                false
            }
        }
    }

    /// True iff at least one peer is connected right now.
    pub async fn is_mesh_connected(&self) -> bool {
        self.inner.ctx.any_connected().await
    }

    /// Bound listening port, or 0 before `start`.
    pub async fn local_port(&self) -> u16 {
        self.inner
            .acceptor
            .lock()
            .await
            .as_ref()
            .map(ConnectionAcceptor::local_port)
            .unwrap_or(0)
    }

    pub async fn peer(&self, addr: IpAddr) -> Option<Arc<PeerConnection>> {
        self.inner.ctx.registry.get(&PeerIdentity::from(addr)).await
    }

    pub async fn peers(&self) -> Vec<PeerSummary> {
        let mut peers: Vec<PeerSummary> = self
            .inner
            .ctx
            .registry
            .snapshot()
            .await
            .into_iter()
            .map(|(identity, conn)| PeerSummary {
                identity,
                dial_port: conn.dial_port(),
                state: conn.state(),
                published: conn.is_discovery_published(),
            })
            .collect();
        peers.sort_by_key(|p| p.identity);
        peers
    }

    /// Network went away: close every socket, keep every entry as a shell.
    pub async fn close_all(&self) {
        let peers = self.inner.ctx.registry.snapshot().await;
        join_all(peers.iter().map(|(_, conn)| conn.close())).await;
    }

    /// Stop accepting, stop advertising and discovering, tear down every peer.
    pub async fn tear_down_all(&self) {
        let ctx = &self.inner.ctx;
        tracing::info!("Tearing down mesh");
        ctx.set_shutting_down(true);

        if let Some(mut acceptor) = self.inner.acceptor.lock().await.take() {
            acceptor.stop().await;
        }
        self.inner.discovery.unregister_local_service();
        self.stop_discovery().await;

        let peers = ctx.registry.snapshot().await;
        join_all(peers.iter().map(|(_, conn)| conn.tear_down())).await;
        for (_, conn) in ctx.registry.drain().await {
            conn.tear_down().await;
        }
        ctx.refresh_connected(false).await;
        *self.inner.service_name.lock().await = None;
    }

    async fn start_discovery(&self, service_name: &str) -> MeshResult<()> {
        let mut pump = self.inner.pump.lock().await;
        if pump.is_some() && self.inner.discovery.is_discovering() {
            return Ok(());
        }
        if let Some(stale) = pump.take() {
            stale.abort();
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.discovery.start_discovery(service_name, tx)?;
        *pump = Some(tokio::spawn(pump_discovery_events(
            Arc::downgrade(&self.inner),
            rx,
        )));
        Ok(())
    }

    async fn stop_discovery(&self) {
        self.inner.discovery.stop_discovery();
        if let Some(pump) = self.inner.pump.lock().await.take() {
            pump.abort();
        }
    }
}

/// Feed discovery events into the coordinator. Dials run on their own tasks
/// so one slow peer does not hold up the others.
async fn pump_discovery_events(
    inner: Weak<Inner>,
    mut events: mpsc::UnboundedReceiver<DiscoveryEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let coordinator = Coordinator { inner };
        match event {
            DiscoveryEvent::Found { addr, port } => {
                tokio::spawn(async move {
                    coordinator.on_peer_found(addr, port).await;
                });
            }
            DiscoveryEvent::Lost { addr } => coordinator.on_peer_lost(addr).await,
        }
    }
    tracing::debug!("Discovery event pump stopped");
}

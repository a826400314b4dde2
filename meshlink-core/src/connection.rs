//! Peer connection: one socket to one peer, its receive loop, and the
//! connected / shell / torn-down state machine.
//!
//! ```text
//! Idle ──dial──▶ Connecting ──ok──▶ Connected ──loss, published──▶ Shell
//!   ▲                │                   │                          │
//!   │                └─fail, published──▶ Shell ◀───────────────────┘
//!   │                                        └──check_reconnect──▶ Connecting
//!   └ (any state) ──tear_down / loss while unpublished──▶ TornDown
//! ```
//!
//! Socket replacement, close and teardown are serialized by the `link` lock.
//! Each attached socket gets a new generation number; the receive loop and the
//! send path only degrade the connection while their generation is current.

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::coordinator::MeshContext;
use crate::error::MeshError;
use crate::identity::PeerIdentity;
use crate::protocol::Message;
use crate::wire::MessageCodec;

/// State of a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerState {
    /// No socket, never connected.
    #[default]
    Idle,
    /// Outbound dial in progress.
    Connecting,
    /// Socket open, receive loop running.
    Connected,
    /// Socket gone but the peer is still advertised; eligible for reconnect.
    Shell,
    /// Terminal. Removed from the registry.
    TornDown,
}

impl PeerState {
    pub fn is_connected(&self) -> bool {
        matches!(self, PeerState::Connected)
    }

    pub fn is_torn_down(&self) -> bool {
        matches!(self, PeerState::TornDown)
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerState::Idle => write!(f, "idle"),
            PeerState::Connecting => write!(f, "connecting"),
            PeerState::Connected => write!(f, "connected"),
            PeerState::Shell => write!(f, "shell"),
            PeerState::TornDown => write!(f, "torn_down"),
        }
    }
}

/// Socket ownership bookkeeping, guarded by `PeerConnection::link`.
#[derive(Default)]
struct Link {
    generation: u64,
    cancel: Option<CancellationToken>,
    receiver: Option<JoinHandle<()>>,
}

struct LinkWriter {
    frames: FramedWrite<OwnedWriteHalf, MessageCodec>,
    cancel: CancellationToken,
    generation: u64,
}

/// Connection to one peer.
pub struct PeerConnection {
    identity: PeerIdentity,
    /// Advertised listening port; 0 while unknown (inbound-only peers).
    dial_port: AtomicU16,
    published: AtomicBool,
    /// Whether the current link was dialed by us.
    dialed: AtomicBool,
    state: watch::Sender<PeerState>,
    link: Mutex<Link>,
    writer: Mutex<Option<LinkWriter>>,
    ctx: Arc<MeshContext>,
}

impl PeerConnection {
    /// Connection to a peer reported by discovery at `identity:port`.
    pub(crate) fn outbound(identity: PeerIdentity, port: u16, ctx: Arc<MeshContext>) -> Arc<Self> {
        tracing::debug!(peer = %identity, port, "Creating connection to peer");
        Self::new(identity, port, true, ctx)
    }

    /// Connection for a socket accepted from `identity`. Not published until
    /// discovery reports the peer.
    pub(crate) fn inbound(identity: PeerIdentity, ctx: Arc<MeshContext>) -> Arc<Self> {
        tracing::debug!(peer = %identity, "Creating connection from peer");
        Self::new(identity, 0, false, ctx)
    }

    fn new(identity: PeerIdentity, port: u16, published: bool, ctx: Arc<MeshContext>) -> Arc<Self> {
        let (state, _) = watch::channel(PeerState::Idle);
        Arc::new(Self {
            identity,
            dial_port: AtomicU16::new(port),
            published: AtomicBool::new(published),
            dialed: AtomicBool::new(false),
            state,
            link: Mutex::new(Link::default()),
            writer: Mutex::new(None),
            ctx,
        })
    }

    pub fn identity(&self) -> PeerIdentity {
        self.identity
    }

    pub fn state(&self) -> PeerState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<PeerState> {
        self.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn dial_port(&self) -> Option<u16> {
        match self.dial_port.load(Ordering::Acquire) {
            0 => None,
            port => Some(port),
        }
    }

    pub(crate) fn set_dial_port(&self, port: u16) {
        self.dial_port.store(port, Ordering::Release);
    }

    pub fn is_discovery_published(&self) -> bool {
        self.published.load(Ordering::Acquire)
    }

    /// Whether a later socket loss leaves a shell (`true`) or tears down (`false`).
    pub fn mark_discovery_published(&self, published: bool) {
        self.published.store(published, Ordering::Release);
    }

    /// True while a dial is in flight or the live link is one we dialed.
    pub(crate) fn holds_outbound_link(&self) -> bool {
        match self.state() {
            PeerState::Connecting => true,
            PeerState::Connected => self.dialed.load(Ordering::Acquire),
            _ => false,
        }
    }

    /// First dial of a discovered peer. Only valid from `Idle`; later attempts
    /// go through [`check_reconnect`](Self::check_reconnect).
    pub async fn connect_outbound(self: &Arc<Self>) -> bool {
        if self.state() != PeerState::Idle {
            tracing::debug!(peer = %self.identity, state = %self.state(), "connect_outbound on a used connection");
            return self.is_connected();
        }
        self.dial().await
    }

    /// Take over a socket accepted by the acceptor.
    pub async fn adopt_inbound(self: &Arc<Self>, stream: TcpStream) -> bool {
        let mut link = self.link.lock().await;
        if self.state().is_torn_down() {
            tracing::debug!(peer = %self.identity, "Dropping accepted socket for torn down connection");
            return false;
        }
        self.detach(&mut link).await;
        self.attach(&mut link, stream, false).await;
        drop(link);
        self.ctx.refresh_connected(false).await;
        true
    }

    /// Redial unless already connected (or a dial is in flight).
    pub async fn check_reconnect(self: &Arc<Self>) -> bool {
        match self.state() {
            PeerState::Connected => return true,
            PeerState::TornDown => return false,
            _ => {}
        }
        tracing::debug!(peer = %self.identity, "Reconnecting");
        self.dial().await
    }

    /// Write one message. Returns `false` when there is no socket or the write fails.
    pub async fn send(self: &Arc<Self>, message: &Message) -> bool {
        let mut writer = self.writer.lock().await;
        let Some(link) = writer.as_mut() else {
            tracing::debug!(peer = %self.identity, state = %self.state(), "No socket, message not sent");
            return false;
        };
        let cancel = link.cancel.clone();
        let generation = link.generation;
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(peer = %self.identity, "Socket closed during send");
                return false;
            }
            result = link.frames.send(message.clone()) => result,
        };
        drop(writer);

        match result {
            Ok(()) => {
                tracing::trace!(peer = %self.identity, kind = message.kind(), "Sent message");
                self.ctx
                    .sink
                    .on_info(&format!("sent {} message to {}", message.kind(), self.identity));
                true
            }
            Err(e @ (MeshError::FrameTooLarge { .. } | MeshError::Serialization(_))) => {
                tracing::warn!(peer = %self.identity, error = %e, "Message not encodable");
                false
            }
            Err(e) => {
                tracing::warn!(peer = %self.identity, error = %e, "Send failed");
                self.on_link_lost(generation).await;
                false
            }
        }
    }

    /// Drop the socket and receive loop but keep the entry as a shell.
    pub async fn close(self: &Arc<Self>) {
        let mut link = self.link.lock().await;
        if matches!(self.state(), PeerState::Idle | PeerState::TornDown) {
            return;
        }
        self.detach(&mut link).await;
        self.set_state(PeerState::Shell);
        drop(link);
        self.ctx.refresh_connected(false).await;
    }

    /// Close everything and leave the registry. Idempotent.
    pub async fn tear_down(self: &Arc<Self>) {
        let link = self.link.lock().await;
        self.tear_down_locked(link).await;
    }

    async fn tear_down_locked(self: &Arc<Self>, mut link: MutexGuard<'_, Link>) {
        if self.state().is_torn_down() {
            return;
        }
        tracing::debug!(peer = %self.identity, "Tearing down connection");
        self.detach(&mut link).await;
        self.set_state(PeerState::TornDown);
        drop(link);
        self.ctx.registry.remove_if_same(&self.identity, self).await;
        self.ctx.refresh_connected(false).await;
    }

    async fn dial(self: &Arc<Self>) -> bool {
        let Some(port) = self.dial_port() else {
            tracing::debug!(peer = %self.identity, "No advertised port, cannot dial");
            return false;
        };
        {
            let mut link = self.link.lock().await;
            match self.state() {
                PeerState::TornDown | PeerState::Connecting => return false,
                PeerState::Connected => return true,
                PeerState::Idle | PeerState::Shell => {}
            }
            self.detach(&mut link).await;
            self.set_state(PeerState::Connecting);
        }

        let addr = self.identity.socket_addr(port);
        tracing::debug!(addr = %addr, "Connecting to peer");
        let result = match timeout(
            self.ctx.config.connect_timeout,
            open_stream(addr, self.ctx.config.dial_source_ip()),
        )
        .await
        {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(MeshError::Io(e)),
            Err(_) => Err(MeshError::ConnectTimeout { addr }),
        };

        let mut link = self.link.lock().await;
        if self.state() != PeerState::Connecting {
            // Torn down, closed or superseded while dialing.
            tracing::debug!(addr = %addr, state = %self.state(), "Dial result discarded");
            return false;
        }
        if self.ctx.is_shutting_down() {
            tracing::debug!(addr = %addr, "Dial finished during shutdown");
            self.tear_down_locked(link).await;
            return false;
        }
        match result {
            Ok(stream) => {
                self.attach(&mut link, stream, true).await;
                drop(link);
                self.ctx.refresh_connected(false).await;
                true
            }
            Err(e) => {
                tracing::warn!(addr = %addr, error = %e, "Failed to connect to peer");
                self.settle_after_loss(link).await;
                false
            }
        }
    }

    async fn attach(self: &Arc<Self>, link: &mut Link, stream: TcpStream, dialed: bool) {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!(peer = %self.identity, error = %e, "Failed to set TCP_NODELAY");
        }
        let (read_half, write_half) = stream.into_split();
        let codec = MessageCodec::with_max_frame_len(self.ctx.config.max_frame_len);
        let cancel = CancellationToken::new();
        link.generation += 1;

        *self.writer.lock().await = Some(LinkWriter {
            frames: FramedWrite::new(write_half, codec.clone()),
            cancel: cancel.clone(),
            generation: link.generation,
        });
        link.receiver = Some(tokio::spawn(receive_loop(
            self.clone(),
            FramedRead::new(read_half, codec),
            cancel.clone(),
            link.generation,
        )));
        link.cancel = Some(cancel);
        self.dialed.store(dialed, Ordering::Release);
        self.set_state(PeerState::Connected);
    }

    /// Close the current socket, if any. The receive task is signalled, never
    /// awaited: it may be the task running this.
    async fn detach(&self, link: &mut Link) {
        if let Some(cancel) = link.cancel.take() {
            cancel.cancel();
        }
        link.receiver.take();
        // Dropping the write half shuts down our side; the read half goes when
        // the receive task exits.
        self.writer.lock().await.take();
    }

    async fn on_link_lost(self: &Arc<Self>, generation: u64) {
        let mut link = self.link.lock().await;
        if link.generation != generation || !self.state().is_connected() {
            return;
        }
        self.detach(&mut link).await;
        self.settle_after_loss(link).await;
    }

    /// Socket gone: keep a shell while the peer is advertised, otherwise tear down.
    async fn settle_after_loss(self: &Arc<Self>, link: MutexGuard<'_, Link>) {
        if self.is_discovery_published() && !self.ctx.is_shutting_down() {
            self.set_state(PeerState::Shell);
            drop(link);
            self.ctx.refresh_connected(false).await;
        } else {
            self.tear_down_locked(link).await;
        }
    }

    fn set_state(&self, new_state: PeerState) {
        let old = self.state.send_replace(new_state);
        if old != new_state {
            tracing::debug!(peer = %self.identity, from = %old, to = %new_state, "Peer state transition");
        }
    }
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("identity", &self.identity)
            .field("dial_port", &self.dial_port())
            .field("published", &self.is_discovery_published())
            .field("state", &self.state())
            .finish()
    }
}

async fn open_stream(addr: SocketAddr, source: Option<IpAddr>) -> io::Result<TcpStream> {
    let Some(ip) = source else {
        return TcpStream::connect(addr).await;
    };
    let socket = if ip.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.bind(SocketAddr::new(ip, 0))?;
    socket.connect(addr).await
}

async fn receive_loop(
    conn: Arc<PeerConnection>,
    mut frames: FramedRead<OwnedReadHalf, MessageCodec>,
    cancel: CancellationToken,
    generation: u64,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::trace!(peer = %conn.identity, generation, "Receive loop cancelled");
                return;
            }
            next = frames.next() => next,
        };
        match next {
            Some(Ok(message)) => {
                tracing::trace!(peer = %conn.identity, kind = message.kind(), "Received message");
                conn.ctx.sink.on_message_received(conn.identity, message);
            }
            Some(Err(e)) => {
                tracing::debug!(peer = %conn.identity, error = %e, "Receive loop error");
                break;
            }
            None => {
                tracing::debug!(peer = %conn.identity, "Peer closed the stream");
                break;
            }
        }
    }
    drop(frames);
    conn.on_link_lost(generation).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MeshConfig;
    use crate::events::{ChannelSink, MeshEvent};

    fn context() -> (Arc<MeshContext>, tokio::sync::mpsc::UnboundedReceiver<MeshEvent>) {
        let (sink, rx) = ChannelSink::channel();
        (
            Arc::new(MeshContext::new(MeshConfig::default(), Arc::new(sink))),
            rx,
        )
    }

    fn identity() -> PeerIdentity {
        "127.0.0.1".parse().unwrap()
    }

    #[tokio::test]
    async fn send_without_socket_is_not_sent() {
        let (ctx, mut rx) = context();
        let conn = PeerConnection::outbound(identity(), 9, ctx);
        assert!(!conn.send(&Message::from("early")).await);
        assert_eq!(conn.state(), PeerState::Idle);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn inbound_shell_without_port_does_not_dial() {
        let (ctx, _rx) = context();
        let conn = PeerConnection::inbound(identity(), ctx.clone());
        ctx.registry.put(identity(), conn.clone()).await;
        assert_eq!(conn.dial_port(), None);
        assert!(!conn.is_discovery_published());
        assert!(!conn.check_reconnect().await);
        assert_eq!(conn.state(), PeerState::Idle);
    }

    #[tokio::test]
    async fn tear_down_removes_only_itself() {
        let (ctx, _rx) = context();
        let stale = PeerConnection::outbound(identity(), 9, ctx.clone());
        let fresh = PeerConnection::outbound(identity(), 9, ctx.clone());
        ctx.registry.put(identity(), stale.clone()).await;
        ctx.registry.put(identity(), fresh.clone()).await;

        stale.tear_down().await;
        assert!(stale.state().is_torn_down());
        let current = ctx.registry.get(&identity()).await.unwrap();
        assert!(Arc::ptr_eq(&current, &fresh));

        fresh.tear_down().await;
        fresh.tear_down().await;
        assert!(ctx.registry.is_empty().await);
        assert!(!fresh.connect_outbound().await);
    }

    #[tokio::test]
    async fn dial_completing_during_shutdown_is_dropped() {
        let (ctx, mut rx) = context();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let conn = PeerConnection::outbound(identity(), port, ctx.clone());
        ctx.registry.put(identity(), conn.clone()).await;

        ctx.set_shutting_down(true);
        assert!(!conn.connect_outbound().await);
        assert!(conn.state().is_torn_down());
        assert!(!conn.holds_outbound_link());
        assert!(ctx.registry.is_empty().await);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dialed_link_is_reported_as_outbound() {
        let (ctx, _rx) = context();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let inbound = PeerConnection::inbound(identity(), ctx.clone());
        assert!(!inbound.holds_outbound_link());

        let conn = PeerConnection::outbound(identity(), port, ctx.clone());
        ctx.registry.put(identity(), conn.clone()).await;
        assert!(conn.connect_outbound().await);
        let (_stream, _) = listener.accept().await.unwrap();
        assert!(conn.is_connected());
        assert!(conn.holds_outbound_link());
        conn.tear_down().await;
    }

    #[test]
    fn peer_state_checks() {
        assert!(PeerState::Connected.is_connected());
        assert!(!PeerState::Shell.is_connected());
        assert!(!PeerState::Connecting.is_connected());
        assert!(PeerState::TornDown.is_torn_down());
        assert_eq!(PeerState::default(), PeerState::Idle);
        assert_eq!(PeerState::Shell.to_string(), "shell");
    }
}

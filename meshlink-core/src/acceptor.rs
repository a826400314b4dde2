//! Inbound connection acceptor.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::connection::PeerConnection;
use crate::coordinator::MeshContext;
use crate::error::{MeshError, MeshResult};
use crate::identity::PeerIdentity;

/// Owns the listening socket and its accept loop.
pub struct ConnectionAcceptor {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ConnectionAcceptor {
    /// Bind `ctx.config.bind_addr` and start accepting. A bind failure is
    /// returned to the caller, who may retry.
    pub(crate) async fn start(ctx: Arc<MeshContext>) -> MeshResult<Self> {
        let bind_addr = ctx.config.bind_addr;
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|source| MeshError::Bind {
                addr: bind_addr,
                source,
            })?;
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, "Listening for inbound connections");

        let cancel = CancellationToken::new();
        let task = tokio::spawn(accept_loop(listener, ctx, cancel.clone()));
        Ok(Self {
            local_addr,
            cancel,
            task: Some(task),
        })
    }

    /// The port actually bound (never 0).
    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Stop the accept loop and close the listening socket. Safe to call twice.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    tracing::warn!(error = %e, "Accept loop ended abnormally");
                }
            }
        }
    }
}

impl Drop for ConnectionAcceptor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(listener: TcpListener, ctx: Arc<MeshContext>, cancel: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, addr)) => route_inbound(&ctx, stream, addr).await,
            Err(e) if listener_closed(&e) => {
                tracing::warn!(error = %e, "Listening socket closed");
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Error accepting connection");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(ctx.config.accept_error_backoff) => {}
                }
            }
        }
    }
    tracing::info!("Inbound acceptor shutting down");
}

fn listener_closed(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::NotConnected | io::ErrorKind::InvalidInput | io::ErrorKind::BrokenPipe
    )
}

/// Hand an accepted socket to the registry.
///
/// When both sides dial each other, the link dialed by the lower identity
/// survives: the lower side closes the inbound socket and keeps its dial, the
/// higher side adopts the inbound socket and drops its own. Otherwise an
/// existing connected entry wins and a stale entry is replaced.
pub(crate) async fn route_inbound(ctx: &Arc<MeshContext>, stream: TcpStream, remote: SocketAddr) {
    if ctx.is_shutting_down() {
        tracing::debug!(addr = %remote, "Rejecting inbound connection: shutting down");
        return;
    }
    let identity = PeerIdentity::from(remote);
    tracing::debug!(addr = %remote, "Accepted inbound connection");

    let existing = ctx.registry.get(&identity).await;
    if let Some(existing) = &existing {
        if existing.holds_outbound_link() {
            let local = stream.local_addr().map(PeerIdentity::from).ok();
            if local.map_or(true, |local| local <= identity) {
                tracing::debug!(peer = %identity, state = %existing.state(), "Keeping our outbound link, closing inbound socket");
                return;
            }
            tracing::debug!(peer = %identity, state = %existing.state(), "Peer's dial wins, replacing our outbound link");
        } else if existing.is_connected() {
            tracing::debug!(peer = %identity, "Already connected to peer, closing duplicate socket");
            return;
        } else {
            tracing::warn!(peer = %identity, addr = %remote, state = %existing.state(), "Replacing stale connection");
        }
    }

    let conn = PeerConnection::inbound(identity, ctx.clone());
    if let Some(existing) = &existing {
        conn.mark_discovery_published(existing.is_discovery_published());
        if let Some(port) = existing.dial_port() {
            conn.set_dial_port(port);
        }
    }
    let previous = ctx
        .registry
        .put(identity, conn.clone())
        .await
        .filter(|previous| !Arc::ptr_eq(previous, &conn));
    conn.adopt_inbound(stream).await;
    // Only after adoption: the aggregate flag must not dip in between.
    if let Some(previous) = previous {
        previous.tear_down().await;
    }
}

//! Discovery service contract.
//!
//! How peers are found on the network is up to the implementation; the
//! coordinator only registers its listening port and consumes found/lost
//! events.

use std::net::IpAddr;

use tokio::sync::mpsc;

use crate::error::MeshResult;

/// Event reported by a discovery service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// A peer advertising the same service listens on `addr:port`. May repeat.
    Found { addr: IpAddr, port: u16 },
    /// The peer at `addr` stopped advertising.
    Lost { addr: IpAddr },
}

/// External collaborator that advertises this process and locates peers.
pub trait Discovery: Send + Sync + 'static {
    /// Start advertising `service_name` on the local listening `port`.
    fn register_local_service(&self, service_name: &str, port: u16) -> MeshResult<()>;

    /// Stop advertising. Tolerates not being registered.
    fn unregister_local_service(&self);

    /// Begin reporting peers of `service_name` into `events`.
    fn start_discovery(
        &self,
        service_name: &str,
        events: mpsc::UnboundedSender<DiscoveryEvent>,
    ) -> MeshResult<()>;

    /// Stop reporting peers. Tolerates not being started.
    fn stop_discovery(&self);

    /// Whether discovery is currently running.
    fn is_discovering(&self) -> bool;
}

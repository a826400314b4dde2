//! Meshlink peer connection manager.
//! Keeps one TCP connection per discovered LAN peer, accepts inbound ones,
//! reconnects shells and reports messages and aggregate connectivity to an event sink.

pub mod config;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod wire;

pub mod acceptor;
pub mod connection;
pub mod coordinator;
pub mod discovery;
pub mod events;
pub mod registry;

pub use acceptor::ConnectionAcceptor;
pub use config::MeshConfig;
pub use connection::{PeerConnection, PeerState};
pub use coordinator::{Coordinator, PeerSummary};
pub use discovery::{Discovery, DiscoveryEvent};
pub use error::{MeshError, MeshResult};
pub use events::{ChannelSink, EventSink, MeshEvent};
pub use identity::PeerIdentity;
pub use protocol::{Message, PROTOCOL_VERSION};
pub use registry::PeerRegistry;
pub use wire::{FrameDecodeError, FrameEncodeError, MessageCodec};

//! Event sink: where the mesh reports received messages and connectivity.

use tokio::sync::mpsc;

use crate::identity::PeerIdentity;
use crate::protocol::Message;

/// Receiver of mesh notifications. Called from the receive loops and from
/// whichever task caused a state change, so implementations must not block.
pub trait EventSink: Send + Sync + 'static {
    /// A peer delivered one message. Messages from a single peer arrive in order.
    fn on_message_received(&self, from: PeerIdentity, message: Message);

    /// The aggregate "any peer connected" state changed (or a refresh was forced).
    fn on_connected_changed(&self, connected: bool);

    /// Best-effort diagnostics.
    fn on_info(&self, text: &str);
}

/// Owned form of the sink callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    MessageReceived { from: PeerIdentity, message: Message },
    ConnectedChanged(bool),
    Info(String),
}

/// Sink that forwards every notification into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<MeshEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<MeshEvent>) -> Self {
        Self { tx }
    }

    /// Sink plus the receiving end of its channel.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<MeshEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: MeshEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("event receiver dropped");
        }
    }
}

impl EventSink for ChannelSink {
    fn on_message_received(&self, from: PeerIdentity, message: Message) {
        self.forward(MeshEvent::MessageReceived { from, message });
    }

    fn on_connected_changed(&self, connected: bool) {
        self.forward(MeshEvent::ConnectedChanged(connected));
    }

    fn on_info(&self, text: &str) {
        self.forward(MeshEvent::Info(text.to_owned()));
    }
}

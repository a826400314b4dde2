//! Meshlink wire protocol: application message kinds and version.

use serde::{Deserialize, Serialize};

/// Current protocol version. Advertised by discovery so incompatible peers skip each other.
pub const PROTOCOL_VERSION: u8 = 1;

/// One deliverable unit between peers. Encoding is bincode; framing is length-prefix (see wire module).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Plain text line.
    Text(String),
    /// Opaque object, already serialized by the application.
    Object(Vec<u8>),
}

impl Message {
    /// Short name of the message kind, used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Text(_) => "text",
            Message::Object(_) => "object",
        }
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Message::Text(text)
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Message::Text(text.to_owned())
    }
}

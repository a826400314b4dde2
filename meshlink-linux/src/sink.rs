//! Console event sink: prints mesh activity for the operator.

use meshlink_core::{EventSink, Message, PeerIdentity};

pub struct ConsoleSink;

impl EventSink for ConsoleSink {
    fn on_message_received(&self, from: PeerIdentity, message: Message) {
        println!("{}", render_message(from, &message));
    }

    fn on_connected_changed(&self, connected: bool) {
        if connected {
            println!("* mesh connected");
        } else {
            println!("* mesh disconnected");
        }
    }

    fn on_info(&self, text: &str) {
        tracing::debug!("{text}");
    }
}

fn render_message(from: PeerIdentity, message: &Message) -> String {
    match message {
        Message::Text(text) => format!("{from}: {text}"),
        Message::Object(bytes) => format!("{from}: <object, {} bytes>", bytes.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_text_and_objects() {
        let from: PeerIdentity = "10.0.0.2".parse().unwrap();
        assert_eq!(render_message(from, &Message::from("hi")), "10.0.0.2: hi");
        assert_eq!(
            render_message(from, &Message::Object(vec![0; 3])),
            "10.0.0.2: <object, 3 bytes>"
        );
    }
}

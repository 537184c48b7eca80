//! Echo server demo: accepts authenticated clients and echoes every chat
//! packet back to its sender.
//!
//! Run with `cargo run --example echo_server`, then start one or more
//! `chat_client` instances against it.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use sealink::{registry, Message, Packet, SecureServer, ServerHandler, Session};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PacketChatMessage {
    sender: String,
    body: String,
}

impl Packet for PacketChatMessage {
    const TYPE: &'static str = "PacketChatMessage";
}

struct EchoHandler;

impl ServerHandler for EchoHandler {
    fn on_authenticated(&self, session: &Arc<Session>) {
        info!(session = %session.session_id(), "client authenticated");
    }

    fn on_identified(&self, session: &Arc<Session>, identifier: &str) {
        info!(session = %session.session_id(), identifier, "client identified");
    }

    fn on_packet(&self, session: &Arc<Session>, message: Message) {
        let Message::App(app) = message else { return };
        let Ok(chat) = app.parse::<PacketChatMessage>() else {
            return;
        };
        info!(sender = %chat.sender, body = %chat.body, "echoing chat");
        if let Err(e) = session.send(&chat) {
            info!(error = %e, "echo failed");
        }
    }

    fn on_disconnect(&self, session: &Arc<Session>) {
        info!(session = %session.session_id(), "client disconnected");
    }
}

#[tokio::main]
async fn main() -> sealink::Result<()> {
    tracing_subscriber::fmt::init();
    registry::register::<PacketChatMessage>();

    let server = Arc::new(SecureServer::new("topsecret", Arc::new(EchoHandler)));
    let addr = server.bind("127.0.0.1:8080").await?;
    info!(%addr, "echo server running");

    std::future::pending::<()>().await;
    Ok(())
}

//! Chat client demo: connects to the echo server, identifies itself, and
//! sends a chat packet every few seconds.
//!
//! Run with `cargo run --example chat_client` while `echo_server` is up.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use sealink::{registry, ClientConfig, ClientHandler, Message, Packet, SecureClient};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PacketChatMessage {
    sender: String,
    body: String,
}

impl Packet for PacketChatMessage {
    const TYPE: &'static str = "PacketChatMessage";
}

struct ChatHandler;

impl ClientHandler for ChatHandler {
    fn on_authenticated(&self) {
        info!("authenticated, chat is live");
    }

    fn on_packet(&self, message: Message) {
        let Message::App(app) = message else { return };
        if let Ok(chat) = app.parse::<PacketChatMessage>() {
            info!(sender = %chat.sender, body = %chat.body, "received chat");
        }
    }

    fn on_disconnect(&self) {
        info!("disconnected");
    }
}

#[tokio::main]
async fn main() -> sealink::Result<()> {
    tracing_subscriber::fmt::init();
    registry::register::<PacketChatMessage>();

    let config = ClientConfig::default()
        .with_auto_reconnect(true)
        .with_client_identifier("demo")
        .with_ping_interval(Duration::from_secs(10));
    let client = SecureClient::with_config("topsecret", Arc::new(ChatHandler), config);
    client.connect("ws://127.0.0.1:8080").await?;

    let mut counter = 0u32;
    loop {
        tokio::time::sleep(Duration::from_secs(3)).await;
        if !client.is_authenticated() {
            continue;
        }
        counter += 1;
        let chat = PacketChatMessage {
            sender: "demo".into(),
            body: format!("hello #{counter}"),
        };
        if let Err(e) = client.send(&chat) {
            info!(error = %e, "send failed");
        }
        if let Some(latency) = client.latency().average_latency() {
            info!(?latency, "average round-trip");
        }
    }
}

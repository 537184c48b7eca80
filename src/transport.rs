//! Transport abstraction over the raw WebSocket connection.
//!
//! The core only ever asks a transport to send a text frame or to close
//! with an application close code and reason; everything else about the
//! socket (upgrade, frame assembly, ping/pong control frames) stays inside
//! the adapter. Inbound events — text frames and the close — are delivered
//! through a channel, one event at a time, which serializes receives per
//! session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

use crate::types::{Result, SealinkError};

/// The send half of a connection as seen by the core.
pub trait Transport: Send + Sync {
    /// Queue a text frame for delivery. Fails once the connection closed.
    fn send_text(&self, text: String) -> Result<()>;

    /// Close the connection with an application close code and reason.
    fn close(&self, code: u16, reason: &str);

    /// Whether the connection is still open.
    fn is_open(&self) -> bool;
}

/// Inbound transport events, delivered in receive order.
#[derive(Debug)]
pub enum TransportEvent {
    /// A complete text frame.
    Text(String),
    /// The connection closed, with the peer's close code and reason when
    /// one was supplied.
    Closed { code: u16, reason: String },
}

enum Outbound {
    Text(String),
    Close(u16, String),
}

/// [`Transport`] over a tokio-tungstenite WebSocket stream.
///
/// Sends go through an unbounded channel drained by a writer task, so any
/// thread may send without awaiting; reads are pumped into the returned
/// event channel by a reader task.
pub struct WsTransport {
    outbound: UnboundedSender<Outbound>,
    open: AtomicBool,
}

impl WsTransport {
    /// Splits a WebSocket stream into a transport handle and an inbound
    /// event channel, spawning the reader and writer tasks.
    pub fn spawn<S>(stream: WebSocketStream<S>) -> (Arc<Self>, UnboundedReceiver<TransportEvent>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let transport = Arc::new(Self {
            outbound: outbound_tx,
            open: AtomicBool::new(true),
        });

        let (mut sink, mut source) = stream.split();

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                match frame {
                    Outbound::Text(text) => {
                        if sink.send(WsMessage::Text(text)).await.is_err() {
                            return;
                        }
                    }
                    Outbound::Close(code, reason) => {
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        };
                        if let Err(e) = sink.send(WsMessage::Close(Some(frame))).await {
                            debug!(error = %e, "websocket close failed");
                        }
                        return;
                    }
                }
            }
        });

        let pump = Arc::clone(&transport);
        tokio::spawn(async move {
            let mut closed = (1006, String::new());
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => {
                        if event_tx.send(TransportEvent::Text(text)).is_err() {
                            break;
                        }
                    }
                    Ok(WsMessage::Close(frame)) => {
                        if let Some(frame) = frame {
                            closed = (frame.code.into(), frame.reason.to_string());
                        }
                        break;
                    }
                    // Binary, ping and pong control frames are not part of
                    // the protocol; tungstenite answers pings itself.
                    Ok(_) => {}
                    Err(e) => {
                        debug!(error = %e, "websocket read failed");
                        break;
                    }
                }
            }
            pump.open.store(false, Ordering::SeqCst);
            let (code, reason) = closed;
            let _ = event_tx.send(TransportEvent::Closed { code, reason });
        });

        (transport, event_rx)
    }
}

impl Transport for WsTransport {
    fn send_text(&self, text: String) -> Result<()> {
        if !self.is_open() {
            return Err(SealinkError::Transport("connection is closed".into()));
        }
        self.outbound
            .send(Outbound::Text(text))
            .map_err(|_| SealinkError::Transport("connection is closed".into()))
    }

    fn close(&self, code: u16, reason: &str) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self
                .outbound
                .send(Outbound::Close(code, reason.to_string()));
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

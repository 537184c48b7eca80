//! Event hooks implemented by the embedding application.

use std::sync::Arc;

use crate::client::SecureClient;
use crate::packet::{Message, PacketVersion};
use crate::session::Session;

/// Server-side application hooks.
///
/// Called from the session's receive task; implementations should hand
/// heavy work off rather than block the task. Errors inside a hook are
/// the application's to handle — the session is not torn down for them.
pub trait ServerHandler: Send + Sync + 'static {
    /// A client completed the challenge/response handshake.
    fn on_authenticated(&self, session: &Arc<Session>);

    /// An authenticated client registered an identifier.
    fn on_identified(&self, _session: &Arc<Session>, _identifier: &str) {}

    /// An authenticated client sent an application message.
    fn on_packet(&self, session: &Arc<Session>, message: Message);

    /// An authenticated client disconnected.
    fn on_disconnect(&self, session: &Arc<Session>);

    /// The client reported its version. Advisory only.
    fn on_version_exchange(&self, _session: &Arc<Session>, _version: &PacketVersion) {}
}

/// Client-side application hooks.
pub trait ClientHandler: Send + Sync + 'static {
    /// The transport connected; the handshake is about to run.
    fn on_connect(&self) {}

    /// The handshake completed and encrypted traffic may flow.
    fn on_authenticated(&self) {}

    /// An application message arrived.
    fn on_packet(&self, message: Message);

    /// The connection closed.
    fn on_disconnect(&self);

    /// The server reported its version. Advisory only.
    fn on_version_exchange(&self, _version: &PacketVersion) {}

    /// Every reconnect attempt was exhausted. Fired at most once per
    /// outage.
    fn on_reconnect_failed(&self, _client: &SecureClient) {}
}

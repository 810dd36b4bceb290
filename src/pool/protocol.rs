//! Seam to the messaging protocol client.
//!
//! The pool never speaks the wire protocol. A [`SocketFactory`] turns an auth
//! state into a live [`ProtocolSocket`] plus a channel of [`SocketEvent`]s,
//! and the pool reacts to those events.

use crate::error::Result;
use crate::pool::collaborators::ProxyAgent;
use crate::session::{AuthState, SessionKey};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Status code the protocol reports when the device was unlinked.
pub const LOGGED_OUT_STATUS: u16 = 401;

/// Options handed to the socket factory for one connection.
#[derive(Debug, Clone)]
pub struct SocketOptions {
    pub key: SessionKey,
    pub browser_name: String,
    pub proxy: Option<ProxyAgent>,
    pub is_recovery: bool,
}

/// Outbound message payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessageContent {
    Text {
        text: String,
    },
    Image {
        url: String,
        caption: Option<String>,
    },
    Document {
        url: String,
        file_name: String,
        mimetype: Option<String>,
    },
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        MessageContent::Text { text: text.into() }
    }
}

/// Message delivered by the protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub id: String,
    pub from: String,
    pub timestamp: i64,
    pub content: Value,
}

/// Transport state reported by the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    Connecting,
    Open,
    Close,
}

/// Why the transport closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectReason {
    pub status_code: Option<u16>,
    pub message: String,
}

impl DisconnectReason {
    /// True when the session was signed out and its credentials are dead.
    pub fn is_logged_out(&self) -> bool {
        self.status_code == Some(LOGGED_OUT_STATUS)
    }
}

/// Events emitted by a live socket.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    /// Partial credentials update to persist.
    CredsUpdate(Value),
    ConnectionUpdate {
        connection: Option<TransportState>,
        qr: Option<String>,
        last_disconnect: Option<DisconnectReason>,
    },
    MessagesUpsert(Vec<InboundMessage>),
}

/// Live protocol socket.
pub trait ProtocolSocket: Send + Sync {
    /// Send a message; resolves to the protocol message id.
    fn send_message(&self, to: String, content: MessageContent) -> BoxFuture<'_, Result<String>>;

    /// Sign the session out on the server side.
    fn logout(&self) -> BoxFuture<'_, Result<()>>;

    /// Close the transport without signing out.
    fn close(&self) -> BoxFuture<'_, Result<()>>;
}

/// A new socket and its event stream.
pub struct SocketHandle {
    pub socket: Arc<dyn ProtocolSocket>,
    pub events: mpsc::Receiver<SocketEvent>,
}

/// Builds protocol sockets.
pub trait SocketFactory: Send + Sync {
    /// Create a socket for the session. Errors mean a programming or
    /// configuration defect and are surfaced to the caller as-is.
    fn create_socket(
        &self,
        auth: Arc<AuthState>,
        options: SocketOptions,
    ) -> BoxFuture<'_, Result<SocketHandle>>;
}

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[cfg(feature = "mux-transport")]
pub mod mux;
pub mod plain_socket;

#[cfg(feature = "mux-transport")]
pub use mux::MuxTransport;
pub use plain_socket::PlainSocketTransport;

/// Maximum accepted frame length; anything larger is a codec error.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Errors surfaced by the transport layer.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The target node has no live connection; the send fails instead of
    /// blocking indefinitely.
    #[error("node {0} is not reachable")]
    Unreachable(String),

    /// A bounded send/receive wait elapsed.
    #[error("transport operation timed out after {0:?}")]
    Timeout(Duration),

    /// The preferred backend could not be selected; recovery is local (fall
    /// back to the plain socket backend), never fatal.
    #[error("preferred transport backend unavailable")]
    BackendUnavailable,

    #[error("message codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The transport was closed or never initialized for this operation.
    #[error("transport is not connected")]
    NotConnected,
}

/// RPC message kinds exchanged between master and workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// A worker announcing itself to the master.
    NodeReady,
    /// A periodic statistics snapshot from a worker.
    Report,
    /// An exception captured on a worker.
    Exception,
    /// Worker liveness signal.
    Heartbeat,
    /// Master-to-worker control message.
    Command,
    /// A worker announcing a clean shutdown.
    NodeQuit,
}

/// Tagged wire envelope: a kind, the sending node, and an opaque payload
/// understood by the handler for that kind.
///
/// Both transport backends carry this envelope without alteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub kind: MessageKind,
    pub node_id: String,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(kind: MessageKind, node_id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            kind,
            node_id: node_id.into(),
            payload,
        }
    }

    /// Envelope with a bincode-encoded payload struct.
    pub fn with_payload<T: Serialize>(
        kind: MessageKind,
        node_id: impl Into<String>,
        payload: &T,
    ) -> Result<Self, TransportError> {
        Ok(Self::new(kind, node_id, bincode::serialize(payload)?))
    }

    /// Decode the opaque payload into the struct for this message kind.
    pub fn decode_payload<'a, T: Deserialize<'a>>(&'a self) -> Result<T, TransportError> {
        Ok(bincode::deserialize(&self.payload)?)
    }

    /// Serialize the envelope to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, TransportError> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize an envelope from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TransportError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Payload of a [`MessageKind::Report`] envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportPayload {
    pub snapshot: crate::registry::NodeSnapshot,
}

/// Payload of a [`MessageKind::Exception`] envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExceptionPayload {
    pub msg: String,
    pub traceback: String,
}

/// Payload of a [`MessageKind::Heartbeat`] envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub state: crate::runner::RunState,
    pub user_count: u64,
}

/// Payload of a [`MessageKind::Command`] envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandPayload {
    pub command: String,
    pub data: Vec<u8>,
}

/// Transport configuration shared by both backends.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub host: String,
    pub port: u16,
    pub buffer_size: usize,
    /// Bound on a single send; elapsing yields [`TransportError::Timeout`].
    pub send_timeout: Duration,
    /// Optional bound on a receive; `None` waits indefinitely.
    pub recv_timeout: Option<Duration>,
    /// Depth of the inbound message queue on the master side.
    pub inbox_depth: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5557,
            buffer_size: 8192,
            send_timeout: Duration::from_secs(5),
            recv_timeout: None,
            inbox_depth: 1000,
        }
    }
}

/// The send/receive contract both backends satisfy.
///
/// Master processes `bind`, workers `connect`. Both sides then exchange
/// [`Message`] envelopes; ordering is preserved per sender and messages are
/// never silently dropped.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Initialize the master side: listen for worker connections.
    async fn bind(&mut self, config: &TransportConfig) -> Result<(), TransportError>;

    /// Initialize the worker side: connect to the master.
    async fn connect(&mut self, config: &TransportConfig) -> Result<(), TransportError>;

    /// Send a message to a node. On a worker the target is the master and
    /// the id is ignored; on the master an unknown target fails with
    /// [`TransportError::Unreachable`].
    async fn send(&mut self, target: &str, message: &Message) -> Result<(), TransportError>;

    /// Receive the next inbound message, in per-sender order.
    async fn receive(&mut self) -> Result<Message, TransportError>;

    /// Drop a node's connection and abandon its in-flight operations.
    async fn disconnect(&mut self, node_id: &str) -> Result<(), TransportError>;

    /// Close the transport.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Backend name for identification.
    fn name(&self) -> &'static str;

    /// Bound address after `bind` (useful when binding port 0).
    fn local_addr(&self) -> Option<SocketAddr>;
}

/// Connection lifecycle state, shared by both backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Uninitialized,
    Connected,
    Disconnected,
}

/// Which backend the selector chose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Asynchronous multiplexing backend (preferred).
    Mux,
    /// Plain blocking-socket fallback.
    PlainSocket,
}

/// Select the transport backend once, at process start.
///
/// Prefers the multiplexing backend; when it is not compiled in the plain
/// socket backend is selected instead and a warning about the performance
/// impact in distributed mode is emitted. The choice is fixed for the process
/// lifetime.
pub fn select_transport() -> (Box<dyn Transport>, BackendKind) {
    select_with(cfg!(feature = "mux-transport"))
}

/// Selection with an explicit availability probe; the testable seam behind
/// [`select_transport`].
pub fn select_with(mux_available: bool) -> (Box<dyn Transport>, BackendKind) {
    #[cfg(feature = "mux-transport")]
    if mux_available {
        debug!("Selected multiplexing transport backend");
        return (Box::new(MuxTransport::new()), BackendKind::Mux);
    }
    #[cfg(not(feature = "mux-transport"))]
    let _ = mux_available;

    warn!(
        "Using the plain socket RPC backend instead of the multiplexing backend. \
         If running in distributed mode, this could cause a performance decrease. \
         We recommend enabling the mux-transport feature when running in distributed mode."
    );
    (
        Box::new(PlainSocketTransport::new()),
        BackendKind::PlainSocket,
    )
}

/// Generate a wire-unique id for a worker node.
pub fn generate_node_id() -> String {
    format!("worker-{}", uuid::Uuid::new_v4())
}

//! Inbound events delivered by the frame/codec layer

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::connection::StreamId;
use crate::error::PoolError;
use crate::protocol::Protocol;

/// Classification of a stream-level failure reported by the codec
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamErrorKind {
    /// Transport I/O failure while serving the stream
    Io,
    /// Request-level timeout on the stream
    Timeout,
    /// No bytes read within the read timeout
    ReadTimeout,
    /// Write did not complete within the write timeout
    WriteTimeout,
}

impl StreamErrorKind {
    /// Isolated idle timeouts are probed before the connection is blamed
    pub fn is_isolated_timeout(&self) -> bool {
        matches!(self, StreamErrorKind::ReadTimeout | StreamErrorKind::WriteTimeout)
    }
}

/// Event flowing from the transport into a parent connection's pipeline
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// TLS handshake picked a protocol through ALPN
    AlpnNegotiated(Protocol),
    /// Peer SETTINGS frame
    Settings {
        max_concurrent_streams: Option<u32>,
    },
    /// Peer GOAWAY frame
    GoAway {
        last_stream_id: StreamId,
        error_code: u32,
        debug_data: Bytes,
    },
    /// Peer-initiated PING (the codec answers it)
    Ping { payload: u64 },
    /// Acknowledgment of one of our PINGs
    PingAck { payload: u64 },
    /// Response status observed on a stream
    ServerError { stream_id: StreamId, status: u16 },
    /// Stream-level failure
    StreamError {
        stream_id: StreamId,
        kind: StreamErrorKind,
        message: String,
    },
    /// Connection-level failure raised by the codec or by a stage
    Exception(PoolError),
    /// The transport is gone
    Inactive,
}

impl ConnectionEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ConnectionEvent::AlpnNegotiated(_) => "alpn",
            ConnectionEvent::Settings { .. } => "settings",
            ConnectionEvent::GoAway { .. } => "goaway",
            ConnectionEvent::Ping { .. } => "ping",
            ConnectionEvent::PingAck { .. } => "ping-ack",
            ConnectionEvent::ServerError { .. } => "server-error",
            ConnectionEvent::StreamError { .. } => "stream-error",
            ConnectionEvent::Exception(_) => "exception",
            ConnectionEvent::Inactive => "inactive",
        }
    }
}

/// Handle the codec uses to push events into a parent connection
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<ConnectionEvent>,
}

impl EventSender {
    pub(crate) fn new(tx: mpsc::UnboundedSender<ConnectionEvent>) -> Self {
        Self { tx }
    }

    /// Queue an event. Returns false once the connection has been dropped.
    pub fn send(&self, event: ConnectionEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

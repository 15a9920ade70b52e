//! In-memory transport
//!
//! [`LoopbackConnector`] hands out [`LoopbackTransport`]s that play a scripted
//! peer: they announce a protocol on attach, acknowledge PINGs, and number
//! client streams like an HTTP/2 codec would. Tests and the simulator use the
//! helper methods to inject GOAWAY frames, server errors and disconnects.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::trace;

use crate::connection::{ChildStream, Connector, StreamId, Transport};
use crate::error::{PoolError, Result};
use crate::event::{ConnectionEvent, EventSender, StreamErrorKind};
use crate::protocol::Protocol;

/// Behaviour of the simulated peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerScript {
    /// Protocol reported by the TLS layer on attach
    pub alpn: Option<Protocol>,
    /// SETTINGS_MAX_CONCURRENT_STREAMS advertised by the peer
    pub max_concurrent_streams: Option<u32>,
    /// Whether a SETTINGS frame is sent on attach
    pub send_settings: bool,
    pub ack_pings: bool,
    pub fail_stream_opens: bool,
    pub fail_pings: bool,
}

impl PeerScript {
    pub fn http2(max_concurrent_streams: Option<u32>) -> Self {
        Self {
            alpn: Some(Protocol::Http2),
            max_concurrent_streams,
            send_settings: true,
            ack_pings: true,
            fail_stream_opens: false,
            fail_pings: false,
        }
    }

    pub fn http1() -> Self {
        Self {
            alpn: Some(Protocol::Http1),
            send_settings: false,
            ..Self::http2(None)
        }
    }

    /// A peer that never completes negotiation
    pub fn silent() -> Self {
        Self {
            alpn: None,
            send_settings: false,
            ..Self::http2(None)
        }
    }
}

/// Stream handed out by a [`LoopbackTransport`]
#[derive(Debug)]
pub struct LoopbackStream {
    id: StreamId,
    closed: AtomicBool,
    reset_code: Mutex<Option<u32>>,
}

impl LoopbackStream {
    fn new(id: StreamId) -> Self {
        Self {
            id,
            closed: AtomicBool::new(false),
            reset_code: Mutex::new(None),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Error code of the RST_STREAM sent for this stream, if any
    pub fn reset_code(&self) -> Option<u32> {
        *self.reset_code.lock()
    }
}

impl ChildStream for LoopbackStream {
    fn id(&self) -> StreamId {
        self.id
    }

    fn reset(&self, error_code: u32) {
        self.reset_code.lock().get_or_insert(error_code);
        self.closed.store(true, Ordering::Release);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[derive(Debug)]
pub struct LoopbackTransport {
    script: Mutex<PeerScript>,
    events: Mutex<Option<EventSender>>,
    active: AtomicBool,
    next_stream_id: AtomicU32,
    streams: Mutex<Vec<Arc<LoopbackStream>>>,
    pings_sent: AtomicUsize,
}

impl LoopbackTransport {
    pub fn new(script: PeerScript) -> Self {
        Self {
            script: Mutex::new(script),
            events: Mutex::new(None),
            active: AtomicBool::new(true),
            next_stream_id: AtomicU32::new(1),
            streams: Mutex::new(Vec::new()),
            pings_sent: AtomicUsize::new(0),
        }
    }

    /// Push an event into the attached connection
    pub fn emit(&self, event: ConnectionEvent) -> bool {
        match self.events.lock().as_ref() {
            Some(events) => events.send(event),
            None => false,
        }
    }

    pub fn go_away(&self, last_stream_id: u32, error_code: u32, debug_data: &'static [u8]) {
        self.emit(ConnectionEvent::GoAway {
            last_stream_id: StreamId::new(last_stream_id),
            error_code,
            debug_data: Bytes::from_static(debug_data),
        });
    }

    pub fn server_error(&self, stream_id: StreamId, status: u16) {
        self.emit(ConnectionEvent::ServerError { stream_id, status });
    }

    pub fn stream_error(&self, stream_id: StreamId, kind: StreamErrorKind, message: &str) {
        self.emit(ConnectionEvent::StreamError {
            stream_id,
            kind,
            message: message.to_string(),
        });
    }

    /// Simulate the peer dropping the connection
    pub fn drop_connection(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            self.emit(ConnectionEvent::Inactive);
        }
    }

    pub fn set_ack_pings(&self, ack: bool) {
        self.script.lock().ack_pings = ack;
    }

    pub fn set_fail_stream_opens(&self, fail: bool) {
        self.script.lock().fail_stream_opens = fail;
    }

    pub fn streams(&self) -> Vec<Arc<LoopbackStream>> {
        self.streams.lock().clone()
    }

    pub fn stream(&self, id: u32) -> Option<Arc<LoopbackStream>> {
        self.streams
            .lock()
            .iter()
            .find(|stream| stream.id == StreamId::new(id))
            .cloned()
    }

    pub fn pings_sent(&self) -> usize {
        self.pings_sent.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn attach(&self, events: EventSender) {
        let script = self.script.lock().clone();
        if let Some(protocol) = script.alpn {
            events.send(ConnectionEvent::AlpnNegotiated(protocol));
        }
        if script.send_settings {
            events.send(ConnectionEvent::Settings {
                max_concurrent_streams: script.max_concurrent_streams,
            });
        }
        *self.events.lock() = Some(events);
    }

    async fn open_stream(&self) -> Result<Arc<dyn ChildStream>> {
        if !self.is_active() {
            return Err(PoolError::io("Connection is closed"));
        }
        if self.script.lock().fail_stream_opens {
            return Err(PoolError::io("Peer refused the stream"));
        }

        let id = StreamId::new(self.next_stream_id.fetch_add(2, Ordering::AcqRel));
        let stream = Arc::new(LoopbackStream::new(id));
        self.streams.lock().push(stream.clone());
        trace!("Loopback opened stream {}", id);
        Ok(stream)
    }

    async fn send_ping(&self, payload: u64) -> Result<()> {
        let ack = {
            let script = self.script.lock();
            if script.fail_pings || !self.is_active() {
                return Err(PoolError::io("Failed to write PING frame"));
            }
            script.ack_pings
        };

        self.pings_sent.fetch_add(1, Ordering::AcqRel);
        if ack {
            self.emit(ConnectionEvent::PingAck { payload });
        }
        Ok(())
    }

    fn close(&self) {
        self.active.store(false, Ordering::Release);
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

/// Connector producing scripted loopback transports
#[derive(Debug)]
pub struct LoopbackConnector {
    script: Mutex<PeerScript>,
    connections: Mutex<Vec<Arc<LoopbackTransport>>>,
    fail_connects: AtomicBool,
}

impl LoopbackConnector {
    pub fn new(script: PeerScript) -> Self {
        Self {
            script: Mutex::new(script),
            connections: Mutex::new(Vec::new()),
            fail_connects: AtomicBool::new(false),
        }
    }

    /// Script used for connections made from now on
    pub fn set_script(&self, script: PeerScript) {
        *self.script.lock() = script;
    }

    pub fn set_fail_connects(&self, fail: bool) {
        self.fail_connects.store(fail, Ordering::Release);
    }

    pub fn connections(&self) -> Vec<Arc<LoopbackTransport>> {
        self.connections.lock().clone()
    }

    /// The `index`-th transport created by this connector.
    ///
    /// Panics if fewer than `index + 1` connections were made.
    pub fn connection(&self, index: usize) -> Arc<LoopbackTransport> {
        self.connections.lock()[index].clone()
    }

    pub fn connect_count(&self) -> usize {
        self.connections.lock().len()
    }
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self) -> Result<Arc<dyn Transport>> {
        if self.fail_connects.load(Ordering::Acquire) {
            return Err(PoolError::io("Connection refused"));
        }

        let transport = Arc::new(LoopbackTransport::new(self.script.lock().clone()));
        self.connections.lock().push(transport.clone());
        Ok(transport)
    }
}

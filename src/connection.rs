//! Parent connection management
//!
//! A [`ParentConnection`] wraps one physical transport link handed out by the
//! codec layer. Inbound events are queued onto a per-connection task and run
//! through the connection's [`EventPipeline`] in arrival order.

use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::{PoolError, Result};
use crate::event::{ConnectionEvent, EventSender};
use crate::pipeline::EventPipeline;
use crate::protocol::ProtocolSignal;

/// Parent connection identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0.as_bytes()[..4]))
    }
}

/// HTTP/2 stream identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId(u32);

impl StreamId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// HTTP/2 CANCEL error code, used when a stream is reset locally
pub const CANCEL: u32 = 0x8;

/// One logical exchange opened by the codec on a parent connection
pub trait ChildStream: Send + Sync + fmt::Debug {
    fn id(&self) -> StreamId;

    /// Abort the stream with an RST_STREAM carrying `error_code`
    fn reset(&self, error_code: u32);

    /// Close the stream, resetting it if the exchange has not finished
    fn close(&self);
}

/// Codec-facing side of a physical connection
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Give the codec the sender it uses for inbound events
    fn attach(&self, events: EventSender);

    async fn open_stream(&self) -> Result<Arc<dyn ChildStream>>;

    async fn send_ping(&self, payload: u64) -> Result<()>;

    fn close(&self);

    fn is_active(&self) -> bool;
}

/// Establishes new physical connections (TCP + TLS + codec)
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Transport>>;
}

/// A physical connection together with its event pipeline and protocol signal
pub struct ParentConnection {
    id: ConnectionId,
    transport: Arc<dyn Transport>,
    protocol: ProtocolSignal,
    pipeline: EventPipeline,
    events: EventSender,
    closed: AtomicBool,
    leased: AtomicBool,
    created_at: Instant,
}

impl ParentConnection {
    /// Wrap `transport`, start its event task and hand the codec its sender
    pub fn open(transport: Arc<dyn Transport>, pipeline: EventPipeline) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let events = EventSender::new(tx);

        let connection = Arc::new(Self {
            id: ConnectionId::new(),
            transport,
            protocol: ProtocolSignal::new(),
            pipeline,
            events: events.clone(),
            closed: AtomicBool::new(false),
            leased: AtomicBool::new(false),
            created_at: Instant::now(),
        });

        tokio::spawn(run_events(Arc::downgrade(&connection), rx));
        connection.transport.attach(events);

        debug!(
            "Opened connection {} with stages {:?}",
            connection.id,
            connection.pipeline.stage_names()
        );
        connection
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn protocol(&self) -> &ProtocolSignal {
        &self.protocol
    }

    pub fn pipeline(&self) -> &EventPipeline {
        &self.pipeline
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn is_active(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && self.transport.is_active()
    }

    /// Queue an inbound event for the pipeline
    pub fn deliver(&self, event: ConnectionEvent) {
        if !self.events.send(event) {
            trace!("Event task for connection {} has stopped", self.id);
        }
    }

    /// Raise a connection-level failure through the pipeline
    pub fn fire_exception(&self, cause: PoolError) {
        self.deliver(ConnectionEvent::Exception(cause));
    }

    /// Close the transport. Idempotent; the pipeline sees one `Inactive`.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("Closing connection {}", self.id);
        self.transport.close();
        self.deliver(ConnectionEvent::Inactive);
    }

    /// Mark the connection as handed out by the raw pool
    pub(crate) fn begin_lease(&self) {
        self.leased.store(true, Ordering::Release);
    }

    /// End the current lease. Returns false if it was already released.
    pub(crate) fn end_lease(&self) -> bool {
        self.leased.swap(false, Ordering::AcqRel)
    }
}

impl fmt::Debug for ParentConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParentConnection")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .field("protocol", &self.protocol.peek())
            .finish()
    }
}

impl fmt::Display for ParentConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.id)
    }
}

async fn run_events(connection: Weak<ParentConnection>, mut rx: mpsc::UnboundedReceiver<ConnectionEvent>) {
    let mut inactive = false;
    while let Some(event) = rx.recv().await {
        let Some(connection) = connection.upgrade() else {
            break;
        };
        if matches!(event, ConnectionEvent::Inactive) {
            if inactive {
                continue;
            }
            inactive = true;
            connection.closed.store(true, Ordering::Release);
        }
        connection.pipeline.dispatch(&connection, event);
    }
}

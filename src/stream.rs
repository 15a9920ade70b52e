//! Streams handed out by the multiplexed pool

use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

use crate::connection::{ChildStream, ConnectionId, ParentConnection, StreamId};
use crate::error::PoolError;
use crate::record::ConnectionRecord;

/// A stream together with the cause that forced it closed, if any
pub(crate) struct OpenedStream {
    pub child: Arc<dyn ChildStream>,
    pub failure: watch::Receiver<Option<PoolError>>,
}

/// One logical exchange multiplexed on a parent connection.
///
/// The stream must be handed back through the pool's `release` whether it
/// completed normally or was failed by the pool.
pub struct MultiplexedStream {
    record: ConnectionRecord,
    child: Arc<dyn ChildStream>,
    failure: watch::Receiver<Option<PoolError>>,
}

impl MultiplexedStream {
    pub(crate) fn new(record: ConnectionRecord, opened: OpenedStream) -> Self {
        Self {
            record,
            child: opened.child,
            failure: opened.failure,
        }
    }

    pub fn id(&self) -> StreamId {
        self.child.id()
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.record.connection().id()
    }

    pub fn parent(&self) -> &Arc<ParentConnection> {
        self.record.connection()
    }

    /// Codec handle used to exchange frames on this stream
    pub fn child(&self) -> &Arc<dyn ChildStream> {
        &self.child
    }

    pub(crate) fn record(&self) -> &ConnectionRecord {
        &self.record
    }

    /// Cause delivered by GOAWAY, health checks or teardown
    pub fn failure(&self) -> Option<PoolError> {
        self.failure.borrow().clone()
    }

    pub fn is_failed(&self) -> bool {
        self.failure.borrow().is_some()
    }

    /// Wait until the pool forces this stream closed
    pub async fn closed(&mut self) -> PoolError {
        match self.failure.wait_for(Option::is_some).await {
            Ok(cause) => cause.clone().unwrap_or(PoolError::StreamClosed),
            Err(_) => PoolError::StreamClosed,
        }
    }
}

impl fmt::Debug for MultiplexedStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiplexedStream")
            .field("connection", &self.connection_id())
            .field("stream", &self.id())
            .field("failed", &self.is_failed())
            .finish()
    }
}

impl fmt::Display for MultiplexedStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}/stream-{}", self.connection_id(), self.id())
    }
}

//! Channel pools
//!
//! A channel is either a whole parent connection (HTTP/1.1) or one stream
//! multiplexed on a parent connection (HTTP/2). Every pool in this module
//! implements [`ChannelPool`]; callers acquire a channel, use it, and hand it
//! back through `release` whether or not the exchange succeeded.

pub mod fixed;
pub mod legacy;
pub mod multiplexed;
pub mod negotiating;
pub mod raw;

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use crate::connection::{ConnectionId, ParentConnection, StreamId};
use crate::error::Result;
use crate::metrics::MetricCollector;
use crate::stream::MultiplexedStream;

pub use fixed::FixedChannelPool;
pub use legacy::ConnectionChannelPool;
pub use multiplexed::MultiplexedConnectionPool;
pub use negotiating::ProtocolNegotiatingPool;
pub use raw::{ConnectionPool, RawConnectionPool, RawPoolStats};

/// Something a caller can run one exchange on
#[derive(Debug)]
pub enum Channel {
    /// A dedicated parent connection
    Connection(Arc<ParentConnection>),
    /// A stream on a shared parent connection
    Stream(MultiplexedStream),
}

impl Channel {
    pub fn key(&self) -> ChannelKey {
        match self {
            Channel::Connection(connection) => ChannelKey::Connection(connection.id()),
            Channel::Stream(stream) => ChannelKey::Stream(stream.connection_id(), stream.id()),
        }
    }

    /// The physical connection carrying this channel
    pub fn parent(&self) -> &Arc<ParentConnection> {
        match self {
            Channel::Connection(connection) => connection,
            Channel::Stream(stream) => stream.parent(),
        }
    }

    pub fn as_stream(&self) -> Option<&MultiplexedStream> {
        match self {
            Channel::Stream(stream) => Some(stream),
            Channel::Connection(_) => None,
        }
    }

    pub fn into_stream(self) -> Option<MultiplexedStream> {
        match self {
            Channel::Stream(stream) => Some(stream),
            Channel::Connection(_) => None,
        }
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, Channel::Stream(_))
    }

    /// Force the channel closed without returning it to a pool
    pub fn close(&self) {
        match self {
            Channel::Connection(connection) => connection.close(),
            Channel::Stream(stream) => stream.child().close(),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Connection(connection) => write!(f, "{}", connection),
            Channel::Stream(stream) => write!(f, "{}", stream),
        }
    }
}

impl From<MultiplexedStream> for Channel {
    fn from(stream: MultiplexedStream) -> Self {
        Channel::Stream(stream)
    }
}

/// Identity of a leased channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKey {
    Connection(ConnectionId),
    Stream(ConnectionId, StreamId),
}

/// Pool of channels handed to the request pipeline
#[async_trait]
pub trait ChannelPool: Send + Sync {
    async fn acquire(&self) -> Result<Channel>;

    async fn release(&self, channel: Channel) -> Result<()>;

    async fn close(&self) -> Result<()>;

    fn collect_metrics(&self, collector: &mut dyn MetricCollector);
}

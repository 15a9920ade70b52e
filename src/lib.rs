// Errors and configuration
pub mod error;
pub mod config;

// Parent connections and the events they carry
pub mod protocol;
pub mod event;
pub mod connection;
pub mod pipeline;
pub mod stream;

// Event stages
pub mod settings;
pub mod health;
pub mod goaway;
pub mod initializer;

// Per-connection stream accounting
pub mod registry;
pub mod record;

// Channel pools
pub mod pool;
pub mod builder;

// Metrics reporting
pub mod metrics;

// In-memory transport for tests and simulation
pub mod loopback;

// Re-export main types
pub use builder::PoolBuilder;
pub use config::{ConfigBuilder, PoolConfig};
pub use connection::{ChildStream, ConnectionId, Connector, ParentConnection, StreamId, Transport};
pub use error::{GoAwayError, PoolError, Result};
pub use pool::{Channel, ChannelPool, MultiplexedConnectionPool, ProtocolNegotiatingPool};
pub use protocol::{NegotiatedProtocol, Protocol};
pub use stream::MultiplexedStream;

pub mod prelude {
    pub use crate::builder::PoolBuilder;
    pub use crate::config::{ConfigBuilder, PoolConfig};
    pub use crate::connection::{Connector, StreamId, Transport};
    pub use crate::error::{PoolError, Result};
    pub use crate::metrics::{MetricCollector, MetricSnapshot, PoolMetric};
    pub use crate::pool::{Channel, ChannelPool, ProtocolNegotiatingPool};
    pub use crate::protocol::Protocol;
    pub use crate::stream::MultiplexedStream;
}

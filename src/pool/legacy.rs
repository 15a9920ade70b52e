//! HTTP/1.1 channel pool: one exchange per parent connection

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, instrument};

use crate::error::{PoolError, Result};
use crate::metrics::MetricCollector;
use crate::pool::raw::RawConnectionPool;
use crate::pool::{Channel, ChannelPool};

/// Leases whole parent connections straight from the raw pool
pub struct ConnectionChannelPool {
    raw: Arc<dyn RawConnectionPool>,
}

impl ConnectionChannelPool {
    pub fn new(raw: Arc<dyn RawConnectionPool>) -> Self {
        Self { raw }
    }
}

#[async_trait]
impl ChannelPool for ConnectionChannelPool {
    #[instrument(skip(self))]
    async fn acquire(&self) -> Result<Channel> {
        self.raw.acquire().await.map(Channel::Connection)
    }

    async fn release(&self, channel: Channel) -> Result<()> {
        match channel {
            Channel::Connection(connection) => self.raw.release(connection).await,
            Channel::Stream(stream) => {
                let message = stream.to_string();
                error!("Channel ({}) is not associated with this pool", message);
                stream.child().close();
                Err(PoolError::UnknownChannel(message))
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.raw.close().await
    }

    fn collect_metrics(&self, _collector: &mut dyn MetricCollector) {}
}

//! Protocol-negotiating front pool
//!
//! The first acquire opens one probe connection and waits for its protocol
//! signal. The outcome picks the pool that serves every later acquire: a
//! connection-per-exchange pool for HTTP/1.1 or a [`MultiplexedConnectionPool`]
//! for HTTP/2. The probe goes back to the raw pool so the chosen pool reuses it.

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::config::PoolConfig;
use crate::error::{PoolError, Result};
use crate::metrics::MetricCollector;
use crate::pool::fixed::FixedChannelPool;
use crate::pool::legacy::ConnectionChannelPool;
use crate::pool::multiplexed::MultiplexedConnectionPool;
use crate::pool::raw::{RawConnectionPool, RawPoolStats};
use crate::pool::{Channel, ChannelPool};
use crate::protocol::Protocol;
use crate::registry::ConnectionRegistry;

type SelectedPool = (Protocol, Arc<dyn ChannelPool>);
type PendingNegotiation = Shared<BoxFuture<'static, Result<SelectedPool>>>;

enum Negotiation {
    Idle,
    Pending(PendingNegotiation),
    Selected(SelectedPool),
}

struct NegotiationState {
    closed: bool,
    negotiation: Negotiation,
}

enum Delegate {
    Ready(Arc<dyn ChannelPool>),
    Wait(PendingNegotiation),
}

struct NegotiatingInner {
    raw: Arc<dyn RawConnectionPool>,
    registry: Arc<ConnectionRegistry>,
    config: PoolConfig,
    state: Mutex<NegotiationState>,
}

pub struct ProtocolNegotiatingPool {
    inner: Arc<NegotiatingInner>,
}

impl ProtocolNegotiatingPool {
    pub fn new(
        raw: Arc<dyn RawConnectionPool>,
        registry: Arc<ConnectionRegistry>,
        config: PoolConfig,
    ) -> Self {
        Self {
            inner: Arc::new(NegotiatingInner {
                raw,
                registry,
                config,
                state: Mutex::new(NegotiationState {
                    closed: false,
                    negotiation: Negotiation::Idle,
                }),
            }),
        }
    }

    /// Protocol picked by negotiation, once it has completed
    pub fn protocol(&self) -> Option<Protocol> {
        match &self.inner.state.lock().negotiation {
            Negotiation::Selected((protocol, _)) => Some(*protocol),
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    pub fn raw_stats(&self) -> RawPoolStats {
        self.inner.raw.stats()
    }

    fn selected(&self) -> Option<Arc<dyn ChannelPool>> {
        match &self.inner.state.lock().negotiation {
            Negotiation::Selected((_, pool)) => Some(pool.clone()),
            _ => None,
        }
    }
}

impl NegotiatingInner {
    /// Find the pool to delegate to, starting negotiation if none is running
    fn delegate(self: &Arc<Self>) -> Result<Delegate> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PoolError::PoolClosed);
        }

        match &state.negotiation {
            Negotiation::Selected((_, pool)) => Ok(Delegate::Ready(pool.clone())),
            Negotiation::Pending(pending) => Ok(Delegate::Wait(pending.clone())),
            Negotiation::Idle => {
                let inner = self.clone();
                let task = tokio::spawn(async move { inner.negotiate().await });
                let pending = async move {
                    task.await
                        .map_err(|e| PoolError::io(format!("Protocol negotiation task failed: {}", e)))?
                }
                .boxed()
                .shared();
                state.negotiation = Negotiation::Pending(pending.clone());
                Ok(Delegate::Wait(pending))
            }
        }
    }

    async fn negotiate(self: Arc<Self>) -> Result<SelectedPool> {
        let outcome = self.probe().await;
        let mut state = self.state.lock();
        match outcome {
            Ok(selected) => {
                state.negotiation = Negotiation::Selected(selected.clone());
                Ok(selected)
            }
            Err(err) => {
                state.negotiation = Negotiation::Idle;
                Err(err)
            }
        }
    }

    async fn probe(&self) -> Result<SelectedPool> {
        let connection = self.raw.acquire().await?;
        debug!("Negotiating protocol on probe connection {}", connection);

        let negotiated = match connection.protocol().wait().await {
            Ok(negotiated) => negotiated,
            Err(err) => {
                warn!("Protocol negotiation failed on {}: {}", connection, err);
                connection.close();
                if let Err(release_err) = self.raw.release(connection).await {
                    debug!("Failed to release probe connection: {}", release_err);
                }
                return Err(err);
            }
        };

        let pool = self.build_pool(negotiated.protocol);
        self.raw.release(connection).await?;
        info!(
            "Negotiated {} with {} max concurrent streams per connection",
            negotiated.protocol, negotiated.max_concurrent_streams
        );
        Ok((negotiated.protocol, pool))
    }

    fn build_pool(&self, protocol: Protocol) -> Arc<dyn ChannelPool> {
        let inner: Arc<dyn ChannelPool> = match protocol {
            Protocol::Http1 => Arc::new(ConnectionChannelPool::new(self.raw.clone())),
            Protocol::Http2 => Arc::new(MultiplexedConnectionPool::new(
                self.raw.clone(),
                self.registry.clone(),
                self.config.idle_connection_timeout(),
                self.config.close_timeout(),
            )),
        };
        Arc::new(FixedChannelPool::new(
            inner,
            self.config.max_concurrency,
            self.config.max_pending_acquires,
            self.config.acquire_timeout(),
        ))
    }
}

#[async_trait]
impl ChannelPool for ProtocolNegotiatingPool {
    #[instrument(skip(self))]
    async fn acquire(&self) -> Result<Channel> {
        let pool = match self.inner.delegate()? {
            Delegate::Ready(pool) => pool,
            Delegate::Wait(pending) => pending.await?.1,
        };
        pool.acquire().await
    }

    async fn release(&self, channel: Channel) -> Result<()> {
        match self.selected() {
            Some(pool) => pool.release(channel).await,
            None => {
                let message = channel.to_string();
                warn!("Channel ({}) was released before a protocol was negotiated", message);
                channel.close();
                Err(PoolError::UnknownChannel(message))
            }
        }
    }

    async fn close(&self) -> Result<()> {
        let negotiation = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            match &state.negotiation {
                Negotiation::Idle => None,
                Negotiation::Pending(pending) => Some(Delegate::Wait(pending.clone())),
                Negotiation::Selected((_, pool)) => Some(Delegate::Ready(pool.clone())),
            }
        };

        match negotiation {
            None => self.inner.raw.close().await,
            Some(Delegate::Ready(pool)) => pool.close().await,
            Some(Delegate::Wait(pending)) => {
                debug!("Close requested during protocol negotiation; deferring");
                let raw = self.inner.raw.clone();
                tokio::spawn(async move {
                    let result = match pending.await {
                        Ok((_, pool)) => pool.close().await,
                        Err(_) => raw.close().await,
                    };
                    if let Err(err) = result {
                        warn!("Deferred pool close failed: {}", err);
                    }
                });
                Ok(())
            }
        }
    }

    fn collect_metrics(&self, collector: &mut dyn MetricCollector) {
        if let Some(pool) = self.selected() {
            pool.collect_metrics(collector);
        }
    }
}

//! Raw parent-connection pool
//!
//! Hands out whole parent connections with their stage pipeline installed.
//! Released connections that are still usable go back on an idle list, which
//! is how the negotiation probe ends up reused by the protocol-specific pool.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, instrument, trace};

use crate::connection::{Connector, ParentConnection};
use crate::error::{PoolError, Result};
use crate::initializer::PipelineInitializer;

/// Source of parent connections for the channel pools
#[async_trait]
pub trait RawConnectionPool: Send + Sync {
    async fn acquire(&self) -> Result<Arc<ParentConnection>>;

    /// Return a leased connection. Releasing the same lease twice is a no-op.
    async fn release(&self, connection: Arc<ParentConnection>) -> Result<()>;

    async fn close(&self) -> Result<()>;

    fn stats(&self) -> RawPoolStats;
}

/// Connection pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RawPoolStats {
    /// Total connection requests
    pub total_requests: u64,
    /// Total connections created
    pub total_created: u64,
    /// Total leases returned
    pub total_released: u64,
    /// Total connections closed by the pool
    pub total_closed: u64,
    /// Number of idle connections
    pub idle_connections: usize,
}

struct PoolInner {
    idle: VecDeque<Arc<ParentConnection>>,
    stats: RawPoolStats,
}

pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    initializer: PipelineInitializer,
    connect_timeout: Duration,
    inner: Mutex<PoolInner>,
    closed: AtomicBool,
    weak_self: Weak<ConnectionPool>,
}

impl ConnectionPool {
    pub fn new(
        connector: Arc<dyn Connector>,
        initializer: PipelineInitializer,
        connect_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            connector,
            initializer,
            connect_timeout,
            inner: Mutex::new(PoolInner {
                idle: VecDeque::new(),
                stats: RawPoolStats::default(),
            }),
            closed: AtomicBool::new(false),
            weak_self: weak_self.clone(),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn try_get_idle(&self) -> Option<Arc<ParentConnection>> {
        let mut inner = self.inner.lock();
        while let Some(connection) = inner.idle.pop_front() {
            inner.stats.idle_connections = inner.idle.len();
            if connection.is_active() {
                return Some(connection);
            }
            trace!("Discarding inactive idle connection {}", connection);
            inner.stats.total_closed += 1;
            connection.close();
        }
        None
    }

    async fn create_connection(&self) -> Result<Arc<ParentConnection>> {
        let transport = timeout(self.connect_timeout, self.connector.connect())
            .await
            .map_err(|_| {
                PoolError::io(format!(
                    "Connection establishment timed out after {:?}",
                    self.connect_timeout
                ))
            })??;

        let raw: Weak<dyn RawConnectionPool> = self.weak_self.clone();
        let connection = self.initializer.initialize(transport, raw);
        self.inner.lock().stats.total_created += 1;
        Ok(connection)
    }
}

#[async_trait]
impl RawConnectionPool for ConnectionPool {
    #[instrument(skip(self))]
    async fn acquire(&self) -> Result<Arc<ParentConnection>> {
        if self.is_closed() {
            return Err(PoolError::PoolClosed);
        }
        self.inner.lock().stats.total_requests += 1;

        let connection = match self.try_get_idle() {
            Some(connection) => {
                debug!("Reused idle connection {}", connection);
                connection
            }
            None => {
                let connection = self.create_connection().await?;
                debug!("Created new connection {}", connection);
                connection
            }
        };

        if self.is_closed() {
            connection.close();
            return Err(PoolError::PoolClosed);
        }
        connection.begin_lease();
        Ok(connection)
    }

    #[instrument(skip(self, connection), fields(connection = %connection))]
    async fn release(&self, connection: Arc<ParentConnection>) -> Result<()> {
        if !connection.end_lease() {
            trace!("Connection {} was already released", connection);
            return Ok(());
        }

        let mut inner = self.inner.lock();
        inner.stats.total_released += 1;
        if self.is_closed() || !connection.is_active() {
            inner.stats.total_closed += 1;
            drop(inner);
            connection.close();
            return Ok(());
        }

        inner.idle.push_back(connection);
        inner.stats.idle_connections = inner.idle.len();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let idle: Vec<_> = {
            let mut inner = self.inner.lock();
            let idle: Vec<_> = inner.idle.drain(..).collect();
            inner.stats.total_closed += idle.len() as u64;
            inner.stats.idle_connections = 0;
            idle
        };

        for connection in &idle {
            connection.close();
        }
        info!("Raw connection pool closed. Closed {} idle connections", idle.len());
        Ok(())
    }

    fn stats(&self) -> RawPoolStats {
        self.inner.lock().stats.clone()
    }
}

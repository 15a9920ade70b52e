//! HTTP/2 stream pool
//!
//! Keeps a working set of [`ConnectionRecord`]s and opens streams on
//! whichever one still has a free slot, creating a new parent connection only
//! when every tracked connection is full or draining.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::connection::{ConnectionId, ParentConnection};
use crate::error::{GoAwayError, PoolError, Result};
use crate::metrics::{MetricCollector, PoolMetric};
use crate::pool::raw::RawConnectionPool;
use crate::pool::{Channel, ChannelPool};
use crate::protocol::Protocol;
use crate::record::{ConnectionRecord, PoolId, RecordState};
use crate::registry::{ConnectionRegistry, RecordOwner};
use crate::stream::MultiplexedStream;

pub struct MultiplexedConnectionPool {
    inner: Arc<MultiplexedInner>,
}

struct MultiplexedInner {
    id: PoolId,
    raw: Arc<dyn RawConnectionPool>,
    registry: Arc<ConnectionRegistry>,
    records: DashMap<ConnectionId, ConnectionRecord>,
    closed: AtomicBool,
    idle_timeout: Option<Duration>,
    close_timeout: Duration,
    weak_self: Weak<MultiplexedInner>,
}

impl MultiplexedConnectionPool {
    pub fn new(
        raw: Arc<dyn RawConnectionPool>,
        registry: Arc<ConnectionRegistry>,
        idle_timeout: Option<Duration>,
        close_timeout: Duration,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak_self| MultiplexedInner {
            id: Uuid::new_v4(),
            raw,
            registry,
            records: DashMap::new(),
            closed: AtomicBool::new(false),
            idle_timeout,
            close_timeout,
            weak_self: weak_self.clone(),
        });
        Self { inner }
    }

    pub fn id(&self) -> PoolId {
        self.inner.id
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Number of parent connections in the working set
    pub fn connection_count(&self) -> usize {
        self.inner.records.len()
    }

    /// Snapshot of the working set
    pub fn records(&self) -> Vec<ConnectionRecord> {
        self.inner
            .records
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn record(&self, id: ConnectionId) -> Option<ConnectionRecord> {
        self.inner.records.get(&id).map(|entry| entry.value().clone())
    }

    /// Open a stream, creating a new parent connection if needed
    pub async fn acquire_stream(&self) -> Result<MultiplexedStream> {
        loop {
            if self.is_closed() {
                return Err(PoolError::PoolClosed);
            }

            if let Some(record) = self.inner.claim_existing() {
                return record.acquire_claimed_stream().await;
            }

            // Connection setup runs detached so an abandoned acquire still
            // leaves a usable record behind instead of a stranded lease.
            let inner = self.inner.clone();
            let record = tokio::spawn(async move { inner.establish_record().await })
                .await
                .map_err(|e| PoolError::io(format!("Connection setup task failed: {}", e)))??;

            if record.claim_stream() {
                return record.acquire_claimed_stream().await;
            }
            if record.state() != RecordState::Open {
                return Err(PoolError::io("Connection was closed while creating a new stream."));
            }
            // Concurrent acquires took every slot on the new connection.
            debug!("Connection {} filled up before it could be claimed; retrying", record.connection());
        }
    }

    /// Return a stream, releasing its parent once a drained connection is empty
    pub async fn release_stream(&self, stream: MultiplexedStream) -> Result<()> {
        let owned = stream.record().owner() == self.inner.id;
        let record = self
            .record(stream.connection_id())
            .or_else(|| owned.then(|| stream.record().clone()));

        let Some(record) = record else {
            let message = stream.to_string();
            error!(
                "Channel ({}) is not associated with any channel records. It will be closed, but cannot be released within this pool.",
                message
            );
            stream.child().close();
            return Err(PoolError::UnknownChannel(message));
        };

        let message = stream.to_string();
        let released = record.release_stream(stream).await;
        if record.can_be_closed_and_released() {
            debug!(
                "Connection {} is {} with no streams left; releasing it",
                record.connection(),
                record.state()
            );
            self.inner
                .close_and_release_parent(record.connection().clone(), None)
                .await?;
        }
        if !released {
            error!("Channel ({}) was not registered on its connection record", message);
            return Err(PoolError::UnknownChannel(message));
        }
        Ok(())
    }
}

impl MultiplexedInner {
    fn owner(&self) -> Weak<dyn RecordOwner> {
        self.weak_self.clone()
    }

    /// Claim a slot on any open connection, pruning closed ones on the way
    fn claim_existing(&self) -> Option<ConnectionRecord> {
        let mut stale = Vec::new();
        let mut claimed = None;
        for entry in self.records.iter() {
            let record = entry.value();
            if record.state() == RecordState::Closed {
                stale.push(*entry.key());
                continue;
            }
            if record.claim_stream() {
                claimed = Some(record.clone());
                break;
            }
        }

        for id in stale {
            self.records.remove(&id);
        }
        claimed
    }

    async fn establish_record(&self) -> Result<ConnectionRecord> {
        let connection = self.raw.acquire().await?;

        let negotiated = match connection.protocol().wait().await {
            Ok(negotiated) => negotiated,
            Err(err) => return Err(self.fail_and_close_parent(connection, err).await),
        };

        if negotiated.protocol != Protocol::Http2 {
            let err = PoolError::Protocol(format!(
                "Protocol negotiated on connection ({}) was expected to be HTTP/2, but it was {}.",
                connection, negotiated.protocol
            ));
            return Err(self.fail_and_close_parent(connection, err).await);
        }

        if negotiated.max_concurrent_streams == 0 {
            let err = PoolError::Protocol(format!(
                "Maximum streams were not positive on connection ({}).",
                connection
            ));
            return Err(self.fail_and_close_parent(connection, err).await);
        }

        if !connection.is_active() {
            let err = PoolError::io("Connection was closed while creating a new stream.");
            return Err(self.fail_and_close_parent(connection, err).await);
        }

        let record = ConnectionRecord::spawn(
            connection.clone(),
            negotiated.max_concurrent_streams,
            self.idle_timeout,
            self.id,
        );
        self.registry.attach(record.clone(), self.owner());
        self.records.insert(connection.id(), record.clone());

        if self.closed.load(Ordering::Acquire) {
            let err = PoolError::io("Connection pool was closed while creating a new stream.");
            let _ = self.close_and_release_parent(connection, Some(err.clone())).await;
            return Err(err);
        }

        debug!(
            "Added connection {} to the pool with {} max concurrent streams",
            connection, negotiated.max_concurrent_streams
        );
        Ok(record)
    }

    /// Discard a connection that never became a record
    async fn fail_and_close_parent(
        &self,
        connection: Arc<ParentConnection>,
        cause: PoolError,
    ) -> PoolError {
        debug!("Discarding connection {}: {}", connection, cause);
        connection.close();
        if let Err(err) = self.raw.release(connection).await {
            debug!("Failed to release discarded connection: {}", err);
        }
        cause
    }

    fn record_for(&self, connection: &Arc<ParentConnection>) -> Option<ConnectionRecord> {
        self.records
            .get(&connection.id())
            .map(|entry| entry.value().clone())
    }

    async fn release_if_drained(&self, record: &ConnectionRecord) {
        if record.can_be_closed_and_released() {
            if let Err(err) = self
                .close_and_release_parent(record.connection().clone(), None)
                .await
            {
                warn!("Failed to release drained connection {}: {}", record.connection(), err);
            }
        }
    }
}

#[async_trait]
impl RecordOwner for MultiplexedInner {
    async fn handle_go_away(&self, connection: Arc<ParentConnection>, error: GoAwayError) {
        let Some(record) = self.record_for(&connection) else {
            connection.close();
            return;
        };
        record.handle_go_away(error).await;
        self.release_if_drained(&record).await;
    }

    async fn close_to_new_streams(&self, connection: Arc<ParentConnection>) {
        let Some(record) = self.record_for(&connection) else {
            return;
        };
        record.close_to_new_streams().await;
        self.release_if_drained(&record).await;
    }

    async fn close_and_release_parent(
        &self,
        connection: Arc<ParentConnection>,
        cause: Option<PoolError>,
    ) -> Result<()> {
        let id = connection.id();
        self.records.remove(&id);
        let Some(attachment) = self.registry.detach(id) else {
            return Ok(());
        };

        attachment.record.close_child_channels(cause).await;
        connection.close();
        self.raw.release(connection).await
    }
}

#[async_trait]
impl ChannelPool for MultiplexedConnectionPool {
    #[instrument(skip(self))]
    async fn acquire(&self) -> Result<Channel> {
        self.acquire_stream().await.map(Channel::Stream)
    }

    #[instrument(skip(self, channel), fields(channel = %channel))]
    async fn release(&self, channel: Channel) -> Result<()> {
        match channel {
            Channel::Stream(stream) => self.release_stream(stream).await,
            Channel::Connection(connection) => {
                let message = connection.to_string();
                error!("Channel ({}) is not a child channel", message);
                connection.close();
                if let Err(err) = self.inner.raw.release(connection).await {
                    debug!("Failed to release non-child channel: {}", err);
                }
                Err(PoolError::NotChildChannel(message))
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let connections: Vec<_> = self
            .inner
            .records
            .iter()
            .map(|entry| entry.value().connection().clone())
            .collect();
        info!("Closing multiplexed pool with {} connections", connections.len());

        let releases = connections.into_iter().map(|connection| {
            self.inner
                .close_and_release_parent(connection, Some(PoolError::PoolClosed))
        });
        let outcome = timeout(self.inner.close_timeout, join_all(releases)).await;

        let result = match outcome {
            Ok(results) => {
                for err in results.into_iter().filter_map(|r| r.err()) {
                    warn!("Failed to release connection during close: {}", err);
                }
                Ok(())
            }
            Err(_) => {
                error!(
                    "Multiplexed pool did not close within {:?}",
                    self.inner.close_timeout
                );
                Err(PoolError::CloseTimeout(self.inner.close_timeout))
            }
        };

        self.inner.raw.close().await?;
        result
    }

    fn collect_metrics(&self, collector: &mut dyn MetricCollector) {
        let available = self
            .inner
            .records
            .iter()
            .fold(0u64, |sum, entry| sum.saturating_add(entry.value().available_concurrency()));
        collector.report(PoolMetric::AvailableConcurrency, available);
    }
}

impl Drop for MultiplexedConnectionPool {
    fn drop(&mut self) {
        if !self.is_closed() {
            debug!("Multiplexed pool {} dropped without close", self.inner.id);
        }
    }
}

//! Concurrency-bounded pool wrapper
//!
//! Caps the number of channels leased from an inner pool. Acquires beyond the
//! cap wait for a permit, up to `max_pending_acquires` of them. The whole
//! acquire, permit wait and inner acquire together, is bounded by
//! `acquire_timeout`.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use crate::error::{PoolError, Result};
use crate::metrics::{MetricCollector, PoolMetric};
use crate::pool::{Channel, ChannelKey, ChannelPool};

pub struct FixedChannelPool {
    inner: Arc<dyn ChannelPool>,
    max_concurrency: usize,
    max_pending_acquires: usize,
    acquire_timeout: Duration,
    permits: Arc<Semaphore>,
    pending: Arc<AtomicUsize>,
    leased: DashMap<ChannelKey, OwnedSemaphorePermit>,
    closed: AtomicBool,
}

/// Counts one waiting acquire for as long as it is alive
struct PendingAcquire {
    pending: Arc<AtomicUsize>,
}

impl PendingAcquire {
    fn enter(pending: &Arc<AtomicUsize>, limit: usize) -> Result<Self> {
        let previous = pending.fetch_add(1, Ordering::AcqRel);
        if previous >= limit {
            pending.fetch_sub(1, Ordering::AcqRel);
            return Err(PoolError::TooManyPendingAcquires(limit));
        }
        Ok(Self {
            pending: pending.clone(),
        })
    }
}

impl Drop for PendingAcquire {
    fn drop(&mut self) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }
}

impl FixedChannelPool {
    pub fn new(
        inner: Arc<dyn ChannelPool>,
        max_concurrency: usize,
        max_pending_acquires: usize,
        acquire_timeout: Duration,
    ) -> Self {
        Self {
            inner,
            max_concurrency,
            max_pending_acquires,
            acquire_timeout,
            permits: Arc::new(Semaphore::new(max_concurrency)),
            pending: Arc::new(AtomicUsize::new(0)),
            leased: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub fn leased(&self) -> usize {
        self.leased.len()
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit> {
        if let Ok(permit) = self.permits.clone().try_acquire_owned() {
            return Ok(permit);
        }

        let _pending = PendingAcquire::enter(&self.pending, self.max_pending_acquires)?;
        debug!("All {} channels are leased; waiting for one", self.max_concurrency);
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PoolError::PoolClosed)
    }
}

#[async_trait]
impl ChannelPool for FixedChannelPool {
    #[instrument(skip(self))]
    async fn acquire(&self) -> Result<Channel> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::PoolClosed);
        }

        let acquire = async {
            let permit = self.acquire_permit().await?;
            let channel = self.inner.acquire().await?;
            Ok::<_, PoolError>((permit, channel))
        };
        let (permit, channel) = timeout(self.acquire_timeout, acquire)
            .await
            .map_err(|_| PoolError::AcquireTimeout(self.acquire_timeout))??;
        self.leased.insert(channel.key(), permit);
        Ok(channel)
    }

    async fn release(&self, channel: Channel) -> Result<()> {
        let permit = self.leased.remove(&channel.key());
        if permit.is_none() {
            warn!("Channel {} was not leased from this pool", channel);
        }
        // The permit is returned whether or not the inner release succeeds.
        let result = self.inner.release(channel).await;
        drop(permit);
        result
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.permits.close();
        self.inner.close().await
    }

    fn collect_metrics(&self, collector: &mut dyn MetricCollector) {
        collector.report(PoolMetric::MaxConcurrency, self.max_concurrency as u64);
        collector.report(PoolMetric::LeasedConcurrency, self.leased() as u64);
        collector.report(PoolMetric::PendingConcurrencyAcquires, self.pending() as u64);
        self.inner.collect_metrics(collector);
    }
}

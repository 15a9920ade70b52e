//! End-to-end pool scenarios driven by the loopback transport

use muxpool::config::{ConfigBuilder, PoolConfig};
use muxpool::connection::{CANCEL, StreamId};
use muxpool::initializer::PipelineInitializer;
use muxpool::loopback::{LoopbackConnector, PeerScript};
use muxpool::metrics::{MetricSnapshot, PoolMetric};
use muxpool::pool::raw::{ConnectionPool, RawConnectionPool};
use muxpool::pool::{Channel, ChannelPool, MultiplexedConnectionPool};
use muxpool::record::RecordState;
use muxpool::registry::ConnectionRegistry;
use muxpool::{PoolBuilder, PoolError, Protocol, Transport};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

struct Harness {
    connector: Arc<LoopbackConnector>,
    raw: Arc<ConnectionPool>,
    pool: Arc<MultiplexedConnectionPool>,
}

fn harness(peer_max_streams: u32, config: PoolConfig) -> Harness {
    let connector = Arc::new(LoopbackConnector::new(PeerScript::http2(Some(peer_max_streams))));
    let registry = Arc::new(ConnectionRegistry::new());
    let initializer = PipelineInitializer::new(&config, registry.clone());
    let raw = ConnectionPool::new(connector.clone(), initializer, config.connect_timeout());
    let pool = Arc::new(MultiplexedConnectionPool::new(
        raw.clone(),
        registry,
        config.idle_connection_timeout(),
        config.close_timeout(),
    ));
    Harness { connector, raw, pool }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

#[tokio::test]
async fn test_third_acquire_opens_second_connection() {
    let h = harness(2, PoolConfig::default());

    let a = h.pool.acquire_stream().await.unwrap();
    let b = h.pool.acquire_stream().await.unwrap();
    let c = h.pool.acquire_stream().await.unwrap();

    assert_eq!(a.connection_id(), b.connection_id());
    assert_ne!(a.connection_id(), c.connection_id());
    assert_eq!(h.connector.connect_count(), 2);
    assert_eq!(h.pool.connection_count(), 2);
}

#[tokio::test]
async fn test_go_away_fails_streams_above_last_stream_id() {
    let h = harness(10, PoolConfig::default());

    let mut streams = Vec::new();
    for _ in 0..5 {
        streams.push(h.pool.acquire_stream().await.unwrap());
    }
    // Keep streams 3, 7 and 9 active.
    let s9 = streams.pop().unwrap();
    let s7 = streams.pop().unwrap();
    let s5 = streams.pop().unwrap();
    let s3 = streams.pop().unwrap();
    let s1 = streams.pop().unwrap();
    assert_eq!(
        (s3.id(), s7.id(), s9.id()),
        (StreamId::new(3), StreamId::new(7), StreamId::new(9))
    );
    h.pool.release_stream(s1).await.unwrap();
    h.pool.release_stream(s5).await.unwrap();

    let record = h.pool.record(s3.connection_id()).unwrap();
    let transport = h.connector.connection(0);
    transport.go_away(5, 2, b"draining");
    settle().await;

    assert_eq!(record.state(), RecordState::ClosedToNew);
    assert_eq!(record.last_go_away(), Some(StreamId::new(5)));
    assert!(s3.failure().is_none());
    for stream in [&s7, &s9] {
        match stream.failure() {
            Some(PoolError::GoAway(err)) => {
                assert_eq!(err.error_code, 2);
                assert_eq!(err.last_stream_id, StreamId::new(5));
                assert!(err.to_string().contains("Debug Data = draining"));
            }
            other => panic!("unexpected failure: {:?}", other),
        }
    }
    assert_eq!(transport.stream(7).unwrap().reset_code(), Some(CANCEL));
    assert_eq!(transport.stream(3).unwrap().reset_code(), None);

    // The drained connection takes no new streams.
    assert!(!record.claim_stream());
    let fresh = h.pool.acquire_stream().await.unwrap();
    assert_ne!(fresh.connection_id(), s3.connection_id());
    assert_eq!(h.connector.connect_count(), 2);

    h.pool.release_stream(s7).await.unwrap();
    h.pool.release_stream(s9).await.unwrap();
    assert_eq!(h.raw.stats().total_released, 0);
    assert!(transport.is_active());

    h.pool.release_stream(s3).await.unwrap();
    settle().await;
    assert_eq!(h.raw.stats().total_released, 1);
    assert!(!transport.is_active());
    assert!(h.pool.record(record.id()).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_missing_ping_ack_tears_connection_down() {
    let config = ConfigBuilder::new()
        .health_check_ping_period(Some(Duration::from_millis(100)))
        .build()
        .unwrap();
    let h = harness(10, config);

    let a = h.pool.acquire_stream().await.unwrap();
    let b = h.pool.acquire_stream().await.unwrap();
    let transport = h.connector.connection(0);
    transport.set_ack_pings(false);

    tokio::time::sleep(Duration::from_millis(500)).await;

    let cause_a = a.failure().expect("stream a should have failed");
    let cause_b = b.failure().expect("stream b should have failed");
    assert!(matches!(cause_a, PoolError::PingFailed(_)));
    assert_eq!(cause_a.to_string(), cause_b.to_string());
    assert!(cause_a.to_string().contains("did not respond to PING"));
    assert!(!transport.is_active());
    assert_eq!(h.pool.connection_count(), 0);
}

#[tokio::test]
async fn test_close_with_idle_connections() {
    let config = ConfigBuilder::new()
        .close_timeout(Duration::from_secs(2))
        .build()
        .unwrap();
    let h = harness(1, config);

    let mut streams = Vec::new();
    for _ in 0..3 {
        streams.push(h.pool.acquire_stream().await.unwrap());
    }
    for stream in streams {
        h.pool.release_stream(stream).await.unwrap();
    }
    assert_eq!(h.pool.connection_count(), 3);

    tokio::time::timeout(Duration::from_secs(2), h.pool.close())
        .await
        .expect("close should finish within its bound")
        .unwrap();

    assert!(h.raw.is_closed());
    assert_eq!(h.pool.connection_count(), 0);
    assert!(h.connector.connections().iter().all(|t| !t.is_active()));
    assert!(matches!(h.pool.acquire_stream().await, Err(PoolError::PoolClosed)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_opens_do_not_leak_slots() {
    let h = harness(4, PoolConfig::default());
    let first = h.pool.acquire_stream().await.unwrap();
    let record = h.pool.record(first.connection_id()).unwrap();
    h.pool.release_stream(first).await.unwrap();
    h.connector.connection(0).set_fail_stream_opens(true);

    let attempts = (0..64).map(|_| {
        let record = record.clone();
        tokio::spawn(async move { record.acquire_stream().await })
    });
    for attempt in futures::future::join_all(attempts).await {
        if let Some(outcome) = attempt.unwrap() {
            assert!(outcome.is_err());
        }
    }

    assert_eq!(record.available_streams(), 4);
    assert_eq!(record.active_streams(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_active_streams_never_exceed_capacity() {
    let h = harness(3, PoolConfig::default());

    let acquires = (0..30).map(|_| {
        let pool = h.pool.clone();
        tokio::spawn(async move { pool.acquire_stream().await })
    });
    let mut streams = Vec::new();
    for acquire in futures::future::join_all(acquires).await {
        streams.push(acquire.unwrap().unwrap());
    }

    for record in h.pool.records() {
        assert!(record.active_streams() as u64 <= record.max_streams());
    }
    assert!(h.pool.connection_count() >= 10);
    assert_eq!(streams.len(), 30);
}

#[tokio::test]
async fn test_drained_parent_is_released_once() {
    let h = harness(10, PoolConfig::default());
    let a = h.pool.acquire_stream().await.unwrap();
    let b = h.pool.acquire_stream().await.unwrap();
    let transport = h.connector.connection(0);

    transport.server_error(a.id(), 503);
    settle().await;
    let record = h.pool.record(a.connection_id()).unwrap();
    assert_eq!(record.state(), RecordState::ClosedToNew);
    assert!(a.failure().is_none());

    let pool = h.pool.clone();
    let (ra, rb) = tokio::join!(pool.release_stream(a), h.pool.release_stream(b));
    ra.unwrap();
    rb.unwrap();
    settle().await;

    // A late disconnect must not release it again.
    transport.drop_connection();
    settle().await;
    assert_eq!(h.raw.stats().total_released, 1);
    assert_eq!(h.pool.connection_count(), 0);
}

#[tokio::test]
async fn test_go_away_without_streams_releases_immediately() {
    let h = harness(10, PoolConfig::default());
    let stream = h.pool.acquire_stream().await.unwrap();
    h.pool.release_stream(stream).await.unwrap();

    h.connector.connection(0).go_away(0, 0, b"");
    settle().await;

    assert_eq!(h.pool.connection_count(), 0);
    assert_eq!(h.raw.stats().total_released, 1);
}

#[tokio::test]
async fn test_open_refused_after_go_away_releases_parent() {
    let config = ConfigBuilder::new()
        .idle_connection_timeout(None)
        .build()
        .unwrap();
    let h = harness(10, config);
    let stream = assert_ok!(h.pool.acquire_stream().await);
    let record = h.pool.record(stream.connection_id()).unwrap();
    assert_ok!(h.pool.release_stream(stream).await);

    // A claim is still in flight when the GOAWAY lands.
    assert!(record.claim_stream());
    h.connector.connection(0).go_away(0, 0, b"");
    settle().await;
    assert_eq!(record.state(), RecordState::ClosedToNew);
    assert_eq!(h.pool.connection_count(), 1);

    let err = assert_err!(record.acquire_claimed_stream().await);
    assert!(err.to_string().contains("received GOAWAY with Last Stream ID 0"));
    settle().await;

    assert_eq!(h.pool.connection_count(), 0);
    assert_eq!(h.raw.stats().total_released, 1);
    assert!(!h.connector.connection(0).is_active());
}

#[tokio::test]
async fn test_abandoned_acquire_returns_its_slot() {
    let h = harness(4, PoolConfig::default());
    let stream = assert_ok!(h.pool.acquire_stream().await);
    let record = h.pool.record(stream.connection_id()).unwrap();
    assert_ok!(h.pool.release_stream(stream).await);

    assert!(record.claim_stream());
    let mut acquire = tokio_test::task::spawn(record.acquire_claimed_stream());
    assert!(acquire.poll().is_pending());
    drop(acquire);
    settle().await;

    assert_eq!(record.available_streams(), record.max_streams());
    assert_eq!(record.active_streams(), 0);
    let transport = h.connector.connection(0);
    assert_eq!(transport.streams().len(), 2);
    assert!(transport.streams().iter().all(|s| s.is_closed()));
}

#[tokio::test]
async fn test_state_never_moves_backwards() {
    let h = harness(10, PoolConfig::default());
    let stream = h.pool.acquire_stream().await.unwrap();
    let record = h.pool.record(stream.connection_id()).unwrap();

    record.close_to_new_streams().await;
    assert_eq!(record.state(), RecordState::ClosedToNew);

    record.close_child_channels(None).await;
    assert_eq!(record.state(), RecordState::Closed);
    assert!(matches!(stream.failure(), Some(PoolError::StreamClosed)));

    record.close_to_new_streams().await;
    record
        .handle_go_away(muxpool::GoAwayError::new(StreamId::new(1), 0, bytes::Bytes::new()))
        .await;
    assert_eq!(record.state(), RecordState::Closed);
    assert!(!record.claim_stream());
}

#[tokio::test(start_paused = true)]
async fn test_idle_connection_is_reaped() {
    let config = ConfigBuilder::new()
        .health_check_ping_period(None)
        .idle_connection_timeout(Some(Duration::from_secs(1)))
        .build()
        .unwrap();
    let h = harness(10, config);

    let stream = h.pool.acquire_stream().await.unwrap();
    h.pool.release_stream(stream).await.unwrap();
    assert_eq!(h.pool.connection_count(), 1);

    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(h.pool.connection_count(), 0);
    assert!(!h.connector.connection(0).is_active());
}

#[tokio::test]
async fn test_busy_connection_is_not_reaped() {
    let config = ConfigBuilder::new()
        .health_check_ping_period(None)
        .idle_connection_timeout(Some(Duration::from_millis(150)))
        .build()
        .unwrap();
    let h = harness(10, config);

    let stream = h.pool.acquire_stream().await.unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;

    assert!(h.connector.connection(0).is_active());
    assert!(stream.failure().is_none());
    h.pool.release_stream(stream).await.unwrap();
}

#[tokio::test]
async fn test_negotiating_pool_end_to_end() {
    let connector = Arc::new(LoopbackConnector::new(PeerScript::http2(Some(4))));
    let config = ConfigBuilder::new().max_concurrency(16).build().unwrap();
    let pool = PoolBuilder::new(connector.clone()).config(config).build().unwrap();

    let mut channels = Vec::new();
    for _ in 0..6 {
        channels.push(pool.acquire().await.unwrap());
    }
    assert_eq!(pool.protocol(), Some(Protocol::Http2));
    assert_eq!(connector.connect_count(), 2);

    let mut snapshot = MetricSnapshot::new();
    pool.collect_metrics(&mut snapshot);
    assert_eq!(snapshot.get(PoolMetric::MaxConcurrency), Some(16));
    assert_eq!(snapshot.get(PoolMetric::LeasedConcurrency), Some(6));
    assert_eq!(snapshot.get(PoolMetric::AvailableConcurrency), Some(2));

    for channel in channels {
        pool.release(channel).await.unwrap();
    }
    pool.close().await.unwrap();
    assert!(pool.raw_stats().total_closed >= 2);
}

#[tokio::test]
async fn test_http1_peer_gets_connection_channels() {
    let connector = Arc::new(LoopbackConnector::new(PeerScript::http1()));
    let pool = PoolBuilder::new(connector).build().unwrap();

    let channel = pool.acquire().await.unwrap();
    assert!(matches!(channel, Channel::Connection(_)));
    assert_eq!(pool.protocol(), Some(Protocol::Http1));
    pool.release(channel).await.unwrap();
    assert_eq!(pool.raw_stats().idle_connections, 1);
}

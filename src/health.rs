//! Connection health checking
//!
//! [`HealthChecker`] sends a PING every period once HTTP/2 is confirmed and
//! raises [`PoolError::PingFailed`] when an earlier PING went a full period
//! without an acknowledgment. [`StreamHealth`] turns stream-level failures
//! into connection-level decisions: server errors and I/O failures drain the
//! connection, isolated read/write timeouts first trigger an extra PING.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::connection::ParentConnection;
use crate::error::PoolError;
use crate::event::ConnectionEvent;
use crate::pipeline::{EventStage, Flow};

#[derive(Debug, Default)]
struct PingClock {
    last_sent: Option<Instant>,
    last_ack: Option<Instant>,
    next_payload: u64,
    stopped: bool,
}

impl PingClock {
    /// The last PING is still unacknowledged after `period`
    fn overdue(&self, now: Instant, period: Duration) -> Option<Duration> {
        let sent = self.last_sent?;
        if self.last_ack.is_some_and(|ack| ack >= sent) {
            return None;
        }
        let waited = now.saturating_duration_since(sent);
        (waited >= period).then_some(waited)
    }
}

/// Periodic PING liveness probe for one parent connection
pub struct HealthChecker {
    period: Duration,
    clock: Arc<Mutex<PingClock>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HealthChecker {
    pub const NAME: &'static str = "health";

    pub fn new(period: Duration) -> Self {
        Self {
            period,
            clock: Arc::new(Mutex::new(PingClock::default())),
            task: Mutex::new(None),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    fn start(&self, connection: &Arc<ParentConnection>) {
        let mut task = self.task.lock();
        if task.is_some() || self.clock.lock().stopped {
            return;
        }

        let period = self.period;
        let clock = self.clock.clone();
        let weak = Arc::downgrade(connection);
        *task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(connection) = weak.upgrade() else {
                    break;
                };
                if !Self::ping(&clock, period, &connection).await {
                    break;
                }
            }
        }));
        debug!("Started health checks on {} every {:?}", connection, period);
    }

    fn stop(&self) {
        self.clock.lock().stopped = true;
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    /// Check the previous PING and send the next one. Used by the periodic
    /// task and for out-of-band probes.
    pub async fn do_periodic_ping(&self, connection: &Arc<ParentConnection>) {
        if !Self::ping(&self.clock, self.period, connection).await {
            self.stop();
        }
    }

    /// Returns false once the connection has been declared unhealthy
    async fn ping(clock: &Mutex<PingClock>, period: Duration, connection: &Arc<ParentConnection>) -> bool {
        let payload = {
            let mut clock = clock.lock();
            if clock.stopped {
                return false;
            }
            let now = Instant::now();
            if let Some(waited) = clock.overdue(now, period) {
                clock.stopped = true;
                drop(clock);
                Self::unhealthy(
                    connection,
                    PoolError::PingFailed(format!(
                        "Server did not respond to PING after {}ms (limit: {}ms)",
                        waited.as_millis(),
                        period.as_millis()
                    )),
                );
                return false;
            }
            clock.last_sent = Some(now);
            clock.next_payload += 1;
            clock.next_payload
        };

        if let Err(err) = connection.transport().send_ping(payload).await {
            debug!("PING write failed on {}: {}", connection, err);
            clock.lock().stopped = true;
            Self::unhealthy(
                connection,
                PoolError::PingFailed("Failed to send PING to the service".to_string()),
            );
            return false;
        }
        true
    }

    fn unhealthy(connection: &Arc<ParentConnection>, cause: PoolError) {
        warn!("Connection {} is unhealthy: {}", connection, cause);
        connection.fire_exception(cause);
    }
}

impl EventStage for HealthChecker {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn handle(&self, connection: &Arc<ParentConnection>, event: &ConnectionEvent) -> Flow {
        match event {
            ConnectionEvent::Settings { .. } => {
                self.start(connection);
                Flow::Forward
            }
            ConnectionEvent::PingAck { .. } => {
                self.clock.lock().last_ack = Some(Instant::now());
                Flow::Consumed
            }
            ConnectionEvent::Inactive => {
                self.stop();
                Flow::Forward
            }
            _ => Flow::Forward,
        }
    }
}

impl Drop for HealthChecker {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

/// Escalates stream-level failures to the parent connection
pub struct StreamHealth {
    checker: Option<Arc<HealthChecker>>,
}

impl StreamHealth {
    pub const NAME: &'static str = "stream-health";

    pub fn new(checker: Option<Arc<HealthChecker>>) -> Self {
        Self { checker }
    }

    fn drain(connection: &Arc<ParentConnection>, reason: String) {
        debug!("Draining connection {}: {}", connection, reason);
        connection.fire_exception(PoolError::ConnectionTerminating(reason));
    }
}

impl EventStage for StreamHealth {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn handle(&self, connection: &Arc<ParentConnection>, event: &ConnectionEvent) -> Flow {
        match event {
            ConnectionEvent::ServerError { stream_id, status } if *status >= 500 => {
                Self::drain(
                    connection,
                    format!("Server returned status {} on stream {}", status, stream_id),
                );
            }
            ConnectionEvent::StreamError {
                stream_id,
                kind,
                message,
            } => {
                if kind.is_isolated_timeout() {
                    match &self.checker {
                        Some(checker) => {
                            debug!(
                                "Stream {} on {} timed out; probing the connection",
                                stream_id, connection
                            );
                            let checker = checker.clone();
                            let connection = connection.clone();
                            tokio::spawn(async move {
                                checker.do_periodic_ping(&connection).await;
                            });
                        }
                        None => Self::drain(
                            connection,
                            format!("Stream {} timed out: {}", stream_id, message),
                        ),
                    }
                } else {
                    Self::drain(
                        connection,
                        format!("Stream {} failed: {}", stream_id, message),
                    );
                }
            }
            _ => {}
        }
        Flow::Forward
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connector, StreamId};
    use crate::event::StreamErrorKind;
    use crate::loopback::{LoopbackConnector, PeerScript};
    use crate::pipeline::EventPipeline;

    struct Exceptions(Arc<Mutex<Vec<PoolError>>>);

    impl EventStage for Exceptions {
        fn name(&self) -> &'static str {
            "exceptions"
        }

        fn handle(&self, _connection: &Arc<ParentConnection>, event: &ConnectionEvent) -> Flow {
            if let ConnectionEvent::Exception(cause) = event {
                self.0.lock().push(cause.clone());
            }
            Flow::Consumed
        }
    }

    async fn open(
        connector: &LoopbackConnector,
        checker: Option<Arc<HealthChecker>>,
    ) -> (Arc<ParentConnection>, Arc<Mutex<Vec<PoolError>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let transport = connector.connect().await.unwrap();
        let mut pipeline = EventPipeline::new();
        if let Some(checker) = &checker {
            pipeline.add_last(checker.clone());
        }
        pipeline
            .add_last(Arc::new(StreamHealth::new(checker)))
            .add_last(Arc::new(Exceptions(seen.clone())));
        (ParentConnection::open(transport, pipeline), seen)
    }

    #[tokio::test(start_paused = true)]
    async fn test_acknowledged_pings_keep_connection_healthy() {
        let connector = LoopbackConnector::new(PeerScript::http2(Some(10)));
        let checker = Arc::new(HealthChecker::new(Duration::from_millis(100)));
        let (_connection, seen) = open(&connector, Some(checker.clone())).await;

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert!(checker.is_running());
        assert!(connector.connection(0).pings_sent() >= 5);
        assert!(seen.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_ack_fails_connection() {
        let connector = LoopbackConnector::new(PeerScript::http2(Some(10)));
        let checker = Arc::new(HealthChecker::new(Duration::from_millis(100)));
        let (_connection, seen) = open(&connector, Some(checker)).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        connector.connection(0).set_ack_pings(false);

        tokio::time::sleep(Duration::from_millis(500)).await;
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert!(matches!(&seen[0], PoolError::PingFailed(msg) if msg.contains("did not respond to PING")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_ping_write_fails_connection() {
        let connector = LoopbackConnector::new(PeerScript {
            fail_pings: true,
            ..PeerScript::http2(Some(10))
        });
        let checker = Arc::new(HealthChecker::new(Duration::from_millis(100)));
        let (_connection, seen) = open(&connector, Some(checker)).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].to_string().contains("Failed to send PING"));
    }

    #[tokio::test]
    async fn test_server_error_drains_connection() {
        let connector = LoopbackConnector::new(PeerScript::http2(Some(10)));
        let (connection, seen) = open(&connector, None).await;

        connection.deliver(ConnectionEvent::ServerError {
            stream_id: StreamId::new(1),
            status: 404,
        });
        connection.deliver(ConnectionEvent::ServerError {
            stream_id: StreamId::new(3),
            status: 503,
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert!(matches!(seen[0], PoolError::ConnectionTerminating(_)));
    }

    #[tokio::test]
    async fn test_read_timeout_probes_instead_of_draining() {
        let connector = LoopbackConnector::new(PeerScript::http2(Some(10)));
        let checker = Arc::new(HealthChecker::new(Duration::from_secs(60)));
        let (connection, seen) = open(&connector, Some(checker)).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        let before = connector.connection(0).pings_sent();

        connection.deliver(ConnectionEvent::StreamError {
            stream_id: StreamId::new(1),
            kind: StreamErrorKind::ReadTimeout,
            message: "read timed out".to_string(),
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(connector.connection(0).pings_sent(), before + 1);
        assert!(seen.lock().is_empty());
    }
}

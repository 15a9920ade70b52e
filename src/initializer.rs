//! Stage pipeline installed on every new parent connection

use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::debug;

use crate::config::PoolConfig;
use crate::connection::{ParentConnection, Transport};
use crate::goaway::{GoAwayCoordinator, TeardownRouter};
use crate::health::{HealthChecker, StreamHealth};
use crate::pipeline::EventPipeline;
use crate::pool::raw::RawConnectionPool;
use crate::protocol::{NegotiatedProtocol, Protocol};
use crate::registry::ConnectionRegistry;
use crate::settings::SettingsNegotiator;

pub struct PipelineInitializer {
    protocol: Protocol,
    max_streams: u32,
    ping_period: Option<Duration>,
    registry: Arc<ConnectionRegistry>,
}

impl PipelineInitializer {
    pub fn new(config: &PoolConfig, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            protocol: config.protocol,
            max_streams: config.max_streams_per_connection,
            ping_period: config.health_check_ping_period(),
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Build the stages for one connection:
    /// settings, health, stream-health, goaway, teardown
    pub fn pipeline(&self, raw: Weak<dyn RawConnectionPool>) -> EventPipeline {
        let mut pipeline = EventPipeline::new();
        pipeline.add_last(Arc::new(SettingsNegotiator::new(self.max_streams, raw)));

        let checker = match (self.protocol, self.ping_period) {
            (Protocol::Http2, Some(period)) => {
                let checker = Arc::new(HealthChecker::new(period));
                pipeline.add_last(checker.clone());
                Some(checker)
            }
            _ => None,
        };

        pipeline
            .add_last(Arc::new(StreamHealth::new(checker)))
            .add_last(Arc::new(GoAwayCoordinator::new(self.registry.clone())))
            .add_last(Arc::new(TeardownRouter::new(self.registry.clone())));
        pipeline
    }

    /// Wrap a fresh transport in a parent connection with its pipeline
    pub fn initialize(
        &self,
        transport: Arc<dyn Transport>,
        raw: Weak<dyn RawConnectionPool>,
    ) -> Arc<ParentConnection> {
        let connection = ParentConnection::open(transport, self.pipeline(raw));
        if self.protocol == Protocol::Http1
            && connection.protocol().resolve(Ok(NegotiatedProtocol::http1()))
        {
            debug!("Connection {} configured for HTTP/1.1", connection);
        }
        connection
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigBuilder;
    use crate::connection::Connector;
    use crate::loopback::{LoopbackConnector, PeerScript};
    use crate::pool::raw::ConnectionPool;

    fn no_raw_pool() -> Weak<dyn RawConnectionPool> {
        Weak::<ConnectionPool>::new()
    }

    #[test]
    fn test_stage_order() {
        let initializer =
            PipelineInitializer::new(&PoolConfig::default(), Arc::new(ConnectionRegistry::new()));
        let pipeline = initializer.pipeline(no_raw_pool());
        assert_eq!(
            pipeline.stage_names(),
            vec!["settings", "health", "stream-health", "goaway", "teardown"]
        );
    }

    #[test]
    fn test_health_stage_omitted_without_period() {
        let config = ConfigBuilder::new().health_check_ping_period(None).build().unwrap();
        let initializer = PipelineInitializer::new(&config, Arc::new(ConnectionRegistry::new()));
        let pipeline = initializer.pipeline(no_raw_pool());
        assert!(!pipeline.stage_names().contains(&"health"));
        assert_eq!(pipeline.len(), 4);
    }

    #[tokio::test]
    async fn test_http1_resolves_immediately() {
        let config = ConfigBuilder::new().protocol(Protocol::Http1).build().unwrap();
        let initializer = PipelineInitializer::new(&config, Arc::new(ConnectionRegistry::new()));
        let connector = LoopbackConnector::new(PeerScript::silent());

        let connection = initializer.initialize(connector.connect().await.unwrap(), no_raw_pool());
        assert!(connection.protocol().is_resolved());
        assert_eq!(connection.protocol().wait().await.unwrap(), NegotiatedProtocol::http1());
    }
}

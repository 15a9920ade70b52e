use std::sync::Arc;

use crate::config::PoolConfig;
use crate::connection::Connector;
use crate::error::Result;
use crate::initializer::PipelineInitializer;
use crate::pool::negotiating::ProtocolNegotiatingPool;
use crate::pool::raw::ConnectionPool;
use crate::registry::ConnectionRegistry;

/// Wires a connector, the raw pool and the negotiating pool together
pub struct PoolBuilder {
    connector: Arc<dyn Connector>,
    config: PoolConfig,
}

impl PoolBuilder {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            config: PoolConfig::default(),
        }
    }

    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<ProtocolNegotiatingPool> {
        self.config.validate()?;

        let registry = Arc::new(ConnectionRegistry::new());
        let initializer = PipelineInitializer::new(&self.config, registry.clone());
        let raw = ConnectionPool::new(self.connector, initializer, self.config.connect_timeout());
        Ok(ProtocolNegotiatingPool::new(raw, registry, self.config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackConnector, PeerScript};

    #[test]
    fn test_invalid_config_is_rejected() {
        let connector = Arc::new(LoopbackConnector::new(PeerScript::http2(None)));
        let mut config = PoolConfig::default();
        config.max_concurrency = 0;
        assert!(PoolBuilder::new(connector).config(config).build().is_err());
    }
}

//! GOAWAY handling and connection teardown routing
//!
//! Both stages look up the owning record through the [`ConnectionRegistry`].
//! A connection that is not attached to a record yet is still negotiating and
//! has no streams to drain, so it is simply closed.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::connection::ParentConnection;
use crate::error::{GoAwayError, PoolError};
use crate::event::ConnectionEvent;
use crate::pipeline::{EventStage, Flow};
use crate::registry::{Attachment, ConnectionRegistry, RecordOwner};

fn attached_owner(
    registry: &ConnectionRegistry,
    connection: &Arc<ParentConnection>,
) -> Option<Arc<dyn RecordOwner>> {
    registry.get(connection.id()).as_ref().and_then(Attachment::owner)
}

/// Routes GOAWAY frames into the owning record
pub struct GoAwayCoordinator {
    registry: Arc<ConnectionRegistry>,
}

impl GoAwayCoordinator {
    pub const NAME: &'static str = "goaway";

    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }
}

impl EventStage for GoAwayCoordinator {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn handle(&self, connection: &Arc<ParentConnection>, event: &ConnectionEvent) -> Flow {
        let ConnectionEvent::GoAway {
            last_stream_id,
            error_code,
            debug_data,
        } = event
        else {
            return Flow::Forward;
        };

        let error = GoAwayError::new(*last_stream_id, *error_code, debug_data.clone());
        match attached_owner(&self.registry, connection) {
            Some(owner) => {
                let connection = connection.clone();
                tokio::spawn(async move {
                    owner.handle_go_away(connection, error).await;
                });
            }
            None => {
                warn!(
                    "GOAWAY received on connection {} before it was attached to a pool; closing it",
                    connection
                );
                connection.close();
            }
        }
        Flow::Consumed
    }
}

/// Tears records down when their connection fails or goes away
pub struct TeardownRouter {
    registry: Arc<ConnectionRegistry>,
}

impl TeardownRouter {
    pub const NAME: &'static str = "teardown";

    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    fn release(&self, connection: &Arc<ParentConnection>, cause: Option<PoolError>) -> bool {
        let Some(owner) = attached_owner(&self.registry, connection) else {
            return false;
        };
        let connection = connection.clone();
        tokio::spawn(async move {
            if let Err(err) = owner.close_and_release_parent(connection.clone(), cause).await {
                debug!("Failed to release connection {}: {}", connection, err);
            }
        });
        true
    }
}

impl EventStage for TeardownRouter {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn handle(&self, connection: &Arc<ParentConnection>, event: &ConnectionEvent) -> Flow {
        match event {
            ConnectionEvent::Exception(PoolError::ConnectionTerminating(reason)) => {
                match attached_owner(&self.registry, connection) {
                    Some(owner) => {
                        debug!("Connection {} stops accepting streams: {}", connection, reason);
                        let connection = connection.clone();
                        tokio::spawn(async move {
                            owner.close_to_new_streams(connection).await;
                        });
                    }
                    None => connection.close(),
                }
                Flow::Consumed
            }
            ConnectionEvent::Exception(cause) => {
                warn!("Closing connection {} after failure: {}", connection, cause);
                if !self.release(connection, Some(cause.clone())) {
                    connection.close();
                }
                Flow::Consumed
            }
            ConnectionEvent::Inactive => {
                self.release(connection, Some(PoolError::io("The connection was closed")));
                Flow::Consumed
            }
            _ => Flow::Forward,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connector, StreamId};
    use crate::error::Result;
    use crate::loopback::{LoopbackConnector, PeerScript};
    use crate::pipeline::EventPipeline;
    use crate::record::ConnectionRecord;
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingOwner {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RecordOwner for RecordingOwner {
        async fn handle_go_away(&self, _connection: Arc<ParentConnection>, error: GoAwayError) {
            self.calls.lock().push(format!("goaway:{}", error.last_stream_id));
        }

        async fn close_to_new_streams(&self, _connection: Arc<ParentConnection>) {
            self.calls.lock().push("drain".to_string());
        }

        async fn close_and_release_parent(
            &self,
            _connection: Arc<ParentConnection>,
            cause: Option<PoolError>,
        ) -> Result<()> {
            self.calls.lock().push(format!("release:{}", cause.is_some()));
            Ok(())
        }
    }

    async fn open(registry: &Arc<ConnectionRegistry>) -> Arc<ParentConnection> {
        let connector = LoopbackConnector::new(PeerScript::http2(Some(10)));
        let transport = connector.connect().await.unwrap();
        let mut pipeline = EventPipeline::new();
        pipeline
            .add_last(Arc::new(GoAwayCoordinator::new(registry.clone())))
            .add_last(Arc::new(TeardownRouter::new(registry.clone())));
        ParentConnection::open(transport, pipeline)
    }

    fn go_away(last: u32) -> ConnectionEvent {
        ConnectionEvent::GoAway {
            last_stream_id: StreamId::new(last),
            error_code: 0,
            debug_data: Bytes::new(),
        }
    }

    #[tokio::test]
    async fn test_unattached_go_away_closes_connection() {
        let registry = Arc::new(ConnectionRegistry::new());
        let connection = open(&registry).await;

        connection.deliver(go_away(1));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!connection.is_active());
    }

    #[tokio::test]
    async fn test_attached_events_reach_owner() {
        let registry = Arc::new(ConnectionRegistry::new());
        let connection = open(&registry).await;
        let owner = Arc::new(RecordingOwner::default());
        let owner_dyn: Arc<dyn RecordOwner> = owner.clone();
        let weak = Arc::downgrade(&owner_dyn);
        registry.attach(
            ConnectionRecord::spawn(connection.clone(), 10, None, uuid::Uuid::new_v4()),
            weak,
        );

        connection.deliver(go_away(5));
        tokio::time::sleep(Duration::from_millis(10)).await;
        connection.fire_exception(PoolError::ConnectionTerminating("503".to_string()));
        tokio::time::sleep(Duration::from_millis(10)).await;
        connection.fire_exception(PoolError::io("reset by peer"));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(
            *owner.calls.lock(),
            vec!["goaway:5".to_string(), "drain".to_string(), "release:true".to_string()]
        );
        assert!(connection.is_active());
    }
}

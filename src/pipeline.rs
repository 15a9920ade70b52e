//! Ordered event stages for a parent connection
//!
//! Each stage sees an event and either consumes it or forwards it to the next
//! stage. Stages run on the connection's event task, one event at a time, so
//! they must not block; anything slow is spawned.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::connection::ParentConnection;
use crate::event::ConnectionEvent;

/// What a stage did with an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Forward,
    Consumed,
}

pub trait EventStage: Send + Sync {
    fn name(&self) -> &'static str;

    fn handle(&self, connection: &Arc<ParentConnection>, event: &ConnectionEvent) -> Flow;
}

#[derive(Default)]
pub struct EventPipeline {
    stages: Vec<Arc<dyn EventStage>>,
}

impl EventPipeline {
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    pub fn add_last(&mut self, stage: Arc<dyn EventStage>) -> &mut Self {
        self.stages.push(stage);
        self
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run `event` through the stages until one consumes it
    pub fn dispatch(&self, connection: &Arc<ParentConnection>, event: ConnectionEvent) {
        for stage in &self.stages {
            if stage.handle(connection, &event) == Flow::Consumed {
                return;
            }
        }

        match event {
            ConnectionEvent::Exception(cause) => {
                warn!("Unhandled exception on connection {}: {}", connection, cause);
            }
            other => {
                debug!("Event {} reached the end of the pipeline on {}", other.kind(), connection);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackConnector, PeerScript};
    use crate::connection::Connector;
    use parking_lot::Mutex;

    struct Recorder {
        name: &'static str,
        consume: bool,
        seen: Arc<Mutex<Vec<String>>>,
    }

    impl EventStage for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        fn handle(&self, _connection: &Arc<ParentConnection>, event: &ConnectionEvent) -> Flow {
            self.seen.lock().push(format!("{}:{}", self.name, event.kind()));
            if self.consume { Flow::Consumed } else { Flow::Forward }
        }
    }

    #[tokio::test]
    async fn test_stages_run_in_order_until_consumed() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = EventPipeline::new();
        pipeline
            .add_last(Arc::new(Recorder { name: "first", consume: false, seen: seen.clone() }))
            .add_last(Arc::new(Recorder { name: "second", consume: true, seen: seen.clone() }))
            .add_last(Arc::new(Recorder { name: "third", consume: false, seen: seen.clone() }));
        assert_eq!(pipeline.stage_names(), vec!["first", "second", "third"]);

        let connector = LoopbackConnector::new(PeerScript::silent());
        let transport = connector.connect().await.unwrap();
        let connection = ParentConnection::open(transport, pipeline);

        connection.deliver(ConnectionEvent::Ping { payload: 1 });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        assert_eq!(*seen.lock(), vec!["first:ping".to_string(), "second:ping".to_string()]);
    }
}

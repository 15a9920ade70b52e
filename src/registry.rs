//! Association table from parent connections to their pool records
//!
//! Event stages are installed before a connection belongs to any pool, so
//! they find the owning [`ConnectionRecord`] (and the pool that manages it)
//! through this table instead of through state hung on the transport.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::{Arc, Weak};

use crate::connection::{ConnectionId, ParentConnection};
use crate::error::{GoAwayError, PoolError, Result};
use crate::record::ConnectionRecord;

/// Pool-side handling for events routed from a connection's pipeline
#[async_trait]
pub trait RecordOwner: Send + Sync {
    async fn handle_go_away(&self, connection: Arc<ParentConnection>, error: GoAwayError);

    async fn close_to_new_streams(&self, connection: Arc<ParentConnection>);

    async fn close_and_release_parent(
        &self,
        connection: Arc<ParentConnection>,
        cause: Option<PoolError>,
    ) -> Result<()>;
}

#[derive(Clone)]
pub struct Attachment {
    pub record: ConnectionRecord,
    pub owner: Weak<dyn RecordOwner>,
}

impl Attachment {
    pub fn owner(&self) -> Option<Arc<dyn RecordOwner>> {
        self.owner.upgrade()
    }
}

#[derive(Default)]
pub struct ConnectionRegistry {
    attachments: DashMap<ConnectionId, Attachment>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, record: ConnectionRecord, owner: Weak<dyn RecordOwner>) {
        let id = record.connection().id();
        record.bind_owner(owner.clone());
        self.attachments.insert(id, Attachment { record, owner });
    }

    pub fn detach(&self, id: ConnectionId) -> Option<Attachment> {
        self.attachments.remove(&id).map(|(_, attachment)| attachment)
    }

    pub fn get(&self, id: ConnectionId) -> Option<Attachment> {
        self.attachments.get(&id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.attachments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attachments.is_empty()
    }
}

//! Protocol resolution from ALPN and the peer's first SETTINGS frame

use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

use crate::connection::ParentConnection;
use crate::error::PoolError;
use crate::event::ConnectionEvent;
use crate::pipeline::{EventStage, Flow};
use crate::pool::raw::RawConnectionPool;
use crate::protocol::{NegotiatedProtocol, Protocol};

pub const CLOSED_BEFORE_NEGOTIATION: &str =
    "The connection was closed before the protocol could be determined.";

/// Effective stream capacity: the smaller of the local cap and the peer's
/// advertised limit. A peer that omits the limit is unbounded.
pub fn effective_max_streams(local_max: u32, peer_max: Option<u32>) -> u32 {
    local_max.min(peer_max.unwrap_or(u32::MAX))
}

/// Resolves a connection's [`ProtocolSignal`](crate::protocol::ProtocolSignal)
pub struct SettingsNegotiator {
    local_max_streams: u32,
    raw: Weak<dyn RawConnectionPool>,
}

impl SettingsNegotiator {
    pub const NAME: &'static str = "settings";

    pub fn new(local_max_streams: u32, raw: Weak<dyn RawConnectionPool>) -> Self {
        Self {
            local_max_streams,
            raw,
        }
    }

    fn on_settings(&self, connection: &Arc<ParentConnection>, peer_max: Option<u32>) {
        let effective = effective_max_streams(self.local_max_streams, peer_max);
        if connection.protocol().resolve(Ok(NegotiatedProtocol::http2(effective))) {
            debug!(
                "Connection {} negotiated HTTP/2 with {} max concurrent streams (peer advertised {:?})",
                connection, effective, peer_max
            );
        } else {
            trace!("Ignoring later SETTINGS frame on connection {}", connection);
        }
    }

    fn on_closed(&self, connection: &Arc<ParentConnection>) {
        if !connection
            .protocol()
            .resolve(Err(PoolError::io(CLOSED_BEFORE_NEGOTIATION)))
        {
            return;
        }
        warn!("Connection {} closed before protocol negotiation completed", connection);

        let Some(raw) = self.raw.upgrade() else {
            return;
        };
        let connection = connection.clone();
        tokio::spawn(async move {
            if let Err(err) = raw.release(connection).await {
                debug!("Failed to release unnegotiated connection: {}", err);
            }
        });
    }
}

impl EventStage for SettingsNegotiator {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn handle(&self, connection: &Arc<ParentConnection>, event: &ConnectionEvent) -> Flow {
        match event {
            ConnectionEvent::AlpnNegotiated(Protocol::Http1) => {
                if connection.protocol().resolve(Ok(NegotiatedProtocol::http1())) {
                    debug!("Peer selected HTTP/1.1 on connection {}", connection);
                }
                Flow::Consumed
            }
            ConnectionEvent::AlpnNegotiated(Protocol::Http2) => Flow::Consumed,
            ConnectionEvent::Settings {
                max_concurrent_streams,
            } => {
                self.on_settings(connection, *max_concurrent_streams);
                Flow::Forward
            }
            ConnectionEvent::Exception(cause) => {
                connection.protocol().resolve(Err(cause.clone()));
                Flow::Forward
            }
            ConnectionEvent::Inactive => {
                self.on_closed(connection);
                Flow::Forward
            }
            _ => Flow::Forward,
        }
    }
}

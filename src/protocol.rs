//! Negotiated protocol signal
//!
//! Every parent connection carries a [`ProtocolSignal`] that resolves once the
//! handshake has decided whether the peer multiplexes streams. HTTP/1.1
//! resolves with a capacity of one exchange; HTTP/2 resolves when the first
//! SETTINGS frame has been read.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

use crate::error::{PoolError, Result};

/// Wire protocol spoken on a parent connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// One exchange per connection at a time
    Http1,
    /// Many concurrent streams per connection
    Http2,
}

impl Protocol {
    pub fn is_multiplexed(&self) -> bool {
        matches!(self, Protocol::Http2)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Http1 => write!(f, "HTTP/1.1"),
            Protocol::Http2 => write!(f, "HTTP/2"),
        }
    }
}

/// Outcome of protocol negotiation on one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedProtocol {
    pub protocol: Protocol,
    /// Effective stream capacity of the connection
    pub max_concurrent_streams: u32,
}

impl NegotiatedProtocol {
    pub fn http1() -> Self {
        Self {
            protocol: Protocol::Http1,
            max_concurrent_streams: 1,
        }
    }

    pub fn http2(max_concurrent_streams: u32) -> Self {
        Self {
            protocol: Protocol::Http2,
            max_concurrent_streams,
        }
    }
}

type SignalValue = Option<std::result::Result<NegotiatedProtocol, PoolError>>;

/// Resolve-once, await-many protocol signal
#[derive(Debug, Clone)]
pub struct ProtocolSignal {
    tx: Arc<watch::Sender<SignalValue>>,
}

impl ProtocolSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Complete the signal. Returns false if it was already resolved.
    pub fn resolve(&self, outcome: std::result::Result<NegotiatedProtocol, PoolError>) -> bool {
        let mut outcome = Some(outcome);
        self.tx.send_if_modified(|value| {
            if value.is_some() {
                return false;
            }
            *value = outcome.take();
            true
        })
    }

    pub fn is_resolved(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Current outcome without waiting
    pub fn peek(&self) -> SignalValue {
        self.tx.borrow().clone()
    }

    /// Wait for negotiation to finish
    pub async fn wait(&self) -> Result<NegotiatedProtocol> {
        let mut rx = self.tx.subscribe();
        let value = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| PoolError::io("Protocol signal dropped before negotiation completed"))?;
        value
            .clone()
            .unwrap_or_else(|| Err(PoolError::io("Protocol signal resolved without a value")))
    }
}

impl Default for ProtocolSignal {
    fn default() -> Self {
        Self::new()
    }
}

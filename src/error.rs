//! Pool error types

use bytes::Bytes;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::connection::StreamId;

/// Details carried by a GOAWAY frame from the peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoAwayError {
    /// Highest stream id the peer will still process
    pub last_stream_id: StreamId,
    /// HTTP/2 error code sent with the frame
    pub error_code: u32,
    /// Opaque debug data sent with the frame
    pub debug_data: Bytes,
}

impl GoAwayError {
    pub fn new(last_stream_id: StreamId, error_code: u32, debug_data: Bytes) -> Self {
        Self {
            last_stream_id,
            error_code,
            debug_data,
        }
    }
}

impl fmt::Display for GoAwayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GOAWAY received from service, requesting this stream be closed. Error Code = {}, Debug Data = {}",
            self.error_code,
            String::from_utf8_lossy(&self.debug_data)
        )
    }
}

#[derive(Error, Debug, Clone)]
pub enum PoolError {
    #[error("IO error: {0}")]
    Io(String), // String instead of std::io::Error for Clone

    #[error("Channel pool is closed")]
    PoolClosed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("{0}")]
    GoAway(GoAwayError),

    #[error("Health check failed: {0}")]
    PingFailed(String),

    /// Signals that a connection should stop accepting new streams but keep
    /// serving the ones in flight.
    #[error("Connection terminating: {0}")]
    ConnectionTerminating(String),

    #[error("Stream closed")]
    StreamClosed,

    #[error("Channel ({0}) is not a child channel")]
    NotChildChannel(String),

    #[error("Channel ({0}) is not associated with this pool")]
    UnknownChannel(String),

    #[error("Acquire operation took longer than the configured maximum time ({0:?})")]
    AcquireTimeout(Duration),

    #[error("Too many outstanding acquire operations (limit: {0})")]
    TooManyPendingAcquires(usize),

    #[error("Pool close did not complete within {0:?}")]
    CloseTimeout(Duration),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<std::io::Error> for PoolError {
    fn from(err: std::io::Error) -> Self {
        PoolError::Io(err.to_string())
    }
}

impl From<config::ConfigError> for PoolError {
    fn from(err: config::ConfigError) -> Self {
        PoolError::Config(err.to_string())
    }
}

impl PoolError {
    pub fn io(message: impl Into<String>) -> Self {
        PoolError::Io(message.into())
    }

    /// Whether a higher layer may reasonably retry the request on a fresh
    /// channel. Nothing in this crate retries on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PoolError::Io(_)
                | PoolError::GoAway(_)
                | PoolError::PingFailed(_)
                | PoolError::ConnectionTerminating(_)
                | PoolError::StreamClosed
                | PoolError::AcquireTimeout(_)
        )
    }

    /// Whether this error describes the whole parent connection rather than a
    /// single stream or the pool itself.
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            PoolError::Io(_) | PoolError::PingFailed(_) | PoolError::ConnectionTerminating(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, PoolError>;

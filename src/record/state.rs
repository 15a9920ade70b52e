//! Connection record lifecycle state

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of a multiplexed connection. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum RecordState {
    /// Accepting new streams
    Open = 0,
    /// Draining: existing streams continue, no new ones are opened
    ClosedToNew = 1,
    /// Torn down
    Closed = 2,
}

impl RecordState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => RecordState::Open,
            1 => RecordState::ClosedToNew,
            _ => RecordState::Closed,
        }
    }

    /// Check if moving to `next` is a valid transition
    pub fn can_transition_to(&self, next: RecordState) -> bool {
        next > *self
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RecordState::Closed)
    }
}

impl fmt::Display for RecordState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordState::Open => write!(f, "OPEN"),
            RecordState::ClosedToNew => write!(f, "CLOSED_TO_NEW"),
            RecordState::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Lock-free readable state cell. Only the record's task writes it.
#[derive(Debug)]
pub struct AtomicRecordState {
    inner: AtomicU8,
}

impl AtomicRecordState {
    pub fn new() -> Self {
        Self {
            inner: AtomicU8::new(RecordState::Open as u8),
        }
    }

    pub fn load(&self) -> RecordState {
        RecordState::from_u8(self.inner.load(Ordering::Acquire))
    }

    /// Move to `next` if that is a forward transition. Returns the state that
    /// was current before the call.
    pub fn advance(&self, next: RecordState) -> Result<RecordState, RecordState> {
        self.inner
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                RecordState::from_u8(current)
                    .can_transition_to(next)
                    .then_some(next as u8)
            })
            .map(RecordState::from_u8)
            .map_err(RecordState::from_u8)
    }
}

impl Default for AtomicRecordState {
    fn default() -> Self {
        Self::new()
    }
}

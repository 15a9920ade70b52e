//! Per-connection stream accounting
//!
//! A [`ConnectionRecord`] tracks one multiplexed parent connection: how many
//! stream slots are free, which streams are active, and where the connection
//! is in its OPEN -> CLOSED_TO_NEW -> CLOSED lifecycle.
//!
//! The slot counter is the only field touched from outside the record's task;
//! claims take slots with a compare-and-swap. Everything else (the stream
//! registry, lifecycle changes, the idle reaper) is owned by a dedicated task
//! and reached through [`RecordCommand`] messages.

pub mod idle;
pub mod state;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::connection::{CANCEL, ChildStream, ConnectionId, ParentConnection, StreamId};
use crate::error::{GoAwayError, PoolError, Result};
use crate::registry::RecordOwner;
use crate::stream::{MultiplexedStream, OpenedStream};

pub use idle::{ClaimClock, IdleReaper};
pub use state::{AtomicRecordState, RecordState};

/// Bounded number of compare-and-swap attempts per claim. Under heavy
/// contention a claim may report no capacity while a slot is briefly free.
const CLAIM_ATTEMPTS: usize = 5;

/// Identity of the pool that created a record
pub type PoolId = Uuid;

/// State shared between record handles and the record task
struct RecordShared {
    connection: Arc<ParentConnection>,
    owner: PoolId,
    max_streams: u64,
    available: AtomicU64,
    active: AtomicUsize,
    state: AtomicRecordState,
    claims: ClaimClock,
    last_go_away: Mutex<Option<StreamId>>,
    releaser: Mutex<Option<Weak<dyn RecordOwner>>>,
}

impl RecordShared {
    fn release_claim(&self) {
        let previous = self.available.fetch_add(1, Ordering::AcqRel);
        if previous + 1 > self.max_streams {
            warn!(
                "Stream slot count on connection {} was caught attempting to exceed its maximum of {}",
                self.connection, self.max_streams
            );
            self.available.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn closed_message(&self) -> String {
        match self.state.load() {
            RecordState::ClosedToNew => match *self.last_go_away.lock() {
                Some(last) => format!(
                    "Connection {} received GOAWAY with Last Stream ID {}. Unable to open new streams on this connection.",
                    self.connection, last
                ),
                None => format!(
                    "Connection {} is draining. Unable to open new streams on this connection.",
                    self.connection
                ),
            },
            _ => format!(
                "Connection {} was closed while acquiring new stream.",
                self.connection
            ),
        }
    }
}

enum RecordCommand {
    OpenStream {
        reply: oneshot::Sender<Result<OpenedStream>>,
    },
    StreamOpened {
        result: Result<Arc<dyn ChildStream>>,
        reply: oneshot::Sender<Result<OpenedStream>>,
    },
    ReleaseStream {
        id: StreamId,
        done: oneshot::Sender<bool>,
    },
    GoAway {
        error: GoAwayError,
        done: oneshot::Sender<()>,
    },
    CloseToNew {
        done: oneshot::Sender<()>,
    },
    CloseChildren {
        cause: Option<PoolError>,
        done: oneshot::Sender<()>,
    },
}

/// Handle to one multiplexed parent connection's accounting
#[derive(Clone)]
pub struct ConnectionRecord {
    shared: Arc<RecordShared>,
    commands: mpsc::UnboundedSender<RecordCommand>,
}

impl ConnectionRecord {
    /// Create the record and start its task
    pub fn spawn(
        connection: Arc<ParentConnection>,
        max_streams: u32,
        idle_timeout: Option<Duration>,
        owner: PoolId,
    ) -> Self {
        let max_streams = u64::from(max_streams);
        let shared = Arc::new(RecordShared {
            connection,
            owner,
            max_streams,
            available: AtomicU64::new(max_streams),
            active: AtomicUsize::new(0),
            state: AtomicRecordState::new(),
            claims: ClaimClock::new(),
            last_go_away: Mutex::new(None),
            releaser: Mutex::new(None),
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let task = RecordTask {
            shared: shared.clone(),
            commands: rx,
            loopback: tx.downgrade(),
            streams: HashMap::new(),
            reaper: IdleReaper::new(idle_timeout),
        };
        tokio::spawn(task.run());

        Self {
            shared,
            commands: tx,
        }
    }

    pub fn connection(&self) -> &Arc<ParentConnection> {
        &self.shared.connection
    }

    pub fn id(&self) -> ConnectionId {
        self.shared.connection.id()
    }

    pub fn owner(&self) -> PoolId {
        self.shared.owner
    }

    pub fn state(&self) -> RecordState {
        self.shared.state.load()
    }

    pub fn max_streams(&self) -> u64 {
        self.shared.max_streams
    }

    /// Free slots on the counter (claims not yet returned are excluded)
    pub fn available_streams(&self) -> u64 {
        self.shared.available.load(Ordering::Acquire)
    }

    pub fn active_streams(&self) -> usize {
        self.shared.active.load(Ordering::Acquire)
    }

    /// Capacity not taken by registered streams
    pub fn available_concurrency(&self) -> u64 {
        self.shared
            .max_streams
            .saturating_sub(self.active_streams() as u64)
    }

    pub fn last_go_away(&self) -> Option<StreamId> {
        *self.shared.last_go_away.lock()
    }

    /// Pool to hand the parent back to once a drained record returns its
    /// last claim
    pub fn bind_owner(&self, owner: Weak<dyn RecordOwner>) {
        *self.shared.releaser.lock() = Some(owner);
    }

    /// Reserve one stream slot without opening a stream yet
    pub fn claim_stream(&self) -> bool {
        self.shared.claims.touch();
        for _ in 0..CLAIM_ATTEMPTS {
            if self.shared.state.load() != RecordState::Open {
                return false;
            }
            let current = self.shared.available.load(Ordering::Acquire);
            if current == 0 {
                return false;
            }
            if self
                .shared
                .available
                .compare_exchange(current, current - 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
        false
    }

    /// Open a stream on a slot taken by [`claim_stream`](Self::claim_stream).
    /// The claim is returned to the counter if the open fails.
    pub async fn acquire_claimed_stream(&self) -> Result<MultiplexedStream> {
        let (reply, response) = oneshot::channel();
        if self.commands.send(RecordCommand::OpenStream { reply }).is_err() {
            self.shared.release_claim();
            return Err(PoolError::io(self.shared.closed_message()));
        }

        let opened = response
            .await
            .map_err(|_| PoolError::io(self.shared.closed_message()))??;
        Ok(MultiplexedStream::new(self.clone(), opened))
    }

    /// Claim a slot and open a stream on it. `None` if no slot was free.
    pub async fn acquire_stream(&self) -> Option<Result<MultiplexedStream>> {
        if !self.claim_stream() {
            return None;
        }
        Some(self.acquire_claimed_stream().await)
    }

    /// Close and unregister a stream, returning its slot
    pub async fn release_stream(&self, stream: MultiplexedStream) -> bool {
        let id = stream.id();
        drop(stream);
        let (done, ack) = oneshot::channel();
        if self.commands.send(RecordCommand::ReleaseStream { id, done }).is_err() {
            return false;
        }
        ack.await.unwrap_or(false)
    }

    /// Stop new streams and fail the ones above the peer's last stream id
    pub async fn handle_go_away(&self, error: GoAwayError) {
        let (done, ack) = oneshot::channel();
        if self.commands.send(RecordCommand::GoAway { error, done }).is_ok() {
            let _ = ack.await;
        }
    }

    /// Stop accepting new streams; in-flight streams keep running
    pub async fn close_to_new_streams(&self) {
        let (done, ack) = oneshot::channel();
        if self.commands.send(RecordCommand::CloseToNew { done }).is_ok() {
            let _ = ack.await;
        }
    }

    /// Move to CLOSED and force every tracked stream closed, delivering
    /// `cause` to them when one is given
    pub async fn close_child_channels(&self, cause: Option<PoolError>) {
        let (done, ack) = oneshot::channel();
        if self
            .commands
            .send(RecordCommand::CloseChildren { cause, done })
            .is_ok()
        {
            let _ = ack.await;
        }
    }

    /// Draining or closed, with every slot returned
    pub fn can_be_closed_and_released(&self) -> bool {
        self.state() != RecordState::Open
            && self.available_streams() == self.shared.max_streams
    }
}

impl fmt::Debug for ConnectionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRecord")
            .field("connection", &self.id())
            .field("state", &self.state())
            .field("max_streams", &self.max_streams())
            .field("available", &self.available_streams())
            .field("active", &self.active_streams())
            .finish()
    }
}

struct ActiveStream {
    child: Arc<dyn ChildStream>,
    failure: watch::Sender<Option<PoolError>>,
}

impl ActiveStream {
    fn fail(&self, cause: PoolError) {
        self.child.reset(CANCEL);
        self.failure.send_replace(Some(cause));
    }
}

enum Step {
    Command(Option<RecordCommand>),
    IdleCheck,
}

/// Single writer for a record's registry and lifecycle
struct RecordTask {
    shared: Arc<RecordShared>,
    commands: mpsc::UnboundedReceiver<RecordCommand>,
    loopback: mpsc::WeakUnboundedSender<RecordCommand>,
    streams: HashMap<StreamId, ActiveStream>,
    reaper: IdleReaper,
}

impl RecordTask {
    async fn run(mut self) {
        loop {
            let step = tokio::select! {
                command = self.commands.recv() => Step::Command(command),
                _ = self.reaper.tick() => Step::IdleCheck,
            };

            match step {
                Step::Command(Some(command)) => self.handle(command),
                Step::Command(None) => break,
                Step::IdleCheck => self.close_if_idle(),
            }
        }
        trace!("Record task for connection {} stopped", self.shared.connection);
    }

    fn handle(&mut self, command: RecordCommand) {
        match command {
            RecordCommand::OpenStream { reply } => self.open_stream(reply),
            RecordCommand::StreamOpened { result, reply } => self.stream_opened(result, reply),
            RecordCommand::ReleaseStream { id, done } => {
                let _ = done.send(self.unregister(id));
            }
            RecordCommand::GoAway { error, done } => {
                self.go_away(error);
                let _ = done.send(());
            }
            RecordCommand::CloseToNew { done } => {
                if self.shared.state.advance(RecordState::ClosedToNew).is_ok() {
                    debug!("Connection {} closed to new streams", self.shared.connection);
                }
                let _ = done.send(());
            }
            RecordCommand::CloseChildren { cause, done } => {
                self.close_children(cause);
                let _ = done.send(());
            }
        }
    }

    fn open_stream(&mut self, reply: oneshot::Sender<Result<OpenedStream>>) {
        if self.shared.state.load() != RecordState::Open {
            let message = self.shared.closed_message();
            warn!("{}", message);
            self.shared.release_claim();
            let _ = reply.send(Err(PoolError::io(message)));
            self.release_if_drained();
            return;
        }

        let shared = self.shared.clone();
        let loopback = self.loopback.clone();
        tokio::spawn(async move {
            let result = shared.connection.transport().open_stream().await;
            let command = RecordCommand::StreamOpened { result, reply };
            let undelivered = match loopback.upgrade() {
                Some(tx) => tx.send(command).err().map(|err| err.0),
                None => Some(command),
            };
            // The record task is gone; undo the claim here.
            if let Some(RecordCommand::StreamOpened { result, reply }) = undelivered {
                if let Ok(child) = result {
                    child.close();
                }
                shared.release_claim();
                let _ = reply.send(Err(PoolError::io(shared.closed_message())));
            }
        });
    }

    fn stream_opened(
        &mut self,
        result: Result<Arc<dyn ChildStream>>,
        reply: oneshot::Sender<Result<OpenedStream>>,
    ) {
        let child = match result {
            Ok(child) => child,
            Err(err) => {
                debug!("Failed to open stream on connection {}: {}", self.shared.connection, err);
                self.shared.release_claim();
                let _ = reply.send(Err(err));
                self.release_if_drained();
                return;
            }
        };

        let id = child.id();
        let refused = match self.shared.state.load() {
            RecordState::Open => false,
            RecordState::ClosedToNew => self.last_go_away().is_some_and(|last| id > last),
            RecordState::Closed => true,
        };
        if refused {
            child.close();
            self.shared.release_claim();
            let _ = reply.send(Err(PoolError::io(self.shared.closed_message())));
            self.release_if_drained();
            return;
        }

        let (failure, watcher) = watch::channel(None);
        self.streams.insert(
            id,
            ActiveStream {
                child: child.clone(),
                failure,
            },
        );
        self.sync_active();

        if reply
            .send(Ok(OpenedStream {
                child,
                failure: watcher,
            }))
            .is_err()
        {
            debug!(
                "Acquire for stream {} on connection {} was abandoned; releasing it",
                id, self.shared.connection
            );
            self.unregister(id);
            return;
        }

        self.reaper.ensure_started();
    }

    fn unregister(&mut self, id: StreamId) -> bool {
        match self.streams.remove(&id) {
            Some(stream) => {
                stream.child.close();
                self.sync_active();
                self.shared.release_claim();
                self.release_if_drained();
                true
            }
            None => {
                warn!(
                    "Stream {} is not registered on connection {}",
                    id, self.shared.connection
                );
                false
            }
        }
    }

    fn go_away(&mut self, error: GoAwayError) {
        let last = error.last_stream_id;
        *self.shared.last_go_away.lock() = Some(last);

        if self.shared.state.load() == RecordState::Closed {
            return;
        }
        let _ = self.shared.state.advance(RecordState::ClosedToNew);

        let mut failed = 0;
        for (id, stream) in &self.streams {
            if *id > last {
                stream.fail(PoolError::GoAway(error.clone()));
                failed += 1;
            }
        }
        warn!(
            "Connection {} received GOAWAY (last stream {}, error code {}); failed {} of {} active streams",
            self.shared.connection,
            last,
            error.error_code,
            failed,
            self.streams.len()
        );
    }

    fn close_children(&mut self, cause: Option<PoolError>) {
        if self.shared.state.advance(RecordState::Closed).is_err() {
            return;
        }
        self.reaper.stop();

        debug!(
            "Closing {} streams on connection {}",
            self.streams.len(),
            self.shared.connection
        );
        for stream in self.streams.values() {
            match &cause {
                Some(cause) => stream.fail(cause.clone()),
                None => {
                    stream.child.close();
                    stream.failure.send_replace(Some(PoolError::StreamClosed));
                }
            }
        }
    }

    fn close_if_idle(&mut self) {
        if self.shared.state.load() == RecordState::Closed {
            self.reaper.stop();
            return;
        }
        if !self.streams.is_empty() {
            return;
        }
        if !self.reaper.is_expired(&self.shared.claims) {
            return;
        }
        // A claim that wins this race keeps the connection alive until the next tick.
        let max = self.shared.max_streams;
        if self
            .shared
            .available
            .compare_exchange(max, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        self.reaper.stop();
        let _ = self.shared.state.advance(RecordState::Closed);
        debug!(
            "Connection {} has been idle for {:?} and will be shut down",
            self.shared.connection,
            self.shared.claims.idle_for()
        );
        self.shared.connection.close();
    }

    fn last_go_away(&self) -> Option<StreamId> {
        *self.shared.last_go_away.lock()
    }

    /// A claim returned after GOAWAY or a drain can be the last one out, with
    /// nobody left to notice; release the parent from here in that case.
    fn release_if_drained(&self) {
        if self.shared.state.load() != RecordState::ClosedToNew
            || self.shared.available.load(Ordering::Acquire) != self.shared.max_streams
        {
            return;
        }
        let Some(owner) = self.shared.releaser.lock().as_ref().and_then(Weak::upgrade) else {
            return;
        };

        let connection = self.shared.connection.clone();
        debug!("Connection {} is drained with no streams left; releasing it", connection);
        tokio::spawn(async move {
            if let Err(err) = owner.close_and_release_parent(connection.clone(), None).await {
                warn!("Failed to release drained connection {}: {}", connection, err);
            }
        });
    }

    fn sync_active(&self) {
        self.shared.active.store(self.streams.len(), Ordering::Release);
    }
}

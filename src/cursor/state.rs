use std::fmt;
use std::time::Duration;

use tracing::trace;

use crate::command::CursorId;

/// Lifecycle of a batch cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    /// Created from the aggregate reply; nothing handed out yet
    Fresh,

    /// A `getMore` is outstanding
    Fetching,

    /// Last reply installed; cursor still open on the server
    IdleWithBuffer,

    /// Server reported cursor id zero
    Exhausted,

    /// Closed by the caller or by a fatal error
    Closed,
}

impl CursorState {
    /// Exhausted and Closed never leave their state
    pub fn is_terminal(&self) -> bool {
        matches!(self, CursorState::Exhausted | CursorState::Closed)
    }
}

impl fmt::Display for CursorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CursorState::Fresh => "fresh",
            CursorState::Fetching => "fetching",
            CursorState::IdleWithBuffer => "idle",
            CursorState::Exhausted => "exhausted",
            CursorState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// What to do with a reply that carried no documents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwaitDecision {
    /// Hand the reply to the consumer
    Surface,

    /// Issue another `getMore` without surfacing anything
    Retry,
}

/// Decides when a cursor fetches and when it stops
///
/// Owned by exactly one cursor, so it carries no locking of its own. The
/// `Fetching` state doubles as the single-outstanding-request flag.
#[derive(Debug)]
pub struct CursorStateMachine {
    state: CursorState,
    cursor_id: CursorId,
    max_await_time: Option<Duration>,

    /// Server wait accumulated by the current pull
    pull_elapsed: Duration,

    batches_received: u64,
    documents_received: u64,
}

impl CursorStateMachine {
    /// Create a state machine for a cursor seeded by the aggregate reply
    ///
    /// # Arguments
    /// * `cursor_id` - Id from the aggregate reply
    /// * `max_await_time` - Await budget per pull; `None` disables await retries
    pub fn new(cursor_id: CursorId, max_await_time: Option<Duration>) -> Self {
        Self {
            state: CursorState::Fresh,
            cursor_id,
            max_await_time: max_await_time.filter(|d| !d.is_zero()),
            pull_elapsed: Duration::ZERO,
            batches_received: 1,
            documents_received: 0,
        }
    }

    pub fn state(&self) -> CursorState {
        self.state
    }

    pub fn cursor_id(&self) -> CursorId {
        self.cursor_id
    }

    pub fn batches_received(&self) -> u64 {
        self.batches_received
    }

    pub fn documents_received(&self) -> u64 {
        self.documents_received
    }

    /// Whether a `getMore` is needed to serve the next pull
    pub fn should_fetch(&self, buffer_empty: bool) -> bool {
        buffer_empty
            && self.cursor_id.is_open()
            && matches!(
                self.state,
                CursorState::Fresh | CursorState::IdleWithBuffer
            )
    }

    /// Start a consumer pull; resets the await budget
    pub fn begin_pull(&mut self) {
        self.pull_elapsed = Duration::ZERO;
    }

    /// Record that the seeded first batch was handed out
    pub fn first_batch_delivered(&mut self, count: usize) {
        self.documents_received += count as u64;
        if self.state == CursorState::Fresh {
            self.transition(self.state_for_id());
        }
    }

    /// Settle a Fresh cursor whose seed carried nothing and no open id
    pub fn settle_empty_seed(&mut self) {
        if self.state == CursorState::Fresh && !self.cursor_id.is_open() {
            self.transition(CursorState::Exhausted);
        }
    }

    /// Enter `Fetching` and return the id to send the `getMore` for
    pub fn begin_fetch(&mut self) -> CursorId {
        self.transition(CursorState::Fetching);
        self.cursor_id
    }

    /// Apply a successful `getMore` reply
    ///
    /// # Arguments
    /// * `new_id` - Cursor id carried by the reply
    /// * `batch_len` - Number of documents in the reply
    /// * `elapsed` - Round-trip time of the reply
    ///
    /// # Returns
    /// * `AwaitDecision` - `Retry` when the batch was empty, the cursor is still
    ///   open and the await budget of this pull is not yet spent
    pub fn on_response(
        &mut self,
        new_id: CursorId,
        batch_len: usize,
        elapsed: Duration,
    ) -> AwaitDecision {
        self.cursor_id = new_id;
        self.batches_received += 1;
        self.documents_received += batch_len as u64;
        self.pull_elapsed += elapsed;
        self.transition(self.state_for_id());

        if batch_len > 0 || !new_id.is_open() {
            return AwaitDecision::Surface;
        }

        match self.max_await_time {
            Some(budget) if self.pull_elapsed < budget => {
                trace!(
                    "Empty batch after {:?} of {:?} await budget; fetching again",
                    self.pull_elapsed, budget
                );
                AwaitDecision::Retry
            }
            _ => AwaitDecision::Surface,
        }
    }

    /// Apply a failed `getMore`
    ///
    /// # Returns
    /// * `Option<CursorId>` - Id that still needs a kill notification
    pub fn on_failure(&mut self) -> Option<CursorId> {
        self.close()
    }

    /// Close the cursor; idempotent
    ///
    /// # Returns
    /// * `Option<CursorId>` - Id to kill, only on the first close of an open cursor
    pub fn close(&mut self) -> Option<CursorId> {
        if self.state == CursorState::Closed {
            return None;
        }

        let was_exhausted = self.state == CursorState::Exhausted;
        self.transition(CursorState::Closed);

        let id = std::mem::replace(&mut self.cursor_id, CursorId::EXHAUSTED);
        if was_exhausted || !id.is_open() {
            None
        } else {
            Some(id)
        }
    }

    fn state_for_id(&self) -> CursorState {
        if self.cursor_id.is_open() {
            CursorState::IdleWithBuffer
        } else {
            CursorState::Exhausted
        }
    }

    fn transition(&mut self, next: CursorState) {
        if self.state != next {
            trace!("Cursor {} state {} -> {}", self.cursor_id, self.state, next);
            self.state = next;
        }
    }
}

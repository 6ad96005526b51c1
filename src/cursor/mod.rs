//! Asynchronous batch cursor
//!
//! This module provides the engine that hands out the results of an
//! aggregation batch by batch:
//! - `BatchBuffer` holds the documents of one server reply
//! - `CursorStateMachine` decides when to fetch and when to stop
//! - `AsyncBatchCursor` drives both, issuing `getMore` commands over a
//!   shared [`WireChannel`] and serializing concurrent callers
//! - `DocumentCursor` yields the same results one document at a time
//!
//! A cursor never has more than one command in flight. Closing it is safe at
//! any time, including while a `next()` is waiting on the server: the late
//! reply is discarded and the waiting caller sees end-of-stream.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use bson::Document;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::WireChannel;
use crate::command::{
    CursorId, CursorResponse, MAX_BATCH_SIZE, Namespace, check_batch_size, get_more_command,
    kill_cursors_command,
};
use crate::error::{AggError, Result, TransportError};

pub mod buffer;
pub mod state;
pub mod stream;

pub use buffer::BatchBuffer;
pub use state::{AwaitDecision, CursorState, CursorStateMachine};
pub use stream::DocumentCursor;

/// Settings a cursor snapshots when it is created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorOptions {
    /// Documents requested per `getMore`; `None` lets the server choose
    pub batch_size: Option<u32>,

    /// Await budget for empty replies on an open cursor
    pub max_await_time: Option<Duration>,

    /// Retry a `getMore` once after a retryable transport error
    pub retry_get_more: bool,

    /// Send `killCursors` when an open cursor is closed
    pub kill_on_close: bool,
}

impl Default for CursorOptions {
    fn default() -> Self {
        Self {
            batch_size: None,
            max_await_time: None,
            retry_get_more: true,
            kill_on_close: true,
        }
    }
}

/// Fires best-effort `killCursors` notifications
#[derive(Clone)]
struct KillNotifier {
    channel: Arc<dyn WireChannel>,
    namespace: Namespace,
    enabled: bool,
}

impl KillNotifier {
    /// Spawn the kill command on the current runtime; never waits for it
    fn notify(&self, cursor_id: CursorId) {
        if !self.enabled {
            debug!("Cursor {} left to expire on the server", cursor_id);
            return;
        }

        if !self.channel.is_usable() {
            debug!("Channel unusable, not killing cursor {}", cursor_id);
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("No runtime available to kill cursor {}", cursor_id);
            return;
        };

        let channel = Arc::clone(&self.channel);
        let namespace = self.namespace.clone();

        handle.spawn(async move {
            let command = kill_cursors_command(&namespace, cursor_id);
            match channel.send(&namespace.database, command).await {
                Ok(_) => debug!("Killed cursor {} on {}", cursor_id, namespace),
                // Ignore result - we tried our best
                Err(e) => debug!("killCursors for cursor {} failed: {}", cursor_id, e),
            }
        });
    }
}

/// A `getMore` running on its own task
///
/// Owned by the cursor rather than by the caller, so a caller that stops
/// waiting leaves the reply for the next pull instead of losing it.
#[derive(Debug)]
struct PendingGetMore {
    cursor_id: CursorId,
    started: Instant,
    handle: JoinHandle<Result<Document>>,
}

/// State guarded by the cursor's mutex
#[derive(Debug)]
struct CursorCore {
    state: CursorStateMachine,
    buffer: BatchBuffer,
    post_batch_resume_token: Option<Document>,
    pending: Option<PendingGetMore>,
}

impl CursorCore {
    fn shutdown(&mut self, killer: &KillNotifier) {
        if let Some(pending) = self.pending.take() {
            pending.handle.abort();
        }
        if let Some(cursor_id) = self.state.close() {
            killer.notify(cursor_id);
        }
        self.buffer.clear();
    }
}

/// Batch-at-a-time cursor over an aggregation result
///
/// `next()` takes `&self`, so the cursor can be shared behind an `Arc`;
/// concurrent calls queue on an async mutex and run one at a time.
pub struct AsyncBatchCursor {
    core: Arc<Mutex<CursorCore>>,
    channel: Arc<dyn WireChannel>,
    namespace: Namespace,
    killer: KillNotifier,
    cancel: CancellationToken,

    /// Batch size for future `getMore`s; zero means unset
    batch_size: AtomicU32,

    max_await_time: Option<Duration>,
    retry_get_more: bool,
}

impl AsyncBatchCursor {
    /// Create a cursor seeded with the reply of the initial command
    ///
    /// # Arguments
    /// * `channel` - Channel for `getMore` and `killCursors`
    /// * `namespace` - Namespace the command ran against; a namespace reported
    ///   in `first` takes precedence
    /// * `first` - Parsed reply of the aggregate command
    /// * `options` - Settings snapshot for this cursor
    pub fn new(
        channel: Arc<dyn WireChannel>,
        namespace: Namespace,
        first: CursorResponse,
        options: CursorOptions,
    ) -> Self {
        let namespace = first.namespace.unwrap_or(namespace);
        let max_await_time = options.max_await_time.filter(|d| !d.is_zero());

        let mut buffer = BatchBuffer::new();
        debug!(
            "Opening cursor {} on {} with first batch of {} documents",
            first.id,
            namespace,
            first.batch.len()
        );
        buffer.install(first.batch);

        let killer = KillNotifier {
            channel: Arc::clone(&channel),
            namespace: namespace.clone(),
            enabled: options.kill_on_close,
        };

        Self {
            core: Arc::new(Mutex::new(CursorCore {
                state: CursorStateMachine::new(first.id, max_await_time),
                buffer,
                post_batch_resume_token: first.post_batch_resume_token,
                pending: None,
            })),
            channel,
            namespace,
            killer,
            cancel: CancellationToken::new(),
            batch_size: AtomicU32::new(options.batch_size.unwrap_or(0).min(MAX_BATCH_SIZE)),
            max_await_time,
            retry_get_more: options.retry_get_more,
        }
    }

    /// Fetch the next batch
    ///
    /// # Returns
    /// * `Ok(Some(batch))` - The next batch; may be empty for await-data
    ///   cursors whose await budget ran out
    /// * `Ok(None)` - End of stream; returned on every call once the cursor is
    ///   exhausted or closed
    /// * `Err(...)` - A failure, delivered to this caller only; the cursor is
    ///   closed afterwards
    pub async fn next(&self) -> Result<Option<Vec<Document>>> {
        let mut core = self.core.lock().await;

        if self.cancel.is_cancelled() {
            core.shutdown(&self.killer);
            return Ok(None);
        }

        // A getMore left behind by a caller that stopped waiting is resumed
        if core.pending.is_none() {
            if !core.buffer.is_empty() {
                let batch = core.buffer.drain_all();
                if core.state.state() == CursorState::Fresh {
                    core.state.first_batch_delivered(batch.len());
                }
                return Ok(Some(batch));
            }

            core.state.settle_empty_seed();
            if !core.state.should_fetch(true) {
                return Ok(None);
            }

            core.state.begin_pull();
        }

        let mut retried = false;

        loop {
            let pending = match core.pending.take() {
                Some(pending) => core.pending.insert(pending),
                None => {
                    let cursor_id = core.state.begin_fetch();
                    let fetch = self.spawn_get_more(cursor_id);
                    core.pending.insert(fetch)
                }
            };
            let cursor_id = pending.cursor_id;
            let started = pending.started;

            let reply = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                joined = &mut pending.handle => Some(joined),
            };
            let reply = reply.map(|joined| {
                joined.unwrap_or_else(|e| {
                    Err(AggError::Transport(TransportError::fatal(format!(
                        "getMore task failed: {}",
                        e
                    ))))
                })
            });
            if reply.is_some() {
                core.pending = None;
            }

            let outcome = match reply {
                Some(reply) if !self.cancel.is_cancelled() => {
                    reply.and_then(|doc| CursorResponse::parse(&doc))
                }
                _ => {
                    debug!(
                        "Cursor {} closed while getMore was outstanding; discarding reply",
                        cursor_id
                    );
                    core.shutdown(&self.killer);
                    return Ok(None);
                }
            };

            match outcome {
                Ok(response) => {
                    let count = response.batch.len();
                    let decision = core.state.on_response(response.id, count, started.elapsed());
                    if response.post_batch_resume_token.is_some() {
                        core.post_batch_resume_token = response.post_batch_resume_token;
                    }
                    core.buffer.install(response.batch);
                    debug!(
                        "Fetched batch of {} documents for cursor {} (total: {})",
                        count,
                        cursor_id,
                        core.state.documents_received()
                    );

                    if decision == AwaitDecision::Retry {
                        continue;
                    }

                    if core.buffer.is_empty() && core.state.state() == CursorState::Exhausted {
                        debug!("Cursor {} exhausted", cursor_id);
                        return Ok(None);
                    }

                    return Ok(Some(core.buffer.drain_all()));
                }
                Err(err) if err.is_retryable() && self.retry_get_more && !retried => {
                    warn!(
                        "getMore for cursor {} failed, retrying once: {}",
                        cursor_id, err
                    );
                    retried = true;
                }
                Err(err) => {
                    warn!("getMore for cursor {} failed: {}", cursor_id, err);
                    self.cancel.cancel();
                    let orphan = core.state.on_failure();
                    core.buffer.clear();

                    // The server already dropped a cursor it reports as not found
                    if let Some(id) = orphan.filter(|_| !matches!(err, AggError::CursorClosed(_))) {
                        self.killer.notify(id);
                    }
                    return Err(err);
                }
            }
        }
    }

    fn spawn_get_more(&self, cursor_id: CursorId) -> PendingGetMore {
        let command = get_more_command(
            &self.namespace,
            cursor_id,
            self.batch_size(),
            self.max_await_time,
        );
        debug!("Issuing getMore for cursor {} on {}", cursor_id, self.namespace);

        let channel = Arc::clone(&self.channel);
        let database = self.namespace.database.clone();
        PendingGetMore {
            cursor_id,
            started: Instant::now(),
            handle: tokio::spawn(async move { channel.send(&database, command).await }),
        }
    }

    /// Change the batch size of future `getMore`s
    ///
    /// A `getMore` already in flight keeps the size it was sent with. Zero
    /// restores the server default.
    ///
    /// # Returns
    /// * `Result<()>` - `InvalidArgument` above [`MAX_BATCH_SIZE`]; the
    ///   current size is kept
    pub fn set_batch_size(&self, batch_size: u32) -> Result<()> {
        check_batch_size(batch_size)?;
        self.batch_size.store(batch_size, Ordering::SeqCst);
        Ok(())
    }

    /// Batch size used for the next `getMore`
    pub fn batch_size(&self) -> Option<u32> {
        match self.batch_size.load(Ordering::SeqCst) {
            0 => None,
            n => Some(n),
        }
    }

    /// Close the cursor
    ///
    /// Idempotent and non-blocking. An outstanding `next()` returns
    /// end-of-stream instead of its reply. If the server still holds the
    /// cursor a `killCursors` is sent in the background.
    pub fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }

        info!("Closing cursor on {}", self.namespace);
        self.cancel.cancel();

        match self.core.try_lock() {
            Ok(mut core) => core.shutdown(&self.killer),
            Err(_) => {
                // A pull holds the lock; it observes the cancellation, and
                // this task settles the state if the pull finished first.
                let Ok(handle) = tokio::runtime::Handle::try_current() else {
                    return;
                };
                let core = Arc::clone(&self.core);
                let killer = self.killer.clone();
                handle.spawn(async move {
                    core.lock().await.shutdown(&killer);
                });
            }
        }
    }

    /// Whether the cursor was closed, by the caller or by a failure
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Current lifecycle state
    pub async fn state(&self) -> CursorState {
        self.core.lock().await.state.state()
    }

    /// Whether the server reported the last batch
    pub async fn is_exhausted(&self) -> bool {
        self.state().await == CursorState::Exhausted
    }

    /// Current server cursor id; zero once exhausted or closed
    pub async fn cursor_id(&self) -> CursorId {
        self.core.lock().await.state.cursor_id()
    }

    /// Resume token reported with the most recent batch
    pub async fn post_batch_resume_token(&self) -> Option<Document> {
        self.core.lock().await.post_batch_resume_token.clone()
    }

    /// Namespace the cursor iterates
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Await budget per pull, if the cursor waits for data
    pub fn max_await_time(&self) -> Option<Duration> {
        self.max_await_time
    }
}

impl Drop for AsyncBatchCursor {
    fn drop(&mut self) {
        if !self.cancel.is_cancelled() {
            debug!("AsyncBatchCursor dropped without explicit close");
            self.close();
        }
    }
}

impl std::fmt::Debug for AsyncBatchCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncBatchCursor")
            .field("namespace", &self.namespace)
            .field("batch_size", &self.batch_size())
            .field("max_await_time", &self.max_await_time)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CURSOR_NOT_FOUND, CommandError, TransportError};
    use crate::testing::{ScriptedChannel, Step, cursor_reply, wait_for_command};
    use bson::doc;

    fn ns() -> Namespace {
        Namespace::new("shop", "orders")
    }

    fn open_cursor(
        channel: &Arc<ScriptedChannel>,
        id: i64,
        first: Vec<Document>,
        options: CursorOptions,
    ) -> AsyncBatchCursor {
        let reply = cursor_reply(id, first, true);
        let response = CursorResponse::parse(&reply).unwrap();
        AsyncBatchCursor::new(channel.clone(), ns(), response, options)
    }

    #[tokio::test]
    async fn test_inline_result_exhausts_without_get_more() {
        let channel = Arc::new(ScriptedChannel::new());
        let cursor = open_cursor(
            &channel,
            0,
            vec![doc! { "_id": 1 }, doc! { "_id": 2 }],
            CursorOptions::default(),
        );

        let batch = cursor.next().await.unwrap();
        assert_eq!(batch, Some(vec![doc! { "_id": 1 }, doc! { "_id": 2 }]));
        assert_eq!(cursor.state().await, CursorState::Exhausted);

        assert_eq!(cursor.next().await.unwrap(), None);
        assert_eq!(cursor.next().await.unwrap(), None);
        assert!(channel.commands().is_empty());
    }

    #[tokio::test]
    async fn test_get_more_until_exhausted() {
        let channel = Arc::new(
            ScriptedChannel::new()
                .reply(cursor_reply(42, vec![doc! { "_id": 2 }, doc! { "_id": 3 }], false))
                .reply(cursor_reply(0, vec![doc! { "_id": 4 }], false)),
        );
        let cursor = open_cursor(
            &channel,
            42,
            vec![doc! { "_id": 1 }],
            CursorOptions {
                batch_size: Some(2),
                ..Default::default()
            },
        );

        assert_eq!(cursor.next().await.unwrap(), Some(vec![doc! { "_id": 1 }]));
        assert_eq!(cursor.state().await, CursorState::IdleWithBuffer);
        assert_eq!(
            cursor.next().await.unwrap(),
            Some(vec![doc! { "_id": 2 }, doc! { "_id": 3 }])
        );

        cursor.set_batch_size(7).unwrap();
        assert_eq!(cursor.next().await.unwrap(), Some(vec![doc! { "_id": 4 }]));
        assert_eq!(cursor.next().await.unwrap(), None);
        assert!(cursor.is_exhausted().await);
        assert_eq!(cursor.cursor_id().await, CursorId::EXHAUSTED);

        let get_mores = channel.commands_named("getMore");
        assert_eq!(
            get_mores,
            vec![
                doc! { "getMore": 42i64, "collection": "orders", "batchSize": 2 },
                doc! { "getMore": 42i64, "collection": "orders", "batchSize": 7 },
            ]
        );
        assert!(channel.commands_named("killCursors").is_empty());
    }

    #[tokio::test]
    async fn test_empty_seed_with_open_cursor_fetches_on_first_pull() {
        let channel =
            Arc::new(ScriptedChannel::new().reply(cursor_reply(0, vec![doc! { "_id": 1 }], false)));
        let cursor = open_cursor(&channel, 42, vec![], CursorOptions::default());

        assert_eq!(cursor.state().await, CursorState::Fresh);
        assert_eq!(cursor.next().await.unwrap(), Some(vec![doc! { "_id": 1 }]));
        assert_eq!(channel.commands_named("getMore").len(), 1);
    }

    #[tokio::test]
    async fn test_empty_seed_with_zero_id_is_end_of_stream() {
        let channel = Arc::new(ScriptedChannel::new());
        let cursor = open_cursor(&channel, 0, vec![], CursorOptions::default());

        assert_eq!(cursor.next().await.unwrap(), None);
        assert_eq!(cursor.state().await, CursorState::Exhausted);
        assert!(channel.commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_data_retries_until_budget_spent() {
        let channel = Arc::new(
            ScriptedChannel::new()
                .step(Step::ok(cursor_reply(42, vec![], false)).delay(Duration::from_millis(50)))
                .step(Step::ok(cursor_reply(42, vec![], false)).delay(Duration::from_millis(60))),
        );
        let cursor = open_cursor(
            &channel,
            42,
            vec![doc! { "_id": 1 }],
            CursorOptions {
                max_await_time: Some(Duration::from_millis(100)),
                ..Default::default()
            },
        );

        assert_eq!(cursor.next().await.unwrap(), Some(vec![doc! { "_id": 1 }]));

        // First empty reply comes back under budget and is not surfaced
        assert_eq!(cursor.next().await.unwrap(), Some(vec![]));

        let get_mores = channel.commands_named("getMore");
        assert_eq!(get_mores.len(), 2);
        for command in get_mores {
            assert_eq!(command.get_i64("maxTimeMS").unwrap(), 100);
        }
        assert_eq!(cursor.state().await, CursorState::IdleWithBuffer);
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_data_surfaces_documents_after_retry() {
        let channel = Arc::new(
            ScriptedChannel::new()
                .step(Step::ok(cursor_reply(42, vec![], false)).delay(Duration::from_millis(50)))
                .step(
                    Step::ok(cursor_reply(42, vec![doc! { "_id": 9 }], false))
                        .delay(Duration::from_millis(20)),
                ),
        );
        let cursor = open_cursor(
            &channel,
            42,
            vec![],
            CursorOptions {
                max_await_time: Some(Duration::from_millis(100)),
                ..Default::default()
            },
        );

        assert_eq!(cursor.next().await.unwrap(), Some(vec![doc! { "_id": 9 }]));
        assert_eq!(channel.commands_named("getMore").len(), 2);
    }

    #[tokio::test]
    async fn test_empty_batch_without_await_budget_is_surfaced() {
        let channel = Arc::new(ScriptedChannel::new().reply(cursor_reply(42, vec![], false)));
        let cursor = open_cursor(&channel, 42, vec![doc! { "_id": 1 }], CursorOptions::default());

        cursor.next().await.unwrap();
        assert_eq!(cursor.next().await.unwrap(), Some(vec![]));
        assert_eq!(channel.commands_named("getMore").len(), 1);
        assert!(!channel.commands_named("getMore")[0].contains_key("maxTimeMS"));
    }

    #[tokio::test]
    async fn test_close_while_get_more_outstanding() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let channel = Arc::new(
            ScriptedChannel::new()
                .step(Step::ok(cursor_reply(42, vec![doc! { "_id": 2 }], false)).gated(gate.clone())),
        );
        let cursor = Arc::new(open_cursor(
            &channel,
            42,
            vec![doc! { "_id": 1 }],
            CursorOptions::default(),
        ));
        cursor.next().await.unwrap();

        let pending = {
            let cursor = cursor.clone();
            tokio::spawn(async move { cursor.next().await })
        };
        channel.wait_for_request().await;

        cursor.close();
        gate.notify_one();

        assert_eq!(pending.await.unwrap().unwrap(), None);
        assert_eq!(cursor.next().await.unwrap(), None);
        assert_eq!(cursor.state().await, CursorState::Closed);

        let kills = wait_for_command(&channel, "killCursors").await;
        assert_eq!(kills, vec![doc! { "killCursors": "orders", "cursors": [42i64] }]);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let channel = Arc::new(ScriptedChannel::new());
        let cursor = open_cursor(&channel, 42, vec![doc! { "_id": 1 }], CursorOptions::default());

        cursor.close();
        cursor.close();
        cursor.close();
        assert!(cursor.is_closed());

        for _ in 0..3 {
            assert_eq!(cursor.next().await.unwrap(), None);
        }

        let kills = wait_for_command(&channel, "killCursors").await;
        assert_eq!(kills.len(), 1);
        assert!(channel.commands_named("getMore").is_empty());
    }

    #[tokio::test]
    async fn test_close_after_exhaustion_sends_no_kill() {
        let channel = Arc::new(ScriptedChannel::new());
        let cursor = open_cursor(&channel, 0, vec![doc! { "_id": 1 }], CursorOptions::default());

        cursor.next().await.unwrap();
        cursor.close();
        tokio::task::yield_now().await;

        assert!(channel.commands().is_empty());
        assert_eq!(cursor.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_kill_disabled_by_options() {
        let channel = Arc::new(ScriptedChannel::new());
        let cursor = open_cursor(
            &channel,
            42,
            vec![],
            CursorOptions {
                kill_on_close: false,
                ..Default::default()
            },
        );

        cursor.close();
        tokio::task::yield_now().await;
        assert!(channel.commands().is_empty());
    }

    #[tokio::test]
    async fn test_unusable_channel_skips_kill() {
        let channel = Arc::new(ScriptedChannel::new());
        channel.set_usable(false);
        let cursor = open_cursor(&channel, 42, vec![], CursorOptions::default());

        cursor.close();
        tokio::task::yield_now().await;
        assert!(channel.commands().is_empty());
    }

    #[tokio::test]
    async fn test_drop_without_close_kills_cursor() {
        let channel = Arc::new(ScriptedChannel::new());
        let cursor = open_cursor(&channel, 42, vec![doc! { "_id": 1 }], CursorOptions::default());
        drop(cursor);

        let kills = wait_for_command(&channel, "killCursors").await;
        assert_eq!(kills.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_next_is_serialized() {
        let mut channel = ScriptedChannel::new();
        for i in 1..=5i64 {
            let id = if i == 5 { 0 } else { 42 };
            channel = channel.step(
                Step::ok(cursor_reply(id, vec![doc! { "_id": i }], false))
                    .delay(Duration::from_millis(5)),
            );
        }
        let channel = Arc::new(channel);
        let cursor = Arc::new(open_cursor(
            &channel,
            42,
            vec![doc! { "_id": 0i64 }],
            CursorOptions::default(),
        ));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let cursor = cursor.clone();
            handles.push(tokio::spawn(async move { cursor.next().await }));
        }

        let mut seen = Vec::new();
        let mut ends = 0;
        for handle in handles {
            match handle.await.unwrap().unwrap() {
                Some(batch) => {
                    for doc in batch {
                        seen.push(doc.get_i64("_id").unwrap());
                    }
                }
                None => ends += 1,
            }
        }

        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(ends, 4);
        assert_eq!(channel.commands_named("getMore").len(), 5);
        assert_eq!(channel.max_in_flight(), 1);
    }

    #[tokio::test]
    async fn test_retryable_failure_is_retried_once() {
        let channel = Arc::new(
            ScriptedChannel::new()
                .step(Step::transport(TransportError::retryable("connection reset")))
                .reply(cursor_reply(0, vec![doc! { "_id": 2 }], false)),
        );
        let cursor = open_cursor(&channel, 42, vec![doc! { "_id": 1 }], CursorOptions::default());

        cursor.next().await.unwrap();
        assert_eq!(cursor.next().await.unwrap(), Some(vec![doc! { "_id": 2 }]));
        assert_eq!(channel.commands_named("getMore").len(), 2);
    }

    #[tokio::test]
    async fn test_second_retryable_failure_is_surfaced_once() {
        let channel = Arc::new(
            ScriptedChannel::new()
                .step(Step::transport(TransportError::retryable("reset")))
                .step(Step::transport(TransportError::retryable("reset again"))),
        );
        let cursor = open_cursor(&channel, 42, vec![], CursorOptions::default());

        let err = cursor.next().await.unwrap_err();
        assert!(matches!(err, AggError::Transport(ref t) if t.message == "reset again"));
        assert!(cursor.is_closed());

        // Error is not repeated
        assert_eq!(cursor.next().await.unwrap(), None);
        assert_eq!(cursor.next().await.unwrap(), None);

        let kills = wait_for_command(&channel, "killCursors").await;
        assert_eq!(kills.len(), 1);
    }

    #[tokio::test]
    async fn test_retry_disabled_surfaces_first_failure() {
        let channel = Arc::new(
            ScriptedChannel::new().step(Step::transport(TransportError::retryable("reset"))),
        );
        let cursor = open_cursor(
            &channel,
            42,
            vec![],
            CursorOptions {
                retry_get_more: false,
                ..Default::default()
            },
        );

        assert!(cursor.next().await.unwrap_err().is_retryable());
        assert_eq!(channel.commands_named("getMore").len(), 1);
    }

    #[tokio::test]
    async fn test_command_failure_is_not_retried() {
        let channel = Arc::new(ScriptedChannel::new().step(Step::command(CommandError::new(
            50,
            Some("MaxTimeMSExpired".into()),
            "operation exceeded time limit",
        ))));
        let cursor = open_cursor(&channel, 42, vec![], CursorOptions::default());

        match cursor.next().await {
            Err(AggError::CommandFailed(err)) => assert_eq!(err.code, 50),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(channel.commands_named("getMore").len(), 1);
        assert_eq!(cursor.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cursor_not_found_is_cursor_closed_without_kill() {
        let channel = Arc::new(ScriptedChannel::new().step(Step::command(CommandError::new(
            CURSOR_NOT_FOUND,
            Some("CursorNotFound".into()),
            "cursor id 42 not found",
        ))));
        let cursor = open_cursor(&channel, 42, vec![], CursorOptions::default());

        assert!(matches!(
            cursor.next().await,
            Err(AggError::CursorClosed(_))
        ));
        tokio::task::yield_now().await;
        assert!(channel.commands_named("killCursors").is_empty());
    }

    #[tokio::test]
    async fn test_post_batch_resume_token_tracks_latest_batch() {
        let mut reply = cursor_reply(42, vec![doc! { "_id": 2 }], false);
        reply
            .get_document_mut("cursor")
            .unwrap()
            .insert("postBatchResumeToken", doc! { "_data": "02" });
        let channel = Arc::new(ScriptedChannel::new().reply(reply));

        let mut first = cursor_reply(42, vec![doc! { "_id": 1 }], true);
        first
            .get_document_mut("cursor")
            .unwrap()
            .insert("postBatchResumeToken", doc! { "_data": "01" });
        let cursor = AsyncBatchCursor::new(
            channel.clone(),
            ns(),
            CursorResponse::parse(&first).unwrap(),
            CursorOptions::default(),
        );

        assert_eq!(
            cursor.post_batch_resume_token().await,
            Some(doc! { "_data": "01" })
        );
        cursor.next().await.unwrap();
        cursor.next().await.unwrap();
        assert_eq!(
            cursor.post_batch_resume_token().await,
            Some(doc! { "_data": "02" })
        );
        cursor.close();
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_pull_keeps_its_reply() {
        let channel = Arc::new(
            ScriptedChannel::new()
                .step(
                    Step::ok(cursor_reply(42, vec![doc! { "_id": 2 }], false))
                        .delay(Duration::from_secs(5)),
                )
                .reply(cursor_reply(0, vec![doc! { "_id": 3 }], false)),
        );
        let cursor = open_cursor(&channel, 42, vec![doc! { "_id": 1 }], CursorOptions::default());
        cursor.next().await.unwrap();

        let timed_out = tokio::time::timeout(Duration::from_millis(50), cursor.next()).await;
        assert!(timed_out.is_err());
        assert_eq!(cursor.state().await, CursorState::Fetching);

        // The abandoned getMore is awaited, not re-sent
        assert_eq!(cursor.next().await.unwrap(), Some(vec![doc! { "_id": 2 }]));
        assert_eq!(channel.commands_named("getMore").len(), 1);

        assert_eq!(cursor.next().await.unwrap(), Some(vec![doc! { "_id": 3 }]));
        assert_eq!(cursor.next().await.unwrap(), None);
        assert_eq!(channel.commands_named("getMore").len(), 2);
        assert_eq!(channel.max_in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_after_dropped_pull_discards_reply() {
        let channel = Arc::new(ScriptedChannel::new().step(
            Step::ok(cursor_reply(42, vec![doc! { "_id": 2 }], false))
                .delay(Duration::from_secs(5)),
        ));
        let cursor = open_cursor(&channel, 42, vec![doc! { "_id": 1 }], CursorOptions::default());
        cursor.next().await.unwrap();

        let timed_out = tokio::time::timeout(Duration::from_millis(50), cursor.next()).await;
        assert!(timed_out.is_err());

        cursor.close();
        assert_eq!(cursor.next().await.unwrap(), None);
        assert_eq!(cursor.state().await, CursorState::Closed);

        let kills = wait_for_command(&channel, "killCursors").await;
        assert_eq!(kills, vec![doc! { "killCursors": "orders", "cursors": [42i64] }]);
    }

    #[test]
    fn test_set_batch_size_rejects_oversized() {
        let channel = Arc::new(ScriptedChannel::new());
        let response = CursorResponse::parse(&cursor_reply(0, vec![], true)).unwrap();
        let cursor = AsyncBatchCursor::new(
            channel,
            ns(),
            response,
            CursorOptions {
                batch_size: Some(5),
                kill_on_close: false,
                ..Default::default()
            },
        );

        assert!(matches!(
            cursor.set_batch_size(3_000_000_000),
            Err(AggError::InvalidArgument(_))
        ));
        assert_eq!(cursor.batch_size(), Some(5));

        cursor.set_batch_size(MAX_BATCH_SIZE).unwrap();
        assert_eq!(cursor.batch_size(), Some(MAX_BATCH_SIZE));
    }
}

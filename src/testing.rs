//! In-memory channel with scripted replies for unit tests

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bson::{Bson, Document, doc};
use tokio::sync::Notify;

use crate::channel::WireChannel;
use crate::error::{AggError, CommandError, Result, TransportError};

/// Scripted outcome of one command
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Ok(Document),
    Transport(TransportError),
    Command(CommandError),
}

/// One scripted round trip
pub(crate) struct Step {
    reply: Reply,
    delay: Option<Duration>,
    gate: Option<Arc<Notify>>,
}

impl Step {
    pub(crate) fn ok(reply: Document) -> Self {
        Self::new(Reply::Ok(reply))
    }

    pub(crate) fn transport(err: TransportError) -> Self {
        Self::new(Reply::Transport(err))
    }

    pub(crate) fn command(err: CommandError) -> Self {
        Self::new(Reply::Command(err))
    }

    fn new(reply: Reply) -> Self {
        Self {
            reply,
            delay: None,
            gate: None,
        }
    }

    /// Sleep before replying
    pub(crate) fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Hold the reply until `gate` is notified
    pub(crate) fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// [`WireChannel`] that replays a script and records what it was sent
///
/// `killCursors` is always acknowledged without consuming the script.
pub(crate) struct ScriptedChannel {
    script: Mutex<VecDeque<Step>>,
    sent: Mutex<Vec<(String, Document)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    received: Notify,
    usable: AtomicBool,
}

impl ScriptedChannel {
    pub(crate) fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            received: Notify::new(),
            usable: AtomicBool::new(true),
        }
    }

    pub(crate) fn reply(self, reply: Document) -> Self {
        self.step(Step::ok(reply))
    }

    pub(crate) fn step(self, step: Step) -> Self {
        self.script.lock().unwrap().push_back(step);
        self
    }

    pub(crate) fn set_usable(&self, usable: bool) {
        self.usable.store(usable, Ordering::SeqCst);
    }

    /// Every command sent so far, in order
    pub(crate) fn commands(&self) -> Vec<Document> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, command)| command.clone())
            .collect()
    }

    /// Commands whose first key is `name`
    pub(crate) fn commands_named(&self, name: &str) -> Vec<Document> {
        self.commands()
            .into_iter()
            .filter(|command| command.keys().next().map(String::as_str) == Some(name))
            .collect()
    }

    /// Databases the commands were sent to, in order
    pub(crate) fn databases(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(db, _)| db.clone())
            .collect()
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Wait until a scripted command has arrived
    pub(crate) async fn wait_for_request(&self) {
        self.received.notified().await;
    }
}

#[async_trait]
impl WireChannel for ScriptedChannel {
    async fn send(&self, database: &str, command: Document) -> Result<Document> {
        let is_kill = command.keys().next().map(String::as_str) == Some("killCursors");
        self.sent
            .lock()
            .unwrap()
            .push((database.to_string(), command));

        if is_kill {
            return Ok(doc! { "ok": 1 });
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.received.notify_one();

        let step = self.script.lock().unwrap().pop_front();
        let Some(step) = step else {
            return Err(AggError::Transport(TransportError::fatal(
                "scripted channel has no reply left",
            )));
        };

        if let Some(gate) = step.gate {
            gate.notified().await;
        }
        if let Some(delay) = step.delay {
            tokio::time::sleep(delay).await;
        }

        match step.reply {
            Reply::Ok(reply) => Ok(reply),
            Reply::Transport(err) => Err(err.into()),
            Reply::Command(err) => Err(err.into()),
        }
    }

    fn is_usable(&self) -> bool {
        self.usable.load(Ordering::SeqCst)
    }
}

/// Cursor reply as the server sends it
pub(crate) fn cursor_reply(id: i64, batch: Vec<Document>, first: bool) -> Document {
    let key = if first { "firstBatch" } else { "nextBatch" };
    let batch: Vec<Bson> = batch.into_iter().map(Bson::Document).collect();
    let mut cursor = doc! { "id": id, "ns": "shop.orders" };
    cursor.insert(key, batch);
    doc! { "cursor": cursor, "ok": 1.0 }
}

/// Yield until a command named `name` shows up, then return all of them
pub(crate) async fn wait_for_command(channel: &ScriptedChannel, name: &str) -> Vec<Document> {
    for _ in 0..1000 {
        let found = channel.commands_named(name);
        if !found.is_empty() {
            // Let any duplicate settle before reporting
            tokio::task::yield_now().await;
            return channel.commands_named(name);
        }
        tokio::task::yield_now().await;
    }
    Vec::new()
}

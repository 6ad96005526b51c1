//! Command construction and reply parsing
//!
//! This module builds the documents sent to the server:
//! - `aggregate` with the pipeline and every option that was set
//! - `getMore` for an open cursor
//! - `killCursors` for cursor cleanup
//!
//! and parses the cursor replies that come back.

use std::fmt;
use std::time::Duration;

use bson::{Bson, Document, doc};
use tracing::debug;

use crate::error::{AggError, CommandError, Result, TransportError};

pub mod options;
pub mod pipeline;

pub use options::{AggregateOptions, Hint, MAX_BATCH_SIZE, check_batch_size};
pub use pipeline::{Namespace, OutputStage, Pipeline};

use options::{batch_size_to_i32, duration_to_millis};

/// Server-assigned cursor handle; zero means exhausted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CursorId(pub i64);

impl CursorId {
    pub const EXHAUSTED: CursorId = CursorId(0);

    /// Whether the server still holds results for this cursor
    pub fn is_open(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for CursorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Build the `aggregate` command
///
/// Options that are `None` are left out. For pipelines ending in an output
/// stage the cursor sub-document stays empty: batch size has no meaning there.
pub fn aggregate_command(
    namespace: &Namespace,
    pipeline: &Pipeline,
    options: &AggregateOptions,
) -> Document {
    let mut command = doc! {
        "aggregate": namespace.collection.as_str(),
        "pipeline": pipeline.to_bson(),
    };

    let mut cursor = Document::new();
    if !pipeline.has_output_stage() {
        if let Some(batch_size) = options.batch_size {
            cursor.insert("batchSize", batch_size_to_i32(batch_size));
            debug!("Applied batch_size: {}", batch_size);
        }
    }
    command.insert("cursor", cursor);

    if let Some(allow_disk_use) = options.allow_disk_use {
        command.insert("allowDiskUse", allow_disk_use);
        debug!("Applied allow_disk_use: {}", allow_disk_use);
    }

    if let Some(max_time) = options.max_time {
        command.insert("maxTimeMS", duration_to_millis(max_time));
        debug!("Applied max_time_ms: {}", max_time.as_millis());
    }

    if let Some(bypass) = options.bypass_document_validation {
        command.insert("bypassDocumentValidation", bypass);
        debug!("Applied bypass_document_validation: {}", bypass);
    }

    if let Some(collation) = &options.collation {
        command.insert("collation", collation.clone());
        debug!("Applied collation");
    }

    if let Some(comment) = &options.comment {
        command.insert("comment", comment.as_str());
        debug!("Applied comment");
    }

    if let Some(hint) = &options.hint {
        command.insert("hint", hint.to_bson());
        debug!("Applied hint");
    }

    command
}

/// Build a `getMore` for an open cursor
///
/// `max_await_time` becomes the command's `maxTimeMS`: on a `getMore` the
/// server reads it as the await-data wait, and rejects it for other cursors.
pub fn get_more_command(
    namespace: &Namespace,
    cursor_id: CursorId,
    batch_size: Option<u32>,
    max_await_time: Option<Duration>,
) -> Document {
    let mut command = doc! {
        "getMore": cursor_id.0,
        "collection": namespace.collection.as_str(),
    };

    if let Some(batch_size) = batch_size {
        command.insert("batchSize", batch_size_to_i32(batch_size));
    }

    if let Some(max_await_time) = max_await_time {
        command.insert("maxTimeMS", duration_to_millis(max_await_time));
    }

    command
}

/// Build a `killCursors` for one cursor
pub fn kill_cursors_command(namespace: &Namespace, cursor_id: CursorId) -> Document {
    doc! {
        "killCursors": namespace.collection.as_str(),
        "cursors": [cursor_id.0],
    }
}

/// Decoded cursor reply from `aggregate` or `getMore`
#[derive(Debug, Clone, PartialEq)]
pub struct CursorResponse {
    /// Cursor id to use for the next `getMore`
    pub id: CursorId,

    /// Namespace reported by the server, if any
    pub namespace: Option<Namespace>,

    /// Result documents of this round trip
    pub batch: Vec<Document>,

    /// Resume point after this batch, reported for change streams
    pub post_batch_resume_token: Option<Document>,
}

impl CursorResponse {
    /// Parse a cursor reply
    ///
    /// Accepts either `firstBatch` or `nextBatch`. A reply with `ok: 0` is
    /// turned into the matching server error.
    pub fn parse(reply: &Document) -> Result<Self> {
        check_ok(reply)?;

        let cursor = reply
            .get_document("cursor")
            .map_err(|_| invalid_reply("missing 'cursor' document", reply))?;

        let id = match cursor.get("id") {
            Some(Bson::Int64(id)) => CursorId(*id),
            Some(Bson::Int32(id)) => CursorId(i64::from(*id)),
            None => CursorId::EXHAUSTED,
            Some(other) => return Err(invalid_reply(&format!("bad cursor id {other}"), reply)),
        };

        let batch = cursor
            .get_array("firstBatch")
            .or_else(|_| cursor.get_array("nextBatch"))
            .map_err(|_| invalid_reply("missing batch array", reply))?;

        let batch = batch
            .iter()
            .map(|item| match item {
                Bson::Document(doc) => Ok(doc.clone()),
                other => Err(invalid_reply(
                    &format!("non-document batch entry {other}"),
                    reply,
                )),
            })
            .collect::<Result<Vec<_>>>()?;

        let namespace = cursor.get_str("ns").ok().and_then(Namespace::parse);
        let post_batch_resume_token = cursor.get_document("postBatchResumeToken").ok().cloned();

        Ok(Self {
            id,
            namespace,
            batch,
            post_batch_resume_token,
        })
    }
}

/// Fail with the server's error when a reply carries `ok: 0`
pub fn check_ok(reply: &Document) -> Result<()> {
    let ok = match reply.get("ok") {
        Some(Bson::Double(v)) => *v != 0.0,
        Some(Bson::Int32(v)) => *v != 0,
        Some(Bson::Int64(v)) => *v != 0,
        Some(Bson::Boolean(v)) => *v,
        // Replies decoded by the driver have already been checked
        None => true,
        Some(_) => false,
    };

    if ok {
        return Ok(());
    }

    let code = match reply.get("code") {
        Some(Bson::Int32(c)) => *c,
        Some(Bson::Int64(c)) => i32::try_from(*c).unwrap_or(-1),
        Some(Bson::Double(c)) => *c as i32,
        _ => -1,
    };
    let code_name = reply.get_str("codeName").ok().map(str::to_string);
    let message = reply.get_str("errmsg").unwrap_or("unknown server error");

    Err(AggError::from(CommandError::new(code, code_name, message)))
}

fn invalid_reply(reason: &str, reply: &Document) -> AggError {
    AggError::Transport(TransportError::fatal(format!(
        "Invalid cursor reply ({reason}): {reply}"
    )))
}

//! Execution result types
//!
//! This module defines what an aggregate execution hands back:
//! - AggregateOutcome: a live cursor, or the acknowledgement of an output stage
//! - OutputAck: details of a completed `$out` / `$merge`

use crate::command::{Namespace, OutputStage};
use crate::cursor::AsyncBatchCursor;

/// Result of executing an aggregation
#[derive(Debug)]
pub enum AggregateOutcome {
    /// Results are read through a cursor
    Cursor(AsyncBatchCursor),

    /// The pipeline wrote its results to a collection
    Written(OutputAck),
}

/// Acknowledgement of a pipeline ending in an output stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputAck {
    /// Namespace the aggregation ran against
    pub namespace: Namespace,

    /// The terminal stage that wrote the results
    pub stage: OutputStage,

    /// Round-trip time of the command in milliseconds
    pub elapsed_ms: u64,
}

impl AggregateOutcome {
    /// Take the cursor, if this outcome has one
    pub fn into_cursor(self) -> Option<AsyncBatchCursor> {
        match self {
            AggregateOutcome::Cursor(cursor) => Some(cursor),
            AggregateOutcome::Written(_) => None,
        }
    }

    pub fn is_written(&self) -> bool {
        matches!(self, AggregateOutcome::Written(_))
    }
}

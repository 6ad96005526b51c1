//! Aggregate options
//!
//! An immutable snapshot of every option the aggregate command understands.
//! Options left as `None` are omitted from the command so the server applies
//! its own defaults.

use std::time::Duration;

use bson::{Bson, Document};
use serde::{Deserialize, Serialize};

use crate::error::{AggError, Result};

/// Index hint for an aggregation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Hint {
    /// Index key pattern, e.g. `{ "a": 1 }`
    Keys(Document),

    /// Index name
    Name(String),
}

impl Hint {
    /// Encode the hint as it appears in the command
    pub fn to_bson(&self) -> Bson {
        match self {
            Hint::Keys(keys) => Bson::Document(keys.clone()),
            Hint::Name(name) => Bson::String(name.clone()),
        }
    }
}

/// Options for an aggregate execution
///
/// Constructed once before execution; every cursor created from it keeps its
/// own copy, so later changes never reach an open cursor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregateOptions {
    /// Allow writing to temporary files for large aggregations
    pub allow_disk_use: Option<bool>,

    /// Server-side execution deadline for the aggregate command
    pub max_time: Option<Duration>,

    /// How long a `getMore` on an await-data cursor may wait for new results
    pub max_await_time: Option<Duration>,

    /// Documents per batch; `None` lets the server choose
    pub batch_size: Option<u32>,

    /// Opt out of document validation for output stages
    pub bypass_document_validation: Option<bool>,

    /// Collation rules
    pub collation: Option<Document>,

    /// Comment attached to the command
    pub comment: Option<String>,

    /// Index hint
    pub hint: Option<Hint>,
}

impl AggregateOptions {
    /// Check option values that can be rejected without the server
    ///
    /// # Returns
    /// * `Result<()>` - `InvalidArgument` for a batch size of zero or one
    ///   that does not fit the server's 32-bit field
    pub fn validate(&self) -> Result<()> {
        if let Some(batch_size) = self.batch_size {
            if batch_size == 0 {
                return Err(AggError::InvalidArgument(
                    "batchSize must be a positive integer".to_string(),
                ));
            }
            check_batch_size(batch_size)?;
        }
        Ok(())
    }

    /// Await time with zero treated as unset
    pub fn effective_max_await_time(&self) -> Option<Duration> {
        self.max_await_time.filter(|d| !d.is_zero())
    }
}

/// Largest batch size the server accepts
pub const MAX_BATCH_SIZE: u32 = i32::MAX as u32;

/// Reject batch sizes above [`MAX_BATCH_SIZE`]
pub fn check_batch_size(batch_size: u32) -> Result<()> {
    if batch_size > MAX_BATCH_SIZE {
        return Err(AggError::InvalidArgument(format!(
            "batchSize {} exceeds the maximum of {}",
            batch_size, MAX_BATCH_SIZE
        )));
    }
    Ok(())
}

/// Encode a batch size as the server's int32, saturating at the maximum
pub(crate) fn batch_size_to_i32(batch_size: u32) -> i32 {
    i32::try_from(batch_size).unwrap_or(i32::MAX)
}

/// Convert a duration to the millisecond count the server expects
pub(crate) fn duration_to_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

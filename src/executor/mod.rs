//! Aggregate execution driver
//!
//! This module turns a pipeline and its options into either a live batch
//! cursor or, for pipelines ending in `$out` / `$merge`, a single
//! acknowledgement. It includes:
//! - Request validation before any network activity
//! - Command construction and dispatch over a [`WireChannel`]
//! - Cursor construction from the first reply

use std::sync::Arc;

use crate::channel::WireChannel;
use crate::command::{AggregateOptions, Namespace};
use crate::config::CursorConfig;
use crate::cursor::CursorOptions;

mod aggregate;
pub mod result;

pub use result::{AggregateOutcome, OutputAck};

/// Executes aggregations against one collection
#[derive(Clone)]
pub struct AggregateExecutor {
    /// Channel shared by the executor and every cursor it opens
    channel: Arc<dyn WireChannel>,

    /// Target collection
    namespace: Namespace,

    /// Defaults for cursors opened by this executor
    cursor_config: CursorConfig,
}

impl AggregateExecutor {
    /// Create an executor
    ///
    /// # Arguments
    /// * `channel` - Channel commands are sent over
    /// * `namespace` - Database and collection to aggregate
    pub fn new(channel: Arc<dyn WireChannel>, namespace: Namespace) -> Self {
        Self {
            channel,
            namespace,
            cursor_config: CursorConfig::default(),
        }
    }

    /// Use cursor defaults from configuration
    pub fn with_cursor_config(mut self, config: CursorConfig) -> Self {
        self.cursor_config = config;
        self
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Options with configured defaults filled in
    fn effective_options(&self, options: &AggregateOptions) -> AggregateOptions {
        let mut options = options.clone();
        if options.batch_size.is_none() {
            options.batch_size = self.cursor_config.default_batch_size;
        }
        options
    }

    /// Settings snapshot handed to a new cursor
    fn cursor_options(&self, options: &AggregateOptions) -> CursorOptions {
        CursorOptions {
            batch_size: options.batch_size,
            max_await_time: options.effective_max_await_time(),
            ..self.cursor_config.cursor_options()
        }
    }
}

impl std::fmt::Debug for AggregateExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateExecutor")
            .field("namespace", &self.namespace)
            .field("cursor_config", &self.cursor_config)
            .finish()
    }
}

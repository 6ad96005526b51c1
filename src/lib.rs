//! Aggregation Cursor Library
//!
//! This library runs MongoDB aggregation pipelines and exposes their results
//! as asynchronous batch cursors.
//!
//! # Modules
//!
//! - `channel`: Transport abstraction commands are sent over
//! - `cli`: Command-line interface and argument parsing
//! - `command`: Aggregate, getMore and killCursors command construction
//! - `config`: Configuration management
//! - `connection`: MongoDB connection management
//! - `cursor`: Batch cursor, state machine and document stream
//! - `error`: Error types and handling
//! - `executor`: Aggregate execution driver
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use aggcursor::{
//!     AggregateExecutor, AggregateOptions, Namespace, config::Config,
//!     connection::ConnectionManager,
//! };
//! use bson::doc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let mut manager = ConnectionManager::new(
//!         "mongodb://localhost:27017".to_string(),
//!         config.connection,
//!     );
//!     manager.connect().await?;
//!
//!     let executor =
//!         AggregateExecutor::new(Arc::new(manager.channel()?), Namespace::new("shop", "orders"));
//!     let cursor = executor
//!         .batch_cursor(
//!             vec![doc! { "$match": { "status": "A" } }],
//!             &AggregateOptions::default(),
//!         )
//!         .await?;
//!
//!     while let Some(batch) = cursor.next().await? {
//!         println!("{} documents", batch.len());
//!     }
//!
//!     manager.disconnect().await?;
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod cli;
pub mod command;
pub mod config;
pub mod connection;
pub mod cursor;
pub mod error;
pub mod executor;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use channel::{MongoChannel, WireChannel};
pub use command::{AggregateOptions, CursorId, Hint, Namespace, Pipeline};
pub use config::Config;
pub use connection::ConnectionManager;
pub use cursor::{AsyncBatchCursor, CursorOptions, CursorState, DocumentCursor};
pub use error::{AggError, Result};
pub use executor::{AggregateExecutor, AggregateOutcome, OutputAck};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library version string
///
/// # Returns
/// * `&str` - Version string
pub fn version() -> &'static str {
    VERSION
}

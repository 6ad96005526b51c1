//! Wire command channel
//!
//! The narrow interface the aggregate driver and batch cursor use to talk to
//! the server. A channel sends one command document against a database and
//! resolves to the decoded reply or an error. Channels may be shared by many
//! cursors; each cursor keeps at most one command in flight on it.

use async_trait::async_trait;
use bson::Document;

use crate::error::Result;

pub mod mongo;

pub use mongo::MongoChannel;

/// Asynchronous command/response channel to a single server endpoint
#[async_trait]
pub trait WireChannel: Send + Sync {
    /// Send a command and wait for its reply
    ///
    /// # Arguments
    /// * `database` - Database the command runs against
    /// * `command` - Encoded command document
    ///
    /// # Returns
    /// * `Result<Document>` - Server reply, or a transport/server error
    async fn send(&self, database: &str, command: Document) -> Result<Document>;

    /// Whether the channel can still carry a command
    ///
    /// Cursors consult this before firing a kill notification on close.
    fn is_usable(&self) -> bool {
        true
    }
}

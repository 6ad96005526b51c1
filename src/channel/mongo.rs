use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bson::Document;
use mongodb::Client;
use tracing::trace;

use super::WireChannel;
use crate::error::Result;

/// [`WireChannel`] backed by a pooled MongoDB client
///
/// Commands go through `Database::run_command`, so server selection,
/// authentication and connection pooling stay with the driver.
#[derive(Clone)]
pub struct MongoChannel {
    client: Client,
    usable: Arc<AtomicBool>,
}

impl MongoChannel {
    /// Create a channel whose usability is controlled by the owner of `usable`
    pub(crate) fn with_flag(client: Client, usable: Arc<AtomicBool>) -> Self {
        Self { client, usable }
    }
}

#[async_trait]
impl WireChannel for MongoChannel {
    async fn send(&self, database: &str, command: Document) -> Result<Document> {
        trace!("Sending command to '{}': {}", database, command);
        let reply = self.client.database(database).run_command(command).await?;
        Ok(reply)
    }

    fn is_usable(&self) -> bool {
        self.usable.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for MongoChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MongoChannel")
            .field("usable", &self.is_usable())
            .field("client", &"<MongoDB Client>")
            .finish()
    }
}

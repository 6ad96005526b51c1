//! Document-at-a-time iteration over a batch cursor

use std::collections::VecDeque;

use bson::Document;
use futures::stream::{self, BoxStream, StreamExt};
use tracing::debug;

use super::AsyncBatchCursor;
use crate::error::Result;

/// Yields the documents of an [`AsyncBatchCursor`] one at a time
///
/// Batches are pulled lazily: a `getMore` is only issued once every document
/// of the previous batch has been taken.
#[derive(Debug)]
pub struct DocumentCursor {
    cursor: AsyncBatchCursor,
    pending: VecDeque<Document>,
    done: bool,
}

impl DocumentCursor {
    pub fn new(cursor: AsyncBatchCursor) -> Self {
        Self {
            cursor,
            pending: VecDeque::new(),
            done: false,
        }
    }

    /// Next document, `None` at end of stream
    ///
    /// Empty await-data batches are skipped. The first error ends iteration.
    pub async fn try_next(&mut self) -> Result<Option<Document>> {
        loop {
            if let Some(doc) = self.pending.pop_front() {
                return Ok(Some(doc));
            }

            if self.done {
                return Ok(None);
            }

            match self.cursor.next().await {
                Ok(Some(batch)) => self.pending.extend(batch),
                Ok(None) => {
                    self.done = true;
                }
                Err(e) => {
                    self.done = true;
                    return Err(e);
                }
            }
        }
    }

    /// Convert into a `Stream` of documents
    pub fn into_stream(self) -> BoxStream<'static, Result<Document>> {
        stream::unfold(self, |mut cursor| async move {
            match cursor.try_next().await {
                Ok(Some(doc)) => Some((Ok(doc), cursor)),
                Ok(None) => None,
                Err(e) => Some((Err(e), cursor)),
            }
        })
        .boxed()
    }

    /// Drain every remaining document into a vector
    pub async fn collect_all(mut self) -> Result<Vec<Document>> {
        let mut documents: Vec<Document> = self.pending.drain(..).collect();
        while let Some(doc) = self.try_next().await? {
            documents.push(doc);
        }
        debug!("Collected {} documents from {}", documents.len(), self.cursor.namespace());
        Ok(documents)
    }

    /// First document, closing the cursor afterwards
    pub async fn first(mut self) -> Result<Option<Document>> {
        let first = self.try_next().await;
        self.cursor.close();
        first
    }

    /// Close the underlying cursor
    pub fn close(&self) {
        self.cursor.close();
    }

    /// The underlying batch cursor
    pub fn batch_cursor(&self) -> &AsyncBatchCursor {
        &self.cursor
    }
}

impl From<AsyncBatchCursor> for DocumentCursor {
    fn from(cursor: AsyncBatchCursor) -> Self {
        Self::new(cursor)
    }
}

use bson::Document;

/// Holds the documents of one server reply until the consumer takes them
#[derive(Debug, Default)]
pub struct BatchBuffer {
    documents: Vec<Document>,
}

impl BatchBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the buffer contents with a new batch
    ///
    /// Anything still held is dropped. The cursor only installs into a drained
    /// buffer, so nothing is lost in practice.
    pub fn install(&mut self, batch: Vec<Document>) {
        self.documents = batch;
    }

    /// Remove and return every buffered document
    pub fn drain_all(&mut self) -> Vec<Document> {
        std::mem::take(&mut self.documents)
    }

    pub fn clear(&mut self) {
        self.documents.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }
}

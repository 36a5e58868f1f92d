// nc_doc_loader/src/writer.rs
// Batched inserts and single-row upserts, both under the retry discipline.

use mongodb::bson::{Bson, Document};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{IngestorError, Result};
use crate::ingestor::{DocumentStore, UpdateDocument, WriteOutcome};
use crate::retry::{RetrySettings, execute_with_retry};

/// Turns a non-ok outcome into a retryable failure.
fn check_outcome(outcome: WriteOutcome,) -> Result<WriteOutcome,> {
    if outcome.ok {
        return Ok(outcome,);
    }
    let message = outcome
        .error_message
        .unwrap_or_else(|| "store reported failure without a message".to_string(),);
    error!("Store reported a write failure: {}", message);
    Err(IngestorError::WriteRejected(message,),)
}

/// What happened to a flushed batch.
#[derive(Debug, Clone, PartialEq, Eq,)]
pub enum BatchCommit {
    Written { documents: usize, attempts: u32, },
    /// Cancelled before the first attempt; the documents were discarded.
    Skipped { documents: usize, },
}

/// Buffers documents and writes them with one bulk insert per batch.
pub struct BatchWriter {
    capacity: usize,
    buffer:   Vec<Bson,>,
    retry:    RetrySettings,
}

impl BatchWriter {
    pub fn new(capacity: usize, retry: RetrySettings,) -> Self {
        let capacity = capacity.max(1,);
        Self {
            capacity,
            buffer: Vec::with_capacity(capacity,),
            retry,
        }
    }

    pub fn capacity(&self,) -> usize {
        self.capacity
    }

    pub fn len(&self,) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self,) -> bool {
        self.buffer.is_empty()
    }

    pub fn is_full(&self,) -> bool {
        self.buffer.len() >= self.capacity
    }

    /// Buffers `document`, flushing once the batch reaches capacity.
    pub async fn add<S: DocumentStore + ?Sized,>(
        &mut self,
        document: Bson,
        store: &S,
        cancel: &CancellationToken,
    ) -> Result<Option<BatchCommit,>,> {
        self.buffer.push(document,);
        if !self.is_full() {
            return Ok(None,);
        }
        debug!("Committing a batch of {} documents", self.buffer.len());
        self.flush(store, cancel,).await.map(Some,)
    }

    /// Writes the buffered documents. The buffer is empty afterwards whatever
    /// the outcome; failed documents are not requeued.
    pub async fn flush<S: DocumentStore + ?Sized,>(
        &mut self,
        store: &S,
        cancel: &CancellationToken,
    ) -> Result<BatchCommit,> {
        let batch = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.capacity,),);
        let documents = batch.len();

        let attempted = execute_with_retry(self.retry, cancel, || async {
            store.insert_many(&batch,).await.and_then(check_outcome,)
        },)
        .await?;

        let Some(attempted,) = attempted else {
            info!("Pipeline stopped; discarding {} buffered documents", documents);
            return Ok(BatchCommit::Skipped { documents, },);
        };
        if let Some(server,) = &attempted.value.server {
            debug!("Wrote batch of {} documents to server {}", documents, server);
        }
        Ok(BatchCommit::Written {
            documents,
            attempts: attempted.attempts,
        },)
    }
}

/// Issues one query + update-with-upsert per row.
///
/// A store may acknowledge an update routed to a non-primary member without
/// applying it; this writer takes the acknowledgement at face value.
pub struct UpsertWriter {
    retry: RetrySettings,
    multi: bool,
}

impl UpsertWriter {
    pub fn new(retry: RetrySettings, multi: bool,) -> Self {
        Self { retry, multi, }
    }

    /// Returns the number of attempts, or `None` when cancelled beforehand.
    pub async fn write<S: DocumentStore + ?Sized,>(
        &self,
        store: &S,
        cancel: &CancellationToken,
        query: &Document,
        update: &UpdateDocument,
    ) -> Result<Option<u32,>,> {
        let attempted = execute_with_retry(self.retry, cancel, || async {
            store
                .update(query, update, true, self.multi,)
                .await
                .and_then(check_outcome,)
        },)
        .await?;
        Ok(attempted.map(|a| a.attempts,),)
    }
}

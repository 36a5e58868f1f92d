// nc_doc_loader/src/pipeline.rs
// Drives rows through mapping and writing, one row at a time.

use std::collections::BTreeSet;
use std::future::Future;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::error::{IngestorError, Result};
use crate::index::{IndexManager, IndexSpec};
use crate::ingestor::{DocumentStore, IngestorConfig, UpdateDocument};
use crate::mapping::{MappingPlan, PathSpec};
use crate::row::{Row, RowMeta, RowSource};
use crate::writer::{BatchCommit, BatchWriter, UpsertWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq,)]
pub enum PipelineState {
    Uninitialized,
    Active,
    Draining,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq,)]
pub enum SkipReason {
    /// Every mapped field was null.
    EmptyDocument,
    /// Every match key was null.
    NoMatchKey,
}

/// What became of one row.
#[derive(Debug, Clone, Copy, PartialEq, Eq,)]
pub enum RowOutcome {
    Buffered,
    /// The row completed a batch which was then written.
    BatchWritten { documents: usize, },
    Upserted,
    Skipped(SkipReason,),
    /// Cancellation was observed; the row was not written.
    Stopped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize,)]
pub struct PipelineStats {
    pub rows_read:          u64,
    pub rows_skipped:       u64,
    pub documents_inserted: u64,
    pub batches_written:    u64,
    pub upserts:            u64,
    pub indexes_applied:    u64,
    pub stopped:            bool,
}

/// Security context every unit of row processing runs in.
#[async_trait]
pub trait AuthScope: Send + Sync {
    async fn scoped<T, F,>(&self, work: F,) -> Result<T,>
    where
        T: Send,
        F: Future<Output = Result<T,>,> + Send;
}

/// Runs work as the connection's own identity.
#[derive(Debug, Clone, Copy, Default,)]
pub struct Unscoped;

#[async_trait]
impl AuthScope for Unscoped {
    async fn scoped<T, F,>(&self, work: F,) -> Result<T,>
    where
        T: Send,
        F: Future<Output = Result<T,>,> + Send,
    {
        work.await
    }
}

/// Runs work on behalf of a named principal, recorded on a tracing span.
#[derive(Debug, Clone,)]
pub struct NamedScope {
    pub principal: String,
}

#[async_trait]
impl AuthScope for NamedScope {
    async fn scoped<T, F,>(&self, work: F,) -> Result<T,>
    where
        T: Send,
        F: Future<Output = Result<T,>,> + Send,
    {
        work.instrument(info_span!("auth_scope", principal = %self.principal),)
            .await
    }
}

/// Receives progress notifications from [`RowPipeline::run`].
pub trait ProgressListener: Send + Sync {
    fn row_processed(&self, _outcome: &RowOutcome,) {}

    fn stream_complete(&self, _stats: &PipelineStats,) {}
}

#[derive(Debug, Clone, Copy, Default,)]
pub struct NoProgress;

impl ProgressListener for NoProgress {}

/// One loading pipeline instance. Owns its collection handle exclusively.
pub struct RowPipeline<S: DocumentStore, A: AuthScope = Unscoped,> {
    auth: A,
    core: PipelineCore<S,>,
}

impl<S: DocumentStore,> RowPipeline<S, Unscoped,> {
    pub fn new(config: IngestorConfig, store: S, cancel: CancellationToken,) -> Result<Self,> {
        Self::with_auth_scope(config, store, cancel, Unscoped,)
    }
}

impl<S: DocumentStore, A: AuthScope,> RowPipeline<S, A,> {
    pub fn with_auth_scope(
        config: IngestorConfig,
        store: S,
        cancel: CancellationToken,
        auth: A,
    ) -> Result<Self,> {
        config.validate()?;
        let indexes = config.index_specs()?;
        let upserts = UpsertWriter::new(config.retry_settings(), config.multi,);
        Ok(Self {
            auth,
            core: PipelineCore {
                config,
                store,
                cancel,
                state: PipelineState::Uninitialized,
                plan: None,
                batch: None,
                upserts,
                indexes,
                truncated: false,
                stats: PipelineStats::default(),
            },
        },)
    }

    pub fn state(&self,) -> PipelineState {
        self.core.state
    }

    pub fn stats(&self,) -> &PipelineStats {
        &self.core.stats
    }

    /// Documents waiting in the insert batch.
    pub fn buffered(&self,) -> usize {
        self.core.batch.as_ref().map_or(0, BatchWriter::len,)
    }

    pub fn store(&self,) -> &S {
        &self.core.store
    }

    /// Maps and writes one row. A fatal error terminates the pipeline and
    /// releases the store before it is returned.
    pub async fn process_row(&mut self, row: &Row,) -> Result<RowOutcome,> {
        let result = self.auth.scoped(self.core.process_row(row,),).await;
        match result {
            Ok(outcome,) => Ok(outcome,),
            Err(e,) => Err(self.core.abort(e,).await,),
        }
    }

    /// End of input: flushes the partial batch, applies indexes and releases
    /// the store.
    pub async fn finish(&mut self,) -> Result<PipelineStats,> {
        let result = self.auth.scoped(self.core.finish(),).await;
        match result {
            Ok(stats,) => Ok(stats,),
            Err(e,) => Err(self.core.abort(e,).await,),
        }
    }

    /// Pulls every row from `source` and finishes the pipeline.
    pub async fn run<R, L,>(mut self, source: &mut R, listener: &L,) -> Result<PipelineStats,>
    where
        R: RowSource + ?Sized,
        L: ProgressListener + ?Sized,
    {
        while !self.core.cancel.is_cancelled() {
            let row = match source.next_row().await {
                Ok(Some(row,),) => row,
                Ok(None,) => break,
                Err(e,) => return Err(self.core.abort(e,).await,),
            };
            let outcome = self.process_row(&row,).await?;
            listener.row_processed(&outcome,);
        }
        let stats = self.finish().await?;
        listener.stream_complete(&stats,);
        Ok(stats,)
    }
}

struct PipelineCore<S: DocumentStore,> {
    config:    IngestorConfig,
    store:     S,
    cancel:    CancellationToken,
    state:     PipelineState,
    plan:      Option<MappingPlan,>,
    batch:     Option<BatchWriter,>,
    upserts:   UpsertWriter,
    indexes:   Vec<IndexSpec,>,
    truncated: bool,
    stats:     PipelineStats,
}

impl<S: DocumentStore,> PipelineCore<S,> {
    async fn process_row(&mut self, row: &Row,) -> Result<RowOutcome,> {
        if matches!(self.state, PipelineState::Draining | PipelineState::Terminated) {
            return Err(IngestorError::Other(
                "row received after the end of the stream".to_string(),
            ),);
        }
        if self.cancel.is_cancelled() {
            self.stats.stopped = true;
            return Ok(RowOutcome::Stopped,);
        }
        if self.state == PipelineState::Uninitialized {
            self.initialize(row.meta(),).await?;
        }

        self.stats.rows_read += 1;
        let outcome = match self.write_row(row,).await {
            Err(IngestorError::MappingError(reason,),) => {
                warn!("Skipping row that cannot be mapped: {}", reason);
                RowOutcome::Skipped(SkipReason::EmptyDocument,)
            },
            other => other?,
        };
        match outcome {
            RowOutcome::Skipped(_,) => self.stats.rows_skipped += 1,
            RowOutcome::Stopped => self.stats.stopped = true,
            _ => {},
        }
        Ok(outcome,)
    }

    async fn initialize(&mut self, meta: &RowMeta,) -> Result<(),> {
        let plan = MappingPlan::resolve(self.config.path_specs()?,)?;
        if plan.has_top_level_document_insert() && self.config.upsert && self.config.modifier_update
        {
            return Err(IngestorError::ConfigurationError(
                "a whole-document field cannot be applied as a modifier update".to_string(),
            ),);
        }
        check_input_fields(meta, plan.specs(),)?;
        debug!(
            "Document shape {:?}, whole-document insert: {}",
            plan.shape(),
            plan.has_top_level_document_insert()
        );

        if self.config.truncate {
            info!("Truncating collection '{}'", self.config.collection);
            self.store.drop_collection().await?;
            self.store.ensure_collection().await?;
            self.truncated = true;
        }

        self.batch = Some(BatchWriter::new(
            self.config.batch_size,
            self.config.retry_settings(),
        ),);
        self.plan = Some(plan,);
        self.state = PipelineState::Active;
        Ok((),)
    }

    async fn write_row(&mut self, row: &Row,) -> Result<RowOutcome,> {
        let plan = self.plan.as_ref().ok_or_else(|| {
            IngestorError::Other("pipeline used before initialization".to_string(),)
        },)?;

        if self.config.upsert {
            let Some(query,) = plan.build_query(row,)? else {
                info!("No non-null match key value in row; skipping upsert");
                return Ok(RowOutcome::Skipped(SkipReason::NoMatchKey,),);
            };
            debug!("Upsert query: {}", query);

            let update = if self.config.modifier_update {
                plan.build_modifier_update(row,)?.map(UpdateDocument::Modifiers,)
            } else {
                plan.build_document(row,)?.map(UpdateDocument::Replacement,)
            };
            let Some(update,) = update else {
                return Ok(RowOutcome::Skipped(SkipReason::EmptyDocument,),);
            };
            debug!("Upsert update: {:?}", update);

            let attempts = self
                .upserts
                .write(&self.store, &self.cancel, &query, &update,)
                .await?;
            return match attempts {
                Some(_,) => {
                    self.stats.upserts += 1;
                    Ok(RowOutcome::Upserted,)
                },
                None => Ok(RowOutcome::Stopped,),
            };
        }

        let Some(document,) = plan.build_document(row,)? else {
            return Ok(RowOutcome::Skipped(SkipReason::EmptyDocument,),);
        };
        let batch = self.batch.as_mut().ok_or_else(|| {
            IngestorError::Other("insert batch not initialized".to_string(),)
        },)?;
        let commit = batch.add(document, &self.store, &self.cancel,).await?;
        Ok(match commit {
            None => RowOutcome::Buffered,
            Some(commit,) => self.record_commit(commit,),
        },)
    }

    fn record_commit(&mut self, commit: BatchCommit,) -> RowOutcome {
        match commit {
            BatchCommit::Written { documents, attempts, } => {
                debug!("Batch of {} documents written in {} attempt(s)", documents, attempts);
                self.stats.documents_inserted += documents as u64;
                self.stats.batches_written += 1;
                RowOutcome::BatchWritten { documents, }
            },
            BatchCommit::Skipped { .. } => RowOutcome::Stopped,
        }
    }

    async fn finish(&mut self,) -> Result<PipelineStats,> {
        if self.state == PipelineState::Terminated {
            return Ok(self.stats.clone(),);
        }
        self.state = PipelineState::Draining;

        let pending = match self.batch.as_mut() {
            Some(batch,) if !batch.is_empty() => Some(batch.flush(&self.store, &self.cancel,).await?,),
            _ => None,
        };
        if let Some(commit,) = pending {
            if self.record_commit(commit,) == RowOutcome::Stopped {
                self.stats.stopped = true;
            }
        }

        if self.cancel.is_cancelled() {
            self.stats.stopped = true;
            info!("Pipeline stopped; skipping index operations");
        } else if !self.indexes.is_empty() {
            let applied =
                IndexManager::apply_indexes(&self.store, &self.indexes, self.truncated,).await?;
            self.stats.indexes_applied = applied as u64;
        }

        self.release().await;
        self.state = PipelineState::Terminated;
        info!(
            "Pipeline finished: {} rows read, {} inserted, {} upserted, {} skipped",
            self.stats.rows_read,
            self.stats.documents_inserted,
            self.stats.upserts,
            self.stats.rows_skipped
        );
        Ok(self.stats.clone(),)
    }

    /// Terminates after a fatal error, releasing the store first.
    async fn abort(&mut self, err: IngestorError,) -> IngestorError {
        error!("Pipeline failed: {}", err);
        if self.state != PipelineState::Terminated {
            self.release().await;
            self.state = PipelineState::Terminated;
        }
        err
    }

    async fn release(&mut self,) {
        if let Err(e,) = self.store.release().await {
            warn!("Failed to release store connection: {}", e);
        }
    }
}

/// Every mapped field must exist in the incoming rows. Unused incoming
/// fields are only reported.
fn check_input_fields(meta: &RowMeta, specs: &[PathSpec],) -> Result<(),> {
    let expected: BTreeSet<&str,> = specs.iter().map(|s| s.incoming_field.as_str(),).collect();
    let actual: BTreeSet<&str,> = meta.field_names().iter().map(String::as_str,).collect();

    let missing: Vec<String,> = expected
        .difference(&actual,)
        .map(|name| format!("'{name}'"),)
        .collect();
    if !missing.is_empty() {
        return Err(IngestorError::ConfigurationError(format!(
            "mapped fields not found in the incoming rows: {}",
            missing.join(", ",)
        ),),);
    }

    let unused: Vec<String,> = actual
        .difference(&expected,)
        .map(|name| format!("'{name}'"),)
        .collect();
    if !unused.is_empty() {
        info!("Incoming fields that will not be written: {}", unused.join(", "));
    }
    Ok((),)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::parse_path;

    #[test]
    fn missing_mapped_field_is_a_configuration_error() {
        let meta = RowMeta::new(["id", "name"],);
        let specs = [
            PathSpec::new("id", parse_path("id",).unwrap(),),
            PathSpec::new("email", parse_path("email",).unwrap(),),
        ];
        let err = check_input_fields(&meta, &specs,).unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("'email'"));
    }

    #[test]
    fn unused_incoming_fields_are_tolerated() {
        let meta = RowMeta::new(["id", "name", "ignored"],);
        let specs = [PathSpec::new("id", parse_path("id",).unwrap(),)];
        assert!(check_input_fields(&meta, &specs,).is_ok());
    }
}

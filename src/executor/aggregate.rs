//! Aggregate operations for the execution driver
//!
//! This module contains the aggregation entry points:
//! - execute (cursor or output acknowledgement)
//! - batch_cursor, to_collection and first

use bson::Document;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::result::{AggregateOutcome, OutputAck};
use crate::command::{
    AggregateOptions, CursorResponse, Pipeline, aggregate_command, check_ok,
};
use crate::cursor::{AsyncBatchCursor, DocumentCursor};
use crate::error::{AggError, Result};

/// Aggregate operations implementation
impl super::AggregateExecutor {
    /// Execute an aggregation pipeline
    ///
    /// # Arguments
    /// * `stages` - Pipeline stages; must not be empty
    /// * `options` - Options snapshot for this execution
    ///
    /// # Returns
    /// * `AggregateOutcome::Cursor` - For ordinary pipelines
    /// * `AggregateOutcome::Written` - For pipelines ending in `$out` / `$merge`
    /// * `Err(...)` - `InvalidArgument` before any network call, or the
    ///   server/transport error of the aggregate command
    pub async fn execute(
        &self,
        stages: Vec<Document>,
        options: &AggregateOptions,
    ) -> Result<AggregateOutcome> {
        let pipeline = Pipeline::new(stages)?;
        options.validate()?;
        self.run(pipeline, options).await
    }

    /// Execute a pipeline that must produce a cursor
    ///
    /// # Returns
    /// * `Result<AsyncBatchCursor>` - `InvalidArgument` for output-stage pipelines
    pub async fn batch_cursor(
        &self,
        stages: Vec<Document>,
        options: &AggregateOptions,
    ) -> Result<AsyncBatchCursor> {
        let pipeline = Pipeline::new(stages)?;
        options.validate()?;

        if let Some(stage) = pipeline.output_stage() {
            return Err(AggError::InvalidArgument(format!(
                "pipeline ends with {stage:?} stage and produces no cursor"
            )));
        }

        match self.run(pipeline, options).await? {
            AggregateOutcome::Cursor(cursor) => Ok(cursor),
            AggregateOutcome::Written(_) => Err(AggError::Generic(
                "aggregate without output stage was acknowledged as a write".to_string(),
            )),
        }
    }

    /// Execute a pipeline that writes its results to a collection
    ///
    /// # Returns
    /// * `Result<OutputAck>` - `InvalidArgument` unless the last stage is
    ///   `$out` or `$merge`
    pub async fn to_collection(
        &self,
        stages: Vec<Document>,
        options: &AggregateOptions,
    ) -> Result<OutputAck> {
        let pipeline = Pipeline::new(stages)?;
        options.validate()?;

        if !pipeline.has_output_stage() {
            return Err(AggError::InvalidArgument(
                "pipeline must end with a $out or $merge stage".to_string(),
            ));
        }

        match self.run(pipeline, options).await? {
            AggregateOutcome::Written(ack) => Ok(ack),
            AggregateOutcome::Cursor(cursor) => {
                cursor.close();
                Err(AggError::Generic(
                    "output-stage aggregate returned a cursor".to_string(),
                ))
            }
        }
    }

    /// First result document of a pipeline; the cursor is closed afterwards
    pub async fn first(
        &self,
        stages: Vec<Document>,
        options: &AggregateOptions,
    ) -> Result<Option<Document>> {
        let cursor = self.batch_cursor(stages, options).await?;
        DocumentCursor::new(cursor).first().await
    }

    async fn run(&self, pipeline: Pipeline, options: &AggregateOptions) -> Result<AggregateOutcome> {
        info!(
            "Executing aggregate on collection '{}' with {} pipeline stages",
            self.namespace,
            pipeline.len()
        );

        let options = self.effective_options(options);
        let command = aggregate_command(&self.namespace, &pipeline, &options);
        debug!("Aggregate command: {}", command);

        let started = Instant::now();
        let reply = self
            .channel
            .send(&self.namespace.database, command)
            .await
            .inspect_err(|e| warn!("Aggregate on '{}' failed: {}", self.namespace, e))?;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        if let Some(stage) = pipeline.output_stage() {
            check_ok(&reply)?;
            info!(
                "Aggregate on '{}' wrote its results via {:?} in {}ms",
                self.namespace, stage, elapsed_ms
            );
            return Ok(AggregateOutcome::Written(OutputAck {
                namespace: self.namespace.clone(),
                stage,
                elapsed_ms,
            }));
        }

        let response = CursorResponse::parse(&reply)?;
        info!(
            "Aggregate on '{}' returned {} documents in first batch (cursor {})",
            self.namespace,
            response.batch.len(),
            response.id
        );

        Ok(AggregateOutcome::Cursor(AsyncBatchCursor::new(
            self.channel.clone(),
            self.namespace.clone(),
            response,
            self.cursor_options(&options),
        )))
    }
}

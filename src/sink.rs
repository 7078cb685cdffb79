//! Result sink: durable destination for aggregated outputs and failure
//! records.
//!
//! Writes are keyed by run id, so a retried or duplicated write replaces the
//! previous object instead of adding a second one.

use crate::config::PipelineConfig;
use crate::error::StageError;
use crate::event::RunId;
use crate::output::AggregatedOutput;
use crate::run::PipelineRun;
use crate::storage::ObjectStore;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Store the output of a successful run. Atomic per run id.
    async fn put(&self, run_id: &RunId, output: &AggregatedOutput) -> Result<(), StageError>;

    /// Store a record describing a failed run.
    async fn put_failure(&self, run: &PipelineRun) -> Result<(), StageError>;
}

/// [`ResultSink`] writing pretty-printed JSON into an [`ObjectStore`] bucket.
pub struct StoreResultSink {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    results_prefix: String,
    failures_prefix: String,
}

impl StoreResultSink {
    pub fn new(store: Arc<dyn ObjectStore>, config: &PipelineConfig) -> Self {
        Self {
            store,
            bucket: config.result_bucket.clone(),
            results_prefix: config.results_prefix.clone(),
            failures_prefix: config.failures_prefix.clone(),
        }
    }

    /// Key under which the output of `run_id` is stored.
    pub fn output_key(&self, run_id: &RunId) -> String {
        join_key(&self.results_prefix, run_id)
    }

    /// Key under which the failure record of `run_id` is stored.
    pub fn failure_key(&self, run_id: &RunId) -> String {
        join_key(&self.failures_prefix, run_id)
    }

    /// Read back a stored output.
    pub async fn load(&self, run_id: &RunId) -> Result<Option<AggregatedOutput>, StageError> {
        if !self.store.exists(&self.bucket, &self.output_key(run_id)).await? {
            return Ok(None);
        }
        let bytes = self.store.get(&self.bucket, &self.output_key(run_id)).await?;
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StageError::Input(format!("stored output is not valid JSON: {e}")))
    }
}

fn join_key(prefix: &str, run_id: &RunId) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        format!("{run_id}.json")
    } else {
        format!("{prefix}/{run_id}.json")
    }
}

#[async_trait]
impl ResultSink for StoreResultSink {
    async fn put(&self, run_id: &RunId, output: &AggregatedOutput) -> Result<(), StageError> {
        let body = serde_json::to_vec_pretty(output)
            .map_err(|e| StageError::Fatal(format!("cannot serialise output: {e}")))?;
        let key = self.output_key(run_id);
        self.store.put(&self.bucket, &key, body).await?;
        debug!("{}: output written to {}/{}", run_id, self.bucket, key);
        Ok(())
    }

    async fn put_failure(&self, run: &PipelineRun) -> Result<(), StageError> {
        let body = serde_json::to_vec_pretty(run)
            .map_err(|e| StageError::Fatal(format!("cannot serialise failure record: {e}")))?;
        let key = self.failure_key(&run.run_id);
        self.store.put(&self.bucket, &key, body).await?;
        debug!("{}: failure record written to {}/{}", run.run_id, self.bucket, key);
        Ok(())
    }
}

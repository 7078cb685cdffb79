//! The run-status table: one [`PipelineRun`] record per run id.
//!
//! This table is what makes dispatch idempotent. [`RunStore::begin`] is the
//! only way a run comes into existence and it is atomic per id: under N
//! concurrent duplicate deliveries exactly one caller gets
//! [`BeginOutcome::Started`].

use crate::error::PipelineError;
use crate::event::RunId;
use crate::run::{PipelineRun, RunStatus};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Result of trying to create a run record.
#[derive(Debug, Clone, PartialEq)]
pub enum BeginOutcome {
    /// A new record was written (fresh id or restart of a failed run).
    Started(PipelineRun),
    /// A non-terminal or succeeded run already owns this id.
    AlreadyExists(PipelineRun),
}

/// Persisted key-value table of runs keyed by run id.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Insert `run` unless a run with the same id is non-terminal or
    /// succeeded. A failed run is replaced, with `attempt` incremented.
    async fn begin(&self, run: PipelineRun) -> Result<BeginOutcome, PipelineError>;

    async fn get(&self, run_id: &RunId) -> Result<Option<PipelineRun>, PipelineError>;

    /// Overwrite an existing record.
    async fn update(&self, run: &PipelineRun) -> Result<(), PipelineError>;

    /// All runs, ordered by id.
    async fn list(&self) -> Result<Vec<PipelineRun>, PipelineError>;

    /// Runs currently in the given status.
    async fn list_by_status(&self, status: RunStatus) -> Result<Vec<PipelineRun>, PipelineError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|r| r.status == status)
            .collect())
    }

    /// Mark every non-terminal run as Failed with `detail` and return them.
    ///
    /// Such runs were left behind by a process that stopped mid-run. Only
    /// call this while nothing in this process is executing against the
    /// table.
    async fn fail_interrupted(&self, detail: &str) -> Result<Vec<PipelineRun>, PipelineError> {
        let mut interrupted = Vec::new();
        for mut run in self.list().await?.into_iter().filter(|r| !r.is_terminal()) {
            let was = run.status;
            run.fail(detail)?;
            self.update(&run).await?;
            info!("Run '{}' was left {}; marked failed", run.run_id, was);
            interrupted.push(run);
        }
        Ok(interrupted)
    }
}

fn begin_in(table: &mut BTreeMap<RunId, PipelineRun>, mut run: PipelineRun) -> BeginOutcome {
    if let Some(existing) = table.get(&run.run_id) {
        if existing.status.blocks_new_run() {
            return BeginOutcome::AlreadyExists(existing.clone());
        }
        run.attempt = existing.attempt + 1;
        info!(
            "Restarting failed run '{}' (attempt {})",
            run.run_id, run.attempt
        );
    }
    table.insert(run.run_id.clone(), run.clone());
    BeginOutcome::Started(run)
}

fn update_in(table: &mut BTreeMap<RunId, PipelineRun>, run: &PipelineRun) -> Result<(), PipelineError> {
    match table.get_mut(&run.run_id) {
        Some(slot) => {
            *slot = run.clone();
            Ok(())
        }
        None => Err(PipelineError::RunNotFound(run.run_id.to_string())),
    }
}

// ── In-memory table ──────────────────────────────────────────────────────

/// Volatile run table.
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    runs: Mutex<BTreeMap<RunId, PipelineRun>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn begin(&self, run: PipelineRun) -> Result<BeginOutcome, PipelineError> {
        let mut table = self.runs.lock().await;
        Ok(begin_in(&mut table, run))
    }

    async fn get(&self, run_id: &RunId) -> Result<Option<PipelineRun>, PipelineError> {
        Ok(self.runs.lock().await.get(run_id).cloned())
    }

    async fn update(&self, run: &PipelineRun) -> Result<(), PipelineError> {
        update_in(&mut *self.runs.lock().await, run)
    }

    async fn list(&self) -> Result<Vec<PipelineRun>, PipelineError> {
        Ok(self.runs.lock().await.values().cloned().collect())
    }
}

// ── JSON file table ──────────────────────────────────────────────────────

/// Run table persisted as a single JSON document.
///
/// Every mutation rewrites the file through a temp file + rename while the
/// table lock is held, so the file always holds a complete, consistent
/// snapshot and `begin` stays atomic within the process.
#[derive(Debug)]
pub struct FileRunStore {
    path: PathBuf,
    runs: Mutex<BTreeMap<RunId, PipelineRun>>,
}

impl FileRunStore {
    /// Open (or create) the table at `path`.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, PipelineError> {
        let path = path.into();
        let runs = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => BTreeMap::new(),
            Ok(bytes) => {
                let list: Vec<PipelineRun> = serde_json::from_slice(&bytes).map_err(|e| {
                    PipelineError::RunStore(format!("corrupt run table {}: {e}", path.display()))
                })?;
                list.into_iter().map(|r| (r.run_id.clone(), r)).collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(PipelineError::RunStore(format!(
                    "cannot read {}: {e}",
                    path.display()
                )))
            }
        };
        debug!("Opened run table {} ({} runs)", path.display(), runs.len());
        Ok(Self {
            path,
            runs: Mutex::new(runs),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, table: &BTreeMap<RunId, PipelineRun>) -> Result<(), PipelineError> {
        let list: Vec<&PipelineRun> = table.values().collect();
        let json = serde_json::to_vec_pretty(&list)
            .map_err(|e| PipelineError::Internal(format!("serialise run table: {e}")))?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PipelineError::WriteFailed {
                    path: self.path.clone(),
                    source: e,
                })?;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, &json)
            .await
            .map_err(|e| PipelineError::WriteFailed {
                path: self.path.clone(),
                source: e,
            })?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|e| PipelineError::WriteFailed {
                path: self.path.clone(),
                source: e,
            })
    }
}

#[async_trait]
impl RunStore for FileRunStore {
    async fn begin(&self, run: PipelineRun) -> Result<BeginOutcome, PipelineError> {
        let mut table = self.runs.lock().await;
        let previous = table.get(&run.run_id).cloned();
        let outcome = begin_in(&mut table, run);
        if let BeginOutcome::Started(ref started) = outcome {
            if let Err(e) = self.persist(&table).await {
                // Not durable: roll back so a redelivery can retry the start.
                match previous {
                    Some(prev) => table.insert(started.run_id.clone(), prev),
                    None => table.remove(&started.run_id),
                };
                return Err(e);
            }
        }
        Ok(outcome)
    }

    async fn get(&self, run_id: &RunId) -> Result<Option<PipelineRun>, PipelineError> {
        Ok(self.runs.lock().await.get(run_id).cloned())
    }

    async fn update(&self, run: &PipelineRun) -> Result<(), PipelineError> {
        let mut table = self.runs.lock().await;
        update_in(&mut table, run)?;
        self.persist(&table).await
    }

    async fn list(&self) -> Result<Vec<PipelineRun>, PipelineError> {
        Ok(self.runs.lock().await.values().cloned().collect())
    }
}

//! Worker service: poll the queue, dispatch, and bound concurrent runs.
//!
//! The worker never holds more than `max_concurrent_runs` runs in flight.
//! The slots are handed to the dispatcher, which takes one before starting
//! each record, so a message carrying several records waits for slots
//! instead of overshooting. The worker only receives as many messages as it
//! has free slots, and while every slot is busy the queue is left alone, so
//! backlog accumulates in the queue rather than in memory.
//!
//! On startup the worker restarts runs that a previous process left
//! non-terminal (see [`Dispatcher::recover_interrupted`]).

use crate::config::PipelineConfig;
use crate::dispatch::Dispatcher;
use crate::error::PipelineError;
use crate::orchestrator::RunHandle;
use crate::queue::EventQueue;
use crate::run::{PipelineRun, RunStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time::sleep;
use tracing::{debug, error, info};

/// What a worker did before it stopped.
#[derive(Debug, Default)]
pub struct WorkerSummary {
    /// Runs that reached a terminal state, in completion order.
    pub runs: Vec<PipelineRun>,
    /// Queue messages received.
    pub messages: usize,
}

impl WorkerSummary {
    pub fn succeeded(&self) -> usize {
        self.runs
            .iter()
            .filter(|r| r.status == RunStatus::Succeeded)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.runs.len() - self.succeeded()
    }
}

type RunResult = Result<PipelineRun, PipelineError>;

pub struct Worker {
    dispatcher: Dispatcher,
    queue: Arc<dyn EventQueue>,
    config: Arc<PipelineConfig>,
    slots: Arc<Semaphore>,
    running: JoinSet<RunResult>,
    summary: WorkerSummary,
}

impl Worker {
    pub fn new(dispatcher: Dispatcher) -> Self {
        let queue = Arc::clone(dispatcher.queue());
        let config = Arc::clone(dispatcher.config());
        let slots = Arc::new(Semaphore::new(config.max_concurrent_runs));
        Self {
            dispatcher: dispatcher.with_run_slots(Arc::clone(&slots)),
            queue,
            config,
            slots,
            running: JoinSet::new(),
            summary: WorkerSummary::default(),
        }
    }

    /// Runs currently executing.
    pub fn in_flight(&self) -> usize {
        self.running.len()
    }

    /// Receive and dispatch at most one batch. Returns the number of
    /// messages handled.
    pub async fn poll_once(&mut self) -> Result<usize, PipelineError> {
        self.reap();

        let free = self.slots.available_permits();
        if free == 0 {
            debug!("All {} run slots busy", self.config.max_concurrent_runs);
            if let Some(res) = self.running.join_next().await {
                self.record(res);
            }
            return Ok(0);
        }

        let batch = self
            .queue
            .receive(self.config.receive_batch.min(free))
            .await?;
        let received = batch.len();
        self.summary.messages += received;

        for message in batch {
            let report = self.dispatcher.handle(message).await?;
            for handle in report.into_handles() {
                self.track(handle);
            }
        }
        Ok(received)
    }

    /// Restart runs a previous process left non-terminal. Returns how many.
    pub async fn recover(&mut self) -> Result<usize, PipelineError> {
        let handles = self.dispatcher.recover_interrupted().await?;
        let n = handles.len();
        for handle in handles {
            self.track(handle);
        }
        if n > 0 {
            info!("Restarted {} interrupted run(s)", n);
        }
        Ok(n)
    }

    /// Poll until `shutdown` flips to `true`, then wait for in-flight runs.
    ///
    /// Queue errors are logged and polling continues.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> WorkerSummary {
        let poll = Duration::from_millis(self.config.poll_interval_ms);
        info!(
            "Worker started ({} run slots, polling every {}ms)",
            self.config.max_concurrent_runs, self.config.poll_interval_ms
        );
        if let Err(e) = self.recover().await {
            error!("Could not recover interrupted runs: {}", e);
        }

        loop {
            if *shutdown.borrow() {
                break;
            }
            let handled = match self.poll_once().await {
                Ok(n) => n,
                Err(e) => {
                    error!("Queue poll failed: {}", e);
                    0
                }
            };
            if handled == 0 {
                tokio::select! {
                    _ = sleep(poll) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        info!("Worker stopping; waiting for {} run(s)", self.running.len());
        self.drain().await;
        self.summary
    }

    /// Process until the queue is empty and every started run is terminal.
    pub async fn run_until_idle(mut self) -> Result<WorkerSummary, PipelineError> {
        let poll = Duration::from_millis(self.config.poll_interval_ms);
        self.recover().await?;
        loop {
            if self.poll_once().await? > 0 {
                continue;
            }
            if self.running.is_empty() {
                if self.queue.pending().await? == 0 {
                    break;
                }
                sleep(poll).await;
                continue;
            }
            let joined = tokio::select! {
                res = self.running.join_next() => res,
                _ = sleep(poll) => None,
            };
            if let Some(res) = joined {
                self.record(res);
            }
        }
        self.drain().await;
        Ok(self.summary)
    }

    fn track(&mut self, handle: RunHandle) {
        debug!("Tracking run '{}'", handle.run_id());
        self.running.spawn(handle.wait());
    }

    fn reap(&mut self) {
        while let Some(res) = self.running.try_join_next() {
            self.record(res);
        }
    }

    async fn drain(&mut self) {
        while let Some(res) = self.running.join_next().await {
            self.record(res);
        }
    }

    fn record(&mut self, res: Result<RunResult, JoinError>) {
        match res {
            Ok(Ok(run)) => {
                debug!("Run '{}' finished as {}", run.run_id, run.status);
                self.summary.runs.push(run);
            }
            Ok(Err(e)) => error!("Run task failed: {}", e),
            Err(e) => error!("Run watcher panicked: {}", e),
        }
    }
}

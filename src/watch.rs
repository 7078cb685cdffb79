//! Inbox watcher: turns new objects in the upload bucket into queue events.
//!
//! This plays the role of the object store's change notifications when the
//! store is a plain directory. Each scan lists the bucket, and every key that
//! matches the suffix filter and has not been seen before is published as an
//! S3-style notification body. Publishing is at-least-once across restarts
//! (the seen-set is in memory); the run store turns repeats into duplicates,
//! and runs cut short by the restart are resumed by the worker.

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::event::UploadEvent;
use crate::queue::EventQueue;
use crate::storage::ObjectStore;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info};

pub struct InboxWatcher {
    store: Arc<dyn ObjectStore>,
    queue: Arc<dyn EventQueue>,
    config: Arc<PipelineConfig>,
    prefix: String,
    seen: HashSet<String>,
}

impl InboxWatcher {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        queue: Arc<dyn EventQueue>,
        config: Arc<PipelineConfig>,
    ) -> Self {
        Self {
            store,
            queue,
            config,
            prefix: String::new(),
            seen: HashSet::new(),
        }
    }

    /// Only watch keys under `prefix`.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Mark every object currently in the bucket as seen without publishing.
    pub async fn skip_existing(&mut self) -> Result<usize, PipelineError> {
        let keys = self
            .store
            .list(&self.config.upload_bucket, &self.prefix)
            .await?;
        let n = keys.len();
        self.seen.extend(keys);
        debug!("Ignoring {} pre-existing object(s)", n);
        Ok(n)
    }

    /// Publish an event for every new matching key. Returns how many were
    /// published.
    pub async fn scan(&mut self) -> Result<usize, PipelineError> {
        let bucket = &self.config.upload_bucket;
        let keys = self.store.list(bucket, &self.prefix).await?;

        let mut published = 0;
        for key in keys {
            if self.seen.contains(&key) || !self.config.accepts_key(&key) {
                continue;
            }
            let event = UploadEvent::new(bucket.clone(), key.clone(), Utc::now());
            let id = self.queue.send(event.to_notification()).await?;
            info!("New upload '{}/{}' queued as message {}", bucket, key, id);
            self.seen.insert(key);
            published += 1;
        }
        Ok(published)
    }

    /// Scan every `interval` until `shutdown` flips to `true`.
    pub async fn run(mut self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Watching '{}/{}' every {}ms",
            self.config.upload_bucket,
            self.prefix,
            interval.as_millis()
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.scan().await {
                error!("Inbox scan failed: {}", e);
            }
            tokio::select! {
                _ = sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("Inbox watcher stopped");
    }
}

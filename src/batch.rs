//! Batch coordinator.
//!
//! Runs one item per target language, strictly one at a time. Items whose
//! controller registered a runner get the full quality-converged pipeline
//! (rich mode). Anything else gets a bare translate call (plain mode).
//!
//! A stall watchdog armed at batch start flags the run as `stalled` when it
//! has not finished within the threshold. The flag is advisory: nothing is
//! cancelled.

use crate::error::{PipelineError, PipelineResult};
use crate::metrics::PipelineMetrics;
use crate::model::{ItemStatus, TranslationItem};
use crate::service::{ItemStore, TranslationService};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const DEFAULT_STALL_THRESHOLD: Duration = Duration::from_secs(180);

/// How one batch item ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ItemOutcome {
    Translated { score: Option<f64> },
    Failed { reason: String },
    Cancelled,
}

impl ItemOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ItemOutcome::Translated { .. })
    }
}

/// Full per-item pipeline, bound by the item's controller.
#[async_trait]
pub trait ItemRunner: Send + Sync {
    async fn run_item(&self) -> ItemOutcome;
}

/// Aggregate progress observed by the operator.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchProgress {
    pub done: usize,
    pub total: usize,
    pub stalled: bool,
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchItemResult {
    pub key: String,
    pub rich: bool,
    #[serde(flatten)]
    pub outcome: ItemOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub total: usize,
    pub done: usize,
    pub stalled: bool,
    pub aborted: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub items: Vec<BatchItemResult>,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.items.iter().filter(|i| i.outcome.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.items
            .iter()
            .filter(|i| matches!(i.outcome, ItemOutcome::Failed { .. }))
            .count()
    }
}

/// Flags the batch as stalled once `threshold` elapses.
///
/// Dropping the watchdog disarms it.
struct StallWatchdog {
    handle: JoinHandle<()>,
}

impl StallWatchdog {
    fn arm(threshold: Duration, progress: Arc<watch::Sender<BatchProgress>>) -> Self {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(threshold).await;
            warn!("Batch still running after {:?}", threshold);
            progress.send_modify(|p| p.stalled = true);
        });
        Self { handle }
    }

    fn disarm(self) {
        drop(self);
    }
}

impl Drop for StallWatchdog {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub struct BatchCoordinator {
    service: Arc<dyn TranslationService>,
    store: Arc<dyn ItemStore>,
    runners: Mutex<HashMap<String, Arc<dyn ItemRunner>>>,
    stall_threshold: Duration,
    progress: Arc<watch::Sender<BatchProgress>>,
    running: AtomicBool,
    abort_requested: AtomicBool,
}

impl BatchCoordinator {
    pub fn new(service: Arc<dyn TranslationService>, store: Arc<dyn ItemStore>) -> Self {
        let (progress, _) = watch::channel(BatchProgress::default());
        Self {
            service,
            store,
            runners: Mutex::new(HashMap::new()),
            stall_threshold: DEFAULT_STALL_THRESHOLD,
            progress: Arc::new(progress),
            running: AtomicBool::new(false),
            abort_requested: AtomicBool::new(false),
        }
    }

    pub fn with_stall_threshold(mut self, threshold: Duration) -> Self {
        self.stall_threshold = threshold;
        self
    }

    fn runners(&self) -> MutexGuard<'_, HashMap<String, Arc<dyn ItemRunner>>> {
        self.runners.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Bind `key` to its controller's pipeline.
    pub fn register(&self, key: impl Into<String>, runner: Arc<dyn ItemRunner>) {
        let key = key.into();
        debug!("Registered runner for {}", key);
        self.runners().insert(key, runner);
    }

    pub fn unregister(&self, key: &str) {
        if self.runners().remove(key).is_some() {
            debug!("Unregistered runner for {}", key);
        }
    }

    pub fn has_runner(&self, key: &str) -> bool {
        self.runners().contains_key(key)
    }

    pub fn subscribe(&self) -> watch::Receiver<BatchProgress> {
        self.progress.subscribe()
    }

    pub fn progress(&self) -> BatchProgress {
        self.progress.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop after the current item. No effect when no batch is running.
    pub fn abort(&self) {
        if self.is_running() {
            info!("Batch abort requested, stopping after the current item");
            self.abort_requested.store(true, Ordering::SeqCst);
        }
    }

    /// Run `items` in order. A failing item never stops the batch.
    ///
    /// Returns `Err` only when another batch is already running.
    pub async fn run_batch(&self, items: Vec<TranslationItem>) -> PipelineResult<BatchReport> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(PipelineError::InvalidState(
                "A batch is already running".to_string(),
            ));
        }
        self.abort_requested.store(false, Ordering::SeqCst);

        let total = items.len();
        let started_at = Utc::now();
        self.progress.send_replace(BatchProgress {
            done: 0,
            total,
            stalled: false,
            running: true,
            started_at: Some(started_at),
        });
        info!("Starting batch of {} item(s)", total);

        let watchdog = StallWatchdog::arm(self.stall_threshold, self.progress.clone());
        let mut results = Vec::with_capacity(total);
        let mut aborted = false;

        for (index, item) in items.into_iter().enumerate() {
            if self.abort_requested.load(Ordering::SeqCst) {
                aborted = true;
                break;
            }

            let key = item.key();
            let runner = self.runners().get(&key).cloned();
            let rich = runner.is_some();
            debug!(
                "Batch item {}/{}: {} ({} mode)",
                index + 1,
                total,
                key,
                if rich { "rich" } else { "plain" }
            );

            let outcome = match runner {
                Some(runner) => runner.run_item().await,
                None => self.run_plain(item).await,
            };
            if let ItemOutcome::Failed { reason } = &outcome {
                warn!("Batch item {} failed: {}", key, reason);
            }

            results.push(BatchItemResult { key, rich, outcome });
            self.progress.send_modify(|p| p.done = results.len());
        }

        watchdog.disarm();
        let progress = self.progress();
        self.progress.send_modify(|p| p.running = false);
        self.running.store(false, Ordering::SeqCst);

        let report = BatchReport {
            total,
            done: results.len(),
            stalled: progress.stalled,
            aborted,
            started_at,
            finished_at: Utc::now(),
            items: results,
        };
        info!(
            "Batch finished: {}/{} done, {} succeeded, {} failed{}",
            report.done,
            report.total,
            report.succeeded(),
            report.failed(),
            if aborted { " (aborted)" } else { "" }
        );
        Ok(report)
    }

    /// Bare translate with no quality gating. Persists once.
    async fn run_plain(&self, mut item: TranslationItem) -> ItemOutcome {
        let metrics = PipelineMetrics::global();
        item.set_status(ItemStatus::Translating);
        self.store.refresh(&item).await;

        metrics.record_translate_call();
        let outcome = match self
            .service
            .translate(&item.page_id, &item.language, item.variant)
            .await
        {
            Ok(id) => {
                item.id = Some(id);
                item.set_status(ItemStatus::Translated);
                ItemOutcome::Translated { score: None }
            }
            Err(e) => {
                metrics.record_translate_failure();
                error!("{}: translate failed: {}", item.key(), e);
                item.mark_error(e.reason());
                ItemOutcome::Failed { reason: e.reason() }
            }
        };

        if let Err(e) = self.store.persist(&item).await {
            warn!("{}: failed to save: {}", item.key(), e);
        }
        outcome
    }
}

//! Per-item controller.
//!
//! A [`RowController`] owns one translation item and runs at most one
//! operation on it at a time: translate, improve, or publish. Each operation
//! gets a fresh cancellation token created here and handed down to the
//! quality loop or the publish consumer. [`RowController::cancel`] fires it.
//!
//! Every terminal transition (success, exhaustion, fatal error, cancellation)
//! is persisted exactly once, from this module.

use crate::batch::{BatchCoordinator, ItemOutcome, ItemRunner};
use crate::convergence::{ConvergenceConfig, ConvergenceReport, QualityLoop};
use crate::error::{PipelineError, PipelineResult};
use crate::metrics::PipelineMetrics;
use crate::model::{ItemStatus, TranslationItem};
use crate::publish::{PublishConsumer, PublishRun, PublishStage, PublishStart};
use crate::retry::{with_retry_if, RetryConfig};
use crate::service::{ItemStore, TranslationService};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{watch, MutexGuard as ItemGuard};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const CANCELLED_REASON: &str = "Cancelled";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RowPhase {
    Translating,
    Improving,
    Publishing,
}

/// Transient progress of the row. Cleared when an operation ends.
#[derive(Debug, Clone, PartialEq)]
pub struct RowProgress {
    pub status: ItemStatus,
    pub phase: Option<RowPhase>,
    pub started_at: Option<Instant>,
}

impl RowProgress {
    pub fn elapsed(&self) -> Option<Duration> {
        self.started_at.map(|start| start.elapsed())
    }
}

struct ActiveOperation {
    phase: RowPhase,
    token: CancellationToken,
}

pub struct RowController {
    key: String,
    item: tokio::sync::Mutex<TranslationItem>,
    quality: QualityLoop,
    service: Arc<dyn TranslationService>,
    store: Arc<dyn ItemStore>,
    config: ConvergenceConfig,
    retry: RetryConfig,
    active: Mutex<Option<ActiveOperation>>,
    publish: Mutex<Option<Arc<PublishConsumer>>>,
    closing: AtomicBool,
    progress: watch::Sender<RowProgress>,
}

impl RowController {
    pub fn new(
        item: TranslationItem,
        service: Arc<dyn TranslationService>,
        store: Arc<dyn ItemStore>,
        config: ConvergenceConfig,
    ) -> Self {
        let (progress, _) = watch::channel(RowProgress {
            status: item.status,
            phase: None,
            started_at: None,
        });
        Self {
            key: item.key(),
            item: tokio::sync::Mutex::new(item),
            quality: QualityLoop::new(service.clone(), store.clone()),
            service,
            store,
            retry: RetryConfig::text_round(config.max_text_rounds),
            config,
            active: Mutex::new(None),
            publish: Mutex::new(None),
            closing: AtomicBool::new(false),
            progress,
        }
    }

    /// Override the backoff between text rounds.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current item state. Waits for an in-flight operation to finish.
    pub async fn item(&self) -> TranslationItem {
        self.item.lock().await.clone()
    }

    pub fn progress(&self) -> RowProgress {
        self.progress.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RowProgress> {
        self.progress.subscribe()
    }

    /// Progress of the open publish lifecycle, if any.
    pub fn publish_progress(&self) -> Option<PublishRun> {
        self.publish_slot().as_ref().map(|consumer| consumer.snapshot())
    }

    pub fn is_busy(&self) -> bool {
        self.active_slot().is_some()
    }

    // ==================== Registry ====================

    /// Bind this row's pipeline into `batch` so batch runs use rich mode.
    pub fn attach(self: &Arc<Self>, batch: &BatchCoordinator) {
        batch.register(self.key.clone(), self.clone());
    }

    /// Remove this row from `batch` and cancel whatever is in flight.
    pub async fn dispose(&self, batch: &BatchCoordinator) {
        batch.unregister(&self.key);
        self.cancel().await;
    }

    // ==================== Operations ====================

    /// Translate and converge the item.
    ///
    /// A transient translate failure re-runs the whole text round, up to
    /// `max_text_rounds` times.
    pub async fn translate(&self) -> PipelineResult<ConvergenceReport> {
        let (mut item, token) = self.begin(RowPhase::Translating)?;
        let key = self.key.clone();
        if self.publish_slot().take().is_some() {
            debug!("{}: previous publish lifecycle closed by re-translate", key);
        }

        let quality = &self.quality;
        let config = &self.config;
        let cancel = &token;
        let snapshot = item.clone();
        let result = with_retry_if(
            &self.retry,
            &format!("translate {}", key),
            &token,
            |_| {
                let mut attempt = snapshot.clone();
                async move {
                    let report = quality.run(&mut attempt, config, cancel).await?;
                    Ok((attempt, report))
                }
            },
            PipelineError::is_retryable,
        )
        .await;

        let result = match result {
            Ok((updated, report)) => {
                *item = updated;
                if report.exit.is_degraded() {
                    warn!("{}: translated with degraded quality ({:?})", key, report.exit);
                } else {
                    info!(
                        "{}: translated (score {:?}, {} fix round(s))",
                        key, report.score, report.fix_rounds
                    );
                }
                Ok(report)
            }
            Err(e) => {
                self.fail(&mut item, &e);
                Err(e)
            }
        };

        self.finish(&item).await;
        result
    }

    /// Run only the fix phase from the stored analysis.
    pub async fn improve(&self) -> PipelineResult<ConvergenceReport> {
        let (mut item, token) = self.begin(RowPhase::Improving)?;

        let result = match self.quality.refine(&mut item, &self.config, &token).await {
            Ok(report) => Ok(report),
            Err(PipelineError::InvalidState(reason)) => {
                self.end(&item);
                return Err(PipelineError::InvalidState(reason));
            }
            Err(e) => {
                self.fail(&mut item, &e);
                Err(e)
            }
        };

        self.finish(&item).await;
        result
    }

    /// Publish the translated item, at most once per open lifecycle.
    ///
    /// The lifecycle stays open after the run ends, so a second call returns
    /// [`PublishStart::AlreadyStarted`] until [`close_publish`](Self::close_publish)
    /// or a re-translate closes it.
    pub async fn publish(&self) -> PipelineResult<PublishStart> {
        if self.active_phase() == Some(RowPhase::Publishing) {
            return Ok(PublishStart::AlreadyStarted);
        }
        let consumer = self.open_publish();
        if consumer.has_started() {
            return Ok(PublishStart::AlreadyStarted);
        }

        let (mut item, token) = self.begin(RowPhase::Publishing)?;
        let Some(translation_id) = item.id.clone() else {
            self.end(&item);
            return Err(PipelineError::InvalidState(
                "Item has not been translated yet".to_string(),
            ));
        };
        let previous_status = item.status;
        item.set_status(ItemStatus::Publishing);
        self.set_status(item.status);
        self.store.refresh(&item).await;

        let result = consumer.start(&translation_id, &token).await;
        let result = match result {
            Ok(PublishStart::Finished(run)) => {
                self.apply_publish_run(&mut item, &run);
                Ok(PublishStart::Finished(run))
            }
            Ok(PublishStart::AlreadyStarted) => {
                item.set_status(previous_status);
                self.end(&item);
                return Ok(PublishStart::AlreadyStarted);
            }
            Err(PipelineError::Cancelled) if self.closing.swap(false, Ordering::SeqCst) => {
                info!("{}: publish closed before completion", self.key);
                item.set_status(ItemStatus::Translated);
                Err(PipelineError::Cancelled)
            }
            Err(e) => {
                self.fail(&mut item, &e);
                Err(e)
            }
        };

        self.finish(&item).await;
        result
    }

    /// End the open publish lifecycle.
    ///
    /// A publish still in flight is stopped and the item goes back to
    /// `translated`. A completed publish stays `published`. The next
    /// [`publish`](Self::publish) opens a fresh lifecycle.
    pub async fn close_publish(&self) {
        let in_flight = {
            let active = self.active_slot();
            active
                .as_ref()
                .filter(|op| op.phase == RowPhase::Publishing)
                .map(|op| op.token.clone())
        };

        if let Some(token) = in_flight {
            self.closing.store(true, Ordering::SeqCst);
            token.cancel();
            drop(self.item.lock().await);
            self.closing.store(false, Ordering::SeqCst);
        }

        if self.publish_slot().take().is_some() {
            debug!("{}: publish lifecycle closed", self.key);
        }
    }

    /// Cancel the operation in flight, if any.
    ///
    /// Returns once the operation has unwound. Returns `false` when nothing
    /// was running.
    pub async fn cancel(&self) -> bool {
        let token = self.active_slot().as_ref().map(|op| op.token.clone());
        let Some(token) = token else {
            debug!("{}: nothing to cancel", self.key);
            return false;
        };
        if token.is_cancelled() {
            return false;
        }

        token.cancel();
        drop(self.item.lock().await);
        true
    }

    // ==================== Internals ====================

    fn active_slot(&self) -> MutexGuard<'_, Option<ActiveOperation>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish_slot(&self) -> MutexGuard<'_, Option<Arc<PublishConsumer>>> {
        self.publish.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn active_phase(&self) -> Option<RowPhase> {
        self.active_slot().as_ref().map(|op| op.phase)
    }

    fn open_publish(&self) -> Arc<PublishConsumer> {
        self.publish_slot()
            .get_or_insert_with(|| Arc::new(PublishConsumer::new(self.service.clone())))
            .clone()
    }

    /// Claim the item for one operation and mint its token.
    fn begin(
        &self,
        phase: RowPhase,
    ) -> PipelineResult<(ItemGuard<'_, TranslationItem>, CancellationToken)> {
        let item = self.item.try_lock().map_err(|_| {
            PipelineError::InvalidState("Another operation is in progress".to_string())
        })?;

        let token = CancellationToken::new();
        *self.active_slot() = Some(ActiveOperation {
            phase,
            token: token.clone(),
        });
        self.progress.send_replace(RowProgress {
            status: item.status,
            phase: Some(phase),
            started_at: Some(Instant::now()),
        });
        debug!("{}: {:?} started", self.key, phase);
        Ok((item, token))
    }

    /// Release the operation slot without a terminal write.
    fn end(&self, item: &TranslationItem) {
        *self.active_slot() = None;
        self.progress.send_replace(RowProgress {
            status: item.status,
            phase: None,
            started_at: None,
        });
    }

    /// Persist the terminal state once and release the operation slot.
    async fn finish(&self, item: &TranslationItem) {
        if let Err(e) = self.store.persist(item).await {
            warn!("{}: failed to save final state: {}", self.key, e);
        }
        if let Some(elapsed) = self.progress().elapsed() {
            debug!("{}: {:?} after {:?}", self.key, item.status, elapsed);
        }
        self.end(item);
    }

    fn fail(&self, item: &mut TranslationItem, error: &PipelineError) {
        if error.is_cancelled() {
            info!("{}: cancelled by operator", self.key);
            PipelineMetrics::global().record_cancellation();
            item.mark_error(CANCELLED_REASON);
            self.publish_slot().take();
        } else {
            error!("{}: {}", self.key, error);
            item.mark_error(error.reason());
        }
    }

    fn apply_publish_run(&self, item: &mut TranslationItem, run: &PublishRun) {
        match (run.stage, run.published_url.as_deref()) {
            (PublishStage::Done, Some(url)) => item.mark_published(url),
            (PublishStage::Done, None) => {
                warn!("{}: publish finished without a page URL", self.key);
                item.mark_error("Publish finished without a page URL");
            }
            _ => item.mark_error(
                run.error_message
                    .clone()
                    .unwrap_or_else(|| "Publish failed".to_string()),
            ),
        }
    }

    fn set_status(&self, status: ItemStatus) {
        self.progress.send_modify(|p| p.status = status);
    }
}

#[async_trait]
impl ItemRunner for RowController {
    async fn run_item(&self) -> ItemOutcome {
        match self.translate().await {
            Ok(report) => ItemOutcome::Translated {
                score: report.score,
            },
            Err(PipelineError::Cancelled) => ItemOutcome::Cancelled,
            Err(e) => ItemOutcome::Failed { reason: e.reason() },
        }
    }
}

//! Collaborator interfaces the orchestrator drives.
//!
//! The translation model, quality scorer, corrector, publisher and the
//! persistence layer all live outside this crate. The orchestrator only
//! sees them through these traits.

use crate::error::{PipelineError, PipelineResult};
use crate::model::{Analysis, AnalysisContext, FixOutcome, TranslationItem, Variant};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Raw publish response body, chunked however the transport delivers it.
pub type ByteStream = BoxStream<'static, PipelineResult<Vec<u8>>>;

/// Remote translation, scoring, correction and publishing service.
#[async_trait]
pub trait TranslationService: Send + Sync {
    /// Translate a page into `language`. Returns the translation id.
    async fn translate(&self, page_id: &str, language: &str, variant: Variant)
        -> PipelineResult<String>;

    /// Score a translation. `Ok(None)` means the analyzer produced no result.
    async fn analyze(
        &self,
        translation_id: &str,
        context: Option<&AnalysisContext>,
    ) -> PipelineResult<Option<Analysis>>;

    /// Apply the analyzer's stored suggestions to the translation.
    async fn apply_fix(&self, translation_id: &str) -> PipelineResult<FixOutcome>;

    /// Translate one embedded asset (e.g. an image with text on it).
    async fn translate_side_asset(
        &self,
        translation_id: &str,
        asset_url: &str,
        language: &str,
        aspect_ratio: &str,
    ) -> PipelineResult<()>;

    /// Open the streaming publish request.
    async fn publish(&self, translation_id: &str) -> PipelineResult<ByteStream>;
}

/// Issue one collaborator call under `cancel`.
///
/// No call is issued once the token is cancelled. A call in flight when the
/// token fires is dropped, and a result that lands after cancellation is
/// discarded, so the caller always sees [`PipelineError::Cancelled`].
pub async fn call_guarded<T, F>(cancel: &CancellationToken, call: F) -> PipelineResult<T>
where
    F: Future<Output = PipelineResult<T>>,
{
    if cancel.is_cancelled() {
        return Err(PipelineError::Cancelled);
    }

    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
        result = call => result,
    };

    if cancel.is_cancelled() {
        return Err(PipelineError::Cancelled);
    }
    result
}

/// Persistence collaborator for translation items.
#[async_trait]
pub trait ItemStore: Send + Sync {
    /// Refresh persisted state after an intermediate step. Fire and forget.
    async fn refresh(&self, item: &TranslationItem);

    /// Record a terminal state transition.
    async fn persist(&self, item: &TranslationItem) -> PipelineResult<()>;
}

/// Store that keeps items in memory, keyed by [`TranslationItem::key`].
#[derive(Default)]
pub struct InMemoryStore {
    items: Mutex<HashMap<String, TranslationItem>>,
    writes: Mutex<Vec<TranslationItem>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<TranslationItem> {
        self.items.lock().ok()?.get(key).cloned()
    }

    /// Every terminal write, in order.
    pub fn writes(&self) -> Vec<TranslationItem> {
        self.writes.lock().map(|w| w.clone()).unwrap_or_default()
    }

    pub fn writes_for(&self, key: &str) -> usize {
        self.writes().iter().filter(|item| item.key() == key).count()
    }
}

#[async_trait]
impl ItemStore for InMemoryStore {
    async fn refresh(&self, item: &TranslationItem) {
        if let Ok(mut items) = self.items.lock() {
            items.insert(item.key(), item.clone());
        }
    }

    async fn persist(&self, item: &TranslationItem) -> PipelineResult<()> {
        let mut items = self
            .items
            .lock()
            .map_err(|e| PipelineError::Store(e.to_string()))?;
        items.insert(item.key(), item.clone());
        drop(items);

        self.writes
            .lock()
            .map_err(|e| PipelineError::Store(e.to_string()))?
            .push(item.clone());
        Ok(())
    }
}

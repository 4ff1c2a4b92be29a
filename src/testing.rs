//! Scripted collaborators for unit tests.

use crate::error::{PipelineError, PipelineResult};
use crate::model::{Analysis, AnalysisContext, Correction, FixOutcome, QualityIssues, Variant};
use crate::service::{ByteStream, TranslationService};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    Translate,
    Analyze,
    Fix,
    SideAsset,
    Publish,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Translate { language: String },
    Analyze { id: String, context: Option<AnalysisContext> },
    Fix { id: String },
    SideAsset { id: String, url: String },
    Publish { id: String },
}

impl Call {
    pub fn kind(&self) -> CallKind {
        match self {
            Call::Translate { .. } => CallKind::Translate,
            Call::Analyze { .. } => CallKind::Analyze,
            Call::Fix { .. } => CallKind::Fix,
            Call::SideAsset { .. } => CallKind::SideAsset,
            Call::Publish { .. } => CallKind::Publish,
        }
    }
}

pub fn analysis(score: f64, corrections: &[(&str, &str)]) -> Analysis {
    Analysis {
        score,
        issues: QualityIssues {
            fluency: corrections.iter().map(|(find, _)| format!("awkward: {}", find)).collect(),
            ..QualityIssues::default()
        },
        suggested_corrections: corrections
            .iter()
            .map(|(find, replace)| Correction::new(*find, *replace))
            .collect(),
        overall_assessment: None,
    }
}

pub fn fix_applied(corrections: &[(&str, &str)]) -> FixOutcome {
    FixOutcome {
        corrections_applied: corrections.len() as u32,
        corrections_failed: 0,
        applied_corrections: corrections
            .iter()
            .map(|(find, replace)| Correction::new(*find, *replace))
            .collect(),
        previous_score: None,
        previous_issues: None,
    }
}

pub fn api_error(status: u16, message: &str) -> PipelineError {
    PipelineError::Api {
        status,
        message: message.to_string(),
    }
}

/// Translation service whose answers are queued up front.
///
/// Every call yields once before answering, like a network round trip.
/// Empty queues fall back to defaults: translate succeeds with
/// `tr-<language>`, analyze returns `default_analysis`, fix applies one
/// correction, side assets succeed.
#[derive(Default)]
pub struct FakeService {
    calls: Mutex<Vec<Call>>,
    translate_errors: Mutex<HashMap<String, VecDeque<PipelineError>>>,
    analyses: Mutex<VecDeque<PipelineResult<Option<Analysis>>>>,
    default_analysis: Mutex<Option<Analysis>>,
    fixes: Mutex<VecDeque<PipelineResult<FixOutcome>>>,
    failing_assets: Mutex<HashSet<String>>,
    publish_chunks: Mutex<Vec<Vec<u8>>>,
    publish_error: Mutex<Option<PipelineError>>,
    publish_hold_open: Mutex<bool>,
    cancel_on: Mutex<Option<(CallKind, CancellationToken)>>,
}

impl FakeService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_translate(&self, language: &str, error: PipelineError) {
        self.translate_errors
            .lock()
            .unwrap()
            .entry(language.to_string())
            .or_default()
            .push_back(error);
    }

    pub fn push_analysis(&self, result: PipelineResult<Option<Analysis>>) {
        self.analyses.lock().unwrap().push_back(result);
    }

    pub fn set_default_analysis(&self, analysis: Analysis) {
        *self.default_analysis.lock().unwrap() = Some(analysis);
    }

    pub fn push_fix(&self, result: PipelineResult<FixOutcome>) {
        self.fixes.lock().unwrap().push_back(result);
    }

    pub fn fail_asset(&self, url: &str) {
        self.failing_assets.lock().unwrap().insert(url.to_string());
    }

    pub fn set_publish_chunks(&self, chunks: Vec<&str>) {
        *self.publish_chunks.lock().unwrap() =
            chunks.into_iter().map(|c| c.as_bytes().to_vec()).collect();
    }

    pub fn fail_publish(&self, error: PipelineError) {
        *self.publish_error.lock().unwrap() = Some(error);
    }

    /// Keep the publish stream open after the scripted chunks.
    pub fn hold_publish_open(&self) {
        *self.publish_hold_open.lock().unwrap() = true;
    }

    /// Cancel `token` the first time a call of `kind` arrives, as if the
    /// operator pressed cancel while that call was in flight.
    pub fn cancel_on(&self, kind: CallKind, token: CancellationToken) {
        *self.cancel_on.lock().unwrap() = Some((kind, token));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, kind: CallKind) -> usize {
        self.calls().iter().filter(|c| c.kind() == kind).count()
    }

    fn record(&self, call: Call) {
        let kind = call.kind();
        self.calls.lock().unwrap().push(call);

        let mut cancel_on = self.cancel_on.lock().unwrap();
        if matches!(cancel_on.as_ref(), Some((k, _)) if *k == kind) {
            if let Some((_, token)) = cancel_on.take() {
                token.cancel();
            }
        }
    }
}

#[async_trait]
impl TranslationService for FakeService {
    async fn translate(
        &self,
        _page_id: &str,
        language: &str,
        _variant: Variant,
    ) -> PipelineResult<String> {
        self.record(Call::Translate {
            language: language.to_string(),
        });
        tokio::task::yield_now().await;

        let scripted = self
            .translate_errors
            .lock()
            .unwrap()
            .get_mut(language)
            .and_then(|queue| queue.pop_front());
        match scripted {
            Some(error) => Err(error),
            None => Ok(format!("tr-{}", language)),
        }
    }

    async fn analyze(
        &self,
        translation_id: &str,
        context: Option<&AnalysisContext>,
    ) -> PipelineResult<Option<Analysis>> {
        self.record(Call::Analyze {
            id: translation_id.to_string(),
            context: context.cloned(),
        });
        tokio::task::yield_now().await;

        let scripted = self.analyses.lock().unwrap().pop_front();
        match scripted {
            Some(result) => result,
            None => Ok(self.default_analysis.lock().unwrap().clone()),
        }
    }

    async fn apply_fix(&self, translation_id: &str) -> PipelineResult<FixOutcome> {
        self.record(Call::Fix {
            id: translation_id.to_string(),
        });
        tokio::task::yield_now().await;

        let scripted = self.fixes.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(fix_applied(&[("foo", "bar")])))
    }

    async fn translate_side_asset(
        &self,
        translation_id: &str,
        asset_url: &str,
        _language: &str,
        _aspect_ratio: &str,
    ) -> PipelineResult<()> {
        self.record(Call::SideAsset {
            id: translation_id.to_string(),
            url: asset_url.to_string(),
        });
        tokio::task::yield_now().await;

        if self.failing_assets.lock().unwrap().contains(asset_url) {
            return Err(api_error(502, "Image generation failed"));
        }
        Ok(())
    }

    async fn publish(&self, translation_id: &str) -> PipelineResult<ByteStream> {
        self.record(Call::Publish {
            id: translation_id.to_string(),
        });
        tokio::task::yield_now().await;

        if let Some(error) = self.publish_error.lock().unwrap().take() {
            return Err(error);
        }

        let chunks: Vec<PipelineResult<Vec<u8>>> = self
            .publish_chunks
            .lock()
            .unwrap()
            .iter()
            .cloned()
            .map(Ok)
            .collect();
        let body = stream::iter(chunks);

        if *self.publish_hold_open.lock().unwrap() {
            Ok(body.chain(stream::pending()).boxed())
        } else {
            Ok(body.boxed())
        }
    }
}

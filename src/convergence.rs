//! Quality convergence loop.
//!
//! Drives one [`TranslationItem`] through translate → analyze → fix →
//! re-analyze until the score clears the threshold, the analyzer runs out of
//! suggestions, or the fix-round budget is spent.
//!
//! Translate failures are fatal and returned verbatim. Analyze and fix
//! failures degrade the run: the item still ends up `translated`, with
//! whatever score was last known. The loop never persists the final state
//! itself; the caller owns that single write.

use crate::error::{PipelineError, PipelineResult};
use crate::metrics::PipelineMetrics;
use crate::model::{
    Analysis, AnalysisContext, AssetStatus, Correction, ItemStatus, QualityIssues, SideAsset,
    TranslationItem,
};
use crate::service::{call_guarded, ItemStore, TranslationService};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Knobs for one convergence run.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvergenceConfig {
    pub quality_enabled: bool,
    /// Score (0-100) at which the fix phase stops.
    pub threshold: f64,
    /// Budget for re-invoking the loop after a transient translate failure.
    /// Spent by the caller, never by the loop itself.
    pub max_text_rounds: u32,
    pub max_fix_rounds: u32,
    pub has_side_assets: bool,
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self {
            quality_enabled: true,
            threshold: 85.0,
            max_text_rounds: 3,
            max_fix_rounds: 3,
            has_side_assets: true,
        }
    }
}

/// Why the loop stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum ExitReason {
    QualityDisabled,
    /// The analyzer answered without a score.
    Unscored,
    AnalyzeFailed(String),
    ThresholdMet,
    /// The analyzer had nothing left to suggest.
    NothingToFix,
    /// The corrector applied zero corrections.
    NothingApplied,
    FixFailed(String),
    RoundLimit,
}

impl ExitReason {
    /// Whether the run ended with a score below target.
    pub fn is_degraded(&self) -> bool {
        !matches!(self, ExitReason::QualityDisabled | ExitReason::ThresholdMet)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConvergenceReport {
    pub exit: ExitReason,
    pub fix_rounds: u32,
    pub score: Option<f64>,
    pub applied_corrections: Vec<Correction>,
    /// URLs of side assets that failed to translate.
    pub asset_failures: Vec<String>,
}

impl ConvergenceReport {
    fn new(exit: ExitReason, score: Option<f64>) -> Self {
        Self {
            exit,
            fix_rounds: 0,
            score,
            applied_corrections: Vec::new(),
            asset_failures: Vec::new(),
        }
    }
}

/// Ephemeral state of one fix phase.
struct ConvergenceRun {
    round: u32,
    max_rounds: u32,
    last_analysis: Analysis,
    applied_corrections: Vec<Correction>,
}

impl ConvergenceRun {
    fn new(max_rounds: u32, analysis: Analysis) -> Self {
        Self {
            round: 0,
            max_rounds,
            last_analysis: analysis,
            applied_corrections: Vec::new(),
        }
    }

    /// Context for the next re-analysis. Prefers the corrector's view of the
    /// previous score and issues, falling back to the last analysis.
    fn context(
        &self,
        previous_score: Option<f64>,
        previous_issues: Option<&QualityIssues>,
    ) -> AnalysisContext {
        AnalysisContext {
            previous_score: previous_score.or(Some(self.last_analysis.score)),
            previous_issues: previous_issues
                .cloned()
                .unwrap_or_else(|| self.last_analysis.issues.clone()),
            applied_corrections: self.applied_corrections.clone(),
        }
    }
}

pub struct QualityLoop {
    service: Arc<dyn TranslationService>,
    store: Arc<dyn ItemStore>,
}

impl QualityLoop {
    pub fn new(service: Arc<dyn TranslationService>, store: Arc<dyn ItemStore>) -> Self {
        Self { service, store }
    }

    /// Translate `item` and converge it on `config.threshold`.
    ///
    /// Returns `Err` only for a fatal translate failure or cancellation.
    pub async fn run(
        &self,
        item: &mut TranslationItem,
        config: &ConvergenceConfig,
        cancel: &CancellationToken,
    ) -> PipelineResult<ConvergenceReport> {
        let metrics = PipelineMetrics::global();
        item.set_status(ItemStatus::Translating);

        metrics.record_translate_call();
        let translation_id = match call_guarded(
            cancel,
            self.service
                .translate(&item.page_id, &item.language, item.variant),
        )
        .await
        {
            Ok(id) => id,
            Err(e) => {
                if !e.is_cancelled() {
                    metrics.record_translate_failure();
                }
                return Err(e);
            }
        };
        debug!("{}: translated as {}", item.key(), translation_id);
        item.id = Some(translation_id.clone());
        item.clear_analysis();
        self.store.refresh(item).await;

        let assets = if config.has_side_assets {
            item.side_assets.clone()
        } else {
            Vec::new()
        };

        if !config.quality_enabled {
            let outcomes = self
                .translate_side_assets(&translation_id, &item.language, &assets, cancel)
                .await?;
            let mut report = ConvergenceReport::new(ExitReason::QualityDisabled, None);
            report.asset_failures = self.apply_asset_outcomes(item, outcomes);
            item.set_status(ItemStatus::Translated);
            return Ok(report);
        }

        // Quality fields and per-asset fields are disjoint, so the analysis
        // and the asset translations may overlap.
        let (analysis, outcomes) = tokio::join!(
            self.analyze(&translation_id, None, cancel),
            self.translate_side_assets(&translation_id, &item.language, &assets, cancel),
        );
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let asset_failures = self.apply_asset_outcomes(item, outcomes?);

        let mut report = match analysis {
            Ok(Some(analysis)) => {
                item.apply_analysis(&analysis);
                self.store.refresh(item).await;
                self.fix_phase(item, &translation_id, analysis, config, cancel)
                    .await?
            }
            Ok(None) => {
                debug!("{}: analyzer returned no result", item.key());
                ConvergenceReport::new(ExitReason::Unscored, None)
            }
            Err(e) => {
                warn!("{}: quality analysis failed, leaving unscored: {}", item.key(), e);
                ConvergenceReport::new(ExitReason::AnalyzeFailed(e.reason()), None)
            }
        };
        report.asset_failures = asset_failures;

        item.set_status(ItemStatus::Translated);
        Ok(report)
    }

    /// Run only the fix phase against the stored analysis.
    ///
    /// A stored analysis without suggested corrections predates the current
    /// analyzer response shape and is replaced by a fresh analysis first.
    pub async fn refine(
        &self,
        item: &mut TranslationItem,
        config: &ConvergenceConfig,
        cancel: &CancellationToken,
    ) -> PipelineResult<ConvergenceReport> {
        let translation_id = item.id.clone().ok_or_else(|| {
            PipelineError::InvalidState("Item has not been translated yet".to_string())
        })?;
        let previous_status = item.status;
        item.set_status(ItemStatus::Translating);

        let analysis = match item.stored_analysis() {
            Some(analysis) => analysis,
            None => {
                debug!("{}: stored analysis is missing or stale, re-analyzing", item.key());
                match self.analyze(&translation_id, None, cancel).await {
                    Ok(Some(analysis)) => {
                        item.apply_analysis(&analysis);
                        self.store.refresh(item).await;
                        analysis
                    }
                    Ok(None) => {
                        item.set_status(settled(previous_status));
                        return Ok(ConvergenceReport::new(
                            ExitReason::Unscored,
                            item.quality_score,
                        ));
                    }
                    Err(e) if e.is_cancelled() => return Err(e),
                    Err(e) => {
                        warn!("{}: quality analysis failed: {}", item.key(), e);
                        item.set_status(settled(previous_status));
                        return Ok(ConvergenceReport::new(
                            ExitReason::AnalyzeFailed(e.reason()),
                            item.quality_score,
                        ));
                    }
                }
            }
        };

        let report = self
            .fix_phase(item, &translation_id, analysis, config, cancel)
            .await?;
        item.set_status(settled(previous_status));
        Ok(report)
    }

    async fn fix_phase(
        &self,
        item: &mut TranslationItem,
        translation_id: &str,
        analysis: Analysis,
        config: &ConvergenceConfig,
        cancel: &CancellationToken,
    ) -> PipelineResult<ConvergenceReport> {
        let metrics = PipelineMetrics::global();
        let mut run = ConvergenceRun::new(config.max_fix_rounds, analysis);

        let exit = loop {
            if run.last_analysis.score >= config.threshold {
                break ExitReason::ThresholdMet;
            }
            if run.round >= run.max_rounds {
                break ExitReason::RoundLimit;
            }
            if run.last_analysis.suggested_corrections.is_empty() {
                break ExitReason::NothingToFix;
            }

            let outcome = match call_guarded(cancel, self.service.apply_fix(translation_id)).await
            {
                Ok(outcome) => outcome,
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!("{}: applying corrections failed: {}", item.key(), e);
                    break ExitReason::FixFailed(e.reason());
                }
            };
            run.round += 1;
            metrics.record_fix_round();

            if outcome.corrections_applied == 0 {
                debug!("{}: corrector applied nothing, stopping", item.key());
                break ExitReason::NothingApplied;
            }
            run.applied_corrections
                .extend(outcome.applied_corrections.iter().cloned());
            self.store.refresh(item).await;

            let context = run.context(outcome.previous_score, outcome.previous_issues.as_ref());
            match self.analyze(translation_id, Some(&context), cancel).await {
                Ok(Some(next)) => {
                    info!(
                        "{}: fix round {}/{} moved score {:.0} -> {:.0} ({} issues left)",
                        item.key(),
                        run.round,
                        run.max_rounds,
                        run.last_analysis.score,
                        next.score,
                        next.issues.count()
                    );
                    item.apply_analysis(&next);
                    self.store.refresh(item).await;
                    run.last_analysis = next;
                }
                Ok(None) => {
                    break ExitReason::AnalyzeFailed("Analyzer returned no result".to_string())
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!("{}: re-analysis failed: {}", item.key(), e);
                    break ExitReason::AnalyzeFailed(e.reason());
                }
            }
        };

        Ok(ConvergenceReport {
            exit,
            fix_rounds: run.round,
            score: Some(run.last_analysis.score),
            applied_corrections: run.applied_corrections,
            asset_failures: Vec::new(),
        })
    }

    async fn analyze(
        &self,
        translation_id: &str,
        context: Option<&AnalysisContext>,
        cancel: &CancellationToken,
    ) -> PipelineResult<Option<Analysis>> {
        PipelineMetrics::global().record_analyze_call();
        call_guarded(cancel, self.service.analyze(translation_id, context)).await
    }

    /// Translate every side asset, one call per asset. Failures are collected
    /// per asset and never abort the siblings.
    async fn translate_side_assets(
        &self,
        translation_id: &str,
        language: &str,
        assets: &[SideAsset],
        cancel: &CancellationToken,
    ) -> PipelineResult<Vec<(String, PipelineResult<()>)>> {
        let mut outcomes = Vec::with_capacity(assets.len());
        for asset in assets {
            let result = call_guarded(
                cancel,
                self.service.translate_side_asset(
                    translation_id,
                    &asset.url,
                    language,
                    &asset.aspect_ratio,
                ),
            )
            .await;
            if let Err(PipelineError::Cancelled) = result {
                return Err(PipelineError::Cancelled);
            }
            outcomes.push((asset.url.clone(), result));
        }
        Ok(outcomes)
    }

    fn apply_asset_outcomes(
        &self,
        item: &mut TranslationItem,
        outcomes: Vec<(String, PipelineResult<()>)>,
    ) -> Vec<String> {
        let key = item.key();
        let mut failures = Vec::new();
        for (url, result) in outcomes {
            let Some(asset) = item.side_assets.iter_mut().find(|a| a.url == url) else {
                continue;
            };
            match result {
                Ok(()) => {
                    asset.status = AssetStatus::Translated;
                    asset.error = None;
                }
                Err(e) => {
                    warn!("{}: side asset {} failed: {}", key, url, e);
                    asset.status = AssetStatus::Failed;
                    asset.error = Some(e.reason());
                    failures.push(url);
                }
            }
        }
        failures
    }
}

/// Status to return to after a refine run.
fn settled(previous: ItemStatus) -> ItemStatus {
    if previous.is_settled() && previous != ItemStatus::Error {
        previous
    } else {
        ItemStatus::Translated
    }
}

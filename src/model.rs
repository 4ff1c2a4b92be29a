//! Domain types shared by the convergence loop, the publish consumer,
//! the batch coordinator and the row controller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A/B variant of the landing page being translated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    Control,
    B,
}

impl Variant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Variant::Control => "control",
            Variant::B => "b",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "control" | "a" => Some(Variant::Control),
            "b" => Some(Variant::B),
            _ => None,
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    None,
    Draft,
    Translating,
    Translated,
    Publishing,
    Published,
    Error,
}

impl ItemStatus {
    /// Statuses an operation may legitimately finish in.
    pub fn is_settled(&self) -> bool {
        !matches!(self, ItemStatus::Translating | ItemStatus::Publishing)
    }
}

/// Issue lists reported by the quality analyzer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityIssues {
    pub fluency: Vec<String>,
    pub grammar: Vec<String>,
    pub context_errors: Vec<String>,
    pub unlocalized_names: Vec<String>,
}

impl QualityIssues {
    pub fn count(&self) -> usize {
        self.fluency.len()
            + self.grammar.len()
            + self.context_errors.len()
            + self.unlocalized_names.len()
    }
}

/// A find/replace pair proposed by the analyzer and applied by the corrector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Correction {
    pub find: String,
    pub replace: String,
}

impl Correction {
    pub fn new(find: impl Into<String>, replace: impl Into<String>) -> Self {
        Self {
            find: find.into(),
            replace: replace.into(),
        }
    }
}

/// Result of one analyzer call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub score: f64,
    pub issues: QualityIssues,
    pub suggested_corrections: Vec<Correction>,
    pub overall_assessment: Option<String>,
}

/// Context handed to the analyzer on a re-analysis so that it does not
/// re-flag problems the corrector has already fixed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisContext {
    pub previous_score: Option<f64>,
    pub previous_issues: QualityIssues,
    pub applied_corrections: Vec<Correction>,
}

/// Result of one corrector call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FixOutcome {
    pub corrections_applied: u32,
    pub corrections_failed: u32,
    pub applied_corrections: Vec<Correction>,
    pub previous_score: Option<f64>,
    pub previous_issues: Option<QualityIssues>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetStatus {
    Pending,
    Translated,
    Failed,
}

/// An image or other embedded asset translated alongside the page text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SideAsset {
    pub url: String,
    pub aspect_ratio: String,
    pub status: AssetStatus,
    pub error: Option<String>,
}

impl SideAsset {
    pub fn new(url: impl Into<String>, aspect_ratio: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            aspect_ratio: aspect_ratio.into(),
            status: AssetStatus::Pending,
            error: None,
        }
    }
}

/// One (page, language, variant) unit of translation work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationItem {
    /// Assigned by the first successful translate call.
    pub id: Option<String>,
    pub page_id: String,
    pub language: String,
    pub variant: Variant,
    pub status: ItemStatus,
    pub quality_score: Option<f64>,
    pub quality_issues: QualityIssues,
    /// `None` when no analysis has run, or when the stored analysis predates
    /// corrections being part of the analyzer response.
    pub suggested_corrections: Option<Vec<Correction>>,
    pub published_url: Option<String>,
    pub failure_reason: Option<String>,
    pub side_assets: Vec<SideAsset>,
    pub updated_at: DateTime<Utc>,
}

impl TranslationItem {
    pub fn new(page_id: impl Into<String>, language: impl Into<String>, variant: Variant) -> Self {
        Self {
            id: None,
            page_id: page_id.into(),
            language: language.into(),
            variant,
            status: ItemStatus::None,
            quality_score: None,
            quality_issues: QualityIssues::default(),
            suggested_corrections: None,
            published_url: None,
            failure_reason: None,
            side_assets: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn with_side_assets(mut self, assets: Vec<SideAsset>) -> Self {
        self.side_assets = assets;
        self
    }

    /// Registry key used by the batch coordinator.
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.page_id, self.language, self.variant)
    }

    pub fn set_status(&mut self, status: ItemStatus) {
        self.status = status;
        if status != ItemStatus::Error {
            self.failure_reason = None;
        }
        self.updated_at = Utc::now();
    }

    pub fn mark_error(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        self.status = ItemStatus::Error;
        self.failure_reason = Some(if reason.trim().is_empty() {
            "Unknown error".to_string()
        } else {
            reason
        });
        self.updated_at = Utc::now();
    }

    pub fn mark_published(&mut self, url: impl Into<String>) {
        self.published_url = Some(url.into());
        self.set_status(ItemStatus::Published);
    }

    pub fn apply_analysis(&mut self, analysis: &Analysis) {
        self.quality_score = Some(analysis.score);
        self.quality_issues = analysis.issues.clone();
        self.suggested_corrections = Some(analysis.suggested_corrections.clone());
        self.updated_at = Utc::now();
    }

    /// Forget the analysis of a previous translation.
    pub fn clear_analysis(&mut self) {
        self.quality_score = None;
        self.quality_issues = QualityIssues::default();
        self.suggested_corrections = None;
        self.updated_at = Utc::now();
    }

    /// The stored analysis, if it is complete enough to drive a fix round.
    pub fn stored_analysis(&self) -> Option<Analysis> {
        match (self.quality_score, &self.suggested_corrections) {
            (Some(score), Some(corrections)) => Some(Analysis {
                score,
                issues: self.quality_issues.clone(),
                suggested_corrections: corrections.clone(),
                overall_assessment: None,
            }),
            _ => None,
        }
    }
}

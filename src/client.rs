//! HTTP binding of [`TranslationService`] for the localizer API.
//!
//! | call                 | endpoint                                      |
//! |----------------------|-----------------------------------------------|
//! | translate            | `POST {base}/api/translate`                   |
//! | analyze              | `POST {base}/api/translations/{id}/analyze`   |
//! | apply_fix            | `POST {base}/api/translations/{id}/fix`       |
//! | translate_side_asset | `POST {base}/api/translations/{id}/images`    |
//! | publish              | `POST {base}/api/translations/{id}/publish`   |
//!
//! Non-2xx responses carry `{"error": "..."}`, surfaced verbatim as
//! [`PipelineError::Api`].

use crate::error::{PipelineError, PipelineResult};
use crate::model::{Analysis, AnalysisContext, Correction, FixOutcome, QualityIssues, Variant};
use crate::service::{ByteStream, TranslationService};
use async_trait::async_trait;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Serialize)]
struct TranslateRequest<'a> {
    page_id: &'a str,
    language: &'a str,
    variant: Variant,
}

#[derive(Debug, Deserialize)]
struct TranslateResponse {
    id: String,
}

/// Issue lists as the analyzer names them on the wire.
#[derive(Debug, Default, Serialize, Deserialize)]
struct IssuesWire {
    #[serde(default)]
    fluency_issues: Vec<String>,
    #[serde(default)]
    grammar_issues: Vec<String>,
    #[serde(default)]
    context_errors: Vec<String>,
    #[serde(default)]
    name_localization: Vec<String>,
}

impl From<IssuesWire> for QualityIssues {
    fn from(wire: IssuesWire) -> Self {
        QualityIssues {
            fluency: wire.fluency_issues,
            grammar: wire.grammar_issues,
            context_errors: wire.context_errors,
            unlocalized_names: wire.name_localization,
        }
    }
}

impl From<&QualityIssues> for IssuesWire {
    fn from(issues: &QualityIssues) -> Self {
        IssuesWire {
            fluency_issues: issues.fluency.clone(),
            grammar_issues: issues.grammar.clone(),
            context_errors: issues.context_errors.clone(),
            name_localization: issues.unlocalized_names.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct PreviousContextWire<'a> {
    previous_score: Option<f64>,
    previous_issues: IssuesWire,
    applied_corrections: &'a [Correction],
}

#[derive(Debug, Serialize)]
struct AnalyzeRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    previous_context: Option<PreviousContextWire<'a>>,
}

#[derive(Debug, Deserialize)]
struct AnalyzeResponse {
    quality_score: Option<f64>,
    #[serde(flatten)]
    issues: IssuesWire,
    #[serde(default)]
    suggested_corrections: Vec<Correction>,
    overall_assessment: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FixResponse {
    #[serde(default)]
    corrections_applied: u32,
    #[serde(default)]
    corrections_failed: u32,
    #[serde(default)]
    applied_corrections: Vec<Correction>,
    previous_score: Option<f64>,
    previous_issues: Option<IssuesWire>,
}

#[derive(Debug, Serialize)]
struct SideAssetRequest<'a> {
    asset_url: &'a str,
    language: &'a str,
    aspect_ratio: &'a str,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

pub struct HttpTranslationService {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpTranslationService {
    /// `timeout` bounds every request end to end. `None` leaves requests
    /// unbounded and relies on cancellation.
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Option<Duration>,
    ) -> PipelineResult<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            client: builder.build()?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn translation_url(&self, translation_id: &str, action: &str) -> String {
        format!(
            "{}/api/translations/{}/{}",
            self.base_url, translation_id, action
        )
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &B,
    ) -> PipelineResult<reqwest::Response> {
        debug!("POST {}", url);
        let mut request = self.client.post(url).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&body)
            .map(|b| b.error)
            .ok()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| {
                format!(
                    "Request failed: {}",
                    status.canonical_reason().unwrap_or("unknown status")
                )
            });
        Err(PipelineError::Api {
            status: status.as_u16(),
            message,
        })
    }

    async fn post_json<B, T>(&self, url: &str, body: &B) -> PipelineResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self.post(url, body).await?;
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| PipelineError::Decode(e.to_string()))
    }
}

#[async_trait]
impl TranslationService for HttpTranslationService {
    async fn translate(
        &self,
        page_id: &str,
        language: &str,
        variant: Variant,
    ) -> PipelineResult<String> {
        let url = format!("{}/api/translate", self.base_url);
        let response: TranslateResponse = self
            .post_json(
                &url,
                &TranslateRequest {
                    page_id,
                    language,
                    variant,
                },
            )
            .await?;
        Ok(response.id)
    }

    async fn analyze(
        &self,
        translation_id: &str,
        context: Option<&AnalysisContext>,
    ) -> PipelineResult<Option<Analysis>> {
        let request = AnalyzeRequest {
            previous_context: context.map(|c| PreviousContextWire {
                previous_score: c.previous_score,
                previous_issues: IssuesWire::from(&c.previous_issues),
                applied_corrections: &c.applied_corrections,
            }),
        };
        let response: AnalyzeResponse = self
            .post_json(&self.translation_url(translation_id, "analyze"), &request)
            .await?;

        Ok(response.quality_score.map(|score| Analysis {
            score,
            issues: response.issues.into(),
            suggested_corrections: response.suggested_corrections,
            overall_assessment: response.overall_assessment,
        }))
    }

    async fn apply_fix(&self, translation_id: &str) -> PipelineResult<FixOutcome> {
        let response: FixResponse = self
            .post_json(
                &self.translation_url(translation_id, "fix"),
                &serde_json::json!({}),
            )
            .await?;

        Ok(FixOutcome {
            corrections_applied: response.corrections_applied,
            corrections_failed: response.corrections_failed,
            applied_corrections: response.applied_corrections,
            previous_score: response.previous_score,
            previous_issues: response.previous_issues.map(Into::into),
        })
    }

    async fn translate_side_asset(
        &self,
        translation_id: &str,
        asset_url: &str,
        language: &str,
        aspect_ratio: &str,
    ) -> PipelineResult<()> {
        self.post(
            &self.translation_url(translation_id, "images"),
            &SideAssetRequest {
                asset_url,
                language,
                aspect_ratio,
            },
        )
        .await?;
        Ok(())
    }

    async fn publish(&self, translation_id: &str) -> PipelineResult<ByteStream> {
        let response = self
            .post(
                &self.translation_url(translation_id, "publish"),
                &serde_json::json!({}),
            )
            .await?;

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(PipelineError::from))
            .boxed())
    }
}

use crate::convergence::ConvergenceConfig;
use crate::language::LanguageRegistry;
use crate::model::{SideAsset, Variant};
use anyhow::{bail, Context, Result};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    // Localizer API
    pub api_url: String,
    pub api_key: Option<String>,
    /// Hard per-request timeout. Unset means requests may wait indefinitely.
    pub request_timeout_secs: Option<u64>,

    // What to produce
    pub page_id: String,
    pub target_languages: Vec<String>,
    pub variant: Variant,
    pub side_assets: Vec<SideAsset>,

    // Quality convergence
    pub quality_enabled: bool,
    pub quality_threshold: f64,
    pub max_text_rounds: u32,
    pub max_fix_rounds: u32,
    pub translate_side_assets: bool,

    // Batch
    pub stall_threshold_secs: u64,
    pub publish_after_translate: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string());
        let flag = |key: &str, default: bool| {
            lookup(key)
                .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(default)
        };

        let targets = lookup("TARGET_LANGUAGES").context("TARGET_LANGUAGES not set")?;
        let registry = LanguageRegistry::get();
        let target_languages = registry
            .resolve_targets(targets.split(',').map(str::trim).filter(|c| !c.is_empty()))
            .map_err(anyhow::Error::msg)
            .with_context(|| {
                let supported: Vec<&str> =
                    registry.list_targets().iter().map(|lang| lang.code).collect();
                format!("Invalid TARGET_LANGUAGES (supported: {})", supported.join(", "))
            })?
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>();
        if target_languages.is_empty() {
            bail!("TARGET_LANGUAGES is empty");
        }

        let variant = match lookup("VARIANT") {
            Some(v) => Variant::parse(v.trim())
                .with_context(|| format!("Invalid VARIANT '{}', expected 'control' or 'b'", v))?,
            None => Variant::Control,
        };

        let quality_threshold: f64 = var("QUALITY_THRESHOLD")
            .and_then(|v| v.parse().ok())
            .unwrap_or(85.0);
        if !(0.0..=100.0).contains(&quality_threshold) {
            bail!(
                "QUALITY_THRESHOLD must be between 0 and 100, got {}",
                quality_threshold
            );
        }

        Ok(Self {
            // Localizer API
            api_url: lookup("LOCALIZER_API_URL")
                .context("LOCALIZER_API_URL not set")?
                .trim_end_matches('/')
                .to_string(),
            api_key: lookup("LOCALIZER_API_KEY").filter(|k| !k.is_empty()),
            request_timeout_secs: var("REQUEST_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .filter(|secs: &u64| *secs > 0),

            // What to produce
            page_id: lookup("PAGE_ID").context("PAGE_ID not set")?,
            target_languages,
            variant,
            side_assets: lookup("SIDE_ASSETS")
                .map(|v| parse_side_assets(&v))
                .unwrap_or_default(),

            // Quality convergence
            quality_enabled: flag("QUALITY_ENABLED", true),
            quality_threshold,
            max_text_rounds: var("MAX_TEXT_ROUNDS").and_then(|v| v.parse().ok()).unwrap_or(3),
            max_fix_rounds: var("MAX_FIX_ROUNDS").and_then(|v| v.parse().ok()).unwrap_or(3),
            translate_side_assets: flag("TRANSLATE_SIDE_ASSETS", true),

            // Batch
            stall_threshold_secs: var("STALL_THRESHOLD_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(180),
            publish_after_translate: flag("PUBLISH_AFTER_TRANSLATE", false),
        })
    }

    pub fn convergence(&self) -> ConvergenceConfig {
        ConvergenceConfig {
            quality_enabled: self.quality_enabled,
            threshold: self.quality_threshold,
            max_text_rounds: self.max_text_rounds,
            max_fix_rounds: self.max_fix_rounds,
            has_side_assets: self.translate_side_assets && !self.side_assets.is_empty(),
        }
    }

    pub fn stall_threshold(&self) -> Duration {
        Duration::from_secs(self.stall_threshold_secs)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }
}

/// `url|aspect_ratio` entries separated by commas. The ratio defaults to 1:1.
fn parse_side_assets(value: &str) -> Vec<SideAsset> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once('|') {
            Some((url, ratio)) => SideAsset::new(url.trim(), ratio.trim()),
            None => SideAsset::new(entry, "1:1"),
        })
        .collect()
}

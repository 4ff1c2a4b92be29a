//! Translation production pipeline for landing pages.
//!
//! A [`RowController`] drives one (page, language, variant) item through
//! translation, quality convergence and publishing. A [`BatchCoordinator`]
//! runs many rows one after another.

pub mod batch;
pub mod client;
pub mod config;
pub mod convergence;
pub mod error;
pub mod language;
pub mod metrics;
pub mod model;
pub mod publish;
pub mod retry;
pub mod row;
pub mod service;

#[cfg(test)]
mod testing;

pub use batch::{BatchCoordinator, BatchProgress, BatchReport, ItemOutcome, ItemRunner};
pub use client::HttpTranslationService;
pub use config::Config;
pub use convergence::{ConvergenceConfig, ConvergenceReport, ExitReason, QualityLoop};
pub use error::{PipelineError, PipelineResult};
pub use metrics::PipelineMetrics;
pub use model::{ItemStatus, SideAsset, TranslationItem, Variant};
pub use publish::{PublishConsumer, PublishRun, PublishStage, PublishStart};
pub use row::{RowController, RowPhase, RowProgress};
pub use service::{InMemoryStore, ItemStore, TranslationService};

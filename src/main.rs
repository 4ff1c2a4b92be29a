use anyhow::{Context, Result};
use landing_localizer::{
    BatchCoordinator, Config, HttpTranslationService, InMemoryStore, ItemStatus,
    PipelineMetrics, PublishStage, PublishStart, RowController, TranslationItem,
    TranslationService,
};
use std::sync::Arc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (ignored in production)
    let _ = dotenvy::dotenv();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("landing_localizer=info".parse()?),
        )
        .init();

    info!("Starting landing page localization job");

    let config = Config::from_env()?;
    info!(
        "Page {} ({}) into {} language(s): {}",
        config.page_id,
        config.variant,
        config.target_languages.len(),
        config.target_languages.join(", ")
    );

    let service: Arc<dyn TranslationService> = Arc::new(
        HttpTranslationService::new(
            config.api_url.clone(),
            config.api_key.clone(),
            config.request_timeout(),
        )
        .context("Failed to build HTTP client")?,
    );
    let store = Arc::new(InMemoryStore::new());
    let batch = Arc::new(
        BatchCoordinator::new(service.clone(), store.clone())
            .with_stall_threshold(config.stall_threshold()),
    );

    let items: Vec<TranslationItem> = config
        .target_languages
        .iter()
        .map(|language| {
            TranslationItem::new(config.page_id.clone(), language.clone(), config.variant)
                .with_side_assets(config.side_assets.clone())
        })
        .collect();
    let rows: Vec<Arc<RowController>> = items
        .iter()
        .map(|item| {
            let row = Arc::new(RowController::new(
                item.clone(),
                service.clone(),
                store.clone(),
                config.convergence(),
            ));
            row.attach(&batch);
            row
        })
        .collect();

    // Ctrl-C stops the batch after the current item and cancels it
    {
        let batch = batch.clone();
        let rows = rows.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling");
                batch.abort();
                for row in &rows {
                    row.cancel().await;
                }
            }
        });
    }

    let report = batch.run_batch(items).await?;
    if report.stalled {
        warn!("Batch took longer than {:?}", config.stall_threshold());
    }

    if config.publish_after_translate && !report.aborted {
        for row in &rows {
            if row.item().await.status != ItemStatus::Translated {
                continue;
            }
            match row.publish().await {
                Ok(PublishStart::Finished(run)) if run.stage == PublishStage::Done => {
                    info!(
                        "{} published at {}",
                        row.key(),
                        run.published_url.as_deref().unwrap_or("<no url>")
                    );
                }
                Ok(PublishStart::Finished(run)) => warn!(
                    "{} failed to publish: {}",
                    row.key(),
                    run.error_message.as_deref().unwrap_or("unknown error")
                ),
                Ok(PublishStart::AlreadyStarted) => {}
                Err(e) => warn!("{} not published: {}", row.key(), e),
            }
            row.close_publish().await;
        }
    }

    for row in &rows {
        row.dispose(&batch).await;
        let item = row.item().await;
        match item.status {
            ItemStatus::Error => error!(
                "{}: {}",
                row.key(),
                item.failure_reason.as_deref().unwrap_or("failed")
            ),
            status => info!(
                "{}: {:?} (score {})",
                row.key(),
                status,
                item.quality_score
                    .map(|s| format!("{:.0}", s))
                    .unwrap_or_else(|| "n/a".to_string())
            ),
        }
    }

    let metrics = PipelineMetrics::global().report();
    info!(
        "Metrics: {}",
        serde_json::to_string(&metrics).unwrap_or_default()
    );

    if report.total > 0 && report.succeeded() == 0 {
        anyhow::bail!("All {} translation(s) failed", report.total);
    }

    info!(
        "Done: {}/{} translated",
        report.succeeded(),
        report.total
    );
    Ok(())
}

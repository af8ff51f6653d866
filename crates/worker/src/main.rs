use std::sync::Arc;

use anyhow::Context;
use stowage_core::notify::Notifier;
use stowage_events::{BusNotifier, EmailConfig, EmailDelivery, EmailNotifier, EventBus};
use stowage_pipeline::archive::SealedTarArchiver;
use stowage_pipeline::classify::{ClassifierConfig, FsSourceClassifier};
use stowage_pipeline::hashing::Sha2Hasher;
use stowage_pipeline::ledger::StatvfsProbe;
use stowage_pipeline::transport::HttpUploader;
use stowage_pipeline::{
    Coordinator, CoordinatorServices, ItemPipeline, RecoveryEngine, SpaceLedger, UploadService,
};
use stowage_worker::WorkerConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    let fmt = if json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stowage_worker=debug,stowage_pipeline=debug".into()),
        )
        .with(fmt)
        .init();

    // --- Configuration ---
    let config = WorkerConfig::from_env()?;
    tracing::info!(
        work_dir = %config.coordinator.work_dir.display(),
        source_roots = config.source_roots.len(),
        max_usage_bytes = config.space.limits.max_usage_bytes,
        sealed = config.pipeline.password.is_some(),
        "Loaded worker configuration"
    );

    // --- Database ---
    let pool = stowage_db::create_pool(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    stowage_db::health_check(&pool)
        .await
        .context("Database health check failed")?;
    stowage_db::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;
    tracing::info!("Database ready");
    let store = Arc::new(stowage_db::PgItemStore::new(pool));

    // --- Event bus and notifications ---
    let bus = Arc::new(EventBus::default());
    let notifier: Arc<dyn Notifier> = match EmailConfig::from_env() {
        Some(email) => {
            tracing::info!(recipients = config.notify_emails.len(), "Email notifications enabled");
            Arc::new(EmailNotifier::new(
                EmailDelivery::new(email),
                config.notify_emails.clone(),
            ))
        }
        None => {
            tracing::info!("SMTP_HOST not set, notifications go to the event bus");
            Arc::new(BusNotifier::new(Arc::clone(&bus)))
        }
    };
    let log_handle = tokio::spawn(log_events(bus.subscribe()));

    // --- Pipeline ---
    let ledger = Arc::new(SpaceLedger::new(config.space.clone(), Arc::new(StatvfsProbe)));
    let pipeline = Arc::new(ItemPipeline::new(
        config.pipeline.clone(),
        store.clone(),
        Arc::clone(&ledger),
        Arc::new(Sha2Hasher),
        Arc::new(SealedTarArchiver::default()),
    ));
    let uploader = HttpUploader::new(config.upload_endpoint.clone(), config.upload_token.clone())
        .context("Failed to build upload client")?;
    let upload = Arc::new(UploadService::new(
        config.upload.clone(),
        Arc::new(uploader),
        store.clone(),
    ));
    let recovery = Arc::new(RecoveryEngine::new(config.recovery.clone(), store.clone(), notifier));
    let classifier = Arc::new(FsSourceClassifier::new(
        ClassifierConfig {
            source_roots: config.source_roots.clone(),
            excluded: vec![
                config.coordinator.work_dir.clone(),
                config.pipeline.archive_dir.clone(),
                config.pipeline.scratch_dir.clone(),
            ],
            ..ClassifierConfig::default()
        },
        store.clone(),
    ));

    let coordinator = Coordinator::new(
        config.coordinator.clone(),
        CoordinatorServices {
            store,
            ledger,
            pipeline,
            upload,
            recovery,
            classifier: Some(classifier),
            bus: Some(Arc::clone(&bus)),
        },
    );

    // --- Shutdown ---
    let on_signal = Arc::clone(&coordinator);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
            on_signal.stop().await;
        }
    });

    // --- Run ---
    let stats = coordinator.run_to_completion(config.max_items).await?;
    coordinator.stop().await;
    log_handle.abort();

    tracing::info!(
        run_id = %stats.run_id,
        processed = stats.processed,
        succeeded = stats.succeeded,
        failed = stats.failed,
        space_denied = stats.space_denied,
        success_rate = stats.success_rate,
        "Worker finished"
    );
    Ok(())
}

/// Mirror bus events into the log.
async fn log_events(mut rx: tokio::sync::broadcast::Receiver<stowage_events::BackupEvent>) {
    use tokio::sync::broadcast::error::RecvError;
    loop {
        match rx.recv().await {
            Ok(event) => tracing::info!(
                event_type = %event.event_type,
                item_id = ?event.item_id,
                payload = %event.payload,
                "Event"
            ),
            Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "Event log lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}

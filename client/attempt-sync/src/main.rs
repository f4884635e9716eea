use std::sync::Arc;

use anyhow::{Context, Result};
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use attempt_sync::{
    config::Config,
    models::sync::SyncOutcome,
    services::{
        AttemptApi, DurableAnswerQueue, FileQueueStorage, HttpAttemptApi, NetworkMonitor,
        SyncScheduler,
    },
};

/// Drains answers a crashed or closed client left in local storage for one
/// attempt: `attempt-sync <attempt-id>`
#[tokio::main]
async fn main() -> Result<()> {
    let provider = init_telemetry()?;
    let tracer = {
        use opentelemetry::trace::TracerProvider as _;
        provider.tracer("attempt-sync")
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "attempt_sync=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .init();

    let attempt_id = std::env::args()
        .nth(1)
        .context("usage: attempt-sync <attempt-id>")?;

    let config = Config::load().context("Failed to load configuration")?;
    tracing::info!(
        "Configuration loaded: api={}, storage={}",
        config.api_base_url,
        config.storage_dir.display()
    );

    let api = Arc::new(
        HttpAttemptApi::new(&config.api_base_url, config.auth_token.clone())
            .context("Failed to build attempt API client")?,
    );
    let storage = Arc::new(FileQueueStorage::new(&config.storage_dir));

    let online = match api.health_check().await {
        Ok(()) => true,
        Err(err) => {
            tracing::warn!("Attempt API unreachable: {}", err);
            false
        }
    };
    let monitor = NetworkMonitor::new(online);

    let queue = Arc::new(DurableAnswerQueue::open(storage, attempt_id.clone()));
    let pending = queue.pending_count();
    if pending == 0 {
        tracing::info!("No queued answers for attempt={}", attempt_id);
        shutdown_telemetry(provider);
        return Ok(());
    }

    let scheduler = SyncScheduler::new(api, queue, monitor, config.sync.clone());
    match scheduler.sync_all().await {
        SyncOutcome::Skipped(reason) => {
            tracing::warn!(
                "Sync skipped ({:?}); {} answers remain queued for attempt={}",
                reason,
                pending,
                attempt_id
            );
        }
        SyncOutcome::Completed(report) => {
            tracing::info!(
                "Drained attempt={}: synced={}, failed={}, remaining={}",
                attempt_id,
                report.synced,
                report.failed,
                report.remaining
            );
            for lost in &report.abandoned {
                tracing::error!(
                    "Answer for question={} could not be saved and was discarded",
                    lost.question_id
                );
            }
        }
    }

    shutdown_telemetry(provider);
    Ok(())
}

fn init_telemetry() -> Result<SdkTracerProvider> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::Resource;

    let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:4318".to_string());

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(otlp_endpoint)
        .build()
        .context("Failed to create OTLP exporter")?;

    let resource = Resource::builder_empty()
        .with_service_name("attempt-sync")
        .with_attributes(vec![KeyValue::new(
            "service.version",
            env!("CARGO_PKG_VERSION"),
        )])
        .build();

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(resource)
        .build();

    opentelemetry::global::set_tracer_provider(provider.clone());

    Ok(provider)
}

fn shutdown_telemetry(provider: SdkTracerProvider) {
    tracing::info!("Shutting down OpenTelemetry");
    if let Err(err) = provider.shutdown() {
        eprintln!("OpenTelemetry shutdown failed: {}", err);
    }
}

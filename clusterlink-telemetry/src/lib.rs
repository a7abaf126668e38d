use opentelemetry_semantic_conventions::{
    resource::{SERVICE_NAME, SERVICE_VERSION},
    SCHEMA_URL,
};
use std::{
    fs::File,
    sync::{mpsc, OnceLock},
};
use tracing::level_filters::LevelFilter;

use opentelemetry::{trace::TracerProvider, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    trace::{Sampler, SdkTracerProvider},
    Resource,
};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

const SERVICE: &str = "clusterlink";

static SUBSCRIBER_SET: OnceLock<()> = OnceLock::new();
static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();
static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();
static WORKER_HANDLE: OnceLock<std::thread::JoinHandle<()>> = OnceLock::new();

type SetupError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Common OTEL resource descriptor.
fn resource() -> Resource {
    Resource::builder()
        .with_schema_url(
            [
                KeyValue::new(SERVICE_NAME, SERVICE),
                KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
            ],
            SCHEMA_URL,
        )
        .with_service_name(SERVICE)
        .build()
}

/// The tonic exporter needs a runtime for its batch worker, so the provider is
/// built on a dedicated thread that keeps that runtime alive.
fn init_tracer_provider(ep: &str) -> Result<SdkTracerProvider, SetupError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(ep)
        .build()?;

    Ok(SdkTracerProvider::builder()
        .with_sampler(Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(
            1.0,
        ))))
        .with_resource(resource())
        .with_batch_exporter(exporter)
        .build())
}

/// Installs the file layer plus an OTLP span exporter pointed at `endpoint`.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn setup_logger(log_file_path: &str, endpoint: &str) -> Result<(), SetupError> {
    if SUBSCRIBER_SET.get().is_some() {
        return Ok(());
    }

    // ---- 1. background worker that owns the exporter runtime ----
    let (tx, rx) = mpsc::sync_channel(1);
    let endpoint_owned = endpoint.to_owned();

    let handle = std::thread::Builder::new()
        .name("otel-worker".into())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .worker_threads(2)
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    tx.send(Err(SetupError::from(e))).ok();
                    return;
                }
            };

            rt.block_on(async move {
                let provider = init_tracer_provider(&endpoint_owned);
                let failed = provider.is_err();
                tx.send(provider).ok();
                if !failed {
                    std::future::pending::<()>().await;
                }
            });
        })?;

    let provider = rx.recv()??;
    TRACER_PROVIDER.set(provider.clone()).ok();
    WORKER_HANDLE.set(handle).ok();

    // ---- 2. file layer (non-blocking) ----
    let (file_layer, guard) = {
        let file = File::create(format!("{}/{}.log", log_file_path, SERVICE))?;
        let (writer, g) = tracing_appender::non_blocking(file);
        (
            tracing_subscriber::fmt::layer()
                .with_line_number(true)
                .with_writer(writer)
                .with_filter(LevelFilter::INFO),
            g,
        )
    };
    LOG_GUARD.set(guard).ok();

    // ---- 3. OTLP layer ----
    let otel_layer = OpenTelemetryLayer::new(provider.tracer(SERVICE));

    // ---- 4. install subscriber (set only once) ----
    SUBSCRIBER_SET.get_or_init(|| {
        tracing_subscriber::registry()
            .with(LevelFilter::TRACE)
            .with(file_layer)
            .with(otel_layer)
            .try_init()
            .ok();
    });

    Ok(())
}

/// Flushes pending spans. Call before process exit.
pub fn shutdown() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            eprintln!("clusterlink telemetry shutdown failed: {e}");
        }
    }
}

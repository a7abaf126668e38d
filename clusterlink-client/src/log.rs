use std::{fs::File, sync::OnceLock};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static TRACER: OnceLock<()> = OnceLock::new();
static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs a non-blocking file subscriber writing `clusterlink.log` into
/// `log_file_path`. The OTLP endpoint is only used by the telemetry build.
pub fn setup_logger(
    log_file_path: &str,
    _ep: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    if TRACER.get().is_some() {
        return Ok(());
    }

    let file = File::create(format!("{}/clusterlink.log", log_file_path))?;
    let (non_blocking_writer, guard) = tracing_appender::non_blocking(file);

    let filter = EnvFilter::try_from_env("CLUSTERLINK_LOG")
        .unwrap_or_else(|_| EnvFilter::new(Level::INFO.as_str()));

    let file_layer = fmt::layer()
        .with_line_number(true)
        .with_writer(non_blocking_writer)
        .with_filter(filter);

    LOG_GUARD.set(guard).ok();

    TRACER.get_or_init(|| {
        tracing_subscriber::registry().with(file_layer).try_init().ok();
    });

    Ok(())
}

/// No exporter to flush without telemetry.
pub fn shutdown() {}

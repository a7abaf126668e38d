// lib.rs
use std::path::Path;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{error, info};

cfg_if::cfg_if! {
    if #[cfg(feature = "telemetry")] {
        use clusterlink_telemetry as logging;
    } else {
        mod log;
        use log as logging;
    }
}

pub mod access;
pub mod api;
pub mod catalog;
pub mod detectors;
pub mod error;
pub mod kubeconfig;
pub mod kubectl;
pub mod prober;
pub mod rbac;
pub mod registry;
pub mod replication;
pub mod session;
pub mod settings;
pub mod store;
pub mod structs;

#[cfg(test)]
mod testing;

pub use error::{ApiError, SessionError};
pub use registry::{SessionRegistry, SyncReport};
pub use replication::{DisplaySurface, ReplicationHub, ReplicationMessage, StateMirror};
pub use session::{ClusterSession, SessionServices};
pub use settings::Settings;
pub use structs::{ClusterId, ClusterModel, ClusterState, ConnectionPhase};

const OTLP_ENDPOINT: &str = "http://localhost:4317";

/// Installs the process-wide subscriber. Safe to call more than once.
pub fn init_logging(log_dir: &Path) {
    let path = log_dir.to_string_lossy();
    if let Err(e) = logging::setup_logger(&path, OTLP_ENDPOINT) {
        eprintln!("failed to set up logging in {path}: {e}");
    }
}

pub fn shutdown_logging() {
    logging::shutdown();
}

/// Builds the registry and starts answering display-surface bootstrap
/// requests. Must be called inside a tokio runtime.
pub fn start(settings: Settings) -> (Arc<SessionRegistry>, JoinHandle<()>) {
    let (hub, sync_requests) = ReplicationHub::new();
    let registry = Arc::new(SessionRegistry::new(
        SessionServices::from_settings(settings),
        hub,
    ));

    let server = registry.clone();
    let handle = tokio::spawn(async move {
        server.serve_state_requests(sync_requests).await;
        info!("state sync channel closed");
    });

    (registry, handle)
}

/// Loads settings from `path`, applies env overrides and falls back to
/// defaults on a broken file.
pub fn load_settings_or_default(path: &Path) -> Settings {
    match settings::load_settings(path) {
        Ok(settings) => settings.with_env_overrides(),
        Err(e) => {
            error!("failed to load settings from {}: {e}", path.display());
            Settings::default().with_env_overrides()
        }
    }
}

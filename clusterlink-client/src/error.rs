use std::path::PathBuf;

use thiserror::Error;

use crate::structs::ClusterId;

/// Hard errors surfaced to callers. Anything that happens inside a refresh
/// cycle is absorbed into session state instead.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Failed to read kubeconfig {path}: {message}")]
    KubeconfigRead { path: PathBuf, message: String },

    #[error("Context '{0}' not found in kubeconfig")]
    ContextNotFound(String),

    #[error("Context '{0}' has no context data")]
    EmptyContext(String),

    #[error("Cluster '{cluster}' referenced by context '{context}' not found")]
    ClusterNotFound { context: String, cluster: String },

    #[error("Cluster '{0}' has no server url")]
    MissingServer(String),

    #[error("Unknown cluster id: {0}")]
    UnknownCluster(ClusterId),

    #[error("Proxy error: {0}")]
    Proxy(String),

    #[error("Failed to parse store document: {0}")]
    StoreParse(#[from] serde_json::Error),

    #[error("Failed to parse settings: {0}")]
    SettingsParse(#[from] serde_yaml::Error),

    #[error("State sync channel closed")]
    SyncClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Classified failure of a single Kubernetes API round-trip.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("HTTP {code}: {message}")]
    Status { code: u16, message: String },

    #[error("request timed out")]
    Timeout,

    #[error("failed to fetch credentials: {0}")]
    Credentials(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("{0}")]
    Other(String),
}

impl ApiError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ApiError::Status { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_forbidden(&self) -> bool {
        self.status_code() == Some(403)
    }
}

impl From<kube::Error> for ApiError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) => ApiError::Status {
                code: resp.code,
                message: resp.message.clone(),
            },
            kube::Error::Auth(e) => ApiError::Credentials(e.to_string()),
            kube::Error::HyperError(e) => classify_transport(e.to_string()),
            kube::Error::Service(e) => classify_transport(e.to_string()),
            other => ApiError::Other(other.to_string()),
        }
    }
}

impl From<kube::config::KubeconfigError> for ApiError {
    fn from(err: kube::config::KubeconfigError) -> Self {
        ApiError::Credentials(err.to_string())
    }
}

fn classify_transport(message: String) -> ApiError {
    let lower = message.to_lowercase();
    if lower.contains("timed out") || lower.contains("timeout") || lower.contains("elapsed") {
        ApiError::Timeout
    } else {
        ApiError::Network(message)
    }
}

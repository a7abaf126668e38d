use tracing::{error, instrument};

use crate::api::KubeApi;
use crate::error::ApiError;
use crate::structs::ClusterStatus;

pub const INVALID_CREDENTIALS: &str = "Invalid credentials";
pub const CONNECTION_TIMED_OUT: &str = "Connection timed out";
pub const FAILED_TO_FETCH_CREDENTIALS: &str = "Failed to fetch credentials";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub status: ClusterStatus,
    /// `None` exactly when access was granted.
    pub failure_reason: Option<String>,
    /// Server `gitVersion`, when the call succeeded.
    pub version: Option<String>,
}

impl ProbeOutcome {
    fn granted(version: String) -> Self {
        Self {
            status: ClusterStatus::AccessGranted,
            failure_reason: None,
            version: Some(version),
        }
    }

    fn failed(status: ClusterStatus, reason: impl Into<String>) -> Self {
        Self {
            status,
            failure_reason: Some(reason.into()),
            version: None,
        }
    }
}

/// Maps a failed round-trip onto a status and a short human reason.
pub fn classify(err: &ApiError) -> ProbeOutcome {
    match err {
        ApiError::Status { code, .. } if (400..500).contains(code) => {
            ProbeOutcome::failed(ClusterStatus::AccessDenied, INVALID_CREDENTIALS)
        }
        ApiError::Status { message, .. } => {
            ProbeOutcome::failed(ClusterStatus::Offline, message.clone())
        }
        ApiError::Timeout => ProbeOutcome::failed(ClusterStatus::Offline, CONNECTION_TIMED_OUT),
        ApiError::Credentials(_) => {
            ProbeOutcome::failed(ClusterStatus::AccessDenied, FAILED_TO_FETCH_CREDENTIALS)
        }
        ApiError::Network(message) | ApiError::Other(message) => {
            ProbeOutcome::failed(ClusterStatus::Offline, message.clone())
        }
    }
}

/// One authenticated `/version` round-trip. Never fails; errors become a
/// classification.
#[instrument(skip(api), fields(context = %context_name))]
pub async fn probe(api: &dyn KubeApi, context_name: &str) -> ProbeOutcome {
    match api.version().await {
        Ok(info) => ProbeOutcome::granted(info.git_version),
        Err(e) => {
            error!("Failed to connect cluster \"{context_name}\": {e}");
            classify(&e)
        }
    }
}

/// Same classification for a client that could not even be built.
pub fn probe_connect_failure(err: &ApiError, context_name: &str) -> ProbeOutcome {
    error!("Failed to build client for cluster \"{context_name}\": {err}");
    match err {
        ApiError::Timeout | ApiError::Status { .. } => classify(err),
        _ => ProbeOutcome::failed(ClusterStatus::AccessDenied, FAILED_TO_FETCH_CREDENTIALS),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeApi;

    #[tokio::test]
    async fn test_probe_granted_reports_version() {
        let api = FakeApi::new();
        let outcome = probe(&api, "dev").await;
        assert_eq!(outcome.status, ClusterStatus::AccessGranted);
        assert_eq!(outcome.failure_reason, None);
        assert_eq!(outcome.version.as_deref(), Some("v1.30.2"));
    }

    #[tokio::test]
    async fn test_probe_4xx_is_access_denied() {
        let api = FakeApi::new().with_version_error(ApiError::Status {
            code: 403,
            message: "forbidden".into(),
        });
        let outcome = probe(&api, "dev").await;
        assert_eq!(outcome.status, ClusterStatus::AccessDenied);
        assert_eq!(outcome.failure_reason.as_deref(), Some(INVALID_CREDENTIALS));
    }

    #[tokio::test]
    async fn test_probe_5xx_keeps_upstream_message() {
        let api = FakeApi::new().with_version_error(ApiError::Status {
            code: 503,
            message: "etcd unavailable".into(),
        });
        let outcome = probe(&api, "dev").await;
        assert_eq!(outcome.status, ClusterStatus::Offline);
        assert_eq!(outcome.failure_reason.as_deref(), Some("etcd unavailable"));
    }

    #[test]
    fn test_classify_timeout_and_network() {
        let timeout = classify(&ApiError::Timeout);
        assert_eq!(timeout.status, ClusterStatus::Offline);
        assert_eq!(timeout.failure_reason.as_deref(), Some(CONNECTION_TIMED_OUT));

        let network = classify(&ApiError::Network("dns error".into()));
        assert_eq!(network.status, ClusterStatus::Offline);
        assert_eq!(network.failure_reason.as_deref(), Some("dns error"));

        let creds = classify(&ApiError::Credentials("exec plugin failed".into()));
        assert_eq!(creds.status, ClusterStatus::AccessDenied);
        assert_eq!(
            creds.failure_reason.as_deref(),
            Some(FAILED_TO_FETCH_CREDENTIALS)
        );
    }

    #[test]
    fn test_connect_failure_classification() {
        let timed_out = probe_connect_failure(&ApiError::Timeout, "dev");
        assert_eq!(timed_out.status, ClusterStatus::Offline);

        let broken = probe_connect_failure(&ApiError::Other("bad pem".into()), "dev");
        assert_eq!(broken.status, ClusterStatus::AccessDenied);
        assert_eq!(
            broken.failure_reason.as_deref(),
            Some(FAILED_TO_FETCH_CREDENTIALS)
        );
    }
}

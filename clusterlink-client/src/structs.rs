use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Stable session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterId(String);

impl ClusterId {
    /// Hex SHA-256 of `"{kubeconfig_path}:{context_name}"`.
    pub fn derive(kubeconfig_path: &Path, context_name: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(format!("{}:{}", kubeconfig_path.display(), context_name).as_bytes());
        let hash = hasher.finalize();
        Self(format!("{:x}", hash))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ClusterId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ClusterId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

pub type ClusterMetadata = BTreeMap<String, serde_json::Value>;

pub mod metadata_keys {
    pub const VERSION: &str = "version";
    pub const DISTRIBUTION: &str = "distribution";
    pub const LAST_SEEN: &str = "lastSeen";
    pub const NODES_COUNT: &str = "nodes";
    pub const CLUSTER_ID: &str = "id";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterPreferences {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_proxy: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hidden_metrics: Vec<String>,
}

/// Persisted description of a session. Credentials are stored by reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterModel {
    pub id: ClusterId,
    pub context_name: String,
    pub kube_config_path: PathBuf,
    #[serde(default)]
    pub preferences: ClusterPreferences,
    #[serde(default)]
    pub metadata: ClusterMetadata,
    #[serde(default)]
    pub accessible_namespaces: Vec<String>,
}

impl ClusterModel {
    pub fn new(kube_config_path: impl Into<PathBuf>, context_name: impl Into<String>) -> Self {
        let kube_config_path = kube_config_path.into();
        let context_name = context_name.into();
        Self {
            id: ClusterId::derive(&kube_config_path, &context_name),
            context_name,
            kube_config_path,
            preferences: ClusterPreferences::default(),
            metadata: ClusterMetadata::new(),
            accessible_namespaces: Vec::new(),
        }
    }

    pub fn with_accessible_namespaces(mut self, namespaces: Vec<String>) -> Self {
        self.accessible_namespaces = namespaces;
        self
    }

    pub fn with_cluster_name(mut self, name: impl Into<String>) -> Self {
        self.preferences.cluster_name = Some(name.into());
        self
    }
}

/// Outcome of a connection probe. Ordering matters: anything above
/// `Offline` means the server answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ClusterStatus {
    Offline = 0,
    AccessDenied = 1,
    AccessGranted = 2,
}

/// The replicated subset of session state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterState {
    pub api_url: String,
    pub online: bool,
    pub ready: bool,
    pub disconnected: bool,
    pub accessible: bool,
    pub reconnecting: bool,
    pub failure_reason: Option<String>,
    pub is_admin: bool,
    pub allowed_namespaces: Vec<String>,
    pub allowed_resources: Vec<String>,
    pub is_global_watch_enabled: bool,
}

impl ClusterState {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            online: false,
            ready: false,
            disconnected: true,
            accessible: false,
            reconnecting: false,
            failure_reason: None,
            is_admin: false,
            allowed_namespaces: Vec::new(),
            allowed_resources: Vec::new(),
            is_global_watch_enabled: false,
        }
    }

    pub fn available(&self) -> bool {
        self.accessible && !self.disconnected
    }

    pub fn phase(&self) -> ConnectionPhase {
        if self.reconnecting {
            ConnectionPhase::Reconnecting
        } else if self.disconnected {
            ConnectionPhase::Disconnected
        } else if self.ready {
            ConnectionPhase::Ready
        } else if self.accessible {
            ConnectionPhase::ConnectedAccessible
        } else {
            ConnectionPhase::ConnectedInaccessible
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionPhase {
    Disconnected,
    Reconnecting,
    ConnectedInaccessible,
    ConnectedAccessible,
    Ready,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RefreshOptions {
    pub refresh_metadata: bool,
}

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::api::KubeApi;
use crate::error::ApiError;
use crate::structs::{metadata_keys, ClusterMetadata};

/// Everything a detector may look at.
pub struct DetectContext {
    pub api: Arc<dyn KubeApi>,
    pub api_url: String,
}

/// Produces one metadata entry for a cluster.
#[async_trait]
pub trait ClusterDetector: Send + Sync {
    fn key(&self) -> &'static str;

    async fn detect(&self, ctx: &DetectContext) -> Result<Value, ApiError>;
}

#[derive(Default)]
pub struct DetectorRegistry {
    detectors: Vec<Box<dyn ClusterDetector>>,
}

impl DetectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        Self::new()
            .add(ClusterIdDetector)
            .add(LastSeenDetector)
            .add(VersionDetector)
            .add(DistributionDetector)
            .add(NodesCountDetector)
    }

    pub fn add(mut self, detector: impl ClusterDetector + 'static) -> Self {
        self.detectors.push(Box::new(detector));
        self
    }

    pub fn len(&self) -> usize {
        self.detectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detectors.is_empty()
    }

    /// Runs every detector concurrently. Failed detectors are skipped; for a
    /// duplicated key the later registration wins.
    #[tracing::instrument(skip_all, fields(api_url = %ctx.api_url))]
    pub async fn detect_for_cluster(&self, ctx: &DetectContext) -> ClusterMetadata {
        let results = join_all(self.detectors.iter().map(|d| async move {
            (d.key(), d.detect(ctx).await)
        }))
        .await;

        let mut metadata = ClusterMetadata::new();
        for (key, result) in results {
            match result {
                Ok(value) => {
                    debug!(key, "detected {value}");
                    metadata.insert(key.to_string(), value);
                }
                Err(e) => warn!(key, "detector failed: {e}"),
            }
        }
        metadata
    }
}

pub struct VersionDetector;

#[async_trait]
impl ClusterDetector for VersionDetector {
    fn key(&self) -> &'static str {
        metadata_keys::VERSION
    }

    async fn detect(&self, ctx: &DetectContext) -> Result<Value, ApiError> {
        Ok(Value::from(ctx.api.version().await?.git_version))
    }
}

pub struct LastSeenDetector;

#[async_trait]
impl ClusterDetector for LastSeenDetector {
    fn key(&self) -> &'static str {
        metadata_keys::LAST_SEEN
    }

    async fn detect(&self, ctx: &DetectContext) -> Result<Value, ApiError> {
        ctx.api.version().await?;
        Ok(Value::from(Utc::now().to_rfc3339()))
    }
}

pub struct NodesCountDetector;

#[async_trait]
impl ClusterDetector for NodesCountDetector {
    fn key(&self) -> &'static str {
        metadata_keys::NODES_COUNT
    }

    async fn detect(&self, ctx: &DetectContext) -> Result<Value, ApiError> {
        Ok(Value::from(ctx.api.count_nodes().await?))
    }
}

pub struct DistributionDetector;

#[async_trait]
impl ClusterDetector for DistributionDetector {
    fn key(&self) -> &'static str {
        metadata_keys::DISTRIBUTION
    }

    async fn detect(&self, ctx: &DetectContext) -> Result<Value, ApiError> {
        let version = ctx.api.version().await?;
        Ok(Value::from(distribution_for(&version.git_version, &ctx.api_url)))
    }
}

/// Guesses the distribution from the server version string and API host.
pub fn distribution_for(git_version: &str, api_url: &str) -> &'static str {
    let version = git_version.to_lowercase();
    let url = api_url.to_lowercase();

    if version.contains("-eks-") || url.ends_with("eks.amazonaws.com") {
        "eks"
    } else if version.contains("-gke.") {
        "gke"
    } else if url.contains(".azmk8s.io") {
        "aks"
    } else if url.contains("k8s.ondigitalocean.com") {
        "digitalocean"
    } else if version.contains("+k3s") {
        "k3s"
    } else if version.contains("+rke2") {
        "rke2"
    } else if version.contains("+k0s") {
        "k0s"
    } else if version.contains("-mirantis-") || version.contains("-docker-") {
        "mirantis"
    } else if version.contains("+vmware") {
        "vmware"
    } else if version.contains("-tke.") {
        "tencent"
    } else {
        "custom"
    }
}

/// Stable fingerprint of the cluster itself, independent of which kubeconfig
/// points at it.
pub struct ClusterIdDetector;

#[async_trait]
impl ClusterDetector for ClusterIdDetector {
    fn key(&self) -> &'static str {
        metadata_keys::CLUSTER_ID
    }

    async fn detect(&self, ctx: &DetectContext) -> Result<Value, ApiError> {
        let uid = ctx.api.namespace_uid("default").await.unwrap_or(None);
        let mut hasher = Sha256::new();
        hasher.update(ctx.api_url.as_bytes());
        if let Some(uid) = uid {
            hasher.update(uid.as_bytes());
        }
        Ok(Value::from(format!("{:x}", hasher.finalize())))
    }
}

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::kubeconfig;
use crate::structs::{ClusterId, ClusterModel, ClusterState};

pub const KIND: &str = "KubernetesCluster";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntityMetadata {
    pub uid: String,
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesClusterSpec {
    pub kubeconfig_path: PathBuf,
    pub kubeconfig_context: String,
    #[serde(default)]
    pub accessible_namespaces: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityPhase {
    Connected,
    #[default]
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KubernetesClusterStatus {
    pub phase: EntityPhase,
    pub active: bool,
}

impl From<&ClusterState> for KubernetesClusterStatus {
    fn from(state: &ClusterState) -> Self {
        let phase = if state.disconnected {
            EntityPhase::Disconnected
        } else {
            EntityPhase::Connected
        };
        Self {
            phase,
            active: !state.disconnected,
        }
    }
}

/// Shared, mutable status of a catalog entity. Clones point at the same
/// status.
#[derive(Debug, Clone, Default)]
pub struct StatusHandle(Arc<Mutex<KubernetesClusterStatus>>);

impl StatusHandle {
    pub fn get(&self) -> KubernetesClusterStatus {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set(&self, status: KubernetesClusterStatus) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = status;
    }
}

/// Catalog view of one kubeconfig context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesCluster {
    pub metadata: CatalogEntityMetadata,
    pub spec: KubernetesClusterSpec,
    #[serde(skip)]
    pub status: StatusHandle,
}

impl KubernetesCluster {
    pub fn new(kubeconfig_path: impl Into<PathBuf>, context: impl Into<String>) -> Self {
        let kubeconfig_path = kubeconfig_path.into();
        let context = context.into();
        let mut labels = BTreeMap::new();
        if let Some(file) = kubeconfig_path.file_name() {
            labels.insert("file".to_string(), file.to_string_lossy().into_owned());
        }

        Self {
            metadata: CatalogEntityMetadata {
                uid: ClusterId::derive(&kubeconfig_path, &context).to_string(),
                name: context.clone(),
                labels,
            },
            spec: KubernetesClusterSpec {
                kubeconfig_path,
                kubeconfig_context: context,
                accessible_namespaces: Vec::new(),
            },
            status: StatusHandle::default(),
        }
    }

    pub fn cluster_id(&self) -> ClusterId {
        ClusterId::from(self.metadata.uid.as_str())
    }

    pub fn to_model(&self) -> ClusterModel {
        ClusterModel {
            id: self.cluster_id(),
            ..ClusterModel::new(&self.spec.kubeconfig_path, &self.spec.kubeconfig_context)
        }
        .with_cluster_name(self.metadata.name.clone())
        .with_accessible_namespaces(self.spec.accessible_namespaces.clone())
    }
}

/// One entity per context of the kubeconfig at `path`.
pub fn entities_from_kubeconfig(path: &Path) -> Result<Vec<KubernetesCluster>, SessionError> {
    Ok(kubeconfig::context_names(path)?
        .into_iter()
        .map(|context| KubernetesCluster::new(path, context))
        .collect())
}

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::SessionError;
use crate::structs::{ClusterId, ClusterModel};

/// On-disk document: every known cluster plus the last active one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStoreModel {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_cluster: Option<ClusterId>,
    #[serde(default)]
    pub clusters: Vec<ClusterModel>,
}

/// A missing file is an empty store.
pub fn load_store(path: &Path) -> Result<ClusterStoreModel, SessionError> {
    if !path.exists() {
        debug!("store: {} does not exist yet", path.display());
        return Ok(ClusterStoreModel::default());
    }
    let content = std::fs::read_to_string(path)?;
    if content.trim().is_empty() {
        return Ok(ClusterStoreModel::default());
    }
    Ok(serde_json::from_str(&content)?)
}

/// Writes through a sibling temp file so a crash never leaves half a document.
pub fn save_store(path: &Path, model: &ClusterStoreModel) -> Result<(), SessionError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(model)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    info!("store: saved {} clusters to {}", model.clusters.len(), path.display());
    Ok(())
}

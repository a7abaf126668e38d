use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use kube::config::Kubeconfig;
use tracing::{debug, info};

use crate::error::SessionError;
use crate::structs::ClusterId;

/// What a session needs from a validated context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedContext {
    pub context_name: String,
    pub cluster_name: String,
    pub api_url: String,
    pub namespace: Option<String>,
}

pub fn load_config(path: &Path) -> Result<Kubeconfig, SessionError> {
    Kubeconfig::read_from(path).map_err(|e| SessionError::KubeconfigRead {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Checks that `context_name` exists and points at a cluster with a server.
/// The user stanza is not validated; exec plugins may resolve it later.
pub fn resolve_context(
    config: &Kubeconfig,
    context_name: &str,
) -> Result<ResolvedContext, SessionError> {
    let named_ctx = config
        .contexts
        .iter()
        .find(|c| c.name == context_name)
        .ok_or_else(|| SessionError::ContextNotFound(context_name.to_string()))?;

    let ctx = named_ctx
        .context
        .as_ref()
        .ok_or_else(|| SessionError::EmptyContext(context_name.to_string()))?;

    let cluster = config
        .clusters
        .iter()
        .find(|c| c.name == ctx.cluster)
        .ok_or_else(|| SessionError::ClusterNotFound {
            context: context_name.to_string(),
            cluster: ctx.cluster.clone(),
        })?;

    let api_url = cluster
        .cluster
        .as_ref()
        .and_then(|c| c.server.clone())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| SessionError::MissingServer(ctx.cluster.clone()))?;

    Ok(ResolvedContext {
        context_name: context_name.to_string(),
        cluster_name: ctx.cluster.clone(),
        api_url,
        namespace: ctx.namespace.clone().filter(|ns| !ns.is_empty()),
    })
}

pub fn resolve_context_from(path: &Path, context_name: &str) -> Result<ResolvedContext, SessionError> {
    let config = load_config(path)?;
    resolve_context(&config, context_name)
}

/// Namespace pinned by the context, re-read from disk each time so edits to
/// the file are honoured.
pub fn context_namespace(path: &Path, context_name: &str) -> Option<String> {
    match resolve_context_from(path, context_name) {
        Ok(resolved) => resolved.namespace,
        Err(e) => {
            debug!("kubeconfig: no context namespace for {context_name}: {e}");
            None
        }
    }
}

/// Names of every context in the file, in file order.
pub fn context_names(path: &Path) -> Result<Vec<String>, SessionError> {
    let config = load_config(path)?;
    Ok(config.contexts.into_iter().map(|c| c.name).collect())
}

pub fn custom_kubeconfig_path(dir: &Path, id: &ClusterId) -> PathBuf {
    dir.join(id.as_str())
}

/// True when `path` sits inside the managed directory and therefore belongs
/// to the session rather than to the user.
pub fn is_managed(dir: &Path, path: &Path) -> bool {
    let normalize = |p: &Path| p.canonicalize().unwrap_or_else(|_| p.to_path_buf());
    normalize(path).starts_with(normalize(dir))
}

/// Writes pasted kubeconfig text into the managed directory (mode 0600 on
/// unix) and returns its path.
pub fn embed_custom_kubeconfig(
    dir: &Path,
    id: &ClusterId,
    contents: &str,
) -> Result<PathBuf, SessionError> {
    std::fs::create_dir_all(dir)?;
    let path = custom_kubeconfig_path(dir, id);

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(&path)?;
    file.write_all(contents.as_bytes())?;
    info!("kubeconfig: embedded custom config at {}", path.display());
    Ok(path)
}

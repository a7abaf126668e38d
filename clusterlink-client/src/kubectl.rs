use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::api::ConnectTarget;
use crate::error::SessionError;
use crate::structs::ClusterId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    pub host: String,
    pub port: u16,
}

impl ProxyEndpoint {
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Local reverse proxy in front of one session's API server.
#[async_trait]
pub trait ProxyServer: Send + Sync {
    /// Starts the proxy for `id` unless one is already running.
    async fn ensure_server(
        &self,
        id: &ClusterId,
        target: &ConnectTarget,
    ) -> Result<ProxyEndpoint, SessionError>;

    /// Stops the proxy for `id`; a no-op if none is running.
    async fn stop_server(&self, id: &ClusterId);
}

/// Makes sure a kubectl matching the server is available. Called in the
/// background after a successful activation.
#[async_trait]
pub trait KubectlProvisioner: Send + Sync {
    async fn ensure_kubectl(&self, server_version: Option<String>) -> Result<PathBuf, SessionError>;
}

fn resolve_kubectl(configured: Option<&PathBuf>) -> Result<PathBuf, SessionError> {
    match configured {
        Some(path) => Ok(path.clone()),
        None => which::which("kubectl")
            .map_err(|e| SessionError::Proxy(format!("kubectl not found on PATH: {e}"))),
    }
}

/// `kubectl proxy` parses to `Starting to serve on 127.0.0.1:37241`.
pub fn parse_serving_line(line: &str) -> Option<ProxyEndpoint> {
    let addr = line.trim().strip_prefix("Starting to serve on ")?;
    let (host, port) = addr.rsplit_once(':')?;
    Some(ProxyEndpoint {
        host: host.to_string(),
        port: port.parse().ok()?,
    })
}

struct ProxyProcess {
    child: Child,
    endpoint: ProxyEndpoint,
}

/// One `kubectl proxy --port=0` child per session.
pub struct KubectlProxy {
    kubectl: Option<PathBuf>,
    start_timeout: Duration,
    servers: Mutex<HashMap<ClusterId, ProxyProcess>>,
}

impl KubectlProxy {
    pub fn new(kubectl: Option<PathBuf>, start_timeout: Duration) -> Self {
        Self {
            kubectl,
            start_timeout,
            servers: Mutex::new(HashMap::new()),
        }
    }

    async fn spawn(&self, target: &ConnectTarget) -> Result<ProxyProcess, SessionError> {
        let bin = resolve_kubectl(self.kubectl.as_ref())?;

        let mut child = Command::new(bin)
            .arg("proxy")
            .arg("--port=0")
            .arg("--disable-filter=true")
            .arg(format!("--kubeconfig={}", target.kubeconfig_path.display()))
            .arg(format!("--context={}", target.context_name))
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SessionError::Proxy(format!("failed to spawn kubectl proxy: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SessionError::Proxy("kubectl proxy has no stdout".into()))?;
        let mut lines = BufReader::new(stdout).lines();

        let waited = tokio::time::timeout(self.start_timeout, async {
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("kubectl proxy: {line}");
                if let Some(endpoint) = parse_serving_line(&line) {
                    return Some(endpoint);
                }
            }
            None
        })
        .await;

        let endpoint = match waited {
            Ok(Some(endpoint)) => endpoint,
            Ok(None) => {
                let _ = child.kill().await;
                return Err(SessionError::Proxy("kubectl proxy exited before serving".into()));
            }
            Err(_) => {
                let _ = child.kill().await;
                return Err(SessionError::Proxy("kubectl proxy start timed out".into()));
            }
        };

        // keep the pipe drained so the child never blocks on stdout
        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("kubectl proxy: {line}");
            }
        });

        Ok(ProxyProcess { child, endpoint })
    }
}

#[async_trait]
impl ProxyServer for KubectlProxy {
    #[tracing::instrument(skip(self, target))]
    async fn ensure_server(
        &self,
        id: &ClusterId,
        target: &ConnectTarget,
    ) -> Result<ProxyEndpoint, SessionError> {
        let mut servers = self.servers.lock().await;

        if let Some(existing) = servers.get_mut(id) {
            if matches!(existing.child.try_wait(), Ok(None)) {
                return Ok(existing.endpoint.clone());
            }
            warn!("kubectl proxy for {id} exited; restarting");
            servers.remove(id);
        }

        let process = self.spawn(target).await?;
        let endpoint = process.endpoint.clone();
        info!("kubectl proxy for {id} listening on {}", endpoint.url());
        servers.insert(id.clone(), process);
        Ok(endpoint)
    }

    #[tracing::instrument(skip(self))]
    async fn stop_server(&self, id: &ClusterId) {
        let removed = self.servers.lock().await.remove(id);
        if let Some(mut process) = removed {
            if let Err(e) = process.child.kill().await {
                warn!("failed to stop kubectl proxy for {id}: {e}");
            } else {
                info!("kubectl proxy for {id} stopped");
            }
        }
    }
}

/// Resolves the kubectl binary from settings or PATH.
pub struct KubectlBinary {
    configured: Option<PathBuf>,
}

impl KubectlBinary {
    pub fn new(configured: Option<PathBuf>) -> Self {
        Self { configured }
    }
}

#[async_trait]
impl KubectlProvisioner for KubectlBinary {
    async fn ensure_kubectl(&self, server_version: Option<String>) -> Result<PathBuf, SessionError> {
        let path = resolve_kubectl(self.configured.as_ref())?;
        info!(
            server_version = server_version.as_deref().unwrap_or("unknown"),
            "using kubectl at {}",
            path.display()
        );
        Ok(path)
    }
}

//! In-memory stand-ins for the API server, proxy and kubectl used by tests.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::authorization::v1::ResourceAttributes;
use k8s_openapi::apimachinery::pkg::version::Info;
use tempfile::TempDir;

use crate::api::{ConnectTarget, Connector, KubeApi};
use crate::detectors::DetectorRegistry;
use crate::error::{ApiError, SessionError};
use crate::kubeconfig::fixtures::write_kubeconfig;
use crate::kubectl::{KubectlProvisioner, ProxyEndpoint, ProxyServer};
use crate::session::{ClusterSession, SessionServices};
use crate::settings::Settings;
use crate::structs::{ClusterId, ClusterModel};

type AccessRule = Arc<dyn Fn(&ResourceAttributes) -> Result<bool, ApiError> + Send + Sync>;

pub fn version_info(git_version: &str) -> Info {
    Info {
        git_version: git_version.to_string(),
        major: "1".into(),
        minor: "30".into(),
        ..Default::default()
    }
}

pub struct FakeApi {
    version: Mutex<Result<Info, ApiError>>,
    namespaces: Mutex<Result<Vec<String>, ApiError>>,
    access: Mutex<AccessRule>,
    nodes: usize,
    namespace_uid: Option<String>,
    ssar_delay: Option<Duration>,
    ssar_log: Mutex<Vec<ResourceAttributes>>,
    in_flight: AtomicUsize,
    pub version_calls: AtomicUsize,
    pub namespace_calls: AtomicUsize,
    pub ssar_calls: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl Default for FakeApi {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeApi {
    pub fn new() -> Self {
        Self {
            version: Mutex::new(Ok(version_info("v1.30.2"))),
            namespaces: Mutex::new(Ok(vec!["default".into(), "kube-system".into()])),
            access: Mutex::new(Arc::new(|_| Ok(true))),
            nodes: 1,
            namespace_uid: Some("5a1c4e5e-0000-4000-8000-000000000001".into()),
            ssar_delay: None,
            ssar_log: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            version_calls: AtomicUsize::new(0),
            namespace_calls: AtomicUsize::new(0),
            ssar_calls: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_version_error(self, err: ApiError) -> Self {
        self.set_version_result(Err(err));
        self
    }

    pub fn with_namespaces(self, namespaces: &[&str]) -> Self {
        self.set_namespaces_result(Ok(namespaces.iter().map(|s| s.to_string()).collect()));
        self
    }

    pub fn with_access<F>(self, rule: F) -> Self
    where
        F: Fn(&ResourceAttributes) -> Result<bool, ApiError> + Send + Sync + 'static,
    {
        self.set_access(rule);
        self
    }

    pub fn with_nodes(mut self, nodes: usize) -> Self {
        self.nodes = nodes;
        self
    }

    pub fn with_ssar_delay(mut self, delay: Duration) -> Self {
        self.ssar_delay = Some(delay);
        self
    }

    pub fn set_version_result(&self, result: Result<Info, ApiError>) {
        *self.version.lock().unwrap() = result;
    }

    pub fn set_namespaces_result(&self, result: Result<Vec<String>, ApiError>) {
        *self.namespaces.lock().unwrap() = result;
    }

    pub fn set_access<F>(&self, rule: F)
    where
        F: Fn(&ResourceAttributes) -> Result<bool, ApiError> + Send + Sync + 'static,
    {
        *self.access.lock().unwrap() = Arc::new(rule);
    }

    pub fn ssar_log(&self) -> Vec<ResourceAttributes> {
        self.ssar_log.lock().unwrap().clone()
    }
}

#[async_trait]
impl KubeApi for FakeApi {
    async fn version(&self) -> Result<Info, ApiError> {
        self.version_calls.fetch_add(1, Ordering::SeqCst);
        self.version.lock().unwrap().clone()
    }

    async fn list_namespaces(&self) -> Result<Vec<String>, ApiError> {
        self.namespace_calls.fetch_add(1, Ordering::SeqCst);
        self.namespaces.lock().unwrap().clone()
    }

    async fn can_i(&self, attrs: ResourceAttributes) -> Result<bool, ApiError> {
        self.ssar_calls.fetch_add(1, Ordering::SeqCst);
        self.ssar_log.lock().unwrap().push(attrs.clone());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.ssar_delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        // cloned out so a panicking rule never poisons the lock
        let rule = self.access.lock().unwrap().clone();
        rule(&attrs)
    }

    async fn count_nodes(&self) -> Result<usize, ApiError> {
        Ok(self.nodes)
    }

    async fn namespace_uid(&self, _name: &str) -> Result<Option<String>, ApiError> {
        Ok(self.namespace_uid.clone())
    }
}

pub struct FakeConnector {
    pub api: Arc<FakeApi>,
    failure: Mutex<Option<ApiError>>,
    pub connects: AtomicUsize,
}

impl FakeConnector {
    pub fn new(api: Arc<FakeApi>) -> Self {
        Self {
            api,
            failure: Mutex::new(None),
            connects: AtomicUsize::new(0),
        }
    }

    pub fn fail_with(&self, err: Option<ApiError>) {
        *self.failure.lock().unwrap() = err;
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, _target: &ConnectTarget) -> Result<Arc<dyn KubeApi>, ApiError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.failure.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(self.api.clone() as Arc<dyn KubeApi>)
    }
}

#[derive(Default)]
pub struct FakeProxy {
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    failure: Mutex<Option<String>>,
}

impl FakeProxy {
    pub fn fail_with(&self, message: Option<&str>) {
        *self.failure.lock().unwrap() = message.map(str::to_string);
    }
}

#[async_trait]
impl ProxyServer for FakeProxy {
    async fn ensure_server(
        &self,
        _id: &ClusterId,
        _target: &ConnectTarget,
    ) -> Result<ProxyEndpoint, SessionError> {
        if let Some(message) = self.failure.lock().unwrap().clone() {
            return Err(SessionError::Proxy(message));
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(ProxyEndpoint {
            host: "127.0.0.1".into(),
            port: 8001,
        })
    }

    async fn stop_server(&self, _id: &ClusterId) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeProvisioner {
    pub calls: AtomicUsize,
}

#[async_trait]
impl KubectlProvisioner for FakeProvisioner {
    async fn ensure_kubectl(&self, _server_version: Option<String>) -> Result<PathBuf, SessionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(PathBuf::from("/usr/local/bin/kubectl"))
    }
}

/// A kubeconfig on disk plus fakes wired into `SessionServices`.
pub struct Rig {
    pub dir: TempDir,
    pub kubeconfig: PathBuf,
    pub api: Arc<FakeApi>,
    pub connector: Arc<FakeConnector>,
    pub proxy: Arc<FakeProxy>,
    pub provisioner: Arc<FakeProvisioner>,
    pub services: SessionServices,
}

impl Rig {
    pub fn new() -> Self {
        Self::with_api(FakeApi::new())
    }

    pub fn with_api(api: FakeApi) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let kubeconfig = write_kubeconfig(dir.path(), "config");
        let api = Arc::new(api);
        let connector = Arc::new(FakeConnector::new(api.clone()));
        let proxy = Arc::new(FakeProxy::default());
        let provisioner = Arc::new(FakeProvisioner::default());
        let settings = Settings::default().with_kubeconfig_dir(dir.path().join("kubeconfigs"));

        let services = SessionServices {
            connector: connector.clone(),
            proxy: proxy.clone(),
            kubectl: provisioner.clone(),
            detectors: Arc::new(DetectorRegistry::with_defaults()),
            settings: Arc::new(settings),
            revisions: Arc::default(),
        };

        Self {
            dir,
            kubeconfig,
            api,
            connector,
            proxy,
            provisioner,
            services,
        }
    }

    pub fn model(&self, context: &str) -> ClusterModel {
        ClusterModel::new(&self.kubeconfig, context)
    }

    pub fn session(&self, context: &str) -> Arc<ClusterSession> {
        ClusterSession::new(self.model(context), self.services.clone()).unwrap()
    }
}

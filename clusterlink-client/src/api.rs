use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec,
};
use k8s_openapi::api::core::v1::{Namespace, Node};
use k8s_openapi::apimachinery::pkg::version::Info;
use kube::api::ListParams;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use tracing::debug;

use crate::error::ApiError;

const SSAR_PATH: &str = "/apis/authorization.k8s.io/v1/selfsubjectaccessreviews";

/// The handful of API server calls the connection lifecycle needs.
#[async_trait]
pub trait KubeApi: Send + Sync {
    async fn version(&self) -> Result<Info, ApiError>;

    async fn list_namespaces(&self) -> Result<Vec<String>, ApiError>;

    /// Posts a SelfSubjectAccessReview and returns `status.allowed`.
    async fn can_i(&self, attrs: ResourceAttributes) -> Result<bool, ApiError>;

    async fn count_nodes(&self) -> Result<usize, ApiError>;

    async fn namespace_uid(&self, name: &str) -> Result<Option<String>, ApiError>;
}

/// Identifies the credentials a client should be built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub kubeconfig_path: PathBuf,
    pub context_name: String,
}

/// Builds API clients for a session. Building may run exec credential
/// plugins, so it is itself fallible and async.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, target: &ConnectTarget) -> Result<Arc<dyn KubeApi>, ApiError>;
}

/// `kube::Client` backed connector.
#[derive(Debug, Clone)]
pub struct KubeConnector {
    request_timeout: Duration,
}

impl KubeConnector {
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }
}

#[async_trait]
impl Connector for KubeConnector {
    #[tracing::instrument(skip(self))]
    async fn connect(&self, target: &ConnectTarget) -> Result<Arc<dyn KubeApi>, ApiError> {
        let kubeconfig = Kubeconfig::read_from(&target.kubeconfig_path)?;
        let options = KubeConfigOptions {
            context: Some(target.context_name.clone()),
            cluster: None,
            user: None,
        };

        let build = async {
            let mut config = Config::from_custom_kubeconfig(kubeconfig, &options).await?;
            config.connect_timeout = Some(self.request_timeout);
            config.read_timeout = Some(self.request_timeout);
            let client = Client::try_from(config)?;
            Ok::<Client, ApiError>(client)
        };

        let client = tokio::time::timeout(self.request_timeout, build)
            .await
            .map_err(|_| ApiError::Timeout)??;

        Ok(Arc::new(KubeClientApi {
            client,
            request_timeout: self.request_timeout,
        }))
    }
}

pub struct KubeClientApi {
    client: Client,
    request_timeout: Duration,
}

impl KubeClientApi {
    async fn bounded<T, F>(&self, fut: F) -> Result<T, ApiError>
    where
        F: std::future::Future<Output = Result<T, kube::Error>>,
    {
        match tokio::time::timeout(self.request_timeout, fut).await {
            Ok(res) => res.map_err(ApiError::from),
            Err(_) => Err(ApiError::Timeout),
        }
    }
}

#[async_trait]
impl KubeApi for KubeClientApi {
    async fn version(&self) -> Result<Info, ApiError> {
        self.bounded(self.client.apiserver_version()).await
    }

    async fn list_namespaces(&self) -> Result<Vec<String>, ApiError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let list = self.bounded(api.list(&ListParams::default())).await?;
        Ok(list
            .items
            .into_iter()
            .filter_map(|ns| ns.metadata.name)
            .collect())
    }

    async fn can_i(&self, attrs: ResourceAttributes) -> Result<bool, ApiError> {
        let review = SelfSubjectAccessReview {
            metadata: Default::default(),
            spec: SelfSubjectAccessReviewSpec {
                resource_attributes: Some(attrs),
                non_resource_attributes: None,
            },
            status: None,
        };

        let body = serde_json::to_vec(&review).map_err(|e| ApiError::Other(e.to_string()))?;

        let req = http::Request::builder()
            .method("POST")
            .uri(SSAR_PATH)
            .header("Content-Type", "application/json")
            .body(body)
            .map_err(|e| ApiError::Other(e.to_string()))?;

        let result: SelfSubjectAccessReview = self.bounded(self.client.request(req)).await?;
        let allowed = result.status.map(|s| s.allowed).unwrap_or(false);
        debug!(allowed, "selfsubjectaccessreview");
        Ok(allowed)
    }

    async fn count_nodes(&self) -> Result<usize, ApiError> {
        let api: Api<Node> = Api::all(self.client.clone());
        let list = self.bounded(api.list(&ListParams::default())).await?;
        Ok(list.items.len())
    }

    async fn namespace_uid(&self, name: &str) -> Result<Option<String>, ApiError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let ns = self.bounded(api.get_opt(name)).await?;
        Ok(ns.and_then(|ns| ns.metadata.uid))
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use k8s_openapi::api::authorization::v1::ResourceAttributes;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::api::KubeApi;
use crate::rbac::{KubeApiResource, API_RESOURCES};
use crate::settings::Settings;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceDiscovery {
    pub namespaces: Vec<String>,
    /// Set once per run of consecutive 403s that crossed the threshold.
    pub forbidden_notice: bool,
}

/// Works out what the current identity may do on a cluster.
///
/// Owns the per-session probe cache and the consecutive namespace-403
/// counter; both live as long as one connection episode.
#[derive(Debug)]
pub struct AccessEvaluator {
    concurrency: usize,
    sample_limit: usize,
    forbidden_threshold: u32,
    namespace_forbidden_count: u32,
    resource_access: HashMap<&'static str, bool>,
}

impl AccessEvaluator {
    pub fn new(settings: &Settings) -> Self {
        Self {
            concurrency: settings.access_check_concurrency.max(1),
            sample_limit: settings.namespace_sample_limit,
            forbidden_threshold: settings.namespace_forbidden_threshold,
            namespace_forbidden_count: 0,
            resource_access: HashMap::new(),
        }
    }

    pub fn namespace_forbidden_count(&self) -> u32 {
        self.namespace_forbidden_count
    }

    pub fn cached_access(&self, api_name: &str) -> Option<bool> {
        self.resource_access.get(api_name).copied()
    }

    /// Drops the probe cache. The 403 counter survives; only a successful
    /// listing or a notice resets it.
    pub fn clear(&mut self) {
        self.resource_access.clear();
    }

    pub async fn is_cluster_admin(&self, api: &dyn KubeApi) -> bool {
        can_i(
            api,
            ResourceAttributes {
                namespace: Some("kube-system".into()),
                resource: Some("*".into()),
                verb: Some("create".into()),
                ..Default::default()
            },
        )
        .await
    }

    /// "Can I watch everything", with caller-supplied attributes taking
    /// precedence over the defaults.
    pub async fn can_use_watch_api(
        &self,
        api: &dyn KubeApi,
        custom: Option<ResourceAttributes>,
    ) -> bool {
        let custom = custom.unwrap_or_default();
        let attrs = ResourceAttributes {
            verb: custom.verb.clone().or_else(|| Some("watch".into())),
            resource: custom.resource.clone().or_else(|| Some("*".into())),
            ..custom
        };
        can_i(api, attrs).await
    }

    #[tracing::instrument(skip_all)]
    pub async fn discover_allowed_namespaces<F>(
        &mut self,
        api: &dyn KubeApi,
        accessible_override: &[String],
        context_namespace: F,
    ) -> NamespaceDiscovery
    where
        F: FnOnce() -> Option<String> + Send,
    {
        if !accessible_override.is_empty() {
            return NamespaceDiscovery {
                namespaces: accessible_override.to_vec(),
                forbidden_notice: false,
            };
        }

        match api.list_namespaces().await {
            Ok(namespaces) => {
                self.namespace_forbidden_count = 0;
                NamespaceDiscovery {
                    namespaces,
                    forbidden_notice: false,
                }
            }
            Err(e) => {
                let namespaces: Vec<String> = context_namespace().into_iter().collect();
                let mut forbidden_notice = false;

                if namespaces.is_empty() && e.is_forbidden() {
                    self.namespace_forbidden_count += 1;

                    if self.namespace_forbidden_count > self.forbidden_threshold {
                        self.namespace_forbidden_count = 0;
                        forbidden_notice = true;
                        info!("listing namespaces is forbidden: {e}");
                    }
                } else if namespaces.is_empty() {
                    warn!("failed to list namespaces: {e}");
                } else {
                    debug!("failed to list namespaces, using context namespace: {e}");
                }

                NamespaceDiscovery {
                    namespaces,
                    forbidden_notice,
                }
            }
        }
    }

    /// Resource api names the identity may `list` in at least one of the
    /// first `sample_limit` namespaces. Any failed probe task empties the
    /// whole answer.
    #[tracing::instrument(skip_all, fields(namespaces = namespaces.len()))]
    pub async fn discover_allowed_resource_kinds(
        &mut self,
        api: Arc<dyn KubeApi>,
        namespaces: &[String],
    ) -> Vec<String> {
        if namespaces.is_empty() {
            return Vec::new();
        }

        let sample: Arc<[String]> = namespaces
            .iter()
            .take(self.sample_limit)
            .cloned()
            .collect();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        for resource in API_RESOURCES
            .iter()
            .filter(|r| !self.resource_access.contains_key(r.api_name))
        {
            let api = api.clone();
            let sample = sample.clone();
            let sem = semaphore.clone();
            tasks.spawn(async move {
                let _permit = sem.acquire_owned().await.ok()?;
                let allowed = check_list_access(api.as_ref(), resource, &sample).await;
                Some((resource.api_name, allowed))
            });
        }

        let mut resolved = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(result)) => resolved.push(result),
                Ok(None) => {
                    warn!("access check semaphore closed");
                    tasks.abort_all();
                    return Vec::new();
                }
                Err(e) => {
                    warn!("access check task failed: {e}");
                    tasks.abort_all();
                    return Vec::new();
                }
            }
        }

        self.resource_access.extend(resolved);

        API_RESOURCES
            .iter()
            .filter(|r| self.resource_access.get(r.api_name) == Some(&true))
            .map(|r| r.api_name.to_string())
            .collect()
    }
}

/// Single review; errors count as "no".
async fn can_i(api: &dyn KubeApi, attrs: ResourceAttributes) -> bool {
    match api.can_i(attrs).await {
        Ok(allowed) => allowed,
        Err(e) => {
            warn!("failed to request selfSubjectAccessReview: {e}");
            false
        }
    }
}

async fn check_list_access(api: &dyn KubeApi, resource: &KubeApiResource, namespaces: &[String]) -> bool {
    for namespace in namespaces {
        let attrs = ResourceAttributes {
            group: Some(resource.group.to_string()),
            resource: Some(resource.api_name.to_string()),
            verb: Some("list".into()),
            namespace: Some(namespace.clone()),
            ..Default::default()
        };
        if can_i(api, attrs).await {
            return true;
        }
    }
    false
}

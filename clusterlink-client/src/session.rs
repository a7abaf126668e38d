use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::access::AccessEvaluator;
use crate::api::{ConnectTarget, Connector, KubeApi, KubeConnector};
use crate::detectors::{DetectContext, DetectorRegistry};
use crate::error::{ApiError, SessionError};
use crate::kubeconfig;
use crate::kubectl::{KubectlBinary, KubectlProvisioner, KubectlProxy, ProxyEndpoint, ProxyServer};
use crate::prober;
use crate::rbac;
use crate::settings::Settings;
use crate::structs::{
    metadata_keys, ClusterId, ClusterMetadata, ClusterModel, ClusterState, ClusterStatus,
    RefreshOptions,
};

/// Collaborators shared by every session.
#[derive(Clone)]
pub struct SessionServices {
    pub connector: Arc<dyn Connector>,
    pub proxy: Arc<dyn ProxyServer>,
    pub kubectl: Arc<dyn KubectlProvisioner>,
    pub detectors: Arc<DetectorRegistry>,
    pub settings: Arc<Settings>,
    /// Shared by every session so a re-added id never reuses a revision.
    pub revisions: Arc<AtomicU64>,
}

impl SessionServices {
    /// Real kube client, `kubectl proxy` and the default detectors.
    pub fn from_settings(settings: Settings) -> Self {
        Self {
            connector: Arc::new(KubeConnector::new(settings.request_timeout())),
            proxy: Arc::new(KubectlProxy::new(
                settings.kubectl_path.clone(),
                settings.proxy_start_timeout(),
            )),
            kubectl: Arc::new(KubectlBinary::new(settings.kubectl_path.clone())),
            detectors: Arc::new(DetectorRegistry::with_defaults()),
            settings: Arc::new(settings),
            revisions: Arc::default(),
        }
    }

    fn next_revision(&self) -> u64 {
        self.revisions.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged { revision: u64, state: ClusterState },
    NamespaceListForbidden,
}

pub type SessionListener = Arc<dyn Fn(&ClusterId, &SessionEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Debug, Clone, Copy)]
enum TimerKind {
    Connection,
    Metadata,
}

struct Inner {
    model: ClusterModel,
    state: ClusterState,
    revision: u64,
    last_published: Option<ClusterState>,
    activated: bool,
    proxy: Option<ProxyEndpoint>,
}

/// State only touched while the op lock is held.
struct Ops {
    access: AccessEvaluator,
    timers: Option<CancellationToken>,
}

/// One managed cluster connection.
///
/// Every lifecycle operation takes the per-session op lock, so activation,
/// refreshes, timer ticks and disconnects never interleave on one session.
pub struct ClusterSession {
    id: ClusterId,
    api_url: String,
    services: SessionServices,
    inner: Mutex<Inner>,
    client: Mutex<Option<Arc<dyn KubeApi>>>,
    ops: tokio::sync::Mutex<Ops>,
    listeners: Mutex<Vec<(ListenerId, SessionListener)>>,
    next_listener: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ClusterSession {
    /// Validates the referenced context before anything else; a bad context
    /// means no session.
    pub fn new(model: ClusterModel, services: SessionServices) -> Result<Arc<Self>, SessionError> {
        let resolved = kubeconfig::resolve_context_from(&model.kube_config_path, &model.context_name)?;
        debug!(
            cluster_id = %model.id,
            context = %resolved.context_name,
            "session for cluster {} at {}",
            resolved.cluster_name,
            resolved.api_url
        );

        let access = AccessEvaluator::new(&services.settings);
        Ok(Arc::new(Self {
            id: model.id.clone(),
            api_url: resolved.api_url.clone(),
            services,
            inner: Mutex::new(Inner {
                model,
                state: ClusterState::new(resolved.api_url),
                revision: 0,
                last_published: None,
                activated: false,
                proxy: None,
            }),
            client: Mutex::new(None),
            ops: tokio::sync::Mutex::new(Ops {
                access,
                timers: None,
            }),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(0),
        }))
    }

    pub fn id(&self) -> &ClusterId {
        &self.id
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    pub fn name(&self) -> String {
        let inner = lock(&self.inner);
        inner
            .model
            .preferences
            .cluster_name
            .clone()
            .unwrap_or_else(|| inner.model.context_name.clone())
    }

    pub fn context_name(&self) -> String {
        lock(&self.inner).model.context_name.clone()
    }

    pub fn kube_config_path(&self) -> PathBuf {
        lock(&self.inner).model.kube_config_path.clone()
    }

    pub fn metadata(&self) -> ClusterMetadata {
        lock(&self.inner).model.metadata.clone()
    }

    pub fn snapshot(&self) -> ClusterState {
        lock(&self.inner).state.clone()
    }

    /// Current snapshot together with the revision it was last published at.
    pub fn revisioned_snapshot(&self) -> (u64, ClusterState) {
        let inner = lock(&self.inner);
        (inner.revision, inner.state.clone())
    }

    pub fn is_activated(&self) -> bool {
        lock(&self.inner).activated
    }

    pub fn proxy_endpoint(&self) -> Option<ProxyEndpoint> {
        lock(&self.inner).proxy.clone()
    }

    pub fn to_model(&self) -> ClusterModel {
        lock(&self.inner).model.clone()
    }

    /// Applies a newer description of this cluster. The id never changes;
    /// a different path or context drops the cached client.
    pub fn update_model(&self, model: ClusterModel) {
        if model.id != self.id {
            debug!(cluster_id = %self.id, "ignoring foreign id {} in model update", model.id);
        }

        {
            let mut inner = lock(&self.inner);
            inner.model.preferences = model.preferences;
            inner.model.metadata.extend(model.metadata);
        }
        self.update_target(
            model.kube_config_path,
            model.context_name,
            model.accessible_namespaces,
        );
    }

    /// Catalog-owned part of the model; preferences and metadata stay.
    pub fn update_target(
        &self,
        kube_config_path: PathBuf,
        context_name: String,
        accessible_namespaces: Vec<String>,
    ) {
        let target_changed = {
            let mut inner = lock(&self.inner);
            let changed = inner.model.kube_config_path != kube_config_path
                || inner.model.context_name != context_name;
            inner.model.kube_config_path = kube_config_path;
            inner.model.context_name = context_name;
            inner.model.accessible_namespaces = accessible_namespaces;
            changed
        };

        if target_changed {
            info!(cluster_id = %self.id, "kubeconfig target changed");
            *lock(&self.client) = None;
        }
    }

    pub fn on_change<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ClusterId, &SessionEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        lock(&self.listeners).push((id, Arc::new(listener)));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) {
        lock(&self.listeners).retain(|(existing, _)| *existing != id);
    }

    fn emit(&self, event: SessionEvent) {
        let listeners: Vec<SessionListener> =
            lock(&self.listeners).iter().map(|(_, l)| l.clone()).collect();
        for listener in listeners {
            listener(&self.id, &event);
        }
    }

    fn publish(&self, force: bool) {
        let event = {
            let mut inner = lock(&self.inner);
            if !force && inner.last_published.as_ref() == Some(&inner.state) {
                return;
            }
            inner.revision = self.services.next_revision();
            inner.last_published = Some(inner.state.clone());
            SessionEvent::StateChanged {
                revision: inner.revision,
                state: inner.state.clone(),
            }
        };
        self.emit(event);
    }

    /// Publishes the current snapshot even if nothing changed.
    pub fn push_state(&self) {
        self.publish(true);
    }

    fn notify_if_changed(&self) {
        self.publish(false);
    }

    fn update_state(&self, f: impl FnOnce(&mut ClusterState)) {
        f(&mut lock(&self.inner).state);
        self.notify_if_changed();
    }

    fn connect_target(&self) -> ConnectTarget {
        let inner = lock(&self.inner);
        ConnectTarget {
            kubeconfig_path: inner.model.kube_config_path.clone(),
            context_name: inner.model.context_name.clone(),
        }
    }

    async fn api(&self) -> Result<Arc<dyn KubeApi>, ApiError> {
        if let Some(api) = lock(&self.client).clone() {
            return Ok(api);
        }
        let api = self.services.connector.connect(&self.connect_target()).await?;
        *lock(&self.client) = Some(api.clone());
        Ok(api)
    }

    #[tracing::instrument(skip(self), fields(cluster_id = %self.id))]
    pub async fn activate(self: &Arc<Self>, force: bool) {
        let mut ops = self.ops.lock().await;

        if self.is_activated() && !force {
            self.push_state();
            return;
        }

        self.bind_timers(&mut ops);

        let state = self.snapshot();
        if state.disconnected || !state.accessible {
            self.reconnect_locked().await;
        }

        self.refresh_connection_status_locked().await;

        if self.snapshot().accessible {
            self.refresh_accessibility_locked(&mut ops).await;
            self.spawn_kubectl_provisioning();
        }

        lock(&self.inner).activated = true;
        self.push_state();
    }

    pub async fn reconnect(&self) {
        let _ops = self.ops.lock().await;
        self.reconnect_locked().await;
    }

    async fn reconnect_locked(&self) {
        info!(cluster_id = %self.id, "reconnecting to {}", self.api_url);
        self.update_state(|s| s.reconnecting = true);

        self.services.proxy.stop_server(&self.id).await;
        *lock(&self.client) = None;

        let started = self
            .services
            .proxy
            .ensure_server(&self.id, &self.connect_target())
            .await;

        {
            let mut inner = lock(&self.inner);
            match started {
                Ok(endpoint) => inner.proxy = Some(endpoint),
                Err(e) => {
                    warn!(cluster_id = %self.id, "failed to start proxy: {e}");
                    inner.proxy = None;
                    inner.state.failure_reason = Some(e.to_string());
                }
            }
            inner.state.disconnected = false;
            inner.state.reconnecting = false;
        }
        self.notify_if_changed();
    }

    pub async fn refresh_connection_status(&self) {
        let _ops = self.ops.lock().await;
        self.refresh_connection_status_locked().await;
    }

    async fn refresh_connection_status_locked(&self) {
        let context = self.context_name();
        let outcome = match self.api().await {
            Ok(api) => prober::probe(api.as_ref(), &context).await,
            Err(e) => prober::probe_connect_failure(&e, &context),
        };

        if outcome.status != ClusterStatus::AccessGranted {
            *lock(&self.client) = None;
        }

        {
            let mut inner = lock(&self.inner);
            if let Some(version) = &outcome.version {
                inner
                    .model
                    .metadata
                    .insert(metadata_keys::VERSION.to_string(), version.clone().into());
            }
            inner.state.online = outcome.status > ClusterStatus::Offline;
            inner.state.accessible = outcome.status == ClusterStatus::AccessGranted;
            inner.state.failure_reason = outcome.failure_reason;
        }
        self.notify_if_changed();
    }

    pub async fn refresh_accessibility(&self) {
        let mut ops = self.ops.lock().await;
        self.refresh_accessibility_locked(&mut ops).await;
    }

    /// Admin, watch, namespaces, then resource kinds. Only runs while the
    /// last probe granted access.
    async fn refresh_accessibility_locked(&self, ops: &mut Ops) {
        if !self.snapshot().accessible {
            return;
        }

        let api = match self.api().await {
            Ok(api) => api,
            Err(e) => {
                warn!(cluster_id = %self.id, "no client for access checks: {e}");
                return;
            }
        };

        let is_admin = ops.access.is_cluster_admin(api.as_ref()).await;
        let watch_enabled = ops.access.can_use_watch_api(api.as_ref(), None).await;

        let (accessible_override, path, context) = {
            let inner = lock(&self.inner);
            (
                inner.model.accessible_namespaces.clone(),
                inner.model.kube_config_path.clone(),
                inner.model.context_name.clone(),
            )
        };
        let discovery = ops
            .access
            .discover_allowed_namespaces(api.as_ref(), &accessible_override, move || {
                kubeconfig::context_namespace(&path, &context)
            })
            .await;

        if discovery.forbidden_notice {
            self.emit(SessionEvent::NamespaceListForbidden);
        }

        let kinds = ops
            .access
            .discover_allowed_resource_kinds(api, &discovery.namespaces)
            .await;

        self.update_state(|s| {
            s.is_admin = is_admin;
            s.is_global_watch_enabled = watch_enabled;
            s.allowed_namespaces = discovery.namespaces;
            s.allowed_resources = kinds;
            s.ready = true;
        });
    }

    #[tracing::instrument(skip(self), fields(cluster_id = %self.id))]
    pub async fn refresh(&self, opts: RefreshOptions) {
        let mut ops = self.ops.lock().await;
        self.refresh_locked(&mut ops, opts).await;
    }

    async fn refresh_locked(&self, ops: &mut Ops, opts: RefreshOptions) {
        self.refresh_connection_status_locked().await;

        if self.snapshot().accessible {
            self.refresh_accessibility_locked(ops).await;
            if opts.refresh_metadata {
                self.refresh_metadata_locked().await;
            }
        }

        self.push_state();
    }

    pub async fn refresh_metadata(&self) {
        let _ops = self.ops.lock().await;
        self.refresh_metadata_locked().await;
    }

    async fn refresh_metadata_locked(&self) {
        if !self.snapshot().accessible {
            return;
        }

        let api = match self.api().await {
            Ok(api) => api,
            Err(e) => {
                warn!(cluster_id = %self.id, "no client for metadata detection: {e}");
                return;
            }
        };

        let ctx = DetectContext {
            api,
            api_url: self.api_url.clone(),
        };
        let detected = self.services.detectors.detect_for_cluster(&ctx).await;
        lock(&self.inner).model.metadata.extend(detected);
    }

    /// Tears the connection down. Never fails.
    #[tracing::instrument(skip(self), fields(cluster_id = %self.id))]
    pub async fn disconnect(&self) {
        let mut ops = self.ops.lock().await;
        info!("disconnecting from {}", self.api_url);

        if let Some(timers) = ops.timers.take() {
            timers.cancel();
        }
        self.services.proxy.stop_server(&self.id).await;
        *lock(&self.client) = None;
        ops.access.clear();

        {
            let mut inner = lock(&self.inner);
            inner.activated = false;
            inner.proxy = None;
            let state = &mut inner.state;
            state.disconnected = true;
            state.online = false;
            state.accessible = false;
            state.ready = false;
            state.reconnecting = false;
            state.is_admin = false;
            state.is_global_watch_enabled = false;
            state.allowed_namespaces.clear();
            state.allowed_resources.clear();
        }
        self.push_state();
    }

    /// Network went away: drop to offline right away instead of waiting for
    /// the next probe.
    pub fn mark_offline(&self) {
        self.update_state(|s| {
            s.online = false;
            s.accessible = false;
        });
    }

    fn bind_timers(self: &Arc<Self>, ops: &mut Ops) {
        if ops.timers.is_some() {
            return;
        }
        let token = CancellationToken::new();
        let settings = &self.services.settings;
        spawn_timer(
            Arc::downgrade(self),
            token.clone(),
            settings.refresh_interval(),
            TimerKind::Connection,
        );
        spawn_timer(
            Arc::downgrade(self),
            token.clone(),
            settings.metadata_refresh_interval(),
            TimerKind::Metadata,
        );
        ops.timers = Some(token);
    }

    /// A tick may queue behind `disconnect()`, so the check happens under
    /// the op lock.
    async fn on_timer(&self, kind: TimerKind) {
        let mut ops = self.ops.lock().await;
        if ops.timers.is_none() || self.snapshot().disconnected {
            debug!(cluster_id = %self.id, "skipping {kind:?} refresh while disconnected");
            return;
        }
        match kind {
            TimerKind::Connection => {
                self.refresh_locked(&mut ops, RefreshOptions::default()).await
            }
            TimerKind::Metadata => self.refresh_metadata_locked().await,
        }
    }

    fn spawn_kubectl_provisioning(&self) {
        let kubectl = self.services.kubectl.clone();
        let version = lock(&self.inner)
            .model
            .metadata
            .get(metadata_keys::VERSION)
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let id = self.id.clone();

        tokio::spawn(async move {
            if let Err(e) = kubectl.ensure_kubectl(version).await {
                warn!(cluster_id = %id, "kubectl provisioning failed: {e}");
            }
        });
    }

    /// Kinds not in the known set are allowed.
    pub fn is_allowed_resource(&self, kind: &str) -> bool {
        let Some(resource) = rbac::by_kind(kind).or_else(|| rbac::by_api_name(kind)) else {
            return true;
        };
        lock(&self.inner)
            .state
            .allowed_resources
            .iter()
            .any(|r| r == resource.api_name)
    }

    pub fn is_all_allowed_resources(&self, kinds: &[&str]) -> bool {
        kinds.iter().all(|k| self.is_allowed_resource(k))
    }

    pub fn is_any_allowed_resource(&self, kinds: &[&str]) -> bool {
        kinds.iter().any(|k| self.is_allowed_resource(k))
    }
}

impl Drop for ClusterSession {
    fn drop(&mut self) {
        if let Some(timers) = self.ops.get_mut().timers.take() {
            timers.cancel();
        }
    }
}

fn spawn_timer(session: Weak<ClusterSession>, cancel: CancellationToken, period: Duration, kind: TimerKind) {
    tokio::spawn(async move {
        let mut tick = time::interval_at(Instant::now() + period, period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    let Some(session) = session.upgrade() else { break };
                    session.on_timer(kind).await;
                }
            }
        }
    });
}

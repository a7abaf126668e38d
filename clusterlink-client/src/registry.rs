use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use futures::future::join_all;
use http::header::HOST;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::catalog::{KubernetesCluster, KubernetesClusterStatus, StatusHandle};
use crate::error::SessionError;
use crate::kubeconfig;
use crate::replication::{FrameInfo, ReplicationHub, ReplicationMessage, StateSyncRequest, SyncedState};
use crate::session::{ClusterSession, ListenerId, SessionEvent, SessionServices};
use crate::store::{self, ClusterStoreModel};
use crate::structs::{ClusterId, ClusterModel, RefreshOptions};

pub const CLUSTER_ID_HEADER: &str = "x-cluster-id";
pub const API_KUBE_PREFIX: &str = "/api-kube";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub added: Vec<ClusterId>,
    pub updated: Vec<ClusterId>,
    pub removed: Vec<ClusterId>,
    pub failed: Vec<(String, String)>,
}

impl SyncReport {
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns every session. Built once at startup and handed to whoever needs it.
pub struct SessionRegistry {
    services: SessionServices,
    hub: ReplicationHub,
    sessions: RwLock<BTreeMap<ClusterId, Arc<ClusterSession>>>,
    catalog_links: Mutex<HashMap<ClusterId, ListenerId>>,
    active: Mutex<Option<ClusterId>>,
    store_path: Option<PathBuf>,
}

impl SessionRegistry {
    pub fn new(services: SessionServices, hub: ReplicationHub) -> Self {
        Self {
            services,
            hub,
            sessions: RwLock::new(BTreeMap::new()),
            catalog_links: Mutex::new(HashMap::new()),
            active: Mutex::new(None),
            store_path: None,
        }
    }

    /// Persist to `path` after every add, remove and catalog sync.
    pub fn with_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store_path = Some(path.into());
        self
    }

    pub fn hub(&self) -> &ReplicationHub {
        &self.hub
    }

    pub fn get_by_id(&self, id: &ClusterId) -> Option<Arc<ClusterSession>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn sessions(&self) -> Vec<Arc<ClusterSession>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn require(&self, id: &ClusterId) -> Result<Arc<ClusterSession>, SessionError> {
        self.get_by_id(id)
            .ok_or_else(|| SessionError::UnknownCluster(id.clone()))
    }

    /// Inserts or updates in place. Returns the session and whether it is new.
    fn upsert(&self, model: ClusterModel) -> Result<(Arc<ClusterSession>, bool), SessionError> {
        if let Some(existing) = self.get_by_id(&model.id) {
            existing.update_model(model);
            return Ok((existing, false));
        }

        let session = ClusterSession::new(model, self.services.clone())?;
        self.hub.observe(&session);

        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        // another caller may have won the race while we were validating
        if let Some(existing) = sessions.get(session.id()) {
            return Ok((existing.clone(), false));
        }
        sessions.insert(session.id().clone(), session.clone());
        Ok((session, true))
    }

    /// Registers a cluster explicitly. Identical (path, context) pairs
    /// collapse onto one session.
    #[tracing::instrument(skip_all, fields(cluster_id = %model.id))]
    pub fn add_cluster(&self, model: ClusterModel) -> Result<Arc<ClusterSession>, SessionError> {
        let (session, added) = self.upsert(model)?;
        if added {
            info!("added cluster {}", session.name());
        }
        self.persist();
        Ok(session)
    }

    /// Reconciles the session set with the catalog's `KubernetesCluster`
    /// entities.
    #[tracing::instrument(skip_all, fields(entities = entities.len()))]
    pub async fn sync_from_catalog(&self, entities: &[KubernetesCluster]) -> SyncReport {
        let mut report = SyncReport::default();
        let mut seen = HashSet::new();

        for entity in entities {
            let id = entity.cluster_id();
            seen.insert(id.clone());

            if let Some(existing) = self.get_by_id(&id) {
                let before = existing.to_model();
                existing.update_target(
                    entity.spec.kubeconfig_path.clone(),
                    entity.spec.kubeconfig_context.clone(),
                    entity.spec.accessible_namespaces.clone(),
                );
                if before != existing.to_model() {
                    report.updated.push(id.clone());
                }
                self.link_entity(&existing, &entity.status);
                continue;
            }

            match self.upsert(entity.to_model()) {
                Ok((session, added)) => {
                    if added {
                        report.added.push(id.clone());
                    }
                    self.link_entity(&session, &entity.status);
                }
                Err(e) => {
                    error!("failed to create cluster for entity {}: {e}", entity.metadata.name);
                    report
                        .failed
                        .push((entity.metadata.name.clone(), e.to_string()));
                }
            }
        }

        let stale: Vec<ClusterId> = lock(&self.catalog_links)
            .keys()
            .filter(|id| !seen.contains(*id))
            .cloned()
            .collect();
        for id in stale {
            if self.remove_session(&id).await {
                report.removed.push(id);
            }
        }

        if !report.is_noop() {
            info!(
                added = report.added.len(),
                updated = report.updated.len(),
                removed = report.removed.len(),
                failed = report.failed.len(),
                "catalog sync"
            );
            self.persist();
        }
        report
    }

    /// Mirrors the session's connection state onto the entity status.
    fn link_entity(&self, session: &ClusterSession, status: &StatusHandle) {
        status.set(KubernetesClusterStatus::from(&session.snapshot()));

        let handle = status.clone();
        let listener = session.on_change(move |_, event| {
            if let SessionEvent::StateChanged { state, .. } = event {
                handle.set(KubernetesClusterStatus::from(state));
            }
        });

        let previous = lock(&self.catalog_links).insert(session.id().clone(), listener);
        if let Some(previous) = previous {
            session.remove_listener(previous);
        }
    }

    /// Disconnects and forgets the session. A kubeconfig inside the managed
    /// directory goes with it; anything else is left alone.
    #[tracing::instrument(skip(self))]
    pub async fn remove_by_id(&self, id: &ClusterId) -> bool {
        let removed = self.remove_session(id).await;
        if removed {
            self.persist();
        }
        removed
    }

    async fn remove_session(&self, id: &ClusterId) -> bool {
        let removed = {
            let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
            sessions.remove(id)
        };
        let Some(session) = removed else {
            return false;
        };

        // the entity status sees the final disconnected state before unlinking
        session.disconnect().await;
        if let Some(listener) = lock(&self.catalog_links).remove(id) {
            session.remove_listener(listener);
        }
        self.hub.remove_frames_for(id);

        {
            let mut active = lock(&self.active);
            if active.as_ref() == Some(id) {
                *active = None;
            }
        }

        let path = session.kube_config_path();
        if kubeconfig::is_managed(&self.services.settings.kubeconfig_dir, &path) {
            match std::fs::remove_file(&path) {
                Ok(()) => info!("removed managed kubeconfig {}", path.display()),
                Err(e) => warn!("failed to remove managed kubeconfig {}: {e}", path.display()),
            }
        }

        info!("removed cluster {}", session.name());
        true
    }

    /// Resolves the session an inbound proxy request is meant for.
    pub fn get_cluster_for_request<B>(&self, req: &http::Request<B>) -> Option<Arc<ClusterSession>> {
        let host = req
            .headers()
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .or_else(|| req.uri().host())
            .unwrap_or_default();
        let hostname = host.split(':').next().unwrap_or_default();

        if matches!(hostname, "127.0.0.1" | "localhost") {
            let first_segment = req.uri().path().trim_start_matches('/').split('/').next();
            if let Some(session) = first_segment
                .filter(|s| !s.is_empty())
                .and_then(|s| self.get_by_id(&ClusterId::from(s)))
            {
                return Some(session);
            }
        }

        if let Some(session) = req
            .headers()
            .get(CLUSTER_ID_HEADER)
            .and_then(|h| h.to_str().ok())
            .and_then(|id| self.get_by_id(&ClusterId::from(id)))
        {
            return Some(session);
        }

        let (subdomain, _) = hostname.split_once('.')?;
        self.get_by_id(&ClusterId::from(subdomain))
    }

    #[tracing::instrument(skip(self))]
    pub async fn activate(&self, id: &ClusterId, force: bool) -> Result<(), SessionError> {
        self.require(id)?.activate(force).await;
        Ok(())
    }

    pub async fn refresh(&self, id: &ClusterId) -> Result<(), SessionError> {
        self.require(id)?
            .refresh(RefreshOptions {
                refresh_metadata: true,
            })
            .await;
        Ok(())
    }

    pub async fn disconnect(&self, id: &ClusterId) -> Result<(), SessionError> {
        self.require(id)?.disconnect().await;
        Ok(())
    }

    fn connected(&self) -> Vec<Arc<ClusterSession>> {
        self.sessions()
            .into_iter()
            .filter(|s| !s.snapshot().disconnected)
            .collect()
    }

    pub async fn on_network_offline(&self) {
        info!("network went offline");
        let sessions = self.connected();
        for session in &sessions {
            session.mark_offline();
        }
        join_all(sessions.iter().map(|s| s.refresh_connection_status())).await;
    }

    pub async fn on_network_online(&self) {
        info!("network is back online");
        let sessions = self.connected();
        join_all(sessions.iter().map(|s| s.refresh_connection_status())).await;
    }

    /// Process teardown.
    pub async fn stop(&self) {
        let sessions = self.sessions();
        join_all(sessions.iter().map(|s| s.disconnect())).await;
        debug!("disconnected {} clusters", sessions.len());
    }

    /// Unknown ids clear the active cluster.
    pub fn set_active(&self, id: Option<&ClusterId>) {
        let next = id.filter(|id| self.get_by_id(id).is_some()).cloned();
        *lock(&self.active) = next;
    }

    pub fn active(&self) -> Option<Arc<ClusterSession>> {
        let id = lock(&self.active).clone()?;
        self.get_by_id(&id)
    }

    pub fn current_states(&self) -> Vec<SyncedState> {
        self.sessions()
            .iter()
            .map(|s| {
                let (revision, state) = s.revisioned_snapshot();
                SyncedState {
                    cluster_id: s.id().clone(),
                    revision,
                    state,
                }
            })
            .collect()
    }

    /// Answers display-surface bootstrap requests until every hub handle is
    /// dropped.
    pub async fn serve_state_requests(&self, mut requests: mpsc::UnboundedReceiver<StateSyncRequest>) {
        while let Some(request) = requests.recv().await {
            let states = self.current_states();
            debug!("answering full sync with {} states", states.len());
            if request.reply.send(states).is_err() {
                debug!("display surface went away before the full sync reply");
            }
        }
    }

    /// Registers a sub-frame for `id` and re-pushes its state so the frame
    /// starts populated.
    pub fn register_frame(
        &self,
        id: &ClusterId,
        frame: FrameInfo,
    ) -> Result<mpsc::UnboundedReceiver<ReplicationMessage>, SessionError> {
        let session = self.require(id)?;
        let rx = self.hub.register_frame(id.clone(), frame);
        session.push_state();
        Ok(rx)
    }

    /// Restores sessions from the store. Entries that no longer validate are
    /// skipped.
    pub fn load_store(&self, path: &Path) -> Result<usize, SessionError> {
        let document = store::load_store(path)?;
        let mut loaded = 0;
        for model in document.clusters {
            let context = model.context_name.clone();
            match self.upsert(model) {
                Ok(_) => loaded += 1,
                Err(e) => warn!("skipping stored cluster {context}: {e}"),
            }
        }
        self.set_active(document.active_cluster.as_ref());
        info!("loaded {loaded} clusters from {}", path.display());
        Ok(loaded)
    }

    pub fn save_store(&self, path: &Path) -> Result<(), SessionError> {
        let document = ClusterStoreModel {
            active_cluster: lock(&self.active).clone(),
            clusters: self.sessions().iter().map(|s| s.to_model()).collect(),
        };
        store::save_store(path, &document)
    }

    fn persist(&self) {
        if let Some(path) = &self.store_path {
            if let Err(e) = self.save_store(path) {
                warn!("failed to persist clusters: {e}");
            }
        }
    }
}

/// Rewrites `/<id>/rest` to `/api-kube/rest`; `None` if the path is not
/// prefixed with `id`.
pub fn proxy_path_for(id: &ClusterId, path: &str) -> Option<String> {
    let rest = path.strip_prefix('/')?.strip_prefix(id.as_str())?;
    if rest.is_empty() {
        Some(API_KUBE_PREFIX.to_string())
    } else if rest.starts_with('/') {
        Some(format!("{API_KUBE_PREFIX}{rest}"))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{entities_from_kubeconfig, EntityPhase};
    use crate::kubeconfig::fixtures::KUBECONFIG;
    use crate::replication::DisplaySurface;
    use crate::testing::Rig;
    use std::sync::atomic::Ordering;
    use uuid::Uuid;

    fn registry(rig: &Rig) -> Arc<SessionRegistry> {
        let (hub, sync) = ReplicationHub::new();
        let registry = Arc::new(SessionRegistry::new(rig.services.clone(), hub));
        let server = registry.clone();
        tokio::spawn(async move { server.serve_state_requests(sync).await });
        registry
    }

    fn request(host: &str, path: &str) -> http::Request<()> {
        http::Request::builder()
            .uri(path)
            .header(HOST, host)
            .body(())
            .unwrap()
    }

    #[tokio::test]
    async fn test_identical_pairs_collapse() {
        let rig = Rig::new();
        let registry = registry(&rig);
        let a = registry.add_cluster(rig.model("dev")).unwrap();
        let b = registry
            .add_cluster(rig.model("dev").with_cluster_name("Dev"))
            .unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
        assert_eq!(a.name(), "Dev");
    }

    #[tokio::test]
    async fn test_invalid_context_is_rejected() {
        let rig = Rig::new();
        let registry = registry(&rig);
        assert!(matches!(
            registry.add_cluster(rig.model("nope")),
            Err(SessionError::ContextNotFound(_))
        ));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_catalog_sync_add_update_remove() {
        let rig = Rig::new();
        let registry = registry(&rig);
        let entities = entities_from_kubeconfig(&rig.kubeconfig).unwrap();

        let report = registry.sync_from_catalog(&entities).await;
        assert_eq!(report.added.len(), 2);
        assert_eq!(report.failed.len(), 2);
        assert_eq!(registry.len(), 2);

        let dev = &entities[0];
        registry.activate(&dev.cluster_id(), false).await.unwrap();
        assert_eq!(dev.status.get().phase, EntityPhase::Connected);
        assert!(dev.status.get().active);

        let mut changed = entities[..2].to_vec();
        changed[1].spec.accessible_namespaces = vec!["team-b".into()];
        let report = registry.sync_from_catalog(&changed[1..]).await;
        assert_eq!(report.updated, vec![changed[1].cluster_id()]);
        assert_eq!(report.removed, vec![dev.cluster_id()]);
        assert!(registry.get_by_id(&dev.cluster_id()).is_none());
        assert_eq!(dev.status.get().phase, EntityPhase::Disconnected);
    }

    #[tokio::test]
    async fn test_explicit_clusters_survive_catalog_sync() {
        let rig = Rig::new();
        let registry = registry(&rig);
        let manual = registry.add_cluster(rig.model("dev")).unwrap();
        registry.sync_from_catalog(&[]).await;
        assert!(registry.get_by_id(manual.id()).is_some());
    }

    #[tokio::test]
    async fn test_remove_deletes_only_managed_kubeconfigs() {
        let rig = Rig::new();
        let registry = registry(&rig);
        let managed_dir = rig.services.settings.kubeconfig_dir.clone();

        let id = ClusterId::from("pasted");
        let managed_path = kubeconfig::embed_custom_kubeconfig(&managed_dir, &id, KUBECONFIG).unwrap();
        let managed = registry
            .add_cluster(ClusterModel::new(&managed_path, "dev"))
            .unwrap();
        let user = registry.add_cluster(rig.model("dev")).unwrap();
        registry.set_active(Some(managed.id()));

        assert!(registry.remove_by_id(managed.id()).await);
        assert!(!managed_path.exists());
        assert!(registry.active().is_none());

        assert!(registry.remove_by_id(user.id()).await);
        assert!(rig.kubeconfig.exists());
        assert!(!registry.remove_by_id(user.id()).await);
    }

    #[tokio::test]
    async fn test_request_routing_priority() {
        let rig = Rig::new();
        let registry = registry(&rig);
        let dev = registry.add_cluster(rig.model("dev")).unwrap();
        let scoped = registry.add_cluster(rig.model("scoped")).unwrap();

        let by_path = request("127.0.0.1:9000", &format!("/{}/api/v1/pods", dev.id()));
        assert!(Arc::ptr_eq(&registry.get_cluster_for_request(&by_path).unwrap(), &dev));

        let mut by_header = request("localhost:9000", "/api/v1/pods");
        by_header
            .headers_mut()
            .insert(CLUSTER_ID_HEADER, scoped.id().as_str().parse().unwrap());
        assert!(Arc::ptr_eq(&registry.get_cluster_for_request(&by_header).unwrap(), &scoped));

        let by_host = request(&format!("{}.renderer.local:9000", scoped.id()), "/");
        assert!(Arc::ptr_eq(&registry.get_cluster_for_request(&by_host).unwrap(), &scoped));

        assert!(registry
            .get_cluster_for_request(&request("localhost:9000", "/nothing"))
            .is_none());
    }

    #[test]
    fn test_proxy_path_rewrite() {
        let id = ClusterId::from("abc");
        assert_eq!(proxy_path_for(&id, "/abc/api/v1/pods").as_deref(), Some("/api-kube/api/v1/pods"));
        assert_eq!(proxy_path_for(&id, "/abc").as_deref(), Some("/api-kube"));
        assert_eq!(proxy_path_for(&id, "/abcd/api"), None);
        assert_eq!(proxy_path_for(&id, "/other/api"), None);
    }

    #[tokio::test]
    async fn test_commands_reject_unknown_ids() {
        let rig = Rig::new();
        let registry = registry(&rig);
        let id = ClusterId::from("ghost");
        assert!(matches!(registry.activate(&id, false).await, Err(SessionError::UnknownCluster(_))));
        assert!(registry.refresh(&id).await.is_err());
        assert!(registry.disconnect(&id).await.is_err());
    }

    #[tokio::test]
    async fn test_network_offline_then_online() {
        let rig = Rig::new();
        let registry = registry(&rig);
        let dev = registry.add_cluster(rig.model("dev")).unwrap();
        registry.add_cluster(rig.model("scoped")).unwrap();
        dev.activate(false).await;

        rig.api.set_version_result(Err(crate::error::ApiError::Network("no route to host".into())));
        registry.on_network_offline().await;
        let state = dev.snapshot();
        assert!(!state.online && !state.accessible);
        assert_eq!(state.failure_reason.as_deref(), Some("no route to host"));

        rig.api.set_version_result(Ok(crate::testing::version_info("v1.30.2")));
        registry.on_network_online().await;
        assert!(dev.snapshot().accessible);
    }

    #[tokio::test]
    async fn test_stop_disconnects_everything() {
        let rig = Rig::new();
        let registry = registry(&rig);
        let dev = registry.add_cluster(rig.model("dev")).unwrap();
        dev.activate(false).await;
        registry.stop().await;
        assert!(dev.snapshot().disconnected);
        assert!(rig.proxy.stops.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_set_active_unknown_clears() {
        let rig = Rig::new();
        let registry = registry(&rig);
        let dev = registry.add_cluster(rig.model("dev")).unwrap();
        registry.set_active(Some(dev.id()));
        assert!(Arc::ptr_eq(&registry.active().unwrap(), &dev));
        registry.set_active(Some(&ClusterId::from("ghost")));
        assert!(registry.active().is_none());
    }

    #[tokio::test]
    async fn test_store_round_trip_through_registry() {
        let rig = Rig::new();
        let store_path = rig.dir.path().join("clusters.json");
        let (hub, _sync) = ReplicationHub::new();
        let registry = SessionRegistry::new(rig.services.clone(), hub).with_store_path(&store_path);
        let dev = registry
            .add_cluster(rig.model("dev").with_cluster_name("Dev"))
            .unwrap();
        registry.set_active(Some(dev.id()));
        registry.save_store(&store_path).unwrap();

        let (hub, _sync) = ReplicationHub::new();
        let restored = SessionRegistry::new(rig.services.clone(), hub);
        assert_eq!(restored.load_store(&store_path).unwrap(), 1);
        let session = restored.active().unwrap();
        assert_eq!(session.id(), dev.id());
        assert_eq!(session.name(), "Dev");
    }

    #[tokio::test]
    async fn test_store_skips_invalid_entries() {
        let rig = Rig::new();
        let store_path = rig.dir.path().join("clusters.json");
        let document = ClusterStoreModel {
            active_cluster: None,
            clusters: vec![rig.model("dev"), rig.model("dangling")],
        };
        store::save_store(&store_path, &document).unwrap();

        let registry = registry(&rig);
        assert_eq!(registry.load_store(&store_path).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_surface_bootstraps_from_registry() {
        let rig = Rig::new();
        let registry = registry(&rig);
        let dev = registry.add_cluster(rig.model("dev")).unwrap();
        dev.activate(false).await;

        let mut surface = DisplaySurface::connect(registry.hub()).await.unwrap();
        assert_eq!(surface.mirror().get(dev.id()), Some(&dev.snapshot()));

        registry.disconnect(dev.id()).await.unwrap();
        surface.next().await.unwrap();
        assert_eq!(surface.mirror().get(dev.id()), Some(&dev.snapshot()));
    }

    #[tokio::test]
    async fn test_surface_follows_readded_cluster() {
        let rig = Rig::new();
        let registry = registry(&rig);
        let mut surface = DisplaySurface::connect(registry.hub()).await.unwrap();

        let dev = registry.add_cluster(rig.model("dev")).unwrap();
        dev.activate(false).await;
        registry.remove_by_id(dev.id()).await;
        surface.drain();
        assert!(surface.mirror().get(dev.id()).unwrap().disconnected);

        let again = registry.add_cluster(rig.model("dev")).unwrap();
        again.activate(false).await;
        surface.drain();

        let mirrored = surface.mirror().get(again.id()).unwrap();
        assert_eq!(mirrored, &again.snapshot());
        assert!(mirrored.ready && !mirrored.disconnected);
        assert_eq!(
            surface.mirror().revision(again.id()),
            Some(again.revisioned_snapshot().0)
        );
    }

    #[tokio::test]
    async fn test_catalog_name_becomes_session_name() {
        let rig = Rig::new();
        let registry = registry(&rig);
        let mut entity = KubernetesCluster::new(&rig.kubeconfig, "dev");
        entity.metadata.name = "Development".into();

        registry.sync_from_catalog(std::slice::from_ref(&entity)).await;
        let session = registry.get_by_id(&entity.cluster_id()).unwrap();
        assert_eq!(session.name(), "Development");
        assert_eq!(session.context_name(), "dev");
    }

    #[tokio::test]
    async fn test_register_frame_pushes_state() {
        let rig = Rig::new();
        let registry = registry(&rig);
        let dev = registry.add_cluster(rig.model("dev")).unwrap();
        let frame = FrameInfo {
            surface_id: Uuid::new_v4(),
            frame_id: 1,
        };

        let mut rx = registry.register_frame(dev.id(), frame).unwrap();
        match rx.try_recv().unwrap() {
            ReplicationMessage::ClusterState { cluster_id, state, .. } => {
                assert_eq!(&cluster_id, dev.id());
                assert!(state.disconnected);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(registry
            .register_frame(&ClusterId::from("ghost"), frame)
            .is_err());
    }

    #[tokio::test]
    async fn test_add_persists_when_store_configured() {
        let rig = Rig::new();
        let store_path = rig.dir.path().join("clusters.json");
        let (hub, _sync) = ReplicationHub::new();
        let registry = SessionRegistry::new(rig.services.clone(), hub).with_store_path(&store_path);
        let dev = registry.add_cluster(rig.model("dev")).unwrap();

        let saved = store::load_store(&store_path).unwrap();
        assert_eq!(saved.clusters.len(), 1);
        assert_eq!(&saved.clusters[0].id, dev.id());

        registry.remove_by_id(dev.id()).await;
        assert!(store::load_store(&store_path).unwrap().clusters.is_empty());
    }
}

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::SessionError;
use crate::session::{ClusterSession, ListenerId, SessionEvent};
use crate::structs::{ClusterId, ClusterState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ReplicationMessage {
    #[serde(rename = "cluster:state", rename_all = "camelCase")]
    ClusterState {
        cluster_id: ClusterId,
        revision: u64,
        state: ClusterState,
    },
    #[serde(rename = "cluster:list-namespace-forbidden", rename_all = "camelCase")]
    ListNamespaceForbidden { cluster_id: ClusterId },
}

/// One entry of a full-sync reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncedState {
    pub cluster_id: ClusterId,
    pub revision: u64,
    pub state: ClusterState,
}

/// Bootstrap pull from a display surface, answered by the owner.
pub struct StateSyncRequest {
    pub reply: oneshot::Sender<Vec<SyncedState>>,
}

pub type SurfaceId = Uuid;

/// A sub-frame hosted inside a display surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameInfo {
    pub surface_id: SurfaceId,
    pub frame_id: u32,
}

struct FrameSink {
    cluster_id: ClusterId,
    tx: mpsc::UnboundedSender<ReplicationMessage>,
}

#[derive(Default)]
struct Subscribers {
    surfaces: HashMap<SurfaceId, mpsc::UnboundedSender<ReplicationMessage>>,
    frames: HashMap<FrameInfo, FrameSink>,
}

/// Owner-side fan-out of session snapshots to display surfaces and frames.
#[derive(Clone)]
pub struct ReplicationHub {
    subscribers: Arc<Mutex<Subscribers>>,
    sync_tx: mpsc::UnboundedSender<StateSyncRequest>,
}

impl ReplicationHub {
    /// The receiver carries bootstrap requests; hand it to whoever owns the
    /// sessions.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StateSyncRequest>) {
        let (sync_tx, sync_rx) = mpsc::unbounded_channel();
        let hub = Self {
            subscribers: Arc::new(Mutex::new(Subscribers::default())),
            sync_tx,
        };
        (hub, sync_rx)
    }

    fn subscribers(&self) -> MutexGuard<'_, Subscribers> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> (SurfaceId, mpsc::UnboundedReceiver<ReplicationMessage>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers().surfaces.insert(id, tx);
        debug!(surface_id = %id, "display surface subscribed");
        (id, rx)
    }

    pub fn unsubscribe(&self, id: &SurfaceId) {
        let mut subs = self.subscribers();
        subs.surfaces.remove(id);
        subs.frames.retain(|frame, _| frame.surface_id != *id);
    }

    pub fn register_frame(
        &self,
        cluster_id: ClusterId,
        frame: FrameInfo,
    ) -> mpsc::UnboundedReceiver<ReplicationMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        debug!(cluster_id = %cluster_id, "frame {frame:?} registered");
        self.subscribers()
            .frames
            .insert(frame, FrameSink { cluster_id, tx });
        rx
    }

    pub fn remove_frames_for(&self, cluster_id: &ClusterId) {
        self.subscribers()
            .frames
            .retain(|_, sink| sink.cluster_id != *cluster_id);
    }

    pub fn surface_count(&self) -> usize {
        self.subscribers().surfaces.len()
    }

    pub fn frame_count(&self) -> usize {
        self.subscribers().frames.len()
    }

    /// Fire-and-forget delivery to every live surface and frame. Closed
    /// receivers are pruned.
    pub fn broadcast(&self, message: ReplicationMessage) {
        trace!("broadcast {message:?}");
        let mut subs = self.subscribers();
        subs.surfaces.retain(|_, tx| tx.send(message.clone()).is_ok());
        subs.frames.retain(|_, sink| sink.tx.send(message.clone()).is_ok());
    }

    /// Forwards every state change and forbidden notice of `session`.
    pub fn observe(&self, session: &ClusterSession) -> ListenerId {
        let hub = self.clone();
        session.on_change(move |cluster_id, event| {
            let message = match event {
                SessionEvent::StateChanged { revision, state } => ReplicationMessage::ClusterState {
                    cluster_id: cluster_id.clone(),
                    revision: *revision,
                    state: state.clone(),
                },
                SessionEvent::NamespaceListForbidden => ReplicationMessage::ListNamespaceForbidden {
                    cluster_id: cluster_id.clone(),
                },
            };
            hub.broadcast(message);
        })
    }

    pub async fn request_full_sync(&self) -> Result<Vec<SyncedState>, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.sync_tx
            .send(StateSyncRequest { reply })
            .map_err(|_| SessionError::SyncClosed)?;
        rx.await.map_err(|_| SessionError::SyncClosed)
    }
}

/// Read-only local copy of every session's snapshot.
#[derive(Debug, Default, Clone)]
pub struct StateMirror {
    entries: HashMap<ClusterId, (u64, ClusterState)>,
}

impl StateMirror {
    /// Overwrites the entry unless it already holds a newer revision.
    pub fn apply(&mut self, cluster_id: ClusterId, revision: u64, state: ClusterState) -> bool {
        if let Some((current, _)) = self.entries.get(&cluster_id) {
            if *current > revision {
                trace!(cluster_id = %cluster_id, "dropping stale revision {revision} < {current}");
                return false;
            }
        }
        self.entries.insert(cluster_id, (revision, state));
        true
    }

    pub fn get(&self, cluster_id: &ClusterId) -> Option<&ClusterState> {
        self.entries.get(cluster_id).map(|(_, state)| state)
    }

    pub fn revision(&self, cluster_id: &ClusterId) -> Option<u64> {
        self.entries.get(cluster_id).map(|(rev, _)| *rev)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Consumer side: a mirror bootstrapped from a full sync, then kept current
/// from the broadcast stream.
pub struct DisplaySurface {
    id: SurfaceId,
    rx: mpsc::UnboundedReceiver<ReplicationMessage>,
    mirror: StateMirror,
    forbidden_notices: Vec<ClusterId>,
}

impl DisplaySurface {
    /// Subscribes before pulling the full state so nothing broadcast in
    /// between is lost.
    pub async fn connect(hub: &ReplicationHub) -> Result<Self, SessionError> {
        let (id, rx) = hub.subscribe();
        let mut mirror = StateMirror::default();
        for entry in hub.request_full_sync().await? {
            mirror.apply(entry.cluster_id, entry.revision, entry.state);
        }
        debug!(surface_id = %id, "bootstrapped {} cluster states", mirror.len());

        Ok(Self {
            id,
            rx,
            mirror,
            forbidden_notices: Vec::new(),
        })
    }

    pub fn id(&self) -> SurfaceId {
        self.id
    }

    pub fn mirror(&self) -> &StateMirror {
        &self.mirror
    }

    pub fn take_forbidden_notices(&mut self) -> Vec<ClusterId> {
        std::mem::take(&mut self.forbidden_notices)
    }

    fn handle(&mut self, message: ReplicationMessage) {
        match message {
            ReplicationMessage::ClusterState {
                cluster_id,
                revision,
                state,
            } => {
                self.mirror.apply(cluster_id, revision, state);
            }
            ReplicationMessage::ListNamespaceForbidden { cluster_id } => {
                self.forbidden_notices.push(cluster_id);
            }
        }
    }

    /// Waits for and applies the next message. `None` once the hub is gone.
    pub async fn next(&mut self) -> Option<ReplicationMessage> {
        let message = self.rx.recv().await?;
        self.handle(message.clone());
        Some(message)
    }

    /// Applies everything already queued and returns how many messages that was.
    pub fn drain(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(message) = self.rx.try_recv() {
            self.handle(message);
            applied += 1;
        }
        applied
    }
}

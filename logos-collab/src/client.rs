//! Client façade: one user, one ephemeral connection, many canvases.
//!
//! Bundles a durable store, an identity provider and an ephemeral connection
//! and hands out per-canvas [`ShapeSyncEngine`]s plus the presence, cursor
//! and drag channels. The flat `*_shape` / `*_user_*` methods mirror the
//! calls a UI layer makes.
//!
//! Reference: Kleppmann, Chapter 5 — Replication

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use log::{info, warn};
use logos_canvas::{CanvasDocument, CanvasId, NewShape, ShapeId, ShapePatch, ShapeRecord};
use tokio::time::MissedTickBehavior;

use crate::config::SyncConfig;
use crate::cursor::{CursorChannel, CursorPosition, RemoteCursor};
use crate::drag::{DragChannel, DragState};
use crate::engine::ShapeSyncEngine;
use crate::ephemeral::{ClientConnection, EphemeralStore};
use crate::error::CollabError;
use crate::identity::IdentityProvider;
use crate::lock::ShapeLockManager;
use crate::presence::{OnlineUser, PresenceEntry, PresenceRegistry};
use crate::storage::DurableShapeStore;
use crate::subscription::Subscription;

const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1);

pub struct CollabClient {
    config: SyncConfig,
    identity: Arc<dyn IdentityProvider>,
    store: Arc<dyn DurableShapeStore>,
    connection: ClientConnection,
    engines: DashMap<CanvasId, Arc<ShapeSyncEngine>>,
    presence: Arc<PresenceRegistry>,
    cursors: CursorChannel,
    drags: DragChannel,
}

impl CollabClient {
    /// Open a client connection on `ephemeral`.
    pub fn new(
        store: Arc<dyn DurableShapeStore>,
        ephemeral: &Arc<EphemeralStore>,
        identity: Arc<dyn IdentityProvider>,
        config: SyncConfig,
    ) -> Self {
        let connection = ephemeral.connect();
        let presence = Arc::new(PresenceRegistry::new(
            ephemeral.clone(),
            connection.clone(),
            identity.clone(),
            config.clone(),
        ));
        let cursors = CursorChannel::new(ephemeral.clone(), connection.clone(), identity.clone(), &config);
        let drags = DragChannel::new(ephemeral.clone(), connection.clone(), identity.clone(), &config);
        Self {
            config,
            identity,
            store,
            connection,
            engines: DashMap::new(),
            presence,
            cursors,
            drags,
        }
    }

    /// Sync engine for `canvas`, created on first use.
    pub fn canvas(&self, canvas: &CanvasId) -> Arc<ShapeSyncEngine> {
        self.engines
            .entry(canvas.clone())
            .or_insert_with(|| {
                Arc::new(ShapeSyncEngine::new(
                    canvas.clone(),
                    self.store.clone(),
                    self.identity.clone(),
                    self.config.clone(),
                ))
            })
            .clone()
    }

    pub fn locks(&self, canvas: &CanvasId) -> ShapeLockManager {
        ShapeLockManager::new(self.canvas(canvas), self.identity.clone())
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    pub fn cursors(&self) -> &CursorChannel {
        &self.cursors
    }

    pub fn drags(&self) -> &DragChannel {
        &self.drags
    }

    pub fn connection(&self) -> &ClientConnection {
        &self.connection
    }

    // ─── Shapes ───────────────────────────────────────────────────────

    pub async fn create_shape(&self, canvas: &CanvasId, shape: NewShape) -> Result<ShapeRecord, CollabError> {
        self.canvas(canvas).create(shape).await
    }

    pub async fn update_shape(
        &self,
        canvas: &CanvasId,
        id: &ShapeId,
        patch: ShapePatch,
    ) -> Result<ShapeRecord, CollabError> {
        self.canvas(canvas).update(id, patch).await
    }

    pub async fn delete_shape(&self, canvas: &CanvasId, id: &ShapeId) -> Result<(), CollabError> {
        self.canvas(canvas).remove(id).await
    }

    pub async fn batch_create_shapes(
        &self,
        canvas: &CanvasId,
        shapes: Vec<NewShape>,
    ) -> Result<Vec<ShapeRecord>, CollabError> {
        self.canvas(canvas).batch_create(shapes).await
    }

    pub async fn batch_update_shapes(
        &self,
        canvas: &CanvasId,
        updates: Vec<(ShapeId, ShapePatch)>,
    ) -> Result<Vec<ShapeRecord>, CollabError> {
        self.canvas(canvas).batch_update(updates).await
    }

    pub async fn batch_delete_shapes(&self, canvas: &CanvasId, ids: Vec<ShapeId>) -> Result<(), CollabError> {
        self.canvas(canvas).batch_delete(ids).await
    }

    pub async fn lock_shape(&self, canvas: &CanvasId, id: &ShapeId) -> Result<ShapeRecord, CollabError> {
        self.locks(canvas).lock(id).await
    }

    pub async fn unlock_shape(&self, canvas: &CanvasId, id: &ShapeId) -> Result<ShapeRecord, CollabError> {
        self.locks(canvas).unlock(id).await
    }

    pub async fn get_canvas_state(&self, canvas: &CanvasId) -> Result<Arc<CanvasDocument>, CollabError> {
        self.canvas(canvas).get_canvas_state().await
    }

    pub async fn subscribe_to_shapes<F>(&self, canvas: &CanvasId, callback: F) -> Result<Subscription, CollabError>
    where
        F: FnMut(&[ShapeRecord]) + Send + 'static,
    {
        self.canvas(canvas).subscribe(callback).await
    }

    // ─── Presence, cursors, drags ─────────────────────────────────────

    pub fn set_user_online(&self, session: &str) -> Result<PresenceEntry, CollabError> {
        self.presence.join(session)
    }

    pub fn set_user_presence(&self, session: &str, active: bool) -> Result<Option<PresenceEntry>, CollabError> {
        self.presence.set_presence(session, active)
    }

    pub fn subscribe_to_online_users<F>(&self, session: &str, callback: F) -> Subscription
    where
        F: FnMut(&[OnlineUser]) + Send + 'static,
    {
        self.presence.subscribe_online(session, callback)
    }

    pub fn update_user_cursor(&self, session: &str, pos: CursorPosition) -> bool {
        self.cursors.update_cursor(session, pos)
    }

    pub fn throttled_update_user_cursor(&self, session: &str, pos: CursorPosition) -> bool {
        self.cursors.throttled_update_cursor(session, pos)
    }

    pub fn subscribe_to_user_cursors<F>(&self, session: &str, callback: F) -> Subscription
    where
        F: FnMut(&[RemoteCursor]) + Send + 'static,
    {
        self.cursors.subscribe_cursors(session, callback)
    }

    pub fn set_shape_drag_state(
        &self,
        session: &str,
        shape_id: &ShapeId,
        is_dragging: bool,
        cursor: Option<(f64, f64)>,
    ) -> bool {
        self.drags.set_drag_state(session, shape_id, is_dragging, cursor)
    }

    pub fn subscribe_to_drag_states<F>(&self, session: &str, callback: F) -> Subscription
    where
        F: FnMut(&[DragState]) + Send + 'static,
    {
        self.drags.subscribe_drag_states(session, callback)
    }

    /// Refresh connection liveness and presence `lastSeen`.
    pub fn heartbeat(&self, session: &str) -> Result<(), CollabError> {
        self.presence.heartbeat(session)
    }

    /// Heartbeat `session` every third of the liveness timeout until the
    /// handle is released or the client is dropped.
    pub fn spawn_heartbeat(&self, session: &str) -> Subscription {
        let presence = Arc::downgrade(&self.presence);
        let session = session.to_string();
        let period = (self.config.liveness_timeout() / 3).max(MIN_HEARTBEAT_INTERVAL);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(presence) = presence.upgrade() else {
                    break;
                };
                if let Err(e) = presence.heartbeat(&session) {
                    warn!("Heartbeat for {} stopped: {}", session, e);
                    break;
                }
            }
        });
        Subscription::new("heartbeat", task)
    }

    /// Graceful teardown: leave `session`, clear cursor and drags, close the
    /// connection.
    pub fn close(&self, session: &str) {
        self.drags.end_all(session);
        self.cursors.clear_cursor(session);
        if let Err(e) = self.presence.leave(session) {
            info!("Leaving {} skipped: {}", session, e);
        }
        let leftover = self.connection.close();
        info!("Client closed session {} ({} leftover entr(ies))", session, leftover);
    }
}

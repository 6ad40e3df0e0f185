//! Shape sync engine — optimistic local edits over a durable canvas store.
//!
//! ## Write path
//!
//! ```text
//! create/update/remove
//!       │  1. mutate ShapeCache immediately (Pending)
//!       ▼
//! DurableShapeStore::commit(writes)      one atomic batch per call
//!       │
//!       ├── Ok(doc)  → apply doc to cache (Confirmed)
//!       └── Err(e)   → create/remove: roll back locally, return e
//!                      update: keep local copy, return e (next snapshot corrects)
//! ```
//!
//! ## Read path
//!
//! Every snapshot pushed by the store replaces the cache wholesale. Snapshots
//! older than the one already applied are ignored.
//!
//! Updates are last-writer-wins at record granularity: the writer's whole
//! cached record replaces the durable one, never a field-level merge.
//!
//! Lock checks ride inside the commit: every update or delete batch carries
//! an `ExpectLock` per touched shape, so the store rejects it if a lock moved
//! after the check. The engine then reloads and checks again.

use std::sync::Arc;

use log::{debug, error, warn};
use logos_canvas::{
    now_millis, CanvasDocument, CanvasId, DocumentError, NewShape, ShapeId, ShapePatch, ShapeRecord,
    ShapeWrite,
};
use tokio::sync::{watch, RwLock};

use crate::cache::{ShapeCache, ShapeSyncState};
use crate::config::{LockPolicy, SyncConfig};
use crate::error::CollabError;
use crate::identity::IdentityProvider;
use crate::storage::{DurableShapeStore, StoreError};
use crate::subscription::Subscription;

/// Author recorded on shapes edited without a signed-in user.
pub const ANONYMOUS_USER: &str = "anonymous";

/// Commits retried after a lock moved underneath before giving up.
const LOCK_CHECK_ATTEMPTS: usize = 3;

/// Precondition evaluated against both the cached and the durable record.
pub(crate) type WriteGuard<'g> = &'g (dyn Fn(&ShapeRecord) -> Result<(), CollabError> + Sync);

struct Shared {
    cache: RwLock<ShapeCache>,
    /// Version of the last snapshot applied to the cache.
    version: watch::Sender<Option<u64>>,
}

impl Shared {
    /// Apply `doc` and return the resulting cache contents.
    async fn apply(&self, doc: &CanvasDocument) -> Vec<ShapeRecord> {
        let mut cache = self.cache.write().await;
        if cache.apply_snapshot(doc) {
            self.version.send_replace(Some(doc.version));
        }
        cache.shapes().to_vec()
    }
}

/// Per-canvas sync engine owned by one client.
pub struct ShapeSyncEngine {
    canvas: CanvasId,
    store: Arc<dyn DurableShapeStore>,
    identity: Arc<dyn IdentityProvider>,
    config: SyncConfig,
    shared: Arc<Shared>,
}

impl ShapeSyncEngine {
    pub fn new(
        canvas: CanvasId,
        store: Arc<dyn DurableShapeStore>,
        identity: Arc<dyn IdentityProvider>,
        config: SyncConfig,
    ) -> Self {
        let (version, _) = watch::channel(None);
        Self {
            canvas,
            store,
            identity,
            config,
            shared: Arc::new(Shared {
                cache: RwLock::new(ShapeCache::new()),
                version,
            }),
        }
    }

    pub fn canvas_id(&self) -> &CanvasId {
        &self.canvas
    }

    pub(crate) fn config(&self) -> &SyncConfig {
        &self.config
    }

    fn author(&self) -> String {
        self.identity
            .current_user()
            .map(|u| u.id)
            .unwrap_or_else(|| ANONYMOUS_USER.to_string())
    }

    /// Edit-lock check for ordinary updates and deletes.
    fn check_edit_lock(&self, record: &ShapeRecord, user: &str, now: u64) -> Result<(), CollabError> {
        if self.config.lock_policy == LockPolicy::Advisory {
            return Ok(());
        }
        match record.blocking_lock(user, now, self.config.lock_ttl()) {
            Some(lock) => Err(CollabError::LockConflict {
                shape_id: record.id.clone(),
                locked_by: lock.locked_by.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Mark `op` done and fold the committed document into the cache.
    async fn settle(&self, op: u64, doc: &CanvasDocument) {
        let mut cache = self.shared.cache.write().await;
        cache.finish(op);
        if cache.apply_snapshot(doc) {
            self.shared.version.send_replace(Some(doc.version));
        }
    }

    // ─── Create ───────────────────────────────────────────────────────

    /// Create one shape. The id is generated unless the caller set one.
    pub async fn create(&self, shape: NewShape) -> Result<ShapeRecord, CollabError> {
        let record = shape.into_record(&self.author(), now_millis())?;
        self.insert_records(std::slice::from_ref(&record)).await?;
        Ok(record)
    }

    /// Create several shapes in one atomic durable write.
    pub async fn batch_create(&self, shapes: Vec<NewShape>) -> Result<Vec<ShapeRecord>, CollabError> {
        let author = self.author();
        let now = now_millis();
        let records = shapes
            .into_iter()
            .map(|s| s.into_record(&author, now))
            .collect::<Result<Vec<_>, _>>()?;
        self.insert_records(&records).await?;
        Ok(records)
    }

    async fn insert_records(&self, records: &[ShapeRecord]) -> Result<(), CollabError> {
        if records.is_empty() {
            return Ok(());
        }
        let ids: Vec<ShapeId> = records.iter().map(|r| r.id.clone()).collect();

        let op = {
            let mut cache = self.shared.cache.write().await;
            for (i, id) in ids.iter().enumerate() {
                if cache.contains(id) || ids[..i].contains(id) {
                    return Err(CollabError::DuplicateShape(id.clone()));
                }
            }
            for record in records {
                cache.insert(record.clone());
            }
            cache.begin(ids.clone())
        };

        let writes = records.iter().cloned().map(ShapeWrite::Append).collect();
        match self.store.commit(&self.canvas, writes).await {
            Ok(doc) => {
                self.settle(op, &doc).await;
                debug!("Created {} shape(s) on {}", ids.len(), self.canvas);
                Ok(())
            }
            Err(e) => {
                warn!("Rolling back {} create(s) on {}: {}", ids.len(), self.canvas, e);
                self.shared.cache.write().await.rollback_create(op, &ids);
                Err(e.into())
            }
        }
    }

    // ─── Update ───────────────────────────────────────────────────────

    /// Merge `patch` into a shape.
    ///
    /// Fails with [`CollabError::LockConflict`] under the enforced lock
    /// policy when another user holds a live lock.
    pub async fn update(&self, id: &ShapeId, patch: ShapePatch) -> Result<ShapeRecord, CollabError> {
        let author = self.author();
        let now = now_millis();
        let guard = |record: &ShapeRecord| self.check_edit_lock(record, &author, now);
        let mut updated = self.update_guarded(vec![(id.clone(), patch)], &author, &guard).await?;
        updated.pop().ok_or_else(|| CollabError::ShapeNotFound(id.clone()))
    }

    /// Patch several shapes in one atomic durable write.
    pub async fn batch_update(
        &self,
        updates: Vec<(ShapeId, ShapePatch)>,
    ) -> Result<Vec<ShapeRecord>, CollabError> {
        let author = self.author();
        let now = now_millis();
        let guard = |record: &ShapeRecord| self.check_edit_lock(record, &author, now);
        self.update_guarded(updates, &author, &guard).await
    }

    /// Read-modify-write of cached records; `guard` vets cached and durable copies.
    pub(crate) async fn update_guarded(
        &self,
        updates: Vec<(ShapeId, ShapePatch)>,
        author: &str,
        guard: WriteGuard<'_>,
    ) -> Result<Vec<ShapeRecord>, CollabError> {
        if updates.is_empty() {
            return Ok(Vec::new());
        }
        let now = now_millis();

        let (updated, op) = {
            let mut cache = self.shared.cache.write().await;
            let mut updated: Vec<ShapeRecord> = Vec::with_capacity(updates.len());
            for (id, patch) in &updates {
                let position = updated.iter().position(|r| &r.id == id);
                let mut next = match position {
                    Some(i) => updated[i].clone(),
                    None => {
                        let current = cache
                            .get(id)
                            .ok_or_else(|| CollabError::ShapeNotFound(id.clone()))?;
                        guard(current)?;
                        current.clone()
                    }
                };
                next.apply_patch(patch, author, now)?;
                match position {
                    Some(i) => updated[i] = next,
                    None => updated.push(next),
                }
            }
            for record in &updated {
                cache.replace(record.clone());
            }
            let op = cache.begin(updated.iter().map(|r| r.id.clone()).collect());
            (updated, op)
        };

        let ids: Vec<ShapeId> = updated.iter().map(|r| r.id.clone()).collect();
        let writes = updated.iter().cloned().map(ShapeWrite::Put).collect();
        match self.commit_checked(&ids, true, writes, guard).await {
            Ok(doc) => {
                self.settle(op, &doc).await;
                debug!("Updated {} shape(s) on {}", updated.len(), self.canvas);
                Ok(updated)
            }
            Err(e) => {
                // No value history to restore; the next snapshot repairs the cache.
                warn!("Update on {} failed: {}", self.canvas, e);
                let mut cache = self.shared.cache.write().await;
                cache.finish(op);
                cache.mark_drifted();
                Err(e)
            }
        }
    }

    /// Commit `writes` only while the durable locks of `ids` are the ones
    /// `guard` approved.
    ///
    /// With `must_exist` a durably missing id is an error; otherwise it is
    /// skipped.
    async fn commit_checked(
        &self,
        ids: &[ShapeId],
        must_exist: bool,
        writes: Vec<ShapeWrite>,
        guard: WriteGuard<'_>,
    ) -> Result<Arc<CanvasDocument>, CollabError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let current = self.store.load(&self.canvas).await?;
            let mut batch = Vec::with_capacity(ids.len() + writes.len());
            for id in ids {
                match current.shape(id) {
                    Some(durable) => {
                        guard(durable)?;
                        batch.push(ShapeWrite::ExpectLock {
                            id: id.clone(),
                            lock: durable.lock.clone(),
                        });
                    }
                    None if must_exist => return Err(CollabError::ShapeNotFound(id.clone())),
                    None => {}
                }
            }
            batch.extend(writes.iter().cloned());

            match self.store.commit(&self.canvas, batch).await {
                Err(StoreError::Rejected(DocumentError::LockChanged { id, .. }))
                    if attempt < LOCK_CHECK_ATTEMPTS =>
                {
                    debug!("Lock on {} moved during commit, checking again", id);
                }
                Err(StoreError::Rejected(DocumentError::MissingShape(id)))
                    if !must_exist && attempt < LOCK_CHECK_ATTEMPTS =>
                {
                    debug!("{} vanished during commit, checking again", id);
                }
                result => return Ok(result?),
            }
        }
    }

    // ─── Remove ───────────────────────────────────────────────────────

    pub async fn remove(&self, id: &ShapeId) -> Result<(), CollabError> {
        self.batch_delete(vec![id.clone()]).await
    }

    /// Remove several shapes in one atomic durable write.
    pub async fn batch_delete(&self, ids: Vec<ShapeId>) -> Result<(), CollabError> {
        if ids.is_empty() {
            return Ok(());
        }
        let author = self.author();
        let now = now_millis();

        let guard = |record: &ShapeRecord| self.check_edit_lock(record, &author, now);

        let (op, removed) = {
            let mut cache = self.shared.cache.write().await;
            for (i, id) in ids.iter().enumerate() {
                if ids[..i].contains(id) {
                    continue;
                }
                let record = cache
                    .get(id)
                    .ok_or_else(|| CollabError::ShapeNotFound(id.clone()))?;
                guard(record)?;
            }
            let removed: Vec<_> = ids.iter().filter_map(|id| cache.remove(id)).collect();
            (cache.begin(ids.clone()), removed)
        };

        let mut unique = ids.clone();
        unique.sort();
        unique.dedup();
        let writes = ids.iter().cloned().map(ShapeWrite::Remove).collect();
        match self.commit_checked(&unique, false, writes, &guard).await {
            Ok(doc) => {
                self.settle(op, &doc).await;
                debug!("Removed {} shape(s) from {}", removed.len(), self.canvas);
                Ok(())
            }
            Err(e) => {
                warn!("Restoring {} removed shape(s) on {}: {}", removed.len(), self.canvas, e);
                self.shared.cache.write().await.rollback_remove(op, removed);
                Err(e.into())
            }
        }
    }

    // ─── Reads & subscriptions ────────────────────────────────────────

    /// Fetch the authoritative document (created empty on first access).
    pub async fn get_canvas_state(&self) -> Result<Arc<CanvasDocument>, CollabError> {
        let doc = self.store.load(&self.canvas).await?;
        self.shared.apply(&doc).await;
        Ok(doc)
    }

    /// Stream snapshots into the cache and hand the resulting shapes to `callback`.
    ///
    /// On a channel error the callback receives an empty slice and the cache
    /// is left as it was.
    pub async fn subscribe<F>(&self, mut callback: F) -> Result<Subscription, CollabError>
    where
        F: FnMut(&[ShapeRecord]) + Send + 'static,
    {
        let mut stream = self.store.subscribe(&self.canvas).await?;
        let shared = self.shared.clone();
        let canvas = self.canvas.clone();

        let task = tokio::spawn(async move {
            loop {
                match stream.next().await {
                    Some(Ok(doc)) => {
                        let shapes = shared.apply(&doc).await;
                        callback(&shapes);
                    }
                    Some(Err(e)) => {
                        error!("Snapshot channel error on {}: {}", canvas, e);
                        callback(&[]);
                    }
                    None => {
                        error!("Snapshot channel for {} closed", canvas);
                        callback(&[]);
                        break;
                    }
                }
            }
        });
        Ok(Subscription::new("shape snapshot", task))
    }

    /// Resolve once a snapshot at `version` or newer is in the cache.
    pub async fn wait_for_version(&self, version: u64) {
        let mut rx = self.shared.version.subscribe();
        let _ = rx.wait_for(|v| v.is_some_and(|v| v >= version)).await;
    }

    pub async fn shapes(&self) -> Vec<ShapeRecord> {
        self.shared.cache.read().await.shapes().to_vec()
    }

    pub async fn shape(&self, id: &ShapeId) -> Option<ShapeRecord> {
        self.shared.cache.read().await.get(id).cloned()
    }

    pub async fn shape_state(&self, id: &ShapeId) -> Option<ShapeSyncState> {
        self.shared.cache.read().await.state(id)
    }

    /// Whether any durable write is still in flight.
    pub async fn is_syncing(&self) -> bool {
        self.shared.cache.read().await.is_syncing()
    }

    pub async fn pending_count(&self) -> usize {
        self.shared.cache.read().await.pending_count()
    }

    /// Version of the last snapshot applied to the cache.
    pub async fn version(&self) -> Option<u64> {
        self.shared.cache.read().await.version()
    }
}

//! In-memory durable store for tests, simulations and single-process use.
//!
//! Behaves like a remote document database: commits are serialized, every
//! commit produces a new immutable snapshot, and subscribers are fed through
//! the shared [`SnapshotHub`]. Fault injection hooks let callers take the
//! store offline or break a subscription channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use logos_canvas::{now_millis, CanvasDocument, CanvasId, ShapeWrite};
use tokio::sync::RwLock;

use super::{BoxFuture, DurableShapeStore, SnapshotHub, SnapshotStream, StoreError, StoreResult};

#[derive(Default)]
struct Canvases {
    live: HashMap<CanvasId, Arc<CanvasDocument>>,
    /// Last version of each deleted canvas.
    retired: HashMap<CanvasId, u64>,
}

impl Canvases {
    fn get_or_create(&mut self, canvas: &CanvasId) -> &mut Arc<CanvasDocument> {
        let retired = self.retired.get(canvas).copied();
        self.live.entry(canvas.clone()).or_insert_with(|| {
            let now = now_millis();
            Arc::new(match retired {
                Some(version) => {
                    info!("Re-creating canvas {} above retired v{}", canvas, version);
                    CanvasDocument::recreated(canvas.clone(), version, now)
                }
                None => {
                    info!("Created canvas {}", canvas);
                    CanvasDocument::empty(canvas.clone(), now)
                }
            })
        })
    }
}

/// In-memory store with fault injection.
#[derive(Default)]
pub struct MemoryShapeStore {
    canvases: RwLock<Canvases>,
    hub: SnapshotHub,
    offline: AtomicBool,
    /// Simulated round-trip before each commit, in milliseconds.
    latency_ms: AtomicU64,
    commits: AtomicU64,
}

impl MemoryShapeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every operation fails with [`StoreError::Unavailable`].
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
        info!("Memory store is now {}", if offline { "offline" } else { "online" });
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    /// Delay every commit by `latency` before it takes the write lock.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms.store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Break the subscription channel of `canvas` with `err`.
    ///
    /// Subscribers receive the error once; the next commit heals the channel.
    pub fn inject_subscription_error(&self, canvas: &CanvasId, err: StoreError) {
        warn!("Injecting subscription error on {}: {}", canvas, err);
        self.hub.publish_error(canvas, err);
    }

    /// Number of successful commits since creation.
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self, canvas: &CanvasId) -> usize {
        self.hub.subscriber_count(canvas)
    }

    fn check_online(&self) -> StoreResult<()> {
        if self.is_offline() {
            return Err(StoreError::Unavailable("memory store is offline".into()));
        }
        Ok(())
    }

    async fn load_or_create(&self, canvas: &CanvasId) -> Arc<CanvasDocument> {
        if let Some(doc) = self.canvases.read().await.live.get(canvas) {
            return doc.clone();
        }
        self.canvases.write().await.get_or_create(canvas).clone()
    }
}

impl DurableShapeStore for MemoryShapeStore {
    fn load<'a>(&'a self, canvas: &'a CanvasId) -> BoxFuture<'a, StoreResult<Arc<CanvasDocument>>> {
        Box::pin(async move {
            self.check_online()?;
            Ok(self.load_or_create(canvas).await)
        })
    }

    fn commit<'a>(
        &'a self,
        canvas: &'a CanvasId,
        writes: Vec<ShapeWrite>,
    ) -> BoxFuture<'a, StoreResult<Arc<CanvasDocument>>> {
        Box::pin(async move {
            let latency = self.latency_ms.load(Ordering::SeqCst);
            if latency > 0 {
                tokio::time::sleep(Duration::from_millis(latency)).await;
            }
            self.check_online()?;

            let mut canvases = self.canvases.write().await;
            let current = canvases.get_or_create(canvas);

            let mut next = CanvasDocument::clone(current);
            next.apply_writes(&writes, now_millis())?;
            let next = Arc::new(next);
            *current = next.clone();

            // Publish under the write lock so snapshot order follows commit order.
            self.hub.publish(next.clone());
            self.commits.fetch_add(1, Ordering::SeqCst);
            debug!("Committed {} write(s) to {} → v{}", writes.len(), canvas, next.version);
            Ok(next)
        })
    }

    fn subscribe<'a>(&'a self, canvas: &'a CanvasId) -> BoxFuture<'a, StoreResult<SnapshotStream>> {
        Box::pin(async move {
            self.check_online()?;
            let doc = self.load_or_create(canvas).await;
            Ok(self.hub.subscribe(doc))
        })
    }

    fn delete_canvas<'a>(&'a self, canvas: &'a CanvasId) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            self.check_online()?;
            let removed = {
                let mut canvases = self.canvases.write().await;
                let removed = canvases.live.remove(canvas);
                if let Some(doc) = &removed {
                    canvases.retired.insert(canvas.clone(), doc.version);
                }
                removed
            };
            self.hub.close(canvas);
            match removed {
                Some(_) => {
                    info!("Deleted canvas {}", canvas);
                    Ok(())
                }
                None => Err(StoreError::NotFound(canvas.clone())),
            }
        })
    }

    fn list_canvases(&self) -> BoxFuture<'_, StoreResult<Vec<CanvasId>>> {
        Box::pin(async move {
            self.check_online()?;
            let mut ids: Vec<CanvasId> = self.canvases.read().await.live.keys().cloned().collect();
            ids.sort();
            Ok(ids)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use logos_canvas::{DocumentError, NewShape, ShapeId};

    fn rect(id: &str) -> ShapeWrite {
        ShapeWrite::Append(
            NewShape::rectangle(0.0, 0.0, 10.0, 10.0)
                .with_id(id)
                .into_record("alice", 1)
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_load_creates_lazily() {
        let store = MemoryShapeStore::new();
        let canvas = CanvasId::from("main");
        assert!(store.list_canvases().await.unwrap().is_empty());

        let doc = store.load(&canvas).await.unwrap();
        assert_eq!(doc.version, 0);
        assert!(doc.is_empty());
        assert_eq!(store.list_canvases().await.unwrap(), vec![canvas]);
    }

    #[tokio::test]
    async fn test_commit_bumps_version() {
        let store = MemoryShapeStore::new();
        let canvas = CanvasId::from("main");
        let doc = store.commit(&canvas, vec![rect("a"), rect("b")]).await.unwrap();
        assert_eq!(doc.version, 1);
        assert_eq!(doc.len(), 2);
        assert_eq!(store.commit_count(), 1);
    }

    #[tokio::test]
    async fn test_rejected_commit_changes_nothing() {
        let store = MemoryShapeStore::new();
        let canvas = CanvasId::from("main");
        store.commit(&canvas, vec![rect("a")]).await.unwrap();

        let err = store.commit(&canvas, vec![rect("b"), rect("a")]).await.unwrap_err();
        assert_eq!(err, StoreError::Rejected(DocumentError::DuplicateShape(ShapeId::from("a"))));

        let doc = store.load(&canvas).await.unwrap();
        assert_eq!(doc.version, 1);
        assert_eq!(doc.len(), 1);
    }

    #[tokio::test]
    async fn test_offline_fails_fast() {
        let store = MemoryShapeStore::new();
        let canvas = CanvasId::from("main");
        store.set_offline(true);
        assert!(matches!(store.load(&canvas).await, Err(StoreError::Unavailable(_))));
        assert!(matches!(
            store.commit(&canvas, vec![rect("a")]).await,
            Err(StoreError::Unavailable(_))
        ));
        store.set_offline(false);
        assert!(store.commit(&canvas, vec![rect("a")]).await.is_ok());
    }

    #[tokio::test]
    async fn test_subscription_sees_commits() {
        let store = MemoryShapeStore::new();
        let canvas = CanvasId::from("main");
        let mut stream = store.subscribe(&canvas).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap().version, 0);

        store.commit(&canvas, vec![rect("a")]).await.unwrap();
        let doc = stream.next().await.unwrap().unwrap();
        assert_eq!(doc.version, 1);
        assert!(doc.contains(&ShapeId::from("a")));
    }

    #[tokio::test]
    async fn test_delete_canvas_closes_streams() {
        let store = MemoryShapeStore::new();
        let canvas = CanvasId::from("main");
        let mut stream = store.subscribe(&canvas).await.unwrap();
        stream.next().await.unwrap().unwrap();

        store.delete_canvas(&canvas).await.unwrap();
        assert!(stream.next().await.is_none());
        assert!(matches!(
            store.delete_canvas(&canvas).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_recreated_canvas_keeps_versions_rising() {
        let store = MemoryShapeStore::new();
        let canvas = CanvasId::from("main");
        store.commit(&canvas, vec![rect("a")]).await.unwrap();
        store.commit(&canvas, vec![rect("b")]).await.unwrap();
        store.delete_canvas(&canvas).await.unwrap();

        let doc = store.load(&canvas).await.unwrap();
        assert!(doc.is_empty());
        assert_eq!(doc.version, 3);

        let mut stream = store.subscribe(&canvas).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap().version, 3);
        let doc = store.commit(&canvas, vec![rect("a")]).await.unwrap();
        assert_eq!(doc.version, 4);
        assert_eq!(stream.next().await.unwrap().unwrap().version, 4);
    }
}

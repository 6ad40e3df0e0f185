//! Durable shape storage for canvas documents.
//!
//! Architecture:
//! ```text
//! ┌────────────────┐  commit(writes)   ┌────────────────────┐
//! │ ShapeSyncEngine│ ────────────────► │ DurableShapeStore  │
//! │ (per client)   │                   │ memory │ rocksdb   │
//! └───────▲────────┘                   └─────────┬──────────┘
//!         │                                      │ publish
//!         │        SnapshotStream (watch)  ┌─────▼──────┐
//!         └────────────────────────────────│ SnapshotHub│
//!                                          └────────────┘
//! ```
//!
//! Every backend keeps exactly one [`CanvasDocument`] per canvas, applies a
//! batch of [`ShapeWrite`]s as one transaction and pushes the resulting
//! snapshot to all subscribers of that canvas. Subscribers that fall behind
//! only ever see the newest snapshot.
//!
//! Reference: Kleppmann — DDIA, Chapter 11 (Change Streams)

pub mod hub;
pub mod memory;
pub mod rocks;

pub use hub::SnapshotHub;
pub use memory::MemoryShapeStore;
pub use rocks::{CanvasMetadata, RocksShapeStore, StoreConfig};

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use logos_canvas::{CanvasDocument, CanvasId, DocumentError, ShapeWrite};
use thiserror::Error;
use tokio::sync::watch;

/// Storage errors.
///
/// `Clone` so a single failure can be fanned out to every snapshot subscriber.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Write rejected: {0}")]
    Rejected(#[from] DocumentError),
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Canvas not found: {0}")]
    NotFound(CanvasId),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Result type for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Boxed future returned by store operations, so stores can live behind `dyn`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One item of a snapshot subscription.
pub type SnapshotEvent = Result<Arc<CanvasDocument>, StoreError>;

/// Durable, transactional storage of canvas documents.
pub trait DurableShapeStore: Send + Sync {
    /// Load a canvas, creating an empty document on first access.
    fn load<'a>(&'a self, canvas: &'a CanvasId) -> BoxFuture<'a, StoreResult<Arc<CanvasDocument>>>;

    /// Apply `writes` atomically, bump the version and notify subscribers.
    ///
    /// Returns the committed document.
    fn commit<'a>(
        &'a self,
        canvas: &'a CanvasId,
        writes: Vec<ShapeWrite>,
    ) -> BoxFuture<'a, StoreResult<Arc<CanvasDocument>>>;

    /// Subscribe to snapshots. The current document is delivered first.
    fn subscribe<'a>(&'a self, canvas: &'a CanvasId) -> BoxFuture<'a, StoreResult<SnapshotStream>>;

    /// Explicit canvas teardown. Open subscriptions are closed.
    fn delete_canvas<'a>(&'a self, canvas: &'a CanvasId) -> BoxFuture<'a, StoreResult<()>>;

    /// All canvases that currently have a document.
    fn list_canvases(&self) -> BoxFuture<'_, StoreResult<Vec<CanvasId>>>;
}

/// Push-based stream of snapshots for one canvas.
pub struct SnapshotStream {
    canvas: CanvasId,
    rx: watch::Receiver<SnapshotEvent>,
}

impl SnapshotStream {
    pub(crate) fn new(canvas: CanvasId, mut rx: watch::Receiver<SnapshotEvent>) -> Self {
        // Deliver the value present at subscription time.
        rx.mark_changed();
        Self { canvas, rx }
    }

    /// Wait for the next snapshot. `None` once the canvas channel is closed.
    pub async fn next(&mut self) -> Option<SnapshotEvent> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    pub fn canvas(&self) -> &CanvasId {
        &self.canvas
    }
}

//! # logos-canvas — Shape document model for Logos canvases
//!
//! Plain data types shared by every collaboration component:
//!
//! ```text
//! CanvasDocument { id, version, lastUpdated }
//!   └── shapes: Vec<ShapeRecord>        (order = z-order on insert)
//!         ├── kind: ShapeKind           (rectangle | ellipse | text)
//!         ├── geometry + style
//!         ├── audit  (created*/lastModified*)
//!         └── lock:  Option<ShapeLock>  (all-or-nothing)
//! ```
//!
//! Mutations are expressed as [`ShapeWrite`] batches applied atomically by
//! [`CanvasDocument::apply_writes`]. Nothing in this crate is async; stores and
//! sync engines live in `logos-collab`.

pub mod document;
pub mod shape;

pub use document::{CanvasDocument, CanvasId, DocumentError, ShapeWrite};
pub use shape::{
    NewShape, ShapeError, ShapeId, ShapeKind, ShapeLock, ShapePatch, ShapeRecord, DEFAULT_FILL,
};

use std::time::SystemTime;

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

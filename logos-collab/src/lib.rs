//! # logos-collab — Real-time collaboration core for Logos canvases
//!
//! Keeps a durable set of shapes consistent across concurrent clients and
//! carries high-frequency, non-durable signals (presence, cursors, drags)
//! alongside it.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────── CollabClient (per user) ───────────────────────────┐
//! │                                                                                 │
//! │  ShapeLockManager ──► ShapeSyncEngine ──► ShapeCache        PresenceRegistry    │
//! │                            │   ▲                            CursorChannel       │
//! │                    commit  │   │ snapshots                  DragChannel         │
//! └────────────────────────────┼───┼──────────────────────────────────┼────────────┘
//!                              ▼   │                                  ▼
//!                    ┌──────────────────────┐             ┌──────────────────────┐
//!                    │ DurableShapeStore    │             │ EphemeralStore       │
//!                    │ (memory | RocksDB)   │             │ hooks + reaper       │
//!                    │ SnapshotHub fan-out  │             │ change fan-out       │
//!                    └──────────────────────┘             └──────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`storage`] — Durable canvas store trait, memory and RocksDB backends
//! - [`engine`] — Optimistic shape sync over the durable store
//! - [`cache`] — Version-checked local shape cache
//! - [`lock`] — Per-shape pessimistic locks
//! - [`ephemeral`] — Owner-checked ephemeral entries with disconnect cleanup
//! - [`presence`], [`cursor`], [`drag`] — Side channels on the ephemeral store
//! - [`client`] — One-stop façade for a signed-in user

pub mod cache;
pub mod client;
pub mod config;
pub mod cursor;
pub mod drag;
pub mod engine;
pub mod ephemeral;
pub mod error;
pub mod identity;
pub mod lock;
pub mod presence;
pub mod storage;
pub mod subscription;
pub mod throttle;

// Re-exports for convenience
pub use cache::{OperationId, ShapeCache, ShapeSyncState};
pub use client::CollabClient;
pub use config::{ConfigError, LockPolicy, SyncConfig};
pub use cursor::{CursorChannel, CursorPosition, CursorSample, RemoteCursor};
pub use drag::{DragChannel, DragState};
pub use engine::{ShapeSyncEngine, ANONYMOUS_USER};
pub use ephemeral::{
    ClientConnection, ConnectionId, EphemeralChange, EphemeralKey, EphemeralSpace,
    EphemeralStore, EphemeralValue,
};
pub use error::CollabError;
pub use identity::{IdentityProvider, StaticIdentity, UserIdentity};
pub use lock::ShapeLockManager;
pub use presence::{user_color, OnlineUser, PresenceEntry, PresenceRegistry, USER_COLORS};
pub use storage::{
    CanvasMetadata, DurableShapeStore, MemoryShapeStore, RocksShapeStore, SnapshotHub,
    SnapshotStream, StoreConfig, StoreError,
};
pub use subscription::Subscription;
pub use throttle::Throttle;

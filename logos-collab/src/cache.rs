//! Client-side shape cache with optimistic operation tracking.
//!
//! ```text
//!   local op ──► insert/replace/remove ──► Pending ──┬─► snapshot contains id ─► Confirmed
//!                                                    └─► durable write failed  ─► RolledBack
//! ```
//!
//! The cache has one writer at a time (the engine holds it behind a lock) and
//! is version-checked: a snapshot older than the one already applied is
//! dropped, and an operation that started before the latest snapshot is
//! *superseded*, so its failure no longer touches the cache.

use std::collections::{HashMap, HashSet};

use logos_canvas::{CanvasDocument, ShapeId, ShapeRecord};

/// Identifier of one in-flight durable write.
pub type OperationId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeSyncState {
    /// Local change not yet reflected in an authoritative snapshot.
    Pending,
    /// Present in the latest snapshot.
    Confirmed,
    /// Durable write failed; the local change was undone.
    RolledBack,
}

#[derive(Debug)]
struct PendingOperation {
    shape_ids: Vec<ShapeId>,
    base_version: Option<u64>,
}

#[derive(Debug, Default)]
pub struct ShapeCache {
    shapes: Vec<ShapeRecord>,
    snapshot_version: Option<u64>,
    confirmed: HashSet<ShapeId>,
    rolled_back: HashSet<ShapeId>,
    pending: HashMap<OperationId, PendingOperation>,
    next_op: OperationId,
    /// Local copy diverged from the last snapshot without a rollback.
    drifted: bool,
}

impl ShapeCache {
    pub fn new() -> Self {
        Self::default()
    }

    // ─── Reads ────────────────────────────────────────────────────────

    pub fn shapes(&self) -> &[ShapeRecord] {
        &self.shapes
    }

    pub fn get(&self, id: &ShapeId) -> Option<&ShapeRecord> {
        self.shapes.iter().find(|s| &s.id == id)
    }

    pub fn contains(&self, id: &ShapeId) -> bool {
        self.get(id).is_some()
    }

    /// Version of the last applied snapshot.
    pub fn version(&self) -> Option<u64> {
        self.snapshot_version
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_syncing(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn state(&self, id: &ShapeId) -> Option<ShapeSyncState> {
        if self.pending.values().any(|op| op.shape_ids.contains(id)) {
            return Some(ShapeSyncState::Pending);
        }
        if self.confirmed.contains(id) && self.contains(id) {
            return Some(ShapeSyncState::Confirmed);
        }
        if self.rolled_back.contains(id) {
            return Some(ShapeSyncState::RolledBack);
        }
        self.contains(id).then_some(ShapeSyncState::Pending)
    }

    // ─── Operation tracking ───────────────────────────────────────────

    /// Register an in-flight write touching `shape_ids`.
    pub fn begin(&mut self, shape_ids: Vec<ShapeId>) -> OperationId {
        let op = self.next_op;
        self.next_op += 1;
        for id in &shape_ids {
            self.rolled_back.remove(id);
        }
        self.pending.insert(
            op,
            PendingOperation {
                shape_ids,
                base_version: self.snapshot_version,
            },
        );
        op
    }

    /// The write finished successfully.
    pub fn finish(&mut self, op: OperationId) {
        self.pending.remove(&op);
    }

    /// A write failed without rollback; the next snapshot is applied even
    /// if its version is not newer.
    pub fn mark_drifted(&mut self) {
        self.drifted = true;
    }

    /// Whether a snapshot newer than the operation's base has been applied.
    pub fn is_superseded(&self, op: OperationId) -> bool {
        match self.pending.get(&op) {
            Some(p) => p.base_version != self.snapshot_version,
            None => true,
        }
    }

    // ─── Local mutations ──────────────────────────────────────────────

    /// Append a new shape. Returns `false` if the id is already cached.
    pub fn insert(&mut self, record: ShapeRecord) -> bool {
        if self.contains(&record.id) {
            return false;
        }
        self.shapes.push(record);
        true
    }

    /// Replace a cached shape wholesale. Returns `false` if it is not cached.
    pub fn replace(&mut self, record: ShapeRecord) -> bool {
        match self.shapes.iter_mut().find(|s| s.id == record.id) {
            Some(slot) => {
                *slot = record;
                true
            }
            None => false,
        }
    }

    /// Remove a shape, returning its position and value for a later restore.
    pub fn remove(&mut self, id: &ShapeId) -> Option<(usize, ShapeRecord)> {
        let index = self.shapes.iter().position(|s| &s.id == id)?;
        Some((index, self.shapes.remove(index)))
    }

    // ─── Rollback ─────────────────────────────────────────────────────

    /// Undo optimistic creates of a failed operation.
    pub fn rollback_create(&mut self, op: OperationId, ids: &[ShapeId]) {
        if !self.is_superseded(op) {
            self.shapes.retain(|s| !ids.contains(&s.id));
        }
        self.rolled_back.extend(ids.iter().cloned());
        self.pending.remove(&op);
    }

    /// Undo optimistic removals of a failed operation.
    ///
    /// `removed` must be in removal order; entries are restored in reverse so
    /// original positions are reproduced.
    pub fn rollback_remove(&mut self, op: OperationId, removed: Vec<(usize, ShapeRecord)>) {
        if !self.is_superseded(op) {
            for (index, record) in removed.into_iter().rev() {
                if !self.contains(&record.id) {
                    let index = index.min(self.shapes.len());
                    self.shapes.insert(index, record);
                }
            }
        }
        self.pending.remove(&op);
    }

    // ─── Snapshots ────────────────────────────────────────────────────

    /// Replace the cache wholesale with `doc`.
    ///
    /// Returns `false` (and changes nothing) if `doc` is not newer than the
    /// snapshot already applied. After [`mark_drifted`](Self::mark_drifted) a
    /// snapshot of the same version is accepted once.
    pub fn apply_snapshot(&mut self, doc: &CanvasDocument) -> bool {
        let stale = match self.snapshot_version {
            Some(v) if self.drifted => doc.version < v,
            Some(v) => doc.version <= v,
            None => false,
        };
        if stale {
            return false;
        }
        self.drifted = false;
        self.shapes = doc.shapes.clone();
        self.confirmed = doc.shapes.iter().map(|s| s.id.clone()).collect();
        self.rolled_back.retain(|id| !self.confirmed.contains(id));
        self.snapshot_version = Some(doc.version);
        true
    }
}

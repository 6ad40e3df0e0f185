//! Canvas documents and the atomic write batches applied to them.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::shape::{ShapeId, ShapeLock, ShapeRecord};

/// Canvas identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanvasId(String);

impl CanvasId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CanvasId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CanvasId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for CanvasId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Errors raised while applying a write batch.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DocumentError {
    #[error("Shape {0} already exists on this canvas")]
    DuplicateShape(ShapeId),
    #[error("Shape {0} does not exist on this canvas")]
    MissingShape(ShapeId),
    #[error("Lock on shape {id} changed (now held by {holder:?})")]
    LockChanged { id: ShapeId, holder: Option<String> },
}

/// One record-level mutation inside an atomic batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "shape", rename_all = "camelCase")]
pub enum ShapeWrite {
    /// Insert a new record at the end of the z-order list.
    Append(ShapeRecord),
    /// Replace the record with the same id wholesale.
    Put(ShapeRecord),
    /// Remove a record. Missing ids are ignored.
    Remove(ShapeId),
    /// Fail the batch unless the record's lock is exactly `lock`. Writes nothing.
    ExpectLock { id: ShapeId, lock: Option<ShapeLock> },
}

impl ShapeWrite {
    pub fn shape_id(&self) -> &ShapeId {
        match self {
            ShapeWrite::Append(r) | ShapeWrite::Put(r) => &r.id,
            ShapeWrite::Remove(id) | ShapeWrite::ExpectLock { id, .. } => id,
        }
    }
}

/// The authoritative record for one canvas.
///
/// `version` only ever grows; every committed non-empty batch bumps it by one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanvasDocument {
    pub id: CanvasId,
    pub shapes: Vec<ShapeRecord>,
    /// Milliseconds since the Unix epoch.
    pub last_updated: u64,
    pub version: u64,
}

impl CanvasDocument {
    /// Fresh document with no shapes at version 0.
    pub fn empty(id: CanvasId, now: u64) -> Self {
        Self {
            id,
            shapes: Vec::new(),
            last_updated: now,
            version: 0,
        }
    }

    /// Empty document standing in for one deleted at `retired_version`.
    ///
    /// Starts one above it so versions keep growing across the deletion.
    pub fn recreated(id: CanvasId, retired_version: u64, now: u64) -> Self {
        Self {
            version: retired_version + 1,
            ..Self::empty(id, now)
        }
    }

    pub fn shape(&self, id: &ShapeId) -> Option<&ShapeRecord> {
        self.shapes.iter().find(|s| &s.id == id)
    }

    pub fn contains(&self, id: &ShapeId) -> bool {
        self.shape(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.shapes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }

    /// Apply `writes` in order as one transaction.
    ///
    /// Either every write lands and the version is bumped, or the document
    /// is unchanged and the first offending write is reported. An empty
    /// batch is a no-op.
    pub fn apply_writes(&mut self, writes: &[ShapeWrite], now: u64) -> Result<(), DocumentError> {
        if writes.is_empty() {
            return Ok(());
        }

        let mut shapes = self.shapes.clone();
        for write in writes {
            match write {
                ShapeWrite::Append(record) => {
                    if shapes.iter().any(|s| s.id == record.id) {
                        return Err(DocumentError::DuplicateShape(record.id.clone()));
                    }
                    shapes.push(record.clone());
                }
                ShapeWrite::Put(record) => {
                    let slot = shapes
                        .iter_mut()
                        .find(|s| s.id == record.id)
                        .ok_or_else(|| DocumentError::MissingShape(record.id.clone()))?;
                    *slot = record.clone();
                }
                ShapeWrite::Remove(id) => shapes.retain(|s| &s.id != id),
                ShapeWrite::ExpectLock { id, lock } => {
                    let current = shapes
                        .iter()
                        .find(|s| &s.id == id)
                        .ok_or_else(|| DocumentError::MissingShape(id.clone()))?;
                    if &current.lock != lock {
                        return Err(DocumentError::LockChanged {
                            id: id.clone(),
                            holder: current.locked_by().map(str::to_string),
                        });
                    }
                }
            }
        }

        self.shapes = shapes;
        self.version += 1;
        self.last_updated = now;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::{NewShape, ShapePatch};

    fn record(id: &str) -> ShapeRecord {
        NewShape::rectangle(0.0, 0.0, 10.0, 10.0)
            .with_id(id)
            .into_record("alice", 1)
            .unwrap()
    }

    fn doc() -> CanvasDocument {
        CanvasDocument::empty(CanvasId::from("main"), 0)
    }

    #[test]
    fn test_empty_document() {
        let d = doc();
        assert!(d.is_empty());
        assert_eq!(d.version, 0);
    }

    #[test]
    fn test_append_bumps_version() {
        let mut d = doc();
        d.apply_writes(&[ShapeWrite::Append(record("a"))], 10).unwrap();
        assert_eq!(d.len(), 1);
        assert_eq!(d.version, 1);
        assert_eq!(d.last_updated, 10);
    }

    #[test]
    fn test_batch_is_one_version() {
        let mut d = doc();
        let writes: Vec<_> = ["a", "b", "c"]
            .iter()
            .map(|id| ShapeWrite::Append(record(id)))
            .collect();
        d.apply_writes(&writes, 10).unwrap();
        assert_eq!(d.len(), 3);
        assert_eq!(d.version, 1);
    }

    #[test]
    fn test_duplicate_append_rejects_whole_batch() {
        let mut d = doc();
        d.apply_writes(&[ShapeWrite::Append(record("a"))], 10).unwrap();
        let before = d.clone();

        let err = d
            .apply_writes(
                &[ShapeWrite::Append(record("b")), ShapeWrite::Append(record("a"))],
                20,
            )
            .unwrap_err();
        assert_eq!(err, DocumentError::DuplicateShape(ShapeId::from("a")));
        assert_eq!(d, before);
    }

    #[test]
    fn test_put_missing_rejects() {
        let mut d = doc();
        let err = d.apply_writes(&[ShapeWrite::Put(record("x"))], 10).unwrap_err();
        assert_eq!(err, DocumentError::MissingShape(ShapeId::from("x")));
        assert_eq!(d.version, 0);
    }

    #[test]
    fn test_put_replaces_in_place() {
        let mut d = doc();
        d.apply_writes(
            &[ShapeWrite::Append(record("a")), ShapeWrite::Append(record("b"))],
            10,
        )
        .unwrap();

        let mut moved = record("a");
        moved.apply_patch(&ShapePatch::position(5.0, 5.0), "bob", 11).unwrap();
        d.apply_writes(&[ShapeWrite::Put(moved)], 11).unwrap();

        assert_eq!(d.shapes[0].id, ShapeId::from("a"));
        assert_eq!(d.shapes[0].x, 5.0);
        assert_eq!(d.shapes[0].last_modified_by, "bob");
    }

    #[test]
    fn test_remove_missing_is_ok() {
        let mut d = doc();
        d.apply_writes(&[ShapeWrite::Remove(ShapeId::from("ghost"))], 10).unwrap();
        assert_eq!(d.version, 1);
        assert!(d.is_empty());
    }

    #[test]
    fn test_expect_lock_guards_batch() {
        let mut d = doc();
        let mut locked = record("a");
        locked.lock = Some(ShapeLock::new("alice", 5));
        d.apply_writes(&[ShapeWrite::Append(locked.clone())], 10).unwrap();

        let mut moved = locked.clone();
        moved.x = 9.0;
        let stale = [
            ShapeWrite::ExpectLock { id: ShapeId::from("a"), lock: None },
            ShapeWrite::Put(moved.clone()),
        ];
        let err = d.apply_writes(&stale, 11).unwrap_err();
        assert_eq!(
            err,
            DocumentError::LockChanged {
                id: ShapeId::from("a"),
                holder: Some("alice".to_string()),
            }
        );
        assert_eq!(d.version, 1);
        assert_eq!(d.shapes[0].x, 0.0);

        let current = [
            ShapeWrite::ExpectLock { id: ShapeId::from("a"), lock: locked.lock.clone() },
            ShapeWrite::Put(moved),
        ];
        d.apply_writes(&current, 12).unwrap();
        assert_eq!(d.version, 2);
        assert_eq!(d.shapes[0].x, 9.0);
    }

    #[test]
    fn test_recreated_starts_above_retired() {
        let d = CanvasDocument::recreated(CanvasId::from("main"), 7, 20);
        assert!(d.is_empty());
        assert_eq!(d.version, 8);
        assert_eq!(d.last_updated, 20);
    }

    #[test]
    fn test_empty_batch_keeps_version() {
        let mut d = doc();
        d.apply_writes(&[], 10).unwrap();
        assert_eq!(d.version, 0);
    }

    #[test]
    fn test_document_json_roundtrip() {
        let mut d = doc();
        d.apply_writes(&[ShapeWrite::Append(record("a"))], 10).unwrap();
        let json = serde_json::to_string(&d).unwrap();
        assert!(json.contains("\"lastUpdated\":10"));
        let back: CanvasDocument = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
    }
}

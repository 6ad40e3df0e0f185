//! Shape records — the durable unit stored inside a canvas document.
//!
//! Wire layout (JSON, camelCase):
//! ```text
//! { id, type, x, y, width?, height?, radiusX?, radiusY?, text?, fontSize?,
//!   rotation, fill, stroke?, zIndex,
//!   createdBy, createdAt, lastModifiedBy, lastModifiedAt,
//!   isLocked, lockedBy, lockedAt }
//! ```
//!
//! The `type` tag selects the [`ShapeKind`] payload. Records are validated
//! whenever they are built, patched or deserialized, so a `ShapeRecord` in
//! memory always satisfies its geometry and lock invariants.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Fill used when a caller does not pick one.
pub const DEFAULT_FILL: &str = "#3B82F6";

/// Shape identifier, unique within a canvas.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShapeId(String);

impl ShapeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random id (UUID v4). Collisions across sessions are negligible.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShapeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ShapeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ShapeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Shape validation errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ShapeError {
    #[error("Shape id must not be empty")]
    EmptyId,
    #[error("Field '{field}' must be a finite number, got {value}")]
    NotFinite { field: &'static str, value: f64 },
    #[error("Field '{field}' must not be negative, got {value}")]
    Negative { field: &'static str, value: f64 },
    #[error("Fill color must not be empty")]
    EmptyFill,
    #[error("Field '{field}' does not apply to {kind} shapes")]
    FieldNotApplicable { field: &'static str, kind: &'static str },
    #[error("Lock fields must be all set or all unset")]
    InconsistentLock,
}

fn check_finite(field: &'static str, value: f64) -> Result<(), ShapeError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(ShapeError::NotFinite { field, value })
    }
}

fn check_extent(field: &'static str, value: f64) -> Result<(), ShapeError> {
    check_finite(field, value)?;
    if value < 0.0 {
        return Err(ShapeError::Negative { field, value });
    }
    Ok(())
}

/// Per-type geometry payload, discriminated by the `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ShapeKind {
    #[serde(rename_all = "camelCase")]
    Rectangle { width: f64, height: f64 },
    #[serde(rename_all = "camelCase")]
    Ellipse { radius_x: f64, radius_y: f64 },
    #[serde(rename_all = "camelCase")]
    Text {
        width: f64,
        height: f64,
        text: String,
        font_size: f64,
    },
}

impl ShapeKind {
    /// The wire `type` tag.
    pub fn type_name(&self) -> &'static str {
        match self {
            ShapeKind::Rectangle { .. } => "rectangle",
            ShapeKind::Ellipse { .. } => "ellipse",
            ShapeKind::Text { .. } => "text",
        }
    }

    pub fn validate(&self) -> Result<(), ShapeError> {
        match self {
            ShapeKind::Rectangle { width, height } => {
                check_extent("width", *width)?;
                check_extent("height", *height)
            }
            ShapeKind::Ellipse { radius_x, radius_y } => {
                check_extent("radiusX", *radius_x)?;
                check_extent("radiusY", *radius_y)
            }
            ShapeKind::Text {
                width,
                height,
                font_size,
                ..
            } => {
                check_extent("width", *width)?;
                check_extent("height", *height)?;
                check_extent("fontSize", *font_size)
            }
        }
    }
}

/// Pessimistic edit lock. Holder and timestamp always travel together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShapeLock {
    pub locked_by: String,
    /// Milliseconds since the Unix epoch.
    pub locked_at: u64,
}

impl ShapeLock {
    pub fn new(locked_by: impl Into<String>, locked_at: u64) -> Self {
        Self {
            locked_by: locked_by.into(),
            locked_at,
        }
    }

    /// Whether the lock is older than `ttl` at time `now` (millis).
    pub fn is_expired(&self, now: u64, ttl: Duration) -> bool {
        now.saturating_sub(self.locked_at) > ttl.as_millis() as u64
    }
}

/// A shape as stored in the canvas document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ShapeRecordRepr", into = "ShapeRecordRepr")]
pub struct ShapeRecord {
    pub id: ShapeId,
    pub kind: ShapeKind,
    pub x: f64,
    pub y: f64,
    pub rotation: f64,
    pub fill: String,
    pub stroke: Option<String>,
    pub z_index: i64,
    pub created_by: String,
    pub created_at: u64,
    pub last_modified_by: String,
    pub last_modified_at: u64,
    pub lock: Option<ShapeLock>,
}

impl ShapeRecord {
    /// Check every invariant of the record.
    pub fn validate(&self) -> Result<(), ShapeError> {
        if self.id.as_str().is_empty() {
            return Err(ShapeError::EmptyId);
        }
        check_finite("x", self.x)?;
        check_finite("y", self.y)?;
        check_finite("rotation", self.rotation)?;
        if self.fill.trim().is_empty() {
            return Err(ShapeError::EmptyFill);
        }
        self.kind.validate()
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    pub fn locked_by(&self) -> Option<&str> {
        self.lock.as_ref().map(|l| l.locked_by.as_str())
    }

    /// The lock that stops `user_id` from editing this shape, if any.
    ///
    /// Locks held by `user_id` itself never block, and neither do locks
    /// older than `ttl` when one is given.
    pub fn blocking_lock(&self, user_id: &str, now: u64, ttl: Option<Duration>) -> Option<&ShapeLock> {
        let lock = self.lock.as_ref()?;
        if lock.locked_by == user_id {
            return None;
        }
        match ttl {
            Some(ttl) if lock.is_expired(now, ttl) => None,
            _ => Some(lock),
        }
    }

    /// Merge `patch` into the record and stamp the modification audit fields.
    ///
    /// All-or-nothing: on error the record is left untouched.
    pub fn apply_patch(&mut self, patch: &ShapePatch, author: &str, now: u64) -> Result<(), ShapeError> {
        let mut next = self.clone();
        let kind_name = next.kind.type_name();

        if let Some(x) = patch.x {
            next.x = x;
        }
        if let Some(y) = patch.y {
            next.y = y;
        }
        if let Some(rotation) = patch.rotation {
            next.rotation = rotation;
        }
        if let Some(fill) = &patch.fill {
            next.fill = fill.clone();
        }
        if let Some(stroke) = &patch.stroke {
            next.stroke = stroke.clone();
        }
        if let Some(z) = patch.z_index {
            next.z_index = z;
        }
        if let Some(lock) = &patch.lock {
            next.lock = lock.clone();
        }

        match &mut next.kind {
            ShapeKind::Rectangle { width, height } => {
                reject("radiusX", patch.radius_x.is_some(), kind_name)?;
                reject("radiusY", patch.radius_y.is_some(), kind_name)?;
                reject("text", patch.text.is_some(), kind_name)?;
                reject("fontSize", patch.font_size.is_some(), kind_name)?;
                set(width, patch.width);
                set(height, patch.height);
            }
            ShapeKind::Ellipse { radius_x, radius_y } => {
                reject("width", patch.width.is_some(), kind_name)?;
                reject("height", patch.height.is_some(), kind_name)?;
                reject("text", patch.text.is_some(), kind_name)?;
                reject("fontSize", patch.font_size.is_some(), kind_name)?;
                set(radius_x, patch.radius_x);
                set(radius_y, patch.radius_y);
            }
            ShapeKind::Text {
                width,
                height,
                text,
                font_size,
            } => {
                reject("radiusX", patch.radius_x.is_some(), kind_name)?;
                reject("radiusY", patch.radius_y.is_some(), kind_name)?;
                set(width, patch.width);
                set(height, patch.height);
                set(font_size, patch.font_size);
                if let Some(t) = &patch.text {
                    *text = t.clone();
                }
            }
        }

        next.validate()?;
        next.last_modified_by = author.to_string();
        next.last_modified_at = now;
        *self = next;
        Ok(())
    }
}

fn reject(field: &'static str, present: bool, kind: &'static str) -> Result<(), ShapeError> {
    if present {
        Err(ShapeError::FieldNotApplicable { field, kind })
    } else {
        Ok(())
    }
}

fn set(slot: &mut f64, value: Option<f64>) {
    if let Some(v) = value {
        *slot = v;
    }
}

/// Flat wire form of [`ShapeRecord`] with explicit lock columns.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShapeRecordRepr {
    id: ShapeId,
    #[serde(flatten)]
    kind: ShapeKind,
    x: f64,
    y: f64,
    #[serde(default)]
    rotation: f64,
    fill: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stroke: Option<String>,
    #[serde(default)]
    z_index: i64,
    created_by: String,
    created_at: u64,
    last_modified_by: String,
    last_modified_at: u64,
    #[serde(default)]
    is_locked: bool,
    #[serde(default)]
    locked_by: Option<String>,
    #[serde(default)]
    locked_at: Option<u64>,
}

impl TryFrom<ShapeRecordRepr> for ShapeRecord {
    type Error = ShapeError;

    fn try_from(repr: ShapeRecordRepr) -> Result<Self, Self::Error> {
        let lock = match (repr.is_locked, repr.locked_by, repr.locked_at) {
            (true, Some(locked_by), Some(locked_at)) => Some(ShapeLock { locked_by, locked_at }),
            (false, None, None) => None,
            _ => return Err(ShapeError::InconsistentLock),
        };
        let record = ShapeRecord {
            id: repr.id,
            kind: repr.kind,
            x: repr.x,
            y: repr.y,
            rotation: repr.rotation,
            fill: repr.fill,
            stroke: repr.stroke,
            z_index: repr.z_index,
            created_by: repr.created_by,
            created_at: repr.created_at,
            last_modified_by: repr.last_modified_by,
            last_modified_at: repr.last_modified_at,
            lock,
        };
        record.validate()?;
        Ok(record)
    }
}

impl From<ShapeRecord> for ShapeRecordRepr {
    fn from(record: ShapeRecord) -> Self {
        let (is_locked, locked_by, locked_at) = match record.lock {
            Some(lock) => (true, Some(lock.locked_by), Some(lock.locked_at)),
            None => (false, None, None),
        };
        ShapeRecordRepr {
            id: record.id,
            kind: record.kind,
            x: record.x,
            y: record.y,
            rotation: record.rotation,
            fill: record.fill,
            stroke: record.stroke,
            z_index: record.z_index,
            created_by: record.created_by,
            created_at: record.created_at,
            last_modified_by: record.last_modified_by,
            last_modified_at: record.last_modified_at,
            is_locked,
            locked_by,
            locked_at,
        }
    }
}

/// A shape as requested by a caller, before id assignment and audit stamping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewShape {
    #[serde(default)]
    pub id: Option<ShapeId>,
    #[serde(flatten)]
    pub kind: ShapeKind,
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub rotation: f64,
    pub fill: String,
    #[serde(default)]
    pub stroke: Option<String>,
    #[serde(default)]
    pub z_index: i64,
}

impl NewShape {
    pub fn new(kind: ShapeKind, x: f64, y: f64) -> Self {
        Self {
            id: None,
            kind,
            x,
            y,
            rotation: 0.0,
            fill: DEFAULT_FILL.to_string(),
            stroke: None,
            z_index: 0,
        }
    }

    pub fn rectangle(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self::new(ShapeKind::Rectangle { width, height }, x, y)
    }

    pub fn ellipse(x: f64, y: f64, radius_x: f64, radius_y: f64) -> Self {
        Self::new(ShapeKind::Ellipse { radius_x, radius_y }, x, y)
    }

    pub fn text(x: f64, y: f64, text: impl Into<String>, font_size: f64) -> Self {
        let text = text.into();
        // Rough box until the renderer measures the glyphs.
        let width = text.chars().count() as f64 * font_size * 0.6;
        Self::new(
            ShapeKind::Text {
                width,
                height: font_size * 1.2,
                text,
                font_size,
            },
            x,
            y,
        )
    }

    pub fn with_id(mut self, id: impl Into<ShapeId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_fill(mut self, fill: impl Into<String>) -> Self {
        self.fill = fill.into();
        self
    }

    pub fn with_stroke(mut self, stroke: impl Into<String>) -> Self {
        self.stroke = Some(stroke.into());
        self
    }

    pub fn with_rotation(mut self, rotation: f64) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_z_index(mut self, z_index: i64) -> Self {
        self.z_index = z_index;
        self
    }

    /// Build the stored record: assign an id if absent, stamp audit fields,
    /// validate.
    pub fn into_record(self, author: &str, now: u64) -> Result<ShapeRecord, ShapeError> {
        let record = ShapeRecord {
            id: self.id.unwrap_or_else(ShapeId::generate),
            kind: self.kind,
            x: self.x,
            y: self.y,
            rotation: self.rotation,
            fill: self.fill,
            stroke: self.stroke,
            z_index: self.z_index,
            created_by: author.to_string(),
            created_at: now,
            last_modified_by: author.to_string(),
            last_modified_at: now,
            lock: None,
        };
        record.validate()?;
        Ok(record)
    }
}

/// Partial update of a shape. `None` leaves a field untouched.
///
/// `stroke` and `lock` are doubly optional: `Some(None)` clears the field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShapePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub radius_x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub radius_y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stroke: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z_index: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font_size: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock: Option<Option<ShapeLock>>,
}

impl ShapePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn position(x: f64, y: f64) -> Self {
        Self::default().with_position(x, y)
    }

    pub fn fill(fill: impl Into<String>) -> Self {
        Self::default().with_fill(fill)
    }

    /// Patch that grants `lock`.
    pub fn lock(lock: ShapeLock) -> Self {
        Self {
            lock: Some(Some(lock)),
            ..Self::default()
        }
    }

    /// Patch that clears all lock fields.
    pub fn unlock() -> Self {
        Self {
            lock: Some(None),
            ..Self::default()
        }
    }

    pub fn with_position(mut self, x: f64, y: f64) -> Self {
        self.x = Some(x);
        self.y = Some(y);
        self
    }

    pub fn with_size(mut self, width: f64, height: f64) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    pub fn with_radii(mut self, radius_x: f64, radius_y: f64) -> Self {
        self.radius_x = Some(radius_x);
        self.radius_y = Some(radius_y);
        self
    }

    pub fn with_rotation(mut self, rotation: f64) -> Self {
        self.rotation = Some(rotation);
        self
    }

    pub fn with_fill(mut self, fill: impl Into<String>) -> Self {
        self.fill = Some(fill.into());
        self
    }

    pub fn with_stroke(mut self, stroke: Option<String>) -> Self {
        self.stroke = Some(stroke);
        self
    }

    pub fn with_z_index(mut self, z_index: i64) -> Self {
        self.z_index = Some(z_index);
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Whether the patch touches the lock columns.
    pub fn touches_lock(&self) -> bool {
        self.lock.is_some()
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

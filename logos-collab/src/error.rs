//! Errors surfaced to collaboration callers.

use logos_canvas::{DocumentError, ShapeError, ShapeId};
use thiserror::Error;

use crate::storage::StoreError;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CollabError {
    #[error(transparent)]
    Store(StoreError),
    #[error("Invalid shape: {0}")]
    Shape(#[from] ShapeError),
    /// No signed-in user for an operation that needs one.
    #[error("Sign in required to {0}")]
    Unauthorized(&'static str),
    #[error("Shape {shape_id} is locked by {locked_by}")]
    LockConflict { shape_id: ShapeId, locked_by: String },
    #[error("Shape {0} not found")]
    ShapeNotFound(ShapeId),
    #[error("Shape {0} already exists")]
    DuplicateShape(ShapeId),
    /// Ephemeral entry written by another user.
    #[error("Entry {0} belongs to another user")]
    NotOwner(String),
    #[error("Connection closed")]
    ConnectionClosed,
}

impl CollabError {
    /// Transient failures worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, CollabError::Store(StoreError::Unavailable(_)))
    }
}

impl From<StoreError> for CollabError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Rejected(doc) => doc.into(),
            other => CollabError::Store(other),
        }
    }
}

impl From<DocumentError> for CollabError {
    fn from(e: DocumentError) -> Self {
        match e {
            DocumentError::DuplicateShape(id) => CollabError::DuplicateShape(id),
            DocumentError::MissingShape(id) => CollabError::ShapeNotFound(id),
            DocumentError::LockChanged { id, holder } => CollabError::LockConflict {
                shape_id: id,
                locked_by: holder.unwrap_or_default(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejected_write_maps_to_shape_error() {
        let err: CollabError = StoreError::Rejected(DocumentError::MissingShape(ShapeId::from("s"))).into();
        assert_eq!(err, CollabError::ShapeNotFound(ShapeId::from("s")));
    }

    #[test]
    fn test_moved_lock_maps_to_conflict() {
        let err: CollabError = StoreError::Rejected(DocumentError::LockChanged {
            id: ShapeId::from("s"),
            holder: Some("alice".into()),
        })
        .into();
        assert_eq!(
            err,
            CollabError::LockConflict {
                shape_id: ShapeId::from("s"),
                locked_by: "alice".into(),
            }
        );
    }

    #[test]
    fn test_transient() {
        let err: CollabError = StoreError::Unavailable("down".into()).into();
        assert!(err.is_transient());
        assert!(!CollabError::ConnectionClosed.is_transient());
    }

    #[test]
    fn test_display() {
        let err = CollabError::LockConflict {
            shape_id: ShapeId::from("s1"),
            locked_by: "bob".into(),
        };
        assert_eq!(err.to_string(), "Shape s1 is locked by bob");
        assert_eq!(
            CollabError::Unauthorized("lock shapes").to_string(),
            "Sign in required to lock shapes"
        );
    }
}

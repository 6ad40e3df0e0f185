//! Pessimistic per-shape locks layered on the sync engine.
//!
//! A lock is three fields on the shape record (`isLocked`, `lockedBy`,
//! `lockedAt`) written through the engine's update path, so it travels with
//! the durable snapshot like any other edit.
//!
//! Rules:
//! - `lock` needs a signed-in user; another user's live lock is a conflict,
//!   re-locking one's own lock refreshes `lockedAt`.
//! - `unlock` of an unlocked shape is a no-op; another user's live lock is a
//!   conflict.
//! - A lock older than the configured TTL counts as abandoned and may be
//!   taken over or cleared by anyone.

use std::sync::Arc;

use log::{debug, info};
use logos_canvas::{now_millis, ShapeId, ShapeLock, ShapePatch, ShapeRecord};

use crate::engine::ShapeSyncEngine;
use crate::error::CollabError;
use crate::identity::IdentityProvider;

pub struct ShapeLockManager {
    engine: Arc<ShapeSyncEngine>,
    identity: Arc<dyn IdentityProvider>,
}

impl ShapeLockManager {
    pub fn new(engine: Arc<ShapeSyncEngine>, identity: Arc<dyn IdentityProvider>) -> Self {
        Self { engine, identity }
    }

    fn conflict_check(
        &self,
        record: &ShapeRecord,
        user_id: &str,
        now: u64,
    ) -> Result<(), CollabError> {
        match record.blocking_lock(user_id, now, self.engine.config().lock_ttl()) {
            Some(lock) => Err(CollabError::LockConflict {
                shape_id: record.id.clone(),
                locked_by: lock.locked_by.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Take the edit lock on `shape_id` for the current user.
    pub async fn lock(&self, shape_id: &ShapeId) -> Result<ShapeRecord, CollabError> {
        let user = self
            .identity
            .current_user()
            .ok_or(CollabError::Unauthorized("lock shapes"))?;
        let now = now_millis();
        let guard = |record: &ShapeRecord| self.conflict_check(record, &user.id, now);
        let patch = ShapePatch::lock(ShapeLock::new(user.id.clone(), now));

        let mut records = self
            .engine
            .update_guarded(vec![(shape_id.clone(), patch)], &user.id, &guard)
            .await?;
        info!("{} locked {} on {}", user.id, shape_id, self.engine.canvas_id());
        records
            .pop()
            .ok_or_else(|| CollabError::ShapeNotFound(shape_id.clone()))
    }

    /// Release the lock on `shape_id`.
    pub async fn unlock(&self, shape_id: &ShapeId) -> Result<ShapeRecord, CollabError> {
        let user = self
            .identity
            .current_user()
            .ok_or(CollabError::Unauthorized("unlock shapes"))?;
        let cached = self
            .engine
            .shape(shape_id)
            .await
            .ok_or_else(|| CollabError::ShapeNotFound(shape_id.clone()))?;
        if !cached.is_locked() {
            debug!("{} already unlocked", shape_id);
            return Ok(cached);
        }

        let now = now_millis();
        let guard = |record: &ShapeRecord| self.conflict_check(record, &user.id, now);
        let mut records = self
            .engine
            .update_guarded(vec![(shape_id.clone(), ShapePatch::unlock())], &user.id, &guard)
            .await?;
        info!("{} unlocked {} on {}", user.id, shape_id, self.engine.canvas_id());
        records
            .pop()
            .ok_or_else(|| CollabError::ShapeNotFound(shape_id.clone()))
    }

    /// Current holder of a live lock, from the local cache.
    pub async fn holder(&self, shape_id: &ShapeId) -> Option<String> {
        let record = self.engine.shape(shape_id).await?;
        let ttl = self.engine.config().lock_ttl();
        let lock = record.lock?;
        match ttl {
            Some(ttl) if lock.is_expired(now_millis(), ttl) => None,
            _ => Some(lock.locked_by),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LockPolicy, SyncConfig};
    use crate::identity::{StaticIdentity, UserIdentity};
    use crate::storage::{DurableShapeStore, MemoryShapeStore};
    use logos_canvas::{CanvasId, NewShape};
    use std::time::Duration;

    struct Peer {
        identity: Arc<StaticIdentity>,
        engine: Arc<ShapeSyncEngine>,
        locks: ShapeLockManager,
    }

    fn peer(store: &Arc<MemoryShapeStore>, user: &str, config: SyncConfig) -> Peer {
        let identity = Arc::new(StaticIdentity::signed_in(UserIdentity::new(user, user)));
        let engine = Arc::new(ShapeSyncEngine::new(
            CanvasId::from("main"),
            store.clone(),
            identity.clone(),
            config,
        ));
        let locks = ShapeLockManager::new(engine.clone(), identity.clone());
        Peer { identity, engine, locks }
    }

    async fn seed(p: &Peer) -> ShapeId {
        p.engine
            .create(NewShape::rectangle(0.0, 0.0, 10.0, 10.0))
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_lock_sets_all_fields() {
        let store = Arc::new(MemoryShapeStore::new());
        let alice = peer(&store, "alice", SyncConfig::for_testing());
        let id = seed(&alice).await;

        let record = alice.locks.lock(&id).await.unwrap();
        let lock = record.lock.unwrap();
        assert_eq!(lock.locked_by, "alice");
        assert!(lock.locked_at > 0);
        assert_eq!(alice.locks.holder(&id).await.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_lock_requires_identity() {
        let store = Arc::new(MemoryShapeStore::new());
        let alice = peer(&store, "alice", SyncConfig::for_testing());
        let id = seed(&alice).await;
        let commits = store.commit_count();

        alice.identity.sign_out();
        assert_eq!(
            alice.locks.lock(&id).await.unwrap_err(),
            CollabError::Unauthorized("lock shapes")
        );
        assert_eq!(store.commit_count(), commits);
    }

    #[tokio::test]
    async fn test_lock_conflict_and_relock() {
        let store = Arc::new(MemoryShapeStore::new());
        let alice = peer(&store, "alice", SyncConfig::for_testing());
        let bob = peer(&store, "bob", SyncConfig::for_testing());
        let id = seed(&alice).await;

        let first = alice.locks.lock(&id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let again = alice.locks.lock(&id).await.unwrap();
        assert!(again.lock.unwrap().locked_at >= first.lock.unwrap().locked_at);

        bob.engine.get_canvas_state().await.unwrap();
        let err = bob.locks.lock(&id).await.unwrap_err();
        assert_eq!(
            err,
            CollabError::LockConflict { shape_id: id.clone(), locked_by: "alice".into() }
        );
        assert!(matches!(bob.locks.unlock(&id).await, Err(CollabError::LockConflict { .. })));
    }

    #[tokio::test]
    async fn test_concurrent_locks_admit_one_holder() {
        let store = Arc::new(MemoryShapeStore::new());
        let alice = peer(&store, "alice", SyncConfig::for_testing());
        let bob = peer(&store, "bob", SyncConfig::for_testing());
        let id = seed(&alice).await;
        bob.engine.get_canvas_state().await.unwrap();
        store.set_latency(Duration::from_millis(5));

        let (a, b) = tokio::join!(alice.locks.lock(&id), bob.locks.lock(&id));
        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1, "alice: {a:?}, bob: {b:?}");

        let (winner, loser, err) = match (a, b) {
            (Ok(_), Err(e)) => ("alice", &bob, e),
            (Err(e), Ok(_)) => ("bob", &alice, e),
            _ => unreachable!(),
        };
        assert_eq!(
            err,
            CollabError::LockConflict { shape_id: id.clone(), locked_by: winner.into() }
        );
        let durable = store.load(&CanvasId::from("main")).await.unwrap();
        assert_eq!(durable.shape(&id).unwrap().locked_by(), Some(winner));

        loser.engine.get_canvas_state().await.unwrap();
        assert_eq!(loser.locks.holder(&id).await.as_deref(), Some(winner));
    }

    #[tokio::test]
    async fn test_update_racing_a_lock_does_not_clear_it() {
        let store = Arc::new(MemoryShapeStore::new());
        let alice = peer(&store, "alice", SyncConfig::for_testing());
        let bob = peer(&store, "bob", SyncConfig::for_testing());
        let id = seed(&alice).await;
        bob.engine.get_canvas_state().await.unwrap();
        store.set_latency(Duration::from_millis(5));

        // Bob reads the unlocked shape while Alice's lock is still in flight.
        let (locked, moved) = tokio::join!(alice.locks.lock(&id), async {
            tokio::time::sleep(Duration::from_millis(1)).await;
            bob.engine.update(&id, ShapePatch::position(4.0, 4.0)).await
        });
        locked.unwrap();
        assert_eq!(
            moved.unwrap_err(),
            CollabError::LockConflict { shape_id: id.clone(), locked_by: "alice".into() }
        );

        let durable = store.load(&CanvasId::from("main")).await.unwrap();
        let record = durable.shape(&id).unwrap();
        assert_eq!(record.locked_by(), Some("alice"));
        assert_eq!(record.x, 0.0);
    }

    #[tokio::test]
    async fn test_unlock_idempotent() {
        let store = Arc::new(MemoryShapeStore::new());
        let alice = peer(&store, "alice", SyncConfig::for_testing());
        let id = seed(&alice).await;
        alice.locks.lock(&id).await.unwrap();

        let once = alice.locks.unlock(&id).await.unwrap();
        let commits = store.commit_count();
        let twice = alice.locks.unlock(&id).await.unwrap();
        assert!(!once.is_locked());
        assert_eq!(once, twice);
        assert_eq!(store.commit_count(), commits);
    }

    #[tokio::test]
    async fn test_expired_lock_taken_over() {
        let store = Arc::new(MemoryShapeStore::new());
        let config = SyncConfig {
            lock_ttl_ms: Some(10),
            ..SyncConfig::for_testing()
        };
        let alice = peer(&store, "alice", config.clone());
        let bob = peer(&store, "bob", config);
        let id = seed(&alice).await;
        alice.locks.lock(&id).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        bob.engine.get_canvas_state().await.unwrap();
        assert_eq!(bob.locks.holder(&id).await, None);
        let record = bob.locks.lock(&id).await.unwrap();
        assert_eq!(record.locked_by(), Some("bob"));
    }

    #[tokio::test]
    async fn test_advisory_policy_lets_edits_through() {
        let store = Arc::new(MemoryShapeStore::new());
        let config = SyncConfig {
            lock_policy: LockPolicy::Advisory,
            ..SyncConfig::for_testing()
        };
        let alice = peer(&store, "alice", config.clone());
        let bob = peer(&store, "bob", config);
        let id = seed(&alice).await;
        alice.locks.lock(&id).await.unwrap();

        bob.engine.get_canvas_state().await.unwrap();
        let moved = bob.engine.update(&id, ShapePatch::position(4.0, 4.0)).await.unwrap();
        assert_eq!(moved.x, 4.0);
        assert_eq!(moved.locked_by(), Some("alice"));
        assert!(bob.locks.lock(&id).await.is_err());
    }
}

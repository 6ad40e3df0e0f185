//! Drag state channel.
//!
//! ```text
//! drag start ──► put drag/<session>/<shapeId>   (always sent, hook registered)
//! drag move  ──► put ...                        (throttled, 16ms ≈ 60Hz)
//! drag end   ──► remove ...                     (never throttled, hook cancelled)
//! ```
//!
//! An entry exists only while its drag is in progress. Only the user that
//! started a drag may move or end it.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use log::{debug, trace};
use logos_canvas::{now_millis, ShapeId};
use serde::{Deserialize, Serialize};

use crate::config::SyncConfig;
use crate::ephemeral::{ClientConnection, EphemeralKey, EphemeralSpace, EphemeralStore, EphemeralValue};
use crate::identity::IdentityProvider;
use crate::subscription::Subscription;
use crate::throttle::Throttle;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DragState {
    pub shape_id: ShapeId,
    pub is_dragging: bool,
    pub dragged_by: String,
    pub cursor_x: f64,
    pub cursor_y: f64,
    pub timestamp: u64,
}

pub struct DragChannel {
    store: Arc<EphemeralStore>,
    connection: ClientConnection,
    identity: Arc<dyn IdentityProvider>,
    throttle: Mutex<Throttle>,
    active: Mutex<HashSet<EphemeralKey>>,
}

impl DragChannel {
    pub fn new(
        store: Arc<EphemeralStore>,
        connection: ClientConnection,
        identity: Arc<dyn IdentityProvider>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            store,
            connection,
            identity,
            throttle: Mutex::new(Throttle::new(config.drag_throttle())),
            active: Mutex::new(HashSet::new()),
        }
    }

    /// Start, move or end a drag of `shape_id`. Returns whether a write went
    /// out.
    ///
    /// Without a cursor position a move keeps the last published one.
    pub fn set_drag_state(
        &self,
        session: &str,
        shape_id: &ShapeId,
        is_dragging: bool,
        cursor: Option<(f64, f64)>,
    ) -> bool {
        self.set_drag_state_at(session, shape_id, is_dragging, cursor, Instant::now())
    }

    pub(crate) fn set_drag_state_at(
        &self,
        session: &str,
        shape_id: &ShapeId,
        is_dragging: bool,
        cursor: Option<(f64, f64)>,
        now: Instant,
    ) -> bool {
        let Some(user) = self.identity.current_user() else {
            trace!("Drag update without a user ignored");
            return false;
        };
        let key = EphemeralKey::drag(session, shape_id.as_str());

        if !is_dragging {
            return self.end(&user.id, &key);
        }

        // Hooks of another connection may have removed the entry underneath us.
        let started = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&key)
            && self.store.get(&key).is_some();
        let mut throttle = self.throttle.lock().unwrap_or_else(PoisonError::into_inner);
        let open = throttle.try_acquire_at(now);
        drop(throttle);
        // Starts always go out; they only claim the move window when it is free.
        if started && !open {
            return false;
        }

        let (cursor_x, cursor_y) = cursor.unwrap_or_else(|| match self.store.get(&key) {
            Some(EphemeralValue::Drag(prev)) => (prev.cursor_x, prev.cursor_y),
            _ => (0.0, 0.0),
        });
        let state = DragState {
            shape_id: shape_id.clone(),
            is_dragging: true,
            dragged_by: user.id.clone(),
            cursor_x,
            cursor_y,
            timestamp: now_millis(),
        };

        let written = self
            .store
            .put(&self.connection, &user.id, key.clone(), EphemeralValue::Drag(state))
            .and_then(|_| self.store.on_disconnect_remove(&self.connection, key.clone()));
        if let Err(e) = written {
            debug!("Drag write for {} by {} dropped: {}", shape_id, user.id, e);
            return false;
        }
        if !started {
            debug!("{} started dragging {}", user.id, shape_id);
            self.active
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(key);
        }
        true
    }

    fn end(&self, user_id: &str, key: &EphemeralKey) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        self.store.cancel_on_disconnect(&self.connection, key);
        match self.store.remove(user_id, key) {
            Ok(removed) => {
                if removed {
                    debug!("{} stopped dragging {}", user_id, key.id);
                }
                removed
            }
            Err(e) => {
                debug!("Drag end for {} dropped: {}", key, e);
                false
            }
        }
    }

    /// End every drag this channel has open in `session`.
    pub fn end_all(&self, session: &str) -> usize {
        let Some(user) = self.identity.current_user() else {
            return 0;
        };
        let keys: Vec<EphemeralKey> = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|k| k.in_scope(EphemeralSpace::Drag, session))
            .cloned()
            .collect();
        keys.iter().filter(|key| self.end(&user.id, key)).count()
    }

    /// Push drags in `session` started by other users on every change.
    pub fn subscribe_drag_states<F>(&self, session: &str, callback: F) -> Subscription
    where
        F: FnMut(&[DragState]) + Send + 'static,
    {
        let me = self.identity.current_user().map(|u| u.id);
        let scope = session.to_string();
        let project_scope = scope.clone();

        self.store.watch_scope(
            EphemeralSpace::Drag,
            scope,
            None,
            "drag states",
            move |store: &EphemeralStore| {
                store
                    .scan(EphemeralSpace::Drag, &project_scope)
                    .into_iter()
                    .filter_map(|(_, value)| match value {
                        EphemeralValue::Drag(state) => Some(state),
                        _ => None,
                    })
                    .filter(|s| s.is_dragging && me.as_deref() != Some(s.dragged_by.as_str()))
                    .collect()
            },
            callback,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{StaticIdentity, UserIdentity};
    use std::time::Duration;

    fn channel(store: &Arc<EphemeralStore>, user: &str) -> DragChannel {
        let identity = Arc::new(StaticIdentity::signed_in(UserIdentity::new(user, user)));
        DragChannel::new(store.clone(), store.connect(), identity, &SyncConfig::for_testing())
    }

    fn drag_entry(store: &EphemeralStore, shape: &str) -> Option<DragState> {
        match store.get(&EphemeralKey::drag("s", shape)) {
            Some(EphemeralValue::Drag(state)) => Some(state),
            _ => None,
        }
    }

    #[test]
    fn test_start_move_end() {
        let store = EphemeralStore::new(16);
        let alice = channel(&store, "alice");
        let shape = ShapeId::from("r1");

        assert!(alice.set_drag_state("s", &shape, true, Some((1.0, 2.0))));
        let state = drag_entry(&store, "r1").unwrap();
        assert_eq!(state.dragged_by, "alice");
        assert_eq!((state.cursor_x, state.cursor_y), (1.0, 2.0));

        std::thread::sleep(Duration::from_millis(20));
        assert!(alice.set_drag_state("s", &shape, true, None));
        assert_eq!(drag_entry(&store, "r1").unwrap().cursor_x, 1.0);

        assert!(alice.set_drag_state("s", &shape, false, None));
        assert!(drag_entry(&store, "r1").is_none());
    }

    #[test]
    fn test_moves_throttled_but_end_is_not() {
        let store = EphemeralStore::new(16);
        let alice = channel(&store, "alice");
        let shape = ShapeId::from("r1");

        assert!(alice.set_drag_state("s", &shape, true, Some((0.0, 0.0))));
        let moved = (1..10)
            .filter(|i| alice.set_drag_state("s", &shape, true, Some((*i as f64, 0.0))))
            .count();
        assert_eq!(moved, 0);
        assert!(alice.set_drag_state("s", &shape, false, None));
        assert!(store.is_empty());
    }

    #[test]
    fn test_second_shape_start_not_throttled() {
        let store = EphemeralStore::new(16);
        let alice = channel(&store, "alice");
        assert!(alice.set_drag_state("s", &ShapeId::from("a"), true, None));
        assert!(alice.set_drag_state("s", &ShapeId::from("b"), true, None));
        assert_eq!(alice.end_all("s"), 2);
        assert!(store.is_empty());
    }

    #[test]
    fn test_start_does_not_restart_move_window() {
        let store = EphemeralStore::new(16);
        let alice = channel(&store, "alice");
        let (a, b) = (ShapeId::from("a"), ShapeId::from("b"));
        let t0 = Instant::now();
        let ms = Duration::from_millis;

        assert!(alice.set_drag_state_at("s", &a, true, Some((0.0, 0.0)), t0));
        assert!(alice.set_drag_state_at("s", &b, true, Some((0.0, 0.0)), t0 + ms(10)));
        // The window opened at t0 has passed even though b started at t0+10.
        assert!(alice.set_drag_state_at("s", &a, true, Some((1.0, 1.0)), t0 + ms(17)));
        assert!(!alice.set_drag_state_at("s", &b, true, Some((1.0, 1.0)), t0 + ms(20)));
    }

    #[test]
    fn test_rapid_restarts_do_not_free_moves() {
        let store = EphemeralStore::new(16);
        let alice = channel(&store, "alice");
        let shape = ShapeId::from("r1");
        let t0 = Instant::now();
        let ms = Duration::from_millis;

        assert!(alice.set_drag_state_at("s", &shape, true, None, t0));
        for i in 1..5 {
            assert!(alice.set_drag_state_at("s", &shape, false, None, t0 + ms(i)));
            assert!(alice.set_drag_state_at("s", &shape, true, None, t0 + ms(i)));
            assert!(!alice.set_drag_state_at("s", &shape, true, None, t0 + ms(i)));
        }
    }

    #[test]
    fn test_entry_removed_by_other_connection_restarts_drag() {
        let store = EphemeralStore::new(16);
        let identity = Arc::new(StaticIdentity::signed_in(UserIdentity::new("alice", "Alice")));
        let config = SyncConfig::for_testing();
        let first = DragChannel::new(store.clone(), store.connect(), identity.clone(), &config);
        let second_conn = store.connect();
        let second = DragChannel::new(store.clone(), second_conn.clone(), identity, &config);
        let shape = ShapeId::from("r1");
        let t0 = Instant::now();
        let ms = Duration::from_millis;

        assert!(first.set_drag_state_at("s", &shape, true, Some((1.0, 1.0)), t0));
        assert!(second.set_drag_state_at("s", &shape, true, Some((2.0, 2.0)), t0));
        drop(second);
        second_conn.close();
        assert!(drag_entry(&store, "r1").is_none());

        // Inside the move window, but the entry is gone: this is a new start.
        assert!(first.set_drag_state_at("s", &shape, true, Some((3.0, 3.0)), t0 + ms(1)));
        assert_eq!(drag_entry(&store, "r1").unwrap().cursor_x, 3.0);
    }

    #[test]
    fn test_other_user_cannot_hijack_drag() {
        let store = EphemeralStore::new(16);
        let alice = channel(&store, "alice");
        let bob = channel(&store, "bob");
        let shape = ShapeId::from("r1");

        alice.set_drag_state("s", &shape, true, Some((1.0, 1.0)));
        assert!(!bob.set_drag_state("s", &shape, true, Some((9.0, 9.0))));
        assert!(!bob.set_drag_state("s", &shape, false, None));
        assert_eq!(drag_entry(&store, "r1").unwrap().dragged_by, "alice");
    }

    #[test]
    fn test_drag_removed_on_disconnect() {
        let store = EphemeralStore::new(16);
        let conn = store.connect();
        let identity = Arc::new(StaticIdentity::signed_in(UserIdentity::new("alice", "Alice")));
        let alice = DragChannel::new(store.clone(), conn.clone(), identity, &SyncConfig::for_testing());

        alice.set_drag_state("s", &ShapeId::from("r1"), true, None);
        conn.close();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_excludes_own_drags() {
        let store = EphemeralStore::new(16);
        let alice = channel(&store, "alice");
        let bob = channel(&store, "bob");

        let seen = Arc::new(Mutex::new(Vec::<Vec<DragState>>::new()));
        let sink = seen.clone();
        let _sub = alice.subscribe_drag_states("s", move |states| {
            sink.lock().unwrap().push(states.to_vec());
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        alice.set_drag_state("s", &ShapeId::from("mine"), true, None);
        bob.set_drag_state("s", &ShapeId::from("theirs"), true, Some((5.0, 5.0)));
        tokio::time::sleep(Duration::from_millis(20)).await;
        {
            let seen = seen.lock().unwrap();
            let last = seen.last().unwrap();
            assert_eq!(last.len(), 1);
            assert_eq!(last[0].shape_id, ShapeId::from("theirs"));
        }

        bob.set_drag_state("s", &ShapeId::from("theirs"), false, None);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(seen.lock().unwrap().last().unwrap().is_empty());
    }
}

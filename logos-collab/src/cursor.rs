//! Cursor broadcast channel.
//!
//! Each user owns one sample per session, overwritten in place and never
//! historized. Writes are fire-and-forget: failures are logged and reported
//! as `false`, never surfaced as errors. The throttled variant drops calls
//! that arrive inside the cursor window (50ms by default).

use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, trace};
use logos_canvas::now_millis;
use serde::{Deserialize, Serialize};

use crate::config::SyncConfig;
use crate::ephemeral::{ClientConnection, EphemeralKey, EphemeralSpace, EphemeralStore, EphemeralValue};
use crate::identity::IdentityProvider;
use crate::presence::user_color;
use crate::subscription::Subscription;
use crate::throttle::Throttle;

/// Pointer position in screen and canvas coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorPosition {
    pub x: f64,
    pub y: f64,
    pub canvas_x: f64,
    pub canvas_y: f64,
}

impl CursorPosition {
    pub fn new(x: f64, y: f64, canvas_x: f64, canvas_y: f64) -> Self {
        Self { x, y, canvas_x, canvas_y }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorSample {
    pub x: f64,
    pub y: f64,
    pub canvas_x: f64,
    pub canvas_y: f64,
    pub timestamp: u64,
}

impl CursorSample {
    pub fn at(pos: CursorPosition, timestamp: u64) -> Self {
        Self {
            x: pos.x,
            y: pos.y,
            canvas_x: pos.canvas_x,
            canvas_y: pos.canvas_y,
            timestamp,
        }
    }
}

/// Another user's cursor as seen by a subscriber.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCursor {
    pub user_id: String,
    pub color: String,
    pub cursor: CursorSample,
}

pub struct CursorChannel {
    store: Arc<EphemeralStore>,
    connection: ClientConnection,
    identity: Arc<dyn IdentityProvider>,
    throttle: Mutex<Throttle>,
}

impl CursorChannel {
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
            throttle: Mutex::new(Throttle::new(config.cursor_throttle())),
        }
    }

    /// Publish the current user's pointer. Returns whether the write went out.
    pub fn update_cursor(&self, session: &str, pos: CursorPosition) -> bool {
        let Some(user) = self.identity.current_user() else {
            trace!("Cursor update without a user ignored");
            return false;
        };
        let sample = CursorSample::at(pos, now_millis());
        let key = EphemeralKey::cursor(session, &user.id);

        let written = self
            .store
            .put(&self.connection, &user.id, key.clone(), EphemeralValue::Cursor(sample))
            .and_then(|_| self.store.on_disconnect_remove(&self.connection, key));
        if let Err(e) = written {
            debug!("Cursor write for {} dropped: {}", user.id, e);
            return false;
        }

        // Mirror into the presence entry, if the user has joined.
        let presence_key = EphemeralKey::presence(session, &user.id);
        if let Some(EphemeralValue::Presence(mut entry)) = self.store.get(&presence_key) {
            entry.cursor = Some(sample);
            entry.last_seen = sample.timestamp;
            if let Err(e) = self.store.put(
                &self.connection,
                &user.id,
                presence_key,
                EphemeralValue::Presence(entry),
            ) {
                debug!("Presence cursor mirror for {} dropped: {}", user.id, e);
            }
        }
        trace!("Cursor {} -> ({:.1}, {:.1})", user.id, pos.canvas_x, pos.canvas_y);
        true
    }

    /// Like [`update_cursor`](Self::update_cursor) but drops calls inside
    /// the throttle window.
    pub fn throttled_update_cursor(&self, session: &str, pos: CursorPosition) -> bool {
        let allowed = self
            .throttle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .try_acquire();
        allowed && self.update_cursor(session, pos)
    }

    /// Remove the current user's cursor from `session`.
    pub fn clear_cursor(&self, session: &str) -> bool {
        let Some(user) = self.identity.current_user() else {
            return false;
        };
        let key = EphemeralKey::cursor(session, &user.id);
        self.store.cancel_on_disconnect(&self.connection, &key);
        match self.store.remove(&user.id, &key) {
            Ok(removed) => removed,
            Err(e) => {
                debug!("Cursor clear for {} failed: {}", user.id, e);
                false
            }
        }
    }

    /// Push every other user's cursor in `session` on each change.
    pub fn subscribe_cursors<F>(&self, session: &str, callback: F) -> Subscription
    where
        F: FnMut(&[RemoteCursor]) + Send + 'static,
    {
        let me = self.identity.current_user().map(|u| u.id);
        let scope = session.to_string();
        let project_scope = scope.clone();

        self.store.watch_scope(
            EphemeralSpace::Cursor,
            scope,
            None,
            "cursors",
            move |store: &EphemeralStore| {
                store
                    .scan(EphemeralSpace::Cursor, &project_scope)
                    .into_iter()
                    .filter(|(key, _)| me.as_deref() != Some(key.id.as_str()))
                    .filter_map(|(key, value)| match value {
                        EphemeralValue::Cursor(cursor) => Some(RemoteCursor {
                            color: user_color(&key.id).to_string(),
                            user_id: key.id,
                            cursor,
                        }),
                        _ => None,
                    })
                    .collect()
            },
            callback,
        )
    }
}

//! Presence registry — who is on a canvas session right now.
//!
//! ## Architecture
//!
//! ```text
//! join(session) ──► EphemeralStore  presence/<session>/<userId>
//!                        │           (+ remove-on-disconnect hook)
//!                        ▼
//!                 EphemeralChange ──► subscribe_online(session)
//!                                        │ filter: active, complete, fresh
//!                                        ▼
//!                                     [OnlineUser { entry, isCurrentUser }]
//! ```
//!
//! One entry per (session, user). Entries disappear on `leave`, on graceful
//! connection close, and when the connection is dropped or reaped.
//!
//! Reference: Kleppmann, Chapter 8 — Broadcast Protocols

use std::sync::Arc;

use log::{debug, info};
use logos_canvas::now_millis;
use serde::{Deserialize, Serialize};

use crate::config::SyncConfig;
use crate::cursor::CursorSample;
use crate::ephemeral::{ClientConnection, EphemeralKey, EphemeralSpace, EphemeralStore, EphemeralValue};
use crate::error::CollabError;
use crate::identity::{IdentityProvider, UserIdentity};
use crate::subscription::Subscription;

// ───────────────────────────────────────────────────────────────────
// Colors
// ───────────────────────────────────────────────────────────────────

/// Fixed palette users are mapped onto.
pub const USER_COLORS: [&str; 10] = [
    "#EF4444", "#F97316", "#F59E0B", "#10B981", "#14B8A6",
    "#3B82F6", "#6366F1", "#8B5CF6", "#EC4899", "#84CC16",
];

/// Stable color for a user: `hash * 31 + c` string hash into [`USER_COLORS`].
pub fn user_color(user_id: &str) -> &'static str {
    let hash = user_id.chars().fold(0i32, |h, c| {
        (c as i32).wrapping_add(h.wrapping_shl(5).wrapping_sub(h))
    });
    USER_COLORS[hash.unsigned_abs() as usize % USER_COLORS.len()]
}

// ───────────────────────────────────────────────────────────────────
// Entries
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub session_id: String,
    pub user_id: String,
    pub display_name: String,
    pub color: String,
    /// Milliseconds since the Unix epoch.
    pub joined_at: u64,
    pub last_seen: u64,
    pub is_active: bool,
    #[serde(default)]
    pub cursor: Option<CursorSample>,
}

impl PresenceEntry {
    fn new(session_id: &str, user: &UserIdentity, now: u64) -> Self {
        Self {
            session_id: session_id.to_string(),
            user_id: user.id.clone(),
            display_name: user.display_name.clone(),
            color: user_color(&user.id).to_string(),
            joined_at: now,
            last_seen: now,
            is_active: true,
            cursor: None,
        }
    }

    fn is_complete(&self) -> bool {
        !self.user_id.is_empty() && !self.display_name.is_empty()
    }
}

/// A presence entry as shown to one particular reader.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineUser {
    #[serde(flatten)]
    pub entry: PresenceEntry,
    pub is_current_user: bool,
}

/// Active, complete, recently seen entries of `session`, oldest join first.
fn online_users(
    store: &EphemeralStore,
    session: &str,
    current_user: Option<&str>,
    stale_after_ms: u64,
    now: u64,
) -> Vec<OnlineUser> {
    let mut users: Vec<OnlineUser> = store
        .scan(EphemeralSpace::Presence, session)
        .into_iter()
        .filter_map(|(_, value)| match value {
            EphemeralValue::Presence(entry) => Some(entry),
            _ => None,
        })
        .filter(|e| e.is_active && e.is_complete())
        .filter(|e| now.saturating_sub(e.last_seen) <= stale_after_ms)
        .map(|entry| OnlineUser {
            is_current_user: current_user == Some(entry.user_id.as_str()),
            entry,
        })
        .collect();
    users.sort_by(|a, b| {
        a.entry
            .joined_at
            .cmp(&b.entry.joined_at)
            .then_with(|| a.entry.user_id.cmp(&b.entry.user_id))
    });
    users
}

// ───────────────────────────────────────────────────────────────────
// Registry
// ───────────────────────────────────────────────────────────────────

pub struct PresenceRegistry {
    store: Arc<EphemeralStore>,
    connection: ClientConnection,
    identity: Arc<dyn IdentityProvider>,
    config: SyncConfig,
}

impl PresenceRegistry {
    pub fn new(
        store: Arc<EphemeralStore>,
        connection: ClientConnection,
        identity: Arc<dyn IdentityProvider>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            connection,
            identity,
            config,
        }
    }

    fn require_user(&self, action: &'static str) -> Result<UserIdentity, CollabError> {
        self.identity
            .current_user()
            .ok_or(CollabError::Unauthorized(action))
    }

    /// Announce the current user on `session`.
    ///
    /// Re-joining keeps the original `joinedAt` and refreshes everything else.
    pub fn join(&self, session: &str) -> Result<PresenceEntry, CollabError> {
        let user = self.require_user("join a session")?;
        let now = now_millis();
        let key = EphemeralKey::presence(session, &user.id);

        let mut entry = PresenceEntry::new(session, &user, now);
        if let Some(EphemeralValue::Presence(previous)) = self.store.get(&key) {
            entry.joined_at = previous.joined_at;
            entry.cursor = previous.cursor;
        }
        self.store
            .put(&self.connection, &user.id, key.clone(), EphemeralValue::Presence(entry.clone()))?;
        self.store.on_disconnect_remove(&self.connection, key)?;
        info!("{} joined session {}", user.id, session);
        Ok(entry)
    }

    /// Remove the current user's entry and cancel its disconnect hook.
    pub fn leave(&self, session: &str) -> Result<(), CollabError> {
        let user = self.require_user("leave a session")?;
        let key = EphemeralKey::presence(session, &user.id);
        self.store.remove(&user.id, &key)?;
        self.store.cancel_on_disconnect(&self.connection, &key);
        info!("{} left session {}", user.id, session);
        Ok(())
    }

    /// Mark the current user active or idle without leaving.
    ///
    /// Becoming active without an entry joins; going idle without one is a
    /// no-op.
    pub fn set_presence(&self, session: &str, active: bool) -> Result<Option<PresenceEntry>, CollabError> {
        let user = self.require_user("set presence")?;
        let key = EphemeralKey::presence(session, &user.id);
        match self.store.get(&key) {
            Some(EphemeralValue::Presence(mut entry)) => {
                entry.is_active = active;
                entry.last_seen = now_millis();
                self.store
                    .put(&self.connection, &user.id, key, EphemeralValue::Presence(entry.clone()))?;
                debug!("{} is now {} on {}", user.id, if active { "active" } else { "idle" }, session);
                Ok(Some(entry))
            }
            _ if active => self.join(session).map(Some),
            _ => Ok(None),
        }
    }

    /// Refresh connection liveness and the entry's `lastSeen`.
    pub fn heartbeat(&self, session: &str) -> Result<(), CollabError> {
        self.connection.heartbeat()?;
        let Some(user) = self.identity.current_user() else {
            return Ok(());
        };
        let key = EphemeralKey::presence(session, &user.id);
        if let Some(EphemeralValue::Presence(mut entry)) = self.store.get(&key) {
            entry.last_seen = now_millis();
            self.store
                .put(&self.connection, &user.id, key, EphemeralValue::Presence(entry))?;
        }
        Ok(())
    }

    /// Current user's entry on `session`.
    pub fn own_entry(&self, session: &str) -> Option<PresenceEntry> {
        let user = self.identity.current_user()?;
        match self.store.get(&EphemeralKey::presence(session, &user.id)) {
            Some(EphemeralValue::Presence(entry)) => Some(entry),
            _ => None,
        }
    }

    /// One-shot read of the online list.
    pub fn online(&self, session: &str) -> Vec<OnlineUser> {
        let me = self.identity.current_user().map(|u| u.id);
        online_users(
            &self.store,
            session,
            me.as_deref(),
            self.config.presence_stale_after_ms,
            now_millis(),
        )
    }

    /// Push the online list of `session` to `callback` on every change.
    pub fn subscribe_online<F>(&self, session: &str, callback: F) -> Subscription
    where
        F: FnMut(&[OnlineUser]) + Send + 'static,
    {
        let me = self.identity.current_user().map(|u| u.id);
        let session_id = session.to_string();
        let stale_after = self.config.presence_stale_after_ms;
        let refresh = (self.config.presence_stale_after() / 2).max(std::time::Duration::from_millis(10));

        self.store.watch_scope(
            EphemeralSpace::Presence,
            session.to_string(),
            Some(refresh),
            "presence",
            move |store: &EphemeralStore| {
                online_users(store, &session_id, me.as_deref(), stale_after, now_millis())
            },
            callback,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::StaticIdentity;

    fn registry(store: &Arc<EphemeralStore>, user: &str) -> (PresenceRegistry, Arc<StaticIdentity>) {
        let identity = Arc::new(StaticIdentity::signed_in(UserIdentity::new(user, user.to_uppercase())));
        let registry = PresenceRegistry::new(
            store.clone(),
            store.connect(),
            identity.clone(),
            SyncConfig::for_testing(),
        );
        (registry, identity)
    }

    // ── Color tests ──────────────────────────────────────────────

    #[test]
    fn test_user_color_stable() {
        assert_eq!(user_color("alice"), user_color("alice"));
        assert!(USER_COLORS.contains(&user_color("")));
    }

    #[test]
    fn test_user_color_spreads() {
        let distinct: std::collections::HashSet<_> =
            (0..50).map(|i| user_color(&format!("user-{i}"))).collect();
        assert!(distinct.len() > 3);
    }

    // ── Registry tests ───────────────────────────────────────────

    #[test]
    fn test_join_and_leave() {
        let store = EphemeralStore::new(16);
        let (alice, _) = registry(&store, "alice");

        let entry = alice.join("s").unwrap();
        assert!(entry.is_active);
        assert_eq!(entry.display_name, "ALICE");
        assert_eq!(entry.color, user_color("alice"));

        let online = alice.online("s");
        assert_eq!(online.len(), 1);
        assert!(online[0].is_current_user);

        alice.leave("s").unwrap();
        assert!(alice.online("s").is_empty());
    }

    #[test]
    fn test_join_requires_identity() {
        let store = EphemeralStore::new(16);
        let (alice, identity) = registry(&store, "alice");
        identity.sign_out();
        assert!(matches!(alice.join("s"), Err(CollabError::Unauthorized(_))));
        assert!(store.is_empty());
    }

    #[test]
    fn test_rejoin_keeps_joined_at() {
        let store = EphemeralStore::new(16);
        let (alice, _) = registry(&store, "alice");
        let first = alice.join("s").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = alice.join("s").unwrap();
        assert_eq!(first.joined_at, second.joined_at);
        assert!(second.last_seen >= first.last_seen);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_idle_users_hidden() {
        let store = EphemeralStore::new(16);
        let (alice, _) = registry(&store, "alice");
        let (bob, _) = registry(&store, "bob");
        alice.join("s").unwrap();
        bob.join("s").unwrap();

        bob.set_presence("s", false).unwrap();
        let online = alice.online("s");
        assert_eq!(online.len(), 1);
        assert_eq!(online[0].entry.user_id, "alice");
        assert!(bob.own_entry("s").is_some());
    }

    #[test]
    fn test_set_presence_without_entry() {
        let store = EphemeralStore::new(16);
        let (alice, _) = registry(&store, "alice");
        assert_eq!(alice.set_presence("s", false).unwrap(), None);
        assert!(alice.set_presence("s", true).unwrap().is_some());
        assert_eq!(alice.online("s").len(), 1);
    }

    #[test]
    fn test_stale_and_incomplete_filtered() {
        let store = EphemeralStore::new(16);
        let conn = store.connect();
        let mut stale = PresenceEntry::new("s", &UserIdentity::new("old", "Old"), 1_000);
        stale.last_seen = 1_000;
        let blank = PresenceEntry::new("s", &UserIdentity::new("blank", ""), 10_000);
        let fresh = PresenceEntry::new("s", &UserIdentity::new("new", "New"), 10_000);
        for entry in [stale, blank, fresh] {
            let key = EphemeralKey::presence("s", &entry.user_id);
            let owner = entry.user_id.clone();
            store.put(&conn, &owner, key, EphemeralValue::Presence(entry)).unwrap();
        }

        let online = online_users(&store, "s", Some("new"), 5_000, 10_500);
        assert_eq!(online.len(), 1);
        assert_eq!(online[0].entry.user_id, "new");
        assert!(online[0].is_current_user);
    }

    #[test]
    fn test_online_user_json_shape() {
        let entry = PresenceEntry::new("s", &UserIdentity::new("u1", "Ada"), 5);
        let value = serde_json::to_value(OnlineUser { entry, is_current_user: true }).unwrap();
        assert_eq!(value["userId"], "u1");
        assert_eq!(value["displayName"], "Ada");
        assert_eq!(value["isActive"], true);
        assert_eq!(value["isCurrentUser"], true);
        assert_eq!(value["joinedAt"], 5);
    }

    #[tokio::test]
    async fn test_subscribe_online_sees_join_and_leave() {
        use std::sync::Mutex;

        let store = EphemeralStore::new(16);
        let (alice, _) = registry(&store, "alice");
        let (bob, _) = registry(&store, "bob");
        alice.join("s").unwrap();

        let seen: Arc<Mutex<Vec<Vec<String>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = alice.subscribe_online("s", move |users| {
            sink.lock()
                .unwrap()
                .push(users.iter().map(|u| u.entry.user_id.clone()).collect());
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        bob.join("s").unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        bob.leave("s").unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.first().unwrap(), &vec!["alice".to_string()]);
        assert!(seen.iter().any(|ids| ids.len() == 2));
        assert_eq!(seen.last().unwrap(), &vec!["alice".to_string()]);
    }
}

//! Low-latency ephemeral store for presence, cursors and drag state.
//!
//! ## Model
//!
//! ```text
//!   ClientConnection ──put/remove──► EphemeralStore ──EphemeralChange──► watchers
//!        │  heartbeat                 │ entries: DashMap<EphemeralKey, entry>
//!        │  on_disconnect_remove      │ connections: last_seen + hook set
//!        ▼                            ▼
//!   close() / drop / reaper ──► disconnect(id) ──► hooked entries removed
//! ```
//!
//! Entries are never persisted. Each entry records the user that wrote it and
//! only that user may overwrite or remove it. A connection registers removal
//! hooks for the entries it owns; the hooks fire on graceful close, when the
//! last handle is dropped, or when the reaper finds the connection silent for
//! longer than the liveness timeout. That way no ghost entry outlives a
//! crashed client.
//!
//! Reference: Kleppmann — DDIA, Chapter 8 (Timeouts and Unbounded Delays)

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{debug, error, info, warn};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{Interval, MissedTickBehavior};

use crate::cursor::CursorSample;
use crate::drag::DragState;
use crate::error::CollabError;
use crate::presence::PresenceEntry;
use crate::subscription::Subscription;

pub type ConnectionId = u64;

/// Floor for the reaper tick; `tokio::time::interval` rejects zero.
const MIN_REAPER_INTERVAL: Duration = Duration::from_millis(1);

// ───────────────────────────────────────────────────────────────────
// Keys & values
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EphemeralSpace {
    Presence,
    Cursor,
    Drag,
}

/// `space / scope / id`: scope is the canvas session, id the user or shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EphemeralKey {
    pub space: EphemeralSpace,
    pub scope: String,
    pub id: String,
}

impl EphemeralKey {
    pub fn presence(session: &str, user_id: &str) -> Self {
        Self::new(EphemeralSpace::Presence, session, user_id)
    }

    pub fn cursor(session: &str, user_id: &str) -> Self {
        Self::new(EphemeralSpace::Cursor, session, user_id)
    }

    pub fn drag(session: &str, shape_id: &str) -> Self {
        Self::new(EphemeralSpace::Drag, session, shape_id)
    }

    fn new(space: EphemeralSpace, scope: &str, id: &str) -> Self {
        Self {
            space,
            scope: scope.to_string(),
            id: id.to_string(),
        }
    }

    pub fn in_scope(&self, space: EphemeralSpace, scope: &str) -> bool {
        self.space == space && self.scope == scope
    }
}

impl fmt::Display for EphemeralKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let space = match self.space {
            EphemeralSpace::Presence => "presence",
            EphemeralSpace::Cursor => "cursors",
            EphemeralSpace::Drag => "drag",
        };
        write!(f, "{}/{}/{}", space, self.scope, self.id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EphemeralValue {
    Presence(PresenceEntry),
    Cursor(CursorSample),
    Drag(DragState),
}

/// Change notification fanned out to watchers.
#[derive(Debug, Clone, PartialEq)]
pub enum EphemeralChange {
    Put(EphemeralKey),
    Removed(EphemeralKey),
}

impl EphemeralChange {
    pub fn key(&self) -> &EphemeralKey {
        match self {
            EphemeralChange::Put(k) | EphemeralChange::Removed(k) => k,
        }
    }
}

struct StoredEntry {
    owner: String,
    connection: ConnectionId,
    value: EphemeralValue,
}

struct ConnectionState {
    last_seen: Instant,
    hooks: HashSet<EphemeralKey>,
}

// ───────────────────────────────────────────────────────────────────
// Store
// ───────────────────────────────────────────────────────────────────

pub struct EphemeralStore {
    entries: DashMap<EphemeralKey, StoredEntry>,
    connections: DashMap<ConnectionId, ConnectionState>,
    changes: broadcast::Sender<EphemeralChange>,
    next_connection: AtomicU64,
}

impl EphemeralStore {
    /// `capacity` bounds buffered change events per watcher.
    pub fn new(capacity: usize) -> Arc<Self> {
        let (changes, _) = broadcast::channel(capacity.max(1));
        Arc::new(Self {
            entries: DashMap::new(),
            connections: DashMap::new(),
            changes,
            next_connection: AtomicU64::new(1),
        })
    }

    /// Open a new client connection.
    pub fn connect(self: &Arc<Self>) -> ClientConnection {
        let id = self.next_connection.fetch_add(1, Ordering::SeqCst);
        self.connections.insert(
            id,
            ConnectionState {
                last_seen: Instant::now(),
                hooks: HashSet::new(),
            },
        );
        info!("Ephemeral connection {} opened", id);
        ClientConnection {
            inner: Arc::new(ConnectionHandle {
                id,
                store: Arc::downgrade(self),
                closed: AtomicBool::new(false),
            }),
        }
    }

    fn touch(&self, id: ConnectionId) -> Result<(), CollabError> {
        match self.connections.get_mut(&id) {
            Some(mut state) => {
                state.last_seen = Instant::now();
                Ok(())
            }
            None => Err(CollabError::ConnectionClosed),
        }
    }

    fn notify(&self, change: EphemeralChange) {
        // No watchers is fine.
        let _ = self.changes.send(change);
    }

    /// Write `value` under `key` on behalf of `owner`.
    pub fn put(
        &self,
        conn: &ClientConnection,
        owner: &str,
        key: EphemeralKey,
        value: EphemeralValue,
    ) -> Result<(), CollabError> {
        self.touch(conn.id())?;
        let stored = StoredEntry {
            owner: owner.to_string(),
            connection: conn.id(),
            value,
        };
        match self.entries.entry(key.clone()) {
            Entry::Occupied(mut e) => {
                if e.get().owner != owner {
                    return Err(CollabError::NotOwner(key.to_string()));
                }
                e.insert(stored);
            }
            Entry::Vacant(e) => {
                e.insert(stored);
            }
        }
        self.notify(EphemeralChange::Put(key));
        Ok(())
    }

    /// Remove `key` on behalf of `owner`. `Ok(false)` if it was absent.
    pub fn remove(&self, owner: &str, key: &EphemeralKey) -> Result<bool, CollabError> {
        let owned = self.entries.get(key).map(|e| e.owner == owner);
        match owned {
            None => Ok(false),
            Some(false) => Err(CollabError::NotOwner(key.to_string())),
            Some(true) => {
                let removed = self.entries.remove(key).is_some();
                if removed {
                    self.notify(EphemeralChange::Removed(key.clone()));
                }
                Ok(removed)
            }
        }
    }

    /// Remove `key` automatically when `conn` goes away.
    pub fn on_disconnect_remove(&self, conn: &ClientConnection, key: EphemeralKey) -> Result<(), CollabError> {
        match self.connections.get_mut(&conn.id()) {
            Some(mut state) => {
                state.hooks.insert(key);
                Ok(())
            }
            None => Err(CollabError::ConnectionClosed),
        }
    }

    pub fn cancel_on_disconnect(&self, conn: &ClientConnection, key: &EphemeralKey) {
        if let Some(mut state) = self.connections.get_mut(&conn.id()) {
            state.hooks.remove(key);
        }
    }

    pub fn get(&self, key: &EphemeralKey) -> Option<EphemeralValue> {
        self.entries.get(key).map(|e| e.value.clone())
    }

    /// Owner recorded for `key`.
    pub fn owner(&self, key: &EphemeralKey) -> Option<String> {
        self.entries.get(key).map(|e| e.owner.clone())
    }

    /// All entries of one space and scope, ordered by key.
    pub fn scan(&self, space: EphemeralSpace, scope: &str) -> Vec<(EphemeralKey, EphemeralValue)> {
        let mut found: Vec<_> = self
            .entries
            .iter()
            .filter(|e| e.key().in_scope(space, scope))
            .map(|e| (e.key().clone(), e.value.clone()))
            .collect();
        found.sort_by(|a, b| a.0.cmp(&b.0));
        found
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EphemeralChange> {
        self.changes.subscribe()
    }

    // ─── Liveness ─────────────────────────────────────────────────────

    pub fn heartbeat(&self, id: ConnectionId) -> Result<(), CollabError> {
        self.touch(id)
    }

    pub fn is_connected(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Drop connection `id` and fire its removal hooks.
    ///
    /// Only entries last written through this connection are removed.
    /// Returns the number of entries removed.
    pub fn disconnect(&self, id: ConnectionId) -> usize {
        let Some((_, state)) = self.connections.remove(&id) else {
            return 0;
        };
        let mut removed = 0;
        for key in state.hooks {
            if self.entries.remove_if(&key, |_, e| e.connection == id).is_some() {
                self.notify(EphemeralChange::Removed(key));
                removed += 1;
            }
        }
        info!("Ephemeral connection {} closed, {} entr(ies) removed", id, removed);
        removed
    }

    /// Disconnect every connection silent for longer than `max_idle`.
    pub fn reap_stale(&self, max_idle: Duration) -> Vec<ConnectionId> {
        let stale: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|c| c.last_seen.elapsed() > max_idle)
            .map(|c| *c.key())
            .collect();
        for id in &stale {
            warn!("Reaping silent connection {}", id);
            self.disconnect(*id);
        }
        stale
    }

    /// Run [`reap_stale`](Self::reap_stale) every `interval` until the handle
    /// is released or the store is dropped.
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration, timeout: Duration) -> Subscription {
        let store = Arc::downgrade(self);
        let interval = interval.max(MIN_REAPER_INTERVAL);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                store.reap_stale(timeout);
            }
        });
        Subscription::new("liveness reaper", task)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // ─── Watching ─────────────────────────────────────────────────────

    /// Push `project(store)` to `callback` whenever something in
    /// `space`/`scope` changes, and every `refresh` if given.
    ///
    /// Consecutive identical projections are pushed once. A lagging watcher
    /// simply re-projects; a closed channel pushes an empty list.
    pub(crate) fn watch_scope<T, P, C>(
        self: &Arc<Self>,
        space: EphemeralSpace,
        scope: String,
        refresh: Option<Duration>,
        name: &'static str,
        project: P,
        callback: C,
    ) -> Subscription
    where
        T: PartialEq + Send + 'static,
        P: Fn(&EphemeralStore) -> Vec<T> + Send + 'static,
        C: FnMut(&[T]) + Send + 'static,
    {
        let store = self.clone();
        let mut rx = self.changes.subscribe();
        let task = tokio::spawn(async move {
            let mut ticker = refresh.map(|period| {
                let mut t = tokio::time::interval(period);
                t.set_missed_tick_behavior(MissedTickBehavior::Delay);
                t
            });
            let mut out = Dedup {
                last: None,
                callback,
            };
            out.push(project(&store));
            loop {
                tokio::select! {
                    received = rx.recv() => match received {
                        Ok(change) if change.key().in_scope(space, &scope) => out.push(project(&store)),
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            debug!("{} watcher lagged by {} change(s)", name, skipped);
                            out.push(project(&store));
                        }
                        Err(RecvError::Closed) => {
                            error!("{} change channel closed", name);
                            out.push(Vec::new());
                            break;
                        }
                    },
                    _ = next_tick(&mut ticker) => out.push(project(&store)),
                }
            }
        });
        Subscription::new(name, task)
    }
}

struct Dedup<T, C> {
    last: Option<Vec<T>>,
    callback: C,
}

impl<T: PartialEq, C: FnMut(&[T])> Dedup<T, C> {
    fn push(&mut self, next: Vec<T>) {
        if self.last.as_ref() != Some(&next) {
            (self.callback)(&next);
            self.last = Some(next);
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

// ───────────────────────────────────────────────────────────────────
// Connection handle
// ───────────────────────────────────────────────────────────────────

struct ConnectionHandle {
    id: ConnectionId,
    store: Weak<EphemeralStore>,
    closed: AtomicBool,
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if let Some(store) = self.store.upgrade() {
            let removed = store.disconnect(self.id);
            if removed > 0 {
                warn!("Connection {} dropped without close, {} entr(ies) cleaned up", self.id, removed);
            }
        }
    }
}

/// A client's link to the ephemeral store. Clones share one connection;
/// dropping the last clone without [`close`](Self::close) counts as an
/// ungraceful disconnect.
#[derive(Clone)]
pub struct ClientConnection {
    inner: Arc<ConnectionHandle>,
}

impl ClientConnection {
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn heartbeat(&self) -> Result<(), CollabError> {
        let store = self.inner.store.upgrade().ok_or(CollabError::ConnectionClosed)?;
        store.heartbeat(self.inner.id)
    }

    pub fn is_open(&self) -> bool {
        self.inner
            .store
            .upgrade()
            .is_some_and(|s| s.is_connected(self.inner.id))
    }

    /// Graceful close. Remaining removal hooks still fire.
    pub fn close(&self) -> usize {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return 0;
        }
        self.inner
            .store
            .upgrade()
            .map(|s| s.disconnect(self.inner.id))
            .unwrap_or(0)
    }
}

impl fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.inner.id)
            .field("closed", &self.inner.closed.load(Ordering::SeqCst))
            .finish()
    }
}

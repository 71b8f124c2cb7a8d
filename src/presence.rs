//! Online-presence tracking over an in-process realtime key-value table.
//!
//! The table plays the role of the hosted realtime store: one record per
//! user, a full-snapshot broadcast on every change, and disconnect writes
//! registered ahead of time that the *table* commits when a connection
//! drops — whether the client disconnects deliberately or simply vanishes
//! (its connection handle falls out of scope).  Client code cannot observe
//! its own crash, so the offline transition never depends on it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::flog;
use crate::logging;
use crate::storage::now_millis;
use crate::subscription::{SnapshotSink, Subscription};

const PRESENCE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceState {
    Online,
    Offline,
}

/// A user's last-known state plus the store clock at the transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub state: PresenceState,
    pub changed_at: u64,
}

/// Full presence table, keyed by user identity.
pub type PresenceSnapshot = HashMap<String, PresenceRecord>;

/// The realtime presence table. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct PresenceTable {
    inner: Arc<PresenceInner>,
}

struct PresenceInner {
    records: Mutex<PresenceSnapshot>,
    updates: broadcast::Sender<PresenceSnapshot>,
}

impl PresenceTable {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(PRESENCE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(PresenceInner {
                records: Mutex::new(HashMap::new()),
                updates,
            }),
        }
    }

    /// Open a connection. Disconnect writes registered on the connection are
    /// committed by the table when the connection ends.
    pub fn connect(&self) -> PresenceConnection {
        PresenceConnection {
            table: self.clone(),
            disconnect_writes: Mutex::new(Vec::new()),
        }
    }

    pub fn snapshot(&self) -> PresenceSnapshot {
        self.inner.records.lock().unwrap().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PresenceSnapshot> {
        self.inner.updates.subscribe()
    }

    /// Write one record, stamping the store clock, and broadcast the full
    /// table to all subscribers.
    fn write(&self, user_id: &str, state: PresenceState) {
        let snapshot = {
            let mut records = self.inner.records.lock().unwrap();
            records.insert(
                user_id.to_string(),
                PresenceRecord {
                    state,
                    changed_at: now_millis(),
                },
            );
            records.clone()
        };
        let _ = self.inner.updates.send(snapshot);
    }
}

impl Default for PresenceTable {
    fn default() -> Self {
        Self::new()
    }
}

/// One client connection to the presence table.
///
/// Ending the connection — by calling [`disconnect`](Self::disconnect) or by
/// dropping the handle — commits every registered disconnect write with a
/// fresh store timestamp.
pub struct PresenceConnection {
    table: PresenceTable,
    disconnect_writes: Mutex<Vec<(String, PresenceState)>>,
}

impl PresenceConnection {
    pub fn write(&self, user_id: &str, state: PresenceState) {
        self.table.write(user_id, state);
    }

    /// Register a write the table will commit when this connection ends.
    pub fn on_disconnect(&self, user_id: &str, state: PresenceState) {
        self.disconnect_writes
            .lock()
            .unwrap()
            .push((user_id.to_string(), state));
    }

    /// End the connection, committing all registered disconnect writes.
    pub fn disconnect(&self) {
        let writes = std::mem::take(&mut *self.disconnect_writes.lock().unwrap());
        for (user_id, state) in writes {
            self.table.write(&user_id, state);
        }
    }
}

impl Drop for PresenceConnection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Client-side presence component: marks the session's user online and
/// republishes table snapshots to the presentation layer.
pub struct PresenceTracker {
    table: PresenceTable,
    connection: PresenceConnection,
}

impl PresenceTracker {
    pub fn new(table: &PresenceTable) -> Self {
        Self {
            table: table.clone(),
            connection: table.connect(),
        }
    }

    /// Mark the user online and arm the store-side offline fallback.
    ///
    /// The fallback is registered before the online marker is written, so a
    /// connection that dies right after this call still flips to offline.
    /// Presence is best-effort; nothing here retries.
    pub fn set_online(&self, user_id: &str) {
        self.connection
            .on_disconnect(user_id, PresenceState::Offline);
        self.connection.write(user_id, PresenceState::Online);
        flog!("presence: {} online", logging::user_id(user_id));
    }

    /// Subscribe to the full presence table. The sink receives the current
    /// table immediately, then a full snapshot on every change.
    pub fn subscribe_all<S>(&self, sink: S) -> Subscription
    where
        S: SnapshotSink<PresenceSnapshot> + 'static,
    {
        let table = self.table.clone();
        let mut rx = self.table.subscribe();
        let handle = tokio::spawn(async move {
            sink.publish(table.snapshot());
            loop {
                match rx.recv().await {
                    Ok(snapshot) => sink.publish(snapshot),
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        sink.publish(table.snapshot());
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Subscription::new(handle)
    }

    /// End the session's presence connection, committing the offline
    /// fallback immediately.
    pub fn disconnect(&self) {
        self.connection.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnect_commits_registered_writes() {
        let table = PresenceTable::new();
        let conn = table.connect();
        conn.on_disconnect("uma", PresenceState::Offline);
        conn.write("uma", PresenceState::Online);
        assert_eq!(
            table.snapshot().get("uma").unwrap().state,
            PresenceState::Online
        );

        drop(conn);
        assert_eq!(
            table.snapshot().get("uma").unwrap().state,
            PresenceState::Offline
        );
    }

    #[test]
    fn disconnect_is_idempotent() {
        let table = PresenceTable::new();
        let conn = table.connect();
        conn.on_disconnect("uma", PresenceState::Offline);
        conn.write("uma", PresenceState::Online);
        conn.disconnect();
        let first = *table.snapshot().get("uma").unwrap();
        // The drop after an explicit disconnect has nothing left to commit.
        drop(conn);
        assert_eq!(*table.snapshot().get("uma").unwrap(), first);
    }

    #[test]
    fn snapshot_carries_every_user() {
        let table = PresenceTable::new();
        let conn = table.connect();
        conn.write("uma", PresenceState::Online);
        conn.write("ravi", PresenceState::Online);
        let snapshot = table.snapshot();
        assert_eq!(snapshot.len(), 2);
    }
}

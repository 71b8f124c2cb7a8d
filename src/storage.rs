//! SQLite-backed document store for fiche.
//!
//! The store is the single source of truth shared by every session in the
//! process.  It provides typed rows for all entity types, schema creation,
//! atomic multi-document transactions (a send, a read pass), and a
//! post-commit change broadcast that drives live query subscriptions.
//! Change notifications are sent while the connection lock is still held,
//! so subscribers observe changes in commit order.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::OsRng;
use rand::RngCore;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum StorageError {
    Sqlite(rusqlite::Error),
    NotFound(String),
    Precondition(String),
    Corrupt(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Sqlite(e) => write!(f, "sqlite error: {e}"),
            StorageError::NotFound(msg) => write!(f, "not found: {msg}"),
            StorageError::Precondition(msg) => write!(f, "precondition failed: {msg}"),
            StorageError::Corrupt(msg) => write!(f, "corrupt row: {msg}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::Sqlite(e)
    }
}

// ---------------------------------------------------------------------------
// Change notifications
// ---------------------------------------------------------------------------

/// Partition-level change notification emitted after every commit.
///
/// Subscribers re-run their query on a relevant change and publish a full
/// snapshot; the notification itself carries no row data.
#[derive(Debug, Clone)]
pub enum Change {
    Profiles { user_ids: Vec<String> },
    Conversations { participants: Vec<String> },
    Messages { conversation_id: String },
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// User profile row. Created once on first sign-in, never deleted here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileRow {
    pub user_id: String,
    pub display_name: String,
    pub email: String,
    pub photo_url: Option<String>,
    pub verified: bool,
    pub visible: bool,
    pub created_at: u64,
}

/// Denormalized last-message summary kept on the conversation row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastMessage {
    pub body: String,
    pub sender_id: String,
    pub timestamp: u64,
}

/// Pairwise conversation row with per-participant unread counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRow {
    pub conversation_id: String,
    pub participants: [String; 2],
    pub created_at: u64,
    pub updated_at: u64,
    pub last_message: Option<LastMessage>,
    pub unread: HashMap<String, u32>,
}

impl ConversationRow {
    pub fn has_participant(&self, user_id: &str) -> bool {
        self.participants.iter().any(|p| p == user_id)
    }

    /// The other participant, or `None` when `user_id` is not a participant.
    pub fn counterpart_of(&self, user_id: &str) -> Option<&str> {
        match &self.participants {
            [a, b] if a == user_id => Some(b),
            [a, b] if b == user_id => Some(a),
            _ => None,
        }
    }

    pub fn unread_for(&self, user_id: &str) -> u32 {
        self.unread.get(user_id).copied().unwrap_or(0)
    }
}

/// Message type tag. Only plain text exists today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StorageError> {
        match s {
            "text" => Ok(MessageKind::Text),
            other => Err(StorageError::Corrupt(format!(
                "unknown message kind: {other}"
            ))),
        }
    }
}

/// Message row. Content and sender are immutable once created; only the
/// read-set grows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRow {
    pub message_id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub body: String,
    pub kind: MessageKind,
    pub timestamp: u64,
    pub read_by: BTreeSet<String>,
}

impl MessageRow {
    pub fn is_read_by(&self, user_id: &str) -> bool {
        self.read_by.contains(user_id)
    }
}

// ---------------------------------------------------------------------------
// Storage handle
// ---------------------------------------------------------------------------

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Current store clock in milliseconds. All row timestamps use this clock.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn new_message_id() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Shared store handle. Cheap to clone; all clones point at one database
/// and one change broadcast.
#[derive(Clone)]
pub struct Storage {
    inner: Arc<StorageInner>,
}

struct StorageInner {
    conn: Mutex<Connection>,
    changes: broadcast::Sender<Change>,
}

impl Storage {
    /// Open or create a database at the given path. Creates schema if needed.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Self::from_connection(conn)
    }

    /// Create an in-memory database (tests and demos).
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StorageError> {
        Self::create_schema(&conn)?;
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Ok(Self {
            inner: Arc::new(StorageInner {
                conn: Mutex::new(conn),
                changes,
            }),
        })
    }

    /// Subscribe to post-commit change notifications.
    ///
    /// Within one receiver, notifications arrive in commit order.  A lagged
    /// receiver should simply re-run its query; snapshots make skipped
    /// notifications harmless.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<Change> {
        self.inner.changes.subscribe()
    }

    fn emit(&self, change: Change) {
        let _ = self.inner.changes.send(change);
    }

    fn create_schema(conn: &Connection) -> Result<(), StorageError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS profiles (
                user_id      TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                email        TEXT NOT NULL,
                photo_url    TEXT,
                verified     INTEGER NOT NULL DEFAULT 0,
                visible      INTEGER NOT NULL DEFAULT 1,
                created_at   INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS conversations (
                conversation_id TEXT PRIMARY KEY,
                participant_a   TEXT NOT NULL,
                participant_b   TEXT NOT NULL,
                created_at      INTEGER NOT NULL,
                updated_at      INTEGER NOT NULL,
                last_body       TEXT,
                last_sender     TEXT,
                last_timestamp  INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_conversations_a
                ON conversations(participant_a, updated_at);
            CREATE INDEX IF NOT EXISTS idx_conversations_b
                ON conversations(participant_b, updated_at);

            CREATE TABLE IF NOT EXISTS unread_counts (
                conversation_id TEXT NOT NULL REFERENCES conversations(conversation_id),
                user_id         TEXT NOT NULL,
                count           INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (conversation_id, user_id)
            );

            CREATE TABLE IF NOT EXISTS messages (
                message_id      TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL REFERENCES conversations(conversation_id),
                sender_id       TEXT NOT NULL,
                body            TEXT NOT NULL,
                kind            TEXT NOT NULL DEFAULT 'text',
                timestamp       INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_conversation
                ON messages(conversation_id, timestamp);

            CREATE TABLE IF NOT EXISTS message_reads (
                message_id  TEXT NOT NULL REFERENCES messages(message_id),
                user_id     TEXT NOT NULL,
                read_at     INTEGER NOT NULL,
                PRIMARY KEY (message_id, user_id)
            );
            ",
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Profiles
    // -----------------------------------------------------------------------

    /// Insert the profile if no row exists for its user id. Existing rows are
    /// left untouched. Returns whether a row was created.
    pub fn ensure_profile(&self, profile: &ProfileRow) -> Result<bool, StorageError> {
        let conn = self.inner.conn.lock().unwrap();
        let inserted = conn.execute(
            "INSERT INTO profiles
                 (user_id, display_name, email, photo_url, verified, visible, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(user_id) DO NOTHING",
            params![
                profile.user_id,
                profile.display_name,
                profile.email,
                profile.photo_url,
                profile.verified,
                profile.visible,
                profile.created_at as i64,
            ],
        )?;
        if inserted > 0 {
            self.emit(Change::Profiles {
                user_ids: vec![profile.user_id.clone()],
            });
        }
        Ok(inserted > 0)
    }

    pub fn get_profile(&self, user_id: &str) -> Result<Option<ProfileRow>, StorageError> {
        let conn = self.inner.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT user_id, display_name, email, photo_url, verified, visible, created_at
                 FROM profiles WHERE user_id = ?1",
                params![user_id],
                map_profile,
            )
            .optional()?;
        Ok(row)
    }

    /// Batch fetch. Identities without a stored profile are simply omitted
    /// from the result.
    pub fn get_profiles(&self, user_ids: &[String]) -> Result<Vec<ProfileRow>, StorageError> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.inner.conn.lock().unwrap();
        let placeholders = vec!["?"; user_ids.len()].join(", ");
        let sql = format!(
            "SELECT user_id, display_name, email, photo_url, verified, visible, created_at
             FROM profiles WHERE user_id IN ({placeholders})"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(user_ids.iter()), map_profile)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    // -----------------------------------------------------------------------
    // Conversations
    // -----------------------------------------------------------------------

    /// Get-or-create by key. A freshly created conversation has zeroed
    /// counters and no last-message summary; an existing one is returned
    /// unchanged. The store arbitrates concurrent first-contact creates.
    pub fn create_conversation_if_absent(
        &self,
        conversation_id: &str,
        user_a: &str,
        user_b: &str,
    ) -> Result<ConversationRow, StorageError> {
        let mut conn = self.inner.conn.lock().unwrap();
        let now = now_millis();
        let tx = conn.transaction()?;
        let inserted = tx.execute(
            "INSERT INTO conversations
                 (conversation_id, participant_a, participant_b, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(conversation_id) DO NOTHING",
            params![conversation_id, user_a, user_b, now as i64],
        )?;
        if inserted > 0 {
            for user in [user_a, user_b] {
                tx.execute(
                    "INSERT INTO unread_counts (conversation_id, user_id, count)
                     VALUES (?1, ?2, 0)
                     ON CONFLICT(conversation_id, user_id) DO NOTHING",
                    params![conversation_id, user],
                )?;
            }
        }
        tx.commit()?;

        let row = read_conversation(&conn, conversation_id)?.ok_or_else(|| {
            StorageError::NotFound(format!("conversation {conversation_id}"))
        })?;
        if inserted > 0 {
            self.emit(Change::Conversations {
                participants: vec![user_a.to_string(), user_b.to_string()],
            });
        }
        Ok(row)
    }

    pub fn get_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<ConversationRow>, StorageError> {
        let conn = self.inner.conn.lock().unwrap();
        read_conversation(&conn, conversation_id)
    }

    /// Every conversation the user participates in, descending by last
    /// update time.
    pub fn list_conversations_for(
        &self,
        user_id: &str,
    ) -> Result<Vec<ConversationRow>, StorageError> {
        let conn = self.inner.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT conversation_id FROM conversations
             WHERE participant_a = ?1 OR participant_b = ?1
             ORDER BY updated_at DESC, conversation_id",
        )?;
        let ids = stmt
            .query_map(params![user_id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        let mut result = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(row) = read_conversation(&conn, &id)? {
                result.push(row);
            }
        }
        Ok(result)
    }

    pub fn unread_count(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<u32, StorageError> {
        let conn = self.inner.conn.lock().unwrap();
        let count = conn
            .query_row(
                "SELECT count FROM unread_counts
                 WHERE conversation_id = ?1 AND user_id = ?2",
                params![conversation_id, user_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(count.unwrap_or(0) as u32)
    }

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    /// Append a message in one atomic transaction: insert the message with
    /// read-set `{sender}`, refresh the conversation summary and updated-at,
    /// and increment the counterpart's unread counter by exactly one.
    ///
    /// A reader never observes the message without the counter increment or
    /// vice versa.
    pub fn append_message(
        &self,
        conversation_id: &str,
        sender_id: &str,
        body: &str,
    ) -> Result<MessageRow, StorageError> {
        let mut conn = self.inner.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let participants: Option<(String, String)> = tx
            .query_row(
                "SELECT participant_a, participant_b FROM conversations
                 WHERE conversation_id = ?1",
                params![conversation_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (a, b) = participants.ok_or_else(|| {
            StorageError::NotFound(format!("conversation {conversation_id}"))
        })?;
        let other = if sender_id == a {
            b.clone()
        } else if sender_id == b {
            a.clone()
        } else {
            return Err(StorageError::Precondition(format!(
                "{sender_id} is not a participant of {conversation_id}"
            )));
        };

        let message_id = new_message_id();
        let now = now_millis();
        tx.execute(
            "INSERT INTO messages (message_id, conversation_id, sender_id, body, kind, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                message_id,
                conversation_id,
                sender_id,
                body,
                MessageKind::Text.as_str(),
                now as i64,
            ],
        )?;
        tx.execute(
            "INSERT INTO message_reads (message_id, user_id, read_at) VALUES (?1, ?2, ?3)",
            params![message_id, sender_id, now as i64],
        )?;
        tx.execute(
            "UPDATE conversations
             SET last_body = ?2, last_sender = ?3, last_timestamp = ?4, updated_at = ?4
             WHERE conversation_id = ?1",
            params![conversation_id, body, sender_id, now as i64],
        )?;
        tx.execute(
            "UPDATE unread_counts SET count = count + 1
             WHERE conversation_id = ?1 AND user_id = ?2",
            params![conversation_id, other],
        )?;
        tx.commit()?;

        self.emit(Change::Messages {
            conversation_id: conversation_id.to_string(),
        });
        self.emit(Change::Conversations {
            participants: vec![a, b],
        });

        Ok(MessageRow {
            message_id,
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            body: body.to_string(),
            kind: MessageKind::Text,
            timestamp: now,
            read_by: BTreeSet::from([sender_id.to_string()]),
        })
    }

    /// Full message history of one conversation, ascending by timestamp
    /// (insertion order breaks ties).
    pub fn list_messages(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<MessageRow>, StorageError> {
        let conn = self.inner.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT message_id, sender_id, body, kind, timestamp
             FROM messages WHERE conversation_id = ?1
             ORDER BY timestamp ASC, rowid ASC",
        )?;
        let raw = stmt
            .query_map(params![conversation_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);

        let mut read_sets: HashMap<String, BTreeSet<String>> = HashMap::new();
        let mut stmt = conn.prepare(
            "SELECT r.message_id, r.user_id
             FROM message_reads r
             JOIN messages m ON m.message_id = r.message_id
             WHERE m.conversation_id = ?1",
        )?;
        let reads = stmt.query_map(params![conversation_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for read in reads {
            let (message_id, user_id) = read?;
            read_sets.entry(message_id).or_default().insert(user_id);
        }
        drop(stmt);

        let mut result = Vec::with_capacity(raw.len());
        for (message_id, sender_id, body, kind, timestamp) in raw {
            let read_by = read_sets.remove(&message_id).unwrap_or_default();
            result.push(MessageRow {
                kind: MessageKind::parse(&kind)?,
                message_id,
                conversation_id: conversation_id.to_string(),
                sender_id,
                body,
                timestamp: timestamp as u64,
                read_by,
            });
        }
        Ok(result)
    }

    /// Read pass for one participant: add them to the read-set of every
    /// incoming message they have not read, and zero their unread counter —
    /// all in one transaction. With nothing to mark, no write happens at
    /// all and no change is emitted.
    ///
    /// Returns the number of messages newly marked.
    pub fn mark_conversation_read(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<usize, StorageError> {
        let mut conn = self.inner.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let participants: Option<(String, String)> = tx
            .query_row(
                "SELECT participant_a, participant_b FROM conversations
                 WHERE conversation_id = ?1",
                params![conversation_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        // Conversation already gone: nothing to mark.
        let Some((a, b)) = participants else {
            return Ok(0);
        };

        let mut stmt = tx.prepare(
            "SELECT m.message_id FROM messages m
             WHERE m.conversation_id = ?1
               AND m.sender_id != ?2
               AND NOT EXISTS (SELECT 1 FROM message_reads r
                               WHERE r.message_id = m.message_id AND r.user_id = ?2)
             ORDER BY m.rowid",
        )?;
        let pending = stmt
            .query_map(params![conversation_id, user_id], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);

        if pending.is_empty() {
            return Ok(0);
        }

        let now = now_millis();
        for message_id in &pending {
            tx.execute(
                "INSERT INTO message_reads (message_id, user_id, read_at) VALUES (?1, ?2, ?3)",
                params![message_id, user_id, now as i64],
            )?;
        }
        tx.execute(
            "UPDATE unread_counts SET count = 0
             WHERE conversation_id = ?1 AND user_id = ?2",
            params![conversation_id, user_id],
        )?;
        tx.commit()?;

        self.emit(Change::Messages {
            conversation_id: conversation_id.to_string(),
        });
        self.emit(Change::Conversations {
            participants: vec![a, b],
        });
        Ok(pending.len())
    }

    // -----------------------------------------------------------------------
    // Deletion
    // -----------------------------------------------------------------------

    /// Delete every message (and its read-set rows) of a conversation in one
    /// commit. Runs before [`delete_conversation_record`] so a failure in
    /// between leaves an empty shell, never orphaned messages.
    pub fn delete_conversation_messages(
        &self,
        conversation_id: &str,
    ) -> Result<usize, StorageError> {
        let mut conn = self.inner.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM message_reads WHERE message_id IN
                 (SELECT message_id FROM messages WHERE conversation_id = ?1)",
            params![conversation_id],
        )?;
        let deleted = tx.execute(
            "DELETE FROM messages WHERE conversation_id = ?1",
            params![conversation_id],
        )?;
        tx.commit()?;
        if deleted > 0 {
            self.emit(Change::Messages {
                conversation_id: conversation_id.to_string(),
            });
        }
        Ok(deleted)
    }

    /// Delete the conversation document itself with its counters. Returns
    /// whether a row existed.
    pub fn delete_conversation_record(
        &self,
        conversation_id: &str,
    ) -> Result<bool, StorageError> {
        let mut conn = self.inner.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let participants: Option<(String, String)> = tx
            .query_row(
                "SELECT participant_a, participant_b FROM conversations
                 WHERE conversation_id = ?1",
                params![conversation_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((a, b)) = participants else {
            return Ok(false);
        };
        tx.execute(
            "DELETE FROM unread_counts WHERE conversation_id = ?1",
            params![conversation_id],
        )?;
        tx.execute(
            "DELETE FROM conversations WHERE conversation_id = ?1",
            params![conversation_id],
        )?;
        tx.commit()?;
        self.emit(Change::Conversations {
            participants: vec![a, b],
        });
        Ok(true)
    }
}

fn map_profile(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProfileRow> {
    Ok(ProfileRow {
        user_id: row.get(0)?,
        display_name: row.get(1)?,
        email: row.get(2)?,
        photo_url: row.get(3)?,
        verified: row.get::<_, i32>(4)? != 0,
        visible: row.get::<_, i32>(5)? != 0,
        created_at: row.get::<_, i64>(6)? as u64,
    })
}

fn read_conversation(
    conn: &Connection,
    conversation_id: &str,
) -> Result<Option<ConversationRow>, StorageError> {
    let base = conn
        .query_row(
            "SELECT conversation_id, participant_a, participant_b, created_at, updated_at,
                    last_body, last_sender, last_timestamp
             FROM conversations WHERE conversation_id = ?1",
            params![conversation_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, Option<i64>>(7)?,
                ))
            },
        )
        .optional()?;
    let Some((id, a, b, created_at, updated_at, last_body, last_sender, last_timestamp)) = base
    else {
        return Ok(None);
    };

    let last_message = match (last_body, last_sender, last_timestamp) {
        (Some(body), Some(sender_id), Some(timestamp)) => Some(LastMessage {
            body,
            sender_id,
            timestamp: timestamp as u64,
        }),
        _ => None,
    };

    let mut unread = HashMap::new();
    let mut stmt = conn.prepare(
        "SELECT user_id, count FROM unread_counts WHERE conversation_id = ?1",
    )?;
    let rows = stmt.query_map(params![conversation_id], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;
    for row in rows {
        let (user_id, count) = row?;
        unread.insert(user_id, count.max(0) as u32);
    }

    Ok(Some(ConversationRow {
        conversation_id: id,
        participants: [a, b],
        created_at: created_at as u64,
        updated_at: updated_at as u64,
        last_message,
        unread,
    }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

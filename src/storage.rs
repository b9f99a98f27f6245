//! SQLite storage layer for courier.
//!
//! Persists the drop-box mailboxes, the user/session tables consumed by the
//! authentication gate, and user-to-user messages awaiting pickup.  All
//! callers share one connection behind the server state lock; writes are
//! either single-key or one multi-key transaction.

use std::collections::HashMap;
use std::path::Path;

use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension};

/// Drop-box IDs are exactly this many raw bytes.  The store trusts its
/// callers to have validated lengths at the boundary.
pub const DROP_BOX_ID_SIZE: usize = 16;

const ACCESS_TOKEN_BYTES: usize = 32;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum StorageError {
    Sqlite(rusqlite::Error),
    Io(std::io::Error),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Sqlite(e) => write!(f, "sqlite error: {e}"),
            StorageError::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::Sqlite(e)
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e)
    }
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// Message row awaiting pickup by its recipient.  `cipher_text` and `nonce`
/// are opaque to the server.
#[derive(Debug, Clone)]
pub struct MessageRow {
    pub id: i64,
    pub recipient_id: i64,
    pub sender_id: i64,
    pub cipher_text: Vec<u8>,
    pub nonce: Vec<u8>,
    pub sent_at: u64,
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

pub struct Storage {
    conn: Connection,
}

impl Storage {
    /// Open or create a database at the given path. Creates the parent
    /// directory and the schema if needed.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let storage = Self { conn };
        storage.create_schema()?;
        Ok(storage)
    }

    /// Create an in-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let storage = Self { conn };
        storage.create_schema()?;
        Ok(storage)
    }

    fn create_schema(&self) -> Result<(), StorageError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS users (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                username   TEXT NOT NULL UNIQUE,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS access_tokens (
                token      TEXT PRIMARY KEY,
                user_id    INTEGER NOT NULL REFERENCES users(id),
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS drop_boxes (
                box_id  BLOB PRIMARY KEY,
                package BLOB NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                recipient_id INTEGER NOT NULL REFERENCES users(id),
                sender_id    INTEGER NOT NULL REFERENCES users(id),
                cipher_text  BLOB NOT NULL,
                nonce        BLOB NOT NULL,
                sent_at      INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_recipient
                ON messages(recipient_id);
            ",
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Drop boxes
    // -----------------------------------------------------------------------

    /// Store `package` at `box_id`, replacing any previous package.  The
    /// write is durable before this returns.
    pub fn put_package(&self, box_id: &[u8], package: &[u8]) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO drop_boxes (box_id, package) VALUES (?1, ?2)",
            params![box_id, package],
        )?;
        Ok(())
    }

    /// Store a batch of packages in one transaction: either every box is
    /// updated or none is.
    pub fn put_packages(
        &self,
        packages: &HashMap<[u8; DROP_BOX_ID_SIZE], Vec<u8>>,
    ) -> Result<(), StorageError> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx
                .prepare("INSERT OR REPLACE INTO drop_boxes (box_id, package) VALUES (?1, ?2)")?;
            for (box_id, package) in packages {
                stmt.execute(params![&box_id[..], package])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Current package at `box_id`, or `None` if the box has never been
    /// written.  Non-destructive.
    pub fn pick_up_package(&self, box_id: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let package = self
            .conn
            .query_row(
                "SELECT package FROM drop_boxes WHERE box_id = ?1",
                params![box_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(package)
    }

    // -----------------------------------------------------------------------
    // Users and access tokens
    // -----------------------------------------------------------------------

    /// Create a user and return its ID (always positive).
    pub fn create_user(&self, username: &str, created_at: u64) -> Result<i64, StorageError> {
        self.conn.execute(
            "INSERT INTO users (username, created_at) VALUES (?1, ?2)",
            params![username, created_at],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn user_exists(&self, user_id: i64) -> Result<bool, StorageError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM users WHERE id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Mint a new access token for `user_id`.  How a client earns one (the
    /// challenge-response handshake) lives outside this server; this is the
    /// session record the gate resolves against.
    pub fn create_access_token(
        &self,
        user_id: i64,
        created_at: u64,
    ) -> Result<String, StorageError> {
        let mut bytes = [0u8; ACCESS_TOKEN_BYTES];
        OsRng.fill_bytes(&mut bytes);
        let token = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes);
        self.conn.execute(
            "INSERT INTO access_tokens (token, user_id, created_at) VALUES (?1, ?2, ?3)",
            params![token, user_id, created_at],
        )?;
        Ok(token)
    }

    /// Resolve an access token to a user ID.  `Ok(None)` means the token is
    /// unknown; an `Err` is a store failure, not an auth decision.
    pub fn verify_access_token(&self, token: &str) -> Result<Option<i64>, StorageError> {
        if token.is_empty() {
            return Ok(None);
        }
        let user_id = self
            .conn
            .query_row(
                "SELECT user_id FROM access_tokens WHERE token = ?1",
                params![token],
                |row| row.get(0),
            )
            .optional()?;
        Ok(user_id)
    }

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    /// Store a message for later pickup and return its ID.
    pub fn insert_message(
        &self,
        recipient_id: i64,
        sender_id: i64,
        cipher_text: &[u8],
        nonce: &[u8],
        sent_at: u64,
    ) -> Result<i64, StorageError> {
        self.conn.execute(
            "INSERT INTO messages (recipient_id, sender_id, cipher_text, nonce, sent_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![recipient_id, sender_id, cipher_text, nonce, sent_at],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// All messages waiting for `recipient_id`, oldest first.
    pub fn list_messages(&self, recipient_id: i64) -> Result<Vec<MessageRow>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, recipient_id, sender_id, cipher_text, nonce, sent_at
             FROM messages WHERE recipient_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![recipient_id], row_to_message)?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// One of `recipient_id`'s messages, or `None` if it does not exist or
    /// belongs to someone else.
    pub fn get_message(
        &self,
        recipient_id: i64,
        message_id: i64,
    ) -> Result<Option<MessageRow>, StorageError> {
        let message = self
            .conn
            .query_row(
                "SELECT id, recipient_id, sender_id, cipher_text, nonce, sent_at
                 FROM messages WHERE id = ?1 AND recipient_id = ?2",
                params![message_id, recipient_id],
                row_to_message,
            )
            .optional()?;
        Ok(message)
    }

    /// Delete one of `recipient_id`'s messages.  Returns whether a row was
    /// removed; a message owned by someone else counts as absent.
    pub fn delete_message(
        &self,
        recipient_id: i64,
        message_id: i64,
    ) -> Result<bool, StorageError> {
        let changed = self.conn.execute(
            "DELETE FROM messages WHERE id = ?1 AND recipient_id = ?2",
            params![message_id, recipient_id],
        )?;
        Ok(changed > 0)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        recipient_id: row.get(1)?,
        sender_id: row.get(2)?,
        cipher_text: row.get(3)?,
        nonce: row.get(4)?,
        sent_at: row.get(5)?,
    })
}

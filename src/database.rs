//! Database operations for Memo Core.
//!
//! This module is the entity store: the local, durable table of notes and
//! attachments for every account on this device. It holds no sync policy;
//! the reconciler and the session decide what to write.
//!
//! Rows are keyed by `(local_id, account_key)`. `(account_key, remote_id)` is
//! unique once a remote ID is assigned. Timestamps are Unix milliseconds.

use std::collections::HashSet;
use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::MemoResult;
use crate::filter::{escape_like, extract_tags, Filter};
use crate::models::{new_local_id, Attachment, Note, NoteLocation, Visibility};
use crate::validation::validate_note_content;

const NOTE_COLUMNS: &str = "local_id, remote_id, account_key, content, timestamp, visibility, \
     pinned, archived, needs_sync, is_deleted, last_modified_at, last_synced_at, \
     location_label, location_latitude, location_longitude, location_zoom";

const ATTACHMENT_COLUMNS: &str = "local_id, remote_id, account_key, parent_note_id, timestamp, \
     filename, remote_uri, local_cached_uri, mime_type";

/// Order used by every local listing: pinned first, newest edit first, then ID.
const LOCAL_ORDER: &str = "ORDER BY pinned DESC, last_modified_at DESC, local_id ASC";

fn to_millis(dt: &DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Database wrapper for SQLite operations
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) the store at the given path
    pub fn new<P: AsRef<Path>>(db_path: P) -> MemoResult<Self> {
        let conn = Connection::open(db_path)?;

        // Enable WAL mode for better concurrent access
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let db = Self { conn };
        db.init_database()?;
        Ok(db)
    }

    /// Create an in-memory database (for testing)
    pub fn new_in_memory() -> MemoResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init_database()?;
        Ok(db)
    }

    /// Initialize database schema
    pub fn init_database(&self) -> MemoResult<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS notes (
                local_id TEXT NOT NULL,
                remote_id TEXT,
                account_key TEXT NOT NULL,
                content TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                visibility TEXT NOT NULL,
                pinned INTEGER NOT NULL DEFAULT 0,
                archived INTEGER NOT NULL DEFAULT 0,
                needs_sync INTEGER NOT NULL DEFAULT 1,
                is_deleted INTEGER NOT NULL DEFAULT 0,
                last_modified_at INTEGER NOT NULL,
                last_synced_at INTEGER,
                location_label TEXT,
                location_latitude REAL,
                location_longitude REAL,
                location_zoom INTEGER,
                PRIMARY KEY (local_id, account_key)
            );

            CREATE INDEX IF NOT EXISTS idx_notes_account ON notes (account_key);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_notes_account_remote
                ON notes (account_key, remote_id);
            CREATE INDEX IF NOT EXISTS idx_notes_listing
                ON notes (account_key, pinned DESC, last_modified_at DESC, local_id);

            CREATE TABLE IF NOT EXISTS attachments (
                local_id TEXT NOT NULL,
                remote_id TEXT,
                account_key TEXT NOT NULL,
                parent_note_id TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                filename TEXT NOT NULL,
                remote_uri TEXT NOT NULL,
                local_cached_uri TEXT,
                mime_type TEXT NOT NULL,
                PRIMARY KEY (local_id, account_key)
            );

            CREATE INDEX IF NOT EXISTS idx_attachments_parent
                ON attachments (account_key, parent_note_id);
            DROP INDEX IF EXISTS idx_attachments_account_remote;
            CREATE UNIQUE INDEX IF NOT EXISTS idx_attachments_note_remote
                ON attachments (account_key, parent_note_id, remote_id);
            "#,
        )?;
        Ok(())
    }

    /// Get the underlying connection (for advanced operations)
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Run `f` inside one transaction. Any error rolls back every write made by `f`.
    ///
    /// Transactions do not nest; `f` must not call `transaction` again.
    pub fn transaction<T, F>(&self, f: F) -> MemoResult<T>
    where
        F: FnOnce(&Database) -> MemoResult<T>,
    {
        let tx = self.conn.unchecked_transaction()?;
        let value = f(self)?;
        tx.commit()?;
        Ok(value)
    }

    // ========================================================================
    // Note operations
    // ========================================================================

    /// Get a note by local ID, with its attachments
    pub fn get_note(&self, account_key: &str, local_id: &str) -> MemoResult<Option<Note>> {
        let query = format!(
            "SELECT {} FROM notes WHERE account_key = ? AND local_id = ?",
            NOTE_COLUMNS
        );
        let note = self
            .conn
            .query_row(&query, params![account_key, local_id], |row| {
                self.row_to_note(row)
            })
            .optional()?;

        match note {
            Some(note) => {
                let attachments = self.get_attachments(account_key, &note.local_id)?;
                Ok(Some(note.with_attachments(attachments)))
            }
            None => Ok(None),
        }
    }

    /// Get a note by its server ID. Attachments are not loaded.
    pub fn get_note_by_remote_id(
        &self,
        account_key: &str,
        remote_id: &str,
    ) -> MemoResult<Option<Note>> {
        let query = format!(
            "SELECT {} FROM notes WHERE account_key = ? AND remote_id = ?",
            NOTE_COLUMNS
        );
        let note = self
            .conn
            .query_row(&query, params![account_key, remote_id], |row| {
                self.row_to_note(row)
            })
            .optional()?;
        Ok(note)
    }

    /// Insert a note or replace every stored field of an existing one.
    ///
    /// The attachment list on `note` is ignored; attachments are stored separately.
    pub fn upsert_note(&self, note: &Note) -> MemoResult<()> {
        let (label, latitude, longitude, zoom) = match &note.location {
            Some(loc) => (
                Some(loc.label.as_str()),
                Some(loc.latitude),
                Some(loc.longitude),
                loc.zoom,
            ),
            None => (None, None, None, None),
        };

        self.conn.execute(
            r#"
            INSERT INTO notes (
                local_id, remote_id, account_key, content, timestamp, visibility,
                pinned, archived, needs_sync, is_deleted, last_modified_at, last_synced_at,
                location_label, location_latitude, location_longitude, location_zoom
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (local_id, account_key) DO UPDATE SET
                remote_id = excluded.remote_id,
                content = excluded.content,
                timestamp = excluded.timestamp,
                visibility = excluded.visibility,
                pinned = excluded.pinned,
                archived = excluded.archived,
                needs_sync = excluded.needs_sync,
                is_deleted = excluded.is_deleted,
                last_modified_at = excluded.last_modified_at,
                last_synced_at = excluded.last_synced_at,
                location_label = excluded.location_label,
                location_latitude = excluded.location_latitude,
                location_longitude = excluded.location_longitude,
                location_zoom = excluded.location_zoom
            "#,
            params![
                note.local_id,
                note.remote_id,
                note.account_key,
                note.content,
                to_millis(&note.timestamp),
                note.visibility.as_str(),
                note.pinned,
                note.archived,
                note.needs_sync,
                note.is_deleted,
                to_millis(&note.last_modified_at),
                note.last_synced_at.as_ref().map(to_millis),
                label,
                latitude,
                longitude,
                zoom,
            ],
        )?;
        Ok(())
    }

    /// Create a note authored on this device
    pub fn create_note(
        &self,
        account_key: &str,
        content: &str,
        visibility: Visibility,
    ) -> MemoResult<Note> {
        validate_note_content(content)?;
        let note = Note::new_local(account_key, content.to_string(), visibility);
        self.upsert_note(&note)?;
        Ok(note)
    }

    /// Load one page of visible notes (not deleted, not archived) in local order.
    pub fn query_notes_page(
        &self,
        account_key: &str,
        filter: &Filter,
        offset: usize,
        limit: usize,
    ) -> MemoResult<Vec<Note>> {
        let mut query = format!(
            "SELECT {} FROM notes WHERE account_key = ? AND is_deleted = 0 AND archived = 0",
            NOTE_COLUMNS
        );
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(account_key.to_string())];

        match filter {
            Filter::None => {}
            Filter::ByTag(tag) => {
                // Coarse match only; tag boundaries are checked on the returned rows
                query.push_str(" AND content LIKE ? ESCAPE '\\'");
                params.push(Box::new(format!("%#{}%", escape_like(tag))));
            }
            Filter::BySearch(text) => {
                if !text.trim().is_empty() {
                    query.push_str(" AND content LIKE ? ESCAPE '\\'");
                    params.push(Box::new(format!("%{}%", escape_like(text))));
                }
            }
        }

        query.push(' ');
        query.push_str(LOCAL_ORDER);
        // Tag pages are cut after the boundary check so offsets count tagged notes only
        if !matches!(filter, Filter::ByTag(_)) {
            query.push_str(" LIMIT ? OFFSET ?");
            params.push(Box::new(limit as i64));
            params.push(Box::new(offset as i64));
        }

        let mut stmt = self.conn.prepare(&query)?;
        let params_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        let notes = stmt
            .query_map(params_refs.as_slice(), |row| self.row_to_note(row))?
            .collect::<Result<Vec<_>, _>>()?;

        let notes = match filter {
            Filter::ByTag(tag) => notes
                .into_iter()
                .filter(|note| extract_tags(&note.content).iter().any(|t| t == tag))
                .skip(offset)
                .take(limit)
                .collect(),
            _ => notes,
        };
        self.with_attachments(notes)
    }

    /// All visible notes of an account in local order, with attachments
    pub fn list_visible_notes(&self, account_key: &str) -> MemoResult<Vec<Note>> {
        let query = format!(
            "SELECT {} FROM notes WHERE account_key = ? AND is_deleted = 0 AND archived = 0 {}",
            NOTE_COLUMNS, LOCAL_ORDER
        );
        let mut stmt = self.conn.prepare(&query)?;
        let notes = stmt
            .query_map([account_key], |row| self.row_to_note(row))?
            .collect::<Result<Vec<_>, _>>()?;
        self.with_attachments(notes)
    }

    /// Pin or unpin a note. Returns the updated note, or None if not found.
    pub fn set_note_pinned(
        &self,
        account_key: &str,
        local_id: &str,
        pinned: bool,
        now: DateTime<Utc>,
    ) -> MemoResult<Option<Note>> {
        let updated = self.conn.execute(
            r#"
            UPDATE notes
            SET pinned = ?, needs_sync = 1, last_modified_at = ?
            WHERE account_key = ? AND local_id = ? AND is_deleted = 0
            "#,
            params![pinned, to_millis(&now), account_key, local_id],
        )?;

        if updated == 0 {
            return Ok(None);
        }
        self.get_note(account_key, local_id)
    }

    /// Edit a note's content and visibility. Returns the updated note, or None if not found.
    pub fn update_note_content(
        &self,
        account_key: &str,
        local_id: &str,
        content: &str,
        visibility: Visibility,
        now: DateTime<Utc>,
    ) -> MemoResult<Option<Note>> {
        validate_note_content(content)?;

        let updated = self.conn.execute(
            r#"
            UPDATE notes
            SET content = ?, visibility = ?, needs_sync = 1, last_modified_at = ?
            WHERE account_key = ? AND local_id = ? AND is_deleted = 0
            "#,
            params![content, visibility.as_str(), to_millis(&now), account_key, local_id],
        )?;

        if updated == 0 {
            return Ok(None);
        }
        self.get_note(account_key, local_id)
    }

    /// Archive a note
    pub fn archive_note(
        &self,
        account_key: &str,
        local_id: &str,
        now: DateTime<Utc>,
    ) -> MemoResult<bool> {
        let updated = self.conn.execute(
            r#"
            UPDATE notes
            SET archived = 1, pinned = 0, needs_sync = 1, last_modified_at = ?
            WHERE account_key = ? AND local_id = ? AND is_deleted = 0
            "#,
            params![to_millis(&now), account_key, local_id],
        )?;
        Ok(updated > 0)
    }

    /// Delete a note.
    ///
    /// A note the server has never seen is removed outright with its
    /// attachments. A synced note is soft-deleted and left pending so the
    /// deletion can be pushed.
    pub fn delete_note(
        &self,
        account_key: &str,
        local_id: &str,
        now: DateTime<Utc>,
    ) -> MemoResult<bool> {
        let note = match self.get_note(account_key, local_id)? {
            Some(note) if !note.is_deleted => note,
            _ => return Ok(false),
        };

        if !note.is_synced() {
            self.purge_note(account_key, local_id)?;
            return Ok(true);
        }

        self.conn.execute(
            r#"
            UPDATE notes
            SET is_deleted = 1, needs_sync = 1, last_modified_at = ?
            WHERE account_key = ? AND local_id = ?
            "#,
            params![to_millis(&now), account_key, local_id],
        )?;
        Ok(true)
    }

    /// Remove a note row and its attachments
    fn purge_note(&self, account_key: &str, local_id: &str) -> MemoResult<()> {
        self.conn.execute(
            "DELETE FROM attachments WHERE account_key = ? AND parent_note_id = ?",
            params![account_key, local_id],
        )?;
        self.conn.execute(
            "DELETE FROM notes WHERE account_key = ? AND local_id = ?",
            params![account_key, local_id],
        )?;
        Ok(())
    }

    /// Delete synced notes (not pending, with a remote ID) whose remote ID is not in `keep`.
    ///
    /// Archived notes are left alone since the server's default listing omits them.
    ///
    /// Returns the number of notes removed.
    pub fn delete_synced_notes_except(
        &self,
        account_key: &str,
        keep: &HashSet<String>,
    ) -> MemoResult<usize> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT local_id, remote_id FROM notes
            WHERE account_key = ? AND remote_id IS NOT NULL AND needs_sync = 0 AND archived = 0
            "#,
        )?;
        let rows: Vec<(String, String)> = stmt
            .query_map([account_key], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut removed = 0;
        for (local_id, remote_id) in rows {
            if !keep.contains(&remote_id) {
                self.purge_note(account_key, &local_id)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Count every stored note of an account, including hidden ones
    pub fn count_notes(&self, account_key: &str) -> MemoResult<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM notes WHERE account_key = ?",
            [account_key],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    // ========================================================================
    // Attachment operations
    // ========================================================================

    /// Get all attachments of a note, oldest first
    pub fn get_attachments(
        &self,
        account_key: &str,
        parent_note_id: &str,
    ) -> MemoResult<Vec<Attachment>> {
        let query = format!(
            "SELECT {} FROM attachments WHERE account_key = ? AND parent_note_id = ? \
             ORDER BY timestamp ASC, local_id ASC",
            ATTACHMENT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&query)?;
        let attachments = stmt
            .query_map(params![account_key, parent_note_id], |row| {
                self.row_to_attachment(row)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(attachments)
    }

    /// Get a specific attachment by local ID
    pub fn get_attachment(
        &self,
        account_key: &str,
        local_id: &str,
    ) -> MemoResult<Option<Attachment>> {
        let query = format!(
            "SELECT {} FROM attachments WHERE account_key = ? AND local_id = ?",
            ATTACHMENT_COLUMNS
        );
        let attachment = self
            .conn
            .query_row(&query, params![account_key, local_id], |row| {
                self.row_to_attachment(row)
            })
            .optional()?;
        Ok(attachment)
    }

    /// Insert an attachment or replace every stored field of an existing one
    pub fn upsert_attachment(&self, attachment: &Attachment) -> MemoResult<()> {
        self.conn.execute(
            r#"
            INSERT INTO attachments (
                local_id, remote_id, account_key, parent_note_id, timestamp,
                filename, remote_uri, local_cached_uri, mime_type
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (local_id, account_key) DO UPDATE SET
                remote_id = excluded.remote_id,
                parent_note_id = excluded.parent_note_id,
                timestamp = excluded.timestamp,
                filename = excluded.filename,
                remote_uri = excluded.remote_uri,
                local_cached_uri = excluded.local_cached_uri,
                mime_type = excluded.mime_type
            "#,
            params![
                attachment.local_id,
                attachment.remote_id,
                attachment.account_key,
                attachment.parent_note_id,
                to_millis(&attachment.timestamp),
                attachment.filename,
                attachment.remote_uri,
                attachment.local_cached_uri,
                attachment.mime_type,
            ],
        )?;
        Ok(())
    }

    /// Delete an attachment record
    pub fn delete_attachment(&self, account_key: &str, local_id: &str) -> MemoResult<bool> {
        let deleted = self.conn.execute(
            "DELETE FROM attachments WHERE account_key = ? AND local_id = ?",
            params![account_key, local_id],
        )?;
        Ok(deleted > 0)
    }

    /// Record where an attachment's file was downloaded to
    pub fn set_attachment_cached_uri(
        &self,
        account_key: &str,
        local_id: &str,
        uri: &str,
    ) -> MemoResult<bool> {
        let updated = self.conn.execute(
            "UPDATE attachments SET local_cached_uri = ? WHERE account_key = ? AND local_id = ?",
            params![uri, account_key, local_id],
        )?;
        Ok(updated > 0)
    }

    /// Make `attachments` the exact attachment set of a note.
    ///
    /// Records missing from the new list are removed. A cached file location
    /// already known for a kept attachment survives when the new record has none.
    pub fn replace_attachments(
        &self,
        account_key: &str,
        parent_note_id: &str,
        attachments: &[Attachment],
    ) -> MemoResult<Vec<Attachment>> {
        let current = self.get_attachments(account_key, parent_note_id)?;
        let keep: HashSet<&str> = attachments.iter().map(|a| a.local_id.as_str()).collect();

        for existing in &current {
            if !keep.contains(existing.local_id.as_str()) {
                self.delete_attachment(account_key, &existing.local_id)?;
            }
        }

        let mut stored = Vec::with_capacity(attachments.len());
        for attachment in attachments {
            let mut record = attachment.clone();
            if record.local_id.is_empty() {
                record.local_id = new_local_id();
            }
            record.account_key = account_key.to_string();
            record.parent_note_id = parent_note_id.to_string();
            if record.local_cached_uri.is_none() {
                record.local_cached_uri = current
                    .iter()
                    .find(|c| c.local_id == record.local_id)
                    .and_then(|c| c.local_cached_uri.clone());
            }
            self.upsert_attachment(&record)?;
            stored.push(record);
        }
        Ok(stored)
    }

    // Helper methods for row conversion

    fn with_attachments(&self, notes: Vec<Note>) -> MemoResult<Vec<Note>> {
        notes
            .into_iter()
            .map(|note| {
                let attachments = self.get_attachments(&note.account_key, &note.local_id)?;
                Ok(note.with_attachments(attachments))
            })
            .collect()
    }

    fn row_to_note(&self, row: &Row) -> rusqlite::Result<Note> {
        let visibility: String = row.get(5)?;
        let last_synced_at: Option<i64> = row.get(11)?;
        let label: Option<String> = row.get(12)?;
        let latitude: Option<f64> = row.get(13)?;
        let longitude: Option<f64> = row.get(14)?;
        let zoom: Option<i32> = row.get(15)?;

        let location = match (label, latitude, longitude) {
            (Some(label), Some(latitude), Some(longitude)) => Some(NoteLocation {
                label,
                latitude,
                longitude,
                zoom,
            }),
            _ => None,
        };

        Ok(Note {
            local_id: row.get(0)?,
            remote_id: row.get(1)?,
            account_key: row.get(2)?,
            content: row.get(3)?,
            timestamp: from_millis(row.get(4)?),
            visibility: Visibility::from_str(&visibility).unwrap_or_default(),
            pinned: row.get(6)?,
            archived: row.get(7)?,
            needs_sync: row.get(8)?,
            is_deleted: row.get(9)?,
            last_modified_at: from_millis(row.get(10)?),
            last_synced_at: last_synced_at.map(from_millis),
            location,
            attachments: Vec::new(),
        })
    }

    fn row_to_attachment(&self, row: &Row) -> rusqlite::Result<Attachment> {
        Ok(Attachment {
            local_id: row.get(0)?,
            remote_id: row.get(1)?,
            account_key: row.get(2)?,
            parent_note_id: row.get(3)?,
            timestamp: from_millis(row.get(4)?),
            filename: row.get(5)?,
            remote_uri: row.get(6)?,
            local_cached_uri: row.get(7)?,
            mime_type: row.get(8)?,
        })
    }
}

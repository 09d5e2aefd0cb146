//! Reconciliation of remote notes into the local cache.
//!
//! The reconciler is the only writer that creates or updates cache entries
//! from server data. Its one conflict rule: a note with unpushed local
//! changes (`needs_sync`) is never overwritten by a fetch. Otherwise the
//! server wins.
//!
//! Attachments are diffed against the server's list: remote records absent
//! from the server are removed, local-only records (no remote ID yet) are
//! left alone, and a downloaded file location is never lost.

use std::collections::HashSet;

use chrono::{DateTime, SubsecRound, Utc};

use crate::database::Database;
use crate::error::MemoResult;
use crate::models::{new_local_id, Attachment, Note, NoteLocation, RemoteAttachment, RemoteNote};

/// Stored timestamps keep millisecond precision; merging must not depend on finer digits.
fn truncate(dt: DateTime<Utc>) -> DateTime<Utc> {
    dt.trunc_subsecs(3)
}

/// Merges remote notes for one account into the entity store
pub struct Reconciler<'a> {
    db: &'a Database,
    account_key: &'a str,
}

impl<'a> Reconciler<'a> {
    pub fn new(db: &'a Database, account_key: &'a str) -> Self {
        Self { db, account_key }
    }

    /// Merge one remote note atomically and return the cache entry with its attachments.
    pub fn merge(&self, remote: &RemoteNote) -> MemoResult<Note> {
        self.db.transaction(|db| self.merge_in(db, remote))
    }

    /// Merge a whole page in a single transaction.
    ///
    /// Either every note is written or none is, so a failed page can be retried as a unit.
    pub fn merge_page(&self, remotes: &[RemoteNote]) -> MemoResult<Vec<Note>> {
        self.db.transaction(|db| {
            remotes
                .iter()
                .map(|remote| self.merge_in(db, remote))
                .collect()
        })
    }

    fn merge_in(&self, db: &Database, remote: &RemoteNote) -> MemoResult<Note> {
        let existing = db.get_note_by_remote_id(self.account_key, &remote.remote_id)?;

        if let Some(existing) = existing {
            if existing.needs_sync {
                tracing::debug!(
                    "Keeping pending local edit of {} over remote {}",
                    existing.local_id,
                    remote.remote_id
                );
                let attachments = db.get_attachments(self.account_key, &existing.local_id)?;
                return Ok(existing.with_attachments(attachments));
            }
            self.write(db, remote, Some(existing))
        } else {
            self.write(db, remote, None)
        }
    }

    fn write(&self, db: &Database, remote: &RemoteNote, existing: Option<Note>) -> MemoResult<Note> {
        let local_id = existing
            .as_ref()
            .map(|n| n.local_id.clone())
            .unwrap_or_else(new_local_id);
        let existing_zoom = existing
            .as_ref()
            .and_then(|n| n.location.as_ref())
            .and_then(|loc| loc.zoom);
        let updated_at = truncate(remote.effective_updated_at());

        let note = Note {
            local_id,
            remote_id: Some(remote.remote_id.clone()),
            account_key: self.account_key.to_string(),
            content: remote.content.clone(),
            timestamp: truncate(remote.created_at),
            visibility: remote.visibility,
            pinned: remote.pinned,
            archived: remote.archived,
            needs_sync: false,
            is_deleted: false,
            last_modified_at: updated_at,
            last_synced_at: Some(updated_at),
            location: remote.location.as_ref().map(|loc| NoteLocation {
                label: loc.label.clone(),
                latitude: loc.latitude,
                longitude: loc.longitude,
                zoom: loc.zoom.or(existing_zoom),
            }),
            attachments: Vec::new(),
        };
        db.upsert_note(&note)?;

        let attachments = self.merge_attachments(db, &note.local_id, &remote.attachments)?;
        Ok(note.with_attachments(attachments))
    }

    fn merge_attachments(
        &self,
        db: &Database,
        note_id: &str,
        remote_attachments: &[RemoteAttachment],
    ) -> MemoResult<Vec<Attachment>> {
        let current = db.get_attachments(self.account_key, note_id)?;
        let remote_ids: HashSet<&str> = remote_attachments
            .iter()
            .map(|a| a.remote_id.as_str())
            .collect();

        for attachment in &current {
            // No remote ID means a pending upload owned by the editor
            if let Some(remote_id) = &attachment.remote_id {
                if !remote_ids.contains(remote_id.as_str()) {
                    db.delete_attachment(self.account_key, &attachment.local_id)?;
                }
            }
        }

        let mut merged = Vec::with_capacity(remote_attachments.len());
        for remote in remote_attachments {
            // Counterparts are matched within this note only; other notes keep their records
            let counterpart = current
                .iter()
                .find(|a| a.remote_id.as_deref() == Some(remote.remote_id.as_str()))
                .cloned();

            let attachment = Attachment {
                local_id: counterpart
                    .as_ref()
                    .map(|a| a.local_id.clone())
                    .unwrap_or_else(new_local_id),
                remote_id: Some(remote.remote_id.clone()),
                account_key: self.account_key.to_string(),
                parent_note_id: note_id.to_string(),
                timestamp: truncate(remote.created_at),
                filename: remote.filename.clone(),
                remote_uri: remote.uri.clone(),
                local_cached_uri: counterpart.and_then(|a| a.local_cached_uri),
                mime_type: remote.mime_type.clone(),
            };
            db.upsert_attachment(&attachment)?;
            merged.push(attachment);
        }

        Ok(merged)
    }
}

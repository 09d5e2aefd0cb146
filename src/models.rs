//! Data models for Memo Core.
//!
//! This module defines the cache entities (Note, Attachment) and the
//! remote representations the reconciler merges into them.
//! Local IDs are UUID7 strings in simple (hyphenless) form. They are minted
//! on this device and never change; remote IDs are assigned by the server.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Mint a new stable local identifier.
pub fn new_local_id() -> String {
    Uuid::now_v7().simple().to_string()
}

/// Who can see a note
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Visibility {
    #[default]
    Private,
    Protected,
    Public,
}

impl Visibility {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "PRIVATE" => Some(Visibility::Private),
            "PROTECTED" => Some(Visibility::Protected),
            "PUBLIC" => Some(Visibility::Public),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Private => "PRIVATE",
            Visibility::Protected => "PROTECTED",
            Visibility::Public => "PUBLIC",
        }
    }
}

/// A place attached to a note. Either the whole location is present or none of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteLocation {
    /// Human-readable place label
    pub label: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Map zoom level, a local display preference
    pub zoom: Option<i32>,
}

/// A note in the local cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    /// Local identifier, stable for the lifetime of the device
    pub local_id: String,
    /// Server identifier (None until first synchronized)
    pub remote_id: Option<String>,
    /// Owning account
    pub account_key: String,
    pub content: String,
    /// Display time of the note
    pub timestamp: DateTime<Utc>,
    pub visibility: Visibility,
    pub pinned: bool,
    pub archived: bool,
    /// Local content differs from the last known remote state
    pub needs_sync: bool,
    /// Soft-deleted locally, deletion not yet pushed
    pub is_deleted: bool,
    pub last_modified_at: DateTime<Utc>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub location: Option<NoteLocation>,
    /// Loaded separately from the store and attached at read time
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl Note {
    /// Create a note authored on this device. It is pending sync from the start.
    pub fn new_local(account_key: &str, content: String, visibility: Visibility) -> Self {
        let now = Utc::now();
        Self {
            local_id: new_local_id(),
            remote_id: None,
            account_key: account_key.to_string(),
            content,
            timestamp: now,
            visibility,
            pinned: false,
            archived: false,
            needs_sync: true,
            is_deleted: false,
            last_modified_at: now,
            last_synced_at: None,
            location: None,
            attachments: Vec::new(),
        }
    }

    /// Check if the note has ever been synchronized
    pub fn is_synced(&self) -> bool {
        self.remote_id.is_some()
    }

    /// Return the note with the given attachment list
    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }
}

/// A file attached to a note.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub local_id: String,
    pub remote_id: Option<String>,
    pub account_key: String,
    /// Local ID of the owning note
    pub parent_note_id: String,
    pub timestamp: DateTime<Utc>,
    pub filename: String,
    pub remote_uri: String,
    /// Downloaded copy on this device. Never supplied by the server.
    pub local_cached_uri: Option<String>,
    pub mime_type: String,
}

/// Location as reported by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteLocation {
    pub label: String,
    pub latitude: f64,
    pub longitude: f64,
    pub zoom: Option<i32>,
}

/// Attachment as reported by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteAttachment {
    pub remote_id: String,
    pub created_at: DateTime<Utc>,
    pub filename: String,
    pub uri: String,
    pub mime_type: String,
}

/// Note as reported by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteNote {
    pub remote_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub visibility: Visibility,
    pub pinned: bool,
    pub archived: bool,
    pub location: Option<RemoteLocation>,
    #[serde(default)]
    pub attachments: Vec<RemoteAttachment>,
}

impl RemoteNote {
    /// Last server-side change, falling back to creation time
    pub fn effective_updated_at(&self) -> DateTime<Utc> {
        self.updated_at.unwrap_or(self.created_at)
    }
}

/// Status of the background full sync
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SyncStatus {
    #[default]
    Idle,
    Syncing,
    Error(String),
}

impl SyncStatus {
    pub fn is_syncing(&self) -> bool {
        matches!(self, SyncStatus::Syncing)
    }
}

/// Number of notes written on one day
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyUsageStat {
    pub date: NaiveDate,
    pub count: u32,
}

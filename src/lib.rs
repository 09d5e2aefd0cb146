//! MemoCore - local-first sync and paging core for a Memos note-taking client.
//!
//! This library provides:
//! - Data models (Note, Attachment, remote representations)
//! - Entity store (SQLite)
//! - Reconciliation of remote notes into the local cache
//! - Paged views backed by the local store or the remote service
//! - A per-account session that drives filtering, full sync and live state
//! - Configuration management
//!
//! The HTTP client for a Memos v1 server lives in `http_gateway`; everything
//! else talks to the server through the `RemoteGateway` trait.
//!
//! # Feature Flags
//!
//! - `desktop`: Include desktop-specific features (hostname detection, config dir detection).

pub mod compat;
pub mod config;
pub mod database;
pub mod error;
pub mod filter;
pub mod full_sync;
pub mod gateway;
pub mod http_gateway;
pub mod models;
pub mod paging;
pub mod reconciler;
pub mod session;
pub mod usage;
pub mod validation;

// Re-export commonly used types
pub use compat::{CompatibilityCheck, SyncCompatibility, VersionGate};
pub use config::{Config, SessionSettings};
pub use database::Database;
pub use error::{MemoError, MemoResult};
pub use filter::Filter;
pub use gateway::{RemoteGateway, RemotePage};
pub use http_gateway::HttpGateway;
pub use models::{Attachment, Note, RemoteNote, SyncStatus, Visibility};
pub use paging::{Page, PagedSource, PagingMode, SharedDatabase};
pub use reconciler::Reconciler;
pub use session::{Account, ManualSyncResult, MemoSession, PagedNotes};

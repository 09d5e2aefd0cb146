//! Interface to the remote note service.
//!
//! The core never talks HTTP directly; it calls a `RemoteGateway`. Page
//! tokens are defined by the server and passed through untouched.

use async_trait::async_trait;

use crate::error::MemoResult;
use crate::models::RemoteNote;

/// Order expression for "most recent first"
pub const REMOTE_ORDER_BY: &str = "display_time desc";

/// One page of remote notes
#[derive(Debug, Clone, Default)]
pub struct RemotePage {
    pub notes: Vec<RemoteNote>,
    /// Token for the next page; None when this is the last page
    pub next_page_token: Option<String>,
}

/// Cursor-paginated access to the remote service
#[async_trait]
pub trait RemoteGateway: Send + Sync {
    /// List one page of notes.
    ///
    /// `filter` is a query expression built by `filter::build_api_filter`
    /// and must be forwarded verbatim.
    async fn list_notes_page(
        &self,
        page_size: usize,
        page_token: Option<&str>,
        filter: Option<&str>,
        order_by: &str,
    ) -> MemoResult<RemotePage>;

    /// Version string reported by the server
    async fn server_version(&self) -> MemoResult<String>;
}

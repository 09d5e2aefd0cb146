//! Paged view source.
//!
//! A page source is built once per (account, filter, fallback) configuration
//! and then asked for pages by cursor. It either reads the local store
//! directly or pulls from the remote service and reconciles each page into
//! the store before returning it. Switching between the two is the session's
//! decision; a source never falls back on its own.

use std::sync::{Arc, Mutex};

use crate::database::Database;
use crate::error::MemoResult;
use crate::filter::{build_api_filter, Filter};
use crate::gateway::{RemoteGateway, REMOTE_ORDER_BY};
use crate::models::Note;
use crate::reconciler::Reconciler;
use crate::validation::{parse_offset_cursor, validate_page_size};

/// Store handle shared between the session, page sources and full sync
pub type SharedDatabase = Arc<Mutex<Database>>;

/// One loaded page and the cursor of the page after it
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub items: Vec<Note>,
    pub next_cursor: Option<String>,
}

/// Where pages come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PagingMode {
    #[default]
    Local,
    Remote,
}

/// Pick the paging mode for a filter.
///
/// The unfiltered list is always served locally since only the local order
/// puts pinned notes first. Filtered lists go to the server when it can
/// filter and the caller has not forced the local fallback.
pub fn select_mode(filter: &Filter, supports_server_filter: bool, offline_fallback: bool) -> PagingMode {
    match filter {
        Filter::None => PagingMode::Local,
        Filter::ByTag(_) | Filter::BySearch(_) if supports_server_filter && !offline_fallback => {
            PagingMode::Remote
        }
        _ => PagingMode::Local,
    }
}

/// Pages straight from the local store using an offset cursor
pub struct LocalPagedSource {
    db: SharedDatabase,
    account_key: String,
    filter: Filter,
}

impl LocalPagedSource {
    pub fn new(db: SharedDatabase, account_key: &str, filter: Filter) -> Self {
        Self {
            db,
            account_key: account_key.to_string(),
            filter,
        }
    }

    pub fn load_page(&self, cursor: Option<&str>, page_size: usize) -> MemoResult<Page> {
        validate_page_size(page_size)?;
        let offset = parse_offset_cursor(cursor)?;

        // One extra row tells whether another page exists
        let mut items = {
            let db = self.db.lock()?;
            db.query_notes_page(&self.account_key, &self.filter, offset, page_size + 1)?
        };

        let next_cursor = if items.len() > page_size {
            items.truncate(page_size);
            Some((offset + page_size).to_string())
        } else {
            None
        };

        tracing::debug!(
            account = %self.account_key,
            offset,
            loaded = items.len(),
            "loaded local page"
        );
        Ok(Page { items, next_cursor })
    }
}

/// Pages from the remote service, reconciled into the store
pub struct RemotePagedSource {
    db: SharedDatabase,
    gateway: Arc<dyn RemoteGateway>,
    account_key: String,
    api_filter: Option<String>,
}

impl RemotePagedSource {
    pub fn new(
        db: SharedDatabase,
        gateway: Arc<dyn RemoteGateway>,
        account_key: &str,
        filter: &Filter,
    ) -> Self {
        Self {
            db,
            gateway,
            account_key: account_key.to_string(),
            api_filter: build_api_filter(filter),
        }
    }

    /// Remote query expression sent with every page request
    pub fn api_filter(&self) -> Option<&str> {
        self.api_filter.as_deref()
    }

    pub async fn load_page(&self, cursor: Option<&str>, page_size: usize) -> MemoResult<Page> {
        validate_page_size(page_size)?;

        let remote = self
            .gateway
            .list_notes_page(page_size, cursor, self.api_filter.as_deref(), REMOTE_ORDER_BY)
            .await?;

        let items = {
            let db = self.db.lock()?;
            Reconciler::new(&db, &self.account_key)
                .merge_page(&remote.notes)
                .inspect_err(|e| tracing::error!("Failed to reconcile remote page: {}", e))?
        };

        tracing::debug!(
            account = %self.account_key,
            loaded = items.len(),
            has_next = remote.next_page_token.is_some(),
            "loaded remote page"
        );
        Ok(Page {
            items,
            next_cursor: remote.next_page_token,
        })
    }
}

/// A page source for one configuration
pub enum PagedSource {
    Local(LocalPagedSource),
    Remote(RemotePagedSource),
}

impl PagedSource {
    pub fn new(
        mode: PagingMode,
        db: SharedDatabase,
        gateway: Arc<dyn RemoteGateway>,
        account_key: &str,
        filter: Filter,
    ) -> Self {
        match mode {
            PagingMode::Local => PagedSource::Local(LocalPagedSource::new(db, account_key, filter)),
            PagingMode::Remote => {
                PagedSource::Remote(RemotePagedSource::new(db, gateway, account_key, &filter))
            }
        }
    }

    pub fn mode(&self) -> PagingMode {
        match self {
            PagedSource::Local(_) => PagingMode::Local,
            PagedSource::Remote(_) => PagingMode::Remote,
        }
    }

    /// Load the page at `cursor`; None is the first page.
    pub async fn load_page(&self, cursor: Option<&str>, page_size: usize) -> MemoResult<Page> {
        match self {
            PagedSource::Local(source) => source.load_page(cursor, page_size),
            PagedSource::Remote(source) => source.load_page(cursor, page_size).await,
        }
    }

    /// Cursor to resume from after the view is reset: always the first page
    pub fn refresh_key(&self) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    use crate::gateway::fake::{remote_note, ScriptedGateway};
    use crate::models::Visibility;

    const ACCOUNT: &str = "memos:https://demo.example";

    fn shared_db() -> SharedDatabase {
        Arc::new(Mutex::new(Database::new_in_memory().unwrap()))
    }

    /// Local note modified `minutes_ago` before a fixed instant
    fn local_note(db: &SharedDatabase, content: &str, minutes_ago: i64, pinned: bool) -> Note {
        let mut note = Note::new_local(ACCOUNT, content.to_string(), Visibility::Private);
        let at = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap() - Duration::minutes(minutes_ago);
        note.timestamp = at;
        note.last_modified_at = at;
        note.pinned = pinned;
        db.lock().unwrap().upsert_note(&note).unwrap();
        note
    }

    async fn collect_all(source: &PagedSource, page_size: usize) -> (Vec<Note>, usize) {
        let mut cursor = source.refresh_key();
        let mut items = Vec::new();
        let mut pages = 0;
        loop {
            let page = source.load_page(cursor.as_deref(), page_size).await.unwrap();
            pages += 1;
            items.extend(page.items);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
            assert!(pages < 100, "paging did not terminate");
        }
        (items, pages)
    }

    #[test]
    fn test_select_mode() {
        let tag = Filter::ByTag("work".to_string());
        let search = Filter::BySearch("milk".to_string());

        assert_eq!(select_mode(&Filter::None, true, false), PagingMode::Local);
        assert_eq!(select_mode(&tag, true, false), PagingMode::Remote);
        assert_eq!(select_mode(&search, true, false), PagingMode::Remote);
        assert_eq!(select_mode(&search, false, false), PagingMode::Local);
        assert_eq!(select_mode(&tag, true, true), PagingMode::Local);
    }

    #[tokio::test]
    async fn test_local_pinned_first_scenario() {
        let db = shared_db();
        let gateway = Arc::new(ScriptedGateway::new(Vec::new()));

        let mut pinned = Vec::new();
        let mut others = Vec::new();
        for i in 0..12 {
            // Pinned notes are the oldest, so only pinning can put them first
            let is_pinned = i >= 10;
            let note = local_note(&db, &format!("note {}", i), i as i64, is_pinned);
            if is_pinned {
                pinned.push(note.local_id);
            } else {
                others.push(note.local_id);
            }
        }

        let source = PagedSource::new(PagingMode::Local, db, gateway.clone(), ACCOUNT, Filter::None);
        let first = source.load_page(None, 10).await.unwrap();
        let first_ids: Vec<&str> = first.items.iter().map(|n| n.local_id.as_str()).collect();

        assert_eq!(first.items.len(), 10);
        assert_eq!(&first_ids[..2], &[pinned[0].as_str(), pinned[1].as_str()]);
        assert_eq!(first_ids[2..].to_vec(), others[..8].iter().map(String::as_str).collect::<Vec<_>>());
        assert!(first.next_cursor.is_some());

        let second = source.load_page(first.next_cursor.as_deref(), 10).await.unwrap();
        assert_eq!(second.items.len(), 2);
        assert_eq!(second.items[0].local_id, others[8]);
        assert_eq!(second.items[1].local_id, others[9]);
        assert!(second.next_cursor.is_none());

        assert!(gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn test_local_cursor_terminates() {
        let db = shared_db();
        for i in 0..25 {
            local_note(&db, &format!("#list item {}", i), i, false);
        }
        let gateway = Arc::new(ScriptedGateway::new(Vec::new()));
        let source = PagedSource::new(
            PagingMode::Local,
            db,
            gateway,
            ACCOUNT,
            Filter::ByTag("list".to_string()),
        );

        let (items, pages) = collect_all(&source, 10).await;
        assert_eq!(items.len(), 25);
        assert_eq!(pages, 3);
    }

    #[tokio::test]
    async fn test_local_exact_multiple_has_no_trailing_cursor() {
        let db = shared_db();
        for i in 0..10 {
            local_note(&db, "x", i, false);
        }
        let gateway = Arc::new(ScriptedGateway::new(Vec::new()));
        let source = PagedSource::new(PagingMode::Local, db, gateway, ACCOUNT, Filter::None);

        let page = source.load_page(None, 10).await.unwrap();
        assert_eq!(page.items.len(), 10);
        assert!(page.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_local_rejects_malformed_cursor() {
        let gateway = Arc::new(ScriptedGateway::new(Vec::new()));
        let source = PagedSource::new(PagingMode::Local, shared_db(), gateway, ACCOUNT, Filter::None);
        assert!(source.load_page(Some("not-a-number"), 10).await.is_err());
    }

    #[tokio::test]
    async fn test_remote_cursor_terminates_and_reconciles() {
        let db = shared_db();
        let remote: Vec<_> = (0..23)
            .map(|i| remote_note(&format!("r{}", i), &format!("#work item {}", i), i))
            .collect();
        let gateway = Arc::new(ScriptedGateway::new(remote));
        let source = PagedSource::new(
            PagingMode::Remote,
            db.clone(),
            gateway.clone(),
            ACCOUNT,
            Filter::ByTag("work".to_string()),
        );

        let (items, pages) = collect_all(&source, 10).await;
        assert_eq!(items.len(), 23);
        assert_eq!(pages, 3);
        assert!(items.iter().all(|n| !n.needs_sync && n.remote_id.is_some()));

        assert_eq!(db.lock().unwrap().count_notes(ACCOUNT).unwrap(), 23);
        assert!(gateway
            .calls()
            .iter()
            .all(|c| c.as_deref() == Some(r#"tag in ["work"]"#)));
    }

    #[tokio::test]
    async fn test_remote_failure_is_surfaced() {
        let db = shared_db();
        local_note(&db, "cached #work", 1, false);
        let gateway = Arc::new(ScriptedGateway::new(vec![remote_note("r1", "#work", 0)]));
        gateway.set_failing(true);

        let source = PagedSource::new(
            PagingMode::Remote,
            db,
            gateway,
            ACCOUNT,
            Filter::ByTag("work".to_string()),
        );
        let err = source.load_page(None, 10).await.unwrap_err();
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_remote_page_keeps_pending_edit() {
        let db = shared_db();
        let gateway = Arc::new(ScriptedGateway::new(vec![remote_note("r1", "server #work", 0)]));
        let source = PagedSource::new(
            PagingMode::Remote,
            db.clone(),
            gateway,
            ACCOUNT,
            Filter::ByTag("work".to_string()),
        );

        let merged = source.load_page(None, 10).await.unwrap().items.remove(0);
        let now = Utc::now();
        db.lock()
            .unwrap()
            .update_note_content(ACCOUNT, &merged.local_id, "edited #work", Visibility::Private, now)
            .unwrap();

        let again = source.load_page(None, 10).await.unwrap().items.remove(0);
        assert_eq!(again.local_id, merged.local_id);
        assert_eq!(again.content, "edited #work");
        assert!(again.needs_sync);
    }
}

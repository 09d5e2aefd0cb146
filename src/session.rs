//! Per-account sync session.
//!
//! A `MemoSession` is created when an account becomes active and shut down
//! when the user switches accounts or logs out. It owns the live state the
//! UI observes (paged notes, tags, sync status, usage histogram, last error)
//! and decides, for the current filter and fallback flag, whether pages come
//! from the local store or from the server.
//!
//! Every paging configuration gets its own epoch and cancellation token.
//! Replacing the configuration cancels the token, and a page that still
//! arrives for an older epoch is dropped instead of being shown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{Local, Utc};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::compat::{CompatibilityCheck, SyncCompatibility};
use crate::config::{AccountConfig, SessionSettings};
use crate::error::{MemoError, MemoResult};
use crate::filter::Filter;
use crate::full_sync::{run_full_sync, FullSyncReport};
use crate::gateway::RemoteGateway;
use crate::models::{Attachment, DailyUsageStat, Note, SyncStatus, Visibility};
use crate::paging::{select_mode, PagedSource, PagingMode, SharedDatabase};
use crate::usage::{daily_usage, tag_list};
use crate::validation::validate_id;

/// The account a session serves
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub key: String,
    pub supports_server_filter: bool,
}

impl From<&AccountConfig> for Account {
    fn from(config: &AccountConfig) -> Self {
        Self {
            key: config.account_key.clone(),
            supports_server_filter: config.supports_server_filter,
        }
    }
}

/// Outcome of a sync requested by the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManualSyncResult {
    Completed(FullSyncReport),
    Blocked(String),
    RequiresConfirmation { version: String, message: String },
    Failed(String),
    /// Another sync was already running, or an automatic sync was not allowed
    Skipped,
}

/// Paged list as observed by the UI
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PagedNotes {
    /// Bumped whenever the list restarts from the first page
    pub epoch: u64,
    /// Bumped by explicit refresh requests
    pub refresh_generation: u64,
    pub filter: Filter,
    pub mode: PagingMode,
    pub items: Vec<Note>,
    pub loading: bool,
    pub end_reached: bool,
    /// Error of the last page load, cleared by the next successful one
    pub error: Option<String>,
}

struct PagingState {
    /// Filter the current source was built for
    filter: Filter,
    /// Fallback flag the current source was built for
    applied_fallback: bool,
    /// Live fallback flag, picked up by the next configuration
    offline_fallback: bool,
    source: Arc<PagedSource>,
    next_cursor: Option<String>,
    token: CancellationToken,
    /// Counts `set_filter` calls so a superseded debounce never applies
    filter_request: u64,
    debounce: Option<JoinHandle<()>>,
    view: PagedNotes,
}

struct PageRequest {
    epoch: u64,
    source: Arc<PagedSource>,
    cursor: Option<String>,
    token: CancellationToken,
}

/// Clears the sync flag when a sync ends, however it ends
struct SyncGuard<'a>(&'a AtomicBool);

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct Inner {
    account: Account,
    db: SharedDatabase,
    gateway: Arc<dyn RemoteGateway>,
    compat: Arc<dyn CompatibilityCheck>,
    settings: SessionSettings,
    runtime: Handle,
    shutdown: CancellationToken,
    syncing: AtomicBool,
    paging: Mutex<PagingState>,
    snapshot: Mutex<Vec<Note>>,
    paged_tx: watch::Sender<PagedNotes>,
    tags_tx: watch::Sender<Vec<String>>,
    status_tx: watch::Sender<SyncStatus>,
    usage_tx: watch::Sender<Vec<DailyUsageStat>>,
    error_tx: watch::Sender<Option<String>>,
}

/// Sync orchestrator for one account
#[derive(Clone)]
pub struct MemoSession {
    inner: Arc<Inner>,
}

impl MemoSession {
    /// Start a session. Must be called from within a tokio runtime.
    ///
    /// Loads the local snapshot and starts loading the first unfiltered page.
    pub fn new(
        account: Account,
        db: SharedDatabase,
        gateway: Arc<dyn RemoteGateway>,
        compat: Arc<dyn CompatibilityCheck>,
        settings: SessionSettings,
    ) -> MemoResult<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| MemoError::Other(format!("a tokio runtime is required: {}", e)))?;
        let shutdown = CancellationToken::new();

        let source = Arc::new(PagedSource::new(
            PagingMode::Local,
            Arc::clone(&db),
            Arc::clone(&gateway),
            &account.key,
            Filter::None,
        ));
        let paging = PagingState {
            filter: Filter::None,
            applied_fallback: false,
            offline_fallback: false,
            source,
            next_cursor: None,
            token: shutdown.child_token(),
            filter_request: 0,
            debounce: None,
            view: PagedNotes::default(),
        };

        let inner = Arc::new(Inner {
            account,
            db,
            gateway,
            compat,
            settings,
            runtime,
            shutdown,
            syncing: AtomicBool::new(false),
            paging: Mutex::new(paging),
            snapshot: Mutex::new(Vec::new()),
            paged_tx: watch::channel(PagedNotes::default()).0,
            tags_tx: watch::channel(Vec::new()).0,
            status_tx: watch::channel(SyncStatus::Idle).0,
            usage_tx: watch::channel(Vec::new()).0,
            error_tx: watch::channel(None).0,
        });

        inner.refresh_local_snapshot()?;
        {
            let mut state = inner.paging.lock()?;
            inner.restart_paging(&mut state);
        }

        tracing::info!(account = %inner.account.key, "Session started");
        Ok(Self { inner })
    }

    pub fn account(&self) -> &Account {
        &self.inner.account
    }

    // ========================================================================
    // Observation
    // ========================================================================

    pub fn paged_notes(&self) -> watch::Receiver<PagedNotes> {
        self.inner.paged_tx.subscribe()
    }

    pub fn tags(&self) -> watch::Receiver<Vec<String>> {
        self.inner.tags_tx.subscribe()
    }

    pub fn sync_status(&self) -> watch::Receiver<SyncStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn usage(&self) -> watch::Receiver<Vec<DailyUsageStat>> {
        self.inner.usage_tx.subscribe()
    }

    pub fn error_message(&self) -> watch::Receiver<Option<String>> {
        self.inner.error_tx.subscribe()
    }

    pub fn clear_error_message(&self) {
        self.inner.error_tx.send_replace(None);
    }

    /// Visible notes held in memory
    pub fn snapshot(&self) -> MemoResult<Vec<Note>> {
        Ok(self.inner.snapshot.lock()?.clone())
    }

    // ========================================================================
    // Paging control
    // ========================================================================

    /// Change the filter.
    ///
    /// Searches wait for a quiet period so typing does not fire a query per
    /// keystroke; tag and unfiltered views apply at once. Either way a
    /// pending search is dropped and the offline fallback is cleared.
    pub fn set_filter(&self, filter: Filter) -> MemoResult<()> {
        filter.validate()?;
        let inner = &self.inner;
        let mut state = inner.paging.lock()?;

        if let Some(pending) = state.debounce.take() {
            pending.abort();
        }
        state.filter_request += 1;
        state.offline_fallback = false;

        if filter.is_search() {
            let task_inner = Arc::clone(inner);
            let delay = inner.settings.search_debounce;
            let request = state.filter_request;
            state.debounce = Some(inner.runtime.spawn(async move {
                tokio::time::sleep(delay).await;
                match task_inner.paging.lock() {
                    Ok(mut state) if state.filter_request == request => {
                        state.debounce = None;
                        task_inner.apply_filter(&mut state, filter);
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!("Paging state unavailable: {}", e),
                }
            }));
        } else {
            inner.apply_filter(&mut state, filter);
        }
        Ok(())
    }

    /// Serve every filter from the local store until the next filter change
    pub fn enable_offline_fallback(&self) -> MemoResult<()> {
        let inner = &self.inner;
        let mut state = inner.paging.lock()?;
        state.offline_fallback = true;
        let filter = state.filter.clone();
        inner.apply_filter(&mut state, filter);
        Ok(())
    }

    /// Restart paging from the first page
    pub fn trigger_paging_refresh(&self) -> MemoResult<()> {
        self.inner.trigger_paging_refresh()
    }

    /// Load the next page of the current configuration.
    ///
    /// Does nothing while a page is loading or after the last page. Errors
    /// are also recorded on the paged view.
    pub async fn load_more(&self) -> MemoResult<()> {
        let request = {
            let mut state = self.inner.paging.lock()?;
            if state.view.loading || state.view.end_reached {
                return Ok(());
            }
            self.inner.begin_load(&mut state)
        };
        self.inner.fetch(request).await
    }

    // ========================================================================
    // Full sync
    // ========================================================================

    /// Reload the snapshot, then optionally run an automatic sync.
    ///
    /// An automatic sync is skipped silently when the server is not allowed;
    /// a failure lands in the error message, never in the return value.
    pub async fn load_memos(&self, sync_after_load: bool) -> MemoResult<()> {
        self.inner.refresh_local_snapshot()?;
        if sync_after_load {
            let result = self.inner.run_sync(true, None).await;
            tracing::debug!(?result, "Automatic sync finished");
        }
        Ok(())
    }

    /// User-initiated sync.
    ///
    /// `allow_higher_version` carries the version string from a previous
    /// `RequiresConfirmation` result once the user accepted it.
    pub async fn refresh_memos(&self, allow_higher_version: Option<&str>) -> ManualSyncResult {
        self.inner.run_sync(false, allow_higher_version).await
    }

    pub fn refresh_local_snapshot(&self) -> MemoResult<()> {
        self.inner.refresh_local_snapshot()
    }

    // ========================================================================
    // Local mutations
    // ========================================================================

    pub fn update_memo_pinned(&self, local_id: &str, pinned: bool) -> MemoResult<Note> {
        validate_id(local_id, "local_id")?;
        let inner = &self.inner;
        let note = inner
            .db
            .lock()?
            .set_note_pinned(&inner.account.key, local_id, pinned, Utc::now())?
            .ok_or_else(|| MemoError::NotFound(format!("note {}", local_id)))?;

        inner.replace_in_snapshot(&note)?;
        inner.trigger_paging_refresh()?;
        Ok(note)
    }

    /// Edit content and visibility. `attachments`, when given, becomes the
    /// note's exact attachment list.
    pub fn edit_memo(
        &self,
        local_id: &str,
        content: &str,
        attachments: Option<Vec<Attachment>>,
        visibility: Visibility,
    ) -> MemoResult<Note> {
        validate_id(local_id, "local_id")?;
        let inner = &self.inner;
        let account_key = inner.account.key.as_str();
        let note = {
            let db = inner.db.lock()?;
            db.transaction(|db| {
                db.update_note_content(account_key, local_id, content, visibility, Utc::now())?
                    .ok_or_else(|| MemoError::NotFound(format!("note {}", local_id)))?;
                if let Some(attachments) = &attachments {
                    db.replace_attachments(account_key, local_id, attachments)?;
                }
                db.get_note(account_key, local_id)?
                    .ok_or_else(|| MemoError::NotFound(format!("note {}", local_id)))
            })?
        };

        inner.replace_in_snapshot(&note)?;
        inner.trigger_paging_refresh()?;
        Ok(note)
    }

    pub fn archive_memo(&self, local_id: &str) -> MemoResult<()> {
        validate_id(local_id, "local_id")?;
        let inner = &self.inner;
        let archived = inner
            .db
            .lock()?
            .archive_note(&inner.account.key, local_id, Utc::now())?;
        if !archived {
            return Err(MemoError::NotFound(format!("note {}", local_id)));
        }

        inner.remove_from_snapshot(local_id)?;
        inner.trigger_paging_refresh()
    }

    /// Delete a note. Unsynced notes are removed, synced ones are marked for deletion.
    pub fn delete_memo(&self, local_id: &str) -> MemoResult<()> {
        validate_id(local_id, "local_id")?;
        let inner = &self.inner;
        let deleted = inner
            .db
            .lock()?
            .delete_note(&inner.account.key, local_id, Utc::now())?;
        if !deleted {
            return Err(MemoError::NotFound(format!("note {}", local_id)));
        }

        inner.remove_from_snapshot(local_id)?;
        inner.trigger_paging_refresh()
    }

    /// Record where an attachment's file was downloaded to
    pub fn cache_attachment_file(&self, attachment_id: &str, uri: &str) -> MemoResult<()> {
        validate_id(attachment_id, "attachment_id")?;
        let inner = &self.inner;
        let updated = inner
            .db
            .lock()?
            .set_attachment_cached_uri(&inner.account.key, attachment_id, uri)?;
        if !updated {
            return Err(MemoError::NotFound(format!("attachment {}", attachment_id)));
        }

        let mut snapshot = inner.snapshot.lock()?;
        for attachment in snapshot
            .iter_mut()
            .flat_map(|n| n.attachments.iter_mut())
            .filter(|a| a.local_id == attachment_id)
        {
            attachment.local_cached_uri = Some(uri.to_string());
        }
        Ok(())
    }

    pub fn get_attachment(&self, attachment_id: &str) -> MemoResult<Option<Attachment>> {
        validate_id(attachment_id, "attachment_id")?;
        self.inner
            .db
            .lock()?
            .get_attachment(&self.inner.account.key, attachment_id)
    }

    /// Cancel pending work. The session must not be used afterwards.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        if let Ok(mut state) = self.inner.paging.lock() {
            if let Some(pending) = state.debounce.take() {
                pending.abort();
            }
        }
        tracing::info!(account = %self.inner.account.key, "Session shut down");
    }
}

impl Inner {
    fn publish(&self, state: &PagingState) {
        self.paged_tx.send_replace(state.view.clone());
    }

    /// Switch to `filter` unless that configuration is already active
    fn apply_filter(self: &Arc<Self>, state: &mut PagingState, filter: Filter) {
        if state.filter == filter && state.applied_fallback == state.offline_fallback {
            return;
        }
        state.filter = filter;
        state.applied_fallback = state.offline_fallback;
        self.restart_paging(state);
    }

    fn trigger_paging_refresh(self: &Arc<Self>) -> MemoResult<()> {
        let mut state = self.paging.lock()?;
        state.view.refresh_generation += 1;
        self.restart_paging(&mut state);
        Ok(())
    }

    /// Drop the current list and start over from the first page
    fn restart_paging(self: &Arc<Self>, state: &mut PagingState) {
        state.token.cancel();
        state.token = self.shutdown.child_token();

        let mode = select_mode(
            &state.filter,
            self.account.supports_server_filter,
            state.applied_fallback,
        );
        let source = PagedSource::new(
            mode,
            Arc::clone(&self.db),
            Arc::clone(&self.gateway),
            &self.account.key,
            state.filter.clone(),
        );
        state.next_cursor = source.refresh_key();
        state.source = Arc::new(source);

        let view = &mut state.view;
        view.epoch += 1;
        view.filter = state.filter.clone();
        view.mode = mode;
        view.items.clear();
        view.end_reached = false;
        view.error = None;

        tracing::info!(
            account = %self.account.key,
            epoch = view.epoch,
            mode = ?mode,
            filter = ?state.filter,
            "Paging configuration changed"
        );

        let request = self.begin_load(state);
        let inner = Arc::clone(self);
        self.runtime.spawn(async move {
            if let Err(e) = inner.fetch(request).await {
                tracing::debug!("First page failed: {}", e);
            }
        });
    }

    /// Mark the view as loading and describe the page to fetch
    fn begin_load(&self, state: &mut PagingState) -> PageRequest {
        state.view.loading = true;
        self.publish(state);
        PageRequest {
            epoch: state.view.epoch,
            source: Arc::clone(&state.source),
            cursor: state.next_cursor.clone(),
            token: state.token.clone(),
        }
    }

    async fn fetch(&self, request: PageRequest) -> MemoResult<()> {
        let result = tokio::select! {
            biased;
            _ = request.token.cancelled() => {
                tracing::debug!(epoch = request.epoch, "Page load cancelled");
                return Ok(());
            }
            result = request.source.load_page(request.cursor.as_deref(), self.settings.page_size) => result,
        };

        let mut state = self.paging.lock()?;
        if state.view.epoch != request.epoch {
            tracing::warn!(
                epoch = request.epoch,
                current = state.view.epoch,
                "Discarding page from a replaced configuration"
            );
            return Ok(());
        }

        state.view.loading = false;
        match result {
            Ok(page) => {
                state.view.items.extend(page.items);
                state.view.end_reached = page.next_cursor.is_none();
                state.view.error = None;
                state.next_cursor = page.next_cursor;
                self.publish(&state);
                Ok(())
            }
            Err(e) => {
                state.view.error = Some(e.to_string());
                self.publish(&state);
                Err(e)
            }
        }
    }

    async fn run_sync(
        self: &Arc<Self>,
        is_automatic: bool,
        allow_higher_version: Option<&str>,
    ) -> ManualSyncResult {
        if self
            .syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::warn!(account = %self.account.key, "Sync already running, skipping");
            return ManualSyncResult::Skipped;
        }
        let _guard = SyncGuard(&self.syncing);

        let allow = if is_automatic { None } else { allow_higher_version };
        match self.compat.check(is_automatic, allow).await {
            SyncCompatibility::Allowed => {}
            other if is_automatic => {
                tracing::debug!(?other, "Automatic sync not allowed");
                return ManualSyncResult::Skipped;
            }
            SyncCompatibility::Blocked { message } => {
                return ManualSyncResult::Blocked(message.unwrap_or_else(|| {
                    "This server version is not supported".to_string()
                }));
            }
            SyncCompatibility::RequiresConfirmation { version, message } => {
                return ManualSyncResult::RequiresConfirmation { version, message };
            }
        }

        self.status_tx.send_replace(SyncStatus::Syncing);
        let synced = run_full_sync(
            &self.db,
            self.gateway.as_ref(),
            &self.account.key,
            self.settings.full_sync,
        )
        .await;

        let result = synced.and_then(|report| {
            self.refresh_local_snapshot()?;
            self.trigger_paging_refresh()?;
            Ok(report)
        });

        match result {
            Ok(report) => {
                if let Some(version) = allow {
                    if let Err(e) = self.compat.remember_accepted_version(version).await {
                        tracing::error!("Failed to remember accepted version {}: {}", version, e);
                    }
                }
                self.status_tx.send_replace(SyncStatus::Idle);
                self.error_tx.send_replace(None);
                ManualSyncResult::Completed(report)
            }
            Err(e) if e.is_access_token_invalid() => {
                // Re-authentication is the account layer's job
                self.status_tx.send_replace(SyncStatus::Idle);
                ManualSyncResult::Failed(e.to_string())
            }
            Err(e) => {
                tracing::error!(account = %self.account.key, "Sync failed: {}", e);
                let message = e.to_string();
                self.status_tx.send_replace(SyncStatus::Error(message.clone()));
                self.error_tx.send_replace(Some(message.clone()));
                ManualSyncResult::Failed(message)
            }
        }
    }

    fn refresh_local_snapshot(&self) -> MemoResult<()> {
        let notes = self.db.lock()?.list_visible_notes(&self.account.key)?;
        let mut snapshot = self.snapshot.lock()?;
        *snapshot = notes;
        self.publish_aggregates(&snapshot);
        Ok(())
    }

    fn replace_in_snapshot(&self, note: &Note) -> MemoResult<()> {
        let mut snapshot = self.snapshot.lock()?;
        if let Some(existing) = snapshot.iter_mut().find(|n| n.local_id == note.local_id) {
            *existing = note.clone();
        }
        self.publish_aggregates(&snapshot);
        Ok(())
    }

    fn remove_from_snapshot(&self, local_id: &str) -> MemoResult<()> {
        let mut snapshot = self.snapshot.lock()?;
        snapshot.retain(|n| n.local_id != local_id);
        self.publish_aggregates(&snapshot);
        Ok(())
    }

    fn publish_aggregates(&self, notes: &[Note]) {
        let today = Local::now().date_naive();
        self.tags_tx.send_replace(tag_list(notes));
        self.usage_tx
            .send_replace(daily_usage(notes, today, self.settings.usage_window_days));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::compat::VersionGate;
    use crate::database::Database;
    use crate::gateway::fake::{remote_attachment, remote_note, ScriptedGateway};

    const ACCOUNT: &str = "memos:https://demo.example";

    struct Fixture {
        session: MemoSession,
        gateway: Arc<ScriptedGateway>,
        db: SharedDatabase,
    }

    fn fixture_with(notes: Vec<crate::models::RemoteNote>, supports_server_filter: bool) -> Fixture {
        let db: SharedDatabase = Arc::new(Mutex::new(Database::new_in_memory().unwrap()));
        let gateway = Arc::new(ScriptedGateway::new(notes));
        let compat = Arc::new(VersionGate::with_defaults(gateway.clone()).unwrap());
        let session = MemoSession::new(
            Account {
                key: ACCOUNT.to_string(),
                supports_server_filter,
            },
            Arc::clone(&db),
            gateway.clone(),
            compat,
            SessionSettings::default(),
        )
        .unwrap();
        Fixture {
            session,
            gateway,
            db,
        }
    }

    fn fixture(notes: Vec<crate::models::RemoteNote>) -> Fixture {
        fixture_with(notes, true)
    }

    /// Wait until the view of `epoch` has finished loading
    async fn settled(session: &MemoSession, epoch: u64) -> PagedNotes {
        let mut rx = session.paged_notes();
        let view = rx
            .wait_for(|v| v.epoch == epoch && !v.loading)
            .await
            .unwrap();
        view.clone()
    }

    fn current_epoch(session: &MemoSession) -> u64 {
        session.paged_notes().borrow().epoch
    }

    #[tokio::test]
    async fn test_initial_view_is_local_unfiltered() {
        let f = fixture(Vec::new());
        f.db
            .lock()
            .unwrap()
            .create_note(ACCOUNT, "hello", Visibility::Private)
            .unwrap();
        f.session.trigger_paging_refresh().unwrap();

        let view = settled(&f.session, current_epoch(&f.session)).await;
        assert_eq!(view.mode, PagingMode::Local);
        assert_eq!(view.filter, Filter::None);
        assert_eq!(view.items.len(), 1);
        assert!(view.end_reached);
        assert!(f.gateway.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_filter_switch_discards_late_page() {
        let f = fixture(vec![
            remote_note("ra", "first #a", 2),
            remote_note("rb", "second #b", 1),
        ]);
        f.gateway
            .delay_matching(r#"["a"]"#, Duration::from_secs(5));

        f.session.set_filter(Filter::ByTag("a".to_string())).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(f.session.paged_notes().borrow().loading);

        f.session.set_filter(Filter::ByTag("b".to_string())).unwrap();
        let view = settled(&f.session, current_epoch(&f.session)).await;

        // Let the slow request run out; its page must never show up
        tokio::time::sleep(Duration::from_secs(10)).await;
        let view_after = f.session.paged_notes().borrow().clone();

        assert_eq!(view.filter, Filter::ByTag("b".to_string()));
        assert_eq!(view_after, view);
        assert_eq!(view.items.len(), 1);
        assert_eq!(view.items[0].remote_id.as_deref(), Some("rb"));
        assert!(f
            .db
            .lock()
            .unwrap()
            .get_note_by_remote_id(ACCOUNT, "ra")
            .unwrap()
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_search_is_debounced() {
        let f = fixture(vec![remote_note("r1", "buy milk q4", 1)]);
        let start = settled(&f.session, current_epoch(&f.session)).await.epoch;

        for i in 0..5 {
            f.session
                .set_filter(Filter::BySearch(format!("q{}", i)))
                .unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(current_epoch(&f.session), start);

        tokio::time::sleep(Duration::from_millis(400)).await;
        let view = settled(&f.session, start + 1).await;

        assert_eq!(view.filter, Filter::BySearch("q4".to_string()));
        assert_eq!(view.mode, PagingMode::Remote);
        assert_eq!(view.items.len(), 1);
        assert_eq!(
            f.gateway.calls(),
            vec![Some(r#"content.contains("q4")"#.to_string())]
        );
    }

    #[tokio::test]
    async fn test_tag_filter_applies_immediately() {
        let f = fixture(Vec::new());
        let start = current_epoch(&f.session);

        f.session.set_filter(Filter::ByTag("work".to_string())).unwrap();
        assert_eq!(current_epoch(&f.session), start + 1);

        // Same configuration again is not a change
        f.session.set_filter(Filter::ByTag("work".to_string())).unwrap();
        assert_eq!(current_epoch(&f.session), start + 1);
    }

    #[tokio::test]
    async fn test_offline_fallback_until_next_filter_change() {
        let f = fixture(Vec::new());
        f.session.set_filter(Filter::ByTag("work".to_string())).unwrap();
        assert_eq!(f.session.paged_notes().borrow().mode, PagingMode::Remote);

        f.session.enable_offline_fallback().unwrap();
        assert_eq!(f.session.paged_notes().borrow().mode, PagingMode::Local);

        f.session.set_filter(Filter::ByTag("home".to_string())).unwrap();
        assert_eq!(f.session.paged_notes().borrow().mode, PagingMode::Remote);
    }

    #[tokio::test]
    async fn test_filters_stay_local_without_server_support() {
        let f = fixture_with(vec![remote_note("r1", "#work", 1)], false);
        f.session.set_filter(Filter::ByTag("work".to_string())).unwrap();

        let view = settled(&f.session, current_epoch(&f.session)).await;
        assert_eq!(view.mode, PagingMode::Local);
        assert!(f.gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn test_load_more_pages_to_the_end() {
        let f = fixture(Vec::new());
        {
            let db = f.db.lock().unwrap();
            for i in 0..23 {
                db.create_note(ACCOUNT, &format!("note {}", i), Visibility::Private)
                    .unwrap();
            }
        }
        f.session.trigger_paging_refresh().unwrap();
        let epoch = current_epoch(&f.session);
        settled(&f.session, epoch).await;

        f.session.load_more().await.unwrap();
        f.session.load_more().await.unwrap();
        let view = f.session.paged_notes().borrow().clone();
        assert_eq!(view.items.len(), 23);
        assert!(view.end_reached);

        // Past the end nothing happens
        f.session.load_more().await.unwrap();
        assert_eq!(f.session.paged_notes().borrow().items.len(), 23);
    }

    #[tokio::test]
    async fn test_page_error_is_scoped_to_view() {
        let f = fixture(Vec::new());
        f.gateway.set_failing(true);
        f.session.set_filter(Filter::ByTag("work".to_string())).unwrap();

        let view = settled(&f.session, current_epoch(&f.session)).await;
        assert!(view.error.is_some());
        assert!(f.session.error_message().borrow().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_sync_is_skipped() {
        let f = fixture(vec![remote_note("r1", "one", 1)]);
        f.gateway.delay_matching("", Duration::from_secs(1));

        let first = {
            let session = f.session.clone();
            tokio::spawn(async move { session.refresh_memos(None).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(f.session.sync_status().borrow().is_syncing());

        assert_eq!(f.session.refresh_memos(None).await, ManualSyncResult::Skipped);
        assert!(matches!(
            first.await.unwrap(),
            ManualSyncResult::Completed(_)
        ));
        assert_eq!(*f.session.sync_status().borrow(), SyncStatus::Idle);
    }

    #[tokio::test]
    async fn test_sync_updates_snapshot_tags_and_usage() {
        let f = fixture(vec![
            remote_note("r1", "#work standup", 1),
            remote_note("r2", "#home #work chores", 2),
        ]);

        let result = f.session.refresh_memos(None).await;
        assert!(matches!(result, ManualSyncResult::Completed(ref r) if r.merged == 2));

        assert_eq!(f.session.snapshot().unwrap().len(), 2);
        assert_eq!(*f.session.tags().borrow(), vec!["home", "work"]);
        assert_eq!(f.session.usage().borrow().len(), 84);
        assert_eq!(f.session.paged_notes().borrow().refresh_generation, 1);
    }

    #[tokio::test]
    async fn test_untested_server_needs_confirmation() {
        let f = fixture(vec![remote_note("r1", "one", 1)]);
        f.gateway.set_version("0.99.0");

        match f.session.refresh_memos(None).await {
            ManualSyncResult::RequiresConfirmation { version, .. } => assert_eq!(version, "0.99.0"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(f.gateway.calls().is_empty());

        // Automatic sync stays silent until the user accepts
        f.session.load_memos(true).await.unwrap();
        assert!(f.gateway.calls().is_empty());
        assert!(f.session.error_message().borrow().is_none());

        let result = f.session.refresh_memos(Some("0.99.0")).await;
        assert!(matches!(result, ManualSyncResult::Completed(_)));

        let calls_before = f.gateway.calls().len();
        f.session.load_memos(true).await.unwrap();
        assert!(f.gateway.calls().len() > calls_before);
    }

    #[tokio::test]
    async fn test_old_server_is_blocked() {
        let f = fixture(Vec::new());
        f.gateway.set_version("0.12.0");

        let result = f.session.refresh_memos(None).await;
        assert!(matches!(result, ManualSyncResult::Blocked(_)));
        assert_eq!(*f.session.sync_status().borrow(), SyncStatus::Idle);
    }

    #[tokio::test]
    async fn test_sync_failure_is_surfaced_once() {
        let f = fixture(vec![remote_note("r1", "one", 1)]);
        f.gateway.set_failing(true);

        let result = f.session.refresh_memos(None).await;
        assert!(matches!(result, ManualSyncResult::Failed(_)));
        assert!(matches!(*f.session.sync_status().borrow(), SyncStatus::Error(_)));
        assert!(f.session.error_message().borrow().is_some());

        f.gateway.set_failing(false);
        f.session.refresh_memos(None).await;
        assert!(f.session.error_message().borrow().is_none());
    }

    #[tokio::test]
    async fn test_revoked_token_is_left_to_account_layer() {
        let f = fixture(vec![remote_note("r1", "one", 1)]);
        f.gateway.set_unauthorized(true);

        match f.session.refresh_memos(None).await {
            ManualSyncResult::Failed(message) => {
                assert_eq!(message, MemoError::AccessTokenInvalid.to_string())
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(*f.session.sync_status().borrow(), SyncStatus::Idle);
        assert!(f.session.error_message().borrow().is_none());

        let calls_before = f.gateway.calls().len();
        f.session.load_memos(true).await.unwrap();
        assert!(f.gateway.calls().len() > calls_before);
        assert_eq!(*f.session.sync_status().borrow(), SyncStatus::Idle);
        assert!(f.session.error_message().borrow().is_none());
        assert!(f.session.snapshot().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sync_never_clobbers_pending_edit() {
        let f = fixture(vec![remote_note("r1", "server text", 1)]);
        f.session.refresh_memos(None).await;
        let local_id = f.session.snapshot().unwrap()[0].local_id.clone();

        f.session
            .edit_memo(&local_id, "my edit", None, Visibility::Private)
            .unwrap();
        f.gateway
            .set_notes(vec![remote_note("r1", "newer server text", 5)]);
        f.session.refresh_memos(None).await;

        let note = f.session.snapshot().unwrap().remove(0);
        assert_eq!(note.content, "my edit");
        assert!(note.needs_sync);
    }

    #[tokio::test]
    async fn test_mutations_update_snapshot_and_refresh_paging() {
        let f = fixture(Vec::new());
        let (a, b) = {
            let db = f.db.lock().unwrap();
            (
                db.create_note(ACCOUNT, "#keep a", Visibility::Private).unwrap(),
                db.create_note(ACCOUNT, "#gone b", Visibility::Private).unwrap(),
            )
        };
        f.session.refresh_local_snapshot().unwrap();
        let generation = f.session.paged_notes().borrow().refresh_generation;

        let pinned = f.session.update_memo_pinned(&a.local_id, true).unwrap();
        assert!(pinned.pinned);
        assert!(f.session.snapshot().unwrap().iter().any(|n| n.pinned));
        assert_eq!(
            f.session.paged_notes().borrow().refresh_generation,
            generation + 1
        );

        f.session.archive_memo(&b.local_id).unwrap();
        assert_eq!(f.session.snapshot().unwrap().len(), 1);
        assert_eq!(*f.session.tags().borrow(), vec!["keep"]);

        f.session.delete_memo(&a.local_id).unwrap();
        assert!(f.session.snapshot().unwrap().is_empty());
        assert_eq!(f.db.lock().unwrap().count_notes(ACCOUNT).unwrap(), 1);

        let err = f.session.delete_memo("missing").unwrap_err();
        assert!(matches!(err, MemoError::NotFound(_)));
        let err = f.session.update_memo_pinned(" ", true).unwrap_err();
        assert!(matches!(err, MemoError::Validation { .. }));
        assert!(f.session.get_attachment("").is_err());
    }

    #[tokio::test]
    async fn test_failed_mutation_leaves_snapshot_unchanged() {
        let f = fixture(Vec::new());
        let note = f
            .db
            .lock()
            .unwrap()
            .create_note(ACCOUNT, "original", Visibility::Private)
            .unwrap();
        f.session.refresh_local_snapshot().unwrap();

        let too_long = "x".repeat(crate::validation::MAX_NOTE_CONTENT_LENGTH + 1);
        assert!(f
            .session
            .edit_memo(&note.local_id, &too_long, None, Visibility::Private)
            .is_err());
        assert_eq!(f.session.snapshot().unwrap()[0].content, "original");
    }

    #[tokio::test]
    async fn test_edit_memo_replaces_attachments() {
        let mut remote = remote_note("r1", "with files", 1);
        remote.attachments = vec![remote_attachment("a1"), remote_attachment("a2")];
        let f = fixture(vec![remote]);
        f.session.refresh_memos(None).await;

        let note = f.session.snapshot().unwrap().remove(0);
        let keep = note.attachments[0].clone();
        let edited = f
            .session
            .edit_memo(&note.local_id, "one file left", Some(vec![keep.clone()]), Visibility::Public)
            .unwrap();

        assert_eq!(edited.attachments.len(), 1);
        assert_eq!(edited.attachments[0].local_id, keep.local_id);
        assert_eq!(edited.visibility, Visibility::Public);
    }

    #[tokio::test]
    async fn test_cached_attachment_file_survives_sync() {
        let mut remote = remote_note("r1", "photo", 1);
        remote.attachments = vec![remote_attachment("a1")];
        let f = fixture(vec![remote]);
        f.session.refresh_memos(None).await;

        let attachment_id = f.session.snapshot().unwrap()[0].attachments[0].local_id.clone();
        f.session
            .cache_attachment_file(&attachment_id, "file:///cache/a1.png")
            .unwrap();
        f.session.refresh_memos(None).await;

        let attachment = f.session.get_attachment(&attachment_id).unwrap().unwrap();
        assert_eq!(attachment.local_cached_uri.as_deref(), Some("file:///cache/a1.png"));
        assert!(f.session.cache_attachment_file("missing", "x").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_pending_search() {
        let f = fixture(Vec::new());
        let start = current_epoch(&f.session);

        f.session
            .set_filter(Filter::BySearch("never".to_string()))
            .unwrap();
        f.session.shutdown();
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(current_epoch(&f.session), start);
    }
}

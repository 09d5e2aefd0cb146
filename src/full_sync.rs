//! Background full sync.
//!
//! Walks every remote page with no filter and reconciles each page through
//! the same `Reconciler` that page loads use, so pending local edits are
//! protected here too. When the whole remote set was seen, synced notes the
//! server no longer has are pruned.

use std::collections::HashSet;

use crate::error::MemoResult;
use crate::gateway::{RemoteGateway, REMOTE_ORDER_BY};
use crate::paging::SharedDatabase;
use crate::reconciler::Reconciler;

/// Limits for one full sync run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FullSyncOptions {
    pub page_size: usize,
    /// Stop after this many pages; a truncated run never prunes
    pub max_pages: usize,
}

impl Default for FullSyncOptions {
    fn default() -> Self {
        Self {
            page_size: 200,
            max_pages: 50,
        }
    }
}

/// What a full sync did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FullSyncReport {
    pub pages: usize,
    pub merged: usize,
    pub pruned: usize,
    /// True if the last remote page was reached
    pub complete: bool,
}

/// Fetch and reconcile the remote note set for one account.
///
/// A failing page aborts the run. Pages merged before it stay merged since
/// each page is its own transaction.
pub async fn run_full_sync(
    db: &SharedDatabase,
    gateway: &dyn RemoteGateway,
    account_key: &str,
    options: FullSyncOptions,
) -> MemoResult<FullSyncReport> {
    tracing::info!(account = %account_key, "Starting full sync");

    let mut report = FullSyncReport::default();
    let mut seen: HashSet<String> = HashSet::new();
    let mut token: Option<String> = None;

    while report.pages < options.max_pages {
        let page = gateway
            .list_notes_page(options.page_size, token.as_deref(), None, REMOTE_ORDER_BY)
            .await?;
        report.pages += 1;

        {
            let db = db.lock()?;
            let merged = Reconciler::new(&db, account_key).merge_page(&page.notes)?;
            report.merged += merged.len();
        }
        seen.extend(page.notes.into_iter().map(|n| n.remote_id));

        match page.next_page_token {
            Some(next) => token = Some(next),
            None => {
                report.complete = true;
                break;
            }
        }
    }

    if report.complete {
        let db = db.lock()?;
        report.pruned = db.transaction(|db| db.delete_synced_notes_except(account_key, &seen))?;
    } else {
        tracing::warn!(
            account = %account_key,
            pages = report.pages,
            "Full sync stopped at the page limit, skipping prune"
        );
    }

    tracing::info!(
        account = %account_key,
        merged = report.merged,
        pruned = report.pruned,
        "Full sync finished"
    );
    Ok(report)
}

//! Input validation for Memo Core.
//!
//! This module provides validation functions for all user inputs.
//! All validators return MemoError::Validation on failure.

use crate::error::{MemoError, MemoResult};

pub const MAX_TAG_LENGTH: usize = 100;
pub const MAX_NOTE_CONTENT_LENGTH: usize = 100_000; // 100KB of text
pub const MAX_SEARCH_QUERY_LENGTH: usize = 500;
pub const MAX_PAGE_SIZE: usize = 1000;
pub const MAX_ID_LENGTH: usize = 128;

/// Validate note content.
///
/// Content may be empty (a note may consist only of attachments) but must
/// stay within MAX_NOTE_CONTENT_LENGTH bytes.
pub fn validate_note_content(content: &str) -> MemoResult<()> {
    if content.len() > MAX_NOTE_CONTENT_LENGTH {
        return Err(MemoError::validation(
            "content",
            format!(
                "cannot exceed {} bytes (got {})",
                MAX_NOTE_CONTENT_LENGTH,
                content.len()
            ),
        ));
    }
    Ok(())
}

/// Validate a tag used as a filter.
pub fn validate_tag(tag: &str) -> MemoResult<()> {
    let stripped = tag.trim();

    if stripped.is_empty() {
        return Err(MemoError::validation("tag", "cannot be empty or whitespace only"));
    }

    if stripped.chars().count() > MAX_TAG_LENGTH {
        return Err(MemoError::validation(
            "tag",
            format!("cannot exceed {} characters", MAX_TAG_LENGTH),
        ));
    }

    Ok(())
}

/// Validate a free-text search query.
pub fn validate_search_query(query: &str) -> MemoResult<()> {
    if query.chars().count() > MAX_SEARCH_QUERY_LENGTH {
        return Err(MemoError::validation(
            "search_query",
            format!("cannot exceed {} characters", MAX_SEARCH_QUERY_LENGTH),
        ));
    }
    Ok(())
}

/// Validate a requested page size.
pub fn validate_page_size(page_size: usize) -> MemoResult<()> {
    if page_size == 0 || page_size > MAX_PAGE_SIZE {
        return Err(MemoError::validation(
            "page_size",
            format!("must be between 1 and {}, got {}", MAX_PAGE_SIZE, page_size),
        ));
    }
    Ok(())
}

/// Validate an identifier (local ID, remote ID, account key).
pub fn validate_id(value: &str, field_name: &str) -> MemoResult<()> {
    if value.trim().is_empty() {
        return Err(MemoError::validation(field_name, "cannot be empty"));
    }
    if value.len() > MAX_ID_LENGTH {
        return Err(MemoError::validation(
            field_name,
            format!("cannot exceed {} bytes", MAX_ID_LENGTH),
        ));
    }
    Ok(())
}

/// Parse a local-paging cursor into a row offset.
///
/// Local cursors are produced by the local paged source only; anything else
/// is a caller bug and is rejected rather than treated as the first page.
pub fn parse_offset_cursor(cursor: Option<&str>) -> MemoResult<usize> {
    match cursor {
        None => Ok(0),
        Some(value) => value.parse::<usize>().map_err(|_| {
            MemoError::validation("cursor", format!("not a local page cursor: {:?}", value))
        }),
    }
}

//! Note filters for Memo Core.
//!
//! A filter selects which notes a page draws from. The same filter is
//! expressed two ways: as a query expression for the remote service and as
//! a predicate over the local store. Tags are `#word` tokens inside note
//! content.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::MemoResult;
use crate::validation::{validate_search_query, validate_tag};

/// Which subset of notes a view shows.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Filter {
    #[default]
    None,
    ByTag(String),
    BySearch(String),
}

impl Filter {
    /// Typed input streams (search) are debounced; explicit choices are not.
    pub fn is_search(&self) -> bool {
        matches!(self, Filter::BySearch(_))
    }

    /// Check the user-supplied text carried by this filter.
    pub fn validate(&self) -> MemoResult<()> {
        match self {
            Filter::None => Ok(()),
            Filter::ByTag(tag) => validate_tag(tag),
            Filter::BySearch(query) => validate_search_query(query),
        }
    }
}

/// Escape backslashes and double quotes for embedding in a remote filter string.
pub fn escape_filter_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Build the remote query expression for a filter.
///
/// Returns None for `Filter::None`, which sends no filter at all.
pub fn build_api_filter(filter: &Filter) -> Option<String> {
    match filter {
        Filter::None => None,
        Filter::ByTag(tag) => Some(format!("tag in [\"{}\"]", escape_filter_value(tag))),
        Filter::BySearch(query) => Some(format!(
            "content.contains(\"{}\")",
            escape_filter_value(query)
        )),
    }
}

/// Escape `%`, `_` and `\` for a SQL LIKE pattern using `ESCAPE '\'`.
pub fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn is_tag_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | '/')
}

/// Extract `#tag` tokens from note content.
///
/// A tag starts with `#` at the beginning of the text or after whitespace,
/// so markdown headings (`# Title`) and anchors inside words are ignored.
pub fn extract_tags(content: &str) -> Vec<String> {
    let mut tags = Vec::new();
    let mut prev: Option<char> = None;
    let mut chars = content.chars().peekable();

    while let Some(c) = chars.next() {
        let at_boundary = prev.map_or(true, char::is_whitespace);
        if c == '#' && at_boundary {
            let mut tag = String::new();
            while let Some(&next) = chars.peek() {
                if !is_tag_char(next) {
                    break;
                }
                tag.push(next);
                chars.next();
            }
            let tag = tag.trim_end_matches('/');
            if !tag.is_empty() {
                tags.push(tag.to_string());
            }
            prev = Some('#');
            continue;
        }
        prev = Some(c);
    }

    tags
}

/// Sorted, de-duplicated tag list across many notes.
pub fn aggregate_tags<'a, I>(contents: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut set = BTreeSet::new();
    for content in contents {
        set.extend(extract_tags(content));
    }
    set.into_iter().collect()
}

//! Aggregates computed from the in-memory snapshot of visible notes.

use std::collections::HashMap;

use chrono::{Duration, Local, NaiveDate};

use crate::filter::aggregate_tags;
use crate::models::{DailyUsageStat, Note};

/// Sorted unique tags across notes
pub fn tag_list(notes: &[Note]) -> Vec<String> {
    aggregate_tags(notes.iter().map(|n| n.content.as_str()))
}

/// Per-day note counts for the `window_days` days ending at `today`, oldest first.
///
/// Notes are bucketed by their display time in the local time zone. Days
/// without notes are present with a zero count.
pub fn daily_usage(notes: &[Note], today: NaiveDate, window_days: u32) -> Vec<DailyUsageStat> {
    let mut counts: HashMap<NaiveDate, u32> = HashMap::new();
    for note in notes {
        let date = note.timestamp.with_timezone(&Local).date_naive();
        *counts.entry(date).or_default() += 1;
    }

    (0..window_days)
        .rev()
        .map(|days_back| {
            let date = today - Duration::days(i64::from(days_back));
            DailyUsageStat {
                date,
                count: counts.get(&date).copied().unwrap_or(0),
            }
        })
        .collect()
}

//! Composable in-memory record predicates. Evaluation walks the full set on
//! every call; grouping and counts are computed on demand. That is the
//! documented scalability boundary: fine for a few thousand records, no
//! caching layer behind it.

use std::collections::BTreeMap;

use chrono::NaiveDate;

use crate::models::{Record, RecordStatus};

#[derive(Debug, Clone)]
pub enum Filter {
    All,
    Status(RecordStatus),
    /// Any of the given statuses.
    StatusIn(Vec<RecordStatus>),
    /// Record carries this tag.
    Tag(String),
    /// Record carries at least one of these tags.
    AnyTag(Vec<String>),
    TitleContains(String),
    DueOnOrBefore(NaiveDate),
    DueOnOrAfter(NaiveDate),
    DueBetween(NaiveDate, NaiveDate),
    EstimateAtMost(f64),
    Pinned(bool),
    Archived(bool),
    /// Record has a position in the named view.
    PlacedIn(String),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Self::All => true,
            Self::Status(status) => record.status == *status,
            Self::StatusIn(statuses) => statuses.contains(&record.status),
            Self::Tag(tag) => record.tags.iter().any(|candidate| candidate == tag),
            Self::AnyTag(tags) => tags
                .iter()
                .any(|tag| record.tags.iter().any(|candidate| candidate == tag)),
            Self::TitleContains(needle) => record
                .title
                .to_ascii_lowercase()
                .contains(&needle.to_ascii_lowercase()),
            Self::DueOnOrBefore(date) => record.due.is_some_and(|due| due <= *date),
            Self::DueOnOrAfter(date) => record.due.is_some_and(|due| due >= *date),
            Self::DueBetween(from, to) => record.due.is_some_and(|due| due >= *from && due <= *to),
            Self::EstimateAtMost(limit) => record.estimate.is_some_and(|value| value <= *limit),
            Self::Pinned(expected) => record.pinned == *expected,
            Self::Archived(expected) => record.is_archived() == *expected,
            Self::PlacedIn(view) => record.positions.contains_key(view),
            Self::And(filters) => filters.iter().all(|filter| filter.matches(record)),
            Self::Or(filters) => filters.iter().any(|filter| filter.matches(record)),
            Self::Not(filter) => !filter.matches(record),
        }
    }
}

/// Status histogram for a slice of records, computed fresh each call.
pub fn count_by_status<'a>(
    records: impl IntoIterator<Item = &'a Record>,
) -> BTreeMap<&'static str, usize> {
    let mut counts = BTreeMap::new();
    for record in records {
        *counts.entry(record.status.as_str()).or_insert(0) += 1;
    }
    counts
}

/// Tag histogram, on demand like [`count_by_status`].
pub fn count_by_tag<'a>(records: impl IntoIterator<Item = &'a Record>) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for record in records {
        for tag in &record.tags {
            *counts.entry(tag.clone()).or_insert(0) += 1;
        }
    }
    counts
}

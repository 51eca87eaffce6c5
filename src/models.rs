use std::collections::BTreeMap;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Wall-clock source for record timestamps. Injected so tests control time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordKind {
    Task,
    Board,
}

impl RecordKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Board => "board",
        }
    }

    /// Directory partition under the workspace root.
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Task => "tasks",
            Self::Board => "boards",
        }
    }

    pub fn all() -> [RecordKind; 2] {
        [Self::Task, Self::Board]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RecordStatus {
    #[default]
    Open,
    InProgress,
    Closed,
}

impl RecordStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in-progress",
            Self::Closed => "closed",
        }
    }
}

/// 2-D placement of a record inside a named view (board column, canvas, ...).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// Canonical millisecond-precision UTC timestamps. One textual form so
/// encode/decode round-trips are byte-stable.
pub mod ts_millis {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub const FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }

    pub fn parse(raw: &str) -> Result<DateTime<Utc>, String> {
        // Accept the canonical form first, then anything RFC 3339 for files
        // written by other tools.
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, FORMAT) {
            return Ok(naive.and_utc());
        }
        DateTime::parse_from_rfc3339(raw)
            .map(|value| value.with_timezone(&Utc))
            .map_err(|error| format!("invalid timestamp '{raw}': {error}"))
    }
}

pub mod ts_millis_opt {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(inner) => super::ts_millis::serialize(inner, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        match raw {
            Some(raw) => super::ts_millis::parse(&raw)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

/// A persisted record. The header block of its file is exactly this struct
/// (minus `body`, which is the free text below the header).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub kind: RecordKind,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub status: RecordStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimate: Option<f64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub pinned: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub positions: BTreeMap<String, Position>,
    #[serde(with = "ts_millis")]
    pub created: DateTime<Utc>,
    #[serde(with = "ts_millis")]
    pub updated: DateTime<Utc>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "ts_millis_opt"
    )]
    pub archived_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub body: Option<String>,
    /// Header keys this version of the software does not recognize. They
    /// survive decode/encode untouched.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Record {
    pub fn new(kind: RecordKind, title: impl Into<String>, clock: &dyn Clock) -> Self {
        let now = truncate_millis(clock.now());
        Self {
            id: mint_id(kind, now),
            kind,
            title: title.into(),
            status: RecordStatus::Open,
            tags: Vec::new(),
            due: None,
            start: None,
            estimate: None,
            pinned: false,
            positions: BTreeMap::new(),
            created: now,
            updated: now,
            archived_at: None,
            body: None,
            extra: BTreeMap::new(),
        }
    }

    /// Advance `updated` for a successful mutation. Strictly monotonic even
    /// when the clock has not moved past the previous save.
    pub fn touch(&mut self, clock: &dyn Clock) {
        let now = truncate_millis(clock.now());
        self.updated = if now > self.updated {
            now
        } else {
            self.updated + Duration::milliseconds(1)
        };
    }

    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }
}

fn mint_id(kind: RecordKind, now: DateTime<Utc>) -> String {
    let short = Uuid::new_v4().simple().to_string();
    format!(
        "{}_{}_{}_{}",
        kind.as_str(),
        now.format("%Y%m%d"),
        now.format("%H%M%S"),
        &short[..6]
    )
}

/// Timestamps persist at millisecond precision; keep in-memory values at the
/// same precision so round-trips compare equal.
pub fn truncate_millis(value: DateTime<Utc>) -> DateTime<Utc> {
    let millis = value.timestamp_millis();
    DateTime::from_timestamp_millis(millis).unwrap_or(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FrozenClock(DateTime<Utc>);

    impl Clock for FrozenClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    #[test]
    fn touch_is_strictly_monotonic_under_a_frozen_clock() {
        let clock = FrozenClock(Utc::now());
        let mut record = Record::new(RecordKind::Task, "Write tests", &clock);
        let first = record.updated;
        record.touch(&clock);
        let second = record.updated;
        record.touch(&clock);
        assert!(second > first);
        assert!(record.updated > second);
    }

    #[test]
    fn minted_ids_carry_kind_and_date() {
        let clock = SystemClock;
        let record = Record::new(RecordKind::Board, "Sprint wall", &clock);
        assert!(record.id.starts_with("board_"));
        assert_eq!(record.id.split('_').count(), 4);
    }

    #[test]
    fn canonical_timestamp_parses_its_own_output() {
        let now = truncate_millis(Utc::now());
        let rendered = now.format(ts_millis::FORMAT).to_string();
        let parsed = ts_millis::parse(&rendered).expect("canonical parse");
        assert_eq!(parsed, now);
    }
}

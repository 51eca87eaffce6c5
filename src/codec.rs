//! Record <-> file text conversion. Pure string work, no I/O.
//!
//! A record file is a YAML header between `---` fences followed by the free
//! text body verbatim:
//!
//! ```text
//! ---
//! id: task_20260301_091500_1a2b3c
//! kind: task
//! title: Ship the release notes
//! ...
//! ---
//!
//! Body text, untouched.
//! ```

use std::collections::BTreeSet;

use thiserror::Error;

use crate::models::Record;

/// Header keys this software writes. Anything else is `extra` in lenient
/// mode and an error in strict mode.
const KNOWN_KEYS: &[&str] = &[
    "id",
    "kind",
    "title",
    "status",
    "tags",
    "due",
    "start",
    "estimate",
    "pinned",
    "positions",
    "created",
    "updated",
    "archived_at",
];

/// Keys that must be present for identity and conflict arbitration.
const REQUIRED_KEYS: &[&str] = &["id", "kind", "updated"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecodeMode {
    /// Unknown keys round-trip, missing optionals default.
    #[default]
    Lenient,
    /// Unknown keys and missing required keys are errors naming the key.
    Strict,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("missing opening '---' delimiter")]
    MissingOpenDelimiter,
    #[error("missing closing '---' delimiter")]
    MissingCloseDelimiter,
    #[error("header is not a YAML mapping")]
    HeaderNotMapping,
    #[error("missing required key '{0}'")]
    MissingKey(String),
    #[error("unknown key '{0}'")]
    UnknownKey(String),
    #[error("invalid value for key '{key}': {reason}")]
    InvalidValue { key: String, reason: String },
    #[error("malformed header: {0}")]
    Header(String),
    #[error("header serialization failed: {0}")]
    Serialize(String),
}

/// Render a record to file text. Absent optional attributes are omitted from
/// the header; the body is appended verbatim.
pub fn encode(record: &Record) -> Result<String, CodecError> {
    let metadata =
        serde_json::to_value(record).map_err(|error| CodecError::Serialize(error.to_string()))?;
    let header =
        serde_yaml::to_string(&metadata).map_err(|error| CodecError::Serialize(error.to_string()))?;
    let body = record.body.as_deref().unwrap_or("");
    Ok(format!("---\n{}---\n\n{}", header, body))
}

/// Parse file text back into a record.
pub fn decode(text: &str, mode: DecodeMode) -> Result<Record, CodecError> {
    let (header, body) = split_frontmatter(text)?;

    let yaml: serde_yaml::Value =
        serde_yaml::from_str(header).map_err(|error| CodecError::Header(error.to_string()))?;
    let metadata: serde_json::Value =
        serde_json::to_value(yaml).map_err(|error| CodecError::Header(error.to_string()))?;

    let mapping = metadata.as_object().ok_or(CodecError::HeaderNotMapping)?;

    for key in REQUIRED_KEYS {
        if !mapping.contains_key(*key) {
            return Err(CodecError::MissingKey((*key).to_string()));
        }
    }
    if mode == DecodeMode::Strict {
        let known: BTreeSet<&str> = KNOWN_KEYS.iter().copied().collect();
        for key in mapping.keys() {
            if !known.contains(key.as_str()) {
                return Err(CodecError::UnknownKey(key.clone()));
            }
        }
    }

    let keys: Vec<String> = mapping.keys().cloned().collect();
    let mut record: Record =
        serde_json::from_value(metadata).map_err(|error| invalid_value(error, &keys))?;

    let body = body.trim_end_matches('\n');
    if !body.trim().is_empty() {
        record.body = Some(body.trim_start_matches('\n').to_string());
    }
    Ok(record)
}

fn split_frontmatter(text: &str) -> Result<(&str, &str), CodecError> {
    let rest = text
        .strip_prefix("---\n")
        .ok_or(CodecError::MissingOpenDelimiter)?;
    // An empty header ("---\n---\n") is structurally fine; the mapping and
    // required-key checks reject it later.
    if let Some(rest) = rest.strip_prefix("---\n") {
        return Ok(("", rest));
    }
    let split_at = rest.find("\n---\n").ok_or(CodecError::MissingCloseDelimiter)?;
    Ok((&rest[..split_at + 1], &rest[split_at + 5..]))
}

/// serde errors read like `invalid type: string "nope", expected u32` with no
/// field path once the data came through `from_value`. Best-effort: find the
/// key the message mentions so callers see which attribute broke.
fn invalid_value(error: serde_json::Error, keys: &[String]) -> CodecError {
    let message = error.to_string();
    for key in keys {
        if message.contains(key.as_str()) {
            return CodecError::InvalidValue {
                key: key.clone(),
                reason: message,
            };
        }
    }
    CodecError::Header(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Clock, Position, Record, RecordKind, RecordStatus, SystemClock};
    use chrono::NaiveDate;

    fn sample_record() -> Record {
        let mut record = Record::new(RecordKind::Task, "Water the plants", &SystemClock);
        record.status = RecordStatus::InProgress;
        record.tags = vec!["home".to_string(), "recurring".to_string()];
        record.due = NaiveDate::from_ymd_opt(2026, 9, 14);
        record.estimate = Some(0.5);
        record.pinned = true;
        record
            .positions
            .insert("week-view".to_string(), Position { x: 120.0, y: 48.5 });
        record.body = Some("Use the small can for the ferns.".to_string());
        record
    }

    #[test]
    fn round_trip_preserves_every_attribute() {
        let record = sample_record();
        let text = encode(&record).expect("encode");
        let parsed = decode(&text, DecodeMode::Strict).expect("strict decode");

        assert_eq!(parsed.id, record.id);
        assert_eq!(parsed.kind, record.kind);
        assert_eq!(parsed.title, record.title);
        assert_eq!(parsed.status, record.status);
        assert_eq!(parsed.tags, record.tags);
        assert_eq!(parsed.due, record.due);
        assert_eq!(parsed.estimate, record.estimate);
        assert_eq!(parsed.pinned, record.pinned);
        assert_eq!(parsed.positions, record.positions);
        assert_eq!(parsed.created, record.created);
        assert_eq!(parsed.updated, record.updated);
        assert_eq!(parsed.body, record.body);
    }

    #[test]
    fn absent_optionals_are_omitted_from_the_header() {
        let record = Record::new(RecordKind::Board, "Kanban", &SystemClock);
        let text = encode(&record).expect("encode");
        assert!(!text.contains("due:"));
        assert!(!text.contains("estimate:"));
        assert!(!text.contains("pinned:"));
        assert!(!text.contains("archived_at:"));
        assert!(!text.contains("positions:"));
    }

    #[test]
    fn unknown_keys_round_trip_in_lenient_mode() {
        let record = sample_record();
        let mut text = encode(&record).expect("encode");
        text = text.replacen("---\n", "---\nx-plugin-color: teal\n", 1);

        let parsed = decode(&text, DecodeMode::Lenient).expect("lenient decode");
        assert_eq!(
            parsed.extra.get("x-plugin-color").and_then(|v| v.as_str()),
            Some("teal")
        );

        let reencoded = encode(&parsed).expect("encode");
        assert!(reencoded.contains("x-plugin-color: teal"));
    }

    #[test]
    fn strict_mode_names_the_unknown_key() {
        let record = sample_record();
        let text = encode(&record).expect("encode").replacen("---\n", "---\nx-plugin-color: teal\n", 1);
        let error = decode(&text, DecodeMode::Strict).expect_err("strict must reject");
        assert!(matches!(error, CodecError::UnknownKey(key) if key == "x-plugin-color"));
    }

    #[test]
    fn missing_required_key_is_named_in_both_modes() {
        let text = "---\nkind: task\nupdated: 2026-03-01T09:15:00.000Z\n---\n\n";
        for mode in [DecodeMode::Lenient, DecodeMode::Strict] {
            let error = decode(text, mode).expect_err("id is required");
            assert!(matches!(&error, CodecError::MissingKey(key) if key == "id"));
        }
    }

    #[test]
    fn malformed_delimiters_are_typed_errors() {
        assert!(matches!(
            decode("id: no fences\n", DecodeMode::Lenient),
            Err(CodecError::MissingOpenDelimiter)
        ));
        assert!(matches!(
            decode("---\nid: never closed\n", DecodeMode::Lenient),
            Err(CodecError::MissingCloseDelimiter)
        ));
    }

    #[test]
    fn invalid_value_reports_the_offending_key() {
        let clock = SystemClock;
        let record = Record::new(RecordKind::Task, "t", &clock);
        let text = encode(&record).expect("encode").replace("status: open", "status: not-a-status");
        let error = decode(&text, DecodeMode::Lenient).expect_err("bad status");
        match error {
            CodecError::InvalidValue { key, .. } => assert_eq!(key, "status"),
            CodecError::Header(message) => assert!(message.contains("not-a-status")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn body_is_preserved_verbatim_including_dashes() {
        let mut record = sample_record();
        record.body = Some("line one\n\n---\nnot a header\nline four".to_string());
        let text = encode(&record).expect("encode");
        let parsed = decode(&text, DecodeMode::Lenient).expect("decode");
        assert_eq!(parsed.body.as_deref(), Some("line one\n\n---\nnot a header\nline four"));
    }
}

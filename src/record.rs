//! Decoding of nginx JSON access log lines.
//!
//! Each line is one JSON object carrying at least a `time` and a `status` field:
//!
//! ```json
//! {"time": "2024-05-01T10:00:00+02:00", "status": "200", "request": "GET / HTTP/1.1"}
//! ```
//!
//! Everything besides those two fields is ignored. Keys match case-insensitively, preferring an
//! exact match, and both values must be JSON strings.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, FixedOffset};
use serde_json::{Map, Value};

/// Layout of the `time` field: ISO-8601 with a numeric UTC offset (nginx `$time_iso8601`).
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f%:z";

pub(crate) const LINE_PREVIEW_LIMIT: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub timestamp: DateTime<FixedOffset>,
    pub status: String,
}

/// Why a line was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordErrorKind {
    Json,
    Timestamp,
}

impl RecordErrorKind {
    pub fn metric_label(&self) -> &'static str {
        match self {
            RecordErrorKind::Json => "json",
            RecordErrorKind::Timestamp => "timestamp",
        }
    }
}

#[derive(Debug)]
pub struct RecordError {
    pub kind: RecordErrorKind,
    pub source: anyhow::Error,
}

impl RecordError {
    fn new(kind: RecordErrorKind, source: anyhow::Error) -> Self {
        Self { kind, source }
    }
}

impl std::fmt::Display for RecordError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#}", self.source)
    }
}

impl LogRecord {
    /// Decode one line, already stripped of its newline.
    pub fn parse(line: &[u8]) -> Result<Self, RecordError> {
        let fields: Map<String, Value> = serde_json::from_slice(line)
            .context("failed to decode access log line")
            .map_err(|err| RecordError::new(RecordErrorKind::Json, err))?;

        let time = string_field(&fields, "time")
            .map_err(|err| RecordError::new(RecordErrorKind::Json, err))?;
        let status = string_field(&fields, "status")
            .map_err(|err| RecordError::new(RecordErrorKind::Json, err))?;

        let timestamp = parse_timestamp(time)
            .map_err(|err| RecordError::new(RecordErrorKind::Timestamp, err))?;

        Ok(Self {
            timestamp,
            status: status.to_string(),
        })
    }
}

fn string_field<'a>(fields: &'a Map<String, Value>, name: &str) -> Result<&'a str> {
    let value = fields
        .get(name)
        .or_else(|| {
            fields
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, value)| value)
        })
        .ok_or_else(|| anyhow!("missing field `{name}`"))?;

    value
        .as_str()
        .ok_or_else(|| anyhow!("field `{name}` must be a string, got {value}"))
}

pub fn parse_timestamp(input: &str) -> Result<DateTime<FixedOffset>> {
    DateTime::parse_from_str(input, TIMESTAMP_FORMAT)
        .with_context(|| format!("could not parse time {input:?}"))
}

/// Split a chunk into lines, dropping blank lines and trailing `\r`/spaces.
pub(crate) fn split_lines(chunk: &[u8]) -> impl Iterator<Item = &[u8]> {
    chunk
        .split(|byte| *byte == b'\n')
        .map(trim_line_bytes)
        .filter(|line| !line.is_empty())
}

fn trim_line_bytes(mut line: &[u8]) -> &[u8] {
    while let Some((last, rest)) = line.split_last() {
        if *last == b'\r' || *last == b' ' {
            line = rest;
        } else {
            break;
        }
    }
    line
}

/// Creates a preview string from a byte slice, truncating at `limit` characters with ellipsis.
pub(crate) fn line_preview(line: &[u8], limit: usize) -> String {
    let text = String::from_utf8_lossy(line);
    let mut preview = String::new();
    for (idx, ch) in text.chars().enumerate() {
        if idx >= limit {
            preview.push('…');
            return preview;
        }
        preview.push(ch);
    }
    preview
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn parses_string_fields_and_ignores_extras() {
        let line = br#"{"time": "2024-05-01T10:00:00+02:00", "status": "200", "request": "GET /"}"#;
        let record = LogRecord::parse(line).expect("line should parse");
        assert_eq!(record.status, "200");
        assert_eq!(
            record.timestamp,
            Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
        );
    }

    #[test]
    fn matches_keys_case_insensitively() {
        let line = br#"{"TIME": "2024-05-01T10:00:00-07:00", "Status": "503"}"#;
        let record = LogRecord::parse(line).expect("line should parse");
        assert_eq!(record.status, "503");

        let line = br#"{"Status": "500", "status": "200", "time": "2024-05-01T10:00:00+00:00"}"#;
        let record = LogRecord::parse(line).expect("line should parse");
        assert_eq!(record.status, "200");
    }

    #[test]
    fn rejects_non_string_status() {
        let line = br#"{"time": "2024-05-01T10:00:00+00:00", "status": 503}"#;
        let err = LogRecord::parse(line).unwrap_err();
        assert_eq!(err.kind, RecordErrorKind::Json);
        assert!(err.to_string().contains("must be a string"));
    }

    #[test]
    fn accepts_fractional_seconds() {
        let parsed = parse_timestamp("2024-05-01T10:00:00.250+00:00").expect("should parse");
        assert_eq!(parsed.timestamp_subsec_millis(), 250);
    }

    #[test]
    fn rejects_malformed_json() {
        let err = LogRecord::parse(b"{not json").unwrap_err();
        assert_eq!(err.kind, RecordErrorKind::Json);

        let err = LogRecord::parse(br#"{"time": "2024-05-01T10:00:00+00:00"}"#).unwrap_err();
        assert_eq!(err.kind, RecordErrorKind::Json);
    }

    #[test]
    fn rejects_timestamps_outside_wire_format() {
        for time in ["2024-05-01T10:00:00Z", "2024-05-01T10:00:00", "yesterday", ""] {
            let line = format!(r#"{{"time": "{time}", "status": "200"}}"#);
            let err = LogRecord::parse(line.as_bytes()).unwrap_err();
            assert_eq!(err.kind, RecordErrorKind::Timestamp, "{time} should be rejected");
            assert!(err.to_string().contains("could not parse time"));
        }
    }

    #[test]
    fn split_lines_skips_blank_and_trims_crlf() {
        let lines: Vec<&[u8]> = split_lines(b"a\r\n\n  \nb \nc").collect();
        assert_eq!(lines, vec![&b"a"[..], &b"b"[..], &b"c"[..]]);
    }

    #[test]
    fn line_preview_truncates() {
        assert_eq!(line_preview(b"abcdef", 3), "abc…");
        assert_eq!(line_preview(b"abc", 3), "abc");
    }
}

//! Commit history records and the machine-readable log format

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Separates fields in a log line; commit subjects never contain it
pub const FIELD_SEPARATOR: char = '\u{1f}';

/// `git log --format` string producing `short-hash␟subject␟strict-ISO-timestamp`
pub const LOG_FORMAT: &str = "--format=%h%x1f%s%x1f%cI";

const FIELD_COUNT: usize = 3;

/// One entry in a file's version history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    /// Abbreviated commit id
    pub id: String,
    /// Commit subject line
    pub message: String,
    /// Commit timestamp
    pub timestamp: DateTime<Utc>,
}

/// Parse log output into records, preserving the tool's (newest-first) order.
///
/// Lines with too few fields are skipped; an unparsable timestamp becomes
/// the current time instead of failing the query.
pub fn parse_log(output: &str) -> Vec<CommitRecord> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(parse_line)
        .collect()
}

fn parse_line(line: &str) -> Option<CommitRecord> {
    let fields: Vec<&str> = line.splitn(FIELD_COUNT, FIELD_SEPARATOR).collect();
    if fields.len() < FIELD_COUNT {
        tracing::debug!(line, "Skipping malformed log line");
        return None;
    }

    let timestamp = match DateTime::parse_from_rfc3339(fields[2].trim()) {
        Ok(ts) => ts.with_timezone(&Utc),
        Err(e) => {
            tracing::warn!(raw = fields[2], error = %e, "Unparsable commit timestamp, using now");
            Utc::now()
        }
    };

    Some(CommitRecord {
        id: fields[0].trim().to_string(),
        message: fields[1].to_string(),
        timestamp,
    })
}

//! Minimal line-protocol reader used to seed an [`InMemoryStore`].
//!
//! ```text
//! <measurement>[,<tag>=<value>...] <field>=<number>[,<field>=<number>...] [<timestamp ns>]
//! ```
//!
//! The `value` field is stored when present, otherwise the first field. Integer fields
//! may carry the `i` suffix. Blank lines and `#` comments are skipped. A missing
//! timestamp means "now". Escaping is not supported.

use crate::error::FinderError;
use crate::storage::InMemoryStore;
use crate::types::{DataPoint, TagSet, Timestamp, Value};
use std::collections::HashMap;
use std::io::BufRead;
use std::time::{SystemTime, UNIX_EPOCH};

/// One parsed observation.
#[derive(Debug, Clone, PartialEq)]
pub struct LineRecord {
    pub measurement: String,
    pub point: DataPoint,
}

/// Parses one line. `Ok(None)` for blank and comment lines.
///
/// # Errors
/// Returns `InvalidLine` carrying `number` (the caller's 1-based line number).
pub fn parse_line(line: &str, number: usize) -> Result<Option<LineRecord>, FinderError> {
    let invalid = |reason: String| FinderError::InvalidLine {
        line: number,
        reason,
    };
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let mut parts = line.split_whitespace();
    let series = parts
        .next()
        .ok_or_else(|| invalid("missing measurement".to_string()))?;
    let fields = parts
        .next()
        .ok_or_else(|| invalid("missing fields".to_string()))?;
    let timestamp = match parts.next() {
        Some(ts) => ts
            .parse::<Timestamp>()
            .map_err(|e| invalid(format!("bad timestamp {:?}: {}", ts, e)))?,
        None => now_nanos(),
    };
    if parts.next().is_some() {
        return Err(invalid("unexpected trailing data".to_string()));
    }

    let mut series_parts = series.split(',');
    let measurement = series_parts.next().unwrap_or_default();
    if measurement.is_empty() {
        return Err(invalid("empty measurement".to_string()));
    }
    let mut tags = TagSet::new();
    for pair in series_parts {
        let (key, value) = split_pair(pair).ok_or_else(|| invalid(expected_pair(pair)))?;
        tags.insert(key.to_string(), value.to_string());
    }

    let mut chosen: Option<Value> = None;
    for pair in fields.split(',') {
        let (key, raw) = split_pair(pair).ok_or_else(|| invalid(expected_pair(pair)))?;
        let value = parse_number(raw)
            .ok_or_else(|| invalid(format!("non-numeric field value {:?}", raw)))?;
        if key == "value" {
            chosen = Some(value);
            break;
        }
        chosen.get_or_insert(value);
    }
    let value = chosen.ok_or_else(|| invalid("no numeric field".to_string()))?;

    Ok(Some(LineRecord {
        measurement: measurement.to_string(),
        point: DataPoint {
            timestamp,
            value,
            tags,
        },
    }))
}

/// Reads every line from `reader` into `store` as one batch.
///
/// # Returns
/// * `Ok(count)` with the number of points written.
///
/// # Errors
/// Returns `InvalidLine` (1-based line number) for the first malformed line, in which
/// case nothing is written, or `ConfigError` if the reader fails.
pub fn load_into<R: BufRead>(store: &InMemoryStore, reader: R) -> Result<usize, FinderError> {
    let mut batch: HashMap<String, Vec<DataPoint>> = HashMap::new();
    let mut count = 0;
    for (n, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| FinderError::ConfigError(format!("read failed: {}", e)))?;
        if let Some(record) = parse_line(&line, n + 1)? {
            batch.entry(record.measurement).or_default().push(record.point);
            count += 1;
        }
    }
    store.insert_batch(batch)?;
    Ok(count)
}

fn split_pair(pair: &str) -> Option<(&str, &str)> {
    pair.split_once('=')
        .filter(|(k, v)| !k.is_empty() && !v.is_empty())
}

fn expected_pair(pair: &str) -> String {
    format!("expected key=value, got {:?}", pair)
}

fn parse_number(raw: &str) -> Option<Value> {
    raw.strip_suffix('i').unwrap_or(raw).parse::<Value>().ok()
}

fn now_nanos() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as Timestamp)
        .unwrap_or(0)
}

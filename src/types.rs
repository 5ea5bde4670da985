use crate::error::FinderError;
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

/// Timestamp type (nanoseconds since epoch).
pub type Timestamp = u64;

/// Value type.
pub type Value = f64;

/// TagSet type. Ordered so that selectors hash, compare and print deterministically.
pub type TagSet = BTreeMap<String, String>;

pub const NANOS_PER_SECOND: u64 = 1_000_000_000;

/// Converts whole epoch seconds to a storage timestamp, saturating on overflow.
pub fn seconds_to_timestamp(secs: u64) -> Timestamp {
    secs.saturating_mul(NANOS_PER_SECOND)
}

/// Represents a single data point written to a store.
#[derive(Debug, Clone, PartialEq)]
pub struct DataPoint {
    pub timestamp: Timestamp,
    pub value: Value,
    pub tags: TagSet,
}

/// One observation returned by a store row query.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesRow {
    pub measurement: String,
    pub tags: TagSet,
    pub timestamp: Timestamp,
    pub value: Value,
}

/// A (measurement, tag filter) pair identifying one series in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Selector {
    pub measurement: String,
    pub tags: TagSet,
}

impl Selector {
    pub fn new(measurement: impl Into<String>, tags: TagSet) -> Self {
        Self {
            measurement: measurement.into(),
            tags,
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.measurement)?;
        for (k, v) in &self.tags {
            write!(f, ",{}={}", k, v)?;
        }
        Ok(())
    }
}

/// Represents a chunk of one measurement's rows in columnar format.
/// Rows are kept sorted by timestamp.
#[derive(Debug, Default, Clone)]
pub struct TimeSeriesChunk {
    pub timestamps: Vec<Timestamp>,
    pub values: Vec<Value>,
    pub tags: Vec<TagSet>,
}

impl TimeSeriesChunk {
    /// Appends multiple data points and restores timestamp order.
    pub fn append_batch(&mut self, points: Vec<DataPoint>) {
        let mut combined: Vec<(Timestamp, Value, TagSet)> = self
            .timestamps
            .drain(..)
            .zip(self.values.drain(..))
            .zip(self.tags.drain(..))
            .map(|((ts, val), tags)| (ts, val, tags))
            .chain(points.into_iter().map(|p| (p.timestamp, p.value, p.tags)))
            .collect();

        // Stable so that equal timestamps keep insertion order (later write stays later).
        combined.sort_by_key(|&(ts, _, _)| ts);

        self.timestamps.reserve(combined.len());
        self.values.reserve(combined.len());
        self.tags.reserve(combined.len());
        for (ts, val, tags) in combined {
            self.timestamps.push(ts);
            self.values.push(val);
            self.tags.push(tags);
        }
    }

    /// Returns the number of data points in the chunk.
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    /// Returns true if the chunk is empty.
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

/// Point in time after which a call gives up. `Deadline::none()` never expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    pub fn none() -> Self {
        Deadline(None)
    }

    pub fn at(instant: Instant) -> Self {
        Deadline(Some(instant))
    }

    pub fn after(timeout: Duration) -> Self {
        Deadline(Instant::now().checked_add(timeout))
    }

    pub fn is_expired(&self) -> bool {
        self.0.map_or(false, |at| Instant::now() >= at)
    }

    /// Fails with `DeadlineExceeded` once the deadline has passed.
    pub fn check(&self) -> Result<(), FinderError> {
        if self.is_expired() {
            Err(FinderError::DeadlineExceeded)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> TagSet {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn chunk_append_keeps_timestamp_order() {
        let mut chunk = TimeSeriesChunk::default();
        chunk.append_batch(vec![
            DataPoint { timestamp: 300, value: 3.0, tags: TagSet::new() },
            DataPoint { timestamp: 100, value: 1.0, tags: TagSet::new() },
        ]);
        chunk.append_batch(vec![DataPoint { timestamp: 200, value: 2.0, tags: TagSet::new() }]);
        assert_eq!(chunk.timestamps, vec![100, 200, 300]);
        assert_eq!(chunk.values, vec![1.0, 2.0, 3.0]);
        assert_eq!(chunk.len(), 3);
    }

    #[test]
    fn chunk_equal_timestamps_keep_write_order() {
        let mut chunk = TimeSeriesChunk::default();
        chunk.append_batch(vec![DataPoint { timestamp: 5, value: 1.0, tags: TagSet::new() }]);
        chunk.append_batch(vec![DataPoint { timestamp: 5, value: 2.0, tags: TagSet::new() }]);
        assert_eq!(chunk.values, vec![1.0, 2.0]);
    }

    #[test]
    fn selector_displays_tags_in_key_order() {
        let sel = Selector::new("cpu", tags(&[("host", "a"), ("dc", "eu")]));
        assert_eq!(sel.to_string(), "cpu,dc=eu,host=a");
    }

    #[test]
    fn deadline_none_never_expires() {
        assert!(Deadline::none().check().is_ok());
        let past = Deadline::after(Duration::from_secs(0));
        assert_eq!(past.check(), Err(FinderError::DeadlineExceeded));
    }
}

//! Store read interface consumed by the finder, plus an in-process implementation.

use crate::error::FinderError;
use crate::query::{check_tags, execute_query};
use crate::types::{DataPoint, Deadline, SeriesRow, TagSet, TimeSeriesChunk, Timestamp, Value};
use std::collections::{BTreeSet, HashMap};
use std::ops::RangeInclusive;
use std::sync::{Arc, RwLock};

/// What a distinct-value lookup enumerates.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DistinctTarget {
    /// Measurement names.
    Measurements,
    /// Values of one tag key.
    TagValues(String),
    /// Tag keys carried by the matching series.
    TagKeys,
}

/// Constraints for a distinct-value lookup: only series of `measurement` (when set)
/// carrying every pair of `tags` are considered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Constraints {
    pub measurement: Option<String>,
    pub tags: TagSet,
    /// When set, a series qualifies only if it carries no key besides those of `tags`
    /// and, for `TagValues`, the enumerated key.
    pub exact: bool,
}

impl Constraints {
    /// Same constraints with `exact` set.
    pub fn exactly(&self) -> Self {
        Constraints {
            exact: true,
            ..self.clone()
        }
    }

    /// Whether a series with `tags` qualifies when enumerating `target`.
    pub fn admits(&self, target: &DistinctTarget, tags: &TagSet) -> bool {
        if !check_tags(tags, &self.tags) {
            return false;
        }
        if !self.exact {
            return true;
        }
        tags.keys().all(|key| {
            self.tags.contains_key(key)
                || matches!(target, DistinctTarget::TagValues(wanted) if wanted == key)
        })
    }
}

/// Read side of a tag-structured time-series store.
///
/// Implementations are called concurrently from several threads and must honour the
/// deadline they are given; an unreachable backend reports `StoreUnavailable`.
pub trait SeriesStore: std::fmt::Debug + Send + Sync {
    /// Distinct measurement names or tag values among series matching `constraints`.
    fn distinct_values(
        &self,
        target: &DistinctTarget,
        constraints: &Constraints,
        deadline: Deadline,
    ) -> Result<BTreeSet<String>, FinderError>;

    /// Rows of `measurement` inside `range` (inclusive) matching any of `filters`.
    /// An empty `filters` slice means no tag filtering. Rows come back in timestamp order.
    fn query_rows(
        &self,
        measurement: &str,
        filters: &[TagSet],
        range: RangeInclusive<Timestamp>,
        deadline: Deadline,
    ) -> Result<Vec<SeriesRow>, FinderError>;
}

/// One measurement's rows plus the distinct tag sets seen for it.
#[derive(Debug, Default)]
struct MeasurementData {
    chunk: Arc<RwLock<TimeSeriesChunk>>,
    series: BTreeSet<TagSet>,
}

/// Simple in-memory store.
/// Rows are stored per measurement in a timestamp-sorted `TimeSeriesChunk`.
/// Uses RwLock for concurrent read access during queries and exclusive write access on insert.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    measurements: RwLock<HashMap<String, MeasurementData>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes a single observation.
    pub fn insert(
        &self,
        measurement: &str,
        timestamp: Timestamp,
        value: Value,
        tags: TagSet,
    ) -> Result<(), FinderError> {
        let mut batch = HashMap::new();
        batch.insert(
            measurement.to_string(),
            vec![DataPoint {
                timestamp,
                value,
                tags,
            }],
        );
        self.insert_batch(batch)
    }

    /// Appends a batch of points keyed by measurement. Creates measurements on first use
    /// and keeps each chunk sorted by timestamp.
    pub fn insert_batch(&self, data: HashMap<String, Vec<DataPoint>>) -> Result<(), FinderError> {
        let mut guard = self.measurements.write()?;
        for (measurement, points) in data {
            if points.is_empty() {
                continue;
            }
            let entry = guard.entry(measurement).or_default();
            for point in &points {
                if !entry.series.contains(&point.tags) {
                    entry.series.insert(point.tags.clone());
                }
            }
            entry.chunk.write()?.append_batch(points);
        }
        Ok(())
    }

    /// Number of distinct (measurement, tag set) series held.
    pub fn series_count(&self) -> Result<usize, FinderError> {
        let guard = self.measurements.read()?;
        Ok(guard.values().map(|m| m.series.len()).sum())
    }
}

impl SeriesStore for InMemoryStore {
    fn distinct_values(
        &self,
        target: &DistinctTarget,
        constraints: &Constraints,
        deadline: Deadline,
    ) -> Result<BTreeSet<String>, FinderError> {
        deadline.check()?;
        let guard = self.measurements.read()?;

        let mut out = BTreeSet::new();
        for (name, data) in guard.iter() {
            if constraints
                .measurement
                .as_ref()
                .map_or(false, |wanted| wanted != name)
            {
                continue;
            }
            let mut matching = data
                .series
                .iter()
                .filter(|tags| constraints.admits(target, tags));
            match target {
                DistinctTarget::Measurements => {
                    if matching.next().is_some() {
                        out.insert(name.clone());
                    }
                }
                DistinctTarget::TagValues(key) => {
                    out.extend(matching.filter_map(|tags| tags.get(key).cloned()));
                }
                DistinctTarget::TagKeys => {
                    out.extend(matching.flat_map(|tags| tags.keys().cloned()));
                }
            }
        }
        Ok(out)
    }

    fn query_rows(
        &self,
        measurement: &str,
        filters: &[TagSet],
        range: RangeInclusive<Timestamp>,
        deadline: Deadline,
    ) -> Result<Vec<SeriesRow>, FinderError> {
        deadline.check()?;
        let chunk_arc = {
            let guard = self.measurements.read()?;
            match guard.get(measurement) {
                Some(data) => Arc::clone(&data.chunk),
                None => return Ok(Vec::new()),
            }
        };
        let chunk_guard = chunk_arc.read()?;
        let rows = execute_query(chunk_guard, range, filters)?;
        Ok(rows
            .into_iter()
            .map(|(timestamp, value, tags)| SeriesRow {
                measurement: measurement.to_string(),
                tags,
                timestamp,
                value,
            })
            .collect())
    }
}

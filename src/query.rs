use crate::error::FinderError;
use crate::types::{TagSet, TimeSeriesChunk, Timestamp, Value};
use rayon::prelude::*;
use std::ops::RangeInclusive;
use std::sync::RwLockReadGuard;

/// Executes a row query against a single measurement chunk.
///
/// # Arguments
/// * `chunk_guard` - A read guard for the `TimeSeriesChunk` to query.
/// * `time_range` - The time range (both ends inclusive) for the query.
/// * `tag_filters` - Alternative tag filters. A row is returned if it matches any of them;
///   an empty slice returns every row in range.
///
/// # Returns
/// * `Result<Vec<(Timestamp, Value, TagSet)>, FinderError>` - Matching rows in timestamp order.
pub fn execute_query(
    // Takes a read guard to ensure data doesn't change during query execution
    chunk_guard: RwLockReadGuard<TimeSeriesChunk>,
    time_range: RangeInclusive<Timestamp>,
    tag_filters: &[TagSet],
) -> Result<Vec<(Timestamp, Value, TagSet)>, FinderError> {
    if time_range.start() > time_range.end() {
        return Err(FinderError::InvalidTimeRange {
            start: *time_range.start(),
            end: *time_range.end(),
        });
    }

    let chunk = &*chunk_guard;

    // Find the first index >= start and the first index > end
    let start_idx = chunk
        .timestamps
        .partition_point(|&ts| ts < *time_range.start());
    let end_idx = chunk
        .timestamps
        .partition_point(|&ts| ts <= *time_range.end());

    if start_idx >= end_idx {
        return Ok(Vec::new());
    }

    // Indexed parallel iterators keep their order on collect.
    let results: Vec<(Timestamp, Value, TagSet)> = (start_idx..end_idx)
        .into_par_iter()
        .filter_map(|i| {
            let tags_match = tag_filters.is_empty()
                || tag_filters
                    .iter()
                    .any(|filter| check_tags(&chunk.tags[i], filter));

            if tags_match {
                Some((chunk.timestamps[i], chunk.values[i], chunk.tags[i].clone()))
            } else {
                None
            }
        })
        .collect();

    Ok(results)
}

/// Checks if a row's tags contain all the tags specified in the filter.
#[inline]
pub(crate) fn check_tags(point_tags: &TagSet, filter_tags: &TagSet) -> bool {
    if point_tags.len() < filter_tags.len() {
        return false;
    }
    filter_tags
        .iter()
        .all(|(key, value)| point_tags.get(key) == Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DataPoint;
    use std::sync::{Arc, RwLock};

    fn create_tags(pairs: &[(&str, &str)]) -> TagSet {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn create_test_chunk(points: Vec<DataPoint>) -> Arc<RwLock<TimeSeriesChunk>> {
        let mut chunk = TimeSeriesChunk::default();
        chunk.append_batch(points);
        Arc::new(RwLock::new(chunk))
    }

    fn point(ts: Timestamp, value: Value, tags: TagSet) -> DataPoint {
        DataPoint { timestamp: ts, value, tags }
    }

    #[test]
    fn test_execute_query_inclusive_range() {
        let chunk = create_test_chunk(vec![
            point(10, 1.0, TagSet::new()),
            point(20, 2.0, TagSet::new()),
            point(30, 3.0, TagSet::new()),
        ]);

        let all = execute_query(chunk.read().unwrap(), 10..=30, &[]).unwrap();
        assert_eq!(all.len(), 3);

        let middle = execute_query(chunk.read().unwrap(), 20..=20, &[]).unwrap();
        assert_eq!(middle, vec![(20, 2.0, TagSet::new())]);

        let none = execute_query(chunk.read().unwrap(), 31..=100, &[]).unwrap();
        assert!(none.is_empty());

        let invalid = execute_query(chunk.read().unwrap(), 30..=10, &[]);
        assert!(matches!(
            invalid,
            Err(FinderError::InvalidTimeRange { start: 30, end: 10 })
        ));
    }

    #[test]
    fn test_execute_query_union_of_filters() {
        let a = create_tags(&[("host", "a"), ("dc", "eu")]);
        let b = create_tags(&[("host", "b"), ("dc", "eu")]);
        let c = create_tags(&[("host", "c"), ("dc", "us")]);
        let chunk = create_test_chunk(vec![
            point(1, 1.0, a.clone()),
            point(2, 2.0, b.clone()),
            point(3, 3.0, c.clone()),
        ]);

        let filters = vec![create_tags(&[("host", "a")]), create_tags(&[("dc", "us")])];
        let rows = execute_query(chunk.read().unwrap(), 0..=10, &filters).unwrap();
        let ts: Vec<Timestamp> = rows.iter().map(|r| r.0).collect();
        assert_eq!(ts, vec![1, 3]);

        let no_match = vec![create_tags(&[("host", "zzz")])];
        assert!(execute_query(chunk.read().unwrap(), 0..=10, &no_match)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_check_tags() {
        let point_tags = create_tags(&[("host", "server1"), ("region", "us-east")]);
        assert!(check_tags(&point_tags, &create_tags(&[("host", "server1")])));
        assert!(check_tags(&point_tags, &point_tags.clone()));
        assert!(!check_tags(&point_tags, &create_tags(&[("host", "server2")])));
        assert!(!check_tags(&point_tags, &create_tags(&[("nonexistent", "value")])));
        assert!(!check_tags(
            &point_tags,
            &create_tags(&[("host", "server1"), ("region", "us-east"), ("extra", "tag")])
        ));
        assert!(check_tags(&point_tags, &TagSet::new()));
        assert!(!check_tags(&TagSet::new(), &create_tags(&[("host", "any")])));
    }
}

//! Fixed-step alignment of fetched rows.
//!
//! Every series of one fetch is placed on the same grid: bucket `i` covers
//! `start + i * step` plus or minus half a step, the grid holds
//! `floor((end - start) / step) + 1` buckets, and buckets without a row stay `None`.

use crate::error::FinderError;
use crate::types::{Deadline, Selector, TagSet, Timestamp, Value, NANOS_PER_SECOND};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Gap-filled, fixed-step series.
pub type AlignedSeries = Vec<Option<Value>>;

/// The grid shared by every series of one fetch (epoch seconds).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeInfo {
    pub start: u64,
    pub end: u64,
    pub step: u64,
}

impl TimeInfo {
    /// Number of buckets on the grid.
    pub fn bucket_count(&self) -> usize {
        bucket_count(self.start, self.end, self.step)
    }
}

/// Result of a multi-series fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResult {
    pub time_info: TimeInfo,
    pub data: BTreeMap<String, AlignedSeries>,
}

/// How the sampling interval is chosen when a request does not name one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepPolicy {
    /// Always this many seconds.
    Fixed { step: u64 },
    /// Smallest spacing between consecutive samples of up to `sample_series` series,
    /// never below `floor`; `fallback` when no series has two samples.
    Derive {
        floor: u64,
        sample_series: usize,
        fallback: u64,
    },
}

impl Default for StepPolicy {
    fn default() -> Self {
        StepPolicy::Fixed {
            step: crate::DEFAULT_STEP_SECONDS,
        }
    }
}

impl StepPolicy {
    /// Step used when nothing was fetched to derive from.
    pub fn default_step(&self) -> u64 {
        match self {
            StepPolicy::Fixed { step } => *step,
            StepPolicy::Derive { fallback, floor, .. } => (*fallback).max(*floor),
        }
    }

    pub fn validate(&self) -> Result<(), FinderError> {
        let ok = match self {
            StepPolicy::Fixed { step } => *step > 0,
            StepPolicy::Derive {
                floor,
                sample_series,
                fallback,
            } => *floor > 0 && *sample_series > 0 && *fallback > 0,
        };
        if ok {
            Ok(())
        } else {
            Err(FinderError::ConfigError(format!(
                "step policy values must be positive: {:?}",
                self
            )))
        }
    }
}

/// Parameters of one fetch call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchRequest {
    /// Inclusive start, epoch seconds.
    pub start: u64,
    /// Inclusive end, epoch seconds.
    pub end: u64,
    /// Explicit step in seconds; the finder's `StepPolicy` applies when `None`.
    pub step: Option<u64>,
    /// Overrides the finder's configured timeout.
    pub deadline: Option<Deadline>,
}

impl FetchRequest {
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end,
            step: None,
            deadline: None,
        }
    }

    pub fn with_step(mut self, step: u64) -> Self {
        self.step = Some(step);
        self
    }

    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// `floor((end - start) / step) + 1`.
pub fn bucket_count(start: u64, end: u64, step: u64) -> usize {
    debug_assert!(step > 0 && start <= end);
    ((end - start) / step) as usize + 1
}

/// Places timestamp-ordered rows on the grid. Within one bucket the row with the latest
/// timestamp wins; rows nearer to no bucket than half a step are dropped.
pub fn align(rows: &[(Timestamp, Value)], time_info: &TimeInfo) -> AlignedSeries {
    let len = time_info.bucket_count();
    let mut series: AlignedSeries = vec![None; len];
    let start_ns = time_info.start as u128 * NANOS_PER_SECOND as u128;
    let step_ns = time_info.step as u128 * NANOS_PER_SECOND as u128;

    for &(ts, value) in rows {
        let ts = ts as u128;
        if ts < start_ns {
            continue;
        }
        // round((ts - start) / step), halves rounding up
        let index = ((ts - start_ns) + step_ns / 2) / step_ns;
        if let Some(slot) = series.get_mut(index as usize) {
            *slot = Some(value);
        }
    }
    series
}

/// Smallest positive whole-second spacing between consecutive samples over the
/// provided series, clamped to `floor`. `None` if no series has two distinct seconds.
pub fn derive_step<'a, I>(series: I, floor: u64) -> Option<u64>
where
    I: IntoIterator<Item = &'a [(Timestamp, Value)]>,
{
    let mut smallest: Option<u64> = None;
    for rows in series {
        let mut previous: Option<u64> = None;
        for &(ts, _) in rows {
            let secs = ts / NANOS_PER_SECOND;
            if let Some(prev) = previous {
                let gap = secs.saturating_sub(prev);
                if gap > 0 {
                    smallest = Some(smallest.map_or(gap, |s| s.min(gap)));
                }
            }
            previous = Some(secs);
        }
    }
    smallest.map(|s| s.max(floor))
}

/// Groups selectors sharing a measurement so each measurement costs one store query.
/// Filters are de-duplicated and kept in a deterministic order.
pub fn plan_batches<'a, I>(selectors: I) -> BTreeMap<String, Vec<TagSet>>
where
    I: IntoIterator<Item = &'a Selector>,
{
    let mut batches: BTreeMap<String, Vec<TagSet>> = BTreeMap::new();
    for selector in selectors {
        let filters = batches.entry(selector.measurement.clone()).or_default();
        if !filters.contains(&selector.tags) {
            filters.push(selector.tags.clone());
        }
    }
    for filters in batches.values_mut() {
        filters.sort();
    }
    batches
}

#![doc = include_str!("../README.md")]
// Declare modules
pub mod cache;
pub mod error;
pub mod fetch;
pub mod finder;
pub mod index;
pub mod line_protocol;
pub mod node;
pub mod pattern;
pub mod query;
pub mod storage;
pub mod telemetry;
pub mod template;
pub mod types;

/// Configuration options for the finder.
pub use crate::finder::FinderConfig;
/// Main entry point: node discovery and aligned fetches.
pub use crate::finder::{FindOptions, Finder, FinderCacheStats};
/// Error type for finder operations.
pub use crate::error::FinderError;
/// Fetch request, result and step selection.
pub use crate::fetch::{AlignedSeries, FetchRequest, FetchResult, StepPolicy, TimeInfo};
/// Namespace entries returned by discovery.
pub use crate::node::Node;
/// Store read interface and the in-process implementation.
pub use crate::storage::{Constraints, DistinctTarget, InMemoryStore, SeriesStore};
/// Structured event hook for observability.
pub use crate::telemetry::{FinderEvent, FinderEventListener};
/// Compiled path templates.
pub use crate::template::{CompiledTemplates, DefaultTagPolicy, SegmentRole, Template};
/// Represents a single time-series data point.
pub use crate::types::DataPoint;
/// Per-call deadline.
pub use crate::types::Deadline;
/// A (measurement, tags) series identity.
pub use crate::types::Selector;
/// Type alias for a set of tags (key-value pairs) associated with a data point.
pub use crate::types::TagSet;
/// Type alias for a timestamp (nanoseconds since epoch).
pub use crate::types::Timestamp;
/// Type alias for a value in a time series (f64).
pub use crate::types::Value;

/// The default fetch step in seconds.
pub const DEFAULT_STEP_SECONDS: u64 = 60;

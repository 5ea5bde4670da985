//! Finder API: node discovery over the template namespace and aligned multi-series fetches.

use crate::cache::{CacheStats, QueryCache};
use crate::error::FinderError;
use crate::fetch::{
    align, derive_step, plan_batches, FetchRequest, FetchResult, StepPolicy, TimeInfo,
};
use crate::index::{ChildValue, NamespaceIndex};
use crate::node::Node;
use crate::pattern::Query;
use crate::storage::SeriesStore;
use crate::telemetry::{finder_metrics, noop_event_listener, FinderEvent, FinderEventListener};
use crate::template::{CompiledTemplates, DefaultTagPolicy};
use crate::types::{seconds_to_timestamp, Deadline, Selector, SeriesRow, Timestamp, Value};

use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Configuration options for the Finder
#[derive(Debug, Clone)]
pub struct FinderConfig {
    /// Template specifications in priority order (`[filter] pattern [k=v,...]`).
    pub templates: Vec<String>,
    /// How static template tags take part in path mapping.
    pub default_tag_policy: DefaultTagPolicy,
    /// Step selection for fetches that do not name one.
    pub step: StepPolicy,
    /// Per-call timeout applied when the caller supplies no deadline.
    pub query_timeout: Option<Duration>,
    /// Enables result memoization when set.
    pub cache_ttl: Option<Duration>,
    /// Upper bound on cached results per cache.
    pub cache_max_entries: usize,
    /// Structured event hook for observability (no-op by default).
    pub event_listener: Arc<dyn FinderEventListener>,
}

impl Default for FinderConfig {
    fn default() -> Self {
        FinderConfig {
            templates: vec!["measurement*".to_string()],
            default_tag_policy: DefaultTagPolicy::Filter,
            step: StepPolicy::default(),
            query_timeout: None,
            cache_ttl: None,
            cache_max_entries: 1024,
            event_listener: noop_event_listener(),
        }
    }
}

/// Per-call options for node discovery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FindOptions {
    /// Overrides the configured timeout.
    pub deadline: Option<Deadline>,
}

/// Hit/miss counters of the finder's two result caches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FinderCacheStats {
    pub nodes: CacheStats,
    pub fetches: CacheStats,
}

/// Maps dotted paths onto a tag-structured store.
///
/// A `Finder` is immutable after construction and can be shared between threads; every
/// call takes its own deadline and never observes a partially failed result.
#[derive(Debug)]
pub struct Finder {
    templates: Arc<CompiledTemplates>,
    index: NamespaceIndex,
    store: Arc<dyn SeriesStore>,
    node_cache: Option<QueryCache<Vec<Node>>>,
    fetch_cache: Option<QueryCache<FetchResult>>,
    config: FinderConfig,
}

impl Finder {
    /// Compiles the configured templates and binds them to `store`.
    ///
    /// # Errors
    /// Returns `TemplateSyntax` for the first malformed template, or `ConfigError` for an
    /// empty template list or a step policy with zero values. Nothing is built on failure.
    pub fn new(config: FinderConfig, store: Arc<dyn SeriesStore>) -> Result<Self, FinderError> {
        config.step.validate()?;
        let templates = Arc::new(CompiledTemplates::compile(
            &config.templates,
            config.default_tag_policy,
        )?);
        config.event_listener.on_event(FinderEvent::TemplatesCompiled {
            count: templates.len(),
        });

        let (node_cache, fetch_cache) = match config.cache_ttl {
            Some(ttl) => (
                Some(QueryCache::new(ttl, config.cache_max_entries)),
                Some(QueryCache::new(ttl, config.cache_max_entries)),
            ),
            None => (None, None),
        };

        Ok(Finder {
            index: NamespaceIndex::new(Arc::clone(&templates), Arc::clone(&store)),
            templates,
            store,
            node_cache,
            fetch_cache,
            config,
        })
    }

    pub fn templates(&self) -> &CompiledTemplates {
        &self.templates
    }

    /// Returns a reference to the configuration the finder was built with.
    pub fn get_config(&self) -> &FinderConfig {
        &self.config
    }

    /// Cache counters, or `None` when caching is disabled.
    pub fn cache_stats(&self) -> Option<FinderCacheStats> {
        match (&self.node_cache, &self.fetch_cache) {
            (Some(nodes), Some(fetches)) => Some(FinderCacheStats {
                nodes: nodes.stats(),
                fetches: fetches.stats(),
            }),
            _ => None,
        }
    }

    /// Finds the namespace nodes matching a dotted glob pattern.
    ///
    /// # Arguments
    /// * `pattern` - Dotted query such as `servers.*.cpu` or `X.{a,b}.mem*`.
    ///
    /// # Returns
    /// * `Ok(Vec<Node>)` sorted by path, possibly empty.
    ///
    /// # Errors
    /// Returns `InvalidPattern` for a malformed query, `DeadlineExceeded` when the
    /// configured timeout expires, or the store's error if any lookup fails.
    pub fn find_nodes(&self, pattern: &str) -> Result<Vec<Node>, FinderError> {
        self.find_nodes_with(pattern, FindOptions::default())
    }

    /// Same as [`Finder::find_nodes`] with an explicit deadline.
    pub fn find_nodes_with(
        &self,
        pattern: &str,
        options: FindOptions,
    ) -> Result<Vec<Node>, FinderError> {
        let started = Instant::now();
        let query = Query::parse(pattern)?;
        let signature = format!("find:{}", query.as_str());
        if let Some(hit) = self.cached(self.node_cache.as_ref(), &signature) {
            return Ok(hit);
        }

        let deadline = options.deadline.unwrap_or_else(|| self.default_deadline());
        let nodes = self
            .discover(&query, deadline)
            .map_err(|e| self.report_failure("find", e))?;

        let elapsed = started.elapsed();
        finder_metrics::record_find(elapsed, nodes.len() as u64);
        self.config.event_listener.on_event(FinderEvent::FindCompleted {
            pattern: query.as_str().to_string(),
            nodes: nodes.len(),
            elapsed,
        });
        if let Some(cache) = &self.node_cache {
            cache.insert(signature, nodes.clone());
        }
        Ok(nodes)
    }

    /// Level-by-level expansion of the query over the namespace index.
    fn discover(&self, query: &Query, deadline: Deadline) -> Result<Vec<Node>, FinderError> {
        let last = query.depth() - 1;
        let mut frontier: Vec<Vec<String>> = vec![Vec::new()];
        // path -> (is_leaf, origin templates)
        let mut found: BTreeMap<String, (bool, Vec<usize>)> = BTreeMap::new();

        for (depth, segment) in query.segments().iter().enumerate() {
            deadline.check()?;
            let expanded: Vec<(Vec<String>, Vec<ChildValue>)> = frontier
                .par_iter()
                .map(|prefix| {
                    self.index
                        .child_values(prefix, deadline)
                        .map(|children| (prefix.clone(), children))
                })
                .collect::<Result<Vec<_>, _>>()?;

            let mut next = Vec::new();
            for (prefix, children) in expanded {
                for child in children.into_iter().filter(|c| segment.matches(&c.value)) {
                    let mut path = prefix.clone();
                    path.push(child.value);
                    if depth < last {
                        if !child.is_leaf {
                            next.push(path);
                        }
                        continue;
                    }
                    let entry = found
                        .entry(path.join("."))
                        .or_insert_with(|| (true, Vec::new()));
                    entry.0 &= child.is_leaf;
                    for t in child.leaf_templates {
                        if !entry.1.contains(&t) {
                            entry.1.push(t);
                        }
                    }
                }
            }
            if depth < last && next.is_empty() {
                return Ok(Vec::new());
            }
            frontier = next;
        }

        Ok(found
            .into_iter()
            .map(|(path, (is_leaf, mut origin))| {
                if is_leaf {
                    origin.sort_unstable();
                    Node::Leaf { path, origin }
                } else {
                    Node::Branch { path }
                }
            })
            .collect())
    }

    /// Fetches aligned series for leaf nodes over `[start, end]` (epoch seconds).
    ///
    /// # Errors
    /// See [`Finder::fetch_multi_with`].
    pub fn fetch_multi(
        &self,
        nodes: &[Node],
        start: u64,
        end: u64,
    ) -> Result<FetchResult, FinderError> {
        self.fetch_multi_with(nodes, FetchRequest::new(start, end))
    }

    /// Fetches aligned series for leaf nodes.
    ///
    /// All series share one grid: `floor((end - start) / step) + 1` buckets starting at
    /// `start`. Results are keyed by node path. A leaf reads only the series whose tag
    /// set is exactly what its template binds; series with further tags are not mixed in.
    ///
    /// # Errors
    /// Returns `InvalidNodeKind` for a branch node, `InvalidTimeRange` if `start > end`,
    /// `ConfigError` for a zero step, `AmbiguousTemplateMatch` / `UnresolvablePath` when
    /// a leaf cannot be mapped to exactly one series, and `DeadlineExceeded` or the
    /// store's error if reading fails. No partial result is ever returned.
    pub fn fetch_multi_with(
        &self,
        nodes: &[Node],
        request: FetchRequest,
    ) -> Result<FetchResult, FinderError> {
        let started = Instant::now();
        if request.start > request.end {
            return Err(FinderError::InvalidTimeRange {
                start: request.start,
                end: request.end,
            });
        }
        if request.step == Some(0) {
            return Err(FinderError::ConfigError("fetch step must be positive".to_string()));
        }

        let mut leaves: Vec<(&str, &[usize])> = Vec::with_capacity(nodes.len());
        for node in nodes {
            match node {
                Node::Leaf { path, origin } => leaves.push((path.as_str(), origin.as_slice())),
                Node::Branch { path } => return Err(FinderError::InvalidNodeKind(path.clone())),
            }
        }
        if leaves.is_empty() {
            return Ok(FetchResult {
                time_info: TimeInfo {
                    start: request.start,
                    end: request.end,
                    step: request.step.unwrap_or_else(|| self.config.step.default_step()),
                },
                data: BTreeMap::new(),
            });
        }

        let mut resolved: Vec<(&str, usize)> = Vec::with_capacity(leaves.len());
        for (path, origin) in leaves {
            let (template, _) = self.templates.resolve_template(path, origin).map_err(|e| {
                if let FinderError::AmbiguousTemplateMatch { path, templates } = &e {
                    self.config
                        .event_listener
                        .on_event(FinderEvent::AmbiguousTemplateMatch {
                            path: path.clone(),
                            templates: templates.clone(),
                        });
                }
                e
            })?;
            resolved.push((path, template));
        }

        let signature = fetch_signature(&request, &resolved);
        if let Some(hit) = self.cached(self.fetch_cache.as_ref(), &signature) {
            return Ok(hit);
        }

        let deadline = request.deadline.unwrap_or_else(|| self.default_deadline());
        let result = self
            .fetch_leaves(&resolved, &request, deadline)
            .map_err(|e| self.report_failure("fetch", e))?;

        let elapsed = started.elapsed();
        let points = result
            .data
            .values()
            .map(|series| series.iter().filter(|v| v.is_some()).count() as u64)
            .sum();
        finder_metrics::record_fetch(elapsed, points);
        self.config.event_listener.on_event(FinderEvent::FetchCompleted {
            series: result.data.len(),
            step: result.time_info.step,
            elapsed,
        });
        if let Some(cache) = &self.fetch_cache {
            cache.insert(signature, result.clone());
        }
        Ok(result)
    }

    fn fetch_leaves(
        &self,
        leaves: &[(&str, usize)],
        request: &FetchRequest,
        deadline: Deadline,
    ) -> Result<FetchResult, FinderError> {
        let selectors: BTreeMap<String, Selector> = leaves
            .par_iter()
            .map(|&(path, template)| {
                self.index
                    .series_selector(template, path, deadline)
                    .map(|selector| (path.to_string(), selector))
            })
            .collect::<Result<_, _>>()?;
        deadline.check()?;

        let range = seconds_to_timestamp(request.start)..=seconds_to_timestamp(request.end);
        let batches = plan_batches(selectors.values());
        let fetched: HashMap<String, Vec<SeriesRow>> = batches
            .par_iter()
            .map(|(measurement, filters)| {
                finder_metrics::record_store_query();
                self.store
                    .query_rows(measurement, filters, range.clone(), deadline)
                    .map(|rows| (measurement.clone(), rows))
                    .map_err(|e| {
                        finder_metrics::record_store_error();
                        e
                    })
            })
            .collect::<Result<HashMap<_, _>, _>>()?;
        deadline.check()?;

        let per_path: BTreeMap<String, Vec<(Timestamp, Value)>> = selectors
            .into_iter()
            .map(|(path, selector)| {
                let mut rows: Vec<(Timestamp, Value)> = fetched
                    .get(&selector.measurement)
                    .map(|rows| {
                        rows.iter()
                            .filter(|row| row.tags == selector.tags)
                            .map(|row| (row.timestamp, row.value))
                            .collect()
                    })
                    .unwrap_or_default();
                rows.sort_by_key(|&(ts, _)| ts);
                (path, rows)
            })
            .collect();

        let step = match (request.step, self.config.step) {
            (Some(step), _) => step,
            (None, StepPolicy::Fixed { step }) => step,
            (
                None,
                StepPolicy::Derive {
                    floor,
                    sample_series,
                    fallback,
                },
            ) => derive_step(
                per_path.values().take(sample_series).map(Vec::as_slice),
                floor,
            )
            .unwrap_or_else(|| fallback.max(floor)),
        };
        let time_info = TimeInfo {
            start: request.start,
            end: request.end,
            step,
        };

        let data = per_path
            .into_iter()
            .map(|(path, rows)| (path, align(&rows, &time_info)))
            .collect();
        Ok(FetchResult { time_info, data })
    }

    fn default_deadline(&self) -> Deadline {
        self.config
            .query_timeout
            .map_or_else(Deadline::none, Deadline::after)
    }

    fn cached<V: Clone>(&self, cache: Option<&QueryCache<V>>, signature: &str) -> Option<V> {
        let cache = cache?;
        let hit = cache.get(signature);
        finder_metrics::record_cache(hit.is_some());
        let event = if hit.is_some() {
            FinderEvent::CacheHit {
                signature: signature.to_string(),
            }
        } else {
            FinderEvent::CacheMiss {
                signature: signature.to_string(),
            }
        };
        self.config.event_listener.on_event(event);
        hit
    }

    fn report_failure(&self, operation: &'static str, err: FinderError) -> FinderError {
        match &err {
            FinderError::DeadlineExceeded => self
                .config
                .event_listener
                .on_event(FinderEvent::DeadlineExceeded { operation }),
            FinderError::StoreUnavailable(_) | FinderError::LockError(_) => {
                self.config.event_listener.on_event(FinderEvent::StoreQueryFailed {
                    operation,
                    error: err.to_string(),
                })
            }
            _ => {}
        }
        err
    }
}

/// `fetch:<start>:<end>:<step|auto>:<sorted path@template list>`.
fn fetch_signature(request: &FetchRequest, leaves: &[(&str, usize)]) -> String {
    let mut paths: Vec<String> = leaves
        .iter()
        .map(|(path, template)| format!("{}@{}", path, template))
        .collect();
    paths.sort_unstable();
    paths.dedup();
    let step = request
        .step
        .map_or_else(|| "auto".to_string(), |s| s.to_string());
    format!(
        "fetch:{}:{}:{}:{}",
        request.start,
        request.end,
        step,
        paths.join(",")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStore;
    use crate::types::TagSet;
    use std::sync::Mutex;

    fn tags(pairs: &[(&str, &str)]) -> TagSet {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn finder(specs: &[&str], store: InMemoryStore) -> Finder {
        let config = FinderConfig {
            templates: specs.iter().map(|s| s.to_string()).collect(),
            ..FinderConfig::default()
        };
        Finder::new(config, Arc::new(store)).unwrap()
    }

    #[derive(Debug, Default)]
    struct Recorder(Mutex<Vec<FinderEvent>>);

    impl FinderEventListener for Recorder {
        fn on_event(&self, event: FinderEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    #[test]
    fn new_rejects_bad_templates_and_steps() {
        let store: Arc<dyn SeriesStore> = Arc::new(InMemoryStore::new());
        let bad = FinderConfig {
            templates: vec!["host.field".to_string()],
            ..FinderConfig::default()
        };
        assert!(matches!(
            Finder::new(bad, Arc::clone(&store)),
            Err(FinderError::TemplateSyntax { .. })
        ));
        let zero_step = FinderConfig {
            step: StepPolicy::Fixed { step: 0 },
            ..FinderConfig::default()
        };
        assert!(matches!(
            Finder::new(zero_step, store),
            Err(FinderError::ConfigError(_))
        ));
    }

    #[test]
    fn non_final_depths_keep_only_branches() {
        let store = InMemoryStore::new();
        store.insert("cpu", 1, 1.0, tags(&[("host", "a")])).unwrap();
        store.insert("mem.used", 1, 1.0, tags(&[("host", "a")])).unwrap();
        let f = finder(&["host.measurement*"], store);

        let nodes = f.find_nodes("a.*.*").unwrap();
        assert_eq!(nodes, vec![Node::Leaf { path: "a.mem.used".into(), origin: vec![0] }]);

        let nodes = f.find_nodes("a.*").unwrap();
        assert_eq!(
            nodes,
            vec![
                Node::Leaf { path: "a.cpu".into(), origin: vec![0] },
                Node::branch("a.mem"),
            ]
        );
    }

    #[test]
    fn found_leaves_fetch_through_their_origin() {
        let store = InMemoryStore::new();
        store
            .insert("cpu", seconds_to_timestamp(120), 7.0, tags(&[("host", "a")]))
            .unwrap();
        let f = finder(&["host.measurement"], store);
        let leaves = f.find_nodes("a.cpu").unwrap();
        let result = f.fetch_multi(&leaves, 0, 240).unwrap();
        assert_eq!(result.time_info, TimeInfo { start: 0, end: 240, step: 60 });
        assert_eq!(result.data["a.cpu"], vec![None, None, Some(7.0), None, None]);
    }

    #[test]
    fn derived_step_follows_sample_spacing() {
        let store = InMemoryStore::new();
        for secs in [0u64, 10, 20, 30] {
            store
                .insert("cpu", seconds_to_timestamp(secs), secs as f64, tags(&[("host", "a")]))
                .unwrap();
        }
        let config = FinderConfig {
            templates: vec!["host.measurement".to_string()],
            step: StepPolicy::Derive { floor: 5, sample_series: 2, fallback: 60 },
            ..FinderConfig::default()
        };
        let f = Finder::new(config, Arc::new(store)).unwrap();
        let result = f.fetch_multi(&[Node::leaf("a.cpu")], 0, 30).unwrap();
        assert_eq!(result.time_info.step, 10);
        assert_eq!(result.data["a.cpu"], vec![Some(0.0), Some(10.0), Some(20.0), Some(30.0)]);

        let empty = f.fetch_multi(&[Node::leaf("b.cpu")], 0, 30).unwrap();
        assert_eq!(empty.time_info.step, 60);
        assert_eq!(empty.data["b.cpu"], vec![None]);
    }

    #[test]
    fn cache_serves_repeated_queries_and_reports_events() {
        let store = InMemoryStore::new();
        store.insert("cpu", 1, 1.0, tags(&[("host", "a")])).unwrap();
        let recorder = Arc::new(Recorder::default());
        let config = FinderConfig {
            templates: vec!["host.measurement".to_string()],
            cache_ttl: Some(Duration::from_secs(60)),
            event_listener: recorder.clone(),
            ..FinderConfig::default()
        };
        let f = Finder::new(config, Arc::new(store)).unwrap();
        let first = f.find_nodes("*").unwrap();
        let second = f.find_nodes("*").unwrap();
        assert_eq!(first, second);

        let events = recorder.0.lock().unwrap();
        assert_eq!(events[0], FinderEvent::TemplatesCompiled { count: 1 });
        assert!(events.contains(&FinderEvent::CacheMiss { signature: "find:*".into() }));
        assert!(events.contains(&FinderEvent::CacheHit { signature: "find:*".into() }));
        let completed = events
            .iter()
            .filter(|e| matches!(e, FinderEvent::FindCompleted { .. }))
            .count();
        assert_eq!(completed, 1);
    }

    #[test]
    fn fetch_signature_is_order_independent() {
        let request = FetchRequest::new(10, 20).with_step(5);
        let a = fetch_signature(&request, &[("b.cpu", 0), ("a.cpu", 0), ("b.cpu", 0)]);
        let b = fetch_signature(&request, &[("a.cpu", 0), ("b.cpu", 0)]);
        assert_eq!(a, b);
        assert_eq!(a, "fetch:10:20:5:a.cpu@0,b.cpu@0");
        assert_eq!(
            fetch_signature(&FetchRequest::new(1, 2), &[("x", 3)]),
            "fetch:1:2:auto:x@3"
        );
    }

    #[test]
    fn cached_fetch_keeps_leaves_of_different_templates_apart() {
        let store = InMemoryStore::new();
        store
            .insert("cpu", seconds_to_timestamp(60), 1.0, tags(&[("host", "a")]))
            .unwrap();
        store
            .insert("cpu", seconds_to_timestamp(60), 2.0, tags(&[("region", "a")]))
            .unwrap();
        let config = FinderConfig {
            templates: vec!["host.measurement".to_string(), "region.measurement".to_string()],
            cache_ttl: Some(Duration::from_secs(60)),
            ..FinderConfig::default()
        };
        let f = Finder::new(config, Arc::new(store)).unwrap();

        let by_host = Node::Leaf { path: "a.cpu".into(), origin: vec![0] };
        let by_region = Node::Leaf { path: "a.cpu".into(), origin: vec![1] };
        let host = f.fetch_multi(&[by_host.clone()], 0, 120).unwrap();
        let region = f.fetch_multi(&[by_region], 0, 120).unwrap();
        assert_eq!(host.data["a.cpu"], vec![None, Some(1.0), None]);
        assert_eq!(region.data["a.cpu"], vec![None, Some(2.0), None]);
        // Repeating the first fetch is served from the cache unchanged.
        assert_eq!(f.fetch_multi(&[by_host], 0, 120).unwrap(), host);
    }

    #[test]
    fn rows_of_series_with_extra_tags_stay_out_of_a_leaf() {
        let store = InMemoryStore::new();
        store
            .insert("cpu", seconds_to_timestamp(60), 1.0, tags(&[("host", "a")]))
            .unwrap();
        store
            .insert(
                "cpu",
                seconds_to_timestamp(120),
                5.0,
                tags(&[("host", "a"), ("core", "0")]),
            )
            .unwrap();
        let f = finder(&["host.measurement"], store);
        let leaves = f.find_nodes("a.*").unwrap();
        assert_eq!(leaves, vec![Node::Leaf { path: "a.cpu".into(), origin: vec![0] }]);
        let result = f.fetch_multi(&leaves, 0, 180).unwrap();
        assert_eq!(result.data["a.cpu"], vec![None, Some(1.0), None, None]);
    }

    #[test]
    fn cache_stats_count_lookups() {
        let store = InMemoryStore::new();
        store.insert("cpu", 1, 1.0, tags(&[("host", "a")])).unwrap();
        let uncached = finder(&["host.measurement"], InMemoryStore::new());
        assert_eq!(uncached.cache_stats(), None);

        let config = FinderConfig {
            templates: vec!["host.measurement".to_string()],
            cache_ttl: Some(Duration::from_secs(60)),
            ..FinderConfig::default()
        };
        let f = Finder::new(config, Arc::new(store)).unwrap();
        f.find_nodes("*").unwrap();
        f.find_nodes("*").unwrap();
        f.fetch_multi(&[Node::leaf("a.cpu")], 0, 60).unwrap();
        let stats = f.cache_stats().unwrap();
        assert_eq!(stats.nodes, CacheStats { hits: 1, misses: 1 });
        assert_eq!(stats.fetches, CacheStats { hits: 0, misses: 1 });
    }
}

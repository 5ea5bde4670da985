use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "prometheus")]
use std::sync::atomic::{AtomicBool, Ordering};
#[cfg(feature = "prometheus")]
use std::sync::Mutex;
#[cfg(feature = "prometheus")]
use std::thread::JoinHandle;

/// Structured, in-process event hook for observability.
///
/// This crate is a library; emitting logs directly (e.g. `println!`) is not acceptable for
/// production. Instead, callers can provide an implementation that forwards these events to
/// `tracing`, `log`, metrics, or custom sinks.
pub trait FinderEventListener: std::fmt::Debug + Send + Sync + 'static {
    fn on_event(&self, event: FinderEvent);
}

/// Structured events emitted by the finder.
#[derive(Debug, Clone, PartialEq)]
pub enum FinderEvent {
    TemplatesCompiled { count: usize },

    FindCompleted { pattern: String, nodes: usize, elapsed: Duration },
    FetchCompleted { series: usize, step: u64, elapsed: Duration },

    StoreQueryFailed { operation: &'static str, error: String },
    DeadlineExceeded { operation: &'static str },
    AmbiguousTemplateMatch { path: String, templates: Vec<usize> },

    CacheHit { signature: String },
    CacheMiss { signature: String },
}

#[derive(Debug)]
pub struct NoopEventListener;

impl FinderEventListener for NoopEventListener {
    #[inline]
    fn on_event(&self, _event: FinderEvent) {}
}

pub fn noop_event_listener() -> Arc<dyn FinderEventListener> {
    Arc::new(NoopEventListener)
}

/// Metrics instrumentation and in-process scraping.
///
/// Emitting metrics is a no-op until a recorder is installed. With the `prometheus`
/// feature, callers can render Prometheus exposition text in-process.
pub mod finder_metrics {
    use super::*;

    use ::metrics::{describe_counter, describe_histogram, Unit};

    #[cfg(feature = "prometheus")]
    use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

    // Counters are exposed as `<name>_total` by the Prometheus exporter.
    pub const FIND_DURATION_SECONDS: &str = "tagtree_find_duration_seconds";
    pub const FETCH_DURATION_SECONDS: &str = "tagtree_fetch_duration_seconds";
    pub const NODES_RETURNED: &str = "tagtree_nodes_returned";
    pub const POINTS_ALIGNED: &str = "tagtree_points_aligned";
    pub const STORE_QUERIES: &str = "tagtree_store_queries";
    pub const STORE_ERRORS: &str = "tagtree_store_errors";
    pub const CACHE_HITS: &str = "tagtree_cache_hits";
    pub const CACHE_MISSES: &str = "tagtree_cache_misses";

    /// Handle to the in-process Prometheus recorder/scrape renderer.
    ///
    /// This does **not** start an HTTP server. Call [`InProcessPrometheus::render`] to scrape.
    #[cfg(feature = "prometheus")]
    pub struct InProcessPrometheus {
        handle: PrometheusHandle,
        stop: Arc<AtomicBool>,
        upkeep_thread: Mutex<Option<JoinHandle<()>>>,
    }

    #[cfg(feature = "prometheus")]
    impl InProcessPrometheus {
        /// Installs a global Prometheus recorder (once per process) and starts a small upkeep thread.
        pub fn install(upkeep_interval: Duration) -> Result<Self, MetricsInitError> {
            describe_all();

            let handle = PrometheusBuilder::new()
                .install_recorder()
                .map_err(MetricsInitError::from_build_error)?;

            let stop = Arc::new(AtomicBool::new(false));
            let stop_clone = stop.clone();
            let handle_clone = handle.clone();
            let upkeep_thread = std::thread::Builder::new()
                .name("tagtree-metrics-upkeep".to_string())
                .spawn(move || {
                    while !stop_clone.load(Ordering::Relaxed) {
                        std::thread::sleep(upkeep_interval);
                        handle_clone.run_upkeep();
                    }
                })
                .map_err(|e| MetricsInitError::ThreadSpawn(e.to_string()))?;

            Ok(Self {
                handle,
                stop,
                upkeep_thread: Mutex::new(Some(upkeep_thread)),
            })
        }

        /// Renders the current metrics in the Prometheus text exposition format.
        pub fn render(&self) -> String {
            self.handle.render()
        }
    }

    #[cfg(feature = "prometheus")]
    impl Drop for InProcessPrometheus {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::Relaxed);
            if let Ok(mut guard) = self.upkeep_thread.lock() {
                if let Some(t) = guard.take() {
                    let _ = t.join();
                }
            }
        }
    }

    #[cfg(feature = "prometheus")]
    #[derive(Debug, thiserror::Error)]
    pub enum MetricsInitError {
        #[error("metrics recorder already installed")]
        AlreadyInstalled,
        #[error("failed to install prometheus recorder: {0}")]
        Install(String),
        #[error("failed to spawn upkeep thread: {0}")]
        ThreadSpawn(String),
    }

    #[cfg(feature = "prometheus")]
    impl MetricsInitError {
        fn from_build_error(e: BuildError) -> Self {
            match e {
                BuildError::FailedToSetGlobalRecorder(_) => MetricsInitError::AlreadyInstalled,
                other => MetricsInitError::Install(other.to_string()),
            }
        }
    }

    #[inline]
    pub fn record_find(duration: Duration, nodes: u64) {
        ::metrics::histogram!(FIND_DURATION_SECONDS).record(duration.as_secs_f64());
        if nodes > 0 {
            ::metrics::counter!(NODES_RETURNED).increment(nodes);
        }
    }

    #[inline]
    pub fn record_fetch(duration: Duration, points: u64) {
        ::metrics::histogram!(FETCH_DURATION_SECONDS).record(duration.as_secs_f64());
        if points > 0 {
            ::metrics::counter!(POINTS_ALIGNED).increment(points);
        }
    }

    #[inline]
    pub fn record_store_query() {
        ::metrics::counter!(STORE_QUERIES).increment(1);
    }

    #[inline]
    pub fn record_store_error() {
        ::metrics::counter!(STORE_ERRORS).increment(1);
    }

    #[inline]
    pub fn record_cache(hit: bool) {
        if hit {
            ::metrics::counter!(CACHE_HITS).increment(1);
        } else {
            ::metrics::counter!(CACHE_MISSES).increment(1);
        }
    }

    pub fn describe_all() {
        describe_counter!(
            NODES_RETURNED,
            Unit::Count,
            "Total number of nodes returned by Finder::find_nodes."
        );
        describe_counter!(
            POINTS_ALIGNED,
            Unit::Count,
            "Total number of non-null samples placed on fetch grids."
        );
        describe_counter!(
            STORE_QUERIES,
            Unit::Count,
            "Total number of distinct-value and row queries issued to the store."
        );
        describe_counter!(
            STORE_ERRORS,
            Unit::Count,
            "Total number of store queries that failed."
        );
        describe_counter!(CACHE_HITS, Unit::Count, "Query cache hits.");
        describe_counter!(CACHE_MISSES, Unit::Count, "Query cache misses.");

        describe_histogram!(
            FIND_DURATION_SECONDS,
            Unit::Seconds,
            "End-to-end latency of Finder::find_nodes."
        );
        describe_histogram!(
            FETCH_DURATION_SECONDS,
            Unit::Seconds,
            "End-to-end latency of Finder::fetch_multi."
        );
    }
}

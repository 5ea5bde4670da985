//! Command-line front end for the tagtree finder.
//!
//! Loads configuration from (in precedence order): defaults, config file, environment variables
//! (`TAGTREE_*`), and CLI flags. Seeds an in-memory store from a line-protocol file, then
//! validates the configuration, lists nodes, or prints aligned series.

use std::fs::File as FsFile;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::Parser;
use config::{Config, Environment, File};
use tagtree::line_protocol::load_into;
use tagtree::telemetry::{noop_event_listener, FinderEvent, FinderEventListener};
use tagtree::{
    DefaultTagPolicy, FetchRequest, Finder, FinderConfig, InMemoryStore, Node, StepPolicy,
};

// ---------- CLI ----------

/// Maps dotted paths onto a tag-structured time-series store.
#[derive(Parser, Debug)]
#[command(name = "tagtree", version, about)]
pub struct Cli {
    /// Path to config file (TOML). If omitted, no file is loaded unless default path exists.
    #[arg(long, env = "TAGTREE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Do not load any config file; use defaults + env + CLI only.
    #[arg(long, default_value_t = false)]
    pub no_config: bool,

    /// Load and validate config (file + env + CLI), print the compiled templates, then exit.
    #[arg(long, default_value_t = false)]
    pub validate_config: bool,

    /// Template specification; repeat to declare several (replaces file/env templates).
    #[arg(long = "template")]
    pub templates: Vec<String>,

    /// Static template tags: `filter` (default) or `expand`.
    #[arg(long)]
    pub default_tags: Option<String>,

    /// Fixed fetch step in seconds.
    #[arg(long)]
    pub step: Option<u64>,

    /// Line-protocol file to load into the in-memory store.
    #[arg(long)]
    pub seed: Option<PathBuf>,

    /// Print the nodes matching this pattern.
    #[arg(long)]
    pub find: Option<String>,

    /// Print aligned series for the leaves matching this pattern.
    #[arg(long)]
    pub fetch: Option<String>,

    /// Fetch start, epoch seconds (default: one hour before `--until`).
    #[arg(long)]
    pub from: Option<u64>,

    /// Fetch end, epoch seconds (default: now).
    #[arg(long)]
    pub until: Option<u64>,

    /// Print finder events and cache counters to stderr.
    #[arg(long, default_value_t = false)]
    pub verbose: bool,
}

// ---------- File/env config (all optional for partial config) ----------

/// Top-level config as read from file + env. Every field optional for layering.
#[derive(Debug, Default, serde::Deserialize)]
pub struct FileConfig {
    pub templates: Option<Vec<String>>,
    pub default_tag_policy: Option<DefaultTagPolicy>,
    /// Shorthand for a fixed step.
    pub step_secs: Option<u64>,
    /// Table form in TOML: `[step]` with `type = "fixed", step = 60` or
    /// `type = "derive", floor = 10, sample_series = 4, fallback = 60`.
    pub step: Option<StepPolicy>,
    pub query_timeout_ms: Option<u64>,
    pub cache_ttl_secs: Option<u64>,
    pub cache_max_entries: Option<usize>,
    pub seed: Option<String>,
}

/// Forwards finder events to stderr.
#[derive(Debug)]
struct StderrEventListener;

impl FinderEventListener for StderrEventListener {
    fn on_event(&self, event: FinderEvent) {
        eprintln!("event: {:?}", event);
    }
}

fn parse_policy(s: &str) -> Result<DefaultTagPolicy, String> {
    match s {
        "filter" => Ok(DefaultTagPolicy::Filter),
        "expand" => Ok(DefaultTagPolicy::Expand),
        other => Err(format!("invalid default tag policy {:?}: expected filter or expand", other)),
    }
}

/// Load merged config and the seed path. CLI overrides file/env for both.
fn load_finder_config(cli: &Cli) -> Result<(FinderConfig, Option<PathBuf>), String> {
    let mut builder = Config::builder();

    if !cli.no_config {
        if let Some(ref path) = cli.config {
            if !path.exists() {
                return Err(format!("config file not found: {}", path.display()));
            }
            builder = builder.add_source(File::from(path.as_path()).required(false));
        } else {
            let default_path = PathBuf::from("tagtree.toml");
            if default_path.exists() {
                builder = builder.add_source(File::from(default_path.as_path()).required(false));
            }
        }
    }

    builder = builder.add_source(
        Environment::with_prefix("TAGTREE")
            .separator("__")
            .try_parsing(true)
            .ignore_empty(true)
            .list_separator(";")
            .with_list_parse_key("templates"),
    );

    let merged = builder.build().map_err(|e| e.to_string())?;
    let partial: FileConfig = merged.try_deserialize().map_err(|e| e.to_string())?;

    let mut config = FinderConfig::default();
    config.event_listener = if cli.verbose {
        Arc::new(StderrEventListener)
    } else {
        noop_event_listener()
    };
    merge_into_finder_config(&mut config, &partial)?;

    if !cli.templates.is_empty() {
        config.templates = cli.templates.clone();
    }
    if let Some(ref s) = cli.default_tags {
        config.default_tag_policy = parse_policy(s)?;
    }
    if let Some(step) = cli.step {
        config.step = StepPolicy::Fixed { step };
    }

    let seed = cli
        .seed
        .clone()
        .or_else(|| partial.seed.as_ref().map(PathBuf::from));
    Ok((config, seed))
}

/// Merge file/env partial config onto `FinderConfig`. Only overwrites fields that are `Some`.
fn merge_into_finder_config(base: &mut FinderConfig, partial: &FileConfig) -> Result<(), String> {
    if let Some(t) = &partial.templates {
        base.templates = t.clone();
    }
    if let Some(p) = partial.default_tag_policy {
        base.default_tag_policy = p;
    }
    if let (Some(_), Some(_)) = (partial.step_secs, partial.step) {
        return Err("set either step_secs or [step], not both".to_string());
    }
    if let Some(step) = partial.step_secs {
        base.step = StepPolicy::Fixed { step };
    }
    if let Some(step) = partial.step {
        base.step = step;
    }
    if let Some(ms) = partial.query_timeout_ms {
        base.query_timeout = Some(Duration::from_millis(ms));
    }
    if let Some(secs) = partial.cache_ttl_secs {
        base.cache_ttl = Some(Duration::from_secs(secs));
    }
    if let Some(n) = partial.cache_max_entries {
        base.cache_max_entries = n;
    }
    Ok(())
}

fn describe_step(step: &StepPolicy) -> String {
    match step {
        StepPolicy::Fixed { step } => format!("fixed:{}", step),
        StepPolicy::Derive {
            floor,
            sample_series,
            fallback,
        } => format!(
            "derive:floor={},sample_series={},fallback={}",
            floor, sample_series, fallback
        ),
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn format_value(v: &Option<f64>) -> String {
    v.map_or_else(|| "null".to_string(), |x| x.to_string())
}

// ---------- Main ----------

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();
    let (config, seed) = load_finder_config(&cli).map_err(|e| {
        eprintln!("config error: {}", e);
        e
    })?;

    let store = Arc::new(InMemoryStore::new());
    if let Some(ref path) = seed {
        let file = FsFile::open(path).map_err(|e| {
            eprintln!("seed error: {}: {}", path.display(), e);
            e
        })?;
        load_into(&store, BufReader::new(file)).map_err(|e| {
            eprintln!("seed error: {}: {}", path.display(), e);
            e
        })?;
    }

    let finder = Finder::new(config, store.clone()).map_err(|e| {
        eprintln!("config error: {}", e);
        e
    })?;

    if cli.validate_config {
        let config = finder.get_config();
        println!("templates={}", finder.templates().len());
        for (i, template) in finder.templates().iter().enumerate() {
            println!("template[{}]={}", i, template);
        }
        println!("default_tag_policy={:?}", config.default_tag_policy);
        println!("step={}", describe_step(&config.step));
        println!(
            "query_timeout_ms={}",
            config
                .query_timeout
                .map_or_else(|| "none".to_string(), |d| d.as_millis().to_string())
        );
        println!(
            "cache_ttl_secs={}",
            config
                .cache_ttl
                .map_or_else(|| "none".to_string(), |d| d.as_secs().to_string())
        );
        if seed.is_some() {
            println!("series={}", store.series_count()?);
        }
        return Ok(());
    }

    if let Some(ref pattern) = cli.find {
        let nodes = finder.find_nodes(pattern).map_err(|e| {
            eprintln!("find failed: {}", e);
            e
        })?;
        for node in &nodes {
            println!("{}", node);
        }
    }

    if let Some(ref pattern) = cli.fetch {
        let until = cli.until.unwrap_or_else(now_secs);
        let from = cli.from.unwrap_or_else(|| until.saturating_sub(3600));
        let leaves: Vec<Node> = finder
            .find_nodes(pattern)
            .map_err(|e| {
                eprintln!("find failed: {}", e);
                e
            })?
            .into_iter()
            .filter(Node::is_leaf)
            .collect();
        let mut request = FetchRequest::new(from, until);
        request.step = cli.step;
        let result = finder.fetch_multi_with(&leaves, request).map_err(|e| {
            eprintln!("fetch failed: {}", e);
            e
        })?;
        println!(
            "time_info start={} end={} step={}",
            result.time_info.start, result.time_info.end, result.time_info.step
        );
        for (path, series) in &result.data {
            let values: Vec<String> = series.iter().map(format_value).collect();
            println!("{} [{}]", path, values.join(","));
        }
    }

    if cli.verbose {
        if let Some(stats) = finder.cache_stats() {
            eprintln!(
                "cache: nodes hits={} misses={} fetches hits={} misses={}",
                stats.nodes.hits, stats.nodes.misses, stats.fetches.hits, stats.fetches.misses
            );
        }
    }

    Ok(())
}

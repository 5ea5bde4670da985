#![cfg(feature = "prometheus")]

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tagtree::telemetry::finder_metrics::InProcessPrometheus;
use tagtree::{Finder, FinderConfig, InMemoryStore, TagSet};

fn install_prometheus_once() -> &'static InProcessPrometheus {
    static PROM: OnceLock<InProcessPrometheus> = OnceLock::new();
    PROM.get_or_init(|| {
        InProcessPrometheus::install(Duration::from_millis(25))
            .expect("failed to install in-process prometheus recorder")
    })
}

fn parse_sample(rendered: &str, metric: &str) -> Option<f64> {
    for line in rendered.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        let key = parts.next()?;
        let val = parts.next()?;
        // Support exact match and label form: `name{...} value`.
        if key == metric
            || key.starts_with(metric) && key.as_bytes().get(metric.len()).copied() == Some(b'{')
        {
            if let Ok(v) = val.parse::<f64>() {
                return Some(v);
            }
        }
    }
    None
}

fn parse_counter(rendered: &str, base_name: &str) -> f64 {
    parse_sample(rendered, &format!("{}_total", base_name))
        .or_else(|| parse_sample(rendered, base_name))
        .unwrap_or(0.0)
}

#[test]
fn emits_find_fetch_and_store_metrics() {
    let prom = install_prometheus_once();

    let before = prom.render();
    let before_nodes = parse_counter(&before, "tagtree_nodes_returned");
    let before_points = parse_counter(&before, "tagtree_points_aligned");
    let before_queries = parse_counter(&before, "tagtree_store_queries");
    let before_find_count = parse_sample(&before, "tagtree_find_duration_seconds_count").unwrap_or(0.0);
    let before_fetch_count = parse_sample(&before, "tagtree_fetch_duration_seconds_count").unwrap_or(0.0);

    let store = InMemoryStore::new();
    let mut tags = TagSet::new();
    tags.insert("host".to_string(), "a".to_string());
    for i in 0..5u64 {
        store
            .insert("cpu", i * 60_000_000_000, i as f64, tags.clone())
            .expect("insert");
    }
    let config = FinderConfig {
        templates: vec!["host.measurement".to_string()],
        ..FinderConfig::default()
    };
    let finder = Finder::new(config, Arc::new(store)).expect("finder");
    let leaves = finder.find_nodes("a.*").expect("find");
    assert_eq!(leaves.len(), 1);
    finder.fetch_multi(&leaves, 0, 240).expect("fetch");

    // Give the exporter time to run upkeep at least once.
    std::thread::sleep(Duration::from_millis(60));

    let after = prom.render();
    assert!(parse_counter(&after, "tagtree_nodes_returned") >= before_nodes + 1.0);
    assert!(parse_counter(&after, "tagtree_points_aligned") >= before_points + 5.0);
    assert!(parse_counter(&after, "tagtree_store_queries") >= before_queries + 3.0);
    assert!(
        parse_sample(&after, "tagtree_find_duration_seconds_count").unwrap_or(0.0)
            >= before_find_count + 1.0
    );
    assert!(
        parse_sample(&after, "tagtree_fetch_duration_seconds_count").unwrap_or(0.0)
            >= before_fetch_count + 1.0
    );
}

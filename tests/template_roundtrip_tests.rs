use proptest::prelude::*;
use tagtree::{CompiledTemplates, DefaultTagPolicy, TagSet, Template};

fn segment() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_-]{0,7}"
}

fn template_specs() -> impl Strategy<Value = &'static str> {
    prop::sample::select(vec![
        "host.measurement",
        "type.host.measurement*",
        "X type.host.measurement* env=int,region=west",
        "servers.* .host.measurement",
        "region.measurement.host dc=eu",
    ])
}

proptest! {
    /// Every series a template can render maps back to the same selector.
    #[test]
    fn selector_path_roundtrip(
        spec in template_specs(),
        expand in any::<bool>(),
        values in prop::collection::vec(segment(), 3),
        measurement in prop::collection::vec(segment(), 1..4),
    ) {
        let policy = if expand { DefaultTagPolicy::Expand } else { DefaultTagPolicy::Filter };
        let template = Template::parse(spec, policy).unwrap();

        let mut tags: TagSet = template.default_tags().clone();
        let names: Vec<String> = template
            .roles()
            .iter()
            .filter_map(|r| match r {
                tagtree::SegmentRole::Tag(name) => Some(name.clone()),
                _ => None,
            })
            .collect();
        for (name, value) in names.iter().zip(values.iter().cycle()) {
            tags.insert(name.clone(), value.clone());
        }
        // Only greedy templates render dotted measurement names.
        let measurement = if template.is_greedy() {
            measurement.join(".")
        } else {
            measurement[0].clone()
        };

        if let Some(path) = template.series_to_path(&measurement, &tags) {
            let selector = template.path_to_series_selector(&path).unwrap();
            prop_assert_eq!(&selector.measurement, &measurement);
            prop_assert_eq!(&selector.tags, &tags);
            prop_assert_eq!(template.series_to_path(&selector.measurement, &selector.tags), Some(path));
        }
    }

    #[test]
    fn compiled_set_uses_first_matching_template(values in prop::collection::vec(segment(), 2)) {
        let set = CompiledTemplates::compile(
            ["host.measurement", "measurement.host"],
            DefaultTagPolicy::Filter,
        )
        .unwrap();
        let path = values.join(".");
        let selector = set.path_to_series_selector(&path).unwrap();
        prop_assert_eq!(&selector.measurement, &values[1]);
        prop_assert_eq!(selector.tags.get("host"), Some(&values[0]));
    }
}

#[test]
fn filtered_templates_refuse_foreign_paths() {
    let t = Template::parse("X type.host.measurement* env=int", DefaultTagPolicy::Filter).unwrap();
    assert!(t.path_to_series_selector("Y.localhost.cpu").is_none());
    let sel = t.path_to_series_selector("X.localhost.cpu.user").unwrap();
    assert_eq!(sel.measurement, "cpu.user");
    assert_eq!(sel.tags.get("env").map(String::as_str), Some("int"));
}

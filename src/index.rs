//! Namespace index: the tree implied by the templates and the series in the store,
//! computed one level at a time.
//!
//! Nothing is materialized up front. For a resolved prefix, every template that can
//! accept the prefix asks the store for the distinct values of whatever it maps to the
//! next position (a tag or the measurement), constrained by the tags the prefix already
//! binds and the template's static tags.
//!
//! A tag role reads the store key of its own name. When no series under the constraints
//! carries that key, it reads the next unbound key in key order instead, so
//! `type.host.measurement` also describes series tagged `a_test_type`/`b_host`.

use crate::error::FinderError;
use crate::storage::{Constraints, DistinctTarget, SeriesStore};
use crate::telemetry::finder_metrics;
use crate::template::{CompiledTemplates, SegmentRole, Template};
use crate::types::{Deadline, Selector};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// One distinct value at the next position under a prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildValue {
    pub value: String,
    /// True only if every template offering this value ends there.
    pub is_leaf: bool,
    /// Templates under which the value is terminal (declaration indices, ascending).
    pub leaf_templates: Vec<usize>,
}

/// Read-only view over templates + store; shared freely between concurrent callers.
#[derive(Debug, Clone)]
pub struct NamespaceIndex {
    templates: Arc<CompiledTemplates>,
    store: Arc<dyn SeriesStore>,
}

impl NamespaceIndex {
    pub fn new(templates: Arc<CompiledTemplates>, store: Arc<dyn SeriesStore>) -> Self {
        Self { templates, store }
    }

    pub fn templates(&self) -> &CompiledTemplates {
        &self.templates
    }

    /// Distinct next-segment values under `prefix`, sorted by value.
    ///
    /// A value that is terminal under one template and continues under another is
    /// reported as a branch: the caller can still descend through the second template.
    pub fn child_values(
        &self,
        prefix: &[String],
        deadline: Deadline,
    ) -> Result<Vec<ChildValue>, FinderError> {
        deadline.check()?;

        let per_template: Vec<(usize, Vec<(String, bool)>)> = self
            .templates
            .iter()
            .enumerate()
            .collect::<Vec<_>>()
            .into_par_iter()
            .map(|(index, template)| {
                self.template_children(template, prefix, deadline)
                    .map(|values| (index, values))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut merged: BTreeMap<String, ChildValue> = BTreeMap::new();
        for (index, values) in per_template {
            for (value, is_leaf) in values {
                let entry = merged.entry(value.clone()).or_insert_with(|| ChildValue {
                    value,
                    is_leaf: true,
                    leaf_templates: Vec::new(),
                });
                entry.is_leaf &= is_leaf;
                if is_leaf && !entry.leaf_templates.contains(&index) {
                    entry.leaf_templates.push(index);
                }
            }
        }
        Ok(merged.into_values().collect())
    }

    /// Store-side selector for `path` under the template at `template_index`.
    ///
    /// Tag roles are bound to store keys exactly as discovery binds them, so a discovered
    /// leaf always reads the series it was built from.
    ///
    /// # Errors
    /// Returns `UnresolvablePath` when the template does not map `path`, or the store's
    /// error if a key lookup fails.
    pub fn series_selector(
        &self,
        template_index: usize,
        path: &str,
        deadline: Deadline,
    ) -> Result<Selector, FinderError> {
        let unresolvable = || FinderError::UnresolvablePath(path.to_string());
        let template = self.templates.get(template_index).ok_or_else(unresolvable)?;
        let segments: Vec<String> = path.split('.').map(str::to_string).collect();
        if !template.admits_length(segments.len()) {
            return Err(unresolvable());
        }
        let constraints = self
            .bind(template, &segments, deadline)?
            .ok_or_else(unresolvable)?;
        let measurement = if template.is_greedy() {
            segments[template.measurement_position()..].join(".")
        } else {
            constraints.measurement.ok_or_else(unresolvable)?
        };
        Ok(Selector::new(measurement, constraints.tags))
    }

    /// Walks `segments` through the template's roles and returns the store constraints
    /// they bind, or `None` if a filter or literal rejects a segment.
    fn bind(
        &self,
        template: &Template,
        segments: &[String],
        deadline: Deadline,
    ) -> Result<Option<Constraints>, FinderError> {
        let roles = template.roles();
        let greedy = template.is_greedy();
        let mut constraints = Constraints {
            tags: template.default_tags().clone(),
            ..Constraints::default()
        };
        for (i, segment) in segments.iter().enumerate() {
            if !template.filter_accepts(i, segment) {
                return Ok(None);
            }
            match roles.get(i) {
                Some(SegmentRole::Tag(name)) => {
                    let key = self.tag_key(template, name, &constraints, deadline)?;
                    constraints.tags.insert(key, segment.clone());
                }
                Some(SegmentRole::Literal(value)) if value != segment => return Ok(None),
                Some(SegmentRole::Measurement) if !greedy => {
                    constraints.measurement = Some(segment.clone());
                }
                // Greedy measurement components are matched by the caller.
                _ => {}
            }
        }
        Ok(Some(constraints))
    }

    fn tag_key(
        &self,
        template: &Template,
        name: &str,
        constraints: &Constraints,
        deadline: Deadline,
    ) -> Result<String, FinderError> {
        let present = self.distinct(&DistinctTarget::TagKeys, constraints, deadline)?;
        Ok(template.store_key(name, &present, &constraints.tags))
    }

    /// Values one template contributes under `prefix`, with their leaf flag.
    ///
    /// Leaf values are only offered when a series carries exactly the bound tags, so
    /// every leaf names a single series.
    fn template_children(
        &self,
        template: &Template,
        prefix: &[String],
        deadline: Deadline,
    ) -> Result<Vec<(String, bool)>, FinderError> {
        let depth = prefix.len();
        let roles = template.roles();
        let greedy = template.is_greedy();
        if !greedy && depth >= roles.len() {
            return Ok(Vec::new());
        }
        let Some(constraints) = self.bind(template, prefix, deadline)? else {
            return Ok(Vec::new());
        };

        let measurement_pos = template.measurement_position();
        let is_last = depth + 1 == roles.len();
        let narrowed = |last: bool| {
            if last {
                constraints.exactly()
            } else {
                constraints.clone()
            }
        };

        let candidates: Vec<(String, bool)> = if greedy && depth >= measurement_pos {
            // Walk one more component of dotted measurement names.
            let consumed = &prefix[measurement_pos..];
            let names = self.distinct(&DistinctTarget::Measurements, &constraints, deadline)?;
            let exact =
                self.distinct(&DistinctTarget::Measurements, &constraints.exactly(), deadline)?;
            names
                .iter()
                .filter_map(|name| {
                    let components: Vec<&str> = name.split('.').collect();
                    if components.len() <= consumed.len()
                        || components[..consumed.len()]
                            .iter()
                            .zip(consumed)
                            .any(|(a, b)| *a != b.as_str())
                    {
                        return None;
                    }
                    let is_leaf = components.len() == consumed.len() + 1;
                    if is_leaf && !exact.contains(name) {
                        return None;
                    }
                    Some((components[consumed.len()].to_string(), is_leaf))
                })
                .collect()
        } else {
            match &roles[depth] {
                SegmentRole::Tag(name) => {
                    let key = self.tag_key(template, name, &constraints, deadline)?;
                    self.distinct(&DistinctTarget::TagValues(key), &narrowed(is_last), deadline)?
                        .into_iter()
                        .map(|v| (v, is_last))
                        .collect()
                }
                SegmentRole::Measurement => self
                    .distinct(&DistinctTarget::Measurements, &narrowed(is_last), deadline)?
                    .into_iter()
                    .map(|v| (v, is_last))
                    .collect(),
                SegmentRole::Literal(value) => {
                    // Only offered when some series lives under the bound constraints.
                    let exists = !self
                        .distinct(&DistinctTarget::Measurements, &narrowed(is_last), deadline)?
                        .is_empty();
                    if exists {
                        vec![(value.clone(), is_last)]
                    } else {
                        Vec::new()
                    }
                }
                SegmentRole::Skip => Vec::new(),
            }
        };

        Ok(candidates
            .into_iter()
            .filter(|(value, _)| {
                !value.is_empty() && !value.contains('.') && template.filter_accepts(depth, value)
            })
            .collect())
    }

    fn distinct(
        &self,
        target: &DistinctTarget,
        constraints: &Constraints,
        deadline: Deadline,
    ) -> Result<BTreeSet<String>, FinderError> {
        finder_metrics::record_store_query();
        self.store
            .distinct_values(target, constraints, deadline)
            .map_err(|e| {
                finder_metrics::record_store_error();
                e
            })
    }
}

//! Path templates: how the segments of a dotted metric path map onto a measurement name
//! and a set of tags.
//!
//! A template string has the shape `[filter] pattern [tags]`:
//!
//! * `filter` is an optional dotted glob; segment `i` of the filter constrains path
//!   segment `i` (e.g. `servers.*` only applies to paths under `servers`).
//! * `pattern` names the role of every path position: `measurement`, `measurement*`
//!   (the rest of the path, joined with `.`), a tag name, or an empty / `*` segment that
//!   is skipped.
//! * `tags` is a `k=v,k=v` list of static tags every series of the template carries.
//!
//! Templates are tried in declaration order; the first one that maps a path wins.

use crate::error::FinderError;
use crate::pattern::SegmentPattern;
use crate::types::{Selector, TagSet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Role of one path position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentRole {
    /// The segment is the value of this tag.
    Tag(String),
    /// The segment is the measurement name.
    Measurement,
    /// The segment must be exactly this value and binds nothing.
    Literal(String),
    /// The segment is ignored.
    Skip,
}

impl fmt::Display for SegmentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SegmentRole::Tag(name) => write!(f, "tag:{}", name),
            SegmentRole::Measurement => f.write_str("measurement"),
            SegmentRole::Literal(value) => write!(f, "literal:{}", value),
            SegmentRole::Skip => f.write_str("skip"),
        }
    }
}

/// How a template's static tags relate to path segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultTagPolicy {
    /// Static tags only constrain store lookups; they never show up in paths.
    #[default]
    Filter,
    /// Static tag values (sorted by key) are spliced into the path right before the
    /// measurement, as literal segments.
    Expand,
}

/// A single compiled template.
#[derive(Debug, Clone)]
pub struct Template {
    source: String,
    roles: Vec<SegmentRole>,
    /// Positional constraints. Shorter than `roles` when the filter clause is short.
    filter: Vec<SegmentPattern>,
    tags: TagSet,
    greedy: bool,
    measurement_pos: usize,
}

fn syntax(template: &str, reason: impl Into<String>) -> FinderError {
    FinderError::TemplateSyntax {
        template: template.to_string(),
        reason: reason.into(),
    }
}

impl Template {
    /// Parses one template string.
    pub fn parse(spec: &str, policy: DefaultTagPolicy) -> Result<Self, FinderError> {
        let clauses: Vec<&str> = spec.split_whitespace().collect();
        let (filter_clause, pattern_clause, tags_clause) = match clauses.as_slice() {
            [] => return Err(syntax(spec, "empty template")),
            [pattern] => (None, *pattern, None),
            [pattern, tags] if tags.contains('=') => (None, *pattern, Some(*tags)),
            [filter, pattern] => (Some(*filter), *pattern, None),
            [filter, pattern, tags] => (Some(*filter), *pattern, Some(*tags)),
            _ => {
                return Err(syntax(
                    spec,
                    "expected at most three clauses: [filter] pattern [tags]",
                ))
            }
        };

        let tags = match tags_clause {
            Some(clause) => parse_tags(spec, clause)?,
            None => TagSet::new(),
        };

        let mut roles = Vec::new();
        let mut greedy = false;
        let mut seen_tags = BTreeSet::new();
        let segments: Vec<&str> = pattern_clause.split('.').collect();
        for (i, segment) in segments.iter().enumerate() {
            let role = match *segment {
                "measurement" => SegmentRole::Measurement,
                "measurement*" => {
                    if i + 1 != segments.len() {
                        return Err(syntax(spec, "`measurement*` must be the last segment"));
                    }
                    greedy = true;
                    SegmentRole::Measurement
                }
                "field" | "field*" => {
                    return Err(syntax(spec, "field roles are not supported"));
                }
                "" | "*" => SegmentRole::Skip,
                name => {
                    if !valid_tag_name(name) {
                        return Err(syntax(spec, format!("invalid segment {:?}", name)));
                    }
                    if !seen_tags.insert(name) {
                        return Err(syntax(spec, format!("duplicate tag {:?}", name)));
                    }
                    if tags.contains_key(name) {
                        return Err(syntax(
                            spec,
                            format!("tag {:?} is both a segment and a static tag", name),
                        ));
                    }
                    SegmentRole::Tag(name.to_string())
                }
            };
            if role == SegmentRole::Measurement && roles.contains(&SegmentRole::Measurement) {
                return Err(syntax(spec, "duplicate measurement segment"));
            }
            roles.push(role);
        }

        let mut measurement_pos = roles
            .iter()
            .position(|r| *r == SegmentRole::Measurement)
            .ok_or_else(|| syntax(spec, "template has no measurement segment"))?;

        let mut filter = match filter_clause {
            Some(clause) => clause
                .split('.')
                .map(SegmentPattern::parse)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|reason| syntax(spec, format!("bad filter: {}", reason)))?,
            None => Vec::new(),
        };
        if filter.len() > roles.len() && !greedy {
            return Err(syntax(spec, "filter has more segments than the pattern"));
        }

        // A skipped position pinned to a plain token by the filter is a literal.
        for (role, pattern) in roles.iter_mut().zip(filter.iter()) {
            if *role == SegmentRole::Skip {
                if let Some(lit) = pattern.as_literal() {
                    *role = SegmentRole::Literal(lit.to_string());
                }
            }
        }

        if policy == DefaultTagPolicy::Expand && !tags.is_empty() {
            for (offset, value) in tags.values().enumerate() {
                let at = measurement_pos + offset;
                roles.insert(at, SegmentRole::Literal(value.clone()));
                if at < filter.len() {
                    filter.insert(at, SegmentPattern::Any);
                }
            }
            measurement_pos += tags.len();
        }

        Ok(Template {
            source: spec.to_string(),
            roles,
            filter,
            tags,
            greedy,
            measurement_pos,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn roles(&self) -> &[SegmentRole] {
        &self.roles
    }

    /// Static tags applied to every series of this template.
    pub fn default_tags(&self) -> &TagSet {
        &self.tags
    }

    /// True when the trailing measurement swallows the rest of the path.
    pub fn is_greedy(&self) -> bool {
        self.greedy
    }

    pub fn measurement_position(&self) -> usize {
        self.measurement_pos
    }

    /// Number of path segments the template consumes (the minimum when greedy).
    pub fn len(&self) -> usize {
        self.roles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }

    /// Whether the filter clause accepts `value` at path position `position`.
    pub fn filter_accepts(&self, position: usize, value: &str) -> bool {
        self.filter
            .get(position)
            .map_or(true, |pattern| pattern.matches(value))
    }

    /// True if a path of `count` segments has the right shape for this template.
    pub fn admits_length(&self, count: usize) -> bool {
        if self.greedy {
            count >= self.roles.len()
        } else {
            count == self.roles.len()
        }
    }

    /// Maps a dotted path onto the series it names.
    pub fn path_to_series_selector(&self, path: &str) -> Option<Selector> {
        let segments: Vec<&str> = path.split('.').collect();
        self.bind_segments(&segments)
    }

    fn bind_segments(&self, segments: &[&str]) -> Option<Selector> {
        if !self.admits_length(segments.len()) || segments.len() < self.filter.len() {
            return None;
        }
        if segments.iter().any(|s| s.is_empty()) {
            return None;
        }
        if !segments
            .iter()
            .enumerate()
            .all(|(i, s)| self.filter_accepts(i, s))
        {
            return None;
        }

        let mut tags = self.tags.clone();
        let mut measurement = None;
        for (i, role) in self.roles.iter().enumerate() {
            match role {
                SegmentRole::Tag(name) => {
                    tags.insert(name.clone(), segments[i].to_string());
                }
                SegmentRole::Measurement if self.greedy => {
                    measurement = Some(segments[i..].join("."));
                }
                SegmentRole::Measurement => measurement = Some(segments[i].to_string()),
                SegmentRole::Literal(value) => {
                    if segments[i] != value {
                        return None;
                    }
                }
                SegmentRole::Skip => {}
            }
        }
        Some(Selector::new(measurement?, tags))
    }

    /// Names of the tag roles, in path order.
    pub fn tag_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.roles.iter().filter_map(|role| match role {
            SegmentRole::Tag(name) => Some(name.as_str()),
            _ => None,
        })
    }

    /// Store keys read by the tag roles for a series carrying `tags`, in role order.
    ///
    /// A role reads the key of its own name when the series has it. The remaining roles
    /// take the remaining non-static keys in key order. `None` unless every non-static
    /// key of the series is read exactly once.
    pub fn bind_keys<'a>(&self, tags: &'a TagSet) -> Option<Vec<&'a str>> {
        let names: Vec<&str> = self.tag_names().collect();
        let mut free = tags
            .keys()
            .map(String::as_str)
            .filter(|key| !self.tags.contains_key(*key) && !names.contains(key));

        let mut keys = Vec::with_capacity(names.len());
        for name in &names {
            match tags.get_key_value(*name) {
                Some((key, _)) => keys.push(key.as_str()),
                None => keys.push(free.next()?),
            }
        }
        if free.next().is_some() {
            return None;
        }
        Some(keys)
    }

    /// Key the tag role `name` reads, given the tag keys present in the store under the
    /// current constraints and the tags those constraints already bind.
    ///
    /// Same rule as [`Template::bind_keys`], applied one position at a time. Falls back to
    /// `name` itself when nothing is left to bind.
    pub fn store_key(&self, name: &str, present: &BTreeSet<String>, bound: &TagSet) -> String {
        if present.contains(name) {
            return name.to_string();
        }
        present
            .iter()
            .find(|key| {
                !bound.contains_key(*key)
                    && !self.tags.contains_key(*key)
                    && !self.tag_names().any(|n| n == key.as_str())
            })
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }

    /// Builds the dotted path of a stored series. `None` when the template cannot
    /// produce it: a static tag disagrees, the role tags do not account for exactly the
    /// remaining keys, a value contains a dot, the filter rejects the result, or the
    /// template skips a position.
    pub fn series_to_path(&self, measurement: &str, tags: &TagSet) -> Option<String> {
        if self
            .tags
            .iter()
            .any(|(k, v)| tags.get(k).map(String::as_str) != Some(v.as_str()))
        {
            return None;
        }
        let mut keys = self.bind_keys(tags)?.into_iter();

        let mut segments: Vec<&str> = Vec::with_capacity(self.roles.len());
        for role in &self.roles {
            match role {
                SegmentRole::Tag(_) => {
                    let value = tags.get(keys.next()?)?;
                    if value.contains('.') {
                        return None;
                    }
                    segments.push(value.as_str());
                }
                SegmentRole::Measurement if self.greedy => segments.extend(measurement.split('.')),
                SegmentRole::Measurement => {
                    if measurement.contains('.') {
                        return None;
                    }
                    segments.push(measurement);
                }
                SegmentRole::Literal(value) => segments.push(value.as_str()),
                SegmentRole::Skip => return None,
            }
        }

        // Re-check shape and filter on what we built.
        self.bind_segments(&segments)?;
        Some(segments.join("."))
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.filter.is_empty() {
            let filter: Vec<String> = self.filter.iter().map(|p| p.to_string()).collect();
            write!(f, "filter={} ", filter.join("."))?;
        }
        let roles: Vec<String> = self
            .roles
            .iter()
            .map(|r| match r {
                SegmentRole::Measurement if self.greedy => "measurement*".to_string(),
                other => other.to_string(),
            })
            .collect();
        write!(f, "roles=[{}]", roles.join(", "))?;
        if !self.tags.is_empty() {
            let tags: Vec<String> = self.tags.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
            write!(f, " tags={}", tags.join(","))?;
        }
        Ok(())
    }
}

fn valid_tag_name(name: &str) -> bool {
    !name.is_empty()
        && !name
            .chars()
            .any(|c| matches!(c, '*' | '?' | '[' | ']' | '{' | '}' | '=' | ',') || c.is_whitespace())
}

fn parse_tags(spec: &str, clause: &str) -> Result<TagSet, FinderError> {
    let mut tags = TagSet::new();
    for pair in clause.split(',') {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| syntax(spec, format!("malformed tag {:?}, expected key=value", pair)))?;
        if key.is_empty() || value.is_empty() {
            return Err(syntax(spec, format!("malformed tag {:?}, expected key=value", pair)));
        }
        if tags.insert(key.to_string(), value.to_string()).is_some() {
            return Err(syntax(spec, format!("duplicate static tag {:?}", key)));
        }
    }
    Ok(tags)
}

/// The ordered, immutable set of templates an engine works with.
#[derive(Debug, Clone)]
pub struct CompiledTemplates {
    templates: Vec<Template>,
    policy: DefaultTagPolicy,
}

impl CompiledTemplates {
    /// Compiles every template, failing on the first invalid one.
    pub fn compile<I, S>(specs: I, policy: DefaultTagPolicy) -> Result<Self, FinderError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let templates = specs
            .into_iter()
            .map(|spec| Template::parse(spec.as_ref(), policy))
            .collect::<Result<Vec<_>, _>>()?;
        if templates.is_empty() {
            return Err(FinderError::ConfigError("no templates configured".to_string()));
        }
        Ok(Self { templates, policy })
    }

    pub fn policy(&self) -> DefaultTagPolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Template> {
        self.templates.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Template> {
        self.templates.iter()
    }

    /// First template (in declaration order) that maps `path`.
    pub fn path_to_series_selector(&self, path: &str) -> Option<Selector> {
        self.templates
            .iter()
            .find_map(|t| t.path_to_series_selector(path))
    }

    /// First template (in declaration order) that can render the series as a path.
    pub fn series_to_path(&self, measurement: &str, tags: &TagSet) -> Option<String> {
        self.templates
            .iter()
            .find_map(|t| t.series_to_path(measurement, tags))
    }

    /// Strict resolution used before reading data.
    ///
    /// `origin` restricts the candidates to the templates that discovered the path; an
    /// empty `origin` considers all templates. Candidates that disagree on the series
    /// make the path ambiguous.
    pub fn resolve(&self, path: &str, origin: &[usize]) -> Result<Selector, FinderError> {
        self.resolve_template(path, origin).map(|(_, selector)| selector)
    }

    /// Like [`CompiledTemplates::resolve`], also returning the index of the template
    /// that maps the path.
    pub fn resolve_template(
        &self,
        path: &str,
        origin: &[usize],
    ) -> Result<(usize, Selector), FinderError> {
        let mut first: Option<(usize, Selector)> = None;
        let mut candidates = Vec::new();
        let mut disagree = false;

        for (index, template) in self.templates.iter().enumerate() {
            if !origin.is_empty() && !origin.contains(&index) {
                continue;
            }
            let Some(selector) = template.path_to_series_selector(path) else {
                continue;
            };
            candidates.push(index);
            match &first {
                None => first = Some((index, selector)),
                Some((_, existing)) if *existing != selector => disagree = true,
                Some(_) => {}
            }
        }

        if disagree {
            return Err(FinderError::AmbiguousTemplateMatch {
                path: path.to_string(),
                templates: candidates,
            });
        }
        first.ok_or_else(|| FinderError::UnresolvablePath(path.to_string()))
    }
}

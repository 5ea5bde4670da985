//! Dotted query patterns and segment-local glob matching.
//!
//! A query such as `servers.{web,db}*.cpu` is split on `.` and every segment is compiled
//! on its own, so a pattern segment can never match across a dot. Globs and alternations
//! are translated to an anchored regular expression.

use crate::error::FinderError;
use regex::Regex;
use std::fmt;

/// One compiled segment of a dotted pattern.
#[derive(Debug, Clone)]
pub enum SegmentPattern {
    /// Bare `*`: any single segment.
    Any,
    /// Plain token compared byte for byte.
    Literal(String),
    /// Shell glob (`*`, `?`, `[...]`) and/or `{a,b}` alternation.
    Glob { source: String, regex: Regex },
}

impl SegmentPattern {
    /// Compiles a single segment. Returns the reason on malformed input.
    pub fn parse(segment: &str) -> Result<Self, String> {
        if segment.is_empty() {
            return Err("empty segment".to_string());
        }
        if segment == "*" {
            return Ok(SegmentPattern::Any);
        }
        if !segment.contains(['*', '?', '[', '{']) {
            return Ok(SegmentPattern::Literal(segment.to_string()));
        }
        let translated = glob_to_regex(segment)?;
        let regex = Regex::new(&translated).map_err(|e| e.to_string())?;
        Ok(SegmentPattern::Glob {
            source: segment.to_string(),
            regex,
        })
    }

    pub fn matches(&self, value: &str) -> bool {
        match self {
            SegmentPattern::Any => true,
            SegmentPattern::Literal(lit) => lit == value,
            SegmentPattern::Glob { regex, .. } => regex.is_match(value),
        }
    }

    /// The literal token, if this segment has no wildcard at all.
    pub fn as_literal(&self) -> Option<&str> {
        match self {
            SegmentPattern::Literal(lit) => Some(lit),
            _ => None,
        }
    }
}

impl fmt::Display for SegmentPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SegmentPattern::Any => f.write_str("*"),
            SegmentPattern::Literal(lit) => f.write_str(lit),
            SegmentPattern::Glob { source, .. } => f.write_str(source),
        }
    }
}

/// Translates a glob segment into an anchored regex.
fn glob_to_regex(segment: &str) -> Result<String, String> {
    let mut out = String::with_capacity(segment.len() * 2 + 2);
    out.push('^');
    let mut in_alternation = false;
    let mut chars = segment.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '[' => {
                out.push('[');
                if matches!(chars.peek(), Some('!') | Some('^')) {
                    chars.next();
                    out.push('^');
                }
                // A `]` right after the opening bracket is a literal member.
                if chars.peek() == Some(&']') {
                    chars.next();
                    out.push_str("\\]");
                }
                let mut closed = false;
                for c in chars.by_ref() {
                    match c {
                        ']' => {
                            closed = true;
                            break;
                        }
                        '\\' | '[' | '^' | '&' | '~' => {
                            out.push('\\');
                            out.push(c);
                        }
                        _ => out.push(c),
                    }
                }
                if !closed {
                    return Err("unterminated character class".to_string());
                }
                out.push(']');
            }
            '{' => {
                if in_alternation {
                    return Err("nested alternation".to_string());
                }
                in_alternation = true;
                out.push_str("(?:");
            }
            '}' if in_alternation => {
                in_alternation = false;
                out.push(')');
            }
            ',' if in_alternation => out.push('|'),
            _ => out.push_str(&regex::escape(c.encode_utf8(&mut [0u8; 4]))),
        }
    }

    if in_alternation {
        return Err("unterminated alternation".to_string());
    }
    out.push('$');
    Ok(out)
}

/// A parsed dotted query pattern.
#[derive(Debug, Clone)]
pub struct Query {
    source: String,
    segments: Vec<SegmentPattern>,
}

impl Query {
    pub fn parse(pattern: &str) -> Result<Self, FinderError> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Err(FinderError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: "empty pattern".to_string(),
            });
        }
        let segments = pattern
            .split('.')
            .map(SegmentPattern::parse)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|reason| FinderError::InvalidPattern {
                pattern: pattern.to_string(),
                reason,
            })?;
        Ok(Query {
            source: pattern.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn segments(&self) -> &[SegmentPattern] {
        &self.segments
    }

    pub fn depth(&self) -> usize {
        self.segments.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(s: &str) -> SegmentPattern {
        SegmentPattern::parse(s).unwrap()
    }

    #[test]
    fn literal_and_any() {
        assert!(matches!(seg("*"), SegmentPattern::Any));
        assert_eq!(seg("cpu").as_literal(), Some("cpu"));
        assert!(seg("cpu").matches("cpu"));
        assert!(!seg("cpu").matches("cpu0"));
        assert!(seg("*").matches("anything"));
    }

    #[test]
    fn star_and_question_mark() {
        let p = seg("web-*");
        assert!(p.matches("web-01"));
        assert!(p.matches("web-"));
        assert!(!p.matches("db-01"));

        let q = seg("cpu?");
        assert!(q.matches("cpu0"));
        assert!(!q.matches("cpu"));
        assert!(!q.matches("cpu10"));
    }

    #[test]
    fn character_classes() {
        let p = seg("host[0-2]");
        assert!(p.matches("host0"));
        assert!(p.matches("host2"));
        assert!(!p.matches("host3"));

        let neg = seg("host[!0-2]");
        assert!(neg.matches("host3"));
        assert!(!neg.matches("host1"));

        let caret = seg("x[^a]");
        assert!(caret.matches("xb"));
        assert!(!caret.matches("xa"));

        let bracket = seg("a[]b]");
        assert!(bracket.matches("a]"));
        assert!(bracket.matches("ab"));
    }

    #[test]
    fn alternation_with_globs() {
        let p = seg("{cpu,mem}*");
        assert!(p.matches("cpu"));
        assert!(p.matches("memory"));
        assert!(!p.matches("load"));

        let exact = seg("{a,b,c}");
        assert!(exact.matches("b"));
        assert!(!exact.matches("ab"));
    }

    #[test]
    fn regex_metacharacters_are_literal() {
        let p = seg("a+b*");
        assert!(p.matches("a+bcd"));
        assert!(!p.matches("aab"));
        assert!(seg("(x)?").matches("(x)1"));
    }

    #[test]
    fn malformed_segments_rejected() {
        assert!(SegmentPattern::parse("host[0-2").is_err());
        assert!(SegmentPattern::parse("{a,b").is_err());
        assert!(SegmentPattern::parse("{a,{b}}").is_err());
        assert!(SegmentPattern::parse("").is_err());
    }

    #[test]
    fn query_splits_on_dots() {
        let q = Query::parse("servers.web*.cpu").unwrap();
        assert_eq!(q.depth(), 3);
        assert!(q.segments()[1].matches("web01"));
        assert!(!q.segments()[1].matches("web01.cpu"));
        assert_eq!(q.as_str(), "servers.web*.cpu");
    }

    #[test]
    fn query_rejects_empty_segments() {
        assert!(matches!(
            Query::parse("a..b"),
            Err(FinderError::InvalidPattern { .. })
        ));
        assert!(matches!(Query::parse(""), Err(FinderError::InvalidPattern { .. })));
        assert!(matches!(
            Query::parse("a.{b.c}"),
            Err(FinderError::InvalidPattern { .. })
        ));
    }
}

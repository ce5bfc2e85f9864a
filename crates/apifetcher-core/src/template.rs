//! Dotted-path resolution and `{res.path}` template substitution.
//!
//! Pagination and cursor advancement are driven by templates that reference
//! values from a prior response, e.g. `?page={res.result_info.page+1}` or
//! `{"cursor": "{res.cursor}"}`. A template is compiled once at source
//! construction into alternating literal and path parts, so rendering per
//! call is a plain walk with no re-parsing.
//!
//! Path grammar:
//! - dot-separated segments; `\.` escapes a literal dot inside a key;
//! - `[N]` indexes a sequence, negative `N` counts from the end;
//! - the last segment may carry a trailing `+N` / `-N` applied to the
//!   resolved value when it is numeric.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::error::TemplateError;

fn vars_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{res\.(.*?)\}").expect("template variable regex must compile"))
}

fn math_suffix_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(.+?)([+-]\d+)$").expect("math suffix regex must compile"))
}

/// One step of a compiled path: either a map key or a sequence index.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(i64),
}

/// A compiled dotted/indexed path into a JSON tree.
#[derive(Debug, Clone)]
pub struct JsonPath {
    raw: String,
    segments: Vec<Segment>,
    delta: Option<i64>,
}

impl JsonPath {
    /// Compile a path expression such as `value.[0].createdDateTime` or
    /// `result_info.page+1`.
    pub fn parse(raw: &str) -> Result<Self, TemplateError> {
        if raw.is_empty() {
            return Err(TemplateError::EmptyPath);
        }

        let parts = split_segments(raw);
        let last = parts.len() - 1;
        let mut segments = Vec::with_capacity(parts.len());
        let mut delta = None;

        for (i, part) in parts.iter().enumerate() {
            if part.is_empty() {
                return Err(TemplateError::InvalidSegment {
                    segment: part.clone(),
                    path: raw.to_string(),
                });
            }
            if part.starts_with('[') && part.ends_with(']') {
                let index: i64 = part[1..part.len() - 1].parse().map_err(|_| {
                    TemplateError::InvalidSegment {
                        segment: part.clone(),
                        path: raw.to_string(),
                    }
                })?;
                segments.push(Segment::Index(index));
            } else {
                let (name, suffix) = if i == last {
                    split_math_suffix(part)
                } else {
                    (part.as_str(), None)
                };
                delta = suffix;
                segments.push(Segment::Key(name.to_string()));
            }
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
            delta,
        })
    }

    /// Resolve the path against a JSON tree.
    ///
    /// Returns `None` on a miss: a key absent from a map (debug log), an
    /// index outside a sequence (warning log), or an attempt to descend
    /// into a value of the wrong shape. A string value that itself parses
    /// as JSON is transparently parsed and re-descended once.
    pub fn resolve(&self, root: &Value) -> Option<Value> {
        let value = lookup(root, &self.segments, true, &self.raw)?;
        match (self.delta, &value) {
            (Some(delta), Value::Number(n)) => {
                if let Some(i) = n.as_i64() {
                    Some(Value::from(i + delta))
                } else {
                    n.as_f64().map(|f| Value::from(f + delta as f64))
                }
            }
            _ => Some(value),
        }
    }
}

impl fmt::Display for JsonPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Split a raw path on unescaped dots, resolving `\.` escapes.
fn split_segments(path: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = path.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&'.') => {
                chars.next();
                current.push('.');
            }
            '.' => segments.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    segments.push(current);
    segments
}

/// Split a trailing `+N` / `-N` arithmetic suffix off the final key.
fn split_math_suffix(segment: &str) -> (&str, Option<i64>) {
    match math_suffix_pattern().captures(segment) {
        Some(caps) => {
            let name = caps.get(1).map_or(segment, |m| m.as_str());
            let delta = caps.get(2).and_then(|m| m.as_str().parse().ok());
            (name, delta)
        }
        None => (segment, None),
    }
}

fn lookup(value: &Value, segments: &[Segment], allow_reparse: bool, path: &str) -> Option<Value> {
    let Some((segment, rest)) = segments.split_first() else {
        return Some(value.clone());
    };

    match (value, segment) {
        (Value::Object(map), Segment::Key(key)) => match map.get(key) {
            Some(next) => lookup(next, rest, allow_reparse, path),
            None => {
                tracing::debug!(path, key = %key, "key not found in response");
                None
            }
        },
        (Value::Array(items), Segment::Index(index)) => {
            let len = items.len() as i64;
            let effective = if *index < 0 { index + len } else { *index };
            if effective < 0 || effective >= len {
                tracing::warn!(path, index, len, "index out of range in response");
                return None;
            }
            lookup(&items[effective as usize], rest, allow_reparse, path)
        }
        // A nested value may itself be a JSON document flattened into a
        // string; parse it once and keep descending.
        (Value::String(text), _) if allow_reparse => match serde_json::from_str::<Value>(text) {
            Ok(parsed) => lookup(&parsed, segments, false, path),
            Err(_) => {
                tracing::debug!(path, "segment points into a non-JSON string");
                None
            }
        },
        _ => {
            tracing::debug!(path, "cannot descend into value of this shape");
            None
        }
    }
}

/// One compiled part of a template.
#[derive(Debug, Clone)]
enum Part {
    Literal(String),
    Var(JsonPath),
}

/// A compiled template: literal text interleaved with `{res.path}`
/// placeholders.
#[derive(Debug, Clone)]
pub struct Template {
    raw: String,
    parts: Vec<Part>,
}

impl Template {
    /// Compile a string template, discovering placeholders via the
    /// `{res.<path>}` pattern.
    pub fn compile(raw: &str) -> Result<Self, TemplateError> {
        let mut parts = Vec::new();
        let mut cursor = 0;
        for caps in vars_pattern().captures_iter(raw) {
            let whole = caps.get(0).expect("capture 0 always present");
            if whole.start() > cursor {
                parts.push(Part::Literal(raw[cursor..whole.start()].to_string()));
            }
            let expr = caps.get(1).expect("path capture present").as_str();
            parts.push(Part::Var(JsonPath::parse(expr)?));
            cursor = whole.end();
        }
        if cursor < raw.len() {
            parts.push(Part::Literal(raw[cursor..].to_string()));
        }
        Ok(Self {
            raw: raw.to_string(),
            parts,
        })
    }

    /// Compile a structured (map/array) template by canonicalizing it to
    /// its JSON string form first, so one renderer serves URL, body, and
    /// header templates alike.
    pub fn from_value(value: &Value) -> Result<Self, TemplateError> {
        match value {
            Value::String(s) => Self::compile(s),
            other => Self::compile(&other.to_string()),
        }
    }

    /// Render the template against a response.
    ///
    /// Fails with [`TemplateError::PathMiss`] if any referenced path
    /// resolves to nothing or null; the caller keeps its previous state.
    pub fn render(&self, res: &Value) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(self.raw.len());
        for part in &self.parts {
            match part {
                Part::Literal(text) => out.push_str(text),
                Part::Var(path) => {
                    let value = path.resolve(res).filter(|v| !v.is_null()).ok_or_else(|| {
                        TemplateError::PathMiss {
                            path: path.to_string(),
                            template: self.raw.clone(),
                        }
                    })?;
                    out.push_str(&render_value(&value));
                }
            }
        }
        Ok(out)
    }

    /// The template source text.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Whether the template references any response paths.
    pub fn has_vars(&self) -> bool {
        self.parts.iter().any(|p| matches!(p, Part::Var(_)))
    }
}

/// Strings render unquoted; everything else uses its JSON form.
fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolves_nested_keys() {
        let res = json!({"result_info": {"page": 3, "count": 50}});
        let path = JsonPath::parse("result_info.page").unwrap();
        assert_eq!(path.resolve(&res), Some(json!(3)));
    }

    #[test]
    fn resolves_array_index() {
        let res = json!({"value": [{"createdDateTime": "2024-05-29T10:00:00Z"}]});
        let path = JsonPath::parse("value.[0].createdDateTime").unwrap();
        assert_eq!(path.resolve(&res), Some(json!("2024-05-29T10:00:00Z")));
    }

    #[test]
    fn resolves_negative_index_from_end() {
        let res = json!({"items": [{"t": 1}, {"t": 2}, {"t": 3}]});
        let path = JsonPath::parse("items.[-1].t").unwrap();
        assert_eq!(path.resolve(&res), Some(json!(3)));
    }

    #[test]
    fn out_of_range_index_misses() {
        let res = json!({"items": [1, 2]});
        assert_eq!(JsonPath::parse("items.[5]").unwrap().resolve(&res), None);
        assert_eq!(JsonPath::parse("items.[-3]").unwrap().resolve(&res), None);
    }

    #[test]
    fn missing_key_misses() {
        let res = json!({"a": 1});
        assert_eq!(JsonPath::parse("b").unwrap().resolve(&res), None);
    }

    #[test]
    fn indexing_a_non_sequence_misses() {
        let res = json!({"a": {"b": 1}});
        assert_eq!(JsonPath::parse("a.[0]").unwrap().resolve(&res), None);
    }

    #[test]
    fn escaped_dot_selects_literal_key() {
        let res = json!({"@odata.nextLink": "https://next/page"});
        let path = JsonPath::parse("@odata\\.nextLink").unwrap();
        assert_eq!(path.resolve(&res), Some(json!("https://next/page")));
    }

    #[test]
    fn math_applies_to_numeric_leaf() {
        let res = json!({"page": 1});
        assert_eq!(JsonPath::parse("page+1").unwrap().resolve(&res), Some(json!(2)));
        assert_eq!(JsonPath::parse("page-1").unwrap().resolve(&res), Some(json!(0)));
    }

    #[test]
    fn math_skipped_for_non_numeric_leaf() {
        let res = json!({"page": "one"});
        assert_eq!(
            JsonPath::parse("page+1").unwrap().resolve(&res),
            Some(json!("one"))
        );
    }

    #[test]
    fn string_encoded_json_is_reparsed_once() {
        let res = json!({"payload": "{\"inner\": {\"count\": 7}}"});
        let path = JsonPath::parse("payload.inner.count").unwrap();
        assert_eq!(path.resolve(&res), Some(json!(7)));
    }

    #[test]
    fn empty_path_rejected() {
        assert!(matches!(JsonPath::parse(""), Err(TemplateError::EmptyPath)));
    }

    #[test]
    fn bad_index_segment_rejected() {
        assert!(matches!(
            JsonPath::parse("a.[x]"),
            Err(TemplateError::InvalidSegment { .. })
        ));
    }

    #[test]
    fn template_substitutes_leaf_values() {
        let res = json!({"field": "abc", "arr": [1, 2], "objArr": [{"f2": "hi"}, {"f2": "hello"}]});
        let template =
            Template::compile("http://some/api/{res.field}/{res.arr.[0]}/{res.objArr.[1].f2}")
                .unwrap();
        assert_eq!(template.render(&res).unwrap(), "http://some/api/abc/1/hello");
    }

    #[test]
    fn template_round_trips_selected_leaf() {
        // Substituting {res.P} then resolving against the same tree yields
        // the leaf's value.
        let res = json!({"a": {"b": [10, 20, 30]}});
        let template = Template::compile("{res.a.b.[2]}").unwrap();
        assert_eq!(template.render(&res).unwrap(), "30");
    }

    #[test]
    fn template_miss_fails_whole_render() {
        let res = json!({"present": 1});
        let template = Template::compile("start-{res.present}-{res.absent}-end").unwrap();
        let err = template.render(&res).unwrap_err();
        assert!(matches!(err, TemplateError::PathMiss { .. }));
    }

    #[test]
    fn template_null_value_fails_render() {
        let res = json!({"cursor": null});
        let template = Template::compile("{res.cursor}").unwrap();
        assert!(template.render(&res).is_err());
    }

    #[test]
    fn structured_template_canonicalized_to_json() {
        let template = Template::from_value(&json!({"cursor": "{res.cursor}", "limit": 100}))
            .unwrap();
        let rendered = template.render(&json!({"cursor": "X"})).unwrap();
        let parsed: Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(parsed, json!({"cursor": "X", "limit": 100}));
    }

    #[test]
    fn template_without_vars_renders_verbatim() {
        let template = Template::compile("https://static/url").unwrap();
        assert!(!template.has_vars());
        assert_eq!(template.render(&json!({})).unwrap(), "https://static/url");
    }

    #[test]
    fn math_inside_template_increments_page() {
        let res = json!({"result_info": {"page": 1}});
        let template = Template::compile("?page={res.result_info.page+1}").unwrap();
        assert_eq!(template.render(&res).unwrap(), "?page=2");
    }
}

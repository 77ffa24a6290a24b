//! Path resolution over parsed JSON and YAML documents
//!
//! Two strategies share one interface:
//!
//! - [`JsonPathResolver`] understands a JSONPath subset: `$`, `.key`,
//!   `['key']`, `[n]` (negative counts from the end), `*` / `[*]` and
//!   recursive descent `..key`.
//! - [`DotPathResolver`] strips a `$.` prefix and walks dot-separated keys
//!   through nested maps.
//!
//! [`ResolverChain`] tries them in order. On plain dotted paths both give
//! the same answer, so the dot-walk only matters for expressions the richer
//! resolver rejects.

use serde_json::Value;

/// A strategy for resolving a path expression against a JSON document
pub trait PathResolver: Send + Sync {
    /// Strategy name (for diagnostics)
    fn name(&self) -> &'static str;

    /// Resolve `path` against `document`
    ///
    /// Returns `None` when the expression is outside this strategy's
    /// syntax, otherwise every matching value in document order.
    fn resolve<'a>(&self, document: &'a Value, path: &str) -> Option<Vec<&'a Value>>;
}

/// Split a dotted path into keys, ignoring `$` markers and empty segments
pub fn dot_segments(path: &str) -> Vec<&str> {
    let trimmed = path.trim();
    let trimmed = trimmed.strip_prefix("$.").unwrap_or(trimmed);
    let trimmed = trimmed.strip_prefix('$').unwrap_or(trimmed);
    trimmed
        .split('.')
        .map(str::trim)
        .filter(|k| !k.is_empty() && *k != "$")
        .collect()
}

/// Walks nested maps one key at a time
#[derive(Debug, Default, Clone, Copy)]
pub struct DotPathResolver;

impl DotPathResolver {
    pub fn new() -> Self {
        Self
    }

    /// Resolve a dotted path to a single value
    pub fn walk<'a>(&self, document: &'a Value, path: &str) -> Option<&'a Value> {
        let mut current = document;
        for key in dot_segments(path) {
            current = current.as_object()?.get(key)?;
        }
        Some(current)
    }
}

impl PathResolver for DotPathResolver {
    fn name(&self) -> &'static str {
        "dot-path"
    }

    fn resolve<'a>(&self, document: &'a Value, path: &str) -> Option<Vec<&'a Value>> {
        Some(self.walk(document, path).into_iter().collect())
    }
}

/// Dot-walk over a YAML document
///
/// YAML conditions use this resolver exclusively.
pub fn walk_yaml<'a>(document: &'a serde_yaml::Value, path: &str) -> Option<&'a serde_yaml::Value> {
    let mut current = document;
    for key in dot_segments(path) {
        if !current.is_mapping() {
            return None;
        }
        current = current.get(key)?;
    }
    Some(current)
}

/// One step of a compiled JSONPath expression
#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Child(String),
    Index(i64),
    Wildcard,
    /// Apply the inner selector to every descendant (and the node itself)
    Descendant(Box<Segment>),
}

/// Resolver for the JSONPath subset listed in the module docs
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonPathResolver;

impl JsonPathResolver {
    pub fn new() -> Self {
        Self
    }

    fn parse(path: &str) -> Option<Vec<Segment>> {
        let path = path.trim();
        if path.is_empty() {
            return None;
        }

        let chars: Vec<char> = path.chars().collect();
        let mut i = 0;
        let mut segments = Vec::new();

        if chars[0] == '$' {
            i = 1;
        } else {
            // Implicit root: treat "a.b" like "$.a.b"
            let name = read_name(&chars, &mut i)?;
            segments.push(Segment::Child(name));
        }

        while i < chars.len() {
            match chars[i] {
                '.' => {
                    if chars.get(i + 1) == Some(&'.') {
                        i += 2;
                        let inner = if chars.get(i) == Some(&'[') {
                            read_bracket(&chars, &mut i)?
                        } else if chars.get(i) == Some(&'*') {
                            i += 1;
                            Segment::Wildcard
                        } else {
                            Segment::Child(read_name(&chars, &mut i)?)
                        };
                        segments.push(Segment::Descendant(Box::new(inner)));
                    } else {
                        i += 1;
                        if chars.get(i) == Some(&'*') {
                            i += 1;
                            segments.push(Segment::Wildcard);
                        } else {
                            segments.push(Segment::Child(read_name(&chars, &mut i)?));
                        }
                    }
                }
                '[' => segments.push(read_bracket(&chars, &mut i)?),
                _ => return None,
            }
        }

        Some(segments)
    }

    fn apply<'a>(segment: &Segment, node: &'a Value, out: &mut Vec<&'a Value>) {
        match segment {
            Segment::Child(name) => {
                if let Some(v) = node.as_object().and_then(|m| m.get(name)) {
                    out.push(v);
                }
            }
            Segment::Index(idx) => {
                if let Some(items) = node.as_array() {
                    let len = items.len() as i64;
                    let pos = if *idx < 0 { len + idx } else { *idx };
                    if pos >= 0 && pos < len {
                        out.push(&items[pos as usize]);
                    }
                }
            }
            Segment::Wildcard => match node {
                Value::Object(map) => out.extend(map.values()),
                Value::Array(items) => out.extend(items.iter()),
                _ => {}
            },
            Segment::Descendant(inner) => {
                let mut stack = vec![node];
                while let Some(current) = stack.pop() {
                    Self::apply(inner, current, out);
                    match current {
                        Value::Object(map) => stack.extend(map.values().rev()),
                        Value::Array(items) => stack.extend(items.iter().rev()),
                        _ => {}
                    }
                }
            }
        }
    }
}

fn read_name(chars: &[char], i: &mut usize) -> Option<String> {
    let start = *i;
    while *i < chars.len() && chars[*i] != '.' && chars[*i] != '[' {
        *i += 1;
    }
    let name: String = chars[start..*i].iter().collect();
    let name = name.trim().to_string();
    if name.is_empty() || name.contains(']') || name.contains('$') {
        return None;
    }
    Some(name)
}

fn read_bracket(chars: &[char], i: &mut usize) -> Option<Segment> {
    // chars[*i] == '['
    *i += 1;
    let quote = match chars.get(*i) {
        Some(&q) if q == '\'' || q == '"' => Some(q),
        _ => None,
    };

    let segment = if let Some(q) = quote {
        *i += 1;
        let start = *i;
        while *i < chars.len() && chars[*i] != q {
            *i += 1;
        }
        if *i >= chars.len() {
            return None;
        }
        let key: String = chars[start..*i].iter().collect();
        *i += 1; // closing quote
        Segment::Child(key)
    } else {
        let start = *i;
        while *i < chars.len() && chars[*i] != ']' {
            *i += 1;
        }
        let inner: String = chars[start..*i].iter().collect();
        let inner = inner.trim();
        if inner == "*" {
            Segment::Wildcard
        } else {
            Segment::Index(inner.parse().ok()?)
        }
    };

    if chars.get(*i) != Some(&']') {
        return None;
    }
    *i += 1;
    Some(segment)
}

impl PathResolver for JsonPathResolver {
    fn name(&self) -> &'static str {
        "jsonpath"
    }

    fn resolve<'a>(&self, document: &'a Value, path: &str) -> Option<Vec<&'a Value>> {
        let segments = Self::parse(path)?;
        let mut current = vec![document];
        for segment in &segments {
            let mut next = Vec::new();
            for node in current {
                Self::apply(segment, node, &mut next);
            }
            current = next;
        }
        Some(current)
    }
}

/// Ordered list of resolution strategies
pub struct ResolverChain {
    strategies: Vec<Box<dyn PathResolver>>,
}

impl Default for ResolverChain {
    fn default() -> Self {
        Self::new()
    }
}

impl ResolverChain {
    /// JSONPath first, dot-walk as fallback
    pub fn new() -> Self {
        Self {
            strategies: vec![Box::new(JsonPathResolver::new()), Box::new(DotPathResolver::new())],
        }
    }

    /// Chain with only the dot-walk resolver
    pub fn dot_only() -> Self {
        Self {
            strategies: vec![Box::new(DotPathResolver::new())],
        }
    }

    /// Names of the strategies, in the order they are tried
    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// First value found by the first strategy that finds anything
    pub fn first<'a>(&self, document: &'a Value, path: &str) -> Option<&'a Value> {
        for strategy in &self.strategies {
            match strategy.resolve(document, path) {
                Some(matches) if !matches.is_empty() => return matches.into_iter().next(),
                Some(_) => continue,
                None => {
                    log::trace!("{} resolver rejected path '{}'", strategy.name(), path);
                    continue;
                }
            }
        }
        None
    }

    /// Path resolves to a present, non-null value
    pub fn exists(&self, document: &Value, path: &str) -> bool {
        self.first(document, path).is_some_and(|v| !v.is_null())
    }
}

/// Render a resolved value for regex matching
///
/// Strings are used as-is; everything else is compact JSON.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

//! XML document tree and element-path queries
//!
//! Documents are parsed with quick-xml into a flat arena of elements.
//! Queries use the ElementTree `findall` path subset, evaluated from the
//! root element:
//!
//! | Syntax | Selects |
//! |---|---|
//! | `tag` | child elements named `tag` |
//! | `*` | all child elements |
//! | `.` | the current element |
//! | `..` | the parent element |
//! | `//tag`, `.//tag` | descendants named `tag` |
//! | `[@attr]`, `[@attr='v']` | elements with the attribute (and value) |
//! | `[tag]`, `[tag='text']` | elements with such a child (and text) |
//! | `[.='text']` | elements whose own text equals `text` |
//! | `[n]`, `[last()]` | position among matching siblings (1-based) |
//!
//! A leading `/` anchors the path at the document, so `/manifest/application`
//! also checks the root element's name. Names are compared as written,
//! prefixes included (`android:name`).

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;

/// Error while parsing an XML document
#[derive(Debug, Error)]
pub enum XmlError {
    #[error("XML parse error at byte {position}: {message}")]
    Syntax { position: u64, message: String },

    #[error("Invalid document: {0}")]
    Invalid(String),
}

/// Error while compiling an element path
#[derive(Debug, Error, PartialEq)]
#[error("Invalid element path '{path}': {message}")]
pub struct XPathError {
    pub path: String,
    pub message: String,
}

/// Index of the synthetic document node in the arena
const DOCUMENT: usize = 0;

/// An element in the arena
#[derive(Debug, Clone)]
pub struct XmlElement {
    pub name: String,
    pub attributes: Vec<(String, String)>,

    /// Text before the first child element
    pub text: String,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
}

impl XmlElement {
    fn new(name: String, parent: Option<usize>) -> Self {
        Self {
            name,
            attributes: Vec::new(),
            text: String::new(),
            parent,
            children: Vec::new(),
        }
    }

    /// Attribute value by qualified name
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// A parsed XML document
#[derive(Debug, Clone)]
pub struct XmlDocument {
    /// Index 0 is the document node; elements follow in document order
    nodes: Vec<XmlElement>,
}

impl XmlDocument {
    /// Parse XML text
    pub fn parse(content: &str) -> Result<Self, XmlError> {
        let mut reader = Reader::from_str(content);
        reader.config_mut().trim_text(false);

        let mut nodes = vec![XmlElement::new(String::new(), None)];
        let mut stack: Vec<usize> = vec![DOCUMENT];
        let mut buf = Vec::new();

        loop {
            let event = reader
                .read_event_into(&mut buf)
                .map_err(|e| XmlError::Syntax {
                    position: reader.error_position(),
                    message: e.to_string(),
                })?;

            match event {
                Event::Start(e) => {
                    let idx = push_element(&mut nodes, &stack, &e)?;
                    stack.push(idx);
                }
                Event::Empty(e) => {
                    push_element(&mut nodes, &stack, &e)?;
                }
                Event::End(_) => {
                    if stack.len() <= 1 {
                        return Err(XmlError::Invalid("unbalanced end tag".to_string()));
                    }
                    stack.pop();
                }
                Event::Text(e) => {
                    let text = e.unescape().map_err(|err| XmlError::Syntax {
                        position: reader.buffer_position(),
                        message: err.to_string(),
                    })?;
                    append_text(&mut nodes, &stack, &text)?;
                }
                Event::CData(e) => {
                    let raw = e.into_inner();
                    let text = String::from_utf8_lossy(&raw);
                    append_text(&mut nodes, &stack, &text)?;
                }
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }

        if stack.len() != 1 {
            return Err(XmlError::Invalid(format!(
                "unclosed element '{}'",
                nodes[stack[stack.len() - 1]].name
            )));
        }
        if nodes[DOCUMENT].children.is_empty() {
            return Err(XmlError::Invalid("no root element".to_string()));
        }

        Ok(Self { nodes })
    }

    /// Root element
    pub fn root(&self) -> Option<&XmlElement> {
        self.root_index().map(|i| &self.nodes[i])
    }

    fn root_index(&self) -> Option<usize> {
        self.nodes[DOCUMENT].children.first().copied()
    }

    /// Element by arena index
    pub fn element(&self, idx: usize) -> Option<&XmlElement> {
        if idx == DOCUMENT {
            return None;
        }
        self.nodes.get(idx)
    }

    /// Number of elements (the document node is not counted)
    pub fn len(&self) -> usize {
        self.nodes.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evaluate a compiled path, returning matching elements
    pub fn find_all(&self, path: &ElementPath) -> Vec<&XmlElement> {
        let start = if path.absolute {
            DOCUMENT
        } else {
            match self.root_index() {
                Some(root) => root,
                None => return Vec::new(),
            }
        };

        let mut current = vec![start];
        for step in &path.steps {
            current = self.apply_step(step, &current);
            if current.is_empty() {
                break;
            }
        }

        current
            .into_iter()
            .filter(|&i| i != DOCUMENT)
            .map(|i| &self.nodes[i])
            .collect()
    }

    /// At least one element matches
    pub fn matches(&self, path: &ElementPath) -> bool {
        !self.find_all(path).is_empty()
    }

    fn apply_step(&self, step: &Step, context: &[usize]) -> Vec<usize> {
        let mut out = Vec::new();
        match step {
            Step::SelfNode => out.extend_from_slice(context),
            Step::Parent => {
                for &i in context {
                    if let Some(p) = self.nodes[i].parent {
                        if p != DOCUMENT {
                            out.push(p);
                        }
                    }
                }
            }
            Step::Child(test, predicates) => {
                for &i in context {
                    let candidates: Vec<usize> = self.nodes[i]
                        .children
                        .iter()
                        .copied()
                        .filter(|&c| test.matches(&self.nodes[c].name))
                        .collect();
                    out.extend(self.filter_predicates(candidates, predicates));
                }
            }
            Step::Descendant(test, predicates) => {
                for &i in context {
                    let mut by_parent: Vec<(usize, Vec<usize>)> = Vec::new();
                    for d in self.descendants(i) {
                        if !test.matches(&self.nodes[d].name) {
                            continue;
                        }
                        let parent = self.nodes[d].parent.unwrap_or(DOCUMENT);
                        match by_parent.iter_mut().find(|(p, _)| *p == parent) {
                            Some((_, group)) => group.push(d),
                            None => by_parent.push((parent, vec![d])),
                        }
                    }
                    for (_, group) in by_parent {
                        out.extend(self.filter_predicates(group, predicates));
                    }
                }
            }
        }

        // Keep first occurrence, preserve order
        let mut seen = vec![false; self.nodes.len()];
        out.retain(|&i| !std::mem::replace(&mut seen[i], true));
        out
    }

    fn descendants(&self, idx: usize) -> Vec<usize> {
        let mut out = Vec::new();
        let mut stack: Vec<usize> = self.nodes[idx].children.iter().rev().copied().collect();
        while let Some(i) = stack.pop() {
            out.push(i);
            stack.extend(self.nodes[i].children.iter().rev().copied());
        }
        out
    }

    fn filter_predicates(&self, mut candidates: Vec<usize>, predicates: &[Predicate]) -> Vec<usize> {
        for predicate in predicates {
            candidates = match predicate {
                Predicate::Position(n) => candidates.get(n - 1).copied().into_iter().collect(),
                Predicate::Last => candidates.last().copied().into_iter().collect(),
                other => candidates
                    .into_iter()
                    .filter(|&i| self.predicate_holds(other, i))
                    .collect(),
            };
        }
        candidates
    }

    fn predicate_holds(&self, predicate: &Predicate, idx: usize) -> bool {
        let node = &self.nodes[idx];
        match predicate {
            Predicate::HasAttribute(name) => node.attribute(name).is_some(),
            Predicate::AttributeEquals(name, value) => node.attribute(name) == Some(value.as_str()),
            Predicate::HasChild(name) => node.children.iter().any(|&c| self.nodes[c].name == *name),
            Predicate::ChildTextEquals(name, value) => node
                .children
                .iter()
                .any(|&c| self.nodes[c].name == *name && self.nodes[c].text == *value),
            Predicate::TextEquals(value) => node.text == *value,
            Predicate::Position(_) | Predicate::Last => true,
        }
    }
}

fn push_element(
    nodes: &mut Vec<XmlElement>,
    stack: &[usize],
    start: &BytesStart<'_>,
) -> Result<usize, XmlError> {
    let parent = stack.last().copied().unwrap_or(DOCUMENT);
    if parent == DOCUMENT && !nodes[DOCUMENT].children.is_empty() {
        return Err(XmlError::Invalid("multiple root elements".to_string()));
    }

    let name = String::from_utf8_lossy(start.name().as_ref()).to_string();
    let mut element = XmlElement::new(name, Some(parent));

    for attr in start.attributes() {
        let attr = attr.map_err(|e| XmlError::Invalid(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
        let value = attr
            .unescape_value()
            .map_err(|e| XmlError::Invalid(e.to_string()))?
            .to_string();
        element.attributes.push((key, value));
    }

    let idx = nodes.len();
    nodes.push(element);
    nodes[parent].children.push(idx);
    Ok(idx)
}

fn append_text(nodes: &mut [XmlElement], stack: &[usize], text: &str) -> Result<(), XmlError> {
    let current = stack.last().copied().unwrap_or(DOCUMENT);
    if current == DOCUMENT {
        if text.trim().is_empty() {
            return Ok(());
        }
        return Err(XmlError::Invalid("text outside of root element".to_string()));
    }
    let node = &mut nodes[current];
    // Text after a child belongs to that child's tail, not to this element
    if node.children.is_empty() {
        node.text.push_str(text);
    }
    Ok(())
}

/// Element name test
#[derive(Debug, Clone, PartialEq)]
enum NameTest {
    Any,
    Name(String),
}

impl NameTest {
    fn matches(&self, name: &str) -> bool {
        match self {
            NameTest::Any => true,
            NameTest::Name(n) => n == name,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Predicate {
    HasAttribute(String),
    AttributeEquals(String, String),
    HasChild(String),
    ChildTextEquals(String, String),
    TextEquals(String),
    Position(usize),
    Last,
}

#[derive(Debug, Clone, PartialEq)]
enum Step {
    SelfNode,
    Parent,
    Child(NameTest, Vec<Predicate>),
    Descendant(NameTest, Vec<Predicate>),
}

/// A compiled element path
#[derive(Debug, Clone, PartialEq)]
pub struct ElementPath {
    source: String,
    absolute: bool,
    steps: Vec<Step>,
}

impl ElementPath {
    /// Compile a path expression
    pub fn compile(path: &str) -> Result<Self, XPathError> {
        let err = |message: &str| XPathError {
            path: path.to_string(),
            message: message.to_string(),
        };

        let trimmed = path.trim();
        if trimmed.is_empty() {
            return Err(err("empty path"));
        }

        let absolute = trimmed.starts_with('/');
        let parts = split_steps(trimmed).map_err(|m| err(&m))?;

        let mut steps = Vec::new();
        let mut descendant = false;
        // An absolute path starts with an empty part before the first '/'
        let skip = usize::from(absolute);

        for (n, part) in parts.iter().enumerate().skip(skip) {
            let part = part.trim();
            if part.is_empty() {
                if descendant {
                    return Err(err("'///' is not allowed"));
                }
                if n == parts.len() - 1 {
                    return Err(err("path cannot end with '/'"));
                }
                descendant = true;
                continue;
            }

            let step = parse_step(part, descendant).map_err(|m| err(&m))?;
            steps.push(step);
            descendant = false;
        }

        if descendant {
            return Err(err("path cannot end with '/'"));
        }
        if steps.is_empty() {
            return Err(err("path selects nothing"));
        }

        Ok(Self {
            source: path.to_string(),
            absolute,
            steps,
        })
    }

    /// Source expression
    pub fn as_str(&self) -> &str {
        &self.source
    }
}

/// Split on '/' outside of brackets and quotes
fn split_steps(path: &str) -> Result<Vec<String>, String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;

    for c in path.chars() {
        match (quote, c) {
            (Some(q), c) if c == q => {
                quote = None;
                current.push(c);
            }
            (Some(_), c) => current.push(c),
            (None, '\'') | (None, '"') => {
                quote = Some(c);
                current.push(c);
            }
            (None, '[') => {
                depth += 1;
                current.push(c);
            }
            (None, ']') => {
                if depth == 0 {
                    return Err("unbalanced ']'".to_string());
                }
                depth -= 1;
                current.push(c);
            }
            (None, '/') if depth == 0 => parts.push(std::mem::take(&mut current)),
            (None, c) => current.push(c),
        }
    }

    if quote.is_some() {
        return Err("unterminated string literal".to_string());
    }
    if depth != 0 {
        return Err("unbalanced '['".to_string());
    }
    parts.push(current);
    Ok(parts)
}

fn parse_step(part: &str, descendant: bool) -> Result<Step, String> {
    let (name, rest) = match part.find('[') {
        Some(i) => (part[..i].trim(), &part[i..]),
        None => (part, ""),
    };

    let predicates = parse_predicates(rest)?;

    match name {
        "." | ".." if !predicates.is_empty() => {
            Err(format!("predicates are not supported on '{}'", name))
        }
        "." if descendant => Ok(Step::Descendant(NameTest::Any, Vec::new())),
        "." => Ok(Step::SelfNode),
        ".." if descendant => Err("'//..' is not supported".to_string()),
        ".." => Ok(Step::Parent),
        "" => Err("missing element name".to_string()),
        _ => {
            if !is_valid_name(name) {
                return Err(format!("invalid element name '{}'", name));
            }
            let test = if name == "*" {
                NameTest::Any
            } else {
                NameTest::Name(name.to_string())
            };
            if descendant {
                Ok(Step::Descendant(test, predicates))
            } else {
                Ok(Step::Child(test, predicates))
            }
        }
    }
}

fn is_valid_name(name: &str) -> bool {
    name == "*"
        || name
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | ':' | '{' | '}'))
}

fn parse_predicates(mut rest: &str) -> Result<Vec<Predicate>, String> {
    let mut predicates = Vec::new();
    while !rest.is_empty() {
        if !rest.starts_with('[') {
            return Err(format!("unexpected '{}'", rest));
        }
        let end = find_closing_bracket(rest).ok_or_else(|| "unbalanced '['".to_string())?;
        predicates.push(parse_predicate(rest[1..end].trim())?);
        rest = rest[end + 1..].trim_start();
    }
    Ok(predicates)
}

fn find_closing_bracket(s: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (i, c) in s.char_indices().skip(1) {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'') | (None, '"') => quote = Some(c),
            (None, ']') => return Some(i),
            _ => {}
        }
    }
    None
}

fn parse_predicate(body: &str) -> Result<Predicate, String> {
    if body.is_empty() {
        return Err("empty predicate".to_string());
    }
    if body == "last()" {
        return Ok(Predicate::Last);
    }
    if body.chars().all(|c| c.is_ascii_digit()) {
        let n: usize = body.parse().map_err(|_| format!("invalid position '{}'", body))?;
        if n == 0 {
            return Err("positions start at 1".to_string());
        }
        return Ok(Predicate::Position(n));
    }

    let (lhs, rhs) = match body.find('=') {
        Some(i) => (body[..i].trim(), Some(unquote(body[i + 1..].trim())?)),
        None => (body, None),
    };

    if let Some(attr) = lhs.strip_prefix('@') {
        if attr.is_empty() || !is_valid_name(attr) {
            return Err(format!("invalid attribute name '{}'", attr));
        }
        return Ok(match rhs {
            Some(value) => Predicate::AttributeEquals(attr.to_string(), value),
            None => Predicate::HasAttribute(attr.to_string()),
        });
    }

    if lhs == "." {
        return match rhs {
            Some(value) => Ok(Predicate::TextEquals(value)),
            None => Err("'[.]' needs a value".to_string()),
        };
    }

    if !is_valid_name(lhs) || lhs == "*" {
        return Err(format!("unsupported predicate '{}'", body));
    }
    Ok(match rhs {
        Some(value) => Predicate::ChildTextEquals(lhs.to_string(), value),
        None => Predicate::HasChild(lhs.to_string()),
    })
}

fn unquote(s: &str) -> Result<String, String> {
    let mut chars = s.chars();
    match (chars.next(), s.chars().last()) {
        (Some(a), Some(b)) if s.len() >= 2 && a == b && (a == '\'' || a == '"') => {
            Ok(s[1..s.len() - 1].to_string())
        }
        _ => Err(format!("expected a quoted value, found '{}'", s)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const MANIFEST: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<manifest xmlns:android="http://schemas.android.com/apk/res/android" package="com.x.y">
    <uses-permission android:name="android.permission.CAMERA"/>
    <uses-permission android:name="android.permission.INTERNET"/>
    <application android:label="@string/app_name" android:allowBackup="false">
        <activity android:name=".MainActivity" android:exported="true">
            <intent-filter>
                <action android:name="android.intent.action.MAIN"/>
            </intent-filter>
        </activity>
        <meta-data android:name="com.google.android.gms.ads.APPLICATION_ID" android:value="ca-app-pub"/>
    </application>
</manifest>
"#;

    const PLIST: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0">
<dict>
    <key>NSCameraUsageDescription</key>
    <string>We scan receipts</string>
    <key>ITSAppUsesNonExemptEncryption</key>
    <false/>
</dict>
</plist>
"#;

    fn count(doc: &XmlDocument, path: &str) -> usize {
        doc.find_all(&ElementPath::compile(path).unwrap()).len()
    }

    #[test]
    fn test_parse_manifest() {
        let doc = XmlDocument::parse(MANIFEST).unwrap();
        let root = doc.root().unwrap();
        assert_eq!(root.name, "manifest");
        assert_eq!(root.attribute("package"), Some("com.x.y"));
        assert_eq!(doc.len(), 8);
    }

    #[test]
    fn test_parse_errors() {
        assert!(XmlDocument::parse("<a><b></a>").is_err());
        assert!(XmlDocument::parse("<a>").is_err());
        assert!(XmlDocument::parse("").is_err());
        assert!(XmlDocument::parse("<a/><b/>").is_err());
        assert!(XmlDocument::parse("not xml at all").is_err());
    }

    #[test]
    fn test_child_paths() {
        let doc = XmlDocument::parse(MANIFEST).unwrap();
        assert_eq!(count(&doc, "uses-permission"), 2);
        assert_eq!(count(&doc, "application/activity"), 1);
        assert_eq!(count(&doc, "application/*"), 2);
        assert_eq!(count(&doc, "activity"), 0);
        assert_eq!(count(&doc, "."), 1);
    }

    #[test]
    fn test_descendant_paths() {
        let doc = XmlDocument::parse(MANIFEST).unwrap();
        assert_eq!(count(&doc, ".//action"), 1);
        assert_eq!(count(&doc, "//intent-filter"), 1);
        assert_eq!(count(&doc, ".//activity/intent-filter/action"), 1);
        assert_eq!(count(&doc, ".//service"), 0);
    }

    #[test]
    fn test_absolute_paths() {
        let doc = XmlDocument::parse(MANIFEST).unwrap();
        assert_eq!(count(&doc, "/manifest/application"), 1);
        assert_eq!(count(&doc, "/application"), 0);
        assert_eq!(count(&doc, "/manifest"), 1);
    }

    #[test]
    fn test_attribute_predicates() {
        let doc = XmlDocument::parse(MANIFEST).unwrap();
        assert_eq!(
            count(&doc, "uses-permission[@android:name='android.permission.CAMERA']"),
            1
        );
        assert_eq!(
            count(&doc, "uses-permission[@android:name=\"android.permission.RECORD_AUDIO\"]"),
            0
        );
        assert_eq!(count(&doc, "application[@android:allowBackup='false']"), 1);
        assert_eq!(count(&doc, ".//activity[@android:exported]"), 1);
        assert_eq!(
            count(&doc, ".//meta-data[@android:name='com.google.android.gms.ads.APPLICATION_ID']"),
            1
        );
    }

    #[test]
    fn test_positional_and_parent() {
        let doc = XmlDocument::parse(MANIFEST).unwrap();
        let path = ElementPath::compile("uses-permission[2]").unwrap();
        let found = doc.find_all(&path);
        assert_eq!(found.len(), 1);
        assert_eq!(
            found[0].attribute("android:name"),
            Some("android.permission.INTERNET")
        );
        assert_eq!(count(&doc, "uses-permission[last()]"), 1);
        assert_eq!(count(&doc, "uses-permission[3]"), 0);
        assert_eq!(count(&doc, ".//action/.."), 1);
        assert_eq!(count(&doc, ".."), 0);
    }

    #[test]
    fn test_child_text_predicates() {
        let doc = XmlDocument::parse(PLIST).unwrap();
        assert_eq!(count(&doc, "dict[key='NSCameraUsageDescription']"), 1);
        assert_eq!(count(&doc, "dict[key='NSLocationWhenInUseUsageDescription']"), 0);
        assert_eq!(count(&doc, "dict/key[.='ITSAppUsesNonExemptEncryption']"), 1);
        assert_eq!(count(&doc, "dict[false]"), 1);
    }

    #[test]
    fn test_text_stops_at_first_child() {
        let doc = XmlDocument::parse("<r><q><p>lead<b>bold</b>tail</p></q></r>").unwrap();
        assert_eq!(count(&doc, "q/p[.='lead']"), 1);
        assert_eq!(count(&doc, "q/p[.='leadtail']"), 0);
        assert_eq!(count(&doc, "q[p='lead']"), 1);
        assert_eq!(count(&doc, ".//b[.='bold']"), 1);
    }

    #[test]
    fn test_compile_errors() {
        for bad in ["", "a/", "a[", "a[@]", "a[0]", "a['x']", "a[@b='c]", "a///b", "./[x]", "a]"] {
            assert!(ElementPath::compile(bad).is_err(), "{} should not compile", bad);
        }
    }

    #[test]
    fn test_entities_and_cdata() {
        let doc = XmlDocument::parse("<r><k>a &amp; b</k><c><![CDATA[<raw>]]></c></r>").unwrap();
        assert_eq!(count(&doc, "k[.='a & b']"), 1);
        assert_eq!(count(&doc, "c[.='<raw>']"), 1);
    }
}

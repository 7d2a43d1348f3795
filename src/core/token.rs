//! Deferred values: tokens, expressions, and just-in-time resolution.
//!
//! A [`Token`] names an attribute of a resource node that may not exist yet.
//! Inputs and outputs are declared as [`Expr`] trees mixing literals, tokens
//! and derived values (string interpolation, sequence indexing, JSON
//! encoding). Nothing is resolved at declaration time; the engine resolves an
//! expression once every token it mentions has been realized.
//!
//! Surface syntax inside YAML strings:
//! - `${node.attr}` references a node in the same stack
//! - `${stack.node.attr}` references a node exported by another stack
//! - a trailing `[n]` indexes a sequence, `$${` escapes a literal `${`
//! - a single-key mapping `{ $json: <expr> }` encodes its value as JSON

use crate::error::{Result, StrataError};
use indexmap::IndexMap;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Mapping key that turns a value into a JSON-encoding transform.
pub const JSON_KEY: &str = "$json";

/// Forward reference to `(stack, node, attribute)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token {
    pub stack: String,
    pub node: String,
    pub attribute: String,
}

impl Token {
    pub fn new(
        stack: impl Into<String>,
        node: impl Into<String>,
        attribute: impl Into<String>,
    ) -> Self {
        Self {
            stack: stack.into(),
            node: node.into(),
            attribute: attribute.into(),
        }
    }

    /// Wrap the token as an expression.
    pub fn expr(&self) -> Expr {
        Expr::Ref(self.clone())
    }

    /// Derived token selecting element `index` of a sequence attribute.
    pub fn index(&self, index: usize) -> Expr {
        Expr::Derived(Derived {
            transform: Transform::Index(index),
            sources: vec![self.expr()],
        })
    }

    /// Derived token producing `"<value><suffix>"`.
    pub fn suffixed(&self, suffix: &str) -> Expr {
        Expr::concat(vec![self.expr(), Expr::Literal(Value::String(suffix.into()))])
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${{{}.{}.{}}}", self.stack, self.node, self.attribute)
    }
}

/// Declared value of an input or output.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Ref(Token),
    List(Vec<Expr>),
    Map(IndexMap<String, Expr>),
    Derived(Derived),
}

/// A value computed from other expressions once they resolve.
#[derive(Debug, Clone, PartialEq)]
pub struct Derived {
    pub transform: Transform,
    pub sources: Vec<Expr>,
}

/// Closed set of transforms a derived value can apply.
#[derive(Debug, Clone, PartialEq)]
pub enum Transform {
    /// Concatenate literal text and rendered sources.
    Interpolate(Vec<Segment>),
    /// Element of the single sequence source.
    Index(usize),
    /// Canonical JSON encoding of the single source.
    Json,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Text(String),
    Source(usize),
}

/// Source of realized attribute values during resolution.
pub trait TokenLookup {
    fn lookup(&self, token: &Token) -> Result<Value>;
}

impl TokenLookup for HashMap<Token, Value> {
    fn lookup(&self, token: &Token) -> Result<Value> {
        self.get(token)
            .cloned()
            .ok_or_else(|| StrataError::unresolved(token, "source was never realized"))
    }
}

impl Expr {
    /// Build an interpolation; string literals become text segments.
    pub fn concat(parts: Vec<Expr>) -> Expr {
        let mut segments = Vec::new();
        let mut sources = Vec::new();
        for part in parts {
            match part {
                Expr::Literal(Value::String(s)) => segments.push(Segment::Text(s)),
                other => {
                    segments.push(Segment::Source(sources.len()));
                    sources.push(other);
                }
            }
        }
        Expr::Derived(Derived {
            transform: Transform::Interpolate(segments),
            sources,
        })
    }

    /// Derived value holding the JSON encoding of `inner`.
    pub fn json(inner: Expr) -> Expr {
        Expr::Derived(Derived {
            transform: Transform::Json,
            sources: vec![inner],
        })
    }

    fn into_literal(self) -> Option<Value> {
        match self {
            Expr::Literal(v) => Some(v),
            _ => None,
        }
    }

    /// Every token this expression depends on, in appearance order.
    pub fn tokens(&self) -> Vec<&Token> {
        let mut out = Vec::new();
        self.collect_tokens(&mut out);
        out
    }

    fn collect_tokens<'a>(&'a self, out: &mut Vec<&'a Token>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Ref(t) => out.push(t),
            Expr::List(items) => items.iter().for_each(|e| e.collect_tokens(out)),
            Expr::Map(map) => map.values().for_each(|e| e.collect_tokens(out)),
            Expr::Derived(d) => d.sources.iter().for_each(|e| e.collect_tokens(out)),
        }
    }

    pub fn is_literal(&self) -> bool {
        self.tokens().is_empty()
    }

    /// Substitute every token with its realized value.
    pub fn resolve(&self, lookup: &dyn TokenLookup) -> Result<Value> {
        match self {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Ref(t) => lookup.lookup(t),
            Expr::List(items) => items
                .iter()
                .map(|e| e.resolve(lookup))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            Expr::Map(map) => {
                let mut obj = serde_json::Map::new();
                for (k, e) in map {
                    obj.insert(k.clone(), e.resolve(lookup)?);
                }
                Ok(Value::Object(obj))
            }
            Expr::Derived(d) => {
                let values = d
                    .sources
                    .iter()
                    .map(|e| e.resolve(lookup))
                    .collect::<Result<Vec<_>>>()?;
                d.apply(&values).map_err(|reason| StrataError::unresolved(self, reason))
            }
        }
    }
}

impl Derived {
    fn apply(&self, values: &[Value]) -> std::result::Result<Value, String> {
        match &self.transform {
            Transform::Interpolate(segments) => {
                let mut out = String::new();
                for seg in segments {
                    match seg {
                        Segment::Text(t) => out.push_str(t),
                        Segment::Source(i) => {
                            let v = values.get(*i).ok_or("missing interpolation source")?;
                            out.push_str(&value_to_text(v));
                        }
                    }
                }
                Ok(Value::String(out))
            }
            Transform::Index(i) => match values.first() {
                Some(Value::Array(items)) => items
                    .get(*i)
                    .cloned()
                    .ok_or_else(|| format!("index {} out of range (len {})", i, items.len())),
                Some(other) => Err(format!("cannot index into {}", other)),
                None => Err("missing index source".to_string()),
            },
            Transform::Json => {
                let v = values.first().ok_or("missing json source")?;
                serde_json::to_string(v).map_err(|e| e.to_string()).map(Value::String)
            }
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(v) => write!(f, "{}", v),
            Expr::Ref(t) => write!(f, "{}", t),
            Expr::List(items) => {
                let parts: Vec<String> = items.iter().map(|e| e.to_string()).collect();
                write!(f, "[{}]", parts.join(", "))
            }
            Expr::Map(map) => {
                let parts: Vec<String> = map.iter().map(|(k, e)| format!("{}: {}", k, e)).collect();
                write!(f, "{{{}}}", parts.join(", "))
            }
            Expr::Derived(d) => match &d.transform {
                Transform::Interpolate(segments) => {
                    write!(f, "\"")?;
                    for seg in segments {
                        match seg {
                            Segment::Text(t) => write!(f, "{}", t)?,
                            Segment::Source(i) => match d.sources.get(*i) {
                                Some(src) => write!(f, "{}", src)?,
                                None => write!(f, "?")?,
                            },
                        }
                    }
                    write!(f, "\"")
                }
                Transform::Index(i) => match d.sources.first() {
                    Some(src) => write!(f, "{}[{}]", src, i),
                    None => write!(f, "?[{}]", i),
                },
                Transform::Json => match d.sources.first() {
                    Some(src) => write!(f, "{}({})", JSON_KEY, src),
                    None => write!(f, "{}(?)", JSON_KEY),
                },
            },
        }
    }
}

/// Render a resolved value into interpolated text.
pub fn value_to_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

// ============================================================================
// Parsing
// ============================================================================

/// Parse a declared YAML/JSON value into an expression owned by `stack`.
pub fn parse_expr(raw: &Value, stack: &str) -> Result<Expr> {
    match raw {
        Value::String(s) => parse_string(s, stack),
        Value::Array(items) => {
            let parsed = items
                .iter()
                .map(|v| parse_expr(v, stack))
                .collect::<Result<Vec<_>>>()?;
            if parsed.iter().all(|e| matches!(e, Expr::Literal(_))) {
                let values = parsed.into_iter().filter_map(Expr::into_literal).collect();
                return Ok(Expr::Literal(Value::Array(values)));
            }
            Ok(Expr::List(parsed))
        }
        Value::Object(map) => {
            if map.len() == 1 {
                if let Some(inner) = map.get(JSON_KEY) {
                    return Ok(Expr::json(parse_expr(inner, stack)?));
                }
            }
            let mut parsed = IndexMap::new();
            for (k, v) in map {
                parsed.insert(k.clone(), parse_expr(v, stack)?);
            }
            if parsed.values().all(|e| matches!(e, Expr::Literal(_))) {
                let values = parsed
                    .into_iter()
                    .filter_map(|(k, e)| e.into_literal().map(|v| (k, v)))
                    .collect();
                return Ok(Expr::Literal(Value::Object(values)));
            }
            Ok(Expr::Map(parsed))
        }
        other => Ok(Expr::Literal(other.clone())),
    }
}

fn parse_string(s: &str, stack: &str) -> Result<Expr> {
    let mut parts: Vec<Expr> = Vec::new();
    let mut text = String::new();
    let mut rest = s;

    while let Some(open) = rest.find("${") {
        if rest[..open].ends_with('$') {
            text.push_str(&rest[..open - 1]);
            text.push_str("${");
            rest = &rest[open + 2..];
            continue;
        }
        text.push_str(&rest[..open]);
        let close = rest[open..].find('}').map(|c| open + c).ok_or_else(|| {
            StrataError::Parse {
                origin: format!("stack '{}'", stack),
                reason: format!("unclosed reference in \"{}\"", s),
            }
        })?;
        if !text.is_empty() {
            parts.push(Expr::Literal(Value::String(std::mem::take(&mut text))));
        }
        parts.push(parse_reference(rest[open + 2..close].trim(), stack)?);
        rest = &rest[close + 1..];
    }
    text.push_str(rest);
    if !text.is_empty() {
        parts.push(Expr::Literal(Value::String(text)));
    }

    match parts.len() {
        0 => Ok(Expr::Literal(Value::String(String::new()))),
        1 => Ok(parts.remove(0)),
        _ => Ok(Expr::concat(parts)),
    }
}

fn parse_reference(reference: &str, stack: &str) -> Result<Expr> {
    let bad = |reason: String| StrataError::Parse {
        origin: format!("stack '{}'", stack),
        reason,
    };

    let (path, index) = match reference.strip_suffix(']') {
        Some(head) => {
            let open = head
                .rfind('[')
                .ok_or_else(|| bad(format!("malformed index in ${{{}}}", reference)))?;
            let idx: usize = head[open + 1..]
                .trim()
                .parse()
                .map_err(|_| bad(format!("malformed index in ${{{}}}", reference)))?;
            (&head[..open], Some(idx))
        }
        None => (reference, None),
    };

    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|p| !is_identifier(p)) {
        return Err(bad(format!("malformed reference ${{{}}}", reference)));
    }
    let token = match segments.as_slice() {
        [node, attr] => Token::new(stack, *node, *attr),
        [other, node, attr] => Token::new(*other, *node, *attr),
        _ => {
            return Err(bad(format!(
                "reference ${{{}}} must be node.attr or stack.node.attr",
                reference
            )))
        }
    };

    Ok(match index {
        Some(i) => token.index(i),
        None => Expr::Ref(token),
    })
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

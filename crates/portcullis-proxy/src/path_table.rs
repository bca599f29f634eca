//! Method + path pattern tables.
//!
//! Patterns are compiled once when a route is loaded. A pattern is a path
//! where `{name}` placeholders match one segment; the remaining text is used
//! as a regular expression. A pattern matches the request path when it
//! matches a whole leading run of segments, so `/users/{id}` covers
//! `/users/7` and `/users/7/orders` but not `/users7`.

use hyper::Method;
use once_cell::sync::Lazy;
use regex::Regex;

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{[^/{}]*\}").unwrap());

#[derive(Debug, thiserror::Error)]
pub enum PatternError {
    #[error("invalid method '{0}'")]
    Method(String),
    #[error("invalid path pattern '{pattern}': {source}")]
    Path {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

#[derive(Debug)]
struct Entry<T> {
    method: Option<Method>,
    path: Regex,
    value: T,
}

/// First-match lookup table keyed by method and path pattern.
#[derive(Debug)]
pub struct PathTable<T> {
    entries: Vec<Entry<T>>,
}

impl<T> Default for PathTable<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T> PathTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pattern. An empty or `*` method matches any method.
    pub fn insert(&mut self, method: &str, pattern: &str, value: T) -> Result<(), PatternError> {
        let method = match method.trim() {
            "" | "*" => None,
            m => Some(
                Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                    .map_err(|_| PatternError::Method(m.to_string()))?,
            ),
        };
        let path = compile_pattern(pattern)?;
        self.entries.push(Entry {
            method,
            path,
            value,
        });
        Ok(())
    }

    pub fn lookup(&self, method: &Method, path: &str) -> Option<&T> {
        self.entries
            .iter()
            .find(|e| e.method.as_ref().map_or(true, |m| m == method) && e.path.is_match(path))
            .map(|e| &e.value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.entries.iter().map(|e| &e.value)
    }
}

fn compile_pattern(pattern: &str) -> Result<Regex, PatternError> {
    let trimmed = pattern.trim_end_matches('/');
    let body = PLACEHOLDER.replace_all(trimmed, "[^/]+");
    let body = if body.starts_with('/') {
        body.into_owned()
    } else {
        format!("/{body}")
    };
    let body = if body == "/" { String::new() } else { body };
    Regex::new(&format!("^{body}(?:/|$)")).map_err(|source| PatternError::Path {
        pattern: pattern.to_string(),
        source,
    })
}

//! Ordered list of backend addresses for one route.

use std::fmt;
use std::sync::Arc;

/// Ordered, immutable list of backend URIs.
///
/// Cloning is cheap (shared `Arc`); a refresh replaces the whole list rather
/// than mutating it in place.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct HostList {
    hosts: Arc<[String]>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("index {index} out of range for host list of length {len}")]
pub struct HostIndexError {
    pub index: usize,
    pub len: usize,
}

impl HostList {
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            hosts: hosts.into_iter().map(Into::into).collect(),
        }
    }

    /// An explicitly empty list, used as the "no last good data" placeholder.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn get(&self, index: usize) -> Result<&str, HostIndexError> {
        self.hosts
            .get(index)
            .map(String::as_str)
            .ok_or(HostIndexError {
                index,
                len: self.hosts.len(),
            })
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.hosts.iter().map(String::as_str)
    }
}

impl fmt::Debug for HostList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.hosts.iter()).finish()
    }
}

impl From<Vec<String>> for HostList {
    fn from(hosts: Vec<String>) -> Self {
        Self {
            hosts: hosts.into(),
        }
    }
}

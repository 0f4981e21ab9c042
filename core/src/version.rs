//! Package version parsing and ordering

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// A dotted package version as published on a package feed.
///
/// Accepts two to four numeric components plus an optional pre-release tag
/// (`1.0`, `1.0.2`, `1.0.2.17`, `2.1.0-beta3`). Trailing zero components are
/// insignificant for equality and ordering, so `1.0` and `1.0.0` compare
/// equal. A release version orders after any pre-release with the same
/// numeric components.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PackageVersion {
    parts: Vec<u64>,
    pre: Option<String>,
}

impl PackageVersion {
    /// Create a release version from numeric components.
    pub fn new(parts: &[u64]) -> Self {
        Self {
            parts: Self::normalize(parts),
            pre: None,
        }
    }

    /// Numeric components with trailing zeros removed.
    pub fn parts(&self) -> &[u64] {
        &self.parts
    }

    /// Pre-release tag, if any.
    pub fn pre_release(&self) -> Option<&str> {
        self.pre.as_deref()
    }

    fn normalize(parts: &[u64]) -> Vec<u64> {
        let mut parts = parts.to_vec();
        while parts.len() > 1 && parts.last() == Some(&0) {
            parts.pop();
        }
        parts
    }

    fn component(&self, idx: usize) -> u64 {
        self.parts.get(idx).copied().unwrap_or(0)
    }
}

impl fmt::Display for PackageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .parts
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(".");
        match &self.pre {
            Some(pre) => write!(f, "{joined}-{pre}"),
            None => write!(f, "{joined}"),
        }
    }
}

impl FromStr for PackageVersion {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (numeric, pre) = match s.split_once('-') {
            Some((n, p)) if !p.is_empty() => (n, Some(p.to_string())),
            Some((n, _)) => (n, None),
            None => (s, None),
        };

        let raw: Vec<&str> = numeric.split('.').collect();
        if raw.is_empty() || raw.len() > 4 {
            return Err(ParseVersionError::InvalidFormat(s.to_string()));
        }

        let mut parts = Vec::with_capacity(raw.len());
        for part in raw {
            let n = part
                .parse::<u64>()
                .map_err(|_| ParseVersionError::InvalidNumber(part.to_string()))?;
            parts.push(n);
        }

        Ok(Self {
            parts: Self::normalize(&parts),
            pre,
        })
    }
}

impl PartialOrd for PackageVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PackageVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.parts.len().max(other.parts.len());
        for idx in 0..len {
            match self.component(idx).cmp(&other.component(idx)) {
                Ordering::Equal => continue,
                unequal => return unequal,
            }
        }
        // Same numeric components: a release outranks any pre-release.
        match (&self.pre, &other.pre) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) => a.cmp(b),
        }
    }
}

/// Error type for version parsing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseVersionError {
    /// Invalid format (expected 2-4 dotted numeric components)
    InvalidFormat(String),
    /// Invalid number in version component
    InvalidNumber(String),
}

impl fmt::Display for ParseVersionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidFormat(s) => write!(f, "Invalid version format: '{s}'"),
            Self::InvalidNumber(s) => write!(f, "Invalid version number: '{s}'"),
        }
    }
}

impl std::error::Error for ParseVersionError {}

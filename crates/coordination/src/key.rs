//! Canonical registry keys

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Path separator used by every backend layout
pub const SEPARATOR: char = '/';

/// Normalized, backend-agnostic address of a registry entry.
///
/// A key is a list of non-empty segments. Rendered as a path it always has a
/// single leading separator and never a trailing one; the root key renders
/// as `/`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CanonicalKey {
    segments: Vec<String>,
}

impl CanonicalKey {
    /// The root key (`/`)
    pub fn root() -> Self {
        Self::default()
    }

    /// Build a key from segments, rejecting empty segments and segments
    /// that contain the separator.
    pub fn from_segments<I, S>(segments: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut key = Self::root();
        for segment in segments {
            key = key.child(segment)?;
        }
        Ok(key)
    }

    /// Parse a path, collapsing repeated separators and dropping leading and
    /// trailing ones.
    pub fn parse(path: &str) -> Self {
        Self {
            segments: path
                .split(SEPARATOR)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    /// Append one segment
    pub fn child(&self, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "empty segment under {}",
                self
            )));
        }
        if name.contains(SEPARATOR) {
            return Err(Error::InvalidArgument(format!(
                "segment '{}' contains '{}'",
                name, SEPARATOR
            )));
        }
        let mut segments = self.segments.clone();
        segments.push(name);
        Ok(Self { segments })
    }

    /// The parent key, `None` for the root
    pub fn parent(&self) -> Option<Self> {
        if self.segments.is_empty() {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// Proper ancestors from the top down, excluding the root
    pub fn ancestors(&self) -> Vec<Self> {
        (1..self.segments.len())
            .map(|len| Self {
                segments: self.segments[..len].to_vec(),
            })
            .collect()
    }

    /// Last segment, `None` for the root
    pub fn name(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// Path segments
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Whether this is the root key
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Whether `other` sits below this key
    pub fn is_ancestor_of(&self, other: &CanonicalKey) -> bool {
        other.segments.len() > self.segments.len()
            && other.segments[..self.segments.len()] == self.segments[..]
    }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return write!(f, "{}", SEPARATOR);
        }
        for segment in &self.segments {
            write!(f, "{}{}", SEPARATOR, segment)?;
        }
        Ok(())
    }
}

impl From<&CanonicalKey> for String {
    fn from(key: &CanonicalKey) -> Self {
        key.to_string()
    }
}

/// Lifetime class of a registry entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Durability {
    /// Survives the session that wrote it
    Persistent,
    /// Removed by the backend when the owning session ends
    Ephemeral,
}

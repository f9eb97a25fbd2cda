//! Content identifiers.
//!
//! A CID is chosen by the client (usually a secure hash of the tarball) and
//! doubles as a file name in the staging directory and as a path under the
//! repository prefix, so it is normalized and restricted before use:
//! - at most one `/`, used to group tarballs by project
//! - no leading `.`
//! - no `'` or `\`, which are special to the shell quoting used by the
//!   publish tool

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reasons a CID is refused at the boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CidError {
    #[error("cid is empty")]
    Empty,

    #[error("cid may not be an absolute path")]
    Absolute,

    #[error("cid may not start with \".\"")]
    LeadingDot,

    #[error("disallowed character in cid")]
    DisallowedCharacter,

    #[error("at most one slash allowed in cid")]
    TooManySlashes,
}

/// A validated, normalized content identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cid(String);

impl Cid {
    /// Normalize and validate a raw identifier.
    pub fn parse(raw: &str) -> Result<Self, CidError> {
        if raw.is_empty() {
            return Err(CidError::Empty);
        }
        if raw.starts_with('/') {
            return Err(CidError::Absolute);
        }

        let normalized = normalize(raw);
        if normalized.starts_with('.') {
            return Err(CidError::LeadingDot);
        }
        if normalized.contains('\'') || normalized.contains('\\') {
            return Err(CidError::DisallowedCharacter);
        }
        if normalized.matches('/').count() > 1 {
            return Err(CidError::TooManySlashes);
        }

        Ok(Self(normalized))
    }

    /// The identifier as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The group directory for grouped identifiers (`group/name`).
    pub fn group(&self) -> Option<&str> {
        self.0.split_once('/').map(|(group, _)| group)
    }
}

/// Lexical path normalization: collapses repeated separators, drops `.`
/// and lets `..` cancel the preceding component.
fn normalize(raw: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in raw.split('/') {
        match part {
            "" | "." => {}
            ".." => match parts.last() {
                Some(&last) if last != ".." => {
                    parts.pop();
                }
                _ => parts.push(".."),
            },
            other => parts.push(other),
        }
    }

    if parts.is_empty() {
        ".".to_string()
    } else {
        parts.join("/")
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Cid {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Cid {
    type Error = CidError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Cid> for String {
    fn from(cid: Cid) -> Self {
        cid.0
    }
}

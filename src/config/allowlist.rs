//! Identity allow-lists.

use std::collections::{BTreeMap, HashSet};

/// Trusted certificate subjects.
///
/// Parsed from a grid-mapfile: the DN is the text between the first pair of
/// double quotes on each line. Blank lines and `#` lines are skipped, as are
/// lines without a quoted DN.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowList {
    dns: HashSet<String>,
}

impl AllowList {
    pub fn parse(text: &str) -> Self {
        let dns = text
            .lines()
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| {
                let mut parts = line.split('"');
                parts.next();
                let dn = parts.next()?;
                // Needs a closing quote.
                parts.next().map(|_| dn.to_string())
            })
            .collect();
        Self { dns }
    }

    pub fn contains(&self, dn: &str) -> bool {
        self.dns.contains(dn)
    }

    pub fn len(&self) -> usize {
        self.dns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dns.is_empty()
    }
}

impl FromIterator<String> for AllowList {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self {
            dns: iter.into_iter().collect(),
        }
    }
}

/// Trusted token issuers, each with an optional base64 Ed25519 public key.
///
/// One issuer per line: `<issuer> [<key>]`. Blank lines and `#` lines are
/// skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IssuerList {
    issuers: BTreeMap<String, Option<String>>,
}

impl IssuerList {
    pub fn parse(text: &str) -> Self {
        let mut issuers = BTreeMap::new();
        for line in text.lines() {
            if line.starts_with('#') {
                continue;
            }
            let mut words = line.split_whitespace();
            let Some(issuer) = words.next() else {
                continue;
            };
            issuers.insert(issuer.to_string(), words.next().map(str::to_string));
        }
        Self { issuers }
    }

    pub fn is_trusted(&self, issuer: &str) -> bool {
        self.issuers.contains_key(issuer)
    }

    /// Base64 public key of a trusted issuer, if one was listed.
    pub fn key(&self, issuer: &str) -> Option<&str> {
        self.issuers.get(issuer).and_then(|key| key.as_deref())
    }

    pub fn len(&self) -> usize {
        self.issuers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.issuers.is_empty()
    }

    pub fn insert(&mut self, issuer: impl Into<String>, key: Option<String>) {
        self.issuers.insert(issuer.into(), key);
    }
}

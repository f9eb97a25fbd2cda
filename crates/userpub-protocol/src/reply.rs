//! Successful replies.
//!
//! Clients parse these bodies line by line, so the wire text is fixed.

use std::fmt;

/// A successful API reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Accepted: queued, pinged, or lifecycle change done.
    Ok,
    /// The CID is published; carries the full path it was published to.
    Present(String),
    /// The CID is not published anywhere.
    Missing,
    /// Configured repository names, in config order.
    Repos(Vec<String>),
}

impl Reply {
    /// Response body, newline terminated.
    pub fn body(&self) -> String {
        match self {
            Self::Ok => "OK\n".to_string(),
            Self::Present(path) => format!("PRESENT:{}\n", path),
            Self::Missing => "MISSING\n".to_string(),
            Self::Repos(repos) => format!("repos:{}\n", repos.join(",")),
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.body().trim_end())
    }
}

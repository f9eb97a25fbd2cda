//! Rejections returned to clients.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Rejection classes, each mapped to one HTTP status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectKind {
    /// Malformed CID, missing parameter, unreadable body, inactive service.
    BadRequest,
    /// Unrecognized principal, untrusted issuer, missing scope.
    AccessDenied,
    /// Unknown API path.
    NotFound,
    /// The work queue stayed full for the whole enqueue wait.
    Unavailable,
}

impl RejectKind {
    /// HTTP status code for this class.
    pub fn status(self) -> u16 {
        match self {
            Self::BadRequest => 400,
            Self::AccessDenied => 403,
            Self::NotFound => 404,
            Self::Unavailable => 503,
        }
    }

    /// HTTP reason phrase for this class.
    pub fn reason_phrase(self) -> &'static str {
        match self {
            Self::BadRequest => "Bad request",
            Self::AccessDenied => "Access denied",
            Self::NotFound => "Not found",
            Self::Unavailable => "Service unavailable",
        }
    }
}

impl fmt::Display for RejectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadRequest => write!(f, "BAD_REQUEST"),
            Self::AccessDenied => write!(f, "ACCESS_DENIED"),
            Self::NotFound => write!(f, "NOT_FOUND"),
            Self::Unavailable => write!(f, "UNAVAILABLE"),
        }
    }
}

/// A request refused with a human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub kind: RejectKind,
    /// Single line, safe to echo back to the client.
    pub message: String,
}

impl Rejection {
    pub fn new(kind: RejectKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// A 400 rejection. The body reads `Bad request: <reason>`.
    pub fn bad_request(reason: impl fmt::Display) -> Self {
        Self::new(RejectKind::BadRequest, format!("Bad request: {}", reason))
    }

    pub fn access_denied(message: impl Into<String>) -> Self {
        Self::new(RejectKind::AccessDenied, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(RejectKind::NotFound, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(RejectKind::Unavailable, message)
    }

    /// Response body, newline terminated.
    pub fn body(&self) -> String {
        format!("{}\n", self.message)
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Rejection {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_request_body() {
        let rejection = Rejection::bad_request("exists with no cid");
        assert_eq!(rejection.kind.status(), 400);
        assert_eq!(rejection.body(), "Bad request: exists with no cid\n");
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(RejectKind::AccessDenied.status(), 403);
        assert_eq!(RejectKind::NotFound.status(), 404);
        assert_eq!(RejectKind::Unavailable.status(), 503);
    }
}

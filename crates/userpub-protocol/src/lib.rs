//! userpub shared types
//!
//! Defines the content identifier rules, the plain-text replies returned to
//! publishing clients, and the typed configuration snapshot shared between
//! the request side and the repository workers.

pub mod cid;
pub mod error;
pub mod reply;
pub mod snapshot;

pub use cid::{Cid, CidError};
pub use error::{RejectKind, Rejection};
pub use reply::Reply;
pub use snapshot::{ConfigSnapshot, HostRepo, SnapshotError};

/// Directory name of the timestamp tree inside every repository.
///
/// The publish tool treats this name specially: publishing into it only
/// touches the named files.
pub const TIMESTAMP_DIR: &str = "ts";

/// Marker file that makes a directory a nested catalog boundary.
pub const CATALOG_MARKER: &str = ".cvmfscatalog";

/// Principal granted to unauthenticated loopback callers.
pub const LOCAL_PRINCIPAL: &str = "localhost";

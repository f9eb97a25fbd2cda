//! userpub - publication gatekeeper for a replicated repository store
//!
//! Clients submit immutable artifacts keyed by a content identifier (CID).
//! This crate deduplicates submissions, stages them, and hands them to the
//! per-repository workers in `userpub-worker`, which publish them with the
//! external repository tools and age them out again.

pub mod api;
pub mod config;
pub mod context;
pub mod identity;
pub mod staging;

pub use api::{ApiRequest, ApiResponse, Dispatcher};
pub use config::{CachedConfig, ConfigCache, ConfigError, ConfigPaths};
pub use context::{ServiceContext, ServiceOptions, ServiceState};
pub use identity::{Credentials, IdentityError, IdentityResolver};
pub use staging::{StageError, StageOutcome, StagingArea};

//! Request-facing storage controller for weave sync.
//!
//! The controller sits between a routed, authenticated request and the
//! storage engine:
//! - Query argument parsing into filters, sort and pagination
//! - `X-If-Unmodified-Since` preconditions
//! - Batch admission by count and payload bytes
//! - Quota enforcement and warnings
//! - JSON, newline and whoisi output formats

pub mod controller;
pub mod error;
pub mod metrics;
pub mod request;
pub mod response;

pub use controller::{BatchResult, StorageController};
pub use error::{ControllerError, ControllerResult};
pub use request::{CollectionArgs, SyncRequest};
pub use response::{Format, SyncResponse};

//! Core domain types for the weave sync storage service.
//!
//! This crate defines the data model shared by the storage engine and the
//! request controller:
//! - Two-decimal timestamps stored as scaled integers
//! - WBO records and inbound validation
//! - Collection name rules and the fixed name/id tables
//! - Item filters, sort orders and pagination
//! - Configuration

pub mod collection;
pub mod config;
pub mod error;
pub mod filter;
pub mod timestamp;
pub mod wbo;

pub use collection::{CollectionIds, META_COLLECTION, META_GLOBAL_ID, TABS_COLLECTION};
pub use error::{Error, Result};
pub use filter::{ItemFilters, ItemQuery, Sort};
pub use timestamp::Timestamp;
pub use wbo::{ItemUpdate, MAX_TTL, Wbo, WboField};

/// Externally assigned numeric user id.
pub type UserId = i64;

/// Per-user collection id.
pub type CollectionId = i32;

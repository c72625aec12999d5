//! Collection names and the fixed name/id tables.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Collection holding the per-user `global` metadata record.
pub const META_COLLECTION: &str = "meta";

/// Item id of the metadata record inside [`META_COLLECTION`].
pub const META_GLOBAL_ID: &str = "global";

/// Collection that lives only in the cache.
pub const TABS_COLLECTION: &str = "tabs";

/// Longest accepted collection name.
pub const MAX_COLLECTION_NAME_LENGTH: usize = 32;

/// First id handed out to custom collections when a fixed table is in use.
pub const CUSTOM_COLLECTION_FLOOR: i32 = 100;

const STANDARD: &[(&str, i32)] = &[
    ("client", 1),
    ("crypto", 2),
    ("forms", 3),
    ("history", 4),
    ("key", 5),
    ("meta", 6),
    ("bookmarks", 7),
    ("prefs", 8),
    ("tabs", 9),
    ("passwords", 10),
];

const FIXED: &[(&str, i32)] = &[
    ("clients", 1),
    ("crypto", 2),
    ("forms", 3),
    ("history", 4),
    ("keys", 5),
    ("meta", 6),
    ("bookmarks", 7),
    ("prefs", 8),
    ("tabs", 9),
    ("passwords", 10),
    ("addons", 11),
];

/// How collection names map to ids for a deployment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionIds {
    /// Every collection gets a per-user id allocated from 0.
    #[default]
    Dynamic,
    /// Legacy table (`client`, `key`, ...), custom ids from 100.
    Standard,
    /// Current table (`clients`, `keys`, `addons`, ...), custom ids from 100.
    Fixed,
}

impl CollectionIds {
    fn table(self) -> &'static [(&'static str, i32)] {
        match self {
            CollectionIds::Dynamic => &[],
            CollectionIds::Standard => STANDARD,
            CollectionIds::Fixed => FIXED,
        }
    }

    pub fn fixed_id(self, name: &str) -> Option<i32> {
        self.table()
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, id)| *id)
    }

    pub fn fixed_name(self, id: i32) -> Option<&'static str> {
        self.table()
            .iter()
            .find(|(_, i)| *i == id)
            .map(|(name, _)| *name)
    }

    /// Lowest id a custom collection may receive.
    pub fn custom_floor(self) -> i32 {
        match self {
            CollectionIds::Dynamic => 0,
            CollectionIds::Standard | CollectionIds::Fixed => CUSTOM_COLLECTION_FLOOR,
        }
    }
}

/// Validate a collection name (`[a-zA-Z0-9._-]+`, at most 32 characters).
pub fn validate_collection_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_COLLECTION_NAME_LENGTH {
        return Err(Error::InvalidCollection(name.to_string()));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(Error::InvalidCollection(name.to_string()));
    }
    Ok(())
}

pub fn is_meta_global(collection: &str, item_id: &str) -> bool {
    collection == META_COLLECTION && item_id == META_GLOBAL_ID
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_tables_resolve_both_ways() {
        assert_eq!(CollectionIds::Fixed.fixed_id("addons"), Some(11));
        assert_eq!(CollectionIds::Fixed.fixed_id("client"), None);
        assert_eq!(CollectionIds::Standard.fixed_id("client"), Some(1));
        assert_eq!(CollectionIds::Standard.fixed_id("addons"), None);
        assert_eq!(CollectionIds::Fixed.fixed_name(5), Some("keys"));
        assert_eq!(CollectionIds::Standard.fixed_name(5), Some("key"));
        assert_eq!(CollectionIds::Dynamic.fixed_id("bookmarks"), None);
    }

    #[test]
    fn floors() {
        assert_eq!(CollectionIds::Dynamic.custom_floor(), 0);
        assert_eq!(CollectionIds::Fixed.custom_floor(), 100);
        assert_eq!(CollectionIds::Standard.custom_floor(), 100);
    }

    #[test]
    fn name_validation() {
        assert!(validate_collection_name("bookmarks").is_ok());
        assert!(validate_collection_name("my-coll_1.x").is_ok());
        assert!(validate_collection_name("").is_err());
        assert!(validate_collection_name("a/b").is_err());
        assert!(validate_collection_name("with space").is_err());
        assert!(validate_collection_name(&"a".repeat(33)).is_err());
    }

    #[test]
    fn regime_deserializes_lowercase() {
        let ids: CollectionIds = serde_json::from_str("\"standard\"").unwrap();
        assert_eq!(ids, CollectionIds::Standard);
    }
}

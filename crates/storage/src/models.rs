//! Records exchanged with the storage engine.

use serde::{Deserialize, Serialize};
use weave_core::{CollectionId, UserId};

// =============================================================================
// Users
// =============================================================================

/// Account status stored with a user row.
pub const USER_STATUS_ACTIVE: i32 = 1;

/// A user row. Fields left out of a projection are `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: UserId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<i32>,
}

/// Values for `set_user`. Unset fields keep their stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserUpdate {
    pub username: Option<String>,
    pub email: Option<String>,
    pub status: Option<i32>,
}

/// Columns of a user row that a read can project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UserField {
    Username,
    Email,
    Status,
}

impl UserField {
    pub const ALL: &'static [UserField] = &[UserField::Username, UserField::Email, UserField::Status];

    pub fn column(self) -> &'static str {
        match self {
            UserField::Username => "username",
            UserField::Email => "email",
            UserField::Status => "status",
        }
    }
}

// =============================================================================
// Collections
// =============================================================================

/// A user's collection and its id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionRecord {
    pub user_id: UserId,
    pub collection_id: CollectionId,
    pub name: String,
}

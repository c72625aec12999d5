//! Repository traits for storage operations.

pub mod collections;
pub mod items;
pub mod quota;
pub mod users;

pub use collections::CollectionRepo;
pub use items::ItemRepo;
pub use quota::QuotaRepo;
pub use users::UserRepo;

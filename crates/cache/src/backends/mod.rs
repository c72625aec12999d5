//! Cache backend implementations.

pub mod memcached;
pub mod memory;

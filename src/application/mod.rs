//! Request handling on top of the cache layer.

pub mod error;
pub mod proxy;

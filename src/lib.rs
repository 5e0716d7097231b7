//! Cachet: a request-classifying HTTP caching reverse proxy.

pub mod application;
pub mod cache;
pub mod config;
pub mod infra;

//! Core infrastructure: shared foundation used across the whole crate.
//!
//! - **config**: runtime settings loading and the immutable node configuration.
//! - **error**: application-wide error enum.

pub mod config;
pub mod error;

//! p2pnode: single-process bootstrap for a federated messaging node.
//!
//! Startup runs leaves first:
//!
//! ```text
//! identity → NodeConfig → component graph → routes → supervised listeners
//! ```
//!
//! The same router is served on a clearnet TCP socket and over overlay
//! streams on the `/matrix` protocol.

pub mod assembly;
pub mod bootstrap;
pub mod core;
pub mod subsystems;
pub mod supervisor;
pub mod transport;

pub use crate::core::{config, error};

//! Bootstrap layer: modules that run before any component is assembled.
//!
//! - **identity**: ed25519 keypair load-or-create.
//! - **logger**: tracing-subscriber initialisation.

pub mod identity;
pub mod logger;

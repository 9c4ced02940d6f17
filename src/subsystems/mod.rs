//! Service components assembled into the node.
//!
//! Everything here runs in-process.  Components that would own a database
//! open their datastore descriptor during setup so that an undialable
//! descriptor fails assembly instead of the first request.

pub mod api;
pub mod appservice;
pub mod federation;
pub mod fedsender;
pub mod roomserver;
pub mod storage;
pub mod topic;
pub mod transactions;
pub mod typing;

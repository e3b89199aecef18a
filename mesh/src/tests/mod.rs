//! Internal tests module
//!
//! Multi-mesh-base scenarios wired through an in-process name server. They have
//! full access to crate internals.

mod replication;
mod test_utils;

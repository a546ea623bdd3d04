//! Wire contract between the mirach agent and the remote collector.
//!
//! [`types`] holds the published and received shapes; [`codec`] turns a
//! [`types::PluginResult`] into a size-bounded wire message and back.

pub mod codec;
pub mod types;

//! The mirach host agent.
//!
//! Plugins (external commands or built-in probes) run on cron-style
//! schedules; each result is encoded by [`mirach_common::codec`] and
//! published to the asset's data topic. A command listener on the asset's
//! command topic can trigger plugins, answer pings, or stop the agent.

pub mod agent;
pub mod commands;
pub mod config;
pub mod error;
pub mod logging;
pub mod plugin;
pub mod scheduler;
pub mod transport;

#[cfg(test)]
mod tests;

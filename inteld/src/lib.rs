//! On-host agent for the intel telemetry pipeline.
//!
//! The agent keeps a set of tracked executables shimmed in the user's PATH,
//! receives that set from the collector over a resilient RPC session, and
//! uploads batched invocation records reported by the shims.

#![forbid(unsafe_code)]

pub mod cache;
pub mod client;
pub mod daemon;
pub mod host;
pub mod pathman;
pub mod queue;
pub mod tracker;

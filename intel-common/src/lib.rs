//! Shared protocol and transport plumbing for the intel telemetry pipeline.
//!
//! Layering, bottom up: [`ws`] adapts a websocket into a byte stream,
//! [`mux`] multiplexes logical streams over it, and [`rpc`] dispatches the
//! agent/collector protocol ([`proto`]) across those streams. [`loopback`]
//! is the separate shim-to-agent fast path, [`queue`] the batching core
//! both endpoints drain through, and [`api`] holds the management API's
//! JSON types.

#![forbid(unsafe_code)]

pub mod api;
pub mod hash;
pub mod loopback;
pub mod mux;
pub mod proto;
pub mod queue;
pub mod rpc;
pub mod ws;

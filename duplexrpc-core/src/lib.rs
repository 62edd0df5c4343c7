//! Core protocol types for duplexrpc.
//!
//! This crate provides shared types and functions used by both the server
//! (`duplexrpc-axum`) and client (`duplexrpc-client`) crates.
//!
//! ## Modules
//!
//! - [`reply`]: The result envelope that carries every RPC outcome
//! - [`frame`]: Wire frames multiplexed over a single socket
//! - [`context`]: The mutable per-request HTTP context record
//! - [`sequence`]: Request id allocation

mod context;
mod frame;
mod reply;
mod sequence;

pub use context::*;
pub use frame::*;
pub use reply::*;
pub use sequence::*;

//! A stateful NAT64 session core (RFC 6146): the Binding Information Base,
//! the per-protocol session table and TCP state machine, and the IPv4
//! transport address pool that feeds them, wrapped in an [`engine::Engine`]
//! facade that holds the single lock described in the crate's concurrency
//! model.
//!
//! This crate is the session core only. Packet parsing, checksum fixup,
//! RFC 6052 address-embedding arithmetic, and the network interface layer
//! are external collaborators: callers hand the core fully-formed
//! [`transport::Tuple`] values (with both address families already
//! resolved) and apply whatever transport addresses the core hands back.

pub mod bib;
pub mod engine;
pub mod error;
pub mod pool;
pub mod session;
pub mod transport;

pub use engine::{Engine, EngineOptions};

//! Error taxonomies for each subsystem.
//!
//! Each enum maps directly onto a failure class from the error handling
//! design: `register`/`remove` failures for the pool, index collisions for
//! the BIB, and the packet-path outcomes (`POOL_EXHAUSTED`, `NO_BINDING`,
//! `NO_SESSION`, ...) for the engine.

use std::net::Ipv4Addr;

use crate::transport::{Ipv4Transport, Ipv6Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("IPv4 address {0} is already registered in the pool")]
    AlreadyRegistered(Ipv4Addr),
    #[error("IPv4 address {0} is not a member of the pool")]
    NotAMember(Ipv4Addr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BibError {
    #[error("a binding already exists for IPv6 transport address {0}")]
    Ipv6Collision(Ipv6Transport),
    #[error("a binding already exists for IPv4 transport address {0}")]
    Ipv4Collision(Ipv4Transport),
}

/// The outcome of a pool reservation attempt for a caller-specified
/// (protocol, transport address) pair, as used by static binding
/// installation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationOutcome {
    Ok,
    Taken,
    NotOwned,
}

/// Errors surfaced by [`crate::Engine::handle_outbound_v6`] and
/// [`crate::Engine::handle_inbound_v4`].
///
/// `Internal` is the one variant that is never supposed to happen: debug
/// builds turn it into a panic at the point it would otherwise be returned
/// (see [`crate::engine::debug_assert_invariant`]), since by definition it
/// indicates the three subsystems have fallen out of sync with each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("invalid argument: {0}")]
    BadArg(&'static str),
    #[error("unsupported protocol for this operation")]
    UnsupportedProto,
    #[error("IPv4 transport address pool exhausted")]
    PoolExhausted,
    #[error("no existing binding for this inbound packet")]
    NoBinding,
    #[error("no existing session for this packet")]
    NoSession,
    #[error("internal invariant violated: {0}")]
    Internal(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ControlError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Bib(#[from] BibError),
    #[error("pool has no free transport address for this static binding")]
    PoolReservationFailed,
}

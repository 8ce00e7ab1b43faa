//! Transport addresses, protocol tags, and the tuples the packet-parsing
//! collaborator hands to the [`crate::Engine`].

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

/// The layer-4 protocol a flow belongs to.
///
/// ICMPv4 and ICMPv6 share a single tag: the BIB and session tables are
/// partitioned by this enum, not by IP version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Protocol {
    Udp,
    Tcp,
    Icmp,
}

impl Protocol {
    /// All protocol tags, in the order used to index per-protocol tables.
    pub const ALL: [Protocol; 3] = [Protocol::Udp, Protocol::Tcp, Protocol::Icmp];

    pub(crate) const fn index(self) -> usize {
        match self {
            Protocol::Udp => 0,
            Protocol::Tcp => 1,
            Protocol::Icmp => 2,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::Udp => "UDP",
            Protocol::Tcp => "TCP",
            Protocol::Icmp => "ICMP",
        })
    }
}

/// An (IP address, 16-bit identifier) pair.
///
/// The identifier is a UDP/TCP port for those protocols, or the ICMP Echo
/// identifier for ICMP. `A` is either [`Ipv4Addr`] or [`Ipv6Addr`]; the two
/// instantiations are distinct types so a binding can never be built the
/// wrong way around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TransportAddr<A> {
    pub address: A,
    pub identifier: u16,
}

impl<A> TransportAddr<A> {
    pub const fn new(address: A, identifier: u16) -> Self {
        Self {
            address,
            identifier,
        }
    }
}

impl fmt::Display for TransportAddr<Ipv4Addr> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.identifier)
    }
}

impl fmt::Display for TransportAddr<Ipv6Addr> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]:{}", self.address, self.identifier)
    }
}

pub type Ipv4Transport = TransportAddr<Ipv4Addr>;
pub type Ipv6Transport = TransportAddr<Ipv6Addr>;

/// A (local, remote) pair of transport addresses on one side of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportPair<A> {
    pub local: TransportAddr<A>,
    pub remote: TransportAddr<A>,
}

impl<A> TransportPair<A> {
    pub const fn new(local: TransportAddr<A>, remote: TransportAddr<A>) -> Self {
        Self { local, remote }
    }
}

pub type Ipv4Pair = TransportPair<Ipv4Addr>;
pub type Ipv6Pair = TransportPair<Ipv6Addr>;

/// A direction-tagged 5-tuple, as produced by the packet-parsing collaborator
/// from a parsed packet. The core never inspects packet bytes, and it never
/// performs RFC 6052 address-embedding arithmetic either: wherever a tuple
/// needs the other family's representation of a remote peer, the
/// collaborator has already computed it and hands both forms over.
#[derive(Debug, Clone, Copy)]
pub enum Tuple {
    /// An outbound packet originating on the IPv6 side.
    V6 {
        protocol: Protocol,
        src: Ipv6Transport,
        dst: Ipv6Transport,
        /// The real IPv4 peer `dst` embeds, already decoded by the
        /// collaborator.
        dst_v4: Ipv4Transport,
    },
    /// An inbound packet originating on the IPv4 side.
    V4 {
        protocol: Protocol,
        src: Ipv4Transport,
        dst: Ipv4Transport,
        /// The IPv6 representative of `src`, already embedded by the
        /// collaborator.
        src_v6: Ipv6Transport,
    },
}

impl Tuple {
    pub const fn protocol(&self) -> Protocol {
        match self {
            Tuple::V6 { protocol, .. } => *protocol,
            Tuple::V4 { protocol, .. } => *protocol,
        }
    }
}

/// TCP control bits relevant to the per-session state machine. Every other
/// flag (URG, PSH, ECE, ...) is irrelevant to NAT64 session state and is
/// deliberately not represented here.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
}

impl TcpFlags {
    pub const fn syn() -> Self {
        Self {
            syn: true,
            ..Self::none()
        }
    }

    pub const fn syn_ack() -> Self {
        Self {
            syn: true,
            ack: true,
            ..Self::none()
        }
    }

    pub const fn fin() -> Self {
        Self {
            fin: true,
            ..Self::none()
        }
    }

    pub const fn rst() -> Self {
        Self {
            rst: true,
            ..Self::none()
        }
    }

    const fn none() -> Self {
        Self {
            syn: false,
            ack: false,
            fin: false,
            rst: false,
        }
    }
}

/// Which side a packet originated from, for the purposes of driving the TCP
/// state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    V6ToV4,
    V4ToV6,
}

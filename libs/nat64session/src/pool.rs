//! The IPv4 transport address pool (RFC 6146 §3.5.1.1).
//!
//! Each registered IPv4 address lends out 16-bit identifiers independently
//! per protocol tag. Ports 0-1023 are reserved and never enter a [`PortSet`].
//! Allocation honours the port-parity/range rule: a borrowed identifier must
//! share the requesting flow's parity (odd/even) so RFC 4787 REQ-4 style
//! middleboxes downstream keep seeing a consistent mapping.

use std::collections::{BTreeSet, VecDeque};
use std::net::Ipv4Addr;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::{PoolError, ReservationOutcome};
use crate::transport::{Ipv4Transport, Protocol};

/// Lowest identifier the pool will ever lend out. Matches RFC 6146's
/// deference to ephemeral-port conventions: well-known ports are never
/// borrowed for a translated flow.
const MIN_PORT: u16 = 1024;
const MAX_PORT: u16 = u16::MAX;

/// The free/in-use identifiers for one (address, protocol) pair.
///
/// Free identifiers are split by parity so "find a free port with the same
/// parity as this hint" is a single `BTreeSet::first()` instead of a scan.
#[derive(Debug, Clone)]
struct PortSet {
    free_even: BTreeSet<u16>,
    free_odd: BTreeSet<u16>,
    in_use: FxHashSet<u16>,
}

impl PortSet {
    fn new() -> Self {
        let mut free_even = BTreeSet::new();
        let mut free_odd = BTreeSet::new();
        for port in MIN_PORT..=MAX_PORT {
            if port % 2 == 0 {
                free_even.insert(port);
            } else {
                free_odd.insert(port);
            }
        }
        Self {
            free_even,
            free_odd,
            in_use: FxHashSet::default(),
        }
    }

    fn set_for_parity(&mut self, parity_of: u16) -> &mut BTreeSet<u16> {
        if parity_of % 2 == 0 {
            &mut self.free_even
        } else {
            &mut self.free_odd
        }
    }

    /// Take any free identifier, regardless of parity. Used for ICMP (which
    /// has no parity rule) and for a hint of 0 (no preference).
    fn take_any(&mut self) -> Option<u16> {
        let port = self
            .free_even
            .iter()
            .next()
            .copied()
            .or_else(|| self.free_odd.iter().next().copied())?;
        self.take_specific_free(port);
        Some(port)
    }

    /// Take a free identifier whose parity matches `hint`.
    fn take_matching(&mut self, hint: u16) -> Option<u16> {
        let port = *self.set_for_parity(hint).iter().next()?;
        self.take_specific_free(port);
        Some(port)
    }

    fn take_specific_free(&mut self, port: u16) {
        self.set_for_parity(port).remove(&port);
        self.in_use.insert(port);
    }

    /// Reserve an exact port. `true` if it was free and is now in use.
    fn take_exact(&mut self, port: u16) -> bool {
        if port < MIN_PORT {
            return false;
        }
        if self.in_use.contains(&port) {
            return false;
        }
        if self.set_for_parity(port).remove(&port) {
            self.in_use.insert(port);
            true
        } else {
            false
        }
    }

    /// Return a borrowed identifier. Idempotent: returning a port that is
    /// not currently lent out is a silent no-op.
    fn put(&mut self, port: u16) {
        if self.in_use.remove(&port) {
            self.set_for_parity(port).insert(port);
        }
    }

    fn in_use_count(&self) -> usize {
        self.in_use.len()
    }
}

/// Per-address bookkeeping: one [`PortSet`] per protocol tag, plus the
/// removal-pending flag from §3.
struct PoolAddrEntry {
    ports: [PortSet; 3],
    /// Set when an operator removes this address while identifiers are
    /// still lent out. Suppresses further allocation; the entry is dropped
    /// once `total_in_use()` returns to zero.
    removal_pending: bool,
}

impl PoolAddrEntry {
    fn new() -> Self {
        Self {
            ports: [PortSet::new(), PortSet::new(), PortSet::new()],
            removal_pending: false,
        }
    }

    fn total_in_use(&self) -> usize {
        self.ports.iter().map(PortSet::in_use_count).sum()
    }
}

/// The IPv4 transport address pool.
///
/// `get_any`/`get_similar` walk registered addresses in least-recently-used
/// order, so load is balanced across the pool rather than draining the
/// first-registered address before ever trying the second.
pub struct Pool {
    entries: FxHashMap<Ipv4Addr, PoolAddrEntry>,
    /// Front = least recently used (tried first); an address moves to the
    /// back whenever an identifier is successfully borrowed from it.
    lru: VecDeque<Ipv4Addr>,
}

impl Pool {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: FxHashMap::default(),
            lru: VecDeque::new(),
        }
    }

    pub fn register(&mut self, addr: Ipv4Addr) -> Result<(), PoolError> {
        if self.entries.contains_key(&addr) {
            return Err(PoolError::AlreadyRegistered(addr));
        }
        self.entries.insert(addr, PoolAddrEntry::new());
        self.lru.push_back(addr);
        log::debug!("Registered {addr} in the IPv4 transport address pool");
        Ok(())
    }

    pub fn remove(&mut self, addr: Ipv4Addr) -> Result<(), PoolError> {
        let entry = self.entries.get_mut(&addr).ok_or(PoolError::NotAMember(addr))?;
        if entry.total_in_use() == 0 {
            self.entries.remove(&addr);
            self.lru.retain(|a| *a != addr);
            log::debug!("Removed {addr} from the IPv4 transport address pool");
        } else {
            entry.removal_pending = true;
            log::debug!("Marked {addr} removal-pending ({} identifiers still lent out)", entry.total_in_use());
        }
        Ok(())
    }

    #[must_use]
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.entries.contains_key(&addr)
    }

    pub fn for_each(&self, mut callback: impl FnMut(Ipv4Addr)) {
        for addr in &self.lru {
            callback(*addr);
        }
    }

    /// Return any free identifier, from any registered (non-removal-pending)
    /// address, compatible with `hint_port`.
    pub fn get_any(&mut self, proto: Protocol, hint_port: u16) -> Option<Ipv4Transport> {
        let candidate = self
            .lru
            .iter()
            .copied()
            .find(|addr| {
                let entry = &self.entries[addr];
                !entry.removal_pending && Self::peek_compatible(&entry.ports[proto.index()], proto, hint_port)
            })?;
        let identifier = Self::take_compatible(&mut self.entries.get_mut(&candidate).unwrap().ports[proto.index()], proto, hint_port)?;
        self.touch_lru(candidate);
        Some(Ipv4Transport::new(candidate, identifier))
    }

    /// Like [`Pool::get_any`], but restricted to `v4_addr`. Used to honour
    /// endpoint-independent mapping: a host that already owns a binding on
    /// `v4_addr` keeps drawing new flows from that same address.
    pub fn get_similar(&mut self, proto: Protocol, v4_addr: Ipv4Addr, hint_port: u16) -> Option<Ipv4Transport> {
        let entry = self.entries.get_mut(&v4_addr)?;
        if entry.removal_pending {
            return None;
        }
        let identifier = Self::take_compatible(&mut entry.ports[proto.index()], proto, hint_port)?;
        self.touch_lru(v4_addr);
        Some(Ipv4Transport::new(v4_addr, identifier))
    }

    /// Reserve an exact transport address, for static binding installation.
    pub fn get_specific(&mut self, proto: Protocol, transport: Ipv4Transport) -> ReservationOutcome {
        let Some(entry) = self.entries.get_mut(&transport.address) else {
            return ReservationOutcome::NotOwned;
        };
        if entry.removal_pending {
            return ReservationOutcome::NotOwned;
        }
        if entry.ports[proto.index()].take_exact(transport.identifier) {
            self.touch_lru(transport.address);
            ReservationOutcome::Ok
        } else {
            ReservationOutcome::Taken
        }
    }

    /// Return a lent identifier. Idempotent if the address has since been
    /// removed from the pool entirely.
    pub fn put(&mut self, proto: Protocol, transport: Ipv4Transport) {
        let Some(entry) = self.entries.get_mut(&transport.address) else {
            log::trace!("Ignoring return of {transport} ({proto}): address no longer in pool");
            return;
        };
        entry.ports[proto.index()].put(transport.identifier);
        if entry.removal_pending && entry.total_in_use() == 0 {
            self.entries.remove(&transport.address);
            self.lru.retain(|a| *a != transport.address);
            log::debug!("{} fully drained and removal-pending; dropped from pool", transport.address);
        }
    }

    fn peek_compatible(ports: &PortSet, proto: Protocol, hint: u16) -> bool {
        match proto {
            Protocol::Icmp => !ports.free_even.is_empty() || !ports.free_odd.is_empty(),
            Protocol::Udp | Protocol::Tcp => {
                if hint == 0 {
                    !ports.free_even.is_empty() || !ports.free_odd.is_empty()
                } else {
                    !ports.set_for_parity_const(hint).is_empty()
                }
            }
        }
    }

    fn take_compatible(ports: &mut PortSet, proto: Protocol, hint: u16) -> Option<u16> {
        match proto {
            Protocol::Icmp => ports.take_any(),
            Protocol::Udp | Protocol::Tcp => {
                if hint == 0 {
                    ports.take_any()
                } else {
                    ports.take_matching(hint)
                }
            }
        }
    }

    fn touch_lru(&mut self, addr: Ipv4Addr) {
        self.lru.retain(|a| *a != addr);
        self.lru.push_back(addr);
    }
}

impl Default for Pool {
    fn default() -> Self {
        Self::new()
    }
}

impl PortSet {
    fn set_for_parity_const(&self, parity_of: u16) -> &BTreeSet<u16> {
        if parity_of % 2 == 0 {
            &self.free_even
        } else {
            &self.free_odd
        }
    }
}

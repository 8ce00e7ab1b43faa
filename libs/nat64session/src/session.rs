//! The per-protocol session table and the TCP state machine that rides on
//! top of it (RFC 6146 §3.5.2, §3.5.3, timers from §4).
//!
//! A session is keyed by its full v6 pair (so two flows from the same host
//! to different peers are distinct sessions) with a redirect index on the
//! v4 side, mirroring [`crate::bib::BibTable`]'s indexing strategy. Binding
//! lifetime is managed here too: creating a session increments the owning
//! [`crate::bib::BibEntry`]'s session count, and destroying the last session
//! on a dynamic binding reaps the binding and frees its pool reservation.

use std::time::{Duration, Instant};

use rustc_hash::{FxHashMap, FxHashSet};

use crate::bib::BibTable;
use crate::error::EngineError;
use crate::pool::Pool;
use crate::transport::{
    Ipv4Pair, Ipv4Transport, Ipv6Pair, Ipv6Transport, PacketDirection, Protocol, TcpFlags, Tuple,
};

/// TCP session state (RFC 6146 §3.5.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    V6Init,
    V4Init,
    Established,
    V4FinRcv,
    V6FinRcv,
    V4FinV6FinRcv,
    Trans,
}

/// Configurable session lifetimes. Defaults match the RFC 6146 §4 values.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub udp: Duration,
    pub icmp: Duration,
    pub tcp_established: Duration,
    pub tcp_transitory: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            udp: Duration::from_secs(5 * 60),
            icmp: Duration::from_secs(60),
            tcp_established: Duration::from_secs(2 * 60 * 60 + 4 * 60),
            tcp_transitory: Duration::from_secs(4 * 60),
        }
    }
}

impl Timeouts {
    /// The lowest value RFC 6146 allows an operator to configure the UDP
    /// mapping timer down to.
    pub const UDP_FLOOR: Duration = Duration::from_secs(2 * 60);

    fn for_tcp_state(&self, state: TcpState) -> Duration {
        match state {
            TcpState::Established => self.tcp_established,
            _ => self.tcp_transitory,
        }
    }
}

/// An active flow, pinned to one BIB entry.
#[derive(Debug, Clone)]
pub struct Session {
    pub v6_pair: Ipv6Pair,
    pub v4_pair: Ipv4Pair,
    pub protocol: Protocol,
    pub expires_at: Instant,
    pub tcp_state: Option<TcpState>,
}

impl Session {
    /// The BIB's own v6 key for the binding this session is anchored to.
    fn binding_key(&self) -> Ipv6Transport {
        self.v6_pair.local
    }
}

/// Per-protocol session table. [`crate::Engine`] holds one per
/// [`Protocol`], alongside that protocol's [`BibTable`].
pub struct SessionTable {
    by_v6: FxHashMap<Ipv6Pair, Session>,
    by_v4: FxHashMap<Ipv4Pair, Ipv6Pair>,
    /// `v6_pair.local -> { known remotes }`, used by [`SessionTable::allow`]
    /// to answer "does some session already exist on this binding" without
    /// a full scan.
    by_v6_local: FxHashMap<Ipv6Transport, FxHashSet<Ipv6Transport>>,
}

impl SessionTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_v6: FxHashMap::default(),
            by_v4: FxHashMap::default(),
            by_v6_local: FxHashMap::default(),
        }
    }

    #[must_use]
    pub fn lookup_v6(&self, pair: Ipv6Pair) -> Option<&Session> {
        self.by_v6.get(&pair)
    }

    #[must_use]
    pub fn lookup_v4(&self, pair: Ipv4Pair) -> Option<&Session> {
        let v6 = self.by_v4.get(&pair)?;
        self.by_v6.get(v6)
    }

    pub fn lookup(&self, tuple: &Tuple) -> Option<&Session> {
        match *tuple {
            Tuple::V6 { src, dst, .. } => self.lookup_v6(Ipv6Pair::new(src, dst)),
            Tuple::V4 { src, dst, .. } => self.lookup_v4(Ipv4Pair::new(dst, src)),
        }
    }

    /// Address-dependent filtering check for an inbound IPv4 TCP SYN: is
    /// there already a session anchored to the binding that owns
    /// `v6_local`/`v4_local`, regardless of the session's remote peer?
    #[must_use]
    pub fn allow(&self, v6_local: Ipv6Transport, v4_local: Ipv4Transport) -> bool {
        let Some(remotes) = self.by_v6_local.get(&v6_local) else {
            return false;
        };
        remotes.iter().any(|remote| {
            self.by_v6
                .get(&Ipv6Pair::new(v6_local, *remote))
                .is_some_and(|session| session.v4_pair.local == v4_local)
        })
    }

    /// The packet-path entry point: find the session this tuple belongs to,
    /// renewing its timer, or create one (and its binding, if necessary).
    ///
    /// Outbound (v6->v4) packets may always create a binding. Inbound
    /// (v4->v6) packets may only create a session if `allow` would already
    /// have passed (TCP, matching static binding), the caller is
    /// responsible for enforcing that via [`crate::Engine`]; this method
    /// itself never calls `pool.get_any`/`get_similar` for an inbound tuple.
    pub fn create_or_touch(
        &mut self,
        tuple: &Tuple,
        bib: &mut BibTable,
        pool: &mut Pool,
        timeouts: &Timeouts,
        now: Instant,
    ) -> Result<Session, EngineError> {
        if let Some(existing) = self.lookup(tuple) {
            let mut session = existing.clone();
            self.touch(&mut session, tuple, timeouts, now);
            return Ok(session);
        }

        match *tuple {
            Tuple::V6 { protocol, src, dst, dst_v4 } => {
                self.create_outbound(protocol, src, dst, dst_v4, bib, pool, timeouts, now)
            }
            Tuple::V4 { .. } => Err(EngineError::NoBinding),
        }
    }

    /// Variant of [`Self::create_or_touch`] for an admitted inbound packet
    /// (caller has already confirmed a static binding or passed `allow`).
    pub fn create_or_touch_inbound(
        &mut self,
        protocol: Protocol,
        v4_local: Ipv4Transport,
        v4_remote: Ipv4Transport,
        v6_remote: Ipv6Transport,
        bib: &mut BibTable,
        timeouts: &Timeouts,
        now: Instant,
    ) -> Result<Session, EngineError> {
        let v4_pair = Ipv4Pair::new(v4_local, v4_remote);
        if let Some(session) = self.lookup_v4(v4_pair) {
            let mut session = session.clone();
            let tuple = Tuple::V4 {
                protocol,
                src: v4_remote,
                dst: v4_local,
                src_v6: v6_remote,
            };
            self.touch(&mut session, &tuple, timeouts, now);
            return Ok(session);
        }

        let binding = bib.get_by_v4(v4_local).ok_or(EngineError::NoBinding)?;
        let v6_local = binding.v6;
        let session = Session {
            v6_pair: Ipv6Pair::new(v6_local, v6_remote),
            v4_pair,
            protocol,
            expires_at: now + Self::initial_timeout(protocol, timeouts),
            tcp_state: (protocol == Protocol::Tcp).then_some(TcpState::V4Init),
        };
        self.insert(session.clone(), bib);
        Ok(session)
    }

    fn create_outbound(
        &mut self,
        protocol: Protocol,
        src: Ipv6Transport,
        dst: Ipv6Transport,
        dst_v4: Ipv4Transport,
        bib: &mut BibTable,
        pool: &mut Pool,
        timeouts: &Timeouts,
        now: Instant,
    ) -> Result<Session, EngineError> {
        let binding_v6 = self.acquire_binding(protocol, src, bib, pool)?;
        let binding = bib.get_by_v6(binding_v6).expect("binding just acquired");
        let v4_local = binding.v4;

        let session = Session {
            v6_pair: Ipv6Pair::new(src, dst),
            v4_pair: Ipv4Pair::new(v4_local, dst_v4),
            protocol,
            expires_at: now + Self::initial_timeout(protocol, timeouts),
            tcp_state: (protocol == Protocol::Tcp).then_some(TcpState::V6Init),
        };
        self.insert(session.clone(), bib);
        Ok(session)
    }

    /// Step 1-4 of the BIB binding-acquisition algorithm: reuse an existing
    /// binding for `src`, or borrow a pool address (preferring one already
    /// used by this host), retrying once on an unlucky index collision.
    fn acquire_binding(
        &self,
        protocol: Protocol,
        src: Ipv6Transport,
        bib: &mut BibTable,
        pool: &mut Pool,
    ) -> Result<Ipv6Transport, EngineError> {
        if bib.get_by_v6(src).is_some() {
            return Ok(src);
        }

        for attempt in 0..2 {
            let v4 = match bib.get_by_v6_addr_only(src.address) {
                Some(found) => pool.get_similar(protocol, found.v4.address, src.identifier),
                None => pool.get_any(protocol, src.identifier),
            }
            .ok_or(EngineError::PoolExhausted)?;

            match bib.add(src, v4, false) {
                Ok(()) => return Ok(src),
                Err(_) if attempt == 0 => {
                    pool.put(protocol, v4);
                }
                Err(_) => {
                    pool.put(protocol, v4);
                    return Err(crate::engine::debug_assert_invariant("binding insertion collided twice"));
                }
            }
        }
        unreachable!("loop always returns or errors by its second iteration")
    }

    fn insert(&mut self, session: Session, bib: &mut BibTable) {
        self.by_v4.insert(session.v4_pair, session.v6_pair);
        self.by_v6_local
            .entry(session.v6_pair.local)
            .or_default()
            .insert(session.v6_pair.remote);
        bib.attach_session(session.binding_key());
        self.by_v6.insert(session.v6_pair, session);
    }

    /// Renew a matched session's timer. Flag-driven TCP transitions go
    /// through [`Self::tcp_step`] instead; this just refreshes the deadline
    /// for the session's current state.
    fn touch(&mut self, session: &mut Session, _tuple: &Tuple, timeouts: &Timeouts, now: Instant) {
        session.expires_at = now + Self::timeout_for(session.protocol, session.tcp_state, timeouts);
        self.by_v6.insert(session.v6_pair, session.clone());
    }

    /// Drive the TCP state machine for an existing session. `None` flags
    /// (UDP/ICMP sessions) are a programming error in the caller.
    pub fn tcp_step(
        &mut self,
        v6_pair: Ipv6Pair,
        direction: PacketDirection,
        flags: TcpFlags,
        timeouts: &Timeouts,
        now: Instant,
    ) -> Result<Session, EngineError> {
        let session = self.by_v6.get_mut(&v6_pair).ok_or(EngineError::NoSession)?;
        let Some(state) = session.tcp_state else {
            return Err(EngineError::Internal("tcp_step on a non-TCP session"));
        };
        let next = Self::tcp_transition(state, direction, flags);
        session.tcp_state = Some(next);
        session.expires_at = now + timeouts.for_tcp_state(next);
        Ok(session.clone())
    }

    fn tcp_transition(state: TcpState, direction: PacketDirection, flags: TcpFlags) -> TcpState {
        use PacketDirection::{V4ToV6, V6ToV4};
        use TcpState::{Established, Trans, V4FinRcv, V4FinV6FinRcv, V4Init, V6FinRcv, V6Init};

        if flags.rst {
            return Trans;
        }
        match (state, direction) {
            (V6Init, V4ToV6) if flags.syn => Established,
            (V4Init, V6ToV4) if flags.syn => Established,
            (Established, V4ToV6) if flags.fin => V4FinRcv,
            (Established, V6ToV4) if flags.fin => V6FinRcv,
            (V4FinRcv, V6ToV4) if flags.fin => V4FinV6FinRcv,
            (V6FinRcv, V4ToV6) if flags.fin => V4FinV6FinRcv,
            _ => state,
        }
    }

    /// Reap every session whose deadline has passed, detaching each from
    /// its binding and returning drained IPv4 transport addresses to the
    /// pool. Returns the number of sessions reaped.
    pub fn expire_due(&mut self, now: Instant, bib: &mut BibTable, pool: &mut Pool) -> usize {
        self.expire_due_batch(now, bib, pool, usize::MAX)
    }

    /// Like [`Self::expire_due`], but reaps at most `max` sessions. The
    /// caller (the expirer thread) releases and re-acquires the engine lock
    /// between batches so a large backlog never blocks the packet path.
    pub fn expire_due_batch(&mut self, now: Instant, bib: &mut BibTable, pool: &mut Pool, max: usize) -> usize {
        let expired: Vec<Ipv6Pair> = self
            .by_v6
            .iter()
            .filter(|(_, s)| s.expires_at <= now)
            .map(|(pair, _)| *pair)
            .take(max)
            .collect();

        for pair in &expired {
            self.destroy(*pair, bib, pool);
        }
        expired.len()
    }

    fn destroy(&mut self, v6_pair: Ipv6Pair, bib: &mut BibTable, pool: &mut Pool) {
        let Some(session) = self.by_v6.remove(&v6_pair) else {
            return;
        };
        self.by_v4.remove(&session.v4_pair);
        if let Some(remotes) = self.by_v6_local.get_mut(&v6_pair.local) {
            remotes.remove(&v6_pair.remote);
            if remotes.is_empty() {
                self.by_v6_local.remove(&v6_pair.local);
            }
        }
        if let Some(reaped_binding) = bib.detach_session(session.binding_key()) {
            pool.put(session.protocol, reaped_binding.v4);
            log::debug!(
                "Binding {} <-> {} reclaimed; {} returned to the pool",
                reaped_binding.v6,
                reaped_binding.v4,
                reaped_binding.v4
            );
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_v6.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_v6.is_empty()
    }

    pub fn for_each(&self, mut callback: impl FnMut(&Session)) {
        for session in self.by_v6.values() {
            callback(session);
        }
    }

    fn initial_timeout(protocol: Protocol, timeouts: &Timeouts) -> Duration {
        match protocol {
            Protocol::Udp => timeouts.udp,
            Protocol::Icmp => timeouts.icmp,
            Protocol::Tcp => timeouts.tcp_transitory,
        }
    }

    fn timeout_for(protocol: Protocol, tcp_state: Option<TcpState>, timeouts: &Timeouts) -> Duration {
        match protocol {
            Protocol::Udp => timeouts.udp,
            Protocol::Icmp => timeouts.icmp,
            Protocol::Tcp => timeouts.for_tcp_state(tcp_state.unwrap_or(TcpState::Trans)),
        }
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn v6(addr: &str, port: u16) -> Ipv6Transport {
        Ipv6Transport::new(addr.parse::<Ipv6Addr>().unwrap(), port)
    }

    fn v4(addr: &str, port: u16) -> Ipv4Transport {
        Ipv4Transport::new(addr.parse::<Ipv4Addr>().unwrap(), port)
    }

    #[test]
    fn create_outbound_allocates_binding_and_session() {
        let mut bib = BibTable::new();
        let mut pool = Pool::new();
        pool.register("203.0.113.5".parse().unwrap()).unwrap();
        let mut sessions = SessionTable::new();
        let timeouts = Timeouts::default();
        let now = Instant::now();

        let tuple = Tuple::V6 {
            protocol: Protocol::Udp,
            src: v6("2001:db8::1", 40001),
            dst: v6("64:ff9b::c000:0201", 53),
            dst_v4: v4("192.0.2.1", 53),
        };
        let session = sessions
            .create_or_touch(&tuple, &mut bib, &mut pool, &timeouts, now)
            .unwrap();
        assert_eq!(session.v4_pair.local.address, "203.0.113.5".parse::<Ipv4Addr>().unwrap());
        assert_eq!(bib.len(), 1);
        assert_eq!(sessions.len(), 1);
    }

    #[test]
    fn second_flow_from_same_host_reuses_binding() {
        let mut bib = BibTable::new();
        let mut pool = Pool::new();
        pool.register("203.0.113.5".parse().unwrap()).unwrap();
        pool.register("203.0.113.6".parse().unwrap()).unwrap();
        let mut sessions = SessionTable::new();
        let timeouts = Timeouts::default();
        let now = Instant::now();
        let host = v6("2001:db8::1", 40001);

        let first = sessions
            .create_or_touch(
                &Tuple::V6 {
                    protocol: Protocol::Udp,
                    src: host,
                    dst: v6("64:ff9b::c000:0201", 53),
                    dst_v4: v4("192.0.2.1", 53),
                },
                &mut bib,
                &mut pool,
                &timeouts,
                now,
            )
            .unwrap();

        let second = sessions
            .create_or_touch(
                &Tuple::V6 {
                    protocol: Protocol::Udp,
                    src: host,
                    dst: v6("64:ff9b::c000:0202", 53),
                    dst_v4: v4("192.0.2.2", 53),
                },
                &mut bib,
                &mut pool,
                &timeouts,
                now,
            )
            .unwrap();

        assert_eq!(first.v4_pair.local, second.v4_pair.local);
        assert_eq!(bib.len(), 1);
        assert_eq!(sessions.len(), 2);
    }

    #[test]
    fn pool_exhaustion_surfaces_as_error() {
        let mut bib = BibTable::new();
        let mut pool = Pool::new();
        let mut sessions = SessionTable::new();
        let result = sessions.create_or_touch(
            &Tuple::V6 {
                protocol: Protocol::Udp,
                src: v6("2001:db8::1", 40001),
                dst: v6("64:ff9b::c000:0201", 53),
                dst_v4: v4("192.0.2.1", 53),
            },
            &mut bib,
            &mut pool,
            &Timeouts::default(),
            Instant::now(),
        );
        assert_eq!(result.unwrap_err(), EngineError::PoolExhausted);
    }

    #[test]
    fn tcp_handshake_reaches_established() {
        let mut bib = BibTable::new();
        let mut pool = Pool::new();
        pool.register("203.0.113.5".parse().unwrap()).unwrap();
        let mut sessions = SessionTable::new();
        let timeouts = Timeouts::default();
        let now = Instant::now();
        let src = v6("2001:db8::1", 40001);
        let dst = v6("64:ff9b::c000:0201", 80);
        let dst_v4 = v4("192.0.2.1", 80);

        let session = sessions
            .create_or_touch(
                &Tuple::V6 {
                    protocol: Protocol::Tcp,
                    src,
                    dst,
                    dst_v4,
                },
                &mut bib,
                &mut pool,
                &timeouts,
                now,
            )
            .unwrap();
        assert_eq!(session.tcp_state, Some(TcpState::V6Init));

        let after_synack = sessions
            .tcp_step(session.v6_pair, PacketDirection::V4ToV6, TcpFlags::syn_ack(), &timeouts, now)
            .unwrap();
        assert_eq!(after_synack.tcp_state, Some(TcpState::Established));
        assert_eq!(after_synack.expires_at, now + timeouts.tcp_established);
    }

    #[test]
    fn fin_exchange_then_expiry_frees_everything() {
        let mut bib = BibTable::new();
        let mut pool = Pool::new();
        pool.register("203.0.113.5".parse().unwrap()).unwrap();
        let mut sessions = SessionTable::new();
        let timeouts = Timeouts::default();
        let now = Instant::now();
        let src = v6("2001:db8::1", 40001);
        let dst = v6("64:ff9b::c000:0201", 80);
        let dst_v4 = v4("192.0.2.1", 80);

        let session = sessions
            .create_or_touch(
                &Tuple::V6 {
                    protocol: Protocol::Tcp,
                    src,
                    dst,
                    dst_v4,
                },
                &mut bib,
                &mut pool,
                &timeouts,
                now,
            )
            .unwrap();
        sessions
            .tcp_step(session.v6_pair, PacketDirection::V4ToV6, TcpFlags::syn_ack(), &timeouts, now)
            .unwrap();
        sessions
            .tcp_step(session.v6_pair, PacketDirection::V4ToV6, TcpFlags::fin(), &timeouts, now)
            .unwrap();
        let closed = sessions
            .tcp_step(session.v6_pair, PacketDirection::V6ToV4, TcpFlags::fin(), &timeouts, now)
            .unwrap();
        assert_eq!(closed.tcp_state, Some(TcpState::V4FinV6FinRcv));

        let later = now + timeouts.tcp_transitory + Duration::from_secs(1);
        let reaped = sessions.expire_due(later, &mut bib, &mut pool);
        assert_eq!(reaped, 1);
        assert!(sessions.is_empty());
        assert!(bib.is_empty());
        // The borrowed port is back in the pool and free to reserve again.
        assert_eq!(
            pool.get_specific(Protocol::Tcp, session.v4_pair.local),
            crate::error::ReservationOutcome::Ok
        );
    }

    #[test]
    fn rst_moves_any_state_to_trans() {
        let mut bib = BibTable::new();
        let mut pool = Pool::new();
        pool.register("203.0.113.5".parse().unwrap()).unwrap();
        let mut sessions = SessionTable::new();
        let timeouts = Timeouts::default();
        let now = Instant::now();
        let src = v6("2001:db8::1", 40001);
        let dst = v6("64:ff9b::c000:0201", 80);
        let dst_v4 = v4("192.0.2.1", 80);

        let session = sessions
            .create_or_touch(
                &Tuple::V6 {
                    protocol: Protocol::Tcp,
                    src,
                    dst,
                    dst_v4,
                },
                &mut bib,
                &mut pool,
                &timeouts,
                now,
            )
            .unwrap();
        let after_rst = sessions
            .tcp_step(session.v6_pair, PacketDirection::V4ToV6, TcpFlags::rst(), &timeouts, now)
            .unwrap();
        assert_eq!(after_rst.tcp_state, Some(TcpState::Trans));
    }

    #[test]
    fn allow_checks_binding_membership_not_exact_remote() {
        let mut bib = BibTable::new();
        let mut pool = Pool::new();
        pool.register("203.0.113.5".parse().unwrap()).unwrap();
        let mut sessions = SessionTable::new();
        let timeouts = Timeouts::default();
        let now = Instant::now();
        let src = v6("2001:db8::1", 40001);
        let dst = v6("64:ff9b::c000:0201", 80);
        let dst_v4 = v4("192.0.2.1", 80);

        let session = sessions
            .create_or_touch(
                &Tuple::V6 {
                    protocol: Protocol::Tcp,
                    src,
                    dst,
                    dst_v4,
                },
                &mut bib,
                &mut pool,
                &timeouts,
                now,
            )
            .unwrap();

        assert!(sessions.allow(session.v6_pair.local, session.v4_pair.local));
        assert!(!sessions.allow(v6("2001:db8::9", 1), session.v4_pair.local));
    }
}

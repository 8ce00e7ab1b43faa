//! [`Engine`]: the crate's top-level facade. Owns one [`Pool`] (shared
//! across protocols, since IPv4 addresses aren't protocol-specific) and one
//! [`BibTable`]/[`SessionTable`] pair per [`Protocol`], all behind a single
//! [`std::sync::RwLock`] as required by the locking discipline: the
//! invariant "binding + its sessions + its pool reservation are consistent"
//! crosses all three subsystems, so splitting the lock per subsystem would
//! be unsound without re-expressing every operation as a cross-table
//! transaction.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::bib::{BibEntry, BibTable};
use crate::error::{ControlError, EngineError, PoolError, ReservationOutcome};
use crate::pool::Pool;
use crate::session::{Session, SessionTable, Timeouts};
use crate::transport::{Ipv4Transport, Ipv6Transport, PacketDirection, Protocol, TcpFlags, Tuple};

/// Converts an internal invariant violation into a panic in debug builds
/// (so tests catch it immediately) and a logged, recoverable error in
/// release builds, per the error taxonomy's treatment of `EngineError::Internal`.
pub(crate) fn debug_assert_invariant(message: &'static str) -> EngineError {
    debug_assert!(false, "internal invariant violated: {message}");
    log::error!("internal invariant violated: {message}");
    EngineError::Internal(message)
}

struct EngineState {
    pool: Pool,
    bib: [BibTable; 3],
    sessions: [SessionTable; 3],
}

impl EngineState {
    fn new() -> Self {
        Self {
            pool: Pool::new(),
            bib: [BibTable::new(), BibTable::new(), BibTable::new()],
            sessions: [SessionTable::new(), SessionTable::new(), SessionTable::new()],
        }
    }
}

/// Runtime-settable knobs, mirroring the configuration options of the
/// external interface.
#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    pub timeouts: Timeouts,
    pub expirer_interval: Duration,
    /// Enforce address-dependent filtering on IPv4-initiated TCP SYNs: an
    /// inbound SYN is only admitted if a session already exists for that
    /// binding from some remote. Off by default (RFC 6146 permits either).
    pub address_dependent_filtering: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            timeouts: Timeouts::default(),
            expirer_interval: Duration::from_secs(1),
            address_dependent_filtering: false,
        }
    }
}

/// Sessions are reaped in batches of at most this many so the expirer never
/// holds the write lock long enough to starve the packet path.
const EXPIRER_BATCH_SIZE: usize = 1024;

/// The stateful NAT64 session core.
pub struct Engine {
    state: RwLock<EngineState>,
    options: EngineOptions,
}

impl Engine {
    #[must_use]
    pub fn new(options: EngineOptions) -> Self {
        Self {
            state: RwLock::new(EngineState::new()),
            options,
        }
    }

    // ---- packet path -----------------------------------------------------

    /// Translate an outbound (IPv6 source) packet, creating a binding and/or
    /// session if none exists yet. Returns the (local, remote) IPv4
    /// transport addresses to rewrite the packet with.
    pub fn handle_outbound_v6(
        &self,
        tuple: Tuple,
        tcp_flags: Option<TcpFlags>,
    ) -> Result<(Ipv4Transport, Ipv4Transport), EngineError> {
        let Tuple::V6 { protocol, .. } = tuple else {
            return Err(EngineError::BadArg("handle_outbound_v6 requires a V6 tuple"));
        };
        let idx = protocol.index();
        let now = Instant::now();
        let mut state = self.state.write().expect("engine lock poisoned");
        let pre_existing = state.sessions[idx].lookup(&tuple).is_some();

        let EngineState { pool, bib, sessions } = &mut *state;
        let mut session = sessions[idx].create_or_touch(&tuple, &mut bib[idx], pool, &self.options.timeouts, now)?;

        if pre_existing {
            if let Some(flags) = tcp_flags {
                session = sessions[idx].tcp_step(session.v6_pair, PacketDirection::V6ToV4, flags, &self.options.timeouts, now)?;
            }
        }
        Ok((session.v4_pair.local, session.v4_pair.remote))
    }

    /// Translate an inbound (IPv4 source) packet. A new session is only
    /// ever created for an admitted TCP SYN against an existing binding;
    /// UDP/ICMP with no session is always rejected with `NO_BINDING`.
    pub fn handle_inbound_v4(
        &self,
        tuple: Tuple,
        tcp_flags: Option<TcpFlags>,
    ) -> Result<(Ipv6Transport, Ipv6Transport), EngineError> {
        let Tuple::V4 { protocol, src, dst, src_v6 } = tuple else {
            return Err(EngineError::BadArg("handle_inbound_v4 requires a V4 tuple"));
        };
        let idx = protocol.index();
        let now = Instant::now();
        let mut state = self.state.write().expect("engine lock poisoned");
        let pre_existing = state.sessions[idx].lookup(&tuple).is_some();

        if !pre_existing {
            if protocol != Protocol::Tcp {
                return Err(EngineError::NoBinding);
            }
            let is_syn = tcp_flags.is_some_and(|f| f.syn && !f.ack);
            if !is_syn {
                return Err(EngineError::NoSession);
            }
            let EngineState { bib, sessions, .. } = &mut *state;
            let binding_v6 = bib[idx].get_by_v4(dst).ok_or(EngineError::NoBinding)?.v6;
            if self.options.address_dependent_filtering && !sessions[idx].allow(binding_v6, dst) {
                return Err(EngineError::NoBinding);
            }
        }

        let EngineState { bib, sessions, .. } = &mut *state;
        let mut session = sessions[idx].create_or_touch_inbound(protocol, dst, src, src_v6, &mut bib[idx], &self.options.timeouts, now)?;

        if pre_existing {
            if let Some(flags) = tcp_flags {
                session = sessions[idx].tcp_step(session.v6_pair, PacketDirection::V4ToV6, flags, &self.options.timeouts, now)?;
            }
        }
        Ok((session.v6_pair.local, session.v6_pair.remote))
    }

    // ---- control API: pool -------------------------------------------------

    pub fn pool_add(&self, addr: Ipv4Addr) -> Result<(), PoolError> {
        self.state.write().expect("engine lock poisoned").pool.register(addr)
    }

    pub fn pool_del(&self, addr: Ipv4Addr) -> Result<(), PoolError> {
        self.state.write().expect("engine lock poisoned").pool.remove(addr)
    }

    #[must_use]
    pub fn pool_list(&self) -> Vec<Ipv4Addr> {
        let state = self.state.read().expect("engine lock poisoned");
        let mut addrs = Vec::new();
        state.pool.for_each(|addr| addrs.push(addr));
        addrs
    }

    // ---- control API: BIB ---------------------------------------------------

    /// Install a static binding, reserving its IPv4 transport address in the
    /// pool first so the binding and the reservation are never out of sync.
    pub fn bib_add_static(&self, proto: Protocol, v6: Ipv6Transport, v4: Ipv4Transport) -> Result<(), ControlError> {
        let idx = proto.index();
        let mut state = self.state.write().expect("engine lock poisoned");
        match state.pool.get_specific(proto, v4) {
            ReservationOutcome::Ok => {}
            ReservationOutcome::Taken | ReservationOutcome::NotOwned => return Err(ControlError::PoolReservationFailed),
        }
        if let Err(err) = state.bib[idx].add(v6, v4, true) {
            state.pool.put(proto, v4);
            return Err(err.into());
        }
        Ok(())
    }

    /// Remove a static binding. A no-op if it still has live sessions;
    /// callers that want a hard removal should wait for those sessions to
    /// drain (via the expirer) first.
    pub fn bib_del_static(&self, proto: Protocol, v6: Ipv6Transport) -> Result<(), EngineError> {
        let idx = proto.index();
        let mut state = self.state.write().expect("engine lock poisoned");
        let Some(entry) = state.bib[idx].get_by_v6(v6) else {
            return Err(EngineError::NoBinding);
        };
        if entry.session_count() > 0 {
            return Ok(());
        }
        let v4 = entry.v4;
        state.bib[idx].remove(v6);
        state.pool.put(proto, v4);
        Ok(())
    }

    #[must_use]
    pub fn bib_list(&self, proto: Protocol) -> Vec<BibEntry> {
        let state = self.state.read().expect("engine lock poisoned");
        let mut entries = Vec::new();
        state.bib[proto.index()].for_each(|entry| entries.push(entry.clone()));
        entries
    }

    // ---- control API: sessions ----------------------------------------------

    #[must_use]
    pub fn session_list(&self, proto: Protocol) -> Vec<Session> {
        let state = self.state.read().expect("engine lock poisoned");
        let mut out = Vec::new();
        state.sessions[proto.index()].for_each(|session| out.push(session.clone()));
        out
    }

    // ---- expiration ----------------------------------------------------------

    /// Reap every session whose deadline has passed, across all protocols,
    /// in batches of at most [`EXPIRER_BATCH_SIZE`] per lock acquisition so
    /// a large backlog never holds the write lock for long. Returns the
    /// total number of sessions reaped.
    pub fn expire_due(&self, now: Instant) -> usize {
        let mut total = 0;
        for proto in Protocol::ALL {
            let idx = proto.index();
            loop {
                let mut state = self.state.write().expect("engine lock poisoned");
                let EngineState { pool, bib, sessions } = &mut *state;
                let reaped = sessions[idx].expire_due_batch(now, &mut bib[idx], pool, EXPIRER_BATCH_SIZE);
                drop(state);
                total += reaped;
                if reaped < EXPIRER_BATCH_SIZE {
                    break;
                }
            }
        }
        total
    }

    /// Spawn the background expirer on its own OS thread, running at
    /// `expirer_interval` until [`ExpirerHandle::stop`] is called.
    #[must_use]
    pub fn spawn_expirer(self: &Arc<Self>) -> ExpirerHandle {
        let engine = Arc::clone(self);
        let interval = self.options.expirer_interval;
        let stop = Arc::new(AtomicBool::new(false));
        let stop_for_thread = Arc::clone(&stop);

        let join = std::thread::spawn(move || {
            while !stop_for_thread.load(Ordering::Relaxed) {
                std::thread::sleep(interval);
                let reaped = engine.expire_due(Instant::now());
                if reaped > 0 {
                    log::debug!("Expirer reaped {reaped} session(s)");
                }
            }
        });

        ExpirerHandle {
            stop,
            join: Some(join),
        }
    }
}

/// A handle to the background expirer thread started by
/// [`Engine::spawn_expirer`]. Dropping this without calling [`Self::stop`]
/// leaves the thread running; it is only ever torn down explicitly.
pub struct ExpirerHandle {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ExpirerHandle {
    /// Signal the expirer to stop and wait for its current sleep to finish.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    fn v6(addr: &str, port: u16) -> Ipv6Transport {
        Ipv6Transport::new(addr.parse::<Ipv6Addr>().unwrap(), port)
    }

    fn v4(addr: &str, port: u16) -> Ipv4Transport {
        Ipv4Transport::new(addr.parse::<Ipv4Addr>().unwrap(), port)
    }

    #[test]
    fn s1_udp_outbound_fresh() {
        let engine = Engine::new(EngineOptions::default());
        engine.pool_add("203.0.113.5".parse().unwrap()).unwrap();

        let tuple = Tuple::V6 {
            protocol: Protocol::Udp,
            src: v6("2001:db8::1", 40001),
            dst: v6("64:ff9b::c000:0201", 53),
            dst_v4: v4("192.0.2.1", 53),
        };
        let (local, remote) = engine.handle_outbound_v6(tuple, None).unwrap();
        assert_eq!(local.address, "203.0.113.5".parse::<Ipv4Addr>().unwrap());
        assert_eq!(local.identifier % 2, 1);
        assert!(local.identifier >= 1024);
        assert_eq!(remote, v4("192.0.2.1", 53));
    }

    #[test]
    fn s2_second_flow_same_host_same_v4_address() {
        let engine = Engine::new(EngineOptions::default());
        engine.pool_add("203.0.113.5".parse().unwrap()).unwrap();
        let host = v6("2001:db8::1", 40001);

        let (first_local, _) = engine
            .handle_outbound_v6(
                Tuple::V6 {
                    protocol: Protocol::Udp,
                    src: host,
                    dst: v6("64:ff9b::c000:0201", 53),
                    dst_v4: v4("192.0.2.1", 53),
                },
                None,
            )
            .unwrap();

        let (second_local, _) = engine
            .handle_outbound_v6(
                Tuple::V6 {
                    protocol: Protocol::Udp,
                    src: host,
                    dst: v6("64:ff9b::c000:0202", 53),
                    dst_v4: v4("192.0.2.2", 53),
                },
                None,
            )
            .unwrap();

        assert_eq!(first_local.address, second_local.address);
        assert_ne!(first_local.identifier, second_local.identifier);
    }

    #[test]
    fn s3_udp_inbound_matched_renews_session() {
        let engine = Engine::new(EngineOptions::default());
        engine.pool_add("203.0.113.5".parse().unwrap()).unwrap();
        let src = v6("2001:db8::1", 40001);

        let (v4_local, v4_remote) = engine
            .handle_outbound_v6(
                Tuple::V6 {
                    protocol: Protocol::Udp,
                    src,
                    dst: v6("64:ff9b::c000:0201", 53),
                    dst_v4: v4("192.0.2.1", 53),
                },
                None,
            )
            .unwrap();

        let (v6_local, v6_remote) = engine
            .handle_inbound_v4(
                Tuple::V4 {
                    protocol: Protocol::Udp,
                    src: v4_remote,
                    dst: v4_local,
                    src_v6: v6("64:ff9b::c000:0201", 53),
                },
                None,
            )
            .unwrap();

        assert_eq!(v6_local, src);
        assert_eq!(v6_remote, v6("64:ff9b::c000:0201", 53));
    }

    #[test]
    fn s4_udp_inbound_unmatched_is_no_binding() {
        let engine = Engine::new(EngineOptions::default());
        engine.pool_add("203.0.113.5".parse().unwrap()).unwrap();

        let result = engine.handle_inbound_v4(
            Tuple::V4 {
                protocol: Protocol::Udp,
                src: v4("198.51.100.9", 1000),
                dst: v4("203.0.113.5", 9999),
                src_v6: v6("64:ff9b::c633:6409", 1000),
            },
            None,
        );
        assert_eq!(result.unwrap_err(), EngineError::NoBinding);
    }

    #[test]
    fn s6_pool_exhaustion_creates_no_binding() {
        let engine = Engine::new(EngineOptions::default());
        engine.pool_add("203.0.113.5".parse().unwrap()).unwrap();

        // Drain every even UDP port so a fresh even-port flow has nothing left.
        for port in (1024u16..65535).step_by(2) {
            let _ = engine.handle_outbound_v6(
                Tuple::V6 {
                    protocol: Protocol::Udp,
                    src: v6("2001:db8::1", port),
                    dst: v6("64:ff9b::c000:0201", 53),
                    dst_v4: v4("192.0.2.1", 53),
                },
                None,
            );
        }

        let result = engine.handle_outbound_v6(
            Tuple::V6 {
                protocol: Protocol::Udp,
                src: v6("2001:db8::9", 40000),
                dst: v6("64:ff9b::c000:0201", 53),
                dst_v4: v4("192.0.2.1", 53),
            },
            None,
        );
        assert_eq!(result.unwrap_err(), EngineError::PoolExhausted);
        assert!(engine.bib_list(Protocol::Udp).iter().all(|b| b.v6.address != "2001:db8::9".parse::<Ipv6Addr>().unwrap()));
    }

    #[test]
    fn static_binding_admits_inbound_tcp_syn_with_no_prior_session() {
        let engine = Engine::new(EngineOptions::default());
        engine.pool_add("203.0.113.5".parse().unwrap()).unwrap();
        let v6_addr = v6("2001:db8::1", 22);
        let v4_addr = v4("203.0.113.5", 2222);
        engine.bib_add_static(Protocol::Tcp, v6_addr, v4_addr).unwrap();

        let (local, remote) = engine
            .handle_inbound_v4(
                Tuple::V4 {
                    protocol: Protocol::Tcp,
                    src: v4("198.51.100.1", 54321),
                    dst: v4_addr,
                    src_v6: v6("64:ff9b::c633:6401", 54321),
                },
                Some(TcpFlags::syn()),
            )
            .unwrap();
        assert_eq!(local, v6_addr);
        assert_eq!(remote, v6("64:ff9b::c633:6401", 54321));
    }

    #[test]
    fn inbound_tcp_syn_without_binding_is_dropped() {
        let engine = Engine::new(EngineOptions::default());
        let result = engine.handle_inbound_v4(
            Tuple::V4 {
                protocol: Protocol::Tcp,
                src: v4("198.51.100.1", 54321),
                dst: v4("203.0.113.5", 2222),
                src_v6: v6("64:ff9b::c633:6401", 54321),
            },
            Some(TcpFlags::syn()),
        );
        assert_eq!(result.unwrap_err(), EngineError::NoBinding);
    }

    #[test]
    fn bib_del_static_is_noop_while_sessions_remain() {
        let engine = Engine::new(EngineOptions::default());
        engine.pool_add("203.0.113.5".parse().unwrap()).unwrap();
        let v6_addr = v6("2001:db8::1", 22);
        let v4_addr = v4("203.0.113.5", 2222);
        engine.bib_add_static(Protocol::Tcp, v6_addr, v4_addr).unwrap();
        engine
            .handle_inbound_v4(
                Tuple::V4 {
                    protocol: Protocol::Tcp,
                    src: v4("198.51.100.1", 54321),
                    dst: v4_addr,
                    src_v6: v6("64:ff9b::c633:6401", 54321),
                },
                Some(TcpFlags::syn()),
            )
            .unwrap();

        engine.bib_del_static(Protocol::Tcp, v6_addr).unwrap();
        assert!(engine.bib_list(Protocol::Tcp).iter().any(|b| b.v6 == v6_addr));
    }

    #[test]
    fn expire_due_reaps_across_protocols() {
        let engine = Engine::new(EngineOptions::default());
        engine.pool_add("203.0.113.5".parse().unwrap()).unwrap();
        engine
            .handle_outbound_v6(
                Tuple::V6 {
                    protocol: Protocol::Udp,
                    src: v6("2001:db8::1", 40001),
                    dst: v6("64:ff9b::c000:0201", 53),
                    dst_v4: v4("192.0.2.1", 53),
                },
                None,
            )
            .unwrap();

        let far_future = Instant::now() + Duration::from_secs(3600 * 24);
        let reaped = engine.expire_due(far_future);
        assert_eq!(reaped, 1);
        assert!(engine.session_list(Protocol::Udp).is_empty());
        assert!(engine.bib_list(Protocol::Udp).is_empty());
        assert_eq!(engine.pool_list(), vec!["203.0.113.5".parse::<Ipv4Addr>().unwrap()]);
    }
}

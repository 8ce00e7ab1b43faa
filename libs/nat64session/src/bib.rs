//! The Binding Information Base: one per protocol tag, mapping an IPv6
//! transport address to a borrowed IPv4 transport address.
//!
//! Indexing follows the "single owner + non-owning lookup" route described
//! for this crate: the v6-keyed map owns each [`BibEntry`]; the v4-keyed map
//! stores the owning entry's v6 key as a redirect. A third map, keyed by the
//! bare [`Ipv6Addr`], tracks which v6 identifiers exist for a given host so
//! [`BibTable::get_by_v6_addr_only`] never needs a full-table scan.

use std::net::Ipv6Addr;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::BibError;
use crate::transport::{Ipv4Transport, Ipv6Transport};

/// A single IPv6↔IPv4 binding.
#[derive(Debug, Clone)]
pub struct BibEntry {
    pub v6: Ipv6Transport,
    pub v4: Ipv4Transport,
    pub is_static: bool,
    /// Number of sessions currently anchored to this binding. The table
    /// reaps a dynamic entry itself once this drops to zero.
    pub(crate) session_count: usize,
}

impl BibEntry {
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.session_count
    }
}

/// The per-protocol binding table. [`crate::Engine`] holds one per
/// [`crate::transport::Protocol`].
pub struct BibTable {
    by_v6: FxHashMap<Ipv6Transport, BibEntry>,
    by_v4: FxHashMap<Ipv4Transport, Ipv6Transport>,
    /// `v6.address -> { identifiers }`, the non-owning index that makes
    /// `get_by_v6_addr_only` O(1)-ish instead of a linear scan.
    by_v6_addr: FxHashMap<Ipv6Addr, FxHashSet<u16>>,
}

impl BibTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_v6: FxHashMap::default(),
            by_v4: FxHashMap::default(),
            by_v6_addr: FxHashMap::default(),
        }
    }

    pub fn add(&mut self, v6: Ipv6Transport, v4: Ipv4Transport, is_static: bool) -> Result<(), BibError> {
        if self.by_v6.contains_key(&v6) {
            return Err(BibError::Ipv6Collision(v6));
        }
        if self.by_v4.contains_key(&v4) {
            return Err(BibError::Ipv4Collision(v4));
        }
        self.by_v6.insert(
            v6,
            BibEntry {
                v6,
                v4,
                is_static,
                session_count: 0,
            },
        );
        self.by_v4.insert(v4, v6);
        self.by_v6_addr.entry(v6.address).or_default().insert(v6.identifier);
        Ok(())
    }

    #[must_use]
    pub fn get_by_v6(&self, v6: Ipv6Transport) -> Option<&BibEntry> {
        self.by_v6.get(&v6)
    }

    #[must_use]
    pub fn get_by_v4(&self, v4: Ipv4Transport) -> Option<&BibEntry> {
        let v6 = self.by_v4.get(&v4)?;
        self.by_v6.get(v6)
    }

    /// Any binding for `addr`, ignoring the identifier. Used to find "does
    /// this IPv6 host already own an IPv4 address" for endpoint-independent
    /// mapping.
    #[must_use]
    pub fn get_by_v6_addr_only(&self, addr: Ipv6Addr) -> Option<&BibEntry> {
        let identifier = self.by_v6_addr.get(&addr)?.iter().next().copied()?;
        self.by_v6.get(&Ipv6Transport::new(addr, identifier))
    }

    /// Detach the binding keyed by `v6` from both indices. No-op if absent.
    pub fn remove(&mut self, v6: Ipv6Transport) -> Option<BibEntry> {
        let entry = self.by_v6.remove(&v6)?;
        self.by_v4.remove(&entry.v4);
        if let Some(ids) = self.by_v6_addr.get_mut(&v6.address) {
            ids.remove(&v6.identifier);
            if ids.is_empty() {
                self.by_v6_addr.remove(&v6.address);
            }
        }
        Some(entry)
    }

    pub fn for_each(&self, mut callback: impl FnMut(&BibEntry)) {
        for entry in self.by_v6.values() {
            callback(entry);
        }
    }

    /// Increment the session count of the binding keyed by `v6`. Panics in
    /// debug builds if the binding does not exist: a session should never
    /// outlive the binding that spawned it.
    pub(crate) fn attach_session(&mut self, v6: Ipv6Transport) {
        if let Some(entry) = self.by_v6.get_mut(&v6) {
            entry.session_count += 1;
        } else {
            debug_assert!(false, "attach_session on a binding that does not exist");
        }
    }

    /// Decrement the session count of the binding keyed by `v6`. If it
    /// reaches zero and the binding is dynamic, remove and return it so the
    /// caller can return its IPv4 transport address to the pool.
    pub(crate) fn detach_session(&mut self, v6: Ipv6Transport) -> Option<BibEntry> {
        let entry = self.by_v6.get_mut(&v6)?;
        entry.session_count = entry.session_count.saturating_sub(1);
        if entry.session_count == 0 && !entry.is_static {
            self.remove(v6)
        } else {
            None
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
}

impl Default for BibTable {
    fn default() -> Self {
        Self::new()
    }
}

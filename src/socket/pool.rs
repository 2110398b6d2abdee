//! Per-authority connection pool.
//!
//! Entries are keyed by authority (`scheme://host:port`). Within an entry a
//! connection is only handed to requests with an equal [`ConnectionIdentity`].
//! The pool never opens more than `max_per_authority` connections for one
//! authority; a shared HTTP/2 connection counts as one no matter how many
//! requests ride on it. Requests over the limit wait in FIFO order.

use crate::engine::HandleId;
use crate::socket::proxy::ProxySettings;
use crate::socket::tls::TlsSettings;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Local endpoint requested through `bindto`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BindTarget {
    /// Bind the local socket to this address (port 0 lets the OS choose).
    Addr(SocketAddr),
    /// Connect over a unix domain socket instead of TCP.
    Unix(PathBuf),
}

/// Everything besides the authority that makes two connections different.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ConnectionIdentity {
    /// Effective proxy, after `no_proxy` bypass.
    pub proxy: Option<ProxySettings>,
    pub bindto: Option<BindTarget>,
    /// `None` for plain-text connections.
    pub tls: Option<TlsSettings>,
}

/// A connection the pool can hold.
pub trait Poolable {
    fn identity(&self) -> &ConnectionIdentity;

    /// Host the socket was opened to; used to forget connections made through
    /// a dropped DNS override.
    fn connect_host(&self) -> &str;

    /// Cheap liveness check performed before handing the connection out.
    fn is_reusable(&self) -> bool;
}

/// Outcome of asking the pool for a connection.
#[derive(Debug)]
pub enum Acquired<C, S> {
    /// Multiplex on the authority's shared connection.
    Shared(S),
    /// Reuse an idle keep-alive connection.
    Idle(C),
    /// A slot was reserved; the caller opens a new connection.
    Fresh,
    /// The authority is at its limit; the caller was queued.
    Wait,
}

/// Pool state of a single authority.
#[derive(Debug)]
pub struct PoolEntry<C, S> {
    /// Connections checked out for one request each (new or reused).
    active: usize,
    idle: VecDeque<C>,
    shared: Option<S>,
    waiting: VecDeque<HandleId>,
}

impl<C, S> Default for PoolEntry<C, S> {
    fn default() -> Self {
        Self {
            active: 0,
            idle: VecDeque::new(),
            shared: None,
            waiting: VecDeque::new(),
        }
    }
}

impl<C: Poolable, S: Poolable + Clone> PoolEntry<C, S> {
    pub fn connection_count(&self) -> usize {
        self.active + self.idle.len() + usize::from(self.shared.is_some())
    }

    fn has_slot(&self, max: usize) -> bool {
        max == 0 || self.connection_count() < max
    }

    fn is_unused(&self) -> bool {
        self.connection_count() == 0 && self.waiting.is_empty()
    }

    fn try_acquire(&mut self, identity: &ConnectionIdentity, max: usize) -> Acquired<C, S> {
        if let Some(shared) = &self.shared {
            if !shared.is_reusable() {
                tracing::debug!("dropping closed shared connection");
                self.shared = None;
            } else if shared.identity() == identity {
                return Acquired::Shared(shared.clone());
            }
        }

        self.idle.retain(Poolable::is_reusable);
        if let Some(pos) = self.idle.iter().position(|c| c.identity() == identity) {
            if let Some(conn) = self.idle.remove(pos) {
                self.active += 1;
                return Acquired::Idle(conn);
            }
        }

        if self.has_slot(max) {
            self.active += 1;
            return Acquired::Fresh;
        }

        // Full: an idle connection of another identity gives up its slot.
        if self.idle.pop_front().is_some() {
            tracing::debug!("evicting idle connection of a different identity");
            self.active += 1;
            return Acquired::Fresh;
        }

        Acquired::Wait
    }
}

/// Connection pool partitioned by authority.
#[derive(Debug)]
pub struct ConnectionPool<C, S> {
    max_per_authority: usize,
    entries: HashMap<String, PoolEntry<C, S>>,
}

impl<C: Poolable, S: Poolable + Clone> ConnectionPool<C, S> {
    /// `max_per_authority == 0` means unbounded.
    pub fn new(max_per_authority: usize) -> Self {
        Self {
            max_per_authority,
            entries: HashMap::new(),
        }
    }

    /// Asks for a connection on behalf of `waiter`.
    ///
    /// A request never overtakes earlier waiters of the same authority.
    pub fn acquire(
        &mut self,
        authority: &str,
        identity: &ConnectionIdentity,
        waiter: HandleId,
    ) -> Acquired<C, S> {
        let max = self.max_per_authority;
        let entry = self.entries.entry(authority.to_string()).or_default();

        let acquired = if entry.waiting.is_empty() {
            entry.try_acquire(identity, max)
        } else {
            match &entry.shared {
                // Sharing takes no slot, so it cannot starve the queue.
                Some(shared) if shared.identity() == identity && shared.is_reusable() => {
                    Acquired::Shared(shared.clone())
                }
                _ => Acquired::Wait,
            }
        };

        if matches!(acquired, Acquired::Wait) {
            tracing::debug!(authority = %authority, waiter = %waiter, "connection limit reached, queueing");
            entry.waiting.push_back(waiter);
        }
        acquired
    }

    /// Retries the oldest waiter of `authority`.
    ///
    /// Returns the waiter and what it got; `None` when nobody waits or the
    /// head of the queue still has to wait.
    pub fn admit_next(
        &mut self,
        authority: &str,
        identity_of: impl Fn(HandleId) -> Option<ConnectionIdentity>,
    ) -> Option<(HandleId, Acquired<C, S>)> {
        let max = self.max_per_authority;
        let entry = self.entries.get_mut(authority)?;
        loop {
            let waiter = *entry.waiting.front()?;
            let Some(identity) = identity_of(waiter) else {
                // Gone since it queued.
                entry.waiting.pop_front();
                continue;
            };
            return match entry.try_acquire(&identity, max) {
                Acquired::Wait => None,
                acquired => {
                    entry.waiting.pop_front();
                    Some((waiter, acquired))
                }
            };
        }
    }

    /// Returns a slot taken by `Fresh` or `Idle`, pooling `conn` if given.
    pub fn release(&mut self, authority: &str, conn: Option<C>) {
        let max = self.max_per_authority;
        let Some(entry) = self.entries.get_mut(authority) else {
            return;
        };
        entry.active = entry.active.saturating_sub(1);

        if let Some(conn) = conn {
            if conn.is_reusable() && entry.has_slot(max) {
                entry.idle.push_back(conn);
            }
        }
        self.prune(authority);
    }

    /// Moves the slot of a freshly opened multiplexed connection to the
    /// shared position. Returns `false` when the authority already shares a
    /// connection; the caller then keeps its slot as a regular one.
    pub fn install_shared(&mut self, authority: &str, conn: S) -> bool {
        let Some(entry) = self.entries.get_mut(authority) else {
            return false;
        };
        if entry.shared.as_ref().is_some_and(Poolable::is_reusable) {
            return false;
        }
        entry.active = entry.active.saturating_sub(1);
        entry.shared = Some(conn);
        true
    }

    /// Drops a queued waiter (canceled before it got a connection).
    pub fn remove_waiter(&mut self, authority: &str, waiter: HandleId) -> bool {
        let Some(entry) = self.entries.get_mut(authority) else {
            return false;
        };
        let before = entry.waiting.len();
        entry.waiting.retain(|w| *w != waiter);
        let removed = entry.waiting.len() != before;
        self.prune(authority);
        removed
    }

    /// Drops idle and shared connections opened to any of `hosts`.
    pub fn forget_hosts(&mut self, hosts: &[String]) {
        if hosts.is_empty() {
            return;
        }
        for entry in self.entries.values_mut() {
            entry
                .idle
                .retain(|c| !hosts.iter().any(|h| h == c.connect_host()));
            if entry
                .shared
                .as_ref()
                .is_some_and(|s| hosts.iter().any(|h| h == s.connect_host()))
            {
                entry.shared = None;
            }
        }
        self.entries.retain(|_, e| !e.is_unused());
    }

    /// Drops every idle and shared connection. In-flight leases are kept.
    pub fn clear_idle(&mut self) {
        for entry in self.entries.values_mut() {
            entry.idle.clear();
            entry.shared = None;
        }
        self.entries.retain(|_, e| !e.is_unused());
    }

    pub fn entry(&self, authority: &str) -> Option<&PoolEntry<C, S>> {
        self.entries.get(authority)
    }

    pub fn connection_count(&self, authority: &str) -> usize {
        self.entries.get(authority).map_or(0, PoolEntry::connection_count)
    }

    pub fn active_count(&self, authority: &str) -> usize {
        self.entries.get(authority).map_or(0, |e| e.active)
    }

    pub fn idle_count(&self, authority: &str) -> usize {
        self.entries.get(authority).map_or(0, |e| e.idle.len())
    }

    pub fn waiting_count(&self, authority: &str) -> usize {
        self.entries.get(authority).map_or(0, |e| e.waiting.len())
    }

    pub fn has_shared(&self, authority: &str) -> bool {
        self.entries
            .get(authority)
            .is_some_and(|e| e.shared.is_some())
    }

    /// Get total idle connection count across all authorities.
    pub fn total_idle(&self) -> usize {
        self.entries.values().map(|e| e.idle.len()).sum()
    }

    fn prune(&mut self, authority: &str) {
        if self.entries.get(authority).is_some_and(PoolEntry::is_unused) {
            self.entries.remove(authority);
        }
    }
}

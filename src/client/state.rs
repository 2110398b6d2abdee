//! The client hub.
//!
//! `ClientState` owns the backend, the connection pool and the DNS, push and
//! TLS caches of one client. Everything runs on the caller's thread; only
//! `pump` blocks, and never longer than its budget. Interior mutability is
//! plain `RefCell`: no borrow is held while user callbacks run, so callbacks
//! may call back into the client.

use super::execution::RequestExecutionContext;
use super::handle::{PushVerdict, Readiness, ResponseHandle};
use super::ClientConfig;
use crate::base::loadstate::LoadState;
use crate::base::neterror::NetError;
use crate::dns::{DnsCache, Resolve};
use crate::engine::event::TransferEvent;
use crate::engine::{Backend, HandleId};
use crate::http::conn::{ConnectionMeta, Http1Connection, Http2Connection};
use crate::http::push::{validate_push, PushBuffer, PushCache, PushRejection, PushedResponse, PushedStream};
use crate::http::request::{PreparedRequest, Progress, ProgressCallback, RequestOptions};
use crate::http::transfer::{self, ConnectJobSlot, Lease};
use crate::socket::connectjob::ConnectJob;
use crate::socket::pool::{Acquired, ConnectionPool};
use crate::socket::tls::TlsConnectorCache;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Events of one pump, per handle of interest.
pub type Pumped = std::vec::IntoIter<(HandleId, Readiness)>;

/// Shortest wait handed to the backend, so deadlines are not overshot by
/// rounding.
const MIN_TICK: Duration = Duration::from_millis(1);

/// Stand-in for deadlines too far away to be represented by `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// `from + after`, capped at [`FAR_FUTURE`] when the sum overflows.
fn deadline_after(from: Instant, after: Duration) -> Instant {
    from.checked_add(after)
        .or_else(|| from.checked_add(FAR_FUTURE))
        .unwrap_or(from)
}

/// What a request holds from the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeaseState {
    /// Queued behind the authority's connection limit.
    Waiting,
    /// Holds one connection slot (fresh or reused keep-alive).
    Slot,
    /// Rides on the authority's shared connection.
    Shared,
    /// Needs no connection (consumed push).
    Unpooled,
}

struct OpenHandle {
    request: PreparedRequest,
    record: Rc<RefCell<RequestExecutionContext>>,
    lease: LeaseState,
}

/// A buffered push and the background task filling it.
#[derive(Debug)]
pub(crate) struct PushSlot {
    buffer: PushBuffer,
    task: HandleId,
}

/// Resets the performing flag when a pump ends, even by panic.
struct PerformGuard<'a>(&'a Cell<bool>);

impl Drop for PerformGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

pub struct ClientState {
    config: ClientConfig,
    weak_self: Weak<ClientState>,
    handles: RefCell<HashMap<HandleId, OpenHandle>>,
    pool: RefCell<ConnectionPool<Http1Connection, Http2Connection>>,
    pushes: RefCell<PushCache<PushSlot>>,
    dns: RefCell<DnsCache>,
    tls: RefCell<TlsConnectorCache>,
    resolver: Arc<dyn Resolve>,
    abandoned: RefCell<Vec<HandleId>>,
    performing: Cell<bool>,
    next_id: Cell<u64>,
    /// Declared last: connections above are dropped before its runtime.
    backend: RefCell<Box<dyn Backend>>,
}

impl ClientState {
    /// Builds the hub and its backend. Fails when the backend cannot start;
    /// there is no fallback to another backend.
    pub fn new(config: ClientConfig, resolver: Arc<dyn Resolve>) -> Result<Rc<Self>, NetError> {
        let backend = config.backend.build()?;
        tracing::debug!(
            backend = %config.backend,
            max_host_connections = config.max_host_connections,
            max_pending_pushes = config.max_pending_pushes,
            "client state created"
        );
        Ok(Rc::new_cyclic(|weak_self| Self {
            pool: RefCell::new(ConnectionPool::new(config.max_host_connections)),
            pushes: RefCell::new(PushCache::new(config.max_pending_pushes)),
            dns: RefCell::new(DnsCache::new()),
            tls: RefCell::new(TlsConnectorCache::new()),
            backend: RefCell::new(backend),
            resolver,
            handles: RefCell::new(HashMap::new()),
            abandoned: RefCell::new(Vec::new()),
            performing: Cell::new(false),
            next_id: Cell::new(1),
            weak_self: weak_self.clone(),
            config,
        }))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn is_performing(&self) -> bool {
        self.performing.get()
    }

    fn next_handle_id(&self) -> HandleId {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        HandleId::from_raw(id)
    }

    /// Registers a request and hands it to the backend. Never blocks.
    ///
    /// Structurally invalid options fail here; everything else ends up in
    /// the request's terminal state.
    pub fn start_request(
        &self,
        method: &str,
        url: &str,
        options: RequestOptions,
    ) -> Result<ResponseHandle, NetError> {
        let options = options.merged_with(&self.config.default_options);
        let request = PreparedRequest::prepare(method, url, options, self.config.default_timeout)?;
        tracing::info!("Request: \"{} {}\"", request.method, request.url);

        self.apply_resolve(&request);

        let id = self.next_handle_id();
        let record = Rc::new(RefCell::new(RequestExecutionContext::new(
            id,
            request.method.as_str(),
            request.url.as_str(),
            request.capture_peer_cert_chain,
        )));
        let response = ResponseHandle::new(
            id,
            self.weak_self.clone(),
            record.clone(),
            request.url.clone(),
            request.push_profile.clone(),
        );

        let consumed = self.pushes.borrow_mut().try_consume(&request);
        if let Some(pushed) = consumed {
            let sink = self.backend.borrow().sink(id);
            self.handles.borrow_mut().insert(
                id,
                OpenHandle {
                    request,
                    record,
                    lease: LeaseState::Unpooled,
                },
            );
            let future = transfer::pushed(pushed.response.buffer, sink);
            self.backend.borrow_mut().start(id, future);
            return Ok(response);
        }

        let acquired = self
            .pool
            .borrow_mut()
            .acquire(&request.authority, &request.identity, id);
        self.handles.borrow_mut().insert(
            id,
            OpenHandle {
                request,
                record,
                lease: LeaseState::Waiting,
            },
        );
        match acquired {
            Acquired::Wait => {
                self.record_debug(id, "* Waiting for a free connection");
            }
            acquired => self.launch(id, acquired),
        }
        Ok(response)
    }

    /// Installs and removes the request's DNS overrides.
    fn apply_resolve(&self, request: &PreparedRequest) {
        if request.resolve.is_empty() {
            return;
        }
        let pending = {
            let mut dns = self.dns.borrow_mut();
            for (host, ip) in &request.resolve {
                match ip {
                    Some(ip) => dns.insert(host, *ip),
                    None => {
                        dns.remove(host);
                    }
                }
            }
            dns.take_pending_removals()
        };
        self.pool.borrow_mut().forget_hosts(&pending);
    }

    fn record_debug(&self, id: HandleId, line: &str) {
        if let Some(handle) = self.handles.borrow().get(&id) {
            handle.record.borrow_mut().debug_line(line);
        }
    }

    /// Starts the transfer of an admitted request.
    fn launch(&self, id: HandleId, acquired: Acquired<Http1Connection, Http2Connection>) {
        let prepared = {
            let mut handles = self.handles.borrow_mut();
            let Some(handle) = handles.get_mut(&id) else {
                return;
            };
            let lease = match acquired {
                Acquired::Shared(conn) => {
                    handle.lease = LeaseState::Shared;
                    Ok(Lease::Shared(conn))
                }
                Acquired::Idle(conn) => {
                    handle.lease = LeaseState::Slot;
                    Ok(Lease::Idle(conn))
                }
                Acquired::Fresh => {
                    handle.lease = LeaseState::Slot;
                    self.connect_job(&handle.request)
                        .map(|job| Lease::Fresh(ConnectJobSlot(job)))
                }
                Acquired::Wait => return,
            };
            lease.map(|lease| (handle.request.clone(), lease))
        };

        match prepared {
            Ok((request, lease)) => {
                let sink = self.backend.borrow().sink(id);
                let future = transfer::network(request, lease, sink);
                self.backend.borrow_mut().start(id, future);
            }
            Err(e) => {
                self.finish(id, TransferEvent::Failed(e));
            }
        }
    }

    fn connect_job(&self, request: &PreparedRequest) -> Result<ConnectJob, NetError> {
        let connector = match &request.identity.tls {
            Some(settings) => Some(self.tls.borrow_mut().get(settings)?),
            None => None,
        };
        Ok(ConnectJob {
            url: request.url.clone(),
            identity: request.identity.clone(),
            dns_override: self.dns.borrow().get(request.connect_host()),
            resolver: self.resolver.clone(),
            connector,
            pins: request.pins.clone(),
        })
    }

    /// Drives the backend once.
    ///
    /// Returns as soon as one of `handles` (any handle when empty) changed,
    /// or when `timeout` (default: the client's idle timeout) ran out. A call
    /// made while another pump is running returns an empty batch.
    pub fn pump(&self, handles: &[HandleId], timeout: Option<Duration>) -> Pumped {
        if self.performing.replace(true) {
            return Vec::new().into_iter();
        }
        let _guard = PerformGuard(&self.performing);

        let interested = |id: &HandleId| handles.is_empty() || handles.contains(id);
        let mut ready: Vec<(HandleId, Readiness)> = Vec::new();

        self.process_abandoned(&mut ready);

        let deadline = deadline_after(Instant::now(), timeout.unwrap_or(self.config.default_timeout));
        loop {
            self.enforce_timeouts(&mut ready);
            ready.retain(|(id, _)| interested(id));
            if !ready.is_empty() {
                break;
            }
            let open_of_interest = self.handles.borrow().keys().any(|id| interested(id));
            if !open_of_interest {
                break;
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let wait = self
                .next_expiry()
                .map_or(deadline, |expiry| expiry.min(deadline))
                .saturating_duration_since(now)
                .max(MIN_TICK);

            let events = {
                let mut backend = self.backend.borrow_mut();
                if backend.active_count() == 0 {
                    // Nothing can make progress; open handles wait on a
                    // timeout.
                    drop(backend);
                    std::thread::sleep(wait);
                    continue;
                }
                backend.tick(wait)
            };
            self.dispatch(events, &mut ready);
        }

        let mut merged: Vec<(HandleId, Readiness)> = Vec::new();
        for (id, readiness) in ready {
            match merged.iter_mut().find(|(seen, _)| *seen == id) {
                Some(slot) => slot.1 = readiness,
                None => merged.push((id, readiness)),
            }
        }
        merged.into_iter()
    }

    /// Feeds events to their execution contexts, then runs progress
    /// callbacks with no borrow held.
    fn dispatch(&self, events: Vec<(HandleId, TransferEvent)>, ready: &mut Vec<(HandleId, Readiness)>) {
        let mut touched: Vec<HandleId> = Vec::new();

        for (id, event) in events {
            if event.is_terminal() {
                // Progress seen in this batch is reported before the end.
                if let Some(pos) = touched.iter().position(|t| *t == id) {
                    touched.remove(pos);
                    self.run_callbacks(&[id], ready);
                }
                if let Some(state) = self.finish(id, event) {
                    ready.push((id, Readiness::Finished(state)));
                }
                continue;
            }

            let (accepted, state) = {
                let handles = self.handles.borrow();
                let Some(handle) = handles.get(&id) else {
                    continue;
                };
                let mut record = handle.record.borrow_mut();
                (record.apply(&event), record.state())
            };
            if !accepted {
                continue;
            }

            if let TransferEvent::Connected {
                shared: Some(conn), ..
            } = event
            {
                self.install_shared(id, conn);
            }
            if !touched.contains(&id) {
                touched.push(id);
            }
            ready.push((id, Readiness::Progressed(state)));
        }

        self.run_callbacks(&touched, ready);
    }

    fn install_shared(&self, id: HandleId, conn: Http2Connection) {
        let authority = {
            let mut handles = self.handles.borrow_mut();
            let Some(handle) = handles.get_mut(&id) else {
                return;
            };
            if handle.lease != LeaseState::Slot || !self.override_still_installed(&conn.meta) {
                return;
            }
            if !self
                .pool
                .borrow_mut()
                .install_shared(&handle.request.authority, conn)
            {
                return;
            }
            handle.lease = LeaseState::Shared;
            handle.request.authority.clone()
        };
        tracing::debug!(authority = %authority, "sharing multiplexed connection");
        self.admit(&authority);
    }

    /// Whether a connection may be pooled: one opened through a DNS override
    /// is only kept while that same override is installed.
    fn override_still_installed(&self, meta: &ConnectionMeta) -> bool {
        let Some(ip) = meta.dns_override else {
            return true;
        };
        let current = self.dns.borrow().get(&meta.connect_host).map(|entry| entry.ip());
        if current == Some(ip) {
            return true;
        }
        tracing::debug!(host = %meta.connect_host, %ip, "DNS override gone, not pooling connection");
        false
    }

    fn run_callbacks(&self, touched: &[HandleId], ready: &mut Vec<(HandleId, Readiness)>) {
        for id in touched {
            let call: Option<(ProgressCallback, Progress)> = {
                let handles = self.handles.borrow();
                handles.get(id).and_then(|h| {
                    let callback = h.request.on_progress.clone()?;
                    let progress = h.record.borrow().progress();
                    Some((callback, progress))
                })
            };
            let Some((callback, progress)) = call else {
                continue;
            };
            if let Err(reason) = callback(&progress) {
                tracing::warn!(id = %id, reason = %reason, "progress callback aborted the transfer");
                self.backend.borrow_mut().cancel(*id);
                let error = NetError::AbortedByCallback {
                    url: progress.url.clone(),
                    reason,
                };
                if let Some(state) = self.finish(*id, TransferEvent::Failed(error)) {
                    ready.push((*id, Readiness::Finished(state)));
                }
            }
        }
    }

    /// Closes a request with a terminal event: updates its context, frees
    /// its pool lease and admits waiters. Returns the final state, or `None`
    /// when the request was not open.
    fn finish(&self, id: HandleId, event: TransferEvent) -> Option<LoadState> {
        let handle = self.handles.borrow_mut().remove(&id)?;

        let (event, connection) = match event {
            TransferEvent::Completed { connection } => {
                (TransferEvent::Completed { connection: None }, connection)
            }
            other => (other, None),
        };
        let state = {
            let mut record = handle.record.borrow_mut();
            record.apply(&event);
            record.state()
        };
        self.release(&handle, connection);
        Some(state)
    }

    /// Returns what `handle` held to the pool.
    fn release(&self, handle: &OpenHandle, connection: Option<Http1Connection>) {
        let authority = &handle.request.authority;
        match handle.lease {
            LeaseState::Slot => {
                let connection = connection.filter(|c| self.override_still_installed(&c.meta));
                self.pool.borrow_mut().release(authority, connection);
            }
            LeaseState::Waiting => {
                self.pool
                    .borrow_mut()
                    .remove_waiter(authority, handle.record.borrow().id());
            }
            LeaseState::Shared | LeaseState::Unpooled => {}
        }
        self.admit(authority);

        if self.handles.borrow().is_empty() {
            let pending = {
                let mut dns = self.dns.borrow_mut();
                if dns.evict_all() > 0 {
                    tracing::debug!("no open requests left, evicting DNS overrides");
                }
                dns.take_pending_removals()
            };
            self.pool.borrow_mut().forget_hosts(&pending);
        }
    }

    /// Starts queued requests of `authority` while the pool admits them.
    fn admit(&self, authority: &str) {
        loop {
            let next = {
                let handles = self.handles.borrow();
                self.pool.borrow_mut().admit_next(authority, |waiter| {
                    handles.get(&waiter).map(|h| h.request.identity.clone())
                })
            };
            let Some((id, acquired)) = next else {
                return;
            };
            self.record_debug(id, "* Connection slot granted");
            self.launch(id, acquired);
        }
    }

    /// Fails requests that were idle or ran longer than allowed.
    fn enforce_timeouts(&self, ready: &mut Vec<(HandleId, Readiness)>) {
        let now = Instant::now();
        let expired: Vec<(HandleId, NetError)> = self
            .handles
            .borrow()
            .iter()
            .filter_map(|(id, handle)| {
                let record = handle.record.borrow();
                let url = record.url().to_string();
                if let Some(max) = handle.request.max_duration {
                    let elapsed = now.saturating_duration_since(record.started());
                    if elapsed >= max {
                        return Some((
                            *id,
                            NetError::Timeout {
                                url,
                                phase: "Max duration",
                                elapsed,
                            },
                        ));
                    }
                }
                let idle = now.saturating_duration_since(record.last_activity());
                (idle >= handle.request.timeout).then_some((
                    *id,
                    NetError::Timeout {
                        url,
                        phase: "Idle",
                        elapsed: idle,
                    },
                ))
            })
            .collect();

        for (id, error) in expired {
            self.backend.borrow_mut().cancel(id);
            if let Some(state) = self.finish(id, TransferEvent::Failed(error)) {
                ready.push((id, Readiness::Finished(state)));
            }
        }
    }

    /// Earliest instant at which an open request times out.
    fn next_expiry(&self) -> Option<Instant> {
        self.handles
            .borrow()
            .values()
            .map(|handle| {
                let record = handle.record.borrow();
                let idle = deadline_after(record.last_activity(), handle.request.timeout);
                match handle.request.max_duration {
                    Some(max) => idle.min(deadline_after(record.started(), max)),
                    None => idle,
                }
            })
            .min()
    }

    /// Cancels a request. Idempotent; unknown or finished ids are ignored.
    pub fn cancel(&self, id: HandleId) {
        let lease = match self.handles.borrow().get(&id) {
            Some(handle) => handle.lease,
            None => return,
        };
        if lease != LeaseState::Waiting {
            self.backend.borrow_mut().cancel(id);
        }
        let Some(handle) = self.handles.borrow_mut().remove(&id) else {
            return;
        };
        handle.record.borrow_mut().cancel();
        tracing::debug!(id = %id, url = %handle.request.url, "request canceled");
        self.release(&handle, None);
    }

    /// Schedules cancellation of a dropped, unfinished handle.
    pub(crate) fn abandon(&self, id: HandleId) {
        self.abandoned.borrow_mut().push(id);
    }

    fn process_abandoned(&self, ready: &mut Vec<(HandleId, Readiness)>) {
        let abandoned = std::mem::take(&mut *self.abandoned.borrow_mut());
        for id in abandoned {
            if self.handles.borrow().contains_key(&id) {
                self.cancel(id);
                ready.push((id, Readiness::Finished(LoadState::Canceled)));
            }
        }
    }

    /// Offers a server push received on the connection of `parent`.
    pub fn offer_push<S: AsRef<str>>(
        &self,
        parent: &ResponseHandle,
        raw_headers: &[S],
        stream: PushedStream,
    ) -> PushVerdict {
        if !self.pushes.borrow().is_enabled() {
            tracing::debug!("{}", PushRejection::Disabled);
            return PushVerdict::Deny;
        }
        let promise = match validate_push(parent.url(), raw_headers) {
            Ok(promise) => promise,
            Err(rejection) => {
                tracing::debug!("{}", rejection);
                return PushVerdict::Deny;
            }
        };

        let buffer = PushBuffer::new();
        let task = self.next_handle_id();
        self.backend.borrow_mut().start(task, buffer.fill(stream));

        let displaced = self.pushes.borrow_mut().insert(PushedResponse {
            promise,
            parent: parent.push_profile().clone(),
            response: PushSlot { buffer, task },
        });
        for old in displaced {
            self.backend.borrow_mut().cancel(old.response.task);
        }
        PushVerdict::Ok
    }

    /// Drops state shared between requests: unused pushes, DNS overrides,
    /// TLS connectors with their session caches, and idle connections.
    /// Override counters survive.
    pub fn reset(&self) {
        let unused = self.pushes.borrow_mut().drain();
        for pushed in unused {
            self.backend.borrow_mut().cancel(pushed.response.task);
        }
        let dropped = self.dns.borrow_mut().reset();
        self.tls.borrow_mut().clear();
        let mut pool = self.pool.borrow_mut();
        pool.forget_hosts(&dropped);
        pool.clear_idle();
    }

    pub fn open_count(&self) -> usize {
        self.handles.borrow().len()
    }

    pub fn pending_push_count(&self) -> usize {
        self.pushes.borrow().len()
    }

    pub fn has_pending_push(&self, url: &str) -> bool {
        self.pushes.borrow().contains(url)
    }

    pub fn connection_count(&self, authority: &str) -> usize {
        self.pool.borrow().connection_count(authority)
    }

    pub fn idle_connection_count(&self, authority: &str) -> usize {
        self.pool.borrow().idle_count(authority)
    }

    pub fn waiting_count(&self, authority: &str) -> usize {
        self.pool.borrow().waiting_count(authority)
    }

    pub fn dns_override_count(&self) -> usize {
        self.dns.borrow().len()
    }

    pub fn dns_removals(&self) -> u64 {
        self.dns.borrow().removals()
    }

    pub fn dns_evictions(&self) -> u64 {
        self.dns.borrow().evictions()
    }

    pub fn tls_connector_count(&self) -> usize {
        self.tls.borrow().len()
    }
}

impl Drop for ClientState {
    fn drop(&mut self) {
        let handles = std::mem::take(self.handles.get_mut());
        if !handles.is_empty() {
            tracing::debug!(open = handles.len(), "client dropped, canceling open requests");
        }
        let backend = self.backend.get_mut();
        for (id, handle) in handles {
            backend.cancel(id);
            handle.record.borrow_mut().cancel();
        }
    }
}

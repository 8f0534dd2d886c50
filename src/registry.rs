//! Connection registry: one non-blocking connection per document identity.
//!
//! The registry owns every connection, its request queue and its outstanding
//! readiness registration. It is the only place a connection's [`Phase`]
//! changes. Work happens when the host hands fired registrations back through
//! [`Registry::dispatch`], or lets the registry wait on its notifier with
//! [`Registry::turn`].
//!
//! Completion callbacks are invoked synchronously from within the registry
//! call that finished the operation. Because every operation takes
//! `&mut self`, a callback can never re-enter the registry.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::mem;
use std::os::fd::RawFd;
use std::time::Duration;

use crate::client::{Connection, ConnectionMetadata, Driver};
use crate::error::{Error, Result};
use crate::notifier::{Interest, Notifier, Registration};
use crate::opts::{AbandonPolicy, RegistryOpts};
use crate::result::QueryOutcome;
use crate::state::{Action, ConnectStateMachine, QueryStateMachine};

/// Lifecycle stage of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Disconnected,
    Connecting,
    Ready,
    Busy,
    Error,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Disconnected => "disconnected",
            Phase::Connecting => "connecting",
            Phase::Ready => "ready",
            Phase::Busy => "busy",
            Phase::Error => "error",
        };
        f.write_str(name)
    }
}

/// Snapshot returned by [`Registry::status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub phase: Phase,
    pub metadata: Option<ConnectionMetadata>,
    pub queue_depth: usize,
}

/// Resolves the connection target string for an identity.
pub trait ResolveTarget<K> {
    /// Target for `identity`, or `None` when there is none.
    fn resolve(&mut self, identity: &K) -> Option<String>;
}

impl<K: Eq + Hash> ResolveTarget<K> for HashMap<K, String> {
    fn resolve(&mut self, identity: &K) -> Option<String> {
        self.get(identity).cloned()
    }
}

impl<K, F> ResolveTarget<K> for F
where
    F: FnMut(&K) -> Option<String>,
{
    fn resolve(&mut self, identity: &K) -> Option<String> {
        self(identity)
    }
}

type ConnectCallback = Box<dyn FnOnce(Result<()>)>;
type QueryCallback = Box<dyn FnOnce(Result<QueryOutcome>)>;

/// A query waiting for its turn on a connection.
struct QueryRequest {
    sql: String,
    on_complete: QueryCallback,
}

/// The single asynchronous operation a connection may have in flight.
enum Operation {
    Idle,
    Connect {
        machine: ConnectStateMachine,
        waiters: Vec<ConnectCallback>,
    },
    Query {
        machine: QueryStateMachine,
        on_complete: QueryCallback,
    },
}

struct Session<C> {
    conn: C,
    phase: Phase,
    registration: Option<Registration>,
    operation: Operation,
    queue: VecDeque<QueryRequest>,
    target: String,
    metadata: Option<ConnectionMetadata>,
}

/// Registry of per-identity connections.
///
/// Only `Connecting`, `Ready` and `Busy` connections are stored; a failed or
/// disconnected connection is removed, so [`status`](Self::status) reports
/// it as `Disconnected`.
pub struct Registry<K, D: Driver, N, R> {
    driver: D,
    notifier: N,
    resolver: R,
    opts: RegistryOpts,
    sessions: HashMap<K, Session<D::Conn>>,
    registrations: HashMap<Registration, K>,
}

impl<K, D, N, R> Registry<K, D, N, R>
where
    K: Eq + Hash + Clone + fmt::Debug,
    D: Driver,
    N: Notifier,
    R: ResolveTarget<K>,
{
    pub fn new(driver: D, notifier: N, resolver: R) -> Self {
        Self::with_opts(driver, notifier, resolver, RegistryOpts::default())
    }

    pub fn with_opts(driver: D, notifier: N, resolver: R, opts: RegistryOpts) -> Self {
        Self {
            driver,
            notifier,
            resolver,
            opts,
            sessions: HashMap::new(),
            registrations: HashMap::new(),
        }
    }

    /// Make sure `identity` has a usable connection.
    ///
    /// An identity that is already `Ready` or `Busy` gets `Ok(())`
    /// immediately, without touching the client. An identity that is
    /// `Connecting` joins the outstanding attempt. Otherwise the target is
    /// resolved and a new connect starts; `on_result` fires exactly once
    /// when it completes or fails.
    ///
    /// A successful connect is always reported from [`dispatch`] or
    /// [`turn`], never from this call. Failures that happen before the
    /// first wait (no target, start or first poll failing) are reported
    /// immediately.
    ///
    /// [`dispatch`]: Self::dispatch
    /// [`turn`]: Self::turn
    pub fn ensure_connected(
        &mut self,
        identity: &K,
        on_result: impl FnOnce(Result<()>) + 'static,
    ) {
        if let Some(session) = self.sessions.get_mut(identity) {
            match session.phase {
                Phase::Ready | Phase::Busy => {
                    tracing::trace!(?identity, phase = %session.phase, "already connected");
                    on_result(Ok(()));
                    return;
                }
                Phase::Connecting => {
                    if let Operation::Connect { waiters, .. } = &mut session.operation {
                        tracing::trace!(?identity, "joining connect in progress");
                        waiters.push(Box::new(on_result));
                        return;
                    }
                }
                Phase::Disconnected | Phase::Error => {}
            }
            // Not a stored phase; start over.
            self.disconnect(identity);
        }

        let Some(target) = self.resolver.resolve(identity) else {
            tracing::warn!(?identity, "no connection target");
            on_result(Err(Error::Config(format!(
                "no connection target for {:?}",
                identity
            ))));
            return;
        };
        self.connect(identity, target, Box::new(on_result));
    }

    /// Run `sql` on the connection of `identity`.
    ///
    /// The query runs now if the connection is `Ready`, and is queued
    /// behind the connect or the running query if it is `Connecting` or
    /// `Busy`. Without a connection, `on_complete` receives
    /// [`Error::NotConnected`].
    pub fn send_query(
        &mut self,
        identity: &K,
        sql: impl Into<String>,
        on_complete: impl FnOnce(Result<QueryOutcome>) + 'static,
    ) {
        let Some(session) = self.sessions.get_mut(identity) else {
            tracing::debug!(?identity, "query without connection");
            on_complete(Err(Error::NotConnected));
            return;
        };

        let request = QueryRequest {
            sql: sql.into(),
            on_complete: Box::new(on_complete),
        };
        match session.phase {
            Phase::Connecting | Phase::Busy => {
                session.queue.push_back(request);
                tracing::trace!(?identity, depth = session.queue.len(), "query queued");
            }
            Phase::Ready => {
                session.queue.push_back(request);
                self.start_next(identity);
            }
            phase @ (Phase::Disconnected | Phase::Error) => {
                (request.on_complete)(Err(Error::InvalidState(phase)));
            }
        }
    }

    /// Tear down the connection of `identity`, if there is one.
    ///
    /// The pending registration is cancelled, the handle released and every
    /// callback still attached to the connection abandoned according to
    /// [`RegistryOpts::abandon`].
    pub fn disconnect(&mut self, identity: &K) {
        let Some(session) = self.remove(identity) else {
            return;
        };
        tracing::debug!(?identity, phase = %session.phase, "disconnect");

        let Session {
            conn,
            operation,
            queue,
            ..
        } = session;
        conn.close();

        match operation {
            Operation::Idle => {}
            Operation::Connect { waiters, .. } => {
                for waiter in waiters {
                    self.abandon(waiter);
                }
            }
            Operation::Query { on_complete, .. } => self.abandon(on_complete),
        }
        self.abandon_queue(identity, queue);
    }

    /// Phase, metadata and queue depth of `identity`.
    pub fn status(&self, identity: &K) -> Status {
        match self.sessions.get(identity) {
            Some(session) => Status {
                phase: session.phase,
                metadata: session.metadata.clone(),
                queue_depth: session.queue.len(),
            },
            None => Status {
                phase: Phase::Disconnected,
                metadata: None,
                queue_depth: 0,
            },
        }
    }

    /// Disconnect every identity. Call before the process exits.
    pub fn disconnect_all(&mut self) {
        let identities: Vec<K> = self.sessions.keys().cloned().collect();
        tracing::debug!(count = identities.len(), "disconnect all");
        for identity in &identities {
            self.disconnect(identity);
        }
    }

    /// Disconnect and connect again to the target used last time.
    ///
    /// Without an existing connection this is [`ensure_connected`].
    ///
    /// [`ensure_connected`]: Self::ensure_connected
    pub fn reconnect(&mut self, identity: &K, on_result: impl FnOnce(Result<()>) + 'static) {
        let target = self.sessions.get(identity).map(|s| s.target.clone());
        self.disconnect(identity);
        match target {
            Some(target) => self.connect(identity, target, Box::new(on_result)),
            None => self.ensure_connected(identity, on_result),
        }
    }

    /// Handle a fired registration.
    ///
    /// Returns `false` for registrations the registry does not own, such as
    /// ones that were cancelled by a disconnect.
    pub fn dispatch(&mut self, registration: Registration) -> bool {
        let Some(identity) = self.registrations.remove(&registration) else {
            tracing::trace!(?registration, "stale registration");
            return false;
        };
        match self.sessions.get_mut(&identity) {
            Some(session) if session.registration == Some(registration) => {
                session.registration = None;
            }
            _ => return false,
        }
        tracing::trace!(?identity, ?registration, "dispatch");
        self.step(&identity);
        true
    }

    /// Wait on the notifier (forever with `None`) and dispatch everything
    /// that fired. Returns the number of registrations dispatched.
    ///
    /// Returns immediately when nothing is outstanding.
    pub fn turn(&mut self, timeout: Option<Duration>) -> Result<usize> {
        if self.registrations.is_empty() {
            return Ok(0);
        }
        let fired = self.notifier.wait(timeout)?;
        Ok(fired
            .into_iter()
            .filter(|registration| self.dispatch(*registration))
            .count())
    }

    /// True when no connect or query is in flight.
    pub fn is_idle(&self) -> bool {
        self.sessions
            .values()
            .all(|s| !matches!(s.phase, Phase::Connecting | Phase::Busy))
    }

    /// Number of tracked connections.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Identities with a tracked connection, in no particular order.
    pub fn identities(&self) -> impl Iterator<Item = &K> {
        self.sessions.keys()
    }

    fn connect(&mut self, identity: &K, target: String, on_result: ConnectCallback) {
        tracing::debug!(?identity, "connecting");
        let conn = match self.driver.start_connect(&target) {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(?identity, "connect failed to start: {}", e);
                let error = match e {
                    Error::Config(_) | Error::Connect(_) => e,
                    other => Error::Connect(other.to_string()),
                };
                on_result(Err(error));
                return;
            }
        };

        self.sessions.insert(
            identity.clone(),
            Session {
                conn,
                phase: Phase::Connecting,
                registration: None,
                operation: Operation::Connect {
                    machine: ConnectStateMachine::new(),
                    waiters: vec![on_result],
                },
                queue: VecDeque::new(),
                target,
                metadata: None,
            },
        );
        self.first_step(identity);
    }

    /// Poll a new connection once.
    ///
    /// A connect that completes on this first poll is still reported
    /// through the notifier: its socket is already writable, so the wait
    /// fires on the next turn and the completion runs from `dispatch`.
    fn first_step(&mut self, identity: &K) {
        let Some(session) = self.sessions.get_mut(identity) else {
            return;
        };
        let result = match &mut session.operation {
            Operation::Connect { machine, .. } => machine.step(&mut session.conn),
            _ => return,
        };
        match (result, session.conn.socket()) {
            (Ok(Action::Finished), Some(fd)) => {
                tracing::trace!(?identity, "connected on first poll");
                self.wait(identity, fd, Interest::Writable);
            }
            (result, _) => self.handle(identity, result),
        }
    }

    /// Step the in-flight operation of `identity` once.
    fn step(&mut self, identity: &K) {
        let Some(session) = self.sessions.get_mut(identity) else {
            return;
        };
        let result = match &mut session.operation {
            Operation::Connect { machine, .. } => machine.step(&mut session.conn),
            Operation::Query { machine, .. } => machine.step(&mut session.conn),
            Operation::Idle => return,
        };
        self.handle(identity, result);
    }

    fn handle(&mut self, identity: &K, result: Result<Action>) {
        match result {
            Ok(Action::Wait { fd, interest }) => self.wait(identity, fd, interest),
            Ok(Action::Finished) => self.finish(identity),
            Err(e) => self.fail(identity, e),
        }
    }

    fn wait(&mut self, identity: &K, fd: RawFd, interest: Interest) {
        let Some(session) = self.sessions.get_mut(identity) else {
            return;
        };
        if let Some(previous) = session.registration.take() {
            self.notifier.cancel(previous);
            self.registrations.remove(&previous);
        }

        match self.notifier.register_once(fd, interest) {
            Ok(registration) => {
                tracing::trace!(?identity, fd, ?interest, "waiting");
                session.registration = Some(registration);
                self.registrations.insert(registration, identity.clone());
            }
            Err(e) => self.fail(identity, Error::Io(e)),
        }
    }

    fn finish(&mut self, identity: &K) {
        let Some(session) = self.sessions.get_mut(identity) else {
            return;
        };
        let operation = mem::replace(&mut session.operation, Operation::Idle);
        session.phase = Phase::Ready;

        match operation {
            Operation::Idle => {}
            Operation::Connect { mut machine, waiters } => {
                session.metadata = machine.take_metadata();
                tracing::debug!(?identity, metadata = ?session.metadata, "connected");
                for waiter in waiters {
                    waiter(Ok(()));
                }
            }
            Operation::Query {
                machine,
                on_complete,
            } => {
                let outcome = machine.finish(&mut session.conn);
                tracing::debug!(
                    ?identity,
                    results = outcome.result_sets.len(),
                    elapsed = ?outcome.elapsed,
                    "query finished"
                );
                on_complete(Ok(outcome));
            }
        }
        self.start_next(identity);
    }

    /// Start queued queries until one is in flight or the queue is empty.
    fn start_next(&mut self, identity: &K) {
        loop {
            let Some(session) = self.sessions.get_mut(identity) else {
                return;
            };
            if session.phase != Phase::Ready {
                return;
            }
            let Some(request) = session.queue.pop_front() else {
                return;
            };

            let mut machine = QueryStateMachine::new();
            match machine.start(&mut session.conn, &request.sql) {
                Ok(action) => {
                    tracing::trace!(?identity, depth = session.queue.len(), "query sent");
                    session.phase = Phase::Busy;
                    session.operation = Operation::Query {
                        machine,
                        on_complete: request.on_complete,
                    };
                    self.handle(identity, Ok(action));
                    return;
                }
                Err(e) if !e.is_connection_broken() => {
                    tracing::debug!(?identity, "query rejected: {}", e);
                    (request.on_complete)(Err(e));
                }
                Err(e) => {
                    session.phase = Phase::Busy;
                    session.operation = Operation::Query {
                        machine,
                        on_complete: request.on_complete,
                    };
                    self.fail(identity, e);
                    return;
                }
            }
        }
    }

    /// Tear the connection down after its operation failed. Only the
    /// operation's own callbacks receive `error`.
    fn fail(&mut self, identity: &K, error: Error) {
        let Some(mut session) = self.remove(identity) else {
            return;
        };
        tracing::warn!(?identity, phase = %session.phase, "connection failed: {}", error);
        session.phase = Phase::Error;

        let Session {
            conn,
            operation,
            queue,
            ..
        } = session;
        conn.close();

        match operation {
            Operation::Idle => {}
            Operation::Connect { waiters, .. } => {
                let mut waiters = waiters.into_iter().peekable();
                while let Some(waiter) = waiters.next() {
                    if waiters.peek().is_some() {
                        waiter(Err(error.replicate()));
                    } else {
                        waiter(Err(error));
                        break;
                    }
                }
            }
            Operation::Query { on_complete, .. } => on_complete(Err(error)),
        }
        self.abandon_queue(identity, queue);
    }

    /// Remove a session along with its registration.
    fn remove(&mut self, identity: &K) -> Option<Session<D::Conn>> {
        let mut session = self.sessions.remove(identity)?;
        if let Some(registration) = session.registration.take() {
            self.notifier.cancel(registration);
            self.registrations.remove(&registration);
        }
        Some(session)
    }

    fn abandon_queue(&self, identity: &K, queue: VecDeque<QueryRequest>) {
        if !queue.is_empty() {
            tracing::debug!(
                ?identity,
                count = queue.len(),
                policy = ?self.opts.abandon,
                "abandoning queued queries"
            );
        }
        for request in queue {
            self.abandon(request.on_complete);
        }
    }

    fn abandon<T>(&self, callback: Box<dyn FnOnce(Result<T>)>) {
        match self.opts.abandon {
            AbandonPolicy::Drop => drop(callback),
            AbandonPolicy::Cancel => callback(Err(Error::Cancelled)),
        }
    }
}

impl<K, D: Driver, N, R> Drop for Registry<K, D, N, R> {
    fn drop(&mut self) {
        if !self.sessions.is_empty() {
            tracing::debug!(count = self.sessions.len(), "registry dropped with live connections");
        }
    }
}

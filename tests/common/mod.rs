//! Scripted fakes for the client binding and the readiness notifier.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Duration;

use pgmode::client::RawResult;
use pgmode::{
    Connection, ConnectionMetadata, Driver, Error, Interest, Notifier, PollingStatus,
    Registration, Result,
};

/// Every client call, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    StartConnect(String),
    PollConnect(RawFd),
    SetNonblocking(RawFd),
    IsHealthy(RawFd),
    SendQuery(RawFd, String),
    Flush(RawFd),
    ConsumeInput(RawFd),
    NextResult(RawFd),
    Close(RawFd),
}

/// How the client answers one query.
#[derive(Debug, Clone, Default)]
pub struct Response {
    pub results: Vec<RawResult>,
    /// `flush` calls that report unsent output
    pub pending_flushes: usize,
    /// `consume_input` calls after which the query is still busy
    pub partial_reads: usize,
    /// Reject the query synchronously with this message
    pub reject: Option<String>,
    /// Fail `consume_input` with an I/O error
    pub io_error: bool,
    /// The first `consume_input` queues a reply that needs this many
    /// `flush` calls to leave, and the query stays busy
    pub reply_flushes: usize,
}

impl Response {
    pub fn rows(results: Vec<RawResult>) -> Self {
        Self {
            results,
            ..Default::default()
        }
    }
}

/// How one connection behaves, from connect to its last query.
#[derive(Debug, Clone, Default)]
pub struct Script {
    /// Fail `start_connect` with this message
    pub start_error: Option<String>,
    /// Statuses returned by successive `poll_connect` calls; `Ok` once empty
    pub polls: VecDeque<PollingStatus>,
    pub connect_error: String,
    pub unhealthy: bool,
    pub no_socket: bool,
    /// Responses to successive queries; an empty command result once empty
    pub responses: VecDeque<Response>,
}

impl Script {
    pub fn polls(polls: &[PollingStatus]) -> Self {
        Self {
            polls: polls.iter().copied().collect(),
            ..Default::default()
        }
    }

    pub fn respond(mut self, response: Response) -> Self {
        self.responses.push_back(response);
        self
    }
}

#[derive(Default)]
pub struct World {
    pub scripts: HashMap<String, Script>,
    pub log: Vec<Call>,
    next_fd: RawFd,
    live: usize,
}

impl World {
    /// SQL texts handed to the client, in order.
    pub fn sent(&self) -> Vec<String> {
        self.log
            .iter()
            .filter_map(|call| match call {
                Call::SendQuery(_, sql) => Some(sql.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.log.iter().filter(|call| pred(call)).count()
    }

    /// Connections started and not yet closed.
    pub fn live(&self) -> usize {
        self.live
    }
}

pub struct FakeDriver {
    pub world: Rc<RefCell<World>>,
}

impl Driver for FakeDriver {
    type Conn = FakeConnection;

    fn start_connect(&mut self, target: &str) -> Result<FakeConnection> {
        let mut world = self.world.borrow_mut();
        world.log.push(Call::StartConnect(target.to_string()));
        let script = world.scripts.get(target).cloned().unwrap_or_default();
        if let Some(message) = &script.start_error {
            return Err(Error::Connect(message.clone()));
        }
        world.next_fd += 1;
        world.live += 1;
        Ok(FakeConnection {
            fd: 100 + world.next_fd,
            target: target.to_string(),
            script,
            active: None,
            results: VecDeque::new(),
            world: Rc::clone(&self.world),
        })
    }
}

pub struct FakeConnection {
    fd: RawFd,
    target: String,
    script: Script,
    active: Option<Response>,
    results: VecDeque<RawResult>,
    world: Rc<RefCell<World>>,
}

impl FakeConnection {
    fn log(&self, call: Call) {
        self.world.borrow_mut().log.push(call);
    }
}

impl Connection for FakeConnection {
    fn poll_connect(&mut self) -> PollingStatus {
        self.log(Call::PollConnect(self.fd));
        self.script.polls.pop_front().unwrap_or(PollingStatus::Ok)
    }

    fn set_nonblocking(&mut self) -> Result<()> {
        self.log(Call::SetNonblocking(self.fd));
        Ok(())
    }

    fn socket(&self) -> Option<RawFd> {
        (!self.script.no_socket).then_some(self.fd)
    }

    fn is_healthy(&self) -> bool {
        self.log(Call::IsHealthy(self.fd));
        !self.script.unhealthy
    }

    fn send_query(&mut self, sql: &str) -> Result<()> {
        self.log(Call::SendQuery(self.fd, sql.to_string()));
        assert!(self.active.is_none(), "second query sent while busy");
        let response = self.script.responses.pop_front().unwrap_or_else(|| {
            Response::rows(vec![RawResult::command("SELECT 0")])
        });
        if let Some(message) = response.reject {
            return Err(Error::Send(message));
        }
        self.active = Some(response);
        Ok(())
    }

    fn flush(&mut self) -> Result<bool> {
        self.log(Call::Flush(self.fd));
        let active = self.active.as_mut().expect("flush without query");
        if active.pending_flushes > 0 {
            active.pending_flushes -= 1;
            return Ok(false);
        }
        Ok(true)
    }

    fn consume_input(&mut self) -> Result<()> {
        self.log(Call::ConsumeInput(self.fd));
        let active = self.active.as_mut().expect("consume_input without query");
        if active.io_error {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            )));
        }
        if active.reply_flushes > 0 {
            active.pending_flushes = std::mem::take(&mut active.reply_flushes);
            return Ok(());
        }
        if active.partial_reads > 0 {
            active.partial_reads -= 1;
            return Ok(());
        }
        if let Some(done) = self.active.take() {
            self.results.extend(done.results);
        }
        Ok(())
    }

    fn is_busy(&self) -> bool {
        self.active.is_some()
    }

    fn next_result(&mut self) -> Option<RawResult> {
        self.log(Call::NextResult(self.fd));
        self.results.pop_front()
    }

    fn metadata(&self) -> ConnectionMetadata {
        ConnectionMetadata {
            user: "alice".into(),
            host: "localhost".into(),
            database: self.target.clone(),
        }
    }

    fn error_message(&self) -> String {
        self.script.connect_error.clone()
    }

    fn close(self) {
        let mut world = self.world.borrow_mut();
        world.log.push(Call::Close(self.fd));
        world.live -= 1;
    }
}

#[derive(Default)]
pub struct Readiness {
    next_id: u64,
    pending: Vec<(Registration, RawFd, Interest)>,
    /// Every registration ever made, in order.
    pub history: Vec<(RawFd, Interest)>,
    pub cancelled: usize,
}

impl Readiness {
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn interests(&self) -> Vec<Interest> {
        self.history.iter().map(|(_, interest)| *interest).collect()
    }
}

/// Notifier that fires everything outstanding on each wait.
///
/// Panics if a descriptor ever carries two outstanding registrations.
pub struct FakeNotifier {
    pub readiness: Rc<RefCell<Readiness>>,
}

impl Notifier for FakeNotifier {
    fn register_once(&mut self, fd: RawFd, interest: Interest) -> io::Result<Registration> {
        let mut readiness = self.readiness.borrow_mut();
        assert!(
            readiness.pending.iter().all(|(_, pending_fd, _)| *pending_fd != fd),
            "fd {} registered twice",
            fd
        );
        readiness.next_id += 1;
        let registration = Registration(readiness.next_id);
        readiness.pending.push((registration, fd, interest));
        readiness.history.push((fd, interest));
        Ok(registration)
    }

    fn cancel(&mut self, registration: Registration) {
        let mut readiness = self.readiness.borrow_mut();
        let before = readiness.pending.len();
        readiness.pending.retain(|(r, _, _)| *r != registration);
        if readiness.pending.len() < before {
            readiness.cancelled += 1;
        }
    }

    fn wait(&mut self, _timeout: Option<Duration>) -> io::Result<Vec<Registration>> {
        let fired = self
            .readiness
            .borrow_mut()
            .pending
            .drain(..)
            .map(|(registration, _, _)| registration)
            .collect();
        Ok(fired)
    }
}

pub type TestRegistry = pgmode::Registry<
    &'static str,
    FakeDriver,
    FakeNotifier,
    HashMap<&'static str, String>,
>;

pub struct Harness {
    pub registry: TestRegistry,
    pub world: Rc<RefCell<World>>,
    pub readiness: Rc<RefCell<Readiness>>,
}

impl Harness {
    /// Registry whose identities `"a"` and `"b"` resolve to targets
    /// `"db-a"` and `"db-b"`.
    pub fn new(scripts: Vec<(&str, Script)>) -> Self {
        Self::with_opts(scripts, pgmode::RegistryOpts::default())
    }

    pub fn with_opts(scripts: Vec<(&str, Script)>, opts: pgmode::RegistryOpts) -> Self {
        let world = Rc::new(RefCell::new(World::default()));
        world.borrow_mut().scripts = scripts
            .into_iter()
            .map(|(target, script)| (target.to_string(), script))
            .collect();
        let readiness = Rc::new(RefCell::new(Readiness::default()));
        let targets = HashMap::from([("a", "db-a".to_string()), ("b", "db-b".to_string())]);
        let registry = pgmode::Registry::with_opts(
            FakeDriver {
                world: Rc::clone(&world),
            },
            FakeNotifier {
                readiness: Rc::clone(&readiness),
            },
            targets,
            opts,
        );
        Self {
            registry,
            world,
            readiness,
        }
    }

    /// Dispatch until nothing is outstanding.
    pub fn run(&mut self) {
        while self.registry.turn(None).unwrap() > 0 {}
    }
}

/// Callback results tagged by the request that produced them.
pub type Events<T> = Rc<RefCell<Vec<(&'static str, Result<T>)>>>;

pub fn events<T>() -> Events<T> {
    Rc::new(RefCell::new(Vec::new()))
}

/// Completion callback that records its result under `tag`.
pub fn record<T: 'static>(events: &Events<T>, tag: &'static str) -> impl FnOnce(Result<T>) + 'static {
    let events = Rc::clone(events);
    move |result| events.borrow_mut().push((tag, result))
}

/// Tags in callback order.
pub fn tags<T>(events: &Events<T>) -> Vec<&'static str> {
    events.borrow().iter().map(|(tag, _)| *tag).collect()
}

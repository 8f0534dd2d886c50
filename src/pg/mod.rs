//! Non-blocking PostgreSQL client binding.
//!
//! [`PgDriver`] and [`PgConnection`] implement the [`Driver`] and
//! [`Connection`] contracts on `mio` sockets. Protocol handling lives in two
//! sans-I/O state machines, [`startup`] and [`simple_query`]; this module
//! only moves bytes between them and the socket.
//!
//! Connections are plain text. Targets that require TLS are refused when the
//! connect starts.

pub mod simple_query;
pub mod startup;

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::mem;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};

use crate::client::{Connection, ConnectionMetadata, Driver, PollingStatus, RawResult};
use crate::error::{Error, Result};
use crate::opts::{Opts, SslMode};
use crate::protocol::backend::{NoticeResponse, ParameterStatus, RawMessage, msg_type};
use crate::protocol::codec::{self, HEADER_LEN};
use crate::protocol::frontend::{write_query, write_terminate};
use crate::protocol::types::TransactionStatus;

use simple_query::{QueryProgress, SimpleQueryStateMachine};
use startup::{StartupProgress, StartupStateMachine};

const READ_CHUNK: usize = 8192;

/// Driver producing [`PgConnection`]s from connection target strings.
///
/// Targets are URLs (`postgres://user@host/db`) or keyword/value strings
/// (`host=/var/run/postgresql dbname=notes`), see [`Opts`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PgDriver;

impl Driver for PgDriver {
    type Conn = PgConnection;

    fn start_connect(&mut self, target: &str) -> Result<PgConnection> {
        PgConnection::start(Opts::try_from(target)?)
    }
}

enum Stream {
    Tcp(mio::net::TcpStream),
    Unix(mio::net::UnixStream),
}

impl Stream {
    fn take_error(&self) -> io::Result<Option<io::Error>> {
        match self {
            Stream::Tcp(s) => s.take_error(),
            Stream::Unix(s) => s.take_error(),
        }
    }

    /// Whether a non-blocking connect has completed.
    fn is_connected(&self) -> io::Result<bool> {
        let peer = match self {
            Stream::Tcp(s) => s.peer_addr().map(drop),
            Stream::Unix(s) => s.peer_addr().map(drop),
        };
        match peer {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(e) => Err(e),
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            Stream::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write(buf),
            Stream::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.flush(),
            Stream::Unix(s) => s.flush(),
        }
    }
}

impl AsRawFd for Stream {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Stream::Tcp(s) => s.as_raw_fd(),
            Stream::Unix(s) => s.as_raw_fd(),
        }
    }
}

enum State {
    /// Socket connect in progress.
    SocketConnect,
    Startup(StartupStateMachine),
    Idle,
    Busy(SimpleQueryStateMachine),
    Failed,
}

/// A non-blocking PostgreSQL connection.
pub struct PgConnection {
    opts: Opts,
    stream: Option<Stream>,
    /// Addresses not tried yet.
    addrs: VecDeque<SocketAddr>,
    state: State,
    read_buf: Vec<u8>,
    write_buf: Vec<u8>,
    results: VecDeque<RawResult>,
    error: Option<String>,
    transaction_status: TransactionStatus,
    server_params: Vec<(String, String)>,
    backend_pid: Option<u32>,
}

impl PgConnection {
    /// Begin connecting with `opts`.
    ///
    /// Host names are resolved here with a blocking lookup; an IP address
    /// or a socket directory skips it. The socket connect itself never
    /// waits.
    pub fn start(opts: Opts) -> Result<Self> {
        if opts.ssl_mode == SslMode::Require {
            return Err(Error::Unsupported(
                "sslmode=require: TLS connections are not supported".into(),
            ));
        }

        let mut conn = Self {
            stream: None,
            addrs: VecDeque::new(),
            state: State::SocketConnect,
            read_buf: Vec::new(),
            write_buf: Vec::new(),
            results: VecDeque::new(),
            error: None,
            transaction_status: TransactionStatus::Idle,
            server_params: Vec::new(),
            backend_pid: None,
            opts,
        };

        if let Some(path) = conn.opts.socket_path() {
            let stream = mio::net::UnixStream::connect(&path).map_err(|e| {
                Error::Connect(format!(
                    "connection to server on socket \"{}\" failed: {}",
                    path, e
                ))
            })?;
            tracing::debug!(path = %path, "unix socket connect started");
            conn.stream = Some(Stream::Unix(stream));
        } else {
            conn.addrs = (conn.opts.host.as_str(), conn.opts.port)
                .to_socket_addrs()
                .map_err(|e| {
                    Error::Connect(format!(
                        "could not translate host name \"{}\" to address: {}",
                        conn.opts.host, e
                    ))
                })?
                .collect();
            conn.connect_next()?;
        }
        Ok(conn)
    }

    /// Transaction status reported by the last ReadyForQuery.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    /// Value of a server parameter such as `server_version`.
    pub fn server_param(&self, name: &str) -> Option<&str> {
        self.server_params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Process id of the server backend.
    pub fn backend_pid(&self) -> Option<u32> {
        self.backend_pid
    }

    /// Start a TCP connect to the next candidate address.
    fn connect_next(&mut self) -> Result<()> {
        let mut last_error = None;
        while let Some(addr) = self.addrs.pop_front() {
            match mio::net::TcpStream::connect(addr) {
                Ok(stream) => {
                    tracing::debug!(%addr, "tcp connect started");
                    self.stream = Some(Stream::Tcp(stream));
                    return Ok(());
                }
                Err(e) => last_error = Some(self.describe_failure(Some(addr), &e)),
            }
        }
        Err(Error::Connect(last_error.unwrap_or_else(|| {
            format!("could not translate host name \"{}\" to address", self.opts.host)
        })))
    }

    fn describe_failure(&self, addr: Option<SocketAddr>, e: &io::Error) -> String {
        match (self.opts.socket_path(), addr) {
            (Some(path), _) => format!(
                "connection to server on socket \"{}\" failed: {}",
                path, e
            ),
            (None, None) => format!(
                "connection to server at \"{}\", port {} failed: {}",
                self.opts.host, self.opts.port, e
            ),
            (None, Some(addr)) => format!(
                "connection to server at \"{}\" ({}), port {} failed: {}",
                self.opts.host,
                addr.ip(),
                self.opts.port,
                e
            ),
        }
    }

    fn fail(&mut self, error: &Error) {
        tracing::debug!("connection failed: {}", error);
        self.error = Some(error.to_string());
        self.state = State::Failed;
    }

    /// Check on the socket connect; `Ok(false)` while still pending.
    fn poll_socket(&mut self) -> Result<bool> {
        loop {
            let stream = self
                .stream
                .as_ref()
                .ok_or_else(|| Error::Connect("no socket".into()))?;
            let outcome = match stream.take_error() {
                Ok(Some(e)) | Err(e) => Err(e),
                Ok(None) => stream.is_connected(),
            };
            match outcome {
                Ok(connected) => return Ok(connected),
                Err(e) => {
                    let message = self.describe_failure(None, &e);
                    tracing::debug!("{}", message);
                    self.stream = None;
                    if self.addrs.is_empty() {
                        return Err(Error::Connect(message));
                    }
                    self.connect_next()?;
                }
            }
        }
    }

    /// Write buffered output until done or the socket would block.
    fn write_pending(&mut self) -> Result<bool> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::Io(io::Error::from(io::ErrorKind::NotConnected)))?;
        let mut written = 0;
        let result = loop {
            if written == self.write_buf.len() {
                break Ok(true);
            }
            match stream.write(&self.write_buf[written..]) {
                Ok(0) => break Err(Error::Io(io::Error::from(io::ErrorKind::WriteZero))),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => break Err(Error::Io(e)),
            }
        };
        self.write_buf.drain(..written);
        result
    }

    /// Read until the socket would block. Returns `true` when the server
    /// closed the connection; bytes read before that are kept.
    fn read_available(&mut self) -> Result<bool> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::Io(io::Error::from(io::ErrorKind::NotConnected)))?;
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => return Ok(true),
                Ok(n) => self.read_buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    /// Read and handle everything available.
    ///
    /// A server that closes the socket usually says why first, so the
    /// messages before EOF are handled before the EOF is reported.
    fn receive(&mut self) -> Result<()> {
        let eof = self.read_available()?;
        self.process_input()?;
        if !eof {
            return Ok(());
        }

        let error = Error::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "server closed the connection unexpectedly",
        ));
        if matches!(self.state, State::Idle) {
            // The last response is complete; only later requests are affected.
            self.fail(&error);
            return Ok(());
        }
        Err(error)
    }

    /// Feed every complete message in the read buffer to the current state.
    fn process_input(&mut self) -> Result<()> {
        let buf = mem::take(&mut self.read_buf);
        let mut offset = 0;
        let result = loop {
            let (type_byte, len) = match codec::frame(&buf[offset..]) {
                Ok(Some(frame)) => frame,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            };
            let msg = RawMessage::new(type_byte, &buf[offset + HEADER_LEN..offset + len]);
            offset += len;
            if let Err(e) = self.handle_message(msg) {
                break Err(e);
            }
        };
        self.read_buf = buf;
        self.read_buf.drain(..offset);
        result
    }

    fn handle_message(&mut self, msg: RawMessage<'_>) -> Result<()> {
        if msg.is_async() {
            return self.handle_async(msg);
        }

        match &mut self.state {
            State::Startup(machine) => {
                if let StartupProgress::Ready(status) = machine.step(msg, &mut self.write_buf)? {
                    self.backend_pid = machine.backend_pid();
                    self.transaction_status = status;
                    self.state = State::Idle;
                    tracing::debug!(
                        pid = ?self.backend_pid,
                        server_version = ?self.server_param("server_version"),
                        "startup complete"
                    );
                }
                Ok(())
            }
            State::Busy(machine) => {
                let progress = machine.step(msg, &mut self.write_buf)?;
                self.results.extend(machine.take_results());
                if let QueryProgress::Ready(status) = progress {
                    self.transaction_status = status;
                    self.state = State::Idle;
                }
                Ok(())
            }
            State::Idle if msg.type_byte == msg_type::ERROR_RESPONSE => {
                // e.g. the server is shutting down
                let error = crate::protocol::backend::ErrorResponse::parse(msg.payload)?;
                Err(error.into_error())
            }
            State::SocketConnect | State::Idle | State::Failed => Err(Error::Protocol(format!(
                "Unexpected message '{}'",
                msg.type_byte as char
            ))),
        }
    }

    fn handle_async(&mut self, msg: RawMessage<'_>) -> Result<()> {
        match msg.type_byte {
            msg_type::NOTICE_RESPONSE => {
                let notice = NoticeResponse::parse(msg.payload)?;
                tracing::debug!("server notice: {}", notice.fields);
            }
            msg_type::PARAMETER_STATUS => {
                let param = ParameterStatus::parse(msg.payload)?;
                tracing::trace!(name = param.name, value = param.value, "parameter status");
                match self.server_params.iter_mut().find(|(n, _)| n == param.name) {
                    Some(entry) => entry.1 = param.value.to_string(),
                    None => self
                        .server_params
                        .push((param.name.to_string(), param.value.to_string())),
                }
            }
            _ => {
                tracing::trace!("ignoring notification");
            }
        }
        Ok(())
    }

    /// Drive the startup exchange as far as the socket allows.
    fn advance_startup(&mut self) -> Result<PollingStatus> {
        loop {
            if !self.write_pending()? {
                return Ok(PollingStatus::Writing);
            }
            self.receive()?;
            if matches!(self.state, State::Failed) {
                return Err(Error::Connect(self.error_message()));
            }
            if matches!(self.state, State::Idle) {
                return Ok(PollingStatus::Ok);
            }
            if self.write_buf.is_empty() {
                return Ok(PollingStatus::Reading);
            }
        }
    }

    fn poll_connect_inner(&mut self) -> Result<PollingStatus> {
        if matches!(self.state, State::SocketConnect) {
            if !self.poll_socket()? {
                return Ok(PollingStatus::Writing);
            }
            let mut machine = StartupStateMachine::new(&self.opts);
            machine.start(&mut self.write_buf);
            self.state = State::Startup(machine);
        }

        match self.state {
            State::Startup(_) => self.advance_startup(),
            State::Idle | State::Busy(_) => Ok(PollingStatus::Ok),
            State::SocketConnect | State::Failed => Ok(PollingStatus::Failed),
        }
    }

    /// Record a failure that leaves the connection unusable.
    fn check<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.fail(e);
        }
        result
    }
}

impl Connection for PgConnection {
    fn poll_connect(&mut self) -> PollingStatus {
        let result = self.poll_connect_inner();
        match self.check(result) {
            Ok(status) => status,
            Err(_) => PollingStatus::Failed,
        }
    }

    fn set_nonblocking(&mut self) -> Result<()> {
        // mio sockets never block.
        match self.state {
            State::Idle | State::Busy(_) => Ok(()),
            _ => Err(Error::NotConnected),
        }
    }

    fn socket(&self) -> Option<RawFd> {
        self.stream.as_ref().map(AsRawFd::as_raw_fd)
    }

    fn is_healthy(&self) -> bool {
        self.stream.is_some() && matches!(self.state, State::Idle | State::Busy(_))
    }

    fn send_query(&mut self, sql: &str) -> Result<()> {
        match self.state {
            State::Idle => {}
            State::Busy(_) => return Err(Error::Send("another command is already in progress".into())),
            _ => return Err(Error::Send("no connection to the server".into())),
        }
        if sql.contains('\0') {
            return Err(Error::Send("query text contains a NUL byte".into()));
        }
        write_query(&mut self.write_buf, sql);
        self.state = State::Busy(SimpleQueryStateMachine::new());
        Ok(())
    }

    fn flush(&mut self) -> Result<bool> {
        let result = self.write_pending();
        self.check(result)
    }

    /// Read what arrived, then send any reply it produced (a CopyFail).
    /// Output the socket cannot take yet stays buffered for [`flush`].
    ///
    /// [`flush`]: Connection::flush
    fn consume_input(&mut self) -> Result<()> {
        let result = self.receive().and_then(|()| {
            if self.write_buf.is_empty() {
                Ok(())
            } else {
                self.write_pending().map(drop)
            }
        });
        self.check(result)
    }

    fn is_busy(&self) -> bool {
        matches!(self.state, State::Busy(_))
    }

    fn next_result(&mut self) -> Option<RawResult> {
        self.results.pop_front()
    }

    fn metadata(&self) -> ConnectionMetadata {
        ConnectionMetadata {
            user: self.opts.user.clone(),
            host: self.opts.display_host().to_string(),
            database: self.opts.effective_database().to_string(),
        }
    }

    fn error_message(&self) -> String {
        self.error.clone().unwrap_or_default()
    }

    fn close(mut self) {
        if self.is_healthy() {
            self.write_buf.clear();
            write_terminate(&mut self.write_buf);
            if let Err(e) = self.write_pending() {
                tracing::trace!("terminate not sent: {}", e);
            }
        }
        tracing::debug!(host = self.opts.display_host(), "connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn require_ssl_is_refused() {
        let err = PgDriver
            .start_connect("postgres://alice@localhost/notes?sslmode=require")
            .err()
            .unwrap();
        assert!(matches!(err, Error::Unsupported(_)));
    }

    #[test]
    fn bad_target_is_config_error() {
        let err = PgDriver.start_connect("mysql://localhost").err().unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn missing_socket_fails_at_start() {
        let err = PgDriver
            .start_connect("host=/nonexistent/pgmode port=5432 user=alice")
            .err()
            .unwrap();
        assert!(matches!(err, Error::Connect(_)));
    }

    #[test]
    fn refused_tcp_connect_fails() {
        // Bind then drop a listener to find a port nobody listens on.
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let mut conn = PgDriver
            .start_connect(&format!("host=127.0.0.1 port={} user=alice", port))
            .unwrap();
        assert!(conn.socket().is_some());

        let mut notifier = crate::reactor::MioNotifier::new().unwrap();
        use crate::notifier::{Interest, Notifier};
        let status = loop {
            match conn.poll_connect() {
                PollingStatus::Writing => {
                    notifier
                        .register_once(conn.socket().unwrap(), Interest::Writable)
                        .unwrap();
                    notifier
                        .wait(Some(std::time::Duration::from_secs(5)))
                        .unwrap();
                }
                other => break other,
            }
        };
        assert_eq!(status, PollingStatus::Failed);
        assert!(conn.error_message().contains("failed"));
        assert!(!conn.is_healthy());
    }

    // A scripted server on a loopback socket, driven from its own thread.

    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::net::{TcpListener, TcpStream};
    use std::rc::Rc;
    use std::thread;
    use std::time::Duration;

    use crate::reactor::MioNotifier;
    use crate::registry::{Phase, Registry};
    use crate::result::{QueryOutcome, ResultSet};

    type LoopbackRegistry =
        Registry<&'static str, PgDriver, MioNotifier, HashMap<&'static str, String>>;

    fn message(type_byte: u8, payload: &[u8]) -> Vec<u8> {
        let mut msg = vec![type_byte];
        msg.extend_from_slice(&(payload.len() as i32 + 4).to_be_bytes());
        msg.extend_from_slice(payload);
        msg
    }

    fn error_response(severity: &str, code: &str, text: &str) -> Vec<u8> {
        let mut payload = Vec::new();
        for (field, value) in [(b'S', severity), (b'V', severity), (b'C', code), (b'M', text)] {
            payload.push(field);
            payload.extend_from_slice(value.as_bytes());
            payload.push(0);
        }
        payload.push(0);
        message(b'E', &payload)
    }

    fn auth_ok_and_ready() -> Vec<u8> {
        let mut out = message(b'R', &0_i32.to_be_bytes());
        out.extend(message(b'Z', b"I"));
        out
    }

    fn read_startup(stream: &mut TcpStream) {
        let mut len = [0u8; 4];
        stream.read_exact(&mut len).unwrap();
        let mut body = vec![0u8; i32::from_be_bytes(len) as usize - 4];
        stream.read_exact(&mut body).unwrap();
    }

    fn read_message(stream: &mut TcpStream) -> (u8, Vec<u8>) {
        let mut head = [0u8; 5];
        stream.read_exact(&mut head).unwrap();
        let len = i32::from_be_bytes([head[1], head[2], head[3], head[4]]) as usize;
        let mut body = vec![0u8; len - 4];
        stream.read_exact(&mut body).unwrap();
        (head[0], body)
    }

    /// Serve one connection with `script` and return its target string.
    fn serve(script: impl FnOnce(TcpStream) + Send + 'static) -> (String, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            script(stream);
        });
        (
            format!("host=127.0.0.1 port={} user=alice dbname=notes", port),
            handle,
        )
    }

    fn loopback_registry(target: String) -> LoopbackRegistry {
        Registry::new(
            PgDriver,
            MioNotifier::new().unwrap(),
            HashMap::from([("doc", target)]),
        )
    }

    /// Turn until nothing is in flight; every turn must make progress.
    fn settle(registry: &mut LoopbackRegistry) {
        while !registry.is_idle() {
            let dispatched = registry.turn(Some(Duration::from_secs(5))).unwrap();
            assert!(dispatched > 0, "connection stalled");
        }
    }

    #[test]
    fn copy_in_is_refused_and_connection_stays_usable() {
        let (target, server) = serve(|mut stream| {
            read_startup(&mut stream);
            stream.write_all(&auth_ok_and_ready()).unwrap();

            let (kind, _) = read_message(&mut stream);
            assert_eq!(kind, b'Q');
            stream.write_all(&message(b'G', &[0, 0, 0])).unwrap();

            let (kind, reason) = read_message(&mut stream);
            assert_eq!(kind, b'f');
            assert!(!reason.is_empty());
            let mut reply = error_response("ERROR", "57014", "COPY from stdin failed");
            reply.extend(message(b'Z', b"I"));
            stream.write_all(&reply).unwrap();

            let (kind, _) = read_message(&mut stream);
            assert_eq!(kind, b'Q');
            let mut columns = 1_u16.to_be_bytes().to_vec();
            columns.extend_from_slice(b"n\0");
            columns.extend_from_slice(&[0; 18]);
            let mut row = 1_u16.to_be_bytes().to_vec();
            row.extend_from_slice(&1_i32.to_be_bytes());
            row.push(b'7');
            let mut reply = message(b'T', &columns);
            reply.extend(message(b'D', &row));
            reply.extend(message(b'C', b"SELECT 1\0"));
            reply.extend(message(b'Z', b"I"));
            stream.write_all(&reply).unwrap();

            let (kind, _) = read_message(&mut stream);
            assert_eq!(kind, b'X');
        });

        let mut registry = loopback_registry(target);
        let outcomes: Rc<RefCell<Vec<Result<QueryOutcome>>>> = Rc::default();
        registry.ensure_connected(&"doc", |result| result.unwrap());
        for sql in ["COPY t FROM STDIN", "SELECT 7"] {
            let outcomes = Rc::clone(&outcomes);
            registry.send_query(&"doc", sql, move |result| outcomes.borrow_mut().push(result));
        }
        settle(&mut registry);
        assert_eq!(registry.status(&"doc").phase, Phase::Ready);

        let outcomes = outcomes.take();
        assert_eq!(outcomes.len(), 2);
        let copy = outcomes[0].as_ref().unwrap();
        assert!(
            matches!(&copy.result_sets[..], [ResultSet::Error { message }] if message.contains("COPY from stdin failed"))
        );
        assert_eq!(
            outcomes[1].as_ref().unwrap().result_sets,
            vec![ResultSet::Tabular {
                columns: vec!["n".into()],
                rows: vec![vec![Some("7".into())]],
                row_count: 1,
            }]
        );

        registry.disconnect_all();
        server.join().unwrap();
    }

    #[test]
    fn fatal_error_before_close_is_reported() {
        let (target, server) = serve(|mut stream| {
            read_startup(&mut stream);
            let error = error_response("FATAL", "3D000", "database \"nope\" does not exist");
            stream.write_all(&error).unwrap();
        });

        let mut registry = loopback_registry(target);
        let outcome: Rc<RefCell<Option<Result<()>>>> = Rc::default();
        let slot = Rc::clone(&outcome);
        registry.ensure_connected(&"doc", move |result| *slot.borrow_mut() = Some(result));
        settle(&mut registry);
        server.join().unwrap();

        match outcome.take() {
            Some(Err(Error::Connect(message))) => {
                assert!(message.contains("database \"nope\" does not exist"), "{}", message);
                assert!(message.contains("3D000"), "{}", message);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(registry.status(&"doc").phase, Phase::Disconnected);
    }

    #[test]
    fn close_after_last_response_keeps_results() {
        let (target, server) = serve(|mut stream| {
            read_startup(&mut stream);
            stream.write_all(&auth_ok_and_ready()).unwrap();
            let (kind, _) = read_message(&mut stream);
            assert_eq!(kind, b'Q');
            let mut reply = message(b'C', b"CHECKPOINT\0");
            reply.extend(message(b'Z', b"I"));
            stream.write_all(&reply).unwrap();
        });

        let mut registry = loopback_registry(target);
        let outcomes: Rc<RefCell<Vec<Result<QueryOutcome>>>> = Rc::default();
        registry.ensure_connected(&"doc", |result| result.unwrap());
        let first = Rc::clone(&outcomes);
        registry.send_query(&"doc", "CHECKPOINT", move |result| first.borrow_mut().push(result));
        settle(&mut registry);
        server.join().unwrap();

        let second = Rc::clone(&outcomes);
        registry.send_query(&"doc", "SELECT 1", move |result| second.borrow_mut().push(result));
        settle(&mut registry);

        let outcomes = outcomes.take();
        assert_eq!(
            outcomes[0].as_ref().unwrap().result_sets,
            vec![ResultSet::Command {
                status: "CHECKPOINT".into()
            }]
        );
        assert!(outcomes[1].is_err());
        assert_eq!(registry.status(&"doc").phase, Phase::Disconnected);
    }
}

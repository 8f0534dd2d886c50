//! Readiness notifier backed by `mio::Poll`.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Poll, Token};

use crate::notifier::{Interest, Notifier, Registration};

impl From<Interest> for mio::Interest {
    fn from(interest: Interest) -> Self {
        match interest {
            Interest::Readable => mio::Interest::READABLE,
            Interest::Writable => mio::Interest::WRITABLE,
        }
    }
}

/// One-shot notifier over `mio::Poll`.
///
/// A descriptor is registered with the poller while a registration is
/// outstanding and deregistered as soon as it fires or is cancelled, so each
/// descriptor may carry at most one registration at a time.
pub struct MioNotifier {
    poll: Poll,
    events: Events,
    next_id: u64,
    pending: HashMap<Token, RawFd>,
}

impl MioNotifier {
    /// Create a notifier with its own poll instance.
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(256),
            next_id: 0,
            pending: HashMap::new(),
        })
    }

    /// Number of registrations that have neither fired nor been cancelled.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn deregister(&self, fd: RawFd) {
        if let Err(e) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
            tracing::trace!(fd, "deregister failed: {}", e);
        }
    }
}

impl Notifier for MioNotifier {
    fn register_once(&mut self, fd: RawFd, interest: Interest) -> io::Result<Registration> {
        self.next_id += 1;
        let registration = Registration(self.next_id);
        let token = Token(self.next_id as usize);

        self.poll
            .registry()
            .register(&mut SourceFd(&fd), token, interest.into())?;
        self.pending.insert(token, fd);
        tracing::trace!(fd, ?interest, ?registration, "registered");
        Ok(registration)
    }

    fn cancel(&mut self, registration: Registration) {
        if let Some(fd) = self.pending.remove(&Token(registration.0 as usize)) {
            self.deregister(fd);
            tracing::trace!(fd, ?registration, "cancelled");
        }
    }

    fn wait(&mut self, timeout: Option<Duration>) -> io::Result<Vec<Registration>> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(e) => return Err(e),
        }

        let mut fired = Vec::new();
        for event in self.events.iter() {
            let token = event.token();
            if let Some(fd) = self.pending.remove(&token) {
                if let Err(e) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
                    tracing::trace!(fd, "deregister failed: {}", e);
                }
                fired.push(Registration(token.0 as u64));
            }
        }
        Ok(fired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn readable_fires_once() {
        let (mut a, b) = UnixStream::pair().unwrap();
        let mut notifier = MioNotifier::new().unwrap();

        let registration = notifier
            .register_once(b.as_raw_fd(), Interest::Readable)
            .unwrap();
        assert!(notifier.wait(Some(Duration::ZERO)).unwrap().is_empty());

        a.write_all(b"x").unwrap();
        let fired = notifier.wait(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(fired, vec![registration]);
        assert_eq!(notifier.pending(), 0);

        // Still readable, but the registration was one-shot.
        assert!(notifier.wait(Some(Duration::ZERO)).unwrap().is_empty());
    }

    #[test]
    fn writable_fires_immediately() {
        let (a, _b) = UnixStream::pair().unwrap();
        let mut notifier = MioNotifier::new().unwrap();
        let registration = notifier
            .register_once(a.as_raw_fd(), Interest::Writable)
            .unwrap();
        let fired = notifier.wait(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(fired, vec![registration]);
    }

    #[test]
    fn cancelled_never_fires() {
        let (mut a, b) = UnixStream::pair().unwrap();
        let mut notifier = MioNotifier::new().unwrap();
        let registration = notifier
            .register_once(b.as_raw_fd(), Interest::Readable)
            .unwrap();
        notifier.cancel(registration);
        a.write_all(b"x").unwrap();
        assert!(notifier.wait(Some(Duration::from_millis(50))).unwrap().is_empty());

        // The descriptor can be registered again after a cancel.
        let again = notifier
            .register_once(b.as_raw_fd(), Interest::Readable)
            .unwrap();
        assert_ne!(again, registration);
        assert_eq!(notifier.wait(Some(Duration::from_secs(5))).unwrap(), vec![again]);
    }
}

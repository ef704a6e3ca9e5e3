//! OS readiness polling behind one capability.
//!
//! [`MioPoller`] maps onto epoll, kqueue or IOCP depending on the build
//! target. The loop only ever talks to [`Poller`].

use std::io;
use std::sync::Arc;
use std::time::Duration;

use mio::{Events, Poll, Waker};

use super::{Event, Interest, Ready, Source, Token};
use crate::error::{Error, Result};

const EVENTS_CAPACITY: usize = 1024;

/// Readiness multiplexer used by the event loop.
pub trait Poller {
    /// Name of the OS primitive in use.
    fn backend(&self) -> &'static str;

    fn register(&self, source: &mut Source, token: Token, interest: Interest) -> io::Result<()>;

    fn reregister(&self, source: &mut Source, token: Token, interest: Interest) -> io::Result<()>;

    fn deregister(&self, source: &mut Source) -> io::Result<()>;

    /// Block until at least one source is ready or `timeout` elapses,
    /// appending ready sources to `events`.
    fn wait(&mut self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<()>;

    /// Create a thread-safe handle that interrupts `wait` with an event for `token`.
    fn waker(&self, token: Token) -> io::Result<Arc<dyn Wake>>;
}

/// Cross-thread wake-up of a blocked poller.
pub trait Wake: Send + Sync {
    fn wake(&self) -> io::Result<()>;
}

impl Wake for Waker {
    fn wake(&self) -> io::Result<()> {
        Waker::wake(self)
    }
}

/// Name of the backend mio selects on this platform.
pub const fn native_backend() -> &'static str {
    if cfg!(any(
        target_os = "linux",
        target_os = "android",
        target_os = "illumos",
        target_os = "redox"
    )) {
        "epoll"
    } else if cfg!(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    )) {
        "kqueue"
    } else if cfg!(windows) {
        "iocp"
    } else {
        "poll"
    }
}

/// Pick a poller for a configured backend hint.
///
/// `auto` and the native backend name are accepted; asking for a backend the
/// platform does not have is a configuration error.
pub fn from_hint(hint: &str) -> Result<Box<dyn Poller>> {
    let hint = hint.trim().to_ascii_lowercase();
    if hint != "auto" && hint != native_backend() {
        return Err(Error::config(format!(
            "poller backend {hint:?} is not available, this platform uses {:?}",
            native_backend()
        )));
    }
    Ok(Box::new(MioPoller::new().map_err(Error::LoopFault)?))
}

/// mio-backed poller.
pub struct MioPoller {
    poll: Poll,
    events: Events,
}

impl MioPoller {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(EVENTS_CAPACITY),
        })
    }
}

impl Poller for MioPoller {
    fn backend(&self) -> &'static str {
        native_backend()
    }

    fn register(&self, source: &mut Source, token: Token, interest: Interest) -> io::Result<()> {
        let interest = interest.to_mio().ok_or_else(empty_interest)?;
        self.poll.registry().register(source, token.into(), interest)
    }

    fn reregister(&self, source: &mut Source, token: Token, interest: Interest) -> io::Result<()> {
        let interest = interest.to_mio().ok_or_else(empty_interest)?;
        self.poll.registry().reregister(source, token.into(), interest)
    }

    fn deregister(&self, source: &mut Source) -> io::Result<()> {
        self.poll.registry().deregister(source)
    }

    fn wait(&mut self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<()> {
        self.poll.poll(&mut self.events, timeout)?;
        events.extend(self.events.iter().map(|event| Event {
            token: Token(event.token().0),
            ready: Ready::from_mio(event),
        }));
        Ok(())
    }

    fn waker(&self, token: Token) -> io::Result<Arc<dyn Wake>> {
        Ok(Arc::new(Waker::new(self.poll.registry(), token.into())?))
    }
}

fn empty_interest() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, "interest must include readable or writable")
}

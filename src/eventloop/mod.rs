//! Single-threaded readiness event loop.
//!
//! Owns every registered socket, dispatches readiness to the handler that
//! registered it, runs deferred tasks on the next iteration and calls the
//! periodic handlers once per interval. Handlers never block; a handler that
//! fails loses only the source the failure was reported for.

mod poller;
mod source;

pub use poller::{MioPoller, Poller, Wake, from_hint, native_backend};
pub use source::Source;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::ops::BitOr;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use mio::net::{TcpListener, TcpStream, UdpSocket};
use rustc_hash::FxHashMap;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};

/// Reserved for the cross-thread waker.
const WAKE_TOKEN: Token = Token(0);

/// Identifies one registration. Never reused by a loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(pub usize);

impl From<Token> for mio::Token {
    fn from(token: Token) -> Self {
        mio::Token(token.0)
    }
}

/// What a registration wants to be woken for.
///
/// Error readiness is always delivered alongside an armed readable or
/// writable interest; an interest with neither disarms the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest(u8);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READABLE: Interest = Interest(0b001);
    pub const WRITABLE: Interest = Interest(0b010);
    pub const ERROR: Interest = Interest(0b100);

    pub const fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    pub const fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }

    pub const fn is_error(self) -> bool {
        self.0 & Self::ERROR.0 != 0
    }

    /// Whether the OS poller has to watch the source at all.
    pub const fn arms_io(self) -> bool {
        self.is_readable() || self.is_writable()
    }

    fn to_mio(self) -> Option<mio::Interest> {
        match (self.is_readable(), self.is_writable()) {
            (true, true) => Some(mio::Interest::READABLE | mio::Interest::WRITABLE),
            (true, false) => Some(mio::Interest::READABLE),
            (false, true) => Some(mio::Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

/// Readiness reported for a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ready(u8);

impl Ready {
    pub const EMPTY: Ready = Ready(0);
    pub const READABLE: Ready = Ready(0b0001);
    pub const WRITABLE: Ready = Ready(0b0010);
    pub const ERROR: Ready = Ready(0b0100);
    /// Peer closed one or both directions.
    pub const HUP: Ready = Ready(0b1000);

    pub const fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    pub const fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }

    pub const fn is_error(self) -> bool {
        self.0 & Self::ERROR.0 != 0
    }

    pub const fn is_hup(self) -> bool {
        self.0 & Self::HUP.0 != 0
    }

    fn from_mio(event: &mio::event::Event) -> Self {
        let mut ready = Ready::EMPTY;
        if event.is_readable() {
            ready = ready | Ready::READABLE;
        }
        if event.is_writable() {
            ready = ready | Ready::WRITABLE;
        }
        if event.is_error() {
            ready = ready | Ready::ERROR;
        }
        if event.is_read_closed() || event.is_write_closed() {
            ready = ready | Ready::HUP;
        }
        ready
    }
}

impl BitOr for Ready {
    type Output = Ready;

    fn bitor(self, rhs: Ready) -> Ready {
        Ready(self.0 | rhs.0)
    }
}

/// One readiness notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub token: Token,
    pub ready: Ready,
}

/// Shared, mutable handler owned jointly by the loop and its component.
pub type HandlerRef = Rc<RefCell<dyn Handler>>;

/// Work queued for the next loop iteration.
pub type Deferred = Box<dyn FnOnce(&mut Context<'_>)>;

/// A component driven by the loop.
pub trait Handler {
    /// React to readiness of one of the handler's sources.
    ///
    /// Returning an error makes the loop close that source and call
    /// [`Handler::handle_unregistered`].
    fn handle_event(&mut self, ctx: &mut Context<'_>, token: Token, ready: Ready) -> Result<()>;

    /// Housekeeping, once per periodic interval.
    fn handle_periodic(&mut self, _ctx: &mut Context<'_>) {}

    /// The loop closed `token` after `handle_event` failed for it.
    fn handle_unregistered(&mut self, _ctx: &mut Context<'_>, _token: Token, _error: &Error) {}

    /// Graceful shutdown started: stop accepting new work.
    fn begin_shutdown(&mut self, _ctx: &mut Context<'_>) {}

    /// Whether in-flight work has finished after `begin_shutdown`.
    fn is_drained(&self) -> bool {
        true
    }
}

struct Registration {
    source: Source,
    interest: Interest,
    armed: bool,
    handler: HandlerRef,
}

struct Shared {
    stop: AtomicBool,
    shutdown: AtomicBool,
    waker: Arc<dyn Wake>,
}

/// Thread-safe handle for ending [`EventLoop::run`].
#[derive(Clone)]
pub struct StopHandle {
    shared: Arc<Shared>,
}

impl StopHandle {
    /// End the loop at the start of its next iteration.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.wake();
    }

    /// Stop accepting new sessions and end the loop once in-flight work has
    /// drained or the grace period is over.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.wake();
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stop.load(Ordering::Acquire)
    }

    fn wake(&self) {
        if let Err(e) = self.shared.waker.wake() {
            warn!(error = %e, "failed to wake event loop");
        }
    }
}

/// Access to the loop from inside a handler callback or deferred task.
pub struct Context<'a> {
    poller: &'a dyn Poller,
    registrations: &'a mut FxHashMap<Token, Registration>,
    next_token: &'a mut usize,
    deferred: &'a mut VecDeque<Deferred>,
    shared: &'a Shared,
    now: Instant,
}

impl Context<'_> {
    /// Take ownership of `source` and start watching it for `interest`.
    pub fn register(
        &mut self,
        source: impl Into<Source>,
        interest: Interest,
        handler: HandlerRef,
    ) -> io::Result<Token> {
        let token = Token(*self.next_token);
        let mut source = source.into();
        let armed = interest.arms_io();
        if armed {
            self.poller.register(&mut source, token, interest)?;
        }
        *self.next_token += 1;
        self.registrations.insert(
            token,
            Registration {
                source,
                interest,
                armed,
                handler,
            },
        );
        trace!(token = token.0, ?interest, "registered");
        Ok(token)
    }

    /// Replace the interest of a registration. Unknown tokens are ignored.
    pub fn reregister(&mut self, token: Token, interest: Interest) -> io::Result<()> {
        let Some(registration) = self.registrations.get_mut(&token) else {
            return Ok(());
        };
        if registration.interest == interest {
            return Ok(());
        }
        match (registration.armed, interest.arms_io()) {
            (false, false) => {}
            (false, true) => self.poller.register(&mut registration.source, token, interest)?,
            (true, true) => self.poller.reregister(&mut registration.source, token, interest)?,
            (true, false) => self.poller.deregister(&mut registration.source)?,
        }
        registration.armed = interest.arms_io();
        registration.interest = interest;
        Ok(())
    }

    /// Stop watching a source and hand it back; dropping it closes it.
    pub fn deregister(&mut self, token: Token) -> Option<Source> {
        let mut registration = self.registrations.remove(&token)?;
        if registration.armed {
            if let Err(e) = self.poller.deregister(&mut registration.source) {
                debug!(token = token.0, error = %e, "deregister failed");
            }
        }
        trace!(token = token.0, "deregistered");
        Some(registration.source)
    }

    pub fn is_registered(&self, token: Token) -> bool {
        self.registrations.contains_key(&token)
    }

    pub fn interest(&self, token: Token) -> Option<Interest> {
        self.registrations.get(&token).map(|r| r.interest)
    }

    pub fn source(&self, token: Token) -> Option<&Source> {
        self.registrations.get(&token).map(|r| &r.source)
    }

    pub fn listener(&self, token: Token) -> Option<&TcpListener> {
        self.source(token).and_then(Source::as_listener)
    }

    pub fn stream(&self, token: Token) -> Option<&TcpStream> {
        self.source(token).and_then(Source::as_stream)
    }

    pub fn datagram(&self, token: Token) -> Option<&UdpSocket> {
        self.source(token).and_then(Source::as_datagram)
    }

    /// Run `task` on a later iteration, outside of any handler borrow.
    pub fn defer(&mut self, task: impl FnOnce(&mut Context<'_>) + 'static) {
        self.deferred.push_back(Box::new(task));
    }

    /// Time at which the current iteration woke up.
    pub fn now(&self) -> Instant {
        self.now
    }

    pub fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire) || self.shared.stop.load(Ordering::Acquire)
    }
}

/// The cooperative event loop.
pub struct EventLoop {
    poller: Box<dyn Poller>,
    registrations: FxHashMap<Token, Registration>,
    next_token: usize,
    periodic: Vec<HandlerRef>,
    deferred: VecDeque<Deferred>,
    interval: Duration,
    grace: Duration,
    shared: Arc<Shared>,
}

impl EventLoop {
    /// Create a loop on the platform's native poller.
    pub fn new(interval: Duration) -> Result<Self> {
        let poller = MioPoller::new().map_err(Error::LoopFault)?;
        Self::with_poller(Box::new(poller), interval)
    }

    pub fn with_poller(poller: Box<dyn Poller>, interval: Duration) -> Result<Self> {
        let waker = poller.waker(WAKE_TOKEN).map_err(Error::LoopFault)?;
        Ok(Self {
            poller,
            registrations: FxHashMap::default(),
            next_token: WAKE_TOKEN.0 + 1,
            periodic: Vec::new(),
            deferred: VecDeque::new(),
            interval,
            grace: Duration::from_secs(5),
            shared: Arc::new(Shared {
                stop: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                waker,
            }),
        })
    }

    /// How long a graceful shutdown waits for handlers to drain.
    pub fn set_shutdown_grace(&mut self, grace: Duration) {
        self.grace = grace;
    }

    pub fn backend(&self) -> &'static str {
        self.poller.backend()
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn register(
        &mut self,
        source: impl Into<Source>,
        interest: Interest,
        handler: HandlerRef,
    ) -> io::Result<Token> {
        self.context(Instant::now()).register(source, interest, handler)
    }

    pub fn deregister(&mut self, token: Token) -> Option<Source> {
        self.context(Instant::now()).deregister(token)
    }

    /// Call `handler.handle_periodic` once per interval.
    pub fn add_periodic(&mut self, handler: HandlerRef) {
        self.periodic.push(handler);
    }

    pub fn defer(&mut self, task: impl FnOnce(&mut Context<'_>) + 'static) {
        self.deferred.push_back(Box::new(task));
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Run until stopped, a graceful shutdown completes, or the poller fails.
    pub fn run(&mut self) -> Result<()> {
        let mut events = Vec::with_capacity(256);
        let mut last_tick = Instant::now();
        let mut shutdown_deadline: Option<Instant> = None;

        info!(backend = self.poller.backend(), "event loop running");

        loop {
            if self.shared.stop.load(Ordering::Acquire) {
                debug!("event loop stopped");
                break;
            }

            if shutdown_deadline.is_none() && self.shared.shutdown.load(Ordering::Acquire) {
                info!(grace = ?self.grace, "graceful shutdown requested");
                shutdown_deadline = Some(Instant::now() + self.grace);
                self.begin_shutdown();
            }
            if let Some(deadline) = shutdown_deadline {
                if self.deferred.is_empty() && self.is_drained() {
                    info!("all sessions drained");
                    break;
                }
                if Instant::now() >= deadline {
                    warn!(
                        remaining = self.registrations.len(),
                        "shutdown grace period elapsed, closing remaining sockets"
                    );
                    break;
                }
            }

            let timeout = self.poll_timeout(last_tick, shutdown_deadline);
            events.clear();
            match self.poller.wait(&mut events, timeout) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::LoopFault(e)),
            }

            let now = Instant::now();
            for event in events.drain(..) {
                if event.token != WAKE_TOKEN {
                    self.dispatch(event, now);
                }
            }
            self.run_deferred(now);

            if now.saturating_duration_since(last_tick) >= self.interval {
                last_tick = now;
                self.run_periodic(now);
            }
        }

        self.close_all();
        Ok(())
    }

    fn context(&mut self, now: Instant) -> Context<'_> {
        Context {
            poller: &*self.poller,
            registrations: &mut self.registrations,
            next_token: &mut self.next_token,
            deferred: &mut self.deferred,
            shared: &self.shared,
            now,
        }
    }

    fn poll_timeout(&self, last_tick: Instant, deadline: Option<Instant>) -> Option<Duration> {
        if !self.deferred.is_empty() {
            return Some(Duration::ZERO);
        }
        let now = Instant::now();
        let tick = (!self.periodic.is_empty())
            .then(|| self.interval.saturating_sub(now.saturating_duration_since(last_tick)));
        let grace = deadline.map(|d| d.saturating_duration_since(now));
        match (tick, grace) {
            (Some(tick), Some(grace)) => Some(tick.min(grace)),
            (tick, grace) => tick.or(grace),
        }
    }

    fn dispatch(&mut self, event: Event, now: Instant) {
        // Closed by an earlier handler in this same iteration.
        let Some(registration) = self.registrations.get(&event.token) else {
            trace!(token = event.token.0, "event for closed registration");
            return;
        };
        let handler = Rc::clone(&registration.handler);
        let mut ctx = self.context(now);
        let result = handler
            .borrow_mut()
            .handle_event(&mut ctx, event.token, event.ready);
        if let Err(err) = result {
            warn!(token = event.token.0, error = %err, "handler failed, closing its source");
            ctx.deregister(event.token);
            handler
                .borrow_mut()
                .handle_unregistered(&mut ctx, event.token, &err);
        }
    }

    fn run_deferred(&mut self, now: Instant) {
        // Tasks queued while this batch runs wait for the next iteration.
        let batch = std::mem::take(&mut self.deferred);
        for task in batch {
            let mut ctx = self.context(now);
            task(&mut ctx);
        }
    }

    fn run_periodic(&mut self, now: Instant) {
        let handlers = self.periodic.clone();
        for handler in handlers {
            let mut ctx = self.context(now);
            handler.borrow_mut().handle_periodic(&mut ctx);
        }
    }

    fn begin_shutdown(&mut self) {
        let now = Instant::now();
        let handlers = self.periodic.clone();
        for handler in handlers {
            let mut ctx = self.context(now);
            handler.borrow_mut().begin_shutdown(&mut ctx);
        }
    }

    fn is_drained(&self) -> bool {
        self.periodic.iter().all(|handler| handler.borrow().is_drained())
    }

    fn close_all(&mut self) {
        for (_, mut registration) in self.registrations.drain() {
            if registration.armed {
                let _ = self.poller.deregister(&mut registration.source);
            }
        }
        self.deferred.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::net::SocketAddr;
    use std::thread;

    fn udp_pair() -> (UdpSocket, std::net::UdpSocket, SocketAddr) {
        let socket = UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = socket.local_addr().unwrap();
        let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        (socket, sender, addr)
    }

    fn watchdog(handle: StopHandle) {
        thread::spawn(move || {
            thread::sleep(Duration::from_secs(5));
            handle.stop();
        });
    }

    /// Drains datagrams and records how many arrived.
    struct Recorder {
        received: Rc<Cell<usize>>,
        stop_after: usize,
    }

    impl Handler for Recorder {
        fn handle_event(&mut self, ctx: &mut Context<'_>, token: Token, ready: Ready) -> Result<()> {
            assert!(ready.is_readable());
            let socket = ctx.datagram(token).expect("registered datagram");
            let mut buf = [0u8; 64];
            while let Ok((_, _)) = socket.recv_from(&mut buf) {
                self.received.set(self.received.get() + 1);
            }
            if self.received.get() >= self.stop_after {
                ctx.stop();
            }
            Ok(())
        }
    }

    #[test]
    fn dispatches_readable_events_to_owner() {
        let mut event_loop = EventLoop::new(Duration::from_secs(1)).unwrap();
        let (socket, sender, addr) = udp_pair();
        let received = Rc::new(Cell::new(0));
        let handler: HandlerRef = Rc::new(RefCell::new(Recorder {
            received: received.clone(),
            stop_after: 2,
        }));
        event_loop.register(socket, Interest::READABLE, handler).unwrap();
        watchdog(event_loop.stop_handle());

        sender.send_to(b"one", addr).unwrap();
        sender.send_to(b"two", addr).unwrap();
        event_loop.run().unwrap();

        assert_eq!(received.get(), 2);
    }

    struct Failing {
        failed_token: Rc<Cell<Option<Token>>>,
        notify: SocketAddr,
    }

    impl Handler for Failing {
        fn handle_event(&mut self, _ctx: &mut Context<'_>, _token: Token, _ready: Ready) -> Result<()> {
            Err(Error::protocol("boom"))
        }

        fn handle_unregistered(&mut self, ctx: &mut Context<'_>, token: Token, error: &Error) {
            assert!(matches!(error, Error::Protocol(_)));
            assert!(!ctx.is_registered(token));
            self.failed_token.set(Some(token));
            let poke = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
            poke.send_to(b"next", self.notify).unwrap();
        }
    }

    #[test]
    fn failing_handler_loses_only_its_source() {
        let mut event_loop = EventLoop::new(Duration::from_secs(1)).unwrap();
        let (good, _, good_addr) = udp_pair();
        let (bad, sender, bad_addr) = udp_pair();
        let received = Rc::new(Cell::new(0));
        let failed_token = Rc::new(Cell::new(None));

        let recorder: HandlerRef = Rc::new(RefCell::new(Recorder {
            received: received.clone(),
            stop_after: 1,
        }));
        let failing: HandlerRef = Rc::new(RefCell::new(Failing {
            failed_token: failed_token.clone(),
            notify: good_addr,
        }));
        let good_token = event_loop.register(good, Interest::READABLE, recorder).unwrap();
        let bad_token = event_loop.register(bad, Interest::READABLE, failing).unwrap();
        watchdog(event_loop.stop_handle());

        sender.send_to(b"trigger", bad_addr).unwrap();
        event_loop.run().unwrap();

        assert_eq!(failed_token.get(), Some(bad_token));
        assert_ne!(good_token, bad_token);
        assert_eq!(received.get(), 1);
    }

    #[test]
    fn event_for_closed_token_is_ignored() {
        let mut event_loop = EventLoop::new(Duration::from_secs(1)).unwrap();
        let (socket, _, _) = udp_pair();
        let handler: HandlerRef = Rc::new(RefCell::new(Recorder {
            received: Rc::new(Cell::new(0)),
            stop_after: 1,
        }));
        let token = event_loop.register(socket, Interest::READABLE, handler).unwrap();
        assert!(event_loop.deregister(token).is_some());

        event_loop.dispatch(
            Event {
                token,
                ready: Ready::READABLE,
            },
            Instant::now(),
        );

        assert!(event_loop.is_empty());
    }

    struct Deferring {
        fired: Rc<Cell<bool>>,
    }

    impl Handler for Deferring {
        fn handle_event(&mut self, ctx: &mut Context<'_>, token: Token, _ready: Ready) -> Result<()> {
            let mut buf = [0u8; 16];
            let socket = ctx.datagram(token).expect("registered datagram");
            while socket.recv_from(&mut buf).is_ok() {}

            let fired = self.fired.clone();
            ctx.defer(move |ctx| {
                fired.set(true);
                ctx.stop();
            });
            assert!(!self.fired.get(), "deferred task ran inline");
            Ok(())
        }
    }

    #[test]
    fn deferred_task_runs_after_handler_returns() {
        let mut event_loop = EventLoop::new(Duration::from_secs(1)).unwrap();
        let (socket, sender, addr) = udp_pair();
        let fired = Rc::new(Cell::new(false));
        let handler: HandlerRef = Rc::new(RefCell::new(Deferring {
            fired: fired.clone(),
        }));
        event_loop.register(socket, Interest::READABLE, handler).unwrap();
        watchdog(event_loop.stop_handle());

        sender.send_to(b"go", addr).unwrap();
        event_loop.run().unwrap();

        assert!(fired.get());
    }

    #[test]
    fn stop_handle_ends_idle_loop_from_another_thread() {
        let mut event_loop = EventLoop::new(Duration::from_secs(1)).unwrap();
        let handle = event_loop.stop_handle();

        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            handle.stop();
        });
        event_loop.run().unwrap();
        stopper.join().unwrap();

        assert!(event_loop.stop_handle().is_stopped());
    }

    struct Ticker {
        ticks: Rc<Cell<u32>>,
        drained_after_shutdown: bool,
        shutting_down: bool,
    }

    impl Handler for Ticker {
        fn handle_event(&mut self, _: &mut Context<'_>, _: Token, _: Ready) -> Result<()> {
            Ok(())
        }

        fn handle_periodic(&mut self, ctx: &mut Context<'_>) {
            self.ticks.set(self.ticks.get() + 1);
            if !self.shutting_down && self.ticks.get() == 3 {
                ctx.stop();
            }
        }

        fn begin_shutdown(&mut self, _ctx: &mut Context<'_>) {
            self.shutting_down = true;
        }

        fn is_drained(&self) -> bool {
            !self.shutting_down || self.drained_after_shutdown
        }
    }

    #[test]
    fn periodic_handlers_tick_on_interval() {
        let mut event_loop = EventLoop::new(Duration::from_millis(10)).unwrap();
        let ticks = Rc::new(Cell::new(0));
        event_loop.add_periodic(Rc::new(RefCell::new(Ticker {
            ticks: ticks.clone(),
            drained_after_shutdown: true,
            shutting_down: false,
        })));
        watchdog(event_loop.stop_handle());

        event_loop.run().unwrap();

        assert_eq!(ticks.get(), 3);
    }

    #[test]
    fn graceful_shutdown_returns_once_drained() {
        let mut event_loop = EventLoop::new(Duration::from_millis(10)).unwrap();
        event_loop.add_periodic(Rc::new(RefCell::new(Ticker {
            ticks: Rc::new(Cell::new(0)),
            drained_after_shutdown: true,
            shutting_down: false,
        })));
        let handle = event_loop.stop_handle();

        handle.shutdown();
        event_loop.run().unwrap();

        assert!(!handle.is_stopped());
    }

    #[test]
    fn graceful_shutdown_gives_up_after_grace() {
        let mut event_loop = EventLoop::new(Duration::from_millis(10)).unwrap();
        event_loop.set_shutdown_grace(Duration::from_millis(50));
        event_loop.add_periodic(Rc::new(RefCell::new(Ticker {
            ticks: Rc::new(Cell::new(0)),
            drained_after_shutdown: false,
            shutting_down: false,
        })));
        let (socket, _, _) = udp_pair();
        let handler: HandlerRef = Rc::new(RefCell::new(Recorder {
            received: Rc::new(Cell::new(0)),
            stop_after: 1,
        }));
        event_loop.register(socket, Interest::READABLE, handler).unwrap();

        let started = Instant::now();
        event_loop.stop_handle().shutdown();
        event_loop.run().unwrap();

        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(event_loop.is_empty());
    }

    #[test]
    fn reregister_with_no_interest_disarms_source() {
        let mut event_loop = EventLoop::new(Duration::from_secs(1)).unwrap();
        let (socket, _, _) = udp_pair();
        let handler: HandlerRef = Rc::new(RefCell::new(Recorder {
            received: Rc::new(Cell::new(0)),
            stop_after: 1,
        }));
        let token = event_loop.register(socket, Interest::READABLE, handler).unwrap();

        let mut ctx = event_loop.context(Instant::now());
        ctx.reregister(token, Interest::NONE).unwrap();
        assert_eq!(ctx.interest(token), Some(Interest::NONE));
        ctx.reregister(token, Interest::READABLE | Interest::WRITABLE).unwrap();

        assert_eq!(ctx.interest(token), Some(Interest::READABLE | Interest::WRITABLE));
        assert!(ctx.datagram(token).is_some());
    }
}

//! TCP relay: one listener and one state machine per accepted connection.
//!
//! ```text
//! INIT -> HANDSHAKE -> CONNECTING -> STREAMING -> CLOSING -> CLOSED
//!                  \-> UDP_ASSOCIATE ------------/
//! ```
//!
//! All sockets of all sessions are registered with the relay as handler; the
//! relay routes each event to its session by token. A session only ever reads
//! from a socket while the opposite direction has nothing left to write, so at
//! most one read chunk per direction sits in memory.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Instant;

use mio::net::{TcpListener, TcpStream};
use rustc_hash::FxHashMap;
use tracing::{debug, error, info, trace, warn};

use super::{BUF_SIZE, Mode, RelaySettings};
use crate::cache::EvictingCache;
use crate::crypto::{Cipher, Decryptor, Encryptor};
use crate::error::{Error, Result};
use crate::eventloop::{Context, EventLoop, Handler, HandlerRef, Interest, Ready, Token};
use crate::resolver::{DnsResolver, ResolveError, ResolveResult};
use crate::socks::{self, Address, Command};
use crate::stats::Stats;

type SessionId = u64;

/// Lifecycle stage of a TCP session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Init,
    Handshake,
    Connecting,
    Streaming,
    /// Control connection of a SOCKS5 UDP association; waits for EOF.
    UdpAssociate,
    Closing,
    Closed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Init => "init",
            Stage::Handshake => "handshake",
            Stage::Connecting => "connecting",
            Stage::Streaming => "streaming",
            Stage::UdpAssociate => "udp_associate",
            Stage::Closing => "closing",
            Stage::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Local,
    Remote,
}

/// Everything a session needs from its relay besides the session table.
struct SessionEnv {
    settings: RelaySettings,
    cipher: Rc<dyn Cipher>,
    resolver: Rc<RefCell<DnsResolver>>,
    stats: Arc<Stats>,
    by_token: FxHashMap<Token, SessionId>,
    udp_associate: Option<SocketAddr>,
    this: Weak<RefCell<TcpRelay>>,
}

impl SessionEnv {
    fn handler(&self) -> Result<HandlerRef> {
        let relay: Rc<RefCell<TcpRelay>> = self
            .this
            .upgrade()
            .ok_or_else(|| Error::protocol("relay is gone"))?;
        Ok(relay)
    }
}

struct TcpSession {
    id: SessionId,
    client_addr: SocketAddr,
    stage: Stage,
    local: Token,
    remote: Option<Token>,
    remote_connected: bool,
    /// Handshake bytes not yet parsed, plaintext in both modes.
    handshake: Vec<u8>,
    /// Waiting on a resolver callback or connect; local reads are paused.
    resolving: bool,
    /// Pending writes to the remote socket.
    upstream: Vec<u8>,
    /// Pending writes to the local socket.
    downstream: Vec<u8>,
    encryptor: Box<dyn Encryptor>,
    decryptor: Box<dyn Decryptor>,
    /// Where the session connects: the relay server or the destination.
    peer: Option<Address>,
    /// What the client asked for, for logging.
    target: Option<Address>,
    candidates: VecDeque<SocketAddr>,
    connecting_to: Option<SocketAddr>,
    connect_started: Option<Instant>,
    last_connect_error: Option<Error>,
    local_failed: bool,
    remote_failed: bool,
    failed: bool,
}

impl TcpSession {
    fn new(id: SessionId, client_addr: SocketAddr, local: Token, cipher: &dyn Cipher) -> Self {
        Self {
            id,
            client_addr,
            stage: Stage::Init,
            local,
            remote: None,
            remote_connected: false,
            handshake: Vec::new(),
            resolving: false,
            upstream: Vec::new(),
            downstream: Vec::new(),
            encryptor: cipher.encryptor(),
            decryptor: cipher.decryptor(),
            peer: None,
            target: None,
            candidates: VecDeque::new(),
            connecting_to: None,
            connect_started: None,
            last_connect_error: None,
            local_failed: false,
            remote_failed: false,
            failed: false,
        }
    }

    fn set_stage(&mut self, stage: Stage) {
        if self.stage == stage {
            return;
        }
        debug!(
            session = self.id,
            client = %self.client_addr,
            from = %self.stage,
            to = %stage,
            "stage"
        );
        self.stage = stage;
    }

    fn can_read(&self, side: Side) -> bool {
        match side {
            Side::Local => match self.stage {
                Stage::Init | Stage::Handshake => !self.resolving,
                Stage::Streaming => self.upstream.is_empty(),
                Stage::UdpAssociate => true,
                _ => false,
            },
            Side::Remote => self.stage == Stage::Streaming && self.downstream.is_empty(),
        }
    }

    fn handle_ready(
        &mut self,
        ctx: &mut Context<'_>,
        env: &mut SessionEnv,
        token: Token,
        ready: Ready,
    ) -> Result<()> {
        if token == self.local {
            if ready.is_writable() {
                self.on_writable(ctx, env, Side::Local)?;
            }
            if ready.is_readable() || ready.is_hup() || ready.is_error() {
                self.read_local(ctx, env)?;
            }
            return Ok(());
        }
        if self.remote != Some(token) {
            return Ok(());
        }
        if self.stage == Stage::Connecting {
            return self.check_connect(ctx, env);
        }
        if ready.is_writable() {
            self.on_writable(ctx, env, Side::Remote)?;
        }
        if ready.is_readable() || ready.is_hup() || ready.is_error() {
            self.read_remote(ctx, env)?;
        }
        Ok(())
    }

    fn read_local(&mut self, ctx: &mut Context<'_>, env: &mut SessionEnv) -> Result<()> {
        let mut buf = [0u8; BUF_SIZE];
        while self.can_read(Side::Local) {
            let Some(stream) = ctx.stream(self.local) else {
                return Ok(());
            };
            match read_some(stream, &mut buf) {
                Ok(0) => {
                    debug!(session = self.id, stage = %self.stage, "client closed");
                    self.close(ctx, env, None);
                    return Ok(());
                }
                Ok(n) => {
                    env.stats.add_bytes_up(n);
                    self.on_local_data(ctx, env, &buf[..n])?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.local_failed = true;
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    fn read_remote(&mut self, ctx: &mut Context<'_>, env: &mut SessionEnv) -> Result<()> {
        let mut buf = [0u8; BUF_SIZE];
        while self.can_read(Side::Remote) {
            let Some(stream) = self.remote.and_then(|t| ctx.stream(t)) else {
                return Ok(());
            };
            match read_some(stream, &mut buf) {
                Ok(0) => {
                    debug!(session = self.id, "remote closed");
                    self.close(ctx, env, None);
                    return Ok(());
                }
                Ok(n) => {
                    env.stats.add_bytes_down(n);
                    match env.settings.mode {
                        Mode::Local => self.decryptor.decrypt(&buf[..n], &mut self.downstream)?,
                        Mode::Server => self.encryptor.encrypt(&buf[..n], &mut self.downstream)?,
                    }
                    self.flush(ctx, Side::Local)?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.remote_failed = true;
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    fn on_local_data(&mut self, ctx: &mut Context<'_>, env: &mut SessionEnv, data: &[u8]) -> Result<()> {
        match self.stage {
            Stage::Init | Stage::Handshake => match env.settings.mode {
                Mode::Local => self.local_handshake(ctx, env, data),
                Mode::Server => self.server_handshake(ctx, env, data),
            },
            Stage::Streaming => {
                match env.settings.mode {
                    Mode::Local => self.encryptor.encrypt(data, &mut self.upstream)?,
                    Mode::Server => self.decryptor.decrypt(data, &mut self.upstream)?,
                }
                self.flush(ctx, Side::Remote)
            }
            _ => {
                trace!(session = self.id, stage = %self.stage, len = data.len(), "ignoring client data");
                Ok(())
            }
        }
    }

    /// SOCKS5 greeting and request.
    fn local_handshake(&mut self, ctx: &mut Context<'_>, env: &mut SessionEnv, data: &[u8]) -> Result<()> {
        self.handshake.extend_from_slice(data);

        if self.stage == Stage::Init {
            let Some((no_auth, len)) = socks::parse_greeting(&self.handshake)? else {
                return Ok(());
            };
            self.handshake.drain(..len);
            if !no_auth {
                self.reply(ctx, &[socks::VERSION, socks::METHOD_NO_ACCEPTABLE])?;
                return Err(Error::protocol("no acceptable authentication method"));
            }
            self.reply(ctx, &[socks::VERSION, socks::METHOD_NO_AUTH])?;
            self.set_stage(Stage::Handshake);
        }

        let Some((request, len)) = socks::parse_request(&self.handshake)? else {
            return Ok(());
        };
        let rest = self.handshake.split_off(len);
        self.handshake.clear();

        match request.command {
            Command::Connect => {
                info!(session = self.id, client = %self.client_addr, target = %request.address, "connect");
                self.target = Some(request.address.clone());
                let Some(server) = env.settings.server.clone() else {
                    let unspecified = socks::unspecified_for(&self.client_addr);
                    self.reply(ctx, &socks::reply(socks::REPLY_GENERAL_FAILURE, unspecified))?;
                    return Err(Error::config("no relay server configured"));
                };
                self.reply(ctx, &socks::connect_reply())?;
                let mut header = request.address.to_bytes();
                header.extend_from_slice(&rest);
                self.encryptor.encrypt(&header, &mut self.upstream)?;
                self.start_connect(ctx, env, server)
            }
            Command::UdpAssociate => {
                let Some(bound) = env.udp_associate else {
                    let unspecified = socks::unspecified_for(&self.client_addr);
                    self.reply(ctx, &socks::reply(socks::REPLY_COMMAND_NOT_SUPPORTED, unspecified))?;
                    return Err(Error::protocol("UDP relay is disabled"));
                };
                debug!(session = self.id, client = %self.client_addr, %bound, "udp associate");
                self.reply(ctx, &socks::reply(socks::REPLY_SUCCEEDED, bound))?;
                self.set_stage(Stage::UdpAssociate);
                Ok(())
            }
            other => {
                let unspecified = socks::unspecified_for(&self.client_addr);
                self.reply(ctx, &socks::reply(socks::REPLY_COMMAND_NOT_SUPPORTED, unspecified))?;
                Err(Error::protocol(format!("unsupported command {other:?}")))
            }
        }
    }

    /// Encrypted address header followed by payload.
    fn server_handshake(&mut self, ctx: &mut Context<'_>, env: &mut SessionEnv, data: &[u8]) -> Result<()> {
        self.set_stage(Stage::Handshake);
        self.decryptor.decrypt(data, &mut self.handshake)?;
        let Some((address, len)) = Address::parse(&self.handshake)? else {
            return Ok(());
        };
        self.upstream.extend_from_slice(&self.handshake[len..]);
        self.handshake.clear();
        info!(session = self.id, client = %self.client_addr, target = %address, "connect");
        self.target = Some(address.clone());
        self.start_connect(ctx, env, address)
    }

    fn reply(&mut self, ctx: &mut Context<'_>, bytes: &[u8]) -> Result<()> {
        self.downstream.extend_from_slice(bytes);
        self.flush(ctx, Side::Local)
    }

    /// Resolve `peer` and connect to it; suspends local reads until done.
    fn start_connect(&mut self, ctx: &mut Context<'_>, env: &mut SessionEnv, peer: Address) -> Result<()> {
        self.resolving = true;
        self.peer = Some(peer.clone());
        match peer {
            Address::Socket(addr) => {
                self.candidates = VecDeque::from([addr]);
                self.connect_next(ctx, env)
            }
            Address::Domain(host, port) => {
                let relay = env.this.clone();
                let id = self.id;
                let lookup = host.clone();
                env.resolver.borrow_mut().resolve(ctx, &lookup, move |ctx, result| {
                    if let Some(relay) = relay.upgrade() {
                        relay.borrow_mut().on_resolved(ctx, id, &host, port, result);
                    }
                });
                Ok(())
            }
        }
    }

    fn on_resolved(
        &mut self,
        ctx: &mut Context<'_>,
        env: &mut SessionEnv,
        host: &str,
        port: u16,
        result: ResolveResult,
    ) -> Result<()> {
        let addrs = result.map_err(|source| Error::Resolution {
            host: host.to_string(),
            source,
        })?;
        trace!(session = self.id, host, ?addrs, "resolved");
        self.candidates = addrs.iter().map(|ip: &IpAddr| SocketAddr::new(*ip, port)).collect();
        self.connect_next(ctx, env)
    }

    /// Try the next resolved address; fails once none remain.
    fn connect_next(&mut self, ctx: &mut Context<'_>, env: &mut SessionEnv) -> Result<()> {
        while let Some(addr) = self.candidates.pop_front() {
            let stream = match TcpStream::connect(addr) {
                Ok(stream) => stream,
                Err(source) => {
                    debug!(session = self.id, %addr, error = %source, "connect failed");
                    self.last_connect_error = Some(Error::Connect { addr, source });
                    continue;
                }
            };
            let token = ctx.register(stream, Interest::WRITABLE, env.handler()?)?;
            env.by_token.insert(token, self.id);
            self.remote = Some(token);
            self.connecting_to = Some(addr);
            self.connect_started = Some(ctx.now());
            self.set_stage(Stage::Connecting);
            return Ok(());
        }
        Err(self.last_connect_error.take().unwrap_or_else(|| Error::Resolution {
            host: self.peer.as_ref().map(Address::host).unwrap_or_default(),
            source: ResolveError::NotFound,
        }))
    }

    fn check_connect(&mut self, ctx: &mut Context<'_>, env: &mut SessionEnv) -> Result<()> {
        let Some(stream) = self.remote.and_then(|t| ctx.stream(t)) else {
            return Ok(());
        };
        let outcome = match stream.take_error() {
            Ok(Some(e)) | Err(e) => Err(e),
            Ok(None) => match stream.peer_addr() {
                Ok(_) => Ok(true),
                Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
                Err(e) => Err(e),
            },
        };
        match outcome {
            Ok(false) => Ok(()),
            Ok(true) => {
                let _ = stream.set_nodelay(true);
                debug!(session = self.id, peer = ?self.connecting_to, "connected");
                self.remote_connected = true;
                self.resolving = false;
                self.connect_started = None;
                self.candidates.clear();
                self.set_stage(Stage::Streaming);
                self.flush(ctx, Side::Remote)?;
                self.read_local(ctx, env)
            }
            Err(source) => {
                let addr = self.connecting_to.take().unwrap_or(self.client_addr);
                debug!(session = self.id, %addr, error = %source, "connect failed");
                self.drop_remote(ctx, env);
                self.last_connect_error = Some(Error::Connect { addr, source });
                self.connect_next(ctx, env)
            }
        }
    }

    /// Fail the current connect attempt if it has run past `timeout`.
    fn check_connect_timeout(
        &mut self,
        ctx: &mut Context<'_>,
        env: &mut SessionEnv,
        timeout: std::time::Duration,
    ) -> Result<()> {
        let Some(started) = self.connect_started else {
            return Ok(());
        };
        if self.stage != Stage::Connecting || ctx.now().saturating_duration_since(started) < timeout {
            return Ok(());
        }
        let addr = self.connecting_to.take().unwrap_or(self.client_addr);
        debug!(session = self.id, %addr, "connect timed out");
        self.drop_remote(ctx, env);
        self.connect_started = None;
        self.last_connect_error = Some(Error::ConnectTimeout(addr));
        self.connect_next(ctx, env)
    }

    fn on_writable(&mut self, ctx: &mut Context<'_>, env: &mut SessionEnv, side: Side) -> Result<()> {
        self.flush(ctx, side)?;
        // The opposite source was paused while this buffer was non-empty.
        match side {
            Side::Remote if self.upstream.is_empty() && self.stage == Stage::Streaming => {
                self.read_local(ctx, env)
            }
            Side::Local if self.downstream.is_empty() && self.stage == Stage::Streaming => {
                self.read_remote(ctx, env)
            }
            _ => Ok(()),
        }
    }

    /// Write as much pending data to `side` as the socket takes.
    fn flush(&mut self, ctx: &Context<'_>, side: Side) -> Result<()> {
        let (token, buf, failed) = match side {
            Side::Local => (Some(self.local), &mut self.downstream, &mut self.local_failed),
            Side::Remote if self.remote_connected => (self.remote, &mut self.upstream, &mut self.remote_failed),
            Side::Remote => return Ok(()),
        };
        if buf.is_empty() || *failed {
            return Ok(());
        }
        let Some(stream) = token.and_then(|t| ctx.stream(t)) else {
            return Ok(());
        };
        if let Err(e) = write_some(stream, buf) {
            *failed = true;
            buf.clear();
            return Err(e.into());
        }
        Ok(())
    }

    fn drop_remote(&mut self, ctx: &mut Context<'_>, env: &mut SessionEnv) {
        if let Some(token) = self.remote.take() {
            ctx.deregister(token);
            env.by_token.remove(&token);
        }
        self.remote_connected = false;
    }

    /// Enter CLOSING: stop reading and give pending writes a last chance.
    fn close(&mut self, ctx: &mut Context<'_>, env: &mut SessionEnv, cause: Option<Error>) {
        if matches!(self.stage, Stage::Closing | Stage::Closed) {
            return;
        }
        match &cause {
            Some(error) if !error.is_session_fatal() => {
                self.failed = true;
                error!(
                    session = self.id,
                    client = %self.client_addr,
                    stage = %self.stage,
                    %error,
                    "relay cannot serve session"
                );
            }
            Some(error) => {
                self.failed = true;
                warn!(
                    session = self.id,
                    client = %self.client_addr,
                    stage = %self.stage,
                    target = ?self.target.as_ref().map(ToString::to_string),
                    %error,
                    "session failed"
                );
            }
            None => debug!(session = self.id, client = %self.client_addr, stage = %self.stage, "closing"),
        }
        if !self.remote_connected {
            self.upstream.clear();
            self.drop_remote(ctx, env);
        }
        self.resolving = false;
        self.candidates.clear();
        self.set_stage(Stage::Closing);
    }

    /// Flush what is left while CLOSING; true once nothing remains.
    fn drained(&mut self, ctx: &mut Context<'_>) -> bool {
        for side in [Side::Local, Side::Remote] {
            if self.flush(ctx, side).is_err() {
                trace!(session = self.id, ?side, "final flush failed");
            }
        }
        let upstream_done = self.upstream.is_empty() || self.remote_failed || !self.remote_connected;
        let downstream_done = self.downstream.is_empty() || self.local_failed;
        upstream_done && downstream_done
    }

    /// Deregister (and so close) both sockets.
    fn destroy(&mut self, ctx: &mut Context<'_>, env: &mut SessionEnv) {
        if self.stage == Stage::Closed {
            return;
        }
        self.drop_remote(ctx, env);
        ctx.deregister(self.local);
        env.by_token.remove(&self.local);
        self.upstream.clear();
        self.downstream.clear();
        self.set_stage(Stage::Closed);
    }

    fn update_interest(&self, ctx: &mut Context<'_>) -> io::Result<()> {
        let mut local = Interest::NONE;
        if self.can_read(Side::Local) {
            local = local | Interest::READABLE;
        }
        if !self.downstream.is_empty() && !self.local_failed {
            local = local | Interest::WRITABLE;
        }
        ctx.reregister(self.local, local)?;

        if let Some(token) = self.remote {
            let mut remote = Interest::NONE;
            if self.stage == Stage::Connecting {
                remote = Interest::WRITABLE;
            } else {
                if self.can_read(Side::Remote) {
                    remote = remote | Interest::READABLE;
                }
                if !self.upstream.is_empty() && !self.remote_failed {
                    remote = remote | Interest::WRITABLE;
                }
            }
            ctx.reregister(token, remote)?;
        }
        Ok(())
    }
}

fn read_some(mut stream: &TcpStream, buf: &mut [u8]) -> io::Result<usize> {
    stream.read(buf)
}

/// Write until `buf` is empty or the socket would block; written bytes are
/// removed from `buf`.
fn write_some(mut stream: &TcpStream, buf: &mut Vec<u8>) -> io::Result<()> {
    let mut written = 0;
    let result = loop {
        if written == buf.len() {
            break Ok(());
        }
        match stream.write(&buf[written..]) {
            Ok(0) => break Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => break Err(e),
        }
    };
    buf.drain(..written);
    result
}

/// Accepts connections and drives every TCP session.
pub struct TcpRelay {
    env: SessionEnv,
    listener: Option<Token>,
    sessions: FxHashMap<SessionId, TcpSession>,
    idle: EvictingCache<SessionId, SessionId>,
    next_id: SessionId,
    shutting_down: bool,
}

impl TcpRelay {
    pub fn new(
        settings: RelaySettings,
        cipher: Rc<dyn Cipher>,
        resolver: Rc<RefCell<DnsResolver>>,
        stats: Arc<Stats>,
    ) -> Rc<RefCell<Self>> {
        Rc::new_cyclic(|this| {
            RefCell::new(Self {
                idle: EvictingCache::new(settings.timeout),
                env: SessionEnv {
                    settings,
                    cipher,
                    resolver,
                    stats,
                    by_token: FxHashMap::default(),
                    udp_associate: None,
                    this: this.clone(),
                },
                listener: None,
                sessions: FxHashMap::default(),
                next_id: 1,
                shutting_down: false,
            })
        })
    }

    /// Listen on `addr` and register with the loop. Returns the bound address.
    pub fn add_to_loop(this: &Rc<RefCell<Self>>, event_loop: &mut EventLoop, addr: SocketAddr) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr)?;
        let bound = listener.local_addr()?;
        let handler: HandlerRef = this.clone();
        let token = event_loop.register(listener, Interest::READABLE, handler.clone())?;
        event_loop.add_periodic(handler);
        this.borrow_mut().listener = Some(token);
        Ok(bound)
    }

    /// Address announced to SOCKS5 UDP ASSOCIATE requests; `None` refuses them.
    pub fn set_udp_associate(&mut self, addr: Option<SocketAddr>) {
        self.env.udp_associate = addr;
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Stages of the live sessions, oldest first.
    pub fn stages(&self) -> Vec<Stage> {
        let mut sessions: Vec<_> = self.sessions.values().map(|s| (s.id, s.stage)).collect();
        sessions.sort_unstable_by_key(|(id, _)| *id);
        sessions.into_iter().map(|(_, stage)| stage).collect()
    }

    fn accept(&mut self, ctx: &mut Context<'_>) {
        loop {
            let Some(listener) = self.listener.and_then(|t| ctx.listener(t)) else {
                return;
            };
            let (stream, client_addr) = match listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    return;
                }
            };
            if self.shutting_down {
                continue;
            }
            let _ = stream.set_nodelay(true);
            let handler = match self.env.handler() {
                Ok(handler) => handler,
                Err(_) => return,
            };
            let token = match ctx.register(stream, Interest::READABLE, handler) {
                Ok(token) => token,
                Err(e) => {
                    warn!(client = %client_addr, error = %e, "failed to register client");
                    continue;
                }
            };
            let id = self.next_id;
            self.next_id += 1;
            self.env.by_token.insert(token, id);
            self.sessions
                .insert(id, TcpSession::new(id, client_addr, token, &*self.env.cipher));
            self.idle.set(id, id);
            self.env.stats.record_tcp_opened();
            debug!(session = id, client = %client_addr, "accepted");
        }
    }

    fn on_resolved(&mut self, ctx: &mut Context<'_>, id: SessionId, host: &str, port: u16, result: ResolveResult) {
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        if session.stage != Stage::Handshake || !session.resolving {
            return;
        }
        if let Err(e) = session.on_resolved(ctx, &mut self.env, host, port, result) {
            session.close(ctx, &mut self.env, Some(e));
        }
        self.settle(ctx, id);
    }

    /// Apply the session's new state: finish closing, re-arm interest and
    /// refresh its idle timer.
    fn settle(&mut self, ctx: &mut Context<'_>, id: SessionId) {
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        if session.stage == Stage::Closing && session.drained(ctx) {
            session.destroy(ctx, &mut self.env);
        }
        if session.stage != Stage::Closed {
            if let Err(e) = session.update_interest(ctx) {
                session.close(ctx, &mut self.env, Some(e.into()));
                session.destroy(ctx, &mut self.env);
            }
        }
        if session.stage == Stage::Closed {
            let failed = session.failed;
            self.sessions.remove(&id);
            self.idle.delete(&id);
            self.env.stats.record_tcp_closed();
            if failed {
                self.env.stats.record_tcp_failed();
            }
            debug!(session = id, remaining = self.sessions.len(), "session closed");
            return;
        }
        self.idle.set(id, id);
    }
}

impl Handler for TcpRelay {
    fn handle_event(&mut self, ctx: &mut Context<'_>, token: Token, ready: Ready) -> Result<()> {
        if self.listener == Some(token) {
            self.accept(ctx);
            return Ok(());
        }
        let Some(&id) = self.env.by_token.get(&token) else {
            trace!(token = token.0, "event for unknown token");
            return Ok(());
        };
        let Some(session) = self.sessions.get_mut(&id) else {
            return Ok(());
        };
        if let Err(e) = session.handle_ready(ctx, &mut self.env, token, ready) {
            session.close(ctx, &mut self.env, Some(e));
        }
        self.settle(ctx, id);
        Ok(())
    }

    fn handle_periodic(&mut self, ctx: &mut Context<'_>) {
        let mut expired = Vec::new();
        self.idle.sweep(|id, _| expired.push(*id));
        for id in expired {
            let Some(session) = self.sessions.get_mut(&id) else {
                continue;
            };
            self.env.stats.record_tcp_evicted();
            if session.stage == Stage::Closing {
                debug!(session = id, "closing session timed out");
                session.destroy(ctx, &mut self.env);
            } else {
                debug!(session = id, stage = %session.stage, "idle session evicted");
                session.close(ctx, &mut self.env, None);
            }
            self.settle(ctx, id);
        }

        let connect_timeout = self.env.settings.connect_timeout;
        let connecting: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| s.stage == Stage::Connecting)
            .map(|s| s.id)
            .collect();
        for id in connecting {
            let Some(session) = self.sessions.get_mut(&id) else {
                continue;
            };
            if let Err(e) = session.check_connect_timeout(ctx, &mut self.env, connect_timeout) {
                session.close(ctx, &mut self.env, Some(e));
            }
            self.settle(ctx, id);
        }
    }

    fn handle_unregistered(&mut self, ctx: &mut Context<'_>, token: Token, error: &Error) {
        let Some(id) = self.env.by_token.remove(&token) else {
            return;
        };
        warn!(session = id, %error, "session socket unregistered");
        if let Some(session) = self.sessions.get_mut(&id) {
            session.destroy(ctx, &mut self.env);
        }
        self.settle(ctx, id);
    }

    fn begin_shutdown(&mut self, ctx: &mut Context<'_>) {
        self.shutting_down = true;
        if let Some(token) = self.listener.take() {
            ctx.deregister(token);
        }
        let idle: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| matches!(s.stage, Stage::Init | Stage::UdpAssociate))
            .map(|s| s.id)
            .collect();
        for id in idle {
            if let Some(session) = self.sessions.get_mut(&id) {
                session.close(ctx, &mut self.env, None);
            }
            self.settle(ctx, id);
        }
        info!(sessions = self.sessions.len(), "tcp relay draining");
    }

    fn is_drained(&self) -> bool {
        self.sessions.is_empty()
    }
}

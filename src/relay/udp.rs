//! Connectionless UDP relay.
//!
//! Every client endpoint gets one session owning its remote sockets (one per
//! address family, bound on first use). Sessions live in an [`EvictingCache`]
//! keyed by client endpoint and are reclaimed once idle in both directions.

use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use mio::net::UdpSocket;
use rustc_hash::FxHashMap;
use tracing::{debug, info, trace};

use super::{Mode, RelaySettings};
use crate::cache::EvictingCache;
use crate::crypto::Cipher;
use crate::error::{Error, Result};
use crate::eventloop::{Context, EventLoop, Handler, HandlerRef, Interest, Ready, Token};
use crate::resolver::{DnsResolver, ResolveResult};
use crate::socks::{self, Address};
use crate::stats::Stats;

/// Largest datagram accepted on any socket.
const MAX_DATAGRAM: usize = 64 * 1024;

/// Datagrams allowed to wait on hostname resolution at once.
const MAX_PENDING_RESOLUTIONS: usize = 256;

type SessionId = u64;

struct UdpSession {
    client: SocketAddr,
    remote_v4: Option<Token>,
    remote_v6: Option<Token>,
}

impl UdpSession {
    fn tokens(&self) -> impl Iterator<Item = Token> {
        self.remote_v4.into_iter().chain(self.remote_v6)
    }
}

/// Forwards datagrams between clients and their destinations.
pub struct UdpRelay {
    settings: RelaySettings,
    cipher: Rc<dyn Cipher>,
    resolver: Rc<RefCell<DnsResolver>>,
    stats: Arc<Stats>,
    socket: Option<Token>,
    sessions: EvictingCache<SocketAddr, SessionId>,
    remotes: FxHashMap<SessionId, UdpSession>,
    by_token: FxHashMap<Token, SessionId>,
    pending_resolutions: usize,
    next_id: SessionId,
    this: Weak<RefCell<UdpRelay>>,
}

impl UdpRelay {
    pub fn new(
        settings: RelaySettings,
        cipher: Rc<dyn Cipher>,
        resolver: Rc<RefCell<DnsResolver>>,
        stats: Arc<Stats>,
    ) -> Rc<RefCell<Self>> {
        Rc::new_cyclic(|this| {
            RefCell::new(Self {
                sessions: EvictingCache::new(settings.timeout),
                settings,
                cipher,
                resolver,
                stats,
                socket: None,
                remotes: FxHashMap::default(),
                by_token: FxHashMap::default(),
                pending_resolutions: 0,
                next_id: 1,
                this: this.clone(),
            })
        })
    }

    /// Bind the client-facing socket on `addr` and register with the loop.
    pub fn add_to_loop(this: &Rc<RefCell<Self>>, event_loop: &mut EventLoop, addr: SocketAddr) -> Result<SocketAddr> {
        let socket = UdpSocket::bind(addr)?;
        let bound = socket.local_addr()?;
        let handler: HandlerRef = this.clone();
        let token = event_loop.register(socket, Interest::READABLE, handler.clone())?;
        event_loop.add_periodic(handler);
        this.borrow_mut().socket = Some(token);
        Ok(bound)
    }

    pub fn session_count(&self) -> usize {
        self.remotes.len()
    }

    fn handler(&self) -> Result<HandlerRef> {
        let relay: Rc<RefCell<UdpRelay>> = self
            .this
            .upgrade()
            .ok_or_else(|| Error::protocol("relay is gone"))?;
        Ok(relay)
    }

    fn on_client_packet(&mut self, ctx: &mut Context<'_>, client: SocketAddr, packet: &[u8]) -> Result<()> {
        let (dest, payload) = match self.settings.mode {
            Mode::Local => {
                let (frag, request) = socks::split_udp_request(packet)?;
                if frag != 0 {
                    debug!(%client, frag, "dropping fragmented datagram");
                    return Ok(());
                }
                if Address::parse(request)?.is_none() {
                    return Err(Error::protocol("truncated address header"));
                }
                let server = self
                    .settings
                    .server
                    .clone()
                    .ok_or_else(|| Error::config("no relay server configured"))?;
                (server, self.cipher.encrypt_packet(request)?)
            }
            Mode::Server => {
                let plain = self.cipher.decrypt_packet(packet)?;
                let Some((dest, len)) = Address::parse(&plain)? else {
                    return Err(Error::protocol("truncated address header"));
                };
                (dest, plain[len..].to_vec())
            }
        };

        let id = self.session_for(client);
        match dest {
            Address::Socket(addr) => self.send(ctx, id, addr, &payload),
            Address::Domain(host, port) => {
                let cached = self.resolver.borrow_mut().lookup_cached(&host);
                if let Some(ip) = cached.as_deref().and_then(<[_]>::first) {
                    return self.send(ctx, id, SocketAddr::new(*ip, port), &payload);
                }
                if self.pending_resolutions >= MAX_PENDING_RESOLUTIONS {
                    debug!(%client, %host, "too many pending resolutions, dropping datagram");
                    return Ok(());
                }
                self.pending_resolutions += 1;
                let relay = self.this.clone();
                self.resolver.borrow_mut().resolve(ctx, &host, move |ctx, result| {
                    if let Some(relay) = relay.upgrade() {
                        relay.borrow_mut().on_resolved(ctx, client, port, result, payload);
                    }
                });
                Ok(())
            }
        }
    }

    fn on_resolved(
        &mut self,
        ctx: &mut Context<'_>,
        client: SocketAddr,
        port: u16,
        result: ResolveResult,
        payload: Vec<u8>,
    ) {
        self.pending_resolutions = self.pending_resolutions.saturating_sub(1);
        let addrs = match result {
            Ok(addrs) => addrs,
            Err(e) => {
                debug!(%client, error = %e, "dropping datagram, resolution failed");
                return;
            }
        };
        let Some(ip) = addrs.first() else {
            return;
        };
        let id = self.session_for(client);
        if let Err(e) = self.send(ctx, id, SocketAddr::new(*ip, port), &payload) {
            debug!(%client, error = %e, "udp send failed");
            self.close_session(ctx, id, false);
        }
    }

    /// Existing session for `client`, or a fresh one; refreshes its idle timer.
    fn session_for(&mut self, client: SocketAddr) -> SessionId {
        if let Some(&id) = self.sessions.get(&client) {
            return id;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.sessions.set(client, id);
        self.remotes.insert(
            id,
            UdpSession {
                client,
                remote_v4: None,
                remote_v6: None,
            },
        );
        self.stats.record_udp_opened();
        debug!(session = id, %client, "udp session opened");
        id
    }

    fn send(&mut self, ctx: &mut Context<'_>, id: SessionId, dest: SocketAddr, payload: &[u8]) -> Result<()> {
        let handler = self.handler()?;
        let Some(session) = self.remotes.get_mut(&id) else {
            return Ok(());
        };
        let slot = if dest.is_ipv4() {
            &mut session.remote_v4
        } else {
            &mut session.remote_v6
        };
        let token = match *slot {
            Some(token) => token,
            None => {
                let socket = UdpSocket::bind(socks::unspecified_for(&dest))?;
                let token = ctx.register(socket, Interest::READABLE, handler)?;
                *slot = Some(token);
                self.by_token.insert(token, id);
                token
            }
        };
        let Some(socket) = ctx.datagram(token) else {
            return Ok(());
        };
        match socket.send_to(payload, dest) {
            Ok(n) => {
                self.stats.add_bytes_up(n);
                trace!(session = id, %dest, len = n, "datagram sent");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                debug!(session = id, %dest, "send buffer full, dropping datagram");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn recv_client(&mut self, ctx: &mut Context<'_>, token: Token) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut failed = false;
        loop {
            let Some(socket) = ctx.datagram(token) else {
                return;
            };
            let (len, client) = match socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // A pending socket error is reported once; datagrams queued
                // behind it are still readable.
                Err(e) if !failed => {
                    debug!(error = %e, "udp recv error");
                    failed = true;
                    continue;
                }
                Err(e) => {
                    debug!(error = %e, "udp recv keeps failing");
                    return;
                }
            };
            failed = false;
            if let Err(e) = self.on_client_packet(ctx, client, &buf[..len]) {
                debug!(%client, len, error = %e, "dropping client datagram");
            }
        }
    }

    fn recv_remote(&mut self, ctx: &mut Context<'_>, token: Token, id: SessionId) {
        let Some(client) = self.remotes.get(&id).map(|s| s.client) else {
            return;
        };
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let Some(socket) = ctx.datagram(token) else {
                return;
            };
            let (len, from) = match socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(session = id, %client, error = %e, "remote socket error");
                    self.close_session(ctx, id, false);
                    return;
                }
            };
            // Replies keep the session alive too.
            if !self.sessions.touch(&client) {
                trace!(session = id, %client, "reply for a session already swept");
            }
            self.stats.add_bytes_down(len);
            if let Err(e) = self.reply(ctx, client, from, &buf[..len]) {
                debug!(session = id, %from, error = %e, "dropping remote datagram");
            }
        }
    }

    fn reply(&self, ctx: &Context<'_>, client: SocketAddr, from: SocketAddr, data: &[u8]) -> Result<()> {
        let packet = match self.settings.mode {
            Mode::Local => socks::udp_response(&self.cipher.decrypt_packet(data)?),
            Mode::Server => {
                let mut plain = Address::Socket(from).to_bytes();
                plain.extend_from_slice(data);
                self.cipher.encrypt_packet(&plain)?
            }
        };
        let Some(socket) = self.socket.and_then(|t| ctx.datagram(t)) else {
            return Ok(());
        };
        match socket.send_to(&packet, client) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn close_session(&mut self, ctx: &mut Context<'_>, id: SessionId, evicted: bool) {
        let Some(session) = self.remotes.remove(&id) else {
            return;
        };
        for token in session.tokens() {
            ctx.deregister(token);
            self.by_token.remove(&token);
        }
        self.sessions.delete(&session.client);
        self.stats.record_udp_closed(evicted);
        debug!(session = id, client = %session.client, evicted, "udp session closed");
    }
}

impl Handler for UdpRelay {
    fn handle_event(&mut self, ctx: &mut Context<'_>, token: Token, ready: Ready) -> Result<()> {
        if !ready.is_readable() && !ready.is_error() {
            return Ok(());
        }
        if self.socket == Some(token) {
            self.recv_client(ctx, token);
        } else if let Some(&id) = self.by_token.get(&token) {
            self.recv_remote(ctx, token, id);
        }
        Ok(())
    }

    fn handle_periodic(&mut self, ctx: &mut Context<'_>) {
        let mut expired = Vec::new();
        self.sessions.sweep(|_, id| expired.push(*id));
        for id in expired {
            self.close_session(ctx, id, true);
        }
    }

    fn handle_unregistered(&mut self, ctx: &mut Context<'_>, token: Token, error: &Error) {
        if self.socket == Some(token) {
            info!(%error, "udp relay socket closed");
            self.socket = None;
            return;
        }
        if let Some(id) = self.by_token.remove(&token) {
            self.close_session(ctx, id, false);
        }
    }

    fn begin_shutdown(&mut self, ctx: &mut Context<'_>) {
        if let Some(token) = self.socket.take() {
            ctx.deregister(token);
        }
        let ids: Vec<SessionId> = self.remotes.keys().copied().collect();
        for id in ids {
            self.close_session(ctx, id, false);
        }
    }
}

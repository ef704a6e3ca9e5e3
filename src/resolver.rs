//! Non-blocking hostname resolution.
//!
//! One UDP query per hostname is in flight at a time; concurrent lookups for
//! the same name wait on it. Every callback runs from the loop's deferred
//! queue, never from inside [`DnsResolver::resolve`].

use std::cell::RefCell;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::UdpSocket;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::cache::EvictingCache;
use crate::dns::{DnsQuery, DnsResponse, QTYPE_A, QTYPE_AAAA, RCODE_NOERROR, RCODE_NXDOMAIN};
use crate::error::{Error, Result};
use crate::eventloop::{Context, EventLoop, Handler, HandlerRef, Interest, Ready, Token};
use crate::stats::Stats;

const MAX_DNS_PACKET_SIZE: usize = 4096;
const DNS_PORT: u16 = 53;
const FALLBACK_NAMESERVERS: [Ipv4Addr; 2] = [Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(8, 8, 4, 4)];

/// Why a lookup produced no addresses.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("invalid hostname {0:?}")]
    InvalidHostname(String),

    #[error("no address records")]
    NotFound,

    #[error("nameserver failure (rcode {0})")]
    ServerFailure(u8),

    #[error("lookup timed out")]
    Timeout,

    #[error("query could not be sent: {0}")]
    Io(String),
}

pub type ResolveResult = std::result::Result<Rc<[IpAddr]>, ResolveError>;

/// Receives the outcome of one [`DnsResolver::resolve`] call.
pub type ResolveCallback = Box<dyn FnOnce(&mut Context<'_>, ResolveResult)>;

/// Where queries go and which names never need one.
#[derive(Debug, Clone, Default)]
pub struct ResolverConfig {
    pub nameservers: Vec<SocketAddr>,
    pub hosts: FxHashMap<String, Vec<IpAddr>>,
}

impl ResolverConfig {
    /// Read `/etc/resolv.conf` and `/etc/hosts`.
    pub fn from_system() -> Self {
        Self::from_files(Path::new("/etc/resolv.conf"), Path::new("/etc/hosts"))
    }

    /// Missing or unreadable files yield the fallback nameservers and only
    /// `localhost` in the hosts table.
    pub fn from_files(resolv_conf: &Path, hosts: &Path) -> Self {
        let nameservers = std::fs::read_to_string(resolv_conf)
            .map(|text| parse_resolv_conf(&text))
            .unwrap_or_default();
        let hosts = std::fs::read_to_string(hosts)
            .map(|text| parse_hosts(&text))
            .unwrap_or_default();
        Self { nameservers, hosts }.with_defaults()
    }

    /// Fill in the fallback nameservers and `localhost` where missing.
    pub fn with_defaults(mut self) -> Self {
        if self.nameservers.is_empty() {
            self.nameservers = FALLBACK_NAMESERVERS
                .iter()
                .map(|ip| SocketAddr::new(IpAddr::V4(*ip), DNS_PORT))
                .collect();
        }
        self.hosts
            .entry("localhost".to_string())
            .or_insert_with(|| vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]);
        self
    }
}

/// `nameserver` lines with literal addresses, in file order.
pub fn parse_resolv_conf(text: &str) -> Vec<SocketAddr> {
    text.lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            if parts.next()? != "nameserver" {
                return None;
            }
            let ip: IpAddr = parts.next()?.parse().ok()?;
            Some(SocketAddr::new(ip, DNS_PORT))
        })
        .collect()
}

/// `address name [alias...]` lines; `#` starts a comment.
pub fn parse_hosts(text: &str) -> FxHashMap<String, Vec<IpAddr>> {
    let mut hosts: FxHashMap<String, Vec<IpAddr>> = FxHashMap::default();
    for line in text.lines() {
        let line = line.split('#').next().unwrap_or_default();
        let mut parts = line.split_whitespace();
        let Some(Ok(ip)) = parts.next().map(str::parse::<IpAddr>) else {
            continue;
        };
        for name in parts {
            let addrs = hosts.entry(normalize(name)).or_default();
            if !addrs.contains(&ip) {
                addrs.push(ip);
            }
        }
    }
    hosts
}

fn normalize(hostname: &str) -> String {
    hostname.trim_end_matches('.').to_ascii_lowercase()
}

/// Whether `hostname` is at most 253 bytes of 1..=63 byte labels made of
/// letters, digits, `-` and `_`, no label starting or ending with `-`.
pub fn is_valid_hostname(hostname: &str) -> bool {
    if hostname.is_empty() || hostname.len() > 253 {
        return false;
    }
    hostname.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    })
}

struct PendingLookup {
    id: u16,
    qtype: u16,
    started: Instant,
    callbacks: Vec<ResolveCallback>,
}

/// Asynchronous resolver driven by the event loop.
pub struct DnsResolver {
    config: ResolverConfig,
    cache: EvictingCache<String, Rc<[IpAddr]>>,
    pending: FxHashMap<String, PendingLookup>,
    by_id: FxHashMap<u16, String>,
    socket_v4: Option<Token>,
    socket_v6: Option<Token>,
    resolve_timeout: Duration,
    stats: Arc<Stats>,
}

impl DnsResolver {
    pub fn new(
        config: ResolverConfig,
        cache_timeout: Duration,
        resolve_timeout: Duration,
        stats: Arc<Stats>,
    ) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            config: config.with_defaults(),
            cache: EvictingCache::new(cache_timeout),
            pending: FxHashMap::default(),
            by_id: FxHashMap::default(),
            socket_v4: None,
            socket_v6: None,
            resolve_timeout,
            stats,
        }))
    }

    /// Bind the query sockets and register for responses and periodic sweeps.
    pub fn add_to_loop(this: &Rc<RefCell<Self>>, event_loop: &mut EventLoop) -> Result<()> {
        let handler: HandlerRef = this.clone();
        let mut resolver = this.borrow_mut();

        let needs_v4 = resolver.config.nameservers.iter().any(SocketAddr::is_ipv4);
        let needs_v6 = resolver.config.nameservers.iter().any(SocketAddr::is_ipv6);
        if needs_v4 {
            let socket = UdpSocket::bind(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0))?;
            resolver.socket_v4 = Some(event_loop.register(socket, Interest::READABLE, handler.clone())?);
        }
        if needs_v6 {
            let socket = UdpSocket::bind(SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0))?;
            resolver.socket_v6 = Some(event_loop.register(socket, Interest::READABLE, handler.clone())?);
        }
        event_loop.add_periodic(handler);

        debug!(nameservers = ?resolver.config.nameservers, "resolver ready");
        Ok(())
    }

    pub fn nameservers(&self) -> &[SocketAddr] {
        &self.config.nameservers
    }

    /// Cached addresses for `hostname`; `None` means "not cached", not failure.
    pub fn lookup_cached(&mut self, hostname: &str) -> Option<Rc<[IpAddr]>> {
        self.cache.get(&normalize(hostname)).cloned()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Resolve `hostname`, calling `callback` exactly once from a later loop
    /// iteration.
    pub fn resolve(
        &mut self,
        ctx: &mut Context<'_>,
        hostname: &str,
        callback: impl FnOnce(&mut Context<'_>, ResolveResult) + 'static,
    ) {
        let callback: ResolveCallback = Box::new(callback);
        let hostname = normalize(hostname);

        if let Ok(ip) = hostname.parse::<IpAddr>() {
            return defer_result(ctx, callback, Ok(Rc::from([ip])));
        }
        if !is_valid_hostname(&hostname) {
            self.stats.record_dns_failure();
            return defer_result(ctx, callback, Err(ResolveError::InvalidHostname(hostname)));
        }
        if let Some(addrs) = self.config.hosts.get(&hostname) {
            return defer_result(ctx, callback, Ok(Rc::from(addrs.as_slice())));
        }
        if let Some(addrs) = self.cache.get(&hostname) {
            self.stats.record_dns_cache_hit();
            return defer_result(ctx, callback, Ok(addrs.clone()));
        }
        if let Some(lookup) = self.pending.get_mut(&hostname) {
            trace!(%hostname, waiting = lookup.callbacks.len() + 1, "joined pending lookup");
            lookup.callbacks.push(callback);
            return;
        }

        self.pending.insert(
            hostname.clone(),
            PendingLookup {
                id: 0,
                qtype: QTYPE_A,
                started: ctx.now(),
                callbacks: vec![callback],
            },
        );
        if let Err(e) = self.send_query(ctx, &hostname, QTYPE_A) {
            self.finish(ctx, &hostname, Err(ResolveError::Io(e.to_string())));
        }
    }

    fn send_query(&mut self, ctx: &mut Context<'_>, hostname: &str, qtype: u16) -> io::Result<()> {
        let id = self.allocate_id();
        let Some(lookup) = self.pending.get_mut(hostname) else {
            return Ok(());
        };
        self.by_id.remove(&lookup.id);
        lookup.id = id;
        lookup.qtype = qtype;
        self.by_id.insert(id, hostname.to_string());

        let packet = DnsQuery::new(id, hostname, qtype).to_bytes();
        let mut sent = 0;
        let mut last_error = None;
        for server in &self.config.nameservers {
            let token = if server.is_ipv4() { self.socket_v4 } else { self.socket_v6 };
            let Some(socket) = token.and_then(|t| ctx.datagram(t)) else {
                continue;
            };
            match socket.send_to(&packet, *server) {
                Ok(_) => sent += 1,
                Err(e) => {
                    debug!(%server, error = %e, "dns send failed");
                    last_error = Some(e);
                }
            }
        }
        if sent == 0 {
            return Err(last_error.unwrap_or_else(|| io::Error::other("no usable nameserver")));
        }

        self.stats.record_dns_query();
        trace!(%hostname, id, qtype, sent, "dns query sent");
        Ok(())
    }

    fn allocate_id(&self) -> u16 {
        loop {
            let id = rand::random::<u16>();
            if !self.by_id.contains_key(&id) {
                return id;
            }
        }
    }

    fn handle_response(&mut self, ctx: &mut Context<'_>, response: DnsResponse) {
        let Some(hostname) = self.by_id.get(&response.id).cloned() else {
            return;
        };
        let Some(qtype) = self.pending.get(&hostname).map(|lookup| lookup.qtype) else {
            return;
        };
        let matches = response.is_response()
            && response
                .questions
                .iter()
                .any(|q| q.domain == hostname && q.qtype == qtype);
        if !matches {
            trace!(id = response.id, "dns response for a different question");
            return;
        }

        let addrs = response.addresses();
        if !addrs.is_empty() {
            let addrs: Rc<[IpAddr]> = addrs.into();
            self.cache.set(hostname.clone(), addrs.clone());
            self.finish(ctx, &hostname, Ok(addrs));
            return;
        }

        let rcode = response.rcode();
        if qtype == QTYPE_A && (rcode == RCODE_NOERROR || rcode == RCODE_NXDOMAIN) {
            if let Err(e) = self.send_query(ctx, &hostname, QTYPE_AAAA) {
                self.finish(ctx, &hostname, Err(ResolveError::Io(e.to_string())));
            }
            return;
        }

        let error = match rcode {
            RCODE_NOERROR | RCODE_NXDOMAIN => ResolveError::NotFound,
            other => ResolveError::ServerFailure(other),
        };
        self.finish(ctx, &hostname, Err(error));
    }

    /// Deliver `result` to every waiter on `hostname`.
    fn finish(&mut self, ctx: &mut Context<'_>, hostname: &str, result: ResolveResult) {
        let Some(lookup) = self.pending.remove(hostname) else {
            return;
        };
        self.by_id.remove(&lookup.id);

        match &result {
            Ok(addrs) => debug!(%hostname, ?addrs, waiters = lookup.callbacks.len(), "resolved"),
            Err(e) => {
                self.stats.record_dns_failure();
                debug!(%hostname, error = %e, "resolve failed");
            }
        }
        for callback in lookup.callbacks {
            defer_result(ctx, callback, result.clone());
        }
    }
}

fn defer_result(ctx: &mut Context<'_>, callback: ResolveCallback, result: ResolveResult) {
    ctx.defer(move |ctx| callback(ctx, result));
}

impl Handler for DnsResolver {
    fn handle_event(&mut self, ctx: &mut Context<'_>, token: Token, ready: Ready) -> Result<()> {
        if !ready.is_readable() {
            return Ok(());
        }
        let mut buf = [0u8; MAX_DNS_PACKET_SIZE];
        let mut failed = false;
        loop {
            let Some(socket) = ctx.datagram(token) else {
                return Ok(());
            };
            let (len, from) = match socket.recv_from(&mut buf) {
                Ok(r) => r,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // ICMP unreachable from one nameserver surfaces here, once.
                Err(e) if !failed => {
                    debug!(error = %e, "dns recv error");
                    failed = true;
                    continue;
                }
                Err(e) => {
                    debug!(error = %e, "dns recv keeps failing");
                    return Ok(());
                }
            };
            failed = false;
            if !self.config.nameservers.contains(&from) {
                trace!(%from, "dns response from unknown server");
                continue;
            }
            match DnsResponse::parse(&buf[..len]) {
                Some(response) => self.handle_response(ctx, response),
                None => debug!(%from, len, "malformed dns response"),
            }
        }
    }

    fn handle_periodic(&mut self, ctx: &mut Context<'_>) {
        self.cache.sweep(|_, _| {});

        let now = ctx.now();
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, lookup)| now.saturating_duration_since(lookup.started) >= self.resolve_timeout)
            .map(|(hostname, _)| hostname.clone())
            .collect();
        for hostname in expired {
            self.finish(ctx, &hostname, Err(ResolveError::Timeout));
        }
    }

    fn handle_unregistered(&mut self, _ctx: &mut Context<'_>, token: Token, error: &Error) {
        warn!(token = token.0, %error, "resolver socket closed");
        if self.socket_v4 == Some(token) {
            self.socket_v4 = None;
        }
        if self.socket_v6 == Some(token) {
            self.socket_v6 = None;
        }
    }
}

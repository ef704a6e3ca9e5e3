//! Relay orchestration.
//!
//! Binds the relays described by a [`Config`] onto one event loop and runs
//! it on the calling thread.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;

use tracing::info;

use crate::config::Config;
use crate::crypto::Cipher;
use crate::error::Result;
use crate::eventloop::{self, EventLoop, StopHandle};
use crate::relay::{TcpRelay, UdpRelay};
use crate::resolver::DnsResolver;
use crate::stats::{Stats, StatsReporter};

/// A bound, not yet running relay.
pub struct Proxy {
    event_loop: EventLoop,
    tcp_addr: SocketAddr,
    udp_addr: Option<SocketAddr>,
    stats: Arc<Stats>,
}

impl Proxy {
    /// Validate `config`, bind every socket and register the handlers.
    pub fn bind(config: &Config, stats: Arc<Stats>) -> Result<Self> {
        config.validate()?;

        let poller = eventloop::from_hint(&config.poller)?;
        let mut event_loop = EventLoop::with_poller(poller, config.sweep_interval)?;
        event_loop.set_shutdown_grace(config.shutdown_grace);

        let resolver = DnsResolver::new(
            config.resolver_config()?,
            config.dns_cache_timeout,
            config.resolve_timeout,
            stats.clone(),
        );
        DnsResolver::add_to_loop(&resolver, &mut event_loop)?;

        let cipher: Rc<dyn Cipher> = Rc::from(config.method.cipher(&config.password));
        let settings = config.relay_settings();
        let listen = config.listen_addr()?;

        let tcp = TcpRelay::new(settings.clone(), cipher.clone(), resolver.clone(), stats.clone());
        let tcp_addr = TcpRelay::add_to_loop(&tcp, &mut event_loop, listen)?;

        // UDP shares the TCP port so SOCKS5 clients find it where they expect.
        let udp_addr = if config.udp {
            let udp: Rc<RefCell<UdpRelay>> = UdpRelay::new(settings, cipher, resolver, stats.clone());
            Some(UdpRelay::add_to_loop(&udp, &mut event_loop, tcp_addr)?)
        } else {
            None
        };
        tcp.borrow_mut().set_udp_associate(udp_addr);

        event_loop.add_periodic(Rc::new(RefCell::new(StatsReporter::new(
            stats.clone(),
            config.stats_interval,
        ))));

        info!(
            mode = %config.mode,
            tcp = %tcp_addr,
            udp = ?udp_addr,
            method = %config.method,
            poller = event_loop.backend(),
            "relay listening"
        );
        Ok(Self {
            event_loop,
            tcp_addr,
            udp_addr,
            stats,
        })
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        self.tcp_addr
    }

    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.udp_addr
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.event_loop.stop_handle()
    }

    pub fn stats(&self) -> Arc<Stats> {
        self.stats.clone()
    }

    /// Run until stopped or shut down. Only a loop fault is an error.
    pub fn run(mut self) -> Result<()> {
        self.event_loop.run()?;
        info!("relay stopped");
        Ok(())
    }
}

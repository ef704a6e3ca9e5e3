//! Sockets owned by the event loop.

use std::io;
use std::net::SocketAddr;

use mio::event;
use mio::net::{TcpListener, TcpStream, UdpSocket};
use mio::{Interest, Registry, Token};

/// A non-blocking socket registered with the loop.
///
/// The loop owns every source; handlers borrow them through
/// [`Context`](super::Context). Dropping a source closes it.
#[derive(Debug)]
pub enum Source {
    Listener(TcpListener),
    Stream(TcpStream),
    Datagram(UdpSocket),
}

impl Source {
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Source::Listener(l) => l.local_addr(),
            Source::Stream(s) => s.local_addr(),
            Source::Datagram(d) => d.local_addr(),
        }
    }

    pub fn as_listener(&self) -> Option<&TcpListener> {
        match self {
            Source::Listener(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_stream(&self) -> Option<&TcpStream> {
        match self {
            Source::Stream(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_datagram(&self) -> Option<&UdpSocket> {
        match self {
            Source::Datagram(d) => Some(d),
            _ => None,
        }
    }
}

impl From<TcpListener> for Source {
    fn from(listener: TcpListener) -> Self {
        Source::Listener(listener)
    }
}

impl From<TcpStream> for Source {
    fn from(stream: TcpStream) -> Self {
        Source::Stream(stream)
    }
}

impl From<UdpSocket> for Source {
    fn from(socket: UdpSocket) -> Self {
        Source::Datagram(socket)
    }
}

impl event::Source for Source {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            Source::Listener(l) => l.register(registry, token, interests),
            Source::Stream(s) => s.register(registry, token, interests),
            Source::Datagram(d) => d.register(registry, token, interests),
        }
    }

    fn reregister(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            Source::Listener(l) => l.reregister(registry, token, interests),
            Source::Stream(s) => s.reregister(registry, token, interests),
            Source::Datagram(d) => d.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Source::Listener(l) => l.deregister(registry),
            Source::Stream(s) => s.deregister(registry),
            Source::Datagram(d) => d.deregister(registry),
        }
    }
}

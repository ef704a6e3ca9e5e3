//! SOCKS5 handshake and address header codec.
//!
//! Parsers take whatever bytes have arrived so far and return `Ok(None)` when
//! more are needed, so callers can accumulate partial reads.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use crate::error::{Error, Result};

pub const VERSION: u8 = 0x05;

pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

pub const REPLY_SUCCEEDED: u8 = 0x00;
pub const REPLY_GENERAL_FAILURE: u8 = 0x01;
pub const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;

/// Destination of a relayed connection or datagram.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Socket(SocketAddr),
    Domain(String, u16),
}

impl Address {
    /// Parse `ATYP ADDR PORT` from the front of `buf`.
    ///
    /// Returns the address and the number of bytes it occupied.
    pub fn parse(buf: &[u8]) -> Result<Option<(Address, usize)>> {
        let Some(&atyp) = buf.first() else {
            return Ok(None);
        };
        match atyp {
            ATYP_IPV4 => {
                if buf.len() < 7 {
                    return Ok(None);
                }
                let ip = Ipv4Addr::new(buf[1], buf[2], buf[3], buf[4]);
                let port = u16::from_be_bytes([buf[5], buf[6]]);
                Ok(Some((Address::Socket(SocketAddrV4::new(ip, port).into()), 7)))
            }
            ATYP_IPV6 => {
                if buf.len() < 19 {
                    return Ok(None);
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[1..17]);
                let port = u16::from_be_bytes([buf[17], buf[18]]);
                let addr = SocketAddrV6::new(Ipv6Addr::from(octets), port, 0, 0);
                Ok(Some((Address::Socket(addr.into()), 19)))
            }
            ATYP_DOMAIN => {
                let Some(&len) = buf.get(1) else {
                    return Ok(None);
                };
                let len = len as usize;
                if len == 0 {
                    return Err(Error::protocol("empty domain in address header"));
                }
                let end = 2 + len + 2;
                if buf.len() < end {
                    return Ok(None);
                }
                let host = std::str::from_utf8(&buf[2..2 + len])
                    .map_err(|_| Error::protocol("domain is not valid UTF-8"))?;
                let port = u16::from_be_bytes([buf[2 + len], buf[3 + len]]);
                Ok(Some((Address::Domain(host.to_string(), port), end)))
            }
            other => Err(Error::protocol(format!("unsupported address type {other}"))),
        }
    }

    /// Append the wire form to `out`.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        match self {
            Address::Socket(SocketAddr::V4(v4)) => {
                out.push(ATYP_IPV4);
                out.extend_from_slice(&v4.ip().octets());
                out.extend_from_slice(&v4.port().to_be_bytes());
            }
            Address::Socket(SocketAddr::V6(v6)) => {
                out.push(ATYP_IPV6);
                out.extend_from_slice(&v6.ip().octets());
                out.extend_from_slice(&v6.port().to_be_bytes());
            }
            Address::Domain(host, port) => {
                out.push(ATYP_DOMAIN);
                out.push(host.len().min(255) as u8);
                out.extend_from_slice(&host.as_bytes()[..host.len().min(255)]);
                out.extend_from_slice(&port.to_be_bytes());
            }
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.serialized_len());
        self.write_to(&mut out);
        out
    }

    pub fn serialized_len(&self) -> usize {
        match self {
            Address::Socket(SocketAddr::V4(_)) => 7,
            Address::Socket(SocketAddr::V6(_)) => 19,
            Address::Domain(host, _) => 4 + host.len().min(255),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Address::Socket(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }

    /// Host part, suitable for the resolver.
    pub fn host(&self) -> String {
        match self {
            Address::Socket(addr) => addr.ip().to_string(),
            Address::Domain(host, _) => host.clone(),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::Socket(addr)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Socket(addr) => write!(f, "{addr}"),
            Address::Domain(host, port) => write!(f, "{host}:{port}"),
        }
    }
}

/// Parse `VER NMETHODS METHODS...`.
///
/// Returns whether "no authentication" is offered and the greeting length.
pub fn parse_greeting(buf: &[u8]) -> Result<Option<(bool, usize)>> {
    if buf.len() < 2 {
        return Ok(None);
    }
    if buf[0] != VERSION {
        return Err(Error::protocol(format!("unsupported SOCKS version {}", buf[0])));
    }
    let end = 2 + buf[1] as usize;
    if buf.len() < end {
        return Ok(None);
    }
    Ok(Some((buf[2..end].contains(&METHOD_NO_AUTH), end)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Bind,
    UdpAssociate,
    Other(u8),
}

impl From<u8> for Command {
    fn from(value: u8) -> Self {
        match value {
            0x01 => Command::Connect,
            0x02 => Command::Bind,
            0x03 => Command::UdpAssociate,
            other => Command::Other(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: Command,
    pub address: Address,
}

/// Parse `VER CMD RSV ATYP ADDR PORT`; returns the request and its length.
pub fn parse_request(buf: &[u8]) -> Result<Option<(Request, usize)>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    if buf[0] != VERSION {
        return Err(Error::protocol(format!("unsupported SOCKS version {}", buf[0])));
    }
    let command = Command::from(buf[1]);
    Ok(Address::parse(&buf[3..])?.map(|(address, len)| (Request { command, address }, 3 + len)))
}

/// `VER REP RSV ATYP BND.ADDR BND.PORT`
pub fn reply(rep: u8, bound: SocketAddr) -> Vec<u8> {
    let mut out = vec![VERSION, rep, 0x00];
    Address::Socket(bound).write_to(&mut out);
    out
}

/// Reply sent for CONNECT before the remote side is known to be reachable.
pub fn connect_reply() -> Vec<u8> {
    reply(REPLY_SUCCEEDED, SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0))
}

/// Strip `RSV(2) FRAG(1)` from a client UDP request.
///
/// Returns the fragment number and the `ATYP ADDR PORT DATA` remainder.
pub fn split_udp_request(packet: &[u8]) -> Result<(u8, &[u8])> {
    if packet.len() < 4 {
        return Err(Error::protocol("short SOCKS5 UDP request"));
    }
    Ok((packet[2], &packet[3..]))
}

/// Prefix `RSV(2) FRAG(1)` to an `ATYP ADDR PORT DATA` payload.
pub fn udp_response(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 3);
    out.extend_from_slice(&[0x00, 0x00, 0x00]);
    out.extend_from_slice(payload);
    out
}

/// Unspecified address of the same family as `addr`.
pub fn unspecified_for(addr: &SocketAddr) -> SocketAddr {
    let ip: IpAddr = match addr {
        SocketAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
        SocketAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
    };
    SocketAddr::new(ip, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_address_type() {
        let (addr, len) = Address::parse(&[1, 127, 0, 0, 1, 0x1F, 0x90, 0xAA]).unwrap().unwrap();
        assert_eq!(addr, Address::Socket("127.0.0.1:8080".parse().unwrap()));
        assert_eq!(len, 7);

        let mut v6 = vec![4];
        v6.extend_from_slice(&"::1".parse::<Ipv6Addr>().unwrap().octets());
        v6.extend_from_slice(&443u16.to_be_bytes());
        let (addr, len) = Address::parse(&v6).unwrap().unwrap();
        assert_eq!(addr, Address::Socket("[::1]:443".parse().unwrap()));
        assert_eq!(len, 19);

        let (addr, len) = Address::parse(b"\x03\x0bexample.com\x00\x50").unwrap().unwrap();
        assert_eq!(addr, Address::Domain("example.com".into(), 80));
        assert_eq!(len, 15);
        assert_eq!(addr.to_bytes(), b"\x03\x0bexample.com\x00\x50");
    }

    #[test]
    fn partial_address_needs_more_bytes() {
        assert!(Address::parse(&[]).unwrap().is_none());
        assert!(Address::parse(&[1, 127, 0]).unwrap().is_none());
        assert!(Address::parse(b"\x03\x0bexample").unwrap().is_none());
    }

    #[test]
    fn rejects_unknown_address_type() {
        let err = Address::parse(&[9, 1, 2, 3]).unwrap_err();

        assert_eq!(err.to_string(), "protocol error: unsupported address type 9");
        assert!(Address::parse(&[3, 0, 0, 80]).is_err());
    }

    #[test]
    fn greeting_detects_no_auth() {
        assert_eq!(parse_greeting(&[5, 1, 0]).unwrap(), Some((true, 3)));
        assert_eq!(parse_greeting(&[5, 2, 1, 2]).unwrap(), Some((false, 4)));
        assert_eq!(parse_greeting(&[5, 2, 1]).unwrap(), None);
        assert!(parse_greeting(&[4, 1, 0]).is_err());
    }

    #[test]
    fn request_parses_command_and_target() {
        let (req, len) = parse_request(b"\x05\x01\x00\x03\x0bexample.com\x00\x50rest")
            .unwrap()
            .unwrap();

        assert_eq!(req.command, Command::Connect);
        assert_eq!(req.address, Address::Domain("example.com".into(), 80));
        assert_eq!(len, 18);

        let (req, _) = parse_request(&[5, 9, 0, 1, 1, 2, 3, 4, 0, 1]).unwrap().unwrap();
        assert_eq!(req.command, Command::Other(9));
    }

    #[test]
    fn connect_reply_is_zero_bound() {
        assert_eq!(connect_reply(), vec![5, 0, 0, 1, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn udp_request_framing() {
        let (frag, rest) = split_udp_request(&[0, 0, 0, 1, 8, 8, 8, 8, 0, 53, 0xAB]).unwrap();
        assert_eq!(frag, 0);
        assert_eq!(rest, &[1, 8, 8, 8, 8, 0, 53, 0xAB]);

        assert_eq!(udp_response(&[1, 2]), vec![0, 0, 0, 1, 2]);
        assert!(split_udp_request(&[0, 0]).is_err());
    }
}

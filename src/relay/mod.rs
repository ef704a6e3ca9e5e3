//! TCP and UDP relays.
//!
//! Both run in one of two modes. A local relay speaks SOCKS5 to clients and
//! forwards encrypted traffic to the configured relay server; a server relay
//! decrypts that traffic and talks to the real destinations.

pub mod tcp;
pub mod udp;

pub use tcp::{Stage, TcpRelay};
pub use udp::UdpRelay;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::socks::Address;

/// Read size per socket read; also the most a paused direction buffers.
pub const BUF_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Local,
    Server,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Local => f.write_str("local"),
            Mode::Server => f.write_str("server"),
        }
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" | "client" => Ok(Mode::Local),
            "server" => Ok(Mode::Server),
            other => Err(format!("unknown mode {other:?}")),
        }
    }
}

/// Settings shared by both relays.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub mode: Mode,
    /// Relay server to forward to; required in local mode.
    pub server: Option<Address>,
    /// Idle timeout for sessions.
    pub timeout: Duration,
    pub connect_timeout: Duration,
}

//! Relay configuration, loaded from a JSON file and overridden from the CLI.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::crypto::Method;
use crate::error::{Error, Result};
use crate::eventloop;
use crate::relay::{Mode, RelaySettings};
use crate::resolver::ResolverConfig;
use crate::socks::Address;

const DNS_PORT: u16 = 53;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mode: Mode,
    /// Relay server host; in server mode, the listen address.
    pub server: Option<String>,
    pub server_port: u16,
    pub local_address: String,
    pub local_port: u16,
    pub password: String,
    pub method: Method,
    /// Idle timeout for TCP and UDP sessions.
    #[serde(with = "secs")]
    pub timeout: Duration,
    #[serde(with = "secs")]
    pub connect_timeout: Duration,
    #[serde(with = "secs")]
    pub resolve_timeout: Duration,
    #[serde(with = "secs")]
    pub dns_cache_timeout: Duration,
    /// Period of cache sweeps and timeout scans.
    #[serde(with = "secs")]
    pub sweep_interval: Duration,
    #[serde(with = "secs")]
    pub shutdown_grace: Duration,
    #[serde(with = "secs")]
    pub stats_interval: Duration,
    /// Nameservers as `ip` or `ip:port`; the system's when unset.
    pub dns_server: Option<Vec<String>>,
    /// Static host entries, checked before any lookup.
    pub hosts: HashMap<String, IpAddr>,
    pub poller: String,
    pub udp: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Local,
            server: None,
            server_port: 8388,
            local_address: "127.0.0.1".to_string(),
            local_port: 1080,
            password: String::new(),
            method: Method::default(),
            timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            resolve_timeout: Duration::from_secs(10),
            dns_cache_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(5),
            stats_interval: Duration::from_secs(60),
            dns_server: None,
            hosts: HashMap::new(),
            poller: "auto".to_string(),
            udp: true,
        }
    }
}

impl Config {
    /// Read a JSON config file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {e}", path.display())))?;
        let config: Config = serde_json::from_str(&text)
            .map_err(|e| Error::config(format!("invalid config {}: {e}", path.display())))?;
        debug!(path = %path.display(), mode = %config.mode, "config loaded");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.method.is_encrypting() && self.password.is_empty() {
            return Err(Error::config(format!("method {} needs a password", self.method)));
        }
        if self.mode == Mode::Local && self.server.as_deref().is_none_or(str::is_empty) {
            return Err(Error::config("local mode needs a relay server"));
        }
        for (name, value) in [
            ("timeout", self.timeout),
            ("connect_timeout", self.connect_timeout),
            ("resolve_timeout", self.resolve_timeout),
            ("dns_cache_timeout", self.dns_cache_timeout),
            ("sweep_interval", self.sweep_interval),
            ("stats_interval", self.stats_interval),
        ] {
            if value.is_zero() {
                return Err(Error::config(format!("{name} must be positive")));
            }
        }
        eventloop::from_hint(&self.poller).map(drop)?;
        self.listen_addr()?;
        self.nameservers()?;
        Ok(())
    }

    /// Where the relay listens for clients.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let (host, port) = match self.mode {
            Mode::Local => (self.local_address.as_str(), self.local_port),
            Mode::Server => (self.server.as_deref().unwrap_or("0.0.0.0"), self.server_port),
        };
        let ip: IpAddr = host
            .trim_matches(|c| c == '[' || c == ']')
            .parse()
            .map_err(|_| Error::config(format!("listen address {host:?} is not an IP literal")))?;
        Ok(SocketAddr::new(ip, port))
    }

    /// Relay server as a SOCKS address; hostnames are resolved per session.
    pub fn server_address(&self) -> Option<Address> {
        let host = self.server.as_deref().filter(|s| !s.is_empty())?;
        Some(match host.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>() {
            Ok(ip) => Address::Socket(SocketAddr::new(ip, self.server_port)),
            Err(_) => Address::Domain(host.to_string(), self.server_port),
        })
    }

    pub fn relay_settings(&self) -> RelaySettings {
        RelaySettings {
            mode: self.mode,
            server: match self.mode {
                Mode::Local => self.server_address(),
                Mode::Server => None,
            },
            timeout: self.timeout,
            connect_timeout: self.connect_timeout,
        }
    }

    /// Nameservers from `dns_server`, or the system's; `hosts` entries win
    /// over `/etc/hosts`.
    pub fn resolver_config(&self) -> Result<ResolverConfig> {
        let mut config = match self.nameservers()? {
            Some(nameservers) => ResolverConfig {
                nameservers,
                ..ResolverConfig::from_system()
            },
            None => ResolverConfig::from_system(),
        };
        for (host, ip) in &self.hosts {
            config.hosts.insert(host.to_ascii_lowercase(), vec![*ip]);
        }
        Ok(config)
    }

    fn nameservers(&self) -> Result<Option<Vec<SocketAddr>>> {
        let Some(servers) = &self.dns_server else {
            return Ok(None);
        };
        servers
            .iter()
            .map(|s| {
                s.parse::<SocketAddr>()
                    .or_else(|_| s.parse::<IpAddr>().map(|ip| SocketAddr::new(ip, DNS_PORT)))
                    .map_err(|_| Error::config(format!("invalid dns_server entry {s:?}")))
            })
            .collect::<Result<Vec<_>>>()
            .map(Some)
    }
}

/// Durations as (fractional) seconds.
mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

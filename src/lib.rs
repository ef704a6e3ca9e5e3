//! ssrelay - an encrypting SOCKS5 TCP/UDP relay.
//!
//! A local relay accepts SOCKS5 clients and forwards their traffic,
//! encrypted, to a relay server; the server relay decrypts it and talks to
//! the real destinations. Both run on one single-threaded event loop.

pub mod cache;
pub mod config;
pub mod crypto;
pub mod dns;
pub mod error;
pub mod eventloop;
pub mod proxy;
pub mod relay;
pub mod resolver;
pub mod socks;
pub mod stats;

pub use config::Config;
pub use error::{Error, Result};
pub use proxy::Proxy;
pub use stats::Stats;

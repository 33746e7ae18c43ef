//! The config for the exchange server.
//!
//! The server needs exactly one piece of configuration: the TCP port to
//! listen on, supplied with `-p <port>` (or the `BOURSE_PORT` environment
//! variable, see the binary).

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// The string key used to check the environment variable for the listen
/// port.
pub const LISTEN_PORT: &str = "BOURSE_PORT";

/// The config for the exchange server.
#[derive(Debug, Clone)]
pub struct Config {
    listen_address: SocketAddr,
}

impl Config {
    /// Build a config listening on all interfaces at the given port.
    pub fn from_port(port: u16) -> Self {
        Self {
            listen_address: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)),
        }
    }

    /// Get the address to bind the listen socket to.
    pub fn listen_address(&self) -> SocketAddr {
        self.listen_address
    }
}

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::bail;

/// The common UDP port for both the client and the server role
pub const WELL_KNOWN_PORT: u16 = 56001;

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Upper bound for waiting on the reply to a request. There is no retry, so an expired
    ///  timeout is terminal for the call.
    pub request_timeout: Duration,

    /// Size of the client's receive buffer. Replies that are bigger are truncated without any
    ///  error being signalled at the transport level - for encrypted replies, this shows up as
    ///  a decryption error.
    pub max_reply_size: usize,

    /// Size of the server's receive buffer, i.e. the maximum request size
    pub max_datagram_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            request_timeout: Duration::from_secs(3),
            max_reply_size: 1024,
            max_datagram_size: 65_507,
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.request_timeout.is_zero() {
            bail!("request timeout must be greater than zero");
        }
        if self.max_reply_size < 16 {
            bail!("reply buffer of {} bytes is too small", self.max_reply_size);
        }
        if self.max_datagram_size < self.max_reply_size {
            bail!("server receive buffer ({} bytes) must not be smaller than the reply buffer ({} bytes)", self.max_datagram_size, self.max_reply_size);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// The address that the listening UDP socket is bound to
    pub bind_addr: SocketAddr,
    pub transport: TransportConfig,
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> ServerConfig {
        ServerConfig {
            bind_addr,
            transport: TransportConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(SocketAddr::from((Ipv4Addr::UNSPECIFIED, WELL_KNOWN_PORT)))
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// appended to targets that are given without a port
    pub port: u16,
    pub transport: TransportConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            port: WELL_KNOWN_PORT,
            transport: TransportConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProberConfig {
    /// pause between two complete probing rounds
    pub interval: Duration,
    /// the port that peers' addresses are pinged on
    pub port: u16,
    pub transport: TransportConfig,
}

impl Default for ProberConfig {
    fn default() -> Self {
        ProberConfig {
            interval: Duration::from_secs(5),
            port: WELL_KNOWN_PORT,
            transport: TransportConfig::default(),
        }
    }
}

impl ProberConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.interval.is_zero() {
            bail!("probing interval must be greater than zero");
        }
        self.transport.validate()
    }
}

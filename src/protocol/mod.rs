//! Proxy transport abstraction and the SOCKS5 implementation
//!
//! The relay and the connectivity checker only talk to a
//! [`ProxyTransport`]: it opens the authenticated control channel, dials
//! per-flow streams and opens per-flow packet sessions. [`socks5`] is the
//! transport shipped with the library.

use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};

pub mod socks5;
pub mod socks5_udp;

pub use socks5::Socks5Transport;
pub use socks5_udp::Socks5UdpSession;

// Protocol constants
pub mod constants {
    pub const SOCKS5_VERSION: u8 = 0x05;
    pub const AUTH_PASSWORD_VERSION: u8 = 0x01;

    pub const AUTH_METHOD_NONE: u8 = 0x00;
    pub const AUTH_METHOD_PASSWORD: u8 = 0x02;
    pub const AUTH_METHOD_NO_ACCEPTABLE: u8 = 0xFF;

    pub const CMD_CONNECT: u8 = 0x01;
    pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

    pub const ATYP_IPV4: u8 = 0x01;
    pub const ATYP_DOMAIN: u8 = 0x03;
    pub const ATYP_IPV6: u8 = 0x04;

    pub const REPLY_SUCCEEDED: u8 = 0x00;
}

/// Byte stream to a destination, carried by the proxy
pub trait ProxyStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> ProxyStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedStream = Box<dyn ProxyStream>;

/// Datagram session through the proxy
#[async_trait]
pub trait PacketSession: Send + Sync {
    /// Send one datagram to `target`
    async fn send_to(&self, payload: &[u8], target: SocketAddr) -> Result<()>;

    /// Receive one datagram, returning its length and the remote it came from
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)>;
}

/// Session-level connection to the proxy.
///
/// Holding it open keeps the session authenticated; losing it is fatal to
/// the tunnel that owns it.
#[async_trait]
pub trait ControlChannel: Send {
    /// Resolves once the channel is lost, with the reason
    async fn closed(&mut self) -> BridgeError;
}

/// Everything the bridge needs from a proxy protocol.
///
/// Implementations are immutable and shared read-only between concurrent
/// connectivity checks and tunnel sessions.
#[async_trait]
pub trait ProxyTransport: Send + Sync {
    /// Open and authenticate a control channel
    async fn open_control(&self) -> Result<Box<dyn ControlChannel>>;

    /// Open a stream to `target` through the proxy
    async fn dial_stream(&self, target: SocketAddr) -> Result<BoxedStream>;

    /// Open a datagram session through the proxy
    async fn listen_packet(&self) -> Result<Box<dyn PacketSession>>;

    /// Human readable endpoint, for logs
    fn describe(&self) -> String;
}

//! SOCKS5 UDP relay datagrams
//!
//! Each datagram exchanged with the relay carries a small header:
//!
//! ```text
//! +-----+------+------+----------+----------+----------+
//! | RSV | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
//! +-----+------+------+----------+----------+----------+
//! |  2  |  1   |  1   | Variable |    2     | Variable |
//! +-----+------+------+----------+----------+----------+
//! ```
//!
//! The association lives as long as the TCP connection it was requested
//! on, so the session keeps that connection open.

use super::constants::*;
use super::socks5::put_socket_addr;
use super::PacketSession;
use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Mutex;

/// RSV + FRAG + ATYP + IPv4 + port
const UDP_HEADER_MIN_SIZE: usize = 10;
/// RSV + FRAG + ATYP + IPv6 + port
const UDP_HEADER_IPV6_SIZE: usize = 22;
/// RSV + FRAG + ATYP + length-prefixed 255-byte domain + port
const UDP_HEADER_MAX_SIZE: usize = 262;

/// Prefix `data` with the relay header addressed to `dest`
#[must_use]
pub fn encapsulate(dest: SocketAddr, data: &[u8]) -> BytesMut {
    let mut packet = BytesMut::with_capacity(UDP_HEADER_IPV6_SIZE + data.len());
    packet.put_u16(0);
    packet.put_u8(0);
    put_socket_addr(&mut packet, dest);
    packet.put_slice(data);
    packet
}

/// Split a relay datagram into its remote address and payload.
///
/// Fragmented datagrams are rejected; RFC 1928 lets clients that do not
/// reassemble drop them.
pub fn decapsulate(packet: &[u8]) -> Result<(SocketAddr, &[u8])> {
    if packet.len() < UDP_HEADER_MIN_SIZE {
        return Err(BridgeError::Protocol(format!(
            "relay datagram too short: {} bytes",
            packet.len()
        )));
    }
    if packet[0] != 0 || packet[1] != 0 {
        return Err(BridgeError::Protocol("relay datagram RSV must be zero".to_string()));
    }
    if packet[2] != 0 {
        return Err(BridgeError::Protocol(format!(
            "fragmented relay datagram (FRAG={})",
            packet[2]
        )));
    }

    match packet[3] {
        ATYP_IPV4 => {
            let ip = Ipv4Addr::new(packet[4], packet[5], packet[6], packet[7]);
            let port = u16::from_be_bytes([packet[8], packet[9]]);
            Ok((SocketAddr::new(IpAddr::V4(ip), port), &packet[10..]))
        }
        ATYP_IPV6 => {
            if packet.len() < UDP_HEADER_IPV6_SIZE {
                return Err(BridgeError::Protocol(
                    "relay datagram too short for IPv6 address".to_string(),
                ));
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&packet[4..20]);
            let port = u16::from_be_bytes([packet[20], packet[21]]);
            Ok((SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port), &packet[22..]))
        }
        ATYP_DOMAIN => {
            let len = usize::from(packet[4]);
            let port_offset = 5 + len;
            if packet.len() < port_offset + 2 {
                return Err(BridgeError::Protocol(
                    "relay datagram too short for domain address".to_string(),
                ));
            }
            let port = u16::from_be_bytes([packet[port_offset], packet[port_offset + 1]]);
            Ok((
                SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
                &packet[port_offset + 2..],
            ))
        }
        other => Err(BridgeError::Protocol(format!(
            "unknown address type {other:#04x} in relay datagram"
        ))),
    }
}

/// One UDP association with the proxy
pub struct Socks5UdpSession {
    socket: UdpSocket,
    relay: SocketAddr,
    /// Receive buffer reused across datagrams
    raw: Mutex<Vec<u8>>,
    // Dropping this ends the association on the proxy side.
    _control: TcpStream,
}

impl Socks5UdpSession {
    /// Bind a local socket and point it at the relay address
    pub async fn open(control: TcpStream, relay: SocketAddr) -> Result<Self> {
        let local: SocketAddr = if relay.is_ipv4() {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
        } else {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(relay).await?;
        log::trace!("UDP association via relay {relay}");
        Ok(Self {
            socket,
            relay,
            raw: Mutex::new(Vec::new()),
            _control: control,
        })
    }

    #[must_use]
    pub fn relay_addr(&self) -> SocketAddr {
        self.relay
    }
}

#[async_trait]
impl PacketSession for Socks5UdpSession {
    async fn send_to(&self, payload: &[u8], target: SocketAddr) -> Result<()> {
        let datagram = encapsulate(target, payload);
        self.socket.send(&datagram).await?;
        Ok(())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        let mut raw = self.raw.lock().await;
        let needed = buf.len() + UDP_HEADER_MAX_SIZE;
        if raw.len() < needed {
            raw.resize(needed, 0);
        }
        loop {
            let n = self.socket.recv(&mut raw).await?;
            match decapsulate(&raw[..n]) {
                Ok((source, data)) => {
                    let len = data.len().min(buf.len());
                    buf[..len].copy_from_slice(&data[..len]);
                    return Ok((len, source));
                }
                Err(e) => log::debug!("dropping relay datagram: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encapsulate_ipv4() {
        let packet = encapsulate("8.8.8.8:53".parse().unwrap(), b"query");
        assert_eq!(&packet[..4], &[0, 0, 0, ATYP_IPV4]);
        assert_eq!(&packet[4..8], &[8, 8, 8, 8]);
        assert_eq!(&packet[8..10], &53u16.to_be_bytes());
        assert_eq!(&packet[10..], b"query");
    }

    #[test]
    fn test_decapsulate_ipv6() {
        let dest: SocketAddr = "[2001:db8::1]:5353".parse().unwrap();
        let packet = encapsulate(dest, b"answer");
        let (source, data) = decapsulate(&packet).unwrap();
        assert_eq!(source, dest);
        assert_eq!(data, b"answer");
    }

    #[test]
    fn test_decapsulate_domain() {
        let mut packet = vec![0, 0, 0, ATYP_DOMAIN, 7];
        packet.extend_from_slice(b"example");
        packet.extend_from_slice(&80u16.to_be_bytes());
        packet.extend_from_slice(b"hi");
        let (source, data) = decapsulate(&packet).unwrap();
        assert_eq!(source.port(), 80);
        assert_eq!(data, b"hi");
    }

    #[test]
    fn test_decapsulate_rejects_malformed() {
        assert!(decapsulate(&[0, 0, 0]).is_err());

        let mut fragmented = encapsulate("1.2.3.4:5".parse().unwrap(), b"x").to_vec();
        fragmented[2] = 1;
        assert!(decapsulate(&fragmented).is_err());

        let mut bad_rsv = encapsulate("1.2.3.4:5".parse().unwrap(), b"x").to_vec();
        bad_rsv[0] = 1;
        assert!(decapsulate(&bad_rsv).is_err());

        let bad_atyp = [0, 0, 0, 0x09, 0, 0, 0, 0, 0, 0];
        assert!(decapsulate(&bad_atyp).is_err());
    }

    #[tokio::test]
    async fn test_long_domain_header_keeps_whole_payload() {
        let relay = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let control = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let _accepted = listener.accept().await.unwrap();
        let session = Socks5UdpSession::open(control, relay.local_addr().unwrap())
            .await
            .unwrap();

        // Learn the session's address from its first datagram
        session.send_to(b"hello", "192.0.2.1:53".parse().unwrap()).await.unwrap();
        let mut scratch = [0u8; 64];
        let (_, session_addr) = relay.recv_from(&mut scratch).await.unwrap();

        let domain = "d".repeat(255);
        let payload = vec![0x7au8; 512];
        let mut datagram = vec![0, 0, 0, ATYP_DOMAIN, 255];
        datagram.extend_from_slice(domain.as_bytes());
        datagram.extend_from_slice(&443u16.to_be_bytes());
        datagram.extend_from_slice(&payload);

        let mut buf = vec![0u8; payload.len()];
        for _ in 0..2 {
            relay.send_to(&datagram, session_addr).await.unwrap();
            let (n, source) = session.recv_from(&mut buf).await.unwrap();
            assert_eq!(n, payload.len());
            assert_eq!(buf, payload);
            assert_eq!(source.port(), 443);
        }
    }
}

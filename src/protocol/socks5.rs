//! SOCKS5 client (RFC 1928) with username/password authentication (RFC 1929)
//!
//! Every proxy connection goes through the same three steps: TCP connect,
//! method negotiation (plus authentication when the server asks for it),
//! then an optional request (`CONNECT` or `UDP ASSOCIATE`). The whole
//! sequence runs under the configured connect timeout.

use super::constants::*;
use super::socks5_udp::Socks5UdpSession;
use super::{BoxedStream, ControlChannel, PacketSession, ProxyTransport};
use crate::config::{AuthMethod, ClientConfig, Secret};
use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};

/// Credentials for RFC 1929 authentication
#[derive(Debug, Clone)]
pub struct Socks5Auth {
    pub username: String,
    pub password: Secret,
}

/// SOCKS5 proxy transport
#[derive(Debug, Clone)]
pub struct Socks5Transport {
    endpoint: String,
    auth: Option<Socks5Auth>,
    connect_timeout: Duration,
}

impl Socks5Transport {
    pub fn new(endpoint: impl Into<String>, auth: Option<Socks5Auth>, connect_timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            auth,
            connect_timeout,
        }
    }

    /// Build the transport described by a validated configuration
    pub fn from_config(config: &ClientConfig) -> Self {
        let auth = match config.auth.method {
            AuthMethod::Password => Some(Socks5Auth {
                username: config.auth.username.clone().unwrap_or_default(),
                password: config.auth.password.clone().unwrap_or_default(),
            }),
            AuthMethod::None => None,
        };
        Self::new(config.proxy_endpoint(), auth, config.transport.connect_timeout())
    }

    /// Connect to the proxy and complete method negotiation
    async fn connect_negotiated(&self) -> Result<TcpStream> {
        let attempt = async {
            let mut stream = self.tcp_connect().await?;
            negotiate(&mut stream, self.auth.as_ref()).await?;
            Ok::<_, BridgeError>(stream)
        };

        tokio::time::timeout(self.connect_timeout, attempt)
            .await
            .map_err(|_| {
                BridgeError::Timeout(format!(
                    "no answer from proxy {} within {:?}",
                    self.endpoint, self.connect_timeout
                ))
            })?
    }

    async fn tcp_connect(&self) -> Result<TcpStream> {
        let addrs: Vec<SocketAddr> = lookup_host(self.endpoint.as_str())
            .await
            .map_err(|e| {
                BridgeError::Network(format!("failed to resolve proxy {}: {e}", self.endpoint))
            })?
            .collect();

        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    log::trace!("connected to proxy {addr}");
                    return Ok(stream);
                }
                Err(e) => {
                    log::debug!("proxy address {addr} failed: {e}");
                    last_error = Some(e);
                }
            }
        }

        Err(match last_error {
            Some(e) => BridgeError::Io(e),
            None => BridgeError::Network(format!("proxy {} resolved to no addresses", self.endpoint)),
        })
    }
}

#[async_trait]
impl ProxyTransport for Socks5Transport {
    async fn open_control(&self) -> Result<Box<dyn ControlChannel>> {
        let stream = self.connect_negotiated().await?;
        log::debug!("control channel to {} authenticated", self.endpoint);
        Ok(Box::new(Socks5Control { stream }))
    }

    async fn dial_stream(&self, target: SocketAddr) -> Result<BoxedStream> {
        let mut stream = self.connect_negotiated().await?;
        tokio::time::timeout(self.connect_timeout, send_request(&mut stream, CMD_CONNECT, target))
            .await
            .map_err(|_| BridgeError::Timeout(format!("CONNECT {target} timed out")))??;
        Ok(Box::new(stream))
    }

    async fn listen_packet(&self) -> Result<Box<dyn PacketSession>> {
        let mut stream = self.connect_negotiated().await?;
        let unspecified = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
        let bound = tokio::time::timeout(
            self.connect_timeout,
            send_request(&mut stream, CMD_UDP_ASSOCIATE, unspecified),
        )
        .await
        .map_err(|_| BridgeError::Timeout("UDP ASSOCIATE timed out".to_string()))??;

        // A wildcard BND.ADDR means "same host as the proxy"
        let relay = if bound.ip().is_unspecified() {
            SocketAddr::new(stream.peer_addr()?.ip(), bound.port())
        } else {
            bound
        };
        let session = Socks5UdpSession::open(stream, relay).await?;
        Ok(Box::new(session))
    }

    fn describe(&self) -> String {
        format!("socks5://{}", self.endpoint)
    }
}

/// Authenticated control connection; it carries no traffic after the
/// handshake, so any read result other than "pending" means it is gone.
struct Socks5Control {
    stream: TcpStream,
}

#[async_trait]
impl ControlChannel for Socks5Control {
    async fn closed(&mut self) -> BridgeError {
        let mut buf = [0u8; 64];
        loop {
            match self.stream.read(&mut buf).await {
                Ok(0) => {
                    return BridgeError::Network("proxy closed the control channel".to_string())
                }
                Ok(n) => log::warn!("ignoring {n} unexpected bytes on control channel"),
                Err(e) => return BridgeError::Io(e),
            }
        }
    }
}

/// Method selection plus optional RFC 1929 authentication
pub(crate) async fn negotiate(stream: &mut TcpStream, auth: Option<&Socks5Auth>) -> Result<()> {
    let methods: &[u8] = if auth.is_some() {
        &[SOCKS5_VERSION, 2, AUTH_METHOD_NONE, AUTH_METHOD_PASSWORD]
    } else {
        &[SOCKS5_VERSION, 1, AUTH_METHOD_NONE]
    };
    stream.write_all(methods).await?;

    let mut response = [0u8; 2];
    stream.read_exact(&mut response).await?;
    if response[0] != SOCKS5_VERSION {
        return Err(BridgeError::Protocol(format!(
            "unexpected SOCKS version {:#04x}",
            response[0]
        )));
    }

    match (response[1], auth) {
        (AUTH_METHOD_NONE, _) => Ok(()),
        (AUTH_METHOD_PASSWORD, Some(auth)) => authenticate(stream, auth).await,
        (AUTH_METHOD_PASSWORD, None) => Err(BridgeError::Authentication(
            "proxy requires username/password credentials".to_string(),
        )),
        (AUTH_METHOD_NO_ACCEPTABLE, _) => Err(BridgeError::Authentication(
            "proxy accepted none of the offered authentication methods".to_string(),
        )),
        (other, _) => Err(BridgeError::Protocol(format!(
            "proxy selected unsupported method {other:#04x}"
        ))),
    }
}

async fn authenticate(stream: &mut TcpStream, auth: &Socks5Auth) -> Result<()> {
    let username = auth.username.as_bytes();
    let password = auth.password.expose().as_bytes();
    let (Ok(ulen), Ok(plen)) = (u8::try_from(username.len()), u8::try_from(password.len())) else {
        return Err(BridgeError::Config(
            "username and password must be at most 255 bytes".to_string(),
        ));
    };

    let mut request = BytesMut::with_capacity(3 + username.len() + password.len());
    request.put_u8(AUTH_PASSWORD_VERSION);
    request.put_u8(ulen);
    request.put_slice(username);
    request.put_u8(plen);
    request.put_slice(password);
    let written = stream.write_all(&request).await;
    // Overwrite the copy of the password before the buffer is released
    request.iter_mut().for_each(|b| *b = 0);
    written?;

    let mut response = [0u8; 2];
    stream.read_exact(&mut response).await?;
    if response[0] != AUTH_PASSWORD_VERSION {
        return Err(BridgeError::Protocol(format!(
            "unexpected auth version {:#04x}",
            response[0]
        )));
    }
    if response[1] != 0x00 {
        return Err(BridgeError::Authentication(
            "proxy rejected the username/password".to_string(),
        ));
    }
    Ok(())
}

/// Send a request and return BND.ADDR from a successful reply
pub(crate) async fn send_request(stream: &mut TcpStream, command: u8, target: SocketAddr) -> Result<SocketAddr> {
    let mut request = BytesMut::with_capacity(22);
    request.put_slice(&[SOCKS5_VERSION, command, 0x00]);
    put_socket_addr(&mut request, target);
    stream.write_all(&request).await?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS5_VERSION {
        return Err(BridgeError::Protocol(format!(
            "unexpected SOCKS version {:#04x} in reply",
            header[0]
        )));
    }
    if header[1] != REPLY_SUCCEEDED {
        return Err(reply_error(header[1], target));
    }

    read_socket_addr(stream, header[3]).await
}

/// Append ATYP + address + port
pub(crate) fn put_socket_addr(buf: &mut BytesMut, addr: SocketAddr) {
    match addr {
        SocketAddr::V4(v4) => {
            buf.put_u8(ATYP_IPV4);
            buf.put_slice(&v4.ip().octets());
            buf.put_u16(v4.port());
        }
        SocketAddr::V6(v6) => {
            buf.put_u8(ATYP_IPV6);
            buf.put_slice(&v6.ip().octets());
            buf.put_u16(v6.port());
        }
    }
}

async fn read_socket_addr(stream: &mut TcpStream, atyp: u8) -> Result<SocketAddr> {
    let ip = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await?;
            let mut name = vec![0u8; usize::from(len)];
            stream.read_exact(&mut name).await?;
            log::debug!(
                "proxy bound a domain address ({}); using the proxy host",
                String::from_utf8_lossy(&name)
            );
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        }
        other => {
            return Err(BridgeError::Protocol(format!(
                "unknown address type {other:#04x}"
            )))
        }
    };
    let port = stream.read_u16().await?;
    Ok(SocketAddr::new(ip, port))
}

/// Classify a non-zero reply code
pub(crate) fn reply_error(code: u8, target: SocketAddr) -> BridgeError {
    match code {
        0x06 => BridgeError::Timeout(format!("TTL expired reaching {target}")),
        0x07 => BridgeError::Protocol("command not supported by proxy".to_string()),
        0x08 => BridgeError::Protocol("address type not supported by proxy".to_string()),
        _ => BridgeError::Network(format!("proxy could not reach {target}: {}", reply_message(code))),
    }
}

/// Reply code description per RFC 1928
#[must_use]
pub fn reply_message(code: u8) -> &'static str {
    match code {
        0x00 => "succeeded",
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::test_support::{MockSocks5Server, MockSocks5Options};

    #[test]
    fn test_reply_message_all_codes() {
        assert_eq!(reply_message(0x00), "succeeded");
        assert_eq!(reply_message(0x05), "connection refused");
        assert_eq!(reply_message(0x42), "unknown error");
    }

    #[test]
    fn test_reply_error_classification() {
        let target: SocketAddr = "10.0.0.1:80".parse().unwrap();
        assert_eq!(reply_error(0x05, target).code(), ErrorCode::NetworkUnreachable);
        assert_eq!(reply_error(0x06, target).code(), ErrorCode::Timeout);
        assert!(matches!(reply_error(0x07, target), BridgeError::Protocol(_)));
    }

    #[test]
    fn test_put_socket_addr() {
        let mut buf = BytesMut::new();
        put_socket_addr(&mut buf, "192.168.1.1:8080".parse().unwrap());
        assert_eq!(&buf[..], &[ATYP_IPV4, 192, 168, 1, 1, 0x1F, 0x90]);

        let mut buf = BytesMut::new();
        put_socket_addr(&mut buf, "[::1]:443".parse().unwrap());
        assert_eq!(buf.len(), 1 + 16 + 2);
        assert_eq!(buf[0], ATYP_IPV6);
        assert_eq!(buf[16], 1);
    }

    #[tokio::test]
    async fn test_open_control_with_auth() {
        let server = MockSocks5Server::start(MockSocks5Options::with_credentials("user", "pass")).await;
        let transport = Socks5Transport::new(
            server.addr().to_string(),
            Some(Socks5Auth {
                username: "user".to_string(),
                password: Secret::new("pass"),
            }),
            Duration::from_secs(2),
        );
        assert!(transport.open_control().await.is_ok());
    }

    #[tokio::test]
    async fn test_wrong_password_is_authentication_error() {
        let server = MockSocks5Server::start(MockSocks5Options::with_credentials("user", "pass")).await;
        let transport = Socks5Transport::new(
            server.addr().to_string(),
            Some(Socks5Auth {
                username: "user".to_string(),
                password: Secret::new("nope"),
            }),
            Duration::from_secs(2),
        );
        let err = transport.open_control().await.err().expect("auth must fail");
        assert_eq!(err.code(), ErrorCode::AuthenticationFailed);
    }

    #[tokio::test]
    async fn test_missing_credentials_is_authentication_error() {
        let server = MockSocks5Server::start(MockSocks5Options::with_credentials("user", "pass")).await;
        let transport = Socks5Transport::new(server.addr().to_string(), None, Duration::from_secs(2));
        let err = transport.open_control().await.err().expect("auth must fail");
        assert_eq!(err.code(), ErrorCode::AuthenticationFailed);
    }

    #[tokio::test]
    async fn test_dial_stream_relays_bytes() {
        let echo = crate::test_support::spawn_tcp_echo().await;
        let server = MockSocks5Server::start(MockSocks5Options::default()).await;
        let transport = Socks5Transport::new(server.addr().to_string(), None, Duration::from_secs(2));

        let mut stream = transport.dial_stream(echo).await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_refused_proxy_is_network_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = Socks5Transport::new(addr.to_string(), None, Duration::from_secs(2));
        let err = transport.open_control().await.err().expect("nothing listens there");
        assert_eq!(err.code(), ErrorCode::NetworkUnreachable);
    }
}

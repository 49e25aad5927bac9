//! Shared fixtures for unit tests: a scriptable SOCKS5 server, local echo
//! services, an in-memory proxy transport and a recording TUN writer.

use crate::error::{BridgeError, Result};
use crate::protocol::constants::*;
use crate::protocol::socks5::put_socket_addr;
use crate::protocol::socks5_udp::{decapsulate, encapsulate};
use crate::protocol::{BoxedStream, ControlChannel, PacketSession, ProxyTransport};
use crate::tunnel::packet::{parse_packet, ParsedPacket, TcpSegment};
use crate::tunnel::TunWriter;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use hickory_proto::op::{Message, MessageType};
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;

/// Route `log` output through the test harness; `RUST_LOG` picks the level
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// How the mock server answers UDP ASSOCIATE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpMode {
    /// Relay datagrams to their real destination
    Relay,
    /// Reply "command not supported"
    Refuse,
    /// Accept the association and silently drop every datagram
    Blackhole,
}

#[derive(Debug, Clone)]
pub struct MockSocks5Options {
    pub credentials: Option<(String, String)>,
    pub udp: UdpMode,
}

impl Default for MockSocks5Options {
    fn default() -> Self {
        Self {
            credentials: None,
            udp: UdpMode::Relay,
        }
    }
}

impl MockSocks5Options {
    pub fn with_credentials(username: &str, password: &str) -> Self {
        Self {
            credentials: Some((username.to_string(), password.to_string())),
            ..Self::default()
        }
    }

    pub fn udp(mut self, mode: UdpMode) -> Self {
        self.udp = mode;
        self
    }
}

/// Minimal SOCKS5 server on 127.0.0.1
pub struct MockSocks5Server {
    addr: SocketAddr,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl MockSocks5Server {
    pub async fn start(options: MockSocks5Options) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let tasks: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::default();

        let connections = tasks.clone();
        let accept = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let options = options.clone();
                let handle = tokio::spawn(async move {
                    let _ = serve_socks5(stream, options).await;
                });
                connections.lock().unwrap().push(handle);
            }
        });
        tasks.lock().unwrap().push(accept);

        Self { addr, tasks }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop listening and drop every open connection
    pub fn shutdown(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

impl Drop for MockSocks5Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn serve_socks5(mut stream: TcpStream, options: MockSocks5Options) -> io::Result<()> {
    let mut greeting = [0u8; 2];
    stream.read_exact(&mut greeting).await?;
    let mut methods = vec![0u8; usize::from(greeting[1])];
    stream.read_exact(&mut methods).await?;

    match &options.credentials {
        Some((username, password)) => {
            if !methods.contains(&AUTH_METHOD_PASSWORD) {
                stream.write_all(&[SOCKS5_VERSION, AUTH_METHOD_NO_ACCEPTABLE]).await?;
                return Ok(());
            }
            stream.write_all(&[SOCKS5_VERSION, AUTH_METHOD_PASSWORD]).await?;

            let mut header = [0u8; 2];
            stream.read_exact(&mut header).await?;
            let mut user = vec![0u8; usize::from(header[1])];
            stream.read_exact(&mut user).await?;
            let plen = stream.read_u8().await?;
            let mut pass = vec![0u8; usize::from(plen)];
            stream.read_exact(&mut pass).await?;

            let ok = user == username.as_bytes() && pass == password.as_bytes();
            stream
                .write_all(&[AUTH_PASSWORD_VERSION, if ok { 0x00 } else { 0x01 }])
                .await?;
            if !ok {
                return Ok(());
            }
        }
        None => stream.write_all(&[SOCKS5_VERSION, AUTH_METHOD_NONE]).await?,
    }

    // A control channel sends nothing more; EOF here is normal.
    let mut header = [0u8; 4];
    if stream.read_exact(&mut header).await.is_err() {
        return Ok(());
    }
    let target = read_target(&mut stream, header[3]).await?;

    match header[1] {
        CMD_CONNECT => match TcpStream::connect(target).await {
            Ok(mut upstream) => {
                write_reply(&mut stream, REPLY_SUCCEEDED, unspecified()).await?;
                let _ = tokio::io::copy_bidirectional(&mut stream, &mut upstream).await;
                Ok(())
            }
            Err(_) => write_reply(&mut stream, 0x05, unspecified()).await,
        },
        CMD_UDP_ASSOCIATE if options.udp == UdpMode::Refuse => {
            write_reply(&mut stream, 0x07, unspecified()).await
        }
        CMD_UDP_ASSOCIATE => {
            let relay = UdpSocket::bind("127.0.0.1:0").await?;
            write_reply(&mut stream, REPLY_SUCCEEDED, relay.local_addr()?).await?;
            serve_udp_relay(stream, relay, options.udp).await
        }
        _ => write_reply(&mut stream, 0x07, unspecified()).await,
    }
}

async fn serve_udp_relay(mut control: TcpStream, relay: UdpSocket, mode: UdpMode) -> io::Result<()> {
    let outbound = UdpSocket::bind("127.0.0.1:0").await?;
    let mut client: Option<SocketAddr> = None;
    let mut from_client = vec![0u8; 65536];
    let mut from_remote = vec![0u8; 65536];
    let mut control_buf = [0u8; 16];

    loop {
        tokio::select! {
            read = control.read(&mut control_buf) => {
                if matches!(read, Ok(0) | Err(_)) {
                    return Ok(());
                }
            }
            received = relay.recv_from(&mut from_client) => {
                let (n, peer) = received?;
                client = Some(peer);
                if mode == UdpMode::Blackhole {
                    continue;
                }
                if let Ok((target, data)) = decapsulate(&from_client[..n]) {
                    let _ = outbound.send_to(data, target).await;
                }
            }
            received = outbound.recv_from(&mut from_remote) => {
                let (n, source) = received?;
                if let Some(peer) = client {
                    let datagram = encapsulate(source, &from_remote[..n]);
                    let _ = relay.send_to(&datagram, peer).await;
                }
            }
        }
    }
}

async fn read_target(stream: &mut TcpStream, atyp: u8) -> io::Result<SocketAddr> {
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
        _ => return Err(io::Error::new(io::ErrorKind::InvalidData, "unsupported ATYP")),
    };
    let port = stream.read_u16().await?;
    Ok(SocketAddr::new(ip, port))
}

async fn write_reply(stream: &mut TcpStream, code: u8, bound: SocketAddr) -> io::Result<()> {
    let mut reply = BytesMut::new();
    reply.extend_from_slice(&[SOCKS5_VERSION, code, 0x00]);
    put_socket_addr(&mut reply, bound);
    stream.write_all(&reply).await
}

fn unspecified() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
}

/// TCP echo server; returns its address
pub async fn spawn_tcp_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

/// UDP server answering every DNS query with an empty response
pub async fn spawn_dns_responder() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
            let Ok(query) = Message::from_vec(&buf[..n]) else {
                continue;
            };
            let mut response = Message::new();
            response
                .set_id(query.id())
                .set_message_type(MessageType::Response)
                .set_recursion_desired(query.recursion_desired())
                .set_recursion_available(true)
                .add_queries(query.queries().to_vec());
            if let Ok(bytes) = response.to_vec() {
                let _ = socket.send_to(&bytes, peer).await;
            }
        }
    });
    addr
}

/// What an in-memory dial to a destination does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamBehavior {
    Echo,
    /// Dial fails with a network error
    Refuse,
    /// Dial succeeds; every read and write then fails with a reset
    Reset,
    /// Dial succeeds; reads and writes never complete
    Stall,
}

#[derive(Default)]
struct MemoryState {
    behaviors: HashMap<SocketAddr, StreamBehavior>,
    dials: Vec<SocketAddr>,
}

/// Proxy transport that never touches the network.
///
/// Streams echo by default and packet sessions echo datagrams back from
/// their destination.
pub struct MemoryTransport {
    state: Mutex<MemoryState>,
    control_kill: watch::Sender<u64>,
    control_opens: AtomicUsize,
    refuse_control: AtomicBool,
    packet_sessions: AtomicUsize,
    udp_sent: Arc<Mutex<Vec<(SocketAddr, Bytes)>>>,
    stalled_writes: Arc<AtomicUsize>,
}

impl MemoryTransport {
    pub fn new() -> Arc<Self> {
        let (control_kill, _) = watch::channel(0);
        Arc::new(Self {
            state: Mutex::default(),
            control_kill,
            control_opens: AtomicUsize::new(0),
            refuse_control: AtomicBool::new(false),
            packet_sessions: AtomicUsize::new(0),
            udp_sent: Arc::default(),
            stalled_writes: Arc::default(),
        })
    }

    pub fn set_behavior(&self, target: SocketAddr, behavior: StreamBehavior) {
        self.state.lock().unwrap().behaviors.insert(target, behavior);
    }

    /// Drop every open control channel
    pub fn kill_control(&self) {
        self.control_kill.send_modify(|generation| *generation += 1);
    }

    /// Make future `open_control` calls fail
    pub fn refuse_control(&self, refuse: bool) {
        self.refuse_control.store(refuse, Ordering::SeqCst);
    }

    pub fn control_opens(&self) -> usize {
        self.control_opens.load(Ordering::SeqCst)
    }

    pub fn packet_sessions(&self) -> usize {
        self.packet_sessions.load(Ordering::SeqCst)
    }

    pub fn dials(&self) -> Vec<SocketAddr> {
        self.state.lock().unwrap().dials.clone()
    }

    pub fn udp_sent(&self) -> Vec<(SocketAddr, Bytes)> {
        self.udp_sent.lock().unwrap().clone()
    }

    /// Writes that have blocked on a stalled stream
    pub fn stalled_writes(&self) -> usize {
        self.stalled_writes.load(Ordering::SeqCst)
    }
}

struct MemoryControl {
    kill: watch::Receiver<u64>,
}

#[async_trait]
impl ControlChannel for MemoryControl {
    async fn closed(&mut self) -> BridgeError {
        let _ = self.kill.changed().await;
        BridgeError::Network("control channel killed".to_string())
    }
}

#[async_trait]
impl ProxyTransport for MemoryTransport {
    async fn open_control(&self) -> Result<Box<dyn ControlChannel>> {
        if self.refuse_control.load(Ordering::SeqCst) {
            return Err(BridgeError::Network("control channel refused".to_string()));
        }
        self.control_opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryControl {
            kill: self.control_kill.subscribe(),
        }))
    }

    async fn dial_stream(&self, target: SocketAddr) -> Result<BoxedStream> {
        let behavior = {
            let mut state = self.state.lock().unwrap();
            state.dials.push(target);
            state
                .behaviors
                .get(&target)
                .copied()
                .unwrap_or(StreamBehavior::Echo)
        };
        match behavior {
            StreamBehavior::Echo => {
                let (near, mut far) = tokio::io::duplex(64 * 1024);
                tokio::spawn(async move {
                    let (mut reader, mut writer) = tokio::io::split(&mut far);
                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                    let _ = writer.shutdown().await;
                });
                Ok(Box::new(near))
            }
            StreamBehavior::Refuse => Err(BridgeError::Network(format!("{target} refused"))),
            StreamBehavior::Reset => Ok(Box::new(ResetStream)),
            StreamBehavior::Stall => Ok(Box::new(StalledStream {
                writes: self.stalled_writes.clone(),
            })),
        }
    }

    async fn listen_packet(&self) -> Result<Box<dyn PacketSession>> {
        self.packet_sessions.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Box::new(MemoryPacketSession {
            echo_tx: tx,
            echo_rx: tokio::sync::Mutex::new(rx),
            sent: self.udp_sent.clone(),
        }))
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}

struct MemoryPacketSession {
    echo_tx: mpsc::UnboundedSender<(SocketAddr, Bytes)>,
    echo_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(SocketAddr, Bytes)>>,
    sent: Arc<Mutex<Vec<(SocketAddr, Bytes)>>>,
}

#[async_trait]
impl PacketSession for MemoryPacketSession {
    async fn send_to(&self, payload: &[u8], target: SocketAddr) -> Result<()> {
        let payload = Bytes::copy_from_slice(payload);
        self.sent.lock().unwrap().push((target, payload.clone()));
        self.echo_tx
            .send((target, payload))
            .map_err(|_| BridgeError::Network("packet session closed".to_string()))
    }

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        let mut rx = self.echo_rx.lock().await;
        let (source, payload) = rx
            .recv()
            .await
            .ok_or_else(|| BridgeError::Network("packet session closed".to_string()))?;
        let len = payload.len().min(buf.len());
        buf[..len].copy_from_slice(&payload[..len]);
        Ok((len, source))
    }
}

/// Stream whose every operation fails as if the proxy reset it
struct ResetStream;

fn reset_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionReset, "reset by proxy")
}

impl AsyncRead for ResetStream {
    fn poll_read(self: Pin<&mut Self>, _: &mut Context<'_>, _: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Err(reset_error()))
    }
}

impl AsyncWrite for ResetStream {
    fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, _: &[u8]) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(reset_error()))
    }

    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Stream whose reads and writes stay pending forever
struct StalledStream {
    writes: Arc<AtomicUsize>,
}

impl AsyncRead for StalledStream {
    fn poll_read(self: Pin<&mut Self>, _: &mut Context<'_>, _: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Poll::Pending
    }
}

impl AsyncWrite for StalledStream {
    fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, _: &[u8]) -> Poll<io::Result<usize>> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        Poll::Pending
    }

    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Pending
    }

    fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Pending
    }
}

/// TUN writer that records every packet it is given
#[derive(Default)]
pub struct RecordingTunWriter {
    packets: Mutex<Vec<Bytes>>,
    notify: Notify,
    closes: AtomicUsize,
    would_block: AtomicBool,
}

impl RecordingTunWriter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make writes fail with `WouldBlock` until cleared
    pub fn set_would_block(&self, blocked: bool) {
        self.would_block.store(blocked, Ordering::SeqCst);
    }

    pub fn packets(&self) -> Vec<Bytes> {
        self.packets.lock().unwrap().clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Wait until `predicate` holds for the recorded packets
    pub async fn wait_for<F>(&self, predicate: F) -> Vec<Bytes>
    where
        F: Fn(&[Bytes]) -> bool,
    {
        let wait = async {
            loop {
                let notified = self.notify.notified();
                {
                    let packets = self.packets.lock().unwrap();
                    if predicate(&packets) {
                        return packets.clone();
                    }
                }
                notified.await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .expect("TUN writer never saw the expected packets")
    }
}

/// TCP segments among `packets` sent from `remote` to `host`
pub fn segments_between(packets: &[Bytes], remote: SocketAddr, host: SocketAddr) -> Vec<TcpSegment> {
    packets
        .iter()
        .filter_map(|packet| match parse_packet(packet) {
            Ok(ParsedPacket::Tcp { key, segment }) if key.src == remote && key.dst == host => Some(segment),
            _ => None,
        })
        .collect()
}

impl TunWriter for RecordingTunWriter {
    fn write_packet(&self, packet: &[u8]) -> io::Result<()> {
        if self.would_block.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "host queue full"));
        }
        self.packets.lock().unwrap().push(Bytes::copy_from_slice(packet));
        self.notify.notify_waiters();
        Ok(())
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

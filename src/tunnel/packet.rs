//! IP packet parsing and construction for the relay
//!
//! Packets from the virtual interface are sliced with `etherparse` into a
//! [`FlowKey`] plus the transport payload. Packets going back to the
//! interface are built with `etherparse::PacketBuilder`, which also fills
//! in lengths and checksums.

use crate::error::{BridgeError, Result};
use bytes::Bytes;
use etherparse::{
    IpHeaders, NetSlice, PacketBuilder, PacketBuilderStep, SlicedPacket, TcpOptionElement,
    TransportSlice,
};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// TTL / hop limit of packets written to the interface
pub const DEFAULT_TTL: u8 = 64;

/// Transport protocol of a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowProtocol {
    Tcp,
    Udp,
}

/// 5-tuple identifying one flow, as seen from the virtual interface:
/// `src` is the local application, `dst` the remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub protocol: FlowProtocol,
    pub src: SocketAddr,
    pub dst: SocketAddr,
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let proto = match self.protocol {
            FlowProtocol::Tcp => "tcp",
            FlowProtocol::Udp => "udp",
        };
        write!(f, "{proto} {} -> {}", self.src, self.dst)
    }
}

/// TCP segment fields the relay acts on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpSegment {
    pub seq: u32,
    pub ack: u32,
    pub window: u16,
    pub syn: bool,
    pub ack_flag: bool,
    pub fin: bool,
    pub rst: bool,
    /// MSS option, only looked for on SYN segments
    pub mss: Option<u16>,
    pub payload: Bytes,
}

impl TcpSegment {
    /// Sequence space consumed by this segment (payload plus SYN/FIN)
    #[must_use]
    pub fn seq_len(&self) -> u32 {
        self.payload.len() as u32 + u32::from(self.syn) + u32::from(self.fin)
    }

    /// An initial SYN (no ACK) that may open a flow
    #[must_use]
    pub fn is_initial_syn(&self) -> bool {
        self.syn && !self.ack_flag && !self.rst
    }
}

/// Result of slicing one packet from the virtual interface
#[derive(Debug)]
pub enum ParsedPacket {
    Tcp { key: FlowKey, segment: TcpSegment },
    Udp { key: FlowKey, payload: Bytes },
    /// Valid IP that the relay does not carry (ICMP, fragments, ...)
    Unsupported(&'static str),
}

/// Slice a raw IPv4/IPv6 packet
pub fn parse_packet(data: &[u8]) -> Result<ParsedPacket> {
    let sliced = SlicedPacket::from_ip(data)
        .map_err(|e| BridgeError::Packet(format!("malformed IP packet: {e}")))?;

    let (src_ip, dst_ip) = match &sliced.net {
        Some(NetSlice::Ipv4(ipv4)) => (
            IpAddr::V4(ipv4.header().source_addr()),
            IpAddr::V4(ipv4.header().destination_addr()),
        ),
        Some(NetSlice::Ipv6(ipv6)) => (
            IpAddr::V6(ipv6.header().source_addr()),
            IpAddr::V6(ipv6.header().destination_addr()),
        ),
        _ => return Ok(ParsedPacket::Unsupported("not an IP packet")),
    };

    match &sliced.transport {
        Some(TransportSlice::Tcp(tcp)) => {
            let mss = if tcp.syn() {
                tcp.options_iterator().find_map(|option| match option {
                    Ok(TcpOptionElement::MaximumSegmentSize(mss)) => Some(mss),
                    _ => None,
                })
            } else {
                None
            };
            Ok(ParsedPacket::Tcp {
                key: FlowKey {
                    protocol: FlowProtocol::Tcp,
                    src: SocketAddr::new(src_ip, tcp.source_port()),
                    dst: SocketAddr::new(dst_ip, tcp.destination_port()),
                },
                segment: TcpSegment {
                    seq: tcp.sequence_number(),
                    ack: tcp.acknowledgment_number(),
                    window: tcp.window_size(),
                    syn: tcp.syn(),
                    ack_flag: tcp.ack(),
                    fin: tcp.fin(),
                    rst: tcp.rst(),
                    mss,
                    payload: Bytes::copy_from_slice(tcp.payload()),
                },
            })
        }
        Some(TransportSlice::Udp(udp)) => Ok(ParsedPacket::Udp {
            key: FlowKey {
                protocol: FlowProtocol::Udp,
                src: SocketAddr::new(src_ip, udp.source_port()),
                dst: SocketAddr::new(dst_ip, udp.destination_port()),
            },
            payload: Bytes::copy_from_slice(udp.payload()),
        }),
        Some(_) => Ok(ParsedPacket::Unsupported("transport not relayed")),
        None => Ok(ParsedPacket::Unsupported("fragmented or transport-less packet")),
    }
}

fn ip_builder(src: IpAddr, dst: IpAddr) -> Result<PacketBuilderStep<IpHeaders>> {
    match (src, dst) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            Ok(PacketBuilder::ipv4(src.octets(), dst.octets(), DEFAULT_TTL))
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            Ok(PacketBuilder::ipv6(src.octets(), dst.octets(), DEFAULT_TTL))
        }
        _ => Err(BridgeError::Packet(format!(
            "address family mismatch between {src} and {dst}"
        ))),
    }
}

/// Build an IP/UDP packet
pub fn build_udp_packet(src: SocketAddr, dst: SocketAddr, payload: &[u8]) -> Result<Bytes> {
    let builder = ip_builder(src.ip(), dst.ip())?.udp(src.port(), dst.port());
    let mut out = Vec::with_capacity(builder.size(payload.len()));
    builder
        .write(&mut out, payload)
        .map_err(|e| BridgeError::Packet(format!("failed to build UDP packet: {e}")))?;
    Ok(Bytes::from(out))
}

/// Flags of an outgoing TCP segment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub syn: bool,
    pub fin: bool,
    pub rst: bool,
    pub psh: bool,
}

impl TcpFlags {
    pub const NONE: Self = Self {
        syn: false,
        fin: false,
        rst: false,
        psh: false,
    };
    pub const SYN: Self = Self {
        syn: true,
        ..Self::NONE
    };
    pub const FIN: Self = Self {
        fin: true,
        ..Self::NONE
    };
    pub const RST: Self = Self {
        rst: true,
        ..Self::NONE
    };
    pub const PSH: Self = Self {
        psh: true,
        ..Self::NONE
    };
}

/// Outgoing TCP segment description
#[derive(Debug, Clone, Copy)]
pub struct TcpPacketSpec<'a> {
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub seq: u32,
    /// Acknowledgment number; `None` leaves the ACK flag clear
    pub ack: Option<u32>,
    pub window: u16,
    pub flags: TcpFlags,
    pub mss: Option<u16>,
    pub payload: &'a [u8],
}

/// Build an IP/TCP packet
pub fn build_tcp_packet(spec: &TcpPacketSpec<'_>) -> Result<Bytes> {
    let mut builder = ip_builder(spec.src.ip(), spec.dst.ip())?.tcp(
        spec.src.port(),
        spec.dst.port(),
        spec.seq,
        spec.window,
    );
    if spec.flags.syn {
        builder = builder.syn();
    }
    if spec.flags.fin {
        builder = builder.fin();
    }
    if spec.flags.rst {
        builder = builder.rst();
    }
    if spec.flags.psh {
        builder = builder.psh();
    }
    if let Some(ack) = spec.ack {
        builder = builder.ack(ack);
    }
    if let Some(mss) = spec.mss {
        builder = builder
            .options(&[TcpOptionElement::MaximumSegmentSize(mss)])
            .map_err(|e| BridgeError::Packet(format!("failed to add MSS option: {e}")))?;
    }

    let mut out = Vec::with_capacity(builder.size(spec.payload.len()));
    builder
        .write(&mut out, spec.payload)
        .map_err(|e| BridgeError::Packet(format!("failed to build TCP packet: {e}")))?;
    Ok(Bytes::from(out))
}

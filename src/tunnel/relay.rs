//! Packet relay between the host and the user-space TCP/IP stack
//!
//! One task reads packets written by the host, admits them against the
//! flow table and feeds them to `ipstack`, which terminates TCP and splits
//! UDP into per-flow streams. Every stream the stack accepts is served by
//! its own task; packets the stack produces are queued for the host under
//! their flow. Flow tasks are supervised in a `JoinSet`; when the tunnel
//! closes they are given the grace period to finish and are then aborted.

use super::flow_table::{Admission, FlowTable};
use super::packet::{parse_packet, FlowKey, FlowProtocol, ParsedPacket, TcpSegment};
use super::stack_device::StackDevice;
use super::stats::RelayStats;
use super::tcp_flow::{flow_reset, reset_reply, run_tcp_flow};
use super::tun_queue::TunQueue;
use super::udp_flow::run_udp_flow;
use crate::config::RelayConfig;
use crate::error::Result;
use crate::protocol::ProxyTransport;
use bytes::Bytes;
use ipstack::{IpStack, IpStackConfig, IpStackStream};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// How often finished flows are purged from the table
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);
/// Bytes of a rejected packet included in trace logs
const TRACE_DUMP_LEN: usize = 40;

/// Everything a flow task needs; dropping it finishes the flow
pub(crate) struct FlowContext {
    pub key: FlowKey,
    pub transport: Arc<dyn ProxyTransport>,
    pub queue: Arc<TunQueue>,
    pub cancel: CancellationToken,
    pub idle_timeout: Duration,
    id: u64,
    table: Arc<FlowTable>,
    stats: Arc<RelayStats>,
}

impl FlowContext {
    /// Queue a built packet for the host, logging build failures
    pub fn emit(&self, packet: Result<Bytes>) {
        match packet {
            Ok(packet) => self.queue.push(self.key, packet),
            Err(e) => log::warn!("{}: {e}", self.key),
        }
    }

    /// Abort the host's end of this TCP flow
    pub fn reset_host(&self) {
        let (stack_next, host_next) = self.table.sequence(&self.key);
        self.emit(flow_reset(&self.key, stack_next, host_next));
    }
}

impl Drop for FlowContext {
    fn drop(&mut self) {
        self.table.finish(&self.key, self.id);
        self.stats.flow_closed();
    }
}

fn flow_key(protocol: FlowProtocol, host: SocketAddr, remote: SocketAddr) -> FlowKey {
    FlowKey {
        protocol,
        src: host,
        dst: remote,
    }
}

pub(crate) struct PacketRelay {
    transport: Arc<dyn ProxyTransport>,
    queue: Arc<TunQueue>,
    table: Arc<FlowTable>,
    stats: Arc<RelayStats>,
    cancel: CancellationToken,
    config: RelayConfig,
    udp_enabled: bool,
}

impl PacketRelay {
    pub fn new(
        transport: Arc<dyn ProxyTransport>,
        queue: Arc<TunQueue>,
        stats: Arc<RelayStats>,
        cancel: CancellationToken,
        config: RelayConfig,
        udp_enabled: bool,
    ) -> Self {
        Self {
            transport,
            queue,
            table: Arc::new(FlowTable::new(config.max_flows)),
            stats,
            cancel,
            config,
            udp_enabled,
        }
    }

    /// Relay `inbound` through the stack until the tunnel is cancelled
    pub async fn run(self, mut inbound: mpsc::Receiver<Bytes>) {
        let (device, to_stack, mut from_stack) = StackDevice::create_pair(self.config.inbound_queue_size);
        let mut stack_config = IpStackConfig::default();
        stack_config.mtu(self.config.mtu);
        stack_config.udp_timeout(self.config.udp_idle_timeout());
        let mut stack = IpStack::new(stack_config, device);

        let mut flows = JoinSet::new();
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(joined) = flows.join_next(), if !flows.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            log::error!("flow task panicked: {e}");
                        }
                    }
                }
                packet = from_stack.recv() => match packet {
                    Some(packet) => self.to_host(packet),
                    None => {
                        log::error!("user-space stack stopped");
                        break;
                    }
                },
                packet = inbound.recv() => match packet {
                    Some(packet) => self.from_host(packet, &to_stack),
                    None => break,
                },
                accepted = stack.accept() => match accepted {
                    Ok(stream) => self.spawn_flow(stream, &mut flows),
                    Err(e) => {
                        log::error!("user-space stack failed: {e}");
                        break;
                    }
                },
                _ = sweep.tick() => {
                    let removed = self.table.sweep(Instant::now());
                    if removed > 0 {
                        log::debug!("swept {removed} finished flows, {} remain", self.table.len());
                    }
                }
            }
        }

        let grace = self.config.close_grace_period();
        let drained = tokio::time::timeout(grace, async {
            while flows.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            log::debug!("aborting {} flow tasks after {grace:?}", flows.len());
            flows.shutdown().await;
        }
        self.table.clear();
        log::debug!("packet relay stopped");
    }

    fn from_host(&self, packet: Bytes, to_stack: &mpsc::Sender<Bytes>) {
        RelayStats::bump(&self.stats.packets_from_host);
        RelayStats::add(&self.stats.bytes_from_host, packet.len());

        let admitted = match parse_packet(&packet) {
            Ok(ParsedPacket::Tcp { key, segment }) => self.admit_tcp(key, &segment),
            Ok(ParsedPacket::Udp { key, .. }) => self.admit_udp(key),
            Ok(ParsedPacket::Unsupported(reason)) => {
                RelayStats::bump(&self.stats.unsupported_drops);
                log::trace!("dropping packet: {reason}");
                None
            }
            Err(e) => {
                RelayStats::bump(&self.stats.unsupported_drops);
                let dump = &packet[..packet.len().min(TRACE_DUMP_LEN)];
                log::trace!("dropping packet: {e} [{}]", hex::encode(dump));
                None
            }
        };
        let Some((key, admission)) = admitted else {
            return;
        };

        match to_stack.try_send(packet) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                RelayStats::bump(&self.stats.inbound_drops);
                // The stack never saw the opening packet
                if let Admission::New(id) = admission {
                    self.table.discard(&key, id);
                }
            }
            Err(TrySendError::Closed(_)) => log::debug!("{key}: user-space stack is gone"),
        }
    }

    fn admit_tcp(&self, key: FlowKey, segment: &TcpSegment) -> Option<(FlowKey, Admission)> {
        let admission = if segment.is_initial_syn() {
            match self.table.open(key) {
                Ok(admission) => admission,
                Err(e) => {
                    RelayStats::bump(&self.stats.refused_flows);
                    log::warn!("{key}: {e}, refusing connection");
                    self.reject(key, segment);
                    return None;
                }
            }
        } else if self.table.contains(&key) {
            Admission::Existing
        } else {
            if !segment.rst {
                log::trace!("{key}: segment for unknown flow, resetting");
                self.reject(key, segment);
            }
            return None;
        };

        if let Admission::New(_) = admission {
            RelayStats::bump(&self.stats.tcp_flows_opened);
            log::debug!("{key}: new flow");
        }
        self.table.note_host_seq(&key, segment.seq.wrapping_add(segment.seq_len()));
        Some((key, admission))
    }

    fn admit_udp(&self, key: FlowKey) -> Option<(FlowKey, Admission)> {
        if !self.udp_enabled {
            RelayStats::bump(&self.stats.udp_disabled_drops);
            log::trace!("{key}: UDP disabled for this tunnel, dropping");
            return None;
        }
        match self.table.open(key) {
            Ok(admission) => {
                if let Admission::New(_) = admission {
                    RelayStats::bump(&self.stats.udp_flows_opened);
                    log::debug!("{key}: new flow");
                }
                Some((key, admission))
            }
            Err(e) => {
                RelayStats::bump(&self.stats.refused_flows);
                log::warn!("{key}: {e}, dropping datagram");
                None
            }
        }
    }

    /// Queue a packet the stack produced for the host
    fn to_host(&self, packet: Bytes) {
        let key = match parse_packet(&packet) {
            Ok(ParsedPacket::Tcp { key, segment }) => {
                let key = flow_key(FlowProtocol::Tcp, key.dst, key.src);
                self.table
                    .note_stack_seq(&key, segment.seq.wrapping_add(segment.seq_len()));
                key
            }
            Ok(ParsedPacket::Udp { key, .. }) => flow_key(FlowProtocol::Udp, key.dst, key.src),
            Ok(ParsedPacket::Unsupported(reason)) => {
                log::trace!("stack produced an unrelayed packet: {reason}");
                return;
            }
            Err(e) => {
                log::warn!("stack produced a malformed packet: {e}");
                return;
            }
        };
        self.queue.push(key, packet);
    }

    fn spawn_flow(&self, stream: IpStackStream, flows: &mut JoinSet<()>) {
        match stream {
            IpStackStream::Tcp(stream) => {
                let key = flow_key(FlowProtocol::Tcp, stream.local_addr(), stream.peer_addr());
                if let Some(ctx) = self.flow_context(key, self.config.tcp_idle_timeout()) {
                    flows.spawn(run_tcp_flow(ctx, stream));
                }
            }
            IpStackStream::Udp(stream) => {
                let key = flow_key(FlowProtocol::Udp, stream.local_addr(), stream.peer_addr());
                if let Some(ctx) = self.flow_context(key, self.config.udp_idle_timeout()) {
                    flows.spawn(run_udp_flow(ctx, stream));
                }
            }
            _ => log::trace!("stack passed up a packet the relay does not carry"),
        }
    }

    fn flow_context(&self, key: FlowKey, idle_timeout: Duration) -> Option<FlowContext> {
        let Some(id) = self.table.claim(&key) else {
            log::debug!("{key}: stream for a flow that was not admitted, dropping");
            return None;
        };
        self.stats.active_flows.fetch_add(1, Ordering::Relaxed);
        Some(FlowContext {
            key,
            transport: self.transport.clone(),
            queue: self.queue.clone(),
            cancel: self.cancel.child_token(),
            idle_timeout,
            id,
            table: self.table.clone(),
            stats: self.stats.clone(),
        })
    }

    fn reject(&self, key: FlowKey, segment: &TcpSegment) {
        match reset_reply(&key, segment) {
            Ok(packet) => self.queue.push(key, packet),
            Err(e) => log::warn!("{key}: {e}"),
        }
    }
}

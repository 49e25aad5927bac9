//! Per-flow TCP relay
//!
//! The host's TCP connection is terminated by the user-space stack; each
//! accepted stream is carried over its own proxy stream to the
//! destination. Half-closes are passed through in both directions. A flow
//! that fails on the proxy side, or goes idle, is reset toward the host.

use super::packet::{build_tcp_packet, FlowKey, TcpFlags, TcpPacketSpec, TcpSegment};
use super::relay::FlowContext;
use crate::error::Result;
use bytes::Bytes;
use ipstack::IpStackTcpStream;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;

/// Largest single read from either side
const COPY_CHUNK: usize = 16 * 1024;

/// RST answering a segment that matches no flow
pub(crate) fn reset_reply(key: &FlowKey, segment: &TcpSegment) -> Result<Bytes> {
    let (seq, ack) = if segment.ack_flag {
        (segment.ack, None)
    } else {
        (0, Some(segment.seq.wrapping_add(segment.seq_len())))
    };
    reset_packet(key, seq, ack)
}

/// RST aborting a live flow, placed at the stack's next sequence number
pub(crate) fn flow_reset(key: &FlowKey, stack_next: Option<u32>, host_next: Option<u32>) -> Result<Bytes> {
    reset_packet(key, stack_next.unwrap_or(0), host_next)
}

fn reset_packet(key: &FlowKey, seq: u32, ack: Option<u32>) -> Result<Bytes> {
    build_tcp_packet(&TcpPacketSpec {
        src: key.dst,
        dst: key.src,
        seq,
        ack,
        window: 0,
        flags: TcpFlags::RST,
        mss: None,
        payload: &[],
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlowEnd {
    Finished,
    Cancelled,
    HostReset,
    ProxyFailed,
    Idle,
}

/// Relay one accepted TCP stream until it finishes, fails or the tunnel closes
pub(crate) async fn run_tcp_flow(ctx: FlowContext, stream: IpStackTcpStream) {
    let dial = tokio::select! {
        _ = ctx.cancel.cancelled() => return,
        dial = ctx.transport.dial_stream(ctx.key.dst) => dial,
    };
    let proxy = match dial {
        Ok(proxy) => proxy,
        Err(e) => {
            log::debug!("{}: proxy refused stream: {e}", ctx.key);
            ctx.reset_host();
            return;
        }
    };
    log::debug!("{}: proxy stream open", ctx.key);

    let (mut host_rx, mut host_tx) = tokio::io::split(stream);
    let (mut proxy_rx, mut proxy_tx) = tokio::io::split(proxy);
    let mut host_buf = vec![0u8; COPY_CHUNK];
    let mut proxy_buf = vec![0u8; COPY_CHUNK];
    let (mut host_open, mut proxy_open) = (true, true);
    let idle_timeout = ctx.idle_timeout;
    let mut idle_deadline = Instant::now() + idle_timeout;

    // Writes run inside the arms: a stalled peer holds the flow until the
    // relay aborts it.
    let end = loop {
        if !host_open && !proxy_open {
            break FlowEnd::Finished;
        }
        tokio::select! {
            _ = ctx.cancel.cancelled() => break FlowEnd::Cancelled,
            read = host_rx.read(&mut host_buf), if host_open => match read {
                Ok(0) => {
                    host_open = false;
                    let _ = proxy_tx.shutdown().await;
                }
                Ok(n) => {
                    idle_deadline = Instant::now() + idle_timeout;
                    if let Err(e) = proxy_tx.write_all(&host_buf[..n]).await {
                        log::debug!("{}: proxy write failed: {e}", ctx.key);
                        break FlowEnd::ProxyFailed;
                    }
                }
                Err(e) => {
                    log::debug!("{}: host side closed: {e}", ctx.key);
                    break FlowEnd::HostReset;
                }
            },
            read = proxy_rx.read(&mut proxy_buf), if proxy_open => match read {
                Ok(0) => {
                    proxy_open = false;
                    let _ = host_tx.shutdown().await;
                }
                Ok(n) => {
                    idle_deadline = Instant::now() + idle_timeout;
                    if let Err(e) = host_tx.write_all(&proxy_buf[..n]).await {
                        log::debug!("{}: host write failed: {e}", ctx.key);
                        break FlowEnd::HostReset;
                    }
                }
                Err(e) => {
                    log::debug!("{}: proxy read failed: {e}", ctx.key);
                    break FlowEnd::ProxyFailed;
                }
            },
            _ = tokio::time::sleep_until(idle_deadline) => break FlowEnd::Idle,
        }
    };

    if matches!(end, FlowEnd::ProxyFailed | FlowEnd::Idle) {
        ctx.reset_host();
    }
    log::debug!("{}: flow ended ({end:?})", ctx.key);
}

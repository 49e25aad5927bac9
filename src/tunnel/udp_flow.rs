//! Per-flow UDP relay
//!
//! Each UDP 5-tuple gets its own packet session through the proxy. The
//! stack hands the host's datagrams over as a stream; replies written back
//! to it reach the host from the destination it wrote to, whichever
//! address the proxy reports.

use super::relay::FlowContext;
use ipstack::IpStackUdpStream;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;

/// Largest datagram carried in either direction
const MAX_DATAGRAM: usize = 65_535;

pub(crate) async fn run_udp_flow(ctx: FlowContext, mut stream: IpStackUdpStream) {
    let opened = tokio::select! {
        _ = ctx.cancel.cancelled() => return,
        opened = ctx.transport.listen_packet() => opened,
    };
    let session = match opened {
        Ok(session) => session,
        Err(e) => {
            log::debug!("{}: proxy refused packet session: {e}", ctx.key);
            return;
        }
    };

    let target = ctx.key.dst;
    let idle_timeout = ctx.idle_timeout;
    let mut idle_deadline = Instant::now() + idle_timeout;
    let mut host_buf = vec![0u8; MAX_DATAGRAM];
    let mut proxy_buf = vec![0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            read = stream.read(&mut host_buf) => match read {
                Ok(0) => break,
                Ok(n) => {
                    idle_deadline = Instant::now() + idle_timeout;
                    if let Err(e) = session.send_to(&host_buf[..n], target).await {
                        log::debug!("{}: send failed: {e}", ctx.key);
                        break;
                    }
                }
                Err(e) => {
                    log::debug!("{}: host side closed: {e}", ctx.key);
                    break;
                }
            },
            received = session.recv_from(&mut proxy_buf) => {
                let (n, source) = match received {
                    Ok(received) => received,
                    Err(e) => {
                        log::debug!("{}: receive failed: {e}", ctx.key);
                        break;
                    }
                };
                if source != target && !source.ip().is_unspecified() {
                    log::trace!("{}: reply from {source} relabelled as {target}", ctx.key);
                }
                idle_deadline = Instant::now() + idle_timeout;
                if let Err(e) = stream.write_all(&proxy_buf[..n]).await {
                    log::debug!("{}: host write failed: {e}", ctx.key);
                    break;
                }
            }
            _ = tokio::time::sleep_until(idle_deadline) => {
                log::debug!("{}: idle for {idle_timeout:?}, closing", ctx.key);
                break;
            }
        }
    }
}

//! TCP and UDP reachability probes through the proxy
//!
//! The TCP probe opens and authenticates a proxy connection (and, when a
//! probe target is configured, CONNECTs through it). The UDP probe sends a
//! DNS query through a UDP association and waits for the matching answer.
//! Both run concurrently, each bounded by its own timeout, and neither
//! touches tunnel state.

use crate::client::Client;
use crate::error::{BridgeError, ErrorCode, PlatformError, Result};
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RecordType};
use std::future::Future;
use std::time::Duration;

/// Interval between repeated DNS queries while the UDP probe waits
const UDP_PROBE_RESEND_INTERVAL: Duration = Duration::from_secs(1);
/// Largest DNS answer the probe reads
const UDP_PROBE_BUFFER_SIZE: usize = 1500;

/// Outcome of [`check_connectivity`].
///
/// `None` means the protocol works through the proxy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectivityResult {
    pub tcp: Option<PlatformError>,
    pub udp: Option<PlatformError>,
}

impl ConnectivityResult {
    /// Both protocols work
    #[must_use]
    pub fn is_fully_reachable(&self) -> bool {
        self.tcp.is_none() && self.udp.is_none()
    }
}

/// Probe TCP and UDP reachability through `client`'s proxy.
///
/// Never fails as a whole; each protocol reports its own error.
pub async fn check_connectivity(client: &Client) -> ConnectivityResult {
    let transport_config = &client.config().transport;
    let (tcp, udp) = tokio::join!(
        run_probe("TCP", transport_config.tcp_probe_timeout(), probe_tcp(client)),
        run_probe("UDP", transport_config.udp_probe_timeout(), probe_udp(client)),
    );
    ConnectivityResult { tcp, udp }
}

async fn run_probe<F>(protocol: &str, limit: Duration, probe: F) -> Option<PlatformError>
where
    F: Future<Output = Result<()>>,
{
    match tokio::time::timeout(limit, probe).await {
        Ok(Ok(())) => {
            log::info!("{protocol} connectivity through proxy OK");
            None
        }
        Ok(Err(e)) => {
            log::warn!("{protocol} connectivity check failed: {e}");
            Some(PlatformError::from(e))
        }
        Err(_) => {
            log::warn!("{protocol} connectivity check timed out after {limit:?}");
            Some(PlatformError::new(
                ErrorCode::Timeout,
                format!("{protocol} probe got no answer within {limit:?}"),
            ))
        }
    }
}

async fn probe_tcp(client: &Client) -> Result<()> {
    let transport = client.transport();
    let control = transport.open_control().await?;
    drop(control);

    if let Some(target) = client.config().tcp_probe_target()? {
        let stream = transport.dial_stream(target).await?;
        drop(stream);
        log::debug!("TCP probe reached {target}");
    }
    Ok(())
}

async fn probe_udp(client: &Client) -> Result<()> {
    let config = client.config();
    let resolver = config.udp_probe_resolver()?;
    let (id, query) = build_dns_query(&config.transport.udp_probe_domain)?;

    let session = client.transport().listen_packet().await?;
    let mut buf = vec![0u8; UDP_PROBE_BUFFER_SIZE];
    let mut resend = tokio::time::interval(UDP_PROBE_RESEND_INTERVAL);

    loop {
        tokio::select! {
            _ = resend.tick() => {
                session.send_to(&query, resolver).await?;
                log::trace!("UDP probe query {id} sent to {resolver}");
            }
            received = session.recv_from(&mut buf) => {
                let (n, source) = received?;
                if is_answer_to(&buf[..n], id) {
                    log::debug!("UDP probe answered by {source}");
                    return Ok(());
                }
                log::debug!("UDP probe ignoring unrelated datagram from {source}");
            }
        }
    }
}

/// DNS `A` query for `domain` with a random id
pub(crate) fn build_dns_query(domain: &str) -> Result<(u16, Vec<u8>)> {
    let name = Name::from_ascii(domain)
        .map_err(|e| BridgeError::Config(format!("Invalid UDP probe domain '{domain}': {e}")))?;
    let id: u16 = rand::random();

    let mut message = Message::new();
    message
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(name, RecordType::A));
    Ok((id, message.to_vec()?))
}

fn is_answer_to(datagram: &[u8], id: u16) -> bool {
    Message::from_vec(datagram)
        .map(|message| message.id() == id && message.message_type() == MessageType::Response)
        .unwrap_or(false)
}

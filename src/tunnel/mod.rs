//! Tunnel sessions
//!
//! A [`Tunnel`] relays IP packets between the host's virtual interface and
//! the proxy. The host pushes packets in with [`Tunnel::write`]; packets
//! for the host leave through the [`TunWriter`] it supplied. Each session
//! runs three kinds of task on the ambient runtime:
//!
//! - the packet relay, which feeds the user-space TCP/IP stack and owns
//!   one task per flow
//! - the TUN writer, which drains the fair per-flow queue into the host
//! - the control monitor, which watches the authenticated proxy session
//!   and re-opens it, failing the tunnel once reconnects are exhausted

mod flow_table;
pub mod packet;
mod relay;
mod stack_device;
mod stats;
mod tcp_flow;
mod tun_queue;
mod udp_flow;

pub use stats::TunnelStats;

use crate::client::Client;
use crate::error::{BridgeError, PlatformError, Result};
use crate::protocol::{ControlChannel, ProxyTransport};
use bytes::Bytes;
use relay::PacketRelay;
use stats::RelayStats;
use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tun_queue::{run_tun_writer, TunQueue};
use uuid::Uuid;

/// Extra time `close` allows beyond the grace period before aborting tasks
const CLOSE_MARGIN: Duration = Duration::from_millis(500);

/// Sink for packets travelling towards the host's virtual interface.
///
/// `write_packet` is called from one task at a time and must not block; a
/// writer that cannot take a packet right now returns
/// [`io::ErrorKind::WouldBlock`] and the packet is retried.
pub trait TunWriter: Send + Sync {
    /// Hand one complete IP packet to the host
    fn write_packet(&self, packet: &[u8]) -> io::Result<()>;

    /// Called exactly once when the tunnel using this writer closes
    fn close(&self) {}

    /// Identity used to refuse a second live tunnel on the same writer.
    ///
    /// Defaults to the address of the shared writer object.
    fn identity(&self) -> Option<usize> {
        None
    }
}

/// Lifecycle of a tunnel session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TunnelState {
    Connecting = 0,
    Active = 1,
    Closing = 2,
    Closed = 3,
}

impl TunnelState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TunnelState::Connecting,
            1 => TunnelState::Active,
            2 => TunnelState::Closing,
            _ => TunnelState::Closed,
        }
    }
}

// Writers that currently back a live tunnel
lazy_static::lazy_static! {
    static ref ACTIVE_WRITERS: Mutex<HashSet<usize>> = Mutex::new(HashSet::new());
}

/// Exclusive use of a TUN writer; released on drop
struct WriterClaim(usize);

impl WriterClaim {
    fn acquire(identity: usize) -> Result<Self> {
        let mut active = ACTIVE_WRITERS.lock().unwrap_or_else(PoisonError::into_inner);
        if !active.insert(identity) {
            return Err(BridgeError::TunWriter(
                "TUN writer is already attached to an active tunnel".to_string(),
            ));
        }
        Ok(Self(identity))
    }
}

impl Drop for WriterClaim {
    fn drop(&mut self) {
        ACTIVE_WRITERS
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.0);
    }
}

struct ReconnectPolicy {
    max_attempts: u32,
    delay: Duration,
}

struct TunnelShared {
    session_id: Uuid,
    state: AtomicU8,
    udp_enabled: bool,
    inbound: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
    queue: Arc<TunQueue>,
    stats: Arc<RelayStats>,
    tun_writer: Arc<dyn TunWriter>,
    writer_closed: AtomicBool,
    claim: Mutex<Option<WriterClaim>>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    last_error: Mutex<Option<PlatformError>>,
    close_timeout: Duration,
}

impl TunnelShared {
    fn state(&self) -> TunnelState {
        TunnelState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: TunnelState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Move to `Closing` unless already further along
    fn begin_closing(&self) {
        let _ = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current < TunnelState::Closing as u8).then_some(TunnelState::Closing as u8)
            });
    }

    fn close_writer(&self) {
        if !self.writer_closed.swap(true, Ordering::SeqCst) {
            self.tun_writer.close();
        }
    }

    fn release_writer(&self) {
        self.claim.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    /// Fatal session error: record it and tear the tunnel down
    fn fail(self: Arc<Self>, error: PlatformError) {
        log::error!("tunnel {}: {error}", self.session_id);
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(error);
        self.begin_closing();
        self.cancel.cancel();
        tokio::spawn(async move { self.shutdown().await });
    }

    async fn shutdown(&self) {
        let mut tasks = self.tasks.lock().await;
        if self.state() == TunnelState::Closed {
            return;
        }
        self.begin_closing();
        self.cancel.cancel();
        self.queue.close();

        let handles: Vec<JoinHandle<()>> = tasks.drain(..).collect();
        let aborts: Vec<AbortHandle> = handles.iter().map(JoinHandle::abort_handle).collect();
        let joined = tokio::time::timeout(self.close_timeout, futures::future::join_all(handles)).await;
        if joined.is_err() {
            log::warn!(
                "tunnel {}: tasks still running after {:?}, aborting",
                self.session_id,
                self.close_timeout
            );
            aborts.iter().for_each(AbortHandle::abort);
        }

        self.close_writer();
        self.release_writer();
        self.set_state(TunnelState::Closed);
        log::info!("tunnel {}: closed", self.session_id);
    }
}

/// Live tunnel session
pub struct Tunnel {
    shared: Arc<TunnelShared>,
}

/// Open a tunnel through `client`'s proxy, delivering packets to `tun_writer`.
///
/// `udp_enabled` is fixed for the life of the tunnel; when false, UDP
/// packets from the host are dropped.
///
/// # Errors
/// - `TunWriter` if the writer already backs a live tunnel
/// - authentication, network or timeout errors if the proxy session
///   cannot be established
pub async fn connect_tunnel(tun_writer: Arc<dyn TunWriter>, client: &Client, udp_enabled: bool) -> Result<Tunnel> {
    let identity = tun_writer
        .identity()
        .unwrap_or_else(|| Arc::as_ptr(&tun_writer) as *const () as usize);
    let claim = WriterClaim::acquire(identity)?;

    let session_id = Uuid::new_v4();
    let config = client.config();
    let transport = client.transport().clone();
    log::info!(
        "tunnel {session_id}: connecting via {} (UDP {})",
        transport.describe(),
        if udp_enabled { "enabled" } else { "disabled" }
    );

    let connect_timeout = config.transport.connect_timeout();
    let control = tokio::time::timeout(connect_timeout, transport.open_control())
        .await
        .map_err(|_| {
            BridgeError::Timeout(format!("proxy session not established within {connect_timeout:?}"))
        })?
        .inspect_err(|e| log::warn!("tunnel {session_id}: {e}"))?;

    let relay_config = config.relay.clone();
    let stats = Arc::new(RelayStats::default());
    let queue = Arc::new(TunQueue::new(relay_config.max_queued_packets_per_flow, stats.clone()));
    let cancel = CancellationToken::new();
    let (inbound_tx, inbound_rx) = mpsc::channel(relay_config.inbound_queue_size);

    let shared = Arc::new(TunnelShared {
        session_id,
        state: AtomicU8::new(TunnelState::Connecting as u8),
        udp_enabled,
        inbound: inbound_tx,
        cancel: cancel.clone(),
        queue: queue.clone(),
        stats: stats.clone(),
        tun_writer: tun_writer.clone(),
        writer_closed: AtomicBool::new(false),
        claim: Mutex::new(Some(claim)),
        tasks: tokio::sync::Mutex::new(Vec::new()),
        last_error: Mutex::new(None),
        close_timeout: relay_config.close_grace_period() + CLOSE_MARGIN,
    });

    let policy = ReconnectPolicy {
        max_attempts: config.transport.max_reconnect_attempts,
        delay: config.transport.reconnect_delay(),
    };
    let relay = PacketRelay::new(
        transport.clone(),
        queue.clone(),
        stats.clone(),
        cancel.clone(),
        relay_config,
        udp_enabled,
    );

    // Held until the tasks are registered so a failing monitor cannot tear
    // down a half-built session.
    let mut tasks = shared.tasks.lock().await;
    tasks.push(tokio::spawn(run_tun_writer(queue, tun_writer, stats, cancel.clone())));
    tasks.push(tokio::spawn(relay.run(inbound_rx)));
    tasks.push(tokio::spawn(monitor_control(
        control,
        transport,
        policy,
        cancel,
        Arc::downgrade(&shared),
    )));
    let _ = shared.state.compare_exchange(
        TunnelState::Connecting as u8,
        TunnelState::Active as u8,
        Ordering::SeqCst,
        Ordering::SeqCst,
    );
    drop(tasks);

    log::info!("tunnel {session_id}: active");
    Ok(Tunnel { shared })
}

impl Tunnel {
    /// Submit one IP packet from the host.
    ///
    /// Never blocks. When the relay is saturated the packet is dropped, as
    /// an IP network would.
    ///
    /// # Errors
    /// `TunnelClosed` once the tunnel is closing or closed.
    pub fn write(&self, packet: &[u8]) -> Result<()> {
        if self.shared.state() != TunnelState::Active {
            return Err(BridgeError::TunnelClosed("tunnel is not active".to_string()));
        }
        if packet.is_empty() {
            return Ok(());
        }
        match self.shared.inbound.try_send(Bytes::copy_from_slice(packet)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                RelayStats::bump(&self.shared.stats.inbound_drops);
                Ok(())
            }
            Err(TrySendError::Closed(_)) => {
                Err(BridgeError::TunnelClosed("packet relay has stopped".to_string()))
            }
        }
    }

    /// Close the tunnel and wait for its tasks to stop.
    ///
    /// Idempotent; the TUN writer is closed exactly once.
    pub async fn close(&self) {
        self.shared.shutdown().await;
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.state() == TunnelState::Active
    }

    #[must_use]
    pub fn state(&self) -> TunnelState {
        self.shared.state()
    }

    #[must_use]
    pub fn udp_enabled(&self) -> bool {
        self.shared.udp_enabled
    }

    #[must_use]
    pub fn session_id(&self) -> Uuid {
        self.shared.session_id
    }

    /// Error that ended the session, if it ended on its own
    #[must_use]
    pub fn last_error(&self) -> Option<PlatformError> {
        self.shared
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn stats(&self) -> TunnelStats {
        self.shared.stats.snapshot()
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        let shared = &self.shared;
        if shared.state() == TunnelState::Closed {
            return;
        }
        log::debug!("tunnel {} dropped without close", shared.session_id);
        shared.begin_closing();
        shared.cancel.cancel();
        shared.queue.close();
        if let Ok(mut tasks) = shared.tasks.try_lock() {
            tasks.drain(..).for_each(|task| task.abort());
        }
        shared.close_writer();
        shared.release_writer();
        shared.set_state(TunnelState::Closed);
    }
}

/// Watch the control channel, re-opening it when the proxy drops it
async fn monitor_control(
    mut control: Box<dyn ControlChannel>,
    transport: Arc<dyn ProxyTransport>,
    policy: ReconnectPolicy,
    cancel: CancellationToken,
    shared: Weak<TunnelShared>,
) {
    loop {
        let reason = tokio::select! {
            _ = cancel.cancelled() => return,
            reason = control.closed() => reason,
        };
        log::warn!("control channel lost: {reason}");

        match reconnect(transport.as_ref(), &policy, &cancel, reason).await {
            Ok(Some(reopened)) => {
                log::info!("control channel re-established");
                control = reopened;
            }
            Ok(None) => return,
            Err(e) => {
                if let Some(shared) = shared.upgrade() {
                    shared.fail(PlatformError::from(e));
                }
                return;
            }
        }
    }
}

/// `Ok(None)` when cancelled, `Err` with the last failure once attempts run out
async fn reconnect(
    transport: &dyn ProxyTransport,
    policy: &ReconnectPolicy,
    cancel: &CancellationToken,
    mut last_error: BridgeError,
) -> Result<Option<Box<dyn ControlChannel>>> {
    for attempt in 1..=policy.max_attempts {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(None),
            _ = tokio::time::sleep(policy.delay) => {}
        }
        let opened = tokio::select! {
            _ = cancel.cancelled() => return Ok(None),
            opened = transport.open_control() => opened,
        };
        match opened {
            Ok(control) => return Ok(Some(control)),
            Err(e) => {
                log::warn!(
                    "control channel reconnect {attempt}/{} failed: {e}",
                    policy.max_attempts
                );
                last_error = e;
            }
        }
    }
    Err(last_error)
}

//! Fair, bounded queue of packets waiting for the host TUN writer
//!
//! Each flow gets its own FIFO capped at `max_queued_packets_per_flow`.
//! When a flow's FIFO is full the oldest packet is dropped, so one busy
//! flow only ever loses its own packets. The writer task serves flows
//! round-robin through the `ready` ring, one packet per turn, which keeps
//! a flow's packets in order while interleaving flows fairly.

use super::packet::FlowKey;
use super::stats::RelayStats;
use super::TunWriter;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Pause before retrying a write the host reported as would-block
const WRITER_BACKOFF: Duration = Duration::from_millis(5);

#[derive(Default)]
struct QueueState {
    flows: HashMap<FlowKey, VecDeque<Bytes>>,
    ready: VecDeque<FlowKey>,
    closed: bool,
}

pub(crate) struct TunQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    per_flow_limit: usize,
    stats: Arc<RelayStats>,
}

impl TunQueue {
    pub fn new(per_flow_limit: usize, stats: Arc<RelayStats>) -> Self {
        Self {
            state: Mutex::default(),
            notify: Notify::new(),
            per_flow_limit: per_flow_limit.max(1),
            stats,
        }
    }

    /// Queue `packet` for the host; drops the flow's oldest packet when full
    pub fn push(&self, key: FlowKey, packet: Bytes) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.closed {
                return;
            }
            let queue = state.flows.entry(key).or_default();
            let was_idle = queue.is_empty();
            queue.push_back(packet);
            let overflow = queue.len() > self.per_flow_limit;
            if overflow {
                queue.pop_front();
            }
            if was_idle {
                state.ready.push_back(key);
            }
            if overflow {
                RelayStats::bump(&self.stats.queue_drops);
                log::trace!("{key}: TUN queue full, dropped oldest packet");
            }
        }
        self.notify.notify_one();
    }

    /// Next packet in round-robin order, if any is queued
    pub fn pop(&self) -> Option<(FlowKey, Bytes)> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        while let Some(key) = state.ready.pop_front() {
            let Some(queue) = state.flows.get_mut(&key) else {
                continue;
            };
            let Some(packet) = queue.pop_front() else {
                state.flows.remove(&key);
                continue;
            };
            if queue.is_empty() {
                state.flows.remove(&key);
            } else {
                state.ready.push_back(key);
            }
            return Some((key, packet));
        }
        None
    }

    /// Wait for the next packet; `None` once the queue is closed and drained
    pub async fn next(&self) -> Option<(FlowKey, Bytes)> {
        loop {
            if let Some(item) = self.pop() {
                return Some(item);
            }
            if self.is_closed() {
                return None;
            }
            self.notify.notified().await;
        }
    }

    /// Stop accepting packets and discard what is queued
    pub fn close(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.closed = true;
            state.flows.clear();
            state.ready.clear();
        }
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).closed
    }

    /// Packets queued across all flows
    #[cfg(test)]
    pub fn len(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.flows.values().map(VecDeque::len).sum()
    }
}

/// Drain `queue` into the host writer until cancelled or closed
pub(crate) async fn run_tun_writer(
    queue: Arc<TunQueue>,
    writer: Arc<dyn TunWriter>,
    stats: Arc<RelayStats>,
    cancel: CancellationToken,
) {
    loop {
        let (key, packet) = tokio::select! {
            _ = cancel.cancelled() => break,
            item = queue.next() => match item {
                Some(item) => item,
                None => break,
            },
        };

        loop {
            match writer.write_packet(&packet) {
                Ok(()) => {
                    RelayStats::bump(&stats.packets_to_host);
                    RelayStats::add(&stats.bytes_to_host, packet.len());
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(WRITER_BACKOFF) => {}
                    }
                }
                Err(e) => {
                    RelayStats::bump(&stats.write_errors);
                    log::warn!("{key}: host rejected packet: {e}");
                    break;
                }
            }
        }
    }
    log::debug!("TUN writer task stopped");
}

//! Relay counters

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters shared by the relay tasks
#[derive(Debug, Default)]
pub(crate) struct RelayStats {
    pub packets_from_host: AtomicU64,
    pub bytes_from_host: AtomicU64,
    pub packets_to_host: AtomicU64,
    pub bytes_to_host: AtomicU64,
    pub tcp_flows_opened: AtomicU64,
    pub udp_flows_opened: AtomicU64,
    pub active_flows: AtomicU64,
    /// Host packets dropped because the inbound queue was full
    pub inbound_drops: AtomicU64,
    /// Packets to the host dropped by a full per-flow queue
    pub queue_drops: AtomicU64,
    /// Host packets the relay does not carry (ICMP, fragments, malformed)
    pub unsupported_drops: AtomicU64,
    /// UDP packets dropped because the session has UDP disabled
    pub udp_disabled_drops: AtomicU64,
    /// Flow-opening packets turned away by a full flow table
    pub refused_flows: AtomicU64,
    /// Packets the host writer rejected
    pub write_errors: AtomicU64,
}

impl RelayStats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn flow_closed(&self) {
        let _ = self
            .active_flows
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn snapshot(&self) -> TunnelStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        TunnelStats {
            packets_from_host: load(&self.packets_from_host),
            bytes_from_host: load(&self.bytes_from_host),
            packets_to_host: load(&self.packets_to_host),
            bytes_to_host: load(&self.bytes_to_host),
            tcp_flows_opened: load(&self.tcp_flows_opened),
            udp_flows_opened: load(&self.udp_flows_opened),
            active_flows: load(&self.active_flows),
            inbound_drops: load(&self.inbound_drops),
            queue_drops: load(&self.queue_drops),
            unsupported_drops: load(&self.unsupported_drops),
            udp_disabled_drops: load(&self.udp_disabled_drops),
            refused_flows: load(&self.refused_flows),
            write_errors: load(&self.write_errors),
        }
    }
}

/// Point-in-time copy of a tunnel's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunnelStats {
    pub packets_from_host: u64,
    pub bytes_from_host: u64,
    pub packets_to_host: u64,
    pub bytes_to_host: u64,
    pub tcp_flows_opened: u64,
    pub udp_flows_opened: u64,
    pub active_flows: u64,
    pub inbound_drops: u64,
    pub queue_drops: u64,
    pub unsupported_drops: u64,
    pub udp_disabled_drops: u64,
    pub refused_flows: u64,
    pub write_errors: u64,
}

impl TunnelStats {
    /// Every packet dropped by the relay, whatever the reason
    #[must_use]
    pub fn total_drops(&self) -> u64 {
        self.inbound_drops
            + self.queue_drops
            + self.unsupported_drops
            + self.udp_disabled_drops
            + self.refused_flows
    }
}

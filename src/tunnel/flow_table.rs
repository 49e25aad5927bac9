//! Flow table: admission and sequence bookkeeping per 5-tuple
//!
//! The relay admits a flow when the host opens it (a TCP SYN or the first
//! UDP datagram) and only forwards packets of admitted flows to the stack.
//! Flow tasks finish their own entry on exit, keyed by the id they were
//! given, so a task that outlives its entry never touches a newer flow
//! that reuses the same 5-tuple. Finished TCP entries linger so the
//! closing exchange can still reach the stack.

use super::packet::{FlowKey, FlowProtocol};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// How long finished TCP entries, and admitted flows the stack never
/// accepted, are kept before a sweep drops them
pub(crate) const FLOW_LINGER: Duration = Duration::from_secs(10);

fn seq_newer(candidate: u32, current: u32) -> bool {
    (candidate.wrapping_sub(current) as i32) > 0
}

struct FlowEntry {
    id: u64,
    opened_at: Instant,
    /// A flow task owns the entry
    claimed: bool,
    finished_at: Option<Instant>,
    /// Next sequence number the host will send
    host_next: Option<u32>,
    /// Next sequence number the stack will send to the host
    stack_next: Option<u32>,
}

impl FlowEntry {
    fn is_open(&self) -> bool {
        self.finished_at.is_none()
    }
}

/// How a packet that opens a flow was admitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    New(u64),
    Existing,
}

#[derive(Debug, thiserror::Error)]
#[error("flow table full ({0} flows)")]
pub(crate) struct FlowTableFull(pub usize);

pub(crate) struct FlowTable {
    flows: Mutex<HashMap<FlowKey, FlowEntry>>,
    next_id: AtomicU64,
    max_flows: usize,
}

impl FlowTable {
    pub fn new(max_flows: usize) -> Self {
        Self {
            flows: Mutex::default(),
            next_id: AtomicU64::new(1),
            max_flows,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<FlowKey, FlowEntry>> {
        self.flows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit a flow, replacing a finished entry for the same key
    pub fn open(&self, key: FlowKey) -> Result<Admission, FlowTableFull> {
        let mut flows = self.lock();
        if flows.get(&key).is_some_and(FlowEntry::is_open) {
            return Ok(Admission::Existing);
        }
        let open = flows.values().filter(|entry| entry.is_open()).count();
        if open >= self.max_flows {
            return Err(FlowTableFull(open));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        flows.insert(
            key,
            FlowEntry {
                id,
                opened_at: Instant::now(),
                claimed: false,
                finished_at: None,
                host_next: None,
                stack_next: None,
            },
        );
        Ok(Admission::New(id))
    }

    /// Whether packets for `key` should still reach the stack
    pub fn contains(&self, key: &FlowKey) -> bool {
        self.lock().contains_key(key)
    }

    /// Hand an open, unowned entry to the task serving the stack's stream
    pub fn claim(&self, key: &FlowKey) -> Option<u64> {
        let mut flows = self.lock();
        let entry = flows.get_mut(key).filter(|entry| entry.is_open() && !entry.claimed)?;
        entry.claimed = true;
        Some(entry.id)
    }

    /// Forget flow `id` entirely, if it still owns `key`
    pub fn discard(&self, key: &FlowKey, id: u64) {
        let mut flows = self.lock();
        if flows.get(key).is_some_and(|entry| entry.id == id) {
            flows.remove(key);
        }
    }

    /// Mark flow `id` finished; returns false if a newer flow owns `key`
    pub fn finish(&self, key: &FlowKey, id: u64) -> bool {
        let mut flows = self.lock();
        if !flows.get(key).is_some_and(|entry| entry.id == id) {
            return false;
        }
        if key.protocol == FlowProtocol::Udp {
            flows.remove(key);
        } else if let Some(entry) = flows.get_mut(key) {
            entry.finished_at.get_or_insert_with(Instant::now);
        }
        true
    }

    pub fn note_host_seq(&self, key: &FlowKey, next: u32) {
        if let Some(entry) = self.lock().get_mut(key) {
            if entry.host_next.map_or(true, |current| seq_newer(next, current)) {
                entry.host_next = Some(next);
            }
        }
    }

    pub fn note_stack_seq(&self, key: &FlowKey, next: u32) {
        if let Some(entry) = self.lock().get_mut(key) {
            if entry.stack_next.map_or(true, |current| seq_newer(next, current)) {
                entry.stack_next = Some(next);
            }
        }
    }

    /// `(stack_next, host_next)` for building a reset toward the host
    pub fn sequence(&self, key: &FlowKey) -> (Option<u32>, Option<u32>) {
        self.lock()
            .get(key)
            .map_or((None, None), |entry| (entry.stack_next, entry.host_next))
    }

    /// Drop entries finished, or never accepted, for longer than
    /// [`FLOW_LINGER`]; returns how many were removed
    pub fn sweep(&self, now: Instant) -> usize {
        let mut flows = self.lock();
        let before = flows.len();
        flows.retain(|_, entry| {
            let expired = |since: Instant| now.saturating_duration_since(since) >= FLOW_LINGER;
            match entry.finished_at {
                Some(finished) => !expired(finished),
                None => entry.claimed || !expired(entry.opened_at),
            }
        });
        before - flows.len()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(protocol: FlowProtocol, port: u16) -> FlowKey {
        FlowKey {
            protocol,
            src: format!("10.0.0.2:{port}").parse().unwrap(),
            dst: "9.9.9.9:53".parse().unwrap(),
        }
    }

    fn udp(port: u16) -> FlowKey {
        key(FlowProtocol::Udp, port)
    }

    fn tcp(port: u16) -> FlowKey {
        key(FlowProtocol::Tcp, port)
    }

    #[test]
    fn test_capacity_limit() {
        let table = FlowTable::new(1);
        assert!(matches!(table.open(udp(1)), Ok(Admission::New(_))));
        assert!(table.open(udp(2)).is_err());
        assert!(matches!(table.open(udp(1)), Ok(Admission::Existing)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_finished_flows_free_capacity() {
        let table = FlowTable::new(1);
        table.open(tcp(1)).unwrap();
        let id = table.claim(&tcp(1)).unwrap();
        assert!(table.finish(&tcp(1), id));

        // Lingering, but no longer counted against the limit
        assert!(table.contains(&tcp(1)));
        assert!(matches!(table.open(tcp(2)), Ok(Admission::New(_))));
    }

    #[test]
    fn test_stale_finish_keeps_newer_flow() {
        let table = FlowTable::new(4);
        table.open(udp(1)).unwrap();
        let old = table.claim(&udp(1)).unwrap();
        assert!(table.finish(&udp(1), old));
        assert!(!table.contains(&udp(1)));

        let Ok(Admission::New(new)) = table.open(udp(1)) else {
            panic!("finished flow was not replaced");
        };
        assert_ne!(old, new);
        assert!(!table.finish(&udp(1), old));
        assert!(table.contains(&udp(1)));
        assert_eq!(table.claim(&udp(1)), Some(new));
        assert_eq!(table.claim(&udp(1)), None);
    }

    #[test]
    fn test_sequence_tracking_ignores_older_numbers() {
        let table = FlowTable::new(4);
        table.open(tcp(1)).unwrap();
        table.note_stack_seq(&tcp(1), u32::MAX - 1);
        table.note_stack_seq(&tcp(1), 5);
        table.note_stack_seq(&tcp(1), u32::MAX);
        table.note_host_seq(&tcp(1), 101);
        assert_eq!(table.sequence(&tcp(1)), (Some(5), Some(101)));
        assert_eq!(table.sequence(&tcp(2)), (None, None));
    }

    #[test]
    fn test_sweep_drops_lingering_and_unaccepted_flows() {
        let table = FlowTable::new(8);
        table.open(tcp(1)).unwrap();
        let finished = table.claim(&tcp(1)).unwrap();
        table.finish(&tcp(1), finished);
        table.open(tcp(2)).unwrap();
        table.open(tcp(3)).unwrap();
        table.claim(&tcp(3));

        let now = Instant::now();
        assert_eq!(table.sweep(now), 0);
        assert_eq!(table.sweep(now + FLOW_LINGER), 2);
        assert!(table.contains(&tcp(3)));
    }
}

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, trace};

use crate::capture::PacketDescriptor;
use crate::types::TerminationReason;
use super::flow::{FlowKey, FlowRecord};

/// A record that has left the table, owned by whoever finalizes it.
#[derive(Debug, Clone)]
pub struct TerminatedFlow {
    pub record: FlowRecord,
    pub reason: TerminationReason,
}

#[derive(Debug, Default)]
struct TableState {
    flows: HashMap<FlowKey, FlowRecord>,
    total_packets: u64,
    total_bytes: u64,
    latest_packet_us: u64,
}

/// Snapshot of table counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableCounters {
    pub live_flows: usize,
    pub total_packets: u64,
    pub total_bytes: u64,
    pub latest_packet_us: u64,
}

/// All live flows, keyed by canonical key.
///
/// Every operation holds the one lock for its whole duration. Records leave
/// the table by value, so feature extraction and classification happen on the
/// caller's side without the lock.
#[derive(Debug, Default)]
pub struct FlowTable {
    state: Mutex<TableState>,
    idle_timeout: Option<Duration>,
}

impl FlowTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// A table that also checks idleness on the packet path: a record idle for
    /// longer than `idle_timeout` at the arriving packet's own timestamp is
    /// closed as a timeout and the packet opens a new flow.
    pub fn with_idle_timeout(idle_timeout: Duration) -> Self {
        Self { idle_timeout: Some(idle_timeout), ..Self::default() }
    }

    fn lock(&self) -> MutexGuard<'_, TableState> {
        // A panicking holder cannot leave a record half-updated in a way that matters here.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Routes a packet to its flow, creating the flow when needed. A FIN or RST
    /// closes the flow right away and hands it back. Records closed by the
    /// packet-path idle check come first.
    pub fn upsert_and_route(&self, pkt: &PacketDescriptor) -> Vec<TerminatedFlow> {
        let key = FlowKey::from_packet(pkt);
        let now = pkt.time_micros();
        let mut state = self.lock();
        let mut terminated = Vec::new();

        state.total_packets += 1;
        state.total_bytes += pkt.packet_len as u64;
        state.latest_packet_us = state.latest_packet_us.max(now);

        if let Some(timeout) = self.idle_timeout {
            let timeout_us = timeout.as_micros() as u64;
            let stale = state
                .flows
                .get(&key)
                .is_some_and(|flow| now.saturating_sub(flow.last_seen_micros()) > timeout_us);
            if stale {
                if let Some(record) = state.flows.remove(&key) {
                    debug!(flow = %key, packets = record.total_packets(), "flow idle past timeout");
                    terminated.push(TerminatedFlow { record, reason: TerminationReason::Timeout });
                }
            }
        }

        let flow = match state.flows.entry(key) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                trace!(flow = %key, "new flow");
                e.insert(FlowRecord::new(pkt))
            }
        };
        flow.add_packet(pkt);

        if pkt.tcp_flags.is_terminal() {
            if let Some(record) = state.flows.remove(&key) {
                debug!(flow = %key, packets = record.total_packets(), "flow closed by FIN/RST");
                terminated.push(TerminatedFlow { record, reason: TerminationReason::FinRst });
            }
        }
        terminated
    }

    /// Removes every flow idle for longer than `idle_timeout` as of `now_us`.
    pub fn sweep_timeouts(&self, now_us: u64, idle_timeout: Duration) -> Vec<TerminatedFlow> {
        let timeout_us = idle_timeout.as_micros() as u64;
        let mut state = self.lock();

        let expired: Vec<FlowKey> = state
            .flows
            .iter()
            .filter(|(_, flow)| now_us.saturating_sub(flow.last_seen_micros()) > timeout_us)
            .map(|(key, _)| *key)
            .collect();

        let terminated: Vec<TerminatedFlow> = expired
            .iter()
            .filter_map(|key| state.flows.remove(key))
            .map(|record| TerminatedFlow { record, reason: TerminationReason::Timeout })
            .collect();

        if !terminated.is_empty() {
            debug!(expired = terminated.len(), live = state.flows.len(), "swept idle flows");
        }
        terminated
    }

    /// Removes every remaining flow. Used on shutdown.
    pub fn flush_all(&self) -> Vec<TerminatedFlow> {
        let mut state = self.lock();
        state
            .flows
            .drain()
            .map(|(_, record)| TerminatedFlow { record, reason: TerminationReason::Forced })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn counters(&self) -> TableCounters {
        let state = self.lock();
        TableCounters {
            live_flows: state.flows.len(),
            total_packets: state.total_packets,
            total_bytes: state.total_bytes,
            latest_packet_us: state.latest_packet_us,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::flow::tests::packet;
    use std::sync::Arc;
    use std::thread;

    const TIMEOUT: Duration = Duration::from_secs(15);

    #[test]
    fn syn_then_fin_closes_flow() {
        let table = FlowTable::new();
        let syn = packet([10, 0, 0, 1], 40000, [10, 0, 0, 2], 80, 1_000_000, 0x02);
        let fin = packet([10, 0, 0, 2], 80, [10, 0, 0, 1], 40000, 3_000_000, 0x01);

        assert!(table.upsert_and_route(&syn).is_empty());
        assert_eq!(table.len(), 1);

        let done = table.upsert_and_route(&fin).pop().unwrap();
        assert_eq!(done.reason, TerminationReason::FinRst);
        assert_eq!(done.record.fwd.packet_count, 1);
        assert_eq!(done.record.bwd.packet_count, 1);
        assert_eq!(done.record.flags.syn, 1);
        assert_eq!(done.record.flags.fin, 1);
        assert_eq!(done.record.duration_micros(), 2_000_000);
        assert!(table.is_empty());
    }

    #[test]
    fn packet_after_close_starts_a_new_record() {
        let table = FlowTable::new();
        let rst = packet([10, 0, 0, 1], 1, [10, 0, 0, 2], 2, 0, 0x04);
        assert_eq!(table.upsert_and_route(&rst).len(), 1);

        let late = packet([10, 0, 0, 2], 2, [10, 0, 0, 1], 1, 10, 0x10);
        assert!(table.upsert_and_route(&late).is_empty());
        let flows = table.flush_all();
        assert_eq!(flows.len(), 1);
        // the new record is oriented on the late packet
        assert_eq!(flows[0].record.src_port, 2);
        assert_eq!(flows[0].record.total_packets(), 1);
    }

    #[test]
    fn sweep_removes_only_idle_flows_and_is_idempotent() {
        let table = FlowTable::new();
        let start = 10_000_000;
        table.upsert_and_route(&packet([10, 0, 0, 1], 1, [10, 0, 0, 2], 2, start, 0x10));
        let later = packet([10, 0, 0, 3], 1, [10, 0, 0, 4], 2, start + 5_000_000, 0x10);
        table.upsert_and_route(&later);

        let now = start + TIMEOUT.as_micros() as u64 + 1;
        let swept = table.sweep_timeouts(now, TIMEOUT);
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].reason, TerminationReason::Timeout);
        assert_eq!(swept[0].record.src_ip.to_string(), "10.0.0.1");
        assert_eq!(table.len(), 1);

        assert!(table.sweep_timeouts(now, TIMEOUT).is_empty());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn sweep_at_exact_timeout_keeps_flow() {
        let table = FlowTable::new();
        table.upsert_and_route(&packet([10, 0, 0, 1], 1, [10, 0, 0, 2], 2, 0, 0));
        assert!(table.sweep_timeouts(TIMEOUT.as_micros() as u64, TIMEOUT).is_empty());
    }

    #[test]
    fn idle_gap_on_packet_path_splits_the_flow() {
        let table = FlowTable::with_idle_timeout(TIMEOUT);
        let first = packet([10, 0, 0, 1], 5353, [10, 0, 0, 2], 53, 1_000_000, 0);
        assert!(table.upsert_and_route(&first).is_empty());

        // exactly at the timeout the record still absorbs the packet
        let edge = packet([10, 0, 0, 2], 53, [10, 0, 0, 1], 5353, 16_000_000, 0);
        assert!(table.upsert_and_route(&edge).is_empty());

        let late = packet([10, 0, 0, 1], 5353, [10, 0, 0, 2], 53, 116_000_000, 0);
        let expired = table.upsert_and_route(&late);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].reason, TerminationReason::Timeout);
        assert_eq!(expired[0].record.total_packets(), 2);
        assert_eq!(expired[0].record.duration_micros(), 15_000_000);

        let rest = table.flush_all();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].record.flow_start_time, 116_000_000);
    }

    #[test]
    fn stale_record_expires_before_closing_packet_opens_a_new_one() {
        let table = FlowTable::with_idle_timeout(TIMEOUT);
        table.upsert_and_route(&packet([10, 0, 0, 1], 1, [10, 0, 0, 2], 2, 0, 0x10));
        let rst = packet([10, 0, 0, 2], 2, [10, 0, 0, 1], 1, 60_000_000, 0x04);
        let done = table.upsert_and_route(&rst);
        let reasons: Vec<_> = done.iter().map(|f| f.reason).collect();
        assert_eq!(reasons, vec![TerminationReason::Timeout, TerminationReason::FinRst]);
        assert_eq!(done[1].record.src_port, 2);
        assert!(table.is_empty());
    }

    #[test]
    fn plain_table_never_expires_on_packet_path() {
        let table = FlowTable::new();
        table.upsert_and_route(&packet([10, 0, 0, 1], 1, [10, 0, 0, 2], 2, 0, 0));
        let much_later = packet([10, 0, 0, 1], 1, [10, 0, 0, 2], 2, u64::MAX, 0);
        assert!(table.upsert_and_route(&much_later).is_empty());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn flush_all_empties_table() {
        let table = FlowTable::new();
        for port in 1..=5 {
            table.upsert_and_route(&packet([10, 0, 0, 1], port, [10, 0, 0, 2], 80, 0, 0x10));
        }
        let flushed = table.flush_all();
        assert_eq!(flushed.len(), 5);
        assert!(flushed.iter().all(|f| f.reason == TerminationReason::Forced));
        assert!(table.is_empty());
        assert!(table.flush_all().is_empty());
    }

    #[test]
    fn counters_track_traffic() {
        let table = FlowTable::new();
        table.upsert_and_route(&packet([10, 0, 0, 1], 1, [10, 0, 0, 2], 2, 7, 0));
        table.upsert_and_route(&packet([10, 0, 0, 2], 2, [10, 0, 0, 1], 1, 3, 0));
        let c = table.counters();
        assert_eq!(c.live_flows, 1);
        assert_eq!(c.total_packets, 2);
        assert_eq!(c.total_bytes, 120);
        assert_eq!(c.latest_packet_us, 7);
    }

    #[test]
    fn concurrent_sweep_never_loses_packets() {
        let table = Arc::new(FlowTable::new());
        let sweeper = {
            let table = table.clone();
            thread::spawn(move || {
                let mut swept = 0u64;
                for _ in 0..200 {
                    swept += table
                        .sweep_timeouts(u64::MAX, Duration::ZERO)
                        .iter()
                        .map(|f| f.record.total_packets())
                        .sum::<u64>();
                }
                swept
            })
        };

        for i in 0..2_000u64 {
            let port = (i % 7) as u16;
            table.upsert_and_route(&packet([10, 0, 0, 1], port, [10, 0, 0, 2], 80, i, 0x10));
        }
        let swept = sweeper.join().unwrap();
        let flushed: u64 = table.flush_all().iter().map(|f| f.record.total_packets()).sum();
        assert_eq!(swept + flushed, 2_000);
    }
}

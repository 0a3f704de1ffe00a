use crossbeam_channel::{never, select, tick, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

use crate::types::NetworkStats;
use super::table::{FlowTable, TerminatedFlow};

#[inline]
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Which "now" idle flows are measured against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepClock {
    /// Wall clock. Live capture.
    Wall,
    /// Packet timestamps. Offline replay: expiry runs on the capture path,
    /// see `FeatureProcessor::packet_handler`.
    Capture,
}

#[derive(Debug, Clone, Copy)]
pub struct SweepSettings {
    pub idle_timeout: Duration,
    pub interval: Duration,
    pub stats_interval: Duration,
    pub clock: SweepClock,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(15),
            interval: Duration::from_secs(1),
            stats_interval: Duration::from_secs(10),
            clock: SweepClock::Wall,
        }
    }
}

#[inline]
fn rate(total: u64, previous: u64, dt: f64) -> f64 {
    total.saturating_sub(previous) as f64 / dt
}

/// Hands terminated flows to the classifier. Returns false once nobody listens.
pub fn dispatch(flows: Vec<TerminatedFlow>, classifier_tx: &Sender<TerminatedFlow>) -> bool {
    for flow in flows {
        if classifier_tx.send(flow).is_err() {
            warn!("classifier channel closed, dropping terminated flows");
            return false;
        }
    }
    true
}

/// Periodic maintenance: expires idle flows against the wall clock and logs
/// traffic counters. With the capture clock only the counters are logged.
/// Runs until `running` is cleared or `stop_rx` disconnects.
pub fn sweep_loop(
    running: Arc<AtomicBool>,
    stop_rx: Receiver<()>,
    table: Arc<FlowTable>,
    classifier_tx: Sender<TerminatedFlow>,
    settings: SweepSettings,
) {
    let start_time = now_micros();

    // Timers to expire idle flows and to report counters
    let expire_tick = match settings.clock {
        SweepClock::Wall => tick(settings.interval),
        SweepClock::Capture => never(),
    };
    let stats_tick = tick(settings.stats_interval);

    let mut last_rate_us = start_time;
    let mut last_packets = 0u64;
    let mut last_bytes = 0u64;

    info!(
        idle_timeout_s = settings.idle_timeout.as_secs(),
        interval_ms = settings.interval.as_millis() as u64,
        clock = ?settings.clock,
        "sweeper started"
    );

    loop {
        if !running.load(Ordering::Relaxed) { break; }

        let keep_going = select! {
            recv(stop_rx) -> _ => false,

            recv(expire_tick) -> _ => {
                let expired = table.sweep_timeouts(now_micros(), settings.idle_timeout);
                dispatch(expired, &classifier_tx)
            },

            recv(stats_tick) -> _ => {
                let now = now_micros();
                let dt = (now.saturating_sub(last_rate_us) as f64 / 1_000_000.0).max(1e-6);
                let counters = table.counters();

                let stats = NetworkStats {
                    flow_count: counters.live_flows as i64,
                    packets_per_second: rate(counters.total_packets, last_packets, dt),
                    bytes_per_second: rate(counters.total_bytes, last_bytes, dt),
                    total_packets: counters.total_packets as i64,
                    total_bytes: counters.total_bytes as i64,
                    uptime_seconds: (now.saturating_sub(start_time) / 1_000_000) as i64,
                };
                debug!(?stats, "traffic");

                last_packets = counters.total_packets;
                last_bytes = counters.total_bytes;
                last_rate_us = now;
                true
            },
        };
        if !keep_going { break; }
    }

    info!("sweeper exiting");
}

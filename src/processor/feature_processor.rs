use crossbeam_channel::{bounded, Sender};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::thread::{self, JoinHandle};

use super::engine::{self, SweepClock, SweepSettings};
use super::table::{FlowTable, TerminatedFlow};
use crate::capture::PacketDescriptor;

/// Owns the flow table and the periodic sweep thread.
pub struct FeatureProcessor {
    running: Arc<AtomicBool>,
    sweep_thread: Option<JoinHandle<()>>,
    stop_tx: Option<Sender<()>>,
    table: Arc<FlowTable>,
    classifier_tx: Sender<TerminatedFlow>,
    settings: SweepSettings,
}

impl FeatureProcessor {
    pub fn new(classifier_tx: Sender<TerminatedFlow>, settings: SweepSettings) -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            sweep_thread: None,
            stop_tx: None,
            table: Arc::new(FlowTable::with_idle_timeout(settings.idle_timeout)),
            classifier_tx,
            settings,
        }
    }

    pub fn table(&self) -> Arc<FlowTable> { self.table.clone() }

    /// Packet sink for the capture thread. With the capture clock the whole
    /// table is also swept against packet time once per sweep interval of
    /// capture time, so replay output does not depend on replay speed.
    pub fn packet_handler(&self) -> impl FnMut(PacketDescriptor) + Send + 'static {
        let table = self.table.clone();
        let tx = self.classifier_tx.clone();
        let settings = self.settings;
        let interval_us = settings.interval.as_micros() as u64;
        let mut next_sweep_us: Option<u64> = None;

        move |pkt| {
            if settings.clock == SweepClock::Capture {
                let now = pkt.time_micros();
                let due = next_sweep_us.get_or_insert(now.saturating_add(interval_us));
                if now >= *due {
                    *due = now.saturating_add(interval_us);
                    engine::dispatch(table.sweep_timeouts(now, settings.idle_timeout), &tx);
                }
            }
            engine::dispatch(table.upsert_and_route(&pkt), &tx);
        }
    }

    pub fn start_processor(&mut self) -> anyhow::Result<()> {
        if self.running.swap(true, Ordering::Relaxed) {
            anyhow::bail!("Processor is already running");
        }

        let (stop_tx, stop_rx) = bounded::<()>(0);
        let running = self.running.clone();
        let table = self.table.clone();
        let tx = self.classifier_tx.clone();
        let settings = self.settings;

        self.sweep_thread = Some(thread::spawn(move || {
            engine::sweep_loop(running, stop_rx, table, tx, settings)
        }));
        self.stop_tx = Some(stop_tx);
        Ok(())
    }

    /// Stops the sweeper and finalizes every flow still in the table.
    /// Returns how many flows were flushed.
    pub fn stop_processor(&mut self) -> usize {
        self.running.store(false, Ordering::Relaxed);
        // Disconnecting the stop channel wakes the sweeper immediately.
        self.stop_tx = None;
        if let Some(h) = self.sweep_thread.take() { let _ = h.join(); }

        let remaining = self.table.flush_all();
        let flushed = remaining.len();
        engine::dispatch(remaining, &self.classifier_tx);
        flushed
    }
}

impl Drop for FeatureProcessor {
    fn drop(&mut self) {
        if self.sweep_thread.is_some() {
            self.stop_processor();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::flow::tests::packet;
    use crate::types::TerminationReason;
    use crossbeam_channel::unbounded;

    #[test]
    fn stop_flushes_live_flows() {
        let (tx, rx) = unbounded();
        let mut processor = FeatureProcessor::new(tx, SweepSettings::default());
        processor.start_processor().unwrap();
        assert!(processor.start_processor().is_err());

        let mut sink = processor.packet_handler();
        sink(packet([10, 0, 0, 1], 1, [10, 0, 0, 2], 2, engine::now_micros(), 0x02));
        sink(packet([10, 0, 0, 1], 3, [10, 0, 0, 2], 4, engine::now_micros(), 0x10));
        sink(packet([10, 0, 0, 2], 4, [10, 0, 0, 1], 3, engine::now_micros(), 0x11));

        let closed = rx.try_recv().unwrap();
        assert_eq!(closed.reason, TerminationReason::FinRst);

        assert_eq!(processor.stop_processor(), 1);
        let forced = rx.try_recv().unwrap();
        assert_eq!(forced.reason, TerminationReason::Forced);
        assert!(processor.table().is_empty());
    }

    #[test]
    fn replay_sweeps_on_packet_time() {
        let (tx, rx) = unbounded();
        let settings = SweepSettings {
            idle_timeout: std::time::Duration::from_secs(15),
            clock: SweepClock::Capture,
            ..SweepSettings::default()
        };
        let mut processor = FeatureProcessor::new(tx, settings);
        processor.start_processor().unwrap();

        let mut sink = processor.packet_handler();
        sink(packet([10, 0, 0, 1], 1, [10, 0, 0, 2], 2, 1_000_000, 0x10));
        sink(packet([10, 0, 0, 3], 1, [10, 0, 0, 4], 2, 10_000_000, 0x10));
        assert!(rx.try_recv().is_err());

        // 16.5 s past the first flow's only packet, 7.5 s past the second
        sink(packet([10, 0, 0, 5], 1, [10, 0, 0, 6], 2, 17_500_000, 0x10));
        let expired = rx.try_recv().unwrap();
        assert_eq!(expired.reason, TerminationReason::Timeout);
        assert_eq!(expired.record.src_ip.to_string(), "10.0.0.1");
        assert!(rx.try_recv().is_err());
        assert_eq!(processor.table().len(), 2);

        assert_eq!(processor.stop_processor(), 2);
    }
}

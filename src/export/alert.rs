use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::warn;

use crate::processor::FlowRecord;

/// Append-only log of malicious flows, one line each.
pub struct AlertLog<W: Write> {
    out: W,
    alerts: u64,
}

impl AlertLog<BufWriter<File>> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open alert log {}", path.display()))?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write> AlertLog<W> {
    pub fn new(out: W) -> Self {
        Self { out, alerts: 0 }
    }

    /// `<utc time> ALERT src=<source ip> flow=<flow id> label=<label>`
    pub fn record(&mut self, flow: &FlowRecord, label: &str) -> Result<()> {
        let line = format!(
            "{} ALERT src={} flow={} label={}",
            Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            flow.src_ip,
            flow.flow_id(),
            label,
        );
        warn!(src = %flow.src_ip, flow = %flow.key, label, "malicious flow");
        writeln!(self.out, "{line}").context("append alert")?;
        // Alerts are flushed one by one so a crash loses none of them.
        self.out.flush().context("flush alert log")?;
        self.alerts += 1;
        Ok(())
    }

    pub fn alerts(&self) -> u64 {
        self.alerts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::flow::tests::packet;

    #[test]
    fn appends_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alerts.log");
        let pkt = packet([192, 168, 1, 9], 5555, [10, 0, 0, 1], 22, 0, 0x02);
        let mut flow = FlowRecord::new(&pkt);
        flow.add_packet(&pkt);

        {
            let mut log = AlertLog::open(&path).unwrap();
            log.record(&flow, "MALICIOUS").unwrap();
            assert_eq!(log.alerts(), 1);
        }
        AlertLog::open(&path).unwrap().record(&flow, "SSH-Patator").unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first = " ALERT src=192.168.1.9 flow=10.0.0.1:22-192.168.1.9:5555-6 label=MALICIOUS";
        assert!(lines[0].contains(first));
        assert!(lines[1].ends_with("label=SSH-Patator"));
    }
}

use serde::{Deserialize, Serialize};
use std::fmt;

/// Capture timestamp as delivered by the capture driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct CaptureTimestamp {
    pub secs: u64,
    pub micros: u32,
}

impl CaptureTimestamp {
    pub fn new(secs: u64, micros: u32) -> Self {
        Self { secs, micros }
    }

    pub fn from_micros(us: u64) -> Self {
        Self { secs: us / 1_000_000, micros: (us % 1_000_000) as u32 }
    }

    /// Absolute time in microseconds.
    #[inline]
    pub fn as_micros(&self) -> u64 {
        self.secs
            .saturating_mul(1_000_000)
            .saturating_add(self.micros as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
    pub ece: bool,
    pub cwr: bool,
}

impl TcpFlags {
    /// Decodes the TCP flags byte (offset 13 of the TCP header).
    pub fn from_bits(bits: u8) -> Self {
        Self {
            fin: bits & 0x01 != 0,
            syn: bits & 0x02 != 0,
            rst: bits & 0x04 != 0,
            psh: bits & 0x08 != 0,
            ack: bits & 0x10 != 0,
            urg: bits & 0x20 != 0,
            ece: bits & 0x40 != 0,
            cwr: bits & 0x80 != 0,
        }
    }

    /// FIN or RST closes a flow.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.fin || self.rst
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    Timeout,
    FinRst,
    Forced,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TerminationReason::Timeout => "timeout",
            TerminationReason::FinRst => "fin_rst",
            TerminationReason::Forced => "forced",
        };
        f.write_str(s)
    }
}

/// Outcome of scoring one terminated flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Verdict {
    Benign,
    Malicious,
    /// The classifier failed on this flow.
    Indeterminate,
    /// No model configured; the flow was exported without scoring.
    Unscored,
}

impl Verdict {
    pub fn label(&self) -> &'static str {
        match self {
            Verdict::Benign => "BENIGN",
            Verdict::Malicious => "MALICIOUS",
            Verdict::Indeterminate => "INDETERMINATE",
            Verdict::Unscored => "UNSCORED",
        }
    }

    pub fn is_malicious(&self) -> bool {
        matches!(self, Verdict::Malicious)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, Default)]
pub struct NetworkStats {
    pub flow_count: i64,
    pub packets_per_second: f64,
    pub bytes_per_second: f64,
    pub total_packets: i64,
    pub total_bytes: i64,
    pub uptime_seconds: i64,
}

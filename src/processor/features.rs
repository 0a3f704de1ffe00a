use chrono::{DateTime, Utc};

use super::flow::FlowRecord;

/// Gaps longer than this split active periods and count as idle time.
pub const ACTIVITY_THRESHOLD_US: u64 = 1_000_000;

pub const ID_COLUMNS: [&str; 7] = [
    "Flow ID",
    "Source IP",
    "Source Port",
    "Destination IP",
    "Destination Port",
    "Protocol",
    "Timestamp",
];

pub const LABEL_COLUMN: &str = "Label";

pub const FEATURE_COUNT: usize = 77;

/// Column order of the numeric feature block. Part of the output contract.
pub const FEATURE_NAMES: [&str; FEATURE_COUNT] = [
    "Flow Duration",
    "Total Fwd Packets",
    "Total Backward Packets",
    "Total Length of Fwd Packets",
    "Total Length of Bwd Packets",
    "Fwd Packet Length Max",
    "Fwd Packet Length Min",
    "Fwd Packet Length Mean",
    "Fwd Packet Length Std",
    "Bwd Packet Length Max",
    "Bwd Packet Length Min",
    "Bwd Packet Length Mean",
    "Bwd Packet Length Std",
    "Flow Bytes/s",
    "Flow Packets/s",
    "Flow IAT Mean",
    "Flow IAT Std",
    "Flow IAT Max",
    "Flow IAT Min",
    "Fwd IAT Total",
    "Fwd IAT Mean",
    "Fwd IAT Std",
    "Fwd IAT Max",
    "Fwd IAT Min",
    "Bwd IAT Total",
    "Bwd IAT Mean",
    "Bwd IAT Std",
    "Bwd IAT Max",
    "Bwd IAT Min",
    "Fwd PSH Flags",
    "Bwd PSH Flags",
    "Fwd URG Flags",
    "Bwd URG Flags",
    "Fwd Header Length",
    "Bwd Header Length",
    "Fwd Packets/s",
    "Bwd Packets/s",
    "Min Packet Length",
    "Max Packet Length",
    "Packet Length Mean",
    "Packet Length Std",
    "Packet Length Variance",
    "FIN Flag Count",
    "SYN Flag Count",
    "RST Flag Count",
    "PSH Flag Count",
    "ACK Flag Count",
    "URG Flag Count",
    "CWE Flag Count",
    "ECE Flag Count",
    "Down/Up Ratio",
    "Average Packet Size",
    "Avg Fwd Segment Size",
    "Avg Bwd Segment Size",
    "Fwd Header Length.1",
    "Fwd Avg Bytes/Bulk",
    "Fwd Avg Packets/Bulk",
    "Fwd Avg Bulk Rate",
    "Bwd Avg Bytes/Bulk",
    "Bwd Avg Packets/Bulk",
    "Bwd Avg Bulk Rate",
    "Subflow Fwd Packets",
    "Subflow Fwd Bytes",
    "Subflow Bwd Packets",
    "Subflow Bwd Bytes",
    "Init_Win_bytes_forward",
    "Init_Win_bytes_backward",
    "act_data_pkt_fwd",
    "min_seg_size_forward",
    "Active Mean",
    "Active Std",
    "Active Max",
    "Active Min",
    "Idle Mean",
    "Idle Std",
    "Idle Max",
    "Idle Min",
];

/// Full header row: identifiers, features, label.
pub fn csv_header() -> Vec<&'static str> {
    let mut header = Vec::with_capacity(ID_COLUMNS.len() + FEATURE_COUNT + 1);
    header.extend_from_slice(&ID_COLUMNS);
    header.extend_from_slice(&FEATURE_NAMES);
    header.push(LABEL_COLUMN);
    header
}

/// max / min / mean / sample std / sum of a sequence. All zero when empty.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SeqStats {
    pub max: f64,
    pub min: f64,
    pub mean: f64,
    pub std: f64,
    pub sum: f64,
}

impl SeqStats {
    pub fn of<I>(values: I) -> Self
    where
        I: IntoIterator<Item = f64>,
        I::IntoIter: Clone,
    {
        let iter = values.into_iter();
        let mut n = 0usize;
        let mut sum = 0.0;
        let mut max = f64::MIN;
        let mut min = f64::MAX;
        for v in iter.clone() {
            n += 1;
            sum += v;
            max = max.max(v);
            min = min.min(v);
        }
        if n == 0 {
            return Self::default();
        }

        let mean = sum / n as f64;
        let std = if n > 1 {
            let sq: f64 = iter.map(|v| (v - mean) * (v - mean)).sum();
            (sq / (n - 1) as f64).sqrt()
        } else {
            0.0
        };

        Self { max, min, mean, std, sum }
    }

    pub fn of_u32(values: &[u32]) -> Self {
        Self::of(values.iter().map(|&v| v as f64))
    }

    pub fn of_u64(values: &[u64]) -> Self {
        Self::of(values.iter().map(|&v| v as f64))
    }
}

/// Splits an inter-arrival sequence into active period lengths and idle gaps.
pub fn active_idle_periods(iats: &[u64], threshold: u64) -> (Vec<u64>, Vec<u64>) {
    let mut active = Vec::new();
    let mut idle = Vec::new();
    let mut current = 0u64;

    for &iat in iats {
        if iat > threshold {
            if current > 0 {
                active.push(current);
                current = 0;
            }
            idle.push(iat);
        } else {
            current += iat;
        }
    }
    if current > 0 {
        active.push(current);
    }

    (active, idle)
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector {
    values: [f64; FEATURE_COUNT],
}

impl Default for FeatureVector {
    fn default() -> Self {
        Self { values: [0.0; FEATURE_COUNT] }
    }
}

impl FeatureVector {
    pub fn as_slice(&self) -> &[f64] {
        &self.values
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        FEATURE_NAMES
            .iter()
            .position(|n| *n == name)
            .map(|i| self.values[i])
    }

    pub fn to_f32(&self) -> Vec<f32> {
        self.values.iter().map(|&v| as_f32(v)).collect()
    }

    /// Textual cells in column order. Integral values print without a fraction.
    pub fn to_fields(&self) -> Vec<String> {
        self.values.iter().map(|v| v.to_string()).collect()
    }
}

#[inline]
fn as_f32(v: f64) -> f32 {
    let f = v as f32;
    if f.is_finite() { f } else { 0.0 }
}

#[inline]
fn ratio(num: f64, den: f64) -> f64 {
    if den > 0.0 { num / den } else { 0.0 }
}

/// Computes the feature vector of a terminated flow. Pure: the record is only read.
pub fn extract(flow: &FlowRecord) -> FeatureVector {
    let duration_us = flow.duration_micros() as f64;
    let duration_s = duration_us / 1_000_000.0;

    let fwd_packets = flow.fwd.packet_count as f64;
    let bwd_packets = flow.bwd.packet_count as f64;
    let total_packets = fwd_packets + bwd_packets;
    let fwd_bytes = flow.fwd.byte_count as f64;
    let bwd_bytes = flow.bwd.byte_count as f64;
    let total_bytes = fwd_bytes + bwd_bytes;

    let fwd_len = SeqStats::of_u32(&flow.fwd.packet_lengths);
    let bwd_len = SeqStats::of_u32(&flow.bwd.packet_lengths);
    let pkt_len = SeqStats::of(
        flow.fwd
            .packet_lengths
            .iter()
            .chain(flow.bwd.packet_lengths.iter())
            .map(|&v| v as f64),
    );

    let flow_iat = SeqStats::of_u64(&flow.flow_iats);
    let fwd_iat = SeqStats::of_u64(&flow.fwd.iats);
    let bwd_iat = SeqStats::of_u64(&flow.bwd.iats);

    let (active_periods, idle_periods) =
        active_idle_periods(&flow.flow_iats, ACTIVITY_THRESHOLD_US);
    let active = SeqStats::of_u64(&active_periods);
    let idle = SeqStats::of_u64(&idle_periods);

    let fwd_header_len = flow.fwd.header_len_total() as f64;
    let bwd_header_len = flow.bwd.header_len_total() as f64;

    let init_win = |w: Option<u16>| w.map_or(-1.0, |w| w as f64);

    let values = [
        duration_us,
        fwd_packets,
        bwd_packets,
        fwd_bytes,
        bwd_bytes,
        fwd_len.max,
        fwd_len.min,
        fwd_len.mean,
        fwd_len.std,
        bwd_len.max,
        bwd_len.min,
        bwd_len.mean,
        bwd_len.std,
        ratio(total_bytes, duration_s),
        ratio(total_packets, duration_s),
        flow_iat.mean,
        flow_iat.std,
        flow_iat.max,
        flow_iat.min,
        fwd_iat.sum,
        fwd_iat.mean,
        fwd_iat.std,
        fwd_iat.max,
        fwd_iat.min,
        bwd_iat.sum,
        bwd_iat.mean,
        bwd_iat.std,
        bwd_iat.max,
        bwd_iat.min,
        flow.fwd.psh_flags as f64,
        flow.bwd.psh_flags as f64,
        flow.fwd.urg_flags as f64,
        flow.bwd.urg_flags as f64,
        fwd_header_len,
        bwd_header_len,
        ratio(fwd_packets, duration_s),
        ratio(bwd_packets, duration_s),
        pkt_len.min,
        pkt_len.max,
        pkt_len.mean,
        pkt_len.std,
        pkt_len.std * pkt_len.std,
        flow.flags.fin as f64,
        flow.flags.syn as f64,
        flow.flags.rst as f64,
        flow.flags.psh as f64,
        flow.flags.ack as f64,
        flow.flags.urg as f64,
        flow.flags.cwr as f64,
        flow.flags.ece as f64,
        ratio(bwd_packets, fwd_packets),
        ratio(total_bytes, total_packets),
        ratio(fwd_bytes, fwd_packets),
        ratio(bwd_bytes, bwd_packets),
        fwd_header_len,
        // Bulk transfer detection is not performed.
        0.0,
        0.0,
        0.0,
        0.0,
        0.0,
        0.0,
        fwd_packets,
        fwd_bytes,
        bwd_packets,
        bwd_bytes,
        init_win(flow.fwd.init_win_bytes),
        init_win(flow.bwd.init_win_bytes),
        flow.fwd_act_data_packets as f64,
        flow.fwd_seg_size_min.unwrap_or(0) as f64,
        active.mean,
        active.std,
        active.max,
        active.min,
        idle.mean,
        idle.std,
        idle.max,
        idle.min,
    ];

    FeatureVector {
        values: values.map(|v| if v.is_finite() { v } else { 0.0 }),
    }
}

/// The seven leading identifier cells of an output row.
pub fn identifier_fields(flow: &FlowRecord) -> [String; 7] {
    [
        flow.flow_id(),
        flow.src_ip.to_string(),
        flow.src_port.to_string(),
        flow.dst_ip.to_string(),
        flow.dst_port.to_string(),
        flow.protocol.to_string(),
        format_timestamp(flow.flow_start_time),
    ]
}

/// UTC `YYYY-MM-DD HH:MM:SS.ffffff`.
pub fn format_timestamp(micros: u64) -> String {
    let secs = (micros / 1_000_000) as i64;
    let nanos = ((micros % 1_000_000) * 1_000) as u32;
    DateTime::<Utc>::from_timestamp(secs, nanos)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S%.6f").to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::flow::tests::packet;

    #[test]
    fn schema_has_unique_columns() {
        let header = csv_header();
        assert_eq!(header.len(), 85);
        assert_eq!(header[0], "Flow ID");
        assert_eq!(header[7], "Flow Duration");
        assert_eq!(header[84], "Label");
        let mut sorted = header.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), header.len());

        let expected = concat!(
            "Flow ID,Source IP,Source Port,Destination IP,Destination Port,Protocol,Timestamp,",
            "Flow Duration,Total Fwd Packets,Total Backward Packets,Total Length of Fwd Packets,",
            "Total Length of Bwd Packets,Fwd Packet Length Max,Fwd Packet Length Min,",
            "Fwd Packet Length Mean,Fwd Packet Length Std,Bwd Packet Length Max,",
            "Bwd Packet Length Min,Bwd Packet Length Mean,Bwd Packet Length Std,Flow Bytes/s,",
            "Flow Packets/s,Flow IAT Mean,Flow IAT Std,Flow IAT Max,Flow IAT Min,Fwd IAT Total,",
            "Fwd IAT Mean,Fwd IAT Std,Fwd IAT Max,Fwd IAT Min,Bwd IAT Total,Bwd IAT Mean,",
            "Bwd IAT Std,Bwd IAT Max,Bwd IAT Min,Fwd PSH Flags,Bwd PSH Flags,Fwd URG Flags,",
            "Bwd URG Flags,Fwd Header Length,Bwd Header Length,Fwd Packets/s,Bwd Packets/s,",
            "Min Packet Length,Max Packet Length,Packet Length Mean,Packet Length Std,",
            "Packet Length Variance,FIN Flag Count,SYN Flag Count,RST Flag Count,",
            "PSH Flag Count,ACK Flag Count,URG Flag Count,CWE Flag Count,ECE Flag Count,",
            "Down/Up Ratio,Average Packet Size,Avg Fwd Segment Size,Avg Bwd Segment Size,",
            "Fwd Header Length.1,Fwd Avg Bytes/Bulk,Fwd Avg Packets/Bulk,Fwd Avg Bulk Rate,",
            "Bwd Avg Bytes/Bulk,Bwd Avg Packets/Bulk,Bwd Avg Bulk Rate,Subflow Fwd Packets,",
            "Subflow Fwd Bytes,Subflow Bwd Packets,Subflow Bwd Bytes,Init_Win_bytes_forward,",
            "Init_Win_bytes_backward,act_data_pkt_fwd,min_seg_size_forward,Active Mean,",
            "Active Std,Active Max,Active Min,Idle Mean,Idle Std,Idle Max,Idle Min,Label",
        );
        assert_eq!(header.join(","), expected);
    }

    #[test]
    fn sample_std_uses_n_minus_one() {
        assert_eq!(SeqStats::of(Vec::<f64>::new()), SeqStats::default());

        let single = SeqStats::of(vec![7.0]);
        assert_eq!(single.std, 0.0);
        assert_eq!((single.max, single.min, single.mean), (7.0, 7.0, 7.0));

        let s = SeqStats::of(vec![1.0, 2.0, 3.0]);
        assert!((s.std - 1.0).abs() < 1e-12);
        assert_eq!((s.max, s.min, s.mean, s.sum), (3.0, 1.0, 2.0, 6.0));
    }

    #[test]
    fn active_idle_split() {
        let iats = [500_000, 500_000, 1_500_000, 200_000];
        let (active, idle) = active_idle_periods(&iats, ACTIVITY_THRESHOLD_US);
        assert_eq!(active, vec![1_000_000, 200_000]);
        assert_eq!(idle, vec![1_500_000]);
    }

    #[test]
    fn gap_equal_to_threshold_is_active() {
        let (active, idle) = active_idle_periods(&[1_000_000, 2_000_000], ACTIVITY_THRESHOLD_US);
        assert_eq!(active, vec![1_000_000]);
        assert_eq!(idle, vec![2_000_000]);

        let (active, idle) = active_idle_periods(&[], ACTIVITY_THRESHOLD_US);
        assert!(active.is_empty() && idle.is_empty());
    }

    #[test]
    fn syn_then_reverse_fin() {
        let syn = packet([10, 0, 0, 1], 40000, [10, 0, 0, 2], 80, 1_000_000, 0x02);
        let fin = packet([10, 0, 0, 2], 80, [10, 0, 0, 1], 40000, 3_000_000, 0x01);
        let mut flow = FlowRecord::new(&syn);
        flow.add_packet(&syn);
        flow.add_packet(&fin);

        let fv = extract(&flow);
        assert_eq!(fv.get("Flow Duration"), Some(2_000_000.0));
        assert_eq!(fv.get("Total Fwd Packets"), Some(1.0));
        assert_eq!(fv.get("Total Backward Packets"), Some(1.0));
        assert_eq!(fv.get("SYN Flag Count"), Some(1.0));
        assert_eq!(fv.get("FIN Flag Count"), Some(1.0));
        assert_eq!(fv.get("Flow Packets/s"), Some(1.0));
        assert_eq!(fv.get("Flow Bytes/s"), Some(60.0));
        assert_eq!(fv.get("Down/Up Ratio"), Some(1.0));
        assert_eq!(fv.get("Idle Max"), Some(2_000_000.0));
        assert_eq!(fv.get("Active Mean"), Some(0.0));
        assert_eq!(fv.get("Init_Win_bytes_backward"), Some(512.0));
    }

    #[test]
    fn zero_duration_and_empty_forward_degrade_to_zero() {
        let first = packet([10, 0, 0, 1], 1, [10, 0, 0, 2], 2, 5_000, 0x10);
        let mut flow = FlowRecord::new(&first);
        for _ in 0..3 {
            flow.add_packet(&packet([10, 0, 0, 2], 2, [10, 0, 0, 1], 1, 5_000, 0x10));
        }

        let fv = extract(&flow);
        assert_eq!(fv.get("Total Fwd Packets"), Some(0.0));
        assert_eq!(fv.get("Total Backward Packets"), Some(3.0));
        assert_eq!(fv.get("Down/Up Ratio"), Some(0.0));
        assert_eq!(fv.get("Flow Bytes/s"), Some(0.0));
        assert_eq!(fv.get("Avg Fwd Segment Size"), Some(0.0));
        assert_eq!(fv.get("Init_Win_bytes_forward"), Some(-1.0));
        assert_eq!(fv.get("min_seg_size_forward"), Some(0.0));
        assert!(fv.as_slice().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn extraction_is_repeatable() {
        let first = packet([10, 0, 0, 1], 1, [10, 0, 0, 2], 2, 0, 0x02);
        let mut flow = FlowRecord::new(&first);
        flow.add_packet(&first);
        flow.add_packet(&packet([10, 0, 0, 2], 2, [10, 0, 0, 1], 1, 700, 0x12));
        assert_eq!(extract(&flow), extract(&flow));
        assert_eq!(flow.total_packets(), 2);
    }

    #[test]
    fn timestamp_column_format() {
        assert_eq!(format_timestamp(1_700_000_000_000_042), "2023-11-14 22:13:20.000042");
    }

    #[test]
    fn integral_values_print_without_fraction() {
        let first = packet([10, 0, 0, 1], 1, [10, 0, 0, 2], 2, 0, 0);
        let mut flow = FlowRecord::new(&first);
        flow.add_packet(&first);
        let fields = extract(&flow).to_fields();
        assert_eq!(fields.len(), FEATURE_COUNT);
        assert_eq!(fields[1], "1");
        assert_eq!(fields[3], "60");
    }
}

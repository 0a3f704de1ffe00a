use std::fmt;
use std::net::IpAddr;

use crate::capture::{PacketDescriptor, PROTO_TCP};
use crate::types::TcpFlags;

#[derive(Debug, Clone, Hash, PartialEq, Eq, Copy)]
pub struct FlowKey {
    pub ip_a: IpAddr,
    pub ip_b: IpAddr,
    pub port_a: u16,
    pub port_b: u16,
    pub protocol: u8,
}

impl FlowKey {
    pub fn new(src_ip: IpAddr, dst_ip: IpAddr, src_port: u16, dst_port: u16, protocol: u8) -> Self {
        // Normalize flow key so both directions map to the same entry.
        // Addresses compare numerically (all IPv4 before IPv6), then ports.
        if (src_ip, src_port) <= (dst_ip, dst_port) {
            Self {
                ip_a: src_ip,
                ip_b: dst_ip,
                port_a: src_port,
                port_b: dst_port,
                protocol,
            }
        } else {
            Self {
                ip_a: dst_ip,
                ip_b: src_ip,
                port_a: dst_port,
                port_b: src_port,
                protocol,
            }
        }
    }

    pub fn from_packet(pkt: &PacketDescriptor) -> Self {
        Self::new(pkt.src_ip, pkt.dst_ip, pkt.src_port, pkt.dst_port, pkt.protocol)
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}-{}:{}-{}",
            self.ip_a, self.port_a, self.ip_b, self.port_b, self.protocol
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowDirection {
    Forward,
    Backward,
}

/// TCP flag tallies over every packet of the flow, both directions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlagCounts {
    pub fin: u32,
    pub syn: u32,
    pub rst: u32,
    pub psh: u32,
    pub ack: u32,
    pub urg: u32,
    pub cwr: u32,
    pub ece: u32,
}

impl FlagCounts {
    fn add(&mut self, flags: TcpFlags) {
        self.fin += flags.fin as u32;
        self.syn += flags.syn as u32;
        self.rst += flags.rst as u32;
        self.psh += flags.psh as u32;
        self.ack += flags.ack as u32;
        self.urg += flags.urg as u32;
        self.cwr += flags.cwr as u32;
        self.ece += flags.ece as u32;
    }
}

/// Accumulators kept separately for each direction.
#[derive(Debug, Clone, Default)]
pub struct DirectionStats {
    pub packet_count: u64,
    pub byte_count: u64,
    pub packet_lengths: Vec<u32>,
    pub header_lengths: Vec<u32>,
    pub iats: Vec<u64>,
    pub psh_flags: u32,
    pub urg_flags: u32,
    /// TCP window of the first TCP packet seen in this direction.
    pub init_win_bytes: Option<u16>,
    last_packet_timestamp: Option<u64>,
}

impl DirectionStats {
    fn add(&mut self, pkt: &PacketDescriptor, timestamp: u64) {
        self.packet_count += 1;
        self.byte_count += pkt.packet_len as u64;
        self.packet_lengths.push(pkt.packet_len);
        self.header_lengths.push(pkt.header_len());

        if let Some(prev) = self.last_packet_timestamp {
            self.iats.push(timestamp.saturating_sub(prev));
        }
        self.last_packet_timestamp = Some(timestamp);

        self.psh_flags += pkt.tcp_flags.psh as u32;
        self.urg_flags += pkt.tcp_flags.urg as u32;

        if self.init_win_bytes.is_none() && pkt.protocol == PROTO_TCP {
            self.init_win_bytes = Some(pkt.window_size);
        }
    }

    pub fn header_len_total(&self) -> u64 {
        self.header_lengths.iter().map(|&h| h as u64).sum()
    }
}

/// Live state of one bidirectional conversation.
///
/// Forward is the direction of the packet that created the record, not the
/// canonical order of the key.
#[derive(Debug, Clone)]
pub struct FlowRecord {
    pub key: FlowKey,
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
    pub protocol: u8,

    // Flow duration, microseconds
    pub flow_start_time: u64,
    pub flow_last_time: u64,

    // Arrival-ordered timing
    pub packet_timestamps: Vec<u64>,
    pub flow_iats: Vec<u64>,
    last_packet_timestamp: Option<u64>,

    pub fwd: DirectionStats,
    pub bwd: DirectionStats,
    pub flags: FlagCounts,

    pub fwd_act_data_packets: u32,
    pub fwd_seg_size_min: Option<u32>,
}

impl FlowRecord {
    /// Creates an empty record oriented on `first`. The packet itself is not
    /// accumulated; call [`FlowRecord::add_packet`] with it.
    pub fn new(first: &PacketDescriptor) -> Self {
        let start_time = first.time_micros();
        Self {
            key: FlowKey::from_packet(first),
            src_ip: first.src_ip,
            src_port: first.src_port,
            dst_ip: first.dst_ip,
            dst_port: first.dst_port,
            protocol: first.protocol,
            flow_start_time: start_time,
            flow_last_time: start_time,
            packet_timestamps: Vec::new(),
            flow_iats: Vec::new(),
            last_packet_timestamp: None,
            fwd: DirectionStats::default(),
            bwd: DirectionStats::default(),
            flags: FlagCounts::default(),
            fwd_act_data_packets: 0,
            fwd_seg_size_min: None,
        }
    }

    pub fn flow_id(&self) -> String {
        self.key.to_string()
    }

    /// Helper the table uses to expire idle flows.
    #[inline]
    pub fn last_seen_micros(&self) -> u64 {
        self.flow_last_time
    }

    pub fn duration_micros(&self) -> u64 {
        self.flow_last_time.saturating_sub(self.flow_start_time)
    }

    pub fn total_packets(&self) -> u64 {
        self.fwd.packet_count + self.bwd.packet_count
    }

    pub fn total_bytes(&self) -> u64 {
        self.fwd.byte_count + self.bwd.byte_count
    }

    pub fn direction_of(&self, pkt: &PacketDescriptor) -> FlowDirection {
        if pkt.src_ip == self.src_ip && pkt.src_port == self.src_port {
            FlowDirection::Forward
        } else {
            FlowDirection::Backward
        }
    }

    pub fn is_forward(&self, pkt: &PacketDescriptor) -> bool {
        self.direction_of(pkt) == FlowDirection::Forward
    }

    pub fn add_packet(&mut self, pkt: &PacketDescriptor) {
        let timestamp = pkt.time_micros();

        self.packet_timestamps.push(timestamp);
        if let Some(prev) = self.last_packet_timestamp {
            self.flow_iats.push(timestamp.saturating_sub(prev));
        }
        self.last_packet_timestamp = Some(timestamp);
        // Out-of-order packets never move the flow backwards.
        self.flow_last_time = self.flow_last_time.max(timestamp);

        match self.direction_of(pkt) {
            FlowDirection::Forward => {
                self.fwd.add(pkt, timestamp);
                if pkt.has_payload() {
                    self.fwd_act_data_packets += 1;
                }
                if pkt.protocol == PROTO_TCP {
                    let seg = pkt.transport_header_len;
                    self.fwd_seg_size_min = Some(self.fwd_seg_size_min.map_or(seg, |m| m.min(seg)));
                }
            }
            FlowDirection::Backward => self.bwd.add(pkt, timestamp),
        }

        self.flags.add(pkt.tcp_flags);
    }
}

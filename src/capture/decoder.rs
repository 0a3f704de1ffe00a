use etherparse::{
    EtherType, Ethernet2HeaderSlice, IpNumber, Ipv4HeaderSlice, Ipv6HeaderSlice, TcpHeaderSlice,
    UdpHeaderSlice,
};
use std::net::IpAddr;

use crate::types::{CaptureTimestamp, TcpFlags};

pub const ETHERNET_HEADER_LEN: usize = 14;
pub const IPV4_MIN_HEADER_LEN: usize = 20;
pub const IPV6_HEADER_LEN: usize = 40;
pub const UDP_HEADER_LEN: u32 = 8;

pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

/// What to do with transports other than TCP and UDP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecodePolicy {
    /// Produce a descriptor with zero ports and no flags.
    #[default]
    TrackAll,
    TcpUdpOnly,
}

/// Normalized view of one captured frame.
#[derive(Debug, Clone, PartialEq)]
pub struct PacketDescriptor {
    pub timestamp: CaptureTimestamp,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
    /// Length of the frame on the wire.
    pub packet_len: u32,
    pub ip_header_len: u32,
    pub transport_header_len: u32,
    pub window_size: u16,
    pub tcp_flags: TcpFlags,
}

impl PacketDescriptor {
    #[inline]
    pub fn time_micros(&self) -> u64 {
        self.timestamp.as_micros()
    }

    #[inline]
    pub fn header_len(&self) -> u32 {
        self.ip_header_len + self.transport_header_len
    }

    #[inline]
    pub fn has_payload(&self) -> bool {
        self.packet_len > self.header_len()
    }
}

struct NetLayer<'a> {
    src_ip: IpAddr,
    dst_ip: IpAddr,
    protocol: u8,
    header_len: usize,
    payload: &'a [u8],
}

/// Decodes an Ethernet II frame carrying IPv4 or IPv6.
///
/// Returns `None` for anything truncated, malformed or unsupported; the caller
/// just skips the frame. `wire_len` is the original frame length reported by the
/// capture driver and may exceed `frame.len()` when the snap length cut it.
pub fn decode(
    frame: &[u8],
    wire_len: u32,
    timestamp: CaptureTimestamp,
    policy: DecodePolicy,
) -> Option<PacketDescriptor> {
    if frame.len() < ETHERNET_HEADER_LEN + IPV4_MIN_HEADER_LEN {
        return None;
    }

    let eth = Ethernet2HeaderSlice::from_slice(frame).ok()?;
    let ip_bytes = &frame[ETHERNET_HEADER_LEN..];

    let net = match eth.ether_type() {
        EtherType::IPV4 => decode_ipv4(ip_bytes)?,
        EtherType::IPV6 => decode_ipv6(ip_bytes)?,
        _ => return None,
    };

    let mut src_port = 0;
    let mut dst_port = 0;
    let mut transport_header_len = 0;
    let mut window_size = 0;
    let mut tcp_flags = TcpFlags::default();

    match net.protocol {
        PROTO_TCP => {
            let tcp = TcpHeaderSlice::from_slice(net.payload).ok()?;
            src_port = tcp.source_port();
            dst_port = tcp.destination_port();
            transport_header_len = tcp.data_offset() as u32 * 4;
            window_size = tcp.window_size();
            // Flags byte sits at offset 13; the slice is at least 20 bytes.
            tcp_flags = TcpFlags::from_bits(tcp.slice()[13]);
        }
        PROTO_UDP => {
            let udp = UdpHeaderSlice::from_slice(net.payload).ok()?;
            src_port = udp.source_port();
            dst_port = udp.destination_port();
            transport_header_len = UDP_HEADER_LEN;
        }
        _ => {
            if policy == DecodePolicy::TcpUdpOnly {
                return None;
            }
        }
    }

    // Never report a frame shorter than what was actually parsed out of it.
    let packet_len = wire_len.max(frame.len() as u32);

    Some(PacketDescriptor {
        timestamp,
        src_ip: net.src_ip,
        dst_ip: net.dst_ip,
        src_port,
        dst_port,
        protocol: net.protocol,
        packet_len,
        ip_header_len: net.header_len as u32,
        transport_header_len,
        window_size,
        tcp_flags,
    })
}

fn decode_ipv4(bytes: &[u8]) -> Option<NetLayer<'_>> {
    // Fails on a wrong version nibble, an IHL below 5 or an IHL running past the capture.
    let ip = Ipv4HeaderSlice::from_slice(bytes).ok()?;
    let header_len = ip.ihl() as usize * 4;
    if header_len > bytes.len() {
        return None;
    }

    Some(NetLayer {
        src_ip: IpAddr::V4(ip.source_addr()),
        dst_ip: IpAddr::V4(ip.destination_addr()),
        protocol: proto_number(ip.protocol()),
        header_len,
        payload: &bytes[header_len..],
    })
}

fn decode_ipv6(bytes: &[u8]) -> Option<NetLayer<'_>> {
    // Extension headers are not walked: next_header is taken as the transport.
    let ip = Ipv6HeaderSlice::from_slice(bytes).ok()?;

    Some(NetLayer {
        src_ip: IpAddr::V6(ip.source_addr()),
        dst_ip: IpAddr::V6(ip.destination_addr()),
        protocol: proto_number(ip.next_header()),
        header_len: IPV6_HEADER_LEN,
        payload: &bytes[IPV6_HEADER_LEN..],
    })
}

#[inline]
fn proto_number(n: IpNumber) -> u8 {
    n.0
}

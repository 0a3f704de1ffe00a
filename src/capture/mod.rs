pub mod decoder;
pub mod sniffer;

pub use decoder::{decode, DecodePolicy, PacketDescriptor, PROTO_TCP, PROTO_UDP};
pub use sniffer::{
    default_device, list_network_devices, open_live, open_offline, CaptureError, CaptureExit,
    CaptureSummary, FrameEvent, FrameSource, NetworkInterface, PacketSniffer, RawFrame,
};

use crossbeam_channel::Sender;
use pcap::{Activated, Capture, Device};
use serde::Serialize;
use std::path::Path;
use std::sync::{atomic::{AtomicBool, Ordering}, Arc};
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::{debug, error, info};

use super::decoder::{self, DecodePolicy, PacketDescriptor};
use crate::types::CaptureTimestamp;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("capture device '{0}' not found")]
    DeviceNotFound(String),
    #[error("no usable non-loopback capture device")]
    NoDevice,
    #[error("pcap: {0}")]
    Pcap(#[from] pcap::Error),
    #[error("sniffer is already running")]
    AlreadyRunning,
    #[error("capture is not initialized")]
    NotInitialized,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkInterface {
    pub name: String,
    pub description: String,
    pub is_up: bool,
}

/// One frame handed over by a capture source.
#[derive(Debug, Clone, Copy)]
pub struct RawFrame<'a> {
    pub data: &'a [u8],
    pub wire_len: u32,
    pub timestamp: CaptureTimestamp,
}

#[derive(Debug)]
pub enum FrameEvent<'a> {
    Frame(RawFrame<'a>),
    /// Read timeout with nothing captured; a chance to check for cancellation.
    Idle,
    /// Offline input exhausted.
    End,
}

/// Pull interface over a capture handle. The handle is released when the
/// source is dropped.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Result<FrameEvent<'_>, CaptureError>;
}

impl<T: Activated + ?Sized> FrameSource for Capture<T>
where
    Capture<T>: Send,
{
    fn next_frame(&mut self) -> Result<FrameEvent<'_>, CaptureError> {
        match self.next_packet() {
            Ok(packet) => Ok(FrameEvent::Frame(RawFrame {
                data: packet.data,
                wire_len: packet.header.len,
                timestamp: CaptureTimestamp::new(
                    packet.header.ts.tv_sec.max(0) as u64,
                    packet.header.ts.tv_usec.max(0) as u32,
                ),
            })),
            Err(pcap::Error::TimeoutExpired) => Ok(FrameEvent::Idle),
            Err(pcap::Error::NoMorePackets) => Ok(FrameEvent::End),
            Err(e) => Err(e.into()),
        }
    }
}

/// Why the capture thread stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureExit {
    Stopped,
    EndOfInput,
    Failed(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureSummary {
    pub frames: u64,
    pub decoded: u64,
    pub skipped: u64,
}

pub fn list_network_devices() -> Result<Vec<NetworkInterface>, CaptureError> {
    let devices = Device::list()?;
    Ok(devices
        .into_iter()
        .map(|d| NetworkInterface {
            description: d.desc.clone().unwrap_or_else(|| "No description".to_string()),
            is_up: d.flags.is_up(),
            name: d.name,
        })
        .collect())
}

/// First non-loopback interface, the default when none is named.
pub fn default_device() -> Result<String, CaptureError> {
    Device::list()?
        .into_iter()
        .find(|d| !d.flags.is_loopback())
        .map(|d| d.name)
        .ok_or(CaptureError::NoDevice)
}

pub fn open_live(interface: &str, filter: &str) -> Result<Capture<pcap::Active>, CaptureError> {
    if !Device::list()?.iter().any(|d| d.name == interface) {
        return Err(CaptureError::DeviceNotFound(interface.to_string()));
    }

    let mut cap = Capture::from_device(interface)?
        .promisc(true)
        .immediate_mode(true)
        .snaplen(65535)
        .timeout(100)
        .open()?;

    cap.filter(filter, true)?;
    info!(interface, filter, "interface opened");
    Ok(cap)
}

pub fn open_offline(path: &Path, filter: &str) -> Result<Capture<pcap::Offline>, CaptureError> {
    let mut cap = Capture::from_file(path)?;
    cap.filter(filter, true)?;
    info!(path = %path.display(), filter, "capture file opened");
    Ok(cap)
}

pub struct PacketSniffer {
    sniffer_running: Arc<AtomicBool>,
    sniffer_thread: Option<JoinHandle<CaptureSummary>>,
    source: Option<Box<dyn FrameSource>>, // owned until start, then moved into thread
    policy: DecodePolicy,
    exit_tx: Option<Sender<CaptureExit>>,
}

impl PacketSniffer {
    pub fn new(source: Box<dyn FrameSource>, policy: DecodePolicy) -> Self {
        Self {
            sniffer_running: Arc::new(AtomicBool::new(false)),
            sniffer_thread: None,
            source: Some(source),
            policy,
            exit_tx: None,
        }
    }

    /// Reports the reason the capture thread stopped on `tx`.
    pub fn notify_on_exit(&mut self, tx: Sender<CaptureExit>) {
        self.exit_tx = Some(tx);
    }

    /// Spawns the capture thread. `handler` receives every decoded packet in
    /// capture order.
    pub fn start_sniffer<F>(&mut self, mut handler: F) -> Result<(), CaptureError>
    where
        F: FnMut(PacketDescriptor) + Send + 'static,
    {
        if self.sniffer_running.swap(true, Ordering::Relaxed) {
            return Err(CaptureError::AlreadyRunning);
        }
        let Some(mut source) = self.source.take() else {
            self.sniffer_running.store(false, Ordering::Relaxed);
            return Err(CaptureError::NotInitialized);
        };

        let running = self.sniffer_running.clone();
        let policy = self.policy;
        let exit_tx = self.exit_tx.clone();

        self.sniffer_thread = Some(thread::spawn(move || {
            info!("sniffer thread started");
            let mut summary = CaptureSummary::default();

            let exit = loop {
                if !running.load(Ordering::Relaxed) {
                    break CaptureExit::Stopped;
                }
                match source.next_frame() {
                    Ok(FrameEvent::Frame(frame)) => {
                        summary.frames += 1;
                        match decoder::decode(frame.data, frame.wire_len, frame.timestamp, policy) {
                            Some(pkt) => {
                                summary.decoded += 1;
                                handler(pkt);
                            }
                            None => summary.skipped += 1,
                        }
                    }
                    Ok(FrameEvent::Idle) => continue,
                    Ok(FrameEvent::End) => break CaptureExit::EndOfInput,
                    Err(e) => {
                        error!("error capturing packet: {e}");
                        break CaptureExit::Failed(e.to_string());
                    }
                }
            };

            // The capture handle is released here.
            drop(source);
            running.store(false, Ordering::Relaxed);
            info!(
                ?exit,
                frames = summary.frames,
                decoded = summary.decoded,
                skipped = summary.skipped,
                "sniffer thread exiting"
            );
            if let Some(tx) = exit_tx {
                let _ = tx.send(exit);
            }
            summary
        }));

        Ok(())
    }

    /// Signals the capture thread and waits for it. Idempotent.
    pub fn stop_sniffer(&mut self) -> Option<CaptureSummary> {
        self.sniffer_running.store(false, Ordering::Relaxed);
        let summary = self.sniffer_thread.take().and_then(|h| h.join().ok());
        // If start never ran, the source is still here. Drop it now.
        self.source = None;
        debug!("sniffer stopped");
        summary
    }
}

impl Drop for PacketSniffer {
    fn drop(&mut self) {
        self.stop_sniffer();
    }
}

use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::capture::DecodePolicy;
use crate::classifier::{load_label_vector, InputShaper, Scaler, DEFAULT_INPUT_WIDTH};
use crate::processor::{SweepClock, SweepSettings};

#[derive(Parser, Debug, Clone)]
#[command(name = "flowgate")]
#[command(
    about = "Bidirectional flow tracking, CIC-style feature extraction and flow classification",
    long_about = None
)]
pub struct Cli {
    /// Capture device. Defaults to the first non-loopback device.
    #[arg(short, long, conflicts_with = "pcap_file")]
    pub interface: Option<String>,

    /// Replay a capture file instead of sniffing live.
    #[arg(short = 'r', long)]
    pub pcap_file: Option<PathBuf>,

    /// Print capture-capable devices and exit.
    #[arg(long)]
    pub list_devices: bool,

    /// BPF filter applied to the capture handle.
    #[arg(short, long, default_value = "ip or ip6")]
    pub filter: String,

    /// Seconds of inactivity before a flow is expired.
    #[arg(long, default_value_t = 15)]
    pub idle_timeout: u64,

    #[arg(long, default_value_t = 1000)]
    pub sweep_interval_ms: u64,

    /// Drop packets whose transport is neither TCP nor UDP.
    #[arg(long)]
    pub tcp_udp_only: bool,

    /// ONNX model. Without one flows are exported unscored.
    #[arg(short, long)]
    pub model: Option<PathBuf>,

    /// JSON `{"mean": [...], "scale": [...]}` normalization coefficients.
    #[arg(long)]
    pub scaler: Option<PathBuf>,

    /// JSON class map (`num_classes`, `id_to_label`) naming the model's classes.
    #[arg(long)]
    pub class_map: Option<PathBuf>,

    #[arg(long, default_value_t = DEFAULT_INPUT_WIDTH)]
    pub input_width: usize,

    #[arg(short, long, default_value = "traffic_log.csv")]
    pub output: PathBuf,

    #[arg(long, default_value = "alerts.log")]
    pub alert_log: PathBuf,

    /// Label written for unscored flows.
    #[arg(long, default_value = "BENIGN")]
    pub dataset_label: String,

    /// Tracing filter, e.g. `debug` or `flowgate_lib=trace`. `RUST_LOG` wins when set.
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureMode {
    /// `None` picks the default device.
    Live(Option<String>),
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mode: CaptureMode,
    pub filter: String,
    pub policy: DecodePolicy,
    pub sweep: SweepSettings,
    pub model: Option<PathBuf>,
    pub shaper: InputShaper,
    pub class_names: Vec<String>,
    pub output: PathBuf,
    pub alert_log: PathBuf,
    pub dataset_label: String,
}

impl Config {
    /// Validates the CLI and loads the side files it names.
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        if cli.idle_timeout == 0 {
            bail!("--idle-timeout must be at least 1 second");
        }
        if cli.sweep_interval_ms == 0 {
            bail!("--sweep-interval-ms must be positive");
        }
        if cli.input_width == 0 {
            bail!("--input-width must be positive");
        }

        let (mode, clock) = match &cli.pcap_file {
            Some(path) => (CaptureMode::File(path.clone()), SweepClock::Capture),
            None => (CaptureMode::Live(cli.interface.clone()), SweepClock::Wall),
        };

        let scaler = cli.scaler.as_ref().map(Scaler::load).transpose()?;
        let class_names = match &cli.class_map {
            Some(path) => load_label_vector(path)?,
            None => Vec::new(),
        };

        Ok(Self {
            mode,
            filter: cli.filter.clone(),
            policy: if cli.tcp_udp_only {
                DecodePolicy::TcpUdpOnly
            } else {
                DecodePolicy::TrackAll
            },
            sweep: SweepSettings {
                idle_timeout: Duration::from_secs(cli.idle_timeout),
                interval: Duration::from_millis(cli.sweep_interval_ms),
                clock,
                ..SweepSettings::default()
            },
            model: cli.model.clone(),
            shaper: InputShaper { width: cli.input_width, scaler },
            class_names,
            output: cli.output.clone(),
            alert_log: cli.alert_log.clone(),
            dataset_label: cli.dataset_label.clone(),
        })
    }
}

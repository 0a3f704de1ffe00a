pub mod capture;
pub mod classifier;
pub mod config;
pub mod export;
pub mod processor;
pub mod types;

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::io::Write;
use std::thread::{self, JoinHandle};
use tracing::{error, info};

use capture::{CaptureExit, CaptureSummary, DecodePolicy, FrameSource, PacketSniffer};
use classifier::{ClassifiedFlow, ClassifierHandles, NidsModel, NoModel};
use config::{CaptureMode, Config};
use export::{AlertLog, FlowCsvWriter};
use processor::{FeatureProcessor, SweepSettings};
use types::Verdict;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReportSummary {
    pub flows: u64,
    pub malicious: u64,
    pub indeterminate: u64,
    pub write_errors: u64,
    pub rows_written: u64,
    pub alerts_written: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunSummary {
    pub capture: Option<CaptureSummary>,
    pub flushed: usize,
    pub report: ReportSummary,
}

// Thread to receive the classified flows: CSV row, alert, log line.
fn spawn_reporter<W, A>(
    rx: Receiver<ClassifiedFlow>,
    mut csv: FlowCsvWriter<W>,
    mut alerts: AlertLog<A>,
    class_names: Vec<String>,
) -> JoinHandle<Result<ReportSummary>>
where
    W: Write + Send + 'static,
    A: Write + Send + 'static,
{
    thread::spawn(move || {
        let mut summary = ReportSummary::default();

        while let Ok(flow) = rx.recv() {
            let verdict = flow.verdict();
            let record = &flow.flow.record;
            summary.flows += 1;

            info!(
                flow = %record.key,
                reason = %flow.flow.reason,
                packets = record.total_packets(),
                bytes = record.total_bytes(),
                %verdict,
                "flow finalized"
            );

            if let Err(e) = csv.write_flow(&flow) {
                summary.write_errors += 1;
                error!("{e:?}");
            }

            match verdict {
                Verdict::Malicious => {
                    summary.malicious += 1;
                    let label = flow.label(&class_names, Verdict::Malicious.label());
                    if let Err(e) = alerts.record(record, &label) {
                        summary.write_errors += 1;
                        error!("{e:?}");
                    }
                }
                Verdict::Indeterminate => summary.indeterminate += 1,
                Verdict::Benign | Verdict::Unscored => {}
            }
        }

        csv.flush()?;
        summary.rows_written = csv.rows();
        summary.alerts_written = alerts.alerts();
        Ok(summary)
    })
}

/// The running pipeline: capture thread, flow table with its sweeper,
/// classifier thread and reporter thread.
pub struct System {
    sniffer: PacketSniffer,
    processor: FeatureProcessor,
    classifier: ClassifierHandles,
    reporter: JoinHandle<Result<ReportSummary>>,
}

impl System {
    /// Wires the pipeline and starts capturing. `exit_tx` learns why capture
    /// stopped on its own (end of input or a capture error).
    #[allow(clippy::too_many_arguments)]
    pub fn start<W, A>(
        source: Box<dyn FrameSource>,
        policy: DecodePolicy,
        sweep: SweepSettings,
        classifier: ClassifierHandles,
        csv: FlowCsvWriter<W>,
        alerts: AlertLog<A>,
        class_names: Vec<String>,
        exit_tx: Sender<CaptureExit>,
    ) -> Result<Self>
    where
        W: Write + Send + 'static,
        A: Write + Send + 'static,
    {
        let reporter = spawn_reporter(classifier.rx.clone(), csv, alerts, class_names);

        let mut processor = FeatureProcessor::new(classifier.tx.clone(), sweep);
        processor.start_processor()?;

        let mut sniffer = PacketSniffer::new(source, policy);
        sniffer.notify_on_exit(exit_tx);
        sniffer
            .start_sniffer(processor.packet_handler())
            .context("Failed to start sniffer")?;

        info!("system started");
        Ok(Self { sniffer, processor, classifier, reporter })
    }

    /// Stops capture, finalizes every live flow and drains the classifier and
    /// reporter before returning.
    pub fn stop(self) -> Result<RunSummary> {
        let Self { mut sniffer, mut processor, classifier, reporter } = self;

        let capture = sniffer.stop_sniffer();
        let flushed = processor.stop_processor();
        info!(flushed, "live flows flushed");

        // Every sender must go before the classifier thread sees the channel close.
        drop(processor);
        drop(sniffer);
        let ClassifierHandles { tx, rx, thread } = classifier;
        drop(tx);
        drop(rx);

        thread
            .join()
            .map_err(|_| anyhow!("classifier thread panicked"))?;
        let report = reporter
            .join()
            .map_err(|_| anyhow!("reporter thread panicked"))??;

        info!(
            flows = report.flows,
            malicious = report.malicious,
            indeterminate = report.indeterminate,
            rows = report.rows_written,
            alerts = report.alerts_written,
            "system stopped"
        );
        Ok(RunSummary { capture, flushed, report })
    }
}

fn open_source(config: &Config) -> Result<Box<dyn FrameSource>> {
    let source: Box<dyn FrameSource> = match &config.mode {
        CaptureMode::Live(interface) => {
            let interface = match interface {
                Some(name) => name.clone(),
                None => capture::default_device().context("Failed to pick a capture device")?,
            };
            Box::new(
                capture::open_live(&interface, &config.filter)
                    .with_context(|| format!("Failed to open interface {interface}"))?,
            )
        }
        CaptureMode::File(path) => Box::new(
            capture::open_offline(path, &config.filter)
                .with_context(|| format!("Failed to open capture file {}", path.display()))?,
        ),
    };
    Ok(source)
}

/// Runs until Ctrl-C, end of the capture file, or a capture failure.
pub fn run(config: Config) -> Result<RunSummary> {
    // Everything that can fail at startup is checked before capture begins.
    let source = open_source(&config)?;
    let csv = FlowCsvWriter::create(
        &config.output,
        config.class_names.clone(),
        &config.dataset_label,
    )?;
    let alerts = AlertLog::open(&config.alert_log)?;

    let shaper = config.shaper.clone();
    let classifier = match config.model.clone() {
        Some(path) => {
            info!(model = %path.display(), "loading model");
            classifier::spawn_classifier(move || NidsModel::load(&path), shaper)?
        }
        None => {
            info!("no model configured, flows are exported unscored");
            classifier::spawn_classifier(|| Ok(NoModel), shaper)?
        }
    };

    let (exit_tx, exit_rx) = unbounded::<CaptureExit>();
    {
        let exit_tx = exit_tx.clone();
        ctrlc::set_handler(move || {
            let _ = exit_tx.send(CaptureExit::Stopped);
        })
        .context("Failed to install Ctrl-C handler")?;
    }

    let system = System::start(
        source,
        config.policy,
        config.sweep,
        classifier,
        csv,
        alerts,
        config.class_names.clone(),
        exit_tx,
    )?;

    let exit = exit_rx.recv().unwrap_or(CaptureExit::Stopped);
    info!(?exit, "shutting down");

    // Pending flows are flushed even when capture failed.
    let summary = system.stop()?;
    match exit {
        CaptureExit::Failed(e) => Err(anyhow!("capture failed: {e}")),
        CaptureExit::Stopped | CaptureExit::EndOfInput => Ok(summary),
    }
}

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use flowgate_lib::capture::list_network_devices;
use flowgate_lib::config::{Cli, Config};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_line_number(true)
        .init();

    if cli.list_devices {
        for device in list_network_devices()? {
            let state = if device.is_up { "up" } else { "down" };
            println!("{:<16} {:<5} {}", device.name, state, device.description);
        }
        return Ok(());
    }

    let config = Config::from_cli(&cli)?;
    let summary = flowgate_lib::run(config)?;

    if let Some(capture) = summary.capture {
        info!(
            frames = capture.frames,
            decoded = capture.decoded,
            skipped = capture.skipped,
            "capture totals"
        );
    }
    info!(
        flows = summary.report.flows,
        malicious = summary.report.malicious,
        "done"
    );
    Ok(())
}

use std::{
    path::PathBuf,
    process::ExitCode,
    sync::{Arc, atomic::AtomicBool},
};

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{info, warn};

use allsky_core::{Monitor, OnnxClassifierLoader, SettingsSlot, SftpSource};
use allsky_utils::{
    config::{CropDimensions, MonitorSettings, default_settings_path},
    init_logging, normalize_path,
};

mod prep;

/// Allsky camera safety monitor for observatory automation.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    /// Settings JSON (created with defaults on first run if absent).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the camera host.
    #[arg(long)]
    host: Option<String>,

    /// Override the SFTP port.
    #[arg(long)]
    port: Option<u16>,

    /// Override the status file path.
    #[arg(long)]
    status_file: Option<PathBuf>,

    /// Override the ONNX model path.
    #[arg(long)]
    model: Option<PathBuf>,

    /// Override the label list path.
    #[arg(long)]
    labels: Option<PathBuf>,

    /// Override seconds between monitoring cycles.
    #[arg(long)]
    poll_interval: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the monitor loop until killed.
    Run,
    /// Run a single cycle and exit 0 when conditions are safe, 1 otherwise.
    Check,
    /// Batch-preprocess a directory of training images (crop + resize).
    Prep {
        /// Image file or directory to preprocess.
        #[arg(short, long)]
        input: PathBuf,

        /// Center-crop width before resizing (0 to skip).
        #[arg(long)]
        crop_width: Option<u32>,

        /// Center-crop height before resizing (0 to skip).
        #[arg(long)]
        crop_height: Option<u32>,
    },
}

fn main() -> Result<ExitCode> {
    init_logging(log::LevelFilter::Info)?;
    let cli = Cli::parse();

    let mut settings = load_settings(cli.config.as_ref())?;
    apply_cli_overrides(&mut settings, &cli);
    settings.validate()?;

    match &cli.command {
        Command::Run => {
            run_monitor(settings);
        }
        Command::Check => {
            let verdict = build_monitor(settings).run_cycle();
            info!(
                "single check: IsSafe={} Condition={} Confidence={:.2}",
                verdict.is_safe, verdict.condition, verdict.confidence
            );
            if !verdict.is_safe {
                return Ok(ExitCode::from(1));
            }
        }
        Command::Prep {
            input,
            crop_width,
            crop_height,
        } => {
            if let (Some(w), Some(h)) = (crop_width, crop_height) {
                settings.crop = Some(CropDimensions::new(*w, *h));
            }
            let input = normalize_path(input)?;
            let report = prep::prep_images(&input, &settings)?;
            info!(
                "preprocessed {} image(s), skipped {}, failed {}",
                report.processed, report.skipped, report.failed
            );
            if report.processed == 0 && report.failed > 0 {
                anyhow::bail!("all images failed preprocessing");
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn run_monitor(settings: MonitorSettings) -> ! {
    info!(
        "monitoring {}:{} every {}s, status file {}",
        settings.host,
        settings.port,
        settings.poll_interval_secs,
        settings.status_file_path.display()
    );
    let mut monitor = build_monitor(settings);

    // The daemon has no orderly shutdown path; the flag exists for embedders.
    let stop = Arc::new(AtomicBool::new(false));
    monitor.run(stop);
    unreachable!("monitor loop only returns after a stop request");
}

fn build_monitor(settings: MonitorSettings) -> Monitor {
    let source = SftpSource::from_settings(&settings);
    Monitor::new(
        SettingsSlot::new(settings),
        Box::new(source),
        Box::new(OnnxClassifierLoader),
    )
}

/// Load settings, writing a default file on first run so operators have a
/// template to edit.
fn load_settings(config_path: Option<&PathBuf>) -> Result<MonitorSettings> {
    let path = config_path
        .cloned()
        .unwrap_or_else(default_settings_path);
    if path.exists() {
        MonitorSettings::load_from_path(&path)
    } else {
        let settings = MonitorSettings::default();
        if let Err(e) = settings.save_to_path(&path) {
            warn!("could not write default settings to {}: {e:#}", path.display());
        } else {
            info!("wrote default settings to {}", path.display());
        }
        Ok(settings)
    }
}

fn apply_cli_overrides(settings: &mut MonitorSettings, cli: &Cli) {
    if let Some(host) = &cli.host {
        settings.host = host.clone();
    }
    if let Some(port) = cli.port {
        settings.port = port;
    }
    if let Some(status_file) = &cli.status_file {
        settings.status_file_path = status_file.clone();
    }
    if let Some(model) = &cli.model {
        settings.model_path = model.clone();
    }
    if let Some(labels) = &cli.labels {
        settings.labels_path = labels.clone();
    }
    if let Some(poll_interval) = cli.poll_interval {
        settings.poll_interval_secs = poll_interval;
    }
}

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};

use salvor::{FileKind, RecoverySession, ScanType, SessionConfig, SessionState, types};

#[derive(Parser)]
#[command(name = "salvor")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Best-effort recovery of deleted files from block storage devices")]
struct Cli {
    /// Device node or disk image to scan
    #[arg(short, long)]
    device: PathBuf,

    /// Directory for recovered files, the manifest, and the recovery log
    #[arg(short, long)]
    output: PathBuf,

    /// Scan mode
    #[arg(short, long, value_enum, default_value = "deep")]
    mode: Mode,

    /// Comma-separated list of file types to recover (e.g. jpg,png,pdf);
    /// default is everything the catalog knows
    #[arg(short, long, value_delimiter = ',')]
    types: Vec<String>,

    /// Seconds between status lines while scanning; 0 disables them
    #[arg(long, default_value_t = 5)]
    status_interval: u64,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Filesystem metadata first, then a sector-stride carving pass
    Quick,
    /// Byte-stride signature carving over the whole device
    Deep,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let mut filter = HashSet::new();
    for raw in &cli.types {
        match FileKind::from_extension(raw) {
            Some(kind) => {
                filter.insert(kind);
            }
            None => bail!("unknown file type: {}", raw),
        }
    }

    let scan_type = match cli.mode {
        Mode::Quick => ScanType::Quick,
        Mode::Deep => ScanType::Deep,
    };
    let config = SessionConfig {
        scan_type,
        type_filter: filter,
        destination: cli.output.clone(),
    };

    let mut session = RecoverySession::start(&cli.device, config)
        .with_context(|| format!("failed to start recovery of {:?}", cli.device))?;

    let mut last_line = std::time::Instant::now();
    while !session.is_finished() {
        std::thread::sleep(Duration::from_millis(200));
        if cli.status_interval > 0 && last_line.elapsed().as_secs() >= cli.status_interval {
            let status = session.status();
            println!(
                "[{:?}] scanned {} of {}, {} candidates, {} written",
                status.state,
                types::size_human(status.bytes_scanned),
                types::size_human(status.device_size),
                status.candidates_found,
                status.files_written,
            );
            last_line = std::time::Instant::now();
        }
    }

    let report = session.wait();

    println!();
    println!("Session {:?}", report.state);
    println!(
        "Recovered: {}",
        report.manifest.count(salvor::RecoveryStatus::Recovered)
    );
    println!(
        "Partial:   {}",
        report.manifest.count(salvor::RecoveryStatus::Partial)
    );
    println!(
        "Skipped:   {}",
        report.manifest.count(salvor::RecoveryStatus::Skipped)
    );
    println!(
        "Failed:    {}",
        report.manifest.count(salvor::RecoveryStatus::Failed)
    );
    if !report.bad_regions.is_empty() {
        println!("Unreadable regions skipped: {}", report.bad_regions.len());
    }
    println!("Output folder: {:?}", cli.output);

    if report.state == SessionState::Failed {
        bail!(
            "recovery failed: {}",
            report
                .failure
                .as_deref()
                .unwrap_or("unknown failure")
        );
    }
    Ok(())
}

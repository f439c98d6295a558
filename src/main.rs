//! CLI entry point for chamber-bench
//!
//! Stands in for the presentation layer: prints every broadcast event and
//! forwards ON/OFF control input.
//!
//! # Usage
//!
//! Run against the real bench, typing `on`, `off` or `quit` on stdin:
//! ```bash
//! chamber-bench run --settings settings/
//! ```
//!
//! Run against simulated instruments with the timed schedule:
//! ```bash
//! chamber-bench run --settings settings/ --simulate --timed
//! ```
//!
//! Validate a settings directory:
//! ```bash
//! chamber-bench check --settings settings/
//! ```

use anyhow::{Context, Result};
use chamber_bench::broadcast::BenchEvent;
use chamber_bench::hardware::mock::SimBench;
use chamber_bench::hardware::Instruments;
use chamber_bench::logging::{self, LoggingConfig, OutputFormat};
use chamber_bench::{BenchSettings, ControlCommand, ScheduleMode, TestBench};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "chamber-bench")]
#[command(about = "Environmental chamber test bench", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load settings, then accept on/off/quit on stdin
    Run {
        /// Directory holding the settings JSON documents
        #[arg(long)]
        settings: PathBuf,

        /// Use simulated instruments instead of serial ports
        #[arg(long)]
        simulate: bool,

        /// Fixed-interval schedule instead of chamber feedback
        #[arg(long)]
        timed: bool,

        /// Log format: pretty, compact or json
        #[arg(long, default_value = "pretty")]
        log_format: OutputFormat,
    },

    /// Validate a settings directory and print a summary
    Check {
        #[arg(long)]
        settings: PathBuf,
    },

    /// List serial ports
    Ports,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            settings,
            simulate,
            timed,
            log_format,
        } => run(settings, simulate, timed, log_format).await,
        Commands::Check { settings } => check(settings),
        Commands::Ports => list_ports(),
    }
}

async fn run(dir: PathBuf, simulate: bool, timed: bool, log_format: OutputFormat) -> Result<()> {
    let settings = BenchSettings::load_dir(&dir)
        .with_context(|| format!("loading settings from {}", dir.display()))?;
    let log_config = LoggingConfig::from_settings(&settings)
        .map_err(anyhow::Error::msg)?
        .with_format(log_format);
    logging::init(log_config).map_err(anyhow::Error::msg)?;

    let instruments = if simulate {
        info!("using simulated instruments");
        simulated_instruments(&settings)
    } else {
        Instruments::serial(&settings)?
    };
    let mode = if timed {
        ScheduleMode::Timed
    } else {
        ScheduleMode::Thermal
    };
    let bench = TestBench::new(settings, instruments, mode)?;

    let mut events = bench.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => println!("{}", event.to_wire()),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event printer lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    println!("{}", BenchEvent::Running(false).to_wire());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line.eq_ignore_ascii_case("quit") {
                    break;
                }
                match line.parse::<ControlCommand>() {
                    Ok(command) => bench.handle(command),
                    Err(e) => eprintln!("{}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received");
                break;
            }
        }
    }

    bench.handle(ControlCommand::Off);
    if let Some(outcome) = bench.wait_for_run().await {
        info!(status = outcome.status(), "run ended");
    }
    drop(bench);
    let _ = printer.await;
    Ok(())
}

/// Simulated bench whose chamber swings past both plateau targets.
fn simulated_instruments(settings: &BenchSettings) -> Instruments {
    let sim = SimBench::new();
    let low = settings.temperature.low.target_temp - 5.0;
    let high = settings.temperature.high.target_temp + 5.0;
    sim.chamber.ramp(low, high, (high - low) / 4.0);
    sim.instruments()
}

fn check(dir: PathBuf) -> Result<()> {
    let settings = BenchSettings::load_dir(&dir)
        .with_context(|| format!("loading settings from {}", dir.display()))?;

    println!("Settings OK: {}", dir.display());
    println!("  Model:        {}", settings.product_info.model_name);
    let devices: Vec<String> = settings
        .selected_devices()
        .map(|slot| (slot + 1).to_string())
        .collect();
    println!("  Devices:      {}", devices.join(", "));
    println!("  Voltages:     {:?} V", settings.output_voltages);
    println!("  Channels:     {:?} V", settings.channel_voltages);
    println!(
        "  High plateau: {} ({:.1} °C, {} sweeps)",
        if settings.temperature.high.enabled { "on" } else { "off" },
        settings.temperature.high.target_temp,
        settings.temperature.high.read_count
    );
    println!(
        "  Low plateau:  {} ({:.1} °C, {} sweeps)",
        if settings.temperature.low.enabled { "on" } else { "off" },
        settings.temperature.low.target_temp,
        settings.temperature.low.read_count
    );
    println!("  Cycles:       {}", settings.delay.cycle_count);
    println!(
        "  Ports:        chamber={} power={} load={} relay={} @ {} baud",
        settings.ports.chamber,
        settings.ports.power,
        settings.ports.load,
        settings.ports.relay,
        settings.ports.baud_rate
    );
    println!("  Judgment:     {}", settings.judgment.thermal_policy().describe());
    Ok(())
}

#[cfg(feature = "serial")]
fn list_ports() -> Result<()> {
    let ports = serialport::available_ports().context("listing serial ports")?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        println!("{}", port.port_name);
    }
    Ok(())
}

#[cfg(not(feature = "serial"))]
fn list_ports() -> Result<()> {
    anyhow::bail!(chamber_bench::BenchError::SerialFeatureDisabled)
}

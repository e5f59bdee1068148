//! Command-line sweep runner.
//!
//! Connects to the LCR meter and/or the parameter analyzer named in the
//! configuration, runs a C-V or transfer sweep, and prints every point to
//! stdout as one JSON object per line. Logs go to stderr.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use keysight_daq::config::{AnalyzerSettings, LcrSettings, Settings, DEFAULT_CONFIG_PATH};
use keysight_daq::instrument::{estimate_settling_time, IntegrationTime, LcrMeter, ParameterAnalyzer};
use keysight_daq::sweep::{run_cv_sweep, run_transfer_sweep, SweepEvent};
use keysight_daq::shutdown::{forward_interrupts, InterruptOutcome, ShutdownSignal};
use keysight_daq::{adapters::AdapterConfig, AppResult};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "C-V and I-V sweeps on an LCR meter and a parameter analyzer")]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Use simulated instruments instead of VISA
    #[arg(long, default_value_t = false)]
    simulate: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// C-V bias sweep on the LCR meter
    Cv,
    /// Id-Vg transfer sweep on the parameter analyzer
    Transfer,
    /// Both sweeps at once, one task per instrument
    Both,
    /// Print the LCR settling-time estimate in seconds
    Settling {
        /// SHOR, MED or LONG
        #[arg(long, default_value = "MED")]
        integration: IntegrationTime,
        /// Test frequency in kHz
        #[arg(long, default_value_t = 400.0)]
        frequency_khz: f64,
        /// Averaging count
        #[arg(long, default_value_t = 4)]
        averaging: u32,
    },
}

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn spawn_cv(
    lcr: LcrSettings,
    adapter: AdapterConfig,
    shutdown: ShutdownSignal,
    events: mpsc::Sender<SweepEvent>,
) -> JoinHandle<AppResult<usize>> {
    tokio::spawn(async move {
        let sweep = lcr.bias_sweep.linear()?;
        let mut meter = LcrMeter::connect(&lcr.resource, &adapter, lcr.measurement)
            .await?
            .with_shutdown(shutdown.clone());

        let outcome = match meter.configure().await {
            Ok(()) => run_cv_sweep(&mut meter, &sweep, &shutdown, &events).await,
            Err(e) => Err(e),
        };
        let closed = meter.close().await;
        let points = outcome?;
        closed?;
        Ok(points.len())
    })
}

fn spawn_transfer(
    analyzer_settings: AnalyzerSettings,
    adapter: AdapterConfig,
    shutdown: ShutdownSignal,
    events: mpsc::Sender<SweepEvent>,
) -> JoinHandle<AppResult<usize>> {
    tokio::spawn(async move {
        let sweep = analyzer_settings
            .gate_sweep
            .gate_source(analyzer_settings.measurement.vs)?;
        let mut analyzer = ParameterAnalyzer::connect(
            &analyzer_settings.resource,
            &adapter,
            analyzer_settings.measurement.clone(),
        )
        .await?;
        analyzer.define_terminal_roles(analyzer_settings.roles)?;
        analyzer.set_compliance(analyzer_settings.compliance)?;

        let outcome = match analyzer.configure().await {
            Ok(()) => run_transfer_sweep(&mut analyzer, &sweep, &shutdown, &events).await,
            Err(e) => Err(e),
        };
        let closed = analyzer.close().await;
        let points = outcome?;
        closed?;
        Ok(points.len())
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    if cli.simulate {
        settings.lcr.resource = "MOCK::LCR".to_string();
        settings.analyzer.resource = "MOCK::ANALYZER".to_string();
    }
    init_tracing(&settings.application.log_level);

    if let Command::Settling {
        integration,
        frequency_khz,
        averaging,
    } = cli.command
    {
        println!("{}", estimate_settling_time(integration, frequency_khz, averaging));
        return Ok(());
    }

    let shutdown = ShutdownSignal::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if forward_interrupts(&shutdown, tokio::signal::ctrl_c).await == InterruptOutcome::Forced {
                error!("Second Ctrl-C, exiting without waiting for instrument release");
                std::process::exit(130);
            }
        });
    }

    let (tx, mut rx) = mpsc::channel::<SweepEvent>(256);
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!("Failed to serialize sweep event: {}", e),
            }
        }
    });

    let mut tasks = Vec::new();
    if matches!(cli.command, Command::Cv | Command::Both) {
        tasks.push((
            "C-V",
            spawn_cv(settings.lcr.clone(), settings.adapter.clone(), shutdown.clone(), tx.clone()),
        ));
    }
    if matches!(cli.command, Command::Transfer | Command::Both) {
        tasks.push((
            "transfer",
            spawn_transfer(
                settings.analyzer.clone(),
                settings.adapter.clone(),
                shutdown.clone(),
                tx.clone(),
            ),
        ));
    }
    drop(tx);

    let mut failures = 0;
    for (name, task) in tasks {
        match task.await.context("sweep task panicked")? {
            Ok(points) => info!("{} sweep finished with {} points", name, points),
            Err(e) => {
                error!("{} sweep failed: {}", name, e);
                failures += 1;
            }
        }
    }
    printer.await.context("printer task panicked")?;

    if failures > 0 {
        bail!("{} sweep(s) failed", failures);
    }
    Ok(())
}

//! `obseq`: validate and run observing blocks.
//!
//! `run` and `action` talk to the built-in simulated instrument.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ob_sequencer::action::{ActionContext, ActionRegistry};
use ob_sequencer::alert::{AlertSink, TracingAlertSink};
use ob_sequencer::bus::sim::SimTiming;
use ob_sequencer::bus::{DeviceBus, MockBus, SimulatedInstrument};
use ob_sequencer::config::SequencerConfig;
use ob_sequencer::logging::{self, LogFormat};
use ob_sequencer::ob::{CalSource, Detector, ObservingBlock};
use ob_sequencer::{FailureKind, Orchestrator, SequencerError};
use serde::de::DeserializeOwned;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "obseq")]
#[command(version, about = "Observing-block sequencer")]
struct Cli {
    /// Configuration file (defaults to config/sequencer.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured log level
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Override the configured log format (pretty, compact, json)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate an observing block and print its execution plan
    Validate {
        /// Observing block file (.json, otherwise YAML)
        ob: PathBuf,
    },
    /// Run an observing block against the simulated instrument
    Run {
        /// Observing block file (.json, otherwise YAML)
        ob: PathBuf,

        /// Script name recorded as the lock holder
        #[arg(long)]
        script_name: Option<String>,

        /// Mark a calibration source as disabled before running
        #[arg(long = "disable-source", value_parser = parse_name::<CalSource>)]
        disabled_sources: Vec<CalSource>,

        /// Make a detector fault on its next exposure
        #[arg(long = "fault", value_parser = parse_name::<Detector>)]
        faults: Vec<Detector>,

        /// Request cancellation after this many seconds
        #[arg(long)]
        cancel_after: Option<f64>,

        /// Write the run report as JSON to this file
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Invoke a single action by name with JSON arguments
    Action {
        name: String,
        /// JSON arguments (defaults to `{}`)
        #[arg(default_value = "{}")]
        args: String,
    },
    /// List the available actions
    Actions,
}

/// Parse a value by its serialized name (`ThAr`, `caHk`).
fn parse_name<T: DeserializeOwned>(name: &str) -> Result<T, String> {
    serde_json::from_value(serde_json::Value::String(name.to_string()))
        .map_err(|_| format!("unknown name '{name}'"))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            exit_code_for(&e)
        }
    }
}

/// 2 for rejected input, 1 for everything else.
fn exit_code_for(error: &anyhow::Error) -> ExitCode {
    match error.downcast_ref::<SequencerError>().map(|e| e.kind()) {
        Some(FailureKind::Validation) => ExitCode::from(2),
        _ => ExitCode::FAILURE,
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = match &cli.config {
        Some(path) => SequencerConfig::load_from(path),
        None => SequencerConfig::load(),
    }
    .map_err(SequencerError::from)
    .context("loading configuration")?;

    let level = cli
        .log_level
        .as_deref()
        .unwrap_or(&config.application.log_level);
    let format = cli.log_format.unwrap_or(config.application.log_format);
    logging::init(level, format)?;

    match cli.command {
        Commands::Validate { ob } => validate(&config, ob),
        Commands::Run {
            ob,
            script_name,
            disabled_sources,
            faults,
            cancel_after,
            report,
        } => {
            let options = RunOptions {
                script_name: script_name.unwrap_or_else(|| config.application.name.clone()),
                disabled_sources,
                faults,
                cancel_after: cancel_after.map(Duration::from_secs_f64),
                report,
            };
            run_ob(&config, ob, options).await
        }
        Commands::Action { name, args } => invoke_action(&config, &name, &args).await,
        Commands::Actions => {
            for action in ActionRegistry::with_builtin_actions().iter() {
                println!("{:<24} {}", action.name(), action.kind().as_str());
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn validate(config: &SequencerConfig, path: PathBuf) -> Result<ExitCode> {
    let ob = ObservingBlock::from_path(&path)?;
    let plan = ob.validate(&config.templates)?;

    println!("{}", plan.identity);
    for step in plan.steps() {
        println!(
            "  {:<16} {} x {}s",
            step.step_ref.to_string(),
            step.spec.exposure_count(),
            step.spec.exposure_time()
        );
    }
    Ok(ExitCode::SUCCESS)
}

struct RunOptions {
    script_name: String,
    disabled_sources: Vec<CalSource>,
    faults: Vec<Detector>,
    cancel_after: Option<Duration>,
    report: Option<PathBuf>,
}

fn simulated_bus(config: &SequencerConfig) -> (MockBus, SimulatedInstrument) {
    let timing = SimTiming::default();
    let bus = MockBus::new()
        .with_mirror(timing.mechanism)
        .with_poll_interval(config.bus.poll_interval);
    let sim = SimulatedInstrument::install(&bus, timing);
    (bus, sim)
}

async fn run_ob(config: &SequencerConfig, path: PathBuf, options: RunOptions) -> Result<ExitCode> {
    let ob = ObservingBlock::from_path(&path)?;

    let (bus, sim) = simulated_bus(config);
    for source in &options.disabled_sources {
        sim.disable_source(*source);
    }
    for detector in &options.faults {
        sim.inject_detector_fault(*detector, 1);
    }

    let bus: Arc<dyn DeviceBus> = Arc::new(bus);
    let alerts: Arc<dyn AlertSink> = Arc::new(TracingAlertSink);
    let orchestrator = Arc::new(Orchestrator::from_config(bus, alerts, config));

    let canceller = options.cancel_after.map(|delay| {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            info!(?delay, "Requesting cancellation");
            if let Err(e) = orchestrator.request_cancel().await {
                warn!(error = %e, "Cancellation request failed");
            }
        })
    });

    let report = orchestrator
        .run_observing_block(&ob, &options.script_name)
        .await?;
    if let Some(handle) = canceller {
        handle.abort();
    }

    let json = serde_json::to_string_pretty(&report)?;
    match &options.report {
        Some(path) => std::fs::write(path, &json)
            .with_context(|| format!("writing report to {}", path.display()))?,
        None => println!("{json}"),
    }

    report.into_result()?;
    Ok(ExitCode::SUCCESS)
}

async fn invoke_action(config: &SequencerConfig, name: &str, args: &str) -> Result<ExitCode> {
    let args: serde_json::Value =
        serde_json::from_str(args).with_context(|| format!("parsing arguments for {name}"))?;

    let (bus, _sim) = simulated_bus(config);
    let ctx = ActionContext::new(Arc::new(bus)).with_timeouts(config.timeouts.clone());
    ActionRegistry::with_builtin_actions()
        .invoke(&ctx, name, args)
        .await?;

    println!("{name}: ok");
    Ok(ExitCode::SUCCESS)
}

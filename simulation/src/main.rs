//! netsim - enterprise network simulation
//!
//! Runs built-in or file-based topologies through Day-1 bring-up, fault
//! cycles and the Day-2 test catalog, or serves a running simulation over
//! the JSON-lines control channel.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use netsim_logging::{FileConfig, LogConfig, NetsimSubscriberBuilder, WorkerGuard};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::info;

use netsim_simulation::{
    ControlServer, Coordinator, EngineConfig, FaultTarget, TopologyGraph, scenarios, topology,
};

#[derive(Parser)]
#[command(
    name = "netsim",
    about = "Concurrent enterprise network simulation",
    version
)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Also write JSONL logs to this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Engine configuration (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a topology through Day-1, fault cycles and Day-2
    Run {
        /// Built-in scenario: enterprise, campus, isolated
        #[arg(short, long, default_value = "enterprise")]
        scenario: String,

        /// Topology graph (JSON); overrides --scenario
        #[arg(short, long)]
        topology: Option<PathBuf>,

        /// Fault to cycle, as link:<id> or device:<id>. Repeatable.
        #[arg(short, long)]
        fault: Vec<FaultTarget>,

        /// Directory for the JSON report
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
    },

    /// Enterprise network with one inter-router link fault
    Demo {
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
    },

    /// Random faults on the campus network
    Chaos {
        #[arg(long, default_value = "42")]
        seed: u64,

        #[arg(short, long, default_value = "10")]
        rounds: usize,

        #[arg(short, long, default_value = ".")]
        output: PathBuf,
    },

    /// Bring a topology up and serve the control channel
    Serve {
        #[arg(short, long, default_value = "enterprise")]
        scenario: String,

        #[arg(short, long)]
        topology: Option<PathBuf>,

        #[arg(short, long, default_value = "127.0.0.1:7878")]
        addr: String,

        /// Skip Day-1; devices stay uninitialized until driven
        #[arg(long)]
        no_day1: bool,
    },

    /// Print a topology
    Topology {
        #[arg(short, long, default_value = "enterprise")]
        scenario: String,

        #[arg(short, long)]
        topology: Option<PathBuf>,

        /// Print the graph as JSON instead of a summary
        #[arg(long)]
        json: bool,
    },
}

fn init_logging(cli: &Cli) -> anyhow::Result<Option<WorkerGuard>> {
    let mut config = if cli.verbose {
        LogConfig::development()
    } else {
        LogConfig::default()
    };
    if let Some(dir) = &cli.log_dir {
        config.file = Some(FileConfig::new(dir));
    }
    NetsimSubscriberBuilder::new()
        .with_config(config)
        .try_init()
        .context("failed to initialize logging")
}

fn load_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display())),
        None => Ok(EngineConfig::default()),
    }
}

fn load_graph(scenario: &str, path: Option<&Path>) -> anyhow::Result<TopologyGraph> {
    match path {
        Some(path) => TopologyGraph::from_file(path)
            .with_context(|| format!("failed to load topology {}", path.display())),
        None => Ok(scenarios::by_name(scenario)?),
    }
}

/// Write `report` as `<prefix>_<timestamp>.json` under `dir`
fn write_report<T: Serialize>(dir: &Path, prefix: &str, report: &T) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let path = dir.join(format!("{}_{}.json", prefix, Utc::now().format("%Y%m%d_%H%M%S")));
    let json = serde_json::to_string_pretty(report)?;
    std::fs::write(&path, json).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

fn print_scenario(report: &scenarios::ScenarioReport) {
    println!("\n=== {} ({}) ===", report.scenario, report.run_id);
    println!(
        "Day-1: {}/{} operational, {} partial, {} ticks",
        report.day1.operational_count(),
        report.day1.devices.len(),
        report.day1.partially_converged.len(),
        report.day1.completed_at.saturating_sub(report.day1.started_at)
    );
    println!("Day-2 baseline: {}", report.baseline.summary());
    for failure in report.baseline.failures() {
        if let Some(reason) = failure.outcome.failure() {
            println!("  FAIL {}: {}", failure.id, reason);
        }
    }
    for run in &report.faults {
        match run.recovery.recovery_ticks {
            Some(ticks) => println!(
                "Fault {}: during {}, recovered in {} ticks{}",
                run.target,
                run.during.summary(),
                ticks,
                if run.recovery.reconverged { "" } else { " (deadline passed)" }
            ),
            None => println!("Fault {}: no-op", run.target),
        }
    }
    println!(
        "Messages: {} sent, {} delivered, {} dropped; {} events",
        report.bus.sent, report.bus.delivered, report.bus.dropped, report.events
    );
    if !report.shutdown.is_clean() {
        println!("Unclean shutdown, aborted: {:?}", report.shutdown.aborted);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _guard = init_logging(&cli)?;
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            scenario,
            topology,
            fault,
            output,
        } => {
            let graph = load_graph(&scenario, topology.as_deref())?;
            let report = scenarios::run_scenario(&scenario, graph, config, &fault).await?;
            print_scenario(&report);
            let path = write_report(&output, &format!("netsim_{}", scenario), &report)?;
            println!("Report written to {}", path.display());
        }
        Commands::Demo { output } => {
            let report = scenarios::run_demo(config).await?;
            print_scenario(&report);
            let path = write_report(&output, "netsim_demo", &report)?;
            println!("Report written to {}", path.display());
        }
        Commands::Chaos { seed, rounds, output } => {
            let report = scenarios::run_chaos(config, seed, rounds).await?;
            println!("\n=== Chaos (seed {}) ===", report.seed);
            println!("Day-1: {}/{} operational", report.day1.operational_count(), report.day1.devices.len());
            for (i, round) in report.rounds.iter().enumerate() {
                println!(
                    "  round {:>2}: {:<24} recovery {:?} ticks",
                    i,
                    round.target.to_string(),
                    round.recovery.recovery_ticks
                );
            }
            if let Some(mean) = report.mean_recovery_ticks() {
                println!("Mean recovery: {:.1} ticks", mean);
            }
            println!("Final Day-2: {}", report.final_day2.summary());
            let path = write_report(&output, "netsim_chaos", &report)?;
            println!("Report written to {}", path.display());
        }
        Commands::Serve {
            scenario,
            topology,
            addr,
            no_day1,
        } => {
            let graph = load_graph(&scenario, topology.as_deref())?;
            let coordinator = Arc::new(Coordinator::new(config)?.with_name(&scenario));
            coordinator.initialize(graph)?;
            if !no_day1 {
                let day1 = coordinator.start_day1().await?;
                info!(operational = day1.operational_count(), "Day-1 finished");
            }

            let server = ControlServer::bind(&addr, coordinator.clone()).await?;
            println!("Control channel on {}", server.local_addr()?);
            let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
            let serving = tokio::spawn(server.run(shutdown_rx));

            tokio::signal::ctrl_c().await?;
            let _ = shutdown_tx.send(());
            serving.await??;
            let report = coordinator.stop().await?;
            println!("Stopped at tick {}", report.final_tick);
        }
        Commands::Topology {
            scenario,
            topology,
            json,
        } => {
            let graph = load_graph(&scenario, topology.as_deref())?;
            if json {
                println!("{}", graph.to_json_pretty()?);
            } else {
                println!("{}", topology::describe(&graph));
                for warning in &graph.warnings {
                    println!("warning [{}]: {}", warning.subject, warning.message);
                }
            }
        }
    }

    Ok(())
}

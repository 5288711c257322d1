//! SimWatch CLI
//!
//! Runs the sync engine through simulated fault scenarios, or attaches it to
//! a live scenario server with `--live`.

use anyhow::{bail, Context};
use clap::Parser;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde_json::Value;
use simwatch_core::{CloseBehavior, FrameOutcome, StartOutcome, SyncConfig, SyncEngine, SyncError};
use simwatch_env::{HttpTransport, WsConnector};
use simwatch_sim::{ScenarioId, ScenarioResult, ScenarioRunner, SeriesExport, SimBackend, TelemetryGenerator};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// SimWatch telemetry sync CLI
#[derive(Parser, Debug)]
#[command(name = "simwatch-sim")]
#[command(about = "Run the SimWatch sync engine against simulated or live scenarios", long_about = None)]
struct Args {
    /// Master seed for determinism (0 = random from time)
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Number of simulated agents
    #[arg(short, long, default_value = "4")]
    agents: usize,

    /// Scenario to run (nominal, stale_run, unknown_agent, malformed_frames, restart, panic_stop, no_stream, channel_close, unreachable, all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Number of random seeds to test (for CI mode)
    #[arg(long, default_value = "1")]
    seeds: usize,

    /// Batches each agent sends per run
    #[arg(short, long, default_value = "20")]
    batches: usize,

    /// Attach to a live server at this base URL instead of simulating
    #[arg(long)]
    live: Option<String>,

    /// JSON file with start options for --live
    #[arg(long)]
    options: Option<String>,

    /// Stream closure handling for --live (keep, idle)
    #[arg(long, default_value = "keep")]
    close_behavior: String,

    /// Control request timeout in seconds for --live
    #[arg(long, default_value = "10")]
    timeout: u64,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,

    /// Export series snapshots to a JSON file (nominal scenario only)
    #[arg(long)]
    export: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // RUST_LOG wins over --verbose
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set tracing subscriber")?;

    if let Some(base_url) = &args.live {
        return run_live(&args, base_url).await;
    }

    if !args.json {
        info!("SimWatch Scenario Simulator v0.1.0");
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    // Parse scenarios
    let scenarios: Vec<ScenarioId> = if args.scenario == "all" {
        ScenarioId::all()
    } else {
        match args.scenario.parse() {
            Ok(scenario) => vec![scenario],
            Err(e) => {
                eprintln!("Error: {}", e);
                let names: Vec<&str> = ScenarioId::all().iter().map(|s| s.name()).collect();
                eprintln!("Available scenarios: {}, all", names.join(", "));
                std::process::exit(1);
            }
        }
    };

    let base_seed = if args.seed == 0 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1)
    } else {
        args.seed
    };

    if let Some(export_path) = &args.export {
        if let Err(e) = ScenarioId::for_export(&args.scenario) {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
        info!("Running nominal stream with export to: {}", export_path);

        let result = run_with_export(base_seed, args.agents, args.batches, export_path).await;
        if result.passed {
            info!("✓ {} (seed={}) PASSED - exported to {}", result.scenario.name(), base_seed, export_path);
        } else {
            error!(
                "✗ {} FAILED: {}",
                result.scenario.name(),
                result.failure_reason.as_deref().unwrap_or("unknown")
            );
            std::process::exit(1);
        }
        return Ok(());
    }

    let mut all_results: Vec<ScenarioResult> = Vec::new();
    let mut failed_count = 0;

    for seed_offset in 0..args.seeds {
        let seed = base_seed.wrapping_add(seed_offset as u64);
        let runner = ScenarioRunner::new(seed, args.agents).with_batches(args.batches);

        for scenario in &scenarios {
            let result = runner.run(*scenario).await;

            if !args.json {
                if result.passed {
                    info!("✓ {} (seed={}) PASSED", scenario.name(), seed);
                } else {
                    error!(
                        "✗ {} (seed={}) FAILED: {}",
                        scenario.name(),
                        seed,
                        result.failure_reason.as_deref().unwrap_or("unknown")
                    );
                }
            }

            if !result.passed {
                failed_count += 1;
            }
            all_results.push(result);
        }
    }

    let total = all_results.len();
    let passed = total - failed_count;

    if args.json {
        let summary = serde_json::json!({
            "total": total,
            "passed": passed,
            "failed": failed_count,
            "results": all_results.iter().map(|r| {
                serde_json::json!({
                    "scenario": r.scenario.name(),
                    "seed": r.seed,
                    "passed": r.passed,
                    "batches_sent": r.batches_sent,
                    "final_version": r.final_version,
                    "metrics": r.metrics,
                    "failure_reason": r.failure_reason,
                })
            }).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        info!("");
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        if failed_count == 0 {
            info!("✅ All {} scenario runs passed!", total);
        } else {
            error!("❌ {}/{} scenario runs failed!", failed_count, total);
            for result in all_results.iter().filter(|r| !r.passed) {
                error!(
                    "  - {} seed={}: {}",
                    result.scenario.name(),
                    result.seed,
                    result.failure_reason.as_deref().unwrap_or("unknown")
                );
            }
        }
    }

    // Exit with proper code for CI
    if failed_count > 0 {
        std::process::exit(1);
    }
    Ok(())
}

/// Streams a nominal run round by round, snapshotting the store after each.
async fn run_with_export(seed: u64, agents: usize, batches: usize, export_path: &str) -> ScenarioResult {
    let scenario = ScenarioId::Nominal;
    let runner = ScenarioRunner::new(seed, agents).with_batches(batches);
    let backend = SimBackend::shared(seed % 1000 + 1);
    let mut engine = ScenarioRunner::engine(&backend, CloseBehavior::KeepRun);
    let mut gen = TelemetryGenerator::new(seed);
    let mut export = SeriesExport::new(scenario.name(), seed);

    let mut result = ScenarioResult {
        scenario,
        seed,
        passed: false,
        batches_sent: 0,
        final_version: 0,
        series_count: 0,
        failure_reason: None,
        metrics: Default::default(),
    };

    let descriptor = match runner.start_streaming(&mut engine, scenario).await {
        Ok(descriptor) => descriptor,
        Err(reason) => {
            result.failure_reason = Some(reason);
            return result;
        }
    };
    export.set_run(&descriptor.id);
    export.add_frame(engine.store());

    for round in 0..batches {
        for batch in gen.round(&descriptor) {
            backend.emit_batch(&batch);
            result.batches_sent += 1;
            if let Some(Err(e)) = engine.pump().await {
                warn!("round {}: {}", round, e);
            }
        }
        export.add_frame(engine.store());
        debug!("  round {} | version={}", round, engine.store().version());
    }

    let applied = engine.metrics().batches_applied;
    result.passed = applied == result.batches_sent;
    if !result.passed {
        result.failure_reason = Some(format!("applied {} of {} batches", applied, result.batches_sent));
    }
    result.final_version = engine.store().version();
    result.series_count = engine.store().len();
    result.metrics = engine.metrics().clone();

    export.finalize(engine.store(), engine.metrics(), result.passed);
    if let Err(e) = export.write_to_file(export_path) {
        error!("Failed to write export: {:?}", e);
    } else {
        info!("Exported {} frames to {}", export.frames.len(), export_path);
    }

    result
}

enum LiveEvent {
    Frame(Option<Result<FrameOutcome, SyncError>>),
    Interrupted,
}

/// Attaches to a live server: start, stream until closure or Ctrl-C, stop.
async fn run_live(args: &Args, base_url: &str) -> anyhow::Result<()> {
    let options = load_options(args.options.as_deref())?;
    let close_behavior: CloseBehavior = args.close_behavior.parse().map_err(anyhow::Error::msg)?;
    let config = SyncConfig::default()
        .with_base_url(base_url)
        .with_timeout(Duration::from_secs(args.timeout))
        .with_close_behavior(close_behavior);

    let transport = Arc::new(HttpTransport::with_timeout(&config.base_url, config.request_timeout)?);
    let mut engine = SyncEngine::new(config, transport, Arc::new(WsConnector::new()));
    let mut export = args.export.as_ref().map(|_| SeriesExport::new("live", args.seed));

    info!("Attaching to {}", base_url);
    match engine.start(&options).await? {
        StartOutcome::Streaming { run, url } => {
            info!("Run {:?} streaming from {}", run.as_ref().map(|r| r.as_key()), url);
        }
        StartOutcome::StartedWithoutStream { run } => {
            warn!("Run {:?} started without a stream, filling sample data", run.as_ref().map(|r| r.as_key()));
            let mut rng = ChaCha8Rng::seed_from_u64(args.seed);
            engine.add_sample_agent_data(&mut rng);
        }
        StartOutcome::Rejected { status, body } => {
            bail!("start rejected with status {}: {}", status, body);
        }
    }
    if let (Some(export), Some(active)) = (export.as_mut(), engine.active()) {
        export.set_run(&active.id);
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;

    while engine.is_streaming() {
        let event = tokio::select! {
            next = engine.pump() => LiveEvent::Frame(next),
            _ = &mut ctrl_c => LiveEvent::Interrupted,
        };
        match event {
            LiveEvent::Frame(Some(Ok(FrameOutcome::Applied { version }))) => {
                debug!("store at version {}", version);
                if let Some(export) = export.as_mut() {
                    export.add_frame(engine.store());
                }
            }
            LiveEvent::Frame(Some(_)) => {}
            LiveEvent::Frame(None) => break,
            LiveEvent::Interrupted => {
                info!("Interrupted, stopping run");
                interrupted = true;
                break;
            }
        }
    }

    // Export before stop, which clears the store
    if let (Some(mut export), Some(path)) = (export, args.export.as_deref()) {
        export.finalize(engine.store(), engine.metrics(), true);
        export
            .write_to_file(path)
            .with_context(|| format!("writing export to {}", path))?;
        info!("Exported {} frames to {}", export.frames.len(), path);
    }

    if interrupted && engine.active().is_some() {
        let response = engine.stop().await?;
        if !response.ok {
            warn!("Stop answered {}: {}", response.status, response.body);
        }
    }

    let metrics = engine.metrics();
    if args.json {
        println!("{}", serde_json::to_string_pretty(metrics)?);
    } else {
        info!(
            "frames={} applied={} dropped={} unrecognized={}",
            metrics.frames_received,
            metrics.batches_applied,
            metrics.dropped(),
            metrics.unrecognized
        );
    }
    Ok(())
}

fn load_options(path: Option<&str>) -> anyhow::Result<Value> {
    let Some(path) = path else {
        return Ok(Value::Object(Default::default()));
    };
    let text = std::fs::read_to_string(path).with_context(|| format!("reading options from {}", path))?;
    serde_json::from_str(&text).with_context(|| format!("parsing options in {}", path))
}
